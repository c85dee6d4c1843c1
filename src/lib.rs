//! Node manager of a log-structured, flash-friendly filesystem.
//!
//! Translates logical node identifiers (NIDs) into physical block
//! addresses, allocates and frees NIDs, and participates in the checkpoint
//! protocol that keeps the translation table crash consistent. The hot
//! structures are sharded per *file cell* (a residue class of NIDs) so that
//! many cores can work on independent locks, and the two checkpoint fences
//! can use a reader-preferring semaphore whose reader fast path is one
//! per-thread counter increment.
//!
//! Layering, leaves first: [`rps`] (synchronization primitive), [`page`] /
//! [`disk`] (page store over a block device), [`superblock`] / [`summary`] /
//! [`segment`] (on-device geometry, NAT journal, block allocator),
//! [`nat`] / [`nid`] (translation cache and free-NID pool), [`node`]
//! (node-page I/O and truncation), [`flush`] (checkpoint flush), and
//! [`fs`] (per-mount glue).

pub mod disk;
pub mod error;
pub mod flush;
pub mod fs;
pub mod nat;
pub mod nid;
pub mod node;
pub mod page;
pub mod param;
pub mod rps;
pub mod segment;
pub mod summary;
pub mod superblock;
pub mod util;

pub use crate::disk::{BlockDevice, MemDisk};
pub use crate::error::{Error, Result};
pub use crate::fs::{build_node_manager, Config, FsInfo};
pub use crate::nat::{NatFlags, NodeInfo};
pub use crate::node::{Dnode, Inode, LookupMode};
pub use crate::page::WritebackControl;
pub use crate::param::{BlockAddr, Ino, Nid, NEW_ADDR, NULL_ADDR};
pub use crate::rps::Rps;
pub use crate::superblock::{format, Geometry, Superblock};
pub use crate::util::StripedCounter;
