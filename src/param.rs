//! Geometry-independent constants and primitive type aliases.
//!
//! Everything that depends on the block size (entries per NAT block, address
//! slots per node page, journal capacity) lives in [`crate::superblock`] and
//! is fixed at mount time instead.

/// Node identifier. One per inode, direct-node, indirect-node or
/// double-indirect-node block. NID 0 is reserved and never allocated.
pub type Nid = u32;

/// Physical block number on the device.
pub type BlockAddr = u32;

/// Inode number. Equals the NID of the inode's node block.
pub type Ino = u32;

/// Block address of a node that has no on-device block.
pub const NULL_ADDR: BlockAddr = 0;

/// Block address of a node reserved in memory but not yet written.
pub const NEW_ADDR: BlockAddr = u32::MAX;

/// NIDs below this are reserved for superblock-referenced nodes
/// (the null, node-space and meta-space inodes).
pub const RESERVED_NODE_COUNT: u32 = 3;

/// Size of one on-device NAT record: `{version: u8, ino: u32, addr: u32}`.
pub const NAT_ENTRY_SIZE: usize = 9;

/// Size of one NAT journal record: `{nid: u32}` + a raw NAT record.
pub const NAT_JOURNAL_ENTRY_SIZE: usize = 4 + NAT_ENTRY_SIZE;

/// Bytes reserved at the head of a summary block for the journal header.
pub const SUM_JOURNAL_HEADER: usize = 16;

/// Size of the footer kept at the tail of every node page.
pub const NODE_FOOTER_SIZE: usize = 24;

/// Bytes of the raw inode header preceding the address and nid slots.
pub const INODE_HEADER_SIZE: usize = 24;

/// Direct(2), indirect(2) and double-indirect(1) slots in an inode block.
pub const NIDS_PER_INODE: usize = 5;

/// Address slots reserved at the tail of the inode's slot area for
/// inline extended attributes when `INLINE_XATTR` is set.
pub const INLINE_XATTR_ADDRS: usize = 8;

/// Batch size of a tagged page lookup.
pub const PAGEVEC_SIZE: usize = 14;

/// Batch size of a NAT cache gang lookup.
pub const NATVEC_SIZE: usize = 64;

/// Batch size of a dirty-set gang lookup.
pub const SETVEC_SIZE: usize = 32;

/// NAT blocks scanned per incremental free-NID build.
pub const FREE_NID_PAGES: u32 = 4;

/// Sibling node pages read ahead by `get_node_page_ra`.
pub const MAX_RA_NODE: usize = 16;

/// Default in-memory budget shared by the NAT cache and the free-NID pool.
pub const DEF_RAM_BUDGET: usize = 32 << 20;

/// Node footer flag bits; the node offset occupies the remaining high bits.
pub const COLD_BIT_SHIFT: u32 = 0;
pub const FSYNC_BIT_SHIFT: u32 = 1;
pub const DENT_BIT_SHIFT: u32 = 2;
pub const OFFSET_BIT_SHIFT: u32 = 3;

/// Node offset marking an xattr node (all ones in the footer offset field).
pub const XATTR_NODE_OFFSET: u32 = (1 << (32 - OFFSET_BIT_SHIFT)) - 1;
