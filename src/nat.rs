//! NID address translation cache.
//!
//! The persistent NAT maps every NID to the device address of its node
//! block. This cache keeps the hot part of that mapping in memory, sharded
//! by `nid mod s_nat` so that each file cell owns an independent tree, LRU
//! and rw-semaphore. Dirty entries are indexed a second time by NAT-block
//! offset (the "set"), which is the unit the checkpoint flush works in.
//!
//! Entry lifecycle: created lazily on a lookup miss or by `set_node_addr`;
//! clean entries sit on the shard LRU and can be reclaimed under memory
//! pressure; dirty entries move into their set and only return to the LRU
//! when a checkpoint flushes them. At most one entry per NID exists across
//! all shards.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use arrayvec::ArrayVec;
use bitflags::bitflags;

use crate::error::Result;
use crate::fs::FsInfo;
use crate::nid::FreeNidShard;
use crate::param::{
    BlockAddr, Ino, Nid, NATVEC_SIZE, NAT_ENTRY_SIZE, NEW_ADDR, NULL_ADDR, SETVEC_SIZE,
};
use crate::summary::RawNatEntry;
use crate::util::unpoison;

bitflags! {
    pub struct NatFlags: u8 {
        /// The on-device record agrees with this entry.
        const IS_CHECKPOINTED   = 0b0001;
        /// The owning inode was written by the last fsync.
        const HAS_FSYNCED_INODE = 0b0010;
        /// The last write of this node carried an fsync mark.
        const HAS_LAST_FSYNC    = 0b0100;
        /// Entry is a member of its NAT-block set, not of the LRU.
        const IS_DIRTY          = 0b1000;
    }
}

/// Volatile translation record for one node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub nid: Nid,
    pub ino: Ino,
    pub blk_addr: BlockAddr,
    pub version: u8,
}

impl NodeInfo {
    pub fn new(nid: Nid, ino: Ino, blk_addr: BlockAddr, version: u8) -> Self {
        Self {
            nid,
            ino,
            blk_addr,
            version,
        }
    }

    pub fn from_raw(nid: Nid, raw: &RawNatEntry) -> Self {
        Self {
            nid,
            ino: raw.ino.get(),
            blk_addr: raw.block_addr.get(),
            version: raw.version,
        }
    }

    pub fn to_raw(&self) -> RawNatEntry {
        RawNatEntry::new(self.version, self.ino, self.blk_addr)
    }
}

pub(crate) fn inc_node_version(version: u8) -> u8 {
    version.wrapping_add(1)
}

#[derive(Clone)]
pub(crate) struct NatEntry {
    pub ni: NodeInfo,
    pub flags: NatFlags,
}

impl NatEntry {
    /// Flag state of an entry whose address agrees with the device.
    fn reset_flags(&mut self) {
        self.flags = NatFlags::IS_CHECKPOINTED | NatFlags::HAS_LAST_FSYNC;
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(NatFlags::IS_DIRTY)
    }
}

/// All dirty entries of one NAT block, in dirtying order.
pub(crate) struct NatEntrySet {
    pub set_id: u32,
    pub entry_list: Vec<Nid>,
}

impl NatEntrySet {
    pub fn entry_cnt(&self) -> usize {
        self.entry_list.len()
    }
}

pub(crate) struct NatShardInner {
    /// Ordered by NID so gang lookups can walk a range.
    entries: BTreeMap<Nid, NatEntry>,
    /// Clean entries, oldest first.
    lru: VecDeque<Nid>,
    /// Dirty sets keyed by NAT-block offset.
    sets: BTreeMap<u32, NatEntrySet>,
    pub nat_cnt: usize,
    pub dirty_nat_cnt: usize,
}

impl NatShardInner {
    pub fn lookup(&self, nid: Nid) -> Option<&NatEntry> {
        self.entries.get(&nid)
    }

    pub fn lookup_mut(&mut self, nid: Nid) -> Option<&mut NatEntry> {
        self.entries.get_mut(&nid)
    }

    /// Inserts a fresh clean entry for `nid` at the LRU tail.
    pub fn grab(&mut self, nid: Nid) -> &mut NatEntry {
        debug_assert!(!self.entries.contains_key(&nid));
        let mut e = NatEntry {
            ni: NodeInfo::new(nid, 0, NULL_ADDR, 0),
            flags: NatFlags::empty(),
        };
        e.reset_flags();
        self.entries.insert(nid, e);
        self.lru.push_back(nid);
        self.nat_cnt += 1;
        self.entries.get_mut(&nid).unwrap()
    }

    /// Removes a clean entry.
    pub fn del_clean(&mut self, nid: Nid) {
        let e = self.entries.remove(&nid);
        debug_assert!(e.map_or(false, |e| !e.is_dirty()));
        if let Some(pos) = self.lru.iter().position(|&n| n == nid) {
            self.lru.remove(pos);
        }
        self.nat_cnt -= 1;
    }

    /// Moves `nid` from the LRU into its dirty set, creating the set on
    /// demand. A no-op when the entry is already dirty.
    pub fn set_dirty(&mut self, nid: Nid, set_id: u32) {
        let e = self.entries.get_mut(&nid).unwrap();
        if e.is_dirty() {
            return;
        }
        e.flags.insert(NatFlags::IS_DIRTY);
        if let Some(pos) = self.lru.iter().position(|&n| n == nid) {
            self.lru.remove(pos);
        }
        let set = self.sets.entry(set_id).or_insert_with(|| NatEntrySet {
            set_id,
            entry_list: Vec::new(),
        });
        set.entry_list.push(nid);
        self.dirty_nat_cnt += 1;
    }

    /// Moves `nid` back from its set onto the LRU tail and resets flags to
    /// the just-checkpointed state.
    pub fn clear_dirty(&mut self, nid: Nid, set_id: u32) {
        let e = self.entries.get_mut(&nid).unwrap();
        if !e.is_dirty() {
            return;
        }
        e.reset_flags();
        if let Some(set) = self.sets.get_mut(&set_id) {
            if let Some(pos) = set.entry_list.iter().position(|&n| n == nid) {
                set.entry_list.remove(pos);
            }
            self.dirty_nat_cnt -= 1;
        }
        self.lru.push_back(nid);
    }

    /// Oldest clean NID, if any.
    pub fn lru_front(&self) -> Option<Nid> {
        self.lru.front().copied()
    }

    /// Gang lookup: one batch of cached NIDs at or above `start`.
    pub fn gang_lookup_entries(&self, start: Nid) -> ArrayVec<Nid, NATVEC_SIZE> {
        let mut out = ArrayVec::new();
        for (&nid, _) in self.entries.range(start..) {
            if out.is_full() {
                break;
            }
            out.push(nid);
        }
        out
    }

    /// Gang lookup: one batch of dirty-set ids at or above `start`.
    pub fn gang_lookup_sets(&self, start: u32) -> ArrayVec<u32, SETVEC_SIZE> {
        let mut out = ArrayVec::new();
        for (&set_id, _) in self.sets.range(start..) {
            if out.is_full() {
                break;
            }
            out.push(set_id);
        }
        out
    }

    pub fn set(&self, set_id: u32) -> Option<&NatEntrySet> {
        self.sets.get(&set_id)
    }

    pub fn remove_set(&mut self, set_id: u32) -> Option<NatEntrySet> {
        self.sets.remove(&set_id)
    }

    /// Removes an entry regardless of state; unmount teardown only.
    pub fn del_entry(&mut self, nid: Nid, set_id: u32) {
        let e = match self.entries.remove(&nid) {
            Some(e) => e,
            None => return,
        };
        if e.is_dirty() {
            if let Some(set) = self.sets.get_mut(&set_id) {
                if let Some(pos) = set.entry_list.iter().position(|&n| n == nid) {
                    set.entry_list.remove(pos);
                }
            }
            self.dirty_nat_cnt -= 1;
        } else if let Some(pos) = self.lru.iter().position(|&n| n == nid) {
            self.lru.remove(pos);
        }
        self.nat_cnt -= 1;
    }
}

pub(crate) struct NatShard {
    pub lock: RwLock<NatShardInner>,
}

impl NatShard {
    fn new() -> Self {
        Self {
            lock: RwLock::new(NatShardInner {
                entries: BTreeMap::new(),
                lru: VecDeque::new(),
                sets: BTreeMap::new(),
                nat_cnt: 0,
                dirty_nat_cnt: 0,
            }),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, NatShardInner> {
        unpoison(self.lock.read())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, NatShardInner> {
        unpoison(self.lock.write())
    }
}

/// Which component asks for memory headroom.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum MemKind {
    FreeNids,
    NatEntries,
}

/// Per-mount node-manager state.
pub struct NodeManager {
    pub(crate) max_nid: Nid,
    pub(crate) available_nids: u32,
    pub(crate) s_nat: usize,
    pub(crate) s_free: usize,
    pub(crate) shards: Vec<NatShard>,
    pub(crate) free_shards: Vec<FreeNidShard>,
    pub(crate) next_scan_nid: AtomicU32,
    pub(crate) nat_bitmap: spin::Mutex<Vec<u8>>,
    /// Serializes free-NID builds; consumers retry after it is released.
    pub(crate) build_lock: Mutex<()>,
    pub(crate) building: AtomicBool,
    /// Round-robin shard selector for `alloc_nid`.
    pub(crate) next_allocator: AtomicUsize,
    pub(crate) ram_budget: usize,
}

impl NodeManager {
    pub(crate) fn new(
        max_nid: Nid,
        available_nids: u32,
        s_nat: usize,
        s_free: usize,
        next_scan_nid: Nid,
        nat_bitmap: Vec<u8>,
        ram_budget: usize,
    ) -> Self {
        Self {
            max_nid,
            available_nids,
            s_nat,
            s_free,
            shards: (0..s_nat).map(|_| NatShard::new()).collect(),
            free_shards: (0..s_free).map(|_| FreeNidShard::new()).collect(),
            next_scan_nid: AtomicU32::new(next_scan_nid),
            nat_bitmap: spin::Mutex::new(nat_bitmap),
            build_lock: Mutex::new(()),
            building: AtomicBool::new(false),
            next_allocator: AtomicUsize::new(next_scan_nid.wrapping_sub(1) as usize % s_free),
            ram_budget,
        }
    }

    pub(crate) fn nat_shard_of(&self, nid: Nid) -> usize {
        nid as usize % self.s_nat
    }

    pub(crate) fn free_shard_of(&self, nid: Nid) -> usize {
        nid as usize % self.s_free
    }

    /// Total cached entries, summed across shards.
    pub fn nat_entry_count(&self) -> usize {
        self.shards.iter().map(|s| s.read().nat_cnt).sum()
    }

    /// Total dirty entries, summed across shards.
    pub fn dirty_nat_count(&self) -> usize {
        self.shards.iter().map(|s| s.read().dirty_nat_cnt).sum()
    }

    pub(crate) fn on_build(&self) -> bool {
        self.building.load(core::sync::atomic::Ordering::Acquire)
    }
}

impl FsInfo {
    /// Translates `nid`, filling the cache from the journal or the current
    /// NAT block on a miss. The shard lock is never held across the I/O;
    /// the result is installed under a second acquisition and the first
    /// writer wins.
    pub fn get_node_info(&self, nid: Nid) -> Result<NodeInfo> {
        let nm = self.nm();
        let s = nm.nat_shard_of(nid);
        {
            let inner = nm.shards[s].read();
            if let Some(e) = inner.lookup(nid) {
                return Ok(e.ni);
            }
        }

        // Check the current segment's journal.
        let mut raw = None;
        {
            let mut sum = unpoison(self.curseg().sum.lock());
            if let Some(i) = sum.lookup_journal(nid, false) {
                raw = Some(sum.nat_in_journal(i));
            }
        }

        // Fill from the current NAT block.
        let raw = match raw {
            Some(raw) => raw,
            None => {
                let page = self.get_current_nat_page(nid)?;
                let off = (nid - self.sb().start_nid(nid)) as usize * NAT_ENTRY_SIZE;
                let mut bytes = [0u8; NAT_ENTRY_SIZE];
                bytes.copy_from_slice(&page.data()[off..off + NAT_ENTRY_SIZE]);
                RawNatEntry::new(
                    bytes[0],
                    u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
                    u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]),
                )
            }
        };

        self.cache_nat_entry(nid, &raw);
        Ok(NodeInfo::from_raw(nid, &raw))
    }

    /// Installs a cache entry read from a raw record; keeps any entry that
    /// raced us in, since the cache is never staler than the device.
    pub(crate) fn cache_nat_entry(&self, nid: Nid, raw: &RawNatEntry) {
        let nm = self.nm();
        let s = nm.nat_shard_of(nid);
        let mut inner = nm.shards[s].write();
        if inner.lookup(nid).is_none() {
            let e = inner.grab(nid);
            e.ni = NodeInfo::from_raw(nid, raw);
        }
    }

    /// Records the new address of `ni.nid`, dirtying its cache entry.
    ///
    /// `ni` must carry the node's prior state (from `get_node_info`); the
    /// address-transition matrix is asserted against it. Deleting a node
    /// (a real address going to `NULL_ADDR`) bumps the version so stale
    /// blocks can be detected after a crash.
    pub fn set_node_addr(&self, ni: &NodeInfo, new_blkaddr: BlockAddr, fsync_done: bool) {
        let nm = self.nm();
        let s = nm.nat_shard_of(ni.nid);
        let set_id = self.sb().nat_block_offset(ni.nid);
        let ino_shard = nm.nat_shard_of(ni.ino);
        {
            let mut inner = nm.shards[s].write();
            if inner.lookup(ni.nid).is_none() {
                assert!(ni.blk_addr != NEW_ADDR);
                let e = inner.grab(ni.nid);
                e.ni = *ni;
            } else if new_blkaddr == NEW_ADDR {
                // A reallocated nid can leave its previous entry in the
                // cache; reinitialize it with the new identity.
                assert!(ni.blk_addr == NULL_ADDR);
                inner.lookup_mut(ni.nid).unwrap().ni = *ni;
            }
            let e = inner.lookup_mut(ni.nid).unwrap();

            assert!(e.ni.blk_addr == ni.blk_addr);
            assert!(!(e.ni.blk_addr == NULL_ADDR && new_blkaddr == NULL_ADDR));
            assert!(!(e.ni.blk_addr == NEW_ADDR && new_blkaddr == NEW_ADDR));
            assert!(
                !(e.ni.blk_addr != NEW_ADDR
                    && e.ni.blk_addr != NULL_ADDR
                    && new_blkaddr == NEW_ADDR)
            );

            if e.ni.blk_addr != NEW_ADDR && new_blkaddr == NULL_ADDR {
                e.ni.version = inc_node_version(e.ni.version);
            }

            e.ni.blk_addr = new_blkaddr;
            if new_blkaddr == NEW_ADDR || new_blkaddr == NULL_ADDR {
                e.flags.remove(NatFlags::IS_CHECKPOINTED);
            }
            e.flags.set(NatFlags::HAS_LAST_FSYNC, fsync_done);
            inner.set_dirty(ni.nid, set_id);

            // Update the fsync mark on the owning inode's entry while its
            // shard lock is held; same-shard inodes are handled right here.
            if ni.nid != ni.ino && ino_shard == s {
                if let Some(ie) = inner.lookup_mut(ni.ino) {
                    ie.flags.set(NatFlags::HAS_LAST_FSYNC, fsync_done);
                    if fsync_done {
                        ie.flags.insert(NatFlags::HAS_FSYNCED_INODE);
                    }
                }
            } else if ni.nid == ni.ino && fsync_done {
                let e = inner.lookup_mut(ni.nid).unwrap();
                e.flags.insert(NatFlags::HAS_FSYNCED_INODE);
            }
        }

        if ni.nid != ni.ino && ino_shard != s {
            // The inode entry lives in another file cell; take that cell's
            // lock for the mark instead of reaching across unlocked.
            log::debug!(
                "cross-cell fsync mark: nid {} (cell {}) -> ino {} (cell {})",
                ni.nid,
                s,
                ni.ino,
                ino_shard
            );
            let mut inner = nm.shards[ino_shard].write();
            if let Some(ie) = inner.lookup_mut(ni.ino) {
                ie.flags.set(NatFlags::HAS_LAST_FSYNC, fsync_done);
                if fsync_done {
                    ie.flags.insert(NatFlags::HAS_FSYNCED_INODE);
                }
            }
        }
    }

    /// True when an fsync of `nid`'s inode must also persist its dentry
    /// work: the inode is not checkpointed and no fsync has written it.
    pub fn need_dentry_mark(&self, nid: Nid) -> bool {
        let nm = self.nm();
        let inner = nm.shards[nm.nat_shard_of(nid)].read();
        match inner.lookup(nid) {
            Some(e) => {
                !e.flags.contains(NatFlags::IS_CHECKPOINTED)
                    && !e.flags.contains(NatFlags::HAS_FSYNCED_INODE)
            }
            None => false,
        }
    }

    pub fn is_checkpointed_node(&self, nid: Nid) -> bool {
        let nm = self.nm();
        let inner = nm.shards[nm.nat_shard_of(nid)].read();
        match inner.lookup(nid) {
            Some(e) => e.flags.contains(NatFlags::IS_CHECKPOINTED),
            None => true,
        }
    }

    /// Flag word of `nid`'s cache entry, if cached. Mostly for inspection
    /// by tests and diagnostics.
    pub fn nat_entry_flags(&self, nid: Nid) -> Option<NatFlags> {
        let nm = self.nm();
        let inner = nm.shards[nm.nat_shard_of(nid)].read();
        inner.lookup(nid).map(|e| e.flags)
    }

    pub fn need_inode_block_update(&self, ino: Ino) -> bool {
        let nm = self.nm();
        let inner = nm.shards[nm.nat_shard_of(ino)].read();
        match inner.lookup(ino) {
            Some(e) => {
                !(e.flags.contains(NatFlags::HAS_LAST_FSYNC)
                    && (e.flags.contains(NatFlags::IS_CHECKPOINTED)
                        || e.flags.contains(NatFlags::HAS_FSYNCED_INODE)))
            }
            None => true,
        }
    }

    /// Reclaims up to `nr_shrink` clean entries, oldest first, spreading the
    /// quota across shards. Dirty entries are never touched. Returns how
    /// much of the quota was left unused.
    pub fn try_to_free_nats(&self, mut nr_shrink: usize) -> usize {
        if self.available_free_memory(MemKind::NatEntries) {
            return 0;
        }
        let nm = self.nm();
        let mut divider = nm.s_nat;
        for shard in nm.shards.iter() {
            let mut quota = nr_shrink / divider;
            divider = divider.saturating_sub(1);
            let mut inner = shard.write();
            while quota > 0 {
                let nid = match inner.lru_front() {
                    Some(nid) => nid,
                    None => break,
                };
                inner.del_clean(nid);
                nr_shrink -= 1;
                quota -= 1;
            }
        }
        nr_shrink
    }

    /// Checks a component's cache footprint against its share of the
    /// configured memory budget.
    pub(crate) fn available_free_memory(&self, kind: MemKind) -> bool {
        let nm = self.nm();
        let budget = nm.ram_budget;
        match kind {
            MemKind::FreeNids => {
                let fcnt: usize = nm.free_shards.iter().map(|s| s.fcnt()).sum();
                fcnt * core::mem::size_of::<crate::nid::FreeNid>() < budget / 4
            }
            MemKind::NatEntries => {
                let cnt: usize = nm.shards.iter().map(|s| s.read().nat_cnt).sum();
                cnt * core::mem::size_of::<NatEntry>() < budget / 4
            }
        }
    }
}
