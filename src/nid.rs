//! Free-NID pool.
//!
//! The pool holds NIDs whose NAT records are null on device, ready to hand
//! to inode or node allocation. It is refilled by scanning NAT blocks from
//! `next_scan_nid` and by watching the journal; a single build lock
//! serializes refills while consumers retry. Like the NAT cache it is
//! sharded by `nid mod s_free`, each shard a spin-locked list plus index,
//! and `alloc_nid` spreads load by picking shards round robin.

use std::collections::{HashMap, VecDeque};

use crate::error::Result;
use crate::fs::FsInfo;
use crate::nat::{MemKind, NatFlags};
use crate::page::LockedPage;
use crate::param::{Nid, FREE_NID_PAGES, NAT_ENTRY_SIZE, NEW_ADDR, NULL_ADDR, RESERVED_NODE_COUNT};
use crate::util::unpoison;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NidState {
    /// Free and ready to be picked.
    New,
    /// Handed to a caller; waiting for `alloc_nid_done` or `_failed`.
    Alloc,
}

#[derive(Clone, Copy, Debug)]
pub struct FreeNid {
    pub nid: Nid,
    pub state: NidState,
}

/// Outcome of offering one NID to the pool.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum AddNid {
    Added,
    Skipped,
    /// The pool hit its memory budget; the caller must stop building.
    OutOfMemory,
}

pub(crate) struct FreeNidShardInner {
    map: HashMap<Nid, FreeNid>,
    /// Insertion order; holds both `New` and `Alloc` entries.
    list: VecDeque<Nid>,
    /// Number of `New` entries.
    fcnt: usize,
}

pub(crate) struct FreeNidShard {
    pub inner: spin::Mutex<FreeNidShardInner>,
}

impl FreeNidShard {
    pub fn new() -> Self {
        Self {
            inner: spin::Mutex::new(FreeNidShardInner {
                map: HashMap::new(),
                list: VecDeque::new(),
                fcnt: 0,
            }),
        }
    }

    pub fn fcnt(&self) -> usize {
        self.inner.lock().fcnt
    }
}

impl FsInfo {
    /// Offers `nid` to the pool. With `build`, a NID whose cache entry says
    /// it is (or is about to be) allocated is refused.
    pub(crate) fn add_free_nid(&self, nid: Nid, build: bool) -> AddNid {
        let nm = self.nm();
        if !self.available_free_memory(MemKind::FreeNids) {
            return AddNid::OutOfMemory;
        }
        if nid < RESERVED_NODE_COUNT {
            return AddNid::Skipped;
        }
        if build {
            let shard = &nm.shards[nm.nat_shard_of(nid)];
            let allocated = {
                let inner = shard.read();
                match inner.lookup(nid) {
                    Some(e) => {
                        !e.flags.contains(NatFlags::IS_CHECKPOINTED)
                            || e.ni.blk_addr != NULL_ADDR
                    }
                    None => false,
                }
            };
            if allocated {
                return AddNid::Skipped;
            }
        }
        let mut inner = nm.free_shards[nm.free_shard_of(nid)].inner.lock();
        if inner.map.contains_key(&nid) {
            return AddNid::Skipped;
        }
        inner.map.insert(
            nid,
            FreeNid {
                nid,
                state: NidState::New,
            },
        );
        inner.list.push_back(nid);
        inner.fcnt += 1;
        AddNid::Added
    }

    /// Drops a `New` entry for a NID learned to be allocated elsewhere.
    pub(crate) fn remove_free_nid(&self, nid: Nid) {
        let nm = self.nm();
        let mut inner = nm.free_shards[nm.free_shard_of(nid)].inner.lock();
        let is_new = inner
            .map
            .get(&nid)
            .map_or(false, |f| f.state == NidState::New);
        if is_new {
            inner.map.remove(&nid);
            if let Some(pos) = inner.list.iter().position(|&n| n == nid) {
                inner.list.remove(pos);
            }
            inner.fcnt -= 1;
        }
    }

    /// Harvests free NIDs from one NAT block. Returns false when the memory
    /// budget stopped the scan.
    pub(crate) fn scan_nat_page(&self, page: &LockedPage, start_nid: Nid) -> bool {
        let nm = self.nm();
        let npb = self.sb().nats_per_block();
        let mut nid = start_nid;
        let mut i = (start_nid % npb) as usize;
        while (i as u32) < npb {
            if nid >= nm.max_nid {
                break;
            }
            let off = i * NAT_ENTRY_SIZE + 5;
            let data = page.data();
            let blk_addr =
                u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]]);
            assert!(blk_addr != NEW_ADDR);
            if blk_addr == NULL_ADDR && self.add_free_nid(nid, true) == AddNid::OutOfMemory {
                return false;
            }
            i += 1;
            nid += 1;
        }
        true
    }

    /// Where a scan continues after running off the end of the NID space:
    /// with file cells the reserved region's NAT block is skipped.
    fn scan_wrap_nid(&self) -> Nid {
        if self.config().file_cell {
            self.sb().nats_per_block()
        } else {
            0
        }
    }

    /// Incremental refill: scans the next few NAT blocks at `next_scan_nid`,
    /// then folds in the journal. Caller holds the build lock.
    pub(crate) fn build_free_nids(&self) -> Result<()> {
        use core::sync::atomic::Ordering;

        let nm = self.nm();
        let npb = self.sb().nats_per_block();
        let fcnt: usize = nm.free_shards.iter().map(|s| s.fcnt()).sum();
        if fcnt > npb as usize {
            return Ok(());
        }

        let mut nid = nm.next_scan_nid.load(Ordering::SeqCst);
        self.ra_meta_pages_nat(nid, FREE_NID_PAGES)?;
        for _ in 0..FREE_NID_PAGES {
            let page = self.get_current_nat_page(nid)?;
            let keep_going = self.scan_nat_page(&page, nid);
            drop(page);
            if !keep_going {
                break;
            }
            nid += npb - (nid % npb);
            if nid >= nm.max_nid {
                nid = self.scan_wrap_nid();
            }
        }
        nm.next_scan_nid.store(nid, Ordering::SeqCst);

        self.scan_journal_for_free_nids();
        Ok(())
    }

    /// Mount-time full build: reads ahead every NAT block, scans them all,
    /// then folds in the journal.
    pub(crate) fn build_all_free_nids(&self) -> Result<()> {
        use core::sync::atomic::Ordering;

        let nm = self.nm();
        let npb = self.sb().nats_per_block();
        let start_block = self.sb().nat_block_offset(nm.next_scan_nid.load(Ordering::SeqCst));
        let blocks = self.sb().nat_blocks() - start_block;
        self.ra_meta_pages_nat(nm.next_scan_nid.load(Ordering::SeqCst), blocks)?;

        let mut nid = nm.next_scan_nid.load(Ordering::SeqCst);
        for _ in 0..blocks {
            let page = self.get_current_nat_page(nid)?;
            let keep_going = self.scan_nat_page(&page, nid);
            drop(page);
            if !keep_going {
                break;
            }
            nid += npb - (nid % npb);
            if nid >= nm.max_nid {
                nid = self.scan_wrap_nid();
            }
        }

        self.scan_journal_for_free_nids();
        Ok(())
    }

    /// Journal pass shared by both builds: a null journal record frees its
    /// NID, a live one retracts it from the pool.
    fn scan_journal_for_free_nids(&self) {
        let mut sum = unpoison(self.curseg().sum.lock());
        for i in 0..sum.nats_in_cursum() {
            let addr = sum.nat_in_journal(i).block_addr.get();
            let nid = sum.nid_in_journal(i);
            if addr == NULL_ADDR {
                let _ = self.add_free_nid(nid, true);
            } else {
                self.remove_free_nid(nid);
            }
        }
    }

    /// Picks a free NID, or None when the NID budget is exhausted. The
    /// caller must follow up with `alloc_nid_done` or `alloc_nid_failed`.
    pub fn alloc_nid(&self) -> Option<Nid> {
        use core::sync::atomic::Ordering;

        let nm = self.nm();
        let npb = self.sb().nats_per_block();
        // Enough full sweeps of the NAT to visit every shard's share twice.
        let max_refills =
            ((self.sb().nat_blocks() / FREE_NID_PAGES + 2) * 2) as usize * nm.s_free;
        let mut refills = 0;
        loop {
            if self.total_valid_node_count() + 1 > i64::from(nm.available_nids) {
                return None;
            }
            let shard_idx = nm.next_allocator.fetch_add(1, Ordering::SeqCst) % nm.s_free;
            let shard = &nm.free_shards[shard_idx];
            {
                let mut inner = shard.inner.lock();
                // Free nids appearing mid-build may be stale; wait them out.
                if inner.fcnt > 0 && !nm.on_build() {
                    debug_assert!(!inner.list.is_empty());
                    let picked = inner
                        .list
                        .iter()
                        .copied()
                        .find(|n| inner.map[n].state == NidState::New);
                    let nid = picked.expect("fcnt said a New entry exists");
                    inner.map.get_mut(&nid).unwrap().state = NidState::Alloc;
                    inner.fcnt -= 1;
                    return Some(nid);
                }
            }

            // Scan NAT pages and the journal for more free nids.
            {
                let _build = unpoison(nm.build_lock.lock());
                if nm.free_shards[shard_idx].fcnt() == 0 {
                    nm.building.store(true, Ordering::Release);
                    let res = self.build_free_nids();
                    nm.building.store(false, Ordering::Release);
                    if let Err(e) = res {
                        log::error!("free nid build failed: {}", e);
                        return None;
                    }
                }
            }
            refills += 1;
            if refills > max_refills {
                log::warn!(
                    "no free nid found after {} refills ({} per block, {} cells)",
                    refills,
                    npb,
                    nm.s_free
                );
                return None;
            }
        }
    }

    /// The NID is installed in the NAT; retire its pool entry.
    pub fn alloc_nid_done(&self, nid: Nid) {
        let nm = self.nm();
        let mut inner = nm.free_shards[nm.free_shard_of(nid)].inner.lock();
        let state = inner.map.get(&nid).map(|f| f.state);
        assert!(state == Some(NidState::Alloc));
        inner.map.remove(&nid);
        if let Some(pos) = inner.list.iter().position(|&n| n == nid) {
            inner.list.remove(pos);
        }
    }

    /// The caller could not use the NID; return it to the pool, or drop it
    /// when memory is tight.
    pub fn alloc_nid_failed(&self, nid: Nid) {
        if nid == 0 {
            return;
        }
        let nm = self.nm();
        let keep = self.available_free_memory(MemKind::FreeNids);
        let mut inner = nm.free_shards[nm.free_shard_of(nid)].inner.lock();
        let state = inner.map.get(&nid).map(|f| f.state);
        assert!(state == Some(NidState::Alloc));
        if keep {
            inner.map.get_mut(&nid).unwrap().state = NidState::New;
            inner.fcnt += 1;
        } else {
            inner.map.remove(&nid);
            if let Some(pos) = inner.list.iter().position(|&n| n == nid) {
                inner.list.remove(pos);
            }
        }
    }

    /// Count of `New` entries across shards.
    pub fn free_nid_count(&self) -> usize {
        self.nm().free_shards.iter().map(|s| s.fcnt()).sum()
    }

    /// Whether `nid` sits in the pool ready for allocation.
    pub fn is_free_nid(&self, nid: Nid) -> bool {
        let nm = self.nm();
        let inner = nm.free_shards[nm.free_shard_of(nid)].inner.lock();
        inner
            .map
            .get(&nid)
            .map_or(false, |f| f.state == NidState::New)
    }

    /// Drains the pool at unmount; allocation must have quiesced.
    pub(crate) fn destroy_free_nid_pool(&self) {
        let nm = self.nm();
        for shard in nm.free_shards.iter() {
            let mut inner = shard.inner.lock();
            for (_, f) in inner.map.iter() {
                assert!(f.state != NidState::Alloc, "nid {} still allocated", f.nid);
            }
            let drained = inner.list.len();
            inner.map.clear();
            inner.list.clear();
            assert!(inner.fcnt == drained);
            inner.fcnt = 0;
        }
    }
}
