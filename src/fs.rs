//! Per-mount glue.
//!
//! `FsInfo` is the context value threaded through every operation: the
//! superblock geometry, the device, the meta and per-cell node address
//! spaces, the current segment, the block allocator, the node manager, the
//! two checkpoint fences, and the cluster counters. There is no process-wide
//! state; two mounts are two `FsInfo` values.
//!
//! Lock order, outermost first: checkpoint fence (or node-write fence) →
//! build lock → current-segment mutex → NAT shard lock → free-NID shard
//! lock; a space's page-tree lock is always innermost.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::disk::BlockDevice;
use crate::error::{Error, Result};
use crate::nat::NodeManager;
use crate::node::{Inode, NodeAops};
use crate::page::{
    AddressSpace, AddressSpaceOps, LockedPage, PageTag, WritebackControl, WriteOutcome,
};
use crate::param::{BlockAddr, Nid, DEF_RAM_BUDGET};
use crate::rps::{Fence, FenceReadGuard};
use crate::summary::CursegInfo;
use crate::segment::BlockAlloc;
use crate::superblock::{
    read_checkpoint_pack, read_superblock, write_checkpoint_pack, CheckpointPack, Superblock,
};
use crate::util::{online_cpus, test_bit, unpoison, StripedCounter};

/// Mount-time options.
#[derive(Clone)]
pub struct Config {
    /// Shard the NAT cache and node address spaces per file cell.
    pub file_cell: bool,
    /// File cells to use; 0 means one per online CPU.
    pub nr_file_cell: u32,
    /// Shard the free-NID pool.
    pub per_core_nid_list: bool,
    /// Use the reader-preferring semaphore for the checkpoint fences.
    pub rps: bool,
    /// Keep the cluster counters striped per CPU.
    pub per_core_counters: bool,
    /// Memory budget shared by the NAT cache and the free-NID pool.
    pub ram_budget: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            file_cell: false,
            nr_file_cell: 0,
            per_core_nid_list: false,
            rps: false,
            per_core_counters: false,
            ram_budget: DEF_RAM_BUDGET,
        }
    }
}

impl Config {
    /// Every scalability feature on.
    pub fn many_core() -> Self {
        Self {
            file_cell: true,
            nr_file_cell: 0,
            per_core_nid_list: true,
            rps: true,
            per_core_counters: true,
            ram_budget: DEF_RAM_BUDGET,
        }
    }
}

/// One mounted filesystem instance, as seen by the node manager.
pub struct FsInfo {
    sb: Superblock,
    config: Config,
    disk: Arc<dyn BlockDevice>,
    meta: AddressSpace,
    node_spaces: Vec<AddressSpace>,
    curseg: CursegInfo,
    alloc: BlockAlloc,
    nm: NodeManager,
    /// Readers: mutators. Writer: the checkpoint.
    cp_rwsem: Fence,
    /// Readers: node-page writers. Writer: the checkpoint barrier phase.
    node_write: Fence,
    total_valid_node_count: StripedCounter,
    total_valid_inode_count: StripedCounter,
    cp_ver: AtomicU64,
    cp_error: AtomicBool,
    por_doing: AtomicBool,
}

/// Mounts the filesystem on `disk` and builds the node manager: geometry,
/// shard arrays, NAT bitmap, then the free-NID pool.
pub fn build_node_manager(disk: Arc<dyn BlockDevice>, config: Config) -> Result<FsInfo> {
    let sb = read_superblock(&*disk)?;
    let cp = read_checkpoint_pack(&*disk, &sb)?;
    let curseg = CursegInfo::load(&*disk, &sb)?;

    let cell_limit = (sb.nats_per_block() - 3) as usize;
    let cells = |n: u32| -> usize {
        let n = if n > 0 { n as usize } else { online_cpus() };
        n.min(cell_limit).max(1)
    };
    let s_nat = if config.file_cell {
        cells(config.nr_file_cell)
    } else {
        1
    };
    let s_free = if config.per_core_nid_list {
        cells(config.nr_file_cell)
    } else {
        1
    };
    log::info!(
        "mounting: {} nids, {} nat cells, {} free-nid cells",
        sb.max_nid(),
        s_nat,
        s_free
    );

    let nm = NodeManager::new(
        sb.max_nid(),
        sb.available_nids(),
        s_nat,
        s_free,
        cp.next_free_nid,
        cp.nat_bitmap.clone(),
        config.ram_budget,
    );

    let meta = AddressSpace::new(sb.block_size(), Box::new(MetaAops));
    let node_spaces = (0..s_nat)
        .map(|cell| AddressSpace::new(sb.block_size(), Box::new(NodeAops { cell })))
        .collect();

    let counter_stripes = if config.per_core_counters {
        online_cpus()
    } else {
        1
    };
    let total_valid_node_count = StripedCounter::new(counter_stripes);
    total_valid_node_count.add(i64::from(cp.valid_node_count));
    let total_valid_inode_count = StripedCounter::new(counter_stripes);
    total_valid_inode_count.add(i64::from(cp.valid_inode_count));

    let fs = FsInfo {
        alloc: BlockAlloc::new(&sb, cp.next_free_block),
        cp_rwsem: Fence::new(config.rps, online_cpus()),
        node_write: Fence::new(config.rps, online_cpus()),
        total_valid_node_count,
        total_valid_inode_count,
        cp_ver: AtomicU64::new(cp.cp_ver),
        cp_error: AtomicBool::new(false),
        por_doing: AtomicBool::new(false),
        sb,
        config,
        disk,
        meta,
        node_spaces,
        curseg,
        nm,
    };

    {
        let _build = unpoison(fs.nm.build_lock.lock());
        fs.nm.building.store(true, Ordering::Release);
        let res = if fs.config.per_core_nid_list {
            fs.build_all_free_nids()
        } else {
            fs.build_free_nids()
        };
        fs.nm.building.store(false, Ordering::Release);
        res?;
    }
    Ok(fs)
}

impl FsInfo {
    pub fn sb(&self) -> &Superblock {
        &self.sb
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn nm(&self) -> &NodeManager {
        &self.nm
    }

    pub(crate) fn curseg(&self) -> &CursegInfo {
        &self.curseg
    }

    pub fn disk(&self) -> &dyn BlockDevice {
        &*self.disk
    }

    pub fn alloc(&self) -> &BlockAlloc {
        &self.alloc
    }

    pub fn meta(&self) -> &AddressSpace {
        &self.meta
    }

    /// The node address space owning `nid`.
    pub fn node_space(&self, nid: Nid) -> &AddressSpace {
        &self.node_spaces[nid as usize % self.node_spaces.len()]
    }

    pub fn node_space_by_idx(&self, cell: usize) -> &AddressSpace {
        &self.node_spaces[cell]
    }

    pub(crate) fn node_write_fence(&self) -> &Fence {
        &self.node_write
    }

    /// Mutator side of the checkpoint fence: filesystem operations hold
    /// this for read around any metadata mutation.
    pub fn lock_op(&self) -> FenceReadGuard<'_> {
        self.cp_rwsem.read()
    }

    pub fn cp_ver(&self) -> u64 {
        self.cp_ver.load(Ordering::Acquire)
    }

    pub fn cp_error(&self) -> bool {
        self.cp_error.load(Ordering::Acquire)
    }

    pub fn set_cp_error(&self) {
        self.cp_error.store(true, Ordering::Release);
    }

    pub fn is_por_doing(&self) -> bool {
        self.por_doing.load(Ordering::Acquire)
    }

    pub fn set_por_doing(&self, v: bool) {
        self.por_doing.store(v, Ordering::Release);
    }

    // Cluster counters.

    /// Reserves capacity for `count` node blocks; fails when the NID budget
    /// is exhausted.
    pub fn inc_valid_node_count(&self, inode: Option<&Inode>, count: u32) -> bool {
        if self.total_valid_node_count.sum() + i64::from(count)
            > i64::from(self.nm.available_nids)
        {
            return false;
        }
        self.total_valid_node_count.add(i64::from(count));
        if let Some(inode) = inode {
            inode.add_blocks(i64::from(count));
        }
        true
    }

    pub fn dec_valid_node_count(&self, inode: Option<&Inode>, count: u32) {
        self.total_valid_node_count.add(-i64::from(count));
        if let Some(inode) = inode {
            inode.add_blocks(-i64::from(count));
        }
    }

    pub fn total_valid_node_count(&self) -> i64 {
        self.total_valid_node_count.sum()
    }

    pub fn inc_valid_inode_count(&self) {
        self.total_valid_inode_count.add(1);
    }

    pub fn dec_valid_inode_count(&self) {
        self.total_valid_inode_count.add(-1);
    }

    pub fn total_valid_inode_count(&self) -> i64 {
        self.total_valid_inode_count.sum()
    }

    // Meta pages. The meta space is indexed by device block address.

    /// Locked meta page, created empty if absent.
    pub(crate) fn grab_meta_page(&self, addr: BlockAddr) -> LockedPage {
        self.meta.grab_page(addr as u64)
    }

    /// Locked meta page filled from the device.
    pub(crate) fn get_meta_page(&self, addr: BlockAddr) -> Result<LockedPage> {
        let mut page = self.meta.grab_page(addr as u64);
        if !page.is_uptodate() {
            self.disk.read_block(addr, page.data_mut())?;
            page.set_uptodate();
        }
        Ok(page)
    }

    /// Warms the meta cache for `count` blocks from `start`.
    pub(crate) fn ra_meta_pages(&self, start: BlockAddr, count: u32) -> Result<()> {
        for addr in start..start + count {
            let page = self.get_meta_page(addr)?;
            drop(page);
        }
        Ok(())
    }

    /// Readahead of the current NAT copies for `nblocks` blocks starting at
    /// `start_nid`'s block.
    pub(crate) fn ra_meta_pages_nat(&self, start_nid: Nid, nblocks: u32) -> Result<()> {
        let start_off = self.sb.nat_block_offset(start_nid);
        let end_off = (start_off + nblocks).min(self.sb.nat_blocks());
        for off in start_off..end_off {
            let addr = self.nat_copy_addr_current(off);
            let page = self.get_meta_page(addr)?;
            drop(page);
        }
        Ok(())
    }

    /// Writes every dirty meta page back to the device.
    pub(crate) fn sync_meta_pages(&self) -> Result<usize> {
        let mut written = 0;
        let mut index = 0u64;
        loop {
            let pvec = self.meta.lookup_tag(PageTag::Dirty, &mut index);
            if pvec.is_empty() {
                break;
            }
            for pref in pvec {
                let page = pref.lock();
                if !self.meta.owns(&page) || !page.is_dirty() {
                    continue;
                }
                self.meta.clear_page_dirty_for_io(&page);
                let mut wbc = WritebackControl::sync_all(1);
                self.meta.ops().write_page(self, page, &mut wbc)?;
                written += 1;
            }
        }
        Ok(written)
    }

    // NAT block addressing through the version bitmap.

    /// Device address of the current copy of NAT block pair `block_off`.
    pub(crate) fn nat_copy_addr_current(&self, block_off: u32) -> BlockAddr {
        let bitmap = self.nm.nat_bitmap.lock();
        self.sb
            .nat_copy_addr(block_off, test_bit(&bitmap, block_off as usize))
    }

    pub(crate) fn current_nat_addr(&self, nid: Nid) -> BlockAddr {
        self.nat_copy_addr_current(self.sb.nat_block_offset(nid))
    }

    /// The current NAT block covering `nid`, read from the device.
    pub(crate) fn get_current_nat_page(&self, nid: Nid) -> Result<LockedPage> {
        self.get_meta_page(self.current_nat_addr(nid))
    }

    /// Persists the node manager's durable state: the journal-bearing
    /// summary, every dirty meta page, and the checkpoint header.
    fn commit_checkpoint(&self) -> Result<()> {
        self.curseg.store(&*self.disk, &self.sb)?;
        self.sync_meta_pages()?;
        let cp = CheckpointPack {
            cp_ver: self.cp_ver() + 1,
            next_free_nid: self.nm.next_scan_nid.load(Ordering::SeqCst),
            next_free_block: self.alloc.next_free_block(),
            valid_node_count: self.total_valid_node_count().max(0) as u32,
            valid_inode_count: self.total_valid_inode_count().max(0) as u32,
            nat_bitmap: self.nm.nat_bitmap.lock().clone(),
        };
        write_checkpoint_pack(&*self.disk, &self.sb, &cp)?;
        self.cp_ver.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Runs a checkpoint: quiesces mutators, drains dirty node pages,
    /// fences node writes, flushes the dirty NAT entries, and commits.
    /// Once started it runs to completion or marks the filesystem errored.
    pub fn checkpoint(&self) -> Result<()> {
        let _mutators = self.cp_rwsem.write();

        let mut last_dirty = usize::MAX;
        loop {
            let dirty: usize = self
                .node_spaces
                .iter()
                .map(|s| s.dirty_page_count())
                .sum();
            if dirty == 0 {
                break;
            }
            if dirty >= last_dirty {
                // Writeback made no progress; give up rather than spin.
                self.set_cp_error();
                return Err(Error::Eio);
            }
            last_dirty = dirty;
            let mut wbc = WritebackControl::sync_all(i64::MAX);
            self.sync_node_pages(0, None, &mut wbc)?;
            if self.cp_error() {
                return Err(Error::Eio);
            }
        }

        let _node_writes = self.node_write.write();
        if self.cp_error() {
            return Err(Error::Eio);
        }

        let res = if self.config.file_cell && self.nm.s_nat > 1 {
            self.flush_nat_entries_per_core()
        } else {
            self.flush_nat_entries()
        };
        if let Err(e) = res {
            self.set_cp_error();
            return Err(e);
        }
        if let Err(e) = self.commit_checkpoint() {
            self.set_cp_error();
            return Err(e);
        }
        Ok(())
    }

    /// Tears the node manager down, verifying the invariants an unmount
    /// expects: no NID still handed out, no dirty NAT entry unless the
    /// filesystem is errored.
    pub fn destroy_node_manager(&self) {
        self.destroy_free_nid_pool();
        for shard in self.nm.shards.iter() {
            let mut inner = shard.write();
            if !self.cp_error() {
                assert!(
                    inner.dirty_nat_cnt == 0,
                    "dirty nat entries survive unmount"
                );
            }

            // Drop the cache one gang batch at a time.
            let mut nid: Nid = 0;
            loop {
                let natvec = inner.gang_lookup_entries(nid);
                let last = match natvec.last() {
                    Some(&n) => n,
                    None => break,
                };
                nid = last + 1;
                for n in natvec {
                    inner.del_entry(n, self.sb.nat_block_offset(n));
                }
            }
            assert!(inner.nat_cnt == 0);

            // Then the dirty-set index; entries may survive only after a
            // checkpoint error.
            let mut set_id = 0u32;
            loop {
                let setvec = inner.gang_lookup_sets(set_id);
                let last = match setvec.last() {
                    Some(&s) => s,
                    None => break,
                };
                set_id = last + 1;
                for s in setvec {
                    let set = inner.remove_set(s);
                    if !self.cp_error() {
                        assert!(set.map_or(true, |set| set.entry_list.is_empty()));
                    }
                }
            }
        }
    }
}

/// Writeback vtable of the meta address space: a meta page's index is its
/// device block address.
struct MetaAops;

impl AddressSpaceOps for MetaAops {
    fn write_page(
        &self,
        fs: &FsInfo,
        page: LockedPage,
        _wbc: &mut WritebackControl,
    ) -> Result<WriteOutcome> {
        fs.meta.set_page_writeback(&page);
        let res = fs.disk.write_block(page.index() as BlockAddr, page.data());
        fs.meta.end_page_writeback(&page);
        match res {
            Ok(()) => Ok(WriteOutcome::Written),
            Err(e) => {
                page.set_error();
                fs.meta.set_eio();
                fs.set_cp_error();
                fs.meta.set_page_dirty_raw(&page);
                Err(e)
            }
        }
    }

    fn write_pages(&self, fs: &FsInfo, _wbc: &mut WritebackControl) -> Result<usize> {
        fs.sync_meta_pages()
    }

    fn set_dirty(&self, fs: &FsInfo, page: &LockedPage) -> bool {
        page.set_uptodate();
        fs.meta.set_page_dirty_raw(page)
    }

    fn invalidate_page(&self, fs: &FsInfo, page: &crate::page::PageRef) {
        fs.meta.invalidate_pages(page.index(), page.index());
    }

    fn release_page(&self, _fs: &FsInfo, page: &crate::page::PageRef) -> bool {
        !page.is_dirty()
    }
}
