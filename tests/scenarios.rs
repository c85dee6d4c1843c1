//! End-to-end scenarios on the toy layout: 8 NAT records per block, 32
//! NIDs, and a journal that holds exactly one NAT block's worth.

use std::sync::Arc;

use cellfs::fs::{build_node_manager, Config, FsInfo};
use cellfs::nat::NatFlags;
use cellfs::node::Inode;
use cellfs::superblock::{format, Geometry};
use cellfs::{MemDisk, NodeInfo, Error, NEW_ADDR, NULL_ADDR};

fn mount(disk: &Arc<MemDisk>, config: Config) -> FsInfo {
    build_node_manager(disk.clone() as Arc<dyn cellfs::BlockDevice>, config).unwrap()
}

fn mount_fresh(config: Config) -> (Arc<MemDisk>, FsInfo) {
    let disk = Arc::new(MemDisk::new(512, 128));
    format(&*disk, &Geometry::toy()).unwrap();
    let fs = mount(&disk, config);
    (disk, fs)
}

#[test]
fn fresh_mount_allocates_first_unreserved_nid() {
    let (_disk, fs) = mount_fresh(Config::default());

    // All 29 unreserved NIDs are free after the mount-time build. The
    // incremental build only scans a few NAT blocks, so at least those.
    assert!(fs.free_nid_count() > 0);

    let nid = fs.alloc_nid().unwrap();
    assert_eq!(nid, 3);

    let inode = Inode::new(nid);
    let page = fs.new_inode_page(&inode).unwrap();
    drop(page);
    fs.alloc_nid_done(nid);

    let ni = fs.get_node_info(nid).unwrap();
    assert_eq!(ni, NodeInfo::new(3, 3, NEW_ADDR, 0));
    assert!(!fs.is_checkpointed_node(nid));
    assert_eq!(fs.total_valid_node_count(), 1);
    assert_eq!(fs.total_valid_inode_count(), 1);
}

#[test]
fn flush_journals_small_batch_and_cleans_cache() {
    let (_disk, fs) = mount_fresh(Config::default());
    let nid = fs.alloc_nid().unwrap();
    let inode = Inode::new(nid);
    fs.new_inode_page(&inode).unwrap();
    fs.alloc_nid_done(nid);

    let ni = fs.get_node_info(nid).unwrap();
    assert_eq!(ni.blk_addr, NEW_ADDR);
    fs.set_node_addr(&ni, 100, false);
    assert!(fs.nm().dirty_nat_count() > 0);

    fs.flush_nat_entries().unwrap();

    assert_eq!(fs.nm().dirty_nat_count(), 0);
    assert!(fs.is_checkpointed_node(nid));
    let flags = fs.nat_entry_flags(nid).unwrap();
    assert!(flags.contains(NatFlags::IS_CHECKPOINTED));
    assert!(!flags.contains(NatFlags::IS_DIRTY));
    assert!(!fs.is_free_nid(nid));
    assert_eq!(fs.get_node_info(nid).unwrap().blk_addr, 100);
}

#[test]
fn deleting_a_node_bumps_version_and_frees_the_nid() {
    let (_disk, fs) = mount_fresh(Config::default());
    let nid = fs.alloc_nid().unwrap();
    let inode = Inode::new(nid);
    fs.new_inode_page(&inode).unwrap();
    fs.alloc_nid_done(nid);
    let ni = fs.get_node_info(nid).unwrap();
    fs.set_node_addr(&ni, 100, false);

    let ni = fs.get_node_info(nid).unwrap();
    assert_eq!(ni.version, 0);
    fs.set_node_addr(&ni, NULL_ADDR, false);

    let ni = fs.get_node_info(nid).unwrap();
    assert_eq!(ni.version, 1);
    assert_eq!(ni.blk_addr, NULL_ADDR);
    assert!(!fs.is_checkpointed_node(nid));

    assert!(!fs.is_free_nid(nid));
    fs.flush_nat_entries().unwrap();
    assert!(fs.is_free_nid(nid));
}

#[test]
fn fsync_marks_node_and_owning_inode() {
    let (_disk, fs) = mount_fresh(Config::default());

    // Inode 3 exists in the cache.
    let ino = fs.alloc_nid().unwrap();
    assert_eq!(ino, 3);
    let inode = Inode::new(ino);
    fs.new_inode_page(&inode).unwrap();
    fs.alloc_nid_done(ino);

    // A dnode of that inode is written with fsync.
    let nid = fs.alloc_nid().unwrap();
    let ni = NodeInfo::new(nid, ino, NULL_ADDR, 0);
    fs.set_node_addr(&ni, 200, true);

    let nflags = fs.nat_entry_flags(nid).unwrap();
    assert!(nflags.contains(NatFlags::HAS_LAST_FSYNC));

    let iflags = fs.nat_entry_flags(ino).unwrap();
    assert!(iflags.contains(NatFlags::HAS_LAST_FSYNC));
    assert!(iflags.contains(NatFlags::HAS_FSYNCED_INODE));

    assert!(!fs.need_inode_block_update(ino));
    fs.alloc_nid_done(nid);
}

#[test]
fn cross_cell_fsync_marks_inode_in_other_cell() {
    let config = Config {
        file_cell: true,
        nr_file_cell: 2,
        ..Config::default()
    };
    let (_disk, fs) = mount_fresh(config);

    // ino 3 lives in cell 1; nid 6 lives in cell 0.
    let ino = 3;
    let inode = Inode::new(ino);
    let ni = fs.get_node_info(ino).unwrap();
    assert_eq!(ni.blk_addr, NULL_ADDR);
    let ni = NodeInfo::new(ino, ino, NULL_ADDR, 0);
    fs.set_node_addr(&ni, 150, false);

    let ni = NodeInfo::new(6, ino, NULL_ADDR, 0);
    fs.set_node_addr(&ni, 200, true);

    let iflags = fs.nat_entry_flags(ino).unwrap();
    assert!(iflags.contains(NatFlags::HAS_LAST_FSYNC));
    assert!(iflags.contains(NatFlags::HAS_FSYNCED_INODE));
}

#[test]
fn journal_overflow_drains_through_nat_blocks() {
    let (disk, fs) = mount_fresh(Config::default());
    let npb = fs.sb().nats_per_block();
    assert_eq!(fs.sb().max_nat_jentries(), npb as usize);

    // Dirty three NAT blocks' worth of entries: far more than the journal
    // can take, so the flush must go through the block path.
    let count = npb * 3;
    let mut nids = Vec::new();
    for i in 0..count {
        let nid = fs.alloc_nid().unwrap();
        let ni = NodeInfo::new(nid, nid, NULL_ADDR, 0);
        fs.set_node_addr(&ni, 100 + i, false);
        fs.alloc_nid_done(nid);
        nids.push(nid);
    }
    assert_eq!(fs.nm().dirty_nat_count(), count as usize);

    fs.checkpoint().unwrap();
    assert_eq!(fs.nm().dirty_nat_count(), 0);

    // A cold cache must reach the switched NAT block copies.
    fs.destroy_node_manager();
    drop(fs);
    let fs = mount(&disk, Config::default());
    assert_eq!(fs.nm().nat_entry_count(), 0);
    for (i, nid) in nids.iter().enumerate() {
        let ni = fs.get_node_info(*nid).unwrap();
        assert_eq!(ni.blk_addr, 100 + i as u32, "nid {}", nid);
    }
}

#[test]
fn checkpoint_survives_remount_with_counters() {
    let (disk, fs) = mount_fresh(Config::default());
    let nid = fs.alloc_nid().unwrap();
    let inode = Inode::new(nid);
    fs.new_inode_page(&inode).unwrap();
    fs.alloc_nid_done(nid);
    fs.checkpoint().unwrap();

    fs.destroy_node_manager();
    drop(fs);

    let fs = mount(&disk, Config::default());
    assert_eq!(fs.total_valid_node_count(), 1);
    assert_eq!(fs.total_valid_inode_count(), 1);
    // The inode page went to the device during the checkpoint.
    let ni = fs.get_node_info(nid).unwrap();
    assert!(ni.blk_addr != NULL_ADDR && ni.blk_addr != NEW_ADDR);
    assert!(!fs.is_free_nid(nid));
}

#[test]
fn write_error_marks_filesystem_errored() {
    let (disk, fs) = mount_fresh(Config::default());
    let nid = fs.alloc_nid().unwrap();
    let inode = Inode::new(nid);
    fs.new_inode_page(&inode).unwrap();
    fs.alloc_nid_done(nid);

    disk.fail_writes_after(0);
    assert!(fs.checkpoint().is_err());
    assert!(fs.cp_error());

    // Once errored, further checkpoints refuse to run.
    disk.heal();
    assert_eq!(fs.checkpoint(), Err(Error::Eio));
}

#[test]
fn sixteen_threads_allocate_without_duplicates() {
    let disk = Arc::new(MemDisk::new(4096, 128));
    let geo = Geometry {
        nat_blocks: 32,
        total_blocks: 4096,
        ..Geometry::toy()
    };
    format(&*disk, &geo).unwrap();
    let fs = Arc::new(mount(&disk, Config::many_core()));

    const THREADS: usize = 16;
    const PER_THREAD: usize = 8;
    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let fs = fs.clone();
        handles.push(std::thread::spawn(move || {
            let mut got = Vec::new();
            for i in 0..PER_THREAD {
                let _op = fs.lock_op();
                let nid = fs.alloc_nid().expect("nid budget");
                let inode = Inode::new(nid);
                fs.new_inode_page(&inode).unwrap();
                let ni = fs.get_node_info(nid).unwrap();
                fs.set_node_addr(&ni, 1000 + (nid * 4 + i as u32), false);
                fs.alloc_nid_done(nid);
                got.push(nid);
            }
            got
        }));
    }

    let mut all: Vec<u32> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    assert_eq!(all.len(), THREADS * PER_THREAD);
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), THREADS * PER_THREAD, "duplicate nids handed out");
    assert_eq!(fs.total_valid_node_count() as usize, THREADS * PER_THREAD);
    assert_eq!(fs.total_valid_inode_count() as usize, THREADS * PER_THREAD);

    // Every shard's counters agree with its cache after the storm.
    fs.checkpoint().unwrap();
    assert_eq!(fs.nm().dirty_nat_count(), 0);
}

#[test]
fn concurrent_lookup_installs_one_entry() {
    let (_disk, fs) = mount_fresh(Config::default());
    let fs = Arc::new(fs);
    let mut handles = Vec::new();
    for _ in 0..8 {
        let fs = fs.clone();
        handles.push(std::thread::spawn(move || {
            fs.get_node_info(17).unwrap()
        }));
    }
    let infos: Vec<NodeInfo> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for ni in &infos {
        assert_eq!(*ni, NodeInfo::new(17, 0, NULL_ADDR, 0));
    }
    assert_eq!(fs.nm().nat_entry_count(), 1);
}

#[test]
fn alloc_failed_returns_nid_to_pool() {
    let (_disk, fs) = mount_fresh(Config::default());
    let nid = fs.alloc_nid().unwrap();
    assert!(!fs.is_free_nid(nid));
    fs.alloc_nid_failed(nid);
    assert!(fs.is_free_nid(nid));
    // With enough memory, the nid may be handed out again.
    let again = fs.alloc_nid().unwrap();
    assert_eq!(again, nid);
    fs.alloc_nid_failed(again);
}

#[test]
fn new_then_valid_keeps_version() {
    let (_disk, fs) = mount_fresh(Config::default());
    let nid = fs.alloc_nid().unwrap();
    let inode = Inode::new(nid);
    fs.new_inode_page(&inode).unwrap();
    fs.alloc_nid_done(nid);

    let ni = fs.get_node_info(nid).unwrap();
    assert_eq!((ni.blk_addr, ni.version), (NEW_ADDR, 0));
    fs.set_node_addr(&ni, 321, false);
    let ni = fs.get_node_info(nid).unwrap();
    assert_eq!((ni.blk_addr, ni.version), (321, 0));
}

#[test]
fn nid_budget_exhaustion_fails_alloc() {
    let (_disk, fs) = mount_fresh(Config::default());
    let avail = fs.sb().available_nids();
    let mut held = Vec::new();
    for _ in 0..avail {
        let nid = fs.alloc_nid().unwrap();
        let ni = NodeInfo::new(nid, nid, NULL_ADDR, 0);
        assert!(fs.inc_valid_node_count(None, 1));
        fs.set_node_addr(&ni, 500, false);
        fs.alloc_nid_done(nid);
        held.push(nid);
    }
    assert_eq!(fs.total_valid_node_count(), i64::from(avail));
    assert!(fs.alloc_nid().is_none());
}
