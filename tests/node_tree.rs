//! Node-tree walks, truncation, fsync writeback, memory-pressure trimming,
//! recovery, and the per-core flush, on the toy layout.

use std::sync::Arc;

use cellfs::fs::{build_node_manager, Config, FsInfo};
use cellfs::nat::NatFlags;
use cellfs::node::{
    addrs_per_inode, fill_node_footer, Dnode, Inode, LookupMode, NodeAops,
};
use cellfs::page::{AddressSpace, WritebackControl};
use cellfs::param::XATTR_NODE_OFFSET;
use cellfs::superblock::{format, Geometry};
use cellfs::{BlockDevice, MemDisk, NodeInfo, NEW_ADDR, NULL_ADDR};

fn mount_fresh(config: Config) -> (Arc<MemDisk>, FsInfo) {
    let disk = Arc::new(MemDisk::new(512, 128));
    format(&*disk, &Geometry::toy()).unwrap();
    let fs = build_node_manager(disk.clone() as Arc<dyn cellfs::BlockDevice>, config).unwrap();
    (disk, fs)
}

fn make_inode(fs: &FsInfo) -> Inode {
    let ino = fs.alloc_nid().unwrap();
    let inode = Inode::new(ino);
    fs.new_inode_page(&inode).unwrap();
    fs.alloc_nid_done(ino);
    inode
}

#[test]
fn alloc_walk_creates_direct_node() {
    let (_disk, fs) = mount_fresh(Config::default());
    let inode = make_inode(&fs);
    let api = addrs_per_inode(fs.sb(), &inode) as u64;

    let mut dn = Dnode::new(&inode);
    fs.get_dnode_of_data(&mut dn, api, LookupMode::AllocNode)
        .unwrap();
    let dnode_nid = dn.nid;
    assert_ne!(dnode_nid, inode.ino);
    assert_eq!(dn.ofs_in_node, 0);
    assert_eq!(dn.data_blkaddr, NULL_ADDR);
    dn.put();

    let ni = fs.get_node_info(dnode_nid).unwrap();
    assert_eq!(ni.blk_addr, NEW_ADDR);
    assert_eq!(ni.ino, inode.ino);
    assert_eq!(inode.blocks(), 2);
    assert_eq!(fs.total_valid_node_count(), 2);

    // A second walk to the same index reuses the node.
    let mut dn = Dnode::new(&inode);
    fs.get_dnode_of_data(&mut dn, api + 1, LookupMode::LookupNode)
        .unwrap();
    assert_eq!(dn.nid, dnode_nid);
    assert_eq!(dn.ofs_in_node, 1);
    dn.put();
}

#[test]
fn alloc_walk_creates_double_indirect_chain() {
    let (_disk, fs) = mount_fresh(Config::default());
    let inode = make_inode(&fs);
    let sb = fs.sb().clone();
    let api = addrs_per_inode(&sb, &inode) as u64;
    let direct = sb.addrs_per_block() as u64;
    let nids = sb.nids_per_block() as u64;
    let dind_start = api + 2 * direct + 2 * direct * nids;

    let mut dn = Dnode::new(&inode);
    fs.get_dnode_of_data(&mut dn, dind_start, LookupMode::AllocNode)
        .unwrap();
    dn.put();

    // Double-indirect, indirect, and direct nodes plus the inode.
    assert_eq!(fs.total_valid_node_count(), 4);
    assert_eq!(inode.blocks(), 4);

    fs.truncate_inode_blocks(&inode, api).unwrap();
    assert_eq!(fs.total_valid_node_count(), 1);
    assert_eq!(inode.blocks(), 1);

    // The freed nids return to the pool at the next flush.
    let before = fs.free_nid_count();
    fs.flush_nat_entries().unwrap();
    assert_eq!(fs.free_nid_count(), before + 3);
}

#[test]
fn truncate_direct_node_nulls_translation() {
    let (_disk, fs) = mount_fresh(Config::default());
    let inode = make_inode(&fs);
    let api = addrs_per_inode(fs.sb(), &inode) as u64;

    let mut dn = Dnode::new(&inode);
    fs.get_dnode_of_data(&mut dn, api, LookupMode::AllocNode)
        .unwrap();
    let dnode_nid = dn.nid;
    dn.put();

    fs.truncate_inode_blocks(&inode, api).unwrap();
    let ni = fs.get_node_info(dnode_nid).unwrap();
    assert_eq!(ni.blk_addr, NULL_ADDR);
    // Reserved-then-deleted: the node never reached the device, so no
    // version bump; stale-block detection only matters for real addresses.
    assert_eq!(ni.version, 0);
    assert!(!fs.is_checkpointed_node(dnode_nid));
}

#[test]
fn fsync_writes_only_that_inodes_pages() {
    let (_disk, fs) = mount_fresh(Config::default());
    let a = make_inode(&fs);
    let b = make_inode(&fs);
    let api = addrs_per_inode(fs.sb(), &a) as u64;

    for inode in [&a, &b] {
        let mut dn = Dnode::new(inode);
        fs.get_dnode_of_data(&mut dn, api, LookupMode::AllocNode)
            .unwrap();
        dn.put();
    }
    let dirty_before = fs.node_space_by_idx(0).dirty_page_count();
    assert!(dirty_before >= 4);

    let mut wbc = WritebackControl::sync_all(i64::MAX);
    let marked = fs.sync_node_pages(a.ino, None, &mut wbc).unwrap();
    assert_eq!(marked, 2);

    // Only a's pages were written; b's stay dirty.
    let dirty_after = fs.node_space_by_idx(0).dirty_page_count();
    assert_eq!(dirty_before - dirty_after, 2);
    fs.wait_on_node_pages_writeback(a.ino).unwrap();

    let iflags = fs.nat_entry_flags(a.ino).unwrap();
    assert!(iflags.contains(NatFlags::HAS_LAST_FSYNC));
    assert!(iflags.contains(NatFlags::HAS_FSYNCED_INODE));
    assert!(!fs.need_inode_block_update(a.ino));
    assert!(fs.need_inode_block_update(b.ino));
}

#[test]
fn xattr_node_truncates_with_inode() {
    let (_disk, fs) = mount_fresh(Config::default());
    let inode = make_inode(&fs);

    let xnid = fs.alloc_nid().unwrap();
    let mut dn = Dnode::new(&inode);
    dn.nid = xnid;
    fs.new_node_page(&mut dn, XATTR_NODE_OFFSET, None).unwrap();
    fs.alloc_nid_done(xnid);
    assert_eq!(inode.xattr_nid(), xnid);
    assert_eq!(fs.total_valid_node_count(), 2);

    let _op = fs.lock_op();
    fs.remove_inode_page(&inode).unwrap();
    assert_eq!(inode.xattr_nid(), 0);
    assert_eq!(fs.total_valid_node_count(), 0);
    assert_eq!(fs.total_valid_inode_count(), 0);
    assert_eq!(fs.get_node_info(xnid).unwrap().blk_addr, NULL_ADDR);
    assert_eq!(fs.get_node_info(inode.ino).unwrap().blk_addr, NULL_ADDR);
}

#[test]
fn zero_budget_forces_cache_trim() {
    let config = Config {
        ram_budget: 0,
        ..Config::default()
    };
    let (_disk, fs) = mount_fresh(config);
    for nid in 5..15 {
        fs.get_node_info(nid).unwrap();
    }
    assert_eq!(fs.nm().nat_entry_count(), 10);
    let left = fs.try_to_free_nats(4);
    assert_eq!(left, 0);
    assert_eq!(fs.nm().nat_entry_count(), 6);
    // Dirty entries survive any amount of shrinking.
    let ni = fs.get_node_info(20).unwrap();
    fs.set_node_addr(&ni, 700, false);
    fs.try_to_free_nats(100);
    assert_eq!(fs.nm().nat_entry_count(), 1);
    assert_eq!(fs.nm().dirty_nat_count(), 1);
}

#[test]
fn recover_inode_page_reserves_nid() {
    let (_disk, fs) = mount_fresh(Config::default());
    let scratch = AddressSpace::new(128, Box::new(NodeAops { cell: 0 }));
    let mut src = scratch.grab_page(9);
    fill_node_footer(&mut src, 9, 9, 0, true);
    src.set_uptodate();

    assert!(fs.is_free_nid(9));
    fs.recover_inode_page(&src).unwrap();
    assert!(!fs.is_free_nid(9));
    let ni = fs.get_node_info(9).unwrap();
    assert_eq!(ni.blk_addr, NEW_ADDR);
    assert_eq!(ni.ino, 9);
    assert_eq!(fs.total_valid_node_count(), 1);
    assert_eq!(fs.total_valid_inode_count(), 1);

    // Replaying the same page again must refuse.
    assert!(fs.recover_inode_page(&src).is_err());
}

#[test]
fn recover_xattr_data_publishes_block() {
    let (_disk, fs) = mount_fresh(Config::default());
    let inode = make_inode(&fs);

    let scratch = AddressSpace::new(128, Box::new(NodeAops { cell: 0 }));
    let mut src = scratch.grab_page(11);
    fill_node_footer(&mut src, 11, inode.ino, XATTR_NODE_OFFSET, true);

    let target = fs.sb().main_blkaddr() + 17;
    fs.recover_xattr_data(&inode, &src, target).unwrap();
    assert_eq!(inode.xattr_nid(), 11);
    let ni = fs.get_node_info(11).unwrap();
    assert_eq!(ni.blk_addr, target);
    assert_eq!(ni.ino, inode.ino);
    assert_eq!(fs.alloc().valid_block_count(), 1);
}

#[test]
fn restore_node_summary_reads_footers() {
    let (disk, fs) = mount_fresh(Config::default());
    let sb = fs.sb().clone();
    let start = sb.seg_start_block(0);
    for (i, nid) in [21u32, 22, 23, 24].iter().enumerate() {
        let mut block = vec![0u8; sb.block_size()];
        let off = sb.block_size() - 24;
        block[off..off + 4].copy_from_slice(&nid.to_le_bytes());
        disk.write_block(start + i as u32, &block).unwrap();
    }
    let mut nids = Vec::new();
    fs.restore_node_summary(0, &mut nids).unwrap();
    assert_eq!(nids, vec![21, 22, 23, 24]);
}

#[test]
fn per_core_flush_switches_each_pair_once() {
    let config = Config {
        file_cell: true,
        nr_file_cell: 2,
        ..Config::default()
    };
    let (disk, fs) = mount_fresh(config.clone());

    // Sixteen dirty entries spanning two NAT blocks and both cells.
    for nid in 8u32..24 {
        let ni = NodeInfo::new(nid, nid, NULL_ADDR, 0);
        fs.set_node_addr(&ni, 300 + nid, false);
    }
    assert_eq!(fs.nm().dirty_nat_count(), 16);
    fs.checkpoint().unwrap();
    assert_eq!(fs.nm().dirty_nat_count(), 0);

    fs.destroy_node_manager();
    drop(fs);
    let fs = build_node_manager(disk.clone() as Arc<dyn cellfs::BlockDevice>, config).unwrap();
    for nid in 8u32..24 {
        assert_eq!(fs.get_node_info(nid).unwrap().blk_addr, 300 + nid);
    }
    // Neighbours in the same blocks kept their null records.
    assert_eq!(fs.get_node_info(24).unwrap().blk_addr, NULL_ADDR);
    assert_eq!(fs.get_node_info(7).unwrap().blk_addr, NULL_ADDR);
}
