//! Node pages.
//!
//! A node page holds either an inode block, a direct node (data addresses),
//! or an (double-)indirect node (child NIDs); its identity lives in a footer
//! at the page tail. This module owns the node-page read/allocate/write
//! paths, the inode-tree arithmetic (`get_node_path`) behind lookup and
//! truncation, the three-pass writeback used by sync and fsync, and the
//! post-crash recovery helpers.
//!
//! Node pages live in per-file-cell address spaces keyed by NID; all I/O on
//! them funnels through the [`NodeAops`] vtable registered at mount.

use core::mem;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use scopeguard::ScopeGuard;
use static_assertions::const_assert;
use zerocopy::byteorder::{LittleEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

use crate::error::{Error, Result};
use crate::fs::FsInfo;
use crate::page::{
    AddressSpaceOps, LockedPage, PageRef, PageTag, WritebackControl, WriteOutcome,
};
use crate::param::{
    BlockAddr, Ino, Nid, COLD_BIT_SHIFT, DENT_BIT_SHIFT, FSYNC_BIT_SHIFT, INODE_HEADER_SIZE,
    INLINE_XATTR_ADDRS, MAX_RA_NODE, NEW_ADDR, NODE_FOOTER_SIZE, NULL_ADDR, OFFSET_BIT_SHIFT,
    PAGEVEC_SIZE, XATTR_NODE_OFFSET,
};
use crate::superblock::Superblock;

type Le32 = U32<LittleEndian>;
type Le64 = U64<LittleEndian>;

/// Footer at the tail of every node page.
#[repr(C)]
#[derive(AsBytes, FromBytes, Unaligned)]
pub struct RawNodeFooter {
    pub nid: Le32,
    pub ino: Le32,
    /// Node offset in the high bits, cold/fsync/dentry marks in the low.
    pub flag: Le32,
    pub cp_ver: Le64,
    pub next_blkaddr: Le32,
}

const_assert!(mem::size_of::<RawNodeFooter>() == NODE_FOOTER_SIZE);

/// Raw inode header at the head of an inode page's payload; the data
/// address slots and the five node slots follow it.
#[repr(C)]
#[derive(AsBytes, FromBytes, Unaligned)]
pub struct RawInode {
    pub i_size: Le64,
    pub i_blocks: Le64,
    pub i_xattr_nid: Le32,
    pub i_inline: Le32,
}

const_assert!(mem::size_of::<RawInode>() == INODE_HEADER_SIZE);

pub const INLINE_XATTR_FLAG: u32 = 0x1;
pub const INLINE_DATA_FLAG: u32 = 0x2;

/// In-memory inode handle. The VFS lifecycle is a collaborator; the node
/// manager only needs the identity and the bookkeeping it updates itself.
pub struct Inode {
    pub ino: Ino,
    dir: bool,
    blocks: AtomicU64,
    size: AtomicU64,
    xattr_nid: AtomicU32,
    no_alloc: AtomicBool,
    inline_xattr: AtomicBool,
    inline_data: AtomicBool,
}

impl Inode {
    pub fn new(ino: Ino) -> Self {
        Self {
            ino,
            dir: false,
            blocks: AtomicU64::new(0),
            size: AtomicU64::new(0),
            xattr_nid: AtomicU32::new(0),
            no_alloc: AtomicBool::new(false),
            inline_xattr: AtomicBool::new(false),
            inline_data: AtomicBool::new(false),
        }
    }

    pub fn new_dir(ino: Ino) -> Self {
        let mut inode = Self::new(ino);
        inode.dir = true;
        inode
    }

    pub fn is_dir(&self) -> bool {
        self.dir
    }

    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::SeqCst)
    }

    pub(crate) fn add_blocks(&self, n: i64) {
        if n >= 0 {
            self.blocks.fetch_add(n as u64, Ordering::SeqCst);
        } else {
            self.blocks.fetch_sub((-n) as u64, Ordering::SeqCst);
        }
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    pub fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::SeqCst);
    }

    pub fn xattr_nid(&self) -> Nid {
        self.xattr_nid.load(Ordering::SeqCst)
    }

    pub fn set_xattr_nid(&self, nid: Nid) {
        self.xattr_nid.store(nid, Ordering::SeqCst);
    }

    pub fn set_no_alloc(&self, v: bool) {
        self.no_alloc.store(v, Ordering::SeqCst);
    }

    pub fn no_alloc(&self) -> bool {
        self.no_alloc.load(Ordering::SeqCst)
    }

    pub fn set_inline_xattr(&self, v: bool) {
        self.inline_xattr.store(v, Ordering::SeqCst);
    }

    pub fn inline_xattr(&self) -> bool {
        self.inline_xattr.load(Ordering::SeqCst)
    }

    pub fn set_inline_data(&self, v: bool) {
        self.inline_data.store(v, Ordering::SeqCst);
    }

    pub fn inline_data(&self) -> bool {
        self.inline_data.load(Ordering::SeqCst)
    }
}

/// Walk state for one data-block position inside an inode's node tree.
pub struct Dnode<'a> {
    pub inode: &'a Inode,
    pub nid: Nid,
    pub ofs_in_node: u32,
    /// Unlocked reference to the inode page, when distinct from `node_page`.
    pub inode_page: Option<PageRef>,
    pub node_page: Option<LockedPage>,
    pub data_blkaddr: BlockAddr,
}

impl<'a> Dnode<'a> {
    pub fn new(inode: &'a Inode) -> Self {
        Self {
            inode,
            nid: 0,
            ofs_in_node: 0,
            inode_page: None,
            node_page: None,
            data_blkaddr: NULL_ADDR,
        }
    }

    /// Releases both pages.
    pub fn put(&mut self) {
        self.node_page = None;
        self.inode_page = None;
    }
}

/// How `get_dnode_of_data` treats a missing interior node.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum LookupMode {
    /// Allocate missing nodes on the way down.
    AllocNode,
    /// Fail with ENOENT instead.
    LookupNode,
    /// As `LookupNode`, plus readahead of the target's siblings.
    LookupNodeRa,
}

// Footer accessors. The footer occupies the page tail; zerocopy keeps the
// wire layout bit-exact.

fn footer_of(data: &[u8]) -> LayoutVerified<&[u8], RawNodeFooter> {
    let off = data.len() - NODE_FOOTER_SIZE;
    LayoutVerified::new_unaligned(&data[off..]).expect("node footer")
}

fn footer_of_mut(data: &mut [u8]) -> LayoutVerified<&mut [u8], RawNodeFooter> {
    let off = data.len() - NODE_FOOTER_SIZE;
    LayoutVerified::new_unaligned(&mut data[off..]).expect("node footer")
}

pub fn nid_of_node(page: &LockedPage) -> Nid {
    footer_of(page.data()).nid.get()
}

pub fn ino_of_node(page: &LockedPage) -> Ino {
    footer_of(page.data()).ino.get()
}

pub fn ofs_of_node(page: &LockedPage) -> u32 {
    footer_of(page.data()).flag.get() >> OFFSET_BIT_SHIFT
}

pub fn cpver_of_node(page: &LockedPage) -> u64 {
    footer_of(page.data()).cp_ver.get()
}

pub fn is_inode_page(page: &LockedPage) -> bool {
    let f = footer_of(page.data());
    f.nid.get() == f.ino.get()
}

fn footer_flag_bit(page: &LockedPage, shift: u32) -> bool {
    footer_of(page.data()).flag.get() & (1 << shift) != 0
}

fn set_footer_flag_bit(page: &mut LockedPage, shift: u32, v: bool) {
    let mut f = footer_of_mut(page.data_mut());
    let mut flag = f.flag.get();
    if v {
        flag |= 1 << shift;
    } else {
        flag &= !(1 << shift);
    }
    f.flag.set(flag);
}

pub fn is_cold_node(page: &LockedPage) -> bool {
    footer_flag_bit(page, COLD_BIT_SHIFT)
}

pub fn is_fsync_dnode(page: &LockedPage) -> bool {
    footer_flag_bit(page, FSYNC_BIT_SHIFT)
}

pub fn is_dent_dnode(page: &LockedPage) -> bool {
    footer_flag_bit(page, DENT_BIT_SHIFT)
}

pub fn set_cold_node(inode: &Inode, page: &mut LockedPage) {
    set_footer_flag_bit(page, COLD_BIT_SHIFT, !inode.is_dir());
}

pub fn set_fsync_mark(page: &mut LockedPage, v: bool) {
    set_footer_flag_bit(page, FSYNC_BIT_SHIFT, v);
}

pub fn set_dentry_mark(page: &mut LockedPage, v: bool) {
    set_footer_flag_bit(page, DENT_BIT_SHIFT, v);
}

pub fn fill_node_footer(page: &mut LockedPage, nid: Nid, ino: Ino, ofs: u32, reset_ver: bool) {
    let mut f = footer_of_mut(page.data_mut());
    let keep = if reset_ver { 0 } else { f.flag.get() & ((1 << OFFSET_BIT_SHIFT) - 1) };
    f.nid.set(nid);
    f.ino.set(ino);
    f.flag.set((ofs << OFFSET_BIT_SHIFT) | keep);
    if reset_ver {
        f.cp_ver.set(0);
        f.next_blkaddr.set(NULL_ADDR);
    }
}

pub fn has_xattr_block(ofs: u32) -> bool {
    ofs == XATTR_NODE_OFFSET
}

/// A dnode is an inode or direct-node page: anything whose slots hold data
/// addresses rather than child NIDs.
pub fn is_dnode(sb: &Superblock, page: &LockedPage) -> bool {
    let mut ofs = ofs_of_node(page);
    if has_xattr_block(ofs) {
        return false;
    }
    let npb = sb.nids_per_block();
    if ofs == 3 || ofs == 4 + npb || ofs == 5 + 2 * npb {
        return false;
    }
    if ofs >= 6 + 2 * npb {
        ofs -= 6 + 2 * npb;
        if ofs % (npb + 1) != 0 {
            return false;
        }
    }
    true
}

// Slot accessors within a node page's payload.

fn inode_nid_slot(sb: &Superblock, off: usize) -> usize {
    INODE_HEADER_SIZE + sb.addrs_per_inode() as usize * 4 + off * 4
}

/// Reads the child NID at `off`: from the inode slot area or from an
/// indirect node's slot array.
pub fn get_nid(sb: &Superblock, page: &LockedPage, off: usize, in_inode: bool) -> Nid {
    let base = if in_inode {
        inode_nid_slot(sb, off)
    } else {
        off * 4
    };
    let d = page.data();
    u32::from_le_bytes([d[base], d[base + 1], d[base + 2], d[base + 3]])
}

fn put_nid(sb: &Superblock, page: &mut LockedPage, off: usize, nid: Nid, in_inode: bool) {
    let base = if in_inode {
        inode_nid_slot(sb, off)
    } else {
        off * 4
    };
    page.data_mut()[base..base + 4].copy_from_slice(&nid.to_le_bytes());
}

/// Reads the data block address at `ofs` of a dnode page.
pub fn data_blkaddr_of(sb: &Superblock, page: &LockedPage, ofs: u32) -> BlockAddr {
    let base = if is_inode_page(page) {
        INODE_HEADER_SIZE + ofs as usize * 4
    } else {
        ofs as usize * 4
    };
    let d = page.data();
    u32::from_le_bytes([d[base], d[base + 1], d[base + 2], d[base + 3]])
}

fn set_data_blkaddr_of(sb: &Superblock, page: &mut LockedPage, ofs: u32, addr: BlockAddr) {
    let base = if is_inode_page(page) {
        INODE_HEADER_SIZE + ofs as usize * 4
    } else {
        ofs as usize * 4
    };
    page.data_mut()[base..base + 4].copy_from_slice(&addr.to_le_bytes());
}

fn raw_inode_of(page: &LockedPage) -> LayoutVerified<&[u8], RawInode> {
    LayoutVerified::new_unaligned_from_prefix(page.data())
        .expect("inode header")
        .0
}

fn raw_inode_of_mut(page: &mut LockedPage) -> LayoutVerified<&mut [u8], RawInode> {
    LayoutVerified::new_unaligned_from_prefix(page.data_mut())
        .expect("inode header")
        .0
}

/// Data address slots usable in this inode's page.
pub fn addrs_per_inode(sb: &Superblock, inode: &Inode) -> u32 {
    if inode.inline_xattr() {
        sb.addrs_per_inode() - INLINE_XATTR_ADDRS as u32
    } else {
        sb.addrs_per_inode()
    }
}

/// Byte range of the inline xattr area at the tail of the slot region.
fn inline_xattr_range(sb: &Superblock) -> (usize, usize) {
    let end = INODE_HEADER_SIZE + sb.addrs_per_inode() as usize * 4;
    (end - INLINE_XATTR_ADDRS * 4, end)
}

/// Computes the node path to data block `block`: how many levels to walk,
/// the slot to take at each level, and each visited node's offset in the
/// tree. Offsets `offset[0] > addrs_per_inode` name the inode's five node
/// slots.
pub(crate) fn get_node_path(
    sb: &Superblock,
    inode: &Inode,
    block: u64,
    offset: &mut [u32; 4],
    noffset: &mut [u32; 4],
) -> usize {
    let direct_index = addrs_per_inode(sb, inode) as u64;
    let direct_blks = sb.addrs_per_block() as u64;
    let dptrs_per_blk = sb.nids_per_block() as u64;
    let indirect_blks = direct_blks * dptrs_per_blk;
    let dindirect_blks = indirect_blks * dptrs_per_blk;
    let api = addrs_per_inode(sb, inode);
    let mut block = block;

    noffset[0] = 0;
    if block < direct_index {
        offset[0] = block as u32;
        return 0;
    }
    block -= direct_index;
    if block < direct_blks {
        offset[0] = api + 1;
        noffset[1] = 1;
        offset[1] = block as u32;
        return 1;
    }
    block -= direct_blks;
    if block < direct_blks {
        offset[0] = api + 2;
        noffset[1] = 2;
        offset[1] = block as u32;
        return 1;
    }
    block -= direct_blks;
    if block < indirect_blks {
        offset[0] = api + 3;
        noffset[1] = 3;
        offset[1] = (block / direct_blks) as u32;
        noffset[2] = 4 + offset[1];
        offset[2] = (block % direct_blks) as u32;
        return 2;
    }
    block -= indirect_blks;
    if block < indirect_blks {
        offset[0] = api + 4;
        noffset[1] = 4 + dptrs_per_blk as u32;
        offset[1] = (block / direct_blks) as u32;
        noffset[2] = 5 + dptrs_per_blk as u32 + offset[1];
        offset[2] = (block % direct_blks) as u32;
        return 2;
    }
    block -= indirect_blks;
    if block < dindirect_blks {
        offset[0] = api + 5;
        noffset[1] = 5 + 2 * dptrs_per_blk as u32;
        offset[1] = (block / indirect_blks) as u32;
        noffset[2] = 6 + 2 * dptrs_per_blk as u32 + offset[1] * (dptrs_per_blk as u32 + 1);
        offset[2] = ((block / direct_blks) % dptrs_per_blk) as u32;
        noffset[3] = 7
            + 2 * dptrs_per_blk as u32
            + offset[1] * (dptrs_per_blk as u32 + 1)
            + offset[2];
        offset[3] = (block % direct_blks) as u32;
        return 3;
    }
    panic!("data block offset {} beyond double-indirect reach", block);
}

impl FsInfo {
    /// Index of the inode node-slot named by `offset0`, or None for a
    /// direct in-inode address.
    fn inode_slot_index(&self, inode: &Inode, offset0: u32) -> Option<usize> {
        let api = addrs_per_inode(self.sb(), inode);
        if offset0 > api {
            Some((offset0 - api - 1) as usize)
        } else {
            None
        }
    }

    /// Marks a node page dirty through the vtable.
    pub fn set_node_page_dirty(&self, page: &LockedPage) -> bool {
        let nid = nid_of_node(page);
        let space = self.node_space(nid);
        space.ops().set_dirty(self, page)
    }

    fn clear_node_page_dirty(&self, page: &LockedPage) {
        let nid = nid_of_node(page);
        let space = self.node_space(nid);
        space.clear_page_dirty_for_io(page);
        page.clear_uptodate();
    }

    /// Writes the inode bookkeeping into its node page.
    pub fn update_inode(&self, inode: &Inode, ipage: &mut LockedPage) {
        ipage.wait_on_writeback();
        {
            let mut ri = raw_inode_of_mut(ipage);
            ri.i_size.set(inode.size());
            ri.i_blocks.set(inode.blocks());
            ri.i_xattr_nid.set(inode.xattr_nid());
            let mut inline = 0;
            if inode.inline_xattr() {
                inline |= INLINE_XATTR_FLAG;
            }
            if inode.inline_data() {
                inline |= INLINE_DATA_FLAG;
            }
            ri.i_inline.set(inline);
        }
        self.set_node_page_dirty(ipage);
    }

    /// Re-reads the inode page and updates it.
    pub fn update_inode_page(&self, inode: &Inode) -> Result<()> {
        let mut ipage = self.get_node_page(inode.ino)?;
        self.update_inode(inode, &mut ipage);
        Ok(())
    }

    /// Pushes the inode state into whichever page of `dn` can take it.
    pub fn sync_inode_page(&self, dn: &mut Dnode<'_>) {
        let node_is_inode = dn
            .node_page
            .as_ref()
            .map_or(false, |p| is_inode_page(p));
        if node_is_inode {
            let page = dn.node_page.as_mut().unwrap();
            self.update_inode(dn.inode, page);
        } else if let Some(ip) = dn.inode_page.take() {
            let mut locked = ip.lock();
            self.update_inode(dn.inode, &mut locked);
            dn.inode_page = Some(locked.unlock());
        } else if let Err(e) = self.update_inode_page(dn.inode) {
            log::warn!("inode {} page update failed: {}", dn.inode.ino, e);
        }
    }

    /// Creates the node page for a freshly allocated NID: reserves node
    /// capacity, publishes `NEW_ADDR` in the NAT, and fills the footer.
    pub fn new_node_page(
        &self,
        dn: &mut Dnode<'_>,
        ofs: u32,
        ipage: Option<&mut LockedPage>,
    ) -> Result<LockedPage> {
        if dn.inode.no_alloc() {
            return Err(Error::Eperm);
        }
        let nid = dn.nid;
        let space = self.node_space(nid);
        // A failure below must not leave the fresh page dirty or uptodate;
        // its footer does not yet name this nid.
        let page = scopeguard::guard(space.grab_page(nid as u64), |page| {
            space.clear_page_dirty_for_io(&page);
            page.clear_uptodate();
        });

        if !self.inc_valid_node_count(Some(dn.inode), 1) {
            return Err(Error::Enospc);
        }

        let old_ni = match self.get_node_info(nid) {
            Ok(ni) => ni,
            Err(e) => {
                self.dec_valid_node_count(Some(dn.inode), 1);
                return Err(e);
            }
        };
        assert!(
            old_ni.blk_addr == NULL_ADDR,
            "new node page over live nid {} at {}",
            nid,
            old_ni.blk_addr
        );
        let mut new_ni = old_ni;
        new_ni.ino = dn.inode.ino;
        self.set_node_addr(&new_ni, NEW_ADDR, false);

        let mut page = ScopeGuard::into_inner(page);
        page.wait_on_writeback();
        fill_node_footer(&mut page, nid, dn.inode.ino, ofs, true);
        set_cold_node(dn.inode, &mut page);
        page.set_uptodate();
        self.set_node_page_dirty(&page);

        if has_xattr_block(ofs) {
            dn.inode.set_xattr_nid(nid);
        }

        if let Some(ip) = ipage {
            self.update_inode(dn.inode, ip);
        } else if is_inode_page(&page) {
            self.update_inode(dn.inode, &mut page);
        } else {
            self.sync_inode_page(dn);
        }
        if ofs == 0 {
            self.inc_valid_inode_count();
        }
        Ok(page)
    }

    /// Allocates the inode page itself (`nid == ino`, offset 0).
    pub fn new_inode_page(&self, inode: &Inode) -> Result<LockedPage> {
        let mut dn = Dnode::new(inode);
        dn.nid = inode.ino;
        self.new_node_page(&mut dn, 0, None)
    }

    /// Fills a locked node page from the device unless already uptodate.
    fn read_node_page_locked(&self, page: &mut LockedPage) -> Result<()> {
        if page.is_uptodate() {
            return Ok(());
        }
        let ni = self.get_node_info(page.index() as Nid)?;
        if ni.blk_addr == NULL_ADDR {
            page.clear_uptodate();
            return Err(Error::Enoent);
        }
        self.disk().read_block(ni.blk_addr, page.data_mut())?;
        page.set_uptodate();
        Ok(())
    }

    /// Returns the locked, validated node page of `nid`. Restarts when the
    /// page's address space changed underneath.
    pub fn get_node_page(&self, nid: Nid) -> Result<LockedPage> {
        loop {
            let space = self.node_space(nid);
            let mut page = space.grab_page(nid as u64);
            self.read_node_page_locked(&mut page)?;
            if !page.is_uptodate() || nid_of_node(&page) != nid {
                page.clear_uptodate();
                return Err(Error::Eio);
            }
            if !space.owns(&page) {
                drop(page);
                continue;
            }
            return Ok(page);
        }
    }

    /// Warms the cache with `nid`'s page; failures are deliberately
    /// swallowed, readahead is advisory.
    pub fn ra_node_page(&self, nid: Nid) {
        let space = self.node_space(nid);
        if let Some(p) = space.find_page(nid as u64) {
            if p.is_uptodate() {
                return;
            }
        }
        let mut page = space.grab_page(nid as u64);
        let _ = self.read_node_page_locked(&mut page);
    }

    /// As `get_node_page` for the child at `parent`'s slot `start`, plus
    /// readahead of the following siblings.
    pub fn get_node_page_ra(&self, parent: &LockedPage, start: usize) -> Result<LockedPage> {
        let sb = self.sb();
        let nid = get_nid(sb, parent, start, false);
        if nid == 0 {
            return Err(Error::Enoent);
        }
        let end = (start + MAX_RA_NODE).min(sb.nids_per_block() as usize);
        for i in start + 1..end {
            let sibling = get_nid(sb, parent, i, false);
            if sibling != 0 {
                self.ra_node_page(sibling);
            }
        }
        self.get_node_page(nid)
    }

    /// Walks the node tree of `dn.inode` down to the dnode covering data
    /// block `index`. In `AllocNode` mode, missing interior nodes are
    /// allocated on the way.
    pub fn get_dnode_of_data(
        &self,
        dn: &mut Dnode<'_>,
        index: u64,
        mode: LookupMode,
    ) -> Result<()> {
        let sb = self.sb().clone();
        let mut offset = [0u32; 4];
        let mut noffset = [0u32; 4];
        let level = get_node_path(&sb, dn.inode, index, &mut offset, &mut noffset);

        let mut nids = [0 as Nid; 4];
        nids[0] = dn.inode.ino;
        let inode_locked = match dn.inode_page.take() {
            Some(p) => p.lock(),
            None => self.get_node_page(nids[0])?,
        };

        // Any early exit below must release whatever pages the walk holds.
        let mut dn = scopeguard::guard(dn, |dn| dn.put());

        if dn.inode.inline_data() && index != 0 {
            drop(inode_locked);
            return Err(Error::Enoent);
        }

        if level == 0 {
            dn.nid = nids[0];
            dn.ofs_in_node = offset[0];
            dn.data_blkaddr = data_blkaddr_of(&sb, &inode_locked, dn.ofs_in_node);
            dn.node_page = Some(inode_locked);
            dn.inode_page = None;
            ScopeGuard::into_inner(dn);
            return Ok(());
        }

        let slot0 = self
            .inode_slot_index(dn.inode, offset[0])
            .expect("node slot");
        nids[1] = get_nid(&sb, &inode_locked, slot0, true);

        // The locked page one level above the one being fetched; starts as
        // the inode page.
        let mut parent = Some(inode_locked);

        for i in 1..=level {
            let mut page: Option<LockedPage> = None;

            if nids[i] == 0 && mode == LookupMode::AllocNode {
                let nid = match self.alloc_nid() {
                    Some(nid) => nid,
                    None => return Err(Error::Enospc),
                };
                nids[i] = nid;
                dn.nid = nid;
                let created = if i == 1 {
                    // The locked parent is the inode page; inode updates go
                    // through it rather than re-locking.
                    self.new_node_page(&mut **dn, noffset[i], parent.as_mut())
                } else {
                    self.new_node_page(&mut **dn, noffset[i], None)
                };
                match created {
                    Ok(p) => {
                        let par = parent.as_mut().expect("parent page");
                        if i == 1 {
                            self.set_nid(par, slot0, nid, true);
                        } else {
                            self.set_nid(par, offset[i - 1] as usize, nid, false);
                        }
                        self.alloc_nid_done(nid);
                        page = Some(p);
                    }
                    Err(e) => {
                        self.alloc_nid_failed(nid);
                        return Err(e);
                    }
                }
            } else if mode == LookupMode::LookupNodeRa && i == level && level > 1 {
                let par = parent.as_ref().expect("parent page");
                page = Some(self.get_node_page_ra(par, offset[i - 1] as usize)?);
            }

            // Release the parent; the inode page stays referenced unlocked
            // for inode-side updates further down.
            let released = parent.take().expect("parent page");
            if i == 1 {
                dn.inode_page = Some(released.unlock());
            } else {
                drop(released);
            }

            let page = match page {
                Some(p) => p,
                None => self.get_node_page(nids[i])?,
            };
            if i < level {
                nids[i + 1] = get_nid(&sb, &page, offset[i] as usize, false);
                parent = Some(page);
            } else {
                dn.nid = nids[level];
                dn.ofs_in_node = offset[level];
                dn.data_blkaddr = data_blkaddr_of(&sb, &page, dn.ofs_in_node);
                dn.node_page = Some(page);
            }
        }
        ScopeGuard::into_inner(dn);
        Ok(())
    }

    /// Writes a child NID slot and dirties the page.
    pub fn set_nid(&self, page: &mut LockedPage, off: usize, nid: Nid, in_inode: bool) {
        page.wait_on_writeback();
        put_nid(self.sb(), page, off, nid, in_inode);
        self.set_node_page_dirty(page);
    }

    /// Invalidates `count` data block addresses of the dnode starting at
    /// `dn.ofs_in_node`.
    pub fn truncate_data_blocks_range(&self, dn: &mut Dnode<'_>, count: u32) {
        let sb = self.sb().clone();
        let page = dn.node_page.as_mut().expect("dnode page");
        let mut freed = 0i64;
        for ofs in dn.ofs_in_node..dn.ofs_in_node + count {
            let addr = data_blkaddr_of(&sb, page, ofs);
            if addr == NULL_ADDR {
                continue;
            }
            set_data_blkaddr_of(&sb, page, ofs, NULL_ADDR);
            if addr != NEW_ADDR {
                self.alloc().invalidate_blocks(addr);
            }
            freed += 1;
        }
        if freed > 0 {
            dn.inode.add_blocks(-freed);
            self.set_node_page_dirty(page);
        }
    }

    /// Invalidates every data address of the dnode.
    pub fn truncate_data_blocks(&self, dn: &mut Dnode<'_>) {
        let page = dn.node_page.as_ref().expect("dnode page");
        let slots = if is_inode_page(page) {
            addrs_per_inode(self.sb(), dn.inode)
        } else {
            self.sb().addrs_per_block()
        };
        dn.ofs_in_node = 0;
        self.truncate_data_blocks_range(dn, slots);
    }

    /// Frees the node block `dn.nid`: invalidates its device block, takes
    /// the NAT entry to `NULL_ADDR`, and drops the page from the cache.
    fn truncate_node(&self, dn: &mut Dnode<'_>) -> Result<()> {
        let ni = self.get_node_info(dn.nid)?;
        if dn.inode.blocks() == 0 {
            assert!(ni.blk_addr == NULL_ADDR, "node {} has blocks", dn.nid);
        } else {
            assert!(ni.blk_addr != NULL_ADDR, "node {} already null", dn.nid);
            if ni.blk_addr != NEW_ADDR {
                self.alloc().invalidate_blocks(ni.blk_addr);
            }
            self.dec_valid_node_count(Some(dn.inode), 1);
            self.set_node_addr(&ni, NULL_ADDR, false);

            if dn.nid == dn.inode.ino {
                self.dec_valid_inode_count();
            } else {
                self.sync_inode_page(dn);
            }
        }

        let page = dn.node_page.take().expect("node page");
        self.clear_node_page_dirty(&page);
        let index = page.index();
        let nid = dn.nid;
        drop(page);
        self.node_space(nid).invalidate_pages(index, index);
        Ok(())
    }

    /// Frees one direct node and its data. Returns 1, the number of nodes
    /// freed, for the caller's offset bookkeeping.
    fn truncate_dnode(&self, dn: &mut Dnode<'_>) -> Result<u32> {
        if dn.nid == 0 {
            return Ok(1);
        }
        let page = match self.get_node_page(dn.nid) {
            Ok(p) => p,
            Err(Error::Enoent) => return Ok(1),
            Err(e) => return Err(e),
        };
        dn.node_page = Some(page);
        dn.ofs_in_node = 0;
        self.truncate_data_blocks(dn);
        self.truncate_node(dn)?;
        Ok(1)
    }

    /// Recursively frees the subtree below `dn.nid`, children first.
    /// Returns how many nodes were freed; freeing a whole (in)direct node
    /// reports `nids_per_block + 1` so the caller can clear its slot.
    fn truncate_nodes(&self, dn: &mut Dnode<'_>, nofs: u32, ofs: u32, depth: u32) -> Result<u32> {
        let sb = self.sb().clone();
        let npb = sb.nids_per_block();
        if dn.nid == 0 {
            return Ok(npb + 1);
        }
        let mut page = self.get_node_page(dn.nid)?;
        let mut freed = 0u32;

        if depth < 3 {
            for i in ofs..npb {
                let child_nid = get_nid(&sb, &page, i as usize, false);
                if child_nid == 0 {
                    freed += 1;
                    continue;
                }
                let mut rdn = Dnode::new(dn.inode);
                rdn.nid = child_nid;
                match self.truncate_dnode(&mut rdn) {
                    Ok(_) => {}
                    Err(e) => {
                        drop(page);
                        return Err(e);
                    }
                }
                self.set_nid(&mut page, i as usize, 0, false);
                freed += 1;
            }
        } else {
            let mut child_nofs = nofs + ofs * (npb + 1) + 1;
            for i in ofs..npb {
                let child_nid = get_nid(&sb, &page, i as usize, false);
                if child_nid == 0 {
                    child_nofs += npb + 1;
                    continue;
                }
                let mut rdn = Dnode::new(dn.inode);
                rdn.nid = child_nid;
                match self.truncate_nodes(&mut rdn, child_nofs, 0, depth - 1) {
                    Ok(n) if n == npb + 1 => {
                        self.set_nid(&mut page, i as usize, 0, false);
                        child_nofs += n;
                    }
                    Ok(_) | Err(Error::Enoent) => {}
                    Err(e) => {
                        drop(page);
                        return Err(e);
                    }
                }
            }
            freed = child_nofs;
        }

        if ofs == 0 {
            // Remove this indirect node as well.
            dn.node_page = Some(page);
            self.truncate_node(dn)?;
            freed += 1;
        } else {
            drop(page);
        }
        Ok(freed)
    }

    /// Frees the direct nodes hanging off a partially covered indirect
    /// chain, then the chain nodes themselves when fully emptied.
    fn truncate_partial_nodes(
        &self,
        dn: &mut Dnode<'_>,
        ipage: &PageRef,
        offset: &mut [u32; 4],
        depth: usize,
    ) -> Result<()> {
        let sb = self.sb().clone();
        let npb = sb.nids_per_block();
        let idx = depth - 2;
        let mut nids = [0 as Nid; 3];
        let slot = self
            .inode_slot_index(dn.inode, offset[0])
            .expect("node slot");
        nids[0] = {
            let locked = ipage.clone().lock();
            get_nid(&sb, &locked, slot, true)
        };
        if nids[0] == 0 {
            return Ok(());
        }

        let mut pages: Vec<LockedPage> = Vec::new();
        for i in 0..idx + 1 {
            match self.get_node_page(nids[i]) {
                Ok(p) => {
                    nids[i + 1] = get_nid(&sb, &p, offset[i + 1] as usize, false);
                    pages.push(p);
                }
                Err(e) => return Err(e),
            }
        }

        // Free direct nodes linked through the partial indirect node.
        for i in offset[idx + 1]..npb {
            let child_nid = get_nid(&sb, &pages[idx], i as usize, false);
            if child_nid == 0 {
                continue;
            }
            dn.nid = child_nid;
            self.truncate_dnode(dn)?;
            self.set_nid(&mut pages[idx], i as usize, 0, false);
        }

        if offset[idx + 1] == 0 {
            dn.node_page = Some(pages.pop().expect("partial page"));
            dn.nid = nids[idx];
            self.truncate_node(dn)?;
        }
        offset[idx] += 1;
        offset[idx + 1] = 0;
        Ok(())
    }

    /// Truncates the inode's node tree from data block `from` on. All the
    /// removed nodes go to `NULL_ADDR` in the NAT, bottom-up, partial
    /// subtrees first.
    pub fn truncate_inode_blocks(&self, inode: &Inode, from: u64) -> Result<()> {
        let sb = self.sb().clone();
        let mut offset = [0u32; 4];
        let mut noffset = [0u32; 4];
        let level = get_node_path(&sb, inode, from, &mut offset, &mut noffset);
        let npb = sb.nids_per_block();

        'restart: loop {
            let page = self.get_node_page(inode.ino)?;
            let page = page.unlock();

            let mut dn = Dnode::new(inode);
            dn.inode_page = Some(page.clone());

            let mut nofs;
            match level {
                0 | 1 => {
                    nofs = noffset[1];
                }
                2 => {
                    nofs = noffset[1];
                    if offset[level - 1] != 0 {
                        let r = self.truncate_partial_nodes(&mut dn, &page, &mut offset, level);
                        match r {
                            Ok(()) | Err(Error::Enoent) => {}
                            Err(e) => return Err(e),
                        }
                        nofs += 1 + npb;
                    }
                }
                3 => {
                    nofs = 5 + 2 * npb;
                    if offset[level - 1] != 0 {
                        let r = self.truncate_partial_nodes(&mut dn, &page, &mut offset, level);
                        match r {
                            Ok(()) | Err(Error::Enoent) => {}
                            Err(e) => return Err(e),
                        }
                    }
                }
                _ => unreachable!("node path depth"),
            }

            let mut cont = true;
            while cont {
                let slot = match self.inode_slot_index(inode, offset[0]) {
                    Some(s) => s,
                    None => break,
                };
                {
                    let locked = page.clone().lock();
                    dn.nid = get_nid(&sb, &locked, slot, true);
                }
                let api = addrs_per_inode(&sb, inode);
                let err = if offset[0] == api + 1 || offset[0] == api + 2 {
                    self.truncate_dnode(&mut dn)
                } else if offset[0] == api + 3 || offset[0] == api + 4 {
                    self.truncate_nodes(&mut dn, nofs, offset[1], 2)
                } else if offset[0] == api + 5 {
                    cont = false;
                    self.truncate_nodes(&mut dn, nofs, offset[1], 3)
                } else {
                    unreachable!("inode slot offset")
                };
                let freed = match err {
                    Ok(n) => n,
                    Err(Error::Enoent) => 0,
                    Err(e) => return Err(e),
                };
                if offset[1] == 0 {
                    let mut locked = page.clone().lock();
                    if !self.node_space(inode.ino).owns(&locked) {
                        drop(locked);
                        continue 'restart;
                    }
                    if get_nid(&sb, &locked, slot, true) != 0 {
                        locked.wait_on_writeback();
                        put_nid(&sb, &mut locked, slot, 0, true);
                        self.set_node_page_dirty(&locked);
                    }
                }
                offset[1] = 0;
                offset[0] += 1;
                nofs += freed;
            }
            return Ok(());
        }
    }

    /// Drops the inode's xattr node, if any.
    pub fn truncate_xattr_node(
        &self,
        inode: &Inode,
        ipage: Option<PageRef>,
    ) -> Result<()> {
        let nid = inode.xattr_nid();
        if nid == 0 {
            return Ok(());
        }
        let npage = self.get_node_page(nid)?;
        inode.set_xattr_nid(0);

        let mut dn = Dnode::new(inode);
        dn.nid = nid;
        dn.inode_page = ipage;
        dn.node_page = Some(npage);
        self.truncate_node(&mut dn)
    }

    /// Removes the inode page and anything still hanging off it. The caller
    /// holds the mutator side of the checkpoint fence.
    pub fn remove_inode_page(&self, inode: &Inode) -> Result<()> {
        let mut dn = Dnode::new(inode);
        self.get_dnode_of_data(&mut dn, 0, LookupMode::LookupNode)?;

        // The inode page doubles as dnode 0. Release its lock around the
        // xattr truncation, whose inode-side sync relocks it.
        let ipage_ref = dn.node_page.take().expect("inode page").unlock();
        if let Err(e) = self.truncate_xattr_node(inode, Some(ipage_ref.clone())) {
            dn.put();
            return Err(e);
        }
        dn.node_page = Some(ipage_ref.lock());

        self.truncate_data_blocks_range(&mut dn, 1);
        assert!(
            inode.blocks() == 0 || inode.blocks() == 1,
            "inode {} holds {} blocks at removal",
            inode.ino,
            inode.blocks()
        );
        self.truncate_node(&mut dn)
    }

    /// Frees the partial dnode covering data block `free_from`, then hands
    /// the rest of the tree to `truncate_inode_blocks`, which expects a
    /// dnode-aligned starting point.
    pub fn truncate_blocks(&self, inode: &Inode, free_from: u64) -> Result<()> {
        let sb = self.sb().clone();
        let mut from = free_from;
        let mut dn = Dnode::new(inode);
        match self.get_dnode_of_data(&mut dn, free_from, LookupMode::LookupNodeRa) {
            Ok(()) => {
                let page = dn.node_page.as_ref().expect("dnode page");
                let count = if is_inode_page(page) {
                    addrs_per_inode(&sb, inode)
                } else {
                    sb.addrs_per_block()
                } - dn.ofs_in_node;
                if dn.ofs_in_node != 0 || dn.node_page.as_ref().map_or(false, is_inode_page) {
                    self.truncate_data_blocks_range(&mut dn, count);
                    from += count as u64;
                }
                dn.put();
            }
            Err(Error::Enoent) => {}
            Err(e) => return Err(e),
        }
        self.truncate_inode_blocks(inode, from)
    }

    /// Writes back dirty node pages in three passes: indirect nodes first,
    /// then dentry dnodes, then file dnodes. With `ino` nonzero (fsync),
    /// only that inode's dnodes are written and they carry the fsync mark;
    /// the inode page additionally carries the dentry mark when its dentry
    /// work is not yet safe. Returns the number of fsync-marked pages.
    pub fn sync_node_pages(
        &self,
        ino: Ino,
        cell: Option<usize>,
        wbc: &mut WritebackControl,
    ) -> Result<usize> {
        let sb = self.sb().clone();
        let mut nwritten = 0usize;
        let spaces: Vec<usize> = match cell {
            Some(i) => vec![i],
            None => (0..self.nm().s_nat).collect(),
        };

        let mut step = if ino != 0 { 2 } else { 0 };
        loop {
            for &si in &spaces {
                let space = self.node_space_by_idx(si);
                let mut index = 0u64;
                loop {
                    let pvec = space.lookup_tag(PageTag::Dirty, &mut index);
                    if pvec.is_empty() {
                        break;
                    }
                    for pref in pvec {
                        // An fsync must not skip its own pages; background
                        // writeback gives up on contended ones.
                        let mut page = if ino != 0 {
                            pref.lock()
                        } else {
                            match pref.try_lock() {
                                Ok(p) => p,
                                Err(_) => continue,
                            }
                        };
                        if !space.owns(&page) {
                            continue;
                        }
                        // Flushing sequence: 0 indirect nodes, 1 dentry
                        // dnodes, 2 file dnodes.
                        let dnode = is_dnode(&sb, &page);
                        if step == 0 && dnode {
                            continue;
                        }
                        if step == 1 && (!dnode || is_cold_node(&page)) {
                            continue;
                        }
                        if step == 2 && (!dnode || !is_cold_node(&page)) {
                            continue;
                        }
                        if ino != 0 && ino_of_node(&page) != ino {
                            continue;
                        }
                        if !page.is_dirty() {
                            // Someone wrote it for us.
                            continue;
                        }
                        if !space.clear_page_dirty_for_io(&page) {
                            continue;
                        }

                        if ino != 0 && dnode {
                            set_fsync_mark(&mut page, true);
                            if is_inode_page(&page) {
                                let mark = self.need_dentry_mark(ino);
                                set_dentry_mark(&mut page, mark);
                            }
                            nwritten += 1;
                        } else {
                            set_fsync_mark(&mut page, false);
                            set_dentry_mark(&mut page, false);
                        }

                        if let Err(e) = space.ops().write_page(self, page, wbc) {
                            log::warn!("node page writeback failed: {}", e);
                        }

                        wbc.nr_to_write -= 1;
                        if wbc.nr_to_write == 0 {
                            break;
                        }
                    }
                    if wbc.nr_to_write == 0 {
                        break;
                    }
                }
                if wbc.nr_to_write == 0 {
                    break;
                }
            }
            if wbc.nr_to_write == 0 || step == 2 {
                break;
            }
            step += 1;
        }
        Ok(nwritten)
    }

    /// Waits for `ino`'s node pages to leave writeback; surfaces any page
    /// or address-space error as EIO/ENOSPC.
    pub fn wait_on_node_pages_writeback(&self, ino: Ino) -> Result<()> {
        let mut ret = Ok(());
        for si in 0..self.nm().s_nat {
            let space = self.node_space_by_idx(si);
            let mut index = 0u64;
            loop {
                let pvec = space.lookup_tag(PageTag::Writeback, &mut index);
                if pvec.is_empty() {
                    break;
                }
                for pref in pvec {
                    pref.wait_on_writeback();
                    if pref.test_clear_error() {
                        ret = Err(Error::Eio);
                    }
                }
            }
            if space.test_clear_enospc() && ret.is_ok() {
                ret = Err(Error::Enospc);
            }
            if space.test_clear_eio() && ret.is_ok() {
                ret = Err(Error::Eio);
            }
        }
        ret
    }

    /// Writes one node page to a freshly allocated block and publishes the
    /// new address. The node-write fence is held for read across the write;
    /// reclaim-driven calls back off instead of blocking on it.
    pub(crate) fn write_node_page_locked(
        &self,
        mut page: LockedPage,
        wbc: &mut WritebackControl,
    ) -> Result<WriteOutcome> {
        let nid = nid_of_node(&page);
        let space = self.node_space(nid);

        if self.is_por_doing() || self.cp_error() {
            space.set_page_dirty_raw(&page);
            return Ok(WriteOutcome::Redirtied);
        }

        page.wait_on_writeback();
        assert!(page.index() == nid as u64, "node page index mismatch");
        let ni = self.get_node_info(nid)?;

        // Already truncated.
        if ni.blk_addr == NULL_ADDR {
            page.clear_uptodate();
            return Ok(WriteOutcome::Written);
        }

        let _fence = if wbc.for_reclaim {
            match self.node_write_fence().try_read() {
                Some(g) => g,
                None => {
                    space.set_page_dirty_raw(&page);
                    return Ok(WriteOutcome::Redirtied);
                }
            }
        } else {
            self.node_write_fence().read()
        };

        space.set_page_writeback(&page);
        let new_addr = match self.alloc().allocate_block() {
            Ok(a) => a,
            Err(e) => {
                space.end_page_writeback(&page);
                space.set_enospc();
                space.set_page_dirty_raw(&page);
                return Err(e);
            }
        };
        {
            let mut f = footer_of_mut(page.data_mut());
            f.cp_ver.set(self.cp_ver());
            f.next_blkaddr.set(new_addr + 1);
        }
        if let Err(e) = self.disk().write_block(new_addr, page.data()) {
            space.end_page_writeback(&page);
            page.set_error();
            space.set_eio();
            self.set_cp_error();
            space.set_page_dirty_raw(&page);
            return Err(e);
        }
        self.alloc().refresh_sit_entry(ni.blk_addr, new_addr);
        space.end_page_writeback(&page);
        self.set_node_addr(&ni, new_addr, is_fsync_dnode(&page));
        Ok(WriteOutcome::Written)
    }

    // Recovery helpers. These run while the place-of-recovery flag is set,
    // replaying node pages salvaged from the log tail.

    /// Rebuilds the inode page of a node page found during recovery.
    pub fn recover_inode_page(&self, page: &LockedPage) -> Result<()> {
        let ino = ino_of_node(page);
        let old_ni = self.get_node_info(ino)?;
        if old_ni.blk_addr != NULL_ADDR {
            return Err(Error::Einval);
        }
        let space = self.node_space(ino);
        let mut ipage = space.grab_page(ino as u64);

        // This inode must not come back out of the free pool.
        self.remove_free_nid(ino);

        ipage.set_uptodate();
        fill_node_footer(&mut ipage, ino, ino, 0, true);

        // Carry the source header over, then reset the derived fields.
        let hdr = {
            let mut hdr = [0u8; INODE_HEADER_SIZE];
            hdr.copy_from_slice(&page.data()[..INODE_HEADER_SIZE]);
            hdr
        };
        ipage.data_mut()[..INODE_HEADER_SIZE].copy_from_slice(&hdr);
        {
            let mut ri = raw_inode_of_mut(&mut ipage);
            ri.i_size.set(0);
            ri.i_blocks.set(1);
            ri.i_xattr_nid.set(0);
            let inline = ri.i_inline.get() & INLINE_XATTR_FLAG;
            ri.i_inline.set(inline);
        }

        let mut new_ni = old_ni;
        new_ni.ino = ino;
        if !self.inc_valid_node_count(None, 1) {
            log::warn!("node count budget exceeded recovering inode {}", ino);
        }
        self.set_node_addr(&new_ni, NEW_ADDR, false);
        self.inc_valid_inode_count();
        self.set_node_page_dirty(&ipage);
        Ok(())
    }

    /// Copies the inline xattr area of a recovered node page into the
    /// inode page.
    pub fn recover_inline_xattr(&self, inode: &Inode, page: &LockedPage) -> Result<()> {
        let mut ipage = self.get_node_page(inode.ino)?;

        let src_inline = {
            let ri = raw_inode_of(page);
            ri.i_inline.get()
        };
        if src_inline & INLINE_XATTR_FLAG != 0 {
            let (lo, hi) = inline_xattr_range(self.sb());
            let src = {
                let mut buf = vec![0u8; hi - lo];
                buf.copy_from_slice(&page.data()[lo..hi]);
                buf
            };
            ipage.wait_on_writeback();
            ipage.data_mut()[lo..hi].copy_from_slice(&src);
        } else {
            inode.set_inline_xattr(false);
        }
        self.update_inode(inode, &mut ipage);
        Ok(())
    }

    /// Re-attaches a recovered xattr node at `blkaddr`, dropping any
    /// previous xattr node of the inode.
    pub fn recover_xattr_data(
        &self,
        inode: &Inode,
        page: &LockedPage,
        blkaddr: BlockAddr,
    ) -> Result<()> {
        let prev_xnid = inode.xattr_nid();
        let new_xnid = nid_of_node(page);

        // 1: invalidate the previous xattr nid.
        if prev_xnid != 0 {
            let ni = self.get_node_info(prev_xnid)?;
            assert!(ni.blk_addr != NULL_ADDR, "xattr node {} null", prev_xnid);
            if ni.blk_addr != NEW_ADDR {
                self.alloc().invalidate_blocks(ni.blk_addr);
            }
            self.dec_valid_node_count(Some(inode), 1);
            self.set_node_addr(&ni, NULL_ADDR, false);
        }

        // 2: reserve the new xattr nid.
        if !self.inc_valid_node_count(Some(inode), 1) {
            return Err(Error::Enospc);
        }
        self.remove_free_nid(new_xnid);
        let mut ni = self.get_node_info(new_xnid)?;
        ni.ino = inode.ino;
        self.set_node_addr(&ni, NEW_ADDR, false);
        inode.set_xattr_nid(new_xnid);

        // 3: publish the recovered block address.
        self.alloc().refresh_sit_entry(NEW_ADDR, blkaddr);
        ni.blk_addr = NEW_ADDR;
        self.set_node_addr(&ni, blkaddr, false);

        self.update_inode_page(inode)
    }

    /// Collects the owning NID of every block in node segment `segno`, in
    /// block order, for summary reconstruction.
    pub fn restore_node_summary(&self, segno: u32, out: &mut Vec<Nid>) -> Result<()> {
        let sb = self.sb().clone();
        let start = sb.seg_start_block(segno);
        let last = sb.blocks_per_seg();
        self.ra_meta_pages(start, last)?;
        for i in 0..last {
            let addr = start + i;
            let page = self.get_meta_page(addr)?;
            let nid = {
                let data = page.data();
                let off = data.len() - NODE_FOOTER_SIZE;
                u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
            };
            out.push(nid);
        }
        self.meta().invalidate_pages(start as u64, (start + last - 1) as u64);
        Ok(())
    }
}

/// Writeback vtable of the per-cell node address spaces.
pub struct NodeAops {
    /// Which file cell this space serves.
    pub cell: usize,
}

impl AddressSpaceOps for NodeAops {
    fn write_page(
        &self,
        fs: &FsInfo,
        page: LockedPage,
        wbc: &mut WritebackControl,
    ) -> Result<WriteOutcome> {
        fs.write_node_page_locked(page, wbc)
    }

    fn write_pages(&self, fs: &FsInfo, wbc: &mut WritebackControl) -> Result<usize> {
        let space = fs.node_space_by_idx(self.cell);
        // Collect a batch before bothering the device, unless syncing.
        if !wbc.sync && space.dirty_page_count() < PAGEVEC_SIZE {
            return Ok(0);
        }
        fs.sync_node_pages(0, Some(self.cell), wbc)
    }

    fn set_dirty(&self, fs: &FsInfo, page: &LockedPage) -> bool {
        page.set_uptodate();
        let space = fs.node_space_by_idx(self.cell);
        space.set_page_dirty_raw(page)
    }

    fn invalidate_page(&self, fs: &FsInfo, page: &PageRef) {
        let space = fs.node_space_by_idx(self.cell);
        space.invalidate_pages(page.index(), page.index());
    }

    fn release_page(&self, _fs: &FsInfo, page: &PageRef) -> bool {
        !page.is_dirty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemDisk;
    use crate::superblock::{format, Geometry};

    fn toy_sb() -> Superblock {
        let disk = MemDisk::new(512, 128);
        format(&disk, &Geometry::toy()).unwrap()
    }

    #[test]
    fn node_path_levels() {
        let sb = toy_sb();
        let inode = Inode::new(5);
        let api = addrs_per_inode(&sb, &inode) as u64;
        let direct = sb.addrs_per_block() as u64;
        let nids = sb.nids_per_block() as u64;
        let mut offset = [0u32; 4];
        let mut noffset = [0u32; 4];

        assert_eq!(get_node_path(&sb, &inode, 0, &mut offset, &mut noffset), 0);
        assert_eq!(offset[0], 0);

        assert_eq!(
            get_node_path(&sb, &inode, api, &mut offset, &mut noffset),
            1
        );
        assert_eq!(offset[0], api as u32 + 1);
        assert_eq!(offset[1], 0);

        assert_eq!(
            get_node_path(&sb, &inode, api + direct, &mut offset, &mut noffset),
            1
        );
        assert_eq!(offset[0], api as u32 + 2);

        assert_eq!(
            get_node_path(&sb, &inode, api + 2 * direct, &mut offset, &mut noffset),
            2
        );
        assert_eq!(offset[0], api as u32 + 3);
        assert_eq!(noffset[1], 3);

        let dind_start = api + 2 * direct + 2 * direct * nids;
        assert_eq!(
            get_node_path(&sb, &inode, dind_start, &mut offset, &mut noffset),
            3
        );
        assert_eq!(offset[0], api as u32 + 5);
        assert_eq!(offset[1], 0);
        assert_eq!(offset[3], 0);
    }

    #[test]
    #[should_panic]
    fn node_path_beyond_reach_panics() {
        let sb = toy_sb();
        let inode = Inode::new(5);
        let mut offset = [0u32; 4];
        let mut noffset = [0u32; 4];
        get_node_path(&sb, &inode, u64::MAX / 2, &mut offset, &mut noffset);
    }

    #[test]
    fn inline_xattr_shrinks_direct_range() {
        let sb = toy_sb();
        let inode = Inode::new(5);
        let plain = addrs_per_inode(&sb, &inode);
        inode.set_inline_xattr(true);
        assert_eq!(
            addrs_per_inode(&sb, &inode),
            plain - INLINE_XATTR_ADDRS as u32
        );
    }

    #[test]
    fn footer_round_trip() {
        let sb = toy_sb();
        let space = crate::page::AddressSpace::new(
            sb.block_size(),
            Box::new(NodeAops { cell: 0 }),
        );
        let mut page = space.grab_page(7);
        fill_node_footer(&mut page, 7, 3, 2, true);
        assert_eq!(nid_of_node(&page), 7);
        assert_eq!(ino_of_node(&page), 3);
        assert_eq!(ofs_of_node(&page), 2);
        assert!(!is_inode_page(&page));
        set_fsync_mark(&mut page, true);
        assert!(is_fsync_dnode(&page));
        assert_eq!(ofs_of_node(&page), 2);
        set_fsync_mark(&mut page, false);
        assert!(!is_fsync_dnode(&page));
    }

    #[test]
    fn dnode_classification() {
        let sb = toy_sb();
        let space = crate::page::AddressSpace::new(
            sb.block_size(),
            Box::new(NodeAops { cell: 0 }),
        );
        let npb = sb.nids_per_block();
        let mut page = space.grab_page(9);
        // Inode and direct nodes are dnodes.
        fill_node_footer(&mut page, 9, 9, 0, true);
        assert!(is_dnode(&sb, &page));
        fill_node_footer(&mut page, 9, 3, 1, true);
        assert!(is_dnode(&sb, &page));
        // Indirect nodes are not.
        fill_node_footer(&mut page, 9, 3, 3, true);
        assert!(!is_dnode(&sb, &page));
        fill_node_footer(&mut page, 9, 3, 4 + npb, true);
        assert!(!is_dnode(&sb, &page));
        fill_node_footer(&mut page, 9, 3, 5 + 2 * npb, true);
        assert!(!is_dnode(&sb, &page));
        // First direct node under the double-indirect chain is.
        fill_node_footer(&mut page, 9, 3, 7 + 2 * npb, true);
        assert!(is_dnode(&sb, &page));
        // An xattr node never is.
        fill_node_footer(&mut page, 9, 3, XATTR_NODE_OFFSET, true);
        assert!(!is_dnode(&sb, &page));
    }
}
