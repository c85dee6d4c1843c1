//! On-device geometry.
//!
//! Disk layout:
//! ```text
//! [ super block | checkpoint | summary | NAT area (pairs A/B) | main area ]
//! ```
//!
//! The NAT area holds `nat_blocks` pairs; for each pair the checkpoint's NAT
//! bitmap says whether copy A or copy B is current. Everything that depends
//! on the block size (records per NAT block, address slots per node page,
//! journal capacity) is derived here once at mount.

use core::mem;

use static_assertions::const_assert;
use zerocopy::byteorder::{LittleEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

use crate::disk::BlockDevice;
use crate::error::{Error, Result};
use crate::param::{
    BlockAddr, Nid, INODE_HEADER_SIZE, NAT_ENTRY_SIZE, NAT_JOURNAL_ENTRY_SIZE, NIDS_PER_INODE,
    NODE_FOOTER_SIZE, RESERVED_NODE_COUNT, SUM_JOURNAL_HEADER,
};

type Le32 = U32<LittleEndian>;
type Le64 = U64<LittleEndian>;

const SB_MAGIC: u32 = 0xf5f2_c311;

/// Raw superblock record at block 0.
#[repr(C)]
#[derive(AsBytes, FromBytes, Unaligned)]
pub struct RawSuperblock {
    magic: Le32,
    block_size: Le32,
    log_nats_per_block: Le32,
    nat_blocks: Le32,
    blocks_per_seg: Le32,
    cp_blkaddr: Le32,
    sum_blkaddr: Le32,
    nat_blkaddr: Le32,
    main_blkaddr: Le32,
    total_blocks: Le32,
}

const_assert!(mem::size_of::<RawSuperblock>() == 40);

/// Raw checkpoint header; the NAT bitmap bytes follow it in the same block.
#[repr(C)]
#[derive(AsBytes, FromBytes, Unaligned)]
pub struct RawCheckpoint {
    cp_ver: Le64,
    next_free_nid: Le32,
    next_free_block: Le32,
    valid_node_count: Le32,
    valid_inode_count: Le32,
    nat_bitmap_bytes: Le32,
}

const_assert!(mem::size_of::<RawCheckpoint>() == 28);

/// Mount-time geometry requested by mkfs.
#[derive(Clone)]
pub struct Geometry {
    pub block_size: usize,
    pub log_nats_per_block: u32,
    pub nat_blocks: u32,
    pub blocks_per_seg: u32,
    pub total_blocks: u32,
}

impl Geometry {
    /// A small layout for exercising every path quickly: 8 NAT records per
    /// block, 4 NAT block pairs, so 32 NIDs in total.
    pub fn toy() -> Self {
        Self {
            block_size: 128,
            log_nats_per_block: 3,
            nat_blocks: 4,
            blocks_per_seg: 4,
            total_blocks: 512,
        }
    }
}

/// Decoded, validated superblock.
#[derive(Clone)]
pub struct Superblock {
    block_size: usize,
    log_nats_per_block: u32,
    nat_blocks: u32,
    blocks_per_seg: u32,
    cp_blkaddr: BlockAddr,
    sum_blkaddr: BlockAddr,
    nat_blkaddr: BlockAddr,
    main_blkaddr: BlockAddr,
    total_blocks: u32,
}

impl Superblock {
    fn from_raw(raw: &RawSuperblock) -> Result<Self> {
        if raw.magic.get() != SB_MAGIC {
            return Err(Error::Einval);
        }
        let sb = Self {
            block_size: raw.block_size.get() as usize,
            log_nats_per_block: raw.log_nats_per_block.get(),
            nat_blocks: raw.nat_blocks.get(),
            blocks_per_seg: raw.blocks_per_seg.get(),
            cp_blkaddr: raw.cp_blkaddr.get(),
            sum_blkaddr: raw.sum_blkaddr.get(),
            nat_blkaddr: raw.nat_blkaddr.get(),
            main_blkaddr: raw.main_blkaddr.get(),
            total_blocks: raw.total_blocks.get(),
        };
        if !sb.block_size.is_power_of_two()
            || sb.nats_per_block() as usize * NAT_ENTRY_SIZE > sb.block_size
            || sb.nat_bitmap_bytes() + mem::size_of::<RawCheckpoint>() > sb.block_size
            || sb.main_blkaddr >= sb.total_blocks
        {
            return Err(Error::Einval);
        }
        Ok(sb)
    }

    fn to_raw(&self) -> RawSuperblock {
        RawSuperblock {
            magic: Le32::new(SB_MAGIC),
            block_size: Le32::new(self.block_size as u32),
            log_nats_per_block: Le32::new(self.log_nats_per_block),
            nat_blocks: Le32::new(self.nat_blocks),
            blocks_per_seg: Le32::new(self.blocks_per_seg),
            cp_blkaddr: Le32::new(self.cp_blkaddr),
            sum_blkaddr: Le32::new(self.sum_blkaddr),
            nat_blkaddr: Le32::new(self.nat_blkaddr),
            main_blkaddr: Le32::new(self.main_blkaddr),
            total_blocks: Le32::new(self.total_blocks),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn log_nats_per_block(&self) -> u32 {
        self.log_nats_per_block
    }

    pub fn nats_per_block(&self) -> u32 {
        1 << self.log_nats_per_block
    }

    pub fn nat_blocks(&self) -> u32 {
        self.nat_blocks
    }

    pub fn blocks_per_seg(&self) -> u32 {
        self.blocks_per_seg
    }

    pub fn max_nid(&self) -> Nid {
        self.nats_per_block() * self.nat_blocks
    }

    pub fn available_nids(&self) -> u32 {
        self.max_nid() - RESERVED_NODE_COUNT
    }

    pub fn cp_blkaddr(&self) -> BlockAddr {
        self.cp_blkaddr
    }

    pub fn sum_blkaddr(&self) -> BlockAddr {
        self.sum_blkaddr
    }

    pub fn nat_blkaddr(&self) -> BlockAddr {
        self.nat_blkaddr
    }

    pub fn main_blkaddr(&self) -> BlockAddr {
        self.main_blkaddr
    }

    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    /// Bytes of node-page payload preceding the footer.
    pub fn node_payload(&self) -> usize {
        self.block_size - NODE_FOOTER_SIZE
    }

    /// Address slots in a direct-node page.
    pub fn addrs_per_block(&self) -> u32 {
        (self.node_payload() / 4) as u32
    }

    /// NID slots in an indirect-node page.
    pub fn nids_per_block(&self) -> u32 {
        (self.node_payload() / 4) as u32
    }

    /// Address slots in an inode page.
    pub fn addrs_per_inode(&self) -> u32 {
        ((self.node_payload() - INODE_HEADER_SIZE - NIDS_PER_INODE * 4) / 4) as u32
    }

    /// NAT journal records that fit in the summary block.
    pub fn max_nat_jentries(&self) -> usize {
        (self.block_size - SUM_JOURNAL_HEADER) / NAT_JOURNAL_ENTRY_SIZE
    }

    pub fn nat_bitmap_bytes(&self) -> usize {
        (self.nat_blocks as usize + 7) / 8
    }

    /// NAT block pair index covering `nid`.
    pub fn nat_block_offset(&self, nid: Nid) -> u32 {
        nid >> self.log_nats_per_block
    }

    /// First NID of the NAT block covering `nid`.
    pub fn start_nid(&self, nid: Nid) -> Nid {
        (nid >> self.log_nats_per_block) << self.log_nats_per_block
    }

    /// Device address of a NAT block copy: `which` selects A or B.
    pub fn nat_copy_addr(&self, block_off: u32, which: bool) -> BlockAddr {
        self.nat_blkaddr + block_off * 2 + which as u32
    }

    /// First block of segment `segno` in the main area.
    pub fn seg_start_block(&self, segno: u32) -> BlockAddr {
        self.main_blkaddr + segno * self.blocks_per_seg
    }
}

/// In-memory image of the checkpoint block.
pub struct CheckpointPack {
    pub cp_ver: u64,
    pub next_free_nid: Nid,
    pub next_free_block: BlockAddr,
    pub valid_node_count: u32,
    pub valid_inode_count: u32,
    pub nat_bitmap: Vec<u8>,
}

/// Formats `disk` with an empty filesystem: every NAT record null, an empty
/// journal, and the whole NID space free.
pub fn format(disk: &dyn BlockDevice, geo: &Geometry) -> Result<Superblock> {
    let nat_blkaddr = 3;
    let sb = Superblock {
        block_size: geo.block_size,
        log_nats_per_block: geo.log_nats_per_block,
        nat_blocks: geo.nat_blocks,
        blocks_per_seg: geo.blocks_per_seg,
        cp_blkaddr: 1,
        sum_blkaddr: 2,
        nat_blkaddr,
        main_blkaddr: nat_blkaddr + geo.nat_blocks * 2,
        total_blocks: geo.total_blocks,
    };
    // Re-validate through the mount path so mkfs cannot produce a layout
    // the mount would reject.
    let sb = Superblock::from_raw(&sb.to_raw())?;

    let zero = vec![0u8; geo.block_size];
    for addr in 0..sb.main_blkaddr {
        disk.write_block(addr, &zero)?;
    }

    let mut block = vec![0u8; geo.block_size];
    sb.to_raw().write_to_prefix(&mut block[..]).ok_or(Error::Einval)?;
    disk.write_block(0, &block)?;

    let cp = CheckpointPack {
        cp_ver: 1,
        next_free_nid: RESERVED_NODE_COUNT,
        next_free_block: sb.main_blkaddr,
        valid_node_count: 0,
        valid_inode_count: 0,
        nat_bitmap: vec![0u8; sb.nat_bitmap_bytes()],
    };
    write_checkpoint_pack(disk, &sb, &cp)?;
    Ok(sb)
}

pub fn read_superblock(disk: &dyn BlockDevice) -> Result<Superblock> {
    let mut block = vec![0u8; disk.block_size()];
    disk.read_block(0, &mut block)?;
    let (raw, _) =
        LayoutVerified::<&[u8], RawSuperblock>::new_unaligned_from_prefix(&block[..])
            .ok_or(Error::Einval)?;
    Superblock::from_raw(&raw)
}

pub fn read_checkpoint_pack(disk: &dyn BlockDevice, sb: &Superblock) -> Result<CheckpointPack> {
    let mut block = vec![0u8; sb.block_size];
    disk.read_block(sb.cp_blkaddr, &mut block)?;
    let (raw, rest) =
        LayoutVerified::<&[u8], RawCheckpoint>::new_unaligned_from_prefix(&block[..])
            .ok_or(Error::Einval)?;
    let nbytes = raw.nat_bitmap_bytes.get() as usize;
    if nbytes != sb.nat_bitmap_bytes() || nbytes > rest.len() {
        return Err(Error::Einval);
    }
    Ok(CheckpointPack {
        cp_ver: raw.cp_ver.get(),
        next_free_nid: raw.next_free_nid.get(),
        next_free_block: raw.next_free_block.get(),
        valid_node_count: raw.valid_node_count.get(),
        valid_inode_count: raw.valid_inode_count.get(),
        nat_bitmap: rest[..nbytes].to_vec(),
    })
}

pub fn write_checkpoint_pack(
    disk: &dyn BlockDevice,
    sb: &Superblock,
    cp: &CheckpointPack,
) -> Result<()> {
    let mut block = vec![0u8; sb.block_size];
    let raw = RawCheckpoint {
        cp_ver: Le64::new(cp.cp_ver),
        next_free_nid: Le32::new(cp.next_free_nid),
        next_free_block: Le32::new(cp.next_free_block),
        valid_node_count: Le32::new(cp.valid_node_count),
        valid_inode_count: Le32::new(cp.valid_inode_count),
        nat_bitmap_bytes: Le32::new(cp.nat_bitmap.len() as u32),
    };
    raw.write_to_prefix(&mut block[..]).ok_or(Error::Einval)?;
    let off = mem::size_of::<RawCheckpoint>();
    block[off..off + cp.nat_bitmap.len()].copy_from_slice(&cp.nat_bitmap);
    disk.write_block(sb.cp_blkaddr, &block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemDisk;

    #[test]
    fn format_then_mount_round_trip() {
        let disk = MemDisk::new(512, 128);
        let geo = Geometry::toy();
        let sb = format(&disk, &geo).unwrap();
        let sb2 = read_superblock(&disk).unwrap();
        assert_eq!(sb2.max_nid(), 32);
        assert_eq!(sb2.nats_per_block(), 8);
        assert_eq!(sb2.nat_blkaddr(), sb.nat_blkaddr());
        let cp = read_checkpoint_pack(&disk, &sb2).unwrap();
        assert_eq!(cp.cp_ver, 1);
        assert_eq!(cp.next_free_nid, RESERVED_NODE_COUNT);
        assert_eq!(cp.nat_bitmap.len(), 1);
    }

    #[test]
    fn toy_journal_capacity_matches_one_nat_block() {
        let disk = MemDisk::new(512, 128);
        let sb = format(&disk, &Geometry::toy()).unwrap();
        assert_eq!(sb.max_nat_jentries(), sb.nats_per_block() as usize);
    }

    #[test]
    fn nat_copy_addresses_are_pair_adjacent() {
        let disk = MemDisk::new(512, 128);
        let sb = format(&disk, &Geometry::toy()).unwrap();
        let a = sb.nat_copy_addr(2, false);
        let b = sb.nat_copy_addr(2, true);
        assert_eq!(b, a + 1);
        assert!(b < sb.main_blkaddr());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let disk = MemDisk::new(8, 128);
        assert!(matches!(read_superblock(&disk), Err(Error::Einval)));
    }
}
