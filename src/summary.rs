//! Current-segment summary and its NAT journal.
//!
//! Small batches of NAT updates are deferred into a side-log packed inside
//! the hot-data summary block instead of rewriting whole NAT blocks. The
//! journal is an in-memory structure serialized as part of the checkpoint's
//! atomic summary write; journal writes therefore cannot fail locally.
//!
//! Serialized layout: a little-endian u16 record count at byte 0, then
//! `{nid: u32 LE, version: u8, ino: u32 LE, block_addr: u32 LE}` records
//! packed back to back from byte `SUM_JOURNAL_HEADER`.

use core::mem;
use std::sync::Mutex;

use static_assertions::const_assert;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

use crate::disk::BlockDevice;
use crate::error::{Error, Result};
use crate::param::{
    BlockAddr, Ino, Nid, NAT_ENTRY_SIZE, NAT_JOURNAL_ENTRY_SIZE, NULL_ADDR, SUM_JOURNAL_HEADER,
};
use crate::superblock::Superblock;

type Le16 = U16<LittleEndian>;
type Le32 = U32<LittleEndian>;

/// On-device NAT record.
#[repr(C)]
#[derive(AsBytes, FromBytes, Unaligned, Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawNatEntry {
    pub version: u8,
    pub ino: Le32,
    pub block_addr: Le32,
}

const_assert!(mem::size_of::<RawNatEntry>() == NAT_ENTRY_SIZE);

impl RawNatEntry {
    pub fn new(version: u8, ino: Ino, block_addr: BlockAddr) -> Self {
        Self {
            version,
            ino: Le32::new(ino),
            block_addr: Le32::new(block_addr),
        }
    }
}

impl Default for RawNatEntry {
    fn default() -> Self {
        Self::new(0, 0, NULL_ADDR)
    }
}

/// One journal record.
#[repr(C)]
#[derive(AsBytes, FromBytes, Unaligned, Clone, Copy)]
pub struct RawNatJournalEntry {
    pub nid: Le32,
    pub ne: RawNatEntry,
}

const_assert!(mem::size_of::<RawNatJournalEntry>() == NAT_JOURNAL_ENTRY_SIZE);

/// In-memory summary block: the NAT journal plus its capacity.
pub struct SummaryBlock {
    nats: Vec<RawNatJournalEntry>,
    capacity: usize,
}

impl SummaryBlock {
    pub fn new(capacity: usize) -> Self {
        Self {
            nats: Vec::new(),
            capacity,
        }
    }

    pub fn nats_in_cursum(&self) -> usize {
        self.nats.len()
    }

    pub fn has_cursum_space(&self, n: usize) -> bool {
        self.nats.len() + n <= self.capacity
    }

    /// Finds the journal slot for `nid`. With `alloc`, reserves a fresh slot
    /// when absent; returns None only when allocation is needed but the
    /// journal is full.
    pub fn lookup_journal(&mut self, nid: Nid, alloc: bool) -> Option<usize> {
        if let Some(i) = self.nats.iter().position(|e| e.nid.get() == nid) {
            return Some(i);
        }
        if alloc && self.nats.len() < self.capacity {
            self.nats.push(RawNatJournalEntry {
                nid: Le32::new(nid),
                ne: RawNatEntry::default(),
            });
            return Some(self.nats.len() - 1);
        }
        None
    }

    pub fn nat_in_journal(&self, i: usize) -> RawNatEntry {
        self.nats[i].ne
    }

    pub fn nid_in_journal(&self, i: usize) -> Nid {
        self.nats[i].nid.get()
    }

    pub fn set_nat_in_journal(&mut self, i: usize, raw: RawNatEntry) {
        self.nats[i].ne = raw;
    }

    /// Drops every journal record (the drain path re-materialized them into
    /// the NAT cache).
    pub fn clear_nats(&mut self) {
        self.nats.clear();
    }

    pub fn serialize(&self, block: &mut [u8]) {
        for b in block.iter_mut() {
            *b = 0;
        }
        let count = Le16::new(self.nats.len() as u16);
        block[..2].copy_from_slice(count.as_bytes());
        let mut off = SUM_JOURNAL_HEADER;
        for e in &self.nats {
            block[off..off + NAT_JOURNAL_ENTRY_SIZE].copy_from_slice(e.as_bytes());
            off += NAT_JOURNAL_ENTRY_SIZE;
        }
    }

    pub fn deserialize(block: &[u8], capacity: usize) -> Result<Self> {
        let count = u16::from_le_bytes([block[0], block[1]]) as usize;
        if count > capacity {
            return Err(Error::Einval);
        }
        let mut nats = Vec::with_capacity(count);
        let mut off = SUM_JOURNAL_HEADER;
        for _ in 0..count {
            let (e, _) = LayoutVerified::<&[u8], RawNatJournalEntry>::new_unaligned_from_prefix(
                &block[off..],
            )
            .ok_or(Error::Einval)?;
            nats.push(*e);
            off += NAT_JOURNAL_ENTRY_SIZE;
        }
        Ok(Self { nats, capacity })
    }
}

/// The current hot-data segment. Its mutex serializes every journal access.
pub struct CursegInfo {
    pub sum: Mutex<SummaryBlock>,
}

impl CursegInfo {
    pub fn load(disk: &dyn BlockDevice, sb: &Superblock) -> Result<Self> {
        let mut block = vec![0u8; sb.block_size()];
        disk.read_block(sb.sum_blkaddr(), &mut block)?;
        let sum = SummaryBlock::deserialize(&block, sb.max_nat_jentries())?;
        Ok(Self {
            sum: Mutex::new(sum),
        })
    }

    pub fn store(&self, disk: &dyn BlockDevice, sb: &Superblock) -> Result<()> {
        let mut block = vec![0u8; sb.block_size()];
        crate::util::unpoison(self.sum.lock()).serialize(&mut block);
        disk.write_block(sb.sum_blkaddr(), &block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn journal_alloc_and_lookup() {
        let mut sum = SummaryBlock::new(4);
        assert_eq!(sum.lookup_journal(7, false), None);
        let i = sum.lookup_journal(7, true).unwrap();
        sum.set_nat_in_journal(i, RawNatEntry::new(1, 7, 100));
        assert_eq!(sum.lookup_journal(7, false), Some(i));
        assert_eq!(sum.nat_in_journal(i).block_addr.get(), 100);
        assert_eq!(sum.nid_in_journal(i), 7);
        assert_eq!(sum.nats_in_cursum(), 1);
    }

    #[test]
    fn journal_capacity_is_enforced() {
        let mut sum = SummaryBlock::new(2);
        assert!(sum.lookup_journal(1, true).is_some());
        assert!(sum.lookup_journal(2, true).is_some());
        assert!(!sum.has_cursum_space(1));
        assert_eq!(sum.lookup_journal(3, true), None);
        // An existing nid still resolves when full.
        assert!(sum.lookup_journal(2, true).is_some());
    }

    #[test]
    fn serialization_round_trip_is_bit_exact() {
        let mut sum = SummaryBlock::new(8);
        for nid in [3u32, 9, 12] {
            let i = sum.lookup_journal(nid, true).unwrap();
            sum.set_nat_in_journal(i, RawNatEntry::new(nid as u8, nid, nid * 10));
        }
        let mut block = vec![0u8; 128];
        sum.serialize(&mut block);
        // Fixed wire offsets: count at 0, first record at the header edge.
        assert_eq!(block[0], 3);
        assert_eq!(&block[SUM_JOURNAL_HEADER..SUM_JOURNAL_HEADER + 4], &[3, 0, 0, 0]);
        let sum2 = SummaryBlock::deserialize(&block, 8).unwrap();
        assert_eq!(sum2.nats_in_cursum(), 3);
        for (i, nid) in [3u32, 9, 12].iter().enumerate() {
            assert_eq!(sum2.nid_in_journal(i), *nid);
            assert_eq!(sum2.nat_in_journal(i).block_addr.get(), nid * 10);
        }
    }
}
