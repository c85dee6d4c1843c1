//! Checkpoint flush of dirty NAT entries.
//!
//! Runs with mutators quiesced behind the checkpoint fence. Dirty entries
//! are flushed set by set; a set small enough to fit in the remaining
//! journal space goes to the journal, anything else rewrites its NAT block.
//! Sets are ordered smallest first so the journal is consumed by the sets
//! that pack most densely, with sets at or above the journal capacity sent
//! straight to the tail.
//!
//! Writing a NAT block goes to the pair's *other* copy and flips the bitmap
//! bit, leaving the old copy as the rollback image; with several shards
//! contributing sets to the same pair, the flip happens exactly once per
//! checkpoint and later sets write into the already-switched copy.
//!
//! Entries still at `NEW_ADDR` are skipped: their node pages were never
//! written, so there is nothing durable to record; they stay dirty for the
//! checkpoint that sees their first real address.

use std::collections::HashSet;

use itertools::Itertools;

use crate::error::Result;
use crate::fs::FsInfo;
use crate::nat::NodeInfo;
use crate::page::LockedPage;
use crate::param::{Nid, NAT_ENTRY_SIZE, NEW_ADDR, NULL_ADDR};
use crate::util::{change_bit, unpoison};
use zerocopy::AsBytes;

/// Tracks which NAT block pairs already switched copies this checkpoint.
struct NatBlockFlusher {
    flipped: HashSet<u32>,
}

impl NatBlockFlusher {
    fn new() -> Self {
        Self {
            flipped: HashSet::new(),
        }
    }

    /// The page a block-path flush of `set_id` must write into. On first
    /// touch the current copy is duplicated into the other one and the
    /// bitmap bit flips; afterwards the switched copy is handed back.
    fn next_nat_page(&mut self, fs: &FsInfo, set_id: u32) -> Result<LockedPage> {
        if !self.flipped.insert(set_id) {
            return fs.get_meta_page(fs.nat_copy_addr_current(set_id));
        }
        let src_addr = fs.nat_copy_addr_current(set_id);
        let src = fs.get_meta_page(src_addr)?;
        debug_assert!(!src.is_dirty());

        // Flip first so the destination address reads as current.
        {
            let mut bitmap = fs.nm().nat_bitmap.lock();
            change_bit(&mut bitmap, set_id as usize);
        }
        let dst_addr = fs.nat_copy_addr_current(set_id);
        debug_assert!(dst_addr != src_addr);

        let mut dst = fs.grab_meta_page(dst_addr);
        let data = {
            let mut buf = vec![0u8; src.data().len()];
            buf.copy_from_slice(src.data());
            buf
        };
        drop(src);
        dst.data_mut().copy_from_slice(&data);
        dst.set_uptodate();
        fs.meta().set_page_dirty_raw(&dst);
        Ok(dst)
    }
}

/// Keeps `list` ordered by entry count ascending, with sets at or above
/// `max` appended at the tail.
fn adjust_ordered_sets(list: &mut Vec<(usize, u32, usize)>, item: (usize, u32, usize), max: usize) {
    if item.2 < max {
        for i in 0..list.len() {
            if list[i].2 >= item.2 {
                list.insert(i, item);
                return;
            }
        }
    }
    list.push(item);
}

impl FsInfo {
    /// Re-materializes every journal record into the NAT cache as a dirty
    /// entry and empties the journal, so the whole batch flows through the
    /// block-write path.
    fn remove_nats_in_journal(&self) {
        let nm = self.nm();
        let mut sum = unpoison(self.curseg().sum.lock());
        for i in 0..sum.nats_in_cursum() {
            let nid = sum.nid_in_journal(i);
            let raw = sum.nat_in_journal(i);
            let set_id = self.sb().nat_block_offset(nid);
            let shard = &nm.shards[nm.nat_shard_of(nid)];
            let mut inner = shard.write();
            if inner.lookup(nid).is_none() {
                let e = inner.grab(nid);
                e.ni = NodeInfo::from_raw(nid, &raw);
            }
            inner.set_dirty(nid, set_id);
        }
        sum.clear_nats();
    }

    /// Flushes one shard's dirty set, to the journal when it still fits,
    /// otherwise into the pair's next NAT block copy. Flushed entries move
    /// back to the clean LRU; a freed NID rejoins the pool.
    fn flush_nat_entry_set(
        &self,
        shard_idx: usize,
        set_id: u32,
        flusher: &mut NatBlockFlusher,
    ) -> Result<()> {
        let nm = self.nm();
        let shard = &nm.shards[shard_idx];
        let start_nid = set_id << self.sb().log_nats_per_block();

        let nids: Vec<Nid> = match shard.read().set(set_id) {
            Some(set) => set.entry_list.clone(),
            None => return Ok(()),
        };

        let to_journal = {
            let sum = unpoison(self.curseg().sum.lock());
            sum.has_cursum_space(nids.len())
        };

        if to_journal {
            let mut sum = unpoison(self.curseg().sum.lock());
            for &nid in &nids {
                let ni = match shard.read().lookup(nid) {
                    Some(e) => e.ni,
                    None => continue,
                };
                if ni.blk_addr == NEW_ADDR {
                    continue;
                }
                let slot = sum
                    .lookup_journal(nid, true)
                    .expect("journal space was reserved for this set");
                sum.set_nat_in_journal(slot, ni.to_raw());
                shard.write().clear_dirty(nid, set_id);
                if ni.blk_addr == NULL_ADDR {
                    let _ = self.add_free_nid(nid, false);
                }
            }
        } else {
            let mut page = flusher.next_nat_page(self, set_id)?;
            for &nid in &nids {
                let ni = match shard.read().lookup(nid) {
                    Some(e) => e.ni,
                    None => continue,
                };
                if ni.blk_addr == NEW_ADDR {
                    continue;
                }
                let off = (nid - start_nid) as usize * NAT_ENTRY_SIZE;
                page.data_mut()[off..off + NAT_ENTRY_SIZE]
                    .copy_from_slice(ni.to_raw().as_bytes());
                shard.write().clear_dirty(nid, set_id);
                if ni.blk_addr == NULL_ADDR {
                    let _ = self.add_free_nid(nid, false);
                }
            }
            self.meta().set_page_dirty_raw(&page);
        }

        let mut inner = shard.write();
        let remaining = inner.set(set_id).map_or(0, |s| s.entry_cnt());
        if remaining == 0 {
            if let Some(set) = inner.remove_set(set_id) {
                debug_assert!(set.set_id == set_id);
            }
        } else {
            // Only never-written entries stay behind; they flush once their
            // node pages reach the device.
            log::debug!(
                "set {} keeps {} unwritten entries past this checkpoint",
                set_id,
                remaining
            );
        }
        Ok(())
    }

    /// Classic checkpoint flush: every shard's dirty sets, one set at a
    /// time, globally ordered by size.
    pub fn flush_nat_entries(&self) -> Result<()> {
        let nm = self.nm();
        let total_dirty: usize = nm.shards.iter().map(|s| s.read().dirty_nat_cnt).sum();
        if total_dirty == 0 {
            return Ok(());
        }

        // With more dirty entries than journal space, push everything that
        // is already journaled through the block path as well.
        let drain = {
            let sum = unpoison(self.curseg().sum.lock());
            !sum.has_cursum_space(total_dirty)
        };
        if drain {
            self.remove_nats_in_journal();
        }

        let max_j = self.sb().max_nat_jentries();
        let mut ordered: Vec<(usize, u32, usize)> = Vec::new();
        for (si, shard) in nm.shards.iter().enumerate() {
            let inner = shard.write();
            let mut set_idx = 0u32;
            loop {
                let setvec = inner.gang_lookup_sets(set_idx);
                let last = match setvec.last() {
                    Some(&s) => s,
                    None => break,
                };
                set_idx = last + 1;
                for set_id in setvec {
                    let cnt = inner.set(set_id).map_or(0, |s| s.entry_cnt());
                    adjust_ordered_sets(&mut ordered, (si, set_id, cnt), max_j);
                }
            }
        }

        let mut flusher = NatBlockFlusher::new();
        for (si, set_id, _) in ordered {
            self.flush_nat_entry_set(si, set_id, &mut flusher)?;
        }
        Ok(())
    }

    /// Flushes one pack: every shard's dirty set with the same `set_id`,
    /// through one journal reservation or one NAT-block write.
    fn flush_nat_set_pack(
        &self,
        set_id: u32,
        members: &[(usize, usize)],
        total_cnt: usize,
        flusher: &mut NatBlockFlusher,
    ) -> Result<()> {
        let nm = self.nm();
        let start_nid = set_id << self.sb().log_nats_per_block();

        let to_journal = {
            let sum = unpoison(self.curseg().sum.lock());
            sum.has_cursum_space(total_cnt)
        };

        let mut page = if to_journal {
            None
        } else {
            Some(flusher.next_nat_page(self, set_id)?)
        };

        for &(shard_idx, _) in members {
            let shard = &nm.shards[shard_idx];
            let nids: Vec<Nid> = match shard.read().set(set_id) {
                Some(set) => set.entry_list.clone(),
                None => continue,
            };
            for nid in nids {
                debug_assert!(nm.nat_shard_of(nid) == shard_idx);
                let ni = match shard.read().lookup(nid) {
                    Some(e) => e.ni,
                    None => continue,
                };
                if ni.blk_addr == NEW_ADDR {
                    continue;
                }
                match page {
                    None => {
                        let mut sum = unpoison(self.curseg().sum.lock());
                        let slot = sum
                            .lookup_journal(nid, true)
                            .expect("journal space was reserved for this pack");
                        sum.set_nat_in_journal(slot, ni.to_raw());
                    }
                    Some(ref mut page) => {
                        let off = (nid - start_nid) as usize * NAT_ENTRY_SIZE;
                        page.data_mut()[off..off + NAT_ENTRY_SIZE]
                            .copy_from_slice(ni.to_raw().as_bytes());
                    }
                }
                shard.write().clear_dirty(nid, set_id);
                if ni.blk_addr == NULL_ADDR {
                    let _ = self.add_free_nid(nid, false);
                }
            }
        }
        if let Some(page) = page {
            self.meta().set_page_dirty_raw(&page);
        }

        // Retire the set key everywhere. Sets are per shard, so the pack's
        // members are the only shards expected to hold it.
        let mut removed = 0;
        for shard in nm.shards.iter() {
            let mut inner = shard.write();
            let remaining = inner.set(set_id).map_or(0, |s| s.entry_cnt());
            if remaining > 0 {
                log::debug!(
                    "set {} keeps {} unwritten entries past this checkpoint",
                    set_id,
                    remaining
                );
                continue;
            }
            if let Some(set) = inner.remove_set(set_id) {
                debug_assert!(set.set_id == set_id);
                removed += 1;
            }
        }
        if removed > members.len() {
            log::warn!(
                "set {} was present in {} cells but only {} contributed entries",
                set_id,
                removed,
                members.len()
            );
        }
        Ok(())
    }

    /// Per-core checkpoint flush: dirty sets sharing a `set_id` across
    /// shards are grouped into a pack and flushed together, so each NAT
    /// block pair is decided (journal or block) and switched only once.
    pub fn flush_nat_entries_per_core(&self) -> Result<()> {
        let nm = self.nm();
        let total_dirty: usize = nm.shards.iter().map(|s| s.read().dirty_nat_cnt).sum();
        if total_dirty == 0 {
            return Ok(());
        }

        let drain = {
            let sum = unpoison(self.curseg().sum.lock());
            !sum.has_cursum_space(total_dirty)
        };
        if drain {
            self.remove_nats_in_journal();
        }

        // Gather (shard, set_id, cnt) triples, then pack by set_id.
        let mut triples: Vec<(usize, u32, usize)> = Vec::new();
        for (si, shard) in nm.shards.iter().enumerate() {
            let inner = shard.write();
            let mut set_idx = 0u32;
            loop {
                let setvec = inner.gang_lookup_sets(set_idx);
                let last = match setvec.last() {
                    Some(&s) => s,
                    None => break,
                };
                set_idx = last + 1;
                for set_id in setvec {
                    let cnt = inner.set(set_id).map_or(0, |s| s.entry_cnt());
                    triples.push((si, set_id, cnt));
                }
            }
        }
        let max_j = self.sb().max_nat_jentries();
        let mut packs: Vec<(u32, Vec<(usize, usize)>, usize)> = triples
            .into_iter()
            .map(|(si, set_id, cnt)| (set_id, (si, cnt)))
            .into_group_map()
            .into_iter()
            .map(|(set_id, members)| {
                let total = members.iter().map(|&(_, c)| c).sum();
                (set_id, members, total)
            })
            .collect();
        // Smallest packs first; anything at or over the journal capacity
        // flushes last, straight to its NAT block.
        packs.sort_by_key(|&(set_id, _, total)| (total >= max_j, total, set_id));

        let mut flusher = NatBlockFlusher::new();
        for (set_id, members, total) in packs {
            self.flush_nat_set_pack(set_id, &members, total, &mut flusher)?;
        }

        for shard in nm.shards.iter() {
            let leftover = shard.read().dirty_nat_cnt;
            if leftover != 0 {
                log::debug!("{} unwritten entries stay dirty past this checkpoint", leftover);
            }
        }
        Ok(())
    }
}
