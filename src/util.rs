//! Small shared pieces: striped counters, raw bitmap operations, per-thread
//! slot ids for per-CPU-style arrays, and poison-tolerant lock entry.

use core::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::LockResult;

/// Enters a standard-library lock regardless of poisoning. A poisoned lock
/// only means another thread panicked while holding it; the protected state
/// is still the state we must observe.
pub(crate) fn unpoison<G>(r: LockResult<G>) -> G {
    match r {
        Ok(g) => g,
        Err(e) => e.into_inner(),
    }
}

/// One cache line per stripe so concurrent writers do not bounce the line.
#[repr(align(64))]
pub(crate) struct CacheLine<T>(pub T);

static NEXT_THREAD_SLOT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_SLOT: usize = NEXT_THREAD_SLOT.fetch_add(1, Ordering::Relaxed);
}

/// A stable small integer for the current thread, used to index per-CPU-style
/// stripe arrays. Distinct live threads may share a slot once more threads
/// than slots exist; correctness never depends on exclusivity, only sums.
pub(crate) fn thread_slot(nslots: usize) -> usize {
    THREAD_SLOT.with(|s| *s % nslots)
}

/// Number of stripes to use for per-CPU-style structures.
pub(crate) fn online_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// A counter kept as per-stripe deltas, summed on read. With one stripe it
/// degenerates to a plain atomic counter.
pub struct StripedCounter {
    stripes: Box<[CacheLine<AtomicI64>]>,
}

impl StripedCounter {
    pub fn new(nstripes: usize) -> Self {
        let stripes = (0..nstripes.max(1))
            .map(|_| CacheLine(AtomicI64::new(0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { stripes }
    }

    pub fn add(&self, v: i64) {
        let slot = thread_slot(self.stripes.len());
        self.stripes[slot].0.fetch_add(v, Ordering::Relaxed);
    }

    pub fn sum(&self) -> i64 {
        self.stripes
            .iter()
            .map(|s| s.0.load(Ordering::Relaxed))
            .sum()
    }

    /// True iff the exact sum exceeds `rhs`.
    pub fn exceeds(&self, rhs: i64) -> bool {
        self.sum() > rhs
    }
}

/// Raw bitmap helpers over a byte slice, least significant bit first.
pub(crate) fn test_bit(map: &[u8], nr: usize) -> bool {
    map[nr >> 3] & (1 << (nr & 7)) != 0
}

pub(crate) fn change_bit(map: &mut [u8], nr: usize) {
    map[nr >> 3] ^= 1 << (nr & 7);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn striped_counter_sums_across_threads() {
        let c = std::sync::Arc::new(StripedCounter::new(4));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = c.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    c.add(1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(c.sum(), 8000);
        assert!(c.exceeds(7999));
        assert!(!c.exceeds(8000));
    }

    #[test]
    fn bitmap_bits_flip_independently() {
        let mut map = vec![0u8; 2];
        assert!(!test_bit(&map, 9));
        change_bit(&mut map, 9);
        assert!(test_bit(&map, 9));
        assert!(!test_bit(&map, 8));
        change_bit(&mut map, 9);
        assert!(!test_bit(&map, 9));
    }
}
