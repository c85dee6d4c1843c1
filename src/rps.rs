//! Reader-preferring semaphore.
//!
//! An rw-synchronizer for sections whose readers vastly outnumber writers and
//! hold the lock very briefly. A reader's common case is one atomic add on a
//! per-thread counter stripe (the "highway"); it takes no lock. Writers pay
//! for that: entering the write side forces every in-flight highway reader to
//! be drained into a shared count (the "lowway") and waits for it to reach
//! zero, while an inner rw-lock excludes readers that arrived too late for
//! the highway.
//!
//! Correctness rests on two orderings, both enforced with `SeqCst`:
//! (a) a highway reader re-checks the writer count after its increment, so an
//! increment that survives is ordered before the writer's drain and is
//! accounted in the lowway; (b) a lowway reader holds the inner rw-lock for
//! read while registering, and the writer holds it for write across the whole
//! critical section.
//!
//! The global invariant is that `lowway + Σ highway[i]` equals the number of
//! readers currently inside. Acquire adds one somewhere, release subtracts
//! one somewhere; stale residue in a stripe is folded into the lowway by the
//! next writer's drain.

use core::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use crate::util::{thread_slot, unpoison, CacheLine};

pub struct Rps {
    highway: Box<[CacheLine<AtomicIsize>]>,
    lowway: AtomicIsize,
    writers: AtomicUsize,
    rw_sem: spin::RwLock<()>,
    writers_wait: Mutex<()>,
    writers_wait_cv: Condvar,
}

impl Rps {
    pub fn new(nslots: usize) -> Self {
        let highway = (0..nslots.max(1))
            .map(|_| CacheLine(AtomicIsize::new(0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            highway,
            lowway: AtomicIsize::new(0),
            writers: AtomicUsize::new(0),
            rw_sem: spin::RwLock::new(()),
            writers_wait: Mutex::new(()),
            writers_wait_cv: Condvar::new(),
        }
    }

    fn slot(&self) -> &AtomicIsize {
        &self.highway[thread_slot(self.highway.len())].0
    }

    /// Tries the fast path: with no writer in sight, bump this thread's
    /// highway stripe. The re-check closes the window where a writer began
    /// draining between our load and our increment.
    fn go_highway(&self) -> bool {
        if self.writers.load(Ordering::SeqCst) != 0 {
            return false;
        }
        self.slot().fetch_add(1, Ordering::SeqCst);
        if self.writers.load(Ordering::SeqCst) == 0 {
            return true;
        }
        // A writer appeared; our increment may already have been drained
        // into the lowway, so release through the lowway side and retreat.
        self.release_lowway();
        false
    }

    fn go_lowway(&self) {
        let guard = self.rw_sem.read();
        self.lowway.fetch_add(1, Ordering::SeqCst);
        drop(guard);
    }

    fn release_lowway(&self) {
        if self.lowway.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _g = unpoison(self.writers_wait.lock());
            self.writers_wait_cv.notify_all();
        }
    }

    pub fn down_read(&self) -> RpsReadGuard<'_> {
        if !self.go_highway() {
            self.go_lowway();
        }
        RpsReadGuard { rps: self }
    }

    pub fn try_down_read(&self) -> Option<RpsReadGuard<'_>> {
        if self.go_highway() {
            return Some(RpsReadGuard { rps: self });
        }
        let guard = self.rw_sem.try_read()?;
        self.lowway.fetch_add(1, Ordering::SeqCst);
        drop(guard);
        Some(RpsReadGuard { rps: self })
    }

    fn up_read(&self) {
        if self.writers.load(Ordering::SeqCst) == 0 {
            self.slot().fetch_sub(1, Ordering::SeqCst);
            return;
        }
        self.release_lowway();
    }

    pub fn down_write(&self) -> RpsWriteGuard<'_> {
        self.writers.fetch_add(1, Ordering::SeqCst);
        let inner = self.rw_sem.write();
        // Fold every highway stripe into the lowway; from here readers can
        // only leave, and each departure decrements the lowway.
        let mut sum = 0isize;
        for s in self.highway.iter() {
            sum += s.0.swap(0, Ordering::SeqCst);
        }
        self.lowway.fetch_add(sum, Ordering::SeqCst);
        let mut g = unpoison(self.writers_wait.lock());
        while self.lowway.load(Ordering::SeqCst) != 0 {
            g = unpoison(self.writers_wait_cv.wait(g));
        }
        drop(g);
        RpsWriteGuard {
            rps: self,
            inner: Some(inner),
        }
    }

    fn up_write(&self) {
        self.writers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Sum of the highway stripes; meaningful only at quiescence.
    #[cfg(test)]
    fn highway_sum(&self) -> isize {
        self.highway
            .iter()
            .map(|s| s.0.load(Ordering::SeqCst))
            .sum()
    }
}

pub struct RpsReadGuard<'a> {
    rps: &'a Rps,
}

impl Drop for RpsReadGuard<'_> {
    fn drop(&mut self) {
        self.rps.up_read();
    }
}

pub struct RpsWriteGuard<'a> {
    rps: &'a Rps,
    inner: Option<spin::RwLockWriteGuard<'a, ()>>,
}

impl Drop for RpsWriteGuard<'_> {
    fn drop(&mut self) {
        // The inner lock must reopen before the writer count drops, so a
        // reader never observes "no writers" while the drain is incomplete.
        self.inner.take();
        self.rps.up_write();
    }
}

/// One of the two checkpoint fences. The mount option selects the RPS or a
/// plain rw-lock with identical blocking semantics.
pub enum Fence {
    Rps(Rps),
    Plain(std::sync::RwLock<()>),
}

impl Fence {
    pub fn new(rps: bool, nslots: usize) -> Self {
        if rps {
            Fence::Rps(Rps::new(nslots))
        } else {
            Fence::Plain(std::sync::RwLock::new(()))
        }
    }

    pub fn read(&self) -> FenceReadGuard<'_> {
        match self {
            Fence::Rps(r) => FenceReadGuard::Rps(r.down_read()),
            Fence::Plain(l) => FenceReadGuard::Plain(unpoison(l.read())),
        }
    }

    pub fn try_read(&self) -> Option<FenceReadGuard<'_>> {
        match self {
            Fence::Rps(r) => r.try_down_read().map(FenceReadGuard::Rps),
            Fence::Plain(l) => l.try_read().ok().map(FenceReadGuard::Plain),
        }
    }

    pub fn write(&self) -> FenceWriteGuard<'_> {
        match self {
            Fence::Rps(r) => FenceWriteGuard::Rps(r.down_write()),
            Fence::Plain(l) => FenceWriteGuard::Plain(unpoison(l.write())),
        }
    }
}

pub enum FenceReadGuard<'a> {
    Rps(RpsReadGuard<'a>),
    Plain(std::sync::RwLockReadGuard<'a, ()>),
}

pub enum FenceWriteGuard<'a> {
    Rps(RpsWriteGuard<'a>),
    Plain(std::sync::RwLockWriteGuard<'a, ()>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn readers_run_concurrently() {
        let rps = Arc::new(Rps::new(4));
        let inside = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let rps = rps.clone();
            let inside = inside.clone();
            handles.push(thread::spawn(move || {
                let _g = rps.down_read();
                inside.fetch_add(1, Ordering::SeqCst);
                while inside.load(Ordering::SeqCst) < 4 {
                    thread::yield_now();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn writer_excludes_readers() {
        let rps = Arc::new(Rps::new(4));
        let shared = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let rps = rps.clone();
            let shared = shared.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let _g = rps.down_read();
                    // A reader must never observe a writer mid-update.
                    assert_eq!(shared.load(Ordering::SeqCst) % 2, 0);
                }
            }));
        }
        for _ in 0..100 {
            let w = rps.down_write();
            shared.fetch_add(1, Ordering::SeqCst);
            shared.fetch_add(1, Ordering::SeqCst);
            drop(w);
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn drain_property_holds_after_down_write() {
        // After down_write returns, no fast-path reader from before the
        // write began is still inside: the stripes were zeroed into the
        // lowway and the lowway reached zero.
        let rps = Arc::new(Rps::new(8));
        let stop = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let rps = rps.clone();
            let stop = stop.clone();
            handles.push(thread::spawn(move || {
                while stop.load(Ordering::SeqCst) == 0 {
                    let _g = rps.down_read();
                }
            }));
        }
        for _ in 0..50 {
            let w = rps.down_write();
            assert_eq!(rps.lowway.load(Ordering::SeqCst), 0);
            drop(w);
        }
        stop.store(1, Ordering::SeqCst);
        for h in handles {
            h.join().unwrap();
        }
        // Quiescent: all counters balance out.
        let w = rps.down_write();
        assert_eq!(rps.highway_sum(), 0);
        assert_eq!(rps.lowway.load(Ordering::SeqCst), 0);
        drop(w);
    }

    #[test]
    fn try_down_read_fails_under_writer() {
        let rps = Arc::new(Rps::new(2));
        let w = rps.down_write();
        let rps2 = rps.clone();
        let h = thread::spawn(move || rps2.try_down_read().is_none());
        assert!(h.join().unwrap());
        drop(w);
        assert!(rps.try_down_read().is_some());
    }
}
