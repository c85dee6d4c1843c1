//! Byte-addressable page store.
//!
//! Each address space (the meta space, and one node space per file cell)
//! maps a page index to a cached page. A page is reference counted and
//! unlocked ([`PageRef`]) until someone locks it ([`LockedPage`]); only a
//! locked page exposes its bytes. Dirty and writeback states are kept twice,
//! on the page itself and as tags in the owning space's tree, so writeback
//! can find candidates by range without touching every page.
//!
//! Interface:
//! * `grab_page` returns a locked page, creating it if absent.
//! * `find_page` returns an unlocked reference, or nothing.
//! * Dirty/writeback transitions go through the space so the tags stay
//!   consistent with the per-page bits.
//! * The space's tree lock is the innermost lock in the system; it is a spin
//!   lock and is never held across blocking operations.

use core::cell::UnsafeCell;
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Condvar, Mutex};

use arrayvec::ArrayVec;

use crate::error::Result;
use crate::fs::FsInfo;
use crate::param::PAGEVEC_SIZE;
use crate::util::unpoison;

static NEXT_SPACE_ID: AtomicUsize = AtomicUsize::new(1);

/// Which tag of a tagged lookup.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum PageTag {
    Dirty,
    Writeback,
}

/// Parameters of one writeback pass.
pub struct WritebackControl {
    pub nr_to_write: i64,
    pub sync: bool,
    pub for_reclaim: bool,
}

impl WritebackControl {
    pub fn new(nr_to_write: i64) -> Self {
        Self {
            nr_to_write,
            sync: false,
            for_reclaim: false,
        }
    }

    pub fn sync_all(nr_to_write: i64) -> Self {
        Self {
            nr_to_write,
            sync: true,
            for_reclaim: false,
        }
    }
}

/// What `write_page` did with the page.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WriteOutcome {
    Written,
    Redirtied,
}

/// Writeback vtable of an address space, registered at mount.
pub trait AddressSpaceOps: Send + Sync {
    fn write_page(
        &self,
        fs: &FsInfo,
        page: LockedPage,
        wbc: &mut WritebackControl,
    ) -> Result<WriteOutcome>;

    fn write_pages(&self, fs: &FsInfo, wbc: &mut WritebackControl) -> Result<usize>;

    /// Returns true if the page was newly dirtied.
    fn set_dirty(&self, fs: &FsInfo, page: &LockedPage) -> bool;

    fn invalidate_page(&self, fs: &FsInfo, page: &PageRef);

    /// Whether a clean page may be dropped from the cache.
    fn release_page(&self, fs: &FsInfo, page: &PageRef) -> bool;
}

struct PageState {
    locked: bool,
    uptodate: bool,
    dirty: bool,
    writeback: bool,
    error: bool,
}

pub struct Page {
    index: u64,
    /// Id of the owning space; zero once the page is invalidated.
    mapping: AtomicUsize,
    state: Mutex<PageState>,
    cond: Condvar,
    data: UnsafeCell<Box<[u8]>>,
}

// SAFETY: `data` is only reachable through a `LockedPage`, which holds the
// page lock exclusively for its whole lifetime.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    fn new(index: u64, size: usize, mapping: usize) -> Arc<Self> {
        Arc::new(Self {
            index,
            mapping: AtomicUsize::new(mapping),
            state: Mutex::new(PageState {
                locked: false,
                uptodate: false,
                dirty: false,
                writeback: false,
                error: false,
            }),
            cond: Condvar::new(),
            data: UnsafeCell::new(vec![0u8; size].into_boxed_slice()),
        })
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    fn mapping_id(&self) -> usize {
        self.mapping.load(Ordering::Acquire)
    }

    pub fn is_uptodate(&self) -> bool {
        unpoison(self.state.lock()).uptodate
    }

    pub fn is_dirty(&self) -> bool {
        unpoison(self.state.lock()).dirty
    }

    pub fn is_writeback(&self) -> bool {
        unpoison(self.state.lock()).writeback
    }

    /// Blocks until any in-flight writeback of this page has completed.
    pub fn wait_on_writeback(&self) {
        let mut s = unpoison(self.state.lock());
        while s.writeback {
            s = unpoison(self.cond.wait(s));
        }
    }

    /// Clears and returns the page error bit.
    pub fn test_clear_error(&self) -> bool {
        let mut s = unpoison(self.state.lock());
        core::mem::replace(&mut s.error, false)
    }
}

/// A reference-counted, unlocked page.
#[derive(Clone)]
pub struct PageRef(Arc<Page>);

impl Deref for PageRef {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.0
    }
}

impl PageRef {
    /// Blocks until the page lock is acquired.
    pub fn lock(self) -> LockedPage {
        {
            let mut s = unpoison(self.0.state.lock());
            while s.locked {
                s = unpoison(self.0.cond.wait(s));
            }
            s.locked = true;
        }
        LockedPage { page: self }
    }

    pub fn try_lock(self) -> core::result::Result<LockedPage, PageRef> {
        {
            let mut s = unpoison(self.0.state.lock());
            if s.locked {
                drop(s);
                return Err(self);
            }
            s.locked = true;
        }
        Ok(LockedPage { page: self })
    }
}

/// A locked page. Unlocks on drop; only this type exposes the bytes.
pub struct LockedPage {
    page: PageRef,
}

impl LockedPage {
    pub fn data(&self) -> &[u8] {
        // SAFETY: the page lock is held for the lifetime of `self`.
        unsafe { &**self.page.0.data.get() }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` forbids aliasing the slice.
        unsafe { &mut **self.page.0.data.get() }
    }

    pub fn set_uptodate(&self) {
        unpoison(self.page.0.state.lock()).uptodate = true;
    }

    pub fn clear_uptodate(&self) {
        unpoison(self.page.0.state.lock()).uptodate = false;
    }

    pub fn set_error(&self) {
        unpoison(self.page.0.state.lock()).error = true;
    }

    /// Releases the lock, keeping the reference.
    pub fn unlock(self) -> PageRef {
        let page = self.page.clone();
        drop(self);
        page
    }

    pub fn page_ref(&self) -> &PageRef {
        &self.page
    }
}

impl Deref for LockedPage {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.page.0
    }
}

impl Drop for LockedPage {
    fn drop(&mut self) {
        let mut s = unpoison(self.page.0.state.lock());
        s.locked = false;
        drop(s);
        self.page.0.cond.notify_all();
    }
}

struct PageTree {
    pages: BTreeMap<u64, Arc<Page>>,
    dirty: BTreeSet<u64>,
    writeback: BTreeSet<u64>,
}

pub struct AddressSpace {
    id: usize,
    page_size: usize,
    tree: spin::Mutex<PageTree>,
    ops: Box<dyn AddressSpaceOps>,
    eio: AtomicBool,
    enospc: AtomicBool,
}

impl AddressSpace {
    pub fn new(page_size: usize, ops: Box<dyn AddressSpaceOps>) -> Self {
        Self {
            id: NEXT_SPACE_ID.fetch_add(1, Ordering::Relaxed),
            page_size,
            tree: spin::Mutex::new(PageTree {
                pages: BTreeMap::new(),
                dirty: BTreeSet::new(),
                writeback: BTreeSet::new(),
            }),
            ops,
            eio: AtomicBool::new(false),
            enospc: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn ops(&self) -> &dyn AddressSpaceOps {
        &*self.ops
    }

    /// True iff `page` still belongs to this space. A page whose space
    /// changed under the caller must be dropped and the lookup repeated.
    pub fn owns(&self, page: &Page) -> bool {
        page.mapping_id() == self.id
    }

    /// Finds or creates the page at `index` and returns it locked.
    pub fn grab_page(&self, index: u64) -> LockedPage {
        loop {
            let page = {
                let mut tree = self.tree.lock();
                match tree.pages.get(&index) {
                    Some(p) => PageRef(p.clone()),
                    None => {
                        let p = Page::new(index, self.page_size, self.id);
                        tree.pages.insert(index, p.clone());
                        PageRef(p)
                    }
                }
            };
            let locked = page.lock();
            // The page may have been invalidated between the tree lookup and
            // the lock acquisition.
            if self.owns(&locked) {
                return locked;
            }
        }
    }

    pub fn find_page(&self, index: u64) -> Option<PageRef> {
        let tree = self.tree.lock();
        tree.pages.get(&index).map(|p| PageRef(p.clone()))
    }

    /// Collects up to one pagevec of pages tagged `tag` with index at least
    /// `*start`; advances `*start` past the last page returned.
    pub fn lookup_tag(&self, tag: PageTag, start: &mut u64) -> ArrayVec<PageRef, PAGEVEC_SIZE> {
        let tree = self.tree.lock();
        let set = match tag {
            PageTag::Dirty => &tree.dirty,
            PageTag::Writeback => &tree.writeback,
        };
        let mut out = ArrayVec::new();
        for &idx in set.range(*start..) {
            if out.is_full() {
                break;
            }
            if let Some(p) = tree.pages.get(&idx) {
                out.push(PageRef(p.clone()));
            }
        }
        if let Some(last) = out.last() {
            *start = last.index() + 1;
        }
        out
    }

    /// Marks a locked page dirty; returns true when it was clean before.
    pub fn set_page_dirty_raw(&self, page: &LockedPage) -> bool {
        let mut s = unpoison(page.page.0.state.lock());
        if s.dirty {
            return false;
        }
        s.dirty = true;
        let mut tree = self.tree.lock();
        tree.dirty.insert(page.index());
        true
    }

    /// Clears the dirty state before writing; returns whether it was dirty.
    pub fn clear_page_dirty_for_io(&self, page: &LockedPage) -> bool {
        let mut s = unpoison(page.page.0.state.lock());
        if !s.dirty {
            return false;
        }
        s.dirty = false;
        let mut tree = self.tree.lock();
        tree.dirty.remove(&page.index());
        true
    }

    pub fn set_page_writeback(&self, page: &LockedPage) {
        let mut s = unpoison(page.page.0.state.lock());
        debug_assert!(!s.writeback);
        s.writeback = true;
        let mut tree = self.tree.lock();
        tree.writeback.insert(page.index());
    }

    pub fn end_page_writeback(&self, page: &LockedPage) {
        let mut s = unpoison(page.page.0.state.lock());
        s.writeback = false;
        {
            let mut tree = self.tree.lock();
            tree.writeback.remove(&page.index());
        }
        drop(s);
        page.page.0.cond.notify_all();
    }

    /// Drops clean, unlocked pages in `lo..=hi` from the cache.
    /// Returns how many pages were dropped.
    pub fn invalidate_pages(&self, lo: u64, hi: u64) -> usize {
        let mut tree = self.tree.lock();
        let candidates: Vec<u64> = tree.pages.range(lo..=hi).map(|(&i, _)| i).collect();
        let mut dropped = 0;
        for idx in candidates {
            let keep = {
                let page = &tree.pages[&idx];
                match page.state.try_lock() {
                    Ok(s) => s.locked || s.dirty || s.writeback,
                    Err(_) => true,
                }
            };
            if !keep {
                let page = tree.pages.remove(&idx).unwrap();
                page.mapping.store(0, Ordering::Release);
                tree.dirty.remove(&idx);
                tree.writeback.remove(&idx);
                dropped += 1;
            }
        }
        dropped
    }

    pub fn dirty_page_count(&self) -> usize {
        self.tree.lock().dirty.len()
    }

    pub fn page_count(&self) -> usize {
        self.tree.lock().pages.len()
    }

    pub fn set_eio(&self) {
        self.eio.store(true, Ordering::Release);
    }

    pub fn test_clear_eio(&self) -> bool {
        self.eio.swap(false, Ordering::AcqRel)
    }

    pub fn set_enospc(&self) {
        self.enospc.store(true, Ordering::Release);
    }

    pub fn test_clear_enospc(&self) -> bool {
        self.enospc.swap(false, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    struct NoopOps;

    impl AddressSpaceOps for NoopOps {
        fn write_page(
            &self,
            _fs: &FsInfo,
            _page: LockedPage,
            _wbc: &mut WritebackControl,
        ) -> Result<WriteOutcome> {
            Ok(WriteOutcome::Written)
        }

        fn write_pages(&self, _fs: &FsInfo, _wbc: &mut WritebackControl) -> Result<usize> {
            Ok(0)
        }

        fn set_dirty(&self, _fs: &FsInfo, _page: &LockedPage) -> bool {
            false
        }

        fn invalidate_page(&self, _fs: &FsInfo, _page: &PageRef) {}

        fn release_page(&self, _fs: &FsInfo, _page: &PageRef) -> bool {
            true
        }
    }

    fn space() -> AddressSpace {
        AddressSpace::new(64, Box::new(NoopOps))
    }

    #[test]
    fn grab_returns_same_page() {
        let sp = space();
        {
            let mut p = sp.grab_page(7);
            p.data_mut()[0] = 0xab;
        }
        let p = sp.grab_page(7);
        assert_eq!(p.data()[0], 0xab);
        assert_eq!(sp.page_count(), 1);
    }

    #[test]
    fn dirty_tag_follows_page_state() {
        let sp = space();
        let p = sp.grab_page(3);
        assert!(sp.set_page_dirty_raw(&p));
        assert!(!sp.set_page_dirty_raw(&p));
        assert_eq!(sp.dirty_page_count(), 1);
        assert!(sp.clear_page_dirty_for_io(&p));
        assert_eq!(sp.dirty_page_count(), 0);
    }

    #[test]
    fn tagged_lookup_walks_in_index_order() {
        let sp = space();
        for idx in [9u64, 2, 5] {
            let p = sp.grab_page(idx);
            sp.set_page_dirty_raw(&p);
        }
        let mut start = 0;
        let vec = sp.lookup_tag(PageTag::Dirty, &mut start);
        let idxs: Vec<u64> = vec.iter().map(|p| p.index()).collect();
        assert_eq!(idxs, vec![2, 5, 9]);
        assert_eq!(start, 10);
        assert!(sp.lookup_tag(PageTag::Dirty, &mut start).is_empty());
    }

    #[test]
    fn invalidate_skips_dirty_and_locked() {
        let sp = space();
        {
            let p = sp.grab_page(1);
            sp.set_page_dirty_raw(&p);
        }
        let _locked = sp.grab_page(2);
        let _ = sp.grab_page(3);
        assert_eq!(sp.invalidate_pages(0, 10), 1);
        assert_eq!(sp.page_count(), 2);
    }

    #[test]
    fn grab_after_invalidate_recreates() {
        let sp = space();
        let r = sp.grab_page(4).unlock();
        sp.invalidate_pages(4, 4);
        assert!(!sp.owns(&r));
        let p = sp.grab_page(4);
        assert!(sp.owns(&p));
    }

    #[test]
    fn page_lock_excludes() {
        let sp = Arc::new(space());
        let locked = sp.grab_page(0);
        let sp2 = sp.clone();
        let h = thread::spawn(move || {
            let p = sp2.find_page(0).unwrap();
            let _locked = p.lock();
        });
        thread::sleep(std::time::Duration::from_millis(20));
        assert!(!h.is_finished());
        drop(locked);
        h.join().unwrap();
    }
}
