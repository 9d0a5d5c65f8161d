// packages/engine/src/memory/page_pool.rs
//! Fixed ring of equally sized pages cut from one anonymous memory mapping
//!
//! The pool hands out pages round-robin starting after the last borrowed
//! page, so freshly returned pages are not immediately reused. Each page
//! carries one atomic used-flag; there is no other synchronization.
//!
//! A page is returned to the pool when its [`Page`] handle is dropped, which
//! normally happens on the thread that persisted the page contents. Running
//! out of pages is not an error: [`PagePool::allocate`] returns `None` and
//! the caller decides whether to wait, spill or grow.

use crate::utils::errors::{EngineError, Result};
use memmap2::MmapMut;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Smallest accepted page size in bytes
pub const MIN_PAGE_SIZE: usize = 64;

/// Pool of fixed-size pages
pub struct PagePool {
    /// Keeps the mapping alive; all page memory lives inside it
    _backing: MmapMut,

    /// Start of the mapping
    base: *mut u8,

    /// Size of every page in bytes
    page_size: usize,

    /// Number of pages (power of two)
    page_count: usize,

    /// Per-page used flag
    used: Box<[AtomicBool]>,

    /// Index of the most recently handed out page
    last_borrowed: AtomicUsize,

    /// Successful allocations
    allocations: AtomicU64,

    /// Allocation attempts that found no free page
    exhausted: AtomicU64,
}

// SAFETY: the mapping is only accessed through `Page` handles and a page's
// used-flag guarantees at most one live handle per page region.
unsafe impl Send for PagePool {}
unsafe impl Sync for PagePool {}

impl PagePool {
    /// Create a pool of `page_count` pages of `page_size` bytes each
    pub fn new(page_size: usize, page_count: usize) -> Result<Arc<Self>> {
        if !page_count.is_power_of_two() {
            return Err(EngineError::ConfigError(format!(
                "Page count must be a power of two, but was {}",
                page_count
            )));
        }
        if page_size < MIN_PAGE_SIZE {
            return Err(EngineError::ConfigError(format!(
                "Page size must be at least {} bytes, but was {}",
                MIN_PAGE_SIZE, page_size
            )));
        }

        let total = page_size.checked_mul(page_count).ok_or_else(|| {
            EngineError::ConfigError("Page pool size overflows usize".to_string())
        })?;

        let mut backing = MmapMut::map_anon(total).map_err(|e| {
            EngineError::StorageFailed(format!("Failed to map page pool memory: {}", e))
        })?;
        let base = backing.as_mut_ptr();

        let used = (0..page_count)
            .map(|_| AtomicBool::new(false))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        debug!(
            "Created page pool with {} pages of {} bytes ({} bytes total)",
            page_count, page_size, total
        );

        Ok(Arc::new(Self {
            _backing: backing,
            base,
            page_size,
            page_count,
            used,
            // so that the first allocation lands on page 0
            last_borrowed: AtomicUsize::new(page_count - 1),
            allocations: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
        }))
    }

    /// Borrow a free page, scanning forward from the last borrowed one
    pub fn allocate(self: &Arc<Self>) -> Option<Page> {
        let mask = self.page_count - 1;
        let start = (self.last_borrowed.load(Ordering::Relaxed) + 1) & mask;

        for step in 0..self.page_count {
            let id = (start + step) & mask;
            if self.used[id].load(Ordering::Acquire) {
                continue;
            }
            if self.used[id]
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.last_borrowed.store(id, Ordering::Relaxed);
                self.allocations.fetch_add(1, Ordering::Relaxed);
                return Some(Page {
                    storage: PageStorage::Pooled {
                        pool: Arc::clone(self),
                        id,
                    },
                });
            }
        }

        self.exhausted.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Return a page to the pool (equivalent to dropping it)
    pub fn deallocate(&self, page: Page) {
        drop(page);
    }

    fn release(&self, id: usize) {
        self.used[id].store(false, Ordering::Release);
    }

    /// Size of every page in bytes
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages in the ring
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Pool statistics
    pub fn stats(&self) -> PoolStats {
        let in_use = self
            .used
            .iter()
            .filter(|flag| flag.load(Ordering::Relaxed))
            .count();

        PoolStats {
            page_size: self.page_size,
            page_count: self.page_count,
            pages_in_use: in_use,
            allocations: self.allocations.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for PagePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagePool")
            .field("page_size", &self.page_size)
            .field("page_count", &self.page_count)
            .finish()
    }
}

enum PageStorage {
    Pooled { pool: Arc<PagePool>, id: usize },
    Detached(Box<[u8]>),
}

/// Exclusive handle to one page of memory
pub struct Page {
    storage: PageStorage,
}

impl Page {
    /// A heap page outside any pool, used when the pool is exhausted
    pub fn detached(size: usize) -> Self {
        Self {
            storage: PageStorage::Detached(vec![0u8; size].into_boxed_slice()),
        }
    }

    /// Pool page index, `None` for detached pages
    pub fn id(&self) -> Option<usize> {
        match &self.storage {
            PageStorage::Pooled { id, .. } => Some(*id),
            PageStorage::Detached(_) => None,
        }
    }

    /// Page capacity in bytes
    pub fn len(&self) -> usize {
        match &self.storage {
            PageStorage::Pooled { pool, .. } => pool.page_size,
            PageStorage::Detached(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.storage {
            // SAFETY: the region [id * size, (id + 1) * size) lies inside the
            // mapping and this handle is its only owner while the flag is set.
            PageStorage::Pooled { pool, id } => unsafe {
                std::slice::from_raw_parts(pool.base.add(id * pool.page_size), pool.page_size)
            },
            PageStorage::Detached(bytes) => bytes,
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.storage {
            // SAFETY: see `as_slice`; `&mut self` makes the access exclusive.
            PageStorage::Pooled { pool, id } => unsafe {
                std::slice::from_raw_parts_mut(pool.base.add(*id * pool.page_size), pool.page_size)
            },
            PageStorage::Detached(bytes) => bytes,
        }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        if let PageStorage::Pooled { pool, id } = &self.storage {
            pool.release(*id);
        }
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id())
            .field("len", &self.len())
            .finish()
    }
}

/// Pool statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub page_size: usize,
    pub page_count: usize,
    pub pages_in_use: usize,
    pub allocations: u64,
    pub exhausted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::{HashSet, VecDeque};

    #[test]
    fn test_rejects_non_power_of_two() {
        let result = PagePool::new(128, 6);
        assert!(matches!(result, Err(EngineError::ConfigError(_))));
    }

    #[test]
    fn test_rejects_tiny_pages() {
        assert!(PagePool::new(8, 4).is_err());
    }

    #[test]
    fn test_allocate_until_exhausted() {
        let pool = PagePool::new(128, 4).unwrap();

        let pages: Vec<Page> = (0..4).map(|_| pool.allocate().unwrap()).collect();
        assert!(pool.allocate().is_none());

        let ids: HashSet<_> = pages.iter().map(|p| p.id().unwrap()).collect();
        assert_eq!(ids.len(), 4);

        let stats = pool.stats();
        assert_eq!(stats.pages_in_use, 4);
        assert_eq!(stats.exhausted, 1);
    }

    #[test]
    fn test_round_robin_reuse() {
        let pool = PagePool::new(128, 4).unwrap();

        let first = pool.allocate().unwrap();
        assert_eq!(first.id(), Some(0));
        pool.deallocate(first);

        // page 0 is free again, but the scan continues after it
        let second = pool.allocate().unwrap();
        assert_eq!(second.id(), Some(1));
    }

    #[test]
    fn test_drop_returns_page() {
        let pool = PagePool::new(128, 2).unwrap();
        {
            let _a = pool.allocate().unwrap();
            let _b = pool.allocate().unwrap();
            assert!(pool.allocate().is_none());
        }
        assert_eq!(pool.stats().pages_in_use, 0);
        assert!(pool.allocate().is_some());
    }

    #[test]
    fn test_pages_do_not_alias() {
        let pool = PagePool::new(64, 2).unwrap();
        let mut a = pool.allocate().unwrap();
        let mut b = pool.allocate().unwrap();

        a.as_mut_slice().fill(0xAA);
        b.as_mut_slice().fill(0xBB);

        assert!(a.as_slice().iter().all(|&x| x == 0xAA));
        assert!(b.as_slice().iter().all(|&x| x == 0xBB));
    }

    #[test]
    fn test_detached_page() {
        let mut page = Page::detached(100);
        assert_eq!(page.id(), None);
        assert_eq!(page.len(), 100);
        page.as_mut_slice()[99] = 7;
        assert_eq!(page.as_slice()[99], 7);
    }

    proptest! {
        #[test]
        fn prop_live_pages_never_overlap(ops in proptest::collection::vec(any::<bool>(), 1..400)) {
            let pool = PagePool::new(64, 8).unwrap();
            let mut live: VecDeque<Page> = VecDeque::new();

            for (round, allocate) in ops.into_iter().enumerate() {
                if allocate {
                    if let Some(mut page) = pool.allocate() {
                        let marker = (round % 251) as u8;
                        page.as_mut_slice().fill(marker);
                        live.push_back(page);
                    }
                } else if let Some(page) = live.pop_front() {
                    pool.deallocate(page);
                }

                let ids: HashSet<_> = live.iter().map(|p| p.id().unwrap()).collect();
                prop_assert_eq!(ids.len(), live.len());
                for page in &live {
                    let first = page.as_slice()[0];
                    prop_assert!(page.as_slice().iter().all(|&x| x == first));
                }
            }
        }
    }
}
