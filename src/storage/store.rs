use std::sync::Arc;
use std::time::Instant;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, MutexGuard, RawRwLock, RwLock};
use tracing::{debug, instrument, warn};

use super::backend::PageBackend;
use super::page::{Page, MAX_PAGE_SIZE};
use crate::error::{IvfError, Result};
use crate::metrics;
use crate::types::PageId;

/// How a page is latched by [`PageStore::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
    /// Exclusive, and only granted once no reader still holds the page.
    Cleanup,
}

enum Latch {
    Shared(ArcRwLockReadGuard<RawRwLock, Page>),
    Exclusive(ArcRwLockWriteGuard<RawRwLock, Page>),
}

/// A latched page. The latch is released when the handle is dropped.
pub struct PageHandle {
    id: PageId,
    latch: Latch,
}

impl PageHandle {
    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn page(&self) -> &Page {
        match &self.latch {
            Latch::Shared(g) => &**g,
            Latch::Exclusive(g) => &**g,
        }
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self.latch, Latch::Exclusive(_))
    }

    fn page_mut(&mut self) -> Result<&mut Page> {
        match &mut self.latch {
            Latch::Exclusive(g) => Ok(&mut **g),
            Latch::Shared(_) => Err(IvfError::NotExclusive { page: self.id }),
        }
    }
}

impl std::ops::Deref for PageHandle {
    type Target = Page;

    fn deref(&self) -> &Page {
        self.page()
    }
}

/// Proof that the caller holds the store's extension lock.
pub struct ExtensionGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

/// Index of a page registered in a [`Txn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot(usize);

/// A staged multi-page modification.
///
/// Registered pages stay exclusively latched; edits go to shadow copies that
/// become visible only when [`PageStore::commit`] succeeds. Dropping or
/// aborting the transaction discards every shadow.
pub struct Txn {
    staged: Vec<(PageHandle, Page)>,
}

impl Txn {
    /// Stage an exclusively latched page for modification.
    pub fn register(&mut self, handle: PageHandle) -> Result<Slot> {
        if !handle.is_exclusive() {
            return Err(IvfError::NotExclusive { page: handle.id() });
        }
        let shadow = handle.page().clone();
        self.staged.push((handle, shadow));
        Ok(Slot(self.staged.len() - 1))
    }

    pub fn page(&self, slot: Slot) -> &Page {
        &self.staged[slot.0].1
    }

    pub fn page_mut(&mut self, slot: Slot) -> &mut Page {
        &mut self.staged[slot.0].1
    }

    pub fn page_id(&self, slot: Slot) -> PageId {
        self.staged[slot.0].0.id()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Whether any shadow differs from the page it was taken from.
    pub fn is_dirty(&self) -> bool {
        self.staged.iter().any(|(h, shadow)| h.page() != shadow)
    }
}

/// Fixed-size pages with per-page latches and atomic multi-page writes.
///
/// Frames live in memory; every commit is handed to the backend as one batch
/// before it is published to other latch holders.
pub struct PageStore {
    frames: RwLock<Vec<Arc<RwLock<Page>>>>,
    extension: Mutex<()>,
    page_size: usize,
    backend: Arc<dyn PageBackend>,
}

impl PageStore {
    pub fn new(page_size: usize, backend: impl PageBackend + 'static) -> Result<Self> {
        Self::with_backend(page_size, Arc::new(backend))
    }

    /// Open over a shared backend, loading every page it has persisted.
    pub fn with_backend(page_size: usize, backend: Arc<dyn PageBackend>) -> Result<Self> {
        if !(1024..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(IvfError::InvalidParameter(format!(
                "page size must be in 1024..={MAX_PAGE_SIZE}, got {page_size}"
            )));
        }

        let mut frames = Vec::new();
        for (i, bytes) in backend.load()?.into_iter().enumerate() {
            let page = Page::from_bytes(&bytes);
            page.validate()
                .map_err(|reason| IvfError::corrupt(i as PageId, reason))?;
            frames.push(Arc::new(RwLock::new(page)));
        }
        debug!(
            backend = backend.name(),
            page_size,
            pages = frames.len(),
            "page store ready"
        );

        Ok(Self {
            frames: RwLock::new(frames),
            extension: Mutex::new(()),
            page_size,
            backend,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> u32 {
        self.frames.read().len() as u32
    }

    /// Serialize relation extension against other allocators.
    pub fn lock_extension(&self) -> ExtensionGuard<'_> {
        ExtensionGuard {
            _guard: self.extension.lock(),
        }
    }

    /// Append a zeroed page and return it exclusively latched.
    ///
    /// The page only becomes durable once a transaction that initializes it commits.
    pub fn allocate_page(&self, _ext: &ExtensionGuard<'_>) -> Result<PageHandle> {
        let frame = Arc::new(RwLock::new(Page::new(self.page_size)));
        let latch = frame.write_arc();
        let id = {
            let mut frames = self.frames.write();
            let id = frames.len();
            if id >= crate::types::INVALID_PAGE as usize {
                return Err(IvfError::ResourceLimit("page store is full".into()));
            }
            frames.push(frame);
            id as PageId
        };
        metrics::PAGES_ALLOCATED_TOTAL.inc();
        debug!(page = id, "allocated page");
        Ok(PageHandle {
            id,
            latch: Latch::Exclusive(latch),
        })
    }

    /// Latch an existing page.
    pub fn read(&self, id: PageId, mode: LockMode) -> Result<PageHandle> {
        let frame = {
            let frames = self.frames.read();
            frames
                .get(id as usize)
                .cloned()
                .ok_or(IvfError::PageOutOfRange {
                    page: id,
                    count: frames.len() as u32,
                })?
        };
        let latch = match mode {
            LockMode::Shared => Latch::Shared(frame.read_arc()),
            LockMode::Exclusive => Latch::Exclusive(frame.write_arc()),
            LockMode::Cleanup => {
                if let Some(g) = frame.try_write_arc() {
                    Latch::Exclusive(g)
                } else {
                    let started = Instant::now();
                    let g = frame.write_arc();
                    debug!(
                        page = id,
                        waited_us = started.elapsed().as_micros() as u64,
                        "cleanup lock waited for readers"
                    );
                    Latch::Exclusive(g)
                }
            }
        };
        Ok(PageHandle { id, latch })
    }

    pub fn begin_atomic_write(&self) -> Txn {
        Txn { staged: Vec::new() }
    }

    /// Persist and publish every shadow page in `txn`, or none of them.
    #[instrument(skip(self, txn), fields(pages = txn.staged.len()))]
    pub fn commit(&self, txn: Txn) -> Result<()> {
        let Txn { staged } = txn;
        if staged.is_empty() {
            return Ok(());
        }

        let images: Vec<(PageId, bytes::Bytes)> = staged
            .iter()
            .map(|(handle, shadow)| (handle.id(), shadow.to_bytes()))
            .collect();
        if let Err(e) = self.backend.persist(&images) {
            metrics::ATOMIC_WRITES_TOTAL
                .with_label_values(&["failed"])
                .inc();
            warn!(error = %e, "atomic write failed, shadows discarded");
            return Err(e);
        }

        for (mut handle, shadow) in staged {
            *handle.page_mut()? = shadow;
        }
        metrics::ATOMIC_WRITES_TOTAL
            .with_label_values(&["committed"])
            .inc();
        Ok(())
    }

    /// Discard a transaction, releasing its latches.
    pub fn abort(&self, txn: Txn) {
        if !txn.is_empty() {
            metrics::ATOMIC_WRITES_TOTAL
                .with_label_values(&["aborted"])
                .inc();
        }
        drop(txn);
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::MemoryBackend;
    use crate::types::INVALID_PAGE;

    const KIND: u16 = 7;

    fn store() -> (PageStore, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let store = PageStore::with_backend(1024, backend.clone()).unwrap();
        (store, backend)
    }

    fn new_page(store: &PageStore) -> PageId {
        let ext = store.lock_extension();
        let handle = store.allocate_page(&ext).unwrap();
        drop(ext);
        let id = handle.id();
        let mut txn = store.begin_atomic_write();
        let slot = txn.register(handle).unwrap();
        txn.page_mut(slot).init(KIND);
        store.commit(txn).unwrap();
        id
    }

    #[test]
    fn test_allocate_assigns_sequential_ids() {
        let (store, _) = store();
        assert_eq!(new_page(&store), 0);
        assert_eq!(new_page(&store), 1);
        assert_eq!(store.page_count(), 2);
    }

    #[test]
    fn test_commit_publishes_all_pages() {
        let (store, backend) = store();
        let a = new_page(&store);
        let b = new_page(&store);

        let mut txn = store.begin_atomic_write();
        let sa = txn.register(store.read(a, LockMode::Exclusive).unwrap()).unwrap();
        let sb = txn.register(store.read(b, LockMode::Exclusive).unwrap()).unwrap();
        txn.page_mut(sa).add_item(b"left").unwrap();
        txn.page_mut(sb).set_next_page(a);
        assert!(txn.is_dirty());
        store.commit(txn).unwrap();

        assert_eq!(store.read(a, LockMode::Shared).unwrap().item(0).unwrap(), b"left");
        assert_eq!(store.read(b, LockMode::Shared).unwrap().next_page(), a);
        assert_eq!(backend.batches(), 3);
    }

    #[test]
    fn test_abort_discards_shadows() {
        let (store, _) = store();
        let a = new_page(&store);
        let mut txn = store.begin_atomic_write();
        let slot = txn.register(store.read(a, LockMode::Exclusive).unwrap()).unwrap();
        txn.page_mut(slot).add_item(b"never").unwrap();
        store.abort(txn);
        assert_eq!(store.read(a, LockMode::Shared).unwrap().item_count(), 0);
    }

    #[test]
    fn test_failed_persist_leaves_pages_untouched() {
        let (store, backend) = store();
        let a = new_page(&store);
        let b = new_page(&store);

        let mut txn = store.begin_atomic_write();
        let sa = txn.register(store.read(a, LockMode::Exclusive).unwrap()).unwrap();
        let sb = txn.register(store.read(b, LockMode::Exclusive).unwrap()).unwrap();
        txn.page_mut(sa).add_item(b"one").unwrap();
        txn.page_mut(sb).add_item(b"two").unwrap();
        backend.fail_next_persist();
        assert!(store.commit(txn).is_err());

        assert_eq!(store.read(a, LockMode::Shared).unwrap().item_count(), 0);
        assert_eq!(store.read(b, LockMode::Shared).unwrap().item_count(), 0);
    }

    #[test]
    fn test_register_requires_exclusive_latch() {
        let (store, _) = store();
        let a = new_page(&store);
        let mut txn = store.begin_atomic_write();
        let err = txn.register(store.read(a, LockMode::Shared).unwrap());
        assert!(matches!(err, Err(IvfError::NotExclusive { .. })));
    }

    #[test]
    fn test_read_out_of_range() {
        let (store, _) = store();
        assert!(matches!(
            store.read(3, LockMode::Shared),
            Err(IvfError::PageOutOfRange { page: 3, count: 0 })
        ));
    }

    #[test]
    fn test_uncommitted_allocation_reads_as_new() {
        let (store, _) = store();
        let ext = store.lock_extension();
        let handle = store.allocate_page(&ext).unwrap();
        let id = handle.id();
        drop(handle);
        drop(ext);
        let page = store.read(id, LockMode::Shared).unwrap();
        assert!(page.is_new());
        assert_eq!(page.next_page(), INVALID_PAGE);
    }

    #[test]
    fn test_cleanup_lock_waits_for_reader() {
        let (store, _) = store();
        let a = new_page(&store);
        let store = Arc::new(store);
        let reader = store.read(a, LockMode::Shared).unwrap();

        let s = store.clone();
        let cleaner = std::thread::spawn(move || {
            let handle = s.read(a, LockMode::Cleanup).unwrap();
            handle.is_exclusive()
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        drop(reader);
        assert!(cleaner.join().unwrap());
    }

    #[test]
    fn test_invalid_page_size_rejected() {
        assert!(PageStore::new(100, MemoryBackend::new()).is_err());
        assert!(PageStore::new(65_536, MemoryBackend::new()).is_err());
    }
}
