//! IVF-Flat index over a page store.
//!
//! Vectors are partitioned into lists by nearest trained center. Each list
//! is an append-only chain of entry pages; a scan probes only the lists
//! whose centers are closest to the query.

pub mod build;
pub mod insert;
pub mod kmeans;
pub mod layout;
pub mod sampler;
pub mod scan;
pub mod vacuum;

use std::sync::Arc;

use serde::Serialize;

pub use build::{BuildOptions, BuildResult};
pub use scan::{OrderBy, ProbeScanner, ScanItem, ScanOptions};
pub use vacuum::VacuumStats;

use crate::cancel::CancellationToken;
use crate::error::{IvfError, Result};
use crate::metric::OpClass;
use crate::source::RowSource;
use crate::storage::{LockMode, PageStore};
use crate::types::{PageId, RowRef, INVALID_PAGE};
use layout::MetaPage;

/// Per-list occupancy, as reported by [`IvfIndex::list_stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListStats {
    pub list: usize,
    pub start_page: PageId,
    pub insert_page: PageId,
    pub pages: usize,
    pub entries: usize,
}

/// Handle on a built index: its page store, opclass and meta page.
#[derive(Clone)]
pub struct IvfIndex {
    store: Arc<PageStore>,
    opclass: OpClass,
    meta: MetaPage,
}

impl std::fmt::Debug for IvfIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IvfIndex")
            .field("opclass", &self.opclass)
            .field("dimensions", &self.meta.dimensions)
            .field("lists", &self.meta.lists)
            .field("pages", &self.store.page_count())
            .finish()
    }
}

impl IvfIndex {
    /// Build over `source` into an empty store.
    pub fn build(
        store: Arc<PageStore>,
        source: &dyn RowSource,
        opclass: OpClass,
        options: &BuildOptions,
        cancel: &CancellationToken,
    ) -> Result<(Self, BuildResult)> {
        let result = build::build(&store, source, &opclass, options, cancel)?;
        Ok((Self::open(store, opclass)?, result))
    }

    /// Initialize an index with no rows.
    pub fn build_empty(
        store: Arc<PageStore>,
        opclass: OpClass,
        options: &BuildOptions,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        build::build_empty(&store, &opclass, options, cancel)?;
        Self::open(store, opclass)
    }

    /// Attach to an index previously built in `store`.
    pub fn open(store: Arc<PageStore>, opclass: OpClass) -> Result<Self> {
        let meta = MetaPage::load(&store)?;
        Ok(Self {
            store,
            opclass,
            meta,
        })
    }

    pub fn store(&self) -> &Arc<PageStore> {
        &self.store
    }

    pub fn opclass(&self) -> &OpClass {
        &self.opclass
    }

    pub fn dimensions(&self) -> usize {
        self.meta.dimensions
    }

    pub fn lists(&self) -> usize {
        self.meta.lists
    }

    /// Add one row; `Ok(false)` when the value was skipped.
    pub fn insert(&self, value: Option<&[f32]>, row: RowRef) -> Result<bool> {
        insert::insert(&self.store, &self.opclass, self.meta.dimensions, value, row)
    }

    pub fn scan(
        &self,
        order_by: Option<OrderBy>,
        options: ScanOptions,
        cancel: &CancellationToken,
    ) -> Result<ProbeScanner<'_>> {
        ProbeScanner::begin(
            &self.store,
            &self.opclass,
            self.meta.dimensions,
            self.meta.lists,
            order_by,
            options,
            cancel,
        )
    }

    /// The `k` nearest rows found by probing, closest first within each batch.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        options: ScanOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<ScanItem>> {
        self.scan(Some(OrderBy::Vector(query.to_vec())), options, cancel)?
            .take(k)
            .collect()
    }

    pub fn bulk_delete<F>(
        &self,
        stats: &mut VacuumStats,
        is_dead: F,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        F: FnMut(RowRef) -> bool,
    {
        vacuum::bulk_delete(&self.store, self.opclass.vector_type(), stats, is_dead, cancel)
    }

    pub fn vacuum_cleanup(&self, stats: &mut VacuumStats) {
        vacuum::vacuum_cleanup(&self.store, stats);
    }

    /// Walk every list and report its pages and entry count.
    pub fn list_stats(&self) -> Result<Vec<ListStats>> {
        let lists = layout::read_directory(&self.store, self.opclass.vector_type())?;
        if lists.len() != self.meta.lists {
            return Err(IvfError::corrupt(
                layout::FIRST_DIRECTORY_PAGE,
                format!(
                    "directory holds {} lists, meta page says {}",
                    lists.len(),
                    self.meta.lists
                ),
            ));
        }
        let mut stats = Vec::with_capacity(lists.len());
        for (list, (_, entry)) in lists.into_iter().enumerate() {
            let mut pages = 0;
            let mut entries = 0;
            let mut next = entry.start_page;
            while next != INVALID_PAGE {
                let page = self.store.read(next, LockMode::Shared)?;
                pages += 1;
                entries += page.item_count();
                next = page.next_page();
            }
            stats.push(ListStats {
                list,
                start_page: entry.start_page,
                insert_page: entry.insert_page,
                pages,
                entries,
            });
        }
        Ok(stats)
    }
}
