//! Index build: train centers, lay out the meta page and list directory,
//! then bulk-load every row into its list's page run.
//!
//! Rows are assigned to lists in one pass over the source and fed through an
//! external sort keyed by list id, so each list's pages are written once, in
//! order, without holding the whole index in memory.

use std::iter::Peekable;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use super::kmeans::{self, TrainingParams};
use super::layout::{
    self, Entry, ListAddr, ListEntry, MetaPage, DIRECTORY_KIND, ENTRY_KIND, META_KIND,
};
use super::sampler;
use crate::cancel::CancellationToken;
use crate::config::{Config, MAX_LISTS, MIN_LISTS};
use crate::error::{IvfError, Result};
use crate::metric::OpClass;
use crate::metrics;
use crate::sort::{ExternalSorter, SortedIter};
use crate::source::RowSource;
use crate::storage::{LockMode, Page, PageStore, Slot, Txn};
use crate::types::PageId;

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub dimensions: usize,
    pub lists: usize,
    /// Configured ceiling; the vector type's own limit also applies.
    pub max_dimensions: usize,
    pub training: TrainingParams,
    /// In-memory budget of the assignment sort, in bytes.
    pub sort_memory: usize,
    /// Fixed seed for sampling and training; random when unset.
    pub seed: Option<u64>,
}

impl BuildOptions {
    pub fn new(dimensions: usize, lists: usize) -> Self {
        Self {
            dimensions,
            lists,
            max_dimensions: usize::MAX,
            training: TrainingParams::default(),
            sort_memory: 4 * 1024 * 1024,
            seed: None,
        }
    }

    pub fn from_config(config: &Config, dimensions: usize) -> Self {
        Self {
            dimensions,
            lists: config.index.lists,
            max_dimensions: config.index.max_dimensions,
            training: TrainingParams {
                max_iterations: config.training.max_iterations,
                memory_limit: config.training.memory_limit_bytes(),
            },
            sort_memory: config.scan.sort_memory_bytes(),
            seed: config.training.seed,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildResult {
    /// Rows visited in the source, nulls included.
    pub heap_tuples: u64,
    /// Entries written to list pages.
    pub index_tuples: u64,
    pub samples: usize,
    pub pages: u32,
}

/// Reject anything that would fail the build before a page is written.
fn check_options(store: &PageStore, opclass: &OpClass, options: &BuildOptions) -> Result<()> {
    let pages = store.page_count();
    if pages != 0 {
        return Err(IvfError::AlreadyBuilt { pages });
    }

    let dimensions = options.dimensions;
    let max = opclass
        .vector_type()
        .max_dimensions()
        .min(options.max_dimensions);
    if dimensions == 0 {
        return Err(IvfError::InvalidParameter(
            "column does not have dimensions".into(),
        ));
    }
    if dimensions > max {
        return Err(IvfError::DimensionsExceeded {
            max,
            actual: dimensions,
        });
    }
    if !(MIN_LISTS..=MAX_LISTS).contains(&options.lists) {
        return Err(IvfError::InvalidParameter(format!(
            "lists must be in {MIN_LISTS}..={MAX_LISTS}, got {}",
            options.lists
        )));
    }
    if dimensions == 1 && opclass.kmeans_normalizer().is_some() {
        return Err(IvfError::InvalidParameter(format!(
            "{} opclass needs at least 2 dimensions",
            opclass.name()
        )));
    }

    let room = Page::max_item_size(store.page_size());
    let vector_type = opclass.vector_type();
    let widest = ListEntry::encoded_size(vector_type, dimensions)
        .max(Entry::encoded_size(vector_type, dimensions));
    if widest > room {
        return Err(IvfError::ResourceLimit(format!(
            "{dimensions}-dimension {} items need {widest} bytes, a page holds {room}",
            vector_type.name()
        )));
    }
    Ok(())
}

/// Build an index over `source` into an empty page store.
pub fn build(
    store: &PageStore,
    source: &dyn RowSource,
    opclass: &OpClass,
    options: &BuildOptions,
    cancel: &CancellationToken,
) -> Result<BuildResult> {
    build_index(store, Some(source), opclass, options, cancel)
}

/// Initialize an index with no rows: random centers and one empty page per list.
pub fn build_empty(
    store: &PageStore,
    opclass: &OpClass,
    options: &BuildOptions,
    cancel: &CancellationToken,
) -> Result<BuildResult> {
    build_index(store, None, opclass, options, cancel)
}

fn build_index(
    store: &PageStore,
    source: Option<&dyn RowSource>,
    opclass: &OpClass,
    options: &BuildOptions,
    cancel: &CancellationToken,
) -> Result<BuildResult> {
    check_options(store, opclass, options)?;
    let started = Instant::now();
    let mut rng = match options.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    info!(
        dimensions = options.dimensions,
        lists = options.lists,
        opclass = opclass.name(),
        vector_type = opclass.vector_type().name(),
        "building ivfflat index"
    );

    // Centers
    let phase = Instant::now();
    let need = sampler::sample_target(options.lists, source.is_some());
    let samples = match source {
        Some(source) => {
            sampler::sample_rows(source, opclass, options.dimensions, need, &mut rng, cancel)?
        }
        None => Vec::new(),
    };
    if source.is_some() {
        sampler::warn_if_sparse(samples.len(), options.lists);
    }
    observe_phase("sample", phase);

    let phase = Instant::now();
    let centers = kmeans::train_centers(
        &samples,
        options.lists,
        options.dimensions,
        opclass,
        &options.training,
        &mut rng,
        cancel,
    )?;
    observe_phase("kmeans", phase);

    // Meta page and directory
    write_meta(store, &MetaPage::new(options.dimensions, options.lists))?;
    let addrs = write_directory(store, opclass, &centers)?;
    debug!(lists = addrs.len(), "wrote list directory");

    // Assignment
    let phase = Instant::now();
    let mut sorter: ExternalSorter<u32, Vec<u8>> = ExternalSorter::new(options.sort_memory);
    let mut heap_tuples = 0u64;
    if let Some(source) = source {
        source.scan_all(&mut |row, value| {
            heap_tuples += 1;
            if heap_tuples % 1024 == 0 {
                cancel.check()?;
            }
            let Some(value) = value else {
                return Ok(());
            };
            if value.len() != options.dimensions {
                return Err(IvfError::DimensionMismatch {
                    expected: options.dimensions,
                    actual: value.len(),
                });
            }
            let Some(value) = opclass.prepare_row(value) else {
                metrics::ROWS_SKIPPED_TOTAL
                    .with_label_values(&["zero_norm"])
                    .inc();
                return Ok(());
            };
            let list = nearest_center(opclass, &centers, &value);
            sorter.push(list as u32, Entry::encode(&value, row, opclass.vector_type()))
        })?;
    }
    let index_tuples = sorter.len();
    debug!(
        heap_tuples,
        index_tuples,
        spilled_runs = sorter.spilled_runs(),
        "assigned rows to lists"
    );
    observe_phase("assign", phase);

    // Bulk load
    let phase = Instant::now();
    let mut sorted = sorter.finish()?.peekable();
    for (list, addr) in addrs.iter().enumerate() {
        cancel.check()?;
        let mut writer = ChainWriter::start(store, ENTRY_KIND)?;
        let mut count = 0usize;
        while let Some(bytes) = take_for_list(&mut sorted, list as u32)? {
            writer.add(&bytes)?;
            count += 1;
        }
        let (start, last) = writer.finish()?;
        layout::update_list(store, *addr, Some(start), last)?;
        debug!(list, rows = count, start_page = start, insert_page = last, "loaded list");
    }
    observe_phase("load", phase);

    let result = BuildResult {
        heap_tuples,
        index_tuples,
        samples: samples.len(),
        pages: store.page_count(),
    };
    info!(
        heap_tuples = result.heap_tuples,
        index_tuples = result.index_tuples,
        pages = result.pages,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "ivfflat index build complete"
    );
    Ok(result)
}

fn observe_phase(phase: &str, started: Instant) {
    metrics::BUILD_DURATION
        .with_label_values(&[phase])
        .observe(started.elapsed().as_secs_f64());
}

/// Index of the closest center under the distance role; ties keep the first.
pub(crate) fn nearest_center(opclass: &OpClass, centers: &[Vec<f32>], value: &[f32]) -> usize {
    let mut best = 0;
    let mut min = f64::MAX;
    for (i, center) in centers.iter().enumerate() {
        let d = opclass.distance(value, center);
        if d < min {
            min = d;
            best = i;
        }
    }
    best
}

/// Pop the next sorted entry if it belongs to `list`.
fn take_for_list(
    sorted: &mut Peekable<SortedIter<u32, Vec<u8>>>,
    list: u32,
) -> Result<Option<Vec<u8>>> {
    match sorted.peek() {
        Some(Ok((key, _))) if *key == list => {}
        Some(Ok(_)) | None => return Ok(None),
        Some(Err(_)) => {}
    }
    match sorted.next() {
        Some(Ok((_, bytes))) => Ok(Some(bytes)),
        Some(Err(e)) => Err(e),
        None => Ok(None),
    }
}

fn write_meta(store: &PageStore, meta: &MetaPage) -> Result<()> {
    let handle = {
        let ext = store.lock_extension();
        store.allocate_page(&ext)?
    };
    let id = handle.id();
    let mut txn = store.begin_atomic_write();
    let slot = txn.register(handle)?;
    let page = txn.page_mut(slot);
    page.init(META_KIND);
    let bytes = meta.encode();
    page.add_item(&bytes).ok_or(IvfError::PageFull {
        page: id,
        size: bytes.len(),
    })?;
    store.commit(txn)
}

fn write_directory(
    store: &PageStore,
    opclass: &OpClass,
    centers: &[Vec<f32>],
) -> Result<Vec<ListAddr>> {
    let mut writer = ChainWriter::start(store, DIRECTORY_KIND)?;
    let mut addrs = Vec::with_capacity(centers.len());
    for center in centers {
        let bytes = ListEntry::unset(center.clone()).encode(opclass.vector_type());
        let (page, slot) = writer.add(&bytes)?;
        addrs.push(ListAddr { page, slot });
    }
    writer.finish()?;
    Ok(addrs)
}

/// Appends items to a fresh chain of pages, linking a new page whenever the
/// current one fills.
///
/// Each full page is committed together with the initialization of its
/// successor, so the chain on disk never points at an unformatted page.
struct ChainWriter<'a> {
    store: &'a PageStore,
    kind: u16,
    txn: Txn,
    slot: Slot,
    first: PageId,
}

impl<'a> ChainWriter<'a> {
    fn start(store: &'a PageStore, kind: u16) -> Result<Self> {
        let handle = {
            let ext = store.lock_extension();
            store.allocate_page(&ext)?
        };
        let first = handle.id();
        let mut txn = store.begin_atomic_write();
        let slot = txn.register(handle)?;
        txn.page_mut(slot).init(kind);
        Ok(Self {
            store,
            kind,
            txn,
            slot,
            first,
        })
    }

    fn add(&mut self, item: &[u8]) -> Result<(PageId, usize)> {
        if let Some(at) = self.txn.page_mut(self.slot).add_item(item) {
            return Ok((self.txn.page_id(self.slot), at));
        }

        let handle = {
            let ext = self.store.lock_extension();
            self.store.allocate_page(&ext)?
        };
        let next = handle.id();
        let next_slot = self.txn.register(handle)?;
        self.txn.page_mut(next_slot).init(self.kind);
        self.txn.page_mut(self.slot).set_next_page(next);
        let full = std::mem::replace(&mut self.txn, self.store.begin_atomic_write());
        self.store.commit(full)?;

        self.slot = self
            .txn
            .register(self.store.read(next, LockMode::Exclusive)?)?;
        let at = self
            .txn
            .page_mut(self.slot)
            .add_item(item)
            .ok_or(IvfError::PageFull {
                page: next,
                size: item.len(),
            })?;
        Ok((next, at))
    }

    /// Commit the tail page; returns the first and last page of the chain.
    fn finish(self) -> Result<(PageId, PageId)> {
        let last = self.txn.page_id(self.slot);
        self.store.commit(self.txn)?;
        Ok((self.first, last))
    }
}
