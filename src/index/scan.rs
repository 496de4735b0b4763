//! Ordered scans over the nearest lists.
//!
//! A scan first ranks every list center against the query and keeps the
//! closest `max_probes` lists. It then reads lists in batches of `probes`:
//! each batch's entries are sorted by distance and streamed before the next
//! batch is read. Results are therefore ordered within a batch; with
//! iterative scans later batches may return rows closer than earlier ones.

use std::collections::BinaryHeap;

use tracing::{debug, instrument};

use super::layout::{self, Entry};
use crate::cancel::CancellationToken;
use crate::config::ScanConfig;
use crate::error::{IvfError, Result};
use crate::metric::OpClass;
use crate::metrics;
use crate::sort::{ExternalSorter, OrderedDistance, SortedIter};
use crate::storage::{LockMode, PageStore};
use crate::types::{IterativeScan, PageId, ReadConsistency, RowRef, INVALID_PAGE};

/// The ranking operand of a scan.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderBy {
    Vector(Vec<f32>),
    /// A null operand: every row ranks at distance 0.
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanItem {
    pub row: RowRef,
    pub distance: f64,
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub probes: usize,
    pub max_probes: usize,
    pub iterative_scan: IterativeScan,
    pub consistency: ReadConsistency,
    /// In-memory budget of each batch sort, in bytes.
    pub sort_memory: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            probes: 1,
            max_probes: crate::config::MAX_LISTS,
            iterative_scan: IterativeScan::Off,
            consistency: ReadConsistency::Snapshot,
            sort_memory: 4 * 1024 * 1024,
        }
    }
}

impl ScanOptions {
    pub fn from_config(config: &ScanConfig) -> Self {
        Self {
            probes: config.probes,
            max_probes: config.max_probes,
            iterative_scan: config.iterative_scan,
            consistency: ReadConsistency::Snapshot,
            sort_memory: config.sort_memory_bytes(),
        }
    }

    pub fn with_probes(mut self, probes: usize) -> Self {
        self.probes = probes;
        self
    }

    /// `(probes, max_probes)` for an index of `lists` lists.
    pub fn effective_probes(&self, lists: usize) -> (usize, usize) {
        let lists = lists.max(1);
        let probes = self.probes.clamp(1, lists);
        let max_probes = match self.iterative_scan {
            IterativeScan::Off => probes,
            IterativeScan::RelaxedOrder => self.max_probes.max(probes).clamp(1, lists),
        };
        (probes, max_probes)
    }
}

/// A list picked for probing.
#[derive(Debug, Clone, Copy)]
struct ProbeList {
    start_page: PageId,
    distance: f64,
}

impl PartialEq for ProbeList {
    fn eq(&self, other: &Self) -> bool {
        self.distance.total_cmp(&other.distance).is_eq()
    }
}

impl Eq for ProbeList {}

impl PartialOrd for ProbeList {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProbeList {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.distance.total_cmp(&other.distance)
    }
}

/// Cursor over one index scan. Call [`ProbeScanner::rescan`] to start over
/// with a new operand.
pub struct ProbeScanner<'a> {
    store: &'a PageStore,
    opclass: &'a OpClass,
    dimensions: usize,
    lists: usize,
    options: ScanOptions,
    query: Option<Vec<f32>>,
    probe_lists: Vec<ProbeList>,
    next_list: usize,
    batch: Option<SortedIter<OrderedDistance, u64>>,
    started: bool,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ProbeScanner<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeScanner")
            .field("opclass", self.opclass)
            .field("dimensions", &self.dimensions)
            .field("lists", &self.lists)
            .field("probe_lists", &self.probe_lists.len())
            .field("next_list", &self.next_list)
            .finish()
    }
}

impl<'a> ProbeScanner<'a> {
    /// Open a scan. Fails when no ranking operand is given or when the read is
    /// not snapshot-consistent. `cancel` is polled per directory entry and per
    /// list page.
    pub fn begin(
        store: &'a PageStore,
        opclass: &'a OpClass,
        dimensions: usize,
        lists: usize,
        order_by: Option<OrderBy>,
        options: ScanOptions,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        if options.consistency != ReadConsistency::Snapshot {
            return Err(IvfError::UnsupportedSnapshot);
        }
        let mut scanner = Self {
            store,
            opclass,
            dimensions,
            lists,
            options,
            query: None,
            probe_lists: Vec::new(),
            next_list: 0,
            batch: None,
            started: false,
            cancel: cancel.clone(),
        };
        scanner.rescan(order_by)?;
        metrics::SCANS_TOTAL.inc();
        Ok(scanner)
    }

    /// Reset the cursor with a new ranking operand.
    pub fn rescan(&mut self, order_by: Option<OrderBy>) -> Result<()> {
        let query = match order_by.ok_or(IvfError::MissingOrderBy)? {
            OrderBy::Null => None,
            OrderBy::Vector(v) => {
                if v.len() != self.dimensions {
                    return Err(IvfError::DimensionMismatch {
                        expected: self.dimensions,
                        actual: v.len(),
                    });
                }
                Some(self.opclass.prepare_query(&v))
            }
        };
        self.query = query;
        self.probe_lists.clear();
        self.next_list = 0;
        self.batch = None;
        self.started = false;
        Ok(())
    }

    fn distance(&self, v: &[f32]) -> f64 {
        match &self.query {
            Some(q) => self.opclass.distance(q, v),
            None => 0.0,
        }
    }

    /// Keep the `max_probes` closest lists, nearest first.
    #[instrument(skip(self))]
    fn select_lists(&mut self) -> Result<()> {
        let (_, max_probes) = self.options.effective_probes(self.lists);
        let mut heap: BinaryHeap<ProbeList> = BinaryHeap::with_capacity(max_probes);

        for (_, list) in layout::read_directory(self.store, self.opclass.vector_type())? {
            self.cancel.check()?;
            let candidate = ProbeList {
                start_page: list.start_page,
                distance: self.distance(&list.center),
            };
            if heap.len() < max_probes {
                heap.push(candidate);
            } else if let Some(mut top) = heap.peek_mut() {
                if candidate.distance < top.distance {
                    *top = candidate;
                }
            }
        }

        self.probe_lists = heap.into_sorted_vec();
        debug!(selected = self.probe_lists.len(), "selected lists to probe");
        Ok(())
    }

    /// Read the next `probes` lists into a sorted batch.
    fn load_batch(&mut self) -> Result<()> {
        let (probes, _) = self.options.effective_probes(self.lists);
        let end = (self.next_list + probes).min(self.probe_lists.len());
        let mut sorter: ExternalSorter<OrderedDistance, u64> =
            ExternalSorter::new(self.options.sort_memory);
        let vector_type = self.opclass.vector_type();

        for list in &self.probe_lists[self.next_list..end] {
            let mut next = list.start_page;
            while next != INVALID_PAGE {
                self.cancel.check()?;
                let page = self.store.read(next, LockMode::Shared)?;
                for slot in 0..page.item_count() {
                    let entry = Entry::decode(layout::item(&page, next, slot)?, vector_type)?;
                    sorter.push(OrderedDistance(self.distance(&entry.vector)), entry.row.0)?;
                }
                next = page.next_page();
            }
        }
        metrics::LISTS_PROBED_TOTAL.inc_by((end - self.next_list) as u64);
        debug!(
            from = self.next_list,
            to = end,
            entries = sorter.len(),
            "scanned list batch"
        );
        self.next_list = end;
        self.batch = Some(sorter.finish()?);
        Ok(())
    }

    /// The next row in approximate distance order, or `None` when done.
    pub fn next_item(&mut self) -> Result<Option<ScanItem>> {
        if !self.started {
            self.select_lists()?;
            self.started = true;
        }
        loop {
            if let Some(batch) = self.batch.as_mut() {
                if let Some(next) = batch.next() {
                    let (distance, row) = next?;
                    return Ok(Some(ScanItem {
                        row: RowRef(row),
                        distance: distance.0,
                    }));
                }
            }
            if self.next_list >= self.probe_lists.len() {
                self.batch = None;
                return Ok(None);
            }
            self.load_batch()?;
        }
    }
}

impl Iterator for ProbeScanner<'_> {
    type Item = Result<ScanItem>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_item().transpose()
    }
}
