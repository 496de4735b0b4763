//! Dead-entry removal.
//!
//! Every list chain is walked under cleanup locks; entries the caller reports
//! as dead are compacted away page by page. Each page is its own atomic
//! write, so an interrupted vacuum leaves every page either fully swept or
//! untouched.

use tracing::{debug, info};

use super::layout::{self, Entry};
use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::metric::VectorType;
use crate::metrics;
use crate::storage::{LockMode, PageStore};
use crate::types::{PageId, RowRef, INVALID_PAGE};

/// Counters accumulated across [`bulk_delete`] and [`vacuum_cleanup`] calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VacuumStats {
    pub tuples_removed: u64,
    pub num_index_tuples: u64,
    pub num_pages: u32,
}

/// Remove every entry for which `is_dead` returns true.
pub fn bulk_delete<F>(
    store: &PageStore,
    vector_type: &dyn VectorType,
    stats: &mut VacuumStats,
    mut is_dead: F,
    cancel: &CancellationToken,
) -> Result<()>
where
    F: FnMut(RowRef) -> bool,
{
    let removed_before = stats.tuples_removed;
    let lists = layout::read_directory(store, vector_type)?;

    for (list, (addr, entry)) in lists.iter().enumerate() {
        let mut next = entry.start_page;
        let mut first_freed: PageId = INVALID_PAGE;

        while next != INVALID_PAGE {
            cancel.check()?;
            let handle = store.read(next, LockMode::Cleanup)?;
            let page_id = next;
            let mut dead = Vec::new();
            for slot in 0..handle.item_count() {
                let row = Entry::row_of(layout::item(&handle, page_id, slot)?)?;
                if is_dead(row) {
                    dead.push(slot);
                    stats.tuples_removed += 1;
                } else {
                    stats.num_index_tuples += 1;
                }
            }
            next = handle.next_page();

            let mut txn = store.begin_atomic_write();
            let slot = txn.register(handle)?;
            if dead.is_empty() {
                store.abort(txn);
                continue;
            }
            if first_freed == INVALID_PAGE {
                first_freed = page_id;
            }
            txn.page_mut(slot).multi_delete(&dead);
            store.commit(txn)?;
            debug!(list, page = page_id, removed = dead.len(), "compacted entry page");
        }

        if first_freed != INVALID_PAGE {
            layout::update_list(store, *addr, None, first_freed)?;
        }
    }

    let removed = stats.tuples_removed - removed_before;
    metrics::VACUUM_REMOVED_TOTAL.inc_by(removed);
    info!(
        lists = lists.len(),
        removed,
        live = stats.num_index_tuples,
        "bulk delete complete"
    );
    Ok(())
}

/// Finish a vacuum cycle by recording the physical page count.
pub fn vacuum_cleanup(store: &PageStore, stats: &mut VacuumStats) {
    stats.num_pages = store.page_count();
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::build::{build, BuildOptions};
    use crate::index::layout::read_directory;
    use crate::metric::{F32Vector, OpClass};
    use crate::source::TableSource;
    use crate::storage::MemoryBackend;

    fn built(n: usize, lists: usize) -> PageStore {
        let store = PageStore::new(8192, MemoryBackend::new()).unwrap();
        let source = TableSource::from_vectors(10, (0..n).map(|i| vec![i as f32, (i % 7) as f32]));
        let options = BuildOptions::new(2, lists).with_seed(5);
        build(&store, &source, &OpClass::l2(), &options, &CancellationToken::new()).unwrap();
        store
    }

    fn live_rows(store: &PageStore) -> u64 {
        let mut stats = VacuumStats::default();
        bulk_delete(store, &F32Vector, &mut stats, |_| false, &CancellationToken::new()).unwrap();
        stats.num_index_tuples
    }

    #[test]
    fn test_removes_every_third_row() {
        let store = built(300, 5);
        let mut stats = VacuumStats::default();
        let mut seen = 0u64;
        bulk_delete(
            &store,
            &F32Vector,
            &mut stats,
            |row| {
                seen += 1;
                // Ten rows per block, offsets start at 1.
                let index = row.block() as u64 * 10 + row.offset() as u64 - 1;
                index % 3 == 0
            },
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(seen, 300);
        assert_eq!(stats.tuples_removed, 100);
        assert_eq!(stats.num_index_tuples, 200);

        vacuum_cleanup(&store, &mut stats);
        assert_eq!(stats.num_pages, store.page_count());
        assert_eq!(live_rows(&store), 200);
    }

    #[test]
    fn test_nothing_dead_changes_nothing() {
        let store = built(100, 2);
        let before = read_directory(&store, &F32Vector).unwrap();
        assert_eq!(live_rows(&store), 100);
        assert_eq!(read_directory(&store, &F32Vector).unwrap(), before);
    }

    #[test]
    fn test_start_pages_never_move_and_hints_never_regress() {
        let store = built(300, 3);
        let before = read_directory(&store, &F32Vector).unwrap();
        let mut stats = VacuumStats::default();
        bulk_delete(&store, &F32Vector, &mut stats, |_| true, &CancellationToken::new()).unwrap();
        assert_eq!(stats.tuples_removed, 300);

        let after = read_directory(&store, &F32Vector).unwrap();
        for ((_, b), (_, a)) in before.iter().zip(&after) {
            assert_eq!(a.start_page, b.start_page);
            assert!(a.insert_page >= b.insert_page);
        }
    }

    #[test]
    fn test_cancellation_stops_the_sweep() {
        let store = built(50, 2);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut stats = VacuumStats::default();
        let err = bulk_delete(&store, &F32Vector, &mut stats, |_| true, &cancel);
        assert!(err.is_err());
        assert_eq!(live_rows(&store), 50);
    }
}
