//! End-to-end tests for building, scanning, inserting into and vacuuming an
//! index through the public API.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use common::harness::{row_index, uniform_points, TestHarness};
use ivfpage::index::layout::{read_directory, Entry};
use ivfpage::source::TableSource;
use ivfpage::storage::{LockMode, MemoryBackend, PageStore};
use ivfpage::types::INVALID_PAGE;
use ivfpage::{
    BuildOptions, CancellationToken, IvfError, IvfIndex, OpClass, OrderBy, RowRef, ScanOptions,
    VacuumStats,
};

const ROWS_PER_BLOCK: usize = 32;

fn token() -> CancellationToken {
    CancellationToken::new()
}

fn exhaustive(lists: usize) -> ScanOptions {
    ScanOptions::default().with_probes(lists)
}

/// Decoded vectors of every list, in directory order, with the list centers.
fn list_contents(index: &IvfIndex) -> (Vec<Vec<f32>>, Vec<Vec<Vec<f32>>>) {
    let vector_type = index.opclass().vector_type();
    let lists = read_directory(index.store(), vector_type).unwrap();
    let mut centers = Vec::with_capacity(lists.len());
    let mut contents = Vec::with_capacity(lists.len());
    for (_, list) in lists {
        let mut vectors = Vec::new();
        let mut next = list.start_page;
        while next != INVALID_PAGE {
            let page = index.store().read(next, LockMode::Shared).unwrap();
            for slot in 0..page.item_count() {
                let entry = Entry::decode(page.item(slot).unwrap(), vector_type).unwrap();
                vectors.push(entry.vector);
            }
            next = page.next_page();
        }
        centers.push(list.center);
        contents.push(vectors);
    }
    (centers, contents)
}

/// Index of the closest center; ties keep the first.
fn nearest(opclass: &OpClass, centers: &[Vec<f32>], v: &[f32]) -> usize {
    let mut best = 0;
    let mut min = f64::MAX;
    for (i, c) in centers.iter().enumerate() {
        let d = opclass.distance(v, c);
        if d < min {
            min = d;
            best = i;
        }
    }
    best
}

fn empty_index(dimensions: usize, lists: usize, opclass: OpClass) -> IvfIndex {
    let store = Arc::new(PageStore::new(8192, MemoryBackend::new()).unwrap());
    let options = BuildOptions::new(dimensions, lists).with_seed(3);
    IvfIndex::build_empty(store, opclass, &options, &CancellationToken::new()).unwrap()
}

// ---- Build and scan ----

/// Probing every list returns every row exactly once, nearest first.
#[test]
fn test_exhaustive_scan_is_exact_and_ordered() {
    let points = uniform_points(1000, 2, 0.0, 10.0, 42);
    let table = TableSource::from_vectors(ROWS_PER_BLOCK, points.clone());
    let h = TestHarness::memory(table, OpClass::l2(), BuildOptions::new(2, 5).with_seed(9));
    assert_eq!(h.result.heap_tuples, 1000);
    assert_eq!(h.result.index_tuples, 1000);

    let query = vec![5.0, 5.0];
    let results: Vec<_> = h
        .index
        .scan(Some(OrderBy::Vector(query.clone())), exhaustive(5), &token())
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(results.len(), 1000);

    let rows: HashSet<u64> = results.iter().map(|r| r.row.0).collect();
    assert_eq!(rows.len(), 1000, "every row appears once");
    for pair in results.windows(2) {
        assert!(pair[0].distance <= pair[1].distance);
    }

    let mut expected: Vec<f64> = points
        .iter()
        .map(|p| OpClass::l2().distance(p, &query))
        .collect();
    expected.sort_by(|a, b| a.total_cmp(b));
    for (got, want) in results.iter().zip(&expected) {
        assert!((got.distance - want).abs() < 1e-9);
    }

    let first = &results[0];
    let point = &points[row_index(first.row, ROWS_PER_BLOCK as u64) as usize];
    assert!((OpClass::l2().distance(point, &query) - first.distance).abs() < 1e-9);
}

/// Every stored row sits in the list whose center was nearest when it was
/// added, for both bulk-loaded and inserted rows.
#[test]
fn test_rows_live_in_their_nearest_list() {
    let table = TableSource::from_vectors(ROWS_PER_BLOCK, uniform_points(1000, 2, 0.0, 10.0, 42));
    let h = TestHarness::memory(table, OpClass::l2(), BuildOptions::new(2, 5).with_seed(9));
    for (i, p) in uniform_points(50, 2, 0.0, 10.0, 43).iter().enumerate() {
        assert!(h.index.insert(Some(p), RowRef(100_000 + i as u64)).unwrap());
    }

    let opclass = OpClass::l2();
    let (centers, contents) = list_contents(&h.index);
    assert_eq!(centers.len(), 5);
    assert_eq!(contents.iter().map(Vec::len).sum::<usize>(), 1050);
    for (list, vectors) in contents.iter().enumerate() {
        for v in vectors {
            assert_eq!(nearest(&opclass, &centers, v), list, "{v:?} misplaced");
        }
    }
}

#[test]
fn test_list_stats_cover_all_rows() {
    let table = TableSource::from_vectors(ROWS_PER_BLOCK, uniform_points(600, 4, -1.0, 1.0, 8));
    let h = TestHarness::memory(table, OpClass::l2(), BuildOptions::new(4, 6).with_seed(2));
    let stats = h.index.list_stats().unwrap();
    assert_eq!(stats.len(), 6);
    assert_eq!(stats.iter().map(|s| s.entries).sum::<usize>(), 600);
    for s in &stats {
        assert!(s.pages >= 1);
    }
}

/// A single probe only returns rows from the nearest list.
#[test]
fn test_single_probe_returns_subset() {
    let table = TableSource::from_vectors(ROWS_PER_BLOCK, uniform_points(800, 2, 0.0, 10.0, 4));
    let h = TestHarness::memory(table, OpClass::l2(), BuildOptions::new(2, 8).with_seed(5));
    let results = h
        .index
        .search(&[1.0, 1.0], 10_000, ScanOptions::default().with_probes(1), &token())
        .unwrap();
    assert!(!results.is_empty());
    assert!(results.len() < 800);
}

/// Null rows are counted as visited but never indexed.
#[test]
fn test_build_skips_null_rows() {
    let mut table = TableSource::new(ROWS_PER_BLOCK);
    for (i, p) in uniform_points(100, 3, 0.0, 1.0, 6).into_iter().enumerate() {
        table.push(if i % 10 == 0 { None } else { Some(p) });
    }
    let h = TestHarness::memory(table, OpClass::l2(), BuildOptions::new(3, 4).with_seed(1));
    assert_eq!(h.result.heap_tuples, 100);
    assert_eq!(h.result.index_tuples, 90);
}

/// Building over a table whose rows have the wrong width fails.
#[test]
fn test_build_rejects_dimension_mismatch() {
    let table = TableSource::from_vectors(ROWS_PER_BLOCK, uniform_points(50, 3, 0.0, 1.0, 6));
    let store = Arc::new(PageStore::new(8192, MemoryBackend::new()).unwrap());
    let err = IvfIndex::build(
        store,
        &table,
        OpClass::l2(),
        &BuildOptions::new(4, 2).with_seed(1),
        &CancellationToken::new(),
    )
    .unwrap_err();
    assert!(matches!(err, IvfError::DimensionMismatch { expected: 4, actual: 3 }));
}

/// A null operand ranks every row at distance zero.
#[test]
fn test_null_order_by_returns_all_rows_at_zero() {
    let table = TableSource::from_vectors(ROWS_PER_BLOCK, uniform_points(120, 2, 0.0, 1.0, 12));
    let h = TestHarness::memory(table, OpClass::l2(), BuildOptions::new(2, 3).with_seed(1));
    let results: Vec<_> = h
        .index
        .scan(Some(OrderBy::Null), exhaustive(3), &token())
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(results.len(), 120);
    assert!(results.iter().all(|r| r.distance == 0.0));
}

#[test]
fn test_scan_without_order_by_fails() {
    let index = empty_index(2, 2, OpClass::l2());
    let scan = index.scan(None, ScanOptions::default(), &token());
    assert!(matches!(scan, Err(IvfError::MissingOrderBy)));
}

#[test]
fn test_query_dimension_mismatch_fails() {
    let index = empty_index(3, 2, OpClass::l2());
    let scan = index.scan(Some(OrderBy::Vector(vec![1.0, 2.0])), ScanOptions::default(), &token());
    assert!(matches!(
        scan,
        Err(IvfError::DimensionMismatch { expected: 3, actual: 2 })
    ));
}

/// A scan cancelled before its first row returns `Cancelled` and stops.
#[test]
fn test_cancelled_scan_returns_cancelled() {
    let table = TableSource::from_vectors(ROWS_PER_BLOCK, uniform_points(200, 2, 0.0, 1.0, 5));
    let h = TestHarness::memory(table, OpClass::l2(), BuildOptions::new(2, 4).with_seed(1));
    let cancel = CancellationToken::new();
    let mut scan = h
        .index
        .scan(Some(OrderBy::Vector(vec![0.5, 0.5])), exhaustive(4), &cancel)
        .unwrap();
    cancel.cancel();
    assert!(matches!(scan.next(), Some(Err(IvfError::Cancelled))));

    let err = h.index.search(&[0.5, 0.5], 10, exhaustive(4), &cancel).unwrap_err();
    assert!(matches!(err, IvfError::Cancelled));
}

// ---- Insert ----

/// An empty index with many lists still finds its only row.
#[test]
fn test_empty_index_single_insert() {
    let index = empty_index(3, 100, OpClass::l2());
    assert!(index.insert(Some(&[0.5, 0.25, 0.75]), RowRef::new(0, 1)).unwrap());

    let results = index
        .search(&[0.5, 0.25, 0.75], 5, exhaustive(100), &token())
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].row, RowRef::new(0, 1));
    assert!(results[0].distance.abs() < 1e-9);
}

/// Cosine cannot place a zero vector, so it is skipped rather than stored.
#[test]
fn test_zero_vector_insert_under_cosine() {
    let index = empty_index(3, 4, OpClass::cosine());
    assert!(!index.insert(Some(&[0.0, 0.0, 0.0]), RowRef::new(0, 1)).unwrap());
    assert!(!index.insert(None, RowRef::new(0, 2)).unwrap());

    let results = index.search(&[1.0, 0.0, 0.0], 10, exhaustive(4), &token()).unwrap();
    assert!(results.is_empty());
}

#[test]
fn test_insert_dimension_mismatch_fails() {
    let index = empty_index(3, 4, OpClass::l2());
    let err = index.insert(Some(&[1.0, 2.0]), RowRef::new(0, 1)).unwrap_err();
    assert!(matches!(err, IvfError::DimensionMismatch { expected: 3, actual: 2 }));
}

/// Inserts that overflow a list's pages extend the chain.
#[test]
fn test_inserts_extend_list_chain() {
    let index = empty_index(64, 1, OpClass::l2());
    let points = uniform_points(500, 64, -1.0, 1.0, 77);
    for (i, p) in points.iter().enumerate() {
        assert!(index.insert(Some(p), RowRef(i as u64)).unwrap());
    }
    let stats = index.list_stats().unwrap();
    assert_eq!(stats[0].entries, 500);
    assert!(stats[0].pages > 1);
    assert_ne!(stats[0].start_page, stats[0].insert_page);
}

/// Writers on several threads never lose an entry.
#[test]
fn test_concurrent_inserts() {
    let index = empty_index(8, 4, OpClass::l2());
    let threads: Vec<_> = (0..4u64)
        .map(|t| {
            let index = index.clone();
            thread::spawn(move || {
                for (i, p) in uniform_points(250, 8, -1.0, 1.0, t).iter().enumerate() {
                    index.insert(Some(p), RowRef(t * 1000 + i as u64)).unwrap();
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let results = index.search(&[0.0; 8], usize::MAX, exhaustive(4), &token()).unwrap();
    let rows: HashSet<u64> = results.iter().map(|r| r.row.0).collect();
    assert_eq!(results.len(), 1000);
    assert_eq!(rows.len(), 1000);
}

// ---- Vacuum ----

/// Removing every third row leaves exactly the survivors visible.
#[test]
fn test_vacuum_removes_every_third_row() {
    let table = TableSource::from_vectors(ROWS_PER_BLOCK, uniform_points(300, 2, 0.0, 10.0, 21));
    let h = TestHarness::memory(table, OpClass::l2(), BuildOptions::new(2, 5).with_seed(4));
    let before = h.index.list_stats().unwrap();

    let dead = |row: RowRef| row_index(row, ROWS_PER_BLOCK as u64) % 3 == 0;
    let mut stats = VacuumStats::default();
    h.index
        .bulk_delete(&mut stats, dead, &CancellationToken::new())
        .unwrap();
    h.index.vacuum_cleanup(&mut stats);
    assert_eq!(stats.tuples_removed, 100);
    assert_eq!(stats.num_index_tuples, 200);
    assert!(stats.num_pages >= 1);

    let results = h.index.search(&[5.0, 5.0], usize::MAX, exhaustive(5), &token()).unwrap();
    assert_eq!(results.len(), 200);
    assert!(results.iter().all(|r| !dead(r.row)));

    let after = h.index.list_stats().unwrap();
    for (b, a) in before.iter().zip(&after) {
        assert_eq!(b.start_page, a.start_page);
        assert!(a.insert_page >= b.insert_page);
    }
}

/// Space freed on the insert page is reused before the chain grows.
#[test]
fn test_inserts_reuse_vacuumed_space() {
    let index = empty_index(64, 1, OpClass::l2());
    let points = uniform_points(400, 64, -1.0, 1.0, 31);
    for (i, p) in points.iter().enumerate() {
        index.insert(Some(p), RowRef(i as u64)).unwrap();
    }
    let pages_before = index.store().page_count();

    let mut stats = VacuumStats::default();
    index
        .bulk_delete(&mut stats, |row| row.0 >= 200, &CancellationToken::new())
        .unwrap();
    assert_eq!(stats.tuples_removed, 200);

    // The tail page was emptied, so a handful of rows fit without extending.
    for (i, p) in points.iter().take(10).enumerate() {
        index.insert(Some(p), RowRef(10_000 + i as u64)).unwrap();
    }
    assert_eq!(index.store().page_count(), pages_before);
    assert_eq!(index.list_stats().unwrap()[0].entries, 210);
}

#[test]
fn test_vacuum_honors_cancellation() {
    let table = TableSource::from_vectors(ROWS_PER_BLOCK, uniform_points(100, 2, 0.0, 1.0, 2));
    let h = TestHarness::memory(table, OpClass::l2(), BuildOptions::new(2, 2).with_seed(4));
    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut stats = VacuumStats::default();
    let err = h.index.bulk_delete(&mut stats, |_| true, &cancel).unwrap_err();
    assert!(matches!(err, IvfError::Cancelled));
}

// ---- Durability ----

/// A file-backed index answers the same queries after reopening.
#[test]
fn test_file_backed_index_survives_reopen() {
    let table = TableSource::from_vectors(ROWS_PER_BLOCK, uniform_points(400, 4, 0.0, 1.0, 13));
    let h = TestHarness::file(table, OpClass::l2(), BuildOptions::new(4, 4).with_seed(6));
    h.index.insert(Some(&[0.5; 4]), RowRef(99_999)).unwrap();

    let query = [0.5, 0.5, 0.5, 0.5];
    let before = h.index.search(&query, 20, exhaustive(4), &token()).unwrap();

    let reopened = h.reopen(OpClass::l2());
    assert_eq!(reopened.dimensions(), 4);
    assert_eq!(reopened.lists(), 4);
    let after = reopened.search(&query, 20, exhaustive(4), &token()).unwrap();
    assert_eq!(before, after);
    assert_eq!(after[0].row, RowRef(99_999));
}

/// Building into a store that already holds pages is refused.
#[test]
fn test_build_into_used_store_fails() {
    let index = empty_index(2, 2, OpClass::l2());
    let table = TableSource::from_vectors(ROWS_PER_BLOCK, uniform_points(10, 2, 0.0, 1.0, 1));
    let err = IvfIndex::build(
        index.store().clone(),
        &table,
        OpClass::l2(),
        &BuildOptions::new(2, 2),
        &CancellationToken::new(),
    )
    .unwrap_err();
    assert!(matches!(err, IvfError::AlreadyBuilt { .. }));
}
