use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use ivfpage::source::TableSource;
use ivfpage::storage::{FileBackend, MemoryBackend, PageStore};
use ivfpage::{BuildOptions, BuildResult, CancellationToken, IvfIndex, OpClass};

/// A built index plus the table it was built from.
///
/// File-backed harnesses keep their temp directory alive until drop.
pub struct TestHarness {
    pub index: IvfIndex,
    pub table: TableSource,
    pub result: BuildResult,
    pub dir: Option<TempDir>,
}

impl TestHarness {
    pub fn memory(table: TableSource, opclass: OpClass, options: BuildOptions) -> Self {
        let store = Arc::new(PageStore::new(8192, MemoryBackend::new()).expect("page store"));
        let (index, result) =
            IvfIndex::build(store, &table, opclass, &options, &CancellationToken::new())
                .expect("build should succeed");
        Self {
            index,
            table,
            result,
            dir: None,
        }
    }

    pub fn file(table: TableSource, opclass: OpClass, options: BuildOptions) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = FileBackend::open(dir.path().join("index.pages"), 8192).expect("backend");
        let store = Arc::new(PageStore::new(8192, backend).expect("page store"));
        let (index, result) =
            IvfIndex::build(store, &table, opclass, &options, &CancellationToken::new())
                .expect("build should succeed");
        Self {
            index,
            table,
            result,
            dir: Some(dir),
        }
    }

    /// Reopen the file-backed store from disk.
    pub fn reopen(&self, opclass: OpClass) -> IvfIndex {
        let dir = self.dir.as_ref().expect("file-backed harness");
        let backend = FileBackend::open(dir.path().join("index.pages"), 8192).expect("backend");
        let store = Arc::new(PageStore::new(8192, backend).expect("page store"));
        IvfIndex::open(store, opclass).expect("open should succeed")
    }
}

/// `n` points uniform in `[lo, hi)^dim`.
pub fn uniform_points(n: usize, dim: usize, lo: f32, hi: f32, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..dim).map(|_| rng.gen_range(lo..hi)).collect())
        .collect()
}

/// Row-major index of a row in a table with `rows_per_block` rows per block.
pub fn row_index(row: ivfpage::RowRef, rows_per_block: u64) -> u64 {
    row.block() as u64 * rows_per_block + row.offset() as u64 - 1
}
