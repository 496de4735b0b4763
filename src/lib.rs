//! ivfpage: an IVF-Flat approximate nearest neighbor index over
//! shadow-paged storage.

pub mod cancel;
pub mod config;
pub mod error;
pub mod index;
pub mod metric;
pub mod metrics;
pub mod sort;
pub mod source;
pub mod startup;
pub mod storage;
pub mod types;

pub use cancel::CancellationToken;
pub use error::{IvfError, Result};
pub use index::{BuildOptions, BuildResult, IvfIndex, OrderBy, ScanItem, ScanOptions, VacuumStats};
pub use metric::OpClass;
pub use storage::PageStore;
pub use types::RowRef;
