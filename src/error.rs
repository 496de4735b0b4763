use thiserror::Error;

use crate::types::PageId;

#[derive(Error, Debug)]
pub enum IvfError {
    // Resource limits, raised before any page is written
    #[error("dimensions must be <= {max} for ivfflat index, got {actual}")]
    DimensionsExceeded { max: usize, actual: usize },

    #[error("training needs {required_mb} MB of memory, limit is {limit_mb} MB")]
    MemoryLimitExceeded { required_mb: usize, limit_mb: usize },

    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),

    // Usage errors
    #[error("cannot scan ivfflat index without order")]
    MissingOrderBy,

    #[error("non-snapshot reads are not supported with ivfflat")]
    UnsupportedSnapshot,

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("index already exists in this page store ({pages} pages)")]
    AlreadyBuilt { pages: u32 },

    #[error("operation cancelled")]
    Cancelled,

    // Page store and on-disk format
    #[error("page {page} does not exist (store has {count} pages)")]
    PageOutOfRange { page: PageId, count: u32 },

    #[error("page {page} is not locked exclusively")]
    NotExclusive { page: PageId },

    #[error("corrupt page {page}: {reason}")]
    Corrupt { page: PageId, reason: String },

    #[error("page {page} has no room for an item of {size} bytes")]
    PageFull { page: PageId, size: usize },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u64, actual: u64 },

    #[error("vector encoding error: {0}")]
    Encoding(String),

    // Serialization errors
    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bincode serialization error: {0}")]
    Bincode(String),

    // Config errors
    #[error("config error: {0}")]
    Config(String),

    // IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<Box<bincode::ErrorKind>> for IvfError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        IvfError::Bincode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, IvfError>;

impl IvfError {
    /// Resource-limit errors are raised before mutation and leave the store untouched.
    pub fn is_resource_limit(&self) -> bool {
        matches!(
            self,
            IvfError::DimensionsExceeded { .. }
                | IvfError::MemoryLimitExceeded { .. }
                | IvfError::ResourceLimit(_)
        )
    }

    /// Internal invariant violations that indicate a damaged or buggy structure.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IvfError::Corrupt { .. }
                | IvfError::PageFull { .. }
                | IvfError::ChecksumMismatch { .. }
                | IvfError::Encoding(_)
        )
    }

    pub(crate) fn corrupt(page: PageId, reason: impl Into<String>) -> Self {
        IvfError::Corrupt {
            page,
            reason: reason.into(),
        }
    }
}
