//! Process bootstrap shared by the CLI and embedding applications.

use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::error::Result;
use crate::storage::{FileBackend, MemoryBackend, PageStore};

/// Resolve the configuration file path.
///
/// Priority:
/// 1. `IVFPAGE_CONFIG` environment variable
/// 2. `./ivfpage.toml` if it exists
/// 3. None (use defaults)
pub fn resolve_config_path() -> Option<String> {
    std::env::var("IVFPAGE_CONFIG").ok().or_else(|| {
        let default = "ivfpage.toml";
        std::path::Path::new(default)
            .exists()
            .then(|| default.to_string())
    })
}

/// Initialize tracing subscriber from logging config.
///
/// Supports JSON and plain text formats. Uses `RUST_LOG` env var if set,
/// otherwise falls back to `config.logging.level`. Safe to call twice; the
/// second call leaves the first subscriber in place.
pub fn init_logging(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let installed = match config.logging.format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init(),
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Open the page store described by `config.storage`.
pub fn open_store(config: &Config) -> Result<PageStore> {
    crate::metrics::init();

    let store = match config.storage.backend {
        crate::config::StorageBackend::Memory => {
            PageStore::new(config.storage.page_size, MemoryBackend::new())?
        }
        crate::config::StorageBackend::File => {
            let backend = FileBackend::open(&config.storage.path, config.storage.page_size)?;
            PageStore::new(config.storage.page_size, backend)?
        }
    };

    tracing::info!(
        backend = ?config.storage.backend,
        path = %config.storage.path.display(),
        page_size = config.storage.page_size,
        pages = store.page_count(),
        "page store opened"
    );
    Ok(store)
}
