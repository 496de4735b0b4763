use crate::error::{IvfError, Result};
use crate::types::IterativeScan;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Smallest and largest list counts an index may be built with.
pub const MIN_LISTS: usize = 1;
pub const MAX_LISTS: usize = 32_768;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Number of inverted lists; fixed once the index is built.
    #[serde(default = "default_lists")]
    pub lists: usize,
    #[serde(default = "default_max_dimensions")]
    pub max_dimensions: usize,
    /// Distance family: `l2`, `inner_product` or `cosine`.
    #[serde(default = "default_opclass")]
    pub opclass: String,
    /// Stored element type: `f32` or `f16`.
    #[serde(default = "default_vector_type")]
    pub vector_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_probes")]
    pub probes: usize,
    #[serde(default = "default_max_probes")]
    pub max_probes: usize,
    #[serde(default)]
    pub iterative_scan: IterativeScan,
    /// Memory budget for the per-batch result sort before it spills.
    #[serde(default = "default_scan_sort_memory_mb")]
    pub sort_memory_mb: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Ceiling for the clustering working set and the build sort.
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: usize,
    /// Fixed seed for reproducible builds; random when unset.
    #[serde(default = "default_seed")]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    #[serde(default = "default_data_path")]
    pub path: PathBuf,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn default_lists() -> usize {
    env_parse("IVFPAGE_LISTS").unwrap_or(100)
}
fn default_max_dimensions() -> usize {
    env_parse("IVFPAGE_MAX_DIMENSIONS").unwrap_or(2000)
}
fn default_opclass() -> String {
    std::env::var("IVFPAGE_OPCLASS").unwrap_or_else(|_| "l2".to_string())
}
fn default_vector_type() -> String {
    "f32".to_string()
}
fn default_probes() -> usize {
    env_parse("IVFPAGE_PROBES").unwrap_or(1)
}
fn default_max_probes() -> usize {
    env_parse("IVFPAGE_MAX_PROBES").unwrap_or(MAX_LISTS)
}
fn default_scan_sort_memory_mb() -> usize {
    4
}
fn default_max_iterations() -> usize {
    500
}
fn default_memory_limit_mb() -> usize {
    env_parse("IVFPAGE_MEMORY_LIMIT_MB").unwrap_or(64)
}
fn default_seed() -> Option<u64> {
    env_parse("IVFPAGE_SEED")
}
fn default_backend() -> StorageBackend {
    match std::env::var("IVFPAGE_STORAGE_BACKEND").as_deref() {
        Ok("memory") => StorageBackend::Memory,
        _ => StorageBackend::File,
    }
}
fn default_data_path() -> PathBuf {
    std::env::var("IVFPAGE_DATA_PATH")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("ivfpage.pages"))
}
fn default_page_size() -> usize {
    8192
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    std::env::var("IVFPAGE_LOG_FORMAT").unwrap_or_else(|_| "plain".to_string())
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            lists: default_lists(),
            max_dimensions: default_max_dimensions(),
            opclass: default_opclass(),
            vector_type: default_vector_type(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            probes: default_probes(),
            max_probes: default_max_probes(),
            iterative_scan: IterativeScan::default(),
            sort_memory_mb: default_scan_sort_memory_mb(),
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            memory_limit_mb: default_memory_limit_mb(),
            seed: default_seed(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_data_path(),
            page_size: default_page_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl TrainingConfig {
    pub fn memory_limit_bytes(&self) -> usize {
        self.memory_limit_mb.saturating_mul(1024 * 1024)
    }
}

impl ScanConfig {
    pub fn sort_memory_bytes(&self) -> usize {
        self.sort_memory_mb.saturating_mul(1024 * 1024)
    }
}

impl Config {
    /// Load config from a TOML file, falling back to defaults.
    /// After loading, env var overrides are applied so that:
    /// env var > TOML file > defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p).map_err(|e| {
                    IvfError::Config(format!("failed to read config file {p}: {e}"))
                })?;
                Self::from_toml(&content)?
            }
            None => Config::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| IvfError::Config(format!("failed to parse config: {e}")))
    }

    /// Reject values the index cannot honor.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_LISTS..=MAX_LISTS).contains(&self.index.lists) {
            return Err(IvfError::Config(format!(
                "index.lists must be in {MIN_LISTS}..={MAX_LISTS}, got {}",
                self.index.lists
            )));
        }
        if !(MIN_LISTS..=MAX_LISTS).contains(&self.scan.probes) {
            return Err(IvfError::Config(format!(
                "scan.probes must be in {MIN_LISTS}..={MAX_LISTS}, got {}",
                self.scan.probes
            )));
        }
        if !(MIN_LISTS..=MAX_LISTS).contains(&self.scan.max_probes) {
            return Err(IvfError::Config(format!(
                "scan.max_probes must be in {MIN_LISTS}..={MAX_LISTS}, got {}",
                self.scan.max_probes
            )));
        }
        if !(1024..=32_768).contains(&self.storage.page_size) {
            return Err(IvfError::Config(format!(
                "storage.page_size must be in 1024..=32768, got {}",
                self.storage.page_size
            )));
        }
        if self.training.max_iterations == 0 {
            return Err(IvfError::Config(
                "training.max_iterations must be positive".into(),
            ));
        }
        if !matches!(self.logging.format.as_str(), "json" | "plain") {
            return Err(IvfError::Config(format!(
                "logging.format must be json or plain, got {}",
                self.logging.format
            )));
        }
        Ok(())
    }

    /// Apply environment variable overrides on top of file/default values.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let parse = |key: &str| lookup(key).and_then(|v| v.parse::<usize>().ok());

        // Index
        if let Some(v) = parse("IVFPAGE_LISTS") {
            self.index.lists = v;
        }
        if let Some(v) = parse("IVFPAGE_MAX_DIMENSIONS") {
            self.index.max_dimensions = v;
        }
        if let Some(v) = lookup("IVFPAGE_OPCLASS") {
            self.index.opclass = v;
        }

        // Scan
        if let Some(v) = parse("IVFPAGE_PROBES") {
            self.scan.probes = v;
        }
        if let Some(v) = parse("IVFPAGE_MAX_PROBES") {
            self.scan.max_probes = v;
        }
        if let Some(v) = lookup("IVFPAGE_ITERATIVE_SCAN").and_then(|v| v.parse().ok()) {
            self.scan.iterative_scan = v;
        }

        // Training
        if let Some(v) = parse("IVFPAGE_MEMORY_LIMIT_MB") {
            self.training.memory_limit_mb = v;
        }
        if let Some(v) = lookup("IVFPAGE_SEED").and_then(|v| v.parse().ok()) {
            self.training.seed = Some(v);
        }

        // Storage
        match lookup("IVFPAGE_STORAGE_BACKEND").as_deref() {
            Some("memory") => self.storage.backend = StorageBackend::Memory,
            Some("file") => self.storage.backend = StorageBackend::File,
            _ => {}
        }
        if let Some(v) = lookup("IVFPAGE_DATA_PATH") {
            self.storage.path = PathBuf::from(v);
        }

        // Logging
        if let Some(v) = lookup("IVFPAGE_LOG_FORMAT") {
            self.logging.format = v;
        }
    }
}
