//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON and carries all
//! sub-configs for the database, cache, worker pool, library view, providers,
//! asset storage and scanning. Every section defaults sensibly so a
//! completely empty `{}` file is valid.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::Error;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub workers: WorkerConfig,
    pub view: ViewConfig,
    pub providers: ProvidersConfig,
    pub assets: AssetConfig,
    pub scan: ScanConfig,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.database.pool_size == 0 {
            warnings.push("database.pool_size is 0; using 1 connection".into());
        }

        match self.cache.backend {
            CacheBackend::RemoteKv if self.cache.address.is_none() => {
                warnings.push("cache.backend is remote_kv but cache.address is not set".into());
            }
            CacheBackend::OnDisk if self.cache.path.is_none() => {
                warnings.push(
                    "cache.backend is on_disk but cache.path is not set; using the library database"
                        .into(),
                );
            }
            _ => {}
        }

        if self.cache.default_ttl_secs <= 0 {
            warnings.push("cache.default_ttl_secs <= 0; provider results will not be cached".into());
        }

        if self.cache.backend == CacheBackend::InProcess && self.cache.capacity == 0 {
            warnings.push("cache.capacity is 0; the in-process cache will hold nothing".into());
        }

        if self.workers.workers == Some(0) {
            warnings.push("workers.workers is 0; at least one worker will run".into());
        }

        if self.workers.max_attempts == 0 {
            warnings.push("workers.max_attempts is 0; jobs will run once".into());
        }

        if self.workers.base_backoff_ms > self.workers.max_backoff_ms {
            warnings.push("workers.base_backoff_ms exceeds workers.max_backoff_ms".into());
        }

        if self.view.page_size == 0 {
            warnings.push("view.page_size is 0; using 1".into());
        }

        if self.view.prefetch_threshold >= self.view.page_size.max(1) {
            warnings.push(
                "view.prefetch_threshold >= view.page_size; every read will prefetch".into(),
            );
        }

        for (name, rps) in &self.providers.rate_limits {
            if *rps == 0 {
                warnings.push(format!("providers.rate_limits.{name} is 0; limit ignored"));
            }
        }

        if let Some(tmdb) = &self.providers.tmdb {
            if tmdb.resolved_api_key().is_none() {
                warnings.push(
                    "providers.tmdb is set but has no api_key and TMDB_API_KEY is unset".into(),
                );
            }
        }

        if self.scan.extensions.is_empty() {
            warnings.push("scan.extensions is empty; scans will find nothing".into());
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// SQLite database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub pool_size: u32,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/reelkeep.db"),
            pool_size: 8,
            busy_timeout_ms: 5_000,
        }
    }
}

/// Which cache backend is active. Exactly one backend runs at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    #[default]
    InProcess,
    RemoteKv,
    OnDisk,
}

/// Provider result cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    /// Remote key-value service address (e.g. `redis://127.0.0.1:6379`).
    pub address: Option<String>,
    /// On-disk cache database file. Defaults to the library database.
    pub path: Option<PathBuf>,
    /// TTL applied to provider results. Zero or negative disables caching.
    pub default_ttl_secs: i64,
    /// Maximum entries held by the in-process backend.
    pub capacity: usize,
    pub sweep_interval_secs: u64,
    /// Per-operation timeout for remote backends.
    pub op_timeout_ms: u64,
    /// Key prefix used by the remote backend.
    pub key_prefix: String,
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Option<Duration> {
        u64::try_from(self.default_ttl_secs)
            .ok()
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::InProcess,
            address: None,
            path: None,
            default_ttl_secs: 86_400,
            capacity: 10_000,
            sweep_interval_secs: 300,
            op_timeout_ms: 500,
            key_prefix: "reelkeep:cache:".into(),
        }
    }
}

/// Job queue and worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Fixed worker count. When unset the pool sizes itself from the number
    /// of logical cores times `io_factor`.
    pub workers: Option<usize>,
    pub io_factor: usize,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub provider_timeout_ms: u64,
    pub repository_timeout_ms: u64,
    /// How long terminal jobs are kept before garbage collection.
    pub retention_secs: u64,
    pub maintenance_interval_secs: u64,
    /// Submit a match job for every item a scan discovers.
    pub auto_match_on_scan: bool,
}

impl WorkerConfig {
    /// Number of pool workers given `cores` logical cores.
    pub fn pool_size(&self, cores: usize) -> usize {
        self.workers
            .unwrap_or_else(|| cores.saturating_mul(self.io_factor.max(1)))
            .max(1)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn repository_timeout(&self) -> Duration {
        Duration::from_millis(self.repository_timeout_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: None,
            io_factor: 2,
            max_attempts: 3,
            base_backoff_ms: 1_000,
            max_backoff_ms: 300_000,
            provider_timeout_ms: 30_000,
            repository_timeout_ms: 10_000,
            retention_secs: 86_400,
            maintenance_interval_secs: 60,
            auto_match_on_scan: false,
        }
    }
}

/// Paginated library view settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewConfig {
    pub page_size: usize,
    /// Prefetch the next page once a window ends within this many rows of
    /// the end of the materialized pages.
    pub prefetch_threshold: usize,
    pub max_cached_pages: usize,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            prefetch_threshold: 20,
            max_cached_pages: 64,
        }
    }
}

/// Metadata provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Provider used by match jobs that do not name one.
    pub primary: Option<String>,
    /// Requests per second allowed per provider name.
    pub rate_limits: BTreeMap<String, u32>,
    /// Subtitle language requested when a job does not specify one.
    pub subtitle_language: String,
    /// TMDB v3 API access. The provider is registered when this is set.
    pub tmdb: Option<TmdbConfig>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            primary: None,
            rate_limits: BTreeMap::new(),
            subtitle_language: "en".into(),
            tmdb: None,
        }
    }
}

/// TMDB provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TmdbConfig {
    /// v3 API key. Falls back to the `TMDB_API_KEY` environment variable.
    pub api_key: String,
    pub base_url: String,
    pub image_base_url: String,
    pub language: String,
    pub timeout_ms: u64,
}

impl Default for TmdbConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.themoviedb.org/3".into(),
            image_base_url: "https://image.tmdb.org/t/p/original".into(),
            language: "en-US".into(),
            timeout_ms: 30_000,
        }
    }
}

impl TmdbConfig {
    /// The configured key, else `TMDB_API_KEY`.
    pub fn resolved_api_key(&self) -> Option<String> {
        let key = self.api_key.trim();
        if !key.is_empty() {
            return Some(key.to_string());
        }
        std::env::var("TMDB_API_KEY")
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
    }
}

/// Downloaded artwork and subtitle storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
    pub storage_dir: PathBuf,
    pub download_timeout_ms: u64,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./data/assets"),
            download_timeout_ms: 60_000,
        }
    }
}

/// Library scan settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// File extensions (lowercase, without the dot) treated as media.
    pub extensions: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            extensions: ["mkv", "mp4", "m4v", "avi", "mov", "wmv", "ts", "webm"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}
