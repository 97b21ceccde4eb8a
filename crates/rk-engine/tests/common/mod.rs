//! Shared test harness for engine integration tests.
//!
//! [`TestHarness`] builds a full [`Engine`] over a file-backed database in a
//! temp directory, with a scripted metadata provider and an in-memory asset
//! fetcher so no test touches the network.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rk_cache::{CacheHit, CacheStore, QueryParams};
use rk_core::config::{Config, DatabaseConfig};
use rk_core::{Error, ItemId, JobId, JobStatus, LibraryId, Result};
use rk_db::models::{Library, NewItem};
use rk_db::{get_conn, init_pool, queries, DbPool, PooledConnection};
use rk_engine::{
    ArtworkRef, AssetFetcher, CreditRef, Engine, Metadata, MetadataProvider, ProviderError,
    SubtitleRef,
};
use tempfile::TempDir;
use tokio::sync::{Notify, Semaphore};

// ---------------------------------------------------------------------------
// Scripted provider
// ---------------------------------------------------------------------------

/// Provider answering from a title-keyed table. Unknown titles get a
/// generated answer so bulk tests need no setup.
pub struct StubProvider {
    name: String,
    calls: AtomicUsize,
    answers: Mutex<HashMap<String, Metadata>>,
    failures: Mutex<VecDeque<ProviderError>>,
    /// When set, each call waits for a permit before answering.
    hold: Option<Arc<Semaphore>>,
    entered: Notify,
}

impl StubProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            calls: AtomicUsize::new(0),
            answers: Mutex::new(HashMap::new()),
            failures: Mutex::new(VecDeque::new()),
            hold: None,
            entered: Notify::new(),
        }
    }

    /// A provider whose calls block until [`StubProvider::release`].
    pub fn held(name: &str) -> Self {
        Self {
            hold: Some(Arc::new(Semaphore::new(0))),
            ..Self::new(name)
        }
    }

    pub fn answer(&self, title: &str, metadata: Metadata) {
        self.answers.lock().insert(title.to_lowercase(), metadata);
    }

    /// Fail the next calls with these errors, in order.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = ProviderError>) {
        self.failures.lock().extend(errors);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn release(&self, n: usize) {
        if let Some(hold) = &self.hold {
            hold.add_permits(n);
        }
    }

    /// Resolve once a call has started.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }
}

#[async_trait]
impl MetadataProvider for StubProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup(&self, query: &QueryParams) -> std::result::Result<Metadata, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();

        if let Some(hold) = &self.hold {
            let _permit = hold.acquire().await.map_err(|_| {
                ProviderError::Unavailable("provider closed".into())
            })?;
        }

        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }

        let title = query.get("title").unwrap_or_default().to_lowercase();
        if let Some(metadata) = self.answers.lock().get(&title) {
            return Ok(metadata.clone());
        }
        Ok(generated(&title))
    }
}

fn generated(title: &str) -> Metadata {
    let slug = title.replace(' ', "-");
    Metadata {
        title: format!("{title} (matched)"),
        year: Some(2001),
        external_ids: [("stub".to_string(), slug.clone())].into_iter().collect(),
        cast: vec![CreditRef {
            name: "Lead Actor".into(),
            part: Some("Hero".into()),
        }],
        artwork: vec![ArtworkRef {
            kind: rk_core::ArtworkKind::Poster,
            url: format!("https://img.example/{slug}/poster.jpg"),
            width: Some(1000),
            height: Some(1500),
        }],
        subtitles: vec![
            SubtitleRef {
                language: "en".into(),
                format: "srt".into(),
                url: format!("https://subs.example/{slug}.en.srt"),
            },
            SubtitleRef {
                language: "fr".into(),
                format: "srt".into(),
                url: format!("https://subs.example/{slug}.fr.srt"),
            },
        ],
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Asset fetcher and cache stubs
// ---------------------------------------------------------------------------

/// Returns the URL itself as the body. URLs containing `missing` are 404s;
/// URLs containing `broken` fail for good.
#[derive(Default)]
pub struct StubFetcher {
    fetched: AtomicUsize,
}

impl StubFetcher {
    pub fn fetched(&self) -> usize {
        self.fetched.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AssetFetcher for StubFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        if url.contains("missing") {
            return Err(Error::not_found("asset", url));
        }
        if url.contains("broken") {
            return Err(Error::InvalidQuery(format!("asset host refused {url}")));
        }
        self.fetched.fetch_add(1, Ordering::SeqCst);
        Ok(Bytes::copy_from_slice(url.as_bytes()))
    }
}

/// A cache backend that is always down.
pub struct DownCache;

#[async_trait]
impl CacheStore for DownCache {
    fn backend(&self) -> &'static str {
        "down"
    }

    async fn get(&self, _key: &str) -> Result<Option<CacheHit>> {
        Err(Error::CacheUnavailable("connection refused".into()))
    }

    async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<()> {
        Err(Error::CacheUnavailable("connection refused".into()))
    }

    async fn invalidate(&self, _key: &str) -> Result<bool> {
        Err(Error::CacheUnavailable("connection refused".into()))
    }

    async fn sweep(&self) -> Result<usize> {
        Err(Error::CacheUnavailable("connection refused".into()))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct TestHarness {
    pub engine: Engine,
    pub db: DbPool,
    pub provider: Arc<StubProvider>,
    pub fetcher: Arc<StubFetcher>,
    pub dir: TempDir,
}

impl TestHarness {
    /// Config pointing every path into `dir`, with millisecond backoff.
    pub fn config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.database = DatabaseConfig {
            path: dir.path().join("reelkeep.db"),
            pool_size: 16,
            busy_timeout_ms: 5_000,
        };
        config.assets.storage_dir = dir.path().join("assets");
        config.workers.workers = Some(4);
        config.workers.base_backoff_ms = 5;
        config.workers.max_backoff_ms = 20;
        config.providers.primary = Some("stub".into());
        config
    }

    pub fn new() -> Self {
        Self::with(|_| {}, StubProvider::new("stub"), None)
    }

    pub fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        Self::with(tweak, StubProvider::new("stub"), None)
    }

    pub fn with(
        tweak: impl FnOnce(&mut Config),
        provider: StubProvider,
        cache: Option<Arc<dyn CacheStore>>,
    ) -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let mut config = Self::config(&dir);
        tweak(&mut config);

        let db = init_pool(&config.database).expect("failed to create pool");
        let provider = Arc::new(provider);
        let fetcher = Arc::new(StubFetcher::default());

        let mut builder = Engine::builder(config)
            .db(db.clone())
            .provider(provider.clone())
            .asset_fetcher(fetcher.clone());
        if let Some(cache) = cache {
            builder = builder.cache(cache);
        }
        let engine = builder.build().expect("failed to build engine");

        Self {
            engine,
            db,
            provider,
            fetcher,
            dir,
        }
    }

    pub fn conn(&self) -> PooledConnection {
        get_conn(&self.db).expect("failed to get db connection")
    }

    /// Directory under the temp dir to use as a library root.
    pub fn media_dir(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join("media").join(name);
        std::fs::create_dir_all(&path).expect("failed to create media dir");
        path
    }

    pub async fn library(&self, name: &str) -> Library {
        let root = self.media_dir(name);
        self.engine
            .create_library(name, &root.to_string_lossy())
            .await
            .expect("failed to create library")
    }

    /// Insert items directly, bypassing the scanner.
    pub fn add_items(&self, library: LibraryId, titles: &[&str]) -> Vec<ItemId> {
        let conn = self.conn();
        titles
            .iter()
            .enumerate()
            .map(|(i, title)| {
                queries::items::create_item(
                    &conn,
                    &NewItem {
                        library_id: library,
                        file_path: format!("/lib{}/{i:05}-{title}.mkv", library.get()),
                        title: title.to_string(),
                        year: None,
                    },
                )
                .expect("failed to insert item")
                .id
            })
            .collect()
    }

    /// Files stored for `item`, sorted.
    pub fn asset_files(&self, item: ItemId) -> Vec<PathBuf> {
        let dir = self.dir.path().join("assets").join(item.to_string());
        let mut files: Vec<PathBuf> = match std::fs::read_dir(&dir) {
            Ok(entries) => entries
                .map(|e| e.expect("failed to read asset dir").path())
                .collect(),
            Err(_) => Vec::new(),
        };
        files.sort();
        files
    }

    /// Poll until `id` reaches `status`, panicking after five seconds.
    pub async fn wait_for(&self, id: JobId, status: JobStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let current = self.engine.status(id).expect("unknown job");
            if current == status {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {id} stuck in {current}, wanted {status}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Wait for the queue to drain, panicking after a minute.
    pub async fn idle(&self) {
        tokio::time::timeout(Duration::from_secs(60), self.engine.wait_idle())
            .await
            .expect("queue did not drain");
    }
}
