//! Engine facade: builds the collaborators, runs the background tasks, and
//! exposes the job, view and library operations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rk_cache::{build_cache, spawn_sweeper, CacheStore};
use rk_core::config::Config;
use rk_core::events::{EventBus, EventPayload};
use rk_core::{
    Clock, Deadline, Error, ItemId, JobId, JobKind, JobStatus, JobTarget, LibraryId, Result,
    SortKey, SystemClock,
};
use rk_db::models::{
    Artwork, Credit, HistoryEvent, Item, ItemFilter, Library, NewHistoryEvent, NewLibrary,
    Subtitle,
};
use rk_db::{get_conn_within, queries, DbPool, UnitOfWork};
use rusqlite::Connection;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::assets::{AssetFetcher, AssetStorage, HttpAssetFetcher};
use crate::context::EngineContext;
use crate::gateway::ProviderGateway;
use crate::jobs::pool::spawn_workers;
use crate::jobs::{JobPayload, JobQueue, JobSnapshot};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::provider::MetadataProvider;
use crate::registry::ProviderRegistry;
use crate::tmdb::TmdbProvider;
use crate::view::LibraryView;

/// Collects injected collaborators; anything not supplied is built from the
/// configuration.
pub struct EngineBuilder {
    config: Config,
    db: Option<DbPool>,
    clock: Option<Arc<dyn Clock>>,
    registry: ProviderRegistry,
    cache: Option<Arc<dyn CacheStore>>,
    fetcher: Option<Arc<dyn AssetFetcher>>,
    events: Option<Arc<EventBus>>,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            db: None,
            clock: None,
            registry: ProviderRegistry::new(),
            cache: None,
            fetcher: None,
            events: None,
        }
    }

    pub fn db(mut self, db: DbPool) -> Self {
        self.db = Some(db);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn provider(mut self, provider: Arc<dyn MetadataProvider>) -> Self {
        self.registry.register(provider);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn asset_fetcher(mut self, fetcher: Arc<dyn AssetFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Result<Engine> {
        let config = self.config;
        for warning in config.validate() {
            tracing::warn!("Config: {warning}");
        }

        let db = match self.db {
            Some(db) => db,
            None => rk_db::init_pool(&config.database)?,
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let cache = match self.cache {
            Some(cache) => cache,
            None => build_cache(&config.cache, &db, Arc::clone(&clock))?,
        };
        let fetcher: Arc<dyn AssetFetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpAssetFetcher::new(Duration::from_millis(
                config.assets.download_timeout_ms,
            ))?),
        };
        let events = self.events.unwrap_or_default();
        let metrics = Arc::new(Metrics::new());

        let mut registry = self.registry;
        if let Some(tmdb) = &config.providers.tmdb {
            if registry.get("tmdb").is_none() {
                registry.register(Arc::new(TmdbProvider::new(tmdb)?));
            }
        }
        if let Some(primary) = &config.providers.primary {
            registry.set_primary(primary.clone());
        }
        if registry.is_empty() {
            tracing::warn!("No metadata providers registered; match, artwork and subtitle jobs will fail");
        }

        let cancel = CancellationToken::new();
        let gateway = Arc::new(ProviderGateway::new(
            registry,
            cache,
            Arc::clone(&metrics),
            &config,
        ));
        let queue = Arc::new(JobQueue::new(
            db.clone(),
            Arc::clone(&events),
            Arc::clone(&metrics),
            Arc::clone(&clock),
            &config.workers,
            cancel.child_token(),
        ));
        let view = LibraryView::new(
            db.clone(),
            &config.view,
            config.workers.repository_timeout(),
            Arc::clone(&metrics),
        );
        let storage = Arc::new(AssetStorage::new(config.assets.storage_dir.clone()));
        let pool_size = config.workers.pool_size(num_cpus::get());

        let ctx = EngineContext {
            config: Arc::new(config),
            db,
            clock,
            events,
            metrics,
            gateway,
            fetcher,
            storage,
            queue,
            view,
        };

        Ok(Engine {
            ctx,
            cancel,
            pool_size,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// Counters and totals for `reelkeep stats`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub cache_backend: &'static str,
    pub pool_size: usize,
    pub outstanding_jobs: usize,
    pub libraries: usize,
    pub jobs: Vec<(JobStatus, u64)>,
    pub metrics: MetricsSnapshot,
}

pub struct Engine {
    ctx: EngineContext,
    cancel: CancellationToken,
    pool_size: usize,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Recover unfinished jobs, then start the worker pool, the cache
    /// sweeper and the job maintenance task. Must be called from within a
    /// Tokio runtime. Returns how many jobs were recovered.
    pub fn start(&self) -> Result<usize> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Conflict("engine already started".into()));
        }

        let recovered = self.ctx.queue.recover()?;

        let mut tasks = spawn_workers(&self.ctx, self.pool_size);
        tasks.push(self.spawn_cache_sweeper());
        tasks.push(self.spawn_maintenance());
        self.tasks.lock().extend(tasks);

        tracing::info!(workers = self.pool_size, recovered, "Engine started");
        Ok(recovered)
    }

    fn spawn_cache_sweeper(&self) -> JoinHandle<()> {
        let events = Arc::clone(&self.ctx.events);
        let interval = Duration::from_secs(self.ctx.config.cache.sweep_interval_secs.max(1));
        spawn_sweeper(
            Arc::clone(self.ctx.gateway.cache()),
            interval,
            self.cancel.child_token(),
            move |removed| {
                events.broadcast(
                    EventPayload::CacheSwept {
                        removed: removed as u64,
                    },
                );
            },
        )
    }

    fn spawn_maintenance(&self) -> JoinHandle<()> {
        let queue = Arc::clone(&self.ctx.queue);
        let events = Arc::clone(&self.ctx.events);
        let cancel = self.cancel.child_token();
        let workers = &self.ctx.config.workers;
        let interval = Duration::from_secs(workers.maintenance_interval_secs.max(1));
        let retention = workers.retention();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => { break; }
                }

                match queue.gc(retention) {
                    Ok(0) => {}
                    Ok(removed) => events.broadcast(
                        EventPayload::JobsCollected {
                            removed: removed as u64,
                        },
                    ),
                    Err(e) => tracing::warn!(error = %e, "Job maintenance failed"),
                }
            }
            tracing::debug!("Job maintenance stopped");
        })
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.ctx.events
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.ctx.metrics
    }

    // -- Jobs ----------------------------------------------------------------

    pub fn submit(
        &self,
        kind: JobKind,
        target: impl Into<JobTarget>,
        payload: JobPayload,
    ) -> Result<JobId> {
        self.ctx.queue.submit(kind, target.into(), payload)
    }

    pub async fn cancel(&self, id: JobId) -> Result<bool> {
        self.ctx.queue.cancel(id).await
    }

    pub fn status(&self, id: JobId) -> Result<JobStatus> {
        self.ctx.queue.status(id)
    }

    pub fn job(&self, id: JobId) -> Result<JobSnapshot> {
        self.ctx.queue.snapshot(id)
    }

    pub fn jobs(&self) -> Vec<JobSnapshot> {
        self.ctx.queue.list()
    }

    pub async fn wait_idle(&self) {
        self.ctx.queue.wait_idle().await;
    }

    // -- Library view --------------------------------------------------------

    pub async fn window(
        &self,
        library: LibraryId,
        offset: usize,
        length: usize,
        sort: SortKey,
    ) -> Result<Vec<Item>> {
        self.ctx.view.window(library, offset, length, sort).await
    }

    pub async fn window_filtered(
        &self,
        library: LibraryId,
        filter: &ItemFilter,
        sort: SortKey,
        offset: usize,
        length: usize,
    ) -> Result<Vec<Item>> {
        self.ctx
            .view
            .window_filtered(library, filter, sort, offset, length)
            .await
    }

    pub async fn count(&self, library: LibraryId, filter: &ItemFilter) -> Result<u64> {
        self.ctx.view.count(library, filter).await
    }

    pub fn invalidate_view(&self) {
        self.ctx.view.invalidate();
    }

    // -- Libraries and items -------------------------------------------------

    pub async fn create_library(&self, name: &str, root_path: &str) -> Result<Library> {
        let name = name.trim().to_string();
        let root_path = root_path.trim().to_string();
        if name.is_empty() {
            return Err(Error::Validation("library name must not be empty".into()));
        }
        if root_path.is_empty() {
            return Err(Error::Validation("library root path must not be empty".into()));
        }

        let library = self
            .write(move |uow| {
                uow.repository::<Library>()
                    .create(&NewLibrary { name, root_path })
            })
            .await?;

        tracing::info!(library_id = %library.id, name = %library.name, "Created library");
        self.ctx.events.broadcast(
            EventPayload::LibraryCreated {
                library_id: library.id,
                name: library.name.clone(),
            },
        );
        Ok(library)
    }

    pub async fn list_libraries(&self) -> Result<Vec<Library>> {
        self.read(queries::libraries::list_libraries).await
    }

    pub async fn get_item(&self, id: ItemId) -> Result<Item> {
        self.read(move |conn| {
            queries::items::get_item(conn, id)?.ok_or_else(|| Error::not_found("item", id))
        })
        .await
    }

    pub async fn credits(&self, id: ItemId) -> Result<Vec<Credit>> {
        self.read(move |conn| queries::credits::list_credits(conn, id))
            .await
    }

    pub async fn artwork(&self, id: ItemId) -> Result<Vec<Artwork>> {
        self.read(move |conn| queries::artwork::list_artwork(conn, id))
            .await
    }

    pub async fn subtitles(&self, id: ItemId) -> Result<Vec<Subtitle>> {
        self.read(move |conn| queries::subtitles::list_subtitles(conn, id))
            .await
    }

    pub async fn history(&self, id: ItemId) -> Result<Vec<HistoryEvent>> {
        self.read(move |conn| queries::history::list_for_item(conn, id))
            .await
    }

    /// Cancel outstanding jobs for an item, then delete it with its child
    /// rows and stored assets. The audit trail survives with a NULL item.
    pub async fn remove_item(&self, id: ItemId) -> Result<()> {
        let cancelled = self.ctx.queue.cancel_target(JobTarget::Item(id)).await;

        let item = self
            .write(move |uow| {
                let items = uow.repository::<Item>();
                let item = items.get(id)?;
                uow.repository::<HistoryEvent>().create(
                    &NewHistoryEvent::new(id, None, "removed").with_detail(item.file_path.clone()),
                )?;
                items.delete(id)?;
                Ok(item)
            })
            .await?;

        if let Err(e) = self.ctx.storage.remove_item(id).await {
            tracing::warn!(item_id = %id, error = %e, "Failed to delete stored assets");
        }

        self.ctx.view.invalidate_library(item.library_id);
        self.ctx
            .events
            .broadcast(EventPayload::ItemRemoved { item_id: id });
        tracing::info!(item_id = %id, cancelled_jobs = cancelled.len(), "Removed item");
        Ok(())
    }

    // -- Maintenance ---------------------------------------------------------

    /// Purge expired cache entries now.
    pub async fn sweep_cache(&self) -> Result<usize> {
        let removed = self.ctx.gateway.cache().sweep().await?;
        if removed > 0 {
            self.ctx.events.broadcast(
                EventPayload::CacheSwept {
                    removed: removed as u64,
                },
            );
        }
        Ok(removed)
    }

    /// Drop terminal jobs older than the configured retention now.
    pub fn collect_jobs(&self) -> Result<usize> {
        let removed = self.ctx.queue.gc(self.ctx.config.workers.retention())?;
        if removed > 0 {
            self.ctx.events.broadcast(
                EventPayload::JobsCollected {
                    removed: removed as u64,
                },
            );
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        let libraries = self
            .read(|conn| queries::libraries::list_libraries(conn).map(|l| l.len()))
            .await?;
        Ok(EngineStats {
            cache_backend: self.ctx.gateway.cache().backend(),
            pool_size: self.pool_size,
            outstanding_jobs: self.ctx.queue.outstanding(),
            libraries,
            jobs: self.ctx.queue.counts()?,
            metrics: self.ctx.metrics.snapshot(),
        })
    }

    /// Stop accepting work and wait for workers and background tasks. Jobs
    /// still queued stay in the database for the next start.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        tracing::info!("Engine stopped");
    }

    async fn read<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let db = self.ctx.db.clone();
        let deadline = Deadline::after(self.ctx.config.workers.repository_timeout());
        tokio::task::spawn_blocking(move || {
            let conn = get_conn_within(&db, deadline)?;
            f(&conn)
        })
        .await
        .map_err(|e| Error::Internal(format!("database task failed: {e}")))?
    }

    async fn write<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&UnitOfWork) -> Result<T> + Send + 'static,
    {
        let db = self.ctx.db.clone();
        let deadline = Deadline::after(self.ctx.config.workers.repository_timeout());
        tokio::task::spawn_blocking(move || UnitOfWork::run(&db, deadline, f))
            .await
            .map_err(|e| Error::Internal(format!("database task failed: {e}")))?
    }
}
