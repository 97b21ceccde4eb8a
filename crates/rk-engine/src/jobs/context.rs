//! Per-attempt handle given to job handlers.
//!
//! Every provider call, download and repository operation a handler makes
//! goes through [`JobContext`], which checks for cancellation first and
//! applies the configured deadline. [`JobContext::commit`] is the only way a
//! handler writes: it runs one unit of work that also marks the job row
//! `succeeded`, under the job's commit gate.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rk_cache::QueryParams;
use rk_core::{Clock, Deadline, Error, ItemId, JobId, JobKind, JobStatus, JobTarget, Result};
use rk_db::models::JobRecord;
use rk_db::{get_conn_within, queries, UnitOfWork};
use rusqlite::Connection;
use serde::Serialize;

use super::queue::JobEntry;
use super::{format_ts, JobPayload, JobSnapshot};
use crate::assets::StoredAsset;
use crate::context::EngineContext;
use crate::metrics::Op;
use crate::provider::Metadata;

pub struct JobContext {
    ctx: EngineContext,
    entry: Arc<JobEntry>,
    job: JobSnapshot,
}

impl JobContext {
    pub(crate) fn new(ctx: EngineContext, entry: Arc<JobEntry>) -> Self {
        let job = entry.snapshot();
        Self { ctx, entry, job }
    }

    pub fn id(&self) -> JobId {
        self.job.id
    }

    pub fn kind(&self) -> JobKind {
        self.job.kind
    }

    pub fn target(&self) -> JobTarget {
        self.job.target
    }

    pub fn payload(&self) -> &JobPayload {
        &self.job.payload
    }

    /// 1-based attempt number of this run.
    pub fn attempt(&self) -> u32 {
        self.job.attempt_count
    }

    pub fn engine(&self) -> &EngineContext {
        &self.ctx
    }

    /// Fail with `Cancelled` once cancellation has been requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.entry.cancel_token().is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn item_target(&self) -> Result<ItemId> {
        self.job.target.item().ok_or_else(|| {
            Error::Validation(format!("{} job needs an item target", self.job.kind))
        })
    }

    /// Provider named in the payload, else the primary one.
    pub fn provider(&self) -> Result<String> {
        self.ctx
            .gateway
            .resolve(self.job.payload.provider.as_deref())
            .map_err(Error::from)
    }

    /// Query a provider through the gateway, bypassing the cache when the
    /// payload asks for a refresh.
    pub async fn lookup(&self, provider: &str, query: &QueryParams) -> Result<Metadata> {
        self.checkpoint()?;
        let deadline = Deadline::after(self.ctx.config.workers.provider_timeout());
        let gateway = &self.ctx.gateway;
        let result = if self.job.payload.force_refresh {
            gateway.refresh_within(provider, query, deadline).await
        } else {
            gateway.lookup_within(provider, query, deadline).await
        };
        result.map_err(Error::from)
    }

    pub async fn fetch_asset(&self, url: &str) -> Result<Bytes> {
        self.checkpoint()?;
        let timeout = Duration::from_millis(self.ctx.config.assets.download_timeout_ms);
        let _t = self.ctx.metrics.timer(Op::AssetDownload);
        match tokio::time::timeout(timeout, self.ctx.fetcher.fetch(url)).await {
            Ok(result) => result,
            Err(_) => Err(Error::unavailable(format!("download timed out: {url}"))),
        }
    }

    pub async fn store_asset(&self, item_id: ItemId, url: &str, bytes: &[u8]) -> Result<StoredAsset> {
        self.checkpoint()?;
        self.ctx.storage.store(item_id, url, bytes).await
    }

    /// Delete the files in `paths` that no artwork or subtitle row of
    /// `item_id` refers to. Not a checkpoint: a cancelled or failed attempt
    /// still cleans up after itself.
    pub async fn discard_assets(&self, item_id: ItemId, paths: Vec<PathBuf>) -> usize {
        if paths.is_empty() {
            return 0;
        }

        let db = self.ctx.db.clone();
        let deadline = self.repository_deadline();
        let referenced = tokio::task::spawn_blocking(move || -> Result<HashSet<String>> {
            let conn = get_conn_within(&db, deadline)?;
            let artwork = queries::artwork::list_artwork(&conn, item_id)?
                .into_iter()
                .filter_map(|a| a.local_path);
            let subtitles = queries::subtitles::list_subtitles(&conn, item_id)?
                .into_iter()
                .filter_map(|s| s.local_path);
            Ok(artwork.chain(subtitles).collect())
        })
        .await
        .map_err(|e| Error::Internal(format!("read task failed: {e}")))
        .and_then(|r| r);

        let referenced = match referenced {
            Ok(set) => set,
            Err(e) => {
                tracing::warn!(item_id = %item_id, error = %e, "Could not check asset references, keeping files");
                return 0;
            }
        };

        let mut removed = 0;
        for path in paths {
            if referenced.contains(path.to_string_lossy().as_ref()) {
                continue;
            }
            match self.ctx.storage.remove(&path).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(item_id = %item_id, path = %path.display(), error = %e, "Failed to remove asset")
                }
            }
        }
        if removed > 0 {
            tracing::debug!(item_id = %item_id, removed, "Discarded unreferenced assets");
        }
        removed
    }

    /// Read-only query on a pooled connection, off the async runtime.
    pub async fn read<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        self.checkpoint()?;
        let db = self.ctx.db.clone();
        let deadline = self.repository_deadline();
        tokio::task::spawn_blocking(move || {
            let conn = get_conn_within(&db, deadline)?;
            f(&conn)
        })
        .await
        .map_err(|e| Error::Internal(format!("read task failed: {e}")))?
    }

    /// Run the job's writes in one unit of work that also records the job
    /// as `succeeded` with `f`'s return value as its result.
    ///
    /// The commit gate is held from the final cancellation check until the
    /// transaction is committed, so a job cancelled before this point never
    /// writes and a job that wrote can no longer be cancelled.
    pub async fn commit<T, F>(&self, f: F) -> Result<T>
    where
        T: Serialize + Send + 'static,
        F: FnOnce(&UnitOfWork) -> Result<T> + Send + 'static,
    {
        self.checkpoint()?;
        let guard = self.entry.gate().lock_owned().await;
        self.checkpoint()?;

        let db = self.ctx.db.clone();
        let deadline = self.repository_deadline();
        let metrics = Arc::clone(&self.ctx.metrics);
        let entry = Arc::clone(&self.entry);
        let clock = Arc::clone(&self.ctx.clock);

        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let _t = metrics.timer(Op::Commit);
            let value = UnitOfWork::run(&db, deadline, |uow| {
                let value = f(uow)?;
                let result = serde_json::to_string(&value)
                    .map_err(|e| Error::Internal(format!("job result not serializable: {e}")))?;
                let now = clock.now();
                let mut record = entry.snapshot().to_record();
                record.status = JobStatus::Succeeded;
                record.result = Some(result);
                record.updated_at = format_ts(now);
                record.finished_at = Some(format_ts(now));
                uow.repository::<JobRecord>().update(&record)?;
                Ok((value, now))
            })?;
            let (value, committed_at) = value;
            entry.mark_committed(committed_at);
            Ok(value)
        })
        .await
        .map_err(|e| Error::Internal(format!("commit task failed: {e}")))?
    }

    fn repository_deadline(&self) -> Deadline {
        Deadline::after(self.ctx.config.workers.repository_timeout())
    }
}
