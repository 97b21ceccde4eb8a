//! In-memory job queue mirrored into the `jobs` table.
//!
//! The queue owns every job until it reaches a terminal state. Submissions
//! for a `(kind, target)` pair that already has a queued or running job are
//! coalesced onto that job. Each transition is validated against the job
//! state machine, written to the `jobs` row, and only then applied in memory
//! and broadcast exactly once as [`EventPayload::JobStatusChanged`]. All
//! transitions of one job are serialized by its gate.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rk_core::config::WorkerConfig;
use rk_core::events::{EventBus, EventPayload};
use rk_core::{Clock, Deadline, Error, JobId, JobKind, JobStatus, JobTarget, Result};
use rk_db::{get_conn_within, queries, DbPool, PooledConnection};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

use super::{format_ts, Backoff, JobPayload, JobSnapshot};
use crate::metrics::{Counter, Metrics};

const ALL_KINDS: [JobKind; 4] = [
    JobKind::Scan,
    JobKind::Match,
    JobKind::ArtworkFetch,
    JobKind::SubtitleFetch,
];

/// Live state of one job held by the queue.
pub struct JobEntry {
    state: Mutex<JobSnapshot>,
    cancel: CancellationToken,
    /// Serializes transitions and the commit of a job's writes.
    gate: Arc<tokio::sync::Mutex<()>>,
    /// Set when the current attempt committed; the `jobs` row already says
    /// `succeeded` with this timestamp.
    committed_at: Mutex<Option<DateTime<Utc>>>,
}

impl JobEntry {
    fn new(snapshot: JobSnapshot) -> Self {
        Self {
            state: Mutex::new(snapshot),
            cancel: CancellationToken::new(),
            gate: Arc::new(tokio::sync::Mutex::new(())),
            committed_at: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.state.lock().clone()
    }

    pub fn id(&self) -> JobId {
        self.state.lock().id
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn gate(&self) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(&self.gate)
    }

    pub(crate) fn mark_committed(&self, at: DateTime<Utc>) {
        *self.committed_at.lock() = Some(at);
    }

    pub(crate) fn is_committed(&self) -> bool {
        self.committed_at.lock().is_some()
    }

    fn committed_at(&self) -> Option<DateTime<Utc>> {
        *self.committed_at.lock()
    }
}

pub struct JobQueue {
    db: DbPool,
    events: Arc<EventBus>,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
    backoff: Backoff,
    repo_timeout: Duration,
    jobs: DashMap<JobId, Arc<JobEntry>>,
    active: DashMap<(JobKind, JobTarget), JobId>,
    ready: Mutex<VecDeque<JobId>>,
    notify: Notify,
    outstanding: watch::Sender<usize>,
    pending_retries: AtomicUsize,
    shutdown: CancellationToken,
}

impl JobQueue {
    pub fn new(
        db: DbPool,
        events: Arc<EventBus>,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
        config: &WorkerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            db,
            events,
            metrics,
            clock,
            max_attempts: config.max_attempts.max(1),
            backoff: Backoff::new(
                Duration::from_millis(config.base_backoff_ms),
                Duration::from_millis(config.max_backoff_ms),
            ),
            repo_timeout: config.repository_timeout(),
            jobs: DashMap::new(),
            active: DashMap::new(),
            ready: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            outstanding,
            pending_retries: AtomicUsize::new(0),
            shutdown,
        }
    }

    /// Enqueue a job, or return the id of the job already queued or running
    /// for the same `(kind, target)`.
    ///
    /// The `(kind, target)` slot is reserved first and the row inserted after
    /// the map guard is released; a failed insert gives the slot back.
    pub fn submit(&self, kind: JobKind, target: JobTarget, payload: JobPayload) -> Result<JobId> {
        check_target_kind(kind, target)?;
        self.check_target_exists(target)?;

        let key = (kind, target);
        let snapshot = match self.active.entry(key) {
            Entry::Occupied(existing) => {
                let id = *existing.get();
                self.metrics.incr(Counter::JobsCoalesced);
                tracing::debug!(job_id = %id, kind = %kind, target = %target, "Coalesced duplicate submission");
                return Ok(id);
            }
            Entry::Vacant(slot) => {
                let snapshot = JobSnapshot::new(
                    kind,
                    target,
                    payload,
                    self.max_attempts,
                    self.clock.now(),
                );
                self.jobs
                    .insert(snapshot.id, Arc::new(JobEntry::new(snapshot.clone())));
                slot.insert(snapshot.id);
                snapshot
            }
        };

        let inserted = self
            .conn()
            .and_then(|conn| queries::jobs::insert_job(&conn, &snapshot.to_record()));
        if let Err(e) = inserted {
            self.active.remove_if(&key, |_, id| *id == snapshot.id);
            self.jobs.remove(&snapshot.id);
            tracing::warn!(kind = %kind, target = %target, error = %e, "Failed to record submitted job");
            return Err(e);
        }

        self.outstanding.send_modify(|n| *n += 1);
        self.metrics.incr(Counter::JobsSubmitted);
        self.emit(&snapshot, None, None);
        self.push_ready(snapshot.id);
        Ok(snapshot.id)
    }

    /// Current state of a job, from memory or, once collected, the database.
    pub fn snapshot(&self, id: JobId) -> Result<JobSnapshot> {
        if let Some(entry) = self.jobs.get(&id) {
            return Ok(entry.snapshot());
        }
        let conn = self.conn()?;
        queries::jobs::get_job(&conn, id)?
            .map(JobSnapshot::from_record)
            .ok_or_else(|| Error::not_found("job", id))
    }

    pub fn status(&self, id: JobId) -> Result<JobStatus> {
        self.snapshot(id).map(|s| s.status)
    }

    /// Jobs held in memory, oldest first.
    pub fn list(&self) -> Vec<JobSnapshot> {
        let mut jobs: Vec<_> = self.jobs.iter().map(|e| e.snapshot()).collect();
        jobs.sort_by_key(|s| s.created_at);
        jobs
    }

    /// Persisted job counts per status.
    pub fn counts(&self) -> Result<Vec<(JobStatus, u64)>> {
        let conn = self.conn()?;
        queries::jobs::count_by_status(&conn)
    }

    /// Jobs submitted but not yet terminal.
    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Request cancellation.
    ///
    /// A queued job is cancelled immediately. A running job is flagged and
    /// stops at its next checkpoint; `false` is returned when it has already
    /// committed its result or the job is terminal. A job this process has
    /// not loaded can only be cancelled while its row is still `queued`.
    pub async fn cancel(&self, id: JobId) -> Result<bool> {
        let Some(entry) = self.jobs.get(&id).map(|e| Arc::clone(e.value())) else {
            return self.cancel_unloaded(id);
        };

        let gate = entry.gate();
        let _guard = gate.lock().await;

        let status = entry.state.lock().status;
        match status {
            JobStatus::Queued => {
                let cancelled = self
                    .transition(
                        &entry,
                        JobStatus::Queued,
                        JobStatus::Cancelled,
                        Some("cancelled before start".into()),
                        None,
                        true,
                    )
                    .await?;
                if cancelled {
                    entry.cancel.cancel();
                }
                Ok(cancelled)
            }
            JobStatus::Running if entry.is_committed() => Ok(false),
            JobStatus::Running => {
                entry.cancel.cancel();
                tracing::info!(job_id = %id, "Cancellation requested for running job");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn cancel_unloaded(&self, id: JobId) -> Result<bool> {
        let mut snap = self.snapshot(id)?;
        if snap.status != JobStatus::Queued {
            return Ok(false);
        }

        let now = self.clock.now();
        let reason = "cancelled before start";
        let conn = self.conn()?;
        if !queries::jobs::cancel_queued(&conn, id, reason, &format_ts(now))? {
            return Ok(false);
        }

        snap.status = JobStatus::Cancelled;
        snap.error = Some(reason.into());
        snap.updated_at = now;
        snap.finished_at = Some(now);
        self.count_transition(JobStatus::Cancelled);
        self.emit(&snap, Some(JobStatus::Queued), snap.error.clone());
        Ok(true)
    }

    /// Cancel every active job targeting `target`.
    pub async fn cancel_target(&self, target: JobTarget) -> Vec<JobId> {
        let ids: Vec<JobId> = ALL_KINDS
            .iter()
            .filter_map(|kind| self.active.get(&(*kind, target)).map(|e| *e.value()))
            .collect();

        let mut cancelled = Vec::with_capacity(ids.len());
        for id in ids {
            match self.cancel(id).await {
                Ok(true) => cancelled.push(id),
                Ok(false) => {}
                Err(e) => tracing::warn!(job_id = %id, error = %e, "Failed to cancel job"),
            }
        }
        cancelled
    }

    /// Wait for the next ready job id. Returns `None` on shutdown.
    pub(crate) async fn next(&self) -> Option<JobId> {
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }

            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(id) = self.ready.lock().pop_front() {
                return Some(id);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.shutdown.cancelled() => return None,
            }
        }
    }

    /// Move a ready job to `Running`, counting the attempt. `None` when the
    /// job was cancelled or collected while it waited, or when the status
    /// write failed; in that case the job goes back on the ready list after
    /// a delay.
    pub(crate) async fn claim(self: &Arc<Self>, id: JobId) -> Option<Arc<JobEntry>> {
        let entry = self.jobs.get(&id).map(|e| Arc::clone(e.value()))?;
        let gate = entry.gate();
        let _guard = gate.lock().await;

        if entry.cancel.is_cancelled() {
            return None;
        }
        *entry.committed_at.lock() = None;
        match self
            .transition(&entry, JobStatus::Queued, JobStatus::Running, None, None, true)
            .await
        {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "Failed to mark job running, requeueing");
                self.schedule_retry(id, self.backoff.delay(1, e.retry_after()));
                return None;
            }
        }
        self.metrics.job_started();
        Some(entry)
    }

    /// Record the outcome of an attempt and decide what happens next.
    pub(crate) async fn finish(
        self: &Arc<Self>,
        entry: Arc<JobEntry>,
        outcome: Result<serde_json::Value>,
    ) {
        let gate = entry.gate();
        let _guard = gate.lock().await;
        self.metrics.job_stopped();

        // The jobs row already says `succeeded`: it was written in the same
        // unit of work as the job's result.
        if entry.is_committed() {
            let result = outcome.ok();
            if let Err(e) = self
                .transition(&entry, JobStatus::Running, JobStatus::Succeeded, None, result, false)
                .await
            {
                tracing::error!(job_id = %entry.id(), error = %e, "Failed to settle committed job");
            }
            return;
        }

        if entry.cancel.is_cancelled() {
            self.settle(&entry, JobStatus::Cancelled, Some("cancelled while running".into()), None)
                .await;
            return;
        }

        let err = match outcome {
            Ok(value) => {
                self.settle(&entry, JobStatus::Succeeded, None, Some(value)).await;
                return;
            }
            Err(e) => e,
        };

        let snap = entry.snapshot();
        let reason = err.to_string();

        if matches!(err, Error::Cancelled) {
            self.settle(&entry, JobStatus::Cancelled, Some(reason), None).await;
        } else if err.is_retryable() && snap.attempt_count < snap.max_attempts {
            let delay = self.backoff.delay(snap.attempt_count, err.retry_after());
            tracing::warn!(
                job_id = %snap.id,
                kind = %snap.kind,
                attempt = snap.attempt_count,
                delay_ms = delay.as_millis() as u64,
                error = %reason,
                "Job failed, scheduling retry"
            );
            if self.settle(&entry, JobStatus::Queued, Some(reason), None).await {
                self.schedule_retry(snap.id, delay);
            }
        } else {
            tracing::error!(
                job_id = %snap.id,
                kind = %snap.kind,
                target = %snap.target,
                attempt = snap.attempt_count,
                failure = %err.kind(),
                error = %reason,
                "Job failed"
            );
            self.settle(&entry, JobStatus::Failed, Some(reason), None).await;
        }
    }

    /// Move a job out of `Running`, retrying the status write until it
    /// lands. Until then the job stays `Running`, outstanding, and holds its
    /// `(kind, target)` slot, so memory never reports a state the `jobs` row
    /// does not hold. On shutdown the row is left `running` for `recover`.
    async fn settle(
        &self,
        entry: &JobEntry,
        to: JobStatus,
        reason: Option<String>,
        result: Option<serde_json::Value>,
    ) -> bool {
        let mut failures = 0u32;
        loop {
            let err = match self
                .transition(entry, JobStatus::Running, to, reason.clone(), result.clone(), true)
                .await
            {
                Ok(applied) => return applied,
                Err(e) => e,
            };

            let id = entry.id();
            if !err.is_retryable() {
                // The row is gone or unwritable for good; nothing in the
                // database can disagree with memory any more.
                tracing::error!(job_id = %id, status = %to, error = %err, "Job status not persisted");
                return self
                    .transition(entry, JobStatus::Running, to, reason, result, false)
                    .await
                    .unwrap_or(false);
            }

            failures += 1;
            let delay = self.backoff.delay(failures, err.retry_after());
            tracing::warn!(
                job_id = %id,
                status = %to,
                failures,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Failed to persist job status, retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => {
                    tracing::warn!(job_id = %id, status = %to, "Shutting down before job status was saved");
                    return false;
                }
            }
        }
    }

    /// Re-queue jobs a previous process left `queued` or `running`.
    pub fn recover(&self) -> Result<usize> {
        let conn = self.conn()?;
        let records = queries::jobs::list_unfinished(&conn)?;

        let mut requeued = 0;
        for record in records {
            let mut snap = JobSnapshot::from_record(record);
            if self.jobs.contains_key(&snap.id) {
                continue;
            }

            let previous = snap.status;
            if previous == JobStatus::Running {
                let now = self.clock.now();
                snap.updated_at = now;
                if snap.attempt_count >= snap.max_attempts {
                    snap.status = JobStatus::Failed;
                    snap.error = Some("interrupted by restart after final attempt".into());
                    snap.finished_at = Some(now);
                } else {
                    snap.status = JobStatus::Queued;
                    snap.error = Some("interrupted by restart".into());
                }
                queries::jobs::update_job_status(&conn, &snap.to_record())?;
                self.count_transition(snap.status);
                self.emit(&snap, Some(previous), snap.error.clone());
            }

            if snap.status != JobStatus::Queued {
                continue;
            }

            let id = snap.id;
            self.active.insert((snap.kind, snap.target), id);
            self.jobs.insert(id, Arc::new(JobEntry::new(snap)));
            self.outstanding.send_modify(|n| *n += 1);
            self.push_ready(id);
            requeued += 1;
        }

        if requeued > 0 {
            tracing::info!(requeued, "Recovered unfinished jobs");
        }
        Ok(requeued)
    }

    /// Drop terminal jobs that finished more than `retention` ago, from
    /// memory and from the database.
    pub fn gc(&self, retention: Duration) -> Result<usize> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| Error::Validation(format!("retention out of range: {e}")))?;
        let cutoff = self.clock.now() - retention;

        let mut dropped = 0usize;
        self.jobs.retain(|_, entry| {
            let state = entry.state.lock();
            let expired = state.status.is_terminal()
                && state.finished_at.is_some_and(|finished| finished <= cutoff);
            if expired {
                dropped += 1;
            }
            !expired
        });

        let conn = self.conn()?;
        let deleted = queries::jobs::delete_finished_before(&conn, &format_ts(cutoff))?;

        let removed = dropped.max(deleted);
        if removed > 0 {
            tracing::info!(removed, "Collected finished jobs");
        }
        Ok(removed)
    }

    /// Resolve once every submitted job has reached a terminal state.
    pub async fn wait_idle(&self) {
        let mut rx = self.outstanding.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Retries waiting out their backoff delay.
    pub fn pending_retries(&self) -> usize {
        self.pending_retries.load(Ordering::Relaxed)
    }

    fn schedule_retry(self: &Arc<Self>, id: JobId, delay: Duration) {
        let queue = Arc::clone(self);
        queue.pending_retries.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => queue.push_ready(id),
                _ = queue.shutdown.cancelled() => {}
            }
            queue.pending_retries.fetch_sub(1, Ordering::Relaxed);
        });
    }

    fn push_ready(&self, id: JobId) {
        self.ready.lock().push_back(id);
        self.notify.notify_one();
    }

    /// Apply `from -> to` if the job is still in `from`. Returns whether the
    /// transition happened.
    ///
    /// Callers hold the job's gate. With `persist`, the `jobs` row is written
    /// first and a failed write leaves the in-memory state untouched.
    async fn transition(
        &self,
        entry: &JobEntry,
        from: JobStatus,
        to: JobStatus,
        reason: Option<String>,
        result: Option<serde_json::Value>,
        persist: bool,
    ) -> Result<bool> {
        let next = {
            let state = entry.state.lock();
            if state.status != from || !from.can_transition_to(to) {
                return Ok(false);
            }
            let now = match entry.committed_at() {
                Some(at) if !persist && to == JobStatus::Succeeded => at,
                _ => self.clock.now(),
            };
            let mut next = state.clone();
            next.status = to;
            next.updated_at = now;
            if to == JobStatus::Running {
                next.attempt_count += 1;
            }
            if reason.is_some() {
                next.error.clone_from(&reason);
            }
            if result.is_some() {
                next.result = result;
            }
            if to.is_terminal() {
                next.finished_at = Some(now);
            }
            next
        };

        if persist {
            self.persist_status(&next).await?;
        }
        *entry.state.lock() = next.clone();

        if to.is_terminal() {
            self.active
                .remove_if(&(next.kind, next.target), |_, id| *id == next.id);
            self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
        }

        self.count_transition(to);
        self.emit(&next, Some(from), reason);
        Ok(true)
    }

    async fn persist_status(&self, snap: &JobSnapshot) -> Result<()> {
        let db = self.db.clone();
        let deadline = Deadline::after(self.repo_timeout);
        let record = snap.to_record();
        tokio::task::spawn_blocking(move || {
            let conn = get_conn_within(&db, deadline)?;
            if queries::jobs::update_job_status(&conn, &record)? {
                Ok(())
            } else {
                Err(Error::not_found("job", record.id))
            }
        })
        .await
        .map_err(|e| Error::Internal(format!("job status write failed: {e}")))?
    }

    fn count_transition(&self, to: JobStatus) {
        let counter = match to {
            JobStatus::Queued => Counter::JobsRetried,
            JobStatus::Succeeded => Counter::JobsSucceeded,
            JobStatus::Failed => Counter::JobsFailed,
            JobStatus::Cancelled => Counter::JobsCancelled,
            JobStatus::Running => return,
        };
        self.metrics.incr(counter);
    }

    fn emit(&self, snap: &JobSnapshot, from: Option<JobStatus>, reason: Option<String>) {
        if snap.status.is_terminal() {
            tracing::info!(
                job_id = %snap.id,
                kind = %snap.kind,
                target = %snap.target,
                status = %snap.status,
                attempt = snap.attempt_count,
                "Job finished"
            );
        } else {
            tracing::debug!(
                job_id = %snap.id,
                kind = %snap.kind,
                status = %snap.status,
                attempt = snap.attempt_count,
                "Job status changed"
            );
        }

        self.events.broadcast(EventPayload::JobStatusChanged {
            job_id: snap.id,
            kind: snap.kind,
            target: snap.target,
            from,
            to: snap.status,
            attempt: snap.attempt_count,
            reason,
        });
    }

    fn check_target_exists(&self, target: JobTarget) -> Result<()> {
        let conn = self.conn()?;
        let found = match target {
            JobTarget::Library(id) => queries::libraries::get_library(&conn, id)?.is_some(),
            JobTarget::Item(id) => queries::items::get_item(&conn, id)?.is_some(),
        };
        if found {
            Ok(())
        } else {
            let entity = match target {
                JobTarget::Library(_) => "library",
                JobTarget::Item(_) => "item",
            };
            Err(Error::not_found(entity, target.raw_id()))
        }
    }

    fn conn(&self) -> Result<PooledConnection> {
        get_conn_within(&self.db, Deadline::after(self.repo_timeout))
    }
}

fn check_target_kind(kind: JobKind, target: JobTarget) -> Result<()> {
    match (kind, target) {
        (JobKind::Scan, JobTarget::Library(_)) => Ok(()),
        (JobKind::Scan, JobTarget::Item(_)) => Err(Error::Validation(
            "scan jobs target a library, not an item".into(),
        )),
        (_, JobTarget::Item(_)) => Ok(()),
        (_, JobTarget::Library(_)) => Err(Error::Validation(format!(
            "{kind} jobs target an item, not a library"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rk_core::{ItemId, LibraryId, ManualClock};
    use rk_db::models::NewItem;

    struct Fixture {
        queue: Arc<JobQueue>,
        events: Arc<EventBus>,
        metrics: Arc<Metrics>,
        clock: Arc<ManualClock>,
        library: LibraryId,
        item: ItemId,
    }

    fn fixture(max_attempts: u32) -> Fixture {
        let db = rk_db::init_memory_pool().unwrap();
        let (library, item) = {
            let conn = rk_db::get_conn(&db).unwrap();
            let lib = queries::libraries::create_library(&conn, "Films", "/films").unwrap();
            let item = queries::items::create_item(
                &conn,
                &NewItem {
                    library_id: lib.id,
                    file_path: "/films/Heat (1995).mkv".into(),
                    title: "Heat".into(),
                    year: Some(1995),
                },
            )
            .unwrap();
            (lib.id, item.id)
        };

        let events = Arc::new(EventBus::default());
        let metrics = Arc::new(Metrics::new());
        let clock = Arc::new(ManualClock::default());
        let config = WorkerConfig {
            max_attempts,
            base_backoff_ms: 1,
            max_backoff_ms: 5,
            ..Default::default()
        };
        let queue = Arc::new(JobQueue::new(
            db,
            events.clone(),
            metrics.clone(),
            clock.clone(),
            &config,
            CancellationToken::new(),
        ));
        Fixture {
            queue,
            events,
            metrics,
            clock,
            library,
            item,
        }
    }

    #[test]
    fn submit_validates_target() {
        let f = fixture(3);
        assert_matches!(
            f.queue
                .submit(JobKind::Scan, f.item.into(), JobPayload::default()),
            Err(Error::Validation(_))
        );
        assert_matches!(
            f.queue
                .submit(JobKind::Match, f.library.into(), JobPayload::default()),
            Err(Error::Validation(_))
        );
        assert_matches!(
            f.queue
                .submit(JobKind::Match, ItemId::new(999).into(), JobPayload::default()),
            Err(Error::NotFound { .. })
        );
        assert_eq!(f.queue.outstanding(), 0);
    }

    #[test]
    fn duplicate_submission_is_coalesced() {
        let f = fixture(3);
        let a = f
            .queue
            .submit(JobKind::Match, f.item.into(), JobPayload::default())
            .unwrap();
        let b = f
            .queue
            .submit(JobKind::Match, f.item.into(), JobPayload::default().refreshed())
            .unwrap();
        let c = f
            .queue
            .submit(JobKind::ArtworkFetch, f.item.into(), JobPayload::default())
            .unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(f.queue.outstanding(), 2);
        assert_eq!(f.metrics.get(Counter::JobsCoalesced), 1);
        assert_eq!(f.queue.status(a).unwrap(), JobStatus::Queued);
    }

    #[tokio::test]
    async fn cancel_queued_job_is_terminal_and_releases_target() {
        let f = fixture(3);
        let mut rx = f.events.subscribe();
        let id = f
            .queue
            .submit(JobKind::Match, f.item.into(), JobPayload::default())
            .unwrap();

        assert!(f.queue.cancel(id).await.unwrap());
        assert_eq!(f.queue.status(id).unwrap(), JobStatus::Cancelled);
        assert!(f.queue.claim(id).await.is_none());
        assert!(!f.queue.cancel(id).await.unwrap());
        assert_eq!(f.queue.outstanding(), 0);

        let next = f
            .queue
            .submit(JobKind::Match, f.item.into(), JobPayload::default())
            .unwrap();
        assert_ne!(next, id);

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EventPayload::JobStatusChanged { job_id, from, to, .. } = event.payload {
                if job_id == id {
                    seen.push((from, to));
                }
            }
        }
        assert_eq!(
            seen,
            vec![
                (None, JobStatus::Queued),
                (Some(JobStatus::Queued), JobStatus::Cancelled)
            ]
        );
    }

    #[tokio::test]
    async fn retryable_failure_requeues_until_attempts_run_out() {
        let f = fixture(2);
        let id = f
            .queue
            .submit(JobKind::Match, f.item.into(), JobPayload::default())
            .unwrap();

        let entry = f.queue.claim(f.queue.next().await.unwrap()).await.unwrap();
        f.queue
            .finish(entry, Err(Error::unavailable("provider down")))
            .await;
        assert_eq!(f.queue.status(id).unwrap(), JobStatus::Queued);

        let entry = f.queue.claim(f.queue.next().await.unwrap()).await.unwrap();
        assert_eq!(entry.snapshot().attempt_count, 2);
        f.queue
            .finish(entry, Err(Error::unavailable("provider down")))
            .await;

        let snap = f.queue.snapshot(id).unwrap();
        assert_eq!(snap.status, JobStatus::Failed);
        assert_eq!(snap.attempt_count, 2);
        assert!(snap.error.unwrap().contains("provider down"));
        assert_eq!(f.metrics.get(Counter::JobsRetried), 1);
        assert_eq!(f.metrics.get(Counter::JobsFailed), 1);
        assert_eq!(f.queue.outstanding(), 0);
    }

    #[tokio::test]
    async fn terminal_failure_is_not_retried() {
        let f = fixture(5);
        let id = f
            .queue
            .submit(JobKind::Match, f.item.into(), JobPayload::default())
            .unwrap();
        let entry = f.queue.claim(f.queue.next().await.unwrap()).await.unwrap();
        f.queue
            .finish(entry, Err(Error::not_found("metadata", "Heat")))
            .await;

        let snap = f.queue.snapshot(id).unwrap();
        assert_eq!(snap.status, JobStatus::Failed);
        assert_eq!(snap.attempt_count, 1);
    }

    #[tokio::test]
    async fn running_job_flagged_then_cancelled_on_finish() {
        let f = fixture(3);
        let id = f
            .queue
            .submit(JobKind::Match, f.item.into(), JobPayload::default())
            .unwrap();
        let entry = f.queue.claim(f.queue.next().await.unwrap()).await.unwrap();

        assert!(f.queue.cancel(id).await.unwrap());
        assert!(entry.cancel_token().is_cancelled());
        assert_eq!(f.queue.status(id).unwrap(), JobStatus::Running);

        f.queue.finish(entry, Ok(serde_json::json!({}))).await;
        assert_eq!(f.queue.status(id).unwrap(), JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn recover_requeues_orphaned_jobs() {
        let f = fixture(3);
        let id = f
            .queue
            .submit(JobKind::Match, f.item.into(), JobPayload::default())
            .unwrap();
        let _entry = f.queue.claim(f.queue.next().await.unwrap()).await.unwrap();

        // A fresh queue over the same database plays the restarted process.
        let restarted = JobQueue::new(
            f.queue.db.clone(),
            f.events.clone(),
            Arc::new(Metrics::new()),
            f.clock.clone(),
            &WorkerConfig::default(),
            CancellationToken::new(),
        );
        assert_eq!(restarted.recover().unwrap(), 1);
        let snap = restarted.snapshot(id).unwrap();
        assert_eq!(snap.status, JobStatus::Queued);
        assert_eq!(snap.error.as_deref(), Some("interrupted by restart"));
        assert_eq!(restarted.outstanding(), 1);
        assert_eq!(restarted.recover().unwrap(), 0);
    }

    #[tokio::test]
    async fn gc_drops_only_expired_terminal_jobs() {
        let f = fixture(3);
        let done = f
            .queue
            .submit(JobKind::Match, f.item.into(), JobPayload::default())
            .unwrap();
        let entry = f.queue.claim(f.queue.next().await.unwrap()).await.unwrap();
        f.queue.finish(entry, Ok(serde_json::json!({"ok": true}))).await;
        let pending = f
            .queue
            .submit(JobKind::ArtworkFetch, f.item.into(), JobPayload::default())
            .unwrap();

        assert_eq!(f.queue.gc(Duration::from_secs(3600)).unwrap(), 0);

        // The row carries the queue clock's finish time, so the database
        // copy expires together with the in-memory one.
        {
            let conn = rk_db::get_conn(&f.queue.db).unwrap();
            let row = queries::jobs::get_job(&conn, done).unwrap().unwrap();
            assert_eq!(row.finished_at, Some(format_ts(f.clock.now())));
        }

        f.clock.advance(Duration::from_secs(7200));
        assert_eq!(f.queue.gc(Duration::from_secs(3600)).unwrap(), 1);
        assert_matches!(f.queue.snapshot(done), Err(Error::NotFound { .. }));
        let conn = rk_db::get_conn(&f.queue.db).unwrap();
        assert!(queries::jobs::get_job(&conn, done).unwrap().is_none());
        assert_eq!(f.queue.status(pending).unwrap(), JobStatus::Queued);
    }

    #[tokio::test]
    async fn finish_keeps_job_running_until_status_is_written() {
        let f = fixture(3);
        let id = f
            .queue
            .submit(JobKind::Match, f.item.into(), JobPayload::default())
            .unwrap();
        let entry = f.queue.claim(f.queue.next().await.unwrap()).await.unwrap();

        let blocker = rk_db::get_conn(&f.queue.db).unwrap();
        blocker.execute_batch("BEGIN IMMEDIATE").unwrap();

        let queue = f.queue.clone();
        let finishing = tokio::spawn(async move {
            queue
                .finish(entry, Err(Error::Validation("bad title".into())))
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.queue.status(id).unwrap(), JobStatus::Running);
        assert_eq!(f.queue.outstanding(), 1);
        assert_eq!(
            f.queue
                .submit(JobKind::Match, f.item.into(), JobPayload::default())
                .unwrap(),
            id
        );

        blocker.execute_batch("ROLLBACK").unwrap();
        finishing.await.unwrap();

        assert_eq!(f.queue.status(id).unwrap(), JobStatus::Failed);
        assert_eq!(f.queue.outstanding(), 0);
        {
            let conn = rk_db::get_conn(&f.queue.db).unwrap();
            let row = queries::jobs::get_job(&conn, id).unwrap().unwrap();
            assert_eq!(row.status, JobStatus::Failed);
            assert!(row.finished_at.is_some());
        }

        let again = f
            .queue
            .submit(JobKind::Match, f.item.into(), JobPayload::default())
            .unwrap();
        assert_ne!(again, id);
    }

    #[tokio::test]
    async fn failed_submit_releases_target() {
        let f = fixture(3);
        let blocker = rk_db::get_conn(&f.queue.db).unwrap();
        blocker.execute_batch("BEGIN IMMEDIATE").unwrap();

        assert_matches!(
            f.queue
                .submit(JobKind::Match, f.item.into(), JobPayload::default()),
            Err(Error::Unavailable(_))
        );
        assert_eq!(f.queue.outstanding(), 0);
        assert!(f.queue.list().is_empty());

        blocker.execute_batch("ROLLBACK").unwrap();
        let id = f
            .queue
            .submit(JobKind::Match, f.item.into(), JobPayload::default())
            .unwrap();
        assert_eq!(f.queue.status(id).unwrap(), JobStatus::Queued);
        assert_eq!(f.queue.outstanding(), 1);
    }

    #[tokio::test]
    async fn cancel_reaches_queued_job_held_by_another_process() {
        let f = fixture(3);
        let id = f
            .queue
            .submit(JobKind::Match, f.item.into(), JobPayload::default())
            .unwrap();

        let other = JobQueue::new(
            f.queue.db.clone(),
            f.events.clone(),
            Arc::new(Metrics::new()),
            f.clock.clone(),
            &WorkerConfig::default(),
            CancellationToken::new(),
        );
        assert!(other.cancel(id).await.unwrap());
        assert_eq!(other.status(id).unwrap(), JobStatus::Cancelled);
        assert!(!other.cancel(id).await.unwrap());

        // The owning queue no longer gets to run it.
        let conn = rk_db::get_conn(&f.queue.db).unwrap();
        let row = queries::jobs::get_job(&conn, id).unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn next_returns_none_on_shutdown() {
        let f = fixture(3);
        f.queue.shutdown.cancel();
        assert!(f.queue.next().await.is_none());
    }
}
