//! Background jobs: typed submission, a deduplicating queue, a bounded
//! worker pool and the per-kind handlers.

pub mod backoff;
pub mod context;
pub(crate) mod handlers;
pub mod pool;
pub mod queue;

pub use backoff::Backoff;
pub use context::JobContext;
pub use handlers::{AddedItem, ArtworkOutcome, MatchOutcome, ScanOutcome, SubtitleOutcome};
pub use queue::JobQueue;

use chrono::{DateTime, SecondsFormat, Utc};
use rk_core::{JobId, JobKind, JobStatus, JobTarget};
use rk_db::models::JobRecord;
use serde::{Deserialize, Serialize};

/// Per-job options supplied at submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobPayload {
    /// Provider to query instead of the primary one.
    pub provider: Option<String>,
    /// Drop any cached provider answer before looking up.
    pub force_refresh: bool,
    /// Subtitle language, for subtitle jobs.
    pub language: Option<String>,
}

impl JobPayload {
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn refreshed(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

/// Point-in-time view of one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub kind: JobKind,
    pub target: JobTarget,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Reason for the last failure, kept across retries.
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobSnapshot {
    pub(crate) fn new(
        kind: JobKind,
        target: JobTarget,
        payload: JobPayload,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            kind,
            target,
            payload,
            status: JobStatus::Queued,
            attempt_count: 0,
            max_attempts: max_attempts.max(1),
            error: None,
            result: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub(crate) fn to_record(&self) -> JobRecord {
        JobRecord {
            id: self.id,
            kind: self.kind,
            target: self.target,
            payload: serde_json::to_string(&self.payload).unwrap_or_else(|_| "{}".into()),
            status: self.status,
            attempt_count: self.attempt_count,
            max_attempts: self.max_attempts,
            error: self.error.clone(),
            result: self.result.as_ref().map(|v| v.to_string()),
            created_at: format_ts(self.created_at),
            updated_at: format_ts(self.updated_at),
            finished_at: self.finished_at.map(format_ts),
        }
    }

    pub(crate) fn from_record(record: JobRecord) -> Self {
        Self {
            id: record.id,
            kind: record.kind,
            target: record.target,
            payload: serde_json::from_str(&record.payload).unwrap_or_default(),
            status: record.status,
            attempt_count: record.attempt_count,
            max_attempts: record.max_attempts,
            error: record.error,
            result: record
                .result
                .as_deref()
                .and_then(|r| serde_json::from_str(r).ok()),
            created_at: parse_ts(&record.created_at),
            updated_at: parse_ts(&record.updated_at),
            finished_at: record.finished_at.as_deref().map(parse_ts),
        }
    }
}

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_default()
}
