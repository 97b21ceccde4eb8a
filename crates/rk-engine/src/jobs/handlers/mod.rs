//! Per-kind job handlers.
//!
//! Each handler does its provider calls and downloads first, then writes
//! everything in a single [`JobContext::commit`]. The returned JSON value is
//! the job's stored result.

mod artwork;
mod matcher;
mod scan;
mod subtitle;

pub use artwork::ArtworkOutcome;
pub use matcher::MatchOutcome;
pub use scan::{AddedItem, ScanOutcome};
pub use subtitle::SubtitleOutcome;

use rk_core::{Error, JobKind, Result};
use serde::Serialize;

use super::JobContext;

/// Dispatch a job to its handler.
pub(crate) async fn run(job: &JobContext) -> Result<serde_json::Value> {
    match job.kind() {
        JobKind::Scan => to_value(scan::run(job).await?),
        JobKind::Match => to_value(matcher::run(job).await?),
        JobKind::ArtworkFetch => to_value(artwork::run(job).await?),
        JobKind::SubtitleFetch => to_value(subtitle::run(job).await?),
    }
}

fn to_value<T: Serialize>(outcome: T) -> Result<serde_json::Value> {
    serde_json::to_value(outcome)
        .map_err(|e| Error::Internal(format!("job result not serializable: {e}")))
}
