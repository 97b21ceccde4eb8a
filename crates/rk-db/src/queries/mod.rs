//! Database query modules.
//!
//! Free functions over a borrowed `Connection`, so the same code runs on a
//! pooled connection or inside a [`UnitOfWork`](crate::uow::UnitOfWork).

pub mod artwork;
pub mod cache_entries;
pub mod credits;
pub mod history;
pub mod items;
pub mod jobs;
pub mod libraries;
pub mod subtitles;

use chrono::{SecondsFormat, Utc};

/// Current time as a fixed-width RFC 3339 string, so text ordering matches
/// chronological ordering.
pub(crate) fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
