//! Metadata provider call contract.
//!
//! A provider answers one query with one [`Metadata`] record or a
//! [`ProviderError`]. Wire formats and authentication belong to the concrete
//! implementation; the engine only sees this trait.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use rk_cache::QueryParams;
use rk_core::{ArtworkKind, Error};
use serde::{Deserialize, Serialize};

/// Failure of a single provider lookup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// The query matched nothing. Terminal.
    #[error("no match: {0}")]
    NotFound(String),

    /// Too many requests. Retry after backoff.
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// Provider unreachable or timed out. Retry after backoff.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The query itself is malformed. Terminal.
    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. } | ProviderError::Unavailable(_)
        )
    }
}

impl From<ProviderError> for Error {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::NotFound(q) => Error::not_found("metadata", q),
            ProviderError::RateLimited { retry_after } => {
                Error::rate_limited("provider rate limit", retry_after)
            }
            ProviderError::Unavailable(msg) => Error::Unavailable(msg),
            ProviderError::InvalidQuery(msg) => Error::InvalidQuery(msg),
        }
    }
}

/// A cast or crew credit as reported by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditRef {
    pub name: String,
    /// Character for cast, job for crew.
    #[serde(default)]
    pub part: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtworkRef {
    pub kind: ArtworkKind,
    pub url: String,
    #[serde(default)]
    pub width: Option<i32>,
    #[serde(default)]
    pub height: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleRef {
    pub language: String,
    pub format: String,
    pub url: String,
}

/// Provider answer for one query. Every field but `title` is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metadata {
    pub title: String,
    pub original_title: Option<String>,
    pub year: Option<i32>,
    pub runtime_minutes: Option<i32>,
    pub overview: Option<String>,
    pub genres: Vec<String>,
    /// Provider-specific ids, e.g. `{"tmdb": "949", "imdb": "tt0113277"}`.
    pub external_ids: BTreeMap<String, String>,
    pub cast: Vec<CreditRef>,
    pub crew: Vec<CreditRef>,
    pub artwork: Vec<ArtworkRef>,
    pub subtitles: Vec<SubtitleRef>,
}

/// An external metadata source.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Name used for registry lookup, rate limits and cache fingerprints.
    fn name(&self) -> &str;

    async fn lookup(&self, query: &QueryParams) -> Result<Metadata, ProviderError>;
}
