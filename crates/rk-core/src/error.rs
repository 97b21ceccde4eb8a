//! Unified error type for the reelkeep application.
//!
//! All crates funnel their failures into [`Error`]. Every error classifies
//! into a [`FailureKind`] via [`Error::kind`], which is what the job retry
//! policy and the cache degradation logic act on.

use std::fmt;
use std::time::Duration;

/// Unified error type covering all failure modes in reelkeep.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested entity (or a provider query) matched nothing.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "item", "library", "metadata").
        entity: String,
        /// The identifier or query that was looked up.
        id: String,
    },

    /// The caller supplied a query the provider rejects.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Request data failed validation before reaching any backend.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The provider asked us to slow down.
    #[error("Rate limited: {message}")]
    RateLimited {
        /// Human-readable description from the provider.
        message: String,
        /// Suggested wait before the next attempt, if the provider sent one.
        retry_after: Option<Duration>,
    },

    /// A provider, repository, or network dependency is unreachable or
    /// exceeded its deadline.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// The configured cache backend cannot be reached.
    ///
    /// Kept separate from [`Error::Unavailable`] so callers can tell a
    /// broken cache apart from a broken provider and bypass caching.
    #[error("Cache backend unavailable: {0}")]
    CacheUnavailable(String),

    /// A transient filesystem or socket failure.
    #[error("IO error: {source}")]
    TransientIo {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// A write violated a schema constraint; the transaction was rolled back.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// A conflicting resource already exists.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A database operation failed for a non-transient reason.
    #[error("Database error: {source}")]
    Database {
        /// The underlying database error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The job observed a cancellation request at a checkpoint.
    #[error("Cancelled")]
    Cancelled,

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure classes used by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    NotFound,
    InvalidQuery,
    RateLimited,
    Unavailable,
    TransientIo,
    ConstraintViolation,
    Cancelled,
    Internal,
}

impl FailureKind {
    /// Whether a job failing with this kind goes back to `Queued`.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureKind::RateLimited | FailureKind::Unavailable | FailureKind::TransientIo
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::NotFound => "not_found",
            FailureKind::InvalidQuery => "invalid_query",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Unavailable => "unavailable",
            FailureKind::TransientIo => "transient_io",
            FailureKind::ConstraintViolation => "constraint_violation",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl Error {
    /// Classify this error into the retry taxonomy.
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::NotFound { .. } => FailureKind::NotFound,
            Error::InvalidQuery(_) | Error::Validation(_) => FailureKind::InvalidQuery,
            Error::RateLimited { .. } => FailureKind::RateLimited,
            Error::Unavailable(_) | Error::CacheUnavailable(_) => FailureKind::Unavailable,
            Error::TransientIo { .. } => FailureKind::TransientIo,
            Error::ConstraintViolation(_) | Error::Conflict(_) => {
                FailureKind::ConstraintViolation
            }
            Error::Cancelled => FailureKind::Cancelled,
            Error::Database { .. } | Error::Internal(_) => FailureKind::Internal,
        }
    }

    /// Shorthand for `self.kind().is_retryable()`.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Provider-suggested delay for rate-limited failures.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Database`].
    pub fn database(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Database {
            source: source.into(),
        }
    }

    /// Convenience constructor for [`Error::Unavailable`].
    pub fn unavailable(message: impl Into<String>) -> Self {
        Error::Unavailable(message.into())
    }

    /// Convenience constructor for [`Error::RateLimited`].
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Error::RateLimited {
            message: message.into(),
            retry_after,
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
