//! # rk-engine
//!
//! Background core of the reelkeep media library.
//!
//! This crate provides:
//!
//! - **[`ProviderGateway`]** -- the only path to external metadata providers,
//!   with per-provider rate limiting and cache-aside lookups.
//! - **[`TmdbProvider`]** -- the built-in TMDB provider, registered from
//!   config.
//! - **[`JobQueue`]** -- typed, deduplicated job submission with retries,
//!   cancellation and restart recovery, drained by a bounded worker pool.
//! - **Handlers** -- scan, match, artwork and subtitle jobs, each committing
//!   its writes in one unit of work.
//! - **[`LibraryView`]** -- windowed, page-cached reads of a library's items.
//! - **[`Engine`]** -- wires the above together and owns the background
//!   tasks.

pub mod assets;
pub mod context;
pub mod engine;
pub mod gateway;
pub mod jobs;
pub mod metrics;
pub mod provider;
pub mod registry;
pub mod tmdb;
pub mod view;

// Re-export key types at the crate root.
pub use assets::{AssetFetcher, AssetStorage, HttpAssetFetcher, StoredAsset};
pub use context::EngineContext;
pub use engine::{Engine, EngineBuilder, EngineStats};
pub use gateway::ProviderGateway;
pub use jobs::{
    AddedItem, ArtworkOutcome, JobPayload, JobQueue, JobSnapshot, MatchOutcome, ScanOutcome,
    SubtitleOutcome,
};
pub use metrics::{Counter, Metrics, MetricsSnapshot, Op};
pub use provider::{ArtworkRef, CreditRef, Metadata, MetadataProvider, ProviderError, SubtitleRef};
pub use registry::ProviderRegistry;
pub use tmdb::TmdbProvider;
pub use view::LibraryView;
