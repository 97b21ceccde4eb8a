//! Shared engine context.
//!
//! [`EngineContext`] is the set of collaborators every worker and every
//! engine operation needs. Each one is passed in at construction; nothing is
//! looked up globally.

use std::sync::Arc;

use rk_core::config::Config;
use rk_core::events::EventBus;
use rk_core::Clock;
use rk_db::DbPool;

use crate::assets::{AssetFetcher, AssetStorage};
use crate::gateway::ProviderGateway;
use crate::jobs::JobQueue;
use crate::metrics::Metrics;
use crate::view::LibraryView;

/// Engine context shared by workers and the [`Engine`](crate::Engine) facade.
///
/// This is cheaply cloneable because it only holds `Arc`s.
#[derive(Clone)]
pub struct EngineContext {
    /// Immutable configuration snapshot.
    pub config: Arc<Config>,
    /// Database connection pool.
    pub db: DbPool,
    pub clock: Arc<dyn Clock>,
    /// Broadcast bus for job transitions and library changes.
    pub events: Arc<EventBus>,
    pub metrics: Arc<Metrics>,
    /// Cached, rate-limited provider lookups.
    pub gateway: Arc<ProviderGateway>,
    pub fetcher: Arc<dyn AssetFetcher>,
    pub storage: Arc<AssetStorage>,
    pub queue: Arc<JobQueue>,
    /// Paged reads of library items.
    pub view: LibraryView,
}
