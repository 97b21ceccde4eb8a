//! Periodic removal of expired cache entries.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::CacheStore;

/// Sweep `store` every `interval` until `cancel` fires.
///
/// `on_swept` is called with the number of removed entries after every
/// sweep that removed at least one. A failed sweep is logged and retried on
/// the next tick.
pub fn spawn_sweeper<F>(
    store: Arc<dyn CacheStore>,
    interval: Duration,
    cancel: CancellationToken,
    on_swept: F,
) -> JoinHandle<()>
where
    F: Fn(usize) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        tracing::info!(backend = store.backend(), ?interval, "Cache sweeper started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => { break; }
            }

            match store.sweep().await {
                Ok(0) => {}
                Ok(removed) => {
                    tracing::debug!(removed, "Swept expired cache entries");
                    on_swept(removed);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Cache sweep failed");
                }
            }
        }

        tracing::info!("Cache sweeper stopped");
    })
}
