use super::mirror_registry::MirrorRegistry;
use super::result_cache::ResultCache;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Periodically drops result cache entries nobody refreshed since the last
/// sweep, bounding growth from abandoned keys.
pub fn spawn_sweeper<V>(
    cache: Arc<ResultCache<V>>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()>
where
    V: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        info!("🧹 Cache sweep loop started (every {}s)", interval.as_secs());

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("🧹 Sweep loop shutting down");
                    break;
                }
                () = sleep(interval) => {
                    let removed = cache.sweep(interval).await;
                    if removed > 0 {
                        info!("🧹 SWEEP: removed {} abandoned cache entries", removed);
                    } else {
                        debug!("🧹 SWEEP: nothing to remove");
                    }
                }
            }
        }
    })
}

/// Periodically stops mirrors that no request or stream used for `idle`
pub fn spawn_mirror_eviction(
    mirrors: Arc<MirrorRegistry>,
    interval: Duration,
    idle: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "🧹 Mirror eviction loop started (every {}s, idle grace {}s)",
            interval.as_secs(),
            idle.as_secs()
        );

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("🧹 Mirror eviction loop shutting down");
                    break;
                }
                () = sleep(interval) => {
                    let removed = mirrors.evict_idle(idle);
                    if removed > 0 {
                        info!("🧹 EVICT: stopped {} idle mirrors, {} left", removed, mirrors.len());
                    } else {
                        debug!("🧹 EVICT: no idle mirrors");
                    }
                }
            }
        }
    })
}
