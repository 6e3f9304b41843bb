use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;

use super::HttpCache;

/// Periodically removes stale entries until `shutdown` flips to true or its
/// sender is dropped.
pub fn spawn_cache_sweeper(
    cache: HttpCache,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = cache.sweep();
                    info!(
                        entries = stats.entries,
                        removed = stats.removed,
                        hits = stats.hits,
                        "cache maintenance complete"
                    );
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("cache sweeper stopped");
    })
}
