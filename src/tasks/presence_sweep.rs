use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{info, warn};

use crate::store::PresenceTracker;

/// 周期清理在线集合中的失效成员 / Periodically prune stale members of the online set
///
/// Lost disconnects leave ids behind whose presence record has already aged
/// out; the sweep keeps "who is online" honest without touching live users.
pub fn spawn_sweep_task(
    presence: PresenceTracker,
    sweep_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        info!("🧹 presence sweep every {}s", sweep_interval.as_secs());
        let mut ticker = interval(sweep_interval);
        // the first tick fires immediately, which doubles as a startup sweep
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match presence.sweep_expired().await {
                        Ok(pruned) if pruned > 0 => {
                            info!("🧹 presence sweep pruned {pruned} stale users");
                        }
                        Ok(_) => {}
                        Err(err) => warn!("presence sweep failed: {err:#}"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("🧹 presence sweep stopping");
                        break;
                    }
                }
            }
        }
    });
}
