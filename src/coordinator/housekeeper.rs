//! Periodic upkeep for a joined peer: heartbeat refresh and expiry sweep.
//!
//! Both loops survive backend failures. A failed tick is logged and the next
//! tick retries; only the shutdown signal ends them.
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, warn};

use super::Coordinator;

pub(crate) async fn run_heartbeat(coordinator: Arc<Coordinator>, mut shutdown: watch::Receiver<bool>) {
    let period = coordinator.settings().heartbeat_interval;
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick fires immediately and join already wrote our entry
    ticker.tick().await;

    debug!(
        "[{}] Heartbeat every {:?}",
        coordinator.peer_id(),
        period
    );
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = coordinator.refresh_heartbeat().await {
                    warn!(
                        "[{}] Heartbeat failed, retrying in {:?}: {}",
                        coordinator.peer_id(),
                        period,
                        e
                    );
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("[{}] Heartbeat stopped", coordinator.peer_id());
}

pub(crate) async fn run_sweep(coordinator: Arc<Coordinator>, mut shutdown: watch::Receiver<bool>) {
    let period = coordinator.settings().sweep_interval;
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    debug!("[{}] Sweeping every {:?}", coordinator.peer_id(), period);
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = coordinator.sweep_expired().await {
                    warn!(
                        "[{}] Sweep failed, retrying in {:?}: {}",
                        coordinator.peer_id(),
                        period,
                        e
                    );
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("[{}] Sweep stopped", coordinator.peer_id());
}
