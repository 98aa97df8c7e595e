//! [`QuotaPeer`]: the handle an application holds to share a quota.
//!
//! ```no_run
//! # async fn demo() -> covey::Result<()> {
//! use std::sync::Arc;
//! use covey::{MemoryBackend, Quota, QuotaPeer};
//!
//! let backend = Arc::new(MemoryBackend::new());
//! let quota = Quota::new(10, 1000, Some(4))?;
//! let peer = QuotaPeer::join(quota, "crawler", backend).await?;
//! if peer.start() {
//!     // do the work
//!     peer.end();
//! }
//! peer.unregister().await?;
//! # Ok(())
//! # }
//! ```
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::housekeeper;
use super::{Coordinator, RebalanceMessage};
use crate::admission::AdmissionController;
use crate::backend::Backend;
use crate::error::{CoveyError, Result};
use crate::peer_id::PeerId;
use crate::quota::{GroupIntent, Quota};
use crate::registry::PeerRegistry;
use crate::settings::PeerSettings;
use crate::{config_error, coordination_error};

/// One member of a quota sharing group.
///
/// Dropping a peer stops its background tasks without telling the group;
/// the others evict it once its entry expires. Call [`QuotaPeer::unregister`]
/// to leave immediately.
#[derive(Debug)]
pub struct QuotaPeer {
    coordinator: Arc<Coordinator>,
    admission: Arc<AdmissionController>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl QuotaPeer {
    /// Join `channel` with default timing and announce `quota` as the
    /// group's target. Resolves once this peer has seen its own join
    /// notification and holds a share.
    pub async fn join(quota: Quota, channel: &str, backend: Arc<dyn Backend>) -> Result<Self> {
        Self::join_with_settings(quota, channel, backend, PeerSettings::default()).await
    }

    pub async fn join_with_settings(
        quota: Quota,
        channel: &str,
        backend: Arc<dyn Backend>,
        settings: PeerSettings,
    ) -> Result<Self> {
        settings.validate()?;
        if channel.is_empty() {
            return Err(config_error!("channel name must not be empty"));
        }

        let peer_id = PeerId::generate();
        let registry = PeerRegistry::new(backend, channel, &settings.key_prefix);
        let admission = Arc::new(AdmissionController::new(quota));
        let coordinator = Arc::new(Coordinator::new(
            peer_id,
            registry,
            settings,
            Arc::clone(&admission),
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let peer = Self {
            coordinator,
            admission,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        };

        if let Err(e) = peer.run_join(quota, shutdown_rx).await {
            warn!(
                "[{}] Failed to join channel '{}': {}",
                peer.peer_id(),
                channel,
                e
            );
            peer.coordinator.retire();
            // best effort; otherwise the entry ages out
            let _ = peer.coordinator.registry().unregister(peer.peer_id()).await;
            return Err(e);
        }
        Ok(peer)
    }

    async fn run_join(&self, quota: Quota, shutdown: watch::Receiver<bool>) -> Result<()> {
        let coordinator = &self.coordinator;
        let peer_id = coordinator.peer_id().clone();

        // subscribe first so our own join notification cannot slip past us
        let subscription = coordinator.registry().subscribe().await?;
        coordinator.refresh_heartbeat().await?;
        let intent = coordinator.announce(quota).await?;
        coordinator.rebalance().await?;

        let (ack_tx, ack_rx) = oneshot::channel();
        self.track(tokio::spawn(Arc::clone(coordinator).listen(
            subscription,
            shutdown.clone(),
            Some((intent.stamp, ack_tx)),
        )));

        coordinator
            .registry()
            .publish(&RebalanceMessage::Joined {
                peer_id: peer_id.clone(),
                stamp: intent.stamp,
            })
            .await?;
        ack_rx.await.map_err(|_| {
            coordination_error!(
                "notifications stopped before the join of {} was acknowledged",
                peer_id
            )
        })?;

        self.track(tokio::spawn(housekeeper::run_heartbeat(
            Arc::clone(coordinator),
            shutdown.clone(),
        )));
        self.track(tokio::spawn(housekeeper::run_sweep(
            Arc::clone(coordinator),
            shutdown,
        )));

        info!(
            "[{}] Joined channel '{}' with {} peer(s), share {}",
            peer_id,
            coordinator.registry().channel(),
            coordinator.peer_count(),
            self.admission.quota()
        );
        Ok(())
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    /// Try to begin one unit of work under this peer's current share.
    /// Always false once unregistered.
    pub fn start(&self) -> bool {
        if self.coordinator.is_retired() {
            return false;
        }
        self.admission.start()
    }

    /// Finish one unit of work begun with a successful [`QuotaPeer::start`]
    pub fn end(&self) {
        if self.coordinator.is_retired() {
            return;
        }
        self.admission.end();
    }

    /// Announce a new group-wide target. Every peer, this one included,
    /// re-divides it. Returns this peer's new share.
    pub async fn update(&self, quota: Quota) -> Result<Quota> {
        if self.coordinator.is_retired() {
            return Err(CoveyError::Retired(self.peer_id().to_string()));
        }
        let intent = self.coordinator.announce(quota).await?;
        let share = self.coordinator.rebalance().await?;
        self.coordinator
            .registry()
            .publish(&RebalanceMessage::Updated {
                peer_id: self.peer_id().clone(),
                stamp: intent.stamp,
            })
            .await?;
        Ok(share)
    }

    /// Leave the group: stop background work, remove our entry, and tell the
    /// others to rebalance. Fails if already unregistered.
    pub async fn unregister(&self) -> Result<()> {
        if self.coordinator.retire() {
            return Err(CoveyError::Retired(self.peer_id().to_string()));
        }
        let _ = self.shutdown.send(true);

        // no heartbeat may land after the entry is deleted
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                warn!("[{}] Background task ended abnormally: {}", self.peer_id(), e);
            }
        }
        self.coordinator.leave().await
    }

    /// This peer's current share
    pub fn quota(&self) -> Quota {
        self.admission.quota()
    }

    pub fn active_count(&self) -> u32 {
        self.admission.active_count()
    }

    /// Starts still counted against the rate in the trailing window
    pub fn window_usage(&self) -> usize {
        self.admission.window_usage()
    }

    pub fn peer_id(&self) -> &PeerId {
        self.coordinator.peer_id()
    }

    pub fn channel(&self) -> &str {
        self.coordinator.registry().channel()
    }

    /// Live peers counted at the last rebalance, this one included
    pub fn peer_count(&self) -> usize {
        self.coordinator.peer_count()
    }

    /// The group-wide target this peer last adopted
    pub fn group_intent(&self) -> Option<GroupIntent> {
        self.coordinator.group_intent()
    }

    pub fn is_retired(&self) -> bool {
        self.coordinator.is_retired()
    }
}

impl Drop for QuotaPeer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
