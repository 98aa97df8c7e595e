//! Quota coordination for one peer.
//!
//! The [`Coordinator`] owns everything a peer shares with its group: its
//! registry entry, the announced intent, and the rebalance step that turns
//! (intent, live peer count) into this peer's share. It runs three kinds of
//! background work, all stopped by the same shutdown signal:
//! - the notification listener (this module)
//! - heartbeat refresh and expiry sweep ([`housekeeper`])
//!
//! [`QuotaPeer`] is the public handle wrapping it.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{oneshot, watch, Mutex};
use tokio::time;
use tracing::{debug, info, warn};

pub mod housekeeper;
pub mod messages;
pub mod peer;

pub use messages::RebalanceMessage;
pub use peer::QuotaPeer;

use crate::admission::AdmissionController;
use crate::backend::Subscription;
use crate::coordination_error;
use crate::error::Result;
use crate::peer_id::PeerId;
use crate::quota::{GroupIntent, Quota};
use crate::registry::{PeerEntry, PeerRegistry};
use crate::settings::PeerSettings;

/// Pending join acknowledgment: the stamp of our own `joined` notification
type JoinAck = Option<(u64, oneshot::Sender<()>)>;

pub(crate) struct Coordinator {
    peer_id: PeerId,
    registry: PeerRegistry,
    settings: PeerSettings,
    admission: Arc<AdmissionController>,
    /// Last intent read from (or written to) the backend
    intent: RwLock<Option<GroupIntent>>,
    peer_count: AtomicUsize,
    retired: AtomicBool,
    /// Serializes rebalances so an older snapshot never lands last
    rebalance_lock: Mutex<()>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("peer_id", &self.peer_id)
            .field("channel", &self.registry.channel())
            .field("peer_count", &self.peer_count())
            .field("retired", &self.is_retired())
            .finish()
    }
}

impl Coordinator {
    pub(crate) fn new(
        peer_id: PeerId,
        registry: PeerRegistry,
        settings: PeerSettings,
        admission: Arc<AdmissionController>,
    ) -> Self {
        Self {
            peer_id,
            registry,
            settings,
            admission,
            intent: RwLock::new(None),
            peer_count: AtomicUsize::new(1),
            retired: AtomicBool::new(false),
            rebalance_lock: Mutex::new(()),
        }
    }

    pub(crate) fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub(crate) fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub(crate) fn settings(&self) -> &PeerSettings {
        &self.settings
    }

    pub(crate) fn peer_count(&self) -> usize {
        self.peer_count.load(Ordering::SeqCst)
    }

    pub(crate) fn group_intent(&self) -> Option<GroupIntent> {
        self.intent
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Mark retired. Returns true if it already was.
    pub(crate) fn retire(&self) -> bool {
        self.retired.swap(true, Ordering::SeqCst)
    }

    fn store_intent(&self, intent: GroupIntent) {
        let mut current = self.intent.write().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().map_or(true, |known| intent.supersedes(known)) {
            debug!(
                "[{}] Adopted intent {} (stamp {}, announced by {})",
                self.peer_id, intent.quota, intent.stamp, intent.announced_by
            );
        }
        *current = Some(intent);
    }

    pub(crate) async fn refresh_heartbeat(&self) -> Result<()> {
        let entry = PeerEntry::new(self.peer_id.clone(), self.settings.peer_ttl);
        self.registry.register(&entry).await
    }

    /// Publish `quota` as the group's new target
    pub(crate) async fn announce(&self, quota: Quota) -> Result<GroupIntent> {
        let intent = self.registry.write_intent(quota, &self.peer_id).await?;
        info!(
            "[{}] Announced intent {} on channel '{}' (stamp {})",
            self.peer_id,
            quota,
            self.registry.channel(),
            intent.stamp
        );
        self.store_intent(intent.clone());
        Ok(intent)
    }

    /// Recompute this peer's share from the registry and swap it in.
    ///
    /// On any read failure the current share is left untouched and the
    /// error returned; a missing intent record falls back to the last
    /// intent this peer saw.
    pub(crate) async fn rebalance(&self) -> Result<Quota> {
        let _guard = self.rebalance_lock.lock().await;
        if self.is_retired() {
            return Ok(self.admission.quota());
        }

        let intent = match self.registry.read_intent().await? {
            Some(intent) => intent,
            None => self.group_intent().ok_or_else(|| {
                coordination_error!(
                    "no intent announced on channel '{}'",
                    self.registry.channel()
                )
            })?,
        };
        let others = self
            .registry
            .live_peers()
            .await?
            .iter()
            .filter(|entry| entry.peer_id != self.peer_id)
            .count();
        let count = others + 1;

        let share = intent.share(count);
        self.peer_count.store(count, Ordering::SeqCst);
        self.store_intent(intent);
        let previous = self.admission.set_quota(share);
        if previous != share {
            info!(
                "[{}] Rebalanced channel '{}': {} peers, share {} (was {})",
                self.peer_id,
                self.registry.channel(),
                count,
                share,
                previous
            );
            if share.is_degenerate() {
                warn!(
                    "[{}] Share {} admits nothing: group quota too small for {} peers",
                    self.peer_id, share, count
                );
            }
        }
        Ok(share)
    }

    /// Evict stale peers, tell the group, then rebalance locally. The local
    /// rebalance also repairs missed notifications.
    pub(crate) async fn sweep_expired(&self) -> Result<Vec<PeerId>> {
        let evicted = self.registry.sweep().await?;
        if !evicted.is_empty() {
            info!(
                "[{}] Swept {} expired peer(s) from channel '{}': {:?}",
                self.peer_id,
                evicted.len(),
                self.registry.channel(),
                evicted
            );
            self.registry
                .publish(&RebalanceMessage::Evicted {
                    peer_ids: evicted.clone(),
                    swept_by: self.peer_id.clone(),
                })
                .await?;
        }
        self.rebalance().await?;
        Ok(evicted)
    }

    /// Remove our entry and tell the group. Intent stays as it is.
    pub(crate) async fn leave(&self) -> Result<()> {
        self.registry.unregister(&self.peer_id).await?;
        self.registry
            .publish(&RebalanceMessage::Left {
                peer_id: self.peer_id.clone(),
            })
            .await?;
        info!(
            "[{}] Left channel '{}'",
            self.peer_id,
            self.registry.channel()
        );
        Ok(())
    }

    /// Someone swept us while we are still alive: put the entry back
    async fn rejoin(&self) -> Result<()> {
        self.refresh_heartbeat().await?;
        let stamp = self.group_intent().map(|i| i.stamp).unwrap_or_default();
        self.registry
            .publish(&RebalanceMessage::Joined {
                peer_id: self.peer_id.clone(),
                stamp,
            })
            .await
    }

    pub(crate) async fn handle_message(&self, message: &RebalanceMessage) {
        if self.is_retired() {
            return;
        }
        debug!(
            "[{}] Received '{}' notification from {}",
            self.peer_id,
            message.kind(),
            message.sender()
        );
        if message.evicts(&self.peer_id) {
            warn!(
                "[{}] Evicted from channel '{}' while still running, re-registering",
                self.peer_id,
                self.registry.channel()
            );
            if let Err(e) = self.rejoin().await {
                warn!("[{}] Re-registration failed: {}", self.peer_id, e);
            }
        }
        if let Err(e) = self.rebalance().await {
            warn!(
                "[{}] Rebalance after '{}' failed, keeping share {}: {}",
                self.peer_id,
                message.kind(),
                self.admission.quota(),
                e
            );
        }
    }

    /// Apply notifications one at a time until shutdown. Resolves `join_ack`
    /// once our own `joined` notification has been applied.
    pub(crate) async fn listen(
        self: Arc<Self>,
        mut subscription: Subscription,
        mut shutdown: watch::Receiver<bool>,
        mut join_ack: JoinAck,
    ) {
        debug!(
            "[{}] Listening on '{}'",
            self.peer_id,
            self.registry.notification_channel()
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                maybe_payload = subscription.recv() => {
                    let Some(payload) = maybe_payload else {
                        warn!(
                            "[{}] Notification stream for channel '{}' closed",
                            self.peer_id,
                            self.registry.channel()
                        );
                        // a join still waiting on its acknowledgment fails now
                        join_ack.take();
                        match self.resubscribe(&mut shutdown).await {
                            Some(renewed) => {
                                subscription = renewed;
                                continue;
                            }
                            None => break,
                        }
                    };
                    match RebalanceMessage::from_json(&payload) {
                        Ok(message) => {
                            self.handle_message(&message).await;
                            let acknowledged = matches!(
                                &join_ack,
                                Some((stamp, _)) if message.acknowledges_join(&self.peer_id, *stamp)
                            );
                            if acknowledged {
                                if let Some((_, ack)) = join_ack.take() {
                                    let _ = ack.send(());
                                }
                            }
                        }
                        Err(e) => warn!("[{}] Ignoring malformed notification: {}", self.peer_id, e),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("[{}] Listener stopped", self.peer_id);
    }

    /// Retry subscribing every sweep interval. `None` once shut down.
    async fn resubscribe(&self, shutdown: &mut watch::Receiver<bool>) -> Option<Subscription> {
        let backoff: Duration = self.settings.sweep_interval;
        loop {
            tokio::select! {
                _ = time::sleep(backoff) => {}
                _ = shutdown.changed() => return None,
            }
            if *shutdown.borrow() {
                return None;
            }
            match self.registry.subscribe().await {
                Ok(subscription) => {
                    info!(
                        "[{}] Resubscribed to channel '{}'",
                        self.peer_id,
                        self.registry.channel()
                    );
                    // anything published while we were deaf is picked up here
                    if let Err(e) = self.rebalance().await {
                        warn!("[{}] Rebalance after resubscribe failed: {}", self.peer_id, e);
                    }
                    return Some(subscription);
                }
                Err(e) => warn!(
                    "[{}] Resubscribe failed, retrying in {:?}: {}",
                    self.peer_id, backoff, e
                ),
            }
        }
    }
}
