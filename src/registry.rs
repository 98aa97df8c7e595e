//! Backend-resident view of a channel's group: one entry per live peer plus
//! the channel's single [`GroupIntent`] record.
//!
//! Key layout under the configured prefix:
//! - `<prefix><channel>`: pubsub channel for rebalance notifications
//! - `<prefix><channel>:intent`: the group intent
//! - `<prefix><channel>:peers:<peer_id>`: one [`PeerEntry`] per peer
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{Backend, Subscription};
use crate::coordinator::messages::RebalanceMessage;
use crate::error::Result;
use crate::peer_id::PeerId;
use crate::quota::{GroupIntent, Quota};

/// Liveness record proving a peer is still part of the group
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub peer_id: PeerId,
    /// Unix epoch milliseconds of the last heartbeat
    pub last_heartbeat: i64,
    pub ttl_ms: u64,
}

impl PeerEntry {
    pub fn new(peer_id: PeerId, ttl: Duration) -> Self {
        Self {
            peer_id,
            last_heartbeat: Utc::now().timestamp_millis(),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        let ttl = i64::try_from(self.ttl_ms).unwrap_or(i64::MAX);
        now_ms.saturating_sub(self.last_heartbeat) > ttl
    }
}

#[derive(Clone, Debug)]
pub struct PeerRegistry {
    backend: Arc<dyn Backend>,
    channel: String,
    key_prefix: String,
}

impl PeerRegistry {
    pub fn new(backend: Arc<dyn Backend>, channel: &str, key_prefix: &str) -> Self {
        Self {
            backend,
            channel: channel.to_string(),
            key_prefix: key_prefix.to_string(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Pubsub channel carrying rebalance notifications
    pub fn notification_channel(&self) -> String {
        format!("{}{}", self.key_prefix, self.channel)
    }

    pub fn intent_key(&self) -> String {
        format!("{}{}:intent", self.key_prefix, self.channel)
    }

    fn peers_prefix(&self) -> String {
        format!("{}{}:peers:", self.key_prefix, self.channel)
    }

    pub fn peer_key(&self, peer_id: &PeerId) -> String {
        format!("{}{}", self.peers_prefix(), peer_id)
    }

    /// Write (or refresh) a peer's entry. The backend key outlives the entry's
    /// own ttl so the sweep, not the backend, decides when a peer is gone;
    /// the key still vanishes eventually if every sweeper is gone too.
    pub async fn register(&self, entry: &PeerEntry) -> Result<()> {
        let payload = serde_json::to_string(entry)?;
        let key_ttl = Duration::from_millis(entry.ttl_ms.saturating_mul(2));
        self.backend
            .put(&self.peer_key(&entry.peer_id), payload, Some(key_ttl))
            .await
    }

    pub async fn unregister(&self, peer_id: &PeerId) -> Result<bool> {
        self.backend.delete(&self.peer_key(peer_id)).await
    }

    /// Every readable, unexpired entry. Entries deleted mid-scan or holding
    /// garbage are skipped.
    pub async fn live_peers(&self) -> Result<Vec<PeerEntry>> {
        let now_ms = Utc::now().timestamp_millis();
        Ok(self
            .read_entries()
            .await?
            .into_iter()
            .filter(|entry| !entry.is_expired(now_ms))
            .collect())
    }

    /// Delete every entry whose heartbeat is older than its ttl.
    /// Returns the peers this call actually removed.
    pub async fn sweep(&self) -> Result<Vec<PeerId>> {
        let now_ms = Utc::now().timestamp_millis();
        let mut evicted = Vec::new();
        for entry in self.read_entries().await? {
            if !entry.is_expired(now_ms) {
                continue;
            }
            // another sweeper may have beaten us to it
            if self.backend.delete(&self.peer_key(&entry.peer_id)).await? {
                debug!(
                    "[{}] Evicted peer {} (last heartbeat {}ms ago)",
                    self.channel,
                    entry.peer_id,
                    now_ms - entry.last_heartbeat
                );
                evicted.push(entry.peer_id);
            }
        }
        Ok(evicted)
    }

    async fn read_entries(&self) -> Result<Vec<PeerEntry>> {
        let keys = self.backend.scan_prefix(&self.peers_prefix()).await?;
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(payload) = self.backend.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<PeerEntry>(&payload) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("[{}] Skipping malformed peer entry {}: {}", self.channel, key, e),
            }
        }
        Ok(entries)
    }

    /// The channel's current intent, if anyone has announced one.
    /// A record that does not decode is an error, not an absent intent.
    pub async fn read_intent(&self) -> Result<Option<GroupIntent>> {
        match self.backend.get(&self.intent_key()).await? {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    /// Announce `quota` as the group's target, stamped after whatever
    /// intent is currently stored.
    pub async fn write_intent(&self, quota: Quota, announced_by: &PeerId) -> Result<GroupIntent> {
        let previous = match self.read_intent().await {
            Ok(previous) => previous,
            Err(e) => {
                warn!(
                    "[{}] Unreadable intent record, overwriting: {}",
                    self.channel, e
                );
                None
            }
        };
        let intent = GroupIntent::announce(quota, announced_by.clone(), previous.as_ref());
        let payload = serde_json::to_string(&intent)?;
        self.backend.put(&self.intent_key(), payload, None).await?;
        Ok(intent)
    }

    pub async fn publish(&self, message: &RebalanceMessage) -> Result<()> {
        let payload = message.to_json()?;
        self.backend
            .publish(&self.notification_channel(), payload)
            .await
    }

    pub async fn subscribe(&self) -> Result<Subscription> {
        self.backend.subscribe(&self.notification_channel()).await
    }
}
