//! In-process coordination backend.
//!
//! Peers built on clones of one `MemoryBackend` behave like separate
//! processes sharing one store: keys expire on read, and each channel is a
//! `broadcast` fan-out forwarded into per-subscriber queues.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::{Backend, Subscription, SUBSCRIPTION_BUFFER};
use crate::backend_error;
use crate::error::Result;

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

#[derive(Debug)]
struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    channels: DashMap<String, broadcast::Sender<String>>,
    available: AtomicBool,
}

/// Shared in-memory store. Clone it to hand the same store to several peers.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    store: Arc<MemoryStore>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore {
                entries: DashMap::new(),
                channels: DashMap::new(),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Simulate an outage: while unavailable every operation fails and
    /// published messages are lost. Existing subscriptions stay open.
    pub fn set_available(&self, available: bool) {
        self.store.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.store.available.load(Ordering::SeqCst)
    }

    /// Number of live keys, for tests and diagnostics
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.store
            .entries
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(backend_error!("memory backend unavailable"))
        }
    }

    /// Number of open pubsub channels
    pub fn channel_count(&self) -> usize {
        self.store.channels.len()
    }
}

impl MemoryStore {
    /// Drop a channel nobody listens on. Subscribing happens under the same
    /// shard lock, so a receiver added concurrently keeps the channel.
    fn release_channel(&self, channel: &str) {
        if self
            .channels
            .remove_if(channel, |_, sender| sender.receiver_count() == 0)
            .is_some()
        {
            debug!("Released idle channel '{}'", channel);
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        self.ensure_available()?;
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.store
            .entries
            .insert(key.to_string(), StoredValue { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.ensure_available()?;
        let now = Instant::now();
        // clone out before any removal so no shard guard is held
        let stored = self.store.entries.get(key).map(|entry| entry.value().clone());
        match stored {
            Some(stored) if stored.is_expired(now) => {
                self.store
                    .entries
                    .remove_if(key, |_, value| value.is_expired(now));
                Ok(None)
            }
            Some(stored) => Ok(Some(stored.value)),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.ensure_available()?;
        let now = Instant::now();
        Ok(self
            .store
            .entries
            .remove(key)
            .map(|(_, stored)| !stored.is_expired(now))
            .unwrap_or(false))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.ensure_available()?;
        let now = Instant::now();
        self.store.entries.retain(|_, stored| !stored.is_expired(now));
        Ok(self
            .store
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn publish(&self, channel: &str, message: String) -> Result<()> {
        self.ensure_available()?;
        let sender = self.store.channels.get(channel).map(|s| s.value().clone());
        if let Some(sender) = sender {
            // no receivers is not an error: nobody is listening yet
            if sender.send(message).is_err() {
                debug!("Published to channel '{}' with no subscribers", channel);
                self.store.release_channel(channel);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        self.ensure_available()?;
        let mut broadcast_rx = self
            .store
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIPTION_BUFFER).0)
            .subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let channel = channel.to_string();
        let store = self.store.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        debug!("Subscriber for '{}' dropped, closing forwarder", channel);
                        break;
                    }
                    received = broadcast_rx.recv() => match received {
                        Ok(message) => {
                            if tx.send(message).await.is_err() {
                                debug!("Subscriber for '{}' dropped, closing forwarder", channel);
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(
                                "Subscriber for '{}' lagged, {} messages skipped",
                                channel, skipped
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            drop(broadcast_rx);
            store.release_channel(&channel);
        });

        Ok(rx)
    }
}
