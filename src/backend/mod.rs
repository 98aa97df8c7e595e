//! Coordination backend: keys with expiry plus publish/subscribe.
//!
//! Peers never talk to each other directly. Everything they share goes
//! through an implementation of [`Backend`]:
//! - [`MemoryBackend`]: in-process, for tests and single-process embedding
//! - `RedisBackend`: behind the `redis-backend` feature
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis;

pub use memory::MemoryBackend;
#[cfg(feature = "redis-backend")]
pub use self::redis::RedisBackend;

/// Messages arriving on a subscribed channel, in publish order.
/// Closed when the backend drops the subscription.
pub type Subscription = mpsc::Receiver<String>;

/// Buffered messages per subscription before a slow listener backs up
pub const SUBSCRIPTION_BUFFER: usize = 1000;

#[async_trait]
pub trait Backend: Send + Sync + std::fmt::Debug {
    /// Store `value` under `key`, replacing any previous value.
    /// With a `ttl` the key disappears on its own once it elapses.
    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Returns whether the key existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Every live key starting with `prefix`
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    async fn publish(&self, channel: &str, message: String) -> Result<()>;

    /// Messages published to `channel` after this call returns
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}
