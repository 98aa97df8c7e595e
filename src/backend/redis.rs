//! Redis coordination backend.
//!
//! Commands go through a shared `ConnectionManager` (reconnects on its own).
//! Redis requires a dedicated connection for receiving pub/sub traffic, so
//! every [`Backend::subscribe`] opens its own pub/sub connection and forwards
//! payloads into the returned [`Subscription`].
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Backend, Subscription, SUBSCRIPTION_BUFFER};
use crate::error::Result;

#[derive(Clone)]
pub struct RedisBackend {
    client: Client,
    connection: ConnectionManager,
}

impl fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBackend")
            .field("addr", &self.client.get_connection_info().addr)
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connect to Redis, e.g. `redis://127.0.0.1/`
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client.clone()).await?;
        info!("Connected to redis at {:?}", client.get_connection_info().addr);
        Ok(Self { client, connection })
    }
}

/// Quote glob metacharacters so a channel name only ever matches itself
fn escape_glob(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl Backend for RedisBackend {
    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection.clone();
        match ttl {
            Some(ttl) => {
                let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("PX")
                    .arg(millis)
                    .query_async::<_, ()>(&mut conn)
                    .await?;
            }
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.connection.clone();
        let mut keys = Vec::new();
        let mut iter: redis::AsyncIter<String> =
            conn.scan_match(format!("{}*", escape_glob(prefix))).await?;
        while let Some(key) = iter.next_item().await {
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    async fn publish(&self, channel: &str, message: String) -> Result<()> {
        let mut conn = self.connection.clone();
        let receivers: i64 = conn.publish(channel, message).await?;
        debug!("Published to '{}' ({} receivers)", channel, receivers);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            debug!("Subscriber for '{}' dropped, closing pubsub", channel);
                            break;
                        }
                    }
                    Err(e) => warn!("Unreadable payload on '{}': {}", channel, e),
                }
            }
            debug!("Pubsub stream for '{}' ended", channel);
        });

        Ok(rx)
    }
}
