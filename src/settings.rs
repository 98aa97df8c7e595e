//! Covey settings: per-peer coordination timing and the sidecar process config
use std::time::Duration;

use crate::config_error;
use crate::error::Result;
use crate::quota::Quota;

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const STANDARD_PORT_HTTP: u16 = 8420;
pub const DEFAULT_PORT_HTTP: &str = "8420";

/// Liveness timeout when the caller does not pick one
pub const DEFAULT_PEER_TTL_MS: u64 = 30_000;
pub const DEFAULT_PEER_TTL: &str = "30000";
pub const DEFAULT_KEY_PREFIX: &str = "covey:";

/// Coordination timing for one peer.
///
/// `heartbeat_interval` must stay below `peer_ttl` so a healthy peer never
/// expires itself. A silent peer is evicted within `peer_ttl + sweep_interval`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerSettings {
    /// How long a peer entry stays live without a heartbeat
    pub peer_ttl: Duration,
    /// How often a peer rewrites its own entry (default: ttl / 3)
    pub heartbeat_interval: Duration,
    /// How often a peer sweeps the registry for stale entries (default: ttl / 2)
    pub sweep_interval: Duration,
    /// Namespace for every backend key and pubsub channel
    pub key_prefix: String,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self::with_ttl(Duration::from_millis(DEFAULT_PEER_TTL_MS))
    }
}

impl PeerSettings {
    /// Settings for `ttl` with heartbeat and sweep cadence derived from it
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            peer_ttl: ttl,
            heartbeat_interval: ttl / 3,
            sweep_interval: ttl / 2,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.peer_ttl.is_zero() {
            return Err(config_error!("peer ttl must be positive"));
        }
        if self.heartbeat_interval.is_zero() || self.sweep_interval.is_zero() {
            return Err(config_error!(
                "heartbeat and sweep intervals must be positive (ttl {:?} too small?)",
                self.peer_ttl
            ));
        }
        if self.heartbeat_interval >= self.peer_ttl {
            return Err(config_error!(
                "heartbeat interval {:?} must be shorter than peer ttl {:?}",
                self.heartbeat_interval,
                self.peer_ttl
            ));
        }
        Ok(())
    }
}

/// Configuration of the HTTP admission sidecar
#[derive(Clone, Debug)]
pub struct Settings {
    // Server listen address
    pub listen_address: String,

    // HTTP API listen port
    pub listen_port: u16,

    // Coordination backend
    pub redis_url: String,

    // Quota sharing group
    pub channel: String,

    // Desired group quota
    pub rate: u32,
    pub interval_ms: u64,
    pub concurrency: Option<u32>,

    // Peer liveness
    pub peer_ttl_ms: u64,
    pub join_timeout_secs: u64,

    // Log as JSON lines
    pub log_json: bool,
}

impl Settings {
    pub fn quota(&self) -> Result<Quota> {
        Quota::new(self.rate, self.interval_ms, self.concurrency)
    }

    pub fn peer_settings(&self) -> PeerSettings {
        PeerSettings::with_ttl(Duration::from_millis(self.peer_ttl_ms))
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cadence_derives_from_ttl() {
        let settings = PeerSettings::default();
        assert_eq!(settings.peer_ttl, Duration::from_secs(30));
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(settings.sweep_interval, Duration::from_secs(15));
        assert_eq!(settings.key_prefix, DEFAULT_KEY_PREFIX);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn short_ttl_still_valid() {
        let settings = PeerSettings::with_ttl(Duration::from_millis(100));
        assert_eq!(settings.heartbeat_interval, Duration::from_nanos(33_333_333));
        assert_eq!(settings.sweep_interval, Duration::from_millis(50));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn rejects_heartbeat_slower_than_ttl() {
        let mut settings = PeerSettings::with_ttl(Duration::from_secs(1));
        settings.heartbeat_interval = Duration::from_secs(2);
        assert!(settings.validate().is_err());

        assert!(PeerSettings::with_ttl(Duration::ZERO).validate().is_err());
    }
}
