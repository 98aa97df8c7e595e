//! Quota values and the fair-share division rule
//!
//! A [`Quota`] is what a caller asks for and what a peer ends up holding.
//! The group's undivided target lives in a single [`GroupIntent`] record;
//! every peer derives its own share from it with [`Quota::divide`].
use std::fmt;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config_error;
use crate::error::{CoveyError, Result};
use crate::peer_id::PeerId;

/// Rate (operations per interval), interval length in milliseconds and an
/// optional cap on concurrently running operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "QuotaFields")]
pub struct Quota {
    rate: u32,
    interval: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    concurrency: Option<u32>,
}

/// Wire shape of a quota before validation
#[derive(Deserialize)]
struct QuotaFields {
    rate: u32,
    interval: u64,
    #[serde(default)]
    concurrency: Option<u32>,
}

impl TryFrom<QuotaFields> for Quota {
    type Error = CoveyError;

    fn try_from(fields: QuotaFields) -> Result<Self> {
        Quota::new(fields.rate, fields.interval, fields.concurrency)
    }
}

impl Quota {
    /// Build a quota; every present field must be positive
    pub fn new(rate: u32, interval: u64, concurrency: Option<u32>) -> Result<Self> {
        if rate == 0 {
            return Err(config_error!("quota rate must be positive"));
        }
        if interval == 0 {
            return Err(config_error!("quota interval must be positive"));
        }
        if concurrency == Some(0) {
            return Err(config_error!(
                "quota concurrency must be positive (omit it for unlimited)"
            ));
        }
        Ok(Self {
            rate,
            interval,
            concurrency,
        })
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Window length in milliseconds
    pub fn interval(&self) -> u64 {
        self.interval
    }

    pub fn interval_duration(&self) -> Duration {
        Duration::from_millis(self.interval)
    }

    pub fn concurrency(&self) -> Option<u32> {
        self.concurrency
    }

    /// This peer's share when `peer_count` peers split the quota.
    /// Floor division per field; a zero share is kept as-is.
    pub fn divide(&self, peer_count: usize) -> Quota {
        let n = u32::try_from(peer_count.max(1)).unwrap_or(u32::MAX);
        Quota {
            rate: self.rate / n,
            interval: self.interval,
            concurrency: self.concurrency.map(|c| c / n),
        }
    }

    /// A share that can never admit anything
    pub fn is_degenerate(&self) -> bool {
        self.rate == 0 || self.concurrency == Some(0)
    }
}

impl fmt::Display for Quota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.concurrency {
            Some(c) => write!(
                f,
                "{} per {}ms (concurrency {})",
                self.rate, self.interval, c
            ),
            None => write!(f, "{} per {}ms (concurrency unlimited)", self.rate, self.interval),
        }
    }
}

/// The group's agreed, undivided quota. Last writer wins, ordered by `stamp`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupIntent {
    pub quota: Quota,
    pub stamp: u64,
    pub announced_by: PeerId,
}

impl GroupIntent {
    /// New intent stamped after `previous`: wall-clock millis, bumped past
    /// the previous stamp if clocks disagree.
    pub fn announce(quota: Quota, announced_by: PeerId, previous: Option<&GroupIntent>) -> Self {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        let stamp = match previous {
            Some(prev) => now.max(prev.stamp.saturating_add(1)),
            None => now,
        };
        Self {
            quota,
            stamp,
            announced_by,
        }
    }

    pub fn supersedes(&self, other: &GroupIntent) -> bool {
        (self.stamp, &self.announced_by) > (other.stamp, &other.announced_by)
    }

    /// The share one of `peer_count` peers holds under this intent
    pub fn share(&self, peer_count: usize) -> Quota {
        self.quota.divide(peer_count)
    }
}
