//! Rebalance notifications broadcast on a channel's pubsub topic.
//!
//! Every variant means the same thing to a receiver: re-read the registry
//! and recompute. The payload only says who changed what, for logging and
//! for the join acknowledgment.
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::peer_id::PeerId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RebalanceMessage {
    /// A peer joined and announced the intent stamped `stamp`
    Joined { peer_id: PeerId, stamp: u64 },
    /// An existing peer announced a new intent
    Updated { peer_id: PeerId, stamp: u64 },
    /// A peer unregistered
    Left { peer_id: PeerId },
    /// `swept_by` removed peers whose heartbeats stopped
    Evicted {
        peer_ids: Vec<PeerId>,
        swept_by: PeerId,
    },
}

impl RebalanceMessage {
    /// The peer that published this notification
    pub fn sender(&self) -> &PeerId {
        match self {
            RebalanceMessage::Joined { peer_id, .. } => peer_id,
            RebalanceMessage::Updated { peer_id, .. } => peer_id,
            RebalanceMessage::Left { peer_id } => peer_id,
            RebalanceMessage::Evicted { swept_by, .. } => swept_by,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RebalanceMessage::Joined { .. } => "joined",
            RebalanceMessage::Updated { .. } => "updated",
            RebalanceMessage::Left { .. } => "left",
            RebalanceMessage::Evicted { .. } => "evicted",
        }
    }

    /// Is this the acknowledgment of `peer_id`'s own join stamped `stamp`?
    pub fn acknowledges_join(&self, peer_id: &PeerId, stamp: u64) -> bool {
        matches!(self, RebalanceMessage::Joined { peer_id: p, stamp: s } if p == peer_id && *s == stamp)
    }

    pub fn evicts(&self, peer_id: &PeerId) -> bool {
        matches!(self, RebalanceMessage::Evicted { peer_ids, .. } if peer_ids.contains(peer_id))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}
