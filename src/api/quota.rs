use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use tracing::{event, instrument, Level};

use crate::coordinator::QuotaPeer;
use crate::error::Result;
use crate::quota::Quota;

pub type SharedPeer = Arc<QuotaPeer>;

/// A divided share on the wire. Unlike [`Quota`] it may hold zeros, so a
/// degenerate share still parses back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaShare {
    pub rate: u32,
    pub interval: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
}

impl From<Quota> for QuotaShare {
    fn from(quota: Quota) -> Self {
        Self {
            rate: quota.rate(),
            interval: quota.interval(),
            concurrency: quota.concurrency(),
        }
    }
}

/// Snapshot of this peer's place in its group
#[derive(Debug, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub peer_id: String,
    pub channel: String,
    pub peer_count: usize,
    /// This peer's share
    pub share: QuotaShare,
    /// The group-wide target being divided
    pub group: Option<Quota>,
    pub stamp: Option<u64>,
    pub active_count: u32,
    pub window_usage: usize,
}

impl QuotaStatus {
    fn of(peer: &QuotaPeer) -> Self {
        let intent = peer.group_intent();
        Self {
            peer_id: peer.peer_id().to_string(),
            channel: peer.channel().to_string(),
            peer_count: peer.peer_count(),
            share: peer.quota().into(),
            group: intent.as_ref().map(|i| i.quota),
            stamp: intent.map(|i| i.stamp),
            active_count: peer.active_count(),
            window_usage: peer.window_usage(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AdmissionResponse {
    pub admitted: bool,
    pub active_count: u32,
}

#[instrument(skip(peer), level = "debug")]
pub async fn quota_status(State(peer): State<SharedPeer>) -> Json<QuotaStatus> {
    Json(QuotaStatus::of(&peer))
}

#[instrument(skip(peer), level = "debug")]
pub async fn update_quota(
    State(peer): State<SharedPeer>,
    Json(quota): Json<Quota>,
) -> Result<Json<QuotaStatus>> {
    peer.update(quota).await.map_err(|err| {
        event!(
            Level::ERROR,
            message = "Failed announcing group quota",
            err = format!("{:?}", err)
        );
        err
    })?;
    Ok(Json(QuotaStatus::of(&peer)))
}

#[instrument(skip(peer), level = "debug")]
pub async fn start(State(peer): State<SharedPeer>) -> (StatusCode, Json<AdmissionResponse>) {
    let admitted = peer.start();
    let status = if admitted {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };
    (
        status,
        Json(AdmissionResponse {
            admitted,
            active_count: peer.active_count(),
        }),
    )
}

#[instrument(skip(peer), level = "debug")]
pub async fn end(State(peer): State<SharedPeer>) -> Json<AdmissionResponse> {
    peer.end();
    Json(AdmissionResponse {
        admitted: false,
        active_count: peer.active_count(),
    })
}
