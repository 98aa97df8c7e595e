use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::quota::SharedPeer;
use crate::settings::{APP_NAME, APP_VERSION};

pub async fn root(State(peer): State<SharedPeer>) -> String {
    format!("covey sidecar for channel '{}'", peer.channel())
}

/// Liveness for orchestrators. A retired peer still answers: it is shutting down.
pub async fn health() -> &'static str {
    "OK"
}

/// Which build is serving, and which peer it fronts
#[derive(Debug, Serialize, Deserialize)]
pub struct AboutResponse {
    pub name: String,
    pub version: String,
    pub channel: String,
    pub peer_id: String,
    pub retired: bool,
}

#[instrument(skip(peer), level = "debug")]
pub async fn about(State(peer): State<SharedPeer>) -> Json<AboutResponse> {
    Json(AboutResponse {
        name: APP_NAME.to_string(),
        version: APP_VERSION.to_string(),
        channel: peer.channel().to_string(),
        peer_id: peer.peer_id().to_string(),
        retired: peer.is_retired(),
    })
}
