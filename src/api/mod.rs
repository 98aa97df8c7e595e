//! HTTP admission sidecar: exposes one [`QuotaPeer`] to callers that cannot
//! link the library directly.
mod base;
mod quota;

use std::borrow::Cow;
use std::sync::Arc;

use axum::{
    error_handling::HandleErrorLayer, http::StatusCode, response::IntoResponse, routing, Router,
};
use tokio::time::Duration;
use tower::{BoxError, ServiceBuilder};
use tower_http::trace::TraceLayer;

pub mod paths;

pub use base::AboutResponse;
pub use quota::{AdmissionResponse, QuotaShare, QuotaStatus};

use crate::coordinator::QuotaPeer;

/// Build the sidecar API around a joined peer
pub fn api(peer: Arc<QuotaPeer>) -> Router {
    Router::new()
        .route(paths::base::ROOT, routing::get(base::root))
        .route(paths::base::HEALTH, routing::get(base::health))
        .route(paths::base::ABOUT, routing::get(base::about))
        // Group quota
        .route(
            paths::QUOTA,
            routing::get(quota::quota_status).put(quota::update_quota),
        )
        // Admission
        .route(paths::admission::START, routing::post(quota::start))
        .route(paths::admission::END, routing::post(quota::end))
        .layer(
            ServiceBuilder::new()
                // Handle errors from middleware
                .layer(HandleErrorLayer::new(handle_error))
                .load_shed()
                .timeout(Duration::from_secs(10)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(peer)
}

async fn handle_error(error: BoxError) -> impl IntoResponse {
    if error.is::<tower::timeout::error::Elapsed>() {
        return (StatusCode::REQUEST_TIMEOUT, Cow::from("request timed out"));
    }

    if error.is::<tower::load_shed::error::Overloaded>() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Cow::from("service is overloaded, try again later"),
        );
    }

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Cow::from(format!("Unhandled internal error: {}", error)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::quota::Quota;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    async fn sidecar(quota: Quota) -> (Arc<QuotaPeer>, Router) {
        let backend = Arc::new(MemoryBackend::new());
        let peer = Arc::new(QuotaPeer::join(quota, "api-test", backend).await.unwrap());
        (peer.clone(), api(peer))
    }

    fn post(uri: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_and_about() {
        let (peer, app) = sidecar(Quota::new(5, 1000, None).unwrap()).await;

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("'api-test'"));

        let response = app
            .oneshot(Request::builder().uri("/about").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let about: AboutResponse = body_json(response).await;
        assert_eq!(about.name, "covey");
        assert_eq!(about.channel, "api-test");
        assert_eq!(about.peer_id, peer.peer_id().to_string());
        assert!(!about.retired);
    }

    #[tokio::test]
    async fn start_maps_to_ok_then_too_many_requests() {
        let (peer, app) = sidecar(Quota::new(10, 60_000, Some(1)).unwrap()).await;

        let response = app.clone().oneshot(post("/start")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let admitted: AdmissionResponse = body_json(response).await;
        assert!(admitted.admitted);
        assert_eq!(admitted.active_count, 1);

        let response = app.clone().oneshot(post("/start")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let response = app.clone().oneshot(post("/end")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(peer.active_count(), 0);

        let response = app.oneshot(post("/start")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn put_quota_reannounces_intent() {
        let (peer, app) = sidecar(Quota::new(5, 1000, None).unwrap()).await;

        let request = Request::builder()
            .method(Method::PUT)
            .uri("/quota")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"rate":20,"interval":2000,"concurrency":3}"#))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let status: QuotaStatus = body_json(response).await;
        assert_eq!(status.share, Quota::new(20, 2000, Some(3)).unwrap().into());
        assert_eq!(status.peer_count, 1);
        assert_eq!(QuotaShare::from(peer.quota()), status.share);

        let response = app
            .oneshot(Request::builder().uri("/quota").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status: QuotaStatus = body_json(response).await;
        assert_eq!(status.group, Some(Quota::new(20, 2000, Some(3)).unwrap()));
    }

    #[tokio::test]
    async fn zero_share_status_parses_back() {
        let backend = Arc::new(MemoryBackend::new());
        let quota = Quota::new(1, 1000, Some(1)).unwrap();
        let peer = Arc::new(QuotaPeer::join(quota, "api-zero", backend.clone()).await.unwrap());
        let _other = QuotaPeer::join(quota, "api-zero", backend).await.unwrap();
        let app = api(peer.clone());

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while !peer.quota().is_degenerate() {
            assert!(tokio::time::Instant::now() <= deadline, "share never split");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let response = app
            .oneshot(Request::builder().uri("/quota").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let status: QuotaStatus = body_json(response).await;
        assert_eq!(
            status.share,
            QuotaShare {
                rate: 0,
                interval: 1000,
                concurrency: Some(0)
            }
        );
        assert_eq!(status.peer_count, 2);
    }

    #[tokio::test]
    async fn invalid_quota_is_rejected() {
        let (peer, app) = sidecar(Quota::new(5, 1000, None).unwrap()).await;

        let request = Request::builder()
            .method(Method::PUT)
            .uri("/quota")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"rate":0,"interval":1000}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert!(response.status().is_client_error());
        assert_eq!(peer.quota(), Quota::new(5, 1000, None).unwrap());
    }

    #[tokio::test]
    async fn retired_peer_answers_gone_on_update() {
        let (peer, app) = sidecar(Quota::new(5, 1000, None).unwrap()).await;
        peer.unregister().await.unwrap();

        let request = Request::builder()
            .method(Method::PUT)
            .uri("/quota")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"rate":8,"interval":1000}"#))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::GONE);

        let response = app.clone().oneshot(post("/start")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let response = app
            .oneshot(Request::builder().uri("/about").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let about: AboutResponse = body_json(response).await;
        assert!(about.retired);
    }
}
