//! Multi-peer behavior over a shared in-memory backend. Every peer built on a
//! clone of the same `MemoryBackend` acts like a separate process.
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};

use covey::{Backend, CoveyError, MemoryBackend, PeerSettings, Quota, QuotaPeer, RebalanceMessage};

const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(5);

fn quota(rate: u32, interval: u64, concurrency: Option<u32>) -> Quota {
    Quota::new(rate, interval, concurrency).unwrap()
}

/// Short liveness timing so eviction tests finish quickly
fn fast_settings() -> PeerSettings {
    PeerSettings::with_ttl(Duration::from_millis(300))
}

async fn join(backend: &Arc<MemoryBackend>, channel: &str, q: Quota) -> QuotaPeer {
    QuotaPeer::join_with_settings(q, channel, backend.clone(), fast_settings())
        .await
        .unwrap()
}

/// Poll until every peer holds `expected`
async fn converge(peers: &[&QuotaPeer], expected: Quota) {
    let deadline = Instant::now() + CONVERGENCE_TIMEOUT;
    loop {
        if peers.iter().all(|peer| peer.quota() == expected) {
            return;
        }
        if Instant::now() > deadline {
            let shares: Vec<String> = peers.iter().map(|peer| peer.quota().to_string()).collect();
            panic!("peers did not converge to {}: {:?}", expected, shares);
        }
        sleep(Duration::from_millis(10)).await;
    }
}

async fn converge_count(peers: &[&QuotaPeer], expected: usize) {
    let deadline = Instant::now() + CONVERGENCE_TIMEOUT;
    while !peers.iter().all(|peer| peer.peer_count() == expected) {
        assert!(
            Instant::now() <= deadline,
            "peers did not converge to {} members",
            expected
        );
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_two_peers_split_quota() {
    let backend = Arc::new(MemoryBackend::new());
    let a = join(&backend, "jobs", quota(4, 500, Some(2))).await;
    let b = join(&backend, "jobs", quota(4, 500, Some(2))).await;

    converge(&[&a, &b], quota(2, 500, Some(1))).await;
    assert_eq!(a.peer_count(), 2);
    assert_eq!(b.peer_count(), 2);
}

#[tokio::test]
async fn test_later_joiner_announces_new_group_quota() {
    let backend = Arc::new(MemoryBackend::new());
    let a = join(&backend, "jobs", quota(4, 500, Some(2))).await;
    let b = join(&backend, "jobs", quota(4, 500, Some(2))).await;
    converge(&[&a, &b], quota(2, 500, Some(1))).await;

    let c = join(&backend, "jobs", quota(30, 1000, Some(6))).await;
    converge(&[&a, &b, &c], quota(10, 1000, Some(2))).await;

    // dropping the concurrency cap removes it from every share
    let d = join(&backend, "jobs", quota(77, 750, None)).await;
    converge(&[&a, &b, &c, &d], quota(19, 750, None)).await;
    assert_eq!(a.group_intent().unwrap().quota, quota(77, 750, None));
}

#[tokio::test]
async fn test_unregister_returns_share_to_the_rest() {
    let backend = Arc::new(MemoryBackend::new());
    let a = join(&backend, "jobs", quota(6, 50, Some(3))).await;
    let b = join(&backend, "jobs", quota(6, 50, Some(3))).await;
    let c = join(&backend, "jobs", quota(6, 50, Some(3))).await;
    converge(&[&a, &b, &c], quota(2, 50, Some(1))).await;

    c.unregister().await.unwrap();
    converge(&[&a, &b], quota(3, 50, Some(1))).await;
    converge_count(&[&a, &b], 2).await;
}

#[tokio::test]
async fn test_channels_are_independent() {
    let backend = Arc::new(MemoryBackend::new());
    let a = join(&backend, "red", quota(10, 1000, None)).await;
    let b = join(&backend, "red", quota(10, 1000, None)).await;
    let c = join(&backend, "blue", quota(9, 1000, Some(3))).await;

    converge(&[&a, &b], quota(5, 1000, None)).await;
    assert_eq!(c.quota(), quota(9, 1000, Some(3)));
    assert_eq!(c.peer_count(), 1);
}

#[tokio::test]
async fn test_concurrent_joins_converge() {
    let backend = Arc::new(MemoryBackend::new());
    let mut handles = Vec::new();
    for _ in 0..5 {
        let backend = backend.clone();
        handles.push(tokio::spawn(async move {
            QuotaPeer::join_with_settings(quota(50, 1000, Some(10)), "race", backend, fast_settings())
                .await
                .unwrap()
        }));
    }
    let mut peers = Vec::new();
    for handle in handles {
        peers.push(handle.await.unwrap());
    }

    let refs: Vec<&QuotaPeer> = peers.iter().collect();
    converge(&refs, quota(10, 1000, Some(2))).await;
    converge_count(&refs, 5).await;
}

#[tokio::test]
async fn test_dropped_peer_is_evicted() {
    let backend = Arc::new(MemoryBackend::new());
    let a = join(&backend, "jobs", quota(8, 1000, Some(4))).await;
    let b = join(&backend, "jobs", quota(8, 1000, Some(4))).await;
    let c = join(&backend, "jobs", quota(8, 1000, Some(4))).await;
    converge(&[&a, &b, &c], quota(2, 1000, Some(1))).await;

    // a crash: no unregister, heartbeats just stop
    let settings = fast_settings();
    let bound = settings.peer_ttl + settings.sweep_interval + Duration::from_millis(150);
    let crashed_at = Instant::now();
    drop(c);
    converge(&[&a, &b], quota(4, 1000, Some(2))).await;
    let elapsed = crashed_at.elapsed();
    assert!(
        elapsed <= bound,
        "eviction took {:?}, expected within {:?}",
        elapsed,
        bound
    );
    converge_count(&[&a, &b], 2).await;
}

#[tokio::test]
async fn test_repeated_notifications_change_nothing() {
    let backend = Arc::new(MemoryBackend::new());
    let a = join(&backend, "jobs", quota(9, 1000, Some(3))).await;
    let b = join(&backend, "jobs", quota(9, 1000, Some(3))).await;
    converge(&[&a, &b], quota(4, 1000, Some(1))).await;

    let replay = RebalanceMessage::Joined {
        peer_id: b.peer_id().clone(),
        stamp: b.group_intent().unwrap().stamp,
    };
    for _ in 0..3 {
        backend
            .publish("covey:jobs", replay.to_json().unwrap())
            .await
            .unwrap();
    }
    backend
        .publish("covey:jobs", "not a notification".to_string())
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(a.quota(), quota(4, 1000, Some(1)));
    assert_eq!(b.quota(), quota(4, 1000, Some(1)));
    assert_eq!(a.peer_count(), 2);
}

#[tokio::test]
async fn test_update_redivides_for_everyone() {
    let backend = Arc::new(MemoryBackend::new());
    let a = join(&backend, "jobs", quota(6, 1000, None)).await;
    let b = join(&backend, "jobs", quota(6, 1000, None)).await;
    let c = join(&backend, "jobs", quota(6, 1000, None)).await;
    converge(&[&a, &b, &c], quota(2, 1000, None)).await;

    let share = b.update(quota(9, 2000, Some(3))).await.unwrap();
    assert_eq!(share, quota(3, 2000, Some(1)));
    converge(&[&a, &b, &c], quota(3, 2000, Some(1))).await;
    assert_eq!(a.group_intent().unwrap().announced_by, *b.peer_id());
}

#[tokio::test]
async fn test_degenerate_share_rejects_all_starts() {
    let backend = Arc::new(MemoryBackend::new());
    let a = join(&backend, "tiny", quota(1, 1000, None)).await;
    let b = join(&backend, "tiny", quota(1, 1000, None)).await;

    let zero = Quota::new(1, 1000, None).unwrap().divide(2);
    converge(&[&a, &b], zero).await;
    assert!(!a.start());
    assert!(!b.start());

    b.unregister().await.unwrap();
    converge(&[&a], quota(1, 1000, None)).await;
    assert!(a.start());
}

#[tokio::test]
async fn test_double_unregister_is_an_error() {
    let backend = Arc::new(MemoryBackend::new());
    let a = join(&backend, "jobs", quota(4, 1000, Some(2))).await;
    let b = join(&backend, "jobs", quota(4, 1000, Some(2))).await;
    converge(&[&a, &b], quota(2, 1000, Some(1))).await;

    b.unregister().await.unwrap();
    converge(&[&a], quota(4, 1000, Some(2))).await;

    let second = b.unregister().await;
    assert!(matches!(second, Err(CoveyError::Retired(_))));
    assert!(matches!(
        b.update(quota(1, 1000, None)).await,
        Err(CoveyError::Retired(_))
    ));

    sleep(Duration::from_millis(50)).await;
    assert_eq!(a.quota(), quota(4, 1000, Some(2)));
    assert_eq!(a.peer_count(), 1);
}

#[tokio::test]
async fn test_join_fails_while_backend_unavailable() {
    let backend = Arc::new(MemoryBackend::new());
    backend.set_available(false);

    let result = QuotaPeer::join(quota(4, 1000, None), "jobs", backend.clone()).await;
    let err = result.unwrap_err();
    assert!(err.is_transient(), "unexpected error: {}", err);

    backend.set_available(true);
    assert!(QuotaPeer::join(quota(4, 1000, None), "jobs", backend).await.is_ok());
}

#[tokio::test]
async fn test_invalid_settings_fail_join() {
    let backend = Arc::new(MemoryBackend::new());
    let mut settings = fast_settings();
    settings.heartbeat_interval = settings.peer_ttl;
    let result =
        QuotaPeer::join_with_settings(quota(4, 1000, None), "jobs", backend.clone(), settings).await;
    assert!(matches!(result, Err(CoveyError::Config(_))));

    let result = QuotaPeer::join(quota(4, 1000, None), "", backend).await;
    assert!(matches!(result, Err(CoveyError::Config(_))));
}

#[tokio::test]
async fn test_short_outage_does_not_disturb_admission() {
    let backend = Arc::new(MemoryBackend::new());
    let settings = PeerSettings::with_ttl(Duration::from_millis(600));
    let a = QuotaPeer::join_with_settings(quota(20, 1000, Some(4)), "jobs", backend.clone(), settings.clone())
        .await
        .unwrap();
    let b = QuotaPeer::join_with_settings(quota(20, 1000, Some(4)), "jobs", backend.clone(), settings)
        .await
        .unwrap();
    converge(&[&a, &b], quota(10, 1000, Some(2))).await;

    backend.set_available(false);
    // a few failed heartbeats and sweeps, still well inside the ttl
    sleep(Duration::from_millis(120)).await;
    assert!(a.start());
    assert!(b.start());
    assert_eq!(a.quota(), quota(10, 1000, Some(2)));
    backend.set_available(true);

    sleep(Duration::from_millis(400)).await;
    assert_eq!(a.quota(), quota(10, 1000, Some(2)));
    assert_eq!(b.quota(), quota(10, 1000, Some(2)));
    converge_count(&[&a, &b], 2).await;
}

#[tokio::test]
async fn test_swept_live_peer_registers_again() {
    let backend = Arc::new(MemoryBackend::new());
    let a = join(&backend, "jobs", quota(6, 1000, None)).await;
    let b = join(&backend, "jobs", quota(6, 1000, None)).await;
    converge(&[&a, &b], quota(3, 1000, None)).await;

    // pretend a sweeper wrongly evicted b
    let key = format!("covey:jobs:peers:{}", b.peer_id());
    assert!(backend.delete(&key).await.unwrap());
    let evicted = RebalanceMessage::Evicted {
        peer_ids: vec![b.peer_id().clone()],
        swept_by: a.peer_id().clone(),
    };
    backend
        .publish("covey:jobs", evicted.to_json().unwrap())
        .await
        .unwrap();

    let deadline = Instant::now() + CONVERGENCE_TIMEOUT;
    while backend.get(&key).await.unwrap().is_none() {
        assert!(Instant::now() <= deadline, "b never re-registered");
        sleep(Duration::from_millis(10)).await;
    }
    converge(&[&a, &b], quota(3, 1000, None)).await;
    converge_count(&[&a, &b], 2).await;
}
