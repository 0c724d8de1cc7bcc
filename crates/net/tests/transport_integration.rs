//! End-to-end transport integration tests.
//!
//! Each test starts real endpoints on loopback, exchanges traffic through
//! the full stack (acceptor, handshake, worker pool, dispatcher), and
//! asserts on the terminal attempt outcomes and delivered payloads.

mod common;

use common::*;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use veil_net::{AuthStrategy, DeliveryOutcome, IdentityKey, NetError, PeerAddress, PeerDirectory};

#[tokio::test]
async fn test_ping_acknowledged_over_proof_handshake() {
    let directory = Arc::new(PeerDirectory::new());
    let mut a = start_peer(AuthStrategy::Proof, directory.clone()).await;
    let mut b = start_peer(AuthStrategy::Proof, directory.clone()).await;

    let attempt = a
        .endpoint
        .send_with_timeout(b.id, b"ping".to_vec(), Duration::from_millis(2_000))
        .await
        .unwrap();

    let (resolved, outcome) = wait_outcome(&mut a.outcomes, Duration::from_secs(2)).await;
    assert_eq!(resolved, attempt);
    assert_eq!(outcome, DeliveryOutcome::Acknowledged);

    let (from, payload) = timeout(Duration::from_secs(2), b.received.recv())
        .await
        .expect("delivery")
        .unwrap();
    assert_eq!(from, a.id);
    assert_eq!(payload, b"ping");

    // Exactly one delivery for one attempt.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(b.received.try_recv().is_err());

    a.endpoint.shutdown().await;
    b.endpoint.shutdown().await;
}

#[tokio::test]
async fn test_ping_acknowledged_over_dummy_handshake() {
    let directory = Arc::new(PeerDirectory::new());
    let mut a = start_peer(AuthStrategy::Dummy, directory.clone()).await;
    let mut b = start_peer(AuthStrategy::Dummy, directory.clone()).await;

    let attempt = a.endpoint.send(b.id, b"hello".to_vec()).await.unwrap();
    let outcome = wait_outcome_for(&mut a.outcomes, attempt, Duration::from_secs(2)).await;
    assert_eq!(outcome, DeliveryOutcome::Acknowledged);

    let (from, payload) = timeout(Duration::from_secs(2), b.received.recv())
        .await
        .expect("delivery")
        .unwrap();
    assert_eq!(from, a.id);
    assert_eq!(payload, b"hello");

    a.endpoint.shutdown().await;
    b.endpoint.shutdown().await;
}

#[tokio::test]
async fn test_unacknowledged_attempt_times_out() {
    let directory = Arc::new(PeerDirectory::new());
    let mut a = start_peer(AuthStrategy::Dummy, directory.clone()).await;
    let b = start_deaf_peer(AuthStrategy::Dummy, directory.clone()).await;

    let started = Instant::now();
    let attempt = a
        .endpoint
        .send_with_timeout(b.id, b"anyone there".to_vec(), Duration::from_millis(300))
        .await
        .unwrap();

    let outcome = wait_outcome_for(&mut a.outcomes, attempt, Duration::from_secs(3)).await;
    assert_eq!(outcome, DeliveryOutcome::TimedOut);

    // Cooperative detection: at or after the deadline, not wildly beyond.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(300), "resolved early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1_500), "resolved late: {elapsed:?}");
    assert_eq!(a.endpoint.pending_attempts(), 0);

    a.endpoint.shutdown().await;
    b.endpoint.shutdown().await;
}

#[tokio::test]
async fn test_unknown_destination_fails_without_timeout() {
    let directory = Arc::new(PeerDirectory::new());
    let mut a = start_peer(AuthStrategy::Dummy, directory.clone()).await;
    let nobody = IdentityKey::generate().identifier();

    let started = Instant::now();
    let attempt = a
        .endpoint
        .send_with_timeout(nobody, b"void".to_vec(), Duration::from_millis(400))
        .await
        .unwrap();

    let outcome = wait_outcome_for(&mut a.outcomes, attempt, Duration::from_secs(2)).await;
    assert!(matches!(outcome, DeliveryOutcome::Failed(_)));
    assert!(started.elapsed() < Duration::from_millis(400));

    // Failure resolved the attempt on the spot; no timer fires later.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(a.outcomes.try_recv().is_err());
    assert_eq!(a.endpoint.pending_attempts(), 0);

    a.endpoint.shutdown().await;
}

#[tokio::test]
async fn test_closed_port_fails_attempt() {
    let directory = Arc::new(PeerDirectory::new());
    let mut a = start_peer(AuthStrategy::Dummy, directory.clone()).await;

    // A port that was just released: reachable address, nothing listening.
    let vacated = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let ghost = IdentityKey::generate().identifier();
    directory
        .insert(ghost, PeerAddress::new("127.0.0.1", vacated))
        .await;

    let attempt = a.endpoint.send(ghost, b"nobody home".to_vec()).await.unwrap();
    let outcome = wait_outcome_for(&mut a.outcomes, attempt, Duration::from_secs(3)).await;
    assert!(matches!(outcome, DeliveryOutcome::Failed(_)));

    a.endpoint.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_sends_converge_on_one_channel() {
    let directory = Arc::new(PeerDirectory::new());
    let mut a = start_peer(AuthStrategy::Proof, directory.clone()).await;
    let mut b = start_peer(AuthStrategy::Proof, directory.clone()).await;

    let mut tasks = Vec::new();
    for i in 0..8u8 {
        let endpoint = a.endpoint.clone();
        let to = b.id;
        tasks.push(tokio::spawn(async move {
            endpoint.send(to, vec![i; 16]).await.unwrap()
        }));
    }
    let mut attempts = Vec::new();
    for task in tasks {
        attempts.push(task.await.unwrap());
    }

    for attempt in attempts {
        let outcome = wait_outcome_for(&mut a.outcomes, attempt, Duration::from_secs(3)).await;
        assert_eq!(outcome, DeliveryOutcome::Acknowledged);
    }

    // All eight raced through one creation.
    assert_eq!(a.endpoint.active_channels(), 1);
    for _ in 0..100 {
        if b.endpoint.active_channels() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(b.endpoint.active_channels(), 1);

    let mut payloads = Vec::new();
    for _ in 0..8 {
        let (_, payload) = timeout(Duration::from_secs(2), b.received.recv())
            .await
            .expect("delivery")
            .unwrap();
        payloads.push(payload);
    }
    payloads.sort();
    let expected: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i; 16]).collect();
    assert_eq!(payloads, expected);

    a.endpoint.shutdown().await;
    b.endpoint.shutdown().await;
}

#[tokio::test]
async fn test_payloads_arrive_in_send_order() {
    let directory = Arc::new(PeerDirectory::new());
    let mut a = start_peer(AuthStrategy::Dummy, directory.clone()).await;
    let mut b = start_peer(AuthStrategy::Dummy, directory.clone()).await;

    for i in 0..10u8 {
        a.endpoint
            .send(b.id, format!("msg-{i}").into_bytes())
            .await
            .unwrap();
    }

    for i in 0..10u8 {
        let (_, payload) = timeout(Duration::from_secs(2), b.received.recv())
            .await
            .expect("in-order delivery")
            .unwrap();
        assert_eq!(payload, format!("msg-{i}").into_bytes());
    }

    a.endpoint.shutdown().await;
    b.endpoint.shutdown().await;
}

#[tokio::test]
async fn test_large_payload_survives_split_reads() {
    let directory = Arc::new(PeerDirectory::new());
    let mut a = start_peer(AuthStrategy::Dummy, directory.clone()).await;
    let mut b = start_peer(AuthStrategy::Dummy, directory.clone()).await;

    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let attempt = a
        .endpoint
        .send_with_timeout(b.id, payload.clone(), Duration::from_secs(5))
        .await
        .unwrap();

    let outcome = wait_outcome_for(&mut a.outcomes, attempt, Duration::from_secs(5)).await;
    assert_eq!(outcome, DeliveryOutcome::Acknowledged);

    let (_, delivered) = timeout(Duration::from_secs(5), b.received.recv())
        .await
        .expect("large delivery")
        .unwrap();
    assert_eq!(delivered.len(), payload.len());
    assert_eq!(delivered, payload);

    a.endpoint.shutdown().await;
    b.endpoint.shutdown().await;
}

#[tokio::test]
async fn test_identity_mismatch_is_rejected() {
    let directory = Arc::new(PeerDirectory::new());
    let mut a = start_peer(AuthStrategy::Proof, directory.clone()).await;
    let mut b = start_peer(AuthStrategy::Proof, directory.clone()).await;

    // An identity nobody holds, pointing at b's socket.
    let imposter = IdentityKey::generate().identifier();
    directory
        .insert(
            imposter,
            PeerAddress::new("127.0.0.1", b.endpoint.local_addr().port()),
        )
        .await;

    let attempt = a.endpoint.send(imposter, b"who are you".to_vec()).await.unwrap();
    let outcome = wait_outcome_for(&mut a.outcomes, attempt, Duration::from_secs(3)).await;
    assert!(matches!(outcome, DeliveryOutcome::Failed(_)));
    assert_eq!(a.endpoint.active_channels(), 0);

    // The genuine identity still works.
    send_until_acknowledged(&mut a, b.id, b"it is me").await;
    let (_, payload) = timeout(Duration::from_secs(2), b.received.recv())
        .await
        .expect("genuine delivery")
        .unwrap();
    assert_eq!(payload, b"it is me");

    a.endpoint.shutdown().await;
    b.endpoint.shutdown().await;
}

#[tokio::test]
async fn test_simultaneous_mutual_connect_settles() {
    let directory = Arc::new(PeerDirectory::new());
    let mut a = start_peer(AuthStrategy::Dummy, directory.clone()).await;
    let mut b = start_peer(AuthStrategy::Dummy, directory.clone()).await;

    // Both sides dial each other at once. Each attempt must reach exactly
    // one terminal outcome, whichever socket survives the race.
    let (from_a, from_b) = tokio::join!(
        a.endpoint.send(b.id, b"a to b".to_vec()),
        b.endpoint.send(a.id, b"b to a".to_vec()),
    );
    let from_a = from_a.unwrap();
    let from_b = from_b.unwrap();

    let outcome_a = wait_outcome_for(&mut a.outcomes, from_a, Duration::from_secs(5)).await;
    let outcome_b = wait_outcome_for(&mut b.outcomes, from_b, Duration::from_secs(5)).await;
    assert!(matches!(
        outcome_a,
        DeliveryOutcome::Acknowledged | DeliveryOutcome::Failed(_) | DeliveryOutcome::TimedOut
    ));
    assert!(matches!(
        outcome_b,
        DeliveryOutcome::Acknowledged | DeliveryOutcome::Failed(_) | DeliveryOutcome::TimedOut
    ));

    // Once the race settles, traffic flows both ways.
    send_until_acknowledged(&mut a, b.id, b"after the dust").await;
    send_until_acknowledged(&mut b, a.id, b"same here").await;

    a.endpoint.shutdown().await;
    b.endpoint.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_fails_attempts_still_pending() {
    let directory = Arc::new(PeerDirectory::new());
    let mut a = start_peer(AuthStrategy::Dummy, directory.clone()).await;
    let b = start_deaf_peer(AuthStrategy::Dummy, directory.clone()).await;

    // Deaf receiver: the attempt stays pending until its long timeout.
    let attempt = a
        .endpoint
        .send_with_timeout(b.id, b"stranded".to_vec(), Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(a.endpoint.pending_attempts(), 1);

    a.endpoint.shutdown().await;

    let outcome = wait_outcome_for(&mut a.outcomes, attempt, Duration::from_secs(2)).await;
    assert!(matches!(outcome, DeliveryOutcome::Failed(_)));
    assert_eq!(a.endpoint.pending_attempts(), 0);

    // The endpoint refuses new work once shut down.
    let err = a.endpoint.send(b.id, b"late".to_vec()).await.unwrap_err();
    assert!(matches!(err, NetError::Shutdown));

    b.endpoint.shutdown().await;
}
