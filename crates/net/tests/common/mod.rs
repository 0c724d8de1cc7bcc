//! Shared helpers for transport integration tests.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use veil_net::{
    AuthStrategy, DeliveryOutcome, Endpoint, Identifier, IdentityKey, NetConfig, PeerAddress,
    PeerDirectory,
};

/// Install the test log subscriber. First caller wins; later calls are
/// no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// One endpoint under test, with channels collecting everything it
/// receives and every attempt outcome it resolves.
pub struct TestPeer {
    pub endpoint: Arc<Endpoint>,
    pub id: Identifier,
    pub received: mpsc::UnboundedReceiver<(Identifier, Vec<u8>)>,
    pub outcomes: mpsc::UnboundedReceiver<(u64, DeliveryOutcome)>,
}

pub fn test_config(strategy: AuthStrategy) -> NetConfig {
    NetConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        worker_count: 2,
        poll_interval_ms: 10,
        default_timeout_ms: 2_000,
        handshake_timeout_secs: 2,
        auth_strategy: strategy,
        ..NetConfig::default()
    }
}

/// Start a peer, publish it in the shared directory, and wire both
/// listeners.
pub async fn start_peer(strategy: AuthStrategy, directory: Arc<PeerDirectory>) -> TestPeer {
    let mut peer = start_deaf_peer(strategy, directory).await;

    let (received_tx, received) = mpsc::unbounded_channel();
    peer.endpoint.set_receive_listener(Arc::new(move |from, payload| {
        received_tx.send((from, payload)).ok();
    }));
    peer.received = received;
    peer
}

/// Start a peer that authenticates and reads but has no receive listener,
/// so payloads sent to it are dropped unacknowledged.
pub async fn start_deaf_peer(strategy: AuthStrategy, directory: Arc<PeerDirectory>) -> TestPeer {
    init_tracing();
    let keys = IdentityKey::generate();
    let endpoint = Endpoint::start(test_config(strategy), keys, directory.clone())
        .await
        .expect("endpoint starts on a free port");
    let id = endpoint.local_identifier();
    directory
        .insert(id, PeerAddress::new("127.0.0.1", endpoint.local_addr().port()))
        .await;

    let (outcome_tx, outcomes) = mpsc::unbounded_channel();
    endpoint.set_delivery_listener(Arc::new(move |attempt, _destination, outcome| {
        outcome_tx.send((attempt, outcome)).ok();
    }));

    // Dangling receiver; replaced by start_peer when a listener is wired.
    let (_ignored_tx, received) = mpsc::unbounded_channel();
    TestPeer {
        endpoint: Arc::new(endpoint),
        id,
        received,
        outcomes,
    }
}

/// Next resolved outcome, bounded by `within`.
pub async fn wait_outcome(
    outcomes: &mut mpsc::UnboundedReceiver<(u64, DeliveryOutcome)>,
    within: Duration,
) -> (u64, DeliveryOutcome) {
    timeout(within, outcomes.recv())
        .await
        .expect("outcome within deadline")
        .expect("delivery listener alive")
}

/// The outcome for one specific attempt, skipping outcomes of earlier
/// attempts still draining.
pub async fn wait_outcome_for(
    outcomes: &mut mpsc::UnboundedReceiver<(u64, DeliveryOutcome)>,
    attempt: u64,
    within: Duration,
) -> DeliveryOutcome {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let (id, outcome) = wait_outcome(outcomes, remaining).await;
        if id == attempt {
            return outcome;
        }
    }
}

/// Send until one attempt acknowledges. Tolerates the transient failures
/// that follow a connection race, where the first attempt may land on a
/// channel the peer closed as a duplicate.
pub async fn send_until_acknowledged(peer: &mut TestPeer, to: Identifier, payload: &[u8]) {
    for _ in 0..5 {
        let attempt = peer
            .endpoint
            .send_with_timeout(to, payload.to_vec(), Duration::from_millis(1_000))
            .await
            .expect("endpoint accepting sends");
        let outcome = wait_outcome_for(&mut peer.outcomes, attempt, Duration::from_secs(3)).await;
        if outcome == DeliveryOutcome::Acknowledged {
            return;
        }
    }
    panic!("no attempt to {} acknowledged after 5 tries", to);
}
