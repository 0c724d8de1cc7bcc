//! Per-channel authentication strategies.
//!
//! Every new channel runs exactly one handshake before it may carry
//! application traffic. The strategy set is closed and selected by
//! configuration: `Proof` exchanges signed identity proofs, `Dummy`
//! exchanges unverified hellos for trusted or local deployments. Each
//! instance is bound to one channel, reports its outcome over the
//! manager's event queue, and is discarded once finished.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use veil_crypto::{verify_signature, IdentityKey, PUBLIC_KEY_LEN};
use veil_types::Identifier;

use super::channel::MessageChannel;
use super::config::AuthStrategy;
use super::error::{NetError, NetResult};
use super::packet::Packet;

/// Domain separation for proof signatures.
const PROOF_DOMAIN_TAG: &[u8] = b"veil-comm:channel-proof:v1";

/// Handshake outcome delivered to the connection manager.
pub enum AuthEvent {
    Succeeded {
        channel: Arc<MessageChannel>,
        peer: Identifier,
    },
    Failed {
        channel: Arc<MessageChannel>,
        reason: String,
    },
}

/// Which side of the handshake this channel plays.
#[derive(Debug, Clone)]
pub enum HandshakeSide {
    /// We dialed, and expect to reach this destination.
    Initiator { destination: Identifier },
    /// We accepted and learn the peer's identity from its proof.
    Responder,
}

/// One handshake bound to one channel. Implementations report exactly one
/// outcome over the event queue, then `on_packet` returns `true` so the
/// owning worker can discard the instance.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Send whatever opens the handshake for this side.
    async fn start(&mut self) -> NetResult<()>;

    /// Feed one handshake packet. Returns `true` once the handshake has
    /// finished, successfully or not.
    async fn on_packet(&mut self, packet: Packet) -> bool;

    /// The socket closed mid-handshake; treated as failure.
    async fn on_close(&mut self);
}

/// Builds the configured handshake strategy for a channel.
pub struct AuthenticatorFactory {
    strategy: AuthStrategy,
    keys: Arc<IdentityKey>,
    local_id: Identifier,
    proof_freshness: Duration,
    events: mpsc::UnboundedSender<AuthEvent>,
}

impl AuthenticatorFactory {
    pub fn new(
        strategy: AuthStrategy,
        keys: Arc<IdentityKey>,
        proof_freshness: Duration,
        events: mpsc::UnboundedSender<AuthEvent>,
    ) -> Self {
        let local_id = keys.identifier();
        Self {
            strategy,
            keys,
            local_id,
            proof_freshness,
            events,
        }
    }

    pub fn local_identifier(&self) -> Identifier {
        self.local_id
    }

    pub fn create(
        &self,
        side: HandshakeSide,
        channel: Arc<MessageChannel>,
    ) -> Box<dyn Authenticator> {
        match self.strategy {
            AuthStrategy::Proof => Box::new(ProofAuthenticator {
                side,
                keys: self.keys.clone(),
                local_id: self.local_id,
                proof_freshness: self.proof_freshness,
                channel,
                events: self.events.clone(),
                done: false,
            }),
            AuthStrategy::Dummy => Box::new(DummyAuthenticator {
                side,
                local_id: self.local_id,
                channel,
                events: self.events.clone(),
                done: false,
            }),
        }
    }
}

/// Resolve the channel before emitting the event, so the owning worker
/// sees an authenticated channel before it dispatches the next packet
/// from the same socket.
fn report_success(
    channel: &Arc<MessageChannel>,
    events: &mpsc::UnboundedSender<AuthEvent>,
    peer: Identifier,
) {
    if let Err(e) = channel.mark_authenticated(peer) {
        report_failure(channel, events, e.to_string());
        return;
    }
    events
        .send(AuthEvent::Succeeded {
            channel: channel.clone(),
            peer,
        })
        .ok();
}

fn report_failure(
    channel: &Arc<MessageChannel>,
    events: &mpsc::UnboundedSender<AuthEvent>,
    reason: String,
) {
    channel.fail_auth(&reason);
    events
        .send(AuthEvent::Failed {
            channel: channel.clone(),
            reason,
        })
        .ok();
}

/// Signed statement binding a public key to a recipient and a moment in
/// time. The proven identity is always derived from the enclosed key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeProof {
    pub recipient: Identifier,
    pub public_key: [u8; PUBLIC_KEY_LEN],
    pub timestamp: u64,
    pub signature: Vec<u8>,
}

impl HandshakeProof {
    pub fn new(keys: &IdentityKey, recipient: Identifier) -> Self {
        Self::new_at(keys, recipient, now_unix())
    }

    fn new_at(keys: &IdentityKey, recipient: Identifier, timestamp: u64) -> Self {
        let public_key = keys.public_key();
        let digest = signable_digest(&recipient, &public_key, timestamp);
        Self {
            recipient,
            public_key,
            timestamp,
            signature: keys.sign(&digest),
        }
    }

    /// Verify against our own identity and clock, returning the proven
    /// peer Identifier. Checks recipient, then freshness, then signature.
    pub fn verify(&self, local: &Identifier, freshness: Duration) -> NetResult<Identifier> {
        if self.recipient != *local {
            return Err(NetError::AuthenticationFailed(format!(
                "proof addressed to {}, not us",
                self.recipient
            )));
        }

        let now = now_unix();
        let window = freshness.as_secs();
        if self.timestamp.saturating_add(window) < now
            || self.timestamp > now.saturating_add(window)
        {
            return Err(NetError::AuthenticationFailed(format!(
                "proof timestamp {} outside freshness window",
                self.timestamp
            )));
        }

        let digest = signable_digest(&self.recipient, &self.public_key, self.timestamp);
        verify_signature(&self.public_key, &digest, &self.signature)
            .map_err(|e| NetError::AuthenticationFailed(format!("proof signature invalid: {e}")))?;

        Ok(veil_crypto::derive_identifier(&self.public_key))
    }
}

fn signable_digest(
    recipient: &Identifier,
    public_key: &[u8; PUBLIC_KEY_LEN],
    timestamp: u64,
) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(PROOF_DOMAIN_TAG);
    hasher.update(recipient.as_bytes());
    hasher.update(public_key);
    hasher.update(timestamp.to_be_bytes());
    hasher.finalize().to_vec()
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Identity-proof handshake: each side sends one signed proof addressed to
/// the other and verifies the one it receives.
struct ProofAuthenticator {
    side: HandshakeSide,
    keys: Arc<IdentityKey>,
    local_id: Identifier,
    proof_freshness: Duration,
    channel: Arc<MessageChannel>,
    events: mpsc::UnboundedSender<AuthEvent>,
    done: bool,
}

impl ProofAuthenticator {
    async fn send_proof(&self, recipient: Identifier) -> NetResult<()> {
        let proof = HandshakeProof::new(&self.keys, recipient);
        let body = bincode::serialize(&proof)
            .map_err(|e| NetError::CodecError(format!("proof encode: {e}")))?;
        self.channel.write_packet(&Packet::handshake(body)).await
    }

    fn finish_ok(&mut self, peer: Identifier) {
        self.done = true;
        report_success(&self.channel, &self.events, peer);
    }

    fn finish_err(&mut self, reason: String) {
        warn!(
            "Handshake with {} failed: {}",
            self.channel.peer_addr(),
            reason
        );
        self.done = true;
        report_failure(&self.channel, &self.events, reason);
    }
}

#[async_trait]
impl Authenticator for ProofAuthenticator {
    async fn start(&mut self) -> NetResult<()> {
        match &self.side {
            // The dialer opens; we know who we expect on the far end.
            HandshakeSide::Initiator { destination } => self.send_proof(*destination).await,
            HandshakeSide::Responder => Ok(()),
        }
    }

    async fn on_packet(&mut self, packet: Packet) -> bool {
        if self.done {
            return true;
        }

        let proof: HandshakeProof = match bincode::deserialize(&packet.payload) {
            Ok(proof) => proof,
            Err(e) => {
                self.finish_err(format!("malformed proof: {e}"));
                return true;
            }
        };

        let peer = match proof.verify(&self.local_id, self.proof_freshness) {
            Ok(peer) => peer,
            Err(e) => {
                self.finish_err(e.to_string());
                return true;
            }
        };

        match self.side.clone() {
            HandshakeSide::Initiator { destination } => {
                if peer != destination {
                    self.finish_err(format!(
                        "peer proved identity {} but we dialed {}",
                        peer, destination
                    ));
                    return true;
                }
                debug!("Outbound handshake with {} complete", peer);
                self.finish_ok(peer);
            }
            HandshakeSide::Responder => {
                // Answer with our own proof, addressed to the proven peer.
                if let Err(e) = self.send_proof(peer).await {
                    self.finish_err(format!("proof reply failed: {e}"));
                    return true;
                }
                debug!("Inbound handshake with {} complete", peer);
                self.finish_ok(peer);
            }
        }
        true
    }

    async fn on_close(&mut self) {
        if !self.done {
            self.finish_err("socket closed mid-handshake".to_string());
        }
    }
}

/// Payload of the unverified hello used by the dummy strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DummyHello {
    identifier: Identifier,
}

/// Trust-on-sight handshake: each side names itself in a single hello and
/// the claim is accepted as-is. Only suitable where the transport itself
/// is trusted.
struct DummyAuthenticator {
    side: HandshakeSide,
    local_id: Identifier,
    channel: Arc<MessageChannel>,
    events: mpsc::UnboundedSender<AuthEvent>,
    done: bool,
}

impl DummyAuthenticator {
    fn finish_ok(&mut self, peer: Identifier) {
        self.done = true;
        report_success(&self.channel, &self.events, peer);
    }

    fn finish_err(&mut self, reason: String) {
        warn!(
            "Dummy handshake with {} failed: {}",
            self.channel.peer_addr(),
            reason
        );
        self.done = true;
        report_failure(&self.channel, &self.events, reason);
    }
}

#[async_trait]
impl Authenticator for DummyAuthenticator {
    async fn start(&mut self) -> NetResult<()> {
        let hello = DummyHello {
            identifier: self.local_id,
        };
        let body = bincode::serialize(&hello)
            .map_err(|e| NetError::CodecError(format!("hello encode: {e}")))?;
        self.channel.write_packet(&Packet::handshake(body)).await
    }

    async fn on_packet(&mut self, packet: Packet) -> bool {
        if self.done {
            return true;
        }

        let hello: DummyHello = match bincode::deserialize(&packet.payload) {
            Ok(hello) => hello,
            Err(e) => {
                self.finish_err(format!("malformed hello: {e}"));
                return true;
            }
        };

        if let HandshakeSide::Initiator { destination } = &self.side {
            if hello.identifier != *destination {
                self.finish_err(format!(
                    "peer claims identity {} but we dialed {}",
                    hello.identifier, destination
                ));
                return true;
            }
        }

        debug!("Dummy handshake accepted claim {}", hello.identifier);
        self.finish_ok(hello.identifier);
        true
    }

    async fn on_close(&mut self) {
        if !self.done {
            self.finish_err("socket closed mid-handshake".to_string());
        }
    }
}
