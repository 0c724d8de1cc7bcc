//! Per-connection message channel and its lifecycle state machine.
//!
//! One `MessageChannel` wraps one byte stream to one peer. Writes go
//! through an async mutex as whole frames, so concurrent senders cannot
//! interleave partial packets and per-channel FIFO order holds. The read
//! half lives with the owning worker, not here.

use std::net::SocketAddr;
use std::sync::Mutex;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, warn};
use veil_types::Identifier;

use super::error::{NetError, NetResult};
use super::packet::{Packet, PacketKind};

/// Channel lifecycle. `Closed` is terminal; a closed channel is never
/// reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Authenticating,
    Authenticated,
    Closed,
}

/// Handshake progress observed by whoever created the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthProgress {
    Pending,
    Authenticated,
    Failed(String),
}

#[derive(Debug)]
pub struct MessageChannel {
    peer_addr: SocketAddr,
    state: Mutex<ChannelState>,
    peer: Mutex<Option<Identifier>>,
    writer: AsyncMutex<OwnedWriteHalf>,
    auth_tx: watch::Sender<AuthProgress>,
    max_packet_size: u32,
}

impl MessageChannel {
    pub fn new(peer_addr: SocketAddr, writer: OwnedWriteHalf, max_packet_size: u32) -> Self {
        let (auth_tx, _) = watch::channel(AuthProgress::Pending);
        Self {
            peer_addr,
            state: Mutex::new(ChannelState::Connecting),
            peer: Mutex::new(None),
            writer: AsyncMutex::new(writer),
            auth_tx,
            max_packet_size,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The peer's identity, known once the handshake has proven it.
    pub fn peer(&self) -> Option<Identifier> {
        *self.peer.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == ChannelState::Authenticated
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    /// Watch handshake progress; resolves exactly once per channel.
    pub fn subscribe_auth(&self) -> watch::Receiver<AuthProgress> {
        self.auth_tx.subscribe()
    }

    pub fn start_authenticating(&self) -> NetResult<()> {
        self.transition(ChannelState::Authenticating, &[ChannelState::Connecting])
    }

    /// Mark the handshake complete and record the proven identity.
    pub fn mark_authenticated(&self, peer: Identifier) -> NetResult<()> {
        self.transition(
            ChannelState::Authenticated,
            &[ChannelState::Authenticating],
        )?;
        *self.peer.lock().unwrap_or_else(|e| e.into_inner()) = Some(peer);
        let _ = self.auth_tx.send(AuthProgress::Authenticated);
        Ok(())
    }

    /// Report a failed handshake to anyone waiting on this channel.
    pub fn fail_auth(&self, reason: &str) {
        let _ = self.auth_tx.send(AuthProgress::Failed(reason.to_string()));
    }

    /// Close the channel. Idempotent; any state may close. Shuts the
    /// write half down so the peer observes EOF.
    pub async fn close(&self) {
        let was_open = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let open = *state != ChannelState::Closed;
            *state = ChannelState::Closed;
            open
        };
        if was_open {
            debug!("Closing channel to {}", self.peer_addr);
            self.fail_auth("channel closed");
            self.writer.lock().await.shutdown().await.ok();
        }
    }

    /// Write one framed packet. `Data` packets require an authenticated
    /// channel; handshake and ack traffic only require it to be open. A
    /// write error closes the channel.
    pub async fn write_packet(&self, packet: &Packet) -> NetResult<()> {
        match self.state() {
            ChannelState::Closed => return Err(NetError::ChannelClosed),
            ChannelState::Authenticated => {}
            _ if packet.kind == PacketKind::Data => {
                return Err(NetError::SendFailed(
                    "channel not yet authenticated".to_string(),
                ));
            }
            _ => {}
        }

        let encoded = packet.encode(self.max_packet_size)?;

        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(&encoded).await?;
            writer.flush().await
        }
        .await;
        drop(writer);

        if let Err(e) = result {
            warn!("Write to {} failed: {}", self.peer_addr, e);
            self.close().await;
            return Err(NetError::SendFailed(e.to_string()));
        }
        Ok(())
    }

    fn transition(&self, new_state: ChannelState, allowed_from: &[ChannelState]) -> NetResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !allowed_from.contains(&state) {
            return Err(NetError::SendFailed(format!(
                "invalid channel transition for {}: {:?} -> {:?}",
                self.peer_addr, *state, new_state
            )));
        }
        debug!(
            "Channel to {} moves {:?} -> {:?}",
            self.peer_addr, *state, new_state
        );
        *state = new_state;
        Ok(())
    }
}
