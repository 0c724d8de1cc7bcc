//! Peer directory: the Identifier -> address table consulted when dialing.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::debug;
use veil_types::Identifier;

use super::error::{NetError, NetResult};

/// Where a peer can be reached.
#[derive(Debug, Clone)]
pub struct PeerAddress {
    /// Hostname or IP address.
    pub hostname: String,
    /// Listening port.
    pub port: u16,
}

impl PeerAddress {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }
}

/// In-memory directory of known peers.
///
/// The embedder fills it from whatever discovery mechanism it runs; the
/// transport only reads it when opening a channel.
#[derive(Default)]
pub struct PeerDirectory {
    peers: RwLock<HashMap<Identifier, PeerAddress>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, identifier: Identifier, address: PeerAddress) {
        let mut peers = self.peers.write().await;
        peers.insert(identifier, address);
        debug!("Added peer {} to directory", identifier);
    }

    pub async fn remove(&self, identifier: &Identifier) {
        let mut peers = self.peers.write().await;
        peers.remove(identifier);
        debug!("Removed peer {} from directory", identifier);
    }

    pub async fn lookup(&self, identifier: &Identifier) -> NetResult<PeerAddress> {
        let peers = self.peers.read().await;
        peers
            .get(identifier)
            .cloned()
            .ok_or(NetError::PeerUnknown(*identifier))
    }

    pub async fn identifiers(&self) -> Vec<Identifier> {
        let peers = self.peers.read().await;
        peers.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        let peers = self.peers.read().await;
        peers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
