//! Dialer seam between the transport core and whatever opens sockets.
//!
//! The core only consumes already-open byte streams. `TcpDialer` opens
//! plain TCP through the peer directory and suits trusted or local
//! deployments; anonymizing transports (proxy-routed circuits) implement
//! the same trait outside this crate.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;
use veil_types::Identifier;

use super::directory::PeerDirectory;
use super::error::{NetError, NetResult};

/// Opens a byte stream to a destination. Connect timeouts are enforced by
/// the caller, not here.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, destination: &Identifier) -> NetResult<TcpStream>;
}

/// Shared handle to a dialer implementation.
pub type SharedDialer = Arc<dyn Dialer>;

/// Directory-backed plain TCP dialer.
pub struct TcpDialer {
    directory: Arc<PeerDirectory>,
}

impl TcpDialer {
    pub fn new(directory: Arc<PeerDirectory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, destination: &Identifier) -> NetResult<TcpStream> {
        let address = self.directory.lookup(destination).await?;
        let addr_str = format!("{}:{}", address.hostname, address.port);
        debug!("Dialing peer {} at {}", destination, addr_str);

        let stream =
            TcpStream::connect(&addr_str)
                .await
                .map_err(|e| NetError::ConnectionFailed {
                    destination: *destination,
                    source: e,
                })?;

        // Disable Nagle's algorithm for lower latency
        stream.set_nodelay(true).ok();
        Ok(stream)
    }
}
