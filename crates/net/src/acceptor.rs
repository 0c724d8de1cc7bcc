//! Inbound connection acceptor.
//!
//! Owns the listening socket and a single accept loop. Every accepted
//! socket is handed to the connection manager, which runs the responder
//! side of the handshake before the channel carries traffic. `stop`
//! interrupts the loop promptly and may be called from anywhere, any
//! number of times.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::{NetError, NetResult};
use super::manager::ConnectionManager;

#[derive(Debug)]
pub struct Acceptor {
    local_addr: SocketAddr,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Acceptor {
    /// Bind the listening socket and start the accept loop.
    pub async fn spawn(listen_addr: &str, manager: Arc<ConnectionManager>) -> NetResult<Self> {
        let listener =
            TcpListener::bind(listen_addr)
                .await
                .map_err(|e| NetError::BindFailed {
                    address: listen_addr.to_string(),
                    source: e,
                })?;
        let local_addr = listener.local_addr().map_err(|e| NetError::BindFailed {
            address: listen_addr.to_string(),
            source: e,
        })?;
        info!("Accepting connections on {}", local_addr);

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => match result {
                        Ok((stream, addr)) => {
                            debug!("Accepted connection from {}", addr);
                            manager.adopt_inbound(stream).await;
                        }
                        Err(e) => {
                            // One failed accept must not kill the loop.
                            warn!("Accept failed: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    },
                    changed = stop_rx.changed() => {
                        // A dropped handle stops the loop like an explicit
                        // stop request.
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            // Dropping the listener here closes the socket.
            debug!("Acceptor on {} stopped", local_addr);
        });

        Ok(Self {
            local_addr,
            stop_tx,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Request the accept loop to terminate. Idempotent; safe concurrently
    /// with an accept in progress.
    pub fn stop(&self) {
        self.stop_tx.send(true).ok();
    }

    /// Wait for the accept loop to exit. Meaningful after `stop`.
    pub async fn join(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.await.ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthenticatorFactory;
    use crate::config::{AuthStrategy, NetConfig};
    use crate::dialer::{SharedDialer, TcpDialer};
    use crate::directory::{PeerAddress, PeerDirectory};
    use crate::pool::{PacketHooks, WorkerPool};
    use std::sync::RwLock;
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;
    use veil_crypto::IdentityKey;
    use veil_types::Identifier;

    async fn manager_for(
        directory: Arc<PeerDirectory>,
    ) -> (Arc<ConnectionManager>, Identifier) {
        let config = NetConfig {
            worker_count: 1,
            poll_interval_ms: 10,
            auth_strategy: AuthStrategy::Dummy,
            ..NetConfig::default()
        };
        let keys = Arc::new(IdentityKey::generate());
        let id = keys.identifier();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let factory = Arc::new(AuthenticatorFactory::new(
            config.auth_strategy,
            keys,
            config.proof_freshness(),
            event_tx,
        ));
        let (ack_tx, _ack_rx) = mpsc::unbounded_channel();
        let (closed_tx, _closed_rx) = mpsc::unbounded_channel();
        let hooks = PacketHooks {
            acks: ack_tx,
            closures: closed_tx,
            receive: Arc::new(RwLock::new(None)),
        };
        let pool = WorkerPool::spawn(&config, hooks);
        let dialer: SharedDialer = Arc::new(TcpDialer::new(directory));
        (
            ConnectionManager::new(config, dialer, factory, pool, event_rx),
            id,
        )
    }

    #[tokio::test]
    async fn test_accepted_connections_reach_the_manager() {
        let directory = Arc::new(PeerDirectory::new());
        let (a, _a_id) = manager_for(directory.clone()).await;
        let (b, b_id) = manager_for(directory.clone()).await;

        let b_acceptor = Acceptor::spawn("127.0.0.1:0", b.clone()).await.unwrap();
        directory
            .insert(
                b_id,
                PeerAddress::new("127.0.0.1", b_acceptor.local_addr().port()),
            )
            .await;

        let channel = a.channel(b_id).await.unwrap();
        assert_eq!(channel.peer(), Some(b_id));

        // The responder side registers through the accept path.
        for _ in 0..100 {
            if b.active_channels() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(b.active_channels(), 1);
    }

    #[tokio::test]
    async fn test_stop_unblocks_and_is_idempotent() {
        let directory = Arc::new(PeerDirectory::new());
        let (manager, _id) = manager_for(directory).await;
        let acceptor = Acceptor::spawn("127.0.0.1:0", manager).await.unwrap();
        let addr = acceptor.local_addr();

        acceptor.stop();
        acceptor.stop();
        acceptor.join().await;

        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let directory = Arc::new(PeerDirectory::new());
        let (manager, _id) = manager_for(directory).await;
        let first = Acceptor::spawn("127.0.0.1:0", manager.clone())
            .await
            .unwrap();

        let taken = first.local_addr().to_string();
        let err = Acceptor::spawn(&taken, manager).await.unwrap_err();
        assert!(matches!(err, NetError::BindFailed { .. }));
    }
}
