//! Embedder-facing endpoint tying the transport together.
//!
//! `Endpoint::start` binds the listener and brings up every moving part:
//! the worker pool, the timer, the connection manager with its registrar
//! task, the dispatcher's consumer tasks, and the acceptor. The embedder
//! then registers its listeners, fills the peer directory, and sends.
//! `shutdown` tears all of it down exactly once; attempts still in flight
//! resolve as failed rather than disappearing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;
use veil_crypto::IdentityKey;
use veil_types::Identifier;

use super::acceptor::Acceptor;
use super::auth::AuthenticatorFactory;
use super::config::NetConfig;
use super::dialer::{SharedDialer, TcpDialer};
use super::directory::PeerDirectory;
use super::dispatcher::{DeliveryListener, Dispatcher};
use super::error::{NetError, NetResult};
use super::manager::ConnectionManager;
use super::pool::{PacketHooks, ReceiveHook, ReceiveListener, WorkerPool};

pub struct Endpoint {
    config: NetConfig,
    directory: Arc<PeerDirectory>,
    manager: Arc<ConnectionManager>,
    dispatcher: Arc<Dispatcher>,
    pool: Arc<WorkerPool>,
    receive: ReceiveHook,
    acceptor: Acceptor,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    /// Bind and start an endpoint that dials peers over plain TCP through
    /// the directory.
    pub async fn start(
        config: NetConfig,
        keys: IdentityKey,
        directory: Arc<PeerDirectory>,
    ) -> NetResult<Self> {
        let dialer: SharedDialer = Arc::new(TcpDialer::new(directory.clone()));
        Self::start_with_dialer(config, keys, directory, dialer).await
    }

    /// Bind and start an endpoint with a caller-supplied dialer. This is
    /// the seam for anonymizing transports.
    pub async fn start_with_dialer(
        config: NetConfig,
        keys: IdentityKey,
        directory: Arc<PeerDirectory>,
        dialer: SharedDialer,
    ) -> NetResult<Self> {
        let keys = Arc::new(keys);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let factory = Arc::new(AuthenticatorFactory::new(
            config.auth_strategy,
            keys,
            config.proof_freshness(),
            event_tx,
        ));

        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let receive: ReceiveHook = Arc::new(RwLock::new(None));
        let hooks = PacketHooks {
            acks: ack_tx,
            closures: closed_tx,
            receive: receive.clone(),
        };

        let pool = WorkerPool::spawn(&config, hooks);
        let manager = ConnectionManager::new(
            config.clone(),
            dialer,
            factory,
            pool.clone(),
            event_rx,
        );
        let dispatcher = Dispatcher::spawn(&config, manager.clone(), ack_rx, closed_rx);

        let acceptor = match Acceptor::spawn(&config.listen_addr, manager.clone()).await {
            Ok(acceptor) => acceptor,
            Err(e) => {
                // Unwind what already started before surfacing the error.
                pool.stop();
                manager.shutdown().await;
                dispatcher.shutdown();
                return Err(e);
            }
        };

        let endpoint = Self {
            config,
            directory,
            manager,
            dispatcher,
            pool,
            receive,
            acceptor,
            shut_down: AtomicBool::new(false),
        };
        info!(
            "Endpoint {} listening on {}",
            endpoint.local_identifier(),
            endpoint.local_addr()
        );
        Ok(endpoint)
    }

    /// Identity derived from this endpoint's key material.
    pub fn local_identifier(&self) -> Identifier {
        self.manager.local_identifier()
    }

    /// Address the acceptor is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    /// Register the callback invoked once per delivered payload. Runs on
    /// a worker; it must return quickly.
    pub fn set_receive_listener(&self, listener: ReceiveListener) {
        *self
            .receive
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(listener);
    }

    /// Register the callback receiving each attempt's terminal outcome.
    pub fn set_delivery_listener(&self, listener: DeliveryListener) {
        self.dispatcher.set_delivery_listener(listener);
    }

    /// Send with the configured default timeout. Returns the attempt id;
    /// the outcome arrives through the delivery listener.
    pub async fn send(&self, destination: Identifier, payload: Vec<u8>) -> NetResult<u64> {
        self.send_with_timeout(destination, payload, self.config.default_timeout())
            .await
    }

    pub async fn send_with_timeout(
        &self,
        destination: Identifier,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> NetResult<u64> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(NetError::Shutdown);
        }
        Ok(self
            .dispatcher
            .send_with_timeout(destination, payload, timeout)
            .await)
    }

    /// Live authenticated channels across both directions.
    pub fn active_channels(&self) -> usize {
        self.manager.active_channels()
    }

    /// Attempts awaiting a terminal outcome.
    pub fn pending_attempts(&self) -> usize {
        self.dispatcher.pending_attempts()
    }

    /// Stop accepting, close every channel, and fail whatever attempts
    /// remain pending. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down endpoint {}", self.local_identifier());

        self.acceptor.stop();
        self.acceptor.join().await;
        self.manager.shutdown().await;
        self.pool.stop();
        self.dispatcher.shutdown();
    }
}
