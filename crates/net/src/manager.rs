//! Connection table and channel establishment.
//!
//! One `ConnectionManager` owns the mapping from peer identity to live
//! channel. Creation is single-flight: concurrent callers for the same
//! destination share one attempt and receive the same outcome. When two
//! authenticated channels exist for one peer, the established one wins
//! and the newcomer is closed without surfacing an error. Closed channels
//! stay in the table until the next lookup removes them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use veil_types::Identifier;

use super::auth::{AuthEvent, AuthenticatorFactory, HandshakeSide};
use super::channel::{AuthProgress, MessageChannel};
use super::config::NetConfig;
use super::dialer::SharedDialer;
use super::error::{NetError, NetResult};
use super::pool::{Origin, WorkerPool};

/// Outcome broadcast to everyone awaiting an in-flight creation.
#[derive(Clone)]
enum PendingOutcome {
    InFlight,
    Ready(Arc<MessageChannel>),
    Failed(String),
}

enum Entry {
    Ready(Arc<MessageChannel>),
    Pending {
        tx: watch::Sender<PendingOutcome>,
        /// The outbound channel this creation is running, once dialed.
        /// Lets a handshake failure be matched back to its creation.
        candidate: Option<Arc<MessageChannel>>,
        generation: u64,
    },
}

pub struct ConnectionManager {
    table: Mutex<HashMap<Identifier, Entry>>,
    dialer: SharedDialer,
    factory: Arc<AuthenticatorFactory>,
    pool: Arc<WorkerPool>,
    config: NetConfig,
    generation: AtomicU64,
    events_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Build the manager and start the registrar task consuming handshake
    /// outcomes. The factory holds the sending side of `events`.
    pub fn new(
        config: NetConfig,
        dialer: SharedDialer,
        factory: Arc<AuthenticatorFactory>,
        pool: Arc<WorkerPool>,
        events: mpsc::UnboundedReceiver<AuthEvent>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            table: Mutex::new(HashMap::new()),
            dialer,
            factory,
            pool,
            config,
            generation: AtomicU64::new(0),
            events_task: Mutex::new(None),
        });
        let task = tokio::spawn(Self::run_events(manager.clone(), events));
        *manager
            .events_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(task);
        manager
    }

    pub fn local_identifier(&self) -> Identifier {
        self.factory.local_identifier()
    }

    /// Return the authenticated channel to `destination`, creating one if
    /// none exists. A closed channel found here is dropped and recreated
    /// on the spot.
    pub async fn channel(
        self: &Arc<Self>,
        destination: Identifier,
    ) -> NetResult<Arc<MessageChannel>> {
        loop {
            let mut rx = {
                let mut table = self.lock_table();
                match table.remove(&destination) {
                    Some(Entry::Ready(existing)) if !existing.is_closed() => {
                        table.insert(destination, Entry::Ready(existing.clone()));
                        return Ok(existing);
                    }
                    Some(Entry::Ready(_)) => {
                        debug!("Dropping closed channel record for {}", destination);
                        continue;
                    }
                    Some(Entry::Pending {
                        tx,
                        candidate,
                        generation,
                    }) => {
                        let rx = tx.subscribe();
                        table.insert(
                            destination,
                            Entry::Pending {
                                tx,
                                candidate,
                                generation,
                            },
                        );
                        rx
                    }
                    None => {
                        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
                        let (tx, rx) = watch::channel(PendingOutcome::InFlight);
                        table.insert(
                            destination,
                            Entry::Pending {
                                tx,
                                candidate: None,
                                generation,
                            },
                        );
                        // Creation runs on its own task so a caller that
                        // gives up waiting does not abandon it.
                        tokio::spawn(self.clone().establish(destination, generation));
                        rx
                    }
                }
            };

            loop {
                let outcome = rx.borrow_and_update().clone();
                match outcome {
                    PendingOutcome::InFlight => {
                        if rx.changed().await.is_err() {
                            return Err(NetError::ChannelClosed);
                        }
                    }
                    PendingOutcome::Ready(channel) => return Ok(channel),
                    PendingOutcome::Failed(reason) => {
                        return Err(NetError::EstablishFailed {
                            destination,
                            reason,
                        });
                    }
                }
            }
        }
    }

    /// The live authenticated channel for `peer`, if one is registered.
    pub fn authenticated_channel(&self, peer: &Identifier) -> Option<Arc<MessageChannel>> {
        match self.lock_table().get(peer) {
            Some(Entry::Ready(channel)) if channel.is_authenticated() => Some(channel.clone()),
            _ => None,
        }
    }

    /// Number of live authenticated channels.
    pub fn active_channels(&self) -> usize {
        self.lock_table()
            .values()
            .filter(|entry| matches!(entry, Entry::Ready(channel) if channel.is_authenticated()))
            .count()
    }

    /// Take ownership of an accepted socket and run the responder side of
    /// the handshake. Registration happens once the peer proves itself.
    pub async fn adopt_inbound(&self, stream: TcpStream) {
        let peer_addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Dropping inbound socket without peer address: {}", e);
                return;
            }
        };
        stream.set_nodelay(true).ok();
        debug!("Adopting inbound connection from {}", peer_addr);

        let (reader, writer) = stream.into_split();
        let channel = Arc::new(MessageChannel::new(
            peer_addr,
            writer,
            self.config.max_packet_size,
        ));
        if let Err(e) = channel.start_authenticating() {
            warn!("Inbound channel from {} unusable: {}", peer_addr, e);
            return;
        }

        let mut authenticator = self
            .factory
            .create(HandshakeSide::Responder, channel.clone());
        if let Err(e) = authenticator.start().await {
            warn!("Inbound handshake open to {} failed: {}", peer_addr, e);
            channel.close().await;
            return;
        }

        let mut progress = channel.subscribe_auth();
        let origin = Origin::new(
            reader,
            channel.clone(),
            Some(authenticator),
            self.config.max_packet_size,
        );
        if let Err(e) = self.pool.enqueue(origin) {
            warn!("No worker for inbound connection from {}: {}", peer_addr, e);
            channel.close().await;
            return;
        }

        // Half-open guard: drop the socket if the peer never finishes its
        // handshake.
        let deadline = self.config.handshake_timeout();
        let watchdog = channel.clone();
        tokio::spawn(async move {
            let resolved = timeout(deadline, async {
                loop {
                    if *progress.borrow_and_update() != AuthProgress::Pending {
                        return;
                    }
                    if progress.changed().await.is_err() {
                        return;
                    }
                }
            })
            .await;
            if resolved.is_err() {
                warn!(
                    "Inbound handshake from {} timed out",
                    watchdog.peer_addr()
                );
                watchdog.close().await;
            }
        });
    }

    /// Close every channel and resolve every in-flight creation. Called
    /// once at endpoint shutdown.
    pub async fn shutdown(&self) {
        if let Some(task) = self
            .events_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }

        let entries: Vec<Entry> = {
            let mut table = self.lock_table();
            table.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            match entry {
                Entry::Ready(channel) => channel.close().await,
                Entry::Pending { tx, candidate, .. } => {
                    tx.send(PendingOutcome::Failed("shutting down".to_string()))
                        .ok();
                    if let Some(channel) = candidate {
                        channel.close().await;
                    }
                }
            }
        }
        debug!("Connection manager shut down");
    }

    async fn run_events(manager: Arc<Self>, mut events: mpsc::UnboundedReceiver<AuthEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                AuthEvent::Succeeded { channel, peer } => manager.register(channel, peer).await,
                AuthEvent::Failed { channel, reason } => {
                    manager.register_failure(&channel, reason);
                }
            }
        }
    }

    /// Register an authenticated channel under its proven identity. Both
    /// directions land here; an already-established channel wins over the
    /// newcomer.
    async fn register(&self, channel: Arc<MessageChannel>, peer: Identifier) {
        let displaced = {
            let mut table = self.lock_table();
            match table.remove(&peer) {
                Some(Entry::Ready(existing)) if !existing.is_closed() => {
                    table.insert(peer, Entry::Ready(existing));
                    true
                }
                Some(Entry::Pending { tx, .. }) => {
                    tx.send(PendingOutcome::Ready(channel.clone())).ok();
                    table.insert(peer, Entry::Ready(channel.clone()));
                    false
                }
                Some(Entry::Ready(_)) | None => {
                    table.insert(peer, Entry::Ready(channel.clone()));
                    false
                }
            }
        };

        if displaced {
            info!(
                "Channel to {} already open, closing the newer one from {}",
                peer,
                channel.peer_addr()
            );
            channel.close().await;
        } else {
            debug!(
                "Registered authenticated channel to {} at {}",
                peer,
                channel.peer_addr()
            );
        }
    }

    /// A handshake concluded in failure. Resolves the owning creation if
    /// the channel was an outbound candidate; inbound failures only log.
    fn register_failure(&self, channel: &Arc<MessageChannel>, reason: String) {
        let mut table = self.lock_table();
        let creation = table.iter().find_map(|(peer, entry)| match entry {
            Entry::Pending {
                candidate: Some(candidate),
                ..
            } if Arc::ptr_eq(candidate, channel) => Some(*peer),
            _ => None,
        });

        match creation {
            Some(peer) => {
                if let Some(Entry::Pending { tx, .. }) = table.remove(&peer) {
                    tx.send(PendingOutcome::Failed(reason.clone())).ok();
                }
                debug!("Creation toward {} failed: {}", peer, reason);
            }
            None => {
                debug!(
                    "Handshake at {} failed without an owning creation: {}",
                    channel.peer_addr(),
                    reason
                );
            }
        }
    }

    /// Drives one outbound creation to its conclusion. Success resolves
    /// through the registrar; every failure path resolves here.
    async fn establish(self: Arc<Self>, destination: Identifier, generation: u64) {
        debug!("Establishing channel to {}", destination);
        if let Err(e) = self.connect_and_handshake(destination, generation).await {
            debug!("Channel to {} not established: {}", destination, e);
            self.resolve_failed(destination, generation, e.to_string());
        }
    }

    async fn connect_and_handshake(
        &self,
        destination: Identifier,
        generation: u64,
    ) -> NetResult<()> {
        let stream = timeout(
            self.config.connect_timeout(),
            self.dialer.dial(&destination),
        )
        .await
        .map_err(|_| NetError::Timeout(format!("connect to {destination}")))??;

        let peer_addr = stream
            .peer_addr()
            .map_err(|e| NetError::ConnectionFailed {
                destination,
                source: e,
            })?;
        let (reader, writer) = stream.into_split();
        let channel = Arc::new(MessageChannel::new(
            peer_addr,
            writer,
            self.config.max_packet_size,
        ));
        channel.start_authenticating()?;

        // Publish the candidate so the registrar can match a handshake
        // failure back to this creation. An inbound channel may have won
        // the entry already; the duplicate path cleans the candidate up.
        {
            let mut table = self.lock_table();
            if let Some(Entry::Pending {
                candidate,
                generation: owner,
                ..
            }) = table.get_mut(&destination)
            {
                if *owner == generation {
                    *candidate = Some(channel.clone());
                }
            }
        }

        let mut progress = channel.subscribe_auth();
        let mut authenticator = self
            .factory
            .create(HandshakeSide::Initiator { destination }, channel.clone());
        authenticator.start().await?;

        let origin = Origin::new(
            reader,
            channel.clone(),
            Some(authenticator),
            self.config.max_packet_size,
        );
        if let Err(e) = self.pool.enqueue(origin) {
            channel.close().await;
            return Err(e);
        }

        // The worker drives the handshake; only the deadline lives here.
        let outcome = timeout(self.config.handshake_timeout(), async {
            loop {
                let now = progress.borrow_and_update().clone();
                match now {
                    AuthProgress::Authenticated => return Ok(()),
                    AuthProgress::Failed(reason) => {
                        return Err(NetError::AuthenticationFailed(reason));
                    }
                    AuthProgress::Pending => {
                        if progress.changed().await.is_err() {
                            return Err(NetError::AuthenticationFailed(
                                "channel dropped mid-handshake".to_string(),
                            ));
                        }
                    }
                }
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                channel.close().await;
                Err(NetError::Timeout(format!("handshake with {destination}")))
            }
        }
    }

    /// Resolve a creation as failed, unless someone else resolved the
    /// entry first. The generation guard keeps a stale creation from
    /// clobbering a newer one.
    fn resolve_failed(&self, destination: Identifier, generation: u64, reason: String) {
        let mut table = self.lock_table();
        let owns_entry = matches!(
            table.get(&destination),
            Some(Entry::Pending { generation: owner, .. }) if *owner == generation
        );
        if owns_entry {
            if let Some(Entry::Pending { tx, .. }) = table.remove(&destination) {
                tx.send(PendingOutcome::Failed(reason)).ok();
            }
        }
    }

    fn lock_table(&self) -> MutexGuard<'_, HashMap<Identifier, Entry>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }
}
