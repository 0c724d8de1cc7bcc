//! Fixed-size worker pool multiplexing socket reads.
//!
//! Every open socket ("origin") belongs to exactly one worker. Workers
//! poll their origins with non-blocking reads at the configured interval,
//! feed bytes through each origin's resumable decoder, and route finished
//! packets by kind: handshake traffic to the channel's authenticator, acks
//! to the dispatcher, data to the receive listener. An I/O error on one
//! origin retires only that origin.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use veil_types::Identifier;

use super::auth::Authenticator;
use super::channel::MessageChannel;
use super::config::{AssignPolicy, NetConfig};
use super::error::{NetError, NetResult};
use super::packet::{Packet, PacketDecoder, PacketKind};

/// Callback receiving every delivered application payload.
pub type ReceiveListener = Arc<dyn Fn(Identifier, Vec<u8>) + Send + Sync>;

/// Shared slot the listener is registered into.
pub type ReceiveHook = Arc<RwLock<Option<ReceiveListener>>>;

/// Event senders handed to every worker.
#[derive(Clone)]
pub struct PacketHooks {
    /// Acknowledged attempt ids, consumed by the dispatcher.
    pub acks: mpsc::UnboundedSender<u64>,
    /// Channels that closed, consumed by the dispatcher.
    pub closures: mpsc::UnboundedSender<Arc<MessageChannel>>,
    /// Registered receive listener.
    pub receive: ReceiveHook,
}

/// One socket as a worker sees it: the read half, its decode state, the
/// owning channel, and the handshake while one is running.
pub struct Origin {
    reader: OwnedReadHalf,
    decoder: PacketDecoder,
    channel: Arc<MessageChannel>,
    authenticator: Option<Box<dyn Authenticator>>,
}

impl Origin {
    pub fn new(
        reader: OwnedReadHalf,
        channel: Arc<MessageChannel>,
        authenticator: Option<Box<dyn Authenticator>>,
        max_packet_size: u32,
    ) -> Self {
        Self {
            reader,
            decoder: PacketDecoder::new(max_packet_size),
            channel,
            authenticator,
        }
    }
}

enum WorkerCommand {
    Add(Origin),
    Stop,
}

struct WorkerHandle {
    tx: mpsc::UnboundedSender<WorkerCommand>,
    load: Arc<AtomicUsize>,
    #[allow(dead_code)]
    task: JoinHandle<()>,
}

/// Fixed pool of receive workers.
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    policy: AssignPolicy,
    rr_next: AtomicUsize,
    stopped: AtomicBool,
}

impl WorkerPool {
    pub fn spawn(config: &NetConfig, hooks: PacketHooks) -> Arc<Self> {
        let count = config.worker_count.max(1);
        let poll_interval = config.poll_interval();

        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let (tx, rx) = mpsc::unbounded_channel();
            let load = Arc::new(AtomicUsize::new(0));
            let task = tokio::spawn(worker_main(
                index,
                rx,
                load.clone(),
                poll_interval,
                hooks.clone(),
            ));
            workers.push(WorkerHandle { tx, load, task });
        }

        debug!(
            "Started worker pool: {} workers, {} assignment",
            count, config.assign_policy
        );
        Arc::new(Self {
            workers,
            policy: config.assign_policy,
            rr_next: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        })
    }

    /// Assign a new origin to a worker, which owns it until the socket
    /// closes. Assignment is deterministic per the configured policy.
    pub fn enqueue(&self, origin: Origin) -> NetResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(NetError::Shutdown);
        }

        let index = match self.policy {
            AssignPolicy::LeastLoaded => self
                .workers
                .iter()
                .enumerate()
                .min_by_key(|(_, worker)| worker.load.load(Ordering::SeqCst))
                .map(|(index, _)| index)
                .unwrap_or(0),
            AssignPolicy::RoundRobin => {
                self.rr_next.fetch_add(1, Ordering::SeqCst) % self.workers.len()
            }
        };

        let worker = &self.workers[index];
        worker.load.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Assigning origin {} to worker {}",
            origin.channel.peer_addr(),
            index
        );
        if worker.tx.send(WorkerCommand::Add(origin)).is_err() {
            worker.load.fetch_sub(1, Ordering::SeqCst);
            return Err(NetError::Shutdown);
        }
        Ok(())
    }

    /// Interrupt every worker. Idempotent and safe concurrently with
    /// in-progress polls.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Stopping worker pool");
        for worker in &self.workers {
            worker.tx.send(WorkerCommand::Stop).ok();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Live origins per worker, in worker index order.
    pub fn loads(&self) -> Vec<usize> {
        self.workers
            .iter()
            .map(|worker| worker.load.load(Ordering::SeqCst))
            .collect()
    }
}

async fn worker_main(
    index: usize,
    mut rx: mpsc::UnboundedReceiver<WorkerCommand>,
    load: Arc<AtomicUsize>,
    poll_interval: Duration,
    hooks: PacketHooks,
) {
    // Index-stable arena: closed origins become tombstones during a poll
    // round and are compacted between rounds.
    let mut origins: Vec<Option<Origin>> = Vec::new();
    debug!("Worker {} running", index);

    'run: loop {
        // Pick up pending commands without blocking the poll round.
        loop {
            match rx.try_recv() {
                Ok(WorkerCommand::Add(origin)) => add_origin(&mut origins, origin),
                Ok(WorkerCommand::Stop) | Err(mpsc::error::TryRecvError::Disconnected) => {
                    break 'run;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
            }
        }

        for slot in origins.iter_mut() {
            let closed = match slot {
                Some(origin) => poll_origin(index, origin, &hooks).await,
                None => false,
            };
            if closed {
                if let Some(origin) = slot.take() {
                    retire_origin(origin, &hooks).await;
                    load.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
        origins.retain(Option::is_some);

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            cmd = rx.recv() => match cmd {
                Some(WorkerCommand::Add(origin)) => add_origin(&mut origins, origin),
                Some(WorkerCommand::Stop) | None => break 'run,
            }
        }
    }

    // Retire whatever is still assigned so pending attempts fail instead
    // of timing out.
    for origin in origins.into_iter().flatten() {
        retire_origin(origin, &hooks).await;
        load.fetch_sub(1, Ordering::SeqCst);
    }
    debug!("Worker {} stopped", index);
}

fn add_origin(origins: &mut Vec<Option<Origin>>, origin: Origin) {
    if let Some(slot) = origins.iter_mut().find(|slot| slot.is_none()) {
        *slot = Some(origin);
    } else {
        origins.push(Some(origin));
    }
}

/// One poll round for one origin. Returns `true` when the origin must be
/// retired.
async fn poll_origin(worker: usize, origin: &mut Origin, hooks: &PacketHooks) -> bool {
    if origin.channel.is_closed() {
        return true;
    }

    // Drain whatever the socket has ready without blocking.
    let mut buf = [0u8; 4096];
    loop {
        match origin.reader.try_read(&mut buf) {
            Ok(0) => {
                debug!(
                    "Worker {}: peer {} closed the connection",
                    worker,
                    origin.channel.peer_addr()
                );
                return true;
            }
            Ok(n) => origin.decoder.feed(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                warn!(
                    "Worker {}: read error on {}: {}",
                    worker,
                    origin.channel.peer_addr(),
                    e
                );
                return true;
            }
        }
    }

    // Hand every completed packet to its consumer. A packet may span
    // polls; the decoder resumes where the last round left off.
    loop {
        match origin.decoder.next_packet() {
            Ok(Some(packet)) => {
                if dispatch_packet(origin, packet, hooks).await {
                    return true;
                }
            }
            Ok(None) => return false,
            Err(e) => {
                warn!(
                    "Worker {}: protocol violation from {}: {}",
                    worker,
                    origin.channel.peer_addr(),
                    e
                );
                return true;
            }
        }
    }
}

/// Route one packet. Returns `true` when the origin must be retired.
async fn dispatch_packet(origin: &mut Origin, packet: Packet, hooks: &PacketHooks) -> bool {
    match packet.kind {
        PacketKind::Handshake => {
            match origin.authenticator.as_mut() {
                Some(authenticator) => {
                    if authenticator.on_packet(packet).await {
                        // Finished; the outcome traveled over the
                        // manager's event queue. A handshake that ended
                        // without authenticating closes the origin.
                        origin.authenticator = None;
                        return !origin.channel.is_authenticated();
                    }
                }
                None => {
                    debug!(
                        "Ignoring handshake packet from {} outside a handshake",
                        origin.channel.peer_addr()
                    );
                }
            }
            false
        }
        PacketKind::Ack => {
            if !origin.channel.is_authenticated() {
                warn!(
                    "Ack before authentication from {}",
                    origin.channel.peer_addr()
                );
                return true;
            }
            hooks.acks.send(packet.attempt_id).ok();
            false
        }
        PacketKind::Data => {
            if !origin.channel.is_authenticated() {
                warn!(
                    "Data before authentication from {}",
                    origin.channel.peer_addr()
                );
                return true;
            }
            let Some(peer) = origin.channel.peer() else {
                return true;
            };

            let listener = hooks
                .receive
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            match listener {
                Some(listener) => {
                    listener(peer, packet.payload);
                    // Ack after the listener returns: an ack means the
                    // payload reached the application.
                    origin
                        .channel
                        .write_packet(&Packet::ack(packet.attempt_id))
                        .await
                        .ok();
                }
                None => {
                    warn!(
                        "No receive listener registered, dropping {} bytes from {}",
                        packet.payload.len(),
                        peer
                    );
                }
            }
            false
        }
    }
}

async fn retire_origin(mut origin: Origin, hooks: &PacketHooks) {
    origin.channel.close().await;
    if let Some(authenticator) = origin.authenticator.as_mut() {
        authenticator.on_close().await;
    }
    hooks.closures.send(origin.channel.clone()).ok();
}
