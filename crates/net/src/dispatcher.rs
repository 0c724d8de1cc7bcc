//! Message attempt tracking and asynchronous delivery resolution.
//!
//! `send` allocates a strictly increasing attempt id, records the attempt,
//! writes the payload through the destination's channel, and arms the
//! shared timer. Every attempt reaches exactly one terminal outcome:
//! `Acknowledged` when the matching ack arrives, `Failed` when the channel
//! cannot be obtained, the write fails, or the channel closes with the
//! attempt in flight, and `TimedOut` when the timer sweep finds the
//! deadline passed. Outcomes reach the caller through the registered
//! delivery listener.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use veil_types::{DeliveryOutcome, Identifier};

use super::channel::MessageChannel;
use super::config::NetConfig;
use super::manager::ConnectionManager;
use super::packet::Packet;
use super::waker::Waker;

/// Callback receiving each attempt's terminal outcome, keyed by the
/// attempt id and the destination it was addressed to.
pub type DeliveryListener = Arc<dyn Fn(u64, Identifier, DeliveryOutcome) + Send + Sync>;

struct AttemptRecord {
    destination: Identifier,
    payload: Vec<u8>,
    sent_at: Instant,
    timeout: Duration,
    /// The channel the payload went out on, once written. Used to fail
    /// the attempt if that channel closes before the ack arrives.
    channel: Option<Arc<MessageChannel>>,
}

pub struct Dispatcher {
    attempts: Mutex<HashMap<u64, AttemptRecord>>,
    next_id: AtomicU64,
    waker: Waker,
    manager: Arc<ConnectionManager>,
    delivery: RwLock<Option<DeliveryListener>>,
    default_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Build the dispatcher and start its consumer tasks: timer releases,
    /// acknowledgment ids from the workers, and channel closures.
    pub fn spawn(
        config: &NetConfig,
        manager: Arc<ConnectionManager>,
        mut acks: mpsc::UnboundedReceiver<u64>,
        mut closures: mpsc::UnboundedReceiver<Arc<MessageChannel>>,
    ) -> Arc<Self> {
        let (waker, mut releases) = Waker::spawn();
        let dispatcher = Arc::new(Self {
            attempts: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            waker,
            manager,
            delivery: RwLock::new(None),
            default_timeout: config.default_timeout(),
            tasks: Mutex::new(Vec::new()),
        });

        let on_release = dispatcher.clone();
        let release_task = tokio::spawn(async move {
            while releases.recv().await.is_some() {
                on_release.sweep();
            }
        });
        let on_ack = dispatcher.clone();
        let ack_task = tokio::spawn(async move {
            while let Some(id) = acks.recv().await {
                on_ack.resolve(id, DeliveryOutcome::Acknowledged);
            }
        });
        let on_closure = dispatcher.clone();
        let closure_task = tokio::spawn(async move {
            while let Some(channel) = closures.recv().await {
                on_closure.fail_channel(&channel);
            }
        });
        *dispatcher
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = vec![release_task, ack_task, closure_task];

        dispatcher
    }

    /// Register the callback that receives every terminal outcome.
    pub fn set_delivery_listener(&self, listener: DeliveryListener) {
        *self.delivery.write().unwrap_or_else(|e| e.into_inner()) = Some(listener);
    }

    pub async fn send(&self, destination: Identifier, payload: Vec<u8>) -> u64 {
        self.send_with_timeout(destination, payload, self.default_timeout)
            .await
    }

    /// Record and write one attempt. Returns its id immediately; the
    /// outcome arrives later through the delivery listener. Obtaining the
    /// channel may block this caller on an in-flight handshake, never the
    /// workers.
    pub async fn send_with_timeout(
        &self,
        destination: Identifier,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut attempts = self.lock_attempts();
            attempts.insert(
                id,
                AttemptRecord {
                    destination,
                    payload: payload.clone(),
                    sent_at: Instant::now(),
                    timeout,
                    channel: None,
                },
            );
        }
        debug!(
            "Attempt {} to {}: {} bytes, timeout {:?}",
            id,
            destination,
            payload.len(),
            timeout
        );

        let channel = match self.manager.channel(destination).await {
            Ok(channel) => channel,
            Err(e) => {
                // No channel, no timer: resolve on the spot.
                self.resolve(id, DeliveryOutcome::Failed(e.to_string()));
                return id;
            }
        };

        if let Err(e) = channel.write_packet(&Packet::data(id, payload)).await {
            self.resolve(id, DeliveryOutcome::Failed(e.to_string()));
            return id;
        }

        {
            let mut attempts = self.lock_attempts();
            if let Some(record) = attempts.get_mut(&id) {
                record.channel = Some(channel);
            }
        }
        self.waker.wake(timeout);
        id
    }

    /// Attempts still awaiting a terminal outcome.
    pub fn pending_attempts(&self) -> usize {
        self.lock_attempts().len()
    }

    /// Resolve every outstanding attempt as failed. Called at shutdown.
    pub fn fail_all(&self, reason: &str) {
        let ids: Vec<u64> = self.lock_attempts().keys().copied().collect();
        for id in ids {
            self.resolve(id, DeliveryOutcome::Failed(reason.to_string()));
        }
    }

    /// Stop the consumer tasks and fail whatever is still pending.
    pub fn shutdown(&self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
        self.fail_all("endpoint shut down");
    }

    /// Resolve an attempt exactly once. Resolutions for unknown or
    /// already-resolved ids are ignored, which makes duplicate acks
    /// harmless.
    fn resolve(&self, id: u64, outcome: DeliveryOutcome) {
        let record = {
            let mut attempts = self.lock_attempts();
            attempts.remove(&id)
        };
        let Some(record) = record else {
            debug!("Ignoring resolution for unknown attempt {}", id);
            return;
        };

        debug!(
            "Attempt {} to {} resolved after {:?}: {}",
            id,
            record.destination,
            record.sent_at.elapsed(),
            outcome
        );
        let listener = self
            .delivery
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match listener {
            Some(listener) => listener(id, record.destination, outcome),
            None => debug!("No delivery listener registered for attempt {}", id),
        }
    }

    /// One timer sweep: resolve every attempt past its deadline, then
    /// re-arm for the nearest remaining deadline. The timer ignores wake
    /// requests while armed, so re-arming here after every sweep is what
    /// keeps later deadlines covered.
    fn sweep(&self) {
        let now = Instant::now();
        let (due, nearest) = {
            let attempts = self.lock_attempts();
            let mut due = Vec::new();
            let mut nearest: Option<Duration> = None;
            for (id, record) in attempts.iter() {
                let deadline = record.sent_at + record.timeout;
                if deadline <= now {
                    due.push(*id);
                } else {
                    let wait = deadline - now;
                    nearest = Some(match nearest {
                        Some(current) if current <= wait => current,
                        _ => wait,
                    });
                }
            }
            (due, nearest)
        };

        for id in due {
            self.resolve(id, DeliveryOutcome::TimedOut);
        }
        if let Some(wait) = nearest {
            self.waker.wake(wait);
        }
    }

    /// Fail every attempt whose payload went out on the closed channel.
    /// Attempts written on a different channel to the same peer stay
    /// armed.
    fn fail_channel(&self, channel: &Arc<MessageChannel>) {
        let due: Vec<u64> = {
            let attempts = self.lock_attempts();
            attempts
                .iter()
                .filter(|(_, record)| {
                    matches!(&record.channel, Some(written) if Arc::ptr_eq(written, channel))
                })
                .map(|(id, _)| *id)
                .collect()
        };
        if due.is_empty() {
            return;
        }

        debug!(
            "Channel to {} closed with {} attempts in flight",
            channel.peer_addr(),
            due.len()
        );
        for id in due {
            self.resolve(
                id,
                DeliveryOutcome::Failed("channel closed before acknowledgment".to_string()),
            );
        }
    }

    fn lock_attempts(&self) -> MutexGuard<'_, HashMap<u64, AttemptRecord>> {
        self.attempts.lock().unwrap_or_else(|e| e.into_inner())
    }
}
