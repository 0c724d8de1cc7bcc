//! Deferred-alarm primitive driving timeout detection.
//!
//! One dedicated timer task owns the alarm state; callers only signal
//! intent over a queue. Arming while an alarm is already pending is a
//! no-op (the request is coalesced away), so there is exactly one release
//! per armed alarm. The dispatcher compensates by re-arming for the
//! nearest remaining deadline after every sweep.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

/// Handle for requesting a deferred release signal.
#[derive(Clone)]
pub struct Waker {
    tx: mpsc::UnboundedSender<Duration>,
}

impl Waker {
    /// Spawn the timer task. Releases arrive on the returned receiver;
    /// the task exits when every handle is dropped or the receiver goes
    /// away.
    pub fn spawn() -> (Self, mpsc::UnboundedReceiver<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Duration>();
        let (release_tx, release_rx) = mpsc::unbounded_channel::<()>();

        tokio::spawn(async move {
            loop {
                let Some(delay) = rx.recv().await else {
                    break;
                };

                let sleep = tokio::time::sleep(delay);
                tokio::pin!(sleep);
                loop {
                    tokio::select! {
                        _ = &mut sleep => {
                            if release_tx.send(()).is_err() {
                                return;
                            }
                            break;
                        }
                        extra = rx.recv() => {
                            match extra {
                                // Already armed: the request is ignored.
                                Some(ignored) => {
                                    debug!("Waker already armed, ignoring {:?}", ignored);
                                }
                                None => return,
                            }
                        }
                    }
                }
            }
        });

        (Self { tx }, release_rx)
    }

    /// Request a release after `delay`. No-op while an alarm is pending.
    pub fn wake(&self, delay: Duration) {
        self.tx.send(delay).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Instant};

    #[tokio::test]
    async fn test_release_fires_after_delay() {
        let (waker, mut releases) = Waker::spawn();
        let start = Instant::now();
        waker.wake(Duration::from_millis(20));

        timeout(Duration::from_millis(500), releases.recv())
            .await
            .expect("release should fire")
            .expect("timer task alive");
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_overlapping_requests_coalesce() {
        let (waker, mut releases) = Waker::spawn();
        waker.wake(Duration::from_millis(100));
        waker.wake(Duration::from_millis(50));

        // Wait long enough for both hypothetical alarms.
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(releases.try_recv().is_ok(), "one release expected");
        assert!(releases.try_recv().is_err(), "second request must coalesce");
    }

    #[tokio::test]
    async fn test_rearms_after_release() {
        let (waker, mut releases) = Waker::spawn();

        waker.wake(Duration::from_millis(10));
        timeout(Duration::from_millis(500), releases.recv())
            .await
            .expect("first release")
            .expect("timer task alive");

        waker.wake(Duration::from_millis(10));
        timeout(Duration::from_millis(500), releases.recv())
            .await
            .expect("second release")
            .expect("timer task alive");
    }

    #[tokio::test]
    async fn test_task_exits_when_handles_drop() {
        let (waker, mut releases) = Waker::spawn();
        drop(waker);
        let got = timeout(Duration::from_millis(500), releases.recv())
            .await
            .expect("receiver should close");
        assert!(got.is_none());
    }
}
