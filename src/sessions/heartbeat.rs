//! Resource heartbeats (v2).
//!
//! The driver abstracts what is announced; the manager runs the intervals
//! and the stream-available/fallback mode switch. The `should_announce`
//! latch is set by an interval firing, a poll diff, or an explicit force;
//! only a successful announce clears it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use drawbridge_domain::GatewayResult;
use drawbridge_tunnel::retry::seventh_jitter;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::inventory::SenderHandle;

#[derive(Clone, Debug)]
pub struct HeartbeatConfig {
    /// How often the driver's snapshot is diffed against the last announce
    pub poll_interval: Duration,
    /// Forced announce cadence even when nothing changed
    pub announce_interval: Duration,
    /// Degraded-state check cadence, the server keep-alive TTL
    pub degraded_check: Duration,
    /// Backoff between fallback announces while the stream is unavailable
    pub fallback_backoff: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5 * 60),
            announce_interval: Duration::from_secs(6 * 60 + 40),
            degraded_check: Duration::from_secs(10 * 60),
            fallback_backoff: Duration::from_secs(60),
        }
    }
}

pub trait HeartbeatDriver: Send + Sync + 'static {
    /// Whether the current snapshot differs from the last announced one
    fn poll(&self) -> impl Future<Output = GatewayResult<bool>> + Send;

    /// Announce over the control stream
    fn announce(&self, sender: &SenderHandle) -> impl Future<Output = GatewayResult<()>> + Send;

    /// Announce over the fallback path (direct backend write)
    fn fallback_announce(&self) -> impl Future<Output = GatewayResult<()>> + Send;
}

pub struct HeartbeatHandle {
    force_tx: mpsc::Sender<()>,
    degraded_rx: watch::Receiver<bool>,
}

impl HeartbeatHandle {
    /// Latch an announce regardless of intervals
    pub fn force_send(&self) {
        let _ = self.force_tx.try_send(());
    }

    pub fn is_degraded(&self) -> bool {
        *self.degraded_rx.borrow()
    }

    pub fn degraded_signal(&self) -> watch::Receiver<bool> {
        self.degraded_rx.clone()
    }
}

pub fn spawn<D: HeartbeatDriver>(
    driver: Arc<D>,
    mut senders: mpsc::Receiver<SenderHandle>,
    config: HeartbeatConfig,
    cancel: CancellationToken,
) -> HeartbeatHandle {
    let (force_tx, mut force_rx) = mpsc::channel(1);
    let (degraded_tx, degraded_rx) = watch::channel(false);

    tokio::spawn(async move {
        let mut sender: Option<SenderHandle> = None;
        let mut should_announce = false;
        let mut first_poll = true;

        let now = Instant::now();
        // the first poll runs immediately and is forced to report a change;
        // the fallback path waits out its backoff so a freshly-arriving
        // stream sender gets first claim on the announce
        let mut next_poll = now;
        let mut next_announce = now + seventh_jitter(config.announce_interval);
        let mut next_degraded = now + config.degraded_check;
        let mut next_fallback = now + seventh_jitter(config.fallback_backoff);

        loop {
            // a healthy sender is one whose stream has not failed
            if sender.as_ref().map(|s| s.is_done()).unwrap_or(false) {
                sender = None;
            }

            if should_announce {
                match &sender {
                    Some(handle) => match driver.announce(handle).await {
                        Ok(()) => {
                            trace!("announced over the control stream");
                            should_announce = false;
                            let _ = degraded_tx.send(false);
                        }
                        Err(err) => warn!(?err, "announce failed"),
                    },
                    None if Instant::now() >= next_fallback => {
                        match driver.fallback_announce().await {
                            Ok(()) => {
                                trace!("announced over the fallback path");
                                should_announce = false;
                            }
                            Err(err) => warn!(?err, "fallback announce failed"),
                        }
                        next_fallback = Instant::now() + seventh_jitter(config.fallback_backoff);
                    }
                    None => {}
                }
            }

            tokio::select! {
                _ = tokio::time::sleep_until(next_poll) => {
                    let changed = match driver.poll().await {
                        Ok(changed) => changed,
                        Err(err) => {
                            debug!(?err, "poll failed, assuming a change");
                            true
                        }
                    };
                    if changed || first_poll {
                        should_announce = true;
                    }
                    first_poll = false;
                    next_poll = Instant::now() + seventh_jitter(config.poll_interval);
                }
                _ = tokio::time::sleep_until(next_announce) => {
                    should_announce = true;
                    next_announce = Instant::now() + seventh_jitter(config.announce_interval);
                }
                // wake for the fallback path when an announce is pending
                // without a stream
                _ = tokio::time::sleep_until(next_fallback),
                    if should_announce && sender.is_none() => {}
                _ = tokio::time::sleep_until(next_degraded) => {
                    let healthy = sender.as_ref().map(|s| !s.is_done()).unwrap_or(false);
                    if !healthy && !should_announce {
                        let _ = degraded_tx.send(true);
                    }
                    next_degraded = Instant::now() + config.degraded_check;
                }
                fresh = senders.recv() => {
                    match fresh {
                        Some(handle) => {
                            debug!("control stream sender available");
                            sender = Some(handle);
                        }
                        None => return,
                    }
                }
                _ = force_rx.recv() => {
                    should_announce = true;
                }
                _ = cancel.cancelled() => return,
            }
        }
    });

    HeartbeatHandle {
        force_tx,
        degraded_rx,
    }
}
