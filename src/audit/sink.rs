//! Buffered, at-least-once event delivery.
//!
//! Emitting never blocks request paths: events land in a bounded buffer a
//! background task drains into the sink. On overflow the oldest non-session
//! events are discarded and an `events_dropped` marker is recorded; session
//! events are never dropped.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use drawbridge_domain::GatewayResult;

use super::{AuditEvent, EmittedEvent};

const BUFFER_CAPACITY: usize = 4096;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const FLUSH_BATCH: usize = 256;

/// Storage for audit events; the blob/event store driver implements this.
pub trait AuditSink: Send + Sync + 'static {
    fn store(&self, batch: Vec<EmittedEvent>) -> impl Future<Output = GatewayResult<()>> + Send;
}

/// In-memory sink for single-process deployments and tests
#[derive(Clone, Default)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<EmittedEvent>>>,
}

impl MemoryAuditSink {
    pub fn events(&self) -> Vec<EmittedEvent> {
        self.events.lock().expect("audit sink lock").clone()
    }
}

impl AuditSink for MemoryAuditSink {
    async fn store(&self, batch: Vec<EmittedEvent>) -> GatewayResult<()> {
        self.events.lock().expect("audit sink lock").extend(batch);
        Ok(())
    }
}

struct Buffer {
    queue: VecDeque<EmittedEvent>,
    dropped: u64,
}

impl Buffer {
    fn push(&mut self, event: EmittedEvent) {
        let is_session_event = event.event.session_id().is_some();

        if self.queue.len() >= BUFFER_CAPACITY {
            // evict the oldest non-session event to make room
            let evictable = self
                .queue
                .iter()
                .position(|queued| queued.event.session_id().is_none());
            match (evictable, is_session_event) {
                (Some(idx), _) => {
                    self.queue.remove(idx);
                    self.dropped += 1;
                }
                (None, true) => {
                    // every buffered event belongs to a session; the buffer
                    // grows past its bound rather than lose one
                }
                (None, false) => {
                    self.dropped += 1;
                    return;
                }
            }
        }

        self.queue.push_back(event);
    }

    fn drain_batch(&mut self) -> Vec<EmittedEvent> {
        let mut batch = Vec::with_capacity(FLUSH_BATCH.min(self.queue.len() + 1));
        if self.dropped > 0 {
            batch.push(EmittedEvent::new(AuditEvent::EventsDropped {
                dropped: self.dropped,
            }));
            self.dropped = 0;
        }
        while batch.len() < FLUSH_BATCH {
            match self.queue.pop_front() {
                Some(event) => batch.push(event),
                None => break,
            }
        }
        batch
    }
}

/// Clonable handle components use to emit events
#[derive(Clone)]
pub struct AuditEmitter {
    buffer: Arc<Mutex<Buffer>>,
}

impl AuditEmitter {
    /// Spawn the drain task and return the emitter
    pub fn spawn<S: AuditSink>(sink: S, cancel: CancellationToken) -> Self {
        let buffer = Arc::new(Mutex::new(Buffer {
            queue: VecDeque::with_capacity(BUFFER_CAPACITY),
            dropped: 0,
        }));

        tokio::spawn({
            let buffer = buffer.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(FLUSH_INTERVAL) => {}
                        _ = cancel.cancelled() => {
                            // final flush
                            loop {
                                let batch = buffer.lock().expect("audit lock").drain_batch();
                                if batch.is_empty() {
                                    return;
                                }
                                if let Err(err) = sink.store(batch).await {
                                    error!(?err, "audit final flush failed");
                                    return;
                                }
                            }
                        }
                    }

                    loop {
                        let batch = buffer.lock().expect("audit lock").drain_batch();
                        if batch.is_empty() {
                            break;
                        }
                        let batch_len = batch.len();
                        if let Err(err) = sink.store(batch.clone()).await {
                            warn!(?err, batch_len, "audit sink store failed, requeueing");
                            // at-least-once: the batch goes back to the front
                            // in order and waits for the next flush
                            let mut buffer = buffer.lock().expect("audit lock");
                            for event in batch.into_iter().rev() {
                                buffer.queue.push_front(event);
                            }
                            break;
                        }
                        if batch_len < FLUSH_BATCH {
                            break;
                        }
                    }
                }
            }
        });

        Self { buffer }
    }

    pub fn emit(&self, event: AuditEvent) {
        self.buffer
            .lock()
            .expect("audit lock")
            .push(EmittedEvent::new(event));
    }
}
