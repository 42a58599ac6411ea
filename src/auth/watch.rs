//! The resource watcher contract.
//!
//! Subscribers get (i) an initial `Init` event, (ii) at-least-once delivery
//! of subsequent puts/deletes for their kinds, and (iii) a `Reset` sentinel
//! when the backend event feed was lost, after which they must re-list.
//! Ordering is preserved within one kind, not across kinds.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use drawbridge_backend::{Backend, BackendEvent};
use drawbridge_domain::resource::ResourceKind;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::resources::kind_from_key;

const SUBSCRIBER_CAPACITY: usize = 256;
const SLOW_SUBSCRIBER_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum WatchEvent {
    /// Always the first event on a fresh subscription
    Init,
    Put {
        kind: ResourceKind,
        name: String,
        value: Vec<u8>,
    },
    Delete {
        kind: ResourceKind,
        name: String,
    },
    /// The feed was interrupted; cached state must be rebuilt by re-listing
    Reset,
}

struct Subscriber {
    kinds: BTreeSet<ResourceKind>,
    sender: mpsc::Sender<WatchEvent>,
}

/// Fans backend mutation events out to typed subscribers. One pump task per
/// dispatcher keeps per-kind FIFO ordering.
#[derive(Clone)]
pub struct WatchDispatcher {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
}

impl WatchDispatcher {
    pub fn spawn<B: Backend>(backend: &B, cancel: CancellationToken) -> Self {
        let dispatcher = Self {
            subscribers: Arc::new(RwLock::new(vec![])),
        };

        tokio::spawn({
            let dispatcher = dispatcher.clone();
            let mut events = backend.events();
            async move {
                loop {
                    let event = tokio::select! {
                        event = events.recv() => event,
                        _ = cancel.cancelled() => {
                            info!("watch dispatcher shutting down");
                            return;
                        }
                    };

                    let Some(event) = event else {
                        // backend gone: tell everyone to re-list, then stop
                        dispatcher.broadcast(None, WatchEvent::Reset).await;
                        return;
                    };

                    match event {
                        BackendEvent::Put(item) => {
                            if let Some((kind, name)) = kind_from_key(&item.key) {
                                dispatcher
                                    .broadcast(
                                        Some(kind),
                                        WatchEvent::Put {
                                            kind,
                                            name,
                                            value: item.value,
                                        },
                                    )
                                    .await;
                            }
                        }
                        BackendEvent::Delete { key } => {
                            if let Some((kind, name)) = kind_from_key(&key) {
                                dispatcher
                                    .broadcast(Some(kind), WatchEvent::Delete { kind, name })
                                    .await;
                            }
                        }
                        BackendEvent::Lost => {
                            dispatcher.broadcast(None, WatchEvent::Reset).await;
                        }
                    }
                }
            }
        });

        dispatcher
    }

    /// Subscribe to the given kinds. The stream starts with `Init`; a
    /// closed stream means the subscription was dropped as too slow and
    /// must be re-established.
    pub fn subscribe(&self, kinds: impl IntoIterator<Item = ResourceKind>) -> WatchStream {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_CAPACITY);

        sender
            .try_send(WatchEvent::Init)
            .expect("fresh channel has capacity");

        self.subscribers
            .write()
            .expect("watch lock")
            .push(Subscriber {
                kinds: kinds.into_iter().collect(),
                sender,
            });

        WatchStream { receiver }
    }

    /// Deliver to interested subscribers, preserving order. A subscriber
    /// that stays full past the timeout is dropped: its closed stream is
    /// the signal to resubscribe.
    async fn broadcast(&self, kind: Option<ResourceKind>, event: WatchEvent) {
        let targets: Vec<mpsc::Sender<WatchEvent>> = {
            let subscribers = self.subscribers.read().expect("watch lock");
            subscribers
                .iter()
                .filter(|subscriber| match kind {
                    Some(kind) => subscriber.kinds.contains(&kind),
                    None => true,
                })
                .map(|subscriber| subscriber.sender.clone())
                .collect()
        };

        let mut dead: Vec<mpsc::Sender<WatchEvent>> = vec![];
        for sender in targets {
            match sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    debug!("slow watch subscriber, waiting with timeout");
                    if sender
                        .send_timeout(event, SLOW_SUBSCRIBER_TIMEOUT)
                        .await
                        .is_err()
                    {
                        warn!("dropping unresponsive watch subscriber");
                        dead.push(sender);
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(sender),
            }
        }

        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write().expect("watch lock");
            subscribers
                .retain(|subscriber| !dead.iter().any(|d| d.same_channel(&subscriber.sender)));
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().expect("watch lock").len()
    }
}

pub struct WatchStream {
    receiver: mpsc::Receiver<WatchEvent>,
}

impl WatchStream {
    /// `None` means the subscription is gone and must be re-established
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.receiver.recv().await
    }
}
