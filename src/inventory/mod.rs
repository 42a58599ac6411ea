//! The inventory control stream.
//!
//! A single bidirectional message stream between each agent and the auth
//! service carries hello, heartbeat, ping/pong and downstream command
//! messages. Exactly one stream is active per (agent, auth) pair; a
//! reconnecting agent must open with a fresh hello. Schema evolution is by
//! tagged fields, unknown tags ignored.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fnv::FnvHashMap;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use drawbridge_domain::resource::Server;
use drawbridge_domain::{GatewayError, GatewayResult};
use drawbridge_tunnel::retry::Backoff;

const MAX_MESSAGE: usize = 256 * 1024;
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(60);
const PONG_GRACE: u32 = 3;

/// Agent → auth
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpstreamMessage {
    Hello {
        server_id: String,
        version: String,
        node_name: String,
    },
    /// Announce the resource's presence and current spec
    Heartbeat { server: Server },
    Pong { id: u64 },
    Goodbye,
    #[serde(other)]
    Unknown,
}

/// Auth → agent
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DownstreamMessage {
    Hello { cluster: String, version: String },
    Ping { id: u64 },
    #[serde(other)]
    Unknown,
}

fn encode<T: Serialize>(msg: &T) -> GatewayResult<Bytes> {
    serde_json::to_vec(msg)
        .map(Bytes::from)
        .map_err(|err| GatewayError::InvalidArgument(format!("control message: {err}")))
}

fn framed<S: AsyncRead + AsyncWrite>(io: S) -> Framed<S, LengthDelimitedCodec> {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_MESSAGE)
        .new_framed(io)
}

/// What the auth side does with announces
pub trait AnnounceSink: Send + Sync + 'static {
    fn announce(&self, server: Server) -> impl Future<Output = GatewayResult<()>> + Send;
}

/// Tracks the one-active-stream-per-agent invariant on the auth side
#[derive(Clone, Default)]
pub struct InventoryRegistry {
    active: Arc<Mutex<FnvHashMap<String, (u64, CancellationToken)>>>,
    next_generation: Arc<std::sync::atomic::AtomicU64>,
}

impl InventoryRegistry {
    /// Register a fresh stream for `server_id`, displacing any previous one.
    /// Returns the registration generation used to unregister.
    fn register(&self, server_id: &str, cancel: CancellationToken) -> u64 {
        let generation = self
            .next_generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let mut active = self.active.lock().expect("inventory lock");
        if let Some((_, previous)) = active.insert(server_id.to_string(), (generation, cancel)) {
            debug!(server_id, "displacing previous control stream");
            previous.cancel();
        }
        generation
    }

    /// Remove our own registration; a newer stream's entry stays
    fn unregister(&self, server_id: &str, generation: u64) {
        let mut active = self.active.lock().expect("inventory lock");
        if matches!(active.get(server_id), Some((current, _)) if *current == generation) {
            active.remove(server_id);
        }
    }

    pub fn connected_count(&self) -> usize {
        self.active.lock().expect("inventory lock").len()
    }

    pub fn is_connected(&self, server_id: &str) -> bool {
        self.active
            .lock()
            .expect("inventory lock")
            .contains_key(server_id)
    }
}

/// Serve one inbound control stream on the auth side. Returns when the
/// stream ends, the agent misses too many pings, or a newer stream for the
/// same agent displaces this one.
pub async fn serve_stream<S, A>(
    io: S,
    registry: InventoryRegistry,
    sink: Arc<A>,
    cluster: String,
    cancel: CancellationToken,
) -> GatewayResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    A: AnnounceSink,
{
    let mut framed = framed(io);

    // the downstream must open with a fresh hello
    let hello = tokio::time::timeout(HELLO_TIMEOUT, framed.next())
        .await
        .map_err(|_| GatewayError::ConnectionProblem("control stream hello timeout".to_string()))?
        .ok_or_else(|| GatewayError::ConnectionProblem("control stream closed".to_string()))?
        .map_err(GatewayError::from)?;

    let (server_id, node_name) = match serde_json::from_slice(&hello) {
        Ok(UpstreamMessage::Hello {
            server_id,
            node_name,
            ..
        }) => (server_id, node_name),
        Ok(other) => {
            return Err(GatewayError::InvalidArgument(format!(
                "control stream must open with hello, got {other:?}"
            )))
        }
        Err(err) => {
            return Err(GatewayError::InvalidArgument(format!(
                "control stream hello: {err}"
            )))
        }
    };

    info!(server_id, node_name, "control stream established");
    let displaced = cancel.child_token();
    let generation = registry.register(&server_id, displaced.clone());

    framed
        .send(encode(&DownstreamMessage::Hello {
            cluster,
            version: env!("CARGO_PKG_VERSION").to_string(),
        })?)
        .await?;

    let mut ping_timer = tokio::time::interval(PING_INTERVAL);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_timer.tick().await; // first tick is immediate
    let mut ping_id: u64 = 0;
    let mut unanswered: u32 = 0;

    let result = loop {
        tokio::select! {
            message = framed.next() => {
                let Some(Ok(bytes)) = message else {
                    break Ok(());
                };
                match serde_json::from_slice::<UpstreamMessage>(&bytes) {
                    Ok(UpstreamMessage::Heartbeat { server }) => {
                        if let Err(err) = sink.announce(server).await {
                            warn!(?err, server_id, "announce failed");
                        }
                    }
                    Ok(UpstreamMessage::Pong { .. }) => {
                        unanswered = 0;
                    }
                    Ok(UpstreamMessage::Goodbye) => {
                        debug!(server_id, "agent said goodbye");
                        break Ok(());
                    }
                    Ok(UpstreamMessage::Hello { .. }) => {
                        break Err(GatewayError::InvalidArgument(
                            "duplicate hello on established stream".to_string(),
                        ));
                    }
                    Ok(UpstreamMessage::Unknown) => {}
                    Err(err) => debug!(?err, "undecodable upstream message ignored"),
                }
            }
            _ = ping_timer.tick() => {
                if unanswered >= PONG_GRACE {
                    break Err(GatewayError::ConnectionProblem(
                        "agent stopped answering pings".to_string(),
                    ));
                }
                ping_id += 1;
                unanswered += 1;
                if framed.send(encode(&DownstreamMessage::Ping { id: ping_id })?).await.is_err() {
                    break Ok(());
                }
            }
            _ = displaced.cancelled() => {
                debug!(server_id, "control stream displaced or shut down");
                break Ok(());
            }
        }
    };

    registry.unregister(&server_id, generation);
    result
}

/// A sender handle the heartbeat driver uses while the stream lives; `done`
/// fires when the underlying stream fails.
pub struct SenderHandle {
    tx: mpsc::Sender<UpstreamMessage>,
    pub done: CancellationToken,
}

impl SenderHandle {
    pub fn new(tx: mpsc::Sender<UpstreamMessage>, done: CancellationToken) -> Self {
        Self { tx, done }
    }

    pub async fn send(&self, message: UpstreamMessage) -> GatewayResult<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| GatewayError::ConnectionProblem("control stream gone".to_string()))
    }

    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }
}

/// Agent-side control stream client: maintains the connection with jittered
/// backoff and yields a fresh [SenderHandle] on every (re)connect, so
/// heartbeat drivers can await sender availability without busy-waiting.
pub fn spawn_client<C, Fut, S>(
    connect: C,
    hello: UpstreamMessage,
    offline_threshold: Duration,
    cancel: CancellationToken,
) -> mpsc::Receiver<SenderHandle>
where
    C: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = GatewayResult<S>> + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (handles_tx, handles_rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let mut backoff = Backoff::new(Duration::from_secs(1), offline_threshold / 2);

        loop {
            let io = tokio::select! {
                io = connect() => io,
                _ = cancel.cancelled() => return,
            };

            let mut framed = match io {
                Ok(io) => framed(io),
                Err(err) => {
                    let delay = backoff.next_delay();
                    debug!(?err, ?delay, "control stream connect failed");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = cancel.cancelled() => return,
                    }
                }
            };

            let opened = async {
                framed.send(encode(&hello)?).await?;
                GatewayResult::Ok(())
            }
            .await;
            if let Err(err) = opened {
                warn!(?err, "control stream hello failed");
                tokio::time::sleep(backoff.next_delay()).await;
                continue;
            }

            backoff.reset();

            let done = cancel.child_token();
            let (tx, mut rx) = mpsc::channel::<UpstreamMessage>(16);
            if handles_tx
                .send(SenderHandle {
                    tx,
                    done: done.clone(),
                })
                .await
                .is_err()
            {
                return;
            }

            loop {
                tokio::select! {
                    outgoing = rx.recv() => {
                        let Some(message) = outgoing else { break };
                        let Ok(bytes) = encode(&message) else { continue };
                        if framed.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    incoming = framed.next() => {
                        let Some(Ok(bytes)) = incoming else { break };
                        match serde_json::from_slice::<DownstreamMessage>(&bytes) {
                            Ok(DownstreamMessage::Ping { id }) => {
                                let Ok(pong) = encode(&UpstreamMessage::Pong { id }) else { continue };
                                if framed.send(pong).await.is_err() {
                                    break;
                                }
                            }
                            Ok(DownstreamMessage::Hello { cluster, .. }) => {
                                debug!(cluster, "control stream acknowledged");
                            }
                            Ok(DownstreamMessage::Unknown) => {}
                            Err(err) => debug!(?err, "undecodable downstream message ignored"),
                        }
                    }
                    _ = cancel.cancelled() => {
                        done.cancel();
                        return;
                    }
                }
            }

            done.cancel();
            info!("control stream lost, reconnecting");
        }
    });

    handles_rx
}
