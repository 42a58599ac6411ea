//! Stream multiplexer over a single tunnel connection.
//!
//! Both ends exchange [TunnelFrame]s; each multiplexed stream surfaces as a
//! plain `AsyncRead + AsyncWrite` duplex handle. The initiator allocates odd
//! stream ids, the acceptor even ones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::LengthDelimitedCodec;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::frame::{ControlMsg, TunnelFrame, BUFSIZE, MAX_FRAME};
use crate::{TunnelError, TunnelResult};

pub type MuxStream = DuplexStream;

const OUTBOUND_CAPACITY: usize = 64;
const INCOMING_CAPACITY: usize = 32;

#[derive(Clone, Copy, Debug)]
pub enum MuxSide {
    /// Opens streams with odd ids (the proxy side dials back through these)
    Initiator,
    /// Opens streams with even ids
    Acceptor,
}

struct Shared {
    outbound: mpsc::Sender<TunnelFrame>,
    streams: Mutex<HashMap<u32, WriteHalf<DuplexStream>>>,
    next_id: AtomicU32,
    cancel: CancellationToken,
}

impl Shared {
    async fn register(self: &Arc<Self>, id: u32) -> MuxStream {
        let (local, remote) = tokio::io::duplex(BUFSIZE);
        let (read_half, write_half) = tokio::io::split(remote);

        self.streams.lock().await.insert(id, write_half);
        tokio::spawn(forward_outbound(
            id,
            read_half,
            self.outbound.clone(),
            self.cancel.clone(),
        ));

        local
    }
}

/// Clonable sending side of a multiplexed connection
#[derive(Clone)]
pub struct MuxHandle {
    inner: Arc<Shared>,
}

impl MuxHandle {
    /// Open a new stream towards the remote end
    pub async fn open(&self) -> TunnelResult<MuxStream> {
        let id = self.inner.next_id.fetch_add(2, Ordering::Relaxed);

        // register before the Open frame can be answered
        let stream = self.inner.register(id).await;

        if self
            .inner
            .outbound
            .send(TunnelFrame::Open { id })
            .await
            .is_err()
        {
            self.inner.streams.lock().await.remove(&id);
            return Err(TunnelError::Closed);
        }

        Ok(stream)
    }

    pub async fn send_control(&self, msg: &ControlMsg) -> TunnelResult<()> {
        self.inner
            .outbound
            .send(TunnelFrame::control(msg)?)
            .await
            .map_err(|_| TunnelError::Closed)
    }

    /// Fires when the underlying connection is gone
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}

/// Receiving side: remotely-opened streams and control messages
pub struct MuxIncoming {
    pub streams: mpsc::Receiver<MuxStream>,
    pub control: mpsc::Receiver<ControlMsg>,
}

/// Drive a multiplexed connection over `io`. The returned handle and
/// incoming halves stay usable until `cancel` fires or the transport fails.
pub fn spawn<S>(io: S, side: MuxSide, cancel: CancellationToken) -> (MuxHandle, MuxIncoming)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let framed = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME + 256)
        .new_framed(io);
    let (mut sink, mut frames) = framed.split();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<TunnelFrame>(OUTBOUND_CAPACITY);
    let (streams_tx, streams_rx) = mpsc::channel::<MuxStream>(INCOMING_CAPACITY);
    let (control_tx, control_rx) = mpsc::channel::<ControlMsg>(INCOMING_CAPACITY);

    let shared = Arc::new(Shared {
        outbound: outbound_tx,
        streams: Mutex::new(HashMap::new()),
        next_id: AtomicU32::new(match side {
            MuxSide::Initiator => 1,
            MuxSide::Acceptor => 2,
        }),
        cancel: cancel.clone(),
    });

    // writer: drain outbound frames into the transport
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            loop {
                tokio::select! {
                    frame = outbound_rx.recv() => {
                        let Some(frame) = frame else { break };
                        let bytes = match frame.encode() {
                            Ok(bytes) => bytes,
                            Err(err) => {
                                warn!(?err, "unencodable tunnel frame");
                                continue;
                            }
                        };
                        if let Err(err) = sink.send(Bytes::from(bytes)).await {
                            debug!(?err, "tunnel write failed");
                            break;
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            cancel.cancel();
        }
    });

    // reader: dispatch inbound frames to streams and control
    tokio::spawn({
        let shared = shared.clone();
        let cancel = cancel.clone();
        async move {
            loop {
                let frame = tokio::select! {
                    frame = frames.next() => frame,
                    _ = cancel.cancelled() => break,
                };

                let Some(Ok(bytes)) = frame else { break };
                let frame = match TunnelFrame::decode(&bytes) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(?err, "undecodable tunnel frame");
                        break;
                    }
                };

                match frame {
                    TunnelFrame::Control(payload) => match ControlMsg::from_json(&payload) {
                        Ok(msg) => {
                            if control_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(?err, "undecodable control message"),
                    },
                    TunnelFrame::Open { id } => {
                        let stream = shared.register(id).await;
                        if streams_tx.send(stream).await.is_err() {
                            break;
                        }
                    }
                    TunnelFrame::Data { id, payload } => {
                        let mut streams = shared.streams.lock().await;
                        if let Some(write_half) = streams.get_mut(&id) {
                            if write_half.write_all(&payload).await.is_err() {
                                streams.remove(&id);
                            }
                        } else {
                            debug!(id, "data frame for unknown stream");
                        }
                    }
                    TunnelFrame::Close { id } => {
                        // dropping the write half signals EOF to the local reader
                        shared.streams.lock().await.remove(&id);
                    }
                }
            }
            cancel.cancel();
        }
    });

    (
        MuxHandle { inner: shared },
        MuxIncoming {
            streams: streams_rx,
            control: control_rx,
        },
    )
}

async fn forward_outbound(
    id: u32,
    mut read_half: ReadHalf<DuplexStream>,
    outbound: mpsc::Sender<TunnelFrame>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; BUFSIZE];
    loop {
        let read = tokio::select! {
            read = read_half.read(&mut buf) => read,
            _ = cancel.cancelled() => break,
        };

        match read {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let frame = TunnelFrame::Data {
                    id,
                    payload: buf[..n].to_vec(),
                };
                if outbound.send(frame).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = outbound.send(TunnelFrame::Close { id }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use drawbridge_domain::resource::ConnectionType;

    #[test_log::test(tokio::test)]
    async fn stream_roundtrip_over_loopback() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let cancel = CancellationToken::new();

        let (proxy, _proxy_in) = spawn(a, MuxSide::Initiator, cancel.child_token());
        let (_agent, mut agent_in) = spawn(b, MuxSide::Acceptor, cancel.child_token());

        // agent side echoes every accepted stream
        tokio::spawn(async move {
            while let Some(mut stream) = agent_in.streams.recv().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        let mut stream = proxy.open().await.unwrap();
        stream.write_all(b"hello through the tunnel").await.unwrap();

        let mut response = vec![0u8; b"hello through the tunnel".len()];
        stream.read_exact(&mut response).await.unwrap();
        assert_eq!(b"hello through the tunnel".as_slice(), response.as_slice());

        cancel.cancel();
    }

    #[test_log::test(tokio::test)]
    async fn concurrent_streams_do_not_interleave_payloads() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let cancel = CancellationToken::new();

        let (proxy, _proxy_in) = spawn(a, MuxSide::Initiator, cancel.child_token());
        let (_agent, mut agent_in) = spawn(b, MuxSide::Acceptor, cancel.child_token());

        tokio::spawn(async move {
            while let Some(mut stream) = agent_in.streams.recv().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        let mut handles = vec![];
        for i in 0..4u8 {
            let proxy = proxy.clone();
            handles.push(tokio::spawn(async move {
                let mut stream = proxy.open().await.unwrap();
                let payload = vec![i; 2048];
                stream.write_all(&payload).await.unwrap();

                let mut response = vec![0u8; payload.len()];
                stream.read_exact(&mut response).await.unwrap();
                assert_eq!(payload, response);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        cancel.cancel();
    }

    #[test_log::test(tokio::test)]
    async fn control_messages_pass_through() {
        let (a, b) = tokio::io::duplex(16 * 1024);
        let cancel = CancellationToken::new();

        let (proxy, mut proxy_in) = spawn(a, MuxSide::Initiator, cancel.child_token());
        let (agent, _agent_in) = spawn(b, MuxSide::Acceptor, cancel.child_token());

        agent
            .send_control(&ControlMsg::Hello {
                server_id: "agent-1".to_string(),
                cluster: "root".to_string(),
                conn_type: ConnectionType::Node,
            })
            .await
            .unwrap();

        match proxy_in.control.recv().await.unwrap() {
            ControlMsg::Hello { server_id, .. } => assert_eq!("agent-1", server_id),
            other => panic!("unexpected control message {other:?}"),
        }

        proxy.send_control(&ControlMsg::Heartbeat).await.unwrap();
        drop(proxy);
        cancel.cancel();
    }

    #[test_log::test(tokio::test)]
    async fn transport_loss_cancels_the_connection() {
        let (a, b) = tokio::io::duplex(16 * 1024);
        let cancel = CancellationToken::new();

        let (proxy, _proxy_in) = spawn(a, MuxSide::Initiator, cancel.child_token());
        drop(b);

        // the handle observes closure once the transport goes away
        proxy.send_control(&ControlMsg::Heartbeat).await.ok();
        proxy.cancellation().cancelled().await;
        assert!(proxy.is_closed());
    }
}
