//! Ping framing for `-ping` ALPN variants.
//!
//! Wraps a byte stream in length-delimited frames that intermix ping and
//! data so middleboxes don't idle out long-lived tunnels. The receiver
//! discards ping frames; both ends may send them.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio_util::codec::LengthDelimitedCodec;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::frame::BUFSIZE;

const TAG_DATA: u8 = 0;
const TAG_PING: u8 = 1;

/// Wrap `io` in ping framing. The returned stream carries the payload
/// bytes; the framing and keepalive traffic stay inside the driver task.
pub fn wrap<S>(io: S, ping_interval: Duration, cancel: CancellationToken) -> DuplexStream
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (local, remote) = tokio::io::duplex(BUFSIZE);
    let framed = LengthDelimitedCodec::builder()
        .max_frame_length(BUFSIZE + 16)
        .new_framed(io);
    let (mut sink, mut frames) = framed.split();
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ping_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut buf = vec![0u8; BUFSIZE];

        loop {
            tokio::select! {
                frame = frames.next() => {
                    let Some(Ok(frame)) = frame else { break };
                    match frame.first().copied() {
                        Some(TAG_DATA) => {
                            if remote_write.write_all(&frame[1..]).await.is_err() {
                                break;
                            }
                        }
                        Some(TAG_PING) => trace!("ping frame"),
                        _ => {
                            debug!("malformed ping-framing frame");
                            break;
                        }
                    }
                }
                read = remote_read.read(&mut buf) => {
                    match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let mut frame = BytesMut::with_capacity(n + 1);
                            frame.put_u8(TAG_DATA);
                            frame.extend_from_slice(&buf[..n]);
                            if sink.send(frame.freeze()).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                _ = ticker.tick() => {
                    if sink.send(Bytes::from_static(&[TAG_PING])).await.is_err() {
                        break;
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    });

    local
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test(tokio::test)]
    async fn data_passes_while_pings_flow() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let cancel = CancellationToken::new();

        // a short interval so pings actually interleave with the data
        let mut left = wrap(a, Duration::from_millis(5), cancel.child_token());
        let mut right = wrap(b, Duration::from_millis(7), cancel.child_token());

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            loop {
                match right.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if right.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        for round in 0..5u8 {
            tokio::time::sleep(Duration::from_millis(10)).await;

            let payload = vec![round; 512];
            left.write_all(&payload).await.unwrap();

            let mut response = vec![0u8; payload.len()];
            left.read_exact(&mut response).await.unwrap();
            assert_eq!(payload, response);
        }

        cancel.cancel();
    }
}
