//! A single agent: one control connection to one proxy, reconnected with
//! jittered exponential backoff on loss.

use std::sync::Arc;
use std::time::Duration;

use drawbridge_domain::cluster::ClusterName;
use drawbridge_tunnel::frame::ControlMsg;
use drawbridge_tunnel::mux::{self, MuxSide};
use drawbridge_tunnel::retry::{seventh_jitter, Backoff};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{AgentPoolConfig, DialHandler, TunnelTransport};

/// Base reconnect delay; the cap is half the offline threshold
const BACKOFF_BASE: Duration = Duration::from_secs(1);

pub(super) async fn run_agent<T, H>(
    addr: String,
    cluster: ClusterName,
    config: AgentPoolConfig,
    transport: Arc<T>,
    handler: Arc<H>,
    discovered_tx: mpsc::Sender<(ClusterName, Vec<String>)>,
    inventory: Option<mpsc::Sender<drawbridge_tunnel::mux::MuxStream>>,
    cancel: CancellationToken,
) where
    T: TunnelTransport,
    H: DialHandler,
{
    let mut backoff = Backoff::new(BACKOFF_BASE, config.offline_threshold / 2);

    loop {
        let io = tokio::select! {
            io = transport.connect(&addr) => io,
            _ = cancel.cancelled() => return,
        };

        let io = match io {
            Ok(io) => io,
            Err(err) => {
                let delay = backoff.next_delay();
                debug!(?err, %addr, ?delay, "agent connect failed");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue,
                    _ = cancel.cancelled() => return,
                }
            }
        };

        let conn_cancel = cancel.child_token();
        let (handle, mut incoming) = mux::spawn(io, MuxSide::Acceptor, conn_cancel.clone());

        let hello = ControlMsg::Hello {
            server_id: config.host_id.clone(),
            cluster: config.cluster.to_string(),
            conn_type: config.conn_type,
        };
        if handle.send_control(&hello).await.is_err() {
            conn_cancel.cancel();
            tokio::time::sleep(backoff.next_delay()).await;
            continue;
        }
        // promote the connection to ready right away
        if handle.send_control(&ControlMsg::Heartbeat).await.is_err() {
            conn_cancel.cancel();
            tokio::time::sleep(backoff.next_delay()).await;
            continue;
        }

        info!(%addr, %cluster, "agent connected");
        backoff.reset();

        // the control plane reaches this agent's inventory channel through
        // a stream the agent opens
        if let Some(inventory) = &inventory {
            match handle.open().await {
                Ok(mut stream) => {
                    let request = drawbridge_tunnel::dial::DialRequest {
                        target: drawbridge_tunnel::dial::INVENTORY_TARGET.to_string(),
                        conn_type: config.conn_type,
                        principals: vec![],
                        client_addr: None,
                    };
                    if drawbridge_tunnel::dial::write_request(&mut stream, &request)
                        .await
                        .is_ok()
                    {
                        let _ = inventory.send(stream).await;
                    }
                }
                Err(err) => debug!(?err, "inventory stream open failed"),
            }
        }

        loop {
            let heartbeat_in = seventh_jitter(config.heartbeat_interval);
            tokio::select! {
                _ = tokio::time::sleep(heartbeat_in) => {
                    if handle.send_control(&ControlMsg::Heartbeat).await.is_err() {
                        break;
                    }
                }
                stream = incoming.streams.recv() => {
                    let Some(mut stream) = stream else { break };
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        match drawbridge_tunnel::dial::read_request(&mut stream).await {
                            Ok(request) => handler.handle(request, stream).await,
                            Err(err) => debug!(?err, "bad dial preamble"),
                        }
                    });
                }
                control = incoming.control.recv() => {
                    match control {
                        Some(ControlMsg::DiscoveryRequest { proxies }) => {
                            let names: Vec<String> = proxies
                                .into_iter()
                                .map(|proxy| proxy.metadata.name)
                                .collect();
                            debug!(?names, "discovery request received");
                            let _ = discovered_tx.send((cluster.clone(), names)).await;
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
                _ = cancel.cancelled() => {
                    conn_cancel.cancel();
                    return;
                }
            }
        }

        conn_cancel.cancel();
        info!(%addr, "agent connection lost, backing off");

        tokio::select! {
            _ = tokio::time::sleep(backoff.next_delay()) => {}
            _ = cancel.cancelled() => return,
        }
    }
}
