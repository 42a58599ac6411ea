//! The reverse-tunnel server: terminates inbound control connections from
//! edge agents and groups them into logical sites.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use drawbridge_domain::cluster::ClusterName;
use drawbridge_domain::resource::ConnectionType;
use drawbridge_domain::{GatewayError, GatewayResult};
use drawbridge_tunnel::dial::DialRequest;
use drawbridge_tunnel::frame::ControlMsg;
use drawbridge_tunnel::mux::{self, MuxSide, MuxStream};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod discovery;
pub mod site;

pub use site::{RemoteConn, SessionGuard, Site};

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct TunnelServerConfig {
    /// Heartbeat age past which a sweep interval counts as missed
    pub offline_threshold: Duration,
    /// Missed intervals tolerated before a connection turns invalid
    pub missed_heartbeat_threshold: u32,
    /// Cadence of discovery_request pushes to connected agents
    pub resync_interval: Duration,
    pub proxy_version: String,
}

impl Default for TunnelServerConfig {
    fn default() -> Self {
        Self {
            offline_threshold: Duration::from_secs(60),
            missed_heartbeat_threshold: 3,
            resync_interval: Duration::from_secs(30),
            proxy_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl TunnelServerConfig {
    pub fn check_and_set_defaults(mut self) -> GatewayResult<Self> {
        if self.offline_threshold.is_zero() {
            return Err(GatewayError::BadParameter(
                "offline_threshold must be positive".to_string(),
            ));
        }
        if self.resync_interval.is_zero() {
            return Err(GatewayError::BadParameter(
                "resync_interval must be positive".to_string(),
            ));
        }
        if self.proxy_version.is_empty() {
            self.proxy_version = env!("CARGO_PKG_VERSION").to_string();
        }
        Ok(self)
    }
}

pub struct DialParams {
    pub cluster: Option<ClusterName>,
    /// Preferred match: a healthy tunnel advertising this id is used first
    pub server_id: Option<String>,
    /// Direct-dial fallback when the target is routable
    pub to_addr: Option<String>,
    pub conn_type: ConnectionType,
    pub principals: Vec<String>,
    pub client_addr: Option<String>,
}

/// A dialed connection: through a tunnel (with its session guard) or direct
pub enum DialedConn {
    Tunnel {
        stream: MuxStream,
        guard: SessionGuard,
    },
    Direct(TcpStream),
}

/// A stream the agent opened towards the control plane (the inventory
/// control channel travels this way)
pub struct AgentStream {
    pub server_id: String,
    pub cluster: ClusterName,
    pub stream: MuxStream,
}

pub struct TunnelServer {
    local_cluster: ClusterName,
    config: TunnelServerConfig,
    sites: RwLock<HashMap<ClusterName, Arc<Site>>>,
    proxies: RwLock<Vec<String>>,
    agent_streams: Option<tokio::sync::mpsc::Sender<AgentStream>>,
    cancel: CancellationToken,
}

impl TunnelServer {
    pub fn spawn(
        local_cluster: ClusterName,
        config: TunnelServerConfig,
        agent_streams: Option<tokio::sync::mpsc::Sender<AgentStream>>,
        cancel: CancellationToken,
    ) -> GatewayResult<Arc<Self>> {
        let config = config.check_and_set_defaults()?;
        let server = Arc::new(Self {
            local_cluster,
            config,
            sites: RwLock::new(HashMap::new()),
            proxies: RwLock::new(vec![]),
            agent_streams,
            cancel,
        });

        server.clone().spawn_sweeper();
        discovery::spawn_resync(server.clone());

        Ok(server)
    }

    pub fn config(&self) -> &TunnelServerConfig {
        &self.config
    }

    pub fn local_cluster(&self) -> &ClusterName {
        &self.local_cluster
    }

    /// Current proxy roster, pushed to agents on the next resync
    pub fn set_proxies(&self, names: Vec<String>) {
        *self.proxies.write().expect("proxies lock") = names;
    }

    pub fn proxies(&self) -> Vec<String> {
        self.proxies.read().expect("proxies lock").clone()
    }

    pub fn get_site(&self, cluster: &ClusterName) -> Option<Arc<Site>> {
        self.sites.read().expect("sites lock").get(cluster).cloned()
    }

    pub fn get_sites(&self) -> Vec<Arc<Site>> {
        self.sites.read().expect("sites lock").values().cloned().collect()
    }

    fn get_or_create_site(&self, cluster: ClusterName) -> Arc<Site> {
        let mut sites = self.sites.write().expect("sites lock");
        sites
            .entry(cluster.clone())
            .or_insert_with(|| Arc::new(Site::new(cluster)))
            .clone()
    }

    /// Accept one inbound agent transport: handshake, register the
    /// connection into its site, and drive its control channel.
    pub async fn accept<S>(self: &Arc<Self>, io: S) -> GatewayResult<Arc<RemoteConn>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let conn_cancel = self.cancel.child_token();
        let (handle, mut incoming) = mux::spawn(io, MuxSide::Initiator, conn_cancel.clone());

        let hello = tokio::time::timeout(HELLO_TIMEOUT, incoming.control.recv())
            .await
            .map_err(|_| GatewayError::ConnectionProblem("tunnel hello timeout".to_string()))?
            .ok_or_else(|| {
                GatewayError::ConnectionProblem("tunnel closed before hello".to_string())
            })?;

        let ControlMsg::Hello {
            server_id,
            cluster,
            conn_type,
        } = hello
        else {
            return Err(GatewayError::InvalidArgument(
                "tunnel must open with hello".to_string(),
            ));
        };

        let cluster: ClusterName = cluster.parse()?;
        let site = self.get_or_create_site(cluster.clone());
        let conn = Arc::new(RemoteConn::new(server_id.clone(), conn_type, handle));
        site.add(conn.clone());

        // control channel driver; also accepts agent-opened streams
        tokio::spawn({
            let conn = conn.clone();
            let agent_streams = self.agent_streams.clone();
            let cluster = cluster.clone();
            async move {
                loop {
                    tokio::select! {
                        msg = incoming.control.recv() => {
                            match msg {
                                Some(ControlMsg::Heartbeat) => conn.record_heartbeat(),
                                Some(other) => debug!(?other, "ignoring agent control message"),
                                None => {
                                    conn.mark_invalid();
                                    break;
                                }
                            }
                        }
                        stream = incoming.streams.recv() => {
                            let Some(mut stream) = stream else {
                                conn.mark_invalid();
                                break;
                            };
                            let agent_streams = agent_streams.clone();
                            let server_id = conn.server_id.clone();
                            let cluster = cluster.clone();
                            tokio::spawn(async move {
                                match drawbridge_tunnel::dial::read_request(&mut stream).await {
                                    Ok(request)
                                        if request.target
                                            == drawbridge_tunnel::dial::INVENTORY_TARGET =>
                                    {
                                        if let Some(sink) = agent_streams {
                                            let _ = sink
                                                .send(AgentStream {
                                                    server_id,
                                                    cluster,
                                                    stream,
                                                })
                                                .await;
                                        }
                                    }
                                    Ok(request) => {
                                        debug!(target = %request.target, "unexpected agent-opened stream");
                                    }
                                    Err(err) => debug!(?err, "bad agent stream preamble"),
                                }
                            });
                        }
                        _ = conn_cancel.cancelled() => {
                            conn.mark_invalid();
                            break;
                        }
                    }
                }
                debug!(server_id = %conn.server_id, "tunnel control channel ended");
            }
        });

        info!(%cluster, server_id, conn_type = %conn.conn_type, "tunnel accepted");
        Ok(conn)
    }

    /// Resolve the dial path and produce a connection to the target
    pub async fn dial(&self, params: DialParams) -> GatewayResult<DialedConn> {
        let cluster = params
            .cluster
            .clone()
            .unwrap_or_else(|| self.local_cluster.clone());

        if let Some(server_id) = &params.server_id {
            if let Some(site) = self.get_site(&cluster) {
                if let Some(conn) = site.pick(server_id) {
                    match self.dial_tunnel(&conn, &params).await {
                        Ok(dialed) => return Ok(dialed),
                        Err(err) if conn.is_valid() => return Err(err),
                        Err(err) => {
                            // the newest invalid conn surfaced its error;
                            // fall through to a direct dial if one exists
                            debug!(?err, server_id, "invalid tunnel, trying direct path");
                        }
                    }
                }
            }
        }

        match &params.to_addr {
            Some(addr) => {
                let stream = TcpStream::connect(addr).await.map_err(|err| {
                    GatewayError::ConnectionProblem(format!("direct dial {addr}: {err}"))
                })?;
                Ok(DialedConn::Direct(stream))
            }
            None => Err(GatewayError::NotFound(match &params.server_id {
                Some(server_id) => format!("no tunnel for server {server_id}"),
                None => "no dialable target".to_string(),
            })),
        }
    }

    async fn dial_tunnel(
        &self,
        conn: &Arc<RemoteConn>,
        params: &DialParams,
    ) -> GatewayResult<DialedConn> {
        let mut stream = conn.handle().open().await.map_err(GatewayError::from)?;

        drawbridge_tunnel::dial::write_request(
            &mut stream,
            &DialRequest {
                target: params
                    .to_addr
                    .clone()
                    .unwrap_or_else(|| crate::router::LOCAL_NODE.to_string()),
                conn_type: params.conn_type,
                principals: params.principals.clone(),
                client_addr: params.client_addr.clone(),
            },
        )
        .await
        .map_err(GatewayError::from)?;

        let guard = conn.attach_session();
        Ok(DialedConn::Tunnel { stream, guard })
    }

    fn spawn_sweeper(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.offline_threshold);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        for site in self.get_sites() {
                            site.sweep(
                                self.config.offline_threshold,
                                self.config.missed_heartbeat_threshold,
                            );
                        }
                    }
                    _ = self.cancel.cancelled() => {
                        warn!("tunnel server shutting down");
                        return;
                    }
                }
            }
        });
    }
}
