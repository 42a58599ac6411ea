//! The reverse-tunnel agent pool.
//!
//! On each edge host, one pool per remote cluster keeps the desired number
//! of control connections to discovered proxies: it diffs the desired set
//! against running agents, stops removed entries and starts new ones, and
//! folds proxies learned from discovery requests back into the desired set.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use drawbridge_domain::cluster::ClusterName;
use drawbridge_domain::resource::{ConnectionType, ReverseTunnel};
use drawbridge_domain::{GatewayError, GatewayResult};
use drawbridge_tunnel::dial::DialRequest;
use drawbridge_tunnel::mux::MuxStream;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod agent;

/// How the agent reaches a proxy address
pub trait TunnelTransport: Send + Sync + 'static {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(&self, addr: &str) -> impl Future<Output = GatewayResult<Self::Io>> + Send;
}

/// Plain TCP, used inside trusted networks and tests
pub struct TcpTransport;

impl TunnelTransport for TcpTransport {
    type Io = TcpStream;

    async fn connect(&self, addr: &str) -> GatewayResult<TcpStream> {
        TcpStream::connect(addr)
            .await
            .map_err(|err| GatewayError::ConnectionProblem(format!("connect {addr}: {err}")))
    }
}

/// mTLS with the host certificate, the production transport
pub struct TlsTransport {
    pub config: Arc<rustls::ClientConfig>,
    /// SNI override; defaults to the host part of the dialed address
    pub server_name: Option<String>,
}

impl TunnelTransport for TlsTransport {
    type Io = tokio_rustls::client::TlsStream<TcpStream>;

    async fn connect(&self, addr: &str) -> GatewayResult<Self::Io> {
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|err| GatewayError::ConnectionProblem(format!("connect {addr}: {err}")))?;

        let host = self
            .server_name
            .clone()
            .or_else(|| addr.rsplit_once(':').map(|(host, _)| host.to_string()))
            .unwrap_or_else(|| addr.to_string());
        let server_name = rustls::pki_types::ServerName::try_from(host)
            .map_err(|err| GatewayError::BadParameter(format!("server name: {err}")))?;

        tokio_rustls::TlsConnector::from(self.config.clone())
            .connect(server_name, tcp)
            .await
            .map_err(|err| GatewayError::ConnectionProblem(format!("tls {addr}: {err}")))
    }
}

/// What the agent does with streams the proxy dials back through
pub trait DialHandler: Send + Sync + 'static {
    fn handle(&self, request: DialRequest, stream: MuxStream) -> impl Future<Output = ()> + Send;
}

/// Connects the requested target on the local network and splices
pub struct LocalDialHandler;

impl DialHandler for LocalDialHandler {
    async fn handle(&self, request: DialRequest, mut stream: MuxStream) {
        let mut target = match TcpStream::connect(&request.target).await {
            Ok(target) => target,
            Err(err) => {
                debug!(?err, target = %request.target, "dial-back target unreachable");
                return;
            }
        };
        if let Err(err) = tokio::io::copy_bidirectional(&mut stream, &mut target).await {
            debug!(?err, "dial-back splice ended");
        }
    }
}

/// Maps a discovered proxy name to a dialable address
pub trait ProxyAddrResolver: Send + Sync + 'static {
    fn resolve(&self, proxy_name: &str) -> Option<String>;
}

/// Discovery entries without a known address are skipped
pub struct NoResolver;

impl ProxyAddrResolver for NoResolver {
    fn resolve(&self, _proxy_name: &str) -> Option<String> {
        None
    }
}

/// Supplies the desired reverse tunnels, typically backed by the auth client
pub trait DesiredTunnels: Send + Sync + 'static {
    fn desired(&self) -> impl Future<Output = GatewayResult<Vec<ReverseTunnel>>> + Send;
}

#[derive(Clone)]
pub struct AgentPoolConfig {
    pub host_id: String,
    pub node_name: String,
    /// The agent's own cluster name announced in hellos
    pub cluster: ClusterName,
    pub conn_type: ConnectionType,
    pub offline_threshold: Duration,
    pub heartbeat_interval: Duration,
    /// Cadence of the desired-set control loop
    pub refresh_interval: Duration,
}

impl AgentPoolConfig {
    pub fn check_and_set_defaults(mut self) -> GatewayResult<Self> {
        if self.host_id.is_empty() {
            return Err(GatewayError::BadParameter(
                "agent pool needs a host id".to_string(),
            ));
        }
        if self.offline_threshold.is_zero() {
            self.offline_threshold = Duration::from_secs(60);
        }
        if self.heartbeat_interval.is_zero() {
            self.heartbeat_interval = Duration::from_secs(10);
        }
        if self.refresh_interval.is_zero() {
            self.refresh_interval = Duration::from_secs(5);
        }
        Ok(self)
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
struct AgentKey {
    cluster: ClusterName,
    addr: String,
}

struct AgentEntry {
    cancel: CancellationToken,
}

pub struct AgentPool {
    agents: Arc<Mutex<HashMap<AgentKey, AgentEntry>>>,
    cancel: CancellationToken,
}

impl AgentPool {
    /// Start the pool's control loop. Closing the returned pool (or firing
    /// `cancel`) cancels every agent.
    pub fn spawn<T, H, D, R>(
        config: AgentPoolConfig,
        transport: Arc<T>,
        handler: Arc<H>,
        desired_source: D,
        resolver: R,
        inventory: Option<mpsc::Sender<MuxStream>>,
        cancel: CancellationToken,
    ) -> GatewayResult<Arc<Self>>
    where
        T: TunnelTransport,
        H: DialHandler,
        D: DesiredTunnels,
        R: ProxyAddrResolver,
    {
        let config = config.check_and_set_defaults()?;
        let pool = Arc::new(Self {
            agents: Arc::new(Mutex::new(HashMap::new())),
            cancel: cancel.clone(),
        });

        let (discovered_tx, mut discovered_rx) =
            mpsc::channel::<(ClusterName, Vec<String>)>(16);

        tokio::spawn({
            let pool = pool.clone();
            async move {
                // proxies learned from discovery, per cluster
                let mut discovered: HashMap<ClusterName, HashSet<String>> = HashMap::new();

                loop {
                    let desired = tokio::select! {
                        desired = desired_source.desired() => desired,
                        more = discovered_rx.recv() => {
                            if let Some((cluster, names)) = more {
                                let addrs = discovered.entry(cluster).or_default();
                                for name in names {
                                    if let Some(addr) = resolver.resolve(&name) {
                                        addrs.insert(addr);
                                    }
                                }
                            }
                            continue;
                        }
                        _ = cancel.cancelled() => {
                            pool.stop_all();
                            return;
                        }
                    };

                    match desired {
                        Ok(tunnels) => {
                            let mut wanted: HashSet<AgentKey> = HashSet::new();
                            for tunnel in tunnels {
                                for addr in &tunnel.dial_addrs {
                                    wanted.insert(AgentKey {
                                        cluster: tunnel.cluster_name.clone(),
                                        addr: addr.clone(),
                                    });
                                }
                                if let Some(extra) = discovered.get(&tunnel.cluster_name) {
                                    for addr in extra {
                                        wanted.insert(AgentKey {
                                            cluster: tunnel.cluster_name.clone(),
                                            addr: addr.clone(),
                                        });
                                    }
                                }
                            }

                            pool.reconcile(
                                wanted,
                                &config,
                                &transport,
                                &handler,
                                &discovered_tx,
                                &inventory,
                            );
                        }
                        Err(err) => warn!(?err, "desired tunnel set unavailable"),
                    }

                    tokio::select! {
                        _ = tokio::time::sleep(config.refresh_interval) => {}
                        more = discovered_rx.recv() => {
                            if let Some((cluster, names)) = more {
                                let addrs = discovered.entry(cluster).or_default();
                                for name in names {
                                    if let Some(addr) = resolver.resolve(&name) {
                                        addrs.insert(addr);
                                    }
                                }
                            }
                        }
                        _ = cancel.cancelled() => {
                            pool.stop_all();
                            return;
                        }
                    }
                }
            }
        });

        Ok(pool)
    }

    fn reconcile<T, H>(
        &self,
        wanted: HashSet<AgentKey>,
        config: &AgentPoolConfig,
        transport: &Arc<T>,
        handler: &Arc<H>,
        discovered_tx: &mpsc::Sender<(ClusterName, Vec<String>)>,
        inventory: &Option<mpsc::Sender<MuxStream>>,
    ) where
        T: TunnelTransport,
        H: DialHandler,
    {
        let mut agents = self.agents.lock().expect("pool lock");

        // stop agents that fell out of the desired set
        agents.retain(|key, entry| {
            if wanted.contains(key) {
                true
            } else {
                info!(cluster = %key.cluster, addr = %key.addr, "stopping agent");
                entry.cancel.cancel();
                false
            }
        });

        // start agents for new entries
        for key in wanted {
            if agents.contains_key(&key) {
                continue;
            }
            info!(cluster = %key.cluster, addr = %key.addr, "starting agent");

            let agent_cancel = self.cancel.child_token();
            agents.insert(
                key.clone(),
                AgentEntry {
                    cancel: agent_cancel.clone(),
                },
            );

            tokio::spawn(agent::run_agent(
                key.addr.clone(),
                key.cluster.clone(),
                config.clone(),
                transport.clone(),
                handler.clone(),
                discovered_tx.clone(),
                inventory.clone(),
                agent_cancel,
            ));
        }
    }

    fn stop_all(&self) {
        let mut agents = self.agents.lock().expect("pool lock");
        for (_, entry) in agents.drain() {
            entry.cancel.cancel();
        }
    }

    pub fn agent_count(&self) -> usize {
        self.agents.lock().expect("pool lock").len()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}
