//! The multi-protocol listener: one TCP port demultiplexing SSH,
//! TLS-routed database protocols, Kubernetes, web and reverse-tunnel
//! traffic.
//!
//! On accept: an `SSH-` banner routes straight to the SSH subsystem;
//! everything else gets a TLS handshake against the dynamically reloaded
//! server config, then dispatches on ALPN and SNI.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use drawbridge_domain::cert::{peer_host_identity, peer_identity, HostIdentity};
use drawbridge_domain::identity::Identity;
use drawbridge_domain::{GatewayError, GatewayResult};
use drawbridge_tunnel::{alpn, ping};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod proxyproto;

const SSH_BANNER: &[u8; 4] = b"SSH-";
const PEEK_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(30);

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DbProtocol {
    Postgres,
    Mysql,
    Mongodb,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RoutedProtocol {
    /// Raw SSH spoken straight at the port
    Ssh,
    /// SSH tunneled inside TLS
    ProxySsh,
    ReverseTunnel,
    Database(DbProtocol),
    Tcp,
    Kubernetes,
    Web,
}

/// One demultiplexed connection handed to the dispatch layer
pub struct RoutedConn {
    pub protocol: RoutedProtocol,
    pub stream: Box<dyn AsyncStream>,
    pub peer: SocketAddr,
    /// User identity from the mTLS client certificate, when presented
    pub identity: Option<Identity>,
    /// Host identity for agent connections
    pub host_identity: Option<HostIdentity>,
    pub sni: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ListenerConfig {
    pub listen_addr: SocketAddr,
    /// Honor PROXY protocol v1/v2 on the outermost listener
    pub proxy_protocol: bool,
    pub kube_sni_prefix: String,
    pub web_sni: Option<String>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3080".parse().expect("static addr"),
            proxy_protocol: false,
            kube_sni_prefix: "kube.".to_string(),
            web_sni: None,
        }
    }
}

pub struct ProtocolListener {
    config: ListenerConfig,
    /// Server TLS config with the current trust anchors; swapped on CA
    /// changes without restarting the listener
    tls: Arc<ArcSwap<rustls::ServerConfig>>,
    sink: mpsc::Sender<RoutedConn>,
}

impl ProtocolListener {
    pub fn new(
        config: ListenerConfig,
        tls: Arc<ArcSwap<rustls::ServerConfig>>,
        sink: mpsc::Sender<RoutedConn>,
    ) -> Self {
        Self { config, tls, sink }
    }

    /// Bind and serve until `cancel` fires; returns the bound address
    pub async fn bind(self, cancel: CancellationToken) -> GatewayResult<SocketAddr> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "multi-protocol listener bound");

        let listener_state = Arc::new(self);
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted,
                    _ = cancel.cancelled() => return,
                };

                let (tcp, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(?err, "listener accept error");
                        continue;
                    }
                };

                let state = listener_state.clone();
                let conn_cancel = cancel.child_token();
                tokio::spawn(async move {
                    if let Err(err) = state.handle_conn(tcp, peer, conn_cancel).await {
                        debug!(?err, %peer, "connection demux failed");
                    }
                });
            }
        });

        Ok(local_addr)
    }

    async fn handle_conn(
        &self,
        mut tcp: TcpStream,
        socket_peer: SocketAddr,
        cancel: CancellationToken,
    ) -> GatewayResult<()> {
        // the advertised client address replaces the socket peer
        let peer = if self.config.proxy_protocol {
            proxyproto::read_proxy_header(&mut tcp)
                .await?
                .unwrap_or(socket_peer)
        } else {
            socket_peer
        };

        let banner = tokio::time::timeout(PEEK_TIMEOUT, peek_banner(&tcp))
            .await
            .map_err(|_| GatewayError::ConnectionProblem("first-bytes timeout".to_string()))??;

        if &banner == SSH_BANNER {
            return self
                .deliver(RoutedConn {
                    protocol: RoutedProtocol::Ssh,
                    stream: Box::new(tcp),
                    peer,
                    identity: None,
                    host_identity: None,
                    sni: None,
                })
                .await;
        }

        let acceptor = TlsAcceptor::from(self.tls.load_full());
        let tls = acceptor.accept(tcp).await.map_err(|err| {
            GatewayError::ConnectionProblem(format!("tls handshake with {peer}: {err}"))
        })?;

        let (_, server_conn) = tls.get_ref();
        let negotiated = server_conn
            .alpn_protocol()
            .map(|proto| String::from_utf8_lossy(proto).to_string())
            .unwrap_or_default();
        let sni = server_conn.server_name().map(str::to_string);

        let (identity, host_identity) = match server_conn.peer_certificates() {
            Some([leaf, ..]) => (
                peer_identity(leaf).ok(),
                peer_host_identity(leaf).ok(),
            ),
            _ => (None, None),
        };

        let protocol = self.classify(&negotiated, sni.as_deref());
        debug!(%peer, %negotiated, ?protocol, "connection demultiplexed");

        let stream: Box<dyn AsyncStream> = if alpn::is_ping(&negotiated) {
            Box::new(ping::wrap(tls, PING_INTERVAL, cancel))
        } else {
            Box::new(tls)
        };

        self.deliver(RoutedConn {
            protocol,
            stream,
            peer,
            identity,
            host_identity,
            sni,
        })
        .await
    }

    fn classify(&self, negotiated: &str, sni: Option<&str>) -> RoutedProtocol {
        match alpn::strip_ping(negotiated) {
            alpn::PROXY_SSH => RoutedProtocol::ProxySsh,
            alpn::REVERSE_TUNNEL => RoutedProtocol::ReverseTunnel,
            alpn::POSTGRES => RoutedProtocol::Database(DbProtocol::Postgres),
            alpn::MYSQL => RoutedProtocol::Database(DbProtocol::Mysql),
            alpn::MONGODB => RoutedProtocol::Database(DbProtocol::Mongodb),
            alpn::TCP => RoutedProtocol::Tcp,
            _ => {
                // h2 / http1.1 / nothing negotiated: split on SNI
                if sni
                    .map(|sni| sni.starts_with(&self.config.kube_sni_prefix))
                    .unwrap_or(false)
                {
                    RoutedProtocol::Kubernetes
                } else {
                    RoutedProtocol::Web
                }
            }
        }
    }

    async fn deliver(&self, conn: RoutedConn) -> GatewayResult<()> {
        self.sink
            .send(conn)
            .await
            .map_err(|_| GatewayError::ConnectionProblem("dispatch closed".to_string()))
    }
}

/// Peek the first four bytes without consuming them
async fn peek_banner(tcp: &TcpStream) -> GatewayResult<[u8; 4]> {
    let mut banner = [0u8; 4];
    loop {
        let n = tcp.peek(&mut banner).await?;
        if n >= 4 {
            return Ok(banner);
        }
        if n == 0 {
            return Err(GatewayError::ConnectionProblem(
                "connection closed before first bytes".to_string(),
            ));
        }
        // a partial first segment; wait for more
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
