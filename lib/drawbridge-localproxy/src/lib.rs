//! The client-side local proxy.
//!
//! Listens on a local TCP port, terminates application TLS towards the
//! remote proxy with the appropriate ALPN, and splices bytes in both
//! directions. A [TlsConfigProvider] supplies the outbound TLS config per
//! connection, which lets middleware refresh the user certificate when it
//! nears expiry.

#![deny(unsafe_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use time::OffsetDateTime;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use drawbridge_domain::{GatewayError, GatewayResult};
use drawbridge_tunnel::{alpn, ping};

#[cfg(test)]
mod tests;

/// Certificates are refreshed when less than this much validity remains
pub const CERT_REFRESH_THRESHOLD: Duration = Duration::from_secs(60);

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Supplies the outbound TLS client config for each accepted connection.
pub trait TlsConfigProvider: Send + Sync + 'static {
    fn client_config(&self) -> impl Future<Output = GatewayResult<Arc<ClientConfig>>> + Send;
}

/// A fixed config, used for anonymous protocols and tests
pub struct StaticTlsProvider(pub Arc<ClientConfig>);

impl TlsConfigProvider for StaticTlsProvider {
    async fn client_config(&self) -> GatewayResult<Arc<ClientConfig>> {
        Ok(self.0.clone())
    }
}

/// The client identity material the refreshing provider maintains.
pub struct ClientIdentity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key_der: PrivateKeyDer<'static>,
    pub not_after: OffsetDateTime,
}

/// Re-issues the client identity; typically backed by the auth service.
pub trait IdentityRefresher: Send + Sync + 'static {
    fn refresh(&self) -> impl Future<Output = GatewayResult<ClientIdentity>> + Send;
}

/// Middleware that rebuilds the outbound config when the certificate's
/// remaining validity drops under [CERT_REFRESH_THRESHOLD]. A failed
/// refresh fails the connection.
pub struct RefreshingTlsProvider<R> {
    refresher: R,
    roots: Arc<RootCertStore>,
    protocols: Vec<Vec<u8>>,
    identity: tokio::sync::Mutex<Option<ClientIdentity>>,
}

impl<R: IdentityRefresher> RefreshingTlsProvider<R> {
    pub fn new(refresher: R, roots: Arc<RootCertStore>, protocols: Vec<Vec<u8>>) -> Self {
        Self {
            refresher,
            roots,
            protocols,
            identity: tokio::sync::Mutex::new(None),
        }
    }

    fn build_config(&self, identity: &ClientIdentity) -> GatewayResult<Arc<ClientConfig>> {
        let mut config = ClientConfig::builder()
            .with_root_certificates(self.roots.clone())
            .with_client_auth_cert(identity.cert_chain.clone(), identity.key_der.clone_key())
            .map_err(|err| GatewayError::BadParameter(format!("client tls: {err}")))?;
        config.alpn_protocols = self.protocols.clone();
        Ok(Arc::new(config))
    }
}

impl<R: IdentityRefresher> TlsConfigProvider for RefreshingTlsProvider<R> {
    async fn client_config(&self) -> GatewayResult<Arc<ClientConfig>> {
        let mut guard = self.identity.lock().await;

        let stale = match guard.as_ref() {
            Some(identity) => {
                identity.not_after - OffsetDateTime::now_utc() < CERT_REFRESH_THRESHOLD
            }
            None => true,
        };

        if stale {
            debug!("refreshing client certificate");
            *guard = Some(self.refresher.refresh().await?);
        }

        let identity = guard.as_ref().expect("identity populated above");
        self.build_config(identity)
    }
}

pub struct LocalProxyConfig {
    pub listen_addr: SocketAddr,
    /// `host:port` of the remote proxy's multi-protocol port
    pub remote_addr: String,
    /// SNI sent to the remote proxy
    pub server_name: String,
}

impl LocalProxyConfig {
    pub fn check(&self) -> GatewayResult<()> {
        if self.remote_addr.is_empty() {
            return Err(GatewayError::BadParameter(
                "local proxy needs a remote address".to_string(),
            ));
        }
        if self.server_name.is_empty() {
            return Err(GatewayError::BadParameter(
                "local proxy needs a server name".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct LocalProxy<P> {
    config: LocalProxyConfig,
    provider: Arc<P>,
}

impl<P: TlsConfigProvider> LocalProxy<P> {
    pub fn new(config: LocalProxyConfig, provider: P) -> GatewayResult<Self> {
        config.check()?;
        Ok(Self {
            config,
            provider: Arc::new(provider),
        })
    }

    /// Bind and serve until `cancel` fires. Returns the bound address.
    pub async fn bind(self, cancel: CancellationToken) -> GatewayResult<SocketAddr> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, remote = %self.config.remote_addr, "local proxy listening");

        let config = Arc::new(self.config);
        let provider = self.provider;

        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted,
                    _ = cancel.cancelled() => return,
                };

                let (conn, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(?err, "local proxy accept error");
                        continue;
                    }
                };

                let config = config.clone();
                let provider = provider.clone();
                let cancel = cancel.child_token();
                tokio::spawn(async move {
                    if let Err(err) = proxy_connection(conn, &config, &*provider, cancel).await {
                        debug!(?err, %peer, "local proxy connection ended");
                    }
                });
            }
        });

        Ok(local_addr)
    }
}

async fn proxy_connection<P: TlsConfigProvider>(
    mut local: TcpStream,
    config: &LocalProxyConfig,
    provider: &P,
    cancel: CancellationToken,
) -> GatewayResult<()> {
    let tls_config = provider.client_config().await?;

    let remote = TcpStream::connect(&config.remote_addr).await?;
    let server_name = ServerName::try_from(config.server_name.clone())
        .map_err(|err| GatewayError::BadParameter(format!("server name: {err}")))?;

    let tls = TlsConnector::from(tls_config)
        .connect(server_name, remote)
        .await?;

    let negotiated = tls
        .get_ref()
        .1
        .alpn_protocol()
        .map(|p| String::from_utf8_lossy(p).to_string())
        .unwrap_or_default();

    if alpn::is_ping(&negotiated) {
        let mut wrapped = ping::wrap(tls, PING_INTERVAL, cancel.child_token());
        tokio::io::copy_bidirectional(&mut local, &mut wrapped).await?;
    } else {
        let mut tls = tls;
        tokio::io::copy_bidirectional(&mut local, &mut tls).await?;
    }

    Ok(())
}
