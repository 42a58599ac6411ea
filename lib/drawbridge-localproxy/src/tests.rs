use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rustls::pki_types::PrivateKeyDer;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use drawbridge_domain::cert::{gateway_ca, server_cert, SigningCert};
use drawbridge_domain::GatewayResult;
use drawbridge_tunnel::alpn;

use super::*;

fn install_crypto() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

struct TestPki {
    ca: SigningCert,
    server_der: Vec<rustls::pki_types::CertificateDer<'static>>,
    server_key: PrivateKeyDer<'static>,
}

fn test_pki() -> TestPki {
    let cluster = "root.test".parse().unwrap();
    let ca = SigningCert::new_self_signed(gateway_ca(&cluster, "Host")).unwrap();
    let issued = ca
        .sign(
            server_cert(
                "proxy.test",
                vec!["proxy.test".to_string()],
                time::Duration::hours(1),
            )
            .unwrap(),
        )
        .unwrap();
    let server_key = issued.private_key_der().unwrap();
    TestPki {
        ca,
        server_der: vec![issued.der],
        server_key,
    }
}

async fn spawn_echo_tls_server(pki: &TestPki, protocols: Vec<Vec<u8>>) -> std::net::SocketAddr {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(pki.server_der.clone(), pki.server_key.clone_key())
        .unwrap();
    config.alpn_protocols = protocols;
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((conn, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(conn).await else {
                    return;
                };
                let mut buf = vec![0u8; 4096];
                loop {
                    match tls.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if tls.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

fn client_config(pki: &TestPki, protocols: Vec<Vec<u8>>) -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.add(pki.ca.der.clone()).unwrap();
    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = protocols;
    Arc::new(config)
}

#[test_log::test(tokio::test)]
async fn splices_bytes_through_tls() {
    install_crypto();
    let pki = test_pki();
    let remote = spawn_echo_tls_server(&pki, vec![alpn::POSTGRES.as_bytes().to_vec()]).await;

    let cancel = CancellationToken::new();
    let proxy = LocalProxy::new(
        LocalProxyConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            remote_addr: remote.to_string(),
            server_name: "proxy.test".to_string(),
        },
        StaticTlsProvider(client_config(&pki, vec![alpn::POSTGRES.as_bytes().to_vec()])),
    )
    .unwrap();

    let local_addr = proxy.bind(cancel.child_token()).await.unwrap();

    let mut conn = tokio::net::TcpStream::connect(local_addr).await.unwrap();
    conn.write_all(b"startup packet").await.unwrap();

    let mut response = vec![0u8; b"startup packet".len()];
    conn.read_exact(&mut response).await.unwrap();
    assert_eq!(b"startup packet".as_slice(), response.as_slice());

    cancel.cancel();
}

#[test_log::test(tokio::test)]
async fn ping_variant_wraps_the_stream() {
    install_crypto();
    let pki = test_pki();

    // the remote negotiates the -ping variant and speaks ping framing
    let ping_proto = alpn::with_ping(alpn::POSTGRES).into_bytes();
    let remote = {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(pki.server_der.clone(), pki.server_key.clone_key())
            .unwrap();
        config.alpn_protocols = vec![ping_proto.clone()];
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((conn, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let Ok(tls) = acceptor.accept(conn).await else {
                        return;
                    };
                    let mut wrapped = drawbridge_tunnel::ping::wrap(
                        tls,
                        std::time::Duration::from_millis(10),
                        CancellationToken::new(),
                    );
                    let mut buf = vec![0u8; 4096];
                    loop {
                        match wrapped.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if wrapped.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    };

    let cancel = CancellationToken::new();
    let proxy = LocalProxy::new(
        LocalProxyConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            remote_addr: remote.to_string(),
            server_name: "proxy.test".to_string(),
        },
        StaticTlsProvider(client_config(&pki, vec![ping_proto])),
    )
    .unwrap();
    let local_addr = proxy.bind(cancel.child_token()).await.unwrap();

    let mut conn = tokio::net::TcpStream::connect(local_addr).await.unwrap();
    conn.write_all(b"keepalive framed").await.unwrap();

    let mut response = vec![0u8; b"keepalive framed".len()];
    conn.read_exact(&mut response).await.unwrap();
    assert_eq!(b"keepalive framed".as_slice(), response.as_slice());

    cancel.cancel();
}

struct CountingRefresher {
    pki: TestPki,
    ttl: time::Duration,
    refreshes: Arc<AtomicUsize>,
}

impl IdentityRefresher for CountingRefresher {
    async fn refresh(&self) -> GatewayResult<ClientIdentity> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let issued = self.pki.ca.sign(
            server_cert("client.test", vec!["client.test".to_string()], self.ttl).unwrap(),
        )?;
        let key_der = issued.private_key_der()?;
        Ok(ClientIdentity {
            cert_chain: vec![issued.der],
            key_der,
            not_after: time::OffsetDateTime::now_utc() + self.ttl,
        })
    }
}

#[test_log::test(tokio::test)]
async fn near_expiry_certificate_triggers_refresh() {
    install_crypto();
    let refreshes = Arc::new(AtomicUsize::new(0));

    let provider = RefreshingTlsProvider::new(
        CountingRefresher {
            pki: test_pki(),
            // under the one-minute threshold: every connection refreshes
            ttl: time::Duration::seconds(30),
            refreshes: refreshes.clone(),
        },
        Arc::new(RootCertStore::empty()),
        vec![alpn::POSTGRES.as_bytes().to_vec()],
    );

    provider.client_config().await.unwrap();
    provider.client_config().await.unwrap();
    assert_eq!(2, refreshes.load(Ordering::SeqCst));
}

#[test_log::test(tokio::test)]
async fn fresh_certificate_is_reused() {
    install_crypto();
    let refreshes = Arc::new(AtomicUsize::new(0));

    let provider = RefreshingTlsProvider::new(
        CountingRefresher {
            pki: test_pki(),
            ttl: time::Duration::hours(1),
            refreshes: refreshes.clone(),
        },
        Arc::new(RootCertStore::empty()),
        vec![alpn::POSTGRES.as_bytes().to_vec()],
    );

    provider.client_config().await.unwrap();
    provider.client_config().await.unwrap();
    assert_eq!(1, refreshes.load(Ordering::SeqCst));
}
