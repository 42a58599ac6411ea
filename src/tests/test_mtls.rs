//! mTLS handshakes against the proxy's server config: identity extraction,
//! anonymous fallback, ALPN negotiation.

use std::sync::Arc;
use std::time::Duration;

use drawbridge_domain::cert::peer_identity;
use drawbridge_domain::identity::{CertUsage, Identity};
use drawbridge_tunnel::alpn;
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use test_log::test;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::ca::{CaStore, CaType};
use crate::tls;

fn client_roots(ca: &CaStore) -> RootCertStore {
    let mut roots = RootCertStore::empty();
    for der in ca.get_all_trusted_keys(CaType::Host).unwrap().tls {
        roots.add(der).unwrap();
    }
    roots
}

#[test(tokio::test)]
async fn client_certificate_identity_survives_the_handshake() {
    tls::init_tls_ring();
    let ca = Arc::new(CaStore::bootstrap("root.test".parse().unwrap()).unwrap());

    let server_config =
        tls::proxy_server_config(&ca, "proxy.test", Duration::from_secs(3600)).unwrap();
    let acceptor = TlsAcceptor::from(server_config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (conn, _) = listener.accept().await.unwrap();
        let tls = acceptor.accept(conn).await.unwrap();
        let (_, server_conn) = tls.get_ref();

        let negotiated = server_conn
            .alpn_protocol()
            .map(|proto| proto.to_vec())
            .unwrap_or_default();
        let identity = server_conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .and_then(|leaf| peer_identity(leaf).ok());
        (negotiated, identity)
    });

    // a user certificate minted by the cluster's own user CA
    let mut identity = Identity::new("alice", vec!["dev".to_string()], CertUsage::Database);
    identity.route_to_cluster = Some("root.test".parse().unwrap());
    let bundle = ca
        .issue_user_cert(None, &identity, &[], time::Duration::hours(1))
        .unwrap();

    let mut client_config = rustls::ClientConfig::builder()
        .with_root_certificates(client_roots(&ca))
        .with_client_auth_cert(
            vec![bundle.tls.der.clone()],
            bundle.tls.private_key_der().unwrap(),
        )
        .unwrap();
    client_config.alpn_protocols = vec![alpn::POSTGRES.as_bytes().to_vec()];

    let tcp = TcpStream::connect(addr).await.unwrap();
    let mut tls = TlsConnector::from(Arc::new(client_config))
        .connect(ServerName::try_from("proxy.test").unwrap(), tcp)
        .await
        .unwrap();
    // drive the handshake to completion from the client side
    tls.write_all(b"x").await.unwrap();
    tls.flush().await.unwrap();

    let (negotiated, recovered) = server.await.unwrap();
    assert_eq!(alpn::POSTGRES.as_bytes(), negotiated.as_slice());

    let recovered = recovered.expect("identity recovered from the client cert");
    assert_eq!("alice", recovered.username);
    assert_eq!(Some("root.test".parse().unwrap()), recovered.route_to_cluster);
}

#[test(tokio::test)]
async fn anonymous_clients_still_handshake() {
    tls::init_tls_ring();
    let ca = Arc::new(CaStore::bootstrap("root.test".parse().unwrap()).unwrap());

    let server_config =
        tls::proxy_server_config(&ca, "proxy.test", Duration::from_secs(3600)).unwrap();
    let acceptor = TlsAcceptor::from(server_config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (conn, _) = listener.accept().await.unwrap();
        let tls = acceptor.accept(conn).await.unwrap();
        tls.get_ref().1.peer_certificates().map(|certs| certs.len())
    });

    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(client_roots(&ca))
        .with_no_client_auth();

    let tcp = TcpStream::connect(addr).await.unwrap();
    let mut tls = TlsConnector::from(Arc::new(client_config))
        .connect(ServerName::try_from("proxy.test").unwrap(), tcp)
        .await
        .unwrap();
    tls.write_all(b"x").await.unwrap();
    tls.flush().await.unwrap();

    // no client certificate, no identity; the web path handles authz
    assert_eq!(None, server.await.unwrap());
}

#[test(tokio::test)]
async fn foreign_certificates_fail_the_handshake() {
    tls::init_tls_ring();
    let ca = Arc::new(CaStore::bootstrap("root.test".parse().unwrap()).unwrap());
    let foreign = CaStore::bootstrap("intruder.test".parse().unwrap()).unwrap();

    let server_config =
        tls::proxy_server_config(&ca, "proxy.test", Duration::from_secs(3600)).unwrap();
    let acceptor = TlsAcceptor::from(server_config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (conn, _) = listener.accept().await.unwrap();
        acceptor.accept(conn).await.is_err()
    });

    let identity = Identity::new("mallory", vec![], CertUsage::Database);
    let bundle = foreign
        .issue_user_cert(None, &identity, &[], time::Duration::hours(1))
        .unwrap();

    let mut client_config = rustls::ClientConfig::builder()
        .with_root_certificates(client_roots(&ca))
        .with_client_auth_cert(
            vec![bundle.tls.der.clone()],
            bundle.tls.private_key_der().unwrap(),
        )
        .unwrap();
    client_config.alpn_protocols = vec![alpn::POSTGRES.as_bytes().to_vec()];

    let tcp = TcpStream::connect(addr).await.unwrap();
    let result = TlsConnector::from(Arc::new(client_config))
        .connect(ServerName::try_from("proxy.test").unwrap(), tcp)
        .await;

    // one side or the other observes the rejection
    let server_rejected = server.await.unwrap();
    assert!(result.is_err() || server_rejected);
}