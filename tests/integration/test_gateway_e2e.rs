//! Full-stack end-to-end: a database client reaches a database published by
//! a reverse-tunnel agent, through the local proxy, the multi-protocol
//! listener, the dispatch layer and the tunnel fabric, authenticated by a
//! certificate minted from the cluster CA.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use drawbridge::agentpool::{
    AgentPool, AgentPoolConfig, DesiredTunnels, LocalDialHandler, NoResolver, TlsTransport,
};
use drawbridge::audit::{AuditEmitter, MemoryAuditSink};
use drawbridge::auth::{system_identity, AuthService, LockWatcher, WatchDispatcher};
use drawbridge::ca::{CaStore, CaType};
use drawbridge::ctx::{GatewayCtx, GatewayState};
use drawbridge::listener::{ListenerConfig, ProtocolListener};
use drawbridge::settings::Settings;
use drawbridge::tunnelsrv::{TunnelServer, TunnelServerConfig};
use drawbridge::{tls, GatewayConfig};
use drawbridge_backend::memory::MemoryBackend;
use drawbridge_domain::cluster::ClusterName;
use drawbridge_domain::identity::{CertUsage, DatabaseRoute, Identity};
use drawbridge_domain::label::LabelMatcher;
use drawbridge_domain::resource::{
    ConnectionType, DatabaseProtocol, DatabaseServer, HostRole, ReverseTunnel, User,
};
use drawbridge_domain::role::{Role, RoleConditions};
use drawbridge_domain::GatewayResult;
use drawbridge_localproxy::{LocalProxy, LocalProxyConfig, StaticTlsProvider};
use drawbridge_tunnel::alpn;
use rustls::RootCertStore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const DB_AGENT_ID: &str = "7f2f1f2e-1111-4e53-91a2-ab6ddef1b3a4";

struct StaticDesired(Vec<ReverseTunnel>);

impl DesiredTunnels for StaticDesired {
    async fn desired(&self) -> GatewayResult<Vec<ReverseTunnel>> {
        Ok(self.0.clone())
    }
}

struct Cluster {
    ctx: GatewayCtx,
    proxy_addr: std::net::SocketAddr,
    cancel: CancellationToken,
}

async fn start_cluster() -> Cluster {
    tls::init_tls_ring();

    let cancel = CancellationToken::new();
    let backend = MemoryBackend::new();
    let cluster_name: ClusterName = "root.test".parse().unwrap();
    let config = GatewayConfig {
        cluster_name: cluster_name.clone(),
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        hostname: "proxy.test".to_string(),
        ..Default::default()
    }
    .check_and_set_defaults()
    .unwrap();

    let ca = Arc::new(CaStore::bootstrap(cluster_name.clone()).unwrap());
    let audit = AuditEmitter::spawn(MemoryAuditSink::default(), cancel.child_token());
    let dispatcher = WatchDispatcher::spawn(&backend, cancel.child_token());
    let locks = LockWatcher::spawn(
        backend.clone(),
        &dispatcher,
        config.locking_mode,
        Settings::default().lock_stale_threshold,
        cancel.child_token(),
    );
    let auth = Arc::new(AuthService::new(
        backend.clone(),
        ca.clone(),
        dispatcher.clone(),
        locks,
        audit.clone(),
    ));

    let (agent_streams_tx, _agent_streams_rx) = mpsc::channel(32);
    let tunnel_server = TunnelServer::spawn(
        cluster_name.clone(),
        TunnelServerConfig {
            resync_interval: Duration::from_millis(500),
            ..Default::default()
        },
        Some(agent_streams_tx),
        cancel.child_token(),
    )
    .unwrap();

    let ctx = GatewayCtx::new(GatewayState {
        config,
        backend,
        ca: ca.clone(),
        auth,
        tunnel_server,
        dispatcher,
        audit,
        settings: ArcSwap::from_pointee(Settings::default()),
        shutdown: cancel.clone(),
    });

    // multi-protocol port with the real TLS config
    let server_config =
        tls::proxy_server_config(&ca, "proxy.test", Duration::from_secs(3600)).unwrap();
    let (conn_tx, conn_rx) = mpsc::channel(64);
    let listener = ProtocolListener::new(
        ListenerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        },
        Arc::new(ArcSwap::new(server_config)),
        conn_tx,
    );
    let proxy_addr = listener.bind(cancel.child_token()).await.unwrap();
    drawbridge::spawn_dispatch(ctx.clone(), conn_rx);

    Cluster {
        ctx,
        proxy_addr,
        cancel,
    }
}

fn host_ca_roots(ca: &CaStore) -> RootCertStore {
    let mut roots = RootCertStore::empty();
    for der in ca.get_all_trusted_keys(CaType::Host).unwrap().tls {
        roots.add(der).unwrap();
    }
    roots
}

/// A TCP echo standing in for the actual database endpoint
async fn spawn_fake_database() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match conn.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if conn.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

async fn join_db_agent(cluster: &Cluster, db_addr: std::net::SocketAddr) {
    let ctx = &cluster.ctx;
    let system = system_identity();

    // seed access policy and the database resource
    ctx.auth
        .upsert_role(
            &system,
            Role {
                name: "db-access".to_string(),
                allow: RoleConditions {
                    db_labels: LabelMatcher::wildcard(),
                    db_users: vec!["dbuser".to_string()],
                    db_names: vec!["dbname".to_string()],
                    ..Default::default()
                },
                deny: Default::default(),
                options: Default::default(),
            },
        )
        .await
        .unwrap();
    ctx.auth
        .upsert_user(
            &system,
            User {
                name: "alice".to_string(),
                roles: vec!["db-access".to_string()],
                traits: Default::default(),
                password_hash: None,
            },
        )
        .await
        .unwrap();
    ctx.auth
        .upsert_database(DatabaseServer {
            name: "mypsqldb".to_string(),
            protocol: DatabaseProtocol::Postgres,
            uri: db_addr.to_string(),
            labels: Default::default(),
            host_id: DB_AGENT_ID.to_string(),
            known_users: vec!["dbuser".to_string()],
            known_names: vec!["dbname".to_string()],
        })
        .await
        .unwrap();

    // the agent joins with a host certificate and opens its tunnel through
    // the same multi-protocol port
    let bundle = cluster
        .ctx
        .ca
        .issue_host_cert(
            HostRole::Db,
            DB_AGENT_ID,
            "db-agent-1",
            &"root.test".parse().unwrap(),
            &[],
            time::Duration::hours(1),
        )
        .unwrap();

    let mut agent_tls = rustls::ClientConfig::builder()
        .with_root_certificates(host_ca_roots(&cluster.ctx.ca))
        .with_client_auth_cert(
            vec![bundle.tls.der.clone()],
            bundle.tls.private_key_der().unwrap(),
        )
        .unwrap();
    agent_tls.alpn_protocols = vec![alpn::REVERSE_TUNNEL.as_bytes().to_vec()];

    let _pool = AgentPool::spawn(
        AgentPoolConfig {
            host_id: DB_AGENT_ID.to_string(),
            node_name: "db-agent-1".to_string(),
            cluster: "root.test".parse().unwrap(),
            conn_type: ConnectionType::Db,
            offline_threshold: Duration::from_secs(10),
            heartbeat_interval: Duration::from_millis(200),
            refresh_interval: Duration::from_millis(200),
        },
        Arc::new(TlsTransport {
            config: Arc::new(agent_tls),
            server_name: Some("proxy.test".to_string()),
        }),
        Arc::new(LocalDialHandler),
        StaticDesired(vec![ReverseTunnel {
            cluster_name: "root.test".parse().unwrap(),
            dial_addrs: vec![cluster.proxy_addr.to_string()],
        }]),
        NoResolver,
        None,
        cluster.cancel.child_token(),
    )
    .unwrap();

    // wait until the tunnel is ready to serve dials
    let tunnel_server = cluster.ctx.tunnel_server.clone();
    let site_cluster: ClusterName = "root.test".parse().unwrap();
    tokio::time::timeout(Duration::from_secs(10), async move {
        loop {
            let ready = tunnel_server
                .get_site(&site_cluster)
                .map(|site| site.conns().iter().any(|conn| conn.is_ready()))
                .unwrap_or(false);
            if ready {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("db agent tunnel must come up");
}

fn db_client_config(cluster: &Cluster) -> Arc<rustls::ClientConfig> {
    let mut identity = Identity::new("alice", vec!["db-access".to_string()], CertUsage::Database);
    identity.route_to_database = Some(DatabaseRoute {
        service_name: "mypsqldb".to_string(),
        username: Some("dbuser".to_string()),
        database: Some("dbname".to_string()),
    });
    let bundle = cluster
        .ctx
        .ca
        .issue_user_cert(None, &identity, &[], time::Duration::hours(1))
        .unwrap();

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(host_ca_roots(&cluster.ctx.ca))
        .with_client_auth_cert(
            vec![bundle.tls.der.clone()],
            bundle.tls.private_key_der().unwrap(),
        )
        .unwrap();
    config.alpn_protocols = vec![alpn::POSTGRES.as_bytes().to_vec()];
    Arc::new(config)
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn database_session_through_the_tunnel() {
    let cluster = start_cluster().await;
    let db_addr = spawn_fake_database().await;
    join_db_agent(&cluster, db_addr).await;

    // direct TLS client against the proxy port
    let tcp = TcpStream::connect(cluster.proxy_addr).await.unwrap();
    let mut tls = tokio_rustls::TlsConnector::from(db_client_config(&cluster))
        .connect(
            rustls::pki_types::ServerName::try_from("proxy.test").unwrap(),
            tcp,
        )
        .await
        .unwrap();

    tls.write_all(b"SELECT 1").await.unwrap();
    let mut buf = vec![0u8; b"SELECT 1".len()];
    tls.read_exact(&mut buf).await.unwrap();
    assert_eq!(b"SELECT 1".as_slice(), buf.as_slice());

    cluster.cancel.cancel();
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn database_session_through_the_local_proxy() {
    let cluster = start_cluster().await;
    let db_addr = spawn_fake_database().await;
    join_db_agent(&cluster, db_addr).await;

    // the client-side local proxy terminates application TLS
    let local = LocalProxy::new(
        LocalProxyConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            remote_addr: cluster.proxy_addr.to_string(),
            server_name: "proxy.test".to_string(),
        },
        StaticTlsProvider(db_client_config(&cluster)),
    )
    .unwrap();
    let local_addr = local.bind(cluster.cancel.child_token()).await.unwrap();

    let mut conn = TcpStream::connect(local_addr).await.unwrap();
    conn.write_all(b"plain client bytes").await.unwrap();
    let mut buf = vec![0u8; b"plain client bytes".len()];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(b"plain client bytes".as_slice(), buf.as_slice());

    cluster.cancel.cancel();
}
