#![deny(unsafe_code)]

use std::sync::Arc;

use arc_swap::ArcSwap;
use drawbridge_backend::memory::MemoryBackend;
use drawbridge_domain::resource::{LockingMode, ResourceKind, RoutingStrategy};
use drawbridge_domain::{GatewayError, GatewayResult};
use futures_util::future::poll_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::{debug, info, warn};

pub use env_config::{EnvConfig, GatewayConfig};

pub mod agentpool;
pub mod audit;
pub mod auth;
pub mod ca;
pub mod ctx;
pub mod diag;
pub mod env_config;
pub mod inventory;
pub mod kubeservice;
pub mod listener;
pub mod router;
pub mod sessions;
pub mod settings;
pub mod tls;
pub mod tunnelsrv;
pub mod web;

/// The tests are part of src/ as this is a binary crate; integration tests
/// outside the src tree fit libraries better.
#[cfg(test)]
mod tests;

use audit::{AuditEmitter, MemoryAuditSink};
use auth::{resources, AuthService, LockWatcher, WatchDispatcher};
use ca::{CaStore, StoredAuthority};
use ctx::{BackendNodeSource, GatewayCtx, GatewayState};
use listener::{DbProtocol, ListenerConfig, ProtocolListener, RoutedConn, RoutedProtocol};
use router::{RouteRequest, Router};
use sessions::{ActiveSessions, SessionState, SessionTracker};
use settings::Settings;
use tunnelsrv::{AgentStream, DialParams, DialedConn, TunnelServer, TunnelServerConfig};

pub struct Init {
    pub ctx: GatewayCtx,
    agent_streams: mpsc::Receiver<AgentStream>,
}

pub async fn serve() -> anyhow::Result<()> {
    let Init { ctx, agent_streams } = initialize().await?;

    info!(
        cluster = %ctx.config.cluster_name,
        "user CA:\n{}",
        ctx.ca
            .get_all_trusted_keys(ca::CaType::User)?
            .tls
            .first()
            .map(|der| pem_of(der))
            .unwrap_or_default()
    );

    spawn_inventory_acceptor(&ctx, agent_streams);
    spawn_lock_enforcement(&ctx);

    let (tls_swap, _tls_reload) = tls::spawn_tls_reloader(
        ctx.ca.clone(),
        ctx.config.hostname.clone(),
        ctx.settings.load().server_cert_rotation_rate,
        ctx.shutdown.child_token(),
    )?;

    let (conn_tx, conn_rx) = mpsc::channel::<RoutedConn>(64);
    let proxy_listener = ProtocolListener::new(
        ListenerConfig {
            listen_addr: ctx.config.listen_addr,
            proxy_protocol: ctx.config.proxy_protocol,
            ..Default::default()
        },
        tls_swap,
        conn_tx,
    );
    let bound = proxy_listener.bind(ctx.shutdown.child_token()).await?;
    info!(%bound, "proxy serving");

    spawn_dispatch(ctx.clone(), conn_rx);

    // shut down on the process termination signal
    {
        let shutdown = ctx.shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("termination signal received");
                shutdown.cancel();
            }
        });
    }

    ctx.shutdown.cancelled().await;
    Ok(())
}

fn pem_of(der: &rustls::pki_types::CertificateDer) -> String {
    pem::encode(&pem::Pem::new("CERTIFICATE", der.to_vec()))
}

pub async fn initialize() -> anyhow::Result<Init> {
    tls::init_tls_ring();

    let env_config = EnvConfig::load();
    let config = GatewayConfig::load(&env_config)?;
    let shutdown = CancellationToken::new();
    let backend = MemoryBackend::new();

    let ca = Arc::new(load_or_bootstrap_ca(&backend, &config).await?);

    let settings = Settings::default();
    let audit = AuditEmitter::spawn(MemoryAuditSink::default(), shutdown.child_token());
    let dispatcher = WatchDispatcher::spawn(&backend, shutdown.child_token());
    let locks = LockWatcher::spawn(
        backend.clone(),
        &dispatcher,
        config.locking_mode,
        settings.lock_stale_threshold,
        shutdown.child_token(),
    );

    let auth = Arc::new(AuthService::new(
        backend.clone(),
        ca.clone(),
        dispatcher.clone(),
        locks,
        audit.clone(),
    ));

    for token in &config.static_tokens {
        auth::tokens::upsert_static_token(&backend, &token.name, &token.secret, token.roles.clone())
            .await?;
    }

    let (agent_streams_tx, agent_streams_rx) = mpsc::channel(32);
    let tunnel_server = TunnelServer::spawn(
        config.cluster_name.clone(),
        TunnelServerConfig::default(),
        Some(agent_streams_tx),
        shutdown.child_token(),
    )?;
    tunnel_server.set_proxies(
        config
            .proxy_name
            .clone()
            .into_iter()
            .collect(),
    );

    let ctx = GatewayCtx::new(GatewayState {
        config,
        backend,
        ca,
        auth,
        tunnel_server,
        dispatcher,
        audit,
        settings: ArcSwap::from_pointee(settings),
        shutdown,
    });

    Ok(Init {
        ctx,
        agent_streams: agent_streams_rx,
    })
}

/// Load persisted authorities or generate a fresh cluster
async fn load_or_bootstrap_ca(
    backend: &MemoryBackend,
    config: &GatewayConfig,
) -> GatewayResult<CaStore> {
    let stored: Vec<StoredAuthority> =
        resources::list(backend, ResourceKind::CertAuthority).await?;

    if !stored.is_empty() {
        return CaStore::from_stored(config.cluster_name.clone(), stored);
    }

    let ca = CaStore::bootstrap(config.cluster_name.clone())?;
    for authority in ca.snapshot()? {
        resources::upsert(
            backend,
            ResourceKind::CertAuthority,
            &authority.ca_type.to_string(),
            &authority,
            None,
        )
        .await?;
    }
    Ok(ca)
}

/// Every agent-opened inventory stream gets served against the auth side
fn spawn_inventory_acceptor(ctx: &GatewayCtx, mut agent_streams: mpsc::Receiver<AgentStream>) {
    let registry = inventory::InventoryRegistry::default();
    let ctx = ctx.clone();

    tokio::spawn(async move {
        loop {
            let stream = tokio::select! {
                stream = agent_streams.recv() => stream,
                _ = ctx.shutdown.cancelled() => return,
            };
            let Some(agent_stream) = stream else { return };

            debug!(server_id = %agent_stream.server_id, "inventory stream opened");
            tokio::spawn(inventory::serve_stream(
                agent_stream.stream,
                registry.clone(),
                ctx.auth.clone(),
                ctx.config.cluster_name.to_string(),
                ctx.shutdown.child_token(),
            ));
        }
    });
}

/// Strict locking fails closed: when the lock watcher reports stale, all
/// sessions terminate after the grace period.
fn spawn_lock_enforcement(ctx: &GatewayCtx) {
    if !matches!(ctx.config.locking_mode, LockingMode::Strict) {
        return;
    }

    let ctx = ctx.clone();
    tokio::spawn(async move {
        let mut stale = ctx.auth.lock_watcher().stale_signal();
        loop {
            tokio::select! {
                changed = stale.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = ctx.shutdown.cancelled() => return,
            }

            if !*stale.borrow() {
                continue;
            }

            let grace = ctx.settings.load().lock_stale_grace_period;
            tokio::time::sleep(grace).await;
            if *stale.borrow() {
                warn!("lock freshness lost, terminating sessions");
                active_sessions().terminate_all();
            }
        }
    });
}

/// Process-wide live session registry
pub fn active_sessions() -> &'static ActiveSessions {
    static SESSIONS: std::sync::OnceLock<ActiveSessions> = std::sync::OnceLock::new();
    SESSIONS.get_or_init(ActiveSessions::default)
}

/// Consume demultiplexed connections and run each protocol's dispatch path
pub fn spawn_dispatch(ctx: GatewayCtx, mut conns: mpsc::Receiver<RoutedConn>) {
    tokio::spawn(async move {
        loop {
            let conn = tokio::select! {
                conn = conns.recv() => conn,
                _ = ctx.shutdown.cancelled() => return,
            };
            let Some(conn) = conn else { return };

            let ctx = ctx.clone();
            tokio::spawn(async move {
                let peer = conn.peer;
                let protocol = conn.protocol;
                if let Err(err) = dispatch_conn(ctx, conn).await {
                    debug!(?err, %peer, ?protocol, "connection ended");
                }
            });
        }
    });
}

async fn dispatch_conn(ctx: GatewayCtx, conn: RoutedConn) -> GatewayResult<()> {
    match conn.protocol {
        RoutedProtocol::ReverseTunnel => {
            ctx.tunnel_server.accept(conn.stream).await?;
            Ok(())
        }
        RoutedProtocol::Web => serve_web_conn(ctx, conn).await,
        RoutedProtocol::ProxySsh | RoutedProtocol::Tcp => proxy_dial_conn(ctx, conn).await,
        RoutedProtocol::Database(db) => proxy_db_conn(ctx, conn, db).await,
        RoutedProtocol::Kubernetes => proxy_kube_conn(ctx, conn).await,
        RoutedProtocol::Ssh => {
            // raw SSH at the port belongs to the external SSH subsystem
            debug!(peer = %conn.peer, "raw SSH connection, no subsystem attached");
            Ok(())
        }
    }
}

/// Serve the web API over one demultiplexed connection
async fn serve_web_conn(ctx: GatewayCtx, conn: RoutedConn) -> GatewayResult<()> {
    let identity = web::PeerIdentity(conn.identity);
    let router = web::router().with_state(ctx.clone());

    let connection_builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
    let connection = connection_builder.serve_connection_with_upgrades(
        TokioIo::new(conn.stream),
        hyper::service::service_fn(move |mut req| {
            req.extensions_mut().insert(identity.clone());
            let mut router = router.clone();
            async move {
                poll_fn(|cx| {
                    <axum::Router as tower::Service<http::Request<hyper::body::Incoming>>>::poll_ready(
                        &mut router,
                        cx,
                    )
                })
                .await?;
                router.call(req).await
            }
        }),
    );

    tokio::pin!(connection);
    loop {
        tokio::select! {
            biased;
            result = connection.as_mut() => {
                if let Err(err) = result {
                    debug!(?err, "web connection error");
                }
                return Ok(());
            }
            _ = ctx.shutdown.cancelled() => {
                connection.as_mut().graceful_shutdown();
            }
        }
    }
}

/// Dial-through path for proxied SSH and TCP app streams: the client sends
/// a dial preamble naming the target host
async fn proxy_dial_conn(ctx: GatewayCtx, mut conn: RoutedConn) -> GatewayResult<()> {
    let request = drawbridge_tunnel::dial::read_request(&mut conn.stream).await?;
    let (host, port) = match request.target.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.to_string()),
        None => (request.target.clone(), String::new()),
    };

    let roles = match &conn.identity {
        Some(identity) => {
            ctx.auth
                .lock_watcher()
                .check(&auth::LockQuery::for_user(&identity.username, &identity.groups))?;
            match ctx.auth.get_user(&identity.username).await {
                Ok(user) => Some(ctx.auth.role_set_for(&user).await?),
                Err(_) => None,
            }
        }
        None => None,
    };

    let node_source = Arc::new(BackendNodeSource {
        backend: ctx.backend.clone(),
        strategy: RoutingStrategy::default(),
    });
    let router = Router::new(ctx.tunnel_server.clone(), node_source);

    let route = router
        .route(
            &RouteRequest {
                host,
                port,
                cluster: conn
                    .identity
                    .as_ref()
                    .and_then(|identity| identity.route_to_cluster.clone()),
            },
            roles.as_ref(),
        )
        .await?;

    let dialed = router.dial(&route).await?;
    splice(conn.stream, dialed).await
}

/// Database path: the route travels inside the client certificate
async fn proxy_db_conn(ctx: GatewayCtx, conn: RoutedConn, _db: DbProtocol) -> GatewayResult<()> {
    let identity = conn.identity.clone().ok_or(GatewayError::AccessDenied)?;
    let db_route = identity
        .route_to_database
        .clone()
        .ok_or_else(|| {
            GatewayError::InvalidArgument("certificate carries no database route".to_string())
        })?;

    ctx.auth
        .lock_watcher()
        .check(&auth::LockQuery::for_user(&identity.username, &identity.groups))?;

    let user = ctx.auth.get_user(&identity.username).await?;
    let roles = ctx.auth.role_set_for(&user).await?;

    let database: drawbridge_domain::resource::DatabaseServer =
        resources::get(&ctx.backend, ResourceKind::Database, &db_route.service_name).await?;

    roles.check_db_access(&database.labels)?;
    if let (Some(db_user), Some(db_name)) = (&db_route.username, &db_route.database) {
        roles.check_db_login(&database.labels, db_user, db_name)?;
    }

    let session_token = ctx.shutdown.child_token();
    active_sessions().register(session_token.clone());

    let tracker = SessionTracker::create(
        ctx.backend.clone(),
        "db",
        &database.name,
        &identity.username,
        0,
        session_token.child_token(),
    )
    .await?;
    tracker.set_state(SessionState::Active).await?;
    ctx.audit.emit(audit::AuditEvent::SessionStart {
        session_id: tracker.id(),
        user: identity.username.clone(),
        host: database.name.clone(),
    });

    let dialed = ctx
        .tunnel_server
        .dial(DialParams {
            cluster: None,
            server_id: Some(database.host_id.clone()),
            to_addr: Some(database.uri.clone()),
            conn_type: drawbridge_domain::resource::ConnectionType::Db,
            principals: vec![database.name.clone()],
            client_addr: Some(conn.peer.to_string()),
        })
        .await?;

    let result = tokio::select! {
        result = splice(conn.stream, dialed) => result,
        _ = session_token.cancelled() => Err(GatewayError::Canceled),
    };

    let _ = tracker.set_state(SessionState::Terminated).await;
    ctx.audit.emit(audit::AuditEvent::SessionEnd {
        session_id: tracker.id(),
        user: identity.username,
    });
    result
}

/// Kubernetes path: the cluster is named by the SNI prefix
async fn proxy_kube_conn(ctx: GatewayCtx, conn: RoutedConn) -> GatewayResult<()> {
    let identity = conn.identity.clone().ok_or(GatewayError::AccessDenied)?;
    let sni = conn
        .sni
        .clone()
        .ok_or_else(|| GatewayError::InvalidArgument("kube routing needs SNI".to_string()))?;

    let kube_name = sni
        .strip_prefix("kube.")
        .and_then(|rest| rest.split('.').next())
        .ok_or_else(|| GatewayError::InvalidArgument(format!("kube SNI {sni:?}")))?;

    let user = ctx.auth.get_user(&identity.username).await?;
    let roles = ctx.auth.role_set_for(&user).await?;

    let kube: drawbridge_domain::resource::KubeCluster =
        resources::get(&ctx.backend, ResourceKind::KubeCluster, kube_name).await?;
    roles.check_kube_access(&kube.labels)?;

    let upstream = tokio::net::TcpStream::connect(&kube.target_addr)
        .await
        .map_err(|err| {
            GatewayError::ConnectionProblem(format!("kube upstream {}: {err}", kube.target_addr))
        })?;

    splice(conn.stream, DialedConn::Direct(upstream)).await
}

async fn splice(
    mut client: Box<dyn listener::AsyncStream>,
    dialed: DialedConn,
) -> GatewayResult<()> {
    match dialed {
        DialedConn::Tunnel {
            mut stream,
            guard: _guard,
        } => {
            tokio::io::copy_bidirectional(&mut client, &mut stream).await?;
        }
        DialedConn::Direct(mut tcp) => {
            tokio::io::copy_bidirectional(&mut client, &mut tcp).await?;
        }
    }
    Ok(())
}
