//! Scenario tests wiring several components together. Narrow unit tests
//! live next to their modules.

use std::sync::Arc;

use arc_swap::ArcSwap;
use drawbridge_backend::memory::MemoryBackend;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEmitter, MemoryAuditSink};
use crate::auth::{AuthService, LockWatcher, WatchDispatcher};
use crate::ca::CaStore;
use crate::ctx::{GatewayCtx, GatewayState};
use crate::env_config::GatewayConfig;
use crate::settings::Settings;
use crate::tunnelsrv::{AgentStream, TunnelServer, TunnelServerConfig};

mod test_auth;
mod test_diag_api;
mod test_mtls;

pub(crate) struct TestGateway {
    pub ctx: GatewayCtx,
    pub audit_sink: MemoryAuditSink,
    pub agent_streams: Option<mpsc::Receiver<AgentStream>>,
    pub cancel: CancellationToken,
}

/// A single-process gateway over the in-memory backend, without any bound
/// listeners. Tests bind what they need.
pub(crate) async fn test_gateway(tunnel_config: TunnelServerConfig) -> TestGateway {
    crate::tls::init_tls_ring();

    let cancel = CancellationToken::new();
    let backend = MemoryBackend::new();
    let config = GatewayConfig {
        cluster_name: "root.test".parse().unwrap(),
        hostname: "proxy.test".to_string(),
        ..Default::default()
    }
    .check_and_set_defaults()
    .unwrap();

    let ca = Arc::new(CaStore::bootstrap(config.cluster_name.clone()).unwrap());
    let audit_sink = MemoryAuditSink::default();
    let audit = AuditEmitter::spawn(audit_sink.clone(), cancel.child_token());
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

    let (agent_streams_tx, agent_streams_rx) = mpsc::channel(32);
    let tunnel_server = TunnelServer::spawn(
        config.cluster_name.clone(),
        tunnel_config,
        Some(agent_streams_tx),
        cancel.child_token(),
    )
    .unwrap();

    let ctx = GatewayCtx::new(GatewayState {
        config,
        backend,
        ca,
        auth,
        tunnel_server,
        dispatcher,
        audit,
        settings: ArcSwap::from_pointee(Settings::default()),
        shutdown: cancel.clone(),
    });

    TestGateway {
        ctx,
        audit_sink,
        agent_streams: Some(agent_streams_rx),
        cancel,
    }
}
