//! Common context for the whole gateway process.

use std::ops::Deref;
use std::sync::Arc;

use arc_swap::ArcSwap;
use drawbridge_backend::memory::MemoryBackend;
use drawbridge_domain::cluster::ClusterName;
use drawbridge_domain::label::Labels;
use drawbridge_domain::resource::{ResourceKind, RoutingStrategy, Server, TrustedCluster};
use drawbridge_domain::GatewayResult;
use tokio_util::sync::CancellationToken;

use crate::audit::AuditEmitter;
use crate::auth::{resources, AuthService, WatchDispatcher};
use crate::ca::CaStore;
use crate::env_config::GatewayConfig;
use crate::router::NodeSource;
use crate::settings::Settings;
use crate::tunnelsrv::TunnelServer;

/// A clonable wrapper for [GatewayState]
#[derive(Clone)]
pub struct GatewayCtx {
    state: Arc<GatewayState>,
}

impl GatewayCtx {
    pub fn new(state: GatewayState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }
}

impl Deref for GatewayCtx {
    type Target = Arc<GatewayState>;

    fn deref(&self) -> &Self::Target {
        &self.state
    }
}

pub struct GatewayState {
    pub config: GatewayConfig,
    /// Single-process deployments run on the in-memory driver; external
    /// drivers implement the same backend interface out of tree
    pub backend: MemoryBackend,
    pub ca: Arc<CaStore>,
    pub auth: Arc<AuthService<MemoryBackend>>,
    pub tunnel_server: Arc<TunnelServer>,
    pub dispatcher: WatchDispatcher,
    pub audit: AuditEmitter,
    /// Dynamically updatable settings
    pub settings: ArcSwap<Settings>,
    /// Signal triggered when the process is shutting down
    pub shutdown: CancellationToken,
}

/// Watcher-backed node source for the router
pub struct BackendNodeSource {
    pub backend: MemoryBackend,
    pub strategy: RoutingStrategy,
}

impl NodeSource for BackendNodeSource {
    async fn nodes(&self, cluster: &ClusterName) -> GatewayResult<Vec<Server>> {
        let nodes: Vec<Server> = resources::list(&self.backend, ResourceKind::Node).await?;
        Ok(nodes
            .into_iter()
            .filter(|node| &node.cluster == cluster)
            .collect())
    }

    async fn routing_strategy(&self, _cluster: &ClusterName) -> RoutingStrategy {
        self.strategy
    }

    async fn cluster_labels(&self, cluster: &ClusterName) -> GatewayResult<Labels> {
        let trusted: TrustedCluster = resources::get(
            &self.backend,
            ResourceKind::TrustedCluster,
            cluster.as_str(),
        )
        .await?;
        Ok(trusted.labels)
    }
}
