//! Kubernetes cluster reconciliation on a kube agent.
//!
//! The agent advertises a static cluster set from its configuration plus
//! dynamic clusters reconciled from the backend by a label selector. Static
//! entries always win name collisions.

use std::sync::{Arc, RwLock};

use drawbridge_backend::Backend;
use drawbridge_domain::label::LabelMatcher;
use drawbridge_domain::resource::{KubeCluster, ResourceKind};
use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::resources;
use crate::auth::watch::{WatchDispatcher, WatchEvent};

struct Reconciled {
    clusters: IndexMap<String, KubeCluster>,
}

pub struct KubeClusterSet {
    static_names: Vec<String>,
    selector: LabelMatcher,
    state: RwLock<Reconciled>,
}

impl KubeClusterSet {
    pub fn new(static_clusters: Vec<KubeCluster>, selector: LabelMatcher) -> Arc<Self> {
        let mut clusters = IndexMap::new();
        let mut static_names = Vec::with_capacity(static_clusters.len());
        for cluster in static_clusters {
            static_names.push(cluster.name.clone());
            clusters.insert(cluster.name.clone(), cluster);
        }

        Arc::new(Self {
            static_names,
            selector,
            state: RwLock::new(Reconciled { clusters }),
        })
    }

    /// Names currently advertised, static entries first
    pub fn names(&self) -> Vec<String> {
        self.state
            .read()
            .expect("kube set lock")
            .clusters
            .keys()
            .cloned()
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<KubeCluster> {
        self.state
            .read()
            .expect("kube set lock")
            .clusters
            .get(name)
            .cloned()
    }

    fn is_static(&self, name: &str) -> bool {
        self.static_names.iter().any(|n| n == name)
    }

    /// Fold one dynamic cluster into the set
    pub fn upsert_dynamic(&self, cluster: KubeCluster) {
        if self.is_static(&cluster.name) {
            // static registration wins; the dynamic one is ignored
            debug!(name = %cluster.name, "dynamic kube cluster shadows a static one, ignored");
            return;
        }

        let mut state = self.state.write().expect("kube set lock");
        if self.selector.matches(&cluster.labels) {
            info!(name = %cluster.name, "kube cluster reconciled");
            state.clusters.insert(cluster.name.clone(), cluster);
        } else if state.clusters.shift_remove(&cluster.name).is_some() {
            info!(name = %cluster.name, "kube cluster left the selector");
        }
    }

    pub fn remove_dynamic(&self, name: &str) {
        if self.is_static(name) {
            return;
        }
        let mut state = self.state.write().expect("kube set lock");
        if state.clusters.shift_remove(name).is_some() {
            info!(name, "kube cluster removed");
        }
    }

    /// Rebuild the dynamic part from a full list
    pub fn resync(&self, dynamic: Vec<KubeCluster>) {
        let mut state = self.state.write().expect("kube set lock");
        state
            .clusters
            .retain(|name, _| self.static_names.iter().any(|n| n == name));
        for cluster in dynamic {
            if self.is_static(&cluster.name) || !self.selector.matches(&cluster.labels) {
                continue;
            }
            state.clusters.insert(cluster.name.clone(), cluster);
        }
    }
}

/// Keep the set reconciled from the backend watch feed
pub fn spawn_reconciler<B: Backend + Clone>(
    set: Arc<KubeClusterSet>,
    backend: B,
    dispatcher: &WatchDispatcher,
    cancel: CancellationToken,
) {
    let mut stream = dispatcher.subscribe([ResourceKind::KubeCluster]);

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = stream.recv() => event,
                _ = cancel.cancelled() => return,
            };

            match event {
                Some(WatchEvent::Init) | Some(WatchEvent::Reset) => {
                    match resources::list::<KubeCluster>(&backend, ResourceKind::KubeCluster).await
                    {
                        Ok(dynamic) => set.resync(dynamic),
                        Err(err) => warn!(?err, "kube cluster re-list failed"),
                    }
                }
                Some(WatchEvent::Put { value, .. }) => {
                    match resources::decode::<KubeCluster>(ResourceKind::KubeCluster, &value) {
                        Ok(cluster) => set.upsert_dynamic(cluster),
                        Err(err) => warn!(?err, "undecodable kube cluster resource"),
                    }
                }
                Some(WatchEvent::Delete { name, .. }) => set.remove_dynamic(&name),
                None => {
                    warn!("kube cluster watch lost, reconciliation stalls until restart");
                    return;
                }
            }
        }
    });
}
