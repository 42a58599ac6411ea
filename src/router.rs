//! The proxy router: resolves `(host, port, cluster)` to a concrete dial
//! path (a local node, a reverse tunnel, or a direct TCP target).

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;

use drawbridge_domain::cluster::ClusterName;
use drawbridge_domain::id::is_server_id;
use drawbridge_domain::label::Labels;
use drawbridge_domain::resource::{ConnectionType, RoutingStrategy, Server};
use drawbridge_domain::role::RoleSet;
use drawbridge_domain::{GatewayError, GatewayResult};
use tracing::debug;
use uuid::Uuid;

use crate::tunnelsrv::{DialParams, DialedConn, TunnelServer};

/// Sentinel address for servers only reachable over their tunnel
pub const LOCAL_NODE: &str = "local_node";
pub const DEFAULT_SSH_PORT: u16 = 3022;

#[derive(Clone, Debug)]
pub struct RouteRequest {
    pub host: String,
    /// Empty or "0" matches any port
    pub port: String,
    /// Empty means the local cluster
    pub cluster: Option<ClusterName>,
}

#[derive(Clone, Debug)]
pub struct Route {
    pub server: Option<Server>,
    pub server_addr: String,
    pub server_id: Option<String>,
    /// Acceptable SSH host-key principals; a surprise principal on the
    /// target is a fail-closed reject downstream
    pub principals: Vec<String>,
    pub cluster: ClusterName,
}

/// Where the router reads the node set and cluster metadata from
/// (a watcher-backed cache in production)
pub trait NodeSource: Send + Sync + 'static {
    fn nodes(&self, cluster: &ClusterName)
        -> impl Future<Output = GatewayResult<Vec<Server>>> + Send;

    fn routing_strategy(
        &self,
        cluster: &ClusterName,
    ) -> impl Future<Output = RoutingStrategy> + Send;

    fn cluster_labels(
        &self,
        cluster: &ClusterName,
    ) -> impl Future<Output = GatewayResult<Labels>> + Send;
}

/// Pure resolution against a fixed node set. `host_ips` are the resolved
/// addresses of the requested host, when DNS had anything to say.
pub fn resolve<'a>(
    host: &str,
    port: &str,
    nodes: &'a [Server],
    strategy: RoutingStrategy,
    host_ips: &[IpAddr],
) -> GatewayResult<Option<&'a Server>> {
    let dialing_by_id = is_server_id(host);

    let matches: Vec<&Server> = if dialing_by_id {
        // unambiguous: match only by server name, nothing else considered
        let matched: Vec<&Server> = nodes.iter().filter(|node| node.id == host).collect();
        if matched.len() == 1 {
            return Ok(Some(matched[0]));
        }
        if matched.is_empty() {
            let id_kind = if Uuid::parse_str(host).is_ok() {
                "id"
            } else {
                "instance id"
            };
            return Err(GatewayError::NotFound(format!("node with {id_kind} {host}")));
        }
        matched
    } else {
        nodes
            .iter()
            .filter(|node| {
                if node.uses_tunnel {
                    return node.hostname == host;
                }
                let Some(addr) = &node.addr else {
                    return node.hostname == host;
                };
                let (node_ip, node_port) = split_addr(addr);

                let host_matched = host == node_ip
                    || host == node.hostname
                    || host_ips.iter().any(|ip| ip.to_string() == node_ip);
                let port_matched =
                    port.is_empty() || port == "0" || port == node_port;

                host_matched && port_matched
            })
            .collect()
    };

    match matches.len() {
        0 => Ok(None),
        1 => Ok(Some(matches[0])),
        _ => match strategy {
            RoutingStrategy::UnambiguousMatch => {
                Err(GatewayError::NotFound("node is ambiguous".to_string()))
            }
            RoutingStrategy::MostRecent => Ok(matches
                .into_iter()
                .max_by(|a, b| {
                    a.expires
                        .cmp(&b.expires)
                        .then_with(|| a.hostname.cmp(&b.hostname))
                })),
        },
    }
}

fn split_addr(addr: &str) -> (&str, &str) {
    match addr.rsplit_once(':') {
        Some((host, port)) => (host, port),
        None => (addr, ""),
    }
}

pub struct Router<N> {
    tunnel_server: Arc<TunnelServer>,
    nodes: Arc<N>,
}

impl<N: NodeSource> Router<N> {
    pub fn new(tunnel_server: Arc<TunnelServer>, nodes: Arc<N>) -> Self {
        Self {
            tunnel_server,
            nodes,
        }
    }

    /// Resolve the target. A populated access checker gates remote-cluster
    /// routing; denial is opaque.
    pub async fn route(
        &self,
        request: &RouteRequest,
        checker: Option<&RoleSet>,
    ) -> GatewayResult<Route> {
        let local = self.tunnel_server.local_cluster();
        let cluster = match &request.cluster {
            None => local.clone(),
            Some(cluster) if cluster == local => local.clone(),
            Some(remote) => {
                self.tunnel_server
                    .get_site(remote)
                    .ok_or_else(|| GatewayError::NotFound(format!("cluster {remote}")))?;

                if let Some(checker) = checker {
                    let labels = self.nodes.cluster_labels(remote).await.unwrap_or_default();
                    checker
                        .check_remote_cluster_access(remote, &labels)
                        // the caller learns nothing about the remote topology
                        .map_err(|_| GatewayError::AccessDenied)?;
                }
                remote.clone()
            }
        };

        let nodes = self.nodes.nodes(&cluster).await?;
        let strategy = self.nodes.routing_strategy(&cluster).await;
        let host_ips = lookup(&request.host).await;

        let server = resolve(
            &request.host,
            &request.port,
            &nodes,
            strategy,
            &host_ips,
        )?;

        Ok(match server {
            Some(server) => build_route(server, &request.host, cluster),
            None => {
                // fall through to a direct TCP dial of host:port
                let port = if request.port.is_empty() || request.port == "0" {
                    DEFAULT_SSH_PORT.to_string()
                } else {
                    request.port.clone()
                };
                debug!(host = %request.host, %port, "no registered node, direct dial");
                Route {
                    server: None,
                    server_addr: format!("{}:{port}", request.host),
                    server_id: None,
                    principals: vec![request.host.clone()],
                    cluster,
                }
            }
        })
    }

    /// Dial a previously-resolved route through the tunnel fabric
    pub async fn dial(&self, route: &Route) -> GatewayResult<DialedConn> {
        let to_addr = (route.server_addr != LOCAL_NODE).then(|| route.server_addr.clone());
        self.tunnel_server
            .dial(DialParams {
                cluster: Some(route.cluster.clone()),
                server_id: route.server_id.clone(),
                to_addr,
                conn_type: ConnectionType::Node,
                principals: route.principals.clone(),
                client_addr: None,
            })
            .await
    }
}

fn build_route(server: &Server, requested_host: &str, cluster: ClusterName) -> Route {
    let server_addr = match (&server.addr, server.uses_tunnel) {
        (Some(addr), _) => addr.clone(),
        (None, _) => LOCAL_NODE.to_string(),
    };

    let mut principals = vec![requested_host.to_string(), server.id.clone()];
    if server_addr != LOCAL_NODE {
        let (ip, _) = split_addr(&server_addr);
        principals.push(ip.to_string());
    }
    principals.retain(|principal| !principal.is_empty());
    principals.dedup();

    Route {
        server: Some(server.clone()),
        server_addr,
        server_id: Some(server.id.clone()),
        principals,
        cluster,
    }
}

async fn lookup(host: &str) -> Vec<IpAddr> {
    if host.parse::<IpAddr>().is_ok() {
        return vec![];
    }
    match tokio::net::lookup_host(format!("{host}:0")).await {
        Ok(addrs) => addrs.map(|addr| addr.ip()).collect(),
        Err(_) => vec![],
    }
}
