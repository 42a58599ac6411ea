//! Cluster-scoped resources persisted through the backend and cached by
//! proxies and agents via watchers.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::cluster::ClusterName;
use crate::label::Labels;
use crate::role::RoleMap;

#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug, strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Role,
    User,
    TrustedCluster,
    ReverseTunnel,
    Lock,
    Node,
    Database,
    KubeCluster,
    CertAuthority,
    SessionTracker,
    JoinToken,
    ResetToken,
    WebSession,
}

impl ResourceKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Role => "roles",
            Self::User => "users",
            Self::TrustedCluster => "trusted_clusters",
            Self::ReverseTunnel => "reverse_tunnels",
            Self::Lock => "locks",
            Self::Node => "nodes",
            Self::Database => "databases",
            Self::KubeCluster => "kube_clusters",
            Self::CertAuthority => "authorities",
            Self::SessionTracker => "session_trackers",
            Self::JoinToken => "tokens",
            Self::ResetToken => "reset_tokens",
            Self::WebSession => "web_sessions",
        }
    }
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix())
    }
}

/// A registered server (SSH node, proxy, or agent-published resource host).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct Server {
    /// Host UUID, stable across restarts
    pub id: String,
    pub hostname: String,
    /// Dial address; absent when the server is only reachable over a
    /// reverse tunnel
    pub addr: Option<String>,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires: Option<OffsetDateTime>,
    #[serde(default)]
    pub uses_tunnel: bool,
    pub cluster: ClusterName,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct User {
    pub name: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub traits: std::collections::BTreeMap<String, Vec<String>>,
    /// PHC-format password hash; absent for SSO-only users
    #[serde(default)]
    pub password_hash: Option<String>,
}

/// A database published by a database agent.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct DatabaseServer {
    pub name: String,
    pub protocol: DatabaseProtocol,
    /// `host:port` of the actual database endpoint
    pub uri: String,
    #[serde(default)]
    pub labels: Labels,
    /// The agent hosting this database
    pub host_id: String,
    /// Users/names that exist server-side, when the agent can enumerate them
    #[serde(default)]
    pub known_users: Vec<String>,
    #[serde(default)]
    pub known_names: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseProtocol {
    Postgres,
    Mysql,
    Mongodb,
    Snowflake,
    Cassandra,
    Redis,
    Sqlserver,
    Cockroachdb,
}

/// A Kubernetes cluster published by a kube agent. Static entries come from
/// agent configuration; dynamic ones are reconciled from the backend by a
/// label selector.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct KubeCluster {
    pub name: String,
    #[serde(default)]
    pub labels: Labels,
    /// Upstream API server address
    pub target_addr: String,
    #[serde(default)]
    pub dynamic: bool,
}

/// Directed trust: a leaf is configured with a token and the root's proxy
/// address; role mapping translates remote role names on every cert check.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct TrustedCluster {
    pub name: ClusterName,
    pub proxy_addr: String,
    #[serde(default)]
    pub role_map: RoleMap,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub enabled: bool,
}

/// Desired reverse tunnels for a proxy to maintain outbound.
/// Distinct from active agent pools, which are the runtime realization.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct ReverseTunnel {
    pub cluster_name: ClusterName,
    pub dial_addrs: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Debug, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionType {
    Node,
    Proxy,
    App,
    Db,
    Kube,
    WindowsDesktop,
}

/// Host roles a certificate can be issued for.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HostRole {
    Node,
    Proxy,
    Auth,
    App,
    Db,
    Kube,
    TrustedCluster,
    WindowsDesktop,
}

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    #[default]
    UnambiguousMatch,
    MostRecent,
}

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "snake_case")]
pub enum LockingMode {
    #[default]
    BestEffort,
    Strict,
}

/// A lock prevents matching sessions from proceeding. All populated target
/// fields must match for the lock to apply.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct Lock {
    pub name: String,
    #[serde(default)]
    pub target: LockTarget,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires: Option<OffsetDateTime>,
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct LockTarget {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub mfa_device: Option<String>,
    #[serde(default)]
    pub access_request: Option<String>,
    #[serde(default)]
    pub login: Option<String>,
}

impl LockTarget {
    pub fn is_empty(&self) -> bool {
        self.user.is_none()
            && self.role.is_none()
            && self.node.is_none()
            && self.mfa_device.is_none()
            && self.access_request.is_none()
            && self.login.is_none()
    }
}

impl Lock {
    pub fn in_force(&self, now: OffsetDateTime) -> bool {
        match self.expires {
            Some(expires) => expires > now,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_serde_roundtrip() {
        let server = Server {
            id: "b0a7ae52-5b6c-4a36-9c09-fcd74c3f5266".to_string(),
            hostname: "edge-1".to_string(),
            addr: None,
            labels: crate::label::labels_from([("env", "prod")]),
            expires: None,
            uses_tunnel: true,
            cluster: "root".parse().unwrap(),
        };
        let json = serde_json::to_string(&server).unwrap();
        assert_eq!(server, serde_json::from_str(&json).unwrap());

        let tunnel = ReverseTunnel {
            cluster_name: "leaf".parse().unwrap(),
            dial_addrs: vec!["proxy.example.com:3024".to_string()],
        };
        let json = serde_json::to_string(&tunnel).unwrap();
        assert_eq!(tunnel, serde_json::from_str(&json).unwrap());
    }

    #[test]
    fn lock_expiry() {
        let now = OffsetDateTime::now_utc();
        let mut lock = Lock {
            name: "ban-alice".to_string(),
            target: LockTarget {
                user: Some("alice".to_string()),
                ..Default::default()
            },
            message: None,
            expires: None,
        };
        assert!(lock.in_force(now));

        lock.expires = Some(now - time::Duration::minutes(1));
        assert!(!lock.in_force(now));
    }
}
