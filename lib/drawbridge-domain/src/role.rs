//! Roles and access checking.
//!
//! Policies compose by set union for `allow` and override for `deny`: an
//! operation is permitted when at least one role allows it and no role
//! denies it.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::ClusterName;
use crate::error::{GatewayError, GatewayResult};
use crate::label::{LabelMatcher, Labels, WILDCARD};
use crate::resource::Server;

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct Role {
    pub name: String,
    #[serde(default)]
    pub allow: RoleConditions,
    #[serde(default)]
    pub deny: RoleConditions,
    #[serde(default)]
    pub options: RoleOptions,
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct RoleConditions {
    #[serde(default)]
    pub node_labels: LabelMatcher,
    #[serde(default)]
    pub logins: Vec<String>,
    #[serde(default)]
    pub kube_groups: Vec<String>,
    #[serde(default)]
    pub kube_users: Vec<String>,
    #[serde(default)]
    pub kube_labels: LabelMatcher,
    #[serde(default)]
    pub db_labels: LabelMatcher,
    #[serde(default)]
    pub db_users: Vec<String>,
    #[serde(default)]
    pub db_names: Vec<String>,
    #[serde(default)]
    pub cluster_labels: LabelMatcher,
    #[serde(default)]
    pub impersonate: ImpersonateConditions,
    #[serde(default)]
    pub join_sessions: Vec<SessionJoinPolicy>,
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct ImpersonateConditions {
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct SessionJoinPolicy {
    pub name: String,
    #[serde(default)]
    pub kinds: Vec<String>,
    #[serde(default)]
    pub modes: Vec<String>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct RoleOptions {
    /// Upper bound for certificates minted to holders of this role
    #[serde(with = "humantime_duration")]
    pub max_session_ttl: Duration,
    #[serde(default)]
    pub require_session_mfa: bool,
    /// Number of moderators that must be present for sessions to start
    #[serde(default)]
    pub moderators_required: u32,
}

impl Default for RoleOptions {
    fn default() -> Self {
        Self {
            max_session_ttl: Duration::from_secs(12 * 60 * 60),
            require_session_mfa: false,
            moderators_required: 0,
        }
    }
}

mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

fn list_permits(list: &[String], wanted: &str) -> bool {
    list.iter().any(|entry| entry == WILDCARD || entry == wanted)
}

/// The evaluated role set of one identity. All checks fail closed:
/// no roles means no access.
#[derive(Clone, Default, Debug)]
pub struct RoleSet {
    roles: Vec<Role>,
}

impl RoleSet {
    pub fn new(roles: Vec<Role>) -> Self {
        Self { roles }
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    pub fn role_names(&self) -> impl Iterator<Item = &str> {
        self.roles.iter().map(|role| role.name.as_str())
    }

    /// The shortest non-zero max_session_ttl across the set
    pub fn max_session_ttl(&self) -> Duration {
        self.roles
            .iter()
            .map(|role| role.options.max_session_ttl)
            .filter(|ttl| !ttl.is_zero())
            .min()
            .unwrap_or(RoleOptions::default().max_session_ttl)
    }

    pub fn moderators_required(&self) -> u32 {
        self.roles
            .iter()
            .map(|role| role.options.moderators_required)
            .max()
            .unwrap_or(0)
    }

    /// All logins the set allows, denies removed. Used as the SSH principal set.
    pub fn allowed_logins(&self) -> Vec<String> {
        let mut logins: Vec<String> = self
            .roles
            .iter()
            .flat_map(|role| role.allow.logins.iter().cloned())
            .filter(|login| login != WILDCARD)
            .collect();
        logins.sort();
        logins.dedup();
        logins.retain(|login| {
            !self
                .roles
                .iter()
                .any(|role| list_permits(&role.deny.logins, login))
        });
        logins
    }

    pub fn check_node_access(&self, server: &Server, login: &str) -> GatewayResult<()> {
        if self.roles.iter().any(|role| {
            role.deny.node_labels.matches(&server.labels) || list_permits(&role.deny.logins, login)
        }) {
            return Err(GatewayError::AccessDenied);
        }

        let allowed = self.roles.iter().any(|role| {
            role.allow.node_labels.matches(&server.labels)
                && list_permits(&role.allow.logins, login)
        });

        if allowed {
            Ok(())
        } else {
            Err(GatewayError::AccessDenied)
        }
    }

    /// Access to the database resource itself (is an agent allowed to proxy it)
    pub fn check_db_access(&self, db_labels: &Labels) -> GatewayResult<()> {
        if self
            .roles
            .iter()
            .any(|role| role.deny.db_labels.matches(db_labels))
        {
            return Err(GatewayError::AccessDenied);
        }

        if self
            .roles
            .iter()
            .any(|role| role.allow.db_labels.matches(db_labels))
        {
            Ok(())
        } else {
            Err(GatewayError::AccessDenied)
        }
    }

    /// Access to a concrete (db_user, db_name) pair within a database
    pub fn check_db_login(
        &self,
        db_labels: &Labels,
        db_user: &str,
        db_name: &str,
    ) -> GatewayResult<()> {
        if self.roles.iter().any(|role| {
            list_permits(&role.deny.db_users, db_user) || list_permits(&role.deny.db_names, db_name)
        }) {
            return Err(GatewayError::AccessDenied);
        }

        let allowed = self.roles.iter().any(|role| {
            role.allow.db_labels.matches(db_labels)
                && list_permits(&role.allow.db_users, db_user)
                && list_permits(&role.allow.db_names, db_name)
        });

        if allowed {
            Ok(())
        } else {
            Err(GatewayError::AccessDenied)
        }
    }

    pub fn check_kube_access(&self, kube_labels: &Labels) -> GatewayResult<()> {
        if self
            .roles
            .iter()
            .any(|role| role.deny.kube_labels.matches(kube_labels))
        {
            return Err(GatewayError::AccessDenied);
        }

        if self
            .roles
            .iter()
            .any(|role| role.allow.kube_labels.matches(kube_labels))
        {
            Ok(())
        } else {
            Err(GatewayError::AccessDenied)
        }
    }

    /// Whether dialing into `cluster` is permitted at all. The caller maps
    /// failure to an opaque access-denied so remote topology never leaks.
    pub fn check_remote_cluster_access(
        &self,
        _cluster: &ClusterName,
        cluster_labels: &Labels,
    ) -> GatewayResult<()> {
        if self
            .roles
            .iter()
            .any(|role| role.deny.cluster_labels.matches(cluster_labels))
        {
            return Err(GatewayError::AccessDenied);
        }

        let allowed = self.roles.iter().any(|role| {
            !role.allow.cluster_labels.is_empty()
                && role.allow.cluster_labels.matches(cluster_labels)
        });

        if allowed {
            Ok(())
        } else {
            Err(GatewayError::AccessDenied)
        }
    }

    pub fn check_impersonate(&self, user: &str, roles: &[String]) -> GatewayResult<()> {
        if self.roles.iter().any(|role| {
            list_permits(&role.deny.impersonate.users, user)
                || roles
                    .iter()
                    .any(|r| list_permits(&role.deny.impersonate.roles, r))
        }) {
            return Err(GatewayError::AccessDenied);
        }

        let allowed = self.roles.iter().any(|role| {
            list_permits(&role.allow.impersonate.users, user)
                && roles
                    .iter()
                    .all(|r| list_permits(&role.allow.impersonate.roles, r))
        });

        if allowed {
            Ok(())
        } else {
            Err(GatewayError::AccessDenied)
        }
    }
}

/// Role mapping on a trusted-cluster edge: translates remote role names to
/// local roles on every cert check.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(transparent)]
pub struct RoleMap(pub BTreeMap<String, Vec<String>>);

impl RoleMap {
    pub fn map_roles(&self, remote_roles: &[String]) -> Vec<String> {
        let mut local: Vec<String> = remote_roles
            .iter()
            .flat_map(|remote| {
                self.0
                    .get(remote)
                    .or_else(|| self.0.get(WILDCARD))
                    .cloned()
                    .unwrap_or_default()
            })
            .collect();
        local.sort();
        local.dedup();
        local
    }
}
