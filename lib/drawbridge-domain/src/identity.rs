//! The identity materialized inside issued certificates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::cluster::ClusterName;
use crate::error::{GatewayError, GatewayResult};
use crate::id::DiagnosticId;

/// What the certificate is scoped to. The returned cert embeds only the
/// route and principal set appropriate to its usage.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CertUsage {
    Ssh,
    Kubernetes,
    Database,
    Application,
    WindowsDesktop,
}

/// Database the certificate is scoped to, for database-usage certs
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct DatabaseRoute {
    /// The registered database resource name
    pub service_name: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct Identity {
    pub username: String,
    pub groups: Vec<String>,
    #[serde(default)]
    pub traits: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub route_to_cluster: Option<ClusterName>,
    #[serde(default)]
    pub route_to_database: Option<DatabaseRoute>,
    /// Resource ids this identity is narrowed to (resource access requests)
    #[serde(default)]
    pub allowed_resource_ids: Vec<String>,
    #[serde(default)]
    pub mfa_verified: bool,
    #[serde(default)]
    pub impersonator: Option<String>,
    #[serde(default)]
    pub active_requests: Vec<String>,
    /// Monotonically increasing counter on renewable identities, used to
    /// detect certificate reuse
    #[serde(default)]
    pub generation: u64,
    #[serde(default)]
    pub renewable: bool,
    #[serde(default)]
    pub disallow_reissue: bool,
    /// MFA-bound expiry; overrides the raw cert expiry when set
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub previous_identity_expires: Option<OffsetDateTime>,
    pub usage: CertUsage,
    #[serde(default)]
    pub connection_diagnostic_id: Option<DiagnosticId>,
}

impl Identity {
    pub fn new(username: impl Into<String>, groups: Vec<String>, usage: CertUsage) -> Self {
        Self {
            username: username.into(),
            groups,
            traits: BTreeMap::new(),
            route_to_cluster: None,
            route_to_database: None,
            allowed_resource_ids: vec![],
            mfa_verified: false,
            impersonator: None,
            active_requests: vec![],
            generation: 0,
            renewable: false,
            disallow_reissue: false,
            previous_identity_expires: None,
            usage,
            connection_diagnostic_id: None,
        }
    }

    /// Effective expiry: the MFA-bound previous-identity expiry overrides
    /// the raw certificate expiry when both are set.
    pub fn effective_expiry(&self, cert_not_after: OffsetDateTime) -> OffsetDateTime {
        match self.previous_identity_expires {
            Some(bound) if bound < cert_not_after => bound,
            _ => cert_not_after,
        }
    }

    pub fn check(&self) -> GatewayResult<()> {
        if self.username.is_empty() {
            return Err(GatewayError::InvalidArgument(
                "identity is missing a username".to_string(),
            ));
        }
        if let Some(impersonator) = &self.impersonator {
            if impersonator == &self.username {
                return Err(GatewayError::InvalidArgument(
                    "identity cannot impersonate itself".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn previous_identity_expiry_overrides() {
        let mut identity = Identity::new("alice", vec!["dev".to_string()], CertUsage::Ssh);
        let cert_expiry = OffsetDateTime::now_utc() + time::Duration::hours(8);

        assert_eq!(cert_expiry, identity.effective_expiry(cert_expiry));

        let mfa_bound = OffsetDateTime::now_utc() + time::Duration::hours(1);
        identity.previous_identity_expires = Some(mfa_bound);
        assert_eq!(mfa_bound, identity.effective_expiry(cert_expiry));

        // a later bound never extends the cert expiry
        identity.previous_identity_expires = Some(cert_expiry + time::Duration::hours(1));
        assert_eq!(cert_expiry, identity.effective_expiry(cert_expiry));
    }

    #[test]
    fn self_impersonation_rejected() {
        let mut identity = Identity::new("alice", vec![], CertUsage::Ssh);
        identity.impersonator = Some("alice".to_string());
        assert!(identity.check().is_err());
    }

    #[test]
    fn identity_serde_roundtrip() {
        let mut identity = Identity::new("alice", vec!["dev".to_string()], CertUsage::Database);
        identity.route_to_cluster = Some("leaf".parse().unwrap());
        identity.generation = 3;
        identity.renewable = true;

        let json = serde_json::to_string(&identity).unwrap();
        assert_eq!(identity, serde_json::from_str(&json).unwrap());
    }
}
