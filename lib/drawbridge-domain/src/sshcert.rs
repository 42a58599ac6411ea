//! OpenSSH certificate minting and validation.
//!
//! User identity travels in standard OpenSSH certificate extensions plus
//! the vendor extensions understood by node-side checkers.

use ssh_key::certificate::{Builder, CertType, Certificate};
use ssh_key::rand_core::OsRng;
use ssh_key::{Algorithm, Fingerprint, HashAlg, PrivateKey};
use time::OffsetDateTime;

use crate::cluster::ClusterName;
use crate::error::{GatewayError, GatewayResult};
use crate::identity::{CertUsage, Identity};

pub const EXT_USER: &str = "teleport-user";
pub const EXT_ROUTE_TO_CLUSTER: &str = "teleport-route-to-cluster";
pub const EXT_ACTIVE_REQUESTS: &str = "teleport-active-requests";
pub const EXT_DISALLOW_REISSUE: &str = "disallow-reissue";
pub const EXT_RENEWABLE: &str = "renewable";
pub const EXT_GENERATION: &str = "generation";
pub const EXT_ALLOWED_RESOURCES: &str = "allowed-resources";
pub const EXT_MFA_VERIFIED: &str = "mfa-verified";
pub const EXT_PREVIOUS_IDENTITY_EXPIRES: &str = "previous-identity-expires";
pub const EXT_IMPERSONATOR: &str = "impersonator";
pub const EXT_CONNECTION_DIAGNOSTIC_ID: &str = "connection-diagnostic-id";

pub const EXT_PERMIT_PTY: &str = "permit-pty";
pub const EXT_PERMIT_PORT_FORWARDING: &str = "permit-port-forwarding";

/// An SSH certificate authority key
pub struct SshCa {
    key: PrivateKey,
}

impl SshCa {
    pub fn generate() -> GatewayResult<Self> {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .map_err(|err| GatewayError::BadParameter(format!("ssh keygen: {err}")))?;
        Ok(Self { key })
    }

    pub fn from_openssh(pem: &str) -> GatewayResult<Self> {
        let key = PrivateKey::from_openssh(pem)
            .map_err(|err| GatewayError::BadParameter(format!("ssh CA key: {err}")))?;
        Ok(Self { key })
    }

    pub fn to_openssh(&self) -> GatewayResult<String> {
        self.key
            .to_openssh(ssh_key::LineEnding::LF)
            .map(|s| s.to_string())
            .map_err(|err| GatewayError::BadParameter(format!("ssh CA key: {err}")))
    }

    pub fn public_key_openssh(&self) -> GatewayResult<String> {
        self.key
            .public_key()
            .to_openssh()
            .map_err(|err| GatewayError::BadParameter(format!("ssh CA public key: {err}")))
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.key.public_key().fingerprint(HashAlg::Sha256)
    }

    /// Mint a user certificate. Principals are the allowed logins computed
    /// from the identity's role set; the validity bound honors the
    /// MFA-bound previous-identity expiry.
    pub fn mint_user_cert(
        &self,
        identity: &Identity,
        principals: &[String],
        not_after: OffsetDateTime,
    ) -> GatewayResult<Certificate> {
        identity.check()?;

        let subject = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .map_err(|err| GatewayError::BadParameter(format!("ssh keygen: {err}")))?;
        self.mint_user_cert_for_key(identity, principals, not_after, subject.public_key().clone())
    }

    pub fn mint_user_cert_for_key(
        &self,
        identity: &Identity,
        principals: &[String],
        not_after: OffsetDateTime,
        subject: ssh_key::PublicKey,
    ) -> GatewayResult<Certificate> {
        let valid_after = (OffsetDateTime::now_utc() - time::Duration::minutes(1)).unix_timestamp();
        let valid_before = identity.effective_expiry(not_after).unix_timestamp();

        let mut builder = Builder::new_with_random_nonce(
            &mut OsRng,
            subject.key_data().clone(),
            valid_after as u64,
            valid_before as u64,
        )
        .map_err(ssh_err)?;

        builder.cert_type(CertType::User).map_err(ssh_err)?;
        builder.key_id(identity.username.clone()).map_err(ssh_err)?;
        for principal in principals {
            builder.valid_principal(principal.clone()).map_err(ssh_err)?;
        }

        builder.extension(EXT_PERMIT_PTY, "").map_err(ssh_err)?;
        builder
            .extension(EXT_PERMIT_PORT_FORWARDING, "")
            .map_err(ssh_err)?;
        builder
            .extension(EXT_USER, identity.username.clone())
            .map_err(ssh_err)?;
        if let Some(route) = &identity.route_to_cluster {
            builder
                .extension(EXT_ROUTE_TO_CLUSTER, route.as_str())
                .map_err(ssh_err)?;
        }
        if !identity.active_requests.is_empty() {
            builder
                .extension(EXT_ACTIVE_REQUESTS, identity.active_requests.join(","))
                .map_err(ssh_err)?;
        }
        if identity.disallow_reissue {
            builder.extension(EXT_DISALLOW_REISSUE, "").map_err(ssh_err)?;
        }
        if identity.renewable {
            builder.extension(EXT_RENEWABLE, "").map_err(ssh_err)?;
        }
        if identity.generation > 0 {
            builder
                .extension(EXT_GENERATION, identity.generation.to_string())
                .map_err(ssh_err)?;
        }
        if !identity.allowed_resource_ids.is_empty() {
            builder
                .extension(
                    EXT_ALLOWED_RESOURCES,
                    identity.allowed_resource_ids.join(","),
                )
                .map_err(ssh_err)?;
        }
        if identity.mfa_verified {
            builder.extension(EXT_MFA_VERIFIED, "").map_err(ssh_err)?;
        }
        if let Some(expires) = identity.previous_identity_expires {
            builder
                .extension(
                    EXT_PREVIOUS_IDENTITY_EXPIRES,
                    expires.unix_timestamp().to_string(),
                )
                .map_err(ssh_err)?;
        }
        if let Some(impersonator) = &identity.impersonator {
            builder
                .extension(EXT_IMPERSONATOR, impersonator.clone())
                .map_err(ssh_err)?;
        }
        if let Some(diag_id) = &identity.connection_diagnostic_id {
            builder
                .extension(EXT_CONNECTION_DIAGNOSTIC_ID, diag_id.to_string())
                .map_err(ssh_err)?;
        }

        builder.sign(&self.key).map_err(ssh_err)
    }

    /// Mint a host certificate for a registered server
    pub fn mint_host_cert(
        &self,
        host_id: &str,
        node_name: &str,
        cluster: &ClusterName,
        principals: &[String],
        not_after: OffsetDateTime,
    ) -> GatewayResult<Certificate> {
        let subject = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .map_err(|err| GatewayError::BadParameter(format!("ssh keygen: {err}")))?;

        let valid_after = (OffsetDateTime::now_utc() - time::Duration::minutes(1)).unix_timestamp();

        let mut builder = Builder::new_with_random_nonce(
            &mut OsRng,
            subject.public_key().key_data().clone(),
            valid_after as u64,
            not_after.unix_timestamp() as u64,
        )
        .map_err(ssh_err)?;

        builder.cert_type(CertType::Host).map_err(ssh_err)?;
        builder
            .key_id(format!("{host_id}.{cluster}"))
            .map_err(ssh_err)?;
        builder.valid_principal(host_id).map_err(ssh_err)?;
        builder.valid_principal(node_name).map_err(ssh_err)?;
        for principal in principals {
            builder.valid_principal(principal.clone()).map_err(ssh_err)?;
        }

        builder.sign(&self.key).map_err(ssh_err)
    }
}

fn ssh_err(err: ssh_key::Error) -> GatewayError {
    GatewayError::BadParameter(format!("ssh certificate: {err}"))
}

/// Validate a certificate against a set of trusted CA fingerprints at `now`
pub fn validate_cert(
    cert: &Certificate,
    trusted: &[Fingerprint],
    now: OffsetDateTime,
) -> GatewayResult<()> {
    cert.validate_at(now.unix_timestamp() as u64, trusted.iter())
        .map_err(|_| GatewayError::AccessDenied)
}

/// Recover the identity from a user certificate's extensions
pub fn cert_identity(cert: &Certificate) -> GatewayResult<Identity> {
    let extensions = cert.extensions();

    let username = extensions
        .get(EXT_USER)
        .cloned()
        .unwrap_or_else(|| cert.key_id().to_string());
    if username.is_empty() {
        return Err(GatewayError::InvalidArgument(
            "certificate carries no user".to_string(),
        ));
    }

    let split_list = |key: &str| -> Vec<String> {
        extensions
            .get(key)
            .map(|v| v.split(',').map(str::to_string).collect())
            .unwrap_or_default()
    };

    let mut identity = Identity::new(username, vec![], CertUsage::Ssh);
    identity.route_to_cluster = match extensions.get(EXT_ROUTE_TO_CLUSTER) {
        Some(route) => Some(route.parse()?),
        None => None,
    };
    identity.active_requests = split_list(EXT_ACTIVE_REQUESTS);
    identity.allowed_resource_ids = split_list(EXT_ALLOWED_RESOURCES);
    identity.disallow_reissue = extensions.contains_key(EXT_DISALLOW_REISSUE);
    identity.renewable = extensions.contains_key(EXT_RENEWABLE);
    identity.mfa_verified = extensions.contains_key(EXT_MFA_VERIFIED);
    identity.generation = extensions
        .get(EXT_GENERATION)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    identity.impersonator = extensions.get(EXT_IMPERSONATOR).cloned();
    identity.previous_identity_expires = extensions
        .get(EXT_PREVIOUS_IDENTITY_EXPIRES)
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok());
    identity.connection_diagnostic_id = extensions
        .get(EXT_CONNECTION_DIAGNOSTIC_ID)
        .and_then(|v| v.parse().ok());

    Ok(identity)
}
