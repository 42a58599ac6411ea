//! The identity & CA store: minting, rotation, and validation of
//! certificates for one cluster.
//!
//! The store is the single writer of key material; readers work on DER
//! snapshots taken under a short read lock.

use std::collections::BTreeMap;
use std::sync::RwLock;

use rustls::pki_types::CertificateDer;
use rustls::{DistinguishedName, RootCertStore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use ssh_key::Fingerprint;
use strum::IntoEnumIterator;
use time::OffsetDateTime;
use tracing::info;

use drawbridge_domain::cert::{self, HostIdentity, IssuedCert};
use drawbridge_domain::cluster::ClusterName;
use drawbridge_domain::identity::{CertUsage, Identity};
use drawbridge_domain::resource::HostRole;
use drawbridge_domain::role::RoleSet;
use drawbridge_domain::{sshcert, GatewayError, GatewayResult};

pub mod authority;
pub mod rotation;
pub mod trust;

pub use authority::{CaType, CertAuthority, StoredAuthority};
pub use rotation::{RotationPhase, RotationRequest};

pub struct UserCertBundle {
    pub tls: IssuedCert,
    /// Present only for SSH usage
    pub ssh: Option<ssh_key::Certificate>,
}

pub struct HostCertBundle {
    pub tls: IssuedCert,
    pub ssh: ssh_key::Certificate,
}

/// A snapshot of key material trusted for verification
pub struct TrustedKeys {
    pub tls: Vec<CertificateDer<'static>>,
    pub ssh: Vec<Fingerprint>,
}

/// A remote cluster's CA registered through a trust relationship
pub struct RemoteAuthority {
    pub cluster: ClusterName,
    pub ca_type: CaType,
    pub der: CertificateDer<'static>,
}

pub struct CaStore {
    cluster: ClusterName,
    authorities: RwLock<BTreeMap<CaType, CertAuthority>>,
    remote: RwLock<Vec<RemoteAuthority>>,
}

impl CaStore {
    /// Generate the full authority set for a fresh cluster
    pub fn bootstrap(cluster: ClusterName) -> GatewayResult<Self> {
        let mut authorities = BTreeMap::new();
        for ca_type in CaType::iter() {
            authorities.insert(ca_type, CertAuthority::generate(cluster.clone(), ca_type)?);
        }
        info!(%cluster, "generated cluster certificate authorities");

        Ok(Self {
            cluster,
            authorities: RwLock::new(authorities),
            remote: RwLock::new(vec![]),
        })
    }

    pub fn from_stored(
        cluster: ClusterName,
        stored: Vec<StoredAuthority>,
    ) -> GatewayResult<Self> {
        let mut authorities = BTreeMap::new();
        for entry in stored {
            let authority = entry.into_authority()?;
            authorities.insert(authority.ca_type, authority);
        }
        for ca_type in CaType::iter() {
            if !authorities.contains_key(&ca_type) {
                return Err(GatewayError::BadParameter(format!(
                    "stored cluster state is missing the {ca_type} authority"
                )));
            }
        }

        Ok(Self {
            cluster,
            authorities: RwLock::new(authorities),
            remote: RwLock::new(vec![]),
        })
    }

    pub fn cluster(&self) -> &ClusterName {
        &self.cluster
    }

    pub fn snapshot(&self) -> GatewayResult<Vec<StoredAuthority>> {
        let authorities = self.authorities.read().expect("ca lock");
        authorities
            .values()
            .map(StoredAuthority::from_authority)
            .collect()
    }

    /// Issue the user certificate pair. When the identity impersonates
    /// another user, the requester's role set must grant it.
    pub fn issue_user_cert(
        &self,
        requester: Option<&RoleSet>,
        identity: &Identity,
        principals: &[String],
        ttl: time::Duration,
    ) -> GatewayResult<UserCertBundle> {
        identity.check()?;
        if ttl <= time::Duration::ZERO {
            return Err(GatewayError::InvalidArgument(
                "certificate ttl must be positive".to_string(),
            ));
        }

        if identity.impersonator.is_some() {
            let allowed = requester
                .map(|roles| {
                    roles
                        .check_impersonate(&identity.username, &identity.groups)
                        .is_ok()
                })
                .unwrap_or(false);
            if !allowed {
                return Err(GatewayError::AccessDenied);
            }
        }

        let authorities = self.authorities.read().expect("ca lock");
        let user_ca = authority(&authorities, CaType::User)?;

        let tls = user_ca
            .signing()
            .primary_tls()?
            .sign(cert::user_client_cert(identity, ttl)?)?;

        let ssh = match identity.usage {
            CertUsage::Ssh => {
                let not_after = OffsetDateTime::now_utc() + ttl;
                Some(user_ca.signing().primary_ssh()?.mint_user_cert(
                    identity,
                    principals,
                    not_after,
                )?)
            }
            _ => None,
        };

        Ok(UserCertBundle { tls, ssh })
    }

    pub fn issue_host_cert(
        &self,
        role: HostRole,
        host_uuid: &str,
        node_name: &str,
        cluster: &ClusterName,
        principals: &[String],
        ttl: time::Duration,
    ) -> GatewayResult<HostCertBundle> {
        if host_uuid.is_empty() || node_name.is_empty() {
            return Err(GatewayError::InvalidArgument(
                "host certificates need a host id and node name".to_string(),
            ));
        }

        let host = HostIdentity {
            host_id: host_uuid.to_string(),
            node_name: node_name.to_string(),
            role,
            cluster: cluster.clone(),
            principals: principals.to_vec(),
        };

        let authorities = self.authorities.read().expect("ca lock");
        let host_ca = authority(&authorities, CaType::Host)?;

        let tls = host_ca
            .signing()
            .primary_tls()?
            .sign(cert::host_cert(&host, ttl)?)?;
        let ssh = host_ca.signing().primary_ssh()?.mint_host_cert(
            host_uuid,
            node_name,
            cluster,
            principals,
            OffsetDateTime::now_utc() + ttl,
        )?;

        Ok(HostCertBundle { tls, ssh })
    }

    pub fn issue_db_cert(&self, sans: &[String], ttl: time::Duration) -> GatewayResult<IssuedCert> {
        let authorities = self.authorities.read().expect("ca lock");
        let db_ca = authority(&authorities, CaType::Database)?;
        db_ca
            .signing()
            .primary_tls()?
            .sign(cert::db_server_cert(sans, &self.cluster, ttl)?)
    }

    /// Drive the rotation state machine one step
    pub fn rotate(&self, ca_type: CaType, request: RotationRequest) -> GatewayResult<RotationPhase> {
        use rotation::RotationEffect;

        let mut authorities = self.authorities.write().expect("ca lock");
        let entry = authorities
            .get_mut(&ca_type)
            .ok_or_else(|| GatewayError::NotFound(format!("{ca_type} authority")))?;

        let (next, effect) = rotation::transition(entry.phase, request)?;

        match effect {
            RotationEffect::GenerateSuccessors => {
                entry.additional = authority::KeySet::generate(&self.cluster, ca_type)?;
            }
            RotationEffect::AdvancePhase => {}
            RotationEffect::PromoteSuccessors => {
                entry.active = std::mem::replace(&mut entry.additional, authority::KeySet::empty());
            }
            RotationEffect::DropSuccessors => {
                entry.additional = authority::KeySet::empty();
            }
        }
        entry.phase = next;

        info!(%ca_type, phase = %next, "authority rotation step");
        Ok(next)
    }

    pub fn rotation_phase(&self, ca_type: CaType) -> GatewayResult<RotationPhase> {
        let authorities = self.authorities.read().expect("ca lock");
        Ok(authority(&authorities, ca_type)?.phase)
    }

    /// The key set currently used for signing
    pub fn get_active_keys(&self, ca_type: CaType) -> GatewayResult<TrustedKeys> {
        let authorities = self.authorities.read().expect("ca lock");
        let entry = authority(&authorities, ca_type)?;
        Ok(TrustedKeys {
            tls: entry.signing().tls_certs().cloned().collect(),
            ssh: entry.signing().ssh_fingerprints().collect(),
        })
    }

    /// Everything trusted for verification, local predecessors and
    /// successors plus registered remote authorities of the same type
    pub fn get_all_trusted_keys(&self, ca_type: CaType) -> GatewayResult<TrustedKeys> {
        let authorities = self.authorities.read().expect("ca lock");
        let entry = authority(&authorities, ca_type)?;

        let mut tls = entry.trusted_tls();
        let ssh = entry.trusted_ssh();

        let remote = self.remote.read().expect("ca lock");
        tls.extend(
            remote
                .iter()
                .filter(|authority| authority.ca_type == ca_type)
                .map(|authority| authority.der.clone()),
        );

        Ok(TrustedKeys { tls, ssh })
    }

    /// Sign a server certificate with the host authority the way the
    /// rotation phase dictates
    pub fn sign_host_server_cert(
        &self,
        params: rcgen::CertificateParams,
    ) -> GatewayResult<IssuedCert> {
        let authorities = self.authorities.read().expect("ca lock");
        let entry = authority(&authorities, CaType::Host)?;
        entry.presented().primary_tls()?.sign(params)
    }

    pub fn register_remote_authority(&self, remote: RemoteAuthority) {
        let mut list = self.remote.write().expect("ca lock");
        list.retain(|existing| {
            existing.cluster != remote.cluster || existing.ca_type != remote.ca_type
        });
        list.push(remote);
    }

    pub fn remove_remote_authorities(&self, cluster: &ClusterName) {
        let mut list = self.remote.write().expect("ca lock");
        list.retain(|existing| &existing.cluster != cluster);
    }

    /// The AcceptableCAs subject list for the user CA handshake
    pub fn acceptable_ca_subjects(&self) -> GatewayResult<Vec<DistinguishedName>> {
        let trusted = self.get_all_trusted_keys(CaType::User)?;
        let local_primary = {
            let authorities = self.authorities.read().expect("ca lock");
            authority(&authorities, CaType::User)?
                .active
                .primary_tls()?
                .der
                .clone()
        };
        trust::acceptable_ca_subjects(&local_primary, &trusted.tls)
    }

    /// Root store trusting everything the given authority trusts
    pub fn root_cert_store(&self, ca_type: CaType) -> GatewayResult<RootCertStore> {
        let trusted = self.get_all_trusted_keys(ca_type)?;
        let mut store = RootCertStore::empty();
        for der in trusted.tls {
            store
                .add(der)
                .map_err(|err| GatewayError::BadParameter(format!("trust anchor: {err}")))?;
        }
        Ok(store)
    }

    /// Sign claims with the JWT authority (ES256)
    pub fn sign_jwt<C: Serialize>(&self, claims: &C) -> GatewayResult<String> {
        let authorities = self.authorities.read().expect("ca lock");
        let jwt_ca = authority(&authorities, CaType::Jwt)?;
        let key = &jwt_ca.signing().primary_tls()?.key;

        let encoding_key = jsonwebtoken::EncodingKey::from_ec_der(&key.serialize_der());
        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::ES256),
            claims,
            &encoding_key,
        )
        .map_err(|err| GatewayError::BadParameter(format!("jwt signing: {err}")))
    }

    pub fn verify_jwt<C: DeserializeOwned>(&self, token: &str) -> GatewayResult<C> {
        let trusted = self.get_all_trusted_keys(CaType::Jwt)?;

        for der in &trusted.tls {
            let Ok((_, cert)) = x509_parser::parse_x509_certificate(der) else {
                continue;
            };
            let decoding_key = jsonwebtoken::DecodingKey::from_ec_der(
                &cert.public_key().subject_public_key.data,
            );
            let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::ES256);
            validation.validate_exp = false;

            if let Ok(data) = jsonwebtoken::decode::<C>(token, &decoding_key, &validation) {
                return Ok(data.claims);
            }
        }

        Err(GatewayError::AccessDenied)
    }

    /// Validate an SSH user certificate against the trusted user CA keys
    pub fn validate_ssh_cert(
        &self,
        cert: &ssh_key::Certificate,
        now: OffsetDateTime,
    ) -> GatewayResult<Identity> {
        let trusted = self.get_all_trusted_keys(CaType::User)?;
        sshcert::validate_cert(cert, &trusted.ssh, now)?;
        sshcert::cert_identity(cert)
    }
}

fn authority<'a>(
    authorities: &'a BTreeMap<CaType, CertAuthority>,
    ca_type: CaType,
) -> GatewayResult<&'a CertAuthority> {
    authorities
        .get(&ca_type)
        .ok_or_else(|| GatewayError::NotFound(format!("{ca_type} authority")))
}
