//! Certificate authority material.
//!
//! Each cluster owns one authority per [CaType]. The active key set signs
//! and is presented; during rotation the additional set holds successor
//! keys that are trusted for verification before they take over signing.

use drawbridge_domain::cert::SigningCert;
use drawbridge_domain::cluster::ClusterName;
use drawbridge_domain::sshcert::SshCa;
use drawbridge_domain::{GatewayError, GatewayResult};
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use ssh_key::Fingerprint;

use super::rotation::RotationPhase;

#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Debug,
    strum::Display,
    strum::EnumIter,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CaType {
    Host,
    User,
    Database,
    Jwt,
    Openssh,
    SamlIdp,
    OidcIdp,
}

impl CaType {
    /// Authorities that also maintain an SSH signing key
    pub fn carries_ssh_key(&self) -> bool {
        matches!(self, Self::Host | Self::User | Self::Openssh)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Host => "Host",
            Self::User => "User",
            Self::Database => "Database",
            Self::Jwt => "JWT",
            Self::Openssh => "OpenSSH",
            Self::SamlIdp => "SAML IdP",
            Self::OidcIdp => "OIDC IdP",
        }
    }
}

/// One or more signing key pairs, SSH and/or TLS
pub struct KeySet {
    pub tls: Vec<SigningCert>,
    pub ssh: Vec<SshCa>,
}

impl KeySet {
    pub fn generate(cluster: &ClusterName, ca_type: CaType) -> GatewayResult<Self> {
        let tls = SigningCert::new_self_signed(drawbridge_domain::cert::gateway_ca(
            cluster,
            ca_type.label(),
        ))?;
        let ssh = if ca_type.carries_ssh_key() {
            vec![SshCa::generate()?]
        } else {
            vec![]
        };
        Ok(Self {
            tls: vec![tls],
            ssh,
        })
    }

    pub fn empty() -> Self {
        Self {
            tls: vec![],
            ssh: vec![],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tls.is_empty() && self.ssh.is_empty()
    }

    pub fn primary_tls(&self) -> GatewayResult<&SigningCert> {
        self.tls
            .first()
            .ok_or_else(|| GatewayError::BadParameter("authority has no TLS key".to_string()))
    }

    pub fn primary_ssh(&self) -> GatewayResult<&SshCa> {
        self.ssh
            .first()
            .ok_or_else(|| GatewayError::BadParameter("authority has no SSH key".to_string()))
    }

    pub fn tls_certs(&self) -> impl Iterator<Item = &CertificateDer<'static>> {
        self.tls.iter().map(|cert| &cert.der)
    }

    pub fn ssh_fingerprints(&self) -> impl Iterator<Item = Fingerprint> + '_ {
        self.ssh.iter().map(|ca| ca.fingerprint())
    }
}

pub struct CertAuthority {
    pub ca_type: CaType,
    pub cluster: ClusterName,
    pub active: KeySet,
    pub additional: KeySet,
    pub phase: RotationPhase,
}

impl CertAuthority {
    pub fn generate(cluster: ClusterName, ca_type: CaType) -> GatewayResult<Self> {
        Ok(Self {
            active: KeySet::generate(&cluster, ca_type)?,
            additional: KeySet::empty(),
            phase: RotationPhase::Standby,
            ca_type,
            cluster,
        })
    }

    /// The key set currently used for signing
    pub fn signing(&self) -> &KeySet {
        match self.phase {
            RotationPhase::Standby | RotationPhase::Init => &self.active,
            RotationPhase::UpdateClients | RotationPhase::UpdateServers => &self.additional,
        }
    }

    /// The key set servers present during handshakes
    pub fn presented(&self) -> &KeySet {
        match self.phase {
            RotationPhase::UpdateServers => &self.additional,
            _ => &self.active,
        }
    }

    /// Everything trusted for verification: active plus any successor keys
    pub fn trusted_tls(&self) -> Vec<CertificateDer<'static>> {
        self.active
            .tls_certs()
            .chain(self.additional.tls_certs())
            .cloned()
            .collect()
    }

    pub fn trusted_ssh(&self) -> Vec<Fingerprint> {
        self.active
            .ssh_fingerprints()
            .chain(self.additional.ssh_fingerprints())
            .collect()
    }
}

/// Serialized authority shape persisted to the backend
#[derive(Serialize, Deserialize)]
pub struct StoredAuthority {
    pub ca_type: CaType,
    pub cluster: ClusterName,
    pub active: StoredKeySet,
    pub additional: StoredKeySet,
    pub phase: RotationPhase,
}

#[derive(Serialize, Deserialize, Default)]
pub struct StoredKeySet {
    pub tls: Vec<StoredTlsKey>,
    pub ssh: Vec<String>,
}

#[derive(Serialize, Deserialize)]
pub struct StoredTlsKey {
    #[serde(with = "hex")]
    pub key_der: Vec<u8>,
    #[serde(with = "hex")]
    pub cert_der: Vec<u8>,
}

impl StoredKeySet {
    fn from_keys(keys: &KeySet) -> GatewayResult<Self> {
        Ok(Self {
            tls: keys
                .tls
                .iter()
                .map(|cert| StoredTlsKey {
                    key_der: cert.key.serialize_der(),
                    cert_der: cert.der.to_vec(),
                })
                .collect(),
            ssh: keys
                .ssh
                .iter()
                .map(|ca| ca.to_openssh())
                .collect::<GatewayResult<_>>()?,
        })
    }

    fn into_keys(self) -> GatewayResult<KeySet> {
        Ok(KeySet {
            tls: self
                .tls
                .into_iter()
                .map(|stored| {
                    SigningCert::from_parts(
                        &stored.key_der,
                        CertificateDer::from(stored.cert_der).into_owned(),
                    )
                })
                .collect::<GatewayResult<_>>()?,
            ssh: self
                .ssh
                .iter()
                .map(|pem| SshCa::from_openssh(pem))
                .collect::<GatewayResult<_>>()?,
        })
    }
}

impl StoredAuthority {
    pub fn from_authority(authority: &CertAuthority) -> GatewayResult<Self> {
        Ok(Self {
            ca_type: authority.ca_type,
            cluster: authority.cluster.clone(),
            active: StoredKeySet::from_keys(&authority.active)?,
            additional: StoredKeySet::from_keys(&authority.additional)?,
            phase: authority.phase,
        })
    }

    pub fn into_authority(self) -> GatewayResult<CertAuthority> {
        let authority = CertAuthority {
            ca_type: self.ca_type,
            cluster: self.cluster,
            active: self.active.into_keys()?,
            additional: self.additional.into_keys()?,
            phase: self.phase,
        };
        if authority.active.is_empty() {
            return Err(GatewayError::BadParameter(format!(
                "stored {} authority has no active keys",
                authority.ca_type
            )));
        }
        Ok(authority)
    }
}
