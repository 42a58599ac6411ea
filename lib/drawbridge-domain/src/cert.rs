//! X.509 certificate construction.
//!
//! All cluster PKI is built on rcgen key pairs. The identity an issued
//! certificate carries is embedded as a JSON payload in a private
//! certificate extension and recovered on the verifying side with
//! x509-parser.

use pem::{EncodeConfig, Pem};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CustomExtension, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::cluster::ClusterName;
use crate::error::{GatewayError, GatewayResult};
use crate::identity::Identity;
use crate::resource::HostRole;

/// Private extension carrying the user identity payload
const IDENTITY_EXTENSION_OID: &[u64] = &[1, 3, 9999, 1, 1];
const IDENTITY_EXTENSION_OID_STR: &str = "1.3.9999.1.1";

/// Private extension carrying the host identity payload
const HOST_EXTENSION_OID: &[u64] = &[1, 3, 9999, 1, 2];
const HOST_EXTENSION_OID_STR: &str = "1.3.9999.1.2";

/// The identity materialized inside host certificates.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct HostIdentity {
    pub host_id: String,
    pub node_name: String,
    pub role: HostRole,
    pub cluster: ClusterName,
    #[serde(default)]
    pub principals: Vec<String>,
}

/// An issued certificate together with its private key.
pub struct IssuedCert {
    pub der: CertificateDer<'static>,
    pub key: KeyPair,
}

impl IssuedCert {
    pub fn certificate_pem(&self) -> String {
        pem::encode_config(
            &Pem::new("CERTIFICATE", self.der.to_vec()),
            EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
        )
    }

    pub fn certificate_and_key_pem(&self) -> String {
        format!("{}{}", self.certificate_pem(), self.key.serialize_pem())
    }

    pub fn private_key_der(&self) -> GatewayResult<PrivateKeyDer<'static>> {
        PrivateKeyDer::try_from(self.key.serialize_der())
            .map_err(|err| GatewayError::BadParameter(format!("private key: {err}")))
    }

    pub fn not_after(&self) -> GatewayResult<OffsetDateTime> {
        let (_, cert) = x509_parser::parse_x509_certificate(&self.der)
            .map_err(|err| GatewayError::InvalidArgument(format!("certificate: {err}")))?;
        OffsetDateTime::from_unix_timestamp(cert.validity().not_after.timestamp())
            .map_err(|_| GatewayError::InvalidArgument("certificate validity".to_string()))
    }
}

/// A signing key pair: either a self-signed root or an intermediate.
/// The single writer of CA material holds these; readers get DER snapshots.
pub struct SigningCert {
    pub cert: Certificate,
    pub der: CertificateDer<'static>,
    pub key: KeyPair,
}

impl SigningCert {
    /// Self-sign CA params with a fresh key pair
    pub fn new_self_signed(params: CertificateParams) -> GatewayResult<Self> {
        let key = generate_key()?;
        let cert = params
            .self_signed(&key)
            .map_err(|err| GatewayError::BadParameter(format!("self-sign: {err}")))?;
        Ok(Self {
            der: cert.der().clone(),
            cert,
            key,
        })
    }

    /// Reassemble a signer from persisted key and certificate DER. Leaf
    /// certificates signed by the reassembled signer chain to the original
    /// DER: the subject and key identifiers derive from the same key.
    pub fn from_parts(key_der: &[u8], cert_der: CertificateDer<'static>) -> GatewayResult<Self> {
        let key = KeyPair::try_from(key_der)
            .map_err(|err| GatewayError::BadParameter(format!("CA key: {err}")))?;
        let params = CertificateParams::from_ca_cert_der(&cert_der)
            .map_err(|err| GatewayError::BadParameter(format!("CA cert: {err}")))?;
        let cert = params
            .self_signed(&key)
            .map_err(|err| GatewayError::BadParameter(format!("CA re-sign: {err}")))?;
        Ok(Self {
            cert,
            der: cert_der,
            key,
        })
    }

    pub fn sign(&self, params: CertificateParams) -> GatewayResult<IssuedCert> {
        let key = generate_key()?;
        let cert = params
            .signed_by(&key, &self.cert, &self.key)
            .map_err(|err| GatewayError::BadParameter(format!("sign: {err}")))?;
        Ok(IssuedCert {
            der: cert.der().clone(),
            key,
        })
    }

    pub fn certificate_pem(&self) -> String {
        pem::encode_config(
            &Pem::new("CERTIFICATE", self.der.to_vec()),
            EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
        )
    }
}

pub fn generate_key() -> GatewayResult<KeyPair> {
    KeyPair::generate().map_err(|err| GatewayError::BadParameter(format!("keygen: {err}")))
}

/// CA params for one cluster authority, long expiry
pub fn gateway_ca(cluster: &ClusterName, ca_label: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(DnType::CommonName, format!("Drawbridge {ca_label} CA"));
    params
        .distinguished_name
        .push(DnType::OrganizationName, cluster.as_str());
    params.distinguished_name.push(
        DnType::CountryName,
        DnValue::PrintableString("NO".try_into().expect("static string")),
    );
    params.key_usages.push(KeyUsagePurpose::DigitalSignature);
    params.key_usages.push(KeyUsagePurpose::KeyCertSign);
    params.key_usages.push(KeyUsagePurpose::CrlSign);

    params.not_before = past(Duration::days(1));
    params.not_after = future(Duration::days(10 * 365));

    params
}

pub fn server_cert(
    common_name: &str,
    alt_names: impl Into<Vec<String>>,
    not_after: Duration,
) -> GatewayResult<CertificateParams> {
    let mut params = CertificateParams::new(alt_names)
        .map_err(|err| GatewayError::InvalidArgument(format!("subject alt names: {err}")))?;
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    params.use_authority_key_identifier_extension = true;
    params.key_usages.push(KeyUsagePurpose::DigitalSignature);
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ServerAuth);
    params.not_before = past(Duration::days(1));
    params.not_after = future(not_after);

    Ok(params)
}

/// Client certificate carrying a user identity payload
pub fn user_client_cert(identity: &Identity, not_after: Duration) -> GatewayResult<CertificateParams> {
    identity.check()?;

    let mut params = CertificateParams::new(vec![]).expect("no alt names");
    params
        .distinguished_name
        .push(DnType::CommonName, identity.username.as_str());
    params.use_authority_key_identifier_extension = true;
    params.key_usages.push(KeyUsagePurpose::DigitalSignature);
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ClientAuth);
    params.not_before = past(Duration::days(1));
    params.not_after = future(not_after);

    let payload = serde_json::to_vec(identity)
        .map_err(|err| GatewayError::InvalidArgument(format!("identity encoding: {err}")))?;
    params
        .custom_extensions
        .push(CustomExtension::from_oid_content(
            IDENTITY_EXTENSION_OID,
            payload,
        ));

    Ok(params)
}

/// Host certificate: both a server and a client cert, carrying the host
/// identity payload
pub fn host_cert(host: &HostIdentity, not_after: Duration) -> GatewayResult<CertificateParams> {
    let mut alt_names = vec![host.node_name.clone()];
    alt_names.extend(host.principals.iter().cloned());
    alt_names.retain(|name| !name.is_empty());
    alt_names.dedup();

    let mut params = CertificateParams::new(alt_names)
        .map_err(|err| GatewayError::InvalidArgument(format!("principals: {err}")))?;
    params
        .distinguished_name
        .push(DnType::CommonName, host.host_id.as_str());
    params
        .distinguished_name
        .push(DnType::OrganizationName, host.cluster.as_str());
    params.use_authority_key_identifier_extension = true;
    params.key_usages.push(KeyUsagePurpose::DigitalSignature);
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ServerAuth);
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ClientAuth);
    params.not_before = past(Duration::days(1));
    params.not_after = future(not_after);

    let payload = serde_json::to_vec(host)
        .map_err(|err| GatewayError::InvalidArgument(format!("host identity encoding: {err}")))?;
    params
        .custom_extensions
        .push(CustomExtension::from_oid_content(HOST_EXTENSION_OID, payload));

    Ok(params)
}

/// Database server certificate: CN is the primary DNS SAN, Organization is
/// the cluster name (MongoDB requires this exact subject shape).
pub fn db_server_cert(
    sans: &[String],
    cluster: &ClusterName,
    not_after: Duration,
) -> GatewayResult<CertificateParams> {
    let primary = sans.first().ok_or_else(|| {
        GatewayError::InvalidArgument("database certificate needs at least one SAN".to_string())
    })?;

    let mut params = CertificateParams::new(sans.to_vec())
        .map_err(|err| GatewayError::InvalidArgument(format!("subject alt names: {err}")))?;
    params.distinguished_name.push(DnType::CommonName, primary);
    params
        .distinguished_name
        .push(DnType::OrganizationName, cluster.as_str());
    params.use_authority_key_identifier_extension = true;
    params.key_usages.push(KeyUsagePurpose::DigitalSignature);
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ServerAuth);
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ClientAuth);
    params.not_before = past(Duration::days(1));
    params.not_after = future(not_after);

    Ok(params)
}

fn extension_payload<'a>(
    cert: &'a x509_parser::certificate::X509Certificate<'a>,
    oid_str: &str,
) -> Option<&'a [u8]> {
    cert.extensions()
        .iter()
        .find(|ext| ext.oid.to_id_string() == oid_str)
        .map(|ext| ext.value)
}

/// Recover the user identity embedded in a client certificate
pub fn peer_identity(der: &CertificateDer) -> GatewayResult<Identity> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|err| GatewayError::InvalidArgument(format!("peer certificate: {err}")))?;

    let payload = extension_payload(&cert, IDENTITY_EXTENSION_OID_STR).ok_or_else(|| {
        GatewayError::InvalidArgument("peer certificate carries no identity".to_string())
    })?;

    serde_json::from_slice(payload)
        .map_err(|err| GatewayError::InvalidArgument(format!("identity payload: {err}")))
}

/// Recover the host identity embedded in a host certificate
pub fn peer_host_identity(der: &CertificateDer) -> GatewayResult<HostIdentity> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|err| GatewayError::InvalidArgument(format!("peer certificate: {err}")))?;

    let payload = extension_payload(&cert, HOST_EXTENSION_OID_STR).ok_or_else(|| {
        GatewayError::InvalidArgument("peer certificate carries no host identity".to_string())
    })?;

    serde_json::from_slice(payload)
        .map_err(|err| GatewayError::InvalidArgument(format!("host identity payload: {err}")))
}

fn past(duration: Duration) -> OffsetDateTime {
    OffsetDateTime::now_utc() - duration
}

fn future(duration: Duration) -> OffsetDateTime {
    OffsetDateTime::now_utc() + duration
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::CertUsage;

    fn test_cluster() -> ClusterName {
        "root.example.com".parse().unwrap()
    }

    #[test]
    fn identity_survives_the_certificate() {
        let ca = SigningCert::new_self_signed(gateway_ca(&test_cluster(), "User")).unwrap();

        let mut identity = Identity::new("alice", vec!["dev".to_string()], CertUsage::Ssh);
        identity.route_to_cluster = Some("leaf".parse().unwrap());
        identity.generation = 2;

        let issued = ca
            .sign(user_client_cert(&identity, Duration::hours(8)).unwrap())
            .unwrap();

        assert_eq!(identity, peer_identity(&issued.der).unwrap());
    }

    #[test]
    fn host_identity_survives_the_certificate() {
        let ca = SigningCert::new_self_signed(gateway_ca(&test_cluster(), "Host")).unwrap();

        let host = HostIdentity {
            host_id: "0e3bde12-34a5-4e53-91a2-ab6ddef1b3a4".to_string(),
            node_name: "edge-1".to_string(),
            role: HostRole::Node,
            cluster: test_cluster(),
            principals: vec!["edge-1.example.com".to_string()],
        };

        let issued = ca.sign(host_cert(&host, Duration::hours(24)).unwrap()).unwrap();
        assert_eq!(host, peer_host_identity(&issued.der).unwrap());
    }

    #[test]
    fn signer_reassembled_from_parts_issues_chaining_certs() {
        let ca = SigningCert::new_self_signed(gateway_ca(&test_cluster(), "User")).unwrap();
        let key_der = ca.key.serialize_der();

        let reloaded = SigningCert::from_parts(&key_der, ca.der.clone()).unwrap();
        assert_eq!(ca.der, reloaded.der);

        let identity = Identity::new("bob", vec![], CertUsage::Database);
        let issued = reloaded
            .sign(user_client_cert(&identity, Duration::hours(1)).unwrap())
            .unwrap();

        // the issued cert must verify against the *original* DER
        let mut roots = rustls::RootCertStore::empty();
        roots.add(ca.der.clone()).unwrap();
        assert_eq!(1, roots.len());

        let (_, parsed) = x509_parser::parse_x509_certificate(&issued.der).unwrap();
        let (_, ca_parsed) = x509_parser::parse_x509_certificate(&ca.der).unwrap();
        assert_eq!(parsed.issuer(), ca_parsed.subject());
    }

    #[test]
    fn db_cert_subject_shape() {
        let cluster = test_cluster();
        let ca = SigningCert::new_self_signed(gateway_ca(&cluster, "Database")).unwrap();
        let sans = vec!["db.example.com".to_string(), "db.internal".to_string()];

        let issued = ca
            .sign(db_server_cert(&sans, &cluster, Duration::days(1)).unwrap())
            .unwrap();

        let (_, cert) = x509_parser::parse_x509_certificate(&issued.der).unwrap();
        let subject = cert.subject().to_string();
        assert!(subject.contains("CN=db.example.com"), "{subject}");
        assert!(subject.contains(&format!("O={cluster}")), "{subject}");
    }

    #[test]
    fn db_cert_requires_a_san() {
        assert!(db_server_cert(&[], &test_cluster(), Duration::days(1)).is_err());
    }
}
