//! Trust anchors for the mTLS handshake.
//!
//! On each handshake the server advertises the union of all CA subjects for
//! the trusting cluster. The advertised list must fit the TLS record the
//! CertificateRequest travels in; when it would not, the list deterministically
//! truncates to the local cluster's primary CA only, so clients retrying
//! against the same server see the same set.

use std::sync::Arc;

use rustls::client::danger::HandshakeSignatureValid;
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, DistinguishedName, RootCertStore, SignatureScheme};

use drawbridge_domain::{GatewayError, GatewayResult};

/// The outer bound: one TLS record
const TLS_RECORD_LIMIT: usize = 1 << 14;
/// Headroom for the rest of the CertificateRequest message
const HANDSHAKE_OVERHEAD: usize = 512;

/// Each advertised name costs a two-byte length prefix plus the DER subject
fn encoded_len(subjects: &[Vec<u8>]) -> usize {
    subjects.iter().map(|subject| 2 + subject.len()).sum()
}

pub fn subject_of(der: &CertificateDer) -> GatewayResult<Vec<u8>> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|err| GatewayError::BadParameter(format!("CA certificate: {err}")))?;
    Ok(cert.subject().as_raw().to_vec())
}

/// Deterministic subject selection under the record-size bound.
/// `local_primary` must be the first entry of `all`.
pub fn select_acceptable_subjects(local_primary: Vec<u8>, all: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    let mut deduped: Vec<Vec<u8>> = Vec::with_capacity(all.len());
    for subject in all {
        if !deduped.contains(&subject) {
            deduped.push(subject);
        }
    }

    if encoded_len(&deduped) > TLS_RECORD_LIMIT - HANDSHAKE_OVERHEAD {
        vec![local_primary]
    } else {
        deduped
    }
}

/// Compute the advertised subject list from certificate DER
pub fn acceptable_ca_subjects(
    local_primary: &CertificateDer,
    all: &[CertificateDer],
) -> GatewayResult<Vec<DistinguishedName>> {
    let local_subject = subject_of(local_primary)?;
    let mut subjects = Vec::with_capacity(all.len() + 1);
    subjects.push(local_subject.clone());
    for der in all {
        subjects.push(subject_of(der)?);
    }

    Ok(select_acceptable_subjects(local_subject, subjects)
        .into_iter()
        .map(DistinguishedName::from)
        .collect())
}

/// A client-cert verifier that verifies against the full trusted root set
/// but advertises the bounded subject list.
#[derive(Debug)]
pub struct HintedClientVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    hints: Vec<DistinguishedName>,
    mandatory: bool,
}

impl HintedClientVerifier {
    pub fn new(roots: RootCertStore, hints: Vec<DistinguishedName>) -> GatewayResult<Self> {
        let inner = WebPkiClientVerifier::builder(Arc::new(roots))
            .allow_unauthenticated()
            .build()
            .map_err(|err| GatewayError::BadParameter(format!("client verifier: {err}")))?;
        Ok(Self {
            inner,
            hints,
            mandatory: true,
        })
    }

    /// Anonymous clients pass the handshake; protocols that need an
    /// identity reject them later.
    pub fn optional(mut self) -> Self {
        self.mandatory = false;
        self
    }
}

impl ClientCertVerifier for HintedClientVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        self.mandatory
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &self.hints
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.inner.verify_client_cert(end_entity, intermediates, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
