//! SPIFFE-aware rustls certificate verifiers.
//!
//! Standard TLS verification matches DNS names; workload certificates
//! carry their identity in a URI SAN instead. These verifiers first run
//! full X.509 chain validation against the trust bundle, then require a
//! SPIFFE URI in the local trust domain.
//!
//! - [`SpiffeClientVerifier`] - inbound: validates client certificates
//! - [`SpiffeServerVerifier`] - outbound: validates server certificates

use crate::bundle::{Certificate, TrustBundle};
use crate::spiffe::SpiffeId;
use crate::{Error, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, TrustAnchor, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use std::sync::Arc;
use webpki::{anchor_from_trusted_cert, EndEntityCert, KeyUsage};

/// Extracts the SPIFFE ID from a DER-encoded certificate's URI SAN.
pub fn extract_spiffe_id(cert_der: &[u8]) -> Result<SpiffeId> {
    Certificate::from_der(cert_der.to_vec()).extract_spiffe_id()
}

/// Verifies inbound client certificates: trusted chain plus a SPIFFE ID in
/// the local trust domain. Client certificates are mandatory.
#[derive(Debug)]
pub struct SpiffeClientVerifier {
    trust_domain: String,
    inner: Arc<dyn ClientCertVerifier>,
}

impl SpiffeClientVerifier {
    /// Creates a verifier for the given trust domain and bundle.
    pub fn new(trust_domain: impl Into<String>, trust_bundle: &TrustBundle) -> Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let roots = trust_bundle.to_rustls_root_store()?;
        let inner = WebPkiClientVerifier::builder(roots)
            .build()
            .map_err(|e| Error::Certificate(format!("failed to build client verifier: {e}")))?;
        Ok(Self {
            trust_domain: trust_domain.into(),
            inner,
        })
    }

    fn verify_identity(&self, cert_der: &[u8]) -> Result<SpiffeId> {
        let identity = extract_spiffe_id(cert_der)?;
        if !identity.is_in_trust_domain(&self.trust_domain) {
            return Err(Error::Certificate(format!(
                "peer trust domain mismatch: expected {}, got {}",
                self.trust_domain,
                identity.trust_domain()
            )));
        }
        Ok(identity)
    }
}

impl ClientCertVerifier for SpiffeClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        self.inner
            .verify_client_cert(end_entity, intermediates, now)?;

        self.verify_identity(end_entity.as_ref()).map_err(|e| {
            tracing::debug!("client SPIFFE verification failed: {e}");
            rustls::Error::General(format!("SPIFFE identity verification failed: {e}"))
        })?;

        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

/// Verifies outbound server certificates: trusted chain plus a SPIFFE ID
/// in the local trust domain, in place of DNS name matching.
pub struct SpiffeServerVerifier {
    trust_domain: String,
    trust_anchors: Vec<TrustAnchor<'static>>,
    crypto_provider: Arc<CryptoProvider>,
}

impl SpiffeServerVerifier {
    /// Creates a verifier for the given trust domain and bundle.
    pub fn new(trust_domain: impl Into<String>, trust_bundle: &TrustBundle) -> Result<Self> {
        let mut trust_anchors = Vec::new();
        for cert in trust_bundle.roots() {
            let der = CertificateDer::from(cert.der().to_vec());
            let anchor = anchor_from_trusted_cert(&der)
                .map_err(|e| Error::Certificate(format!("failed to parse trust anchor: {e:?}")))?;
            trust_anchors.push(anchor.to_owned());
        }
        Ok(Self {
            trust_domain: trust_domain.into(),
            trust_anchors,
            crypto_provider: Arc::new(rustls::crypto::ring::default_provider()),
        })
    }

    /// Chain validation via webpki: signatures, validity window, key usage.
    fn verify_chain(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<(), rustls::Error> {
        let ee_cert = EndEntityCert::try_from(end_entity).map_err(|e| {
            tracing::warn!("failed to parse end-entity certificate: {e:?}");
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding)
        })?;

        let intermediate_certs: Vec<CertificateDer<'static>> = intermediates
            .iter()
            .map(|c| CertificateDer::from(c.as_ref().to_vec()))
            .collect();

        let time = webpki::types::UnixTime::since_unix_epoch(std::time::Duration::from_secs(
            now.as_secs(),
        ));

        ee_cert
            .verify_for_usage(
                webpki::ALL_VERIFICATION_ALGS,
                &self.trust_anchors,
                &intermediate_certs,
                time,
                KeyUsage::server_auth(),
                None,
                None,
            )
            .map_err(|e| {
                tracing::warn!("server certificate chain verification failed: {e:?}");
                rustls::Error::InvalidCertificate(rustls::CertificateError::BadSignature)
            })?;

        Ok(())
    }

    fn verify_identity(&self, cert_der: &[u8]) -> Result<SpiffeId> {
        let identity = extract_spiffe_id(cert_der)?;
        if !identity.is_in_trust_domain(&self.trust_domain) {
            return Err(Error::Certificate(format!(
                "server trust domain mismatch: expected {}, got {}",
                self.trust_domain,
                identity.trust_domain()
            )));
        }
        Ok(identity)
    }
}

impl std::fmt::Debug for SpiffeServerVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpiffeServerVerifier")
            .field("trust_domain", &self.trust_domain)
            .field("trust_anchors", &self.trust_anchors.len())
            .finish()
    }
}

impl ServerCertVerifier for SpiffeServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        self.verify_chain(end_entity, intermediates, now)?;

        let identity = self.verify_identity(end_entity.as_ref()).map_err(|e| {
            tracing::debug!("server SPIFFE verification failed: {e}");
            rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            )
        })?;

        tracing::debug!(spiffe_id = %identity, "verified server identity");
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.crypto_provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.crypto_provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.crypto_provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
