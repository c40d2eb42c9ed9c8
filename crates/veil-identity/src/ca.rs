//! Certificate authority core.
//!
//! Owns the root RSA key pair and issues one-hour workload leaf
//! certificates. CA material is loaded from (or created in) a
//! [`SecureKeyStore`](crate::keystore::SecureKeyStore) on startup; workload
//! keys are generated per issuance and never stored.
//!
//! Signing runs under an internal mutex. Serial numbers are random 63-bit
//! values, reseeded per process and checked non-zero; collision within the
//! one-hour leaf window is tolerable.

use crate::bundle::{Certificate, TrustBundle};
use crate::keystore::{CaMaterial, SecureKeyStore};
use crate::spiffe::SpiffeId;
use crate::{Error, Result};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rsa::pkcs8::EncodePrivateKey;
use std::sync::Mutex;
use std::time::Duration;
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::info;

/// CA certificate validity: one year. The fleet's effective maximum uptime
/// between planned outages until CA rotation is specified.
const CA_VALIDITY_DAYS: i64 = 365;

/// RSA modulus size for the CA and all workload keys.
const RSA_BITS: usize = 2048;

/// The certificate authority for a trust domain.
pub struct CertificateAuthority {
    trust_domain: String,
    leaf_ttl: Duration,
    signer: Mutex<CaSigner>,
    ca_certificate: Certificate,
    trust_bundle: TrustBundle,
}

/// Root key, held so an issuer can be rebuilt for each signing operation
/// from the CA's own certificate.
struct CaSigner {
    key: KeyPair,
}

impl CertificateAuthority {
    /// Initializes the CA, loading existing material from the key store or
    /// creating and persisting a fresh root on first boot. Idempotent.
    pub fn init(
        trust_domain: impl Into<String>,
        leaf_ttl: Duration,
        store: &dyn SecureKeyStore,
    ) -> Result<Self> {
        let trust_domain = trust_domain.into();
        if trust_domain.is_empty() {
            return Err(Error::Config("empty trust domain".to_string()));
        }

        match store.load_ca()? {
            Some(material) => {
                info!(trust_domain = %trust_domain, "loading existing CA from key store");
                Self::from_material(trust_domain, leaf_ttl, &material)
            }
            None => {
                info!(trust_domain = %trust_domain, "creating new CA");
                let (ca, material) = Self::create(trust_domain, leaf_ttl)?;
                store.save_ca(&material)?;
                Ok(ca)
            }
        }
    }

    /// Rebuilds the CA from persisted material.
    fn from_material(
        trust_domain: String,
        leaf_ttl: Duration,
        material: &CaMaterial,
    ) -> Result<Self> {
        let key = KeyPair::from_pem(material.key_pem())
            .map_err(|e| Error::Config(format!("CA key unparseable: {e}")))?;
        let ca_certificate = Certificate::from_pem(material.cert_pem())
            .map_err(|e| Error::Config(format!("CA certificate unparseable: {e}")))?;

        let trust_bundle = TrustBundle::new(vec![ca_certificate.clone()]);
        Ok(Self {
            trust_domain,
            leaf_ttl,
            signer: Mutex::new(CaSigner { key }),
            ca_certificate,
            trust_bundle,
        })
    }

    /// Generates a new RSA root and self-signed CA certificate.
    fn create(trust_domain: String, leaf_ttl: Duration) -> Result<(Self, CaMaterial)> {
        let (key, key_pem) = generate_rsa_key()?;

        let mut params = CertificateParams::new(vec![])
            .map_err(|e| Error::Signing(format!("failed to create params: {e}")))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, format!("Veil Root CA - {trust_domain}"));
        dn.push(DnType::OrganizationName, trust_domain.clone());
        params.distinguished_name = dn;

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + TimeDuration::days(CA_VALIDITY_DAYS);

        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign];

        let ca_san = rcgen::string::Ia5String::try_from(format!("spiffe://{trust_domain}"))
            .map_err(|e| Error::Signing(format!("invalid CA SAN: {e}")))?;
        params.subject_alt_names = vec![SanType::URI(ca_san)];

        let cert = params
            .clone()
            .self_signed(&key)
            .map_err(|e| Error::Signing(format!("CA self-signing failed: {e}")))?;

        let ca_certificate = Certificate::from_der(cert.der().to_vec());
        let material = CaMaterial::new(key_pem, ca_certificate.to_pem());
        let trust_bundle = TrustBundle::new(vec![ca_certificate.clone()]);

        let ca = Self {
            trust_domain,
            leaf_ttl,
            signer: Mutex::new(CaSigner { key }),
            ca_certificate,
            trust_bundle,
        };
        Ok((ca, material))
    }

    /// Issues a one-hour leaf certificate binding `workload_name` to the
    /// caller-supplied public key.
    ///
    /// The subject is `CN=<workload_name>, O=<trust_domain>` and the SPIFFE
    /// ID `spiffe://<trust_domain>/<workload_name>` goes into the URI SAN.
    /// Pure function of its inputs plus CA state.
    pub fn issue(&self, workload_name: &str, subject_key: &KeyPair) -> Result<Certificate> {
        let spiffe_id = SpiffeId::new(&self.trust_domain, workload_name)?;

        let mut params = CertificateParams::new(vec![])
            .map_err(|e| Error::Signing(format!("failed to create params: {e}")))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, workload_name);
        dn.push(DnType::OrganizationName, self.trust_domain.clone());
        params.distinguished_name = dn;

        let now = OffsetDateTime::now_utc();
        let ttl = TimeDuration::new(self.leaf_ttl.as_secs() as i64, 0);
        params.not_before = now;
        params.not_after = now + ttl;

        params.serial_number = Some(random_serial().into());

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let san = rcgen::string::Ia5String::try_from(spiffe_id.to_uri())
            .map_err(|e| Error::Signing(format!("invalid SAN: {e}")))?;
        params.subject_alt_names = vec![SanType::URI(san)];

        let signer = self
            .signer
            .lock()
            .map_err(|_| Error::Internal("CA signer lock poisoned".to_string()))?;
        let ca_der = rustls::pki_types::CertificateDer::from(self.ca_certificate.der().to_vec());
        let issuer = rcgen::Issuer::from_ca_cert_der(&ca_der, &signer.key)
            .map_err(|e| Error::Signing(format!("failed to build CA issuer: {e}")))?;
        let signed = params
            .signed_by(subject_key, &issuer)
            .map_err(|e| Error::Signing(format!("certificate signing failed: {e}")))?;

        info!(workload = %workload_name, spiffe_id = %spiffe_id, "issued workload certificate");
        Ok(Certificate::from_der(signed.der().to_vec()))
    }

    /// Returns the CA certificate.
    pub fn ca_certificate(&self) -> &Certificate {
        &self.ca_certificate
    }

    /// Returns the trust bundle containing the CA certificate.
    pub fn trust_bundle(&self) -> &TrustBundle {
        &self.trust_bundle
    }

    /// Returns the trust domain this CA serves.
    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    /// Returns the leaf TTL applied to every issuance.
    pub fn leaf_ttl(&self) -> Duration {
        self.leaf_ttl
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("trust_domain", &self.trust_domain)
            .field("leaf_ttl", &self.leaf_ttl)
            .finish()
    }
}

/// Generates a fresh RSA-2048 key pair for a workload or the CA root.
///
/// Returns the rcgen signing handle plus the PKCS#8 PEM. The PEM is the
/// only representation that leaves the issuing process (inside the bundle
/// response) and the only one the agent keeps in RAM.
pub fn generate_rsa_key() -> Result<(KeyPair, String)> {
    let mut rng = rand::thread_rng();
    let private_key = rsa::RsaPrivateKey::new(&mut rng, RSA_BITS)
        .map_err(|e| Error::Signing(format!("RSA key generation failed: {e}")))?;

    let pem = private_key
        .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
        .map_err(|e| Error::Signing(format!("PKCS#8 encoding failed: {e}")))?;

    let key_pair = KeyPair::from_pem(&pem)
        .map_err(|e| Error::Signing(format!("failed to load generated key: {e}")))?;

    Ok((key_pair, pem.to_string()))
}

/// Random non-zero 63-bit serial number.
fn random_serial() -> u64 {
    loop {
        let serial = rand::random::<u64>() >> 1;
        if serial != 0 {
            return serial;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::MemoryKeyStore;

    fn test_ca() -> CertificateAuthority {
        let store = MemoryKeyStore::new();
        CertificateAuthority::init("example.org", Duration::from_secs(3600), &store).unwrap()
    }

    #[test]
    fn test_init_creates_and_persists() {
        let store = MemoryKeyStore::new();
        let ca =
            CertificateAuthority::init("example.org", Duration::from_secs(3600), &store).unwrap();
        assert_eq!(ca.trust_domain(), "example.org");
        assert!(ca.ca_certificate().is_ca().unwrap());

        let material = store.load_ca().unwrap().unwrap();
        assert!(material.key_pem().contains("PRIVATE KEY"));
        assert!(material.cert_pem().contains("CERTIFICATE"));
    }

    #[test]
    fn test_init_is_idempotent() {
        let store = MemoryKeyStore::new();
        let first =
            CertificateAuthority::init("example.org", Duration::from_secs(3600), &store).unwrap();
        let second =
            CertificateAuthority::init("example.org", Duration::from_secs(3600), &store).unwrap();

        // Second boot loads the same root instead of minting a new one.
        assert_eq!(
            first.ca_certificate().der(),
            second.ca_certificate().der()
        );
    }

    #[test]
    fn test_init_rejects_empty_trust_domain() {
        let store = MemoryKeyStore::new();
        let err = CertificateAuthority::init("", Duration::from_secs(3600), &store).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_issue_embeds_spiffe_id() {
        let ca = test_ca();
        let (subject_key, _) = generate_rsa_key().unwrap();

        let cert = ca.issue("photo-service", &subject_key).unwrap();
        let id = cert.extract_spiffe_id().unwrap();
        assert_eq!(id.to_uri(), "spiffe://example.org/photo-service");
    }

    #[test]
    fn test_issue_one_hour_validity() {
        let ca = test_ca();
        let (subject_key, _) = generate_rsa_key().unwrap();

        let cert = ca.issue("photo-service", &subject_key).unwrap();
        let lifetime = cert.not_after().unwrap() - cert.not_before().unwrap();
        assert_eq!(lifetime.num_seconds(), 3600);
    }

    #[test]
    fn test_issue_subject_and_issuer() {
        let ca = test_ca();
        let (subject_key, _) = generate_rsa_key().unwrap();

        let cert = ca.issue("print-service", &subject_key).unwrap();
        let subject = cert.subject().unwrap();
        assert!(subject.contains("print-service"));
        assert!(subject.contains("example.org"));
        assert!(!cert.is_ca().unwrap());
    }

    #[test]
    fn test_issue_rejects_invalid_workload_name() {
        let ca = test_ca();
        let (subject_key, _) = generate_rsa_key().unwrap();

        let err = ca.issue("../escape", &subject_key).unwrap_err();
        assert!(matches!(err, Error::InvalidSpiffeId(_)));
    }

    #[test]
    fn test_issued_cert_carries_subject_public_key() {
        let ca = test_ca();
        let (subject_key, key_pem) = generate_rsa_key().unwrap();

        let cert = ca.issue("photo-service", &subject_key).unwrap();

        // The certificate must bind the key we supplied, not a CA-generated one.
        use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey};
        let parsed = rsa::RsaPrivateKey::from_pkcs8_pem(&key_pem).unwrap();
        let spki = parsed.to_public_key().to_public_key_der().unwrap();
        assert_eq!(cert.public_key_der().unwrap(), spki.as_bytes());
    }

    #[test]
    fn test_random_serial_nonzero() {
        for _ in 0..64 {
            let serial = random_serial();
            assert_ne!(serial, 0);
            // 63-bit: the top bit is always clear.
            assert_eq!(serial >> 63, 0);
        }
    }
}
