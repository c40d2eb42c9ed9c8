//! HTTP client for the Workload API.
//!
//! Attests the hosting workload and fetches certificate bundles. All calls
//! carry a ten-second timeout. The private key in the bundle response is
//! parsed straight into an in-memory [`SvidBundle`] and never logged.

use crate::attestation::AttestationProof;
use crate::bundle::SvidBundle;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Timeout for Workload API calls.
const WORKLOAD_API_TIMEOUT: Duration = Duration::from_secs(10);

/// Wire shape of `POST /workload/v1/attest` requests.
#[derive(Debug, Serialize, Deserialize)]
pub struct AttestRequest {
    /// Claimed workload name.
    pub service_name: String,
    /// Proof material for the configured attestation scheme.
    pub attestation_proof: AttestationProof,
}

/// Wire shape of `POST /workload/v1/attest` responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct AttestResponse {
    /// Attestation ticket to redeem on the certificates endpoint.
    pub token: String,
}

/// PEM materials of an issued SVID.
#[derive(Serialize, Deserialize)]
pub struct SvidMaterial {
    /// PEM-encoded leaf certificate.
    pub cert: String,
    /// PEM-encoded PKCS#8 private key. Present in this response only.
    pub key: String,
    /// The SPIFFE ID encoded in the leaf's URI SAN.
    pub spiffe_id: String,
}

impl std::fmt::Debug for SvidMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SvidMaterial")
            .field("spiffe_id", &self.spiffe_id)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Wire shape of `GET /workload/v1/certificates` responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct CertificateBundleResponse {
    /// The issued SVID.
    pub svid: SvidMaterial,
    /// PEM-encoded CA certificates, ordered root-last.
    pub ca_certs: Vec<String>,
    /// Leaf `notAfter`, seconds since the epoch.
    pub expires_at: i64,
    /// Issuance TTL in seconds.
    pub ttl: u64,
}

/// Client for the Workload API.
pub struct WorkloadApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl WorkloadApiClient {
    /// Creates a client against the given base URL.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(WORKLOAD_API_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    /// Returns the base URL this client talks to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Attests the workload, returning an attestation ticket.
    pub async fn attest(
        &self,
        service_name: &str,
        proof: &AttestationProof,
    ) -> Result<String> {
        let url = format!("{}/workload/v1/attest", self.base_url.trim_end_matches('/'));
        let request = AttestRequest {
            service_name: service_name.to_string(),
            attestation_proof: proof.clone(),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("workload API unreachable: {e}")))?;

        match response.status() {
            reqwest::StatusCode::OK => {
                let body: AttestResponse = response
                    .json()
                    .await
                    .map_err(|e| Error::Internal(format!("malformed attest response: {e}")))?;
                debug!(workload = %service_name, "attestation ticket obtained");
                Ok(body.token)
            }
            reqwest::StatusCode::UNAUTHORIZED => Err(Error::AttestationDenied),
            status => Err(Error::Internal(format!(
                "attest returned unexpected status {status}"
            ))),
        }
    }

    /// Redeems an attestation ticket for a certificate bundle.
    pub async fn fetch_certificates(
        &self,
        service_name: &str,
        ticket: &str,
    ) -> Result<SvidBundle> {
        let url = format!(
            "{}/workload/v1/certificates",
            self.base_url.trim_end_matches('/')
        );

        let response = self
            .client
            .get(&url)
            .query(&[("service_name", service_name)])
            .bearer_auth(ticket)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("workload API unreachable: {e}")))?;

        match response.status() {
            reqwest::StatusCode::OK => {}
            reqwest::StatusCode::UNAUTHORIZED => return Err(Error::TicketInvalid),
            status => {
                return Err(Error::Internal(format!(
                    "certificates returned unexpected status {status}"
                )))
            }
        }

        let body: CertificateBundleResponse = response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("malformed bundle response: {e}")))?;

        let bundle = SvidBundle::from_pem(
            &body.svid.cert,
            &body.svid.key,
            &body.ca_certs.join(""),
            chrono::Utc::now(),
            Duration::from_secs(body.ttl),
        )?;

        if bundle.spiffe_id().to_uri() != body.svid.spiffe_id {
            return Err(Error::Certificate(format!(
                "bundle SPIFFE ID mismatch: certificate says {}, response says {}",
                bundle.spiffe_id(),
                body.svid.spiffe_id
            )));
        }

        info!(spiffe_id = %bundle.spiffe_id(), "fetched certificate bundle");
        Ok(bundle)
    }

    /// Attests and fetches in one step.
    pub async fn attest_and_fetch(
        &self,
        service_name: &str,
        proof: &AttestationProof,
    ) -> Result<SvidBundle> {
        let ticket = self.attest(service_name, proof).await?;
        self.fetch_certificates(service_name, &ticket).await
    }

    /// Liveness probe against the Workload API.
    pub async fn health(&self) -> Result<()> {
        let url = format!("{}/workload/v1/health", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("workload API unreachable: {e}")))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::Internal(format!(
                "health returned status {}",
                response.status()
            )))
        }
    }
}

impl std::fmt::Debug for WorkloadApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadApiClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}
