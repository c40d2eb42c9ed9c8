//! HTTP surface of the Workload API.

use crate::Config;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use veil_identity::attestation::{AttestationRegistry, AttestationScheme};
use veil_identity::ca::{generate_rsa_key, CertificateAuthority};
use veil_identity::keystore::FilesystemKeyStore;
use veil_identity::workload_client::{
    AttestRequest, AttestResponse, CertificateBundleResponse, SvidMaterial,
};

/// Shared service state.
#[derive(Clone)]
pub struct AppState {
    ca: Arc<CertificateAuthority>,
    registry: Arc<AttestationRegistry>,
}

impl AppState {
    /// Builds state from pre-constructed components. Used by tests and
    /// embedders that bring their own key store.
    pub fn new(ca: Arc<CertificateAuthority>, registry: Arc<AttestationRegistry>) -> Self {
        Self { ca, registry }
    }

    /// Builds state from configuration, initializing the CA from the
    /// filesystem key store.
    pub fn from_config(config: &Config) -> veil_identity::Result<Self> {
        let store = FilesystemKeyStore::new(&config.key_store_path)?;
        let ca = CertificateAuthority::init(
            &config.trust_domain,
            Duration::from_secs(config.certificate_ttl_seconds),
            &store,
        )?;

        let tokens = config.parsed_attestation_tokens()?;
        if tokens.is_empty() {
            warn!("no attestation tokens configured, every attestation will be denied");
        }
        let registry = AttestationRegistry::new(AttestationScheme::static_secret(tokens));

        Ok(Self::new(Arc::new(ca), Arc::new(registry)))
    }

    /// The certificate authority.
    pub fn ca(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }
}

/// Builds the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/workload/v1/attest", post(attest))
        .route("/workload/v1/certificates", get(certificates))
        .route("/workload/v1/health", get(health))
        .with_state(state)
}

fn error_body(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

/// `POST /workload/v1/attest`
///
/// The response never reveals why attestation failed.
async fn attest(State(state): State<AppState>, Json(request): Json<AttestRequest>) -> Response {
    if request.service_name.is_empty() {
        return error_body(StatusCode::BAD_REQUEST, "service_name is required");
    }

    match state
        .registry
        .attest(&request.service_name, &request.attestation_proof)
    {
        Ok(token) => Json(AttestResponse { token }).into_response(),
        Err(e) => {
            // Proof contents stay out of the logs.
            warn!(workload = %request.service_name, "attestation denied: {e}");
            error_body(StatusCode::UNAUTHORIZED, "attestation denied")
        }
    }
}

/// `GET /workload/v1/certificates?service_name=<name>`
///
/// Redeems the bearer ticket against the claimed name, generates a fresh
/// RSA key pair, and returns the signed bundle. The private key exists in
/// this response only; the response is never logged.
async fn certificates(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let Some(service_name) = params.get("service_name").filter(|n| !n.is_empty()) else {
        return error_body(StatusCode::BAD_REQUEST, "service name required");
    };

    let ticket = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let Some(ticket) = ticket else {
        return error_body(
            StatusCode::UNAUTHORIZED,
            "missing or invalid Authorization header",
        );
    };

    if !state.registry.redeem(ticket, service_name) {
        warn!(workload = %service_name, "certificate fetch with bad ticket");
        return error_body(
            StatusCode::UNAUTHORIZED,
            "invalid or expired attestation ticket",
        );
    }

    // RSA generation is CPU-bound; keep it off the request executor.
    let key_material = tokio::task::spawn_blocking(generate_rsa_key).await;
    let (subject_key, key_pem) = match key_material {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            error!(workload = %service_name, "workload key generation failed: {e}");
            return error_body(StatusCode::INTERNAL_SERVER_ERROR, "certificate issuance failed");
        }
        Err(e) => {
            error!(workload = %service_name, "key generation task failed: {e}");
            return error_body(StatusCode::INTERNAL_SERVER_ERROR, "certificate issuance failed");
        }
    };

    let cert = match state.ca.issue(service_name, &subject_key) {
        Ok(cert) => cert,
        Err(e) => {
            error!(workload = %service_name, "issuance failed: {e}");
            return error_body(StatusCode::INTERNAL_SERVER_ERROR, "certificate issuance failed");
        }
    };

    let expires_at = match cert.not_after() {
        Ok(t) => t.timestamp(),
        Err(e) => {
            error!(workload = %service_name, "issued certificate unreadable: {e}");
            return error_body(StatusCode::INTERNAL_SERVER_ERROR, "certificate issuance failed");
        }
    };

    info!(workload = %service_name, "issued certificate bundle");
    let response = CertificateBundleResponse {
        svid: SvidMaterial {
            cert: cert.to_pem().to_string(),
            key: key_pem,
            spiffe_id: format!("spiffe://{}/{service_name}", state.ca.trust_domain()),
        },
        ca_certs: vec![state.ca.ca_certificate().to_pem().to_string()],
        expires_at,
        ttl: state.ca.leaf_ttl().as_secs(),
    };
    Json(response).into_response()
}
