//! Delegation tokens: audience-scoped, permission-bearing bearer tokens
//! that let a workload act on behalf of an authenticated end-user.
//!
//! Tokens are JWTs signed with a symmetric secret (HS256 minimum, HS512
//! accepted) shared between the issuer and any validator that opts into
//! local verification. Validators without the secret fall back to the
//! issuer's remote `/auth/validate` endpoint, always via POST with the
//! token in the body so it never reaches access logs.

use crate::spiffe::SpiffeId;
use crate::{Error, Result};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default delegation token TTL: fifteen minutes.
pub const DEFAULT_DELEGATION_TTL: u64 = 900;

/// Hard ceiling on requested delegation TTLs.
pub const MAX_DELEGATION_TTL: u64 = 3600;

/// Minimum symmetric signing key length: 256 bits.
pub const MIN_SIGNING_KEY_BYTES: usize = 32;

/// Permissions substituted when a delegation request names none.
///
/// Kept for compatibility with existing callers; see DESIGN.md for the
/// open-question record.
pub const DEFAULT_PERMISSIONS: &[&str] = &["read:photos"];

/// Claims carried by a delegation token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationClaims {
    /// Issuer SPIFFE ID.
    pub iss: String,
    /// Same as `iss`: the token is issued by, and speaks for, the issuer.
    pub sub: String,
    /// Target workload SPIFFE ID.
    pub aud: String,
    /// End-user this delegation acts for.
    pub user_id: String,
    /// Granted scope strings, e.g. `read:photos`.
    pub permissions: Vec<String>,
    /// Issued-at, seconds since the epoch.
    pub iat: i64,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
}

/// Result of validating a delegation token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    /// Whether the token is valid for the verifying workload.
    pub valid: bool,
    /// End-user id, when valid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Granted permissions, when valid.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    /// Sanitized error message, when invalid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ValidationOutcome {
    fn valid(user_id: String, permissions: Vec<String>) -> Self {
        Self {
            valid: true,
            user_id: Some(user_id),
            permissions,
            error: None,
        }
    }

    fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            user_id: None,
            permissions: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Wire shape of `POST /auth/validate` requests.
#[derive(Debug, Serialize, Deserialize)]
pub struct RemoteValidateRequest {
    /// The delegation token under test.
    pub token: String,
}

/// Wire shape of `POST /auth/validate` responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct RemoteValidateResponse {
    /// Whether the issuer accepted the token.
    pub valid: bool,
    /// Decoded claims, when valid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<RemoteTokenInfo>,
    /// Sanitized error, when invalid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Claims echoed by the remote validate endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct RemoteTokenInfo {
    /// End-user id.
    pub user_id: String,
    /// Granted permissions.
    pub permissions: Vec<String>,
    /// Audience list (a single target workload in practice).
    pub audience: Vec<String>,
    /// Expiry, seconds since the epoch.
    pub expires_at: i64,
}

/// Mints delegation tokens on behalf of authenticated users.
pub struct DelegationIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
    issuer_id: SpiffeId,
    default_ttl: u64,
}

impl DelegationIssuer {
    /// Creates an issuer signing with HS256.
    ///
    /// `secret` must be at least 256 bits.
    pub fn new(secret: &[u8], issuer_id: SpiffeId) -> Result<Self> {
        Self::with_algorithm(secret, issuer_id, Algorithm::HS256)
    }

    /// Creates an issuer with an explicit HMAC algorithm (HS256 or HS512).
    pub fn with_algorithm(
        secret: &[u8],
        issuer_id: SpiffeId,
        algorithm: Algorithm,
    ) -> Result<Self> {
        if secret.len() < MIN_SIGNING_KEY_BYTES {
            return Err(Error::Config(format!(
                "delegation signing key too short: {} bytes, need at least {}",
                secret.len(),
                MIN_SIGNING_KEY_BYTES
            )));
        }
        if !matches!(algorithm, Algorithm::HS256 | Algorithm::HS512) {
            return Err(Error::Config(format!(
                "unsupported delegation algorithm: {algorithm:?}"
            )));
        }
        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            algorithm,
            issuer_id,
            default_ttl: DEFAULT_DELEGATION_TTL,
        })
    }

    /// Overrides the default TTL applied when a request names none.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl.as_secs().min(MAX_DELEGATION_TTL);
        self
    }

    /// Returns the issuer SPIFFE ID.
    pub fn issuer_id(&self) -> &SpiffeId {
        &self.issuer_id
    }

    /// Mints a delegation token.
    ///
    /// The audience is `spiffe://<trust-domain>/<target_workload_name>` in
    /// the issuer's own trust domain. Requested TTLs are clamped to
    /// [`MAX_DELEGATION_TTL`]; an empty permission list defaults to
    /// [`DEFAULT_PERMISSIONS`]. Returns the compact JWT and its effective
    /// TTL in seconds.
    pub fn issue(
        &self,
        user_id: &str,
        target_workload_name: &str,
        permissions: Vec<String>,
        ttl_seconds: Option<u64>,
    ) -> Result<(String, u64)> {
        let audience =
            SpiffeId::new(self.issuer_id.trust_domain(), target_workload_name)?;

        let ttl = ttl_seconds.unwrap_or(self.default_ttl).min(MAX_DELEGATION_TTL);
        let permissions = if permissions.is_empty() {
            DEFAULT_PERMISSIONS.iter().map(|p| p.to_string()).collect()
        } else {
            permissions
        };

        let now = chrono::Utc::now().timestamp();
        let claims = DelegationClaims {
            iss: self.issuer_id.to_uri(),
            sub: self.issuer_id.to_uri(),
            aud: audience.to_uri(),
            user_id: user_id.to_string(),
            permissions,
            iat: now,
            exp: now + ttl as i64,
        };

        let token = jsonwebtoken::encode(&Header::new(self.algorithm), &claims, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("token encoding failed: {e}")))?;

        info!(user_id = %user_id, audience = %audience, ttl, "issued delegation token");
        Ok((token, ttl))
    }

    /// Verifies a token's signature and expiry without an audience check.
    ///
    /// This backs the issuer-hosted `/auth/validate` endpoint, which does
    /// not know which workload will enforce the audience; callers embed
    /// the decoded audience in the response so validators can check it.
    pub fn decode(&self, token: &str) -> Result<DelegationClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS512];
        validation.validate_aud = false;

        let data = jsonwebtoken::decode::<DelegationClaims>(token, &self.decoding_key, &validation)
            .map_err(|e| {
                debug!("delegation token rejected: {e}");
                Error::TokenInvalid("invalid or expired token".to_string())
            })?;
        Ok(data.claims)
    }
}

impl std::fmt::Debug for DelegationIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegationIssuer")
            .field("issuer_id", &self.issuer_id.to_uri())
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

/// Verifies delegation tokens at the point of use.
///
/// A closed sum with a deterministic selection rule: `Local` when the
/// shared secret is configured, `Remote` otherwise. A keyed validator that
/// fails a local check treats the token as invalid without consulting the
/// remote endpoint, so the issuer is never used as a signing oracle.
pub enum DelegationValidator {
    /// Verify signature, expiry and audience in-process.
    Local {
        /// Shared HMAC secret.
        decoding_key: DecodingKey,
        /// The verifying workload's own SPIFFE ID.
        audience: SpiffeId,
    },
    /// POST the token to the issuer's validate endpoint.
    Remote {
        /// Issuer base URL, e.g. `http://user-service:8081`.
        issuer_url: String,
        /// The verifying workload's own SPIFFE ID.
        audience: SpiffeId,
        /// HTTP client with the validation timeout applied.
        client: reqwest::Client,
    },
}

/// Timeout for remote delegation validation.
const REMOTE_VALIDATE_TIMEOUT: Duration = Duration::from_secs(5);

impl DelegationValidator {
    /// Creates a local validator from the shared secret.
    pub fn local(secret: &[u8], audience: SpiffeId) -> Result<Self> {
        if secret.len() < MIN_SIGNING_KEY_BYTES {
            return Err(Error::Config(format!(
                "delegation signing key too short: {} bytes, need at least {}",
                secret.len(),
                MIN_SIGNING_KEY_BYTES
            )));
        }
        Ok(Self::Local {
            decoding_key: DecodingKey::from_secret(secret),
            audience,
        })
    }

    /// Creates a remote validator against the issuer's base URL.
    pub fn remote(issuer_url: impl Into<String>, audience: SpiffeId) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REMOTE_VALIDATE_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self::Remote {
            issuer_url: issuer_url.into(),
            audience,
            client,
        })
    }

    /// Validates a delegation token for this workload.
    ///
    /// Never panics and never returns `Err`: all failure modes collapse
    /// into an invalid [`ValidationOutcome`] with a sanitized message.
    pub async fn validate(&self, token: &str) -> ValidationOutcome {
        match self {
            Self::Local {
                decoding_key,
                audience,
            } => Self::validate_local(decoding_key, audience, token),
            Self::Remote {
                issuer_url,
                audience,
                client,
            } => Self::validate_remote(client, issuer_url, audience, token).await,
        }
    }

    fn validate_local(
        decoding_key: &DecodingKey,
        audience: &SpiffeId,
        token: &str,
    ) -> ValidationOutcome {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS512];
        validation.set_audience(&[audience.to_uri()]);

        match jsonwebtoken::decode::<DelegationClaims>(token, decoding_key, &validation) {
            Ok(data) => {
                debug!(user_id = %data.claims.user_id, "delegation token validated locally");
                ValidationOutcome::valid(data.claims.user_id, data.claims.permissions)
            }
            Err(e) => {
                warn!("local delegation validation failed: {e}");
                ValidationOutcome::invalid("invalid or expired token")
            }
        }
    }

    async fn validate_remote(
        client: &reqwest::Client,
        issuer_url: &str,
        audience: &SpiffeId,
        token: &str,
    ) -> ValidationOutcome {
        let url = format!("{}/auth/validate", issuer_url.trim_end_matches('/'));
        let request = RemoteValidateRequest {
            token: token.to_string(),
        };

        let response = match client.post(&url).json(&request).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("remote delegation validation unreachable: {e}");
                return ValidationOutcome::invalid("validation service unreachable");
            }
        };

        let body: RemoteValidateResponse = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                warn!("remote delegation validation returned malformed body: {e}");
                return ValidationOutcome::invalid("validation service error");
            }
        };

        if !body.valid {
            return ValidationOutcome::invalid(
                body.error.unwrap_or_else(|| "invalid token".to_string()),
            );
        }

        let Some(info) = body.token else {
            return ValidationOutcome::invalid("validation service error");
        };

        // The issuer checks signature and expiry; audience enforcement is
        // this workload's responsibility.
        if !info.audience.iter().any(|a| a == &audience.to_uri()) {
            warn!(expected = %audience, "delegation token audience mismatch");
            return ValidationOutcome::invalid("token not intended for this service");
        }

        ValidationOutcome::valid(info.user_id, info.permissions)
    }
}

impl std::fmt::Debug for DelegationValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local { audience, .. } => f
                .debug_struct("DelegationValidator::Local")
                .field("audience", &audience.to_uri())
                .finish(),
            Self::Remote {
                issuer_url,
                audience,
                ..
            } => f
                .debug_struct("DelegationValidator::Remote")
                .field("issuer_url", issuer_url)
                .field("audience", &audience.to_uri())
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-delegation-signing-key-0123456789ab";
    const USER: &str = "11111111-1111-1111-1111-111111111111";

    fn issuer() -> DelegationIssuer {
        let id = SpiffeId::new("example.org", "user-service").unwrap();
        DelegationIssuer::new(SECRET, id).unwrap()
    }

    fn validator_for(workload: &str) -> DelegationValidator {
        let id = SpiffeId::new("example.org", workload).unwrap();
        DelegationValidator::local(SECRET, id).unwrap()
    }

    #[test]
    fn test_rejects_short_secret() {
        let id = SpiffeId::new("example.org", "user-service").unwrap();
        assert!(matches!(
            DelegationIssuer::new(b"short", id.clone()),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            DelegationValidator::local(b"short", id),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_issue_and_validate_locally() {
        let (token, ttl) = issuer()
            .issue(USER, "print-service", vec!["print:photos".to_string()], Some(900))
            .unwrap();
        assert_eq!(ttl, 900);

        let outcome = validator_for("print-service").validate(&token).await;
        assert!(outcome.valid);
        assert_eq!(outcome.user_id.as_deref(), Some(USER));
        assert_eq!(outcome.permissions, vec!["print:photos"]);
    }

    #[tokio::test]
    async fn test_audience_mismatch_rejected() {
        let (token, _) = issuer()
            .issue(USER, "print-service", vec!["print:photos".to_string()], None)
            .unwrap();

        let outcome = validator_for("photo-service").validate(&token).await;
        assert!(!outcome.valid);
        assert!(outcome.user_id.is_none());
    }

    #[tokio::test]
    async fn test_tampered_token_rejected() {
        let (token, _) = issuer()
            .issue(USER, "print-service", vec!["print:photos".to_string()], None)
            .unwrap();

        // Flip one byte in the payload segment.
        let mut bytes = token.into_bytes();
        let mid = bytes.len() / 2;
        bytes[mid] = if bytes[mid] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).unwrap();

        let outcome = validator_for("print-service").validate(&tampered).await;
        assert!(!outcome.valid);
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        // Craft an already-expired token with the issuer's key.
        let now = chrono::Utc::now().timestamp();
        let claims = DelegationClaims {
            iss: "spiffe://example.org/user-service".to_string(),
            sub: "spiffe://example.org/user-service".to_string(),
            aud: "spiffe://example.org/print-service".to_string(),
            user_id: USER.to_string(),
            permissions: vec!["print:photos".to_string()],
            iat: now - 1000,
            exp: now - 120,
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();

        let outcome = validator_for("print-service").validate(&token).await;
        assert!(!outcome.valid);
    }

    #[test]
    fn test_ttl_clamped_to_max() {
        let (_, ttl) = issuer()
            .issue(USER, "print-service", vec!["a".to_string()], Some(7200))
            .unwrap();
        assert_eq!(ttl, MAX_DELEGATION_TTL);
    }

    #[test]
    fn test_empty_permissions_default() {
        let iss = issuer();
        let (token, _) = iss.issue(USER, "print-service", vec![], None).unwrap();
        let claims = iss.decode(&token).unwrap();
        assert_eq!(claims.permissions, vec!["read:photos"]);
    }

    #[test]
    fn test_claims_shape() {
        let iss = issuer();
        let (token, _) = iss
            .issue(USER, "print-service", vec!["print:photos".to_string()], Some(900))
            .unwrap();
        let claims = iss.decode(&token).unwrap();

        assert_eq!(claims.iss, "spiffe://example.org/user-service");
        assert_eq!(claims.sub, claims.iss);
        assert_eq!(claims.aud, "spiffe://example.org/print-service");
        assert_eq!(claims.user_id, USER);
        assert_eq!(claims.exp - claims.iat, 900);
    }

    #[test]
    fn test_hs512_accepted() {
        let id = SpiffeId::new("example.org", "user-service").unwrap();
        let iss = DelegationIssuer::with_algorithm(SECRET, id, Algorithm::HS512).unwrap();
        let (token, _) = iss.issue(USER, "print-service", vec![], None).unwrap();
        assert!(iss.decode(&token).is_ok());
    }

    #[test]
    fn test_non_hmac_algorithm_rejected() {
        let id = SpiffeId::new("example.org", "user-service").unwrap();
        assert!(matches!(
            DelegationIssuer::with_algorithm(SECRET, id, Algorithm::RS256),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_invalid_target_workload_rejected() {
        let err = issuer().issue(USER, "not/a/name", vec![], None).unwrap_err();
        assert!(matches!(err, Error::InvalidSpiffeId(_)));
    }
}
