//! User session tokens.
//!
//! The same JWT shape as a delegation token but with `sub` = user id and
//! no audience. Session tokens exist only to protect the delegation
//! endpoint: a user logs in, receives one, and presents it to
//! `/auth/delegate`.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;
use veil_identity::{Error, Result, SpiffeId};

/// Claims of a user session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserClaims {
    /// The user id.
    pub sub: String,
    /// Issuer SPIFFE ID.
    pub iss: String,
    /// Username, informational.
    pub username: String,
    /// Same as `sub`, kept for symmetry with delegation claims.
    pub user_id: String,
    /// Issued-at, seconds since the epoch.
    pub iat: i64,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
}

/// Issues and validates user session tokens.
pub struct UserTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer_id: SpiffeId,
    ttl_seconds: u64,
}

impl UserTokenService {
    /// Creates the service. The secret must be at least 256 bits and is
    /// typically the same key the delegation issuer signs with.
    pub fn new(secret: &[u8], issuer_id: SpiffeId, ttl_seconds: u64) -> Result<Self> {
        if secret.len() < veil_identity::delegation::MIN_SIGNING_KEY_BYTES {
            return Err(Error::Config(format!(
                "user token signing key too short: {} bytes",
                secret.len()
            )));
        }
        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            issuer_id,
            ttl_seconds,
        })
    }

    /// Issues a session token for an authenticated user.
    pub fn issue(&self, user_id: Uuid, username: &str) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        let claims = UserClaims {
            sub: user_id.to_string(),
            iss: self.issuer_id.to_uri(),
            username: username.to_string(),
            user_id: user_id.to_string(),
            iat: now,
            exp: now + self.ttl_seconds as i64,
        };

        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("token encoding failed: {e}")))?;

        info!(user_id = %user_id, username = %username, "issued user session token");
        Ok(token)
    }

    /// Validates a session token and returns the authenticated user id.
    pub fn authenticated_user(&self, token: &str) -> Result<Uuid> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;

        let data = jsonwebtoken::decode::<UserClaims>(token, &self.decoding_key, &validation)
            .map_err(|e| {
                debug!("user session token rejected: {e}");
                Error::TokenInvalid("invalid or expired authentication token".to_string())
            })?;

        Uuid::parse_str(&data.claims.user_id)
            .map_err(|_| Error::TokenInvalid("invalid user id in token".to_string()))
    }
}

impl std::fmt::Debug for UserTokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserTokenService")
            .field("issuer_id", &self.issuer_id.to_uri())
            .field("ttl_seconds", &self.ttl_seconds)
            .finish()
    }
}
