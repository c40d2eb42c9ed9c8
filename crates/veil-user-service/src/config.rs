//! Service configuration.

use base64::Engine;
use clap::Parser;

/// User service configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "veil-user-service")]
#[command(about = "User authentication and delegation token issuing")]
pub struct Config {
    /// Listen address.
    #[arg(long, env = "USER_SERVICE_LISTEN", default_value = "0.0.0.0:8081")]
    pub listen: String,

    /// Trust domain for issuer and audience SPIFFE IDs.
    #[arg(long, env = "TRUST_DOMAIN", default_value = "example.org")]
    pub trust_domain: String,

    /// This workload's name.
    #[arg(long, env = "SERVICE_NAME", default_value = "user-service")]
    pub service_name: String,

    /// Base64-encoded symmetric signing key, at least 256 bits.
    #[arg(long, env = "DELEGATION_SIGNING_KEY")]
    pub delegation_signing_key: String,

    /// Default delegation token TTL in seconds.
    #[arg(long, env = "DEFAULT_DELEGATION_TTL_SECONDS", default_value_t = 900)]
    pub default_delegation_ttl_seconds: u64,

    /// User session token TTL in seconds.
    #[arg(long, env = "USER_TOKEN_TTL_SECONDS", default_value_t = 3600)]
    pub user_token_ttl_seconds: u64,
}

impl Config {
    /// Decodes the base64 signing key.
    pub fn signing_key_bytes(&self) -> veil_identity::Result<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.delegation_signing_key)
            .map_err(|e| {
                veil_identity::Error::Config(format!("delegation signing key is not base64: {e}"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signing_key_decodes() {
        let config = Config {
            listen: "127.0.0.1:0".to_string(),
            trust_domain: "example.org".to_string(),
            service_name: "user-service".to_string(),
            delegation_signing_key: base64::engine::general_purpose::STANDARD
                .encode(b"test-delegation-signing-key-0123456789ab"),
            default_delegation_ttl_seconds: 900,
            user_token_ttl_seconds: 3600,
        };
        assert_eq!(config.signing_key_bytes().unwrap().len(), 40);
    }

    #[test]
    fn test_rejects_non_base64_key() {
        let config = Config {
            listen: "127.0.0.1:0".to_string(),
            trust_domain: "example.org".to_string(),
            service_name: "user-service".to_string(),
            delegation_signing_key: "not base64 !!!".to_string(),
            default_delegation_ttl_seconds: 900,
            user_token_ttl_seconds: 3600,
        };
        assert!(config.signing_key_bytes().is_err());
    }
}
