//! Service configuration.

use clap::Parser;
use std::path::PathBuf;

/// Workload API configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "veil-workload-api")]
#[command(about = "Attests workloads and issues short-lived X.509 SVIDs")]
pub struct Config {
    /// Listen address for the plain-HTTP bootstrap surface.
    #[arg(long, env = "WORKLOAD_API_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// Trust domain embedded in every SPIFFE ID.
    #[arg(long, env = "TRUST_DOMAIN", default_value = "example.org")]
    pub trust_domain: String,

    /// Directory for the filesystem CA key store. Development only.
    #[arg(long, env = "CA_KEY_STORE_PATH", default_value = "./ca-keys")]
    pub key_store_path: PathBuf,

    /// Validity of issued workload certificates, in seconds.
    #[arg(long, env = "CERTIFICATE_TTL_SECONDS", default_value_t = 3600)]
    pub certificate_ttl_seconds: u64,

    /// Static attestation tokens as `service=token` pairs, comma separated.
    /// Development scheme only.
    #[arg(long, env = "ATTESTATION_TOKENS", value_delimiter = ',')]
    pub attestation_tokens: Vec<String>,
}

impl Config {
    /// Parses the `service=token` pairs.
    pub fn parsed_attestation_tokens(
        &self,
    ) -> veil_identity::Result<Vec<(String, String)>> {
        let mut pairs = Vec::new();
        for entry in &self.attestation_tokens {
            let Some((service, token)) = entry.split_once('=') else {
                return Err(veil_identity::Error::Config(format!(
                    "malformed attestation token entry (want service=token): {entry}"
                )));
            };
            if service.is_empty() || token.is_empty() {
                return Err(veil_identity::Error::Config(format!(
                    "empty service or token in attestation entry: {entry}"
                )));
            }
            pairs.push((service.to_string(), token.to_string()));
        }
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_tokens(tokens: &[&str]) -> Config {
        Config {
            listen: "127.0.0.1:0".to_string(),
            trust_domain: "example.org".to_string(),
            key_store_path: PathBuf::from("./ca-keys"),
            certificate_ttl_seconds: 3600,
            attestation_tokens: tokens.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn test_parses_token_pairs() {
        let config = config_with_tokens(&[
            "photo-service=dev-token-photo-service-12345",
            "print-service=dev-token-print-service-67890",
        ]);
        let pairs = config.parsed_attestation_tokens().unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, "photo-service");
    }

    #[test]
    fn test_rejects_malformed_pair() {
        let config = config_with_tokens(&["photo-service"]);
        assert!(config.parsed_attestation_tokens().is_err());
    }

    #[test]
    fn test_rejects_empty_token() {
        let config = config_with_tokens(&["photo-service="]);
        assert!(config.parsed_attestation_tokens().is_err());
    }
}
