//! Workload attestation schemes and the ticket registry.
//!
//! Attestation decides whether a claimant is the workload it says it is.
//! A successful attestation mints a short-lived single-use ticket that can
//! be redeemed once for a certificate bundle.
//!
//! The static-secret scheme compares a per-workload pre-shared token and is
//! for local development only. Production schemes (orchestrator service
//! account tokens, cloud instance identity documents, process inspection)
//! plug in as additional [`AttestationScheme`] variants behind the same
//! `validate` seam.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Default attestation ticket TTL: five minutes.
pub const DEFAULT_TICKET_TTL: Duration = Duration::from_secs(300);

/// Proof material presented by a claimant.
///
/// Only the fields a scheme consumes participate in the decision; callers
/// may send auxiliary fields (`service_name`, `process_id`) that are
/// ignored by the static-secret scheme.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttestationProof {
    /// Pre-shared token for the static-secret scheme.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Claimed service name, informational.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    /// Claimant process id, informational.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u64>,
}

impl AttestationProof {
    /// Proof for the static-secret scheme.
    pub fn static_secret(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Default::default()
        }
    }
}

/// How claimants prove their identity.
#[derive(Debug, Clone)]
pub enum AttestationScheme {
    /// Per-workload pre-shared tokens. Development only.
    StaticSecret {
        /// Workload name to expected token.
        tokens: HashMap<String, String>,
    },
    /// Orchestrator service-account token verification.
    ServiceAccountToken,
    /// Cloud instance-identity document verification.
    CloudInstanceIdentity,
    /// Process inspection / unix-socket peer credentials.
    ProcessAuthority,
}

impl AttestationScheme {
    /// Builds the static-secret scheme from `(workload, token)` pairs.
    pub fn static_secret<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        Self::StaticSecret {
            tokens: tokens
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Validates `proof` for the claimed workload, returning the confirmed
    /// workload name.
    ///
    /// The error never distinguishes a wrong name from a wrong token;
    /// callers surface it as a generic 401.
    pub fn validate(&self, workload_name: &str, proof: &AttestationProof) -> Result<String> {
        match self {
            Self::StaticSecret { tokens } => {
                let expected = tokens.get(workload_name).ok_or_else(|| {
                    warn!(workload = %workload_name, "no attestation token configured");
                    Error::AttestationDenied
                })?;
                let provided = proof.token.as_deref().ok_or_else(|| {
                    warn!(workload = %workload_name, "attestation proof missing token");
                    Error::AttestationDenied
                })?;
                if provided != expected {
                    warn!(workload = %workload_name, "attestation token mismatch");
                    return Err(Error::AttestationDenied);
                }
                Ok(workload_name.to_string())
            }
            Self::ServiceAccountToken => Err(Error::NotSupported(
                "service-account token attestation".to_string(),
            )),
            Self::CloudInstanceIdentity => Err(Error::NotSupported(
                "cloud instance-identity attestation".to_string(),
            )),
            Self::ProcessAuthority => Err(Error::NotSupported(
                "process-authority attestation".to_string(),
            )),
        }
    }
}

/// A minted attestation ticket.
struct Ticket {
    workload_name: String,
    expires_at: Instant,
}

/// Validates claimants and tracks outstanding tickets.
///
/// Tickets live in an in-memory map keyed by random UUID, expire after
/// [`DEFAULT_TICKET_TTL`], are evicted lazily at read time, and are
/// consumed by a successful redemption.
pub struct AttestationRegistry {
    scheme: AttestationScheme,
    ticket_ttl: Duration,
    tickets: Mutex<HashMap<uuid::Uuid, Ticket>>,
}

impl AttestationRegistry {
    /// Creates a registry with the default five-minute ticket TTL.
    pub fn new(scheme: AttestationScheme) -> Self {
        Self::with_ticket_ttl(scheme, DEFAULT_TICKET_TTL)
    }

    /// Creates a registry with a custom ticket TTL.
    pub fn with_ticket_ttl(scheme: AttestationScheme, ticket_ttl: Duration) -> Self {
        Self {
            scheme,
            ticket_ttl,
            tickets: Mutex::new(HashMap::new()),
        }
    }

    /// Attests a claimant and mints a ticket on success.
    pub fn attest(&self, workload_name: &str, proof: &AttestationProof) -> Result<String> {
        let confirmed = self.scheme.validate(workload_name, proof)?;

        let id = uuid::Uuid::new_v4();
        let ticket = Ticket {
            workload_name: confirmed.clone(),
            expires_at: Instant::now() + self.ticket_ttl,
        };

        let mut tickets = self
            .tickets
            .lock()
            .map_err(|_| Error::Internal("ticket map lock poisoned".to_string()))?;
        evict_expired(&mut tickets);
        tickets.insert(id, ticket);

        info!(workload = %confirmed, "attestation succeeded, ticket issued");
        Ok(id.to_string())
    }

    /// Redeems a ticket for the expected workload.
    ///
    /// Returns `false` for unknown, expired, or mismatched tickets. A
    /// successful redemption consumes the ticket.
    pub fn redeem(&self, ticket_id: &str, expected_workload_name: &str) -> bool {
        let Ok(id) = uuid::Uuid::parse_str(ticket_id) else {
            return false;
        };
        let Ok(mut tickets) = self.tickets.lock() else {
            return false;
        };
        evict_expired(&mut tickets);

        match tickets.get(&id) {
            Some(ticket) if ticket.workload_name == expected_workload_name => {
                tickets.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Resolves a ticket to its bound workload name without consuming it.
    pub fn workload_for_ticket(&self, ticket_id: &str) -> Option<String> {
        let id = uuid::Uuid::parse_str(ticket_id).ok()?;
        let mut tickets = self.tickets.lock().ok()?;
        evict_expired(&mut tickets);
        tickets.get(&id).map(|t| t.workload_name.clone())
    }

    /// Number of live tickets.
    pub fn outstanding(&self) -> usize {
        let Ok(mut tickets) = self.tickets.lock() else {
            return 0;
        };
        evict_expired(&mut tickets);
        tickets.len()
    }
}

fn evict_expired(tickets: &mut HashMap<uuid::Uuid, Ticket>) {
    let now = Instant::now();
    tickets.retain(|_, t| t.expires_at > now);
}

impl std::fmt::Debug for AttestationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttestationRegistry")
            .field("ticket_ttl", &self.ticket_ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> AttestationRegistry {
        AttestationRegistry::new(AttestationScheme::static_secret([
            ("photo-service", "dev-token-photo-service-12345"),
            ("print-service", "dev-token-print-service-67890"),
        ]))
    }

    #[test]
    fn test_attest_valid_token() {
        let reg = registry();
        let ticket = reg
            .attest(
                "photo-service",
                &AttestationProof::static_secret("dev-token-photo-service-12345"),
            )
            .unwrap();
        assert_eq!(
            reg.workload_for_ticket(&ticket).as_deref(),
            Some("photo-service")
        );
    }

    #[test]
    fn test_attest_wrong_token() {
        let reg = registry();
        let err = reg
            .attest("photo-service", &AttestationProof::static_secret("wrong"))
            .unwrap_err();
        assert!(matches!(err, Error::AttestationDenied));
        assert_eq!(reg.outstanding(), 0);
    }

    #[test]
    fn test_attest_missing_token() {
        let reg = registry();
        let err = reg
            .attest("photo-service", &AttestationProof::default())
            .unwrap_err();
        assert!(matches!(err, Error::AttestationDenied));
    }

    #[test]
    fn test_attest_unknown_workload() {
        let reg = registry();
        let err = reg
            .attest("rogue-service", &AttestationProof::static_secret("anything"))
            .unwrap_err();
        assert!(matches!(err, Error::AttestationDenied));
    }

    #[test]
    fn test_redeem_consumes_ticket() {
        let reg = registry();
        let ticket = reg
            .attest(
                "print-service",
                &AttestationProof::static_secret("dev-token-print-service-67890"),
            )
            .unwrap();

        assert!(reg.redeem(&ticket, "print-service"));
        // Single use.
        assert!(!reg.redeem(&ticket, "print-service"));
    }

    #[test]
    fn test_redeem_name_mismatch() {
        let reg = registry();
        let ticket = reg
            .attest(
                "print-service",
                &AttestationProof::static_secret("dev-token-print-service-67890"),
            )
            .unwrap();

        assert!(!reg.redeem(&ticket, "photo-service"));
        // Mismatch does not consume the ticket.
        assert!(reg.redeem(&ticket, "print-service"));
    }

    #[test]
    fn test_redeem_unknown_or_garbage() {
        let reg = registry();
        assert!(!reg.redeem(&uuid::Uuid::new_v4().to_string(), "photo-service"));
        assert!(!reg.redeem("not-a-uuid", "photo-service"));
    }

    #[test]
    fn test_ticket_expiry() {
        let reg = AttestationRegistry::with_ticket_ttl(
            AttestationScheme::static_secret([("photo-service", "t")]),
            Duration::from_millis(10),
        );
        let ticket = reg
            .attest("photo-service", &AttestationProof::static_secret("t"))
            .unwrap();

        std::thread::sleep(Duration::from_millis(30));
        assert!(!reg.redeem(&ticket, "photo-service"));
        assert_eq!(reg.outstanding(), 0);
    }

    #[test]
    fn test_unimplemented_scheme_refuses() {
        let reg = AttestationRegistry::new(AttestationScheme::ServiceAccountToken);
        let err = reg
            .attest("photo-service", &AttestationProof::static_secret("t"))
            .unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }
}
