//! SPIFFE-inspired workload identity for the veil fleet.
//!
//! This crate is the trust core shared by every workload: it attests to the
//! Workload API, holds the current X.509 SVID in memory, rotates it before
//! expiry, validates user-delegation tokens at request entry, and builds
//! mutual-TLS configurations from the in-memory identity.
//!
//! # Components
//!
//! - [`spiffe`] - SPIFFE ID type and parsing
//! - [`bundle`] - certificates, private keys and SVID bundles
//! - [`keystore`] - secure storage abstraction for CA material
//! - [`ca`] - the certificate authority core
//! - [`attestation`] - attestation schemes and the ticket registry
//! - [`workload_client`] - HTTP client for the Workload API
//! - [`agent`] - in-process identity agent with automatic rotation
//! - [`delegation`] - delegation token issuing and validation
//! - [`auth`] - per-request authentication filter and context
//! - [`verifier`] - SPIFFE-aware rustls certificate verifiers
//! - [`tls`] - mTLS listener and client builders

pub mod agent;
pub mod attestation;
pub mod auth;
pub mod bundle;
pub mod ca;
pub mod delegation;
pub mod keystore;
pub mod spiffe;
pub mod tls;
pub mod verifier;
pub mod workload_client;

pub use agent::{AgentConfig, IdentityAgent};
pub use attestation::{AttestationProof, AttestationRegistry, AttestationScheme};
pub use auth::{auth_filter, AuthContext, AuthFilterState};
pub use bundle::{Certificate, PrivateKey, SvidBundle, TrustBundle};
pub use ca::CertificateAuthority;
pub use delegation::{
    DelegationClaims, DelegationIssuer, DelegationValidator, ValidationOutcome,
};
pub use keystore::{CaMaterial, FilesystemKeyStore, MemoryKeyStore, SecureKeyStore};
pub use spiffe::SpiffeId;
pub use tls::{mtls_client, MtlsListener, PeerIdentity};
pub use verifier::{SpiffeClientVerifier, SpiffeServerVerifier};
pub use workload_client::WorkloadApiClient;

/// Errors that can occur in veil-identity operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unreadable key store, missing signing key, invalid trust domain.
    /// Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid SPIFFE URI format.
    #[error("invalid SPIFFE ID: {0}")]
    InvalidSpiffeId(String),

    /// Certificate parsing or encoding error.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Cryptographic failure during certificate issuance.
    #[error("signing failed: {0}")]
    Signing(String),

    /// The claimant failed the registry's attestation scheme.
    #[error("attestation denied")]
    AttestationDenied,

    /// Unknown, expired, or mismatched attestation ticket.
    #[error("attestation ticket invalid")]
    TicketInvalid,

    /// The agent could not obtain a first bundle within the retry budget.
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    /// `current()` called with no valid bundle.
    #[error("no valid identity available")]
    NoIdentity,

    /// Signature, expiry, audience, or remote-validation failure.
    #[error("token invalid: {0}")]
    TokenInvalid(String),

    /// Token is valid but lacks the required scope.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation not supported by this implementation.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Anything else. Client-facing messages stay generic.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for veil-identity operations.
pub type Result<T> = std::result::Result<T, Error>;
