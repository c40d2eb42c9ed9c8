//! Workload API service.
//!
//! A miniature certificate authority behind three HTTP endpoints:
//!
//! - `POST /workload/v1/attest` - validate an attestation proof, mint a
//!   short-lived single-use ticket
//! - `GET /workload/v1/certificates` - redeem a ticket for a fresh SVID
//!   bundle (a new RSA key pair per issuance; the private key appears in
//!   this one response and nowhere else)
//! - `GET /workload/v1/health` - liveness probe
//!
//! Attestation failures map to 401 without detail, malformed requests to
//! 400, signing failures to 500.

pub mod config;
pub mod routes;

pub use config::Config;
pub use routes::{router, AppState};
