//! User service: the external-collaborator shell of the trust core.
//!
//! Authenticates end-users (register/login with argon2 password hashes),
//! protects the delegation endpoint with user session tokens, mints
//! audience-scoped delegation tokens, and hosts the remote validation
//! endpoint that keyless workloads fall back to.
//!
//! Endpoints:
//!
//! - `POST /auth/register` - create a user
//! - `POST /auth/login` - password check, returns a user session token
//! - `POST /auth/delegate` - mint a delegation token for the caller
//! - `POST /auth/validate` - remote delegation-token validation (POST
//!   only; tokens never travel in query strings)

pub mod config;
pub mod routes;
pub mod tokens;
pub mod users;

pub use config::Config;
pub use routes::{router, AppState};
pub use tokens::UserTokenService;
pub use users::UserStore;
