//! Per-request authentication filter and context.
//!
//! The filter runs at HTTP request entry in every non-trivial workload: it
//! extracts the bearer token, validates it through the configured
//! [`DelegationValidator`], and binds an [`AuthContext`] to the request via
//! axum's request extensions. The context is an explicit per-request value,
//! created at entry and dropped with the request, so no handler can ever
//! observe another request's subject.

use crate::delegation::DelegationValidator;
use crate::spiffe::SpiffeId;
use crate::tls::PeerIdentity;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;
use tracing::{debug, warn};

/// The authenticated subject of the current request.
#[derive(Clone)]
pub struct AuthContext {
    /// End-user the delegation token acts for.
    pub user_id: String,
    /// Permissions granted by the token.
    pub permissions: Vec<String>,
    /// Peer workload identity when the request arrived over mTLS.
    pub peer_service_identity: Option<SpiffeId>,
    raw_token: String,
}

impl AuthContext {
    /// Returns the raw delegation token, for forwarding downstream.
    pub fn raw_token(&self) -> &str {
        &self.raw_token
    }

    /// Checks membership of any of the given permissions.
    pub fn has_any_permission(&self, required: &[&str]) -> bool {
        required
            .iter()
            .any(|needed| self.permissions.iter().any(|have| have == needed))
    }
}

impl std::fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthContext")
            .field("user_id", &self.user_id)
            .field("permissions", &self.permissions)
            .field("peer_service_identity", &self.peer_service_identity)
            .field("raw_token", &"[REDACTED]")
            .finish()
    }
}

/// Shared state for the authentication filter.
#[derive(Clone)]
pub struct AuthFilterState {
    inner: Arc<AuthFilterInner>,
}

struct AuthFilterInner {
    validator: DelegationValidator,
    exempt_prefixes: Vec<String>,
}

impl AuthFilterState {
    /// Creates filter state with the standard exemptions: the root path
    /// plus health and readiness probes.
    pub fn new(validator: DelegationValidator) -> Self {
        Self::with_exemptions(validator, ["/health", "/ready"])
    }

    /// Creates filter state with custom exempt path prefixes. The root
    /// path `/` is always exempt.
    pub fn with_exemptions<I, S>(validator: DelegationValidator, exempt_prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inner: Arc::new(AuthFilterInner {
                validator,
                exempt_prefixes: exempt_prefixes.into_iter().map(Into::into).collect(),
            }),
        }
    }

    fn is_exempt(&self, path: &str) -> bool {
        path == "/"
            || self
                .inner
                .exempt_prefixes
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()))
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// Authentication middleware for protected routes.
///
/// Exempt paths pass through untouched. Everything else requires a
/// `Bearer` delegation token that the configured validator accepts; the
/// decoded subject is inserted into the request's extensions as
/// [`AuthContext`] and discarded when the request completes.
pub async fn auth_filter(
    State(state): State<AuthFilterState>,
    mut request: Request,
    next: Next,
) -> Response {
    if state.is_exempt(request.uri().path()) {
        return next.run(request).await;
    }

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = token else {
        debug!(path = %request.uri().path(), "request without bearer token");
        return error_response(
            StatusCode::UNAUTHORIZED,
            "missing or invalid Authorization header",
        );
    };
    let token = token.to_string();

    let outcome = state.inner.validator.validate(&token).await;
    if !outcome.valid {
        let message = outcome.error.as_deref().unwrap_or("invalid token");
        warn!(path = %request.uri().path(), "rejected delegation token: {message}");
        return error_response(StatusCode::UNAUTHORIZED, message);
    }
    let Some(user_id) = outcome.user_id else {
        return error_response(StatusCode::UNAUTHORIZED, "invalid token");
    };

    let peer_service_identity = request
        .extensions()
        .get::<ConnectInfo<PeerIdentity>>()
        .map(|info| info.0.spiffe_id.clone());

    let context = AuthContext {
        user_id,
        permissions: outcome.permissions,
        peer_service_identity,
        raw_token: token,
    };
    debug!(user_id = %context.user_id, "request authenticated");
    request.extensions_mut().insert(context);

    next.run(request).await
}

/// Requires at least one of the given permissions, mapping a shortfall to
/// a 403 response body in the standard error shape.
pub fn require_any_permission(
    context: &AuthContext,
    required: &[&str],
) -> std::result::Result<(), Response> {
    if context.has_any_permission(required) {
        Ok(())
    } else {
        warn!(
            user_id = %context.user_id,
            required = ?required,
            "permission shortfall"
        );
        Err(error_response(
            StatusCode::FORBIDDEN,
            &format!("insufficient permissions, required one of: {}", required.join(", ")),
        ))
    }
}
