//! HTTP surface of the user service.

use crate::tokens::UserTokenService;
use crate::users::UserStore;
use crate::Config;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use veil_identity::delegation::{
    DelegationIssuer, RemoteTokenInfo, RemoteValidateRequest, RemoteValidateResponse,
};
use veil_identity::SpiffeId;

/// Shared service state.
#[derive(Clone)]
pub struct AppState {
    users: Arc<UserStore>,
    issuer: Arc<DelegationIssuer>,
    user_tokens: Arc<UserTokenService>,
}

impl AppState {
    /// Builds state from pre-constructed components.
    pub fn new(
        users: Arc<UserStore>,
        issuer: Arc<DelegationIssuer>,
        user_tokens: Arc<UserTokenService>,
    ) -> Self {
        Self {
            users,
            issuer,
            user_tokens,
        }
    }

    /// Builds state from configuration.
    pub fn from_config(config: &Config) -> veil_identity::Result<Self> {
        let secret = config.signing_key_bytes()?;
        let issuer_id = SpiffeId::new(&config.trust_domain, &config.service_name)?;

        let issuer = DelegationIssuer::new(&secret, issuer_id.clone())?
            .with_default_ttl(std::time::Duration::from_secs(
                config.default_delegation_ttl_seconds,
            ));
        let user_tokens =
            UserTokenService::new(&secret, issuer_id, config.user_token_ttl_seconds)?;

        Ok(Self::new(
            Arc::new(UserStore::new()),
            Arc::new(issuer),
            Arc::new(user_tokens),
        ))
    }
}

/// Builds the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/delegate", post(delegate))
        .route("/auth/validate", post(validate))
        .with_state(state)
}

fn error_body(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    username: String,
    #[serde(default)]
    email: String,
    password: String,
}

async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Response {
    match state
        .users
        .register(&request.username, &request.email, &request.password)
    {
        Ok(user) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "user_id": user.id.to_string(),
                "username": user.username,
                "message": "User registered successfully",
            })),
        )
            .into_response(),
        Err(e) => {
            warn!(username = %request.username, "registration failed: {e}");
            error_body(StatusCode::BAD_REQUEST, &format!("registration failed: {e}"))
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

async fn login(State(state): State<AppState>, Json(request): Json<LoginRequest>) -> Response {
    let Some(user) = state.users.authenticate(&request.username, &request.password) else {
        return error_body(StatusCode::UNAUTHORIZED, "invalid credentials");
    };

    match state.user_tokens.issue(user.id, &user.username) {
        Ok(token) => Json(serde_json::json!({
            "user_id": user.id.to_string(),
            "username": user.username,
            "access_token": token,
            "token_type": "Bearer",
            "message": "Login successful",
        }))
        .into_response(),
        Err(e) => {
            warn!(username = %request.username, "session token issuance failed: {e}");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "login failed")
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DelegationRequest {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    target_service: Option<String>,
    #[serde(default)]
    permissions: Option<Vec<String>>,
    #[serde(default)]
    ttl_seconds: Option<u64>,
}

/// `POST /auth/delegate`
///
/// The delegated user is always the one authenticated by the session
/// token; a `userId` in the body may only confirm it, never override it.
async fn delegate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<DelegationRequest>,
) -> Response {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let Some(token) = token else {
        return error_body(
            StatusCode::UNAUTHORIZED,
            "missing or invalid Authorization header, expected: Bearer <token>",
        );
    };

    let authenticated_user = match state.user_tokens.authenticated_user(token) {
        Ok(id) => id,
        Err(e) => {
            warn!("delegation request with bad session token: {e}");
            return error_body(
                StatusCode::UNAUTHORIZED,
                "invalid or expired authentication token",
            );
        }
    };

    if let Some(requested) = request.user_id.as_deref().filter(|s| !s.is_empty()) {
        let Ok(requested_id) = Uuid::parse_str(requested) else {
            return error_body(StatusCode::BAD_REQUEST, "invalid userId format in request");
        };
        if requested_id != authenticated_user {
            warn!(
                authenticated = %authenticated_user,
                requested = %requested_id,
                "cross-user delegation attempt"
            );
            return error_body(
                StatusCode::FORBIDDEN,
                "cannot delegate on behalf of another user",
            );
        }
    }

    let Some(target_service) = request.target_service.as_deref().filter(|s| !s.is_empty())
    else {
        return error_body(StatusCode::BAD_REQUEST, "targetService is required");
    };

    let permissions = request.permissions.unwrap_or_default();
    match state.issuer.issue(
        &authenticated_user.to_string(),
        target_service,
        permissions,
        request.ttl_seconds,
    ) {
        Ok((delegation_token, expires_in)) => {
            info!(
                user_id = %authenticated_user,
                target = %target_service,
                "issued delegation token"
            );
            Json(serde_json::json!({
                "delegation_token": delegation_token,
                "expires_in": expires_in,
            }))
            .into_response()
        }
        Err(veil_identity::Error::InvalidSpiffeId(e)) => {
            error_body(StatusCode::BAD_REQUEST, &format!("invalid request: {e}"))
        }
        Err(e) => {
            warn!("delegation issuance failed: {e}");
            error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to issue delegation token",
            )
        }
    }
}

/// `POST /auth/validate`
///
/// Remote validation for keyless workloads. Always POST; the issuer
/// checks signature and expiry, and echoes the audience so the caller
/// can enforce it.
async fn validate(
    State(state): State<AppState>,
    Json(request): Json<RemoteValidateRequest>,
) -> Response {
    if request.token.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(RemoteValidateResponse {
                valid: false,
                token: None,
                error: Some("token is required".to_string()),
            }),
        )
            .into_response();
    }

    match state.issuer.decode(&request.token) {
        Ok(claims) => Json(RemoteValidateResponse {
            valid: true,
            token: Some(RemoteTokenInfo {
                user_id: claims.user_id,
                permissions: claims.permissions,
                audience: vec![claims.aud],
                expires_at: claims.exp,
            }),
            error: None,
        })
        .into_response(),
        Err(_) => Json(RemoteValidateResponse {
            valid: false,
            token: None,
            error: Some("invalid or expired token".to_string()),
        })
        .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-delegation-signing-key-0123456789ab";

    fn test_state() -> AppState {
        let issuer_id = SpiffeId::new("example.org", "user-service").unwrap();
        let issuer = DelegationIssuer::new(SECRET, issuer_id.clone()).unwrap();
        let user_tokens = UserTokenService::new(SECRET, issuer_id, 3600).unwrap();
        AppState::new(
            Arc::new(UserStore::new()),
            Arc::new(issuer),
            Arc::new(user_tokens),
        )
    }

    async fn spawn() -> String {
        let app = router(test_state());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn register_and_login(base: &str, client: &reqwest::Client) -> (String, String) {
        let response = client
            .post(format!("{base}/auth/register"))
            .json(&serde_json::json!({
                "username": "alice", "email": "a@x", "password": "pw"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201);
        let body: serde_json::Value = response.json().await.unwrap();
        let user_id = body["user_id"].as_str().unwrap().to_string();

        let body: serde_json::Value = client
            .post(format!("{base}/auth/login"))
            .json(&serde_json::json!({"username": "alice", "password": "pw"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        (user_id, body["access_token"].as_str().unwrap().to_string())
    }

    #[tokio::test]
    async fn test_login_with_wrong_password() {
        let base = spawn().await;
        let client = reqwest::Client::new();
        register_and_login(&base, &client).await;

        let response = client
            .post(format!("{base}/auth/login"))
            .json(&serde_json::json!({"username": "alice", "password": "wrong"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 401);
    }

    #[tokio::test]
    async fn test_delegate_requires_session_token() {
        let base = spawn().await;
        let response = reqwest::Client::new()
            .post(format!("{base}/auth/delegate"))
            .json(&serde_json::json!({"targetService": "print-service"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 401);
    }

    #[tokio::test]
    async fn test_delegate_requires_target_service() {
        let base = spawn().await;
        let client = reqwest::Client::new();
        let (_, session) = register_and_login(&base, &client).await;

        let response = client
            .post(format!("{base}/auth/delegate"))
            .bearer_auth(&session)
            .json(&serde_json::json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
    }

    #[tokio::test]
    async fn test_delegate_rejects_other_user() {
        let base = spawn().await;
        let client = reqwest::Client::new();
        let (_, session) = register_and_login(&base, &client).await;

        let response = client
            .post(format!("{base}/auth/delegate"))
            .bearer_auth(&session)
            .json(&serde_json::json!({
                "userId": Uuid::new_v4().to_string(),
                "targetService": "print-service",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 403);
    }

    #[tokio::test]
    async fn test_validate_requires_token() {
        let base = spawn().await;
        let response = reqwest::Client::new()
            .post(format!("{base}/auth/validate"))
            .json(&serde_json::json!({"token": ""}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["valid"], false);
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_400() {
        let base = spawn().await;
        let client = reqwest::Client::new();
        register_and_login(&base, &client).await;

        let response = client
            .post(format!("{base}/auth/register"))
            .json(&serde_json::json!({
                "username": "alice", "email": "b@x", "password": "pw2"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
    }
}
