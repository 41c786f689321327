//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use coachhub_shared::UserId;
use serde_json::json;

use super::jwt::JwtVerifier;

/// Authenticated user extracted from the bearer token
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: UserId,
    pub email: Option<String>,
}

/// Extract bearer token from the Authorization header
fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Middleware that requires a valid Supabase access token
pub async fn require_auth(
    State(verifier): State<JwtVerifier>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let auth_result = match extract_bearer_token(&request) {
        Some(token) => verifier.verify(token),
        None if request.headers().contains_key(AUTHORIZATION) => Err(AuthError::InvalidAuthFormat),
        None => Err(AuthError::MissingAuth),
    };

    match auth_result {
        Ok((user_id, claims)) => {
            tracing::debug!(path = %path, user_id = %user_id, "require_auth: authenticated");
            request.extensions_mut().insert(AuthUser {
                user_id,
                email: claims.email,
            });
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_auth: authentication failed");
            err.into_response()
        }
    }
}

/// Middleware that requires a Supabase service-role token
pub async fn require_service_role(
    State(verifier): State<JwtVerifier>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let auth_result = match extract_bearer_token(&request) {
        Some(token) => verifier.verify_service_role(token),
        None if request.headers().contains_key(AUTHORIZATION) => Err(AuthError::InvalidAuthFormat),
        None => Err(AuthError::MissingAuth),
    };

    match auth_result {
        Ok(_) => {
            tracing::debug!(path = %path, "require_service_role: authenticated");
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_service_role: rejected");
            err.into_response()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid authentication format")]
    InvalidAuthFormat,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Service role required")]
    Forbidden,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::InvalidAuthFormat => {
                (StatusCode::UNAUTHORIZED, "Invalid authentication format")
            }
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
            AuthError::Forbidden => (StatusCode::FORBIDDEN, "Service role required"),
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}
