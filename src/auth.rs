use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::warn;

use crate::handlers::AppState;

#[derive(Debug, PartialEq, Eq)]
pub enum AuthError {
    MissingToken,
    MalformedHeader,
    InvalidToken,
}

impl AuthError {
    pub fn message(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "Authorization header is required",
            AuthError::MalformedHeader => "Authorization header must be 'Bearer <token>'",
            AuthError::InvalidToken => "Invalid token",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "missing_token",
            AuthError::MalformedHeader => "malformed_authorization",
            AuthError::InvalidToken => "invalid_token",
        }
    }
}

/// Compare a bearer `Authorization` header value against the configured
/// token. Digests are compared so the comparison time does not depend on
/// where the strings first differ.
pub fn check_token(header: Option<&str>, expected: &str) -> Result<(), AuthError> {
    let value = header.ok_or(AuthError::MissingToken)?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
        .ok_or(AuthError::MalformedHeader)?;

    let presented = Sha256::digest(token.as_bytes());
    let wanted = Sha256::digest(expected.as_bytes());
    let diff = presented
        .iter()
        .zip(wanted.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b));
    if diff == 0 {
        Ok(())
    } else {
        Err(AuthError::InvalidToken)
    }
}

/// Rejects requests without the configured bearer token. A no-op when no
/// token is configured.
pub async fn require_token(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = state.engine.config().auth_token.as_deref() {
        let presented = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if let Err(e) = check_token(presented, expected) {
            warn!(path = %request.uri().path(), code = e.code(), "Rejected request");
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({
                    "error": e.code(),
                    "message": e.message(),
                })),
            )
                .into_response();
        }
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_token() {
        assert_eq!(check_token(Some("Bearer s3cret"), "s3cret"), Ok(()));
        assert_eq!(check_token(Some("bearer s3cret "), "s3cret"), Ok(()));
    }

    #[test]
    fn test_rejections() {
        assert_eq!(check_token(None, "s3cret"), Err(AuthError::MissingToken));
        assert_eq!(
            check_token(Some("Basic abc"), "s3cret"),
            Err(AuthError::MalformedHeader)
        );
        assert_eq!(
            check_token(Some("Bearer s3cre"), "s3cret"),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(AuthError::InvalidToken.code(), "invalid_token");
        assert!(AuthError::MissingToken.message().contains("Authorization"));
    }
}
