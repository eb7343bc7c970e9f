//! Session enforcement for protected peer routes.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use sharenet_rpc::{bearer_token, ApiError};
use sharenet_security::{AuthError, SecurityEvent, SessionInfo};
use tracing::debug;

use crate::server::PeerState;

/// Inserted into request extensions once the bearer token is validated.
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub token: String,
    pub session: SessionInfo,
}

pub fn auth_rejection(err: &AuthError) -> ApiError {
    match err {
        AuthError::InvalidCredentials => {
            ApiError::new(StatusCode::UNAUTHORIZED, "invalid_credentials", err.to_string())
        }
        AuthError::Unauthenticated => ApiError::unauthorized(err.to_string()),
        AuthError::TooManyAttempts { .. } => {
            ApiError::new(StatusCode::TOO_MANY_REQUESTS, "too_many_attempts", err.to_string())
        }
    }
}

pub async fn require_session(
    State(state): State<PeerState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let endpoint = request.uri().path().to_string();
    let token = match bearer_token(request.headers()) {
        Some(token) => token.to_string(),
        None => {
            state.sessions().audit().record(SecurityEvent::UnauthorizedAccess {
                endpoint,
                reason: "missing bearer token".into(),
            });
            return Err(ApiError::unauthorized("authentication required"));
        }
    };

    match state.sessions().authorize(&token) {
        Ok(session) => {
            debug!("{} authorized for {}", session.peer_id, endpoint);
            request
                .extensions_mut()
                .insert(Authenticated { token, session });
            Ok(next.run(request).await)
        }
        Err(err) => {
            state.sessions().audit().record(SecurityEvent::UnauthorizedAccess {
                endpoint,
                reason: err.to_string(),
            });
            Err(auth_rejection(&err))
        }
    }
}
