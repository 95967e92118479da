use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{header::SET_COOKIE, request::Parts, HeaderMap},
    response::{IntoResponse, Response},
};
use tracing::{error, warn};

use super::cookie;
use super::repo_types::User;
use crate::{error::ApiError, state::AppState};

/// The authenticated user, resolved from the session cookie. Taking this as a
/// handler argument makes the route require a valid session.
pub struct CurrentUser(pub User);

/// Guard failure. Carries whether the presented cookie should be cleared.
#[derive(Debug)]
pub struct AuthRejection {
    error: ApiError,
    clear_cookie: bool,
    secure: bool,
}

impl AuthRejection {
    fn missing() -> Self {
        Self {
            error: ApiError::unauthenticated("Unauthorized"),
            clear_cookie: false,
            secure: false,
        }
    }

    fn stale(msg: &str, secure: bool) -> Self {
        Self {
            error: ApiError::unauthenticated(msg),
            clear_cookie: true,
            secure,
        }
    }

    fn internal(msg: &str) -> Self {
        Self {
            error: ApiError::internal(msg),
            clear_cookie: false,
            secure: false,
        }
    }
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        if self.clear_cookie {
            (
                [(SET_COOKIE, cookie::clear_session_cookie(self.secure))],
                self.error,
            )
                .into_response()
        } else {
            self.error.into_response()
        }
    }
}

/// Resolves the session cookie to a user. Each step returns on failure, so a
/// request without a live session never reaches the handler.
pub async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<User, AuthRejection> {
    let secure = state.config.cookie_secure;

    let token = cookie::session_token(headers).ok_or_else(AuthRejection::missing)?;

    let session = state
        .sessions
        .get_valid_session(&token)
        .await
        .map_err(|e| {
            error!(error = %e, "session lookup failed");
            AuthRejection::internal("Failed to validate session")
        })?
        .ok_or_else(|| {
            warn!("rejected unknown or expired session");
            AuthRejection::stale("Session Expired", secure)
        })?;

    let user = match state.users.find_by_id(session.user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            warn!(user_id = session.user_id, "session points at missing user");
            return Err(AuthRejection::stale("User not found", secure));
        }
        Err(e) => {
            error!(error = %e, user_id = session.user_id, "user lookup failed");
            return Err(AuthRejection::stale("User not found", secure));
        }
    };

    Ok(user)
}

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        authenticate(state, &parts.headers).await.map(CurrentUser)
    }
}
