use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{header::SET_COOKIE, HeaderMap},
    response::{AppendHeaders, IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{error, info, instrument, warn};

use crate::{
    auth::{
        cookie,
        dto::{AuthResponse, CredentialsRequest, PublicUser, UpdateProfileRequest},
        extractors::CurrentUser,
        oauth::{CallbackParams, OAuthError},
        password::{hash_password, verify_password},
        repo::RepoError,
        repo_types::{AuthProvider, Session},
    },
    config::AppConfig,
    error::ApiError,
    response::ApiResponse,
    state::AppState,
};

/// Placeholder policy, not a strength check.
const MIN_PASSWORD_LEN: usize = 6;
const INVALID_CREDENTIALS: &str = "Username or password is incorrect";

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/signup", post(signup))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/auth/google", get(google_login))
        .route("/auth/google/callback", get(google_callback))
}

pub fn profile_routes() -> Router<AppState> {
    Router::new().route("/profile", get(get_profile).put(update_profile))
}

fn invalid_body(rejection: JsonRejection) -> ApiError {
    warn!(error = %rejection, "invalid request body");
    ApiError::validation("Invalid request body")
}

async fn issue_session(state: &AppState, user_id: i64) -> Result<Session, ApiError> {
    state.sessions.create_session(user_id).await.map_err(|e| {
        error!(error = %e, user_id, "create session failed");
        ApiError::internal("Failed to create session")
    })
}

fn authenticated(state: &AppState, message: &str, session: Session, user: PublicUser) -> Response {
    let cookie = cookie::session_cookie(&session.token, state.config.cookie_secure);
    (
        [(SET_COOKIE, cookie)],
        Json(ApiResponse::ok(
            message,
            AuthResponse {
                token: session.token,
                user,
            },
        )),
    )
        .into_response()
}

#[instrument(skip(state, payload))]
pub async fn signup(
    State(state): State<AppState>,
    payload: Result<Json<CredentialsRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(payload) = payload.map_err(invalid_body)?;

    if payload.email.is_empty() || payload.password.is_empty() {
        return Err(ApiError::validation("Email and password are required"));
    }
    if !is_valid_email(&payload.email) {
        warn!(email = %payload.email, "invalid email");
        return Err(ApiError::validation("Invalid email"));
    }
    if payload.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::validation("Password must be at least 6 characters"));
    }

    let hash = hash_password(&payload.password).map_err(|e| {
        error!(error = %e, "hash_password failed");
        ApiError::internal("Failed to create user")
    })?;

    let user = match state.users.create_local(&payload.email, &hash).await {
        Ok(u) => u,
        Err(RepoError::EmailExists) => {
            warn!(email = %payload.email, "email already registered");
            return Err(ApiError::conflict("Email already exists"));
        }
        Err(e) => {
            error!(error = %e, "create user failed");
            return Err(ApiError::internal("Failed to create user"));
        }
    };

    let session = issue_session(&state, user.id).await?;
    info!(user_id = user.id, email = %user.email, "user signed up");
    Ok(authenticated(&state, "Signup successful", session, user.into()))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<CredentialsRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(payload) = payload.map_err(invalid_body)?;

    if payload.email.is_empty() || payload.password.is_empty() {
        return Err(ApiError::validation("Email and password are required"));
    }

    let user = match state.users.find_by_email(&payload.email).await {
        Ok(Some(u)) => u,
        Ok(None) => {
            warn!(email = %payload.email, "login unknown email");
            return Err(ApiError::unauthenticated(INVALID_CREDENTIALS));
        }
        Err(e) => {
            error!(error = %e, "find_by_email failed");
            return Err(ApiError::internal("Failed to get user"));
        }
    };

    if user.auth_provider != AuthProvider::Local {
        warn!(user_id = user.id, provider = %user.auth_provider, "password login on provider account");
        return Err(ApiError::unauthenticated("Please login with Google"));
    }

    let ok = user
        .password_hash
        .as_deref()
        .map(|hash| verify_password(hash, &payload.password))
        .unwrap_or(false);
    if !ok {
        warn!(user_id = user.id, "login invalid password");
        return Err(ApiError::unauthenticated(INVALID_CREDENTIALS));
    }

    let session = issue_session(&state, user.id).await?;
    info!(user_id = user.id, email = %user.email, "user logged in");
    Ok(authenticated(&state, "Login successful", session, user.into()))
}

/// Works without the guard so a stale cookie can still be cleared.
#[instrument(skip(state, headers))]
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let token = cookie::session_token(&headers)
        .ok_or_else(|| ApiError::validation("No session found"))?;

    state.sessions.delete_session(&token).await.map_err(|e| {
        error!(error = %e, "delete session failed");
        ApiError::internal("Failed to logout")
    })?;

    info!("session revoked");
    Ok((
        [(SET_COOKIE, cookie::clear_session_cookie(state.config.cookie_secure))],
        Json(ApiResponse::message("Logout successful")),
    )
        .into_response())
}

#[instrument(skip_all)]
pub async fn get_profile(CurrentUser(user): CurrentUser) -> Json<ApiResponse<PublicUser>> {
    Json(ApiResponse::ok("Profile retrieved", user.into()))
}

#[instrument(skip_all)]
pub async fn update_profile(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    payload: Result<Json<UpdateProfileRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<PublicUser>>, ApiError> {
    let Json(payload) = payload.map_err(invalid_body)?;

    if payload.full_name.is_empty() {
        return Err(ApiError::validation("Full name is required"));
    }
    if payload.email.is_empty() {
        return Err(ApiError::validation("Email is required"));
    }
    if !is_valid_email(&payload.email) {
        return Err(ApiError::validation("Invalid email"));
    }
    if user.auth_provider != AuthProvider::Local && payload.email != user.email {
        warn!(user_id = user.id, "email change on provider account");
        return Err(ApiError::validation("Cannot change email for Google account"));
    }

    match state
        .users
        .update_profile(user.id, &payload.full_name, &payload.telephone, &payload.email)
        .await
    {
        Ok(_) => {}
        Err(RepoError::EmailExists) => {
            warn!(user_id = user.id, "profile email already taken");
            return Err(ApiError::conflict("Email already exists"));
        }
        Err(e) => {
            error!(error = %e, user_id = user.id, "update profile failed");
            return Err(ApiError::internal("Failed to update profile"));
        }
    }

    let updated = match state.users.find_by_id(user.id).await {
        Ok(Some(u)) => u,
        Ok(None) => {
            error!(user_id = user.id, "user vanished after profile update");
            return Err(ApiError::internal("Failed to get updated profile"));
        }
        Err(e) => {
            error!(error = %e, user_id = user.id, "reload profile failed");
            return Err(ApiError::internal("Failed to get updated profile"));
        }
    };

    info!(user_id = updated.id, "profile updated");
    Ok(Json(ApiResponse::ok("Profile updated", updated.into())))
}

fn login_redirect(config: &AppConfig, message: &str) -> Redirect {
    Redirect::temporary(&format!(
        "{}?error={}",
        config.login_path,
        urlencoding::encode(message)
    ))
}

#[instrument(skip(state))]
pub async fn google_login(State(state): State<AppState>) -> Response {
    match state.oauth.begin().await {
        Ok(req) => (
            [(
                SET_COOKIE,
                cookie::oauth_state_cookie(&req.state, state.config.cookie_secure),
            )],
            Redirect::temporary(req.url.as_str()),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "could not start google login");
            login_redirect(&state.config, e.user_message()).into_response()
        }
    }
}

#[instrument(skip_all)]
pub async fn google_callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
    headers: HeaderMap,
) -> Response {
    let secure = state.config.cookie_secure;
    let clear_state = cookie::clear_oauth_state_cookie(secure);
    let cookie_state = cookie::read_cookie(&headers, cookie::OAUTH_STATE_COOKIE);

    let user = match state.oauth.complete(params, cookie_state.as_deref()).await {
        Ok(outcome) => outcome.into_user(),
        Err(e) => {
            match &e {
                OAuthError::Denied(_)
                | OAuthError::MissingCode
                | OAuthError::InvalidState
                | OAuthError::EmailConflict => warn!(error = %e, "google callback rejected"),
                _ => error!(error = %e, "google callback failed"),
            }
            return (
                [(SET_COOKIE, clear_state)],
                login_redirect(&state.config, e.user_message()),
            )
                .into_response();
        }
    };

    let session = match state.sessions.create_session(user.id).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, user_id = user.id, "create session failed");
            return (
                [(SET_COOKIE, clear_state)],
                login_redirect(&state.config, "Failed to create session"),
            )
                .into_response();
        }
    };

    info!(user_id = user.id, "user logged in with google");
    (
        AppendHeaders([
            (SET_COOKIE, clear_state),
            (SET_COOKIE, cookie::session_cookie(&session.token, secure)),
        ]),
        Redirect::temporary(&state.config.landing_path),
    )
        .into_response()
}
