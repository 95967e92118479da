use axum::http::{header::COOKIE, HeaderMap};

use super::session::SESSION_TTL;

pub const SESSION_COOKIE: &str = "session_token";
pub const OAUTH_STATE_COOKIE: &str = "oauth_state";

/// Path the OAuth state cookie is scoped to, covering login and callback.
const OAUTH_STATE_PATH: &str = "/api/auth/google";
const OAUTH_STATE_MAX_AGE_SECS: i64 = 10 * 60;

/// Returns the value of cookie `name`, ignoring empty values.
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn session_token(headers: &HeaderMap) -> Option<String> {
    read_cookie(headers, SESSION_COOKIE)
}

fn build(name: &str, value: &str, path: &str, max_age: i64, secure: bool) -> String {
    let mut cookie =
        format!("{name}={value}; HttpOnly; Path={path}; SameSite=Lax; Max-Age={max_age}");
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

pub fn session_cookie(token: &str, secure: bool) -> String {
    build(SESSION_COOKIE, token, "/", SESSION_TTL.whole_seconds(), secure)
}

/// Expires the session cookie immediately.
pub fn clear_session_cookie(secure: bool) -> String {
    build(SESSION_COOKIE, "", "/", 0, secure)
}

pub fn oauth_state_cookie(state: &str, secure: bool) -> String {
    build(
        OAUTH_STATE_COOKIE,
        state,
        OAUTH_STATE_PATH,
        OAUTH_STATE_MAX_AGE_SECS,
        secure,
    )
}

pub fn clear_oauth_state_cookie(secure: bool) -> String {
    build(OAUTH_STATE_COOKIE, "", OAUTH_STATE_PATH, 0, secure)
}
