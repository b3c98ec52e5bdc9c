//! Session and login-state cookie construction.

use axum_extra::extract::cookie::{Cookie, SameSite};
use time::Duration;
use tr_core::auth::oauth_state::STATE_TTL;

/// Cookie name carrying the session id.
pub const SESSION_COOKIE: &str = "session_id";

/// Cookie binding a pending OAuth2 login to the browser that started it.
pub const OAUTH_STATE_COOKIE: &str = "oauth_state";

/// Only the auth routes need the login-state cookie.
const OAUTH_STATE_PATH: &str = "/api/auth";

fn http_only(
    name: &str,
    value: &str,
    path: &str,
    max_age: Duration,
    secure: bool,
) -> Cookie<'static> {
    Cookie::build((name.to_string(), value.to_string()))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .path(path.to_string())
        .max_age(max_age)
        .build()
}

/// Build the httpOnly session cookie; `max_age_secs` should match the session expiry.
pub fn session_cookie(session_id: &str, max_age_secs: i64, secure: bool) -> Cookie<'static> {
    http_only(SESSION_COOKIE, session_id, "/", Duration::seconds(max_age_secs), secure)
}

/// Build an expired session cookie to clear the browser's copy.
pub fn clear_session_cookie(secure: bool) -> Cookie<'static> {
    http_only(SESSION_COOKIE, "", "/", Duration::ZERO, secure)
}

/// Login-state cookie, living as long as the server-side pending entry.
pub fn oauth_state_cookie(state: &str, secure: bool) -> Cookie<'static> {
    let max_age = Duration::seconds(STATE_TTL.as_secs() as i64);
    http_only(OAUTH_STATE_COOKIE, state, OAUTH_STATE_PATH, max_age, secure)
}

pub fn clear_oauth_state_cookie(secure: bool) -> Cookie<'static> {
    http_only(OAUTH_STATE_COOKIE, "", OAUTH_STATE_PATH, Duration::ZERO, secure)
}
