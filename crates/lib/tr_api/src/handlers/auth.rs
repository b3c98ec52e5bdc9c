//! Login, callback, logout and current-user handlers.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header::LOCATION};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use tr_core::auth::AuthError;
use tr_core::models::auth::User;
use tracing::{info, warn};

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::middleware::auth::{Auth, SessionAuth};
use crate::services::cookies::{self, OAUTH_STATE_COOKIE, SESSION_COOKIE};

/// Query string of the provider redirect back to us.
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

fn redirect(location: String) -> Response {
    (StatusCode::FOUND, [(LOCATION, location)]).into_response()
}

/// `GET /api/auth/{provider}/login`: redirect to the provider's consent page.
///
/// The state is also set as a cookie so the callback only completes in the
/// browser that started the login.
pub async fn login(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    jar: CookieJar,
) -> AppResult<(CookieJar, Response)> {
    let (url, oauth_state) = state.auth.begin_oauth2(&provider)?;
    let jar = jar.add(cookies::oauth_state_cookie(
        &oauth_state,
        state.config.cookie_secure(),
    ));
    Ok((jar, redirect(url)))
}

/// `GET /api/auth/{provider}/callback`: finish the login and issue a session.
pub async fn callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(params): Query<CallbackParams>,
    jar: CookieJar,
) -> AppResult<(CookieJar, Response)> {
    let oauth_state = params.state.unwrap_or_default();

    let bound = jar
        .get(OAUTH_STATE_COOKIE)
        .is_some_and(|c| !oauth_state.is_empty() && c.value() == oauth_state);
    if !bound {
        warn!(provider = %provider, "callback state does not match this browser's login");
        return Err(AuthError::OAuth2StateMismatch.into());
    }
    let jar = jar.add(cookies::clear_oauth_state_cookie(state.config.cookie_secure()));

    if let Some(error) = params.error {
        return Err(state.auth.abandon_oauth2(&provider, &oauth_state, &error).into());
    }

    let code = params
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| AppError::BadRequest("missing authorization code".into()))?;

    let user = state
        .auth
        .complete_oauth2(&provider, &code, &oauth_state)
        .await?;

    // Never carry a pre-login session across the login.
    if let Some(previous) = jar.get(SESSION_COOKIE)
        && let Err(e) = state.auth.delete_session(previous.value()).await
    {
        warn!(error = %e, "failed to revoke previous session");
    }

    let session = state.auth.create_session(user.id, &provider).await?;
    let max_age = (session.expires_at - session.created_at).num_seconds();
    let jar = jar.add(cookies::session_cookie(
        &session.id,
        max_age,
        state.config.cookie_secure(),
    ));

    info!(user_id = user.id, provider = %provider, "user signed in");
    Ok((jar, redirect("/".to_string())))
}

/// `POST /api/auth/logout`: revoke the current session and clear its cookie.
pub async fn logout(
    State(state): State<AppState>,
    SessionAuth(ctx): SessionAuth,
    jar: CookieJar,
) -> AppResult<(CookieJar, StatusCode)> {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        state.auth.delete_session(cookie.value()).await?;
    }
    info!(user_id = ctx.user_id(), "user signed out");
    let jar = jar.add(cookies::clear_session_cookie(state.config.cookie_secure()));
    Ok((jar, StatusCode::NO_CONTENT))
}

/// `GET /api/auth/me`: the authenticated user, without provider tokens.
pub async fn me(State(state): State<AppState>, Auth(ctx): Auth) -> AppResult<Json<User>> {
    let user = state.auth.get_user_by_id(ctx.user_id()).await?;
    Ok(Json(user))
}
