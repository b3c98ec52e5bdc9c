//! Authentication middleware and extractors.
//!
//! Every protected request runs one pipeline: a `Bearer` API key is tried
//! first, then the `session_id` cookie. The resulting [`AuthContext`] is
//! stored in request extensions under a private key, so handlers can only
//! obtain it through [`auth_context`] or the extractors below.

use axum::{
    Router,
    extract::{FromRequestParts, Request, State},
    http::{Extensions, HeaderMap, header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::cookie::CookieJar;
use std::convert::Infallible;
use tr_core::auth::AuthError;
use tr_core::models::auth::AuthContext;
use tracing::{debug, warn};

use crate::AppState;
use crate::error::AppError;
use crate::services::cookies::SESSION_COOKIE;

/// Which credentials a route tree accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthPolicy {
    /// Reject requests that carry no valid credential.
    pub required: bool,
    /// Accept only API-key callers.
    pub api_key_only: bool,
}

impl AuthPolicy {
    /// Run handlers with or without a context.
    pub const OPTIONAL: Self = Self {
        required: false,
        api_key_only: false,
    };
    /// Session or API key.
    pub const REQUIRED: Self = Self {
        required: true,
        api_key_only: false,
    };
    /// API key only.
    pub const API_KEY: Self = Self {
        required: true,
        api_key_only: true,
    };
}

/// Extension key for the authenticated context. Private so nothing outside
/// this module can insert one.
#[derive(Clone)]
struct Authenticated(AuthContext);

/// Wrap `router` so every route in it passes through the authentication
/// pipeline under `policy`.
pub fn protect(router: Router<AppState>, state: &AppState, policy: AuthPolicy) -> Router<AppState> {
    router.layer(axum::middleware::from_fn_with_state(
        (state.clone(), policy),
        authenticate,
    ))
}

/// The context attached to a request, if any.
pub fn auth_context(extensions: &Extensions) -> Option<AuthContext> {
    extensions.get::<Authenticated>().map(|a| a.0.clone())
}

async fn authenticate(
    State((state, policy)): State<(AppState, AuthPolicy)>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let resolved = match resolve(&state, request.headers()).await {
        Ok(resolved) => resolved,
        // Optional routes serve anonymously when credentials cannot be checked.
        Err(e) if !policy.required => {
            warn!(error = %e, "credential check failed, continuing anonymously");
            None
        }
        Err(e) => return Err(e),
    };
    match resolved {
        Some(ctx) if policy.api_key_only && !ctx.is_api_key() => {
            return Err(AppError::ApiKeyRequired);
        }
        Some(ctx) => {
            request.extensions_mut().insert(Authenticated(ctx));
        }
        None if policy.api_key_only => return Err(AppError::ApiKeyRequired),
        None if policy.required => return Err(AppError::Unauthorized),
        None => {}
    }
    Ok(next.run(request).await)
}

/// Try the bearer key, then the session cookie. Rejected credentials fall
/// through; store failures are returned.
async fn resolve(state: &AppState, headers: &HeaderMap) -> Result<Option<AuthContext>, AppError> {
    if let Some(token) = bearer_token(headers) {
        match state.auth.validate_api_key(token).await {
            Ok(ctx) => return Ok(Some(ctx)),
            Err(e) if is_rejection(&e) => debug!(reason = %e, "bearer credential rejected"),
            Err(e) => return Err(e.into()),
        }
    }

    let jar = CookieJar::from_headers(headers);
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        match state.auth.validate_session(cookie.value()).await {
            Ok(ctx) => return Ok(Some(ctx)),
            Err(e) if is_rejection(&e) => debug!(reason = %e, "session cookie rejected"),
            Err(e) => return Err(e.into()),
        }
    }

    Ok(None)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn is_rejection(e: &AuthError) -> bool {
    matches!(
        e,
        AuthError::InvalidCredentials
            | AuthError::SessionNotFound
            | AuthError::SessionExpired
            | AuthError::InvalidApiKey
            | AuthError::ApiKeyExpired
    )
}

/// Extractor for routes that need an authenticated caller.
#[derive(Debug, Clone)]
pub struct Auth(pub AuthContext);

impl<S: Send + Sync> FromRequestParts<S> for Auth {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        auth_context(&parts.extensions)
            .map(Auth)
            .ok_or(AppError::Unauthorized)
    }
}

/// Extractor for routes that accept only browser sessions; API-key callers get 403.
#[derive(Debug, Clone)]
pub struct SessionAuth(pub AuthContext);

impl<S: Send + Sync> FromRequestParts<S> for SessionAuth {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ctx = auth_context(&parts.extensions).ok_or(AppError::Unauthorized)?;
        if ctx.is_api_key() {
            return Err(AppError::Forbidden);
        }
        Ok(SessionAuth(ctx))
    }
}

/// Extractor for optional-auth routes.
#[derive(Debug, Clone)]
pub struct MaybeAuth(pub Option<AuthContext>);

impl<S: Send + Sync> FromRequestParts<S> for MaybeAuth {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(MaybeAuth(auth_context(&parts.extensions)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_token_requires_scheme() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwdw=="));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer tr_abc"));
        assert_eq!(bearer_token(&headers), Some("tr_abc"));
    }

    #[test]
    fn store_failures_are_not_rejections() {
        assert!(is_rejection(&AuthError::SessionExpired));
        assert!(!is_rejection(&AuthError::Internal("boom".into())));
    }

    #[test]
    fn contexts_cannot_be_forged_through_public_types() {
        let mut extensions = Extensions::new();
        extensions.insert(AuthPolicy::REQUIRED);
        assert!(auth_context(&extensions).is_none());
    }
}
