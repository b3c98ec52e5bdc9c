//! # tr_api
//!
//! HTTP authentication layer for Test Results: the OAuth2 login endpoints,
//! API-key management, and the router decorator domain modules use to put
//! their routes behind authentication.

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod services;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};
use tower_http::cors::CorsLayer;
use tr_core::auth::AuthService;

use crate::config::ApiConfig;
use crate::handlers::{api_keys, auth, health};

pub use crate::middleware::auth::{Auth, AuthPolicy, MaybeAuth, SessionAuth, auth_context, protect};
pub use tr_core::models::auth::AuthContext;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthService>,
    pub config: ApiConfig,
}

impl AppState {
    pub fn new(auth: Arc<AuthService>, config: ApiConfig) -> Self {
        Self { auth, config }
    }
}

/// Builds the router with the authentication and health routes.
pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/api/auth/{provider}/login", get(auth::login))
        .route("/api/auth/{provider}/callback", get(auth::callback));

    let protected = protect(
        Router::new()
            .route("/api/auth/logout", post(auth::logout))
            .route("/api/auth/me", get(auth::me))
            .route("/api/auth/api-keys", get(api_keys::list).post(api_keys::create))
            .route("/api/auth/api-keys/{id}", delete(api_keys::delete)),
        &state,
        AuthPolicy::REQUIRED,
    );

    let mut app = Router::new()
        .merge(public)
        .merge(protected)
        .layer(axum::middleware::from_fn_with_state(
            state.config.request_timeout,
            middleware::timeout::deadline,
        ));

    if !state.config.is_production() {
        app = app.layer(CorsLayer::permissive());
    }

    app.with_state(state)
}
