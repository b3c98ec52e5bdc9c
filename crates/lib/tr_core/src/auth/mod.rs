//! Authentication and access control.
//!
//! Layered leaf-first: the credential store persists users, sessions and
//! hashed API keys; the federation adapter talks to OAuth2 providers; the
//! service composes both into session, API-key and login flows.

pub mod federation;
pub mod memory;
pub mod oauth_state;
pub mod pg;
pub mod secrets;
pub mod service;
pub mod store;

use thiserror::Error;

pub use federation::{
    Federation, FederationError, OAuth2Federation, ProviderConfig, ProviderRegistry,
};
pub use oauth_state::OAuthStateStore;
pub use service::{AuthService, AuthSettings};
pub use store::{CredentialStore, StoreError};

/// Authentication errors.
///
/// Every failure the HTTP layer can observe maps to exactly one variant.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("session not found")]
    SessionNotFound,

    #[error("session expired")]
    SessionExpired,

    #[error("invalid API key")]
    InvalidApiKey,

    #[error("API key expired")]
    ApiKeyExpired,

    #[error("API key not found")]
    ApiKeyNotFound,

    #[error("unknown OAuth2 provider: {0}")]
    UnknownProvider(String),

    #[error("OAuth2 state mismatch")]
    OAuth2StateMismatch,

    #[error("OAuth2 authorization code invalid: {0}")]
    CodeInvalid(String),

    #[error("OAuth2 provider returned error: {0}")]
    ProviderDenied(String),

    #[error("OAuth2 token exchange failed: {0}")]
    TokenExchange(String),

    #[error("user not found")]
    UserNotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("forbidden")]
    Forbidden,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("credential store error: {0}")]
    Store(StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for AuthError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(what) => AuthError::Conflict(what),
            other => AuthError::Store(other),
        }
    }
}

impl From<FederationError> for AuthError {
    fn from(e: FederationError) -> Self {
        match e {
            FederationError::UnknownProvider(p) => AuthError::UnknownProvider(p),
            FederationError::CodeInvalid(msg) => AuthError::CodeInvalid(msg),
            FederationError::TokenExchange(msg) => AuthError::TokenExchange(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_conflict_becomes_conflict() {
        let err = AuthError::from(StoreError::Conflict("users (provider, provider_id)".into()));
        assert!(matches!(err, AuthError::Conflict(_)));
    }

    #[test]
    fn store_timeout_stays_a_store_error() {
        let err = AuthError::from(StoreError::Timeout { op: "get_session" });
        assert!(matches!(err, AuthError::Store(StoreError::Timeout { op: "get_session" })));
        assert_eq!(err.to_string(), "credential store error: get_session: timed out");
    }

    #[test]
    fn federation_errors_keep_their_kind() {
        assert!(matches!(
            AuthError::from(FederationError::UnknownProvider("bitbucket".into())),
            AuthError::UnknownProvider(p) if p == "bitbucket"
        ));
        assert!(matches!(
            AuthError::from(FederationError::CodeInvalid("bad_verification_code".into())),
            AuthError::CodeInvalid(_)
        ));
        assert!(matches!(
            AuthError::from(FederationError::TokenExchange("connect refused".into())),
            AuthError::TokenExchange(_)
        ));
    }
}
