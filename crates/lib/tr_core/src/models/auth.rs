//! Authentication domain models.
//!
//! One definition each for users, sessions, API keys and the per-request
//! authorization context. Provider tokens and key hashes never serialize.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Provider tag recorded on contexts produced by the API-key path.
pub const API_KEY_PROVIDER: &str = "api_key";

// =============================================================================
// Users
// =============================================================================

/// A user federated from an external OAuth2 provider.
#[derive(Clone, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub provider: String,
    pub provider_id: String,
    pub email: String,
    pub name: String,
    pub first_name: String,
    pub last_name: String,
    pub avatar_url: String,
    #[serde(skip_serializing)]
    pub access_token: String,
    #[serde(skip_serializing)]
    pub refresh_token: String,
    #[serde(skip_serializing)]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("provider_id", &self.provider_id)
            .field("email", &self.email)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Normalized identity returned by an OAuth2 provider after a completed flow.
///
/// Also the insert shape for users: everything but the server-assigned id and
/// timestamps.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ExternalIdentity {
    pub provider: String,
    pub provider_id: String,
    pub email: String,
    pub name: String,
    pub first_name: String,
    pub last_name: String,
    pub avatar_url: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for ExternalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalIdentity")
            .field("provider", &self.provider)
            .field("provider_id", &self.provider_id)
            .field("email", &self.email)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Sessions
// =============================================================================

/// Interactive login session, referenced by the `session_id` cookie.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Session {
    pub id: String,
    pub user_id: i64,
    pub provider: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// A session is dead once `now` reaches its expiry.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

// =============================================================================
// API keys
// =============================================================================

/// Stored API key record. The secret itself is never kept.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ApiKey {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    /// Non-secret lookup identifier (the characters after `tr_`).
    #[serde(rename = "prefix")]
    pub key_prefix: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApiKey {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Insert shape for API keys.
#[derive(Debug, Clone)]
pub struct NewApiKey {
    pub user_id: i64,
    pub name: String,
    pub key_prefix: String,
    pub key_hash: String,
    pub expires_at: DateTime<Utc>,
}

// =============================================================================
// Authorization context
// =============================================================================

/// Result of a successful authentication, attached to a single request.
///
/// Only the authentication service constructs contexts, so `is_api_key` is
/// true exactly when the bearer path produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    user_id: i64,
    provider: String,
    is_api_key: bool,
    api_key_id: Option<i64>,
}

impl AuthContext {
    pub(crate) fn from_session(session: &Session) -> Self {
        Self {
            user_id: session.user_id,
            provider: session.provider.clone(),
            is_api_key: false,
            api_key_id: None,
        }
    }

    pub(crate) fn from_api_key(key: &ApiKey) -> Self {
        Self {
            user_id: key.user_id,
            provider: API_KEY_PROVIDER.to_string(),
            is_api_key: true,
            api_key_id: Some(key.id),
        }
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn is_api_key(&self) -> bool {
        self.is_api_key
    }

    /// Id of the key used, set only for API-key contexts.
    pub fn api_key_id(&self) -> Option<i64> {
        self.api_key_id
    }
}
