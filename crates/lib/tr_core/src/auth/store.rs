//! Credential store capability.
//!
//! The only component that touches persistent storage. Every operation is
//! atomic at the row level; serialization of concurrent writes is left to the
//! backing engine.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::auth::{ApiKey, ExternalIdentity, NewApiKey, Session, User};

/// Credential store errors. Database failures carry the failing operation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("{0} already exists")]
    Conflict(String),

    #[error("{op}: timed out")]
    Timeout { op: &'static str },

    #[error("{op}: {source}")]
    Database {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

/// Result type for credential store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persistence for users, sessions and hashed API keys.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Insert a user. `Conflict` if `(provider, provider_id)` exists.
    async fn create_user(&self, identity: &ExternalIdentity) -> StoreResult<User>;

    async fn get_user_by_id(&self, id: i64) -> StoreResult<User>;

    async fn get_user_by_provider(&self, provider: &str, provider_id: &str) -> StoreResult<User>;

    /// Insert or update keyed on `(provider, provider_id)`. Id and
    /// `created_at` of an existing row are preserved.
    async fn upsert_user(&self, identity: &ExternalIdentity) -> StoreResult<User>;

    async fn create_session(&self, session: &Session) -> StoreResult<()>;

    async fn get_session(&self, id: &str) -> StoreResult<Session>;

    /// Idempotent: deleting a missing session succeeds.
    async fn delete_session(&self, id: &str) -> StoreResult<()>;

    /// Remove every session whose expiry is at or before now. Returns the count.
    async fn purge_expired_sessions(&self) -> StoreResult<u64>;

    /// Insert a key. `Conflict` on hash collision.
    async fn create_api_key(&self, key: &NewApiKey) -> StoreResult<ApiKey>;

    async fn get_api_key_by_hash(&self, hash: &str) -> StoreResult<ApiKey>;

    /// Candidate keys sharing a lookup prefix.
    async fn list_api_keys_by_prefix(&self, prefix: &str) -> StoreResult<Vec<ApiKey>>;

    /// Set `last_used_at` to now. Idempotent.
    async fn touch_api_key(&self, id: i64) -> StoreResult<()>;

    /// `NotFound` if no key has this id.
    async fn delete_api_key(&self, id: i64) -> StoreResult<()>;

    /// Delete a key only if `user_id` owns it; `NotFound` otherwise.
    async fn delete_api_key_for_user(&self, user_id: i64, id: i64) -> StoreResult<()>;

    /// Keys owned by a user, newest first.
    async fn list_api_keys_by_user(&self, user_id: i64) -> StoreResult<Vec<ApiKey>>;

    /// Cheap liveness check of the backing store.
    async fn ping(&self) -> StoreResult<()>;
}
