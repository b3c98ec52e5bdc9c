//! In-process credential store.
//!
//! Mirrors the PostgreSQL store's constraints (unique external identity,
//! unique key hash, owner-scoped deletes) without a database. Used by tests
//! and local runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::store::{CredentialStore, StoreError, StoreResult};
use crate::models::auth::{ApiKey, ExternalIdentity, NewApiKey, Session, User};

#[derive(Default)]
struct Tables {
    users: HashMap<i64, User>,
    sessions: HashMap<String, Session>,
    api_keys: HashMap<i64, ApiKey>,
    next_user_id: i64,
    next_api_key_id: i64,
}

impl Tables {
    fn find_user(&self, provider: &str, provider_id: &str) -> Option<&User> {
        self.users
            .values()
            .find(|u| u.provider == provider && u.provider_id == provider_id)
    }

    fn insert_user(&mut self, identity: &ExternalIdentity) -> User {
        self.next_user_id += 1;
        let now = Utc::now();
        let user = User {
            id: self.next_user_id,
            provider: identity.provider.clone(),
            provider_id: identity.provider_id.clone(),
            email: identity.email.clone(),
            name: identity.name.clone(),
            first_name: identity.first_name.clone(),
            last_name: identity.last_name.clone(),
            avatar_url: identity.avatar_url.clone(),
            access_token: identity.access_token.clone(),
            refresh_token: identity.refresh_token.clone(),
            expires_at: identity.expires_at,
            created_at: now,
            updated_at: now,
        };
        self.users.insert(user.id, user.clone());
        user
    }
}

/// Credential store holding all rows in memory.
#[derive(Default)]
pub struct MemoryCredentialStore {
    tables: Mutex<Tables>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions, expired ones included.
    pub async fn session_count(&self) -> usize {
        self.tables.lock().await.sessions.len()
    }

    /// Every stored API key row, hashes included.
    pub async fn api_key_rows(&self) -> Vec<ApiKey> {
        self.tables.lock().await.api_keys.values().cloned().collect()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn create_user(&self, identity: &ExternalIdentity) -> StoreResult<User> {
        let mut tables = self.tables.lock().await;
        if tables
            .find_user(&identity.provider, &identity.provider_id)
            .is_some()
        {
            return Err(StoreError::Conflict("user".into()));
        }
        Ok(tables.insert_user(identity))
    }

    async fn get_user_by_id(&self, id: i64) -> StoreResult<User> {
        self.tables
            .lock()
            .await
            .users
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn get_user_by_provider(&self, provider: &str, provider_id: &str) -> StoreResult<User> {
        self.tables
            .lock()
            .await
            .find_user(provider, provider_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn upsert_user(&self, identity: &ExternalIdentity) -> StoreResult<User> {
        let mut tables = self.tables.lock().await;
        let existing = tables
            .find_user(&identity.provider, &identity.provider_id)
            .map(|u| u.id);
        let Some(id) = existing else {
            return Ok(tables.insert_user(identity));
        };
        let row = tables.users.get_mut(&id).ok_or(StoreError::NotFound)?;
        row.email = identity.email.clone();
        row.name = identity.name.clone();
        row.first_name = identity.first_name.clone();
        row.last_name = identity.last_name.clone();
        row.avatar_url = identity.avatar_url.clone();
        row.access_token = identity.access_token.clone();
        row.refresh_token = identity.refresh_token.clone();
        row.expires_at = identity.expires_at;
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn create_session(&self, session: &Session) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        if !tables.users.contains_key(&session.user_id) {
            return Err(StoreError::NotFound);
        }
        if tables.sessions.contains_key(&session.id) {
            return Err(StoreError::Conflict("session".into()));
        }
        tables.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: &str) -> StoreResult<Session> {
        self.tables
            .lock()
            .await
            .sessions
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn delete_session(&self, id: &str) -> StoreResult<()> {
        self.tables.lock().await.sessions.remove(id);
        Ok(())
    }

    async fn purge_expired_sessions(&self) -> StoreResult<u64> {
        let now = Utc::now();
        let mut tables = self.tables.lock().await;
        let before = tables.sessions.len();
        tables.sessions.retain(|_, s| !s.is_expired_at(now));
        Ok((before - tables.sessions.len()) as u64)
    }

    async fn create_api_key(&self, key: &NewApiKey) -> StoreResult<ApiKey> {
        let mut tables = self.tables.lock().await;
        if !tables.users.contains_key(&key.user_id) {
            return Err(StoreError::NotFound);
        }
        if tables.api_keys.values().any(|k| k.key_hash == key.key_hash) {
            return Err(StoreError::Conflict("api key".into()));
        }
        tables.next_api_key_id += 1;
        let now = Utc::now();
        let record = ApiKey {
            id: tables.next_api_key_id,
            user_id: key.user_id,
            name: key.name.clone(),
            key_prefix: key.key_prefix.clone(),
            key_hash: key.key_hash.clone(),
            last_used_at: None,
            expires_at: key.expires_at,
            created_at: now,
            updated_at: now,
        };
        tables.api_keys.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_api_key_by_hash(&self, hash: &str) -> StoreResult<ApiKey> {
        self.tables
            .lock()
            .await
            .api_keys
            .values()
            .find(|k| k.key_hash == hash)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn list_api_keys_by_prefix(&self, prefix: &str) -> StoreResult<Vec<ApiKey>> {
        Ok(self
            .tables
            .lock()
            .await
            .api_keys
            .values()
            .filter(|k| k.key_prefix == prefix)
            .cloned()
            .collect())
    }

    async fn touch_api_key(&self, id: i64) -> StoreResult<()> {
        if let Some(key) = self.tables.lock().await.api_keys.get_mut(&id) {
            key.last_used_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn delete_api_key(&self, id: i64) -> StoreResult<()> {
        self.tables
            .lock()
            .await
            .api_keys
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    async fn delete_api_key_for_user(&self, user_id: i64, id: i64) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        match tables.api_keys.get(&id) {
            Some(key) if key.user_id == user_id => {
                tables.api_keys.remove(&id);
                Ok(())
            }
            _ => Err(StoreError::NotFound),
        }
    }

    async fn list_api_keys_by_user(&self, user_id: i64) -> StoreResult<Vec<ApiKey>> {
        let mut keys: Vec<ApiKey> = self
            .tables
            .lock()
            .await
            .api_keys
            .values()
            .filter(|k| k.user_id == user_id)
            .cloned()
            .collect();
        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(keys)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
