//! PostgreSQL credential store.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;

use super::store::{CredentialStore, StoreError, StoreResult};
use crate::models::auth::{ApiKey, ExternalIdentity, NewApiKey, Session, User};

/// Per-query deadline.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

const USER_COLUMNS: &str = "id, provider, provider_id, email, name, first_name, last_name, \
     avatar_url, access_token, refresh_token, expires_at, created_at, updated_at";

const API_KEY_COLUMNS: &str =
    "id, user_id, name, key_prefix, key_hash, last_used_at, expires_at, created_at, updated_at";

/// Credential store backed by a sqlx connection pool.
#[derive(Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
    query_timeout: Duration,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Run one query under the store deadline, tagging failures with `op`.
    async fn run<T, F>(&self, op: &'static str, query: F) -> StoreResult<T>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.query_timeout, query).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify(op, e)),
            Err(_) => Err(StoreError::Timeout { op }),
        }
    }
}

/// Map sqlx errors onto store sentinels.
fn classify(op: &'static str, e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        sqlx::Error::Database(ref db) if db.is_unique_violation() => {
            StoreError::Conflict(db.constraint().unwrap_or(op).to_string())
        }
        source => StoreError::Database { op, source },
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    // -------------------------------------------------------------------------
    // Users
    // -------------------------------------------------------------------------

    async fn create_user(&self, identity: &ExternalIdentity) -> StoreResult<User> {
        let sql = format!(
            "INSERT INTO users (provider, provider_id, email, name, first_name, last_name, \
                                avatar_url, access_token, refresh_token, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             RETURNING {USER_COLUMNS}"
        );
        self.run(
            "create_user",
            bind_identity(sqlx::query_as::<_, User>(&sql), identity).fetch_one(&self.pool),
        )
        .await
        .map_err(|e| match e {
            StoreError::Conflict(_) => StoreError::Conflict("user".into()),
            other => other,
        })
    }

    async fn get_user_by_id(&self, id: i64) -> StoreResult<User> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        self.run(
            "get_user_by_id",
            sqlx::query_as::<_, User>(&sql).bind(id).fetch_one(&self.pool),
        )
        .await
    }

    async fn get_user_by_provider(&self, provider: &str, provider_id: &str) -> StoreResult<User> {
        let sql =
            format!("SELECT {USER_COLUMNS} FROM users WHERE provider = $1 AND provider_id = $2");
        self.run(
            "get_user_by_provider",
            sqlx::query_as::<_, User>(&sql)
                .bind(provider)
                .bind(provider_id)
                .fetch_one(&self.pool),
        )
        .await
    }

    async fn upsert_user(&self, identity: &ExternalIdentity) -> StoreResult<User> {
        let sql = format!(
            "INSERT INTO users (provider, provider_id, email, name, first_name, last_name, \
                                avatar_url, access_token, refresh_token, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (provider, provider_id) DO UPDATE SET \
                 email = EXCLUDED.email, \
                 name = EXCLUDED.name, \
                 first_name = EXCLUDED.first_name, \
                 last_name = EXCLUDED.last_name, \
                 avatar_url = EXCLUDED.avatar_url, \
                 access_token = EXCLUDED.access_token, \
                 refresh_token = EXCLUDED.refresh_token, \
                 expires_at = EXCLUDED.expires_at, \
                 updated_at = now() \
             RETURNING {USER_COLUMNS}"
        );
        self.run(
            "upsert_user",
            bind_identity(sqlx::query_as::<_, User>(&sql), identity).fetch_one(&self.pool),
        )
        .await
    }

    // -------------------------------------------------------------------------
    // Sessions
    // -------------------------------------------------------------------------

    async fn create_session(&self, session: &Session) -> StoreResult<()> {
        self.run(
            "create_session",
            sqlx::query(
                "INSERT INTO sessions (id, user_id, provider, expires_at, created_at) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(&session.id)
            .bind(session.user_id)
            .bind(&session.provider)
            .bind(session.expires_at)
            .bind(session.created_at)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn get_session(&self, id: &str) -> StoreResult<Session> {
        self.run(
            "get_session",
            sqlx::query_as::<_, Session>(
                "SELECT id, user_id, provider, expires_at, created_at FROM sessions WHERE id = $1",
            )
            .bind(id)
            .fetch_one(&self.pool),
        )
        .await
    }

    async fn delete_session(&self, id: &str) -> StoreResult<()> {
        self.run(
            "delete_session",
            sqlx::query("DELETE FROM sessions WHERE id = $1")
                .bind(id)
                .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn purge_expired_sessions(&self) -> StoreResult<u64> {
        let result = self
            .run(
                "purge_expired_sessions",
                sqlx::query("DELETE FROM sessions WHERE expires_at <= now()").execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected())
    }

    // -------------------------------------------------------------------------
    // API keys
    // -------------------------------------------------------------------------

    async fn create_api_key(&self, key: &NewApiKey) -> StoreResult<ApiKey> {
        let sql = format!(
            "INSERT INTO api_keys (user_id, name, key_prefix, key_hash, expires_at) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING {API_KEY_COLUMNS}"
        );
        self.run(
            "create_api_key",
            sqlx::query_as::<_, ApiKey>(&sql)
                .bind(key.user_id)
                .bind(&key.name)
                .bind(&key.key_prefix)
                .bind(&key.key_hash)
                .bind(key.expires_at)
                .fetch_one(&self.pool),
        )
        .await
    }

    async fn get_api_key_by_hash(&self, hash: &str) -> StoreResult<ApiKey> {
        let sql = format!("SELECT {API_KEY_COLUMNS} FROM api_keys WHERE key_hash = $1");
        self.run(
            "get_api_key_by_hash",
            sqlx::query_as::<_, ApiKey>(&sql).bind(hash).fetch_one(&self.pool),
        )
        .await
    }

    async fn list_api_keys_by_prefix(&self, prefix: &str) -> StoreResult<Vec<ApiKey>> {
        let sql = format!("SELECT {API_KEY_COLUMNS} FROM api_keys WHERE key_prefix = $1");
        self.run(
            "list_api_keys_by_prefix",
            sqlx::query_as::<_, ApiKey>(&sql).bind(prefix).fetch_all(&self.pool),
        )
        .await
    }

    async fn touch_api_key(&self, id: i64) -> StoreResult<()> {
        self.run(
            "touch_api_key",
            sqlx::query("UPDATE api_keys SET last_used_at = now() WHERE id = $1")
                .bind(id)
                .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn delete_api_key(&self, id: i64) -> StoreResult<()> {
        let result = self
            .run(
                "delete_api_key",
                sqlx::query("DELETE FROM api_keys WHERE id = $1")
                    .bind(id)
                    .execute(&self.pool),
            )
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn delete_api_key_for_user(&self, user_id: i64, id: i64) -> StoreResult<()> {
        let result = self
            .run(
                "delete_api_key_for_user",
                sqlx::query("DELETE FROM api_keys WHERE id = $1 AND user_id = $2")
                    .bind(id)
                    .bind(user_id)
                    .execute(&self.pool),
            )
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn list_api_keys_by_user(&self, user_id: i64) -> StoreResult<Vec<ApiKey>> {
        let sql = format!(
            "SELECT {API_KEY_COLUMNS} FROM api_keys WHERE user_id = $1 ORDER BY created_at DESC, id DESC"
        );
        self.run(
            "list_api_keys_by_user",
            sqlx::query_as::<_, ApiKey>(&sql).bind(user_id).fetch_all(&self.pool),
        )
        .await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.run(
            "ping",
            sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&self.pool),
        )
        .await?;
        Ok(())
    }
}

/// Bind the ten identity columns in insert order.
fn bind_identity<'q>(
    query: sqlx::query::QueryAs<'q, sqlx::Postgres, User, sqlx::postgres::PgArguments>,
    identity: &'q ExternalIdentity,
) -> sqlx::query::QueryAs<'q, sqlx::Postgres, User, sqlx::postgres::PgArguments> {
    query
        .bind(&identity.provider)
        .bind(&identity.provider_id)
        .bind(&identity.email)
        .bind(&identity.name)
        .bind(&identity.first_name)
        .bind(&identity.last_name)
        .bind(&identity.avatar_url)
        .bind(&identity.access_token)
        .bind(&identity.refresh_token)
        .bind(identity.expires_at)
}
