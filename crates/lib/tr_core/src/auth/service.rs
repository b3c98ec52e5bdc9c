//! Authentication service.
//!
//! Session lifecycle, API-key issuance and validation, user upsert and OAuth2
//! flow coordination on top of a [`CredentialStore`] and a [`Federation`].

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::federation::Federation;
use super::oauth_state::OAuthStateStore;
use super::secrets;
use super::store::{CredentialStore, StoreError};
use super::AuthError;
use crate::models::auth::{ApiKey, AuthContext, ExternalIdentity, NewApiKey, Session, User};

/// Default session lifetime: 24 hours.
pub const DEFAULT_SESSION_TTL_HOURS: i64 = 24;

/// Default API-key lifetime: 365 days.
pub const DEFAULT_API_KEY_TTL_DAYS: i64 = 365;

/// How often the background task removes expired sessions.
pub const SESSION_PURGE_INTERVAL: StdDuration = StdDuration::from_secs(600);

/// Longest accepted API-key name.
const MAX_KEY_NAME_LEN: usize = 100;

/// Attempts at inserting a freshly generated key before giving up.
const KEY_INSERT_ATTEMPTS: usize = 3;

/// Credential lifetimes.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub session_ttl: Duration,
    pub api_key_ttl: Duration,
}

impl AuthSettings {
    /// Lifetimes from whole hours / days; non-positive values are raised to one.
    pub fn new(session_ttl_hours: i64, api_key_ttl_days: i64) -> Self {
        Self {
            session_ttl: Duration::hours(session_ttl_hours.max(1)),
            api_key_ttl: Duration::days(api_key_ttl_days.max(1)),
        }
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL_HOURS, DEFAULT_API_KEY_TTL_DAYS)
    }
}

/// Run CPU-heavy hashing off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, AuthError>
where
    F: FnOnce() -> Result<T, AuthError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AuthError::Internal(format!("blocking task: {e}")))?
}

/// Authentication business logic shared by every request.
pub struct AuthService {
    store: Arc<dyn CredentialStore>,
    federation: Arc<dyn Federation>,
    states: Arc<OAuthStateStore>,
    settings: AuthSettings,
}

impl AuthService {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        federation: Arc<dyn Federation>,
        settings: AuthSettings,
    ) -> Self {
        Self {
            store,
            federation,
            states: Arc::new(OAuthStateStore::new()),
            settings,
        }
    }

    /// Replace the pending-login cache (e.g. to share one across services).
    pub fn with_state_store(mut self, states: Arc<OAuthStateStore>) -> Self {
        self.states = states;
        self
    }

    pub fn settings(&self) -> &AuthSettings {
        &self.settings
    }

    pub fn state_store(&self) -> &Arc<OAuthStateStore> {
        &self.states
    }

    /// Whether the credential store answers.
    pub async fn is_ready(&self) -> bool {
        match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "credential store not ready");
                false
            }
        }
    }

    // -------------------------------------------------------------------------
    // OAuth2 flow coordination
    // -------------------------------------------------------------------------

    /// Start a login: returns `(authorize_url, state)` and remembers the state.
    pub fn begin_oauth2(&self, provider: &str) -> Result<(String, String), AuthError> {
        let state = secrets::generate_state();
        let url = self.federation.begin(provider, &state)?;
        self.states.insert(state.clone(), provider);
        debug!(provider, "OAuth2 login started");
        Ok((url, state))
    }

    /// Finish a login. The state is consumed whether or not the exchange succeeds.
    pub async fn complete_oauth2(
        &self,
        provider: &str,
        code: &str,
        state: &str,
    ) -> Result<User, AuthError> {
        let pending = self
            .states
            .take(state)
            .ok_or(AuthError::OAuth2StateMismatch)?;
        if pending.provider != provider {
            return Err(AuthError::OAuth2StateMismatch);
        }

        let identity = self.federation.complete(provider, code, state).await?;
        let user = self.create_or_update_user(&identity).await?;
        info!(user_id = user.id, provider, "OAuth2 login completed");
        Ok(user)
    }

    /// Consume the state of a callback on which the provider reported `error`,
    /// returning the error to surface.
    pub fn abandon_oauth2(&self, provider: &str, state: &str, error: &str) -> AuthError {
        match self.states.take(state) {
            Some(pending) if pending.provider == provider => {
                info!(provider, error, "OAuth2 login rejected by provider");
                AuthError::ProviderDenied(error.to_string())
            }
            _ => AuthError::OAuth2StateMismatch,
        }
    }

    // -------------------------------------------------------------------------
    // Sessions
    // -------------------------------------------------------------------------

    /// Issue a fresh session for `user_id`.
    pub async fn create_session(&self, user_id: i64, provider: &str) -> Result<Session, AuthError> {
        let now = Utc::now();
        let session = Session {
            id: secrets::generate_session_id(),
            user_id,
            provider: provider.to_string(),
            expires_at: now + self.settings.session_ttl,
            created_at: now,
        };
        self.store.create_session(&session).await.map_err(|e| match e {
            StoreError::NotFound => AuthError::UserNotFound,
            other => other.into(),
        })?;
        debug!(user_id, provider, "session created");
        Ok(session)
    }

    /// Resolve a session id to a context. Expired rows are removed on sight.
    pub async fn validate_session(&self, session_id: &str) -> Result<AuthContext, AuthError> {
        if session_id.is_empty() {
            return Err(AuthError::SessionNotFound);
        }
        let session = self.store.get_session(session_id).await.map_err(|e| match e {
            StoreError::NotFound => AuthError::SessionNotFound,
            other => other.into(),
        })?;

        if session.is_expired_at(Utc::now()) {
            if let Err(e) = self.store.delete_session(session_id).await {
                warn!(error = %e, "failed to delete expired session");
            }
            return Err(AuthError::SessionExpired);
        }

        Ok(AuthContext::from_session(&session))
    }

    /// Revoke a session. Deleting an unknown id succeeds.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), AuthError> {
        self.store.delete_session(session_id).await?;
        Ok(())
    }

    pub async fn purge_expired_sessions(&self) -> Result<u64, AuthError> {
        Ok(self.store.purge_expired_sessions().await?)
    }

    /// Spawn the periodic expired-session sweep; stops when `cancel` fires.
    pub fn spawn_session_purge_task(
        self: &Arc<Self>,
        every: StdDuration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => match service.purge_expired_sessions().await {
                        Ok(0) => {}
                        Ok(removed) => info!(removed, "purged expired sessions"),
                        Err(e) => warn!(error = %e, "session purge failed"),
                    },
                }
            }
        })
    }

    // -------------------------------------------------------------------------
    // API keys
    // -------------------------------------------------------------------------

    /// Issue a key. Returns the record and the plaintext, which is never stored.
    pub async fn create_api_key(
        &self,
        user_id: i64,
        name: &str,
    ) -> Result<(ApiKey, String), AuthError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AuthError::Validation("name is required".into()));
        }
        if name.chars().count() > MAX_KEY_NAME_LEN {
            return Err(AuthError::Validation(format!(
                "name must be at most {MAX_KEY_NAME_LEN} characters"
            )));
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let plaintext = secrets::generate_api_key();
            let key_prefix = secrets::api_key_lookup_id(&plaintext)
                .ok_or_else(|| AuthError::Internal("generated key too short".into()))?
                .to_string();
            let key_hash = {
                let plaintext = plaintext.clone();
                blocking(move || secrets::hash_api_key(&plaintext)).await?
            };

            let new_key = NewApiKey {
                user_id,
                name: name.to_string(),
                key_prefix,
                key_hash,
                expires_at: Utc::now() + self.settings.api_key_ttl,
            };
            match self.store.create_api_key(&new_key).await {
                Ok(record) => {
                    info!(user_id, api_key_id = record.id, "API key issued");
                    return Ok((record, plaintext));
                }
                Err(StoreError::Conflict(_)) if attempt < KEY_INSERT_ATTEMPTS => {
                    warn!(user_id, attempt, "API key hash collision, retrying");
                }
                Err(StoreError::Conflict(_)) => {
                    return Err(AuthError::Internal(format!(
                        "API key insert collided {attempt} times"
                    )));
                }
                Err(StoreError::NotFound) => return Err(AuthError::UserNotFound),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Resolve a presented plaintext key to a context.
    pub async fn validate_api_key(&self, plaintext: &str) -> Result<AuthContext, AuthError> {
        let lookup_id = secrets::api_key_lookup_id(plaintext).ok_or(AuthError::InvalidApiKey)?;
        let candidates = self.store.list_api_keys_by_prefix(lookup_id).await?;

        let mut matched = None;
        for candidate in candidates {
            let presented = plaintext.to_string();
            let hash = candidate.key_hash.clone();
            if blocking(move || secrets::verify_api_key(&presented, &hash)).await? {
                matched = Some(candidate);
                break;
            }
        }
        let key = matched.ok_or(AuthError::InvalidApiKey)?;

        if key.is_expired_at(Utc::now()) {
            return Err(AuthError::ApiKeyExpired);
        }

        // last_used_at is advisory; a failed update never fails the request.
        let store = Arc::clone(&self.store);
        let key_id = key.id;
        tokio::spawn(async move {
            if let Err(e) = store.touch_api_key(key_id).await {
                warn!(api_key_id = key_id, error = %e, "failed to record API key use");
            }
        });

        Ok(AuthContext::from_api_key(&key))
    }

    pub async fn list_api_keys(&self, user_id: i64) -> Result<Vec<ApiKey>, AuthError> {
        Ok(self.store.list_api_keys_by_user(user_id).await?)
    }

    /// Delete a key owned by `user_id`. Keys of other users look missing.
    pub async fn delete_api_key(&self, user_id: i64, key_id: i64) -> Result<(), AuthError> {
        self.store
            .delete_api_key_for_user(user_id, key_id)
            .await
            .map_err(|e| match e {
                StoreError::NotFound => AuthError::ApiKeyNotFound,
                other => other.into(),
            })?;
        info!(user_id, api_key_id = key_id, "API key deleted");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Users
    // -------------------------------------------------------------------------

    /// Insert or refresh the user behind an external identity.
    pub async fn create_or_update_user(
        &self,
        identity: &ExternalIdentity,
    ) -> Result<User, AuthError> {
        if identity.provider.is_empty() || identity.provider_id.is_empty() {
            return Err(AuthError::Validation("external identity is incomplete".into()));
        }
        Ok(self.store.upsert_user(identity).await?)
    }

    pub async fn get_user_by_id(&self, user_id: i64) -> Result<User, AuthError> {
        self.store.get_user_by_id(user_id).await.map_err(|e| match e {
            StoreError::NotFound => AuthError::UserNotFound,
            other => other.into(),
        })
    }

    pub async fn get_user_by_provider(
        &self,
        provider: &str,
        provider_id: &str,
    ) -> Result<User, AuthError> {
        self.store
            .get_user_by_provider(provider, provider_id)
            .await
            .map_err(|e| match e {
                StoreError::NotFound => AuthError::UserNotFound,
                other => other.into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::federation::FederationError;
    use crate::auth::memory::MemoryCredentialStore;
    use crate::auth::store::StoreResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Federation double: accepts code `C` for `github` only.
    struct StubFederation;

    #[async_trait]
    impl Federation for StubFederation {
        fn begin(&self, provider: &str, state: &str) -> Result<String, FederationError> {
            match provider {
                "github" => Ok(format!(
                    "https://github.com/login/oauth/authorize?client_id=cid&state={state}"
                )),
                other => Err(FederationError::UnknownProvider(other.into())),
            }
        }

        async fn complete(
            &self,
            provider: &str,
            code: &str,
            _state: &str,
        ) -> Result<ExternalIdentity, FederationError> {
            if code != "C" {
                return Err(FederationError::CodeInvalid("bad_verification_code".into()));
            }
            Ok(ExternalIdentity {
                provider: provider.into(),
                provider_id: "42".into(),
                email: "a@b".into(),
                name: "Octo Cat".into(),
                access_token: "gho_123".into(),
                ..Default::default()
            })
        }
    }

    fn service() -> (Arc<MemoryCredentialStore>, AuthService) {
        let store = Arc::new(MemoryCredentialStore::new());
        let svc = AuthService::new(store.clone(), Arc::new(StubFederation), AuthSettings::default());
        (store, svc)
    }

    async fn login(svc: &AuthService) -> User {
        let (_, state) = svc.begin_oauth2("github").unwrap();
        svc.complete_oauth2("github", "C", &state).await.unwrap()
    }

    // -------------------------------------------------------------------------
    // OAuth2
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn oauth2_login_creates_user_findable_by_provider() {
        let (_, svc) = service();
        let user = login(&svc).await;
        let found = svc.get_user_by_provider("github", "42").await.unwrap();
        assert_eq!(found.id, user.id);
        assert_eq!(found.email, "a@b");
    }

    #[tokio::test]
    async fn begin_embeds_the_returned_state() {
        let (_, svc) = service();
        let (url, state) = svc.begin_oauth2("github").unwrap();
        assert!(url.ends_with(&format!("state={state}")));
        assert_eq!(svc.state_store().len(), 1);
    }

    #[tokio::test]
    async fn begin_with_unknown_provider_leaves_no_state() {
        let (_, svc) = service();
        assert!(matches!(
            svc.begin_oauth2("bitbucket"),
            Err(AuthError::UnknownProvider(_))
        ));
        assert!(svc.state_store().is_empty());
    }

    #[tokio::test]
    async fn unknown_state_is_a_mismatch() {
        let (_, svc) = service();
        let (_, _state) = svc.begin_oauth2("github").unwrap();
        assert!(matches!(
            svc.complete_oauth2("github", "C", "X").await,
            Err(AuthError::OAuth2StateMismatch)
        ));
    }

    #[tokio::test]
    async fn state_is_single_use_and_provider_bound() {
        let (_, svc) = service();
        let (_, state) = svc.begin_oauth2("github").unwrap();
        assert!(matches!(
            svc.complete_oauth2("google", "C", &state).await,
            Err(AuthError::OAuth2StateMismatch)
        ));
        // Consumed by the failed attempt.
        assert!(matches!(
            svc.complete_oauth2("github", "C", &state).await,
            Err(AuthError::OAuth2StateMismatch)
        ));
    }

    #[tokio::test]
    async fn bad_code_surfaces_code_invalid() {
        let (_, svc) = service();
        let (_, state) = svc.begin_oauth2("github").unwrap();
        assert!(matches!(
            svc.complete_oauth2("github", "nope", &state).await,
            Err(AuthError::CodeInvalid(_))
        ));
    }

    #[tokio::test]
    async fn provider_error_consumes_state() {
        let (_, svc) = service();
        let (_, state) = svc.begin_oauth2("github").unwrap();
        assert!(matches!(
            svc.abandon_oauth2("github", &state, "access_denied"),
            AuthError::ProviderDenied(e) if e == "access_denied"
        ));
        assert!(svc.state_store().is_empty());
        assert!(matches!(
            svc.abandon_oauth2("github", &state, "access_denied"),
            AuthError::OAuth2StateMismatch
        ));
    }

    #[tokio::test]
    async fn repeated_login_keeps_user_id() {
        let (_, svc) = service();
        let first = login(&svc).await;
        let second = login(&svc).await;
        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
    }

    // -------------------------------------------------------------------------
    // Sessions
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn session_validates_until_expiry() {
        let (_, svc) = service();
        let user = login(&svc).await;
        let session = svc.create_session(user.id, "github").await.unwrap();
        assert!(session.expires_at > session.created_at);
        assert_eq!(
            session.expires_at - session.created_at,
            Duration::hours(DEFAULT_SESSION_TTL_HOURS)
        );

        let ctx = svc.validate_session(&session.id).await.unwrap();
        assert_eq!(ctx.user_id(), user.id);
        assert!(!ctx.is_api_key());
        assert_eq!(ctx.provider(), "github");
    }

    #[tokio::test]
    async fn expired_session_is_rejected_and_removed() {
        let (store, svc) = service();
        let user = login(&svc).await;
        let now = Utc::now();
        store
            .create_session(&Session {
                id: "old".into(),
                user_id: user.id,
                provider: "github".into(),
                expires_at: now - Duration::seconds(1),
                created_at: now - Duration::hours(25),
            })
            .await
            .unwrap();

        assert!(matches!(
            svc.validate_session("old").await,
            Err(AuthError::SessionExpired)
        ));
        assert!(matches!(
            svc.validate_session("old").await,
            Err(AuthError::SessionNotFound)
        ));
    }

    #[tokio::test]
    async fn missing_session_is_not_found() {
        let (_, svc) = service();
        assert!(matches!(
            svc.validate_session("nope").await,
            Err(AuthError::SessionNotFound)
        ));
        assert!(matches!(
            svc.validate_session("").await,
            Err(AuthError::SessionNotFound)
        ));
    }

    #[tokio::test]
    async fn delete_session_is_idempotent() {
        let (_, svc) = service();
        let user = login(&svc).await;
        let session = svc.create_session(user.id, "github").await.unwrap();
        svc.delete_session(&session.id).await.unwrap();
        svc.delete_session(&session.id).await.unwrap();
        assert!(svc.validate_session(&session.id).await.is_err());
    }

    #[tokio::test]
    async fn session_ids_are_regenerated() {
        let (_, svc) = service();
        let user = login(&svc).await;
        let a = svc.create_session(user.id, "github").await.unwrap();
        let b = svc.create_session(user.id, "github").await.unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn purge_task_removes_expired_sessions() {
        let (store, svc) = service();
        let user = login(&svc).await;
        let now = Utc::now();
        store
            .create_session(&Session {
                id: "old".into(),
                user_id: user.id,
                provider: "github".into(),
                expires_at: now - Duration::seconds(1),
                created_at: now - Duration::hours(25),
            })
            .await
            .unwrap();

        let svc = Arc::new(svc);
        let cancel = CancellationToken::new();
        let handle = svc.spawn_session_purge_task(StdDuration::from_millis(10), cancel.clone());
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(store.session_count().await, 0);
    }

    // -------------------------------------------------------------------------
    // API keys
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn api_key_round_trip() {
        let (store, svc) = service();
        let user = login(&svc).await;
        let (record, plaintext) = svc.create_api_key(user.id, "jenkins").await.unwrap();
        assert!(plaintext.starts_with("tr_"));
        assert_eq!(record.name, "jenkins");

        let ctx = svc.validate_api_key(&plaintext).await.unwrap();
        assert_eq!(ctx.user_id(), user.id);
        assert!(ctx.is_api_key());
        assert_eq!(ctx.api_key_id(), Some(record.id));

        // Repeated use keeps validating.
        assert!(svc.validate_api_key(&plaintext).await.is_ok());

        // The stored row never holds the plaintext.
        for row in store.api_key_rows().await {
            assert_ne!(row.key_hash, plaintext);
            assert!(!row.key_hash.contains(&plaintext));
        }
    }

    #[tokio::test]
    async fn api_key_use_is_recorded() {
        let (store, svc) = service();
        let user = login(&svc).await;
        let (record, plaintext) = svc.create_api_key(user.id, "ci").await.unwrap();
        assert!(record.last_used_at.is_none());

        svc.validate_api_key(&plaintext).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        let rows = store.api_key_rows().await;
        assert!(rows[0].last_used_at.is_some());
    }

    #[tokio::test]
    async fn other_strings_do_not_validate() {
        let (_, svc) = service();
        let user = login(&svc).await;
        let (_, plaintext) = svc.create_api_key(user.id, "ci").await.unwrap();

        // Same lookup id, different secret.
        let mut forged = plaintext.clone();
        let last = if forged.ends_with('A') { 'B' } else { 'A' };
        forged.pop();
        forged.push(last);
        assert!(matches!(
            svc.validate_api_key(&forged).await,
            Err(AuthError::InvalidApiKey)
        ));
        assert!(matches!(
            svc.validate_api_key("not-a-key").await,
            Err(AuthError::InvalidApiKey)
        ));
    }

    #[tokio::test]
    async fn expired_api_key_is_rejected() {
        let (store, svc) = service();
        let user = login(&svc).await;
        let plaintext = secrets::generate_api_key();
        store
            .create_api_key(&NewApiKey {
                user_id: user.id,
                name: "old".into(),
                key_prefix: secrets::api_key_lookup_id(&plaintext).unwrap().into(),
                key_hash: secrets::hash_api_key(&plaintext).unwrap(),
                expires_at: Utc::now() - Duration::seconds(1),
            })
            .await
            .unwrap();

        assert!(matches!(
            svc.validate_api_key(&plaintext).await,
            Err(AuthError::ApiKeyExpired)
        ));
    }

    #[tokio::test]
    async fn deleted_api_key_stops_validating() {
        let (_, svc) = service();
        let user = login(&svc).await;
        let (record, plaintext) = svc.create_api_key(user.id, "ci").await.unwrap();
        svc.delete_api_key(user.id, record.id).await.unwrap();
        assert!(matches!(
            svc.validate_api_key(&plaintext).await,
            Err(AuthError::InvalidApiKey)
        ));
        assert!(matches!(
            svc.delete_api_key(user.id, record.id).await,
            Err(AuthError::ApiKeyNotFound)
        ));
    }

    #[tokio::test]
    async fn api_key_name_is_required() {
        let (_, svc) = service();
        let user = login(&svc).await;
        assert!(matches!(
            svc.create_api_key(user.id, "   ").await,
            Err(AuthError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn keys_may_share_a_name() {
        let (_, svc) = service();
        let user = login(&svc).await;
        svc.create_api_key(user.id, "ci").await.unwrap();
        svc.create_api_key(user.id, "ci").await.unwrap();
        assert_eq!(svc.list_api_keys(user.id).await.unwrap().len(), 2);
    }

    /// Store double that fails selected operations and delegates the rest.
    #[derive(Default)]
    struct FaultyStore {
        inner: MemoryCredentialStore,
        touch_fails: bool,
        keys_collide: bool,
        touches: AtomicUsize,
        key_inserts: AtomicUsize,
    }

    #[async_trait]
    impl CredentialStore for FaultyStore {
        async fn create_user(&self, identity: &ExternalIdentity) -> StoreResult<User> {
            self.inner.create_user(identity).await
        }
        async fn get_user_by_id(&self, id: i64) -> StoreResult<User> {
            self.inner.get_user_by_id(id).await
        }
        async fn get_user_by_provider(
            &self,
            provider: &str,
            provider_id: &str,
        ) -> StoreResult<User> {
            self.inner.get_user_by_provider(provider, provider_id).await
        }
        async fn upsert_user(&self, identity: &ExternalIdentity) -> StoreResult<User> {
            self.inner.upsert_user(identity).await
        }
        async fn create_session(&self, session: &Session) -> StoreResult<()> {
            self.inner.create_session(session).await
        }
        async fn get_session(&self, id: &str) -> StoreResult<Session> {
            self.inner.get_session(id).await
        }
        async fn delete_session(&self, id: &str) -> StoreResult<()> {
            self.inner.delete_session(id).await
        }
        async fn purge_expired_sessions(&self) -> StoreResult<u64> {
            self.inner.purge_expired_sessions().await
        }
        async fn create_api_key(&self, key: &NewApiKey) -> StoreResult<ApiKey> {
            self.key_inserts.fetch_add(1, Ordering::SeqCst);
            if self.keys_collide {
                return Err(StoreError::Conflict("api key".into()));
            }
            self.inner.create_api_key(key).await
        }
        async fn get_api_key_by_hash(&self, hash: &str) -> StoreResult<ApiKey> {
            self.inner.get_api_key_by_hash(hash).await
        }
        async fn list_api_keys_by_prefix(&self, prefix: &str) -> StoreResult<Vec<ApiKey>> {
            self.inner.list_api_keys_by_prefix(prefix).await
        }
        async fn touch_api_key(&self, id: i64) -> StoreResult<()> {
            self.touches.fetch_add(1, Ordering::SeqCst);
            if self.touch_fails {
                return Err(StoreError::Timeout { op: "touch_api_key" });
            }
            self.inner.touch_api_key(id).await
        }
        async fn delete_api_key(&self, id: i64) -> StoreResult<()> {
            self.inner.delete_api_key(id).await
        }
        async fn delete_api_key_for_user(&self, user_id: i64, id: i64) -> StoreResult<()> {
            self.inner.delete_api_key_for_user(user_id, id).await
        }
        async fn list_api_keys_by_user(&self, user_id: i64) -> StoreResult<Vec<ApiKey>> {
            self.inner.list_api_keys_by_user(user_id).await
        }
        async fn ping(&self) -> StoreResult<()> {
            self.inner.ping().await
        }
    }

    fn faulty_service(store: FaultyStore) -> (Arc<FaultyStore>, AuthService) {
        let store = Arc::new(store);
        let svc = AuthService::new(store.clone(), Arc::new(StubFederation), AuthSettings::default());
        (store, svc)
    }

    #[tokio::test]
    async fn failed_use_record_does_not_fail_validation() {
        let (store, svc) = faulty_service(FaultyStore {
            touch_fails: true,
            ..Default::default()
        });
        let user = login(&svc).await;
        let (record, plaintext) = svc.create_api_key(user.id, "ci").await.unwrap();

        let ctx = svc.validate_api_key(&plaintext).await.unwrap();
        assert!(ctx.is_api_key());
        assert_eq!(ctx.user_id(), user.id);

        for _ in 0..100 {
            if store.touches.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        assert_eq!(store.touches.load(Ordering::SeqCst), 1);
        let keys = svc.list_api_keys(user.id).await.unwrap();
        assert_eq!(keys[0].id, record.id);
        assert!(keys[0].last_used_at.is_none());

        // Still valid on the next request.
        svc.validate_api_key(&plaintext).await.unwrap();
    }

    #[tokio::test]
    async fn persistent_key_collisions_are_internal_errors() {
        let (store, svc) = faulty_service(FaultyStore {
            keys_collide: true,
            ..Default::default()
        });
        let user = login(&svc).await;
        assert!(matches!(
            svc.create_api_key(user.id, "ci").await,
            Err(AuthError::Internal(_))
        ));
        assert_eq!(
            store.key_inserts.load(Ordering::SeqCst),
            KEY_INSERT_ATTEMPTS
        );
        assert!(svc.list_api_keys(user.id).await.unwrap().is_empty());
    }
}
