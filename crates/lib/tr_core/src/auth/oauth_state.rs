//! Short-lived OAuth2 `state` cache.
//!
//! Binds each issued state to the provider it was issued for until the
//! matching callback arrives. States are unique by construction, so a single
//! writer per key is guaranteed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// TTL for pending login states (10 minutes).
pub const STATE_TTL: Duration = Duration::from_secs(600);

/// Interval of the background eviction sweep.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// A login started by `begin` and not yet completed.
#[derive(Debug, Clone)]
pub struct PendingLogin {
    pub provider: String,
    pub created_at: Instant,
}

/// In-memory store of pending logins keyed by state.
pub struct OAuthStateStore {
    states: DashMap<String, PendingLogin>,
    ttl: Duration,
}

impl OAuthStateStore {
    pub fn new() -> Self {
        Self::with_ttl(STATE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            states: DashMap::new(),
            ttl,
        }
    }

    /// Record a pending login for `provider`.
    pub fn insert(&self, state: String, provider: &str) {
        self.states.insert(
            state,
            PendingLogin {
                provider: provider.to_string(),
                created_at: Instant::now(),
            },
        );
    }

    /// Take (remove and return) a pending login.
    /// Returns `None` if not found or expired.
    pub fn take(&self, state: &str) -> Option<PendingLogin> {
        let (_, pending) = self.states.remove(state)?;
        if pending.created_at.elapsed() > self.ttl {
            return None;
        }
        Some(pending)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Evict expired entries.
    pub fn cleanup(&self) {
        let ttl = self.ttl;
        self.states.retain(|_, v| v.created_at.elapsed() <= ttl);
    }

    /// Spawn a periodic cleanup task that stops when `cancel` fires.
    pub fn spawn_cleanup_task(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        store.cleanup();
                        debug!(pending = store.len(), "oauth state sweep");
                    }
                }
            }
        })
    }
}

impl Default for OAuthStateStore {
    fn default() -> Self {
        Self::new()
    }
}
