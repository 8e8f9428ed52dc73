use std::sync::Arc;
use std::time::Duration;

use kvx_core::{RetryPolicy, StoreError};
use tracing::{debug, instrument};

use crate::client::{ConsulClient, KvQuery, SessionBehavior, SessionRequest};
use crate::error::store_closed;

/// Lock delay applied to every session created by kvx.
pub const LOCK_DELAY: &str = "1ms";

/// Session TTL backing a caller TTL.
///
/// Consul may keep a session alive up to twice its TTL before invalidating
/// it, so halving keeps the observed lifetime close to what was asked for.
pub fn session_ttl(ttl: Duration) -> Duration {
    ttl / 2
}

/// Render a duration the way Consul parses it.
pub fn format_ttl(ttl: Duration) -> String {
    format!("{}ms", ttl.as_millis())
}

/// Obtains, renews and destroys Consul sessions for TTL writes and locks.
#[derive(Clone)]
pub struct SessionManager {
    client: Arc<ConsulClient>,
    retry: RetryPolicy,
}

impl SessionManager {
    pub fn new(client: Arc<ConsulClient>, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Session currently holding `key`, if any.
    pub async fn active_session(&self, key: &str) -> Result<Option<String>, StoreError> {
        let response = self.client.kv_get(key, KvQuery::default()).await?;
        Ok(response.entries.into_iter().next().and_then(|e| e.session))
    }

    /// Create a session with half of `ttl` as its TTL.
    #[instrument(skip(self), level = "debug")]
    pub async fn create(&self, ttl: Duration, behavior: SessionBehavior) -> Result<String, StoreError> {
        let request = SessionRequest {
            name: format!("kvx-{}", uuid::Uuid::new_v4()),
            ttl: format_ttl(session_ttl(ttl)),
            behavior,
            lock_delay: LOCK_DELAY.to_string(),
        };
        self.client.session_create(&request).await
    }

    /// Renew the session already attached to `key`, or create a fresh
    /// delete-on-expiry session when there is none (or it is gone).
    #[instrument(skip(self), level = "debug")]
    pub async fn renew_session(&self, key: &str, ttl: Duration) -> Result<String, StoreError> {
        if let Some(session) = self.active_session(key).await? {
            if self.client.session_renew(&session).await? {
                debug!("Renewed session {} attached to {}", session, key);
                return Ok(session);
            }
            debug!("Session {} attached to {} is gone", session, key);
        }
        self.create(ttl, SessionBehavior::Delete).await
    }

    /// [`renew_session`](Self::renew_session) under the retry policy.
    pub async fn renew_session_with_retry(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<String, StoreError> {
        if self.client.is_closed() {
            return Err(store_closed());
        }
        self.retry
            .run("renew_session", || self.renew_session(key, ttl))
            .await
    }

    /// Create a session under the retry policy.
    pub async fn create_with_retry(
        &self,
        ttl: Duration,
        behavior: SessionBehavior,
    ) -> Result<String, StoreError> {
        if self.client.is_closed() {
            return Err(store_closed());
        }
        self.retry
            .run("create_session", || self.create(ttl, behavior))
            .await
    }

    /// Extend a session. `Ok(false)` when Consul no longer knows it.
    pub async fn renew(&self, session: &str) -> Result<bool, StoreError> {
        self.client.session_renew(session).await
    }

    pub async fn destroy(&self, session: &str) -> Result<bool, StoreError> {
        self.client.session_destroy(session).await
    }
}
