use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use kvx_core::{Locker, StoreError};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::client::{ConsulClient, KvQuery, SessionBehavior, WriteParams};
use crate::error::consul_source;
use crate::session::{session_ttl, SessionManager};
use crate::watch::IndexTracker;
use crate::LOCK_FLAG;

/// Consul session-scoped lock on one key.
///
/// Acquisition creates a `release` session, keeps it alive from a background
/// task and writes the lock value with `acquire=<session>`. Consul grants the
/// key to one session at a time.
pub struct ConsulLocker {
    client: Arc<ConsulClient>,
    sessions: SessionManager,
    key: String,
    ttl: Duration,
    value: Bytes,
    session: Option<String>,
    renewal: Option<JoinHandle<()>>,
}

impl ConsulLocker {
    pub fn new(
        client: Arc<ConsulClient>,
        sessions: SessionManager,
        key: impl Into<String>,
        ttl: Duration,
        value: Option<Bytes>,
    ) -> Self {
        Self {
            client,
            sessions,
            key: key.into(),
            ttl,
            value: value.unwrap_or_default(),
            session: None,
            renewal: None,
        }
    }

    fn lock_params(&self, session: &str, acquire: bool) -> WriteParams {
        let session = Some(session.to_string());
        let (acquire, release) = if acquire {
            (session, None)
        } else {
            (None, session)
        };
        WriteParams {
            flags: Some(LOCK_FLAG),
            cas: None,
            acquire,
            release,
        }
    }

    /// Session backing this lock, created on first use.
    async fn ensure_session(&mut self) -> Result<String, StoreError> {
        if let Some(session) = &self.session {
            return Ok(session.clone());
        }
        let session = self
            .sessions
            .create_with_retry(self.ttl, SessionBehavior::Release)
            .await?;
        debug!("Lock {} uses session {}", self.key, session);
        self.renewal = Some(spawn_renewal(
            self.sessions.clone(),
            self.client.clone(),
            session.clone(),
            session_ttl(self.ttl) / 2,
        ));
        self.session = Some(session.clone());
        Ok(session)
    }

    fn stop_renewal(&mut self) {
        if let Some(renewal) = self.renewal.take() {
            renewal.abort();
        }
    }

    /// Forget the session without touching Consul.
    fn drop_session(&mut self) {
        self.stop_renewal();
        self.session = None;
    }

    /// Write the lock value with `acquire=<session>` until Consul grants it.
    async fn acquire_key(&mut self) -> Result<(), StoreError> {
        loop {
            let session = self.ensure_session().await?;
            let params = self.lock_params(&session, true);

            match self.client.kv_put(&self.key, &self.value, &params).await {
                Ok(true) => {
                    info!("Acquired lock {} with session {}", self.key, session);
                    return Ok(());
                }
                Ok(false) => self.wait_for_release().await?,
                Err(e) if is_invalid_session(&e) => {
                    warn!("Session {} vanished while acquiring {}", session, self.key);
                    self.drop_session();
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Stop renewing and destroy the session of an acquisition that failed.
    async fn abandon_session(&mut self) {
        self.stop_renewal();
        let Some(session) = self.session.take() else {
            return;
        };
        match self.sessions.destroy(&session).await {
            Ok(_) => debug!("Destroyed session {} after failed acquire of {}", session, self.key),
            Err(e) => warn!("Failed to destroy lock session {}: {}", session, e),
        }
    }

    /// Suspend until the lock key is no longer held by any session.
    async fn wait_for_release(&self) -> Result<(), StoreError> {
        let mut tracker = IndexTracker::default();
        loop {
            let query = KvQuery {
                recurse: false,
                index: tracker.query_index(),
            };
            let response = self.client.kv_get(&self.key, query).await?;
            tracker.observe(response.index);
            let holder = response.entries.into_iter().next().and_then(|e| e.session);
            match holder {
                None => return Ok(()),
                Some(holder) => debug!("Lock {} held by session {}, waiting", self.key, holder),
            }
        }
    }
}

/// Renew `session` every `interval` until Consul forgets it or the client
/// closes.
fn spawn_renewal(
    sessions: SessionManager,
    client: Arc<ConsulClient>,
    session: String,
    interval: Duration,
) -> JoinHandle<()> {
    let interval = interval.max(Duration::from_millis(10));
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if client.is_closed() {
                debug!("Store closed, stopping renewal of session {}", session);
                return;
            }
            match sessions.renew(&session).await {
                Ok(true) => debug!("Renewed lock session {}", session),
                Ok(false) => {
                    warn!("Lock session {} expired, stopping renewal", session);
                    return;
                }
                Err(e) => warn!("Failed to renew lock session {}: {}", session, e),
            }
        }
    })
}

fn is_invalid_session(err: &StoreError) -> bool {
    consul_source(err).is_some_and(|e| e.is_invalid_session())
}

#[async_trait]
impl Locker for ConsulLocker {
    #[instrument(skip(self), fields(key = %self.key), level = "debug")]
    async fn lock(&mut self) -> Result<(), StoreError> {
        match self.acquire_key().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.abandon_session().await;
                Err(e)
            }
        }
    }

    #[instrument(skip(self), fields(key = %self.key), level = "debug")]
    async fn unlock(&mut self) -> Result<bool, StoreError> {
        let Some(session) = self.session.clone() else {
            return Ok(false);
        };
        self.stop_renewal();

        let params = self.lock_params(&session, false);
        let released = match self.client.kv_put(&self.key, &self.value, &params).await {
            Ok(released) => released,
            Err(e) if is_invalid_session(&e) => false,
            Err(e) => {
                // Still holding: keep the session alive for a later attempt.
                self.renewal = Some(spawn_renewal(
                    self.sessions.clone(),
                    self.client.clone(),
                    session,
                    session_ttl(self.ttl) / 2,
                ));
                return Err(e);
            }
        };
        self.session = None;

        if let Err(e) = self.sessions.destroy(&session).await {
            warn!("Failed to destroy lock session {}: {}", session, e);
        }
        debug!("Released lock {} (held: {})", self.key, released);
        Ok(released)
    }
}

impl Drop for ConsulLocker {
    fn drop(&mut self) {
        self.stop_renewal();
    }
}
