use std::sync::Arc;

use async_trait::async_trait;
use kvx_core::keypath;
use kvx_core::{
    ErrorKind, KvPair, LockHandle, LockOptions, Store, StoreError, WriteOptions, Watcher,
};
use tracing::{debug, info, instrument};

use crate::client::{ConsulClient, KvQuery, WriteParams};
use crate::config::ConsulConfig;
use crate::lock::ConsulLocker;
use crate::session::SessionManager;
use crate::watch::{self, tree_pairs};
use crate::LOCK_FLAG;

/// Backend name under which the Consul store registers.
pub const BACKEND_NAME: &str = "consul";

/// Coordination store backed by Consul's KV and session APIs.
///
/// Keys are sent as `trim(normalize(key))`: Consul keys carry no leading
/// separator, and `"a"` and `"a/"` address the same leaf. Directory
/// operations derive their prefix from that leaf form.
pub struct ConsulStore {
    client: Arc<ConsulClient>,
    sessions: SessionManager,
}

impl std::fmt::Debug for ConsulStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsulStore")
            .field("base_url", &self.client.base_url())
            .finish_non_exhaustive()
    }
}

impl ConsulStore {
    /// Create a store talking to the agent described by `config`.
    pub fn new(config: &ConsulConfig) -> Result<Self, StoreError> {
        let client = Arc::new(ConsulClient::new(config)?);
        let sessions = SessionManager::new(client.clone(), config.retry_policy());
        info!("Consul store using {}", client.base_url());
        Ok(Self { client, sessions })
    }

    /// Create a store from opaque connection options (`null` means defaults).
    pub fn from_options(options: serde_json::Value) -> Result<Self, StoreError> {
        let config = if options.is_null() {
            ConsulConfig::default()
        } else {
            serde_json::from_value(options)
                .map_err(|e| StoreError::InvalidArgument(format!("consul options: {}", e)))?
        };
        Self::new(&config)
    }

    pub fn session_manager(&self) -> &SessionManager {
        &self.sessions
    }

    fn normalize(key: &str) -> String {
        keypath::trim(&keypath::normalize(key)).to_string()
    }

    fn write_params() -> WriteParams {
        WriteParams {
            flags: Some(LOCK_FLAG),
            ..WriteParams::default()
        }
    }
}

#[async_trait]
impl Store for ConsulStore {
    fn backend(&self) -> &'static str {
        BACKEND_NAME
    }

    #[instrument(skip(self), level = "debug")]
    async fn get(&self, key: &str) -> Result<KvPair, StoreError> {
        let key = Self::normalize(key);
        let response = self.client.kv_get(&key, KvQuery::default()).await?;
        match response.entries.into_iter().next() {
            Some(entry) => Ok(entry.into_pair()?),
            None => Err(StoreError::key_not_found(&key)),
        }
    }

    #[instrument(skip(self, value), level = "debug", fields(value_len = value.len()))]
    async fn put(
        &self,
        key: &str,
        value: &[u8],
        options: Option<&WriteOptions>,
    ) -> Result<(), StoreError> {
        let key = Self::normalize(key);
        let mut params = Self::write_params();

        let ttl = options.and_then(|o| o.effective_ttl());
        if let Some(ttl) = ttl {
            let session = self.sessions.renew_session_with_retry(&key, ttl).await?;
            debug!("Binding {} to session {}", key, session);
            params.acquire = Some(session);
        }

        let applied = self.client.kv_put(&key, value, &params).await?;
        if !applied && ttl.is_some() {
            // Another session holds the key.
            return Err(StoreError::with_detail(ErrorKind::CannotLock, key));
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let key = Self::normalize(key);
        self.client.kv_delete(&key, false, None).await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn list(&self, directory: &str) -> Result<Vec<KvPair>, StoreError> {
        let prefix = keypath::directory_prefix(&Self::normalize(directory));
        let query = KvQuery {
            recurse: true,
            index: None,
        };
        let response = self.client.kv_get(&prefix, query).await?;
        let pairs = tree_pairs(&prefix, response.entries)?;
        if pairs.is_empty() {
            return Err(StoreError::key_not_found(&prefix));
        }
        debug!("Listed {} keys under {:?}", pairs.len(), prefix);
        Ok(pairs)
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_tree(&self, directory: &str) -> Result<(), StoreError> {
        let key = Self::normalize(directory);
        let prefix = keypath::directory_prefix(&key);
        self.client.kv_delete(&prefix, true, None).await?;

        if !key.is_empty() {
            self.client.kv_delete(&key, false, None).await?;
        }
        Ok(())
    }

    #[instrument(skip(self, value, previous), level = "debug", fields(previous = previous.map(|p| p.version)))]
    async fn atomic_put(
        &self,
        key: &str,
        value: &[u8],
        previous: Option<&KvPair>,
    ) -> Result<bool, StoreError> {
        let key = Self::normalize(key);
        let params = WriteParams {
            cas: Some(previous.map(|p| p.version).unwrap_or(0)),
            ..Self::write_params()
        };
        let applied = self.client.kv_put(&key, value, &params).await?;
        if !applied {
            debug!("CAS put on {} rejected", key);
        }
        Ok(applied)
    }

    #[instrument(skip(self, previous), level = "debug", fields(previous = previous.map(|p| p.version)))]
    async fn atomic_delete(
        &self,
        key: &str,
        previous: Option<&KvPair>,
    ) -> Result<bool, StoreError> {
        let Some(previous) = previous else {
            return Err(StoreError::with_detail(ErrorKind::PreviousNotSpecified, key));
        };
        let key = Self::normalize(key);
        let applied = self
            .client
            .kv_delete(&key, false, Some(previous.version))
            .await?;
        if !applied {
            debug!("CAS delete on {} rejected", key);
        }
        Ok(applied)
    }

    fn watch(&self, key: &str) -> Watcher<Option<KvPair>> {
        let client = self.client.clone();
        let key = Self::normalize(key);
        Watcher::spawn(move |sink| watch::watch_key(client, key, sink))
    }

    fn watch_tree(&self, directory: &str) -> Watcher<Vec<KvPair>> {
        let client = self.client.clone();
        let prefix = keypath::directory_prefix(&Self::normalize(directory));
        Watcher::spawn(move |sink| watch::watch_tree(client, prefix, sink))
    }

    fn lock(&self, key: &str, options: LockOptions) -> LockHandle {
        let key = Self::normalize(key);
        let locker = ConsulLocker::new(
            self.client.clone(),
            self.sessions.clone(),
            key.clone(),
            options.ttl,
            options.value.clone(),
        );
        LockHandle::new(key, options, Box::new(locker))
    }

    async fn close(&self) -> Result<(), StoreError> {
        if !self.client.is_closed() {
            info!("Closing Consul store ({})", self.client.base_url());
        }
        self.client.close();
        Ok(())
    }
}
