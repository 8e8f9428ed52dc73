use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, StoreError};
use crate::lock::LockHandle;
use crate::watch::Watcher;

/// Default time-to-live of a lock.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(20);

/// A key/value pair as read from the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvPair {
    /// Key in backend form (no leading separator).
    pub key: String,
    /// Stored value, `None` when the key holds no data.
    pub value: Option<Bytes>,
    /// Backend modification index of this key. Strictly increasing per key,
    /// used as the CAS token.
    pub version: u64,
}

impl KvPair {
    pub fn new(key: impl Into<String>, value: Option<Bytes>, version: u64) -> Self {
        Self {
            key: key.into(),
            value,
            version,
        }
    }

    /// Value as UTF-8 text, if present and valid.
    pub fn value_str(&self) -> Option<&str> {
        self.value
            .as_ref()
            .and_then(|v| std::str::from_utf8(v).ok())
    }
}

/// Options for [`Store::put`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOptions {
    /// Bind the key to a session with this time-to-live. The backend deletes
    /// the key once the session expires without renewal.
    pub ttl: Option<Duration>,
}

impl WriteOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl) }
    }

    /// TTL requested for this write, ignoring zero.
    pub fn effective_ttl(&self) -> Option<Duration> {
        self.ttl.filter(|ttl| !ttl.is_zero())
    }
}

/// Options for [`Store::lock`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOptions {
    /// Lifetime of the lock if its holder stops renewing it.
    pub ttl: Duration,
    /// Value written to the lock key while held.
    pub value: Option<Bytes>,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_LOCK_TTL,
            value: None,
        }
    }
}

impl LockOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = Some(value.into());
        self
    }
}

/// Uniform coordination store contract.
///
/// Implemented once per backend. Keys are normalized by the implementation,
/// so `"a"`, `"/a"` and `"//a"` address the same entry.
#[async_trait]
pub trait Store: Send + Sync {
    /// Backend identifier (e.g. `"consul"`).
    fn backend(&self) -> &'static str;

    /// Read a key. Fails `KeyNotFound` if absent.
    async fn get(&self, key: &str) -> Result<KvPair, StoreError>;

    /// Write a key, optionally bound to a TTL session.
    async fn put(
        &self,
        key: &str,
        value: &[u8],
        options: Option<&WriteOptions>,
    ) -> Result<(), StoreError>;

    /// Delete a key. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Whether `get` would succeed.
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is(ErrorKind::KeyNotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Every pair strictly under `directory`, the directory marker excluded.
    ///
    /// Fails `KeyNotFound` when nothing is found: an empty directory and a
    /// missing one are indistinguishable.
    async fn list(&self, directory: &str) -> Result<Vec<KvPair>, StoreError>;

    /// Remove `directory` and everything under it.
    async fn delete_tree(&self, directory: &str) -> Result<(), StoreError>;

    /// Compare-and-swap write.
    ///
    /// With `previous == None` the write only succeeds if the key does not
    /// exist; otherwise only if the key's version equals `previous.version`.
    /// A lost race yields `Ok(false)`.
    async fn atomic_put(
        &self,
        key: &str,
        value: &[u8],
        previous: Option<&KvPair>,
    ) -> Result<bool, StoreError>;

    /// Compare-and-swap delete. `previous` is mandatory: `None` fails
    /// `PreviousNotSpecified`. A version mismatch yields `Ok(false)`.
    async fn atomic_delete(&self, key: &str, previous: Option<&KvPair>)
        -> Result<bool, StoreError>;

    /// Stream changes of a single key, starting with its current state.
    fn watch(&self, key: &str) -> Watcher<Option<KvPair>>;

    /// Stream changes of every key under `directory`, starting with the
    /// current content.
    fn watch_tree(&self, directory: &str) -> Watcher<Vec<KvPair>>;

    /// Build a lock handle for `key`. Does not contact the backend.
    fn lock(&self, key: &str, options: LockOptions) -> LockHandle;

    /// Release the backend connection. In-flight and later operations fail
    /// `NotReachable`.
    async fn close(&self) -> Result<(), StoreError>;
}
