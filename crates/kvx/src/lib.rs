//! Uniform distributed coordination client.
//!
//! One [`Store`] API for configuration storage, leader election and mutual
//! exclusion, whatever coordination backend is deployed. Backends are picked
//! by name from a [`StoreRegistry`]:
//!
//! ```no_run
//! # async fn run() -> kvx::Result<()> {
//! let registry = kvx::StoreRegistry::default();
//! let store = registry.create("consul", serde_json::json!({ "address": "127.0.0.1:8500" }))?;
//! store.put("app/config", b"v1", None).await?;
//! # Ok(())
//! # }
//! ```

mod registry;

pub use kvx_core::keypath;
pub use kvx_core::{
    ErrorKind, KeyEvent, KvPair, LockHandle, LockOptions, LockState, Result, RetryPolicy, Store,
    StoreError, TreeEvent, WatchEvent, WatchState, Watcher, WriteOptions, DEFAULT_LOCK_TTL,
};
pub use registry::{StoreConstructor, StoreRegistry};

/// Consul backend.
pub mod consul {
    pub use kvx_consul::*;
}
