//! Consul backend for the kvx coordination store contract.
//!
//! Talks to a Consul agent over its HTTP API:
//! - KV reads and writes, with `cas` for the atomic operations
//! - sessions for TTL-bound keys and locks
//! - blocking queries driving `watch` and `watch_tree`

mod client;
mod config;
mod error;
mod lock;
mod session;
mod store;
mod watch;

pub use client::{
    ConsulClient, KvEntry, KvQuery, KvResponse, SessionBehavior, SessionRequest, WriteParams,
};
pub use config::ConsulConfig;
pub use error::{consul_source, ConsulError, ErrorKind, StoreError};
pub use lock::ConsulLocker;
pub use session::{format_ttl, session_ttl, SessionManager, LOCK_DELAY};
pub use store::{ConsulStore, BACKEND_NAME};

/// Flag stamped on every key written by kvx, the value Consul lock clients
/// use to recognise lock keys.
pub const LOCK_FLAG: u64 = 0x2ddc_cbc0_58a5_0c18;
