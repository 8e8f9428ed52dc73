//! Core traits and types for kvx coordination store backends.
//!
//! This crate defines the contract every backend adapter implements:
//! - `Store`: CRUD, recursive listing, compare-and-swap, watches and locks
//! - `Watcher`: cancelable stream of change events for a key or subtree
//! - `LockHandle`: acquire/release state machine over a backend `Locker`
//! - `keypath`: key normalization shared by all adapters

pub mod keypath;

mod error;
mod lock;
mod retry;
mod store;
mod watch;

pub use error::{BackendError, ErrorKind, Result, StoreError};
pub use lock::{LockHandle, LockState, Locker};
pub use retry::RetryPolicy;
pub use store::{KvPair, LockOptions, Store, WriteOptions, DEFAULT_LOCK_TTL};
pub use watch::{KeyEvent, TreeEvent, WatchEvent, WatchSink, WatchState, Watcher};
