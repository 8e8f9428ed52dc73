use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use tracing::{debug, info, instrument, warn};

use crate::error::StoreError;
use crate::store::LockOptions;

/// Lifecycle of a [`LockHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Built, never acquired.
    Created,
    /// Waiting for the backend to grant the lock.
    Acquiring,
    /// The backend granted the lock to this handle.
    Held,
    /// Release in progress.
    Releasing,
    /// Released; the handle can be acquired again.
    Released,
    /// The last acquisition failed; the handle can be acquired again.
    Failed,
}

/// Backend lock primitive driven by a [`LockHandle`].
///
/// Implementations own whatever backend session backs the lock.
#[async_trait]
pub trait Locker: Send {
    /// Suspend until the backend grants the lock.
    async fn lock(&mut self) -> Result<(), StoreError>;

    /// Give the lock back.
    ///
    /// Returns `Ok(false)` when the backend reports that there was no lock to
    /// release (for example because the session already expired).
    async fn unlock(&mut self) -> Result<bool, StoreError>;
}

/// Handle on a distributed lock for one key.
///
/// Mutual exclusion is enforced by the backend primitive; the handle only
/// tracks state transitions for its own caller.
pub struct LockHandle {
    key: String,
    options: LockOptions,
    state: LockState,
    locker: Box<dyn Locker>,
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.key)
            .field("ttl", &self.options.ttl)
            .field("state", &self.state)
            .finish()
    }
}

impl LockHandle {
    pub fn new(key: impl Into<String>, options: LockOptions, locker: Box<dyn Locker>) -> Self {
        Self {
            key: key.into(),
            options,
            state: LockState::Created,
            locker,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn ttl(&self) -> Duration {
        self.options.ttl
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.options.value.as_ref()
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn is_held(&self) -> bool {
        self.state == LockState::Held
    }

    /// Acquire the lock, suspending until the backend grants it.
    ///
    /// Acquiring a handle that is already held is a no-op.
    #[instrument(skip(self), fields(key = %self.key), level = "debug")]
    pub async fn acquire(&mut self) -> Result<(), StoreError> {
        if self.state == LockState::Held {
            debug!("lock already held by this handle");
            return Ok(());
        }

        self.state = LockState::Acquiring;
        match self.locker.lock().await {
            Ok(()) => {
                self.state = LockState::Held;
                info!(key = %self.key, ttl_secs = self.options.ttl.as_secs_f64(), "lock acquired");
                Ok(())
            }
            Err(e) => {
                self.state = LockState::Failed;
                warn!(key = %self.key, error = %e, "lock acquisition failed");
                Err(e)
            }
        }
    }

    /// Release the lock.
    ///
    /// Releasing a lock that is no longer held (never acquired, or already
    /// dropped by the backend) is logged and treated as success.
    #[instrument(skip(self), fields(key = %self.key), level = "debug")]
    pub async fn release(&mut self) -> Result<(), StoreError> {
        let previous = self.state;
        match previous {
            LockState::Created | LockState::Released | LockState::Failed => {
                warn!(key = %self.key, state = ?previous, "no lock in use, nothing to release");
                return Ok(());
            }
            LockState::Acquiring | LockState::Held | LockState::Releasing => {}
        }

        self.state = LockState::Releasing;
        match self.locker.unlock().await {
            Ok(true) => {
                self.state = LockState::Released;
                info!(key = %self.key, "lock released");
                Ok(())
            }
            Ok(false) => {
                self.state = LockState::Released;
                warn!(key = %self.key, "lock was already gone when releasing");
                Ok(())
            }
            Err(e) => {
                self.state = previous;
                Err(e)
            }
        }
    }

    /// Run `f` while holding the lock.
    ///
    /// The lock is released however `f` ends, including by panic. `f`'s
    /// error takes precedence over a release error, and is returned only
    /// after the release completed.
    pub async fn done<T, E, F, Fut>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<StoreError>,
    {
        self.acquire().await?;
        let outcome = AssertUnwindSafe(f()).catch_unwind().await;
        let released = self.release().await;

        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                if let Err(e) = released {
                    warn!(key = %self.key, error = %e, "release failed after panic");
                }
                std::panic::resume_unwind(panic);
            }
        };

        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), released) => {
                if let Err(release_err) = released {
                    warn!(key = %self.key, error = %release_err, "release failed after error");
                }
                Err(e)
            }
        }
    }
}
