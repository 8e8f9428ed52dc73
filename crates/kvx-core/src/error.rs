use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Boxed error raised by a backend client (HTTP transport, protocol, decoding).
pub type BackendError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Kinds of coordination failures.
///
/// Callers branch on the kind, never on the rendered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The requested backend is not known to the registry.
    BackendNotSupported,
    /// The operation is not implemented by the current backend.
    CallNotSupported,
    /// The backend cannot be reached, or the store was closed.
    NotReachable,
    /// A lock could not be acquired.
    CannotLock,
    /// An atomic operation lost against a concurrent modification.
    KeyModified,
    /// The key (or every key under a directory) is absent.
    KeyNotFound,
    /// An atomic delete was issued without the previously read pair.
    PreviousNotSpecified,
    /// An atomic create found the key already present.
    KeyExists,
}

impl ErrorKind {
    /// Human readable message for this kind.
    pub fn message(&self) -> &'static str {
        match self {
            ErrorKind::BackendNotSupported => "Backend storage not supported yet",
            ErrorKind::CallNotSupported => "The current call is not supported with this backend",
            ErrorKind::NotReachable => "Api not reachable",
            ErrorKind::CannotLock => "Error acquiring the lock",
            ErrorKind::KeyModified => "Unable to complete atomic operation, key modified",
            ErrorKind::KeyNotFound => "Key not found in store",
            ErrorKind::PreviousNotSpecified => {
                "Previous K/V pair should be provided for the Atomic operation"
            }
            ErrorKind::KeyExists => "Previous K/V pair exists, cannot complete Atomic operation",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Errors raised by coordination store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A failure with a well-known coordination kind.
    #[error("{kind}{}", render_detail(.detail))]
    Coordination {
        kind: ErrorKind,
        detail: Option<String>,
    },

    /// A backend transport or protocol failure, passed through as-is.
    #[error("Backend error: {0}")]
    Backend(#[source] BackendError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

fn render_detail(detail: &Option<String>) -> String {
    detail.as_deref().map(|d| format!(": {d}")).unwrap_or_default()
}

impl StoreError {
    /// Error of the given kind without detail.
    pub fn new(kind: ErrorKind) -> Self {
        StoreError::Coordination { kind, detail: None }
    }

    /// Error of the given kind carrying context (usually the key).
    pub fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        StoreError::Coordination {
            kind,
            detail: Some(detail.into()),
        }
    }

    pub fn key_not_found(key: &str) -> Self {
        Self::with_detail(ErrorKind::KeyNotFound, key)
    }

    /// Wrap a backend-origin error without altering it.
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Backend(Box::new(err))
    }

    /// The coordination kind, if this error carries one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            StoreError::Coordination { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Whether this error is of the given kind.
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind() == Some(kind)
    }
}

impl From<ErrorKind> for StoreError {
    fn from(kind: ErrorKind) -> Self {
        StoreError::new(kind)
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
