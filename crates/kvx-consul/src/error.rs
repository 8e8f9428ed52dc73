pub use kvx_core::{ErrorKind, StoreError};
use thiserror::Error;

/// Errors originating from the Consul HTTP API.
///
/// These reach callers unchanged as the source of `StoreError::Backend`.
#[derive(Error, Debug)]
pub enum ConsulError {
    #[error("Consul request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Consul returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid Consul response: {0}")]
    Decode(String),
}

impl ConsulError {
    /// Whether Consul rejected the request because the session is unknown
    /// (expired or destroyed).
    pub fn is_invalid_session(&self) -> bool {
        match self {
            ConsulError::Status { status, body } => {
                (*status == 404 || *status == 500)
                    && body.to_ascii_lowercase().contains("session")
            }
            _ => false,
        }
    }
}

impl From<ConsulError> for StoreError {
    fn from(err: ConsulError) -> Self {
        StoreError::backend(err)
    }
}

/// Find the Consul error behind a `StoreError`, if any.
pub fn consul_source(err: &StoreError) -> Option<&ConsulError> {
    match err {
        StoreError::Backend(source) => source.downcast_ref::<ConsulError>(),
        _ => None,
    }
}

/// Error returned for any operation issued on a closed store.
pub fn store_closed() -> StoreError {
    StoreError::with_detail(ErrorKind::NotReachable, "store closed")
}
