//! error

use crate::{backend::BackendKind, event::EventError};
use std::io;

/// Result type returned by the threadpool api
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by threadpool, work and cleanup group operations.
///
/// NOTE: Contract violations (decrementing a countdown below zero, closing a handle twice) are
///       not represented here. They are prevented by ownership or caught by debug assertions.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The threadpool is closing or closed and no longer accepts work
    #[error("threadpool is closed")]
    Closed,
    /// The threadpool was created with a bounded pending queue and the queue is full
    #[error("threadpool pending queue full")]
    QueueFull,
    /// The active backend does not implement this operation
    #[error("{operation} is not supported by the {backend} threadpool backend")]
    NotSupported {
        operation: &'static str,
        backend: BackendKind,
    },
    /// Objects created by different backends were combined
    #[error("threadpool objects from different backends cannot be mixed")]
    BackendMismatch,
    /// The threadpool cannot make another worker available
    #[error("threadpool busy")]
    Busy,
    /// A wait on a countdown or event did not complete
    #[error("threadpool wait => {0}")]
    Event(#[from] EventError),
    /// A worker thread could not be spawned, or the native facility failed
    #[error("threadpool io error => {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// True when this error is a wait timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Event(EventError::Timeout))
    }

    pub(crate) fn not_supported(operation: &'static str, backend: BackendKind) -> Self {
        tracing::warn!(operation, %backend, "threadpool operation not supported");
        Error::NotSupported { operation, backend }
    }
}
