//! Crate-level error types
//!
//! Each subsystem keeps its own error enum; this module ties them together
//! for callers that cross subsystem boundaries (the HTTP handlers, mostly).

use thiserror::Error;

use crate::registry::RegistryError;
use crate::session::SessionError;
use crate::store::StoreError;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for the streaming engine
#[derive(Debug, Error)]
pub enum Error {
    /// The requested URL id is not in the admission cache
    #[error("unknown stream id: {0}")]
    NotFound(String),

    /// Registry refused the attachment
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The upstream producer failed terminally
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Segment store operation failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Admission snapshot could not be read or parsed
    #[error("stream snapshot unreadable: {0}")]
    Snapshot(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
