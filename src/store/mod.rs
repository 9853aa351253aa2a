//! Scoped segment storage
//!
//! Every active upstream session owns a folder of numbered `.ts` segments
//! inside a store that lives only as long as the process. The producer
//! appends to the newest segment, readers snapshot completed ones, and the
//! registry deletes a session's folder when its last client detaches.
//!
//! Two backends exist: [`MemoryStore`] (the default) keeps everything in
//! RAM, [`DiskStore`] uses a throwaway directory on disk. Both are safe for
//! concurrent producers and readers; a reader that loses the race against
//! folder removal sees [`StoreError::NotFound`] and treats it as the signal
//! that cleanup won.

mod disk;
mod memory;

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

pub use disk::DiskStore;
pub use memory::MemoryStore;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors produced by segment stores
#[derive(Debug, Error)]
pub enum StoreError {
    /// The path does not exist (possibly removed while held)
    #[error("no such path: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether this error means the path is gone rather than broken
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::NotFound(_) => true,
            StoreError::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
        }
    }
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageKind {
    /// In-memory virtual filesystem
    #[default]
    Memory,
    /// Temporary directory on disk
    Disk,
}

/// Append handle for the segment currently being written
pub trait SegmentWrite: Send + std::fmt::Debug {
    /// Append bytes to the open segment
    fn append(&mut self, buf: &[u8]) -> StoreResult<()>;
}

/// A scoped virtual filesystem holding stream segments
///
/// Paths are relative, `/`-separated (`<playlistID>/<urlHash>/<N>.ts`).
/// Operations are individually thread-safe; callers coordinate nothing
/// beyond handling [`StoreError::NotFound`] gracefully.
pub trait SegmentStore: Send + Sync {
    /// Create a folder and any missing parents; idempotent
    fn mkdir_all(&self, path: &str) -> StoreResult<()>;

    /// Create an empty file, truncating any previous content
    fn create(&self, path: &str) -> StoreResult<()>;

    /// Open an existing file for appending
    fn open_append(&self, path: &str) -> StoreResult<Box<dyn SegmentWrite>>;

    /// Read a whole file
    fn read(&self, path: &str) -> StoreResult<Bytes>;

    /// List the entries of a folder; order is unspecified
    fn read_dir(&self, path: &str) -> StoreResult<Vec<String>>;

    /// Recursively delete a file or folder; succeeds when already gone
    fn remove_all(&self, path: &str) -> StoreResult<()>;

    /// Size of a file, or 0 for a folder; [`StoreError::NotFound`] otherwise
    fn stat(&self, path: &str) -> StoreResult<u64>;
}

/// Open the store for the configured backend
pub fn open_store(kind: StorageKind) -> Arc<dyn SegmentStore> {
    match kind {
        StorageKind::Memory => Arc::new(MemoryStore::new()),
        StorageKind::Disk => {
            let root = std::env::temp_dir().join(format!("restream-{}", std::process::id()));
            Arc::new(DiskStore::new(root))
        }
    }
}
