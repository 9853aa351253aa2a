//! Upstream sessions
//!
//! A session is one live upstream connection: one transcoder subprocess,
//! one URL, one folder of segments. The registry creates the shared
//! [`StreamSession`] record; the [`UpstreamProducer`] task owns the
//! subprocess and is the only writer of segments and the ready flag.

pub mod command;
pub mod producer;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::registry::Fingerprint;

pub use producer::UpstreamProducer;

/// Alternate upstream tried when the primary fails
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupStream {
    #[serde(rename = "PlaylistID")]
    pub playlist_id: String,
    #[serde(rename = "URL")]
    pub url: String,
}

/// Terminal producer failures
///
/// Cloneable so the last one can sit in the connection tracker until the
/// session is reaped.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// The transcoder subprocess could not be launched
    #[error("transcoder failed to start: {0}")]
    Start(String),

    /// No first segment within the startup deadline
    #[error("no data from the transcoder before the startup deadline")]
    StartupTimeout,

    /// The transcoder's stdout ended or failed mid-stream
    #[error("upstream read failed: {0}")]
    Read(String),

    /// Segment create/open/write failed; backups do not rescue this
    #[error("segment storage failed: {0}")]
    Storage(String),
}

/// Shared per-session record
///
/// Everything mutable is either atomic (`ready`) or owned by the producer
/// task; readers and the registry only observe.
#[derive(Debug)]
pub struct StreamSession {
    /// Owning playlist
    pub playlist_id: String,
    /// Playlist display name for logs
    pub playlist_name: String,
    /// Channel label for logs
    pub channel_name: String,
    /// Original upstream URL (failover swaps the streamed URL, not this)
    pub url: String,
    /// Ordered backup URLs, at most three
    pub backups: Vec<BackupStream>,
    /// Bookkeeping key, also the folder stem
    pub fingerprint: Fingerprint,
    /// Segment folder inside the store
    pub folder: String,

    ready: AtomicBool,
    produced: AtomicU64,
    stop: CancellationToken,
}

impl StreamSession {
    pub fn new(
        playlist_id: impl Into<String>,
        playlist_name: impl Into<String>,
        channel_name: impl Into<String>,
        url: impl Into<String>,
        backups: Vec<BackupStream>,
    ) -> Self {
        let playlist_id = playlist_id.into();
        let url = url.into();
        let fingerprint = Fingerprint::new(playlist_id.clone(), &url);
        let folder = format!("{}/{}", playlist_id, fingerprint.url_hash);
        Self {
            playlist_id,
            playlist_name: playlist_name.into(),
            channel_name: channel_name.into(),
            url,
            backups,
            fingerprint,
            folder,
            ready: AtomicBool::new(false),
            produced: AtomicU64::new(0),
            stop: CancellationToken::new(),
        }
    }

    /// True once the first segment has been completely written
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Flip the ready flag; returns whether this call did the flip
    pub fn mark_ready(&self) -> bool {
        !self.ready.swap(true, Ordering::AcqRel)
    }

    /// Cleared when the producer respawns onto a backup URL
    pub fn reset_ready(&self) {
        self.ready.store(false, Ordering::Release);
    }

    /// Number of segments the producer has completed
    pub fn produced_segments(&self) -> u64 {
        self.produced.load(Ordering::Acquire)
    }

    pub(crate) fn record_segment(&self) {
        self.produced.fetch_add(1, Ordering::AcqRel);
    }

    /// Ask the producer to stop; idempotent
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Token the producer selects on
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn has_backups(&self) -> bool {
        !self.backups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> StreamSession {
        StreamSession::new("M1", "IPTV", "News", "http://src/a.ts", Vec::new())
    }

    #[test]
    fn test_folder_is_playlist_scoped() {
        let session = session();

        assert!(session.folder.starts_with("M1/"));
        assert_eq!(session.folder, format!("M1/{}", session.fingerprint.url_hash));
    }

    #[test]
    fn test_ready_flips_once() {
        let session = session();

        assert!(!session.is_ready());
        assert!(session.mark_ready());
        assert!(session.is_ready());
        // Second flip reports it was already set
        assert!(!session.mark_ready());

        session.reset_ready();
        assert!(!session.is_ready());
        assert!(session.mark_ready());
    }

    #[test]
    fn test_stop_is_sticky() {
        let session = session();

        assert!(!session.stop_requested());
        session.stop();
        session.stop();
        assert!(session.stop_requested());
        assert!(session.stop_token().is_cancelled());
    }
}
