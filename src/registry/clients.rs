//! Connection bookkeeping
//!
//! Tracks, per upstream session, how many client readers are attached and
//! whether the producer has failed terminally. Producers use the refcount
//! for their liveness check; readers poll the sticky error.

use dashmap::DashMap;

use crate::session::SessionError;

/// Key under which a session's refcount and sticky error live
///
/// The playlist id plus the md5 of the original upstream URL. Failover
/// replaces the URL a session streams from but never its fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub playlist_id: String,
    pub url_hash: String,
}

impl Fingerprint {
    pub fn new(playlist_id: impl Into<String>, url: &str) -> Self {
        Self {
            playlist_id: playlist_id.into(),
            url_hash: format!("{:x}", md5::compute(url.as_bytes())),
        }
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.playlist_id, self.url_hash)
    }
}

/// Refcount and sticky error for one session
#[derive(Debug, Clone, Default)]
pub struct ClientConnection {
    pub connection: u32,
    pub error: Option<SessionError>,
}

/// Concurrent map from fingerprint to [`ClientConnection`]
#[derive(Default)]
pub struct ConnectionTracker {
    entries: DashMap<Fingerprint, ClientConnection>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the refcount, creating the entry at 1 if absent
    pub fn attach(&self, fp: &Fingerprint) -> u32 {
        let mut entry = self.entries.entry(fp.clone()).or_default();
        entry.connection += 1;
        entry.connection
    }

    /// Decrement the refcount; the entry is deleted when it reaches zero
    ///
    /// Returns the remaining count. Calling detach more often than attach
    /// leaves the count at zero rather than wrapping.
    pub fn detach(&self, fp: &Fingerprint) -> u32 {
        let remaining = match self.entries.get_mut(fp) {
            Some(mut entry) => {
                entry.connection = entry.connection.saturating_sub(1);
                entry.connection
            }
            None => return 0,
        };
        if remaining == 0 {
            self.entries.remove(fp);
        }
        remaining
    }

    /// Current refcount; zero when no entry exists
    pub fn refcount(&self, fp: &Fingerprint) -> u32 {
        self.entries.get(fp).map_or(0, |entry| entry.connection)
    }

    /// Whether any client reader is attached
    pub fn is_attached(&self, fp: &Fingerprint) -> bool {
        self.refcount(fp) > 0
    }

    /// Record a terminal producer error, visible to readers until the
    /// session is reaped
    pub fn error(&self, fp: &Fingerprint, err: SessionError) {
        let mut entry = self.entries.entry(fp.clone()).or_default();
        entry.error = Some(err);
    }

    /// The sticky error, if the producer posted one
    pub fn sticky_error(&self, fp: &Fingerprint) -> Option<SessionError> {
        self.entries.get(fp).and_then(|entry| entry.error.clone())
    }

    /// Drop the entry unconditionally (registry teardown)
    pub fn remove(&self, fp: &Fingerprint) {
        self.entries.remove(fp);
    }
}
