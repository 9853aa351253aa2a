//! Per-client segment delivery
//!
//! One reader runs per HTTP request. It waits for the session to become
//! ready, then ships completed segments in order into the response channel,
//! keeping a sliding window of delivered segments and deleting the oldest
//! as the window overflows. The reader owns its detach: whatever way the
//! loop exits, the registry sees exactly one detach for this client.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Settings;
use crate::registry::{ConnectionTracker, PlaylistRegistry};
use crate::session::{SessionError, StreamSession};
use crate::store::SegmentStore;

/// Why a reader stopped
#[derive(Debug)]
enum StopReason {
    /// Peer closed or the response body was dropped
    ClientGone,
    /// Producer posted a terminal error on the tracker
    Producer(SessionError),
    /// Session folder disappeared; the registry reaped the session
    Reaped,
    /// Session never became ready and there are no backups to wait for
    ReadyTimeout,
}

/// Segment shipper for one attached client
pub struct ClientReader {
    session: Arc<StreamSession>,
    client_id: usize,
    registry: Arc<PlaylistRegistry>,
    tracker: Arc<ConnectionTracker>,
    store: Arc<dyn SegmentStore>,
    settings: Arc<Settings>,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ClientReader {
    pub fn new(
        session: Arc<StreamSession>,
        client_id: usize,
        registry: Arc<PlaylistRegistry>,
        tracker: Arc<ConnectionTracker>,
        store: Arc<dyn SegmentStore>,
        settings: Arc<Settings>,
        tx: mpsc::UnboundedSender<Bytes>,
    ) -> Self {
        Self {
            session,
            client_id,
            registry,
            tracker,
            store,
            settings,
            tx,
        }
    }

    /// Run the reader on its own task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let fp = self.session.fingerprint.clone();
        let reason = self.deliver().await;

        match &reason {
            StopReason::ClientGone | StopReason::Reaped => {
                tracing::debug!(channel = %self.session.channel_name, ?reason, "client reader done");
            }
            StopReason::Producer(err) => {
                tracing::error!(channel = %self.session.channel_name, error = %err, "client reader closing after producer failure");
            }
            StopReason::ReadyTimeout => {
                tracing::warn!(channel = %self.session.channel_name, "stream never became ready");
            }
        }

        self.registry.detach(&fp, self.client_id, false);
    }

    async fn deliver(&self) -> StopReason {
        if let Some(reason) = self.wait_ready().await {
            return reason;
        }

        let folder = &self.session.folder;
        let mut cursor: u64 = 0;
        let mut window: VecDeque<u64> = VecDeque::new();

        loop {
            if self.tx.is_closed() {
                return StopReason::ClientGone;
            }
            if let Some(err) = self.tracker.sticky_error(&self.session.fingerprint) {
                return StopReason::Producer(err);
            }
            if let Err(err) = self.store.stat(folder) {
                if err.is_not_found() {
                    return StopReason::Reaped;
                }
            }

            let pending = match self.store.read_dir(folder) {
                Ok(entries) => pending_segments(&entries, cursor),
                Err(_) => return StopReason::Reaped,
            };

            if pending.is_empty() {
                tokio::time::sleep(self.settings.poll_interval).await;
                continue;
            }

            // Numbering restarts at 1 when the producer fails over
            if pending.first().is_some_and(|first| *first < cursor) {
                window.clear();
            }

            for n in pending {
                let data = match self.store.read(&format!("{folder}/{n}.ts")) {
                    Ok(data) => data,
                    // Another reader's window already deleted it
                    Err(err) if err.is_not_found() => continue,
                    Err(_) => return StopReason::Reaped,
                };
                if self.tx.send(data).is_err() {
                    return StopReason::ClientGone;
                }
                cursor = n;

                window.push_back(n);
                if window.len() > self.settings.segment_window {
                    if let Some(oldest) = window.pop_front() {
                        let _ = self.store.remove_all(&format!("{folder}/{oldest}.ts"));
                    }
                }
            }
        }
    }

    /// Poll until the first segment is complete
    ///
    /// A session without backups is abandoned after `poll_limit` polls; with
    /// backups the producer's own failover is given as long as it needs.
    async fn wait_ready(&self) -> Option<StopReason> {
        let mut polls = 0u32;
        while !self.session.is_ready() {
            if self.tx.is_closed() {
                return Some(StopReason::ClientGone);
            }
            if let Some(err) = self.tracker.sticky_error(&self.session.fingerprint) {
                return Some(StopReason::Producer(err));
            }
            polls += 1;
            if polls > self.settings.poll_limit && !self.session.has_backups() {
                return Some(StopReason::ReadyTimeout);
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
        None
    }
}

/// Numeric ids of completed segments newer than the cursor, in order
///
/// The newest entry is dropped: the producer is still appending to it.
/// When every remaining id is below the cursor the producer has restarted
/// numbering (backup failover) and the whole list is returned.
fn pending_segments(entries: &[String], cursor: u64) -> Vec<u64> {
    let mut ids: Vec<u64> = entries
        .iter()
        .filter_map(|entry| entry.strip_suffix(".ts")?.parse().ok())
        .collect();
    ids.sort_unstable();
    ids.pop();

    let Some(&max) = ids.last() else {
        return Vec::new();
    };
    if max < cursor {
        return ids;
    }
    ids.retain(|n| *n > cursor);
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn test_pending_drops_the_active_tail() {
        let pending = pending_segments(&entries(&["1.ts", "2.ts", "3.ts"]), 0);

        assert_eq!(pending, vec![1, 2]);
    }

    #[test]
    fn test_pending_skips_delivered_segments() {
        let pending = pending_segments(&entries(&["1.ts", "2.ts", "3.ts", "4.ts"]), 2);

        assert_eq!(pending, vec![3]);
    }

    #[test]
    fn test_pending_handles_unsorted_listings() {
        let pending = pending_segments(&entries(&["10.ts", "2.ts", "1.ts", "9.ts"]), 1);

        assert_eq!(pending, vec![2, 9]);
    }

    #[test]
    fn test_pending_ignores_foreign_entries() {
        let pending = pending_segments(&entries(&["1.ts", "junk", "2.txt", "3.ts"]), 0);

        assert_eq!(pending, vec![1]);
    }

    #[test]
    fn test_pending_empty_when_nothing_new() {
        assert!(pending_segments(&entries(&[]), 0).is_empty());
        assert!(pending_segments(&entries(&["5.ts"]), 0).is_empty());
        assert!(pending_segments(&entries(&["4.ts", "5.ts"]), 4).is_empty());
    }

    #[test]
    fn test_pending_detects_numbering_restart() {
        // Cursor was at 40, the producer failed over and restarted at 1
        let pending = pending_segments(&entries(&["1.ts", "2.ts", "3.ts"]), 40);

        assert_eq!(pending, vec![1, 2]);
    }
}
