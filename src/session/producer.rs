//! Upstream producer task
//!
//! One producer runs per distinct upstream URL. It spawns the transcoder,
//! drains stderr into the log, rolls stdout into numbered segments, and
//! walks the backup list when the upstream fails. The producer never
//! deletes its own folder; the registry does that when the last client
//! detaches, and the producer notices through the refcount or its stop
//! token.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::task::JoinHandle;

use crate::config::Settings;
use crate::provider::Provider;
use crate::registry::ConnectionTracker;
use crate::session::{command, SessionError, StreamSession};
use crate::store::{SegmentStore, SegmentWrite};

/// How one streaming episode ended
enum Outcome {
    /// Clean exit: stop requested or no clients left
    Finished,
    /// Upstream or storage failure; `run` decides whether a backup rescues it
    Failed(SessionError),
}

/// Producer for one upstream session
pub struct UpstreamProducer {
    session: Arc<StreamSession>,
    provider: Provider,
    settings: Arc<Settings>,
    store: Arc<dyn SegmentStore>,
    tracker: Arc<ConnectionTracker>,
}

impl UpstreamProducer {
    pub fn new(
        session: Arc<StreamSession>,
        provider: Provider,
        settings: Arc<Settings>,
        store: Arc<dyn SegmentStore>,
        tracker: Arc<ConnectionTracker>,
    ) -> Self {
        Self {
            session,
            provider,
            settings,
            store,
            tracker,
        }
    }

    /// Run the producer on its own task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let fp = self.session.fingerprint.clone();
        let backups = self.session.backups.clone();
        let mut attempt = 0usize;

        loop {
            let url = if attempt == 0 {
                self.session.url.clone()
            } else {
                tracing::warn!(
                    channel = %self.session.channel_name,
                    "START OF BACKUP {} STREAM",
                    attempt
                );
                backups[attempt - 1].url.clone()
            };

            tracing::info!(
                channel = %self.session.channel_name,
                url = %url,
                "streaming from upstream"
            );

            match self.stream_once(&url).await {
                Outcome::Finished => break,
                Outcome::Failed(err) => {
                    if !self.tracker.is_attached(&fp) {
                        // Nobody is waiting for this stream anymore
                        tracing::debug!(channel = %self.session.channel_name, error = %err,
                            "upstream failed with no clients attached");
                        break;
                    }
                    // Storage failures are terminal; a backup URL streams
                    // into the same broken store
                    if !matches!(err, SessionError::Storage(_)) && attempt < backups.len() {
                        attempt += 1;
                        continue;
                    }
                    tracing::error!(
                        channel = %self.session.channel_name,
                        error = %err,
                        "upstream session failed terminally"
                    );
                    self.tracker.error(&fp, err);
                    break;
                }
            }
        }
    }

    /// One streaming episode against a single URL
    async fn stream_once(&self, url: &str) -> Outcome {
        self.session.reset_ready();

        if let Err(err) = self.prepare_folder() {
            return Outcome::Failed(SessionError::Storage(err.to_string()));
        }

        let mut cmd = command::transcoder_command(&self.settings, &self.provider, url);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => return Outcome::Failed(SessionError::Start(err.to_string())),
        };

        let Some(stdout) = child.stdout.take() else {
            shutdown(&mut child).await;
            return Outcome::Failed(SessionError::Start("stdout pipe missing".to_string()));
        };
        let log_pump = child.stderr.take().map(|stderr| self.spawn_log_pump(stderr));

        let outcome = self.pump_segments(stdout).await;

        shutdown(&mut child).await;
        if let Some(pump) = log_pump {
            // Pump ends at stderr EOF once the subprocess is gone
            let _ = pump.await;
        }
        outcome
    }

    /// Wipe any previous incarnation's folder and touch the first segment
    fn prepare_folder(&self) -> crate::store::StoreResult<()> {
        let folder = &self.session.folder;
        self.store.remove_all(folder)?;
        self.store.mkdir_all(folder)?;
        self.store.create(&segment_path(folder, 1))?;
        Ok(())
    }

    fn spawn_log_pump(&self, stderr: ChildStderr) -> JoinHandle<()> {
        let session = Arc::clone(&self.session);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if session.is_ready() {
                    tracing::debug!(channel = %session.channel_name, "transcoder: {}", line);
                } else {
                    tracing::info!(channel = %session.channel_name, "transcoder: {}", line);
                }
            }
        })
    }

    /// Read stdout in chunks and roll segments until the stream ends
    async fn pump_segments(&self, mut stdout: ChildStdout) -> Outcome {
        let session = &self.session;
        let fp = &session.fingerprint;
        let limit = self.settings.segment_limit();
        let stop = session.stop_token();

        let mut segment: u64 = 1;
        let mut writer = match self.open_segment(segment) {
            Ok(writer) => writer,
            Err(outcome) => return outcome,
        };
        let mut written = 0usize;
        let mut first_done = false;
        let mut chunk = vec![0u8; self.settings.chunk_size];

        let startup_deadline = tokio::time::sleep(self.settings.startup_timeout);
        tokio::pin!(startup_deadline);

        loop {
            tokio::select! {
                _ = stop.cancelled() => return Outcome::Finished,

                _ = &mut startup_deadline, if !first_done => {
                    tracing::warn!(
                        channel = %session.channel_name,
                        "no first segment within {:?}, killing the transcoder",
                        self.settings.startup_timeout
                    );
                    return Outcome::Failed(SessionError::StartupTimeout);
                }

                read = stdout.read(&mut chunk) => {
                    let n = match read {
                        Ok(0) => {
                            return Outcome::Failed(SessionError::Read(
                                "unexpected end of stream".to_string(),
                            ));
                        }
                        Ok(n) => n,
                        Err(err) => return Outcome::Failed(SessionError::Read(err.to_string())),
                    };

                    if !self.tracker.is_attached(fp) {
                        tracing::debug!(
                            channel = %session.channel_name,
                            "no clients left, stopping the transcoder"
                        );
                        return Outcome::Finished;
                    }

                    if let Err(err) = writer.append(&chunk[..n]) {
                        return self.storage_outcome(err);
                    }
                    written += n;

                    if written >= limit {
                        session.record_segment();
                        if !first_done {
                            first_done = true;
                            session.mark_ready();
                            tracing::info!(
                                channel = %session.channel_name,
                                "buffering data from the transcoder"
                            );
                        }
                        segment += 1;
                        writer = match self.open_segment(segment) {
                            Ok(writer) => writer,
                            Err(outcome) => return outcome,
                        };
                        written = 0;
                    }
                }
            }
        }
    }

    /// Create segment `n` and open it for appending
    fn open_segment(&self, n: u64) -> Result<Box<dyn SegmentWrite>, Outcome> {
        let path = segment_path(&self.session.folder, n);
        self.store
            .create(&path)
            .and_then(|()| self.store.open_append(&path))
            .map_err(|err| self.storage_outcome(err))
    }

    /// A storage error after the registry reaped the folder is a clean stop
    fn storage_outcome(&self, err: crate::store::StoreError) -> Outcome {
        if err.is_not_found()
            && (self.session.stop_requested()
                || !self.tracker.is_attached(&self.session.fingerprint))
        {
            Outcome::Finished
        } else {
            Outcome::Failed(SessionError::Storage(err.to_string()))
        }
    }
}

fn segment_path(folder: &str, n: u64) -> String {
    format!("{folder}/{n}.ts")
}

async fn shutdown(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::store::MemoryStore;

    /// Settings that run `/bin/sh` as the transcoder; the "URL" is a shell
    /// command emitting the stream on stdout.
    fn shell_settings() -> Arc<Settings> {
        Arc::new(
            Settings::default()
                .transcoder_path("/bin/sh")
                .transcoder_options("-c [URL]")
                // 8 KiB buffer: segments roll every 4 KiB
                .buffer_size_kb(8)
                .startup_timeout(Duration::from_secs(5)),
        )
    }

    fn producer_for(url: &str, backups: Vec<crate::session::BackupStream>) -> (UpstreamProducer, Arc<StreamSession>, Arc<ConnectionTracker>, Arc<MemoryStore>) {
        let session = Arc::new(StreamSession::new("M1", "IPTV", "News", url, backups));
        let store = Arc::new(MemoryStore::new());
        let tracker = Arc::new(ConnectionTracker::new());
        let producer = UpstreamProducer::new(
            Arc::clone(&session),
            Provider::unknown("M1"),
            shell_settings(),
            store.clone(),
            Arc::clone(&tracker),
        );
        (producer, session, tracker, store)
    }

    #[tokio::test]
    async fn test_produces_segments_and_flips_ready() {
        let (producer, session, tracker, store) =
            producer_for("head -c 20000 /dev/zero; sleep 5", Vec::new());
        tracker.attach(&session.fingerprint);

        let handle = producer.spawn();

        // 20000 bytes at a 4096-byte segment limit: four full segments
        for _ in 0..100 {
            if session.produced_segments() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(session.is_ready());
        assert!(session.produced_segments() >= 2);
        assert!(store.stat(&format!("{}/1.ts", session.folder)).is_ok());

        session.stop();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("producer should exit after stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_startup_timeout_posts_sticky_error() {
        let session = Arc::new(StreamSession::new("M1", "IPTV", "News", "sleep 30", Vec::new()));
        let store = Arc::new(MemoryStore::new());
        let tracker = Arc::new(ConnectionTracker::new());
        let settings = Arc::new(
            Settings::default()
                .transcoder_path("/bin/sh")
                .transcoder_options("-c [URL]")
                .startup_timeout(Duration::from_millis(300)),
        );
        tracker.attach(&session.fingerprint);

        let producer = UpstreamProducer::new(
            Arc::clone(&session),
            Provider::unknown("M1"),
            settings,
            store,
            Arc::clone(&tracker),
        );
        tokio::time::timeout(Duration::from_secs(5), producer.spawn())
            .await
            .expect("producer should give up quickly")
            .unwrap();

        assert!(matches!(
            tracker.sticky_error(&session.fingerprint),
            Some(SessionError::StartupTimeout)
        ));
        assert!(!session.is_ready());
    }

    #[tokio::test]
    async fn test_backup_rescues_dead_primary() {
        let backups = vec![crate::session::BackupStream {
            playlist_id: "M1".to_string(),
            url: "head -c 20000 /dev/zero; sleep 5".to_string(),
        }];
        // Primary exits immediately without emitting anything
        let (producer, session, tracker, _store) = producer_for("true", backups);
        tracker.attach(&session.fingerprint);

        let handle = producer.spawn();

        for _ in 0..100 {
            if session.is_ready() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(session.is_ready(), "backup should have taken over");
        assert!(tracker.sticky_error(&session.fingerprint).is_none());

        session.stop();
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }

    #[tokio::test]
    async fn test_exhausted_backups_fail_sticky() {
        let backups = vec![crate::session::BackupStream {
            playlist_id: "M1".to_string(),
            url: "true".to_string(),
        }];
        let (producer, session, tracker, _store) = producer_for("true", backups);
        tracker.attach(&session.fingerprint);

        tokio::time::timeout(Duration::from_secs(10), producer.spawn())
            .await
            .expect("producer should exit after exhausting backups")
            .unwrap();

        assert!(matches!(
            tracker.sticky_error(&session.fingerprint),
            Some(SessionError::Read(_))
        ));
    }

    #[tokio::test]
    async fn test_no_clients_means_clean_exit() {
        // Nothing ever attached: first liveness check stops the producer
        let (producer, session, tracker, _store) =
            producer_for("head -c 20000 /dev/zero; sleep 5", Vec::new());

        tokio::time::timeout(Duration::from_secs(5), producer.spawn())
            .await
            .expect("producer should stop without clients")
            .unwrap();

        assert!(tracker.sticky_error(&session.fingerprint).is_none());
    }

    #[tokio::test]
    async fn test_missing_binary_is_sticky_start_error() {
        let session = Arc::new(StreamSession::new("M1", "IPTV", "News", "u", Vec::new()));
        let store = Arc::new(MemoryStore::new());
        let tracker = Arc::new(ConnectionTracker::new());
        let settings = Arc::new(Settings::default().transcoder_path("/nonexistent/transcoder"));
        tracker.attach(&session.fingerprint);

        let producer = UpstreamProducer::new(
            Arc::clone(&session),
            Provider::unknown("M1"),
            settings,
            store,
            Arc::clone(&tracker),
        );
        tokio::time::timeout(Duration::from_secs(5), producer.spawn())
            .await
            .expect("spawn failure should be immediate")
            .unwrap();

        assert!(matches!(
            tracker.sticky_error(&session.fingerprint),
            Some(SessionError::Start(_))
        ));
    }
}
