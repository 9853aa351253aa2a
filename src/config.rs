//! Engine configuration

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;

use crate::store::StorageKind;

/// Configuration for the streaming buffer engine
///
/// Defaults match the values the engine has always shipped with: 1 MiB
/// buffer (segments roll at half of that), 500 ms client coalescing delay,
/// a 20 s startup deadline for the transcoder and a 100 ms delivery poll.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Buffer size in KiB; a segment is closed once it reaches half of this
    pub buffer_size_kb: usize,

    /// Delay before a client attaches, to coalesce near-simultaneous reconnects
    pub buffer_timeout: Duration,

    /// Path to the external transcoder binary
    pub transcoder_path: PathBuf,

    /// Transcoder argument template; the `[URL]` token is replaced with the
    /// upstream URL
    pub transcoder_options: String,

    /// User agent forwarded to the transcoder (`-user_agent`)
    pub user_agent: Option<String>,

    /// UDPxy relay host; `udp://@…` multicast URLs are rewritten through it
    pub udpxy: Option<String>,

    /// Rewrite upstream URLs to https
    pub force_https: bool,

    /// Port used when rewriting to https
    pub https_port: u16,

    /// How long the transcoder may take to fill its first segment
    pub startup_timeout: Duration,

    /// Client poll interval while waiting for segments
    pub poll_interval: Duration,

    /// Number of readiness polls before a client without backups gives up
    pub poll_limit: u32,

    /// How many delivered segments a client keeps before deleting the oldest
    pub segment_window: usize,

    /// Read chunk size for the transcoder's stdout
    pub chunk_size: usize,

    /// Clip served in a loop when all tuners are busy; `None` means plain 404
    pub limit_video: Option<Bytes>,

    /// Segment storage backend
    pub storage: StorageKind,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            buffer_size_kb: 1024,
            buffer_timeout: Duration::from_millis(500),
            transcoder_path: PathBuf::from("ffmpeg"),
            transcoder_options: "-i [URL]".to_string(),
            user_agent: None,
            udpxy: None,
            force_https: false,
            https_port: 443,
            startup_timeout: Duration::from_secs(20),
            poll_interval: Duration::from_millis(100),
            poll_limit: 200,
            segment_window: 20,
            chunk_size: 4096,
            limit_video: None,
            storage: StorageKind::Memory,
        }
    }
}

impl Settings {
    /// Segment rollover threshold in bytes
    pub fn segment_limit(&self) -> usize {
        self.buffer_size_kb * 1024 / 2
    }

    /// Set the buffer size in KiB
    pub fn buffer_size_kb(mut self, kb: usize) -> Self {
        self.buffer_size_kb = kb;
        self
    }

    /// Set the client coalescing delay
    pub fn buffer_timeout(mut self, timeout: Duration) -> Self {
        self.buffer_timeout = timeout;
        self
    }

    /// Set the transcoder binary
    pub fn transcoder_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.transcoder_path = path.into();
        self
    }

    /// Set the transcoder argument template
    pub fn transcoder_options(mut self, options: impl Into<String>) -> Self {
        self.transcoder_options = options.into();
        self
    }

    /// Set the forwarded user agent
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    /// Set the UDPxy relay host (`host:port`)
    pub fn udpxy(mut self, host: impl Into<String>) -> Self {
        self.udpxy = Some(host.into());
        self
    }

    /// Rewrite upstream URLs to https on the given port
    pub fn force_https(mut self, port: u16) -> Self {
        self.force_https = true;
        self.https_port = port;
        self
    }

    /// Set the transcoder startup deadline
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Set the delivery poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the segment retention window
    pub fn segment_window(mut self, window: usize) -> Self {
        self.segment_window = window;
        self
    }

    /// Serve this clip when all tuners are busy
    pub fn limit_video(mut self, clip: Bytes) -> Self {
        self.limit_video = Some(clip);
        self
    }

    /// Select the segment storage backend
    pub fn storage(mut self, kind: StorageKind) -> Self {
        self.storage = kind;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();

        assert_eq!(settings.buffer_size_kb, 1024);
        assert_eq!(settings.buffer_timeout, Duration::from_millis(500));
        assert_eq!(settings.transcoder_options, "-i [URL]");
        assert_eq!(settings.startup_timeout, Duration::from_secs(20));
        assert_eq!(settings.poll_interval, Duration::from_millis(100));
        assert_eq!(settings.poll_limit, 200);
        assert_eq!(settings.segment_window, 20);
        assert!(settings.limit_video.is_none());
    }

    #[test]
    fn test_segment_limit_is_half_the_buffer() {
        let settings = Settings::default().buffer_size_kb(2048);

        assert_eq!(settings.segment_limit(), 1024 * 1024);
    }

    #[test]
    fn test_builder_chaining() {
        let settings = Settings::default()
            .buffer_size_kb(512)
            .buffer_timeout(Duration::from_millis(0))
            .transcoder_path("/usr/bin/ffmpeg")
            .user_agent("VLC/3.0")
            .udpxy("10.0.0.1:4022")
            .force_https(8443)
            .segment_window(5);

        assert_eq!(settings.buffer_size_kb, 512);
        assert_eq!(settings.transcoder_path, PathBuf::from("/usr/bin/ffmpeg"));
        assert_eq!(settings.user_agent.as_deref(), Some("VLC/3.0"));
        assert_eq!(settings.udpxy.as_deref(), Some("10.0.0.1:4022"));
        assert!(settings.force_https);
        assert_eq!(settings.https_port, 8443);
        assert_eq!(settings.segment_window, 5);
    }
}
