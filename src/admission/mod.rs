//! Admission: URL id resolution
//!
//! The EPG side publishes a JSON snapshot mapping opaque URL ids to channel
//! targets. Admission loads it lazily, rewrites upstream URLs (UDPxy relay,
//! forced https) and expands a target plus its backups into the ordered
//! candidate list the HTTP handler walks on `TunerBusy`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::session::BackupStream;

/// One entry of the persisted URL-id snapshot
///
/// Field names match the JSON the channel mapper writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamInfo {
    #[serde(rename = "channelNumber", default)]
    pub channel_number: String,
    pub name: String,
    #[serde(rename = "playlistID")]
    pub playlist_id: String,
    pub url: String,
    #[serde(rename = "backup_channel_1", default)]
    pub backup_channel_1: Option<BackupStream>,
    #[serde(rename = "backup_channel_2", default)]
    pub backup_channel_2: Option<BackupStream>,
    #[serde(rename = "backup_channel_3", default)]
    pub backup_channel_3: Option<BackupStream>,
    #[serde(rename = "urlID", default)]
    pub url_id: String,
}

impl StreamInfo {
    /// The configured backups, in order, skipping empty slots
    pub fn backups(&self) -> Vec<BackupStream> {
        [
            &self.backup_channel_1,
            &self.backup_channel_2,
            &self.backup_channel_3,
        ]
        .into_iter()
        .flatten()
        .cloned()
        .collect()
    }
}

/// One admission candidate the request handler may attach to
#[derive(Debug, Clone)]
pub struct StreamTarget {
    pub playlist_id: String,
    pub url: String,
    /// Backups left for the producer once this target is attached
    pub backups: Vec<BackupStream>,
    pub channel_name: String,
}

/// Resolver from opaque URL ids to upstream targets
pub struct Admission {
    settings: Arc<Settings>,
    snapshot: Option<PathBuf>,
    cache: RwLock<HashMap<String, StreamInfo>>,
}

impl Admission {
    /// `snapshot` is the JSON file the EPG subsystem maintains; `None` for
    /// embedders that prime the cache directly
    pub fn new(settings: Arc<Settings>, snapshot: Option<PathBuf>) -> Self {
        Self {
            settings,
            snapshot,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Register entries without going through the snapshot file
    pub fn prime(&self, infos: impl IntoIterator<Item = StreamInfo>) {
        let mut cache = self.cache.write();
        for info in infos {
            cache.insert(info.url_id.clone(), info);
        }
    }

    /// Resolve a URL id, applying upstream rewrites to the primary URL
    pub fn resolve(&self, url_id: &str) -> Result<StreamInfo> {
        self.ensure_loaded()?;

        let cache = self.cache.read();
        let mut info = cache
            .get(url_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(url_id.to_string()))?;
        drop(cache);

        info.url = info.url.trim_matches(['\r', '\n']).to_string();
        info.url = self.rewrite(info.url);
        Ok(info)
    }

    /// Expand a resolved target into the ordered list of attach candidates
    ///
    /// The primary comes first carrying every backup; each backup follows
    /// carrying whatever comes after it. The handler walks this list when a
    /// playlist's tuners are busy; nothing below admission re-resolves.
    pub fn candidates(&self, info: &StreamInfo) -> Vec<StreamTarget> {
        let backups = info.backups();
        let mut targets = vec![StreamTarget {
            playlist_id: info.playlist_id.clone(),
            url: info.url.clone(),
            backups: backups.clone(),
            channel_name: info.name.clone(),
        }];

        for (i, backup) in backups.iter().enumerate() {
            targets.push(StreamTarget {
                playlist_id: backup.playlist_id.clone(),
                url: backup.url.clone(),
                backups: backups[i + 1..].to_vec(),
                channel_name: info.name.clone(),
            });
        }

        targets
    }

    fn ensure_loaded(&self) -> Result<()> {
        if !self.cache.read().is_empty() {
            return Ok(());
        }
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let raw = std::fs::read(path).map_err(|err| Error::Snapshot(err.to_string()))?;
        let parsed: HashMap<String, StreamInfo> =
            serde_json::from_slice(&raw).map_err(|err| Error::Snapshot(err.to_string()))?;

        let mut cache = self.cache.write();
        if cache.is_empty() {
            *cache = parsed;
        }
        Ok(())
    }

    fn rewrite(&self, url: String) -> String {
        let url = match &self.settings.udpxy {
            Some(udpxy) => rewrite_udpxy(&url, udpxy).unwrap_or(url),
            None => url,
        };
        if self.settings.force_https {
            rewrite_https(&url, self.settings.https_port).unwrap_or(url)
        } else {
            url
        }
    }
}

/// Rewrite `udp://@239.0.0.1:1234` to `http://<udpxy>/udp/239.0.0.1:1234/`
fn rewrite_udpxy(url: &str, udpxy: &str) -> Option<String> {
    let multicast = url.strip_prefix("udp://@")?;
    Some(format!("http://{udpxy}/udp/{multicast}/"))
}

/// Force the scheme to https on the configured port
fn rewrite_https(url: &str, https_port: u16) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    let mut rewritten = format!("https://{}:{}{}", host, https_port, parsed.path());
    if let Some(query) = parsed.query() {
        rewritten.push('?');
        rewritten.push_str(query);
    }
    Some(rewritten)
}
