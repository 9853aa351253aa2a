//! Playlist provider metadata
//!
//! The registry needs a handful of per-playlist parameters (display name,
//! tuner cap, optional proxy and headers to forward upstream). They are
//! resolved once, when a playlist is first attached, through a
//! [`ProviderDirectory`].

use std::collections::HashMap;

use parking_lot::RwLock;

/// Kind of upstream catalog a playlist came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistKind {
    M3u,
    Hdhr,
    Unknown,
}

impl PlaylistKind {
    /// Derived from the playlist id's conventional first character
    pub fn from_id(playlist_id: &str) -> Self {
        match playlist_id.chars().next() {
            Some('M') => PlaylistKind::M3u,
            Some('H') => PlaylistKind::Hdhr,
            _ => PlaylistKind::Unknown,
        }
    }
}

/// HTTP proxy endpoint forwarded to the transcoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpProxy {
    pub ip: String,
    pub port: String,
}

/// Per-playlist parameters, typed
#[derive(Debug, Clone)]
pub struct Provider {
    /// Playlist id (`M…` or `H…`)
    pub id: String,
    /// Display name for logs
    pub name: String,
    /// Maximum concurrent upstream sessions
    pub tuner: usize,
    pub http_proxy: Option<HttpProxy>,
    /// `Origin` header forwarded upstream
    pub origin: Option<String>,
    /// `Referer` header forwarded upstream
    pub referer: Option<String>,
}

impl Provider {
    /// Fallback record when a playlist id is unknown to the directory
    pub fn unknown(playlist_id: &str) -> Self {
        Self {
            id: playlist_id.to_string(),
            name: playlist_id.to_string(),
            tuner: 1,
            http_proxy: None,
            origin: None,
            referer: None,
        }
    }
}

/// Source of provider records, keyed by playlist id
pub trait ProviderDirectory: Send + Sync {
    fn provider(&self, playlist_id: &str) -> Option<Provider>;
}

/// Directory backed by a plain map; enough for embedding and tests
#[derive(Default)]
pub struct StaticProviders {
    providers: RwLock<HashMap<String, Provider>>,
}

impl StaticProviders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a provider record
    pub fn insert(&self, provider: Provider) {
        self.providers
            .write()
            .insert(provider.id.clone(), provider);
    }
}

impl ProviderDirectory for StaticProviders {
    fn provider(&self, playlist_id: &str) -> Option<Provider> {
        self.providers.read().get(playlist_id).cloned()
    }
}
