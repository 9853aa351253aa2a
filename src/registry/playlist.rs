//! Playlist registry
//!
//! Process-wide map from playlist id to its active sessions and client
//! slots. One lock serialises membership changes; per-session state
//! (ready flag, refcounts) lives in atomics and the connection tracker so
//! producers and readers never take this lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;

use crate::provider::{PlaylistKind, Provider, ProviderDirectory};
use crate::registry::clients::{ConnectionTracker, Fingerprint};
use crate::session::{BackupStream, StreamSession};
use crate::store::SegmentStore;

/// Errors from registry membership operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The playlist already runs as many sessions as it has tuners
    #[error("tuner limit reached for playlist {0}")]
    TunerBusy(String),
}

/// Everything needed to attach one client to one upstream URL
#[derive(Debug, Clone)]
pub struct AttachRequest {
    pub playlist_id: String,
    pub url: String,
    pub backups: Vec<BackupStream>,
    pub channel_name: String,
    pub client_ip: String,
    pub user_agent: String,
}

/// Result of a successful attach
#[derive(Debug)]
pub struct Attachment {
    pub session: Arc<StreamSession>,
    /// Provider record of the owning playlist, for producer configuration
    pub provider: Provider,
    pub client_id: usize,
    /// True when the caller must spawn the producer for this session
    pub is_new_session: bool,
}

struct ClientSlot {
    identity: String,
    connection: i64,
}

struct SessionSlot {
    session: Arc<StreamSession>,
    clients: HashMap<usize, ClientSlot>,
}

struct Playlist {
    provider: Provider,
    sessions: HashMap<String, SessionSlot>,
}

/// Registry of active playlists, sessions and clients
pub struct PlaylistRegistry {
    playlists: Mutex<HashMap<String, Playlist>>,
    providers: Arc<dyn ProviderDirectory>,
    tracker: Arc<ConnectionTracker>,
    store: Arc<dyn SegmentStore>,
}

impl PlaylistRegistry {
    pub fn new(
        providers: Arc<dyn ProviderDirectory>,
        tracker: Arc<ConnectionTracker>,
        store: Arc<dyn SegmentStore>,
    ) -> Self {
        Self {
            playlists: Mutex::new(HashMap::new()),
            providers,
            tracker,
            store,
        }
    }

    /// Attach a client to the session for `req.url`, creating the playlist
    /// and session as needed
    ///
    /// Fails with [`RegistryError::TunerBusy`] when the URL has no running
    /// session and the playlist is at its tuner cap; the caller may retry
    /// with a backup target.
    pub fn attach(&self, req: AttachRequest) -> Result<Attachment, RegistryError> {
        let identity = format!("{}-{}", req.client_ip, req.user_agent);
        let fp = Fingerprint::new(req.playlist_id.clone(), &req.url);

        let mut playlists = self.playlists.lock();
        let playlist = playlists.entry(req.playlist_id.clone()).or_insert_with(|| {
            let provider = self
                .providers
                .provider(&req.playlist_id)
                .unwrap_or_else(|| Provider::unknown(&req.playlist_id));
            tracing::info!(
                playlist = %provider.name,
                kind = ?PlaylistKind::from_id(&req.playlist_id),
                tuner = provider.tuner,
                "playlist activated"
            );
            Playlist {
                provider,
                sessions: HashMap::new(),
            }
        });

        if let Some(slot) = playlist.sessions.get_mut(&fp.url_hash) {
            let client_id = client_id_for(&slot.clients, &identity);
            let client = slot.clients.entry(client_id).or_insert_with(|| ClientSlot {
                identity,
                connection: 0,
            });
            client.connection += 1;
            let connections = self.tracker.attach(&fp);

            tracing::debug!(
                playlist = %playlist.provider.name,
                channel = %slot.session.channel_name,
                connections = connections,
                "restream: client joined a running session"
            );

            return Ok(Attachment {
                session: Arc::clone(&slot.session),
                provider: playlist.provider.clone(),
                client_id,
                is_new_session: false,
            });
        }

        if playlist.sessions.len() >= playlist.provider.tuner {
            return Err(RegistryError::TunerBusy(req.playlist_id));
        }

        let session = Arc::new(StreamSession::new(
            req.playlist_id,
            playlist.provider.name.clone(),
            req.channel_name,
            req.url,
            req.backups,
        ));
        if let Err(err) = self.store.mkdir_all(&session.playlist_id) {
            tracing::error!(error = %err, "could not create the playlist folder");
        }

        // First client of a fresh session always takes slot 0
        let client_id = 0;
        let mut clients = HashMap::new();
        clients.insert(
            client_id,
            ClientSlot {
                identity,
                connection: 1,
            },
        );
        self.tracker.attach(&fp);
        playlist.sessions.insert(
            fp.url_hash.clone(),
            SessionSlot {
                session: Arc::clone(&session),
                clients,
            },
        );

        tracing::info!(
            playlist = %playlist.provider.name,
            tuner = %format!("{} / {}", playlist.sessions.len(), playlist.provider.tuner),
            channel = %session.channel_name,
            "streaming"
        );

        Ok(Attachment {
            session,
            provider: playlist.provider.clone(),
            client_id,
            is_new_session: true,
        })
    }

    /// Detach one client; reap the session when nobody is left
    ///
    /// `force` removes the session regardless of remaining clients.
    /// Idempotent: detaching an already-removed client is a no-op.
    pub fn detach(&self, fp: &Fingerprint, client_id: usize, force: bool) {
        let mut playlists = self.playlists.lock();
        let Some(playlist) = playlists.get_mut(&fp.playlist_id) else {
            return;
        };
        let Some(slot) = playlist.sessions.get_mut(&fp.url_hash) else {
            return;
        };

        let remaining = if force {
            slot.clients.clear();
            0
        } else {
            match slot.clients.get_mut(&client_id) {
                Some(client) => {
                    client.connection = (client.connection - 1).max(0);
                    if client.connection == 0 {
                        slot.clients.remove(&client_id);
                    }
                }
                None => return,
            }
            self.tracker.detach(fp)
        };

        if remaining == 0 {
            let session = Arc::clone(&slot.session);
            playlist.sessions.remove(&fp.url_hash);
            self.tracker.remove(fp);

            // Stop the producer and wipe the segments; the producer never
            // deletes its own folder
            session.stop();
            if let Err(err) = self.store.remove_all(&session.folder) {
                tracing::error!(error = %err, folder = %session.folder, "segment cleanup failed");
            }

            tracing::info!(
                channel = %session.channel_name,
                "no client is using this channel anymore, closing the upstream connection"
            );
            tracing::info!(
                playlist = %playlist.provider.name,
                tuner = %format!("{} / {}", playlist.sessions.len(), playlist.provider.tuner),
                "streaming"
            );

            if playlist.sessions.is_empty() {
                playlists.remove(&fp.playlist_id);
            }
        } else {
            tracing::info!(
                channel = %slot.session.channel_name,
                clients = remaining,
                "streaming"
            );
        }
    }

    /// Remove client slots whose connection count dropped to zero or below
    ///
    /// Normal detach already removes them; this pass heals accounting drift
    /// left by crashed readers.
    pub fn sweep_stale_clients(&self) {
        let mut playlists = self.playlists.lock();
        for playlist in playlists.values_mut() {
            for slot in playlist.sessions.values_mut() {
                slot.clients.retain(|client_id, client| {
                    if client.connection <= 0 {
                        tracing::debug!(
                            playlist = %playlist.provider.id,
                            client_id = client_id,
                            identity = %client.identity,
                            "removing stale client slot"
                        );
                        false
                    } else {
                        true
                    }
                });
            }
        }
    }

    /// Total client connections across all playlists; sweeps first
    pub fn active_client_count(&self) -> usize {
        self.sweep_stale_clients();
        let playlists = self.playlists.lock();
        playlists
            .values()
            .flat_map(|playlist| playlist.sessions.values())
            .flat_map(|slot| slot.clients.values())
            .map(|client| client.connection.max(0) as usize)
            .sum()
    }

    /// Number of playlists with at least one session
    pub fn active_playlist_count(&self) -> usize {
        self.playlists.lock().len()
    }

    /// Sessions currently running for a playlist, and its tuner cap
    pub fn tuner_usage(&self, playlist_id: &str) -> Option<(usize, usize)> {
        let playlists = self.playlists.lock();
        playlists
            .get(playlist_id)
            .map(|playlist| (playlist.sessions.len(), playlist.provider.tuner))
    }

    /// Spawn the periodic stale-client sweep
    pub fn spawn_sweep_task(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                registry.sweep_stale_clients();
            }
        })
    }
}

/// Reuse the slot matching this identity, otherwise the smallest free id
fn client_id_for(clients: &HashMap<usize, ClientSlot>, identity: &str) -> usize {
    for (id, client) in clients {
        if client.identity == identity {
            return *id;
        }
    }
    (0..).find(|id| !clients.contains_key(id)).unwrap_or(0)
}
