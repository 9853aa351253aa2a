//! Playlist and connection registry
//!
//! The registry decides who may stream what: it maps playlist ids to their
//! running sessions, enforces tuner caps, hands out dense client ids, and
//! reaps sessions when their last client leaves.
//!
//! ```text
//!                      Arc<PlaylistRegistry>
//!                 ┌────────────────────────────┐
//!                 │ playlists: Mutex<HashMap<  │
//!                 │   PlaylistID, Playlist {   │
//!                 │     provider, sessions     │
//!                 │   }>>                      │
//!                 └────────────┬───────────────┘
//!                              │ attach / detach
//!         ┌────────────────────┼────────────────────┐
//!         ▼                    ▼                    ▼
//!    [ClientReader]      [ClientReader]      [UpstreamProducer]
//!    refcount++          refcount++          refcount? sticky error?
//!         │                    │                    │
//!         └──────────┬─────────┘                    │
//!                    ▼                              ▼
//!           Arc<ConnectionTracker> ◄──── liveness + terminal errors
//! ```
//!
//! The single registry lock covers membership changes only; refcounts and
//! sticky errors live in the lock-free [`ConnectionTracker`] so producers
//! can poll them from their read loop without contending with attach.

pub mod clients;
pub mod playlist;

pub use clients::{ClientConnection, ConnectionTracker, Fingerprint};
pub use playlist::{AttachRequest, Attachment, PlaylistRegistry, RegistryError};
