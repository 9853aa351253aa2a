#![forbid(unsafe_code)]

//! # restream
//!
//! Streaming buffer and fan-out engine for an IPTV proxy: every distinct
//! upstream URL gets exactly one transcoder subprocess whose output is
//! rolled into fixed-size `.ts` segments, and every HTTP client watching
//! that URL is fed those segments from the shared buffer. Playlists cap how
//! many upstream sessions may run at once; backup URLs take over when a
//! primary dies.
//!
//! ```text
//!  GET /stream/<id> ──► Admission ──► PlaylistRegistry.attach
//!                                          │
//!                       new session? ──► UpstreamProducer ──► transcoder
//!                                          │                     │ stdout
//!                                          ▼                     ▼
//!                                   ConnectionTracker      SegmentStore
//!                                          ▲                     │
//!                                          │ refcount            │ <N>.ts
//!                                    ClientReader ◄──────────────┘
//!                                          │
//!                                          ▼
//!                                   HTTP response body
//! ```
//!
//! The pieces compose through [`server::AppState`]; embedders that bring
//! their own HTTP stack can use the registry, producer and reader directly.

pub mod admission;
pub mod config;
pub mod error;
pub mod provider;
pub mod registry;
pub mod server;
pub mod session;
pub mod store;

pub use admission::{Admission, StreamInfo, StreamTarget};
pub use config::Settings;
pub use error::{Error, Result};
pub use provider::{HttpProxy, PlaylistKind, Provider, ProviderDirectory, StaticProviders};
pub use registry::{
    AttachRequest, Attachment, ConnectionTracker, Fingerprint, PlaylistRegistry, RegistryError,
};
pub use server::{serve, serve_until, AppState, ClientReader};
pub use session::{BackupStream, SessionError, StreamSession, UpstreamProducer};
pub use store::{open_store, DiskStore, MemoryStore, SegmentStore, StorageKind, StoreError};
