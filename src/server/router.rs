//! HTTP surface
//!
//! `GET /stream/:url_id` resolves the id through admission, attaches the
//! client to a session (walking backup candidates when tuners are busy),
//! and streams segments until the client hangs up or the producer dies.
//! `HEAD /stream/:url_id` is answered by mirroring an upstream HEAD.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{on, MethodFilter};
use axum::Router;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use crate::admission::Admission;
use crate::config::Settings;
use crate::provider::ProviderDirectory;
use crate::registry::{AttachRequest, ConnectionTracker, PlaylistRegistry, RegistryError};
use crate::server::reader::ClientReader;
use crate::session::UpstreamProducer;
use crate::store::{open_store, SegmentStore};

/// Shared engine context carried into every request handler
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn SegmentStore>,
    pub tracker: Arc<ConnectionTracker>,
    pub registry: Arc<PlaylistRegistry>,
    pub admission: Arc<Admission>,
}

impl AppState {
    /// Wire up the engine: store per the configured backend, tracker,
    /// registry and admission reading `snapshot` lazily
    pub fn new(
        settings: Settings,
        providers: Arc<dyn ProviderDirectory>,
        snapshot: Option<PathBuf>,
    ) -> Self {
        let settings = Arc::new(settings);
        let store = open_store(settings.storage);
        let tracker = Arc::new(ConnectionTracker::new());
        let registry = Arc::new(PlaylistRegistry::new(
            providers,
            Arc::clone(&tracker),
            Arc::clone(&store),
        ));
        let admission = Arc::new(Admission::new(Arc::clone(&settings), snapshot));
        Self {
            settings,
            store,
            tracker,
            registry,
            admission,
        }
    }
}

/// Build the stream router
///
/// HEAD gets its own handler (the upstream mirror), so GET is registered
/// alone instead of through `get()`, which would claim HEAD as well.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/stream/:url_id",
            on(MethodFilter::GET, stream).on(MethodFilter::HEAD, stream_head),
        )
        .with_state(state)
}

async fn stream(
    Path(url_id): Path<String>,
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Response {
    let info = match state.admission.resolve(&url_id) {
        Ok(info) => info,
        Err(err) => {
            tracing::error!(url_id = %url_id, error = %err, "stream resolution failed");
            return not_found();
        }
    };

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    tracing::info!(channel = %info.name, user_agent = %user_agent, "stream requested");

    // Let a reconnecting player settle before counting it
    tokio::time::sleep(state.settings.buffer_timeout).await;

    let client_ip = client_ip(&headers, connect);
    let mut attachment = None;
    for target in state.admission.candidates(&info) {
        match state.registry.attach(AttachRequest {
            playlist_id: target.playlist_id,
            url: target.url,
            backups: target.backups,
            channel_name: target.channel_name,
            client_ip: client_ip.clone(),
            user_agent: user_agent.clone(),
        }) {
            Ok(result) => {
                attachment = Some(result);
                break;
            }
            Err(RegistryError::TunerBusy(playlist_id)) => {
                tracing::warn!(
                    playlist = %playlist_id,
                    channel = %info.name,
                    "tuner limit reached, trying the next candidate"
                );
            }
        }
    }
    let Some(attachment) = attachment else {
        return match limit_clip_response(&state) {
            Some(response) => response,
            None => not_found(),
        };
    };

    if attachment.is_new_session {
        UpstreamProducer::new(
            Arc::clone(&attachment.session),
            attachment.provider.clone(),
            Arc::clone(&state.settings),
            Arc::clone(&state.store),
            Arc::clone(&state.tracker),
        )
        .spawn();
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    ClientReader::new(
        Arc::clone(&attachment.session),
        attachment.client_id,
        Arc::clone(&state.registry),
        Arc::clone(&state.tracker),
        Arc::clone(&state.store),
        Arc::clone(&state.settings),
        tx,
    )
    .spawn();

    // The first segment decides the content type; if the reader gives up
    // before producing one it has already detached itself
    let Some(first) = rx.recv().await else {
        return not_found();
    };
    let content_type = detect_content_type(&first);

    let body = Body::from_stream(
        tokio_stream::once(Ok::<_, std::io::Error>(first))
            .chain(UnboundedReceiverStream::new(rx).map(Ok)),
    );
    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONNECTION, "close")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(header::CONTENT_TYPE, content_type)
        .body(body)
    {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(error = %err, "response assembly failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Mirror an upstream HEAD: same status, same headers, empty body
async fn stream_head(Path(url_id): Path<String>, State(state): State<AppState>) -> Response {
    let info = match state.admission.resolve(&url_id) {
        Ok(info) => info,
        Err(err) => {
            tracing::error!(url_id = %url_id, error = %err, "stream resolution failed");
            return not_found();
        }
    };

    let upstream = match reqwest::Client::new().head(&info.url).send().await {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(url = %info.url, error = %err, "upstream HEAD failed");
            return StatusCode::METHOD_NOT_ALLOWED.into_response();
        }
    };

    let mut builder = Response::builder().status(upstream.status().as_u16());
    for (name, value) in upstream.headers() {
        if matches!(
            name.as_str(),
            "connection" | "transfer-encoding" | "content-encoding"
        ) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    builder
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::METHOD_NOT_ALLOWED.into_response())
}

/// All tuners busy and no backup left: loop the configured clip for at
/// most 30 seconds, or plain 404 when none is configured
fn limit_clip_response(state: &AppState) -> Option<Response> {
    let clip = state.settings.limit_video.clone()?;
    let content_type = detect_content_type(&clip);

    let (tx, rx) = mpsc::unbounded_channel::<Result<Bytes, std::io::Error>>();
    tokio::spawn(async move {
        for _ in 0..30 {
            if tx.send(Ok(clip.clone())).is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONNECTION, "close")
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from_stream(UnboundedReceiverStream::new(rx)))
        .ok()
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "404 Not Found").into_response()
}

/// Client address for the attachment identity: proxy headers first, then
/// the socket peer
fn client_ip(headers: &HeaderMap, connect: Option<ConnectInfo<SocketAddr>>) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
    {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    connect
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Sniff the content type from the first delivered bytes
fn detect_content_type(data: &[u8]) -> &'static str {
    const TS_SYNC: u8 = 0x47;
    const TS_PACKET: usize = 188;

    if data.first() == Some(&TS_SYNC)
        && (data.len() <= TS_PACKET || data[TS_PACKET] == TS_SYNC)
    {
        return "video/mp2t";
    }
    if data.len() >= 8 && &data[4..8] == b"ftyp" {
        return "video/mp4";
    }
    if data.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return "video/webm";
    }
    "application/octet-stream"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_mpeg_ts() {
        let mut packet = vec![0u8; 376];
        packet[0] = 0x47;
        packet[188] = 0x47;

        assert_eq!(detect_content_type(&packet), "video/mp2t");
    }

    #[test]
    fn test_detect_mp4_and_webm() {
        let mp4 = b"\x00\x00\x00\x20ftypisom";
        let webm = [0x1A, 0x45, 0xDF, 0xA3, 0x00];

        assert_eq!(detect_content_type(mp4), "video/mp4");
        assert_eq!(detect_content_type(&webm), "video/webm");
    }

    #[test]
    fn test_detect_falls_back_to_octet_stream() {
        assert_eq!(detect_content_type(b"hello"), "application/octet-stream");
        assert_eq!(detect_content_type(&[]), "application/octet-stream");
    }

    #[test]
    fn test_client_ip_prefers_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.0.0.1, 10.0.0.2".parse().unwrap());
        headers.insert("x-real-ip", "10.0.0.3".parse().unwrap());
        let connect = Some(ConnectInfo("10.0.0.4:1234".parse().unwrap()));

        assert_eq!(client_ip(&headers, connect), "10.0.0.1");
    }

    #[test]
    fn test_client_ip_falls_back_in_order() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "10.0.0.3".parse().unwrap());
        let connect = Some(ConnectInfo("10.0.0.4:1234".parse().unwrap()));

        assert_eq!(client_ip(&headers, connect.clone()), "10.0.0.3");
        assert_eq!(client_ip(&HeaderMap::new(), connect), "10.0.0.4");
        assert_eq!(client_ip(&HeaderMap::new(), None), "unknown");
    }
}
