//! HTTP server
//!
//! Binds the stream router and keeps serving until told otherwise.

pub mod reader;
pub mod router;

use std::net::SocketAddr;

pub use reader::ClientReader;
pub use router::{router, AppState};

use crate::error::Result;

/// Serve the stream endpoints on `addr`
///
/// Blocks until the listener fails. The sweep task is the caller's choice:
/// `registry.spawn_sweep_task(..)` on the state's registry.
pub async fn serve(addr: SocketAddr, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "stream server listening");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Serve until the shutdown future resolves
pub async fn serve_until<F>(addr: SocketAddr, state: AppState, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "stream server listening");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}
