pub mod auth;
pub mod rest;
pub mod ws;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use crate::broadcast::BroadcastSink;
use crate::status::StatusProvider;

/// Shared state handed to every axum route: a read-only status view plus a
/// handle to subscribe to the broadcast channel. Never a reference back into
/// the coordinator's mutable state.
#[derive(Clone)]
pub struct ApiState {
    pub status: Arc<dyn StatusProvider>,
    pub broadcast: Arc<dyn BroadcastSink>,
}

/// Bind and serve the dashboard HTTP surface until `shutdown` resolves.
pub async fn serve(
    bind_addr: &str,
    state: ApiState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = rest::router(state);
    let listener = TcpListener::bind(bind_addr).await?;
    info!(addr = bind_addr, "dashboard server listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(())
}
