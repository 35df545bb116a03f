//! HTTP server implementation using Axum.

use crate::handler::{handle_health, handle_status, handle_test_stop};
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use swarmkeep::{Coordinator, TcpCoordinatorHandle};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Application state shared across handlers.
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    /// Worker-facing listener, for connection counts
    pub transport: Arc<TcpCoordinatorHandle>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/test-stop", post(handle_test_stop))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the status server.
///
/// Returns the actual address the server is bound to (useful when port=0).
pub async fn start_server(
    coordinator: Arc<Coordinator>,
    transport: Arc<TcpCoordinatorHandle>,
    host: &str,
    port: u16,
) -> anyhow::Result<SocketAddr> {
    let app = router(Arc::new(AppState {
        coordinator,
        transport,
    }));

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Status server listening on {}", actual_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("status server error: {}", e);
        }
    });

    Ok(actual_addr)
}
