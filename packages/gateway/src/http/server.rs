use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::context::AppContext;

use super::handlers;
use super::state::HttpState;

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/*path", get(handlers::render))
        .route("/", get(handlers::render))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn bind(addr: SocketAddr) -> std::io::Result<tokio::net::TcpListener> {
    tokio::net::TcpListener::bind(addr).await
}

/// Serves on an already-bound listener until `ctx` is killed. Binding is
/// split out from this function so the caller can map a bind failure to its
/// own exit code distinct from a mid-flight server error.
pub async fn serve_on(
    listener: tokio::net::TcpListener,
    state: HttpState,
    ctx: AppContext,
) -> std::io::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "listening");

    let mut kill = ctx.get_kill_receiver();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = kill.recv().await;
        })
        .await
}
