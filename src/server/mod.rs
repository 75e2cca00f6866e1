pub mod handlers;

use crate::engine::Engine;
use crate::error::Result;
use axum::Router;
use axum::routing::{get, post};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route(
            "/api/v1/{config}/{cluster}/resources/{kind}",
            get(handlers::list_resources),
        )
        .route(
            "/api/v1/{config}/{cluster}/resources/{kind}/{name}",
            get(handlers::get_resource),
        )
        .route(
            "/api/v1/{config}/{cluster}/helm/releases",
            get(handlers::helm_releases),
        )
        .route(
            "/api/v1/configs/{config}/invalidate",
            post(handlers::invalidate_config),
        )
        .route("/debug/stats", get(handlers::stats))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

/// Serve until Ctrl-C or SIGTERM, then close every stream
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or the server fails
pub async fn serve(engine: Arc<Engine>, listen: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!("🌐 Listening on {}", listener.local_addr()?);

    let draining = engine.clone();
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            draining.shutdown();
        })
        .await?;

    info!("👋 Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("🛑 Ctrl+C received"),
        () = terminate => info!("🛑 SIGTERM received"),
    }
}
