//! Read-only HTTP API over the pipeline's metrics exporters.

use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;

use crate::metrics::Exporter;

pub type ApiError = Box<dyn std::error::Error + Send + Sync>;

/// `/health` plus one GET route per exporter, at the exporter's endpoint.
pub fn router(exporters: Vec<Arc<dyn Exporter>>) -> Router {
    let mut app = Router::new().route("/health", get(health));
    for exporter in exporters {
        let endpoint = exporter.endpoint();
        app = app.route(endpoint, get(move || export(Arc::clone(&exporter))));
    }
    app.layer(CorsLayer::permissive())
}

pub async fn serve(
    address: &str,
    exporters: Vec<Arc<dyn Exporter>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ApiError> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!("api listening on {local_addr}");

    axum::serve(listener, router(exporters))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    tracing::debug!("api stopped");
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true}))
}

async fn export(exporter: Arc<dyn Exporter>) -> (StatusCode, Json<serde_json::Value>) {
    match exporter.export() {
        Ok(value) => (StatusCode::OK, Json(value)),
        Err(e) => {
            tracing::warn!(endpoint = exporter.endpoint(), error = %e, "export failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
        }
    }
}
