//! HTTP surface for recording downloads
//!
//! Endpoints:
//! - `GET /health`           - liveness
//! - `GET /download/:token`  - stream a finished recording

use crate::audio::format::mime_type;
use crate::download::DownloadService;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tower::ServiceBuilder;
use tracing::{info, warn};

pub fn router(downloads: Arc<DownloadService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/download/:token", get(download))
        .layer(ServiceBuilder::new())
        .with_state(downloads)
}

/// Bind `addr` and serve until the task is dropped
pub async fn serve(addr: &str, app: Router) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Download server listening on http://{}", addr);
    info!("  GET  /health          - Health check");
    info!("  GET  /download/:token - Download a recording");
    axum::serve(listener, app).await
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn download(
    State(downloads): State<Arc<DownloadService>>,
    Path(token): Path<String>,
) -> Response {
    let Ok(resolved) = downloads.redeem(&token).await else {
        return not_found();
    };

    let file = match tokio::fs::File::open(&resolved.file_path).await {
        Ok(file) => file,
        Err(e) => {
            warn!("Failed to open {:?}: {}", resolved.file_path, e);
            return not_found();
        }
    };
    let length = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(e) => {
            warn!("Failed to stat {:?}: {}", resolved.file_path, e);
            return not_found();
        }
    };

    let filename = resolved
        .file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("recording_{}", resolved.recording_id));

    info!(
        "Serving recording {} ({} bytes)",
        resolved.recording_id, length
    );

    let headers = [
        (header::CONTENT_TYPE, mime_type(&resolved.file_path).to_string()),
        (header::CONTENT_LENGTH, length.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", filename),
        ),
    ];
    (headers, Body::from_stream(ReaderStream::new(file))).into_response()
}

/// Unknown, expired and rejected tokens all look like this
fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" }))).into_response()
}
