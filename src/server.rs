//! Web server for previewing rectified frames

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use image::RgbImage;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::pipeline::ProcessedFrame;
use crate::worker::{StatsSnapshot, WorkerStats};

const PREVIEW_QUALITY: u8 = 70;

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>keystone-cam</title>
<style>
body { background: #111; color: #ddd; font-family: sans-serif; margin: 1em; }
.views { display: flex; gap: 1em; flex-wrap: wrap; }
img { max-width: 48vw; border: 1px solid #333; }
pre { background: #1a1a1a; padding: 0.5em; }
</style>
</head>
<body>
<h1>keystone-cam</h1>
<div class="views">
  <img id="rectified" src="/api/preview/stream" alt="rectified">
  <img id="blurred" alt="blurred">
</div>
<pre id="info"></pre>
<script>
setInterval(() => {
  document.getElementById('blurred').src = '/api/preview/blur?t=' + Date.now();
  fetch('/api/info').then(r => r.json()).then(i => {
    document.getElementById('info').textContent = JSON.stringify(i, null, 2);
  });
}, 1000);
</script>
</body>
</html>
"#;

/// Shared state between the presenter and the HTTP handlers
pub struct AppState {
    config: Config,
    stats: Arc<WorkerStats>,
    /// Latest rectified frame (JPEG encoded)
    preview_frame: RwLock<Vec<u8>>,
    /// Latest blurred frame (JPEG encoded)
    blur_frame: RwLock<Vec<u8>>,
    latest: RwLock<Option<LatestFrame>>,
}

#[derive(Debug, Clone, Copy, Serialize)]
struct LatestFrame {
    sequence: u64,
    width: u32,
    height: u32,
    total_us: u64,
}

impl AppState {
    pub fn new(config: Config, stats: Arc<WorkerStats>) -> Self {
        Self {
            config,
            stats,
            preview_frame: RwLock::new(Vec::new()),
            blur_frame: RwLock::new(Vec::new()),
            latest: RwLock::new(None),
        }
    }

    /// Publish a processed frame (called from the presenter thread)
    pub fn update_preview(&self, frame: &ProcessedFrame) {
        match encode_jpeg(&frame.rectified, PREVIEW_QUALITY) {
            Ok(jpeg) => *self.preview_frame.write() = jpeg,
            Err(e) => tracing::debug!("Preview encode failed: {}", e),
        }
        if let Some(blurred) = &frame.blurred {
            if let Ok(jpeg) = encode_jpeg(blurred, PREVIEW_QUALITY) {
                *self.blur_frame.write() = jpeg;
            }
        }
        *self.latest.write() = Some(LatestFrame {
            sequence: frame.sequence,
            width: frame.rectified.width(),
            height: frame.rectified.height(),
            total_us: frame.timings.total_us(),
        });
    }

    pub fn get_preview(&self) -> Vec<u8> {
        self.preview_frame.read().clone()
    }

    pub fn get_blur_preview(&self) -> Vec<u8> {
        self.blur_frame.read().clone()
    }

    fn info(&self) -> InfoResponse {
        let rectifier = &self.config.rectifier;
        InfoResponse {
            version: env!("CARGO_PKG_VERSION").to_string(),
            target_aspect: format!(
                "{}:{}",
                rectifier.target_aspect.width, rectifier.target_aspect.height
            ),
            output_format: format!("{:?}", rectifier.output_format),
            blur_enabled: self.config.blur.enabled,
            latest: *self.latest.read(),
            stats: self.stats.snapshot(),
        }
    }
}

/// Encode an RGB image to JPEG
pub fn encode_jpeg(img: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    use image::ImageOutputFormat;
    use std::io::Cursor;

    let mut jpeg_data = Vec::new();
    let mut cursor = Cursor::new(&mut jpeg_data);
    img.write_to(&mut cursor, ImageOutputFormat::Jpeg(quality))?;

    Ok(jpeg_data)
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index_handler))
        .route("/api/preview", get(get_preview))
        .route("/api/preview/blur", get(get_blur_preview))
        .route("/api/preview/stream", get(preview_stream))
        .route("/api/info", get(get_info))
        .layer(cors)
        .with_state(state)
}

/// Run the web server
pub async fn run_server(addr: &str, state: Arc<AppState>) -> Result<()> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Web server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

fn jpeg_response(frame: Vec<u8>) -> axum::response::Response {
    if frame.is_empty() {
        return (StatusCode::SERVICE_UNAVAILABLE, "No frame available").into_response();
    }

    (
        [(axum::http::header::CONTENT_TYPE, "image/jpeg")],
        frame,
    )
        .into_response()
}

/// Latest rectified frame (JPEG)
async fn get_preview(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    jpeg_response(state.get_preview())
}

/// Latest blurred frame (JPEG)
async fn get_blur_preview(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    jpeg_response(state.get_blur_preview())
}

/// Build one part of a multipart/x-mixed-replace body
fn mjpeg_part(frame: &[u8]) -> Vec<u8> {
    if frame.is_empty() {
        return b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
    }

    let mut part = Vec::with_capacity(frame.len() + 64);
    part.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: ");
    part.extend_from_slice(frame.len().to_string().as_bytes());
    part.extend_from_slice(b"\r\n\r\n");
    part.extend_from_slice(frame);
    part.extend_from_slice(b"\r\n");
    part
}

/// MJPEG stream of the rectified output
async fn preview_stream(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    use axum::body::Body;
    use tokio_stream::StreamExt;

    let stream = tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(
        std::time::Duration::from_millis(100),
    ))
    .map(move |_| Ok::<_, std::convert::Infallible>(mjpeg_part(&state.get_preview())));

    (
        [(
            axum::http::header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        )],
        Body::from_stream(stream),
    )
}

#[derive(Serialize)]
struct InfoResponse {
    version: String,
    target_aspect: String,
    output_format: String,
    blur_enabled: bool,
    latest: Option<LatestFrame>,
    stats: StatsSnapshot,
}

async fn get_info(State(state): State<Arc<AppState>>) -> Json<InfoResponse> {
    Json(state.info())
}
