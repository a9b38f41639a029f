//! HTTP routes: photo processing, health and static assets.

use crate::config::Config;
use crate::engine::EngineHandle;
use crate::error::ApiError;
use crate::upload;
use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use emotion_core::EmotionResult;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

/// Room for multipart boundaries and headers on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Shared state for the axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub settings: Arc<Settings>,
}

/// The slice of [`Config`] request handling needs.
#[derive(Debug)]
pub struct Settings {
    pub upload_dir: PathBuf,
    pub model_dir: PathBuf,
    pub public_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub request_timeout: Duration,
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Self {
            upload_dir: config.upload_dir.clone(),
            model_dir: config.model_dir.clone(),
            public_dir: config.public_dir.clone(),
            max_upload_bytes: config.max_upload_bytes,
            request_timeout: config.request_timeout(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let settings = Arc::clone(&state.settings);
    let body_limit = settings.max_upload_bytes.saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        .route(
            "/processar-foto",
            post(process_photo).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/health", get(health))
        .with_state(state)
        .nest_service("/models", ServeDir::new(&settings.model_dir))
        .fallback_service(ServeDir::new(&settings.public_dir))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// `POST /processar-foto`: multipart field `foto` in, dominant emotion out.
async fn process_photo(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<EmotionResult>, ApiError> {
    let mut multipart = multipart.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let started = Instant::now();

    let timeout = state.settings.request_timeout;
    let result = tokio::time::timeout(timeout, analyze_upload(&state, &mut multipart))
        .await
        .map_err(|_| ApiError::Timeout)??;

    tracing::info!(
        faces = result.faces_found,
        emotion = ?result.emotion,
        confidence = ?result.confidence_percent,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "photo processed"
    );
    Ok(Json(result))
}

/// Store, read back, discard, infer, reduce. The upload guard is dropped on
/// every path out of here, including cancellation by the timeout.
async fn analyze_upload(
    state: &AppState,
    multipart: &mut Multipart,
) -> Result<EmotionResult, ApiError> {
    let settings = &state.settings;
    let stored = upload::receive(multipart, &settings.upload_dir, settings.max_upload_bytes).await?;
    tracing::debug!(
        size = stored.size(),
        content_type = ?stored.content_type(),
        "upload received"
    );
    let bytes = stored.into_bytes().await?;

    let faces = state.engine.analyze(bytes).await?;
    Ok(emotion_core::summarize(&faces))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    workers: usize,
    queued: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        workers: state.engine.workers(),
        queued: state.engine.queued(),
    })
}
