//! HTTP server implementation for the API

use anyhow::Result;
use axum::{
    extract::{Path, Query, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::sync::Arc;
use tower::{ServiceBuilder, ServiceExt};
use tower_http::{
    cors::{Any, CorsLayer},
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};
use tracing::info;

use super::handlers;
use super::models::{ApiError, ClearRequest, HeatmapQuery, ProcessRequest, StatusQuery};
use crate::config::Config;
use crate::heatmap::HeatmapScraper;
use crate::orchestrator::AnalysisService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: AnalysisService,
    pub heatmap: Arc<HeatmapScraper>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(service: AnalysisService, config: Arc<Config>) -> Self {
        let heatmap = Arc::new(HeatmapScraper::new(&config.heatmap));
        Self { service, heatmap, config }
    }
}

/// Build the application router
pub fn build_router(app_state: AppState) -> Router {
    // Configure CORS to allow browser access
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    let static_dir = app_state.config.server.static_dir.clone();
    let frontend = ServeDir::new(&static_dir).fallback(ServeFile::new(static_dir.join("index.html")));

    Router::new()
        // Health check endpoints (both paths for compatibility)
        .route("/health", get(health_handler))
        .route("/api/health", get(health_handler))

        // Analysis endpoints
        .route("/api/process-youtube", post(process_youtube_handler))
        .route("/api/analysis-status", get(analysis_status_handler))
        .route("/api/clear-cache", post(clear_cache_handler))
        .route("/api/get-most-replayed", get(most_replayed_handler))

        // Retained audio artifacts
        .route("/download/:filename", get(download_handler))

        // Frontend with index.html catch-all
        .fallback_service(frontend)

        // Add state and middleware
        .with_state(app_state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
}

/// Configure and start the HTTP server, stopping when `shutdown` resolves
pub async fn start_http_server<F>(app_state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let address = format!("{}:{}", app_state.config.server.host, app_state.config.server.port);
    let app = build_router(app_state);

    // Bind and serve
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("🌐 API server listening on http://{}", address);

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

    Ok(())
}

/// Health check handler
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(handlers::health_check(&state.service)))
}

/// Submit a URL for analysis
async fn process_youtube_handler(
    State(state): State<AppState>,
    payload: Option<Json<ProcessRequest>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(request) = payload.ok_or_else(|| ApiError::bad_request("Invalid JSON payload"))?;
    handlers::process_youtube(&state.service, request).await.map(Json)
}

/// Poll the status of an analysis
async fn analysis_status_handler(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    handlers::analysis_status(&state.service, query).await.map(Json)
}

/// Clear cached data for a URL
async fn clear_cache_handler(
    State(state): State<AppState>,
    payload: Option<Json<ClearRequest>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(request) = payload.ok_or_else(|| ApiError::bad_request("Invalid JSON payload"))?;
    handlers::clear_cache(&state.service, request).await.map(Json)
}

/// Scrape the Most replayed heatmap
async fn most_replayed_handler(
    State(state): State<AppState>,
    Query(query): Query<HeatmapQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    handlers::most_replayed(&state.heatmap, query).await.map(Json)
}

/// Serve a retained audio file
async fn download_handler(
    State(state): State<AppState>,
    Path(filename): Path<String>,
    request: Request,
) -> Result<Response, ApiError> {
    let path = handlers::download_path(state.service.cache(), state.service.retain_downloads(), &filename)?;

    // Streams from disk and honours Range requests
    let served = ServeFile::new(&path)
        .oneshot(request)
        .await
        .unwrap_or_else(|never| match never {});
    if served.status() == StatusCode::NOT_FOUND {
        return Err(ApiError::not_found("File not found."));
    }

    let mut response = served.into_response();
    if response.status().is_success() {
        let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename))
            .map_err(|e| ApiError::internal(format!("Invalid download name: {}", e)))?;
        response.headers_mut().insert(header::CONTENT_DISPOSITION, disposition);
    }
    Ok(response)
}
