//! REST API for the highlight analyzer
//!
//! Thin axum layer over [`AnalysisService`] and the heatmap scraper.

use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::orchestrator::AnalysisService;

pub mod handlers;
pub mod models;
pub mod server;

pub use server::{build_router, AppState};

/// API server bound to one analysis service
pub struct ApiServer {
    service: AnalysisService,
    config: Arc<Config>,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(service: AnalysisService, config: Arc<Config>) -> Self {
        Self { service, config }
    }

    /// Serve until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("🚀 Starting API server on port {}", self.config.server.port);
        let state = AppState::new(self.service, self.config);
        server::start_http_server(state, shutdown).await
    }
}
