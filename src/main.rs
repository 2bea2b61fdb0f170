use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use yt_highlight_analyzer::api::ApiServer;
use yt_highlight_analyzer::downloader::install_cookies;
use yt_highlight_analyzer::{AnalysisService, Config};

/// How long shutdown waits for in-flight analyses
const SHUTDOWN_GRACE: Duration = Duration::from_secs(120);

#[derive(Parser)]
#[command(name = "yt-highlight-server")]
#[command(version, about = "Audio highlight detection service for YouTube videos")]
struct Cli {
    /// Configuration file (defaults to the standard search paths)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Number of concurrent analysis workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_filter = if cli.verbose {
        "yt_highlight_analyzer=debug,tower_http=debug"
    } else {
        "yt_highlight_analyzer=info,tower_http=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load().unwrap_or_else(|e| {
            warn!("Failed to load config, using defaults: {}", e);
            Config::from_env()
        }),
    };
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(workers) = cli.workers {
        config.performance.max_workers = workers;
    }
    config.validate()?;

    // Cookie blob from the environment becomes the downloader's cookie file
    if let Ok(blob) = std::env::var("YOUTUBE_COOKIES") {
        let cookie_path = config
            .download
            .cookie_file
            .clone()
            .unwrap_or_else(|| config.storage.download_dir.join("cookies.txt"));
        match install_cookies(&blob, &cookie_path).await {
            Ok(true) => config.download.cookie_file = Some(cookie_path),
            Ok(false) => {}
            Err(e) => warn!("Failed to write cookie file {}: {}", cookie_path.display(), e),
        }
    }

    info!("🚀 YouTube Highlight Analyzer starting...");
    info!("{}", config.summary());

    let service = AnalysisService::from_config(&config);
    if let Some(report) = service.initialize(config.storage.reconcile_on_startup).await? {
        info!("🧹 Startup reconciliation removed {} files", report.total());
    }

    let config = Arc::new(config);
    let server = ApiServer::new(service.clone(), config.clone());
    server.run(shutdown_signal()).await?;

    match tokio::time::timeout(SHUTDOWN_GRACE, service.shutdown()).await {
        Ok(()) => info!("👋 Shutdown complete"),
        Err(_) => error!("⏰ Gave up waiting for {} in-flight analyses", service.in_flight()),
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("🛑 Shutdown signal received");
}
