use anyhow::{anyhow, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};

use yt_highlight_analyzer::models::{AnalysisStatus, CacheKey};
use yt_highlight_analyzer::{CacheStore, Config};

#[derive(Parser)]
#[command(name = "cache-manager")]
#[command(about = "Highlight cache management utility")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Result cache directory (defaults to the configured one)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Audio download directory (defaults to the configured one)
    #[arg(long)]
    download_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List all cached analyses
    List,
    /// Get cache statistics
    Stats,
    /// Show the cached result for a key or URL
    Show {
        /// Cache key or YouTube URL
        target: String,
    },
    /// Invalidate the cached result (and audio) for a key or URL
    Invalidate {
        /// Cache key or YouTube URL
        target: String,
    },
    /// Clear all cache entries
    Clear,
    /// Remove corrupt entries, orphaned audio and leftover temp files.
    /// Do not run while the server is processing.
    Reconcile {
        /// Keep audio files that have a cache entry
        #[arg(long)]
        retain: bool,
    },
}

/// Accept either an already-derived key or a URL
fn resolve_key(target: &str) -> Result<CacheKey> {
    if target.contains("://") || target.contains('/') {
        return Ok(CacheKey::from_url(target));
    }
    CacheKey::parse(target).ok_or_else(|| anyhow!("Invalid cache key: {}", target))
}

fn format_timestamp(timestamp: f64) -> String {
    Utc.timestamp_opt(timestamp as i64, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .init();

    let cli = Cli::parse();

    let config = Config::load()?;
    let cache_dir = cli.cache_dir.unwrap_or(config.storage.cache_dir);
    let download_dir = cli.download_dir.unwrap_or(config.storage.download_dir);

    let cache = CacheStore::new(cache_dir, download_dir);
    cache.initialize().await?;

    match cli.command {
        Commands::List => {
            let entries = cache.list().await?;

            if entries.is_empty() {
                info!("📭 No cached analyses found");
                return Ok(());
            }

            info!("📚 Cached analyses ({}):", entries.len());
            for entry in entries {
                let icon = match entry.status {
                    AnalysisStatus::Success => "✅",
                    _ => "❌",
                };
                info!(
                    "  {} {} - {} highlights, {} bytes, cached {}{}",
                    icon,
                    entry.key,
                    entry.highlight_count,
                    entry.size_bytes,
                    format_timestamp(entry.timestamp),
                    if entry.has_audio { " (audio retained)" } else { "" }
                );
            }
        }

        Commands::Stats => {
            let stats = cache.stats().await?;

            info!("📊 Cache Statistics:");
            info!("  Cache directory: {}", cache.cache_dir().display());
            info!("  Total files: {}", stats.total_files);
            info!("  Successful analyses: {}", stats.success_entries);
            info!("  Failed analyses: {}", stats.error_entries);
            info!("  Corrupt files: {}", stats.corrupt_files);
            info!("  Total highlights: {}", stats.total_highlights);
            info!("  Cache size: {:.1} KB", stats.total_bytes as f64 / 1024.0);
            info!("  Audio files: {} ({:.1} MB)", stats.audio_files, stats.audio_bytes as f64 / 1_048_576.0);

            if stats.corrupt_files > 0 {
                warn!("⚠️  Run `cache-manager reconcile` to remove corrupt entries");
            }
        }

        Commands::Show { target } => {
            let key = resolve_key(&target)?;
            match cache.get(&key).await {
                Some(result) => {
                    info!("🔍 Cached result for {}:", key);
                    println!("{}", serde_json::to_string_pretty(&result)?);
                }
                None => warn!("⚠️  No cached result for {}", key),
            }
        }

        Commands::Invalidate { target } => {
            let key = resolve_key(&target)?;
            let removed = cache.invalidate(&key).await?;
            let audio_removed = cache.delete_audio(&key).await?;

            if removed || audio_removed {
                info!("✅ Invalidated cache for {} (audio removed: {})", key, audio_removed);
            } else {
                warn!("⚠️  Nothing cached for {}", key);
            }
        }

        Commands::Clear => {
            let removed = cache.clear_all().await?;
            info!("🗑️  Cleared {} cache entries", removed);
        }

        Commands::Reconcile { retain } => {
            let report = cache.reconcile(retain).await?;

            info!("🧹 Reconciliation complete:");
            info!("  Corrupt entries removed: {}", report.corrupt_removed);
            info!("  Orphaned audio removed: {}", report.orphaned_audio_removed);
            info!("  Entries with missing audio removed: {}", report.missing_audio_removed);
            info!("  Stale audio removed: {}", report.stale_audio_removed);
            info!("  Temp files removed: {}", report.temp_files_removed);
        }
    }

    Ok(())
}
