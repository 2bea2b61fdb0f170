//! Durable per-video result cache: one JSON file per cache key

use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{AnalyzerError, Result};
use crate::models::{AnalysisResult, AnalysisStatus, CacheKey};

const CACHE_EXTENSION: &str = "json";
const AUDIO_EXTENSION: &str = "mp3";

/// Summary of one cache entry, as shown by listings
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub status: AnalysisStatus,
    pub highlight_count: usize,
    pub timestamp: f64,
    pub size_bytes: u64,
    pub has_audio: bool,
}

/// Cache statistics
#[derive(Debug, Default, Clone, Serialize)]
pub struct CacheStats {
    pub total_files: usize,
    pub success_entries: usize,
    pub error_entries: usize,
    pub corrupt_files: usize,
    pub total_highlights: usize,
    pub total_bytes: u64,
    pub audio_files: usize,
    pub audio_bytes: u64,
}

/// What a startup reconciliation removed
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ReconcileReport {
    /// Unparseable cache files (and their audio)
    pub corrupt_removed: usize,
    /// Audio files without a cache entry
    pub orphaned_audio_removed: usize,
    /// Cache entries whose retained audio is gone
    pub missing_audio_removed: usize,
    /// Leftover audio under the delete-after-analysis policy
    pub stale_audio_removed: usize,
    /// Interrupted temp files from earlier writes
    pub temp_files_removed: usize,
}

impl ReconcileReport {
    pub fn total(&self) -> usize {
        self.corrupt_removed
            + self.orphaned_audio_removed
            + self.missing_audio_removed
            + self.stale_audio_removed
            + self.temp_files_removed
    }
}

/// Manages the on-disk result cache and the companion audio artifacts
#[derive(Debug, Clone)]
pub struct CacheStore {
    cache_dir: PathBuf,
    download_dir: PathBuf,
}

impl CacheStore {
    /// Create a new cache store
    pub fn new(cache_dir: impl Into<PathBuf>, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            download_dir: download_dir.into(),
        }
    }

    /// Create the cache and download directories
    pub async fn initialize(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        tokio::fs::create_dir_all(&self.download_dir).await?;
        info!("📁 Cache directory initialized: {}", self.cache_dir.display());
        info!("📁 Download directory initialized: {}", self.download_dir.display());
        Ok(())
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Path of the cached result for `key`
    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(format!("{}.{}", key, CACHE_EXTENSION))
    }

    /// Path of the downloaded audio for `key`
    pub fn audio_path(&self, key: &CacheKey) -> PathBuf {
        self.download_dir.join(format!("{}.{}", key, AUDIO_EXTENSION))
    }

    /// Load a cached result; missing or corrupt files are a miss
    pub async fn get(&self, key: &CacheKey) -> Option<AnalysisResult> {
        let cache_path = self.entry_path(key);

        let content = match tokio::fs::read_to_string(&cache_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Cache miss: no file found for key {}", key);
                return None;
            }
            Err(e) => {
                warn!("Failed to read cache file {}: {}", cache_path.display(), e);
                return None;
            }
        };

        match serde_json::from_str::<AnalysisResult>(&content) {
            Ok(result) => {
                debug!("📚 Cache hit for {}: {:?}", key, result.status);
                Some(result)
            }
            Err(e) => {
                warn!("Failed to parse cache file {}: {}", cache_path.display(), e);
                None
            }
        }
    }

    /// Persist a result. The file is written to a temp file in the cache
    /// directory and renamed into place, so readers never see a partial entry.
    pub async fn put(&self, key: &CacheKey, result: &AnalysisResult) -> Result<()> {
        let json_content = serde_json::to_string_pretty(result)?;
        let cache_dir = self.cache_dir.clone();
        let cache_path = self.entry_path(key);

        tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::create_dir_all(&cache_dir)?;
            let mut temp = tempfile::NamedTempFile::new_in(&cache_dir)?;
            temp.write_all(json_content.as_bytes())?;
            temp.as_file().sync_all()?;
            temp.persist(&cache_path).map_err(|e| AnalyzerError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| AnalyzerError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        info!(
            "💾 Cached {:?} result for {} ({} highlights)",
            result.status,
            key,
            result.highlights.len()
        );
        Ok(())
    }

    /// Remove the cached result for `key`. Returns whether one existed.
    pub async fn invalidate(&self, key: &CacheKey) -> Result<bool> {
        match tokio::fs::remove_file(self.entry_path(key)).await {
            Ok(()) => {
                info!("🗑️ Invalidated cache for key: {}", key);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Cache file not found for key: {}", key);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the downloaded audio for `key`. Returns whether one existed.
    pub async fn delete_audio(&self, key: &CacheKey) -> Result<bool> {
        match tokio::fs::remove_file(self.audio_path(key)).await {
            Ok(()) => {
                debug!("🗑️ Removed audio for key: {}", key);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// List all readable cache entries, newest first
    pub async fn list(&self) -> Result<Vec<CacheEntry>> {
        let mut entries_out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.cache_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries_out),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(key) = key_for(&path, CACHE_EXTENSION) else {
                continue;
            };
            let Some(result) = self.get(&key).await else {
                continue;
            };
            let size_bytes = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            let has_audio = tokio::fs::try_exists(self.audio_path(&key)).await.unwrap_or(false);

            entries_out.push(CacheEntry {
                key,
                status: result.status,
                highlight_count: result.highlights.len(),
                timestamp: result.timestamp,
                size_bytes,
                has_audio,
            });
        }

        // Sort by timestamp (newest first)
        entries_out.sort_by(|a, b| b.timestamp.total_cmp(&a.timestamp));
        Ok(entries_out)
    }

    /// Get cache statistics
    pub async fn stats(&self) -> Result<CacheStats> {
        let cache_dir = self.cache_dir.clone();
        let download_dir = self.download_dir.clone();

        tokio::task::spawn_blocking(move || {
            let mut stats = CacheStats::default();

            for path in files_with_extension(&cache_dir, CACHE_EXTENSION) {
                stats.total_files += 1;
                stats.total_bytes += std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

                match read_entry(&path) {
                    Some(result) => {
                        match result.status {
                            AnalysisStatus::Success => stats.success_entries += 1,
                            _ => stats.error_entries += 1,
                        }
                        stats.total_highlights += result.highlights.len();
                    }
                    None => stats.corrupt_files += 1,
                }
            }

            for path in files_with_extension(&download_dir, AUDIO_EXTENSION) {
                stats.audio_files += 1;
                stats.audio_bytes += std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            }

            stats
        })
        .await
        .map_err(|e| AnalyzerError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
    }

    /// Remove every cached result. Returns the number of files removed.
    pub async fn clear_all(&self) -> Result<usize> {
        let mut cleared_count = 0;
        let mut entries = match tokio::fs::read_dir(&self.cache_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == CACHE_EXTENSION)
                && tokio::fs::remove_file(&path).await.is_ok()
            {
                cleared_count += 1;
                debug!("🗑️ Removed cache file: {}", path.display());
            }
        }

        if cleared_count > 0 {
            info!("🧹 Cleared {} cache files", cleared_count);
        }

        Ok(cleared_count)
    }

    /// Bring the cache and download directories back into a consistent state.
    ///
    /// Must only run while no analysis jobs are active.
    pub async fn reconcile(&self, retain_downloads: bool) -> Result<ReconcileReport> {
        let store = self.clone();
        let report = tokio::task::spawn_blocking(move || store.reconcile_blocking(retain_downloads))
            .await
            .map_err(|e| AnalyzerError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        if report.total() > 0 {
            info!("🧹 Reconciled cache: {:?}", report);
        } else {
            debug!("Cache already consistent");
        }
        Ok(report)
    }

    fn reconcile_blocking(&self, retain_downloads: bool) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        // Interrupted writes and downloads leave tempfile's ".tmp*" entries behind
        for dir in [&self.cache_dir, &self.download_dir] {
            for entry in WalkDir::new(dir)
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp"))
            {
                let removed = if entry.file_type().is_dir() {
                    std::fs::remove_dir_all(entry.path()).is_ok()
                } else {
                    remove_quietly(entry.path())
                };
                if removed {
                    report.temp_files_removed += 1;
                }
            }
        }

        for path in files_with_extension(&self.cache_dir, CACHE_EXTENSION) {
            let Some(key) = key_for(&path, CACHE_EXTENSION) else {
                continue;
            };

            if read_entry(&path).is_none() {
                warn!("🗑️ Removing corrupt cache file: {}", path.display());
                if remove_quietly(&path) {
                    report.corrupt_removed += 1;
                }
                remove_quietly(&self.audio_path(&key));
                continue;
            }

            if retain_downloads && !self.audio_path(&key).exists() {
                debug!("Removing cache entry without audio: {}", key);
                if remove_quietly(&path) {
                    report.missing_audio_removed += 1;
                }
            }
        }

        for path in files_with_extension(&self.download_dir, AUDIO_EXTENSION) {
            if !retain_downloads {
                if remove_quietly(&path) {
                    report.stale_audio_removed += 1;
                }
                continue;
            }

            let orphaned = key_for(&path, AUDIO_EXTENSION)
                .map(|key| !self.entry_path(&key).exists())
                .unwrap_or(true);
            if orphaned && remove_quietly(&path) {
                report.orphaned_audio_removed += 1;
            }
        }

        report
    }
}

/// Cache key encoded in a file name like `<key>.<extension>`
fn key_for(path: &Path, extension: &str) -> Option<CacheKey> {
    if path.extension()? != extension {
        return None;
    }
    CacheKey::parse(path.file_stem()?.to_str()?)
}

fn files_with_extension(dir: &Path, extension: &str) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().map_or(false, |ext| ext == extension))
        .collect()
}

fn read_entry(path: &Path) -> Option<AnalysisResult> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

fn remove_quietly(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", path.display(), e);
            }
            false
        }
    }
}
