//! Source retrieval: HTTPS downloads, local list files and `.myset` entries.

use anyhow::{Context, Result};
use reqwest::Client;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::aggregator::SourceBlob;
use crate::config::SourceConfig;
use crate::error::RtbhError;
use crate::utils::format_bytes;

const TIMEOUT_SECS: u64 = 30;
const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 2000;

/// Maximum size per source (10 MB)
/// The largest public lists (firehol_level4) are around 1.2 MB
const MAX_SOURCE_SIZE: usize = 10 * 1024 * 1024;

/// Maximum total size for all sources combined (50 MB)
const MAX_TOTAL_SIZE: usize = 50 * 1024 * 1024;

/// Maximum concurrent requests to list servers
const MAX_CONCURRENT_REQUESTS: usize = 6;

/// Downloads and reads blocklist sources.
pub struct Fetcher {
    client: Client,
    /// Cumulative size tracker (shared by concurrent fetches)
    total_downloaded: AtomicUsize,
    retry_delay: Duration,
}

impl Fetcher {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .https_only(true)
            .user_agent(format!("rtbh/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            total_downloaded: AtomicUsize::new(0),
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        })
    }

    /// Override the base delay between attempts (doubles after each retry).
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Bytes accepted so far across all sources.
    pub fn total_downloaded(&self) -> usize {
        self.total_downloaded.load(Ordering::Relaxed)
    }

    /// Fetch one configured source.
    pub async fn fetch_source(&self, source: &SourceConfig) -> Result<SourceBlob, RtbhError> {
        let fetch_error = |reason: String| RtbhError::Fetch {
            source_id: source.name.clone(),
            reason,
        };

        let content = match (&source.url, &source.path) {
            (Some(url), None) => {
                info!("Fetching {}...", source.name);
                self.fetch_with_retry(url).await.map_err(|e| fetch_error(format!("{:#}", e)))?
            }
            (None, Some(path)) => {
                debug!("Reading {} from {:?}", source.name, path);
                let content = read_limited(path).map_err(|e| fetch_error(format!("{:#}", e)))?;
                self.account(content.len()).map_err(|e| fetch_error(format!("{:#}", e)))?;
                content
            }
            _ => return Err(fetch_error("source needs exactly one of url or path".to_string())),
        };

        info!("Fetched {} ({})", source.name, format_bytes(content.len() as u64));
        Ok(SourceBlob::new(source.name.clone(), content))
    }

    /// Fetch several sources concurrently. Results come back in completion
    /// order; the aggregator restores a canonical order.
    pub async fn fetch_sources(&self, sources: &[&SourceConfig]) -> Vec<Result<SourceBlob, RtbhError>> {
        use futures::stream::{self, StreamExt};

        stream::iter(sources.iter().map(|source| self.fetch_source(source)))
            .buffer_unordered(MAX_CONCURRENT_REQUESTS)
            .collect()
            .await
    }

    /// Add `len` bytes to the cumulative counter, failing past the total cap.
    fn account(&self, len: usize) -> Result<()> {
        let new_total = self.total_downloaded.fetch_add(len, Ordering::Relaxed) + len;
        if new_total > MAX_TOTAL_SIZE {
            return Err(anyhow::anyhow!(
                "Cumulative download limit exceeded: {} bytes (max: {} bytes)",
                new_total,
                MAX_TOTAL_SIZE
            ));
        }
        Ok(())
    }

    /// Fetch content with retry logic and size validation.
    async fn fetch_with_retry(&self, url: &str) -> Result<String> {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = self.retry_delay * (1 << (attempt - 1));
                debug!("Retry {} after {:?} for {}", attempt, delay, url);
                tokio::time::sleep(delay).await;
            }

            match self.client.get(url).send().await {
                Ok(response) => {
                    if response.status().is_success() {
                        if let Some(content_length) = response.content_length() {
                            if content_length as usize > MAX_SOURCE_SIZE {
                                return Err(anyhow::anyhow!(
                                    "Response too large: {} bytes (max: {} bytes)",
                                    content_length,
                                    MAX_SOURCE_SIZE
                                ));
                            }
                            let current_total = self.total_downloaded();
                            if current_total + content_length as usize > MAX_TOTAL_SIZE {
                                return Err(anyhow::anyhow!(
                                    "Cumulative download limit exceeded: {} + {} > {} bytes",
                                    current_total,
                                    content_length,
                                    MAX_TOTAL_SIZE
                                ));
                            }
                        }

                        let body = response
                            .text()
                            .await
                            .context("Failed to read response body")?;

                        // Servers may omit or lie about Content-Length.
                        if body.len() > MAX_SOURCE_SIZE {
                            return Err(anyhow::anyhow!(
                                "Downloaded content too large: {} bytes (max: {} bytes)",
                                body.len(),
                                MAX_SOURCE_SIZE
                            ));
                        }
                        self.account(body.len())?;
                        return Ok(body);
                    }
                    last_error = Some(anyhow::anyhow!("HTTP {}", response.status()));
                }
                Err(e) => {
                    last_error = Some(e.into());
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Unknown error")))
    }
}

// Default is not implemented for Fetcher since new() can fail.

fn read_limited(path: &Path) -> Result<String> {
    let size = std::fs::metadata(path)
        .with_context(|| format!("Cannot stat {:?}", path))?
        .len();
    if size as usize > MAX_SOURCE_SIZE {
        return Err(anyhow::anyhow!(
            "File too large: {} bytes (max: {} bytes)",
            size,
            MAX_SOURCE_SIZE
        ));
    }
    std::fs::read_to_string(path).with_context(|| format!("Cannot read {:?}", path))
}

/// Read every file in `dir` whose name ends with `suffix` as a source.
///
/// Blobs are named `local:<file name>` and sorted by file name. A missing
/// directory is not an error; an unreadable matching file is.
pub fn load_local_entries(dir: &Path, suffix: &str) -> Result<Vec<SourceBlob>, RtbhError> {
    if !dir.is_dir() {
        debug!("Local entry directory {:?} not present", dir);
        return Ok(Vec::new());
    }

    let mut names: Vec<String> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.ends_with(suffix))
        .collect();
    names.sort();

    let mut blobs = Vec::with_capacity(names.len());
    for name in names {
        let id = format!("local:{}", name);
        let content = read_limited(&dir.join(&name)).map_err(|e| RtbhError::Fetch {
            source_id: id.clone(),
            reason: format!("{:#}", e),
        })?;
        blobs.push(SourceBlob::new(id, content));
    }

    if blobs.is_empty() {
        warn!("No {} files found in {:?}", suffix, dir);
    } else {
        info!("Loaded {} local entry files from {:?}", blobs.len(), dir);
    }
    Ok(blobs)
}
