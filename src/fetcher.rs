//! Address-list retrieval and last-known-good fallbacks.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::SyncError;
use crate::prefix::{Area, FamilyFilter};

const RETRY_DELAY_MS: u64 = 2000;
const MAX_RETRY_DELAY_MS: u64 = 60_000;

/// Maximum payload size (1 MiB). The published list is a few kilobytes.
const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Compiled-in last resort, used when neither the endpoint, the cache nor
/// the config provides anything. Refreshed by `scripts/update-fallback.sh`.
const EMBEDDED_FALLBACK: &str = include_str!("../data/fallback.txt");

/// Which slice of the published list to request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SourceQuery {
    pub family: FamilyFilter,
    pub area: Area,
}

impl SourceQuery {
    pub fn new(family: FamilyFilter, area: Area) -> Self {
        Self { family, area }
    }

    /// `endpoint?version=v4&area=global`; `version` is omitted for both families.
    pub fn url(&self, endpoint: &str) -> String {
        let mut params = Vec::new();
        if let Some(version) = self.family.query_value() {
            params.push(format!("version={}", version));
        }
        params.push(format!("area={}", self.area.as_str()));

        let sep = if endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}{}", endpoint, sep, params.join("&"))
    }

    /// Stable key used for cache file names.
    pub fn cache_key(&self) -> String {
        format!("{}-{}", self.family.as_str(), self.area.as_str())
    }
}

impl fmt::Display for SourceQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "family={} area={}", self.family, self.area)
    }
}

/// Something that hands out raw address-list payloads.
#[async_trait]
pub trait AddressSource: Send + Sync {
    async fn fetch(&self, query: &SourceQuery) -> Result<String, SyncError>;
}

/// HTTPS client for the published list.
pub struct HttpSource {
    client: Client,
    endpoint: String,
    max_retries: u32,
}

impl HttpSource {
    pub fn new(endpoint: &str, connect_timeout: Duration, timeout: Duration, max_retries: u32) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .user_agent(format!("edgewall/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            max_retries: max_retries.max(1),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            &config.endpoint,
            config.connect_timeout(),
            config.timeout(),
            config.max_retries,
        )
    }

    async fn fetch_once(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("HTTP {}", response.status());
        }

        if let Some(content_length) = response.content_length() {
            if content_length as usize > MAX_PAYLOAD_SIZE {
                anyhow::bail!(
                    "Response too large: {} bytes (max: {} bytes)",
                    content_length,
                    MAX_PAYLOAD_SIZE
                );
            }
        }

        let body = response.text().await.context("Failed to read response body")?;

        // Chunked responses carry no Content-Length
        if body.len() > MAX_PAYLOAD_SIZE {
            anyhow::bail!(
                "Downloaded content too large: {} bytes (max: {} bytes)",
                body.len(),
                MAX_PAYLOAD_SIZE
            );
        }
        Ok(body)
    }
}

#[async_trait]
impl AddressSource for HttpSource {
    async fn fetch(&self, query: &SourceQuery) -> Result<String, SyncError> {
        let url = query.url(&self.endpoint);
        info!("Fetching address list ({})...", query);

        let mut last_error = None;
        for attempt in 0..self.max_retries {
            if attempt > 0 {
                let delay = retry_delay(attempt);
                warn!("Retry {} after {}ms for {}", attempt, delay.as_millis(), url);
                tokio::time::sleep(delay).await;
            }

            match self.fetch_once(&url).await {
                Ok(body) => {
                    debug!("Fetched {} bytes from {}", body.len(), url);
                    return Ok(body);
                }
                Err(e) => {
                    debug!("Fetch attempt {} failed: {:#}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        Err(SyncError::SourceUnavailable(match last_error {
            Some(e) => format!("{}: {:#}", url, e),
            None => url,
        }))
    }
}

/// Backoff before retry `attempt` (1-based): 2s, 4s, 8s... capped at a minute.
fn retry_delay(attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    Duration::from_millis(RETRY_DELAY_MS.saturating_mul(factor).min(MAX_RETRY_DELAY_MS))
}

/// Where a substituted payload came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackOrigin {
    /// Payload of the last successful sync for the same query.
    Cache(PathBuf),
    /// `fallback_prefixes` from the config file.
    Configured,
    /// List compiled into the binary.
    Embedded,
}

impl fmt::Display for FallbackOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackOrigin::Cache(path) => write!(f, "cached list {}", path.display()),
            FallbackOrigin::Configured => f.write_str("configured fallback_prefixes"),
            FallbackOrigin::Embedded => f.write_str("built-in fallback list"),
        }
    }
}

/// Last-known-good payloads, one file per query.
#[derive(Debug, Clone)]
pub struct PayloadCache {
    dir: PathBuf,
}

impl PayloadCache {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, query: &SourceQuery) -> PathBuf {
        self.dir.join(format!("{}.txt", query.cache_key()))
    }

    pub fn load(&self, query: &SourceQuery) -> Option<String> {
        let path = self.path_for(query);
        match std::fs::read_to_string(&path) {
            Ok(content) if !content.trim().is_empty() => Some(content),
            Ok(_) => None,
            Err(e) => {
                debug!("No cached payload at {:?}: {}", path, e);
                None
            }
        }
    }

    /// Atomically replace the cached payload for `query`.
    pub fn store(&self, query: &SourceQuery, payload: &str) -> Result<()> {
        use std::io::Write;
        use tempfile::NamedTempFile;

        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create cache directory {:?}", self.dir))?;
        let mut temp_file = NamedTempFile::new_in(&self.dir).context("Failed to create temporary cache file")?;
        temp_file.write_all(payload.as_bytes())?;
        temp_file.as_file().sync_all()?;

        let path = self.path_for(query);
        temp_file
            .persist(&path)
            .with_context(|| format!("Failed to persist cache file {:?}", path))?;
        Ok(())
    }
}

/// First available substitute payload: cache, then config, then embedded.
pub fn fallback_payload(
    cache: &PayloadCache,
    query: &SourceQuery,
    configured: &[String],
) -> (FallbackOrigin, String) {
    if let Some(payload) = cache.load(query) {
        return (FallbackOrigin::Cache(cache.path_for(query)), payload);
    }
    if !configured.is_empty() {
        return (FallbackOrigin::Configured, configured.join("\n"));
    }
    (FallbackOrigin::Embedded, EMBEDDED_FALLBACK.to_string())
}
