use super::*;

use crate::config::RetryConfig;
use async_trait::async_trait;
use reqwest::{header, Client};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Bytes received so far while streaming a model download.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DownloadProgress {
    pub received: u64,
    pub total: Option<u64>,
}

/// Largest up-front buffer reservation taken from a `Content-Length` header.
const MAX_PREALLOCATION: usize = 64 << 20;

pub type ProgressObserver<'a> = &'a (dyn Fn(DownloadProgress) + Send + Sync);

/// One network attempt at obtaining the bytes behind `url`.
#[async_trait]
pub trait ByteFetcher: Send + Sync {
    async fn fetch(&self, url: &str, progress: ProgressObserver<'_>) -> Result<Bytes, DownloadError>;
}

/// `ByteFetcher` over HTTP GET.
///
/// The model is hosted cross-origin, so every request carries an explicit
/// `Origin` header. Root-relative urls (`/lama_fp32.onnx`) resolve against
/// that origin.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    origin: String,
}

impl HttpFetcher {
    pub fn new(origin: impl Into<String>, connect_timeout: Duration) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("inpaint/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DownloadError::Configuration(e.to_string()))?;

        Ok(HttpFetcher {
            client,
            origin: origin.into().trim_end_matches('/').to_string(),
        })
    }

    fn resolve(&self, url: &str) -> String {
        if url.starts_with('/') {
            format!("{}{}", self.origin, url)
        } else {
            url.to_string()
        }
    }
}

#[async_trait]
impl ByteFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, progress: ProgressObserver<'_>) -> Result<Bytes, DownloadError> {
        let url = self.resolve(url);
        debug!("fetching '{}' with origin '{}'", url, self.origin);

        let mut response = self
            .client
            .get(&url)
            .header(header::ORIGIN, &self.origin)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Http {
                status: status.as_u16(),
            });
        }

        let total = response.content_length();
        let mut buffer: Vec<u8> = Vec::with_capacity(initial_capacity(total));

        while let Some(chunk) = response.chunk().await? {
            buffer.extend_from_slice(&chunk);
            progress(DownloadProgress {
                received: buffer.len() as u64,
                total,
            });
        }

        if buffer.is_empty() {
            return Err(DownloadError::EmptyBody);
        }

        Ok(Bytes::from(buffer))
    }
}

/// Reservation for a body announced as `total` bytes; the header is not
/// trusted beyond `MAX_PREALLOCATION`.
fn initial_capacity(total: Option<u64>) -> usize {
    total
        .map(|len| usize::try_from(len).unwrap_or(usize::MAX))
        .unwrap_or(0)
        .min(MAX_PREALLOCATION)
}

/// Cache-first model loader with write-through on download.
pub struct ModelFetcher<C, F> {
    cache: Arc<C>,
    fetcher: F,
    retry: RetryConfig,
    expected_sha256: Option<String>,
    /// Artifacts already loaded by this instance, kept so a failed cache
    /// write never causes a second download.
    loaded: Mutex<HashMap<String, Bytes>>,
}

impl<C: BlobCache, F: ByteFetcher> ModelFetcher<C, F> {
    pub fn new(cache: Arc<C>, fetcher: F, retry: RetryConfig) -> Self {
        ModelFetcher {
            cache,
            fetcher,
            retry,
            expected_sha256: None,
            loaded: Mutex::new(HashMap::new()),
        }
    }

    /// Require artifacts to hash to `digest` (lowercase hex SHA-256).
    pub fn with_expected_sha256(mut self, digest: impl Into<String>) -> Self {
        self.expected_sha256 = Some(digest.into().to_lowercase());
        self
    }

    pub async fn load(&self, url: &str) -> DataLoaderResult<ModelArtifact> {
        self.load_with_progress(url, &|_| {}).await
    }

    pub async fn load_with_progress(
        &self,
        url: &str,
        progress: ProgressObserver<'_>,
    ) -> DataLoaderResult<ModelArtifact> {
        let key = cache_key(url)?;

        if let Some(bytes) = self.loaded.lock().await.get(&key) {
            return Ok(ModelArtifact::new(url, bytes.clone()));
        }

        if let Some(bytes) = self.lookup_cache(&key).await {
            self.loaded.lock().await.insert(key, bytes.clone());
            return Ok(ModelArtifact::new(url, bytes));
        }

        info!("'{}' not in cache, downloading from '{}'", key, url);

        let bytes = self
            .fetch_with_retry(url, progress)
            .await
            .map_err(|source| DataLoaderError::Download {
                url: url.to_string(),
                source,
            })?;

        if let Err(error) = self.cache.put(&key, &bytes).await {
            warn!("storage of '{}' failed, continuing with in-memory copy: {}", key, error);
        }

        self.loaded.lock().await.insert(key, bytes.clone());
        Ok(ModelArtifact::new(url, bytes))
    }

    /// A usable cached copy, or `None` for every kind of miss.
    async fn lookup_cache(&self, key: &str) -> Option<Bytes> {
        match self.cache.get(key).await {
            Ok(CacheLookup::Hit(bytes)) => {
                if let Some(expected) = &self.expected_sha256 {
                    let actual = sha256_hex(&bytes);
                    if &actual != expected {
                        warn!(
                            "cached '{}' is stale (sha256 {} != {}), refetching",
                            key, actual, expected
                        );
                        return None;
                    }
                }
                Some(bytes)
            }
            Ok(CacheLookup::Empty) => {
                warn!("cached '{}' is empty, treating as missing", key);
                None
            }
            Ok(CacheLookup::Missing) => None,
            Err(error) => {
                warn!("cache lookup failed, treating as miss: {}", error);
                None
            }
        }
    }

    async fn fetch_with_retry(
        &self,
        url: &str,
        progress: ProgressObserver<'_>,
    ) -> Result<Bytes, DownloadError> {
        let mut last_error = DownloadError::Connection("no attempts made".into());
        let mut backoff = self.retry.initial_backoff;

        for attempt in 0..=self.retry.max_retries {
            if attempt > 0 {
                debug!("retry attempt {} after {:?}", attempt, backoff);
                tokio::time::sleep(backoff).await;

                backoff = Duration::from_secs_f64(
                    (backoff.as_secs_f64() * self.retry.multiplier)
                        .min(self.retry.max_backoff.as_secs_f64()),
                );
            }

            match self.fetcher.fetch(url, progress).await {
                Ok(bytes) => return self.verify(bytes),
                Err(e) => {
                    if !e.is_retryable() {
                        return Err(e);
                    }

                    warn!("download failed (attempt {}): {}", attempt + 1, e);
                    last_error = e;
                }
            }
        }

        Err(DownloadError::RetriesExhausted(last_error.to_string()))
    }

    fn verify(&self, bytes: Bytes) -> Result<Bytes, DownloadError> {
        if bytes.is_empty() {
            return Err(DownloadError::EmptyBody);
        }

        match &self.expected_sha256 {
            Some(expected) => {
                let actual = sha256_hex(&bytes);
                if &actual == expected {
                    Ok(bytes)
                } else {
                    Err(DownloadError::ChecksumMismatch {
                        expected: expected.clone(),
                        actual,
                    })
                }
            }
            None => Ok(bytes),
        }
    }
}
