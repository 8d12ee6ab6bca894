use bytes::Bytes;
use sha2::{Digest, Sha256};

mod blob_cache;
mod model_fetcher;

pub use crate::data_loader::blob_cache::{BlobCache, CacheLookup, FsBlobCache, MemoryBlobCache};
pub use crate::data_loader::model_fetcher::{
    ByteFetcher, DownloadProgress, HttpFetcher, ModelFetcher, ProgressObserver,
};

#[cfg(test)]
pub(crate) use crate::data_loader::model_fetcher::tests::ScriptedFetcher;

/// A downloaded or cached model, treated as an opaque, immutable blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelArtifact {
    pub url: String,
    pub bytes: Bytes,
}

impl ModelArtifact {
    pub fn new(url: impl Into<String>, bytes: Bytes) -> Self {
        ModelArtifact {
            url: url.into(),
            bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Store key for a model URL: its basename, without query or fragment.
///
/// `https://host/models/lama_fp32.onnx?download=true` maps to `lama_fp32.onnx`.
pub fn cache_key(url: &str) -> DataLoaderResult<String> {
    let path = url
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .trim_end_matches('/');

    match path.rsplit('/').next() {
        Some(name) if !name.is_empty() && !name.contains(':') => Ok(name.to_string()),
        _ => Err(DataLoaderError::InvalidUrl(url.to_string())),
    }
}

/// Lowercase hex SHA-256 of a blob.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Data Loader Result
pub type DataLoaderResult<T> = Result<T, DataLoaderError>;

#[derive(Debug, thiserror::Error)]
pub enum DataLoaderError {
    #[error("cache read failed for '{key}': {reason}")]
    CacheRead { key: String, reason: String },

    #[error("cache write failed for '{key}': {reason}")]
    CacheWrite { key: String, reason: String },

    #[error("download of '{url}' failed: {source}")]
    Download {
        url: String,
        #[source]
        source: DownloadError,
    },

    #[error("cannot derive a cache key from url '{0}'")]
    InvalidUrl(String),
}

/// Why a network fetch did not produce usable model bytes.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("HTTP error: {status}")]
    Http { status: u16 },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("request timeout after {0}ms")]
    Timeout(u64),

    #[error("response body was empty")]
    EmptyBody,

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("client configuration error: {0}")]
    Configuration(String),

    #[error("all retries exhausted: {0}")]
    RetriesExhausted(String),
}

impl DownloadError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Connection(_) => true,
            DownloadError::Timeout(_) => true,
            DownloadError::Http { status } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DownloadError::Timeout(0)
        } else if let Some(status) = err.status() {
            DownloadError::Http {
                status: status.as_u16(),
            }
        } else if err.is_builder() {
            DownloadError::Configuration(err.to_string())
        } else {
            DownloadError::Connection(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_url_basename() {
        assert_eq!(
            cache_key("https://huggingface.co/Carve/LaMa-ONNX/resolve/main/lama_fp32.onnx").unwrap(),
            "lama_fp32.onnx"
        );
        assert_eq!(cache_key("/lama_fp32.onnx").unwrap(), "lama_fp32.onnx");
        assert_eq!(
            cache_key("https://host/m/model.onnx?download=true#frag").unwrap(),
            "model.onnx"
        );
    }

    #[test]
    fn cache_key_rejects_urls_without_a_file() {
        assert!(cache_key("").is_err());
        assert!(cache_key("https://").is_err());
    }

    #[test]
    fn retryable_errors() {
        assert!(DownloadError::Http { status: 503 }.is_retryable());
        assert!(DownloadError::Http { status: 429 }.is_retryable());
        assert!(!DownloadError::Http { status: 404 }.is_retryable());
        assert!(!DownloadError::EmptyBody.is_retryable());
    }

    #[test]
    fn sha256_of_known_input() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
