use super::*;

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Distinguishes the temporary files of concurrent writers within a process.
static NEXT_TMP: AtomicU64 = AtomicU64::new(0);

/// Outcome of a cache lookup. Only `Hit` carries usable bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheLookup {
    /// Nothing was ever stored under the key.
    Missing,
    /// An entry exists but holds zero bytes (interrupted or evicted write).
    Empty,
    Hit(Bytes),
}

impl CacheLookup {
    pub fn into_hit(self) -> Option<Bytes> {
        match self {
            CacheLookup::Hit(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// Key-addressed persistent byte store.
#[async_trait]
pub trait BlobCache: Send + Sync {
    async fn get(&self, key: &str) -> DataLoaderResult<CacheLookup>;

    /// Store `data` under `key`. Readers never observe a partially written blob.
    async fn put(&self, key: &str, data: &Bytes) -> DataLoaderResult<()>;
}

/// Blob store backed by one directory, one file per key.
#[derive(Debug, Clone)]
pub struct FsBlobCache {
    root: PathBuf,
}

impl FsBlobCache {
    /// Create or open the cache directory.
    pub async fn open(root: impl Into<PathBuf>) -> DataLoaderResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| DataLoaderError::CacheWrite {
                key: root.display().to_string(),
                reason: e.to_string(),
            })?;

        info!("model cache opened at '{}'", root.display());
        Ok(FsBlobCache { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// A fresh temporary path for one write of `key`, unique across
    /// processes sharing the directory.
    fn tmp_path(&self, key: &str) -> PathBuf {
        let n = NEXT_TMP.fetch_add(1, Ordering::Relaxed);
        self.root.join(format!(".{key}.{}.{n}.tmp", std::process::id()))
    }
}

#[async_trait]
impl BlobCache for FsBlobCache {
    async fn get(&self, key: &str) -> DataLoaderResult<CacheLookup> {
        let path = self.blob_path(key);

        match fs::read(&path).await {
            Ok(data) if data.is_empty() => Ok(CacheLookup::Empty),
            Ok(data) => {
                debug!("cache hit for '{}' ({} bytes)", key, data.len());
                Ok(CacheLookup::Hit(Bytes::from(data)))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(CacheLookup::Missing),
            Err(e) => Err(DataLoaderError::CacheRead {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn put(&self, key: &str, data: &Bytes) -> DataLoaderResult<()> {
        let write_error = |e: std::io::Error| DataLoaderError::CacheWrite {
            key: key.to_string(),
            reason: e.to_string(),
        };

        let tmp_path = self.tmp_path(key);

        if let Err(e) = fs::write(&tmp_path, data).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(write_error(e));
        }

        if let Err(e) = fs::rename(&tmp_path, self.blob_path(key)).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(write_error(e));
        }

        info!("stored '{}' ({} bytes)", key, data.len());
        Ok(())
    }
}

/// In-process blob store. Used when no cache directory is configured and in tests.
#[derive(Debug, Default)]
pub struct MemoryBlobCache {
    entries: RwLock<HashMap<String, Bytes>>,
    fail_writes: AtomicBool,
}

impl MemoryBlobCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` fail, as a full quota would.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Seed an entry directly, bypassing the failure switch.
    pub async fn insert(&self, key: &str, data: Bytes) {
        self.entries.write().await.insert(key.to_string(), data);
    }
}

#[async_trait]
impl BlobCache for MemoryBlobCache {
    async fn get(&self, key: &str) -> DataLoaderResult<CacheLookup> {
        let entries = self.entries.read().await;

        Ok(match entries.get(key) {
            None => CacheLookup::Missing,
            Some(data) if data.is_empty() => CacheLookup::Empty,
            Some(data) => CacheLookup::Hit(data.clone()),
        })
    }

    async fn put(&self, key: &str, data: &Bytes) -> DataLoaderResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DataLoaderError::CacheWrite {
                key: key.to_string(),
                reason: "quota exceeded".to_string(),
            });
        }

        self.entries
            .write()
            .await
            .insert(key.to_string(), data.clone());
        Ok(())
    }
}
