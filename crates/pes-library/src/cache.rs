//! On-disk cache of fetched images
//!
//! Blobs are stored content-addressed (SHA-256 of the bytes plus the source
//! extension) and `index.json` maps each `(url, variant)` key to its blob.
//! Both are written through a temporary file and renamed into place, so a
//! reader never sees a partial file. The index is flushed every
//! [`INDEX_FLUSH_INTERVAL`] puts, on [`ArtifactCache::flush`] and on drop; a
//! blob whose index entry was lost is simply fetched again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

const INDEX_FILE: &str = "index.json";
const DEFAULT_EXTENSION: &str = "bin";

/// Puts between automatic index writes
pub const INDEX_FLUSH_INTERVAL: usize = 64;

#[derive(Debug, Error)]
pub enum CacheWriteError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Index error: {0}")]
    Index(#[from] serde_json::Error),

    #[error("Cache index lock poisoned")]
    Poisoned,
}

/// Identifies a cached artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub url: String,
    /// Distinguishes uses of the same URL, e.g. "front" or "badge-locked"
    pub variant: String,
}

impl CacheKey {
    pub fn new(url: impl Into<String>, variant: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            variant: variant.into(),
        }
    }

    fn index_key(&self) -> String {
        format!("{}|{}", self.variant, self.url)
    }

    /// Extension of the source URL, `bin` when there is none
    fn extension(&self) -> String {
        let path = self.url.split(['?', '#']).next().unwrap_or_default();
        let name = path.rsplit('/').next().unwrap_or_default();
        match name.rsplit_once('.') {
            Some((stem, ext))
                if !stem.is_empty()
                    && (1..=5).contains(&ext.len())
                    && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
            {
                ext.to_ascii_lowercase()
            }
            _ => DEFAULT_EXTENSION.to_string(),
        }
    }
}

/// A cached copy of a remote artifact
#[derive(Debug, Clone, PartialEq)]
pub struct CachedArtifact {
    pub key: CacheKey,
    pub path: PathBuf,
    pub size: u64,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexRecord {
    url: String,
    variant: String,
    file: String,
    size: u64,
    fetched_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Index {
    records: BTreeMap<String, IndexRecord>,
    /// Changes not yet written to disk
    pending: usize,
}

/// Content-addressed artifact cache
pub struct ArtifactCache {
    dir: PathBuf,
    index: Mutex<Index>,
}

impl ArtifactCache {
    /// Open a cache directory, creating it if needed
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheWriteError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let index_path = dir.join(INDEX_FILE);
        let records = if index_path.is_file() {
            match serde_json::from_str(&fs::read_to_string(&index_path)?) {
                Ok(index) => index,
                Err(e) => {
                    tracing::warn!("Ignoring unreadable cache index {}: {}", index_path.display(), e);
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };

        tracing::debug!("Artifact cache at {} ({} entries)", dir.display(), records.len());
        Ok(Self {
            dir,
            index: Mutex::new(Index {
                records,
                pending: 0,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Look up a cached artifact; never touches the network
    pub fn get(&self, key: &CacheKey) -> Option<CachedArtifact> {
        let index = self.index.lock().ok()?;
        let record = index.records.get(&key.index_key())?;
        let path = self.dir.join(&record.file);

        // Index entry without its file is a miss
        if !path.is_file() {
            return None;
        }

        Some(CachedArtifact {
            key: key.clone(),
            path,
            size: record.size,
            fetched_at: record.fetched_at,
        })
    }

    /// Store bytes under a key, replacing any previous entry
    pub fn put(&self, key: &CacheKey, bytes: &[u8]) -> Result<CachedArtifact, CacheWriteError> {
        let file = format!("{}.{}", hex::encode(Sha256::digest(bytes)), key.extension());
        let path = self.dir.join(&file);

        if !path.is_file() {
            write_atomic(&self.dir, &path, bytes)?;
        }

        let record = IndexRecord {
            url: key.url.clone(),
            variant: key.variant.clone(),
            file,
            size: bytes.len() as u64,
            fetched_at: Utc::now(),
        };

        let mut index = self.index.lock().map_err(|_| CacheWriteError::Poisoned)?;
        index.records.insert(key.index_key(), record.clone());
        index.pending += 1;
        if index.pending >= INDEX_FLUSH_INTERVAL {
            self.write_index(&mut index)?;
        }

        Ok(CachedArtifact {
            key: key.clone(),
            path,
            size: record.size,
            fetched_at: record.fetched_at,
        })
    }

    /// Forget a key; the blob stays if other keys share it
    pub fn invalidate(&self, key: &CacheKey) -> Result<(), CacheWriteError> {
        let mut index = self.index.lock().map_err(|_| CacheWriteError::Poisoned)?;
        if index.records.remove(&key.index_key()).is_some() {
            self.write_index(&mut index)?;
        }
        Ok(())
    }

    /// Write pending index changes
    pub fn flush(&self) -> Result<(), CacheWriteError> {
        let mut index = self.index.lock().map_err(|_| CacheWriteError::Poisoned)?;
        if index.pending > 0 {
            self.write_index(&mut index)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.index.lock().map(|i| i.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write_index(&self, index: &mut Index) -> Result<(), CacheWriteError> {
        let json = serde_json::to_string(&index.records)?;
        write_atomic(&self.dir, &self.dir.join(INDEX_FILE), json.as_bytes())?;
        tracing::debug!("Wrote cache index ({} entries)", index.records.len());
        index.pending = 0;
        Ok(())
    }
}

impl Drop for ArtifactCache {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!("Could not write cache index in {}: {}", self.dir.display(), e);
        }
    }
}

fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<(), CacheWriteError> {
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| CacheWriteError::Io(e.error))?;
    Ok(())
}
