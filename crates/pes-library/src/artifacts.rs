//! Fetch-through access to the artifact cache

use crate::cache::{ArtifactCache, CacheKey, CachedArtifact};
use pes_scraper::{ArtifactFetcher, ImageUrls, ScraperError};
use std::path::Path;
use std::sync::Arc;

/// Result of an artifact fetch
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    Cached(CachedArtifact),
    /// Fetched but the cache write failed; usable for display only
    Uncached { url: String, bytes: Vec<u8> },
}

impl Artifact {
    /// Cached file, if the artifact reached the cache
    pub fn path(&self) -> Option<&Path> {
        match self {
            Artifact::Cached(cached) => Some(&cached.path),
            Artifact::Uncached { .. } => None,
        }
    }
}

/// Combines the cache with a fetcher
#[derive(Clone)]
pub struct ArtifactStore {
    cache: Arc<ArtifactCache>,
    fetcher: Arc<dyn ArtifactFetcher>,
}

impl ArtifactStore {
    pub fn new(cache: Arc<ArtifactCache>, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        Self { cache, fetcher }
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    /// Return the cached copy, fetching it first on a miss or when forced
    pub fn fetch(&self, key: &CacheKey, force: bool) -> Result<Artifact, ScraperError> {
        let cached = self.cache.get(key);
        if !force && let Some(cached) = &cached {
            return Ok(Artifact::Cached(cached.clone()));
        }

        let bytes = match self.fetcher.fetch(&key.url) {
            Ok(bytes) => bytes,
            Err(e) => {
                return match cached {
                    Some(cached) => {
                        tracing::warn!("Refetch of {} failed, keeping cached copy: {}", key.url, e);
                        Ok(Artifact::Cached(cached))
                    }
                    None => Err(e),
                };
            }
        };

        match self.cache.put(key, &bytes) {
            Ok(cached) => {
                tracing::debug!("Cached {} as {}", key.url, cached.path.display());
                Ok(Artifact::Cached(cached))
            }
            Err(e) => {
                tracing::warn!("Could not cache {}: {}", key.url, e);
                Ok(Artifact::Uncached {
                    url: key.url.clone(),
                    bytes,
                })
            }
        }
    }

    /// Try the large, medium and original sizes in turn
    pub fn fetch_first(
        &self,
        urls: &ImageUrls,
        variant: &str,
        force: bool,
    ) -> Result<Artifact, ScraperError> {
        let mut last_error = None;
        for url in urls.candidates() {
            if url.is_empty() {
                continue;
            }
            match self.fetch(&CacheKey::new(url, variant), force) {
                Ok(artifact) => return Ok(artifact),
                Err(e) => {
                    tracing::debug!("{} unavailable: {}", url, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ScraperError::BadResponse("no image URLs".to_string())))
    }
}
