//! ROM library service for PES
//!
//! Walks the configured console directories, identifies ROM files by content
//! signature and reconciles them against the SQLite library and the external
//! metadata services. A full scan runs on one background worker and reports
//! progress over a channel.

mod achievements;
mod artifacts;
mod cache;
mod catalog;
mod database;
mod identifier;
mod listing;
mod reconciler;
mod scanner;

pub use achievements::{AchievementSync, BadgeSync};
pub use artifacts::{Artifact, ArtifactStore};
pub use cache::{ArtifactCache, CacheKey, CacheWriteError, CachedArtifact, INDEX_FLUSH_INTERVAL};
pub use catalog::{CatalogSync, MAX_CONSECUTIVE_FAILURES, normalise_title};
pub use database::{
    AchievementBadge, AchievementGame, CatalogGame, ConsoleCount, ConsoleRow, LibraryEntry,
    LibraryStore, NewEntry,
};
pub use identifier::{Enumeration, FileIdentifier, IdentifiedFile, md5_file};
pub use listing::{ListingCache, ListingKey};
pub use reconciler::{FileProgress, ReconcileEvent, ReconcileOutcome, Reconciler, ScanCounts};
pub use scanner::{ScanController, ScanEvent, ScanReport, ScanServices, ScanState};

use pes_scraper::ScraperError;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("Game not found: {0}")]
    GameNotFound(i64),

    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Metadata service error: {0}")]
    Scraper(#[from] ScraperError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheWriteError),
}

/// Failure to identify a single file
#[derive(Debug, Error)]
pub enum IdentifyError {
    #[error("Unknown game: {0}")]
    UnknownGame(String),

    #[error("Not a file: {0}")]
    NotAFile(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cooperative cancellation flag shared with the scan worker
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
