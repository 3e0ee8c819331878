//! External metadata clients for PES
//!
//! Talks to theGamesDB (titles, overviews, box art and screenshots) and
//! RetroAchievements (hash libraries, badges and user progress).
//!
//! # Features
//!
//! - Blocking facade over the async HTTP client, usable from a scan worker
//! - Raw responses archived as JSON for later replay
//! - Replay clients that serve archived responses without network access
//! - Mock clients for tests

mod archive;
mod gamesdb;
mod http;
pub mod mock;
mod replay;
mod retroachievements;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub use archive::JsonArchive;
pub use gamesdb::{GamesDbClient, IMAGE_BATCH_SIZE, parse_games_page, parse_images_page};
pub use http::HttpClient;
pub use replay::{ReplayAchievementsCatalog, ReplayGamesCatalog};
pub use retroachievements::{
    RetroAchievementsClient, parse_game_progress, parse_games_list, parse_hash_library,
    parse_login,
};

#[derive(Debug, Error)]
pub enum ScraperError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Service returned status: {0}")]
    BadStatus(String),

    #[error("Malformed response: {0}")]
    BadResponse(String),

    #[error("Not available: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for ScraperError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ScraperError::Timeout(err.to_string())
        } else if err.is_decode() {
            ScraperError::BadResponse(err.to_string())
        } else {
            ScraperError::Network(err.to_string())
        }
    }
}

/// Remote image at the three sizes theGamesDB publishes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrls {
    pub original: String,
    pub large: String,
    pub medium: String,
}

impl ImageUrls {
    /// URLs in the order they should be tried
    pub fn candidates(&self) -> [&str; 3] {
        [&self.large, &self.medium, &self.original]
    }
}

/// One game from a theGamesDB platform listing
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogGameRecord {
    pub id: i64,
    pub platform_id: i64,
    pub title: String,
    pub overview: Option<String>,
    pub release_date: Option<String>,
    pub front: Option<ImageUrls>,
}

/// A page of a platform listing
#[derive(Debug, Clone, Default)]
pub struct CatalogPage {
    pub games: Vec<CatalogGameRecord>,
    pub next_page: Option<u32>,
}

/// Back cover and screenshots for one game
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GameImages {
    pub game_id: i64,
    pub back: Option<ImageUrls>,
    pub screenshots: Vec<ImageUrls>,
}

/// A page of the images endpoint
#[derive(Debug, Clone, Default)]
pub struct ImagesPage {
    pub games: Vec<GameImages>,
    pub next_page: Option<u32>,
}

/// Hashes and title for one RetroAchievements game
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AchievementGameHashes {
    #[serde(default)]
    pub hashes: Vec<String>,

    #[serde(default, rename = "name")]
    pub title: Option<String>,
}

/// Game id to hashes for one RetroAchievements console
pub type HashLibrary = BTreeMap<i64, AchievementGameHashes>;

/// Session returned by a RetroAchievements login
#[derive(Debug, Clone)]
pub struct LoginSession {
    pub token: String,
    pub score: i64,
}

/// One achievement with the user's unlock state
#[derive(Debug, Clone, PartialEq)]
pub struct BadgeProgress {
    pub id: i64,
    pub badge_name: String,
    pub title: String,
    pub description: String,
    pub points: i64,
    pub display_order: i64,
    pub total_awarded: i64,
    pub total_awarded_hardcore: i64,
    pub earned: Option<NaiveDateTime>,
    pub earned_hardcore: Option<NaiveDateTime>,
}

impl BadgeProgress {
    pub fn is_earned(&self) -> bool {
        self.earned.is_some() || self.earned_hardcore.is_some()
    }
}

/// A game's achievements and player counts for one user
#[derive(Debug, Clone, Default)]
pub struct GameProgress {
    pub badges: Vec<BadgeProgress>,
    pub players: i64,
    pub players_hardcore: i64,
}

/// Games catalog service (theGamesDB)
pub trait GamesCatalog: Send + Sync {
    /// Fetch one page of games for a platform (pages start at 1)
    fn fetch_games(&self, platform_id: i64, page: u32) -> Result<CatalogPage, ScraperError>;

    /// Fetch back covers and screenshots for up to [`IMAGE_BATCH_SIZE`] games
    ///
    /// `batch` numbers the platform's id chunks from 1 and keys the archive.
    fn fetch_images(
        &self,
        platform_id: i64,
        game_ids: &[i64],
        batch: u32,
        page: u32,
    ) -> Result<ImagesPage, ScraperError>;
}

/// Achievements service (RetroAchievements)
pub trait AchievementsCatalog: Send + Sync {
    fn game_hashes(&self, console_id: i64) -> Result<HashLibrary, ScraperError>;

    fn login(&self, user: &str, password: &str) -> Result<LoginSession, ScraperError>;

    fn game_progress(
        &self,
        user: &str,
        api_key: &str,
        game_id: i64,
    ) -> Result<GameProgress, ScraperError>;
}

/// Downloads remote artifacts (cover art, screenshots, badges)
pub trait ArtifactFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, ScraperError>;
}
