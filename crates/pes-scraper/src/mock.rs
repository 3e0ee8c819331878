//! Mock clients for testing without network access
//!
//! # Usage
//!
//! ```no_run
//! use pes_scraper::mock::{MockGamesCatalog, catalog_game};
//!
//! let catalog = MockGamesCatalog::new();
//! catalog.add_page(7, vec![catalog_game(113, 7, "Zelda")]);
//! catalog.fail_page(7, 2);
//! ```

use crate::{
    AchievementsCatalog, ArtifactFetcher, CatalogGameRecord, CatalogPage, GameImages,
    GameProgress, GamesCatalog, HashLibrary, ImageUrls, ImagesPage, LoginSession, ScraperError,
};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// Base URL used for generated image URLs
pub const MOCK_CDN: &str = "https://cdn.test";

/// Image URLs at all three sizes under [`MOCK_CDN`]
pub fn image_urls(name: &str) -> ImageUrls {
    ImageUrls {
        original: format!("{}/original/{}.jpg", MOCK_CDN, name),
        large: format!("{}/large/{}.jpg", MOCK_CDN, name),
        medium: format!("{}/medium/{}.jpg", MOCK_CDN, name),
    }
}

/// A catalog game with a front cover
pub fn catalog_game(id: i64, platform_id: i64, title: &str) -> CatalogGameRecord {
    CatalogGameRecord {
        id,
        platform_id,
        title: title.to_string(),
        overview: Some(format!("{} overview", title)),
        release_date: Some("1987-01-01".to_string()),
        front: Some(image_urls(&format!("front/{}", id))),
    }
}

#[derive(Debug, Default)]
struct CatalogState {
    pages: HashMap<i64, Vec<Vec<CatalogGameRecord>>>,
    failing: HashSet<(i64, u32)>,
    images: HashMap<i64, GameImages>,
    requests: Vec<(i64, u32)>,
    image_requests: Vec<(i64, u32, u32)>,
}

/// In-memory games catalog
#[derive(Debug, Default)]
pub struct MockGamesCatalog {
    state: RwLock<CatalogState>,
}

impl MockGamesCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a page of games for a platform
    pub fn add_page(&self, platform_id: i64, games: Vec<CatalogGameRecord>) {
        if let Ok(mut state) = self.state.write() {
            state.pages.entry(platform_id).or_default().push(games);
        }
    }

    /// Make a page time out
    pub fn fail_page(&self, platform_id: i64, page: u32) {
        if let Ok(mut state) = self.state.write() {
            state.failing.insert((platform_id, page));
        }
    }

    /// Back cover and screenshots returned by the images endpoint
    pub fn set_images(&self, images: GameImages) {
        if let Ok(mut state) = self.state.write() {
            state.images.insert(images.game_id, images);
        }
    }

    /// Every `(platform_id, page)` requested so far
    pub fn requests(&self) -> Vec<(i64, u32)> {
        self.state
            .read()
            .map(|s| s.requests.clone())
            .unwrap_or_default()
    }

    /// `(platform_id, batch, page)` of every images request
    pub fn image_requests(&self) -> Vec<(i64, u32, u32)> {
        self.state
            .read()
            .map(|s| s.image_requests.clone())
            .unwrap_or_default()
    }
}

impl GamesCatalog for MockGamesCatalog {
    fn fetch_games(&self, platform_id: i64, page: u32) -> Result<CatalogPage, ScraperError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| ScraperError::Unavailable("mock state poisoned".to_string()))?;
        state.requests.push((platform_id, page));
        tracing::debug!("[MOCK] Games page {} for platform {}", page, platform_id);

        if state.failing.contains(&(platform_id, page)) {
            return Err(ScraperError::Timeout(format!(
                "platform {} page {}",
                platform_id, page
            )));
        }

        let pages = state.pages.get(&platform_id).map(Vec::as_slice).unwrap_or(&[]);
        let index = page.saturating_sub(1) as usize;
        let games = pages.get(index).cloned().unwrap_or_default();
        let next_page = if index + 1 < pages.len() {
            Some(page + 1)
        } else {
            None
        };

        Ok(CatalogPage { games, next_page })
    }

    fn fetch_images(
        &self,
        platform_id: i64,
        game_ids: &[i64],
        batch: u32,
        page: u32,
    ) -> Result<ImagesPage, ScraperError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| ScraperError::Unavailable("mock state poisoned".to_string()))?;
        state.image_requests.push((platform_id, batch, page));
        tracing::debug!("[MOCK] Images batch {} page {} for platform {}", batch, page, platform_id);

        let games = game_ids
            .iter()
            .filter_map(|id| state.images.get(id).cloned())
            .collect();
        Ok(ImagesPage {
            games,
            next_page: None,
        })
    }
}

#[derive(Debug, Default)]
struct AchievementsState {
    libraries: HashMap<i64, HashLibrary>,
    progress: HashMap<i64, GameProgress>,
    offline: bool,
    hash_requests: Vec<i64>,
    progress_requests: Vec<i64>,
}

/// In-memory achievements service
#[derive(Debug, Default)]
pub struct MockAchievementsCatalog {
    state: RwLock<AchievementsState>,
}

impl MockAchievementsCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_library(&self, console_id: i64, library: HashLibrary) {
        if let Ok(mut state) = self.state.write() {
            state.libraries.insert(console_id, library);
        }
    }

    pub fn set_progress(&self, game_id: i64, progress: GameProgress) {
        if let Ok(mut state) = self.state.write() {
            state.progress.insert(game_id, progress);
        }
    }

    /// Fail every request with a network error
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut state) = self.state.write() {
            state.offline = offline;
        }
    }

    pub fn hash_requests(&self) -> Vec<i64> {
        self.state
            .read()
            .map(|s| s.hash_requests.clone())
            .unwrap_or_default()
    }

    pub fn progress_requests(&self) -> Vec<i64> {
        self.state
            .read()
            .map(|s| s.progress_requests.clone())
            .unwrap_or_default()
    }
}

impl AchievementsCatalog for MockAchievementsCatalog {
    fn game_hashes(&self, console_id: i64) -> Result<HashLibrary, ScraperError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| ScraperError::Unavailable("mock state poisoned".to_string()))?;
        state.hash_requests.push(console_id);
        if state.offline {
            return Err(ScraperError::Network("mock offline".to_string()));
        }
        Ok(state.libraries.get(&console_id).cloned().unwrap_or_default())
    }

    fn login(&self, user: &str, _password: &str) -> Result<LoginSession, ScraperError> {
        let state = self
            .state
            .read()
            .map_err(|_| ScraperError::Unavailable("mock state poisoned".to_string()))?;
        if state.offline {
            return Err(ScraperError::Network("mock offline".to_string()));
        }
        Ok(LoginSession {
            token: format!("{}-token", user),
            score: 0,
        })
    }

    fn game_progress(
        &self,
        _user: &str,
        _api_key: &str,
        game_id: i64,
    ) -> Result<GameProgress, ScraperError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| ScraperError::Unavailable("mock state poisoned".to_string()))?;
        state.progress_requests.push(game_id);
        if state.offline {
            return Err(ScraperError::Network("mock offline".to_string()));
        }
        Ok(state.progress.get(&game_id).cloned().unwrap_or_default())
    }
}

#[derive(Debug, Default)]
struct FetcherState {
    bodies: HashMap<String, Vec<u8>>,
    requests: Vec<String>,
}

/// Serves registered URLs; anything else is a 404
#[derive(Debug, Default)]
pub struct MockFetcher {
    state: RwLock<FetcherState>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, url: &str, body: &[u8]) {
        if let Ok(mut state) = self.state.write() {
            state.bodies.insert(url.to_string(), body.to_vec());
        }
    }

    /// Every URL requested so far
    pub fn requests(&self) -> Vec<String> {
        self.state
            .read()
            .map(|s| s.requests.clone())
            .unwrap_or_default()
    }
}

impl ArtifactFetcher for MockFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, ScraperError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| ScraperError::Unavailable("mock state poisoned".to_string()))?;
        state.requests.push(url.to_string());
        state
            .bodies
            .get(url)
            .cloned()
            .ok_or_else(|| ScraperError::Network(format!("{} returned 404 Not Found", url)))
    }
}
