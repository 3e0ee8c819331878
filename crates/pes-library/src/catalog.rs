//! Catalog synchronisation
//!
//! Pulls a platform's games from theGamesDB and a console's hash library
//! from RetroAchievements into the local store. Paging is tolerant: a failed
//! page is logged and the next one tried, until two consecutive pages fail.

use crate::{CancelToken, LibraryError, LibraryStore};
use pes_scraper::{AchievementsCatalog, GamesCatalog, IMAGE_BATCH_SIZE};
use std::collections::HashMap;
use std::sync::Arc;

/// Consecutive page failures after which a listing is abandoned
pub const MAX_CONSECUTIVE_FAILURES: u32 = 2;

/// Title key used for matching: lower-case, spaces and colons removed
pub fn normalise_title(title: &str) -> String {
    title
        .chars()
        .filter(|c| *c != ' ' && *c != ':')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

pub struct CatalogSync {
    games: Arc<dyn GamesCatalog>,
    achievements: Arc<dyn AchievementsCatalog>,
}

impl CatalogSync {
    pub fn new(games: Arc<dyn GamesCatalog>, achievements: Arc<dyn AchievementsCatalog>) -> Self {
        Self { games, achievements }
    }

    /// Fetch every page of a platform when it has no stored games or `force` is set
    ///
    /// Returns the number of games stored by this call.
    pub fn sync_platform(
        &self,
        store: &LibraryStore,
        platform_id: i64,
        force: bool,
        cancel: &CancelToken,
    ) -> Result<usize, LibraryError> {
        if !force && store.catalog_game_count(platform_id)? > 0 {
            tracing::debug!("Platform {} already in catalog", platform_id);
            return Ok(0);
        }

        tracing::info!("Downloading games list for platform {}", platform_id);

        let mut page = 1;
        let mut position = 0i64;
        let mut failures = 0;
        loop {
            if cancel.is_cancelled() {
                return Ok(position as usize);
            }

            match self.games.fetch_games(platform_id, page) {
                Ok(result) => {
                    failures = 0;
                    for game in &result.games {
                        store.upsert_catalog_game(game, position)?;
                        position += 1;
                    }
                    match result.next_page {
                        Some(next) => page = next,
                        None => break,
                    }
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!("Platform {} page {} failed: {}", platform_id, page, e);
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        tracing::warn!(
                            "Giving up on platform {} after {} failed pages",
                            platform_id,
                            failures
                        );
                        break;
                    }
                    page += 1;
                }
            }
        }

        tracing::info!("Platform {}: {} games stored", platform_id, position);

        if position > 0 {
            self.sync_images(store, platform_id, cancel)?;
        }
        Ok(position as usize)
    }

    /// Fetch back covers and screenshots for every stored game of a platform
    fn sync_images(
        &self,
        store: &LibraryStore,
        platform_id: i64,
        cancel: &CancelToken,
    ) -> Result<(), LibraryError> {
        store.clear_catalog_screenshots(platform_id)?;
        let ids = store.catalog_game_ids(platform_id)?;

        // Batches are numbered per platform so archived responses replay stably
        for (batch, chunk) in (1u32..).zip(ids.chunks(IMAGE_BATCH_SIZE)) {
            let mut page = 1;
            let mut failures = 0;
            loop {
                if cancel.is_cancelled() {
                    return Ok(());
                }

                match self.games.fetch_images(platform_id, chunk, batch, page) {
                    Ok(result) => {
                        failures = 0;
                        for images in &result.games {
                            store.add_catalog_images(images)?;
                        }
                        match result.next_page {
                            Some(next) => page = next,
                            None => break,
                        }
                    }
                    Err(e) => {
                        failures += 1;
                        tracing::warn!(
                            "Platform {} images batch {} page {} failed: {}",
                            platform_id,
                            batch,
                            page,
                            e
                        );
                        if failures >= MAX_CONSECUTIVE_FAILURES {
                            break;
                        }
                        page += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Store a console's hash library and link it to the catalog
    ///
    /// Skipped when hashes are already stored unless `force` is set.
    pub fn sync_hashes(
        &self,
        store: &LibraryStore,
        achievements_id: i64,
        platform_id: i64,
        force: bool,
    ) -> Result<usize, LibraryError> {
        if !force && store.achievement_game_count(achievements_id)? > 0 {
            tracing::debug!("Achievements console {} already stored", achievements_id);
            return Ok(0);
        }

        let library = match self.achievements.game_hashes(achievements_id) {
            Ok(library) => library,
            Err(e) => {
                tracing::warn!(
                    "Could not fetch hash library for console {}: {}",
                    achievements_id,
                    e
                );
                return Ok(0);
            }
        };

        let stored = store.store_hash_library(achievements_id, &library)?;
        let linked = self.link(store, platform_id, achievements_id)?;
        tracing::info!(
            "Achievements console {}: {} games, {} linked to catalog",
            achievements_id,
            stored,
            linked
        );
        Ok(stored)
    }

    /// Link catalog games to achievements games with the same normalised title
    pub fn link(
        &self,
        store: &LibraryStore,
        platform_id: i64,
        achievements_id: i64,
    ) -> Result<usize, LibraryError> {
        let mut by_title: HashMap<String, i64> = HashMap::new();
        for (id, title) in store.achievement_titles(achievements_id)? {
            by_title.entry(normalise_title(&title)).or_insert(id);
        }

        let mut linked = 0;
        for (catalog_id, title) in store.catalog_titles(platform_id)? {
            if let Some(achievement_id) = by_title.get(&normalise_title(&title)) {
                store.set_catalog_achievement(catalog_id, *achievement_id)?;
                linked += 1;
            }
        }
        Ok(linked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pes_scraper::mock::{MockAchievementsCatalog, MockGamesCatalog, catalog_game};
    use pes_scraper::{AchievementGameHashes, HashLibrary};

    fn sync(games: Arc<MockGamesCatalog>, achievements: Arc<MockAchievementsCatalog>) -> CatalogSync {
        CatalogSync::new(games, achievements)
    }

    #[test]
    fn test_normalise_title() {
        assert_eq!(normalise_title("Zelda II: The Adventure of Link"), "zeldaiitheadventureoflink");
        assert_eq!(normalise_title("zelda"), "zelda");
        assert_eq!(normalise_title(" Super  Mario "), "supermario");
    }

    #[test]
    fn test_sync_platform_pages_in_order() {
        let store = LibraryStore::in_memory().unwrap();
        let games = Arc::new(MockGamesCatalog::new());
        games.add_page(7, vec![catalog_game(1, 7, "Zelda"), catalog_game(2, 7, "Metroid")]);
        games.add_page(7, vec![catalog_game(3, 7, "Zelda")]);

        let sync = sync(games.clone(), Arc::new(MockAchievementsCatalog::new()));
        let stored = sync
            .sync_platform(&store, 7, false, &CancelToken::new())
            .unwrap();

        assert_eq!(stored, 3);
        assert_eq!(store.catalog_game_ids(7).unwrap(), vec![1, 2, 3]);
        assert_eq!(games.image_requests(), vec![(7, 1, 1)]);

        // Already stored: no refetch
        assert_eq!(
            sync.sync_platform(&store, 7, false, &CancelToken::new())
                .unwrap(),
            0
        );
        assert_eq!(games.requests().len(), 2);
    }

    #[test]
    fn test_image_batches_numbered_per_platform() {
        let games = Arc::new(MockGamesCatalog::new());
        let nes: Vec<_> = (1..=IMAGE_BATCH_SIZE as i64 + 1)
            .map(|id| catalog_game(id, 7, "Game"))
            .collect();
        games.add_page(7, nes);
        games.add_page(8, vec![catalog_game(5000, 8, "Mario")]);

        // Separate scans, each with a fresh sync
        let store = LibraryStore::in_memory().unwrap();
        sync(games.clone(), Arc::new(MockAchievementsCatalog::new()))
            .sync_platform(&store, 7, false, &CancelToken::new())
            .unwrap();
        sync(games.clone(), Arc::new(MockAchievementsCatalog::new()))
            .sync_platform(&store, 8, false, &CancelToken::new())
            .unwrap();
        sync(games.clone(), Arc::new(MockAchievementsCatalog::new()))
            .sync_platform(&store, 7, true, &CancelToken::new())
            .unwrap();

        assert_eq!(
            games.image_requests(),
            vec![(7, 1, 1), (7, 2, 1), (8, 1, 1), (7, 1, 1), (7, 2, 1)]
        );
    }

    #[test]
    fn test_sync_platform_tolerates_failed_page() {
        let store = LibraryStore::in_memory().unwrap();
        let games = Arc::new(MockGamesCatalog::new());
        games.add_page(7, vec![catalog_game(1, 7, "Mario")]);
        games.add_page(7, vec![catalog_game(2, 7, "Metroid")]);
        games.add_page(7, vec![catalog_game(3, 7, "Zelda")]);
        games.fail_page(7, 2);

        let sync = sync(games.clone(), Arc::new(MockAchievementsCatalog::new()));
        sync.sync_platform(&store, 7, false, &CancelToken::new())
            .unwrap();

        assert_eq!(store.catalog_game_ids(7).unwrap(), vec![1, 3]);
        assert_eq!(games.requests(), vec![(7, 1), (7, 2), (7, 3)]);
    }

    #[test]
    fn test_sync_platform_gives_up_after_consecutive_failures() {
        let store = LibraryStore::in_memory().unwrap();
        let games = Arc::new(MockGamesCatalog::new());
        games.add_page(7, vec![catalog_game(1, 7, "Mario")]);
        games.add_page(7, vec![catalog_game(2, 7, "Metroid")]);
        games.add_page(7, vec![catalog_game(3, 7, "Zelda")]);
        games.fail_page(7, 1);
        games.fail_page(7, 2);

        let sync = sync(games.clone(), Arc::new(MockAchievementsCatalog::new()));
        let stored = sync
            .sync_platform(&store, 7, false, &CancelToken::new())
            .unwrap();

        assert_eq!(stored, 0);
        assert_eq!(games.requests().len(), MAX_CONSECUTIVE_FAILURES as usize);
    }

    #[test]
    fn test_sync_hashes_links_catalog() {
        let store = LibraryStore::in_memory().unwrap();
        let games = Arc::new(MockGamesCatalog::new());
        games.add_page(7, vec![catalog_game(113, 7, "The Legend of Zelda")]);

        let achievements = Arc::new(MockAchievementsCatalog::new());
        let mut library = HashLibrary::new();
        library.insert(
            1,
            AchievementGameHashes {
                hashes: vec!["aa".to_string()],
                title: Some("The Legend Of: Zelda".to_string()),
            },
        );
        achievements.set_library(7, library);

        let sync = sync(games, achievements.clone());
        sync.sync_platform(&store, 7, false, &CancelToken::new())
            .unwrap();
        assert_eq!(sync.sync_hashes(&store, 7, 7, false).unwrap(), 1);

        let linked = store.catalog_for_achievement(7, 1).unwrap().unwrap();
        assert_eq!(linked.id, 113);

        // Stored hashes are not refetched without force
        sync.sync_hashes(&store, 7, 7, false).unwrap();
        assert_eq!(achievements.hash_requests(), vec![7]);
    }

    #[test]
    fn test_sync_hashes_offline() {
        let store = LibraryStore::in_memory().unwrap();
        let achievements = Arc::new(MockAchievementsCatalog::new());
        achievements.set_offline(true);

        let sync = sync(Arc::new(MockGamesCatalog::new()), achievements);
        assert_eq!(sync.sync_hashes(&store, 7, 7, false).unwrap(), 0);
    }
}
