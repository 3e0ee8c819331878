//! Replay clients backed by a [`JsonArchive`]

use crate::{
    AchievementsCatalog, CatalogPage, GameProgress, GamesCatalog, HashLibrary, ImagesPage,
    JsonArchive, LoginSession, ScraperError, parse_games_page, parse_images_page,
};

/// Serves archived theGamesDB responses
pub struct ReplayGamesCatalog {
    archive: JsonArchive,
}

impl ReplayGamesCatalog {
    pub fn new(archive: JsonArchive) -> Self {
        Self { archive }
    }
}

impl GamesCatalog for ReplayGamesCatalog {
    fn fetch_games(&self, platform_id: i64, page: u32) -> Result<CatalogPage, ScraperError> {
        let path = self.archive.games_path(platform_id, page);
        let Some(body) = self.archive.read(&path)? else {
            tracing::warn!("No archived games at {}", path.display());
            return Ok(CatalogPage::default());
        };

        let mut parsed = parse_games_page(&body, page)?;
        // Stop at the last archived page even if the service had more
        parsed.next_page = Some(page + 1)
            .filter(|next| self.archive.games_path(platform_id, *next).is_file());
        Ok(parsed)
    }

    fn fetch_images(
        &self,
        platform_id: i64,
        _game_ids: &[i64],
        batch: u32,
        page: u32,
    ) -> Result<ImagesPage, ScraperError> {
        let path = self.archive.images_path(platform_id, batch, page);
        let Some(body) = self.archive.read(&path)? else {
            tracing::debug!("No archived images at {}", path.display());
            return Ok(ImagesPage::default());
        };

        let mut parsed = parse_images_page(&body, page)?;
        parsed.next_page = Some(page + 1)
            .filter(|next| self.archive.images_path(platform_id, batch, *next).is_file());
        Ok(parsed)
    }
}

/// Serves archived RetroAchievements hash libraries
pub struct ReplayAchievementsCatalog {
    archive: JsonArchive,
}

impl ReplayAchievementsCatalog {
    pub fn new(archive: JsonArchive) -> Self {
        Self { archive }
    }
}

impl AchievementsCatalog for ReplayAchievementsCatalog {
    fn game_hashes(&self, console_id: i64) -> Result<HashLibrary, ScraperError> {
        let path = self.archive.hashes_path(console_id);
        match self.archive.read(&path)? {
            Some(body) => serde_json::from_str(&body)
                .map_err(|e| ScraperError::BadResponse(format!("{}: {}", path.display(), e))),
            None => {
                tracing::warn!("No archived hashes at {}", path.display());
                Ok(HashLibrary::new())
            }
        }
    }

    fn login(&self, _user: &str, _password: &str) -> Result<LoginSession, ScraperError> {
        Err(ScraperError::Unavailable(
            "login is not archived".to_string(),
        ))
    }

    fn game_progress(
        &self,
        _user: &str,
        _api_key: &str,
        game_id: i64,
    ) -> Result<GameProgress, ScraperError> {
        Err(ScraperError::Unavailable(format!(
            "progress for game {} is not archived",
            game_id
        )))
    }
}
