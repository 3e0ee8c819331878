//! RetroAchievements badge synchronisation

use crate::artifacts::ArtifactStore;
use crate::cache::CacheKey;
use crate::database::{AchievementBadge, LibraryStore};
use crate::{CancelToken, LibraryError};
use chrono::Utc;
use pes_scraper::{AchievementsCatalog, BadgeProgress, LoginSession};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Result of syncing one game
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BadgeSync {
    pub badges: usize,
    pub score: i64,
    pub max_score: i64,
    /// False when stored badges were still current
    pub refreshed: bool,
    pub interrupted: bool,
}

/// Keeps a user's achievement progress in the library
pub struct AchievementSync {
    achievements: Arc<dyn AchievementsCatalog>,
    artifacts: ArtifactStore,
    badge_url: String,
    user: String,
    api_key: String,
    hardcore: bool,
    synced: Mutex<HashSet<i64>>,
}

impl AchievementSync {
    pub fn new(
        achievements: Arc<dyn AchievementsCatalog>,
        artifacts: ArtifactStore,
        badge_url: &str,
        user: &str,
        api_key: &str,
        hardcore: bool,
    ) -> Self {
        Self {
            achievements,
            artifacts,
            badge_url: badge_url.trim_end_matches('/').to_string(),
            user: user.to_string(),
            api_key: api_key.to_string(),
            hardcore,
            synced: Mutex::new(HashSet::new()),
        }
    }

    /// Verify the user's credentials
    pub fn login(&self, password: &str) -> Result<LoginSession, LibraryError> {
        Ok(self.achievements.login(&self.user, password)?)
    }

    /// Refresh badges for a library entry's achievements game
    ///
    /// Badges are refetched when none are stored, the game was never synced
    /// or played, or it was played since the last sync. Each game is synced
    /// at most once per session.
    pub fn sync(
        &self,
        store: &LibraryStore,
        entry_id: i64,
        cancel: &CancelToken,
    ) -> Result<BadgeSync, LibraryError> {
        let entry = store
            .entry(entry_id)?
            .ok_or(LibraryError::GameNotFound(entry_id))?;
        let Some(game_id) = entry.achievement_game_id else {
            return Ok(BadgeSync::default());
        };
        let mut game = store
            .achievement_game(game_id)?
            .ok_or(LibraryError::GameNotFound(game_id))?;

        let stored = store.badges(game_id)?;
        let already_synced = self
            .synced
            .lock()
            .map(|s| s.contains(&game_id))
            .unwrap_or(false);

        let stale = match (entry.last_played, game.synced_at) {
            (Some(played), Some(synced)) => played > synced,
            _ => true,
        };
        if already_synced || (!stored.is_empty() && !stale) {
            return Ok(BadgeSync {
                badges: stored.len(),
                score: game.score,
                max_score: game.max_score,
                ..Default::default()
            });
        }

        tracing::info!("Syncing achievements for {} (game {})", entry.name, game_id);
        let progress = self
            .achievements
            .game_progress(&self.user, &self.api_key, game_id)?;

        let tx = store.transaction()?;
        let mut score = 0;
        let mut max_score = 0;
        for badge in &progress.badges {
            if cancel.is_cancelled() {
                return Ok(BadgeSync {
                    interrupted: true,
                    ..Default::default()
                });
            }

            max_score += badge.points;
            if self.counts_as_earned(badge) {
                score += badge.points;
            }
            store.upsert_badge(&self.to_badge(game_id, badge))?;
        }

        game.score = score;
        game.max_score = max_score;
        game.players = progress.players;
        game.players_hardcore = progress.players_hardcore;
        game.synced_at = Some(Utc::now().naive_utc());
        store.update_achievement_progress(&game)?;
        tx.commit()?;

        if let Ok(mut synced) = self.synced.lock() {
            synced.insert(game_id);
        }

        tracing::debug!(
            "Game {}: {} badges, {}/{} points",
            game_id,
            progress.badges.len(),
            score,
            max_score
        );
        Ok(BadgeSync {
            badges: progress.badges.len(),
            score,
            max_score,
            refreshed: true,
            interrupted: false,
        })
    }

    fn counts_as_earned(&self, badge: &BadgeProgress) -> bool {
        if self.hardcore {
            badge.earned_hardcore.is_some()
        } else {
            badge.is_earned()
        }
    }

    fn to_badge(&self, game_id: i64, badge: &BadgeProgress) -> AchievementBadge {
        let unlocked = format!("{}/{}.png", self.badge_url, badge.badge_name);
        let locked = format!("{}/{}_lock.png", self.badge_url, badge.badge_name);

        AchievementBadge {
            id: badge.id,
            game_id,
            badge_name: badge.badge_name.clone(),
            title: badge.title.clone(),
            description: badge.description.clone(),
            points: badge.points,
            display_order: badge.display_order,
            total_awarded: badge.total_awarded,
            total_awarded_hardcore: badge.total_awarded_hardcore,
            earned: badge.earned,
            earned_hardcore: badge.earned_hardcore,
            locked_path: self.fetch_badge(&locked, "badge-locked"),
            unlocked_path: self.fetch_badge(&unlocked, "badge"),
        }
    }

    fn fetch_badge(&self, url: &str, variant: &str) -> Option<PathBuf> {
        match self.artifacts.fetch(&CacheKey::new(url, variant), false) {
            Ok(artifact) => artifact.path().map(PathBuf::from),
            Err(e) => {
                tracing::warn!("Could not fetch badge {}: {}", url, e);
                None
            }
        }
    }
}
