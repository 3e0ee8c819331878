//! Library store using SQLite

use crate::LibraryError;
use chrono::{NaiveDateTime, Utc};
use pes_config::ConsoleConfig;
use pes_scraper::{CatalogGameRecord, GameImages, HashLibrary, ImageUrls};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, Transaction, params};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A configured console as stored in the library
#[derive(Debug, Clone, PartialEq)]
pub struct ConsoleRow {
    pub id: i64,
    pub name: String,
    pub platform_id: i64,
    pub achievements_id: Option<i64>,
    pub no_cover_art: String,
}

/// A theGamesDB game
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogGame {
    pub id: i64,
    pub platform_id: i64,
    pub title: String,
    pub overview: Option<String>,
    pub release_date: Option<String>,
    pub front: Option<ImageUrls>,
    pub back: Option<ImageUrls>,
    pub achievement_game_id: Option<i64>,
    pub position: i64,
}

/// A RetroAchievements game
#[derive(Debug, Clone, PartialEq)]
pub struct AchievementGame {
    pub id: i64,
    pub console_id: i64,
    pub title: Option<String>,
    pub score: i64,
    pub max_score: i64,
    pub players: i64,
    pub players_hardcore: i64,
    pub synced_at: Option<NaiveDateTime>,
}

/// An achievement with the user's unlock state
#[derive(Debug, Clone, PartialEq)]
pub struct AchievementBadge {
    pub id: i64,
    pub game_id: i64,
    pub badge_name: String,
    pub title: String,
    pub description: String,
    pub points: i64,
    pub display_order: i64,
    pub total_awarded: i64,
    pub total_awarded_hardcore: i64,
    pub earned: Option<NaiveDateTime>,
    pub earned_hardcore: Option<NaiveDateTime>,
    pub locked_path: Option<PathBuf>,
    pub unlocked_path: Option<PathBuf>,
}

/// A ROM file in the library
#[derive(Debug, Clone, PartialEq)]
pub struct LibraryEntry {
    pub id: i64,
    pub console_id: i64,
    pub path: PathBuf,
    pub size: i64,
    pub signature: String,
    pub catalog_game_id: Option<i64>,
    pub achievement_game_id: Option<i64>,
    pub name: String,
    pub cover_front: Option<PathBuf>,
    pub cover_back: Option<PathBuf>,
    pub favourite: bool,
    pub play_count: i64,
    pub last_played: Option<NaiveDateTime>,
    pub added_at: NaiveDateTime,
}

/// Fields for a new library entry
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub console_id: i64,
    pub path: PathBuf,
    pub size: i64,
    pub signature: String,
    pub catalog_game_id: Option<i64>,
    pub achievement_game_id: Option<i64>,
    pub name: String,
    pub cover_front: Option<PathBuf>,
    pub cover_back: Option<PathBuf>,
}

/// Number of library entries for one console
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleCount {
    pub console_id: i64,
    pub name: String,
    pub count: i64,
}

#[derive(Debug, Deserialize)]
struct ArcadeTitleFile {
    games: Vec<ArcadeTitleRecord>,
}

#[derive(Debug, Deserialize)]
struct ArcadeTitleRecord {
    shortname: String,
    name: String,
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn opt_path_string(path: Option<&Path>) -> Option<String> {
    path.map(path_string)
}

fn image_urls(row: &Row, prefix: &str) -> rusqlite::Result<Option<ImageUrls>> {
    let original: Option<String> = row.get(format!("{}_original", prefix).as_str())?;
    let large: Option<String> = row.get(format!("{}_large", prefix).as_str())?;
    let medium: Option<String> = row.get(format!("{}_medium", prefix).as_str())?;

    Ok(match (original, large, medium) {
        (Some(original), Some(large), Some(medium)) => Some(ImageUrls {
            original,
            large,
            medium,
        }),
        _ => None,
    })
}

/// Library database manager
pub struct LibraryStore {
    conn: Connection,
}

impl LibraryStore {
    /// Open or create the library database
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LibraryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!("Opened {} (journal mode {})", path.display(), mode);

        let db = Self { conn };
        db.init_schema()?;

        Ok(db)
    }

    /// Open an existing database for reading only (UI side)
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self, LibraryError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(LibraryError::PathNotFound(path.to_path_buf()));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;

        Ok(Self { conn })
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self, LibraryError> {
        let conn = Connection::open_in_memory()?;

        let db = Self { conn };
        db.init_schema()?;

        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<(), LibraryError> {
        self.conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS console (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                platform_id INTEGER NOT NULL,
                achievements_id INTEGER,
                no_cover_art TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS catalog_game (
                id INTEGER PRIMARY KEY,
                platform_id INTEGER NOT NULL,
                title TEXT NOT NULL,
                overview TEXT,
                release_date TEXT,
                front_original TEXT,
                front_large TEXT,
                front_medium TEXT,
                back_original TEXT,
                back_large TEXT,
                back_medium TEXT,
                achievement_game_id INTEGER,
                position INTEGER NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS catalog_screenshot (
                id INTEGER PRIMARY KEY,
                game_id INTEGER NOT NULL,
                original TEXT NOT NULL,
                large TEXT NOT NULL,
                medium TEXT NOT NULL,
                UNIQUE (game_id, original),
                FOREIGN KEY (game_id) REFERENCES catalog_game(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS achievement_game (
                id INTEGER PRIMARY KEY,
                console_id INTEGER NOT NULL,
                title TEXT,
                score INTEGER NOT NULL DEFAULT 0,
                max_score INTEGER NOT NULL DEFAULT 0,
                players INTEGER NOT NULL DEFAULT 0,
                players_hardcore INTEGER NOT NULL DEFAULT 0,
                synced_at TEXT
            );

            CREATE TABLE IF NOT EXISTS achievement_hash (
                hash TEXT NOT NULL,
                game_id INTEGER NOT NULL,
                PRIMARY KEY (hash, game_id),
                FOREIGN KEY (game_id) REFERENCES achievement_game(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS achievement_badge (
                id INTEGER PRIMARY KEY,
                game_id INTEGER NOT NULL,
                badge_name TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                points INTEGER NOT NULL,
                display_order INTEGER NOT NULL DEFAULT 0,
                total_awarded INTEGER NOT NULL DEFAULT 0,
                total_awarded_hardcore INTEGER NOT NULL DEFAULT 0,
                earned TEXT,
                earned_hardcore TEXT,
                locked_path TEXT,
                unlocked_path TEXT,
                FOREIGN KEY (game_id) REFERENCES achievement_game(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS library_entry (
                id INTEGER PRIMARY KEY,
                console_id INTEGER NOT NULL,
                path TEXT NOT NULL,
                size INTEGER NOT NULL,
                signature TEXT NOT NULL,
                catalog_game_id INTEGER,
                achievement_game_id INTEGER,
                name TEXT NOT NULL,
                cover_front TEXT,
                cover_back TEXT,
                favourite INTEGER NOT NULL DEFAULT 0,
                play_count INTEGER NOT NULL DEFAULT 0,
                last_played TEXT,
                added_at TEXT NOT NULL,
                UNIQUE (console_id, signature),
                FOREIGN KEY (console_id) REFERENCES console(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS library_screenshot (
                id INTEGER PRIMARY KEY,
                entry_id INTEGER NOT NULL,
                path TEXT NOT NULL,
                position INTEGER NOT NULL,
                FOREIGN KEY (entry_id) REFERENCES library_entry(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS arcade_title (
                shortname TEXT PRIMARY KEY,
                name TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_catalog_game_platform ON catalog_game(platform_id, position);
            CREATE INDEX IF NOT EXISTS idx_catalog_game_achievement ON catalog_game(achievement_game_id);
            CREATE INDEX IF NOT EXISTS idx_achievement_game_console ON achievement_game(console_id);
            CREATE INDEX IF NOT EXISTS idx_achievement_badge_game ON achievement_badge(game_id);
            CREATE INDEX IF NOT EXISTS idx_library_entry_name ON library_entry(name);
            CREATE INDEX IF NOT EXISTS idx_library_entry_favourite ON library_entry(favourite);
            CREATE INDEX IF NOT EXISTS idx_library_entry_last_played ON library_entry(last_played);
            CREATE INDEX IF NOT EXISTS idx_library_screenshot_entry ON library_screenshot(entry_id);
        "#,
        )?;

        Ok(())
    }

    /// Begin a transaction; dropping it without commit rolls back
    pub fn transaction(&self) -> Result<Transaction<'_>, LibraryError> {
        Ok(self.conn.unchecked_transaction()?)
    }

    // Consoles

    /// Insert or update a configured console
    pub fn upsert_console(&self, console: &ConsoleConfig) -> Result<(), LibraryError> {
        self.conn.execute(
            r#"INSERT INTO console (id, name, platform_id, achievements_id, no_cover_art)
               VALUES (?1, ?2, ?3, ?4, ?5)
               ON CONFLICT(id) DO UPDATE SET
                   name = excluded.name,
                   platform_id = excluded.platform_id,
                   achievements_id = excluded.achievements_id,
                   no_cover_art = excluded.no_cover_art"#,
            params![
                console.id,
                console.name,
                console.platform_id,
                console.achievements_id,
                console.no_cover_art,
            ],
        )?;
        Ok(())
    }

    /// Get a console by ID
    pub fn console(&self, id: i64) -> Result<Option<ConsoleRow>, LibraryError> {
        let console = self
            .conn
            .query_row(
                "SELECT * FROM console WHERE id = ?1",
                params![id],
                Self::row_to_console,
            )
            .optional()?;

        Ok(console)
    }

    /// All consoles ordered by name
    pub fn consoles(&self) -> Result<Vec<ConsoleRow>, LibraryError> {
        let mut stmt = self.conn.prepare("SELECT * FROM console ORDER BY name")?;

        let consoles = stmt
            .query_map([], Self::row_to_console)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(consoles)
    }

    // Games catalog

    /// Insert or update a catalog game, keeping back covers and links
    pub fn upsert_catalog_game(
        &self,
        game: &CatalogGameRecord,
        position: i64,
    ) -> Result<(), LibraryError> {
        let front = game.front.as_ref();
        self.conn.execute(
            r#"INSERT INTO catalog_game
               (id, platform_id, title, overview, release_date,
                front_original, front_large, front_medium, position, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, CURRENT_TIMESTAMP)
               ON CONFLICT(id) DO UPDATE SET
                   platform_id = excluded.platform_id,
                   title = excluded.title,
                   overview = excluded.overview,
                   release_date = excluded.release_date,
                   front_original = excluded.front_original,
                   front_large = excluded.front_large,
                   front_medium = excluded.front_medium,
                   position = excluded.position,
                   updated_at = CURRENT_TIMESTAMP"#,
            params![
                game.id,
                game.platform_id,
                game.title,
                game.overview,
                game.release_date,
                front.map(|f| &f.original),
                front.map(|f| &f.large),
                front.map(|f| &f.medium),
                position,
            ],
        )?;
        Ok(())
    }

    /// Record a back cover and screenshots for a catalog game
    pub fn add_catalog_images(&self, images: &GameImages) -> Result<(), LibraryError> {
        if let Some(back) = &images.back {
            self.conn.execute(
                r#"UPDATE catalog_game
                   SET back_original = ?2, back_large = ?3, back_medium = ?4
                   WHERE id = ?1"#,
                params![images.game_id, back.original, back.large, back.medium],
            )?;
        }

        for shot in &images.screenshots {
            self.conn.execute(
                r#"INSERT OR IGNORE INTO catalog_screenshot (game_id, original, large, medium)
                   SELECT ?1, ?2, ?3, ?4 WHERE EXISTS (SELECT 1 FROM catalog_game WHERE id = ?1)"#,
                params![images.game_id, shot.original, shot.large, shot.medium],
            )?;
        }
        Ok(())
    }

    /// Remove stored screenshots for every game of a platform
    pub fn clear_catalog_screenshots(&self, platform_id: i64) -> Result<(), LibraryError> {
        self.conn.execute(
            r#"DELETE FROM catalog_screenshot
               WHERE game_id IN (SELECT id FROM catalog_game WHERE platform_id = ?1)"#,
            params![platform_id],
        )?;
        Ok(())
    }

    /// Get a catalog game by ID
    pub fn catalog_game(&self, id: i64) -> Result<Option<CatalogGame>, LibraryError> {
        let game = self
            .conn
            .query_row(
                "SELECT * FROM catalog_game WHERE id = ?1",
                params![id],
                Self::row_to_catalog_game,
            )
            .optional()?;

        Ok(game)
    }

    pub fn catalog_game_count(&self, platform_id: i64) -> Result<i64, LibraryError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM catalog_game WHERE platform_id = ?1",
            params![platform_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Catalog game IDs for a platform in source order
    pub fn catalog_game_ids(&self, platform_id: i64) -> Result<Vec<i64>, LibraryError> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM catalog_game WHERE platform_id = ?1 ORDER BY position, id",
        )?;

        let ids = stmt
            .query_map(params![platform_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ids)
    }

    /// `(id, title)` of every catalog game for a platform in source order
    pub fn catalog_titles(&self, platform_id: i64) -> Result<Vec<(i64, String)>, LibraryError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title FROM catalog_game WHERE platform_id = ?1 ORDER BY position, id",
        )?;

        let titles = stmt
            .query_map(params![platform_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(titles)
    }

    /// First catalog game in source order whose normalised title matches
    pub fn find_catalog_by_title(
        &self,
        platform_id: i64,
        normalised_title: &str,
    ) -> Result<Option<CatalogGame>, LibraryError> {
        let game = self
            .conn
            .query_row(
                r#"SELECT * FROM catalog_game
                   WHERE platform_id = ?1
                     AND lower(replace(replace(title, ' ', ''), ':', '')) = ?2
                   ORDER BY position, id
                   LIMIT 1"#,
                params![platform_id, normalised_title],
                Self::row_to_catalog_game,
            )
            .optional()?;

        Ok(game)
    }

    /// First catalog game in source order linked to an achievements game
    pub fn catalog_for_achievement(
        &self,
        platform_id: i64,
        achievement_game_id: i64,
    ) -> Result<Option<CatalogGame>, LibraryError> {
        let game = self
            .conn
            .query_row(
                r#"SELECT * FROM catalog_game
                   WHERE platform_id = ?1 AND achievement_game_id = ?2
                   ORDER BY position, id
                   LIMIT 1"#,
                params![platform_id, achievement_game_id],
                Self::row_to_catalog_game,
            )
            .optional()?;

        Ok(game)
    }

    pub fn set_catalog_achievement(
        &self,
        catalog_game_id: i64,
        achievement_game_id: i64,
    ) -> Result<(), LibraryError> {
        self.conn.execute(
            "UPDATE catalog_game SET achievement_game_id = ?2 WHERE id = ?1",
            params![catalog_game_id, achievement_game_id],
        )?;
        Ok(())
    }

    /// Screenshot URLs for a catalog game in source order
    pub fn catalog_screenshots(&self, game_id: i64) -> Result<Vec<ImageUrls>, LibraryError> {
        let mut stmt = self.conn.prepare(
            "SELECT original, large, medium FROM catalog_screenshot WHERE game_id = ?1 ORDER BY id",
        )?;

        let shots = stmt
            .query_map(params![game_id], |row| {
                Ok(ImageUrls {
                    original: row.get(0)?,
                    large: row.get(1)?,
                    medium: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(shots)
    }

    // Achievements

    /// Store a console's hash library, replacing the hashes of each game
    pub fn store_hash_library(
        &self,
        console_id: i64,
        library: &HashLibrary,
    ) -> Result<usize, LibraryError> {
        for (game_id, game) in library {
            self.conn.execute(
                r#"INSERT INTO achievement_game (id, console_id, title)
                   VALUES (?1, ?2, ?3)
                   ON CONFLICT(id) DO UPDATE SET
                       console_id = excluded.console_id,
                       title = COALESCE(excluded.title, achievement_game.title)"#,
                params![game_id, console_id, game.title],
            )?;
            self.conn.execute(
                "DELETE FROM achievement_hash WHERE game_id = ?1",
                params![game_id],
            )?;
            for hash in &game.hashes {
                self.conn.execute(
                    "INSERT OR IGNORE INTO achievement_hash (hash, game_id) VALUES (?1, ?2)",
                    params![hash.to_lowercase(), game_id],
                )?;
            }
        }
        Ok(library.len())
    }

    pub fn achievement_game_count(&self, console_id: i64) -> Result<i64, LibraryError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM achievement_game WHERE console_id = ?1",
            params![console_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// `(id, title)` of every titled achievements game for a console
    pub fn achievement_titles(&self, console_id: i64) -> Result<Vec<(i64, String)>, LibraryError> {
        let mut stmt = self.conn.prepare(
            r#"SELECT id, title FROM achievement_game
               WHERE console_id = ?1 AND title IS NOT NULL
               ORDER BY id"#,
        )?;

        let titles = stmt
            .query_map(params![console_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(titles)
    }

    /// Find the achievements game publishing a content hash
    pub fn find_achievement_by_hash(
        &self,
        console_id: i64,
        hash: &str,
    ) -> Result<Option<AchievementGame>, LibraryError> {
        let game = self
            .conn
            .query_row(
                r#"SELECT a.* FROM achievement_game a
                   JOIN achievement_hash h ON h.game_id = a.id
                   WHERE a.console_id = ?1 AND h.hash = ?2
                   ORDER BY a.id
                   LIMIT 1"#,
                params![console_id, hash.to_lowercase()],
                Self::row_to_achievement_game,
            )
            .optional()?;

        Ok(game)
    }

    pub fn achievement_game(&self, id: i64) -> Result<Option<AchievementGame>, LibraryError> {
        let game = self
            .conn
            .query_row(
                "SELECT * FROM achievement_game WHERE id = ?1",
                params![id],
                Self::row_to_achievement_game,
            )
            .optional()?;

        Ok(game)
    }

    /// Record the result of a progress sync
    pub fn update_achievement_progress(
        &self,
        game: &AchievementGame,
    ) -> Result<(), LibraryError> {
        self.conn.execute(
            r#"UPDATE achievement_game
               SET score = ?2, max_score = ?3, players = ?4, players_hardcore = ?5, synced_at = ?6
               WHERE id = ?1"#,
            params![
                game.id,
                game.score,
                game.max_score,
                game.players,
                game.players_hardcore,
                game.synced_at,
            ],
        )?;
        Ok(())
    }

    /// Insert or update a badge
    pub fn upsert_badge(&self, badge: &AchievementBadge) -> Result<(), LibraryError> {
        self.conn.execute(
            r#"INSERT INTO achievement_badge
               (id, game_id, badge_name, title, description, points, display_order,
                total_awarded, total_awarded_hardcore, earned, earned_hardcore,
                locked_path, unlocked_path)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
               ON CONFLICT(id) DO UPDATE SET
                   game_id = excluded.game_id,
                   badge_name = excluded.badge_name,
                   title = excluded.title,
                   description = excluded.description,
                   points = excluded.points,
                   display_order = excluded.display_order,
                   total_awarded = excluded.total_awarded,
                   total_awarded_hardcore = excluded.total_awarded_hardcore,
                   earned = excluded.earned,
                   earned_hardcore = excluded.earned_hardcore,
                   locked_path = COALESCE(excluded.locked_path, achievement_badge.locked_path),
                   unlocked_path = COALESCE(excluded.unlocked_path, achievement_badge.unlocked_path)"#,
            params![
                badge.id,
                badge.game_id,
                badge.badge_name,
                badge.title,
                badge.description,
                badge.points,
                badge.display_order,
                badge.total_awarded,
                badge.total_awarded_hardcore,
                badge.earned,
                badge.earned_hardcore,
                opt_path_string(badge.locked_path.as_deref()),
                opt_path_string(badge.unlocked_path.as_deref()),
            ],
        )?;
        Ok(())
    }

    /// Badges for an achievements game in display order
    pub fn badges(&self, game_id: i64) -> Result<Vec<AchievementBadge>, LibraryError> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM achievement_badge WHERE game_id = ?1 ORDER BY display_order, id",
        )?;

        let badges = stmt
            .query_map(params![game_id], Self::row_to_badge)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(badges)
    }

    // Library entries

    /// Add a file to the library
    pub fn insert_entry(&self, entry: &NewEntry) -> Result<i64, LibraryError> {
        self.conn.execute(
            r#"INSERT INTO library_entry
               (console_id, path, size, signature, catalog_game_id, achievement_game_id,
                name, cover_front, cover_back, added_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
            params![
                entry.console_id,
                path_string(&entry.path),
                entry.size,
                entry.signature,
                entry.catalog_game_id,
                entry.achievement_game_id,
                entry.name,
                opt_path_string(entry.cover_front.as_deref()),
                opt_path_string(entry.cover_back.as_deref()),
                Utc::now().naive_utc(),
            ],
        )?;

        Ok(self.conn.last_insert_rowid())
    }

    /// Write back metadata and location of an existing entry
    pub fn update_entry(&self, entry: &LibraryEntry) -> Result<(), LibraryError> {
        let changed = self.conn.execute(
            r#"UPDATE library_entry
               SET path = ?2, size = ?3, catalog_game_id = ?4, achievement_game_id = ?5,
                   name = ?6, cover_front = ?7, cover_back = ?8
               WHERE id = ?1"#,
            params![
                entry.id,
                path_string(&entry.path),
                entry.size,
                entry.catalog_game_id,
                entry.achievement_game_id,
                entry.name,
                opt_path_string(entry.cover_front.as_deref()),
                opt_path_string(entry.cover_back.as_deref()),
            ],
        )?;

        if changed == 0 {
            return Err(LibraryError::GameNotFound(entry.id));
        }
        Ok(())
    }

    /// Move an entry after its file was renamed
    pub fn update_entry_location(
        &self,
        id: i64,
        path: &Path,
        size: i64,
    ) -> Result<(), LibraryError> {
        self.conn.execute(
            "UPDATE library_entry SET path = ?2, size = ?3 WHERE id = ?1",
            params![id, path_string(path), size],
        )?;
        Ok(())
    }

    /// Get an entry by ID
    pub fn entry(&self, id: i64) -> Result<Option<LibraryEntry>, LibraryError> {
        let entry = self
            .conn
            .query_row(
                "SELECT * FROM library_entry WHERE id = ?1",
                params![id],
                Self::row_to_entry,
            )
            .optional()?;

        Ok(entry)
    }

    /// Get an entry by signature within a console
    pub fn entry_by_signature(
        &self,
        console_id: i64,
        signature: &str,
    ) -> Result<Option<LibraryEntry>, LibraryError> {
        let entry = self
            .conn
            .query_row(
                "SELECT * FROM library_entry WHERE console_id = ?1 AND signature = ?2",
                params![console_id, signature],
                Self::row_to_entry,
            )
            .optional()?;

        Ok(entry)
    }

    /// Every entry of a console (reconciliation input)
    pub fn entries_for_console(&self, console_id: i64) -> Result<Vec<LibraryEntry>, LibraryError> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM library_entry WHERE console_id = ?1 ORDER BY id")?;

        let entries = stmt
            .query_map(params![console_id], Self::row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    /// Games of a console ordered by name
    pub fn games_by_console(&self, console_id: i64) -> Result<Vec<LibraryEntry>, LibraryError> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM library_entry WHERE console_id = ?1 ORDER BY name COLLATE NOCASE",
        )?;

        let entries = stmt
            .query_map(params![console_id], Self::row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    /// Entries linked to an achievements game
    pub fn achievement_entries(&self) -> Result<Vec<LibraryEntry>, LibraryError> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM library_entry WHERE achievement_game_id IS NOT NULL ORDER BY id",
        )?;

        let entries = stmt
            .query_map([], Self::row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    /// Get favourite games
    pub fn favourites(&self) -> Result<Vec<LibraryEntry>, LibraryError> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM library_entry WHERE favourite = 1 ORDER BY name COLLATE NOCASE",
        )?;

        let entries = stmt
            .query_map([], Self::row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    /// Get recently played games
    pub fn recently_played(&self, limit: usize) -> Result<Vec<LibraryEntry>, LibraryError> {
        let mut stmt = self.conn.prepare(
            r#"SELECT * FROM library_entry
               WHERE last_played IS NOT NULL
               ORDER BY last_played DESC
               LIMIT ?1"#,
        )?;

        let entries = stmt
            .query_map(params![limit as i64], Self::row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    /// Search games by name
    pub fn search(&self, query: &str) -> Result<Vec<LibraryEntry>, LibraryError> {
        let mut stmt = self.conn.prepare(
            r"SELECT * FROM library_entry WHERE name LIKE ?1 ESCAPE '\' ORDER BY name COLLATE NOCASE",
        )?;

        // Match wildcards literally
        let escaped = query
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let pattern = format!("%{}%", escaped);
        let entries = stmt
            .query_map(params![pattern], Self::row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    /// Game counts per console, including empty consoles
    pub fn console_counts(&self) -> Result<Vec<ConsoleCount>, LibraryError> {
        let mut stmt = self.conn.prepare(
            r#"SELECT c.id, c.name, COUNT(e.id) FROM console c
               LEFT JOIN library_entry e ON e.console_id = c.id
               GROUP BY c.id
               ORDER BY c.name"#,
        )?;

        let counts = stmt
            .query_map([], |row| {
                Ok(ConsoleCount {
                    console_id: row.get(0)?,
                    name: row.get(1)?,
                    count: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(counts)
    }

    /// Get total entry count
    pub fn entry_count(&self) -> Result<i64, LibraryError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM library_entry", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Set game as favourite
    pub fn set_favourite(&self, id: i64, favourite: bool) -> Result<(), LibraryError> {
        let changed = self.conn.execute(
            "UPDATE library_entry SET favourite = ?1 WHERE id = ?2",
            params![favourite, id],
        )?;
        if changed == 0 {
            return Err(LibraryError::GameNotFound(id));
        }
        Ok(())
    }

    /// Update play stats (when launched)
    pub fn record_play(&self, id: i64) -> Result<(), LibraryError> {
        let changed = self.conn.execute(
            r#"UPDATE library_entry
               SET play_count = play_count + 1, last_played = ?2
               WHERE id = ?1"#,
            params![id, Utc::now().naive_utc()],
        )?;
        if changed == 0 {
            return Err(LibraryError::GameNotFound(id));
        }
        Ok(())
    }

    /// Delete an entry and its screenshots
    pub fn delete_entry(&self, id: i64) -> Result<(), LibraryError> {
        self.conn
            .execute("DELETE FROM library_entry WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Replace the cached screenshots of an entry
    pub fn set_screenshots(&self, entry_id: i64, paths: &[PathBuf]) -> Result<(), LibraryError> {
        self.conn.execute(
            "DELETE FROM library_screenshot WHERE entry_id = ?1",
            params![entry_id],
        )?;
        for (position, path) in paths.iter().enumerate() {
            self.conn.execute(
                "INSERT INTO library_screenshot (entry_id, path, position) VALUES (?1, ?2, ?3)",
                params![entry_id, path_string(path), position as i64],
            )?;
        }
        Ok(())
    }

    pub fn screenshots(&self, entry_id: i64) -> Result<Vec<PathBuf>, LibraryError> {
        let mut stmt = self.conn.prepare(
            "SELECT path FROM library_screenshot WHERE entry_id = ?1 ORDER BY position",
        )?;

        let paths = stmt
            .query_map(params![entry_id], |row| {
                Ok(PathBuf::from(row.get::<_, String>(0)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(paths)
    }

    // Arcade titles

    /// Replace the arcade title table from a `{"games": [...]}` JSON file
    pub fn load_arcade_titles(&self, path: &Path) -> Result<usize, LibraryError> {
        if !path.exists() {
            return Err(LibraryError::PathNotFound(path.to_path_buf()));
        }
        let contents = std::fs::read_to_string(path)?;
        let file: ArcadeTitleFile = serde_json::from_str(&contents)?;

        let tx = self.transaction()?;
        self.conn.execute("DELETE FROM arcade_title", [])?;
        for game in &file.games {
            self.conn.execute(
                "INSERT OR REPLACE INTO arcade_title (shortname, name) VALUES (?1, ?2)",
                params![game.shortname.to_lowercase(), game.name.trim()],
            )?;
        }
        tx.commit()?;

        tracing::info!(
            "Loaded {} arcade titles from {}",
            file.games.len(),
            path.display()
        );
        Ok(file.games.len())
    }

    /// Shortname to title map
    pub fn arcade_titles(&self) -> Result<HashMap<String, String>, LibraryError> {
        let mut stmt = self.conn.prepare("SELECT shortname, name FROM arcade_title")?;

        let titles = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<HashMap<_, _>, _>>()?;

        Ok(titles)
    }

    fn row_to_console(row: &Row) -> rusqlite::Result<ConsoleRow> {
        Ok(ConsoleRow {
            id: row.get("id")?,
            name: row.get("name")?,
            platform_id: row.get("platform_id")?,
            achievements_id: row.get("achievements_id")?,
            no_cover_art: row.get("no_cover_art")?,
        })
    }

    fn row_to_catalog_game(row: &Row) -> rusqlite::Result<CatalogGame> {
        Ok(CatalogGame {
            id: row.get("id")?,
            platform_id: row.get("platform_id")?,
            title: row.get("title")?,
            overview: row.get("overview")?,
            release_date: row.get("release_date")?,
            front: image_urls(row, "front")?,
            back: image_urls(row, "back")?,
            achievement_game_id: row.get("achievement_game_id")?,
            position: row.get("position")?,
        })
    }

    fn row_to_achievement_game(row: &Row) -> rusqlite::Result<AchievementGame> {
        Ok(AchievementGame {
            id: row.get("id")?,
            console_id: row.get("console_id")?,
            title: row.get("title")?,
            score: row.get("score")?,
            max_score: row.get("max_score")?,
            players: row.get("players")?,
            players_hardcore: row.get("players_hardcore")?,
            synced_at: row.get("synced_at")?,
        })
    }

    fn row_to_badge(row: &Row) -> rusqlite::Result<AchievementBadge> {
        Ok(AchievementBadge {
            id: row.get("id")?,
            game_id: row.get("game_id")?,
            badge_name: row.get("badge_name")?,
            title: row.get("title")?,
            description: row.get("description")?,
            points: row.get("points")?,
            display_order: row.get("display_order")?,
            total_awarded: row.get("total_awarded")?,
            total_awarded_hardcore: row.get("total_awarded_hardcore")?,
            earned: row.get("earned")?,
            earned_hardcore: row.get("earned_hardcore")?,
            locked_path: row.get::<_, Option<String>>("locked_path")?.map(PathBuf::from),
            unlocked_path: row
                .get::<_, Option<String>>("unlocked_path")?
                .map(PathBuf::from),
        })
    }

    fn row_to_entry(row: &Row) -> rusqlite::Result<LibraryEntry> {
        Ok(LibraryEntry {
            id: row.get("id")?,
            console_id: row.get("console_id")?,
            path: PathBuf::from(row.get::<_, String>("path")?),
            size: row.get("size")?,
            signature: row.get("signature")?,
            catalog_game_id: row.get("catalog_game_id")?,
            achievement_game_id: row.get("achievement_game_id")?,
            name: row.get("name")?,
            cover_front: row.get::<_, Option<String>>("cover_front")?.map(PathBuf::from),
            cover_back: row.get::<_, Option<String>>("cover_back")?.map(PathBuf::from),
            favourite: row.get("favourite")?,
            play_count: row.get("play_count")?,
            last_played: row.get("last_played")?,
            added_at: row.get("added_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pes_config::IdentifyMode;
    use pes_scraper::AchievementGameHashes;
    use std::io::Write;

    fn nes() -> ConsoleConfig {
        ConsoleConfig {
            id: 1,
            name: "NES".to_string(),
            platform_id: 7,
            achievements_id: Some(7),
            extensions: vec!["nes".to_string()],
            ignore_roms: Vec::new(),
            command: String::new(),
            directory: None,
            no_cover_art: "nocoverart.png".to_string(),
            identify: IdentifyMode::Hash,
        }
    }

    fn new_entry(path: &str, signature: &str, name: &str) -> NewEntry {
        NewEntry {
            console_id: 1,
            path: PathBuf::from(path),
            size: 1024,
            signature: signature.to_string(),
            catalog_game_id: None,
            achievement_game_id: None,
            name: name.to_string(),
            cover_front: None,
            cover_back: None,
        }
    }

    fn record(id: i64, title: &str) -> CatalogGameRecord {
        CatalogGameRecord {
            id,
            platform_id: 7,
            title: title.to_string(),
            overview: None,
            release_date: None,
            front: None,
        }
    }

    #[test]
    fn test_database_creation() {
        let db = LibraryStore::in_memory().unwrap();
        assert_eq!(db.entry_count().unwrap(), 0);
    }

    #[test]
    fn test_add_and_get_entry() {
        let db = LibraryStore::in_memory().unwrap();
        db.upsert_console(&nes()).unwrap();

        let id = db
            .insert_entry(&new_entry("/roms/NES/mario.nes", "aa", "mario"))
            .unwrap();
        let entry = db.entry(id).unwrap().unwrap();

        assert_eq!(entry.name, "mario");
        assert_eq!(entry.path, PathBuf::from("/roms/NES/mario.nes"));
        assert!(!entry.favourite);
        assert_eq!(entry.play_count, 0);
        assert!(db.entry_by_signature(1, "aa").unwrap().is_some());
    }

    #[test]
    fn test_signature_unique_per_console() {
        let db = LibraryStore::in_memory().unwrap();
        db.upsert_console(&nes()).unwrap();

        db.insert_entry(&new_entry("/roms/NES/a.nes", "aa", "a"))
            .unwrap();
        assert!(
            db.insert_entry(&new_entry("/roms/NES/b.nes", "aa", "b"))
                .is_err()
        );
    }

    #[test]
    fn test_delete_entry_removes_screenshots() {
        let db = LibraryStore::in_memory().unwrap();
        db.upsert_console(&nes()).unwrap();
        let id = db
            .insert_entry(&new_entry("/roms/NES/a.nes", "aa", "a"))
            .unwrap();
        db.set_screenshots(id, &[PathBuf::from("/cache/1.png"), PathBuf::from("/cache/2.png")])
            .unwrap();
        assert_eq!(db.screenshots(id).unwrap().len(), 2);

        db.delete_entry(id).unwrap();
        assert!(db.entry(id).unwrap().is_none());
        assert!(db.screenshots(id).unwrap().is_empty());
    }

    #[test]
    fn test_catalog_title_match_uses_source_order() {
        let db = LibraryStore::in_memory().unwrap();
        db.upsert_catalog_game(&record(20, "Super Mario: Bros"), 1)
            .unwrap();
        db.upsert_catalog_game(&record(10, "super mario bros"), 0)
            .unwrap();

        let game = db.find_catalog_by_title(7, "supermariobros").unwrap().unwrap();
        assert_eq!(game.id, 10);
        assert!(db.find_catalog_by_title(8, "supermariobros").unwrap().is_none());
    }

    #[test]
    fn test_catalog_images() {
        let db = LibraryStore::in_memory().unwrap();
        db.upsert_catalog_game(&record(10, "Zelda"), 0).unwrap();

        let urls = |n: &str| ImageUrls {
            original: format!("o/{}", n),
            large: format!("l/{}", n),
            medium: format!("m/{}", n),
        };
        db.add_catalog_images(&GameImages {
            game_id: 10,
            back: Some(urls("back.jpg")),
            screenshots: vec![urls("1.jpg"), urls("2.jpg")],
        })
        .unwrap();

        let game = db.catalog_game(10).unwrap().unwrap();
        assert_eq!(game.back.unwrap().large, "l/back.jpg");
        assert_eq!(db.catalog_screenshots(10).unwrap().len(), 2);

        db.clear_catalog_screenshots(7).unwrap();
        assert!(db.catalog_screenshots(10).unwrap().is_empty());
    }

    #[test]
    fn test_hash_library() {
        let db = LibraryStore::in_memory().unwrap();
        let mut library = HashLibrary::new();
        library.insert(
            5,
            AchievementGameHashes {
                hashes: vec!["ABCD".to_string(), "ef01".to_string()],
                title: Some("Zelda".to_string()),
            },
        );

        assert_eq!(db.store_hash_library(7, &library).unwrap(), 1);
        assert_eq!(db.achievement_game_count(7).unwrap(), 1);

        let game = db.find_achievement_by_hash(7, "abcd").unwrap().unwrap();
        assert_eq!(game.id, 5);
        assert_eq!(game.title.as_deref(), Some("Zelda"));
        assert!(db.find_achievement_by_hash(8, "abcd").unwrap().is_none());
    }

    #[test]
    fn test_favourites_and_play_tracking() {
        let db = LibraryStore::in_memory().unwrap();
        db.upsert_console(&nes()).unwrap();
        let a = db
            .insert_entry(&new_entry("/roms/NES/a.nes", "aa", "Alpha"))
            .unwrap();
        let b = db
            .insert_entry(&new_entry("/roms/NES/b.nes", "bb", "Beta"))
            .unwrap();

        db.set_favourite(b, true).unwrap();
        let favourites = db.favourites().unwrap();
        assert_eq!(favourites.len(), 1);
        assert_eq!(favourites[0].id, b);

        db.record_play(a).unwrap();
        db.record_play(a).unwrap();
        let played = db.recently_played(10).unwrap();
        assert_eq!(played.len(), 1);
        assert_eq!(played[0].play_count, 2);

        assert!(matches!(
            db.set_favourite(99, true),
            Err(LibraryError::GameNotFound(99))
        ));
    }

    #[test]
    fn test_search_and_counts() {
        let db = LibraryStore::in_memory().unwrap();
        db.upsert_console(&nes()).unwrap();
        db.insert_entry(&new_entry("/roms/NES/mario.nes", "aa", "Super Mario Bros"))
            .unwrap();

        let results = db.search("mario").unwrap();
        assert_eq!(results.len(), 1);

        db.insert_entry(&new_entry("/roms/NES/100.nes", "bb", "100% Mario_Kart"))
            .unwrap();
        assert_eq!(db.search("%").unwrap().len(), 1);
        assert_eq!(db.search("o_K").unwrap().len(), 1);
        assert_eq!(db.search("o K").unwrap().len(), 0);
        assert_eq!(db.search("Super_").unwrap().len(), 0);
        assert_eq!(db.search("_").unwrap().len(), 1);

        let counts = db.console_counts().unwrap();
        assert_eq!(
            counts,
            vec![ConsoleCount {
                console_id: 1,
                name: "NES".to_string(),
                count: 1
            }]
        );
    }

    #[test]
    fn test_arcade_titles() {
        let db = LibraryStore::in_memory().unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"games":[{{"shortname":"PACMAN","name":"Pac-Man"}},{{"shortname":"dkong","name":"Donkey Kong"}}]}}"#
        )
        .unwrap();

        assert_eq!(db.load_arcade_titles(file.path()).unwrap(), 2);
        let titles = db.arcade_titles().unwrap();
        assert_eq!(titles.get("pacman").map(String::as_str), Some("Pac-Man"));
    }

    #[test]
    fn test_transaction_rollback() {
        let db = LibraryStore::in_memory().unwrap();
        db.upsert_console(&nes()).unwrap();
        {
            let _tx = db.transaction().unwrap();
            db.insert_entry(&new_entry("/roms/NES/a.nes", "aa", "a"))
                .unwrap();
        }
        assert_eq!(db.entry_count().unwrap(), 0);
    }
}
