//! Per-console library reconciliation
//!
//! Observed files are matched to known entries by signature. New files are
//! added and enriched with catalog metadata and cached artwork, known files
//! are skipped (or refreshed on a full scan) and entries whose file vanished
//! are deleted. All writes for a console share one transaction.

use crate::artifacts::{Artifact, ArtifactStore};
use crate::catalog::{CatalogSync, normalise_title};
use crate::database::{CatalogGame, LibraryEntry, LibraryStore, NewEntry};
use crate::identifier::{Enumeration, FileIdentifier, IdentifiedFile};
use crate::{CancelToken, LibraryError};
use pes_config::{ConsoleConfig, IdentifyMode};
use pes_scraper::ImageUrls;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

/// Screenshots cached per entry
const MAX_SCREENSHOTS: usize = 3;

/// Running classification counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanCounts {
    pub added: usize,
    pub updated: usize,
    pub skipped: usize,
    pub deleted: usize,
}

impl ScanCounts {
    pub fn total(&self) -> usize {
        self.added + self.updated + self.skipped + self.deleted
    }

    pub fn merge(&mut self, other: &ScanCounts) {
        self.added += other.added;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.deleted += other.deleted;
    }
}

/// Progress after one classified file
#[derive(Debug, Clone, PartialEq)]
pub struct FileProgress {
    pub counts: ScanCounts,
    pub name: String,
    /// Cover art fetched for this file, if any; may be uncached bytes when
    /// the cache could not be written
    pub cover_art: Option<Artifact>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileEvent {
    /// Files found in the console directory
    Enumerated { count: usize },
    File(FileProgress),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Completed(ScanCounts),
    Interrupted,
}

/// Metadata gathered for one file
#[derive(Debug, Default)]
struct Association {
    catalog_game_id: Option<i64>,
    achievement_game_id: Option<i64>,
    name: String,
    cover_front: Option<PathBuf>,
    cover_back: Option<PathBuf>,
    screenshots: Vec<PathBuf>,
    fetched_front: Option<Artifact>,
}

pub struct Reconciler {
    identifier: Arc<FileIdentifier>,
    catalog: CatalogSync,
    artifacts: ArtifactStore,
}

impl Reconciler {
    pub fn new(
        identifier: Arc<FileIdentifier>,
        catalog: CatalogSync,
        artifacts: ArtifactStore,
    ) -> Self {
        Self {
            identifier,
            catalog,
            artifacts,
        }
    }

    /// Reconcile one console against the store
    ///
    /// Enumeration failures are returned as errors. On cancellation the
    /// console's writes are rolled back and `Interrupted` is returned.
    pub fn reconcile(
        &self,
        store: &LibraryStore,
        console: &ConsoleConfig,
        force_refresh: bool,
        cancel: &CancelToken,
        on_event: &mut dyn FnMut(ReconcileEvent),
    ) -> Result<ReconcileOutcome, LibraryError> {
        let outcome = self.reconcile_console(store, console, force_refresh, cancel, on_event);
        if let Err(e) = self.artifacts.cache().flush() {
            tracing::warn!("{}: could not write cache index: {}", console.name, e);
        }
        outcome
    }

    fn reconcile_console(
        &self,
        store: &LibraryStore,
        console: &ConsoleConfig,
        force_refresh: bool,
        cancel: &CancelToken,
        on_event: &mut dyn FnMut(ReconcileEvent),
    ) -> Result<ReconcileOutcome, LibraryError> {
        let Enumeration { files, unreadable } = self.identifier.enumerate(console)?;
        on_event(ReconcileEvent::Enumerated { count: files.len() });

        let mut known: HashMap<String, LibraryEntry> = store
            .entries_for_console(console.id)?
            .into_iter()
            .map(|entry| (entry.signature.clone(), entry))
            .collect();

        // Rolled back on drop unless committed
        let tx = store.transaction()?;

        let has_new = files.iter().any(|f| !known.contains_key(&f.signature));
        if force_refresh || has_new {
            self.catalog
                .sync_platform(store, console.platform_id, force_refresh, cancel)?;
            if let Some(achievements_id) = console.achievements_id
                && !cancel.is_cancelled()
            {
                self.catalog.sync_hashes(
                    store,
                    achievements_id,
                    console.platform_id,
                    force_refresh,
                )?;
            }
        }

        let mut counts = ScanCounts::default();
        let mut seen = HashSet::new();

        for file in &files {
            if cancel.is_cancelled() {
                tracing::info!("{}: scan interrupted", console.name);
                return Ok(ReconcileOutcome::Interrupted);
            }

            if !seen.insert(file.signature.clone()) {
                // First path wins for duplicate copies
                tracing::debug!(
                    "{}: {} duplicates an earlier file",
                    console.name,
                    file.path.display()
                );
                counts.skipped += 1;
                on_event(ReconcileEvent::File(FileProgress {
                    counts,
                    name: file.name.clone(),
                    cover_art: None,
                }));
                continue;
            }

            let cover_art = match known.get(&file.signature) {
                Some(entry) if force_refresh => {
                    let association = self.associate(store, console, file, true)?;
                    let mut updated = entry.clone();
                    updated.path = file.path.clone();
                    updated.size = file.size as i64;
                    updated.catalog_game_id = association.catalog_game_id;
                    updated.achievement_game_id = association.achievement_game_id;
                    updated.name = association.name.clone();
                    updated.cover_front = association.cover_front.clone();
                    updated.cover_back = association.cover_back.clone();
                    store.update_entry(&updated)?;
                    store.set_screenshots(updated.id, &association.screenshots)?;

                    tracing::debug!("Updated {}", file.path.display());
                    counts.updated += 1;
                    association.fetched_front
                }
                Some(entry) => {
                    if entry.path != file.path || entry.size != file.size as i64 {
                        tracing::info!(
                            "{} moved to {}",
                            entry.path.display(),
                            file.path.display()
                        );
                        store.update_entry_location(entry.id, &file.path, file.size as i64)?;
                    }
                    counts.skipped += 1;
                    None
                }
                None => {
                    let association = self.associate(store, console, file, false)?;
                    let id = store.insert_entry(&NewEntry {
                        console_id: console.id,
                        path: file.path.clone(),
                        size: file.size as i64,
                        signature: file.signature.clone(),
                        catalog_game_id: association.catalog_game_id,
                        achievement_game_id: association.achievement_game_id,
                        name: association.name.clone(),
                        cover_front: association.cover_front.clone(),
                        cover_back: association.cover_back.clone(),
                    })?;
                    store.set_screenshots(id, &association.screenshots)?;

                    tracing::debug!("Added {} as {}", file.path.display(), association.name);
                    counts.added += 1;
                    association.fetched_front
                }
            };

            on_event(ReconcileEvent::File(FileProgress {
                counts,
                name: file.name.clone(),
                cover_art,
            }));
        }

        // Entries whose file is gone; unreadable files keep their entry
        known.retain(|signature, _| !seen.contains(signature));
        let mut missing: Vec<LibraryEntry> = known.into_values().collect();
        missing.sort_by_key(|entry| entry.id);
        let (kept, removed): (Vec<_>, Vec<_>) = missing
            .into_iter()
            .partition(|entry| unreadable.contains(&entry.path));
        for entry in kept {
            tracing::warn!("Keeping {}, file could not be read", entry.path.display());
            counts.skipped += 1;
            on_event(ReconcileEvent::File(FileProgress {
                counts,
                name: entry.name,
                cover_art: None,
            }));
        }
        for entry in removed {
            if cancel.is_cancelled() {
                return Ok(ReconcileOutcome::Interrupted);
            }
            store.delete_entry(entry.id)?;
            tracing::info!("Removed {} from library", entry.path.display());
            counts.deleted += 1;
            on_event(ReconcileEvent::File(FileProgress {
                counts,
                name: entry.name,
                cover_art: None,
            }));
        }

        tx.commit()?;

        tracing::info!(
            "{}: {} added, {} updated, {} skipped, {} deleted",
            console.name,
            counts.added,
            counts.updated,
            counts.skipped,
            counts.deleted
        );
        Ok(ReconcileOutcome::Completed(counts))
    }

    /// Find catalog metadata for a file and fetch its artwork
    fn associate(
        &self,
        store: &LibraryStore,
        console: &ConsoleConfig,
        file: &IdentifiedFile,
        force: bool,
    ) -> Result<Association, LibraryError> {
        let mut association = Association {
            name: file.name.clone(),
            ..Default::default()
        };

        let mut game: Option<CatalogGame> = None;
        if let Some(achievements_id) = console.achievements_id
            && console.identify == IdentifyMode::Hash
            && let Some(achievement) = store.find_achievement_by_hash(achievements_id, &file.signature)?
        {
            association.achievement_game_id = Some(achievement.id);
            game = store.catalog_for_achievement(console.platform_id, achievement.id)?;
        }
        if game.is_none() {
            game = store.find_catalog_by_title(console.platform_id, &normalise_title(&file.name))?;
        }

        let Some(game) = game else {
            tracing::debug!("No catalog match for {}", file.name);
            association.cover_front = Some(PathBuf::from(&console.no_cover_art));
            return Ok(association);
        };

        association.catalog_game_id = Some(game.id);
        association.name = game.title.clone();
        if association.achievement_game_id.is_none() {
            association.achievement_game_id = game.achievement_game_id;
        }

        association.fetched_front = self.fetch_image(game.front.as_ref(), "front", force);
        // Only cached files are stored; uncached bytes are for display only
        association.cover_front = Some(
            association
                .fetched_front
                .as_ref()
                .and_then(cached_path)
                .unwrap_or_else(|| PathBuf::from(&console.no_cover_art)),
        );
        association.cover_back = self
            .fetch_image(game.back.as_ref(), "back", force)
            .as_ref()
            .and_then(cached_path);

        for urls in store
            .catalog_screenshots(game.id)?
            .iter()
            .take(MAX_SCREENSHOTS)
        {
            if let Some(path) = self
                .fetch_image(Some(urls), "screenshot", force)
                .as_ref()
                .and_then(cached_path)
            {
                association.screenshots.push(path);
            }
        }

        Ok(association)
    }

    /// Fetch an image through the cache; failures only cost the image
    fn fetch_image(&self, urls: Option<&ImageUrls>, variant: &str, force: bool) -> Option<Artifact> {
        let urls = urls?;
        match self.artifacts.fetch_first(urls, variant, force) {
            Ok(artifact) => {
                if artifact.path().is_none() {
                    tracing::warn!("{} image {} was not cached", variant, urls.large);
                }
                Some(artifact)
            }
            Err(e) => {
                tracing::warn!("Could not fetch {} image {}: {}", variant, urls.large, e);
                None
            }
        }
    }
}

fn cached_path(artifact: &Artifact) -> Option<PathBuf> {
    artifact.path().map(PathBuf::from)
}
