//! Cached game listings for the UI

use crate::LibraryError;
use crate::database::{LibraryEntry, LibraryStore};
use std::collections::HashMap;

const DEFAULT_RECENT_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListingKey {
    Console(i64),
    Favourites,
    RecentlyPlayed,
}

/// Memoised listings over the UI's own store connection
///
/// Listings are loaded on first use and kept until invalidated, either
/// explicitly or by a favourite toggle or play through this cache.
pub struct ListingCache {
    store: LibraryStore,
    listings: HashMap<ListingKey, Vec<LibraryEntry>>,
    recent_limit: usize,
}

impl ListingCache {
    pub fn new(store: LibraryStore) -> Self {
        Self {
            store,
            listings: HashMap::new(),
            recent_limit: DEFAULT_RECENT_LIMIT,
        }
    }

    pub fn with_recent_limit(mut self, limit: usize) -> Self {
        self.recent_limit = limit;
        self
    }

    pub fn store(&self) -> &LibraryStore {
        &self.store
    }

    pub fn console(&mut self, console_id: i64) -> Result<&[LibraryEntry], LibraryError> {
        self.load(ListingKey::Console(console_id))
    }

    pub fn favourites(&mut self) -> Result<&[LibraryEntry], LibraryError> {
        self.load(ListingKey::Favourites)
    }

    pub fn recently_played(&mut self) -> Result<&[LibraryEntry], LibraryError> {
        self.load(ListingKey::RecentlyPlayed)
    }

    /// Toggle a favourite and drop the listings it appears in
    pub fn set_favourite(&mut self, entry_id: i64, favourite: bool) -> Result<(), LibraryError> {
        let entry = self
            .store
            .entry(entry_id)?
            .ok_or(LibraryError::GameNotFound(entry_id))?;
        self.store.set_favourite(entry_id, favourite)?;

        self.invalidate_console(entry.console_id);
        self.listings.remove(&ListingKey::Favourites);
        self.listings.remove(&ListingKey::RecentlyPlayed);
        Ok(())
    }

    /// Record a launch and drop the listings it changes
    pub fn record_play(&mut self, entry_id: i64) -> Result<(), LibraryError> {
        let entry = self
            .store
            .entry(entry_id)?
            .ok_or(LibraryError::GameNotFound(entry_id))?;
        self.store.record_play(entry_id)?;

        self.invalidate_console(entry.console_id);
        self.listings.remove(&ListingKey::RecentlyPlayed);
        if entry.favourite {
            self.listings.remove(&ListingKey::Favourites);
        }
        Ok(())
    }

    pub fn invalidate_console(&mut self, console_id: i64) {
        self.listings.remove(&ListingKey::Console(console_id));
    }

    /// Drop every listing (after a scan)
    pub fn invalidate_all(&mut self) {
        tracing::debug!("Invalidating {} cached listings", self.listings.len());
        self.listings.clear();
    }

    pub fn is_cached(&self, key: ListingKey) -> bool {
        self.listings.contains_key(&key)
    }

    fn load(&mut self, key: ListingKey) -> Result<&[LibraryEntry], LibraryError> {
        if !self.listings.contains_key(&key) {
            let entries = match key {
                ListingKey::Console(id) => self.store.games_by_console(id)?,
                ListingKey::Favourites => self.store.favourites()?,
                ListingKey::RecentlyPlayed => self.store.recently_played(self.recent_limit)?,
            };
            self.listings.insert(key, entries);
        }
        Ok(self.listings.get(&key).map(Vec::as_slice).unwrap_or_default())
    }
}
