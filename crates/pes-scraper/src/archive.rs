//! On-disk archive of raw service responses
//!
//! Layout:
//!
//! ```text
//! <root>/<platform_id>/games_<page>.json
//! <root>/images/<platform_id>/images_<batch>_<page>.json
//! <root>/achievements/<console_id>-hashes.json
//! ```

use crate::ScraperError;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct JsonArchive {
    root: PathBuf,
}

impl JsonArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn games_path(&self, platform_id: i64, page: u32) -> PathBuf {
        self.root
            .join(platform_id.to_string())
            .join(format!("games_{}.json", page))
    }

    pub fn images_path(&self, platform_id: i64, batch: u32, page: u32) -> PathBuf {
        self.root
            .join("images")
            .join(platform_id.to_string())
            .join(format!("images_{}_{}.json", batch, page))
    }

    pub fn hashes_path(&self, console_id: i64) -> PathBuf {
        self.root
            .join("achievements")
            .join(format!("{}-hashes.json", console_id))
    }

    /// Write a response, replacing any previous copy atomically
    pub fn write(&self, path: &Path, contents: &str) -> Result<(), ScraperError> {
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;

        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        temp.write_all(contents.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| ScraperError::Io(e.error))?;

        tracing::debug!("Archived response to {}", path.display());
        Ok(())
    }

    /// Read an archived response, `None` if it was never written
    pub fn read(&self, path: &Path) -> Result<Option<String>, ScraperError> {
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?))
    }

    /// Archive a response from a live client; failures only cost the replay copy
    pub(crate) fn keep(&self, path: &Path, contents: &str) {
        if let Err(e) = self.write(path, contents) {
            tracing::warn!("Could not archive {}: {}", path.display(), e);
        }
    }
}
