//! ROM file identification

use crate::{IdentifyError, LibraryError};
use md5::{Digest, Md5};
use pes_config::{ConsoleConfig, IdentifyMode};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// A file found in a console directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifiedFile {
    pub signature: String,
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Lowercase hex MD5 of a file's contents
pub fn md5_file(path: &Path) -> Result<String, std::io::Error> {
    let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, File::open(path)?);
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Result of listing a console directory
#[derive(Debug, Default)]
pub struct Enumeration {
    /// Identified files, sorted by path
    pub files: Vec<IdentifiedFile>,
    /// Eligible files that could not be read this time
    pub unreadable: Vec<PathBuf>,
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Computes signatures for ROM files
pub struct FileIdentifier {
    roms_dir: PathBuf,
    arcade_titles: HashMap<String, String>,
}

impl FileIdentifier {
    pub fn new(roms_dir: impl Into<PathBuf>, arcade_titles: HashMap<String, String>) -> Self {
        Self {
            roms_dir: roms_dir.into(),
            arcade_titles: arcade_titles
                .into_iter()
                .map(|(k, v)| (k.to_lowercase(), v))
                .collect(),
        }
    }

    /// Directory scanned for a console
    pub fn scan_dir(&self, console: &ConsoleConfig) -> PathBuf {
        console.scan_dir(&self.roms_dir)
    }

    /// Look up the title of an arcade shortname
    pub fn arcade_title(&self, shortname: &str) -> Result<&str, IdentifyError> {
        self.arcade_titles
            .get(&shortname.to_lowercase())
            .map(String::as_str)
            .ok_or_else(|| IdentifyError::UnknownGame(shortname.to_string()))
    }

    /// Identify a single file
    pub fn identify(
        &self,
        console: &ConsoleConfig,
        path: &Path,
    ) -> Result<IdentifiedFile, IdentifyError> {
        let metadata = fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(IdentifyError::NotAFile(path.to_path_buf()));
        }
        let stem = file_stem(path);

        let (signature, name) = match console.identify {
            IdentifyMode::Shortname => {
                let shortname = stem.to_lowercase();
                let name = match self.arcade_title(&shortname) {
                    Ok(title) => title.to_string(),
                    Err(e) => {
                        tracing::debug!("{}, using shortname", e);
                        shortname.clone()
                    }
                };
                (shortname, name)
            }
            IdentifyMode::Hash => (md5_file(path)?, stem),
        };

        Ok(IdentifiedFile {
            signature,
            name,
            path: path.to_path_buf(),
            size: metadata.len(),
        })
    }

    /// Identify every eligible file of a console
    ///
    /// Symlinks are followed. Files that fail to stat or hash are reported in
    /// [`Enumeration::unreadable`] rather than dropped silently.
    pub fn enumerate(&self, console: &ConsoleConfig) -> Result<Enumeration, LibraryError> {
        let dir = self.scan_dir(console);
        if !dir.is_dir() {
            return Err(LibraryError::PathNotFound(dir));
        }

        let mut result = Enumeration::default();
        let mut paths = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();

            // Skip hidden files
            if name.starts_with('.')
                || console.is_ignored(&name)
                || !console.accepts_extension(&name)
            {
                continue;
            }
            match fs::metadata(entry.path()) {
                Ok(metadata) if metadata.is_file() => paths.push(entry.path()),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Could not read {}: {}", entry.path().display(), e);
                    result.unreadable.push(entry.path());
                }
            }
        }
        paths.sort();

        result.files.reserve(paths.len());
        for path in paths {
            match self.identify(console, &path) {
                Ok(file) => result.files.push(file),
                Err(e) => {
                    tracing::warn!("Could not identify {}: {}", path.display(), e);
                    result.unreadable.push(path);
                }
            }
        }
        result.unreadable.sort();

        tracing::debug!(
            "{}: {} files in {} ({} unreadable)",
            console.name,
            result.files.len(),
            dir.display(),
            result.unreadable.len()
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn console(dir: &Path, identify: IdentifyMode) -> ConsoleConfig {
        ConsoleConfig {
            id: 1,
            name: "NES".to_string(),
            platform_id: 7,
            achievements_id: None,
            extensions: vec!["nes".to_string(), "zip".to_string()],
            ignore_roms: vec!["bios.nes".to_string()],
            command: String::new(),
            directory: Some(dir.to_path_buf()),
            no_cover_art: "nocoverart.png".to_string(),
            identify,
        }
    }

    #[test]
    fn test_md5_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.nes");
        fs::write(&path, b"").unwrap();
        assert_eq!(md5_file(&path).unwrap(), "d41d8cd98f00b204e9800998ecf8427e");

        fs::write(&path, b"abc").unwrap();
        assert_eq!(md5_file(&path).unwrap(), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_enumerate_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("zelda.nes"), b"zelda").unwrap();
        fs::write(dir.path().join("Mario.NES"), b"mario").unwrap();
        fs::write(dir.path().join("BIOS.nes"), b"bios").unwrap();
        fs::write(dir.path().join(".hidden.nes"), b"hidden").unwrap();
        fs::write(dir.path().join("readme.txt"), b"text").unwrap();
        fs::create_dir(dir.path().join("sub.nes")).unwrap();

        let identifier = FileIdentifier::new("/unused", HashMap::new());
        let files = identifier
            .enumerate(&console(dir.path(), IdentifyMode::Hash))
            .unwrap()
            .files;

        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["Mario", "zelda"]);
        assert_eq!(files[1].size, 5);
        assert_eq!(files[1].signature.len(), 32);
    }

    #[test]
    fn test_signature_stable_across_rename() {
        let dir = tempfile::tempdir().unwrap();
        let identifier = FileIdentifier::new("/unused", HashMap::new());
        let nes = console(dir.path(), IdentifyMode::Hash);

        let before = dir.path().join("a.nes");
        fs::write(&before, b"same content").unwrap();
        let first = identifier.identify(&nes, &before).unwrap();

        let after = dir.path().join("b.nes");
        fs::rename(&before, &after).unwrap();
        let second = identifier.identify(&nes, &after).unwrap();

        assert_eq!(first.signature, second.signature);
        assert_ne!(first.path, second.path);
    }

    #[test]
    fn test_shortname_identification() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("PacMan.zip"), b"rom").unwrap();
        fs::write(dir.path().join("unknown.zip"), b"rom").unwrap();

        let mut titles = HashMap::new();
        titles.insert("pacman".to_string(), "Pac-Man".to_string());
        let identifier = FileIdentifier::new("/unused", titles);

        let files = identifier
            .enumerate(&console(dir.path(), IdentifyMode::Shortname))
            .unwrap()
            .files;
        assert_eq!(files[0].signature, "pacman");
        assert_eq!(files[0].name, "Pac-Man");
        assert_eq!(files[1].name, "unknown");

        assert!(matches!(
            identifier.arcade_title("unknown"),
            Err(IdentifyError::UnknownGame(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_enumerate_follows_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let usb = tempfile::tempdir().unwrap();
        let target = usb.path().join("zelda.nes");
        fs::write(&target, b"zelda").unwrap();
        std::os::unix::fs::symlink(&target, dir.path().join("zelda.nes")).unwrap();
        std::os::unix::fs::symlink(usb.path().join("gone.nes"), dir.path().join("metroid.nes"))
            .unwrap();

        let identifier = FileIdentifier::new("/unused", HashMap::new());
        let found = identifier
            .enumerate(&console(dir.path(), IdentifyMode::Hash))
            .unwrap();

        assert_eq!(found.files.len(), 1);
        assert_eq!(found.files[0].path, dir.path().join("zelda.nes"));
        assert_eq!(found.files[0].signature, md5_file(&target).unwrap());
        assert_eq!(found.unreadable, vec![dir.path().join("metroid.nes")]);
    }

    #[test]
    fn test_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let identifier = FileIdentifier::new("/unused", HashMap::new());
        let result = identifier.enumerate(&console(&dir.path().join("missing"), IdentifyMode::Hash));
        assert!(matches!(result, Err(LibraryError::PathNotFound(_))));
    }
}
