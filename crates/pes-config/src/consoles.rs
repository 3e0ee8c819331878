//! Console catalog configuration
//!
//! Each `[[console]]` table in `consoles.toml` describes one supported
//! platform: where its ROMs live, which files belong to it and how it maps
//! onto the external metadata services.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::{ConfigError, PathsConfig};

/// Placeholder replaced by the quoted ROM path in launch commands
pub const GAME_PLACEHOLDER: &str = "%%GAME%%";

/// How files of a console are identified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifyMode {
    /// MD5 of the file contents
    #[default]
    Hash,
    /// Lower-cased file stem, looked up in the arcade title table
    Shortname,
}

/// Configuration for a single console
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleConfig {
    /// Stable console identifier
    pub id: i64,

    /// Display name (e.g., "NES")
    pub name: String,

    /// theGamesDB platform id
    pub platform_id: i64,

    /// RetroAchievements console id
    #[serde(default)]
    pub achievements_id: Option<i64>,

    /// Accepted file extensions, stored without the leading dot
    pub extensions: Vec<String>,

    /// File names to skip (case-insensitive)
    #[serde(default)]
    pub ignore_roms: Vec<String>,

    /// Launch command template containing `%%GAME%%`
    #[serde(default)]
    pub command: String,

    /// ROM directory; defaults to `<roms_dir>/<name>`
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Image shown when no cover art could be found; relative names are
    /// resolved against the images directory on load
    #[serde(default = "default_no_cover_art")]
    pub no_cover_art: String,

    #[serde(default)]
    pub identify: IdentifyMode,
}

fn default_no_cover_art() -> String {
    "nocoverart.png".to_string()
}

impl ConsoleConfig {
    /// ROM directory for this console
    pub fn scan_dir(&self, roms_dir: &Path) -> PathBuf {
        self.directory
            .clone()
            .unwrap_or_else(|| roms_dir.join(&self.name))
    }

    /// Check whether a file name has an accepted extension
    pub fn accepts_extension(&self, file_name: &str) -> bool {
        let lower = file_name.to_lowercase();
        self.extensions
            .iter()
            .any(|ext| lower.ends_with(&format!(".{}", ext)))
    }

    /// Check whether a file name is on the ignore list
    pub fn is_ignored(&self, file_name: &str) -> bool {
        self.ignore_roms
            .iter()
            .any(|ignored| ignored.eq_ignore_ascii_case(file_name))
    }

    /// Build the launch command for a ROM
    pub fn launch_command(&self, rom: &Path) -> Option<String> {
        if self.command.is_empty() {
            return None;
        }
        Some(
            self.command
                .replace(GAME_PLACEHOLDER, &format!("\"{}\"", rom.display())),
        )
    }

    fn normalize(&mut self, paths: &PathsConfig) {
        self.extensions = self
            .extensions
            .iter()
            .map(|e| e.trim().trim_start_matches('.').to_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        self.ignore_roms = self
            .ignore_roms
            .iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        self.command = paths.expand(&self.command);
        self.no_cover_art = paths
            .images_dir()
            .join(paths.expand(&self.no_cover_art))
            .to_string_lossy()
            .into_owned();
        let directory = match self.directory.take() {
            Some(dir) => PathBuf::from(paths.expand(&dir.to_string_lossy())),
            None => paths.roms_dir().join(&self.name),
        };
        self.directory = Some(directory);
    }
}

#[derive(Debug, Deserialize)]
struct ConsoleFile {
    #[serde(default, rename = "console")]
    consoles: Vec<ConsoleConfig>,
}

/// All configured consoles, in configuration order
#[derive(Debug, Clone, Default)]
pub struct ConsoleCatalog {
    consoles: Vec<ConsoleConfig>,
}

impl ConsoleCatalog {
    /// Load and validate the console catalog
    pub fn load(path: &Path, paths: &PathsConfig) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let contents = std::fs::read_to_string(path)?;
        let catalog = Self::parse(&contents, paths)?;
        tracing::info!(
            "Loaded {} consoles from {}",
            catalog.consoles.len(),
            path.display()
        );
        Ok(catalog)
    }

    /// Parse and validate catalog contents
    pub fn parse(contents: &str, paths: &PathsConfig) -> Result<Self, ConfigError> {
        let file: ConsoleFile = toml::from_str(contents)?;
        let mut consoles = file.consoles;
        for console in &mut consoles {
            console.normalize(paths);
        }
        Self::validate(&consoles)?;
        Ok(Self { consoles })
    }

    /// Build a catalog from already constructed consoles
    pub fn from_consoles(consoles: Vec<ConsoleConfig>) -> Result<Self, ConfigError> {
        Self::validate(&consoles)?;
        Ok(Self { consoles })
    }

    fn validate(consoles: &[ConsoleConfig]) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        let mut names = HashSet::new();

        for console in consoles {
            if console.name.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "console {} has an empty name",
                    console.id
                )));
            }
            if !ids.insert(console.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate console id {}",
                    console.id
                )));
            }
            if !names.insert(console.name.to_lowercase()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate console name \"{}\"",
                    console.name
                )));
            }
            if console.extensions.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "console \"{}\" has no extensions",
                    console.name
                )));
            }
        }

        Ok(())
    }

    pub fn consoles(&self) -> &[ConsoleConfig] {
        &self.consoles
    }

    pub fn get(&self, id: i64) -> Option<&ConsoleConfig> {
        self.consoles.iter().find(|c| c.id == id)
    }

    pub fn by_name(&self, name: &str) -> Option<&ConsoleConfig> {
        self.consoles
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn len(&self) -> usize {
        self.consoles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consoles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> PathsConfig {
        PathsConfig {
            user_dir: PathBuf::from("/home/pi/pes"),
            base_dir: PathBuf::from("/opt/pes"),
            ..PathsConfig::default()
        }
    }

    const CATALOG: &str = r#"
[[console]]
id = 1
name = "NES"
platform_id = 7
achievements_id = 7
extensions = [".nes", ".ZIP"]
ignore_roms = ["bios.nes"]
command = "%%BASE%%/bin/retroarch -L fceumm %%GAME%%"

[[console]]
id = 2
name = "MAME"
platform_id = 23
extensions = ["zip"]
identify = "shortname"
directory = "%%USERDIR%%/arcade"
no_cover_art = "%%USERDIR%%/art/mame.png"
"#;

    #[test]
    fn test_parse_catalog() {
        let catalog = ConsoleCatalog::parse(CATALOG, &paths()).unwrap();
        assert_eq!(catalog.len(), 2);

        let nes = catalog.by_name("nes").unwrap();
        assert_eq!(nes.extensions, vec!["nes", "zip"]);
        assert_eq!(nes.achievements_id, Some(7));
        assert_eq!(nes.identify, IdentifyMode::Hash);
        assert_eq!(
            nes.directory,
            Some(PathBuf::from("/home/pi/pes/roms/NES"))
        );

        let mame = catalog.get(2).unwrap();
        assert_eq!(mame.identify, IdentifyMode::Shortname);
        assert_eq!(mame.directory, Some(PathBuf::from("/home/pi/pes/arcade")));
        assert_eq!(mame.no_cover_art, "/home/pi/pes/art/mame.png");
    }

    #[test]
    fn test_no_cover_art_resolved_against_images_dir() {
        let catalog = ConsoleCatalog::parse(CATALOG, &paths()).unwrap();
        let nes = catalog.get(1).unwrap();
        assert_eq!(nes.no_cover_art, "/opt/pes/resources/images/nocoverart.png");
    }

    #[test]
    fn test_configuration_order_preserved() {
        let catalog = ConsoleCatalog::parse(CATALOG, &paths()).unwrap();
        let names: Vec<_> = catalog.consoles().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["NES", "MAME"]);
    }

    #[test]
    fn test_extension_and_ignore_checks() {
        let catalog = ConsoleCatalog::parse(CATALOG, &paths()).unwrap();
        let nes = catalog.get(1).unwrap();
        assert!(nes.accepts_extension("Mario.NES"));
        assert!(nes.accepts_extension("zelda.zip"));
        assert!(!nes.accepts_extension("readme.txt"));
        assert!(nes.is_ignored("BIOS.nes"));
        assert!(!nes.is_ignored("mario.nes"));
    }

    #[test]
    fn test_launch_command() {
        let catalog = ConsoleCatalog::parse(CATALOG, &paths()).unwrap();
        let nes = catalog.get(1).unwrap();
        let command = nes
            .launch_command(Path::new("/home/pi/pes/roms/NES/mario.nes"))
            .unwrap();
        assert_eq!(
            command,
            "/opt/pes/bin/retroarch -L fceumm \"/home/pi/pes/roms/NES/mario.nes\""
        );
        assert!(catalog.get(2).unwrap().launch_command(Path::new("x")).is_none());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let contents = r#"
[[console]]
id = 1
name = "NES"
platform_id = 7
extensions = ["nes"]

[[console]]
id = 1
name = "SNES"
platform_id = 6
extensions = ["sfc"]
"#;
        let err = ConsoleCatalog::parse(contents, &paths()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_missing_extensions_rejected() {
        let contents = r#"
[[console]]
id = 1
name = "NES"
platform_id = 7
extensions = []
"#;
        assert!(ConsoleCatalog::parse(contents, &paths()).is_err());
    }

    #[test]
    fn test_malformed_catalog_rejected() {
        let contents = r#"
[[console]]
id = "one"
name = "NES"
"#;
        let err = ConsoleCatalog::parse(contents, &paths()).unwrap_err();
        assert!(matches!(err, ConfigError::TomlParse(_)));
    }
}
