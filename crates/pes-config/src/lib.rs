//! Configuration management for PES
//!
//! Handles the user settings file (`pes.toml`) and the console catalog
//! (`consoles.toml`). Both are loaded once at startup and handed to the
//! library as immutable values.

mod consoles;

pub use consoles::{ConsoleCatalog, ConsoleConfig, IdentifyMode};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),
}

/// System wide configuration directory
pub const CONFIG_DIR: &str = "/etc/pes";

/// Prefix for environment overrides, e.g. `PES_SCRAPER__API_KEY`
pub const ENV_PREFIX: &str = "PES";

/// Placeholder for the user directory in paths and commands
pub const USER_DIR_PLACEHOLDER: &str = "%%USERDIR%%";

/// Placeholder for the install base directory in paths and commands
pub const BASE_DIR_PLACEHOLDER: &str = "%%BASE%%";

/// Main PES settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PesConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub scraper: ScraperConfig,

    #[serde(default)]
    pub retroachievements: RetroAchievementsConfig,
}

/// Filesystem locations used by the library
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root of all user data
    #[serde(default = "default_user_dir")]
    pub user_dir: PathBuf,

    /// Install base directory (for `%%BASE%%`)
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Parent of the per-console ROM directories
    #[serde(default)]
    pub roms_dir: Option<PathBuf>,

    /// SQLite library database
    #[serde(default)]
    pub database: Option<PathBuf>,

    /// Artifact cache (cover art, screenshots, badges)
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Raw JSON responses from the metadata services
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,

    /// Console catalog file
    #[serde(default)]
    pub consoles_file: Option<PathBuf>,

    /// Arcade shortname table (`{"games": [{"shortname", "name"}]}`)
    #[serde(default)]
    pub arcade_titles: Option<PathBuf>,

    /// Bundled images such as the per-console no-cover-art fallbacks
    #[serde(default)]
    pub images_dir: Option<PathBuf>,
}

fn default_user_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/home/pi"))
        .join("pes")
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("/opt/pes")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            user_dir: default_user_dir(),
            base_dir: default_base_dir(),
            roms_dir: None,
            database: None,
            cache_dir: None,
            archive_dir: None,
            consoles_file: None,
            arcade_titles: None,
            images_dir: None,
        }
    }
}

impl PathsConfig {
    pub fn roms_dir(&self) -> PathBuf {
        self.resolve(self.roms_dir.as_deref(), "roms")
    }

    pub fn database(&self) -> PathBuf {
        self.resolve(self.database.as_deref(), "pes.db")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.resolve(self.cache_dir.as_deref(), "cache")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.resolve(self.archive_dir.as_deref(), "archive")
    }

    pub fn consoles_file(&self) -> PathBuf {
        self.resolve(self.consoles_file.as_deref(), "conf.d/pes/consoles.toml")
    }

    /// Defaults to `<base_dir>/resources/images`
    pub fn images_dir(&self) -> PathBuf {
        match &self.images_dir {
            Some(path) => self.expand_path(path),
            None => self.base_dir.join("resources").join("images"),
        }
    }

    pub fn arcade_titles(&self) -> Option<PathBuf> {
        self.arcade_titles.as_deref().map(|p| self.expand_path(p))
    }

    /// Expand `%%USERDIR%%` and `%%BASE%%` in a string
    pub fn expand(&self, value: &str) -> String {
        value
            .replace(USER_DIR_PLACEHOLDER, &self.user_dir.to_string_lossy())
            .replace(BASE_DIR_PLACEHOLDER, &self.base_dir.to_string_lossy())
    }

    fn expand_path(&self, path: &Path) -> PathBuf {
        PathBuf::from(self.expand(&path.to_string_lossy()))
    }

    fn resolve(&self, configured: Option<&Path>, default: &str) -> PathBuf {
        match configured {
            Some(path) => self.expand_path(path),
            None => self.user_dir.join(default),
        }
    }
}

/// Metadata service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperConfig {
    /// theGamesDB API base URL
    #[serde(default = "default_games_db_url")]
    pub games_db_url: String,

    /// theGamesDB API key
    #[serde(default)]
    pub api_key: String,

    /// RetroAchievements base URL
    #[serde(default = "default_achievements_url")]
    pub achievements_url: String,

    /// RetroAchievements badge image base URL
    #[serde(default = "default_badge_url")]
    pub badge_url: String,

    /// Per-request timeout
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// User agent sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Replay archived JSON from this directory instead of calling the services
    #[serde(default)]
    pub replay_dir: Option<PathBuf>,
}

fn default_games_db_url() -> String {
    "https://api.thegamesdb.net/v1".to_string()
}

fn default_achievements_url() -> String {
    "https://retroachievements.org".to_string()
}

fn default_badge_url() -> String {
    "http://i.retroachievements.org/Badge".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    "PES Scraper".to_string()
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            games_db_url: default_games_db_url(),
            api_key: String::new(),
            achievements_url: default_achievements_url(),
            badge_url: default_badge_url(),
            timeout_secs: default_timeout(),
            user_agent: default_user_agent(),
            replay_dir: None,
        }
    }
}

/// RetroAchievements account
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetroAchievementsConfig {
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub hardcore: bool,
}

impl RetroAchievementsConfig {
    /// Whether enough is configured to query per-user progress
    pub fn has_credentials(&self) -> bool {
        self.username.as_deref().is_some_and(|u| !u.is_empty())
            && self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

impl PesConfig {
    /// Load settings from a file, with `PES_` environment overrides on top
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        Self::layered(Some(path))
    }

    /// Load settings from the default location, falling back to defaults
    pub fn load_default() -> Result<Self, ConfigError> {
        let user_config = default_user_dir().join("conf.d/pes/pes.toml");
        if user_config.exists() {
            return Self::layered(Some(&user_config));
        }

        let system_config = Path::new(CONFIG_DIR).join("pes.toml");
        if system_config.exists() {
            return Self::layered(Some(&system_config));
        }

        tracing::warn!("No configuration file found, using defaults");
        Self::layered(None)
    }

    fn layered(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        if config.scraper.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "scraper.timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(config)
    }

    /// Save settings to a file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        tracing::info!("Configuration saved to {}", path.display());
        Ok(())
    }
}
