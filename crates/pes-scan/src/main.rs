//! PES library scan
//!
//! Loads the PES settings and console catalog, scans every console directory
//! into the library database and logs progress. Optionally refreshes
//! RetroAchievements progress for matched games afterwards.

use anyhow::{Context, Result};
use clap::Parser;
use pes_config::{ConsoleCatalog, PesConfig};
use pes_library::{
    AchievementSync, ArtifactCache, ArtifactStore, CancelToken, FileIdentifier, LibraryStore,
    ScanController, ScanEvent, ScanServices,
};
use pes_scraper::{
    AchievementsCatalog, GamesCatalog, GamesDbClient, HttpClient, JsonArchive,
    ReplayAchievementsCatalog, ReplayGamesCatalog, RetroAchievementsClient,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "pes-scan")]
#[command(version, about = "Scan ROM directories into the PES library", long_about = None)]
struct Cli {
    /// Settings file (default: ~/pes/conf.d/pes/pes.toml, then /etc/pes/pes.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Re-fetch all metadata and artwork
    #[arg(long)]
    full: bool,

    /// Sync achievement progress for matched games after the scan
    #[arg(long)]
    achievements: bool,
}

fn main() -> Result<()> {
    setup_logging();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => PesConfig::load(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => PesConfig::load_default().context("Failed to load settings")?,
    };
    let paths = &config.paths;

    let consoles_file = paths.consoles_file();
    let consoles = ConsoleCatalog::load(&consoles_file, paths).with_context(|| {
        format!("Failed to load consoles from {}", consoles_file.display())
    })?;

    let db_path = paths.database();
    let store = LibraryStore::open(&db_path)
        .with_context(|| format!("Failed to open library {}", db_path.display()))?;
    if let Some(arcade) = paths.arcade_titles()
        && let Err(e) = store.load_arcade_titles(&arcade)
    {
        warn!("Could not load arcade titles from {}: {}", arcade.display(), e);
    }
    let arcade_titles = store.arcade_titles()?;

    let http = Arc::new(
        HttpClient::new(
            Duration::from_secs(config.scraper.timeout_secs),
            &config.scraper.user_agent,
        )
        .context("Failed to create HTTP client")?,
    );

    let (games, achievements) = match &config.scraper.replay_dir {
        Some(dir) => {
            info!("Replaying archived responses from {}", dir.display());
            let archive = JsonArchive::new(dir);
            let games: Arc<dyn GamesCatalog> = Arc::new(ReplayGamesCatalog::new(archive.clone()));
            let achievements: Arc<dyn AchievementsCatalog> =
                Arc::new(ReplayAchievementsCatalog::new(archive));
            (games, achievements)
        }
        None => {
            let archive = JsonArchive::new(paths.archive_dir());
            let games: Arc<dyn GamesCatalog> = Arc::new(
                GamesDbClient::new(
                    http.clone(),
                    &config.scraper.games_db_url,
                    &config.scraper.api_key,
                )
                .with_archive(archive.clone()),
            );
            let achievements: Arc<dyn AchievementsCatalog> = Arc::new(
                RetroAchievementsClient::new(http.clone(), &config.scraper.achievements_url)
                    .with_archive(archive),
            );
            (games, achievements)
        }
    };

    let cache_dir = paths.cache_dir();
    let cache = ArtifactCache::open(&cache_dir)
        .with_context(|| format!("Failed to open cache {}", cache_dir.display()))?;
    let artifacts = ArtifactStore::new(Arc::new(cache), http);

    let services = ScanServices {
        games,
        achievements: achievements.clone(),
        artifacts: artifacts.clone(),
        identifier: Arc::new(FileIdentifier::new(paths.roms_dir(), arcade_titles)),
    };

    let (mut scan, events) = ScanController::new(&db_path, Arc::new(consoles), services);
    if !scan.start(cli.full) {
        anyhow::bail!("A scan is already running");
    }

    for event in events.iter() {
        match event {
            ScanEvent::Progress {
                percent,
                name,
                cover_art,
            } => match cover_art.as_ref().map(|art| art.path()) {
                Some(Some(path)) => info!("[{:3.0}%] {} ({})", percent, name, path.display()),
                Some(None) => info!("[{:3.0}%] {} (cover art not cached)", percent, name),
                None => info!("[{:3.0}%] {}", percent, name),
            },
            ScanEvent::ProgressMessage(text) => info!("{}", text),
            ScanEvent::StateChanged {
                state,
                report: Some(report),
            } => {
                info!(
                    "Scan {:?}: {} added, {} updated, {} skipped, {} deleted in {:.1}s",
                    state,
                    report.added,
                    report.updated,
                    report.skipped,
                    report.deleted,
                    report.elapsed.as_secs_f64()
                );
                break;
            }
            ScanEvent::StateChanged { .. } => {}
        }
    }
    scan.join();

    if cli.achievements {
        sync_achievements(&config, &store, achievements, artifacts)?;
    }

    for count in store.console_counts()? {
        info!("{}: {} games", count.name, count.count);
    }

    Ok(())
}

fn sync_achievements(
    config: &PesConfig,
    store: &LibraryStore,
    achievements: Arc<dyn AchievementsCatalog>,
    artifacts: ArtifactStore,
) -> Result<()> {
    let account = &config.retroachievements;
    let (Some(user), Some(api_key)) = (&account.username, &account.api_key) else {
        warn!("RetroAchievements credentials not configured, skipping achievements");
        return Ok(());
    };
    if !account.has_credentials() {
        warn!("RetroAchievements credentials are empty, skipping achievements");
        return Ok(());
    }

    let sync = AchievementSync::new(
        achievements,
        artifacts,
        &config.scraper.badge_url,
        user,
        api_key,
        account.hardcore,
    );
    if let Some(password) = &account.password {
        match sync.login(password) {
            Ok(session) => info!("RetroAchievements score: {}", session.score),
            Err(e) => warn!("RetroAchievements login failed: {}", e),
        }
    }

    let cancel = CancelToken::new();
    for entry in store.achievement_entries()? {
        match sync.sync(store, entry.id, &cancel) {
            Ok(result) if result.refreshed => info!(
                "{}: {}/{} points, {} badges",
                entry.name, result.score, result.max_score, result.badges
            ),
            Ok(_) => {}
            Err(e) => error!("Could not sync achievements for {}: {}", entry.name, e),
        }
    }
    Ok(())
}

/// Setup logging
fn setup_logging() {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}
