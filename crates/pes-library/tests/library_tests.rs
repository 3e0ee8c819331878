//! Integration tests for library scanning

use pes_config::{ConsoleCatalog, ConsoleConfig, IdentifyMode};
use pes_library::{
    ArtifactCache, ArtifactStore, CancelToken, CatalogSync, FileIdentifier, LibraryStore,
    ReconcileOutcome, Reconciler, ScanController, ScanCounts, ScanEvent, ScanReport,
    ScanServices, ScanState,
};
use pes_scraper::mock::{MockAchievementsCatalog, MockFetcher, MockGamesCatalog, catalog_game};
use pes_scraper::{
    AchievementGameHashes, CatalogPage, GamesCatalog, HashLibrary, ImagesPage, JsonArchive,
    ReplayAchievementsCatalog, ReplayGamesCatalog, ScraperError,
};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Test helper for library tests
struct TestEnvironment {
    #[allow(dead_code)]
    temp_dir: TempDir,
    roms_dir: PathBuf,
    games: Arc<MockGamesCatalog>,
    achievements: Arc<MockAchievementsCatalog>,
    fetcher: Arc<MockFetcher>,
    artifacts: ArtifactStore,
    identifier: Arc<FileIdentifier>,
}

impl TestEnvironment {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let roms_dir = temp_dir.path().join("roms");
        fs::create_dir_all(&roms_dir).expect("Failed to create roms directory");

        let fetcher = Arc::new(MockFetcher::new());
        let cache = Arc::new(
            ArtifactCache::open(temp_dir.path().join("cache")).expect("Failed to open cache"),
        );

        Self {
            artifacts: ArtifactStore::new(cache, fetcher.clone()),
            identifier: Arc::new(FileIdentifier::new(&roms_dir, HashMap::new())),
            temp_dir,
            roms_dir,
            games: Arc::new(MockGamesCatalog::new()),
            achievements: Arc::new(MockAchievementsCatalog::new()),
            fetcher,
        }
    }

    fn console(&self, id: i64, name: &str) -> ConsoleConfig {
        let directory = self.roms_dir.join(name);
        fs::create_dir_all(&directory).expect("Failed to create console directory");
        ConsoleConfig {
            id,
            name: name.to_string(),
            platform_id: id,
            achievements_id: None,
            extensions: vec!["nes".to_string(), "zip".to_string()],
            ignore_roms: Vec::new(),
            command: "fceux %%GAME%%".to_string(),
            directory: Some(directory),
            no_cover_art: "nocoverart.png".to_string(),
            identify: IdentifyMode::Hash,
        }
    }

    fn write_rom(&self, console: &ConsoleConfig, name: &str, size: usize) -> PathBuf {
        let path = console.scan_dir(&self.roms_dir).join(name);
        let mut contents = name.as_bytes().to_vec();
        contents.resize(size, 0xAA);
        fs::write(&path, contents).expect("Failed to write ROM");
        path
    }

    fn db_path(&self) -> PathBuf {
        self.temp_dir.path().join("pes.db")
    }

    fn store(&self, console: &ConsoleConfig) -> LibraryStore {
        let store = LibraryStore::open(self.db_path()).expect("Failed to open store");
        store.upsert_console(console).expect("Failed to add console");
        store
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.identifier.clone(),
            CatalogSync::new(self.games.clone(), self.achievements.clone()),
            self.artifacts.clone(),
        )
    }

    fn services(&self, games: Arc<dyn GamesCatalog>) -> ScanServices {
        ScanServices {
            games,
            achievements: self.achievements.clone(),
            artifacts: self.artifacts.clone(),
            identifier: self.identifier.clone(),
        }
    }
}

fn reconcile(
    env: &TestEnvironment,
    store: &LibraryStore,
    console: &ConsoleConfig,
    force: bool,
) -> ScanCounts {
    match env
        .reconciler()
        .reconcile(store, console, force, &CancelToken::new(), &mut |_| {})
        .expect("Reconcile failed")
    {
        ReconcileOutcome::Completed(counts) => counts,
        ReconcileOutcome::Interrupted => panic!("unexpected interruption"),
    }
}

fn wait_for_report(events: &Receiver<ScanEvent>) -> (ScanState, ScanReport, Vec<ScanEvent>) {
    let mut seen = Vec::new();
    loop {
        let event = events
            .recv_timeout(Duration::from_secs(10))
            .expect("Scan did not finish");
        if let ScanEvent::StateChanged {
            state,
            report: Some(report),
        } = &event
        {
            return (*state, report.clone(), seen);
        }
        seen.push(event);
    }
}

#[test]
fn test_nes_example() {
    let env = TestEnvironment::new();
    let nes = env.console(7, "NES");
    env.write_rom(&nes, "mario.nes", 50000);
    env.write_rom(&nes, "zelda.nes", 80000);
    env.games.add_page(7, vec![catalog_game(113, 7, "Zelda")]);

    let store = env.store(&nes);
    let counts = reconcile(&env, &store, &nes, false);
    assert_eq!(counts.added, 2);

    let entries = store.games_by_console(7).unwrap();
    let matched: Vec<_> = entries
        .iter()
        .filter(|e| e.catalog_game_id.is_some())
        .collect();
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].name, "Zelda");
    assert_eq!(matched[0].size, 80000);

    let mario = entries.iter().find(|e| e.name == "mario").unwrap();
    assert_eq!(mario.cover_front, Some(PathBuf::from("nocoverart.png")));
    assert_eq!(
        nes.launch_command(&mario.path).unwrap(),
        format!("fceux \"{}\"", mario.path.display())
    );
}

#[test]
fn test_missing_cover_art_falls_back() {
    let env = TestEnvironment::new();
    let nes = env.console(7, "NES");
    let zelda = catalog_game(113, 7, "Zelda");
    let front = zelda.front.clone().unwrap();
    env.games.add_page(7, vec![zelda]);
    env.write_rom(&nes, "zelda.nes", 100);

    // No image is served, so every size fails
    let store = env.store(&nes);
    let counts = reconcile(&env, &store, &nes, false);
    assert_eq!(counts.added, 1);

    let requests = env.fetcher.requests();
    assert!(requests.contains(&front.large));
    assert!(requests.contains(&front.medium));
    assert!(requests.contains(&front.original));

    let entries = store.games_by_console(7).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "Zelda");
    assert_eq!(entries[0].catalog_game_id, Some(113));
    assert_eq!(entries[0].cover_front, Some(PathBuf::from("nocoverart.png")));
    assert!(store.screenshots(entries[0].id).unwrap().is_empty());
}

#[test]
fn test_second_scan_is_idempotent() {
    let env = TestEnvironment::new();
    let nes = env.console(7, "NES");
    env.write_rom(&nes, "mario.nes", 100);
    env.write_rom(&nes, "zelda.nes", 100);
    let store = env.store(&nes);

    reconcile(&env, &store, &nes, false);
    let before = store.entries_for_console(7).unwrap();

    let counts = reconcile(&env, &store, &nes, false);
    assert_eq!(
        counts,
        ScanCounts {
            skipped: 2,
            ..Default::default()
        }
    );
    assert_eq!(store.entries_for_console(7).unwrap(), before);
}

#[test]
fn test_deleted_file_keeps_catalog_row() {
    let env = TestEnvironment::new();
    let nes = env.console(7, "NES");
    env.games.add_page(7, vec![catalog_game(113, 7, "Zelda")]);
    let zelda = env.write_rom(&nes, "zelda.nes", 100);
    env.write_rom(&nes, "mario.nes", 100);
    let store = env.store(&nes);
    reconcile(&env, &store, &nes, false);

    fs::remove_file(zelda).unwrap();
    let counts = reconcile(&env, &store, &nes, false);

    assert_eq!(counts.deleted, 1);
    assert_eq!(counts.skipped, 1);
    assert_eq!(store.entries_for_console(7).unwrap().len(), 1);
    assert!(store.catalog_game(113).unwrap().is_some());
}

#[test]
fn test_rename_is_a_path_update() {
    let env = TestEnvironment::new();
    let nes = env.console(7, "NES");
    let original = env.write_rom(&nes, "zelda.nes", 100);
    let store = env.store(&nes);
    reconcile(&env, &store, &nes, false);
    let id = store.entries_for_console(7).unwrap()[0].id;

    let renamed = nes.scan_dir(&env.roms_dir).join("The Legend of Zelda.nes");
    fs::rename(&original, &renamed).unwrap();
    let counts = reconcile(&env, &store, &nes, false);

    assert_eq!(counts.added, 0);
    assert_eq!(counts.deleted, 0);
    let entry = store.entry(id).unwrap().unwrap();
    assert_eq!(entry.path, renamed);
}

#[test]
fn test_force_refresh_updates_and_refetches() {
    let env = TestEnvironment::new();
    let nes = env.console(7, "NES");
    let zelda = catalog_game(113, 7, "Zelda");
    let front = zelda.front.clone().unwrap();
    env.games.add_page(7, vec![zelda]);
    env.fetcher.add(&front.large, b"cover");
    env.write_rom(&nes, "zelda.nes", 100);
    env.write_rom(&nes, "mario.nes", 100);
    let store = env.store(&nes);

    reconcile(&env, &store, &nes, false);
    let fetched = env.fetcher.requests().len();
    let catalog_requests = env.games.requests().len();

    let counts = reconcile(&env, &store, &nes, true);
    assert_eq!(
        counts,
        ScanCounts {
            updated: 2,
            ..Default::default()
        }
    );
    assert!(env.fetcher.requests().len() > fetched);
    assert!(env.games.requests().len() > catalog_requests);
}

#[test]
fn test_page_timeout_is_tolerated() {
    let env = TestEnvironment::new();
    let nes = env.console(7, "NES");
    env.games.add_page(7, vec![catalog_game(1, 7, "Mario")]);
    env.games.add_page(7, vec![catalog_game(113, 7, "Zelda")]);
    env.games.fail_page(7, 1);
    env.write_rom(&nes, "mario.nes", 100);
    env.write_rom(&nes, "zelda.nes", 100);
    let store = env.store(&nes);

    let counts = reconcile(&env, &store, &nes, false);
    assert_eq!(counts.added, 2);

    let entries = store.games_by_console(7).unwrap();
    let mario = entries.iter().find(|e| e.name == "mario").unwrap();
    assert_eq!(mario.catalog_game_id, None);
    let zelda = entries.iter().find(|e| e.name == "Zelda").unwrap();
    assert_eq!(zelda.catalog_game_id, Some(113));
}

#[test]
fn test_hash_match_preferred_over_title() {
    let env = TestEnvironment::new();
    let mut nes = env.console(7, "NES");
    nes.achievements_id = Some(7);
    let rom = env.write_rom(&nes, "Hacked Copy.nes", 100);
    let hash = pes_library::md5_file(&rom).unwrap();

    env.games
        .add_page(7, vec![catalog_game(113, 7, "The Legend of Zelda")]);
    let mut library = HashLibrary::new();
    library.insert(
        22,
        AchievementGameHashes {
            hashes: vec![hash],
            title: Some("The Legend of Zelda".to_string()),
        },
    );
    env.achievements.set_library(7, library);

    let store = env.store(&nes);
    reconcile(&env, &store, &nes, false);

    let entry = &store.entries_for_console(7).unwrap()[0];
    assert_eq!(entry.achievement_game_id, Some(22));
    assert_eq!(entry.catalog_game_id, Some(113));
}

#[test]
fn test_reader_sees_pre_or_post_scan_state() {
    let env = TestEnvironment::new();
    let nes = env.console(7, "NES");
    env.write_rom(&nes, "mario.nes", 100);
    let store = env.store(&nes);
    let reader = LibraryStore::open_read_only(env.db_path()).unwrap();

    let mut seen_during_scan = Vec::new();
    env.reconciler()
        .reconcile(&store, &nes, false, &CancelToken::new(), &mut |_| {
            seen_during_scan.push(reader.entry_count().unwrap());
        })
        .unwrap();

    assert!(seen_during_scan.iter().all(|count| *count == 0));
    assert_eq!(reader.entry_count().unwrap(), 1);
}

/// Blocks the first request for one platform until released
struct GatedCatalog {
    inner: Arc<MockGamesCatalog>,
    platform_id: i64,
    reached: Mutex<Option<Sender<()>>>,
    release: Mutex<Receiver<()>>,
}

impl GatedCatalog {
    fn new(inner: Arc<MockGamesCatalog>, platform_id: i64) -> (Self, Receiver<()>, Sender<()>) {
        let (reached_tx, reached_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let gate = Self {
            inner,
            platform_id,
            reached: Mutex::new(Some(reached_tx)),
            release: Mutex::new(release_rx),
        };
        (gate, reached_rx, release_tx)
    }
}

impl GamesCatalog for GatedCatalog {
    fn fetch_games(&self, platform_id: i64, page: u32) -> Result<CatalogPage, ScraperError> {
        if platform_id == self.platform_id {
            let reached = self.reached.lock().unwrap().take();
            if let Some(reached) = reached {
                reached.send(()).unwrap();
                self.release
                    .lock()
                    .unwrap()
                    .recv_timeout(Duration::from_secs(10))
                    .unwrap();
            }
        }
        self.inner.fetch_games(platform_id, page)
    }

    fn fetch_images(
        &self,
        platform_id: i64,
        game_ids: &[i64],
        batch: u32,
        page: u32,
    ) -> Result<ImagesPage, ScraperError> {
        self.inner.fetch_images(platform_id, game_ids, batch, page)
    }
}

#[test]
fn test_cancel_after_first_console() {
    let env = TestEnvironment::new();
    let consoles = vec![
        env.console(1, "NES"),
        env.console(2, "SNES"),
        env.console(3, "GB"),
    ];
    for console in &consoles {
        env.write_rom(console, &format!("{}-a.nes", console.name), 100);
        env.write_rom(console, &format!("{}-b.nes", console.name), 100);
    }

    let (gate, reached, release) = GatedCatalog::new(env.games.clone(), 2);
    let (mut scan, events) = ScanController::new(
        env.db_path(),
        Arc::new(ConsoleCatalog::from_consoles(consoles).unwrap()),
        env.services(Arc::new(gate)),
    );

    assert!(scan.start(false));
    reached.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(scan.cancel());
    release.send(()).unwrap();

    let (state, report, seen) = wait_for_report(&events);
    scan.join();

    assert_eq!(state, ScanState::Interrupted);
    assert!(report.interrupted);
    assert_eq!(report.added, 2);
    assert!(!seen.contains(&ScanEvent::ProgressMessage(
        "Processing GB: 2 ROMs found".to_string()
    )));

    let store = LibraryStore::open_read_only(env.db_path()).unwrap();
    assert_eq!(store.entry_count().unwrap(), 2);
    assert_eq!(scan.state(), ScanState::Interrupted);
}

#[test]
fn test_scan_is_single_flight() {
    let env = TestEnvironment::new();
    let nes = env.console(1, "NES");
    env.write_rom(&nes, "mario.nes", 100);

    let (gate, reached, release) = GatedCatalog::new(env.games.clone(), 1);
    let (mut scan, events) = ScanController::new(
        env.db_path(),
        Arc::new(ConsoleCatalog::from_consoles(vec![nes]).unwrap()),
        env.services(Arc::new(gate)),
    );

    assert!(scan.start(false));
    reached.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(scan.state(), ScanState::Running);
    assert!(!scan.start(true));
    release.send(()).unwrap();

    let (state, report, seen) = wait_for_report(&events);
    scan.join();
    assert_eq!(state, ScanState::Completed);
    assert_eq!(report.added, 1);
    assert!(seen.iter().any(|e| matches!(
        e,
        ScanEvent::Progress { name, .. } if name == "mario"
    )));

    // A finished scan can be restarted
    assert!(scan.start(false));
    let (_, report, _) = wait_for_report(&events);
    assert_eq!(report.skipped, 1);
}

#[test]
fn test_replay_scan() {
    let env = TestEnvironment::new();
    let nes = env.console(7, "NES");
    env.write_rom(&nes, "zelda.nes", 100);

    let archive = JsonArchive::new(env.temp_dir.path().join("archive"));
    archive
        .write(
            &archive.games_path(7, 1),
            r#"{"status":"Success","data":{"games":[{"id":113,"game_title":"Zelda","platform":7}]},"pages":{"next":null}}"#,
        )
        .unwrap();

    let reconciler = Reconciler::new(
        env.identifier.clone(),
        CatalogSync::new(
            Arc::new(ReplayGamesCatalog::new(archive.clone())),
            Arc::new(ReplayAchievementsCatalog::new(archive)),
        ),
        env.artifacts.clone(),
    );
    let store = env.store(&nes);
    let outcome = reconciler
        .reconcile(&store, &nes, false, &CancelToken::new(), &mut |_| {})
        .unwrap();

    assert_eq!(
        outcome,
        ReconcileOutcome::Completed(ScanCounts {
            added: 1,
            ..Default::default()
        })
    );
    assert_eq!(
        store.entries_for_console(7).unwrap()[0].catalog_game_id,
        Some(113)
    );
}
