//! Background scan controller
//!
//! Runs one scan at a time on a dedicated worker thread. The worker opens
//! its own store connection, processes consoles in configuration order and
//! reports through an mpsc channel; the caller can only request cancellation.

use crate::artifacts::{Artifact, ArtifactStore};
use crate::catalog::CatalogSync;
use crate::database::LibraryStore;
use crate::identifier::FileIdentifier;
use crate::reconciler::{ReconcileEvent, ReconcileOutcome, Reconciler, ScanCounts};
use crate::{CancelToken, LibraryError};
use pes_config::ConsoleCatalog;
use pes_scraper::{AchievementsCatalog, GamesCatalog};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanState {
    #[default]
    Idle,
    Running,
    Completed,
    Interrupted,
}

/// Summary of one scan
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanReport {
    pub added: usize,
    pub updated: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub elapsed: Duration,
    pub interrupted: bool,
}

impl ScanReport {
    fn new(counts: ScanCounts, elapsed: Duration, interrupted: bool) -> Self {
        Self {
            added: counts.added,
            updated: counts.updated,
            skipped: counts.skipped,
            deleted: counts.deleted,
            elapsed,
            interrupted,
        }
    }
}

/// Events sent to the UI
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// Per-file progress; `percent` counts completed consoles
    Progress {
        percent: f32,
        name: String,
        cover_art: Option<Artifact>,
    },
    ProgressMessage(String),
    /// `report` is set on the terminal transition only
    StateChanged {
        state: ScanState,
        report: Option<ScanReport>,
    },
}

/// Collaborators shared by every scan
#[derive(Clone)]
pub struct ScanServices {
    pub games: Arc<dyn GamesCatalog>,
    pub achievements: Arc<dyn AchievementsCatalog>,
    pub artifacts: ArtifactStore,
    pub identifier: Arc<FileIdentifier>,
}

#[derive(Debug, Default)]
struct ScanStatus {
    state: ScanState,
    report: Option<ScanReport>,
}

struct Worker {
    db_path: PathBuf,
    consoles: Arc<ConsoleCatalog>,
    services: ScanServices,
    fullscan: bool,
    cancel: CancelToken,
    events: Sender<ScanEvent>,
}

pub struct ScanController {
    db_path: PathBuf,
    consoles: Arc<ConsoleCatalog>,
    services: ScanServices,
    cancel: CancelToken,
    status: Arc<Mutex<ScanStatus>>,
    events: Sender<ScanEvent>,
    worker: Option<JoinHandle<()>>,
}

impl ScanController {
    pub fn new(
        db_path: impl Into<PathBuf>,
        consoles: Arc<ConsoleCatalog>,
        services: ScanServices,
    ) -> (Self, Receiver<ScanEvent>) {
        let (events, receiver) = mpsc::channel();
        let controller = Self {
            db_path: db_path.into(),
            consoles,
            services,
            cancel: CancelToken::new(),
            status: Arc::new(Mutex::new(ScanStatus::default())),
            events,
            worker: None,
        };
        (controller, receiver)
    }

    /// Start a scan; returns false if one is already running
    pub fn start(&mut self, fullscan: bool) -> bool {
        {
            let Ok(mut status) = self.status.lock() else {
                return false;
            };
            if status.state == ScanState::Running {
                tracing::debug!("Scan already running");
                return false;
            }
            status.state = ScanState::Running;
            status.report = None;
        }
        self.reap();
        self.cancel.reset();
        let _ = self.events.send(ScanEvent::StateChanged {
            state: ScanState::Running,
            report: None,
        });

        let worker = Worker {
            db_path: self.db_path.clone(),
            consoles: self.consoles.clone(),
            services: self.services.clone(),
            fullscan,
            cancel: self.cancel.clone(),
            events: self.events.clone(),
        };
        let status = self.status.clone();

        let spawned = std::thread::Builder::new()
            .name("pes-scan".to_string())
            .spawn(move || {
                let report = worker.run();
                let state = if report.interrupted {
                    ScanState::Interrupted
                } else {
                    ScanState::Completed
                };
                if let Ok(mut status) = status.lock() {
                    status.state = state;
                    status.report = Some(report.clone());
                }
                let _ = worker.events.send(ScanEvent::StateChanged {
                    state,
                    report: Some(report),
                });
            });

        match spawned {
            Ok(handle) => {
                tracing::info!("Scan started (full scan: {})", fullscan);
                self.worker = Some(handle);
                true
            }
            Err(e) => {
                tracing::error!("Could not start scan worker: {}", e);
                if let Ok(mut status) = self.status.lock() {
                    status.state = ScanState::Idle;
                }
                false
            }
        }
    }

    /// Request cancellation; returns false when no scan is running
    pub fn cancel(&self) -> bool {
        if self.state() != ScanState::Running {
            return false;
        }
        tracing::info!("Scan cancellation requested");
        self.cancel.cancel();
        true
    }

    pub fn state(&self) -> ScanState {
        self.status
            .lock()
            .map(|s| s.state)
            .unwrap_or(ScanState::Idle)
    }

    /// Report of the last finished scan
    pub fn report(&self) -> Option<ScanReport> {
        self.status.lock().ok().and_then(|s| s.report.clone())
    }

    /// Wait for the current worker to finish
    pub fn join(&mut self) {
        self.reap();
    }

    fn reap(&mut self) {
        if let Some(handle) = self.worker.take()
            && handle.join().is_err()
        {
            tracing::error!("Scan worker panicked");
        }
    }
}

impl Drop for ScanController {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.reap();
    }
}

impl Worker {
    fn message(&self, text: String) {
        tracing::info!("{}", text);
        let _ = self.events.send(ScanEvent::ProgressMessage(text));
    }

    fn run(&self) -> ScanReport {
        let started = Instant::now();
        let (counts, interrupted) = match self.scan() {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("Scan failed: {}", e);
                self.message(format!("Scan failed: {}", e));
                (ScanCounts::default(), false)
            }
        };

        let report = ScanReport::new(counts, started.elapsed(), interrupted);
        tracing::info!(
            "Scan {} in {:?}: {} added, {} updated, {} skipped, {} deleted",
            if interrupted { "interrupted" } else { "completed" },
            report.elapsed,
            report.added,
            report.updated,
            report.skipped,
            report.deleted
        );
        report
    }

    fn scan(&self) -> Result<(ScanCounts, bool), LibraryError> {
        let store = LibraryStore::open(&self.db_path)?;
        for console in self.consoles.consoles() {
            store.upsert_console(console)?;
        }

        let reconciler = Reconciler::new(
            self.services.identifier.clone(),
            CatalogSync::new(
                self.services.games.clone(),
                self.services.achievements.clone(),
            ),
            self.services.artifacts.clone(),
        );

        let total = self.consoles.len().max(1) as f32;
        let mut counts = ScanCounts::default();
        let mut files_found = 0;

        for (index, console) in self.consoles.consoles().iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Ok((counts, true));
            }

            let percent = index as f32 / total * 100.0;
            let mut on_event = |event: ReconcileEvent| match event {
                ReconcileEvent::Enumerated { count } => {
                    files_found += count;
                    self.message(format!("Processing {}: {} ROMs found", console.name, count));
                }
                ReconcileEvent::File(progress) => {
                    let _ = self.events.send(ScanEvent::Progress {
                        percent,
                        name: progress.name,
                        cover_art: progress.cover_art,
                    });
                }
            };

            match reconciler.reconcile(
                &store,
                console,
                self.fullscan,
                &self.cancel,
                &mut on_event,
            ) {
                Ok(ReconcileOutcome::Completed(console_counts)) => counts.merge(&console_counts),
                Ok(ReconcileOutcome::Interrupted) => return Ok((counts, true)),
                Err(e) => {
                    tracing::error!("Failed to scan {}: {}", console.name, e);
                    self.message(format!("Failed to scan {}: {}", console.name, e));
                }
            }
        }

        if files_found == 0 {
            self.message("No ROMs found".to_string());
        }
        Ok((counts, false))
    }
}
