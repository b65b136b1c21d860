//! Engine façade.
//!
//! Wires the catalog, scanner, realtime monitor and quarantine manager
//! together behind one handle, and owns their lifecycle: construction emits
//! status events through an optional sink and tears down cleanly on partial
//! failure; `shutdown` is idempotent and always stops realtime monitoring
//! first.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

use sentra_core::{Catalog, ScanResult, Severity};

use crate::monitor::{Monitor, MonitorState};
use crate::policy::ScanPolicy;
use crate::quarantine::{QuarantineConfig, QuarantineManager, QuarantineOutcome};
use crate::rules::RuleMatcher;
use crate::scanner::Scanner;
use crate::sink::{self, ResultSink};
use crate::trust::TrustOracle;
use crate::Result;

/// Paths the engine needs to come up.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub catalog_path: PathBuf,
    pub quarantine_folder: PathBuf,
}

/// The assembled engine.
pub struct Engine {
    scanner: Arc<Scanner>,
    monitor: Monitor,
    quarantine: QuarantineManager,
    open: AtomicBool,
}

impl Engine {
    /// Open the catalog and assemble the engine around `rules`.
    ///
    /// Progress and failure are reported as NOTICE/ERROR status results
    /// through `status` when provided. On failure every partially
    /// constructed piece is dropped before returning.
    pub fn open(
        config: EngineConfig,
        rules: Option<Box<dyn RuleMatcher>>,
        status: Option<&ResultSink>,
    ) -> Result<Self> {
        emit_status(status, Severity::Notice, "Loading rules & database...");

        let catalog = match Catalog::open(&config.catalog_path) {
            Ok(c) => Arc::new(c),
            Err(e) => {
                emit_status(
                    status,
                    Severity::Error,
                    format!("Cannot open database: {e}"),
                );
                return Err(e.into());
            }
        };

        let policy = Arc::new(ScanPolicy::new());
        let scanner = Arc::new(Scanner::new(
            catalog.clone(),
            rules,
            policy,
            TrustOracle::new(),
        ));

        // Separate catalog handle: quarantine writes never contend with the
        // scanner's prepared read statements.
        let quarantine_catalog = match Catalog::open(&config.catalog_path) {
            Ok(c) => Arc::new(c),
            Err(e) => {
                emit_status(
                    status,
                    Severity::Error,
                    format!("Cannot open database: {e}"),
                );
                return Err(e.into());
            }
        };
        let quarantine = QuarantineManager::new(
            quarantine_catalog,
            QuarantineConfig::new(config.quarantine_folder),
        );

        let monitor = Monitor::new(scanner.clone());

        emit_status(status, Severity::Notice, "Engine ready (rules + DB loaded)");
        info!(catalog = %config.catalog_path.display(), "engine ready");

        Ok(Self {
            scanner,
            monitor,
            quarantine,
            open: AtomicBool::new(true),
        })
    }

    /// Open the engine with a pre-compiled YARA rule set from `rules_path`.
    #[cfg(feature = "yara")]
    pub fn open_with_rules_file(
        config: EngineConfig,
        rules_path: &Path,
        status: Option<&ResultSink>,
    ) -> Result<Self> {
        let rules = match crate::rules::YaraRules::load(rules_path) {
            Ok(r) => r,
            Err(e) => {
                emit_status(status, Severity::Error, format!("Cannot load rules: {e}"));
                return Err(e);
            }
        };
        Self::open(config, Some(Box::new(rules)), status)
    }

    // ── scanning ────────────────────────────────────────────────────────

    pub fn scan_file(&self, path: &Path, sink: &ResultSink) {
        if !self.open.load(Ordering::Acquire) {
            return;
        }
        self.scanner.scan_file(path, sink);
    }

    pub fn scan_folder(&self, root: &Path, sink: &ResultSink) {
        if !self.open.load(Ordering::Acquire) {
            return;
        }
        self.scanner.scan_folder(root, sink);
    }

    pub fn progress_percent(&self) -> u8 {
        self.scanner.progress_percent()
    }

    pub fn progress_counts(&self) -> (u64, u64) {
        self.scanner.progress_counts()
    }

    pub fn set_full_scan(&self, enabled: bool) {
        self.scanner.policy().set_full_scan(enabled);
    }

    pub fn is_full_scan(&self) -> bool {
        self.scanner.policy().is_full_scan()
    }

    pub fn set_throttle_duty(&self, duty: f64) {
        self.scanner.policy().set_throttle_duty(duty);
    }

    pub fn set_throttle_max_sleep(&self, max_sleep: std::time::Duration) {
        self.scanner.policy().set_throttle_max_sleep(max_sleep);
    }

    pub fn reset_progress(&self) {
        self.scanner.reset_progress();
    }

    // ── realtime ────────────────────────────────────────────────────────

    pub fn start_realtime(&self, watch_spec: &str, sink: ResultSink) -> Result<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(crate::EngineError::AlreadyRunning);
        }
        self.monitor.start_realtime(watch_spec, sink)
    }

    pub fn stop_realtime(&self) {
        self.monitor.stop_realtime();
    }

    pub fn monitor_state(&self) -> MonitorState {
        self.monitor.state()
    }

    // ── quarantine ──────────────────────────────────────────────────────

    pub fn quarantine(&self, path: &Path) -> QuarantineOutcome {
        self.quarantine.quarantine(path)
    }

    pub fn restore(&self, stored_name_or_path: &str) -> QuarantineOutcome {
        self.quarantine.restore(stored_name_or_path)
    }

    pub fn whitelist(&self, path: &Path) -> QuarantineOutcome {
        self.quarantine.whitelist(path)
    }

    // ── lifecycle ───────────────────────────────────────────────────────

    /// Stop realtime monitoring and release the engine. Safe to call more
    /// than once; scans after shutdown are ignored.
    pub fn shutdown(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        self.monitor.stop_realtime();
        info!("engine shut down");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn emit_status(sink: Option<&ResultSink>, severity: Severity, message: impl Into<String>) {
    if let Some(sink) = sink {
        sink::deliver(sink, ScanResult::status(severity, message));
    }
}
