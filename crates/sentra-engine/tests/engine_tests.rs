//! Tests for the engine façade: initialization status events, end-to-end
//! scan-then-quarantine flow, and idempotent shutdown.

use std::fs;
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

use sentra_core::digest::{self, DigestAlgorithm};
use sentra_core::{Catalog, ScanResult, Severity};
use sentra_engine::engine::EngineConfig;
use sentra_engine::sink::{sink_from, ResultSink};
use sentra_engine::Engine;

fn collecting_sink() -> (ResultSink, Arc<Mutex<Vec<ScanResult>>>) {
    let collected = Arc::new(Mutex::new(Vec::new()));
    let store = collected.clone();
    let sink = sink_from(move |result: ScanResult| {
        store.lock().unwrap().push(result);
    });
    (sink, collected)
}

#[test]
fn open_emits_loading_and_ready_notices() {
    let dir = tempdir().unwrap();
    let config = EngineConfig {
        catalog_path: dir.path().join("catalog.db"),
        quarantine_folder: dir.path().join("repo"),
    };

    let (status, events) = collecting_sink();
    let engine = Engine::open(config, None, Some(&status)).unwrap();

    let events = events.lock().unwrap();
    assert!(events.len() >= 2);
    assert!(events.iter().all(|e| e.severity == Severity::Notice));
    assert!(events[0].description.contains("Loading"));
    assert!(events.last().unwrap().description.contains("ready"));
    drop(events);

    engine.shutdown();
}

#[test]
fn detect_then_quarantine_then_restore_through_the_facade() {
    let dir = tempdir().unwrap();
    let catalog_path = dir.path().join("catalog.db");
    let config = EngineConfig {
        catalog_path: catalog_path.clone(),
        quarantine_folder: dir.path().join("repo"),
    };

    let sample = dir.path().join("dropper.bin");
    fs::write(&sample, b"captured sample").unwrap();
    let sha256 = digest::compute(&sample, DigestAlgorithm::Sha256).unwrap();

    // Seed the signature before the engine opens its handles.
    {
        let seed = Catalog::open(&catalog_path).unwrap();
        seed.insert_signature(DigestAlgorithm::Sha256, &sha256, "Dropper.Gen")
            .unwrap();
    }

    let engine = Engine::open(config, None, None).unwrap();
    let (sink, results) = collecting_sink();
    engine.scan_file(&sample, &sink);

    {
        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_malware);
        assert_eq!(results[0].malware_name.as_deref(), Some("Dropper.Gen"));
    }
    assert_eq!(engine.progress_percent(), 100);

    // Host reacts to the detection by quarantining, then restores.
    let outcome = engine.quarantine(&sample);
    assert!(!outcome.is_error());
    assert!(!sample.exists());

    let stored = outcome.to_string();
    let stored_name = stored.rsplit('/').next().unwrap();
    let restored = engine.restore(stored_name);
    assert!(restored.to_string().starts_with("RESTORED:"));
    assert_eq!(fs::read(&sample).unwrap(), b"captured sample");

    // The restore whitelisted the content: a re-scan skips it.
    let (sink, results) = collecting_sink();
    engine.scan_file(&sample, &sink);
    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert!(!results[0].is_malware);
    assert_eq!(
        results[0].detection_source,
        sentra_core::DetectionSource::Whitelist
    );
}

#[test]
fn shutdown_is_idempotent_and_silences_scans() {
    let dir = tempdir().unwrap();
    let config = EngineConfig {
        catalog_path: dir.path().join("catalog.db"),
        quarantine_folder: dir.path().join("repo"),
    };
    let sample = dir.path().join("late.bin");
    fs::write(&sample, b"anything").unwrap();

    let engine = Engine::open(config, None, None).unwrap();
    engine.shutdown();
    engine.shutdown();

    let (sink, results) = collecting_sink();
    engine.scan_file(&sample, &sink);
    engine.scan_folder(dir.path(), &sink);
    assert!(results.lock().unwrap().is_empty());
}
