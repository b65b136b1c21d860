//! Integration tests for the detection cascade.
//!
//! Covers:
//!  1. Signature hash hit (sha256 tier, catalog name propagated)
//!  2. Oversize policy skip with progress accounting
//!  3. Whitelist short-circuit beating the rule matcher
//!  4. Rule hit through the sampled (prefix+suffix) path
//!  5. Full-scan override bypassing the whitelist
//!  6. Matcher failure surfacing as an ERROR result
//!  7. Concurrent on-demand scans
//!  8. Folder scan progress reaching 100%

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

use sentra_core::digest::{self, DigestAlgorithm};
use sentra_core::{Catalog, DetectionSource, ScanResult, Severity};
use sentra_engine::policy::ScanPolicy;
use sentra_engine::rules::MockRules;
use sentra_engine::sink::{sink_from, ResultSink};
use sentra_engine::trust::TrustOracle;
use sentra_engine::Scanner;

/// Collects every emitted result for later assertions.
fn collecting_sink() -> (ResultSink, Arc<Mutex<Vec<ScanResult>>>) {
    let collected = Arc::new(Mutex::new(Vec::new()));
    let store = collected.clone();
    let sink = sink_from(move |result: ScanResult| {
        store.lock().unwrap().push(result);
    });
    (sink, collected)
}

fn scanner_with(catalog: Arc<Catalog>, rules: Option<Box<MockRules>>) -> Scanner {
    Scanner::new(
        catalog,
        rules.map(|r| r as Box<dyn sentra_engine::RuleMatcher>),
        Arc::new(ScanPolicy::new()),
        TrustOracle::new(),
    )
}

fn write_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

// ─── Test 1: Hash hit ───────────────────────────────────────────────────────

#[test]
fn sha256_hit_emits_single_high_result_and_skips_rules() {
    let dir = tempdir().unwrap();
    let empty = write_file(dir.path(), "empty.bin", b"");

    let catalog = Arc::new(Catalog::open_in_memory().unwrap());
    catalog
        .insert_signature(
            DigestAlgorithm::Sha256,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
            "empty",
        )
        .unwrap();

    // A failing matcher proves the rule tier is never reached on a hash hit.
    let scanner = scanner_with(catalog, Some(Box::new(MockRules::failing("must not run"))));
    let (sink, results) = collecting_sink();

    scanner.scan_file(&empty, &sink);

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    let r = &results[0];
    assert!(r.is_malware);
    assert_eq!(r.severity, Severity::High);
    assert_eq!(r.detection_source, DetectionSource::Hash);
    assert_eq!(r.matched_hash_type.as_deref(), Some("SHA256"));
    assert_eq!(r.malware_name.as_deref(), Some("empty"));
    assert_eq!(
        r.matched_hash.as_deref(),
        Some("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
    );
}

#[test]
fn stronger_digest_wins_when_multiple_tiers_match() {
    let dir = tempdir().unwrap();
    let file = write_file(dir.path(), "both.bin", b"double entry");
    let digests = digest::compute_all(&file).unwrap();

    let catalog = Arc::new(Catalog::open_in_memory().unwrap());
    catalog
        .insert_signature(DigestAlgorithm::Md5, digests.md5.as_deref().unwrap(), "ByMd5")
        .unwrap();
    catalog
        .insert_signature(
            DigestAlgorithm::Sha256,
            digests.sha256.as_deref().unwrap(),
            "BySha256",
        )
        .unwrap();

    let scanner = scanner_with(catalog, None);
    let (sink, results) = collecting_sink();
    scanner.scan_file(&file, &sink);

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].malware_name.as_deref(), Some("BySha256"));
    assert_eq!(results[0].matched_hash_type.as_deref(), Some("SHA256"));
}

// ─── Test 2: Oversize skip ──────────────────────────────────────────────────

#[test]
fn oversize_file_gets_policy_notice_without_rule_scan() {
    let dir = tempdir().unwrap();
    let big = dir.path().join("big.bin");
    let f = File::create(&big).unwrap();
    // Sparse 600 MiB: no detection tier may read it, so no real allocation.
    f.set_len(600 * 1024 * 1024).unwrap();
    drop(f);

    let catalog = Arc::new(Catalog::open_in_memory().unwrap());
    let scanner = scanner_with(catalog, Some(Box::new(MockRules::failing("must not run"))));
    let (sink, results) = collecting_sink();

    scanner.scan_file(&big, &sink);

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].severity, Severity::Notice);
    assert_eq!(results[0].detection_source, DetectionSource::Policy);
    assert!(results[0].description.contains("too large"));

    let (completed, total) = scanner.progress_counts();
    assert_eq!((completed, total), (1, 1));
    assert_eq!(scanner.progress_percent(), 100);
}

// ─── Test 3: Whitelist wins ─────────────────────────────────────────────────

#[test]
fn whitelisted_hash_short_circuits_rules_and_signatures() {
    let dir = tempdir().unwrap();
    let file = write_file(dir.path(), "tool.bin", b"content with EVIL marker");
    let digests = digest::compute_all(&file).unwrap();

    let catalog = Arc::new(Catalog::open_in_memory().unwrap());
    catalog
        .insert_whitelist(
            digests.sha256.as_deref().unwrap(),
            DigestAlgorithm::Sha256,
            "trusted tool",
        )
        .unwrap();
    // Also present in the signature table: the whitelist must win.
    catalog
        .insert_signature(
            DigestAlgorithm::Sha256,
            digests.sha256.as_deref().unwrap(),
            "FalsePositive",
        )
        .unwrap();

    let rules = MockRules::new().with_pattern(b"EVIL".to_vec(), "EICAR_TEST");
    let scanner = scanner_with(catalog, Some(Box::new(rules)));
    let (sink, results) = collecting_sink();

    scanner.scan_file(&file, &sink);

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert!(!results[0].is_malware);
    assert_eq!(results[0].detection_source, DetectionSource::Whitelist);
    assert_eq!(results[0].severity, Severity::Notice);
}

// ─── Test 4: Rule hit via partial scan ──────────────────────────────────────

#[test]
fn medium_file_is_sampled_and_rule_matches_in_prefix() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("medium.bin");
    let mut f = File::create(&path).unwrap();
    f.write_all(b"EVIL payload near the start").unwrap();
    // Sparse tail pushes the size into the sampled range (10 MiB, 500 MiB].
    f.set_len(20 * 1024 * 1024).unwrap();
    drop(f);

    let catalog = Arc::new(Catalog::open_in_memory().unwrap());
    let rules = MockRules::new().with_pattern(b"EVIL".to_vec(), "EICAR_TEST");
    let scanner = scanner_with(catalog, Some(Box::new(rules)));
    let (sink, results) = collecting_sink();

    scanner.scan_file(&path, &sink);

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    let r = &results[0];
    assert!(r.is_malware);
    assert_eq!(r.detection_source, DetectionSource::Rules);
    assert_eq!(r.matched_rules, vec!["EICAR_TEST".to_string()]);
    assert_eq!(r.matched_rules_count, 1);
    // Digests computed before the rule tier ride along on the result.
    assert!(r.sha256.is_some());
}

#[test]
fn clean_file_produces_no_results() {
    let dir = tempdir().unwrap();
    let file = write_file(dir.path(), "clean.txt", b"nothing suspicious here");

    let catalog = Arc::new(Catalog::open_in_memory().unwrap());
    let rules = MockRules::new().with_pattern(b"EVIL".to_vec(), "EICAR_TEST");
    let scanner = scanner_with(catalog, Some(Box::new(rules)));
    let (sink, results) = collecting_sink();

    scanner.scan_file(&file, &sink);
    assert!(results.lock().unwrap().is_empty());

    let (completed, total) = scanner.progress_counts();
    assert_eq!((completed, total), (1, 1));
}

// ─── Test 5: Full-scan override ─────────────────────────────────────────────

#[test]
fn full_scan_bypasses_whitelist_and_exclusions() {
    let dir = tempdir().unwrap();
    let excluded_dir = dir.path().join("node_modules");
    fs::create_dir_all(&excluded_dir).unwrap();
    let file = write_file(&excluded_dir, "dep.js", b"EVIL in a dependency");
    let digests = digest::compute_all(&file).unwrap();

    let catalog = Arc::new(Catalog::open_in_memory().unwrap());
    catalog
        .insert_whitelist(
            digests.sha256.as_deref().unwrap(),
            DigestAlgorithm::Sha256,
            "wrongly whitelisted",
        )
        .unwrap();

    let rules = MockRules::new().with_pattern(b"EVIL".to_vec(), "EICAR_TEST");
    let scanner = scanner_with(catalog, Some(Box::new(rules)));

    // Normal pass: the exclusion list swallows the file silently.
    let (sink, results) = collecting_sink();
    scanner.scan_file(&file, &sink);
    assert!(results.lock().unwrap().is_empty());

    // Forensic pass: exclusion and whitelist are both bypassed.
    scanner.policy().set_full_scan(true);
    let (sink, results) = collecting_sink();
    scanner.scan_file(&file, &sink);

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].is_malware);
    assert_eq!(results[0].detection_source, DetectionSource::Rules);
}

// ─── Test 6: Matcher failure ────────────────────────────────────────────────

#[test]
fn matcher_failure_emits_error_result_and_continues() {
    let dir = tempdir().unwrap();
    let file = write_file(dir.path(), "sample.bin", b"some content");

    let catalog = Arc::new(Catalog::open_in_memory().unwrap());
    let scanner = scanner_with(catalog, Some(Box::new(MockRules::failing("engine offline"))));
    let (sink, results) = collecting_sink();

    scanner.scan_file(&file, &sink);

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert!(!results[0].is_malware);
    assert_eq!(results[0].severity, Severity::Error);
    assert_eq!(results[0].detection_source, DetectionSource::Error);
    assert!(results[0].description.contains("Rule scan failed"));
}

// ─── Test 7: Concurrent scans ───────────────────────────────────────────────

#[test]
fn concurrent_scans_attribute_results_to_the_right_files() {
    let dir = tempdir().unwrap();
    let catalog = Arc::new(Catalog::open_in_memory().unwrap());

    let mut paths = Vec::new();
    for i in 0..8 {
        let path = write_file(dir.path(), &format!("f{i}.bin"), format!("file #{i}").as_bytes());
        let sha256 = digest::compute(&path, DigestAlgorithm::Sha256).unwrap();
        catalog
            .insert_signature(DigestAlgorithm::Sha256, &sha256, &format!("Mal{i}"))
            .unwrap();
        paths.push(path);
    }

    let scanner = Arc::new(scanner_with(catalog, None));
    let (sink, results) = collecting_sink();

    let handles: Vec<_> = paths
        .iter()
        .cloned()
        .map(|path| {
            let scanner = scanner.clone();
            let sink = sink.clone();
            std::thread::spawn(move || scanner.scan_file(&path, &sink))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 8);
    for r in results.iter() {
        // Each result's malware name must match its own file's index.
        let idx = r
            .file_name
            .trim_start_matches('f')
            .trim_end_matches(".bin")
            .to_string();
        assert_eq!(r.malware_name.as_deref(), Some(format!("Mal{idx}").as_str()));
    }
}

// ─── Test 8: Folder scan progress ───────────────────────────────────────────

#[test]
fn folder_scan_counts_every_regular_file() {
    let dir = tempdir().unwrap();
    let sub = dir.path().join("nested");
    fs::create_dir_all(&sub).unwrap();
    write_file(dir.path(), "a.txt", b"alpha");
    write_file(dir.path(), "b.txt", b"beta");
    write_file(&sub, "c.txt", b"gamma");

    let catalog = Arc::new(Catalog::open_in_memory().unwrap());
    let scanner = scanner_with(catalog, None);
    let (sink, results) = collecting_sink();

    scanner.scan_folder(dir.path(), &sink);

    // Clean files are silent, but progress still accounts for all of them.
    assert!(results.lock().unwrap().is_empty());
    let (completed, total) = scanner.progress_counts();
    assert_eq!(completed, 3);
    assert_eq!(total, 3);
    assert_eq!(scanner.progress_percent(), 100);
}
