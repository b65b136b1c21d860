//! Per-file detection cascade and folder scanning.
//!
//! The cascade for a single file: exclusion list → stat → oversize skip →
//! trusted-publisher skip → (serialized) digests → whitelist short-circuit →
//! signature catalog in sha256 → sha1 → md5 order → pattern rules, full-file
//! for small files and prefix+suffix sampled for medium ones. A hash hit
//! suppresses the rule matcher for that file.
//!
//! Folder scans pre-count regular files for progress reporting, tolerate
//! permission errors, and sleep between files to hold the configured duty
//! cycle.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use walkdir::WalkDir;

use sentra_core::digest::{self, DigestAlgorithm, DigestSet};
use sentra_core::{Catalog, ScanResult};

use crate::policy::{self, ScanPolicy};
use crate::rules::{MatchContext, RuleMatcher};
use crate::sink::{self, ResultSink};
use crate::trust::TrustOracle;

/// The scanner core. Owns the rule-set and catalog handles for its lifetime;
/// a single internal lock serializes detection work (digests, catalog
/// lookups, rule matching) across threads.
pub struct Scanner {
    catalog: Arc<Catalog>,
    rules: Option<Box<dyn RuleMatcher>>,
    policy: Arc<ScanPolicy>,
    trust: TrustOracle,
    scan_lock: parking_lot::Mutex<()>,
    total_count: AtomicU64,
    completed_count: AtomicU64,
}

impl Scanner {
    pub fn new(
        catalog: Arc<Catalog>,
        rules: Option<Box<dyn RuleMatcher>>,
        policy: Arc<ScanPolicy>,
        trust: TrustOracle,
    ) -> Self {
        Self {
            catalog,
            rules,
            policy,
            trust,
            scan_lock: parking_lot::Mutex::new(()),
            total_count: AtomicU64::new(0),
            completed_count: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &ScanPolicy {
        &self.policy
    }

    // ── progress ────────────────────────────────────────────────────────

    /// Percentage for progress polling. With an unknown total the value is a
    /// heuristic capped at 99 so consumers never see a premature 100.
    pub fn progress_percent(&self) -> u8 {
        let total = self.total_count.load(Ordering::Relaxed);
        let completed = self.completed_count.load(Ordering::Relaxed);
        if total == 0 {
            if completed == 0 {
                return 0;
            }
            return completed.min(99) as u8;
        }
        ((completed * 100) / total).min(100) as u8
    }

    pub fn progress_counts(&self) -> (u64, u64) {
        (
            self.completed_count.load(Ordering::Relaxed),
            self.total_count.load(Ordering::Relaxed),
        )
    }

    pub fn reset_progress(&self) {
        self.total_count.store(0, Ordering::Relaxed);
        self.completed_count.store(0, Ordering::Relaxed);
    }

    fn mark_completed(&self) {
        self.completed_count.fetch_add(1, Ordering::Relaxed);
    }

    // ── single-file scan ────────────────────────────────────────────────

    /// Scan one file on demand. Progress counters are set up for a
    /// single-file run so pollers see 0→100.
    pub fn scan_file(&self, path: &Path, sink: &ResultSink) {
        self.total_count.store(1, Ordering::Relaxed);
        self.completed_count.store(0, Ordering::Relaxed);
        self.scan_file_inner(path, sink);
    }

    /// The cascade proper. Used directly by folder scans and the realtime
    /// worker, which manage progress counters themselves.
    pub(crate) fn scan_file_inner(&self, path: &Path, sink: &ResultSink) {
        let full_scan = self.policy.is_full_scan();

        if !full_scan && self.policy.is_excluded(path) {
            self.mark_completed();
            return;
        }

        let metadata = match std::fs::metadata(path) {
            Ok(m) if m.is_file() => m,
            // Missing, unreadable or not a regular file: nothing to report.
            _ => return,
        };
        let size = metadata.len();

        if !full_scan && size > policy::MAX_SIZE_SKIP {
            sink::deliver(
                sink,
                ScanResult::skip(
                    path,
                    sentra_core::DetectionSource::Policy,
                    "Skipped: file too large (>500MB)",
                ),
            );
            self.mark_completed();
            return;
        }

        if !full_scan && self.trust.is_trusted(path) {
            sink::deliver(
                sink,
                ScanResult::skip(
                    path,
                    sentra_core::DetectionSource::Policy,
                    "Skipped: trusted publisher signature",
                ),
            );
            self.mark_completed();
            return;
        }

        // Digests, catalog lookups and rule matching run serialized.
        let _guard = self.scan_lock.lock();

        let digests = match digest::compute_all(path) {
            Ok(set) => set,
            Err(e) => {
                // Transient read failure: the hash tiers are unavailable but
                // the rule matcher can still open the file itself.
                debug!(path = %path.display(), error = %e, "digest computation failed");
                DigestSet::default()
            }
        };

        if !full_scan && self.is_whitelisted(&digests) {
            sink::deliver(
                sink,
                ScanResult::skip(
                    path,
                    sentra_core::DetectionSource::Whitelist,
                    "Skipped: hash whitelisted",
                ),
            );
            self.mark_completed();
            return;
        }

        // Strongest digest first; the first hit wins and suppresses rules.
        for alg in [
            DigestAlgorithm::Sha256,
            DigestAlgorithm::Sha1,
            DigestAlgorithm::Md5,
        ] {
            let Some(hash) = digests.get(alg) else {
                continue;
            };
            match self.catalog.lookup_signature(alg, hash) {
                Ok(Some(malware_name)) => {
                    sink::deliver(
                        sink,
                        ScanResult::hash_hit(path, alg, hash, malware_name, &digests),
                    );
                    self.mark_completed();
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "signature lookup failed");
                }
            }
        }

        self.run_rule_matcher(path, size, &digests, sink);
        self.mark_completed();
    }

    fn is_whitelisted(&self, digests: &DigestSet) -> bool {
        for alg in [
            DigestAlgorithm::Sha256,
            DigestAlgorithm::Sha1,
            DigestAlgorithm::Md5,
        ] {
            if let Some(hash) = digests.get(alg) {
                if self.catalog.is_whitelisted(hash, alg).unwrap_or(false) {
                    return true;
                }
            }
        }
        false
    }

    fn run_rule_matcher(&self, path: &Path, size: u64, digests: &DigestSet, sink: &ResultSink) {
        let Some(rules) = self.rules.as_deref() else {
            return;
        };

        let mut ctx = MatchContext::new();
        let outcome = if size <= policy::PARTIAL_MIN {
            rules.scan_file(path, &mut ctx)
        } else if size <= policy::PARTIAL_MAX {
            match read_prefix_suffix(path, size) {
                Ok(sample) => rules.scan_mem(&sample, &mut ctx),
                Err(e) => {
                    sink::deliver(
                        sink,
                        ScanResult::scan_error(
                            path,
                            format!("Failed to read file segments for partial scan: {e}"),
                        ),
                    );
                    return;
                }
            }
        } else {
            // Oversize files only get here under the full-scan override;
            // the hash tiers have already run and sampling them is not
            // meaningful.
            return;
        };

        match outcome {
            Ok(()) if ctx.is_empty() => {}
            Ok(()) => {
                sink::deliver(sink, ScanResult::rule_hit(path, ctx.into_matches(), digests));
            }
            Err(e) => {
                sink::deliver(
                    sink,
                    ScanResult::scan_error(path, format!("Rule scan failed: {e}")),
                );
            }
        }
    }

    // ── folder scan ─────────────────────────────────────────────────────

    /// Recursively scan every regular file under `root`, applying the
    /// inter-file throttle between files.
    pub fn scan_folder(&self, root: &Path, sink: &ResultSink) {
        if !root.exists() {
            return;
        }

        // Best-effort pre-count for the progress total; entry errors
        // (permissions, races) are tolerated without aborting.
        let total = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count() as u64;

        self.total_count.store(total, Ordering::Relaxed);
        self.completed_count.store(0, Ordering::Relaxed);
        debug!(root = %root.display(), total, "folder scan starting");

        let throttle = self.policy.throttle();
        for entry in WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let work_start = Instant::now();
            self.scan_file_inner(entry.path(), sink);
            if let Some(sleep) = throttle.sleep_for(work_start) {
                std::thread::sleep(sleep);
            }
        }
    }
}

/// Read the first `PREFIX_SIZE` and last `SUFFIX_SIZE` bytes of a file into
/// one contiguous buffer for the sampled rule scan.
fn read_prefix_suffix(path: &Path, size: u64) -> std::io::Result<Vec<u8>> {
    let prefix_len = policy::PREFIX_SIZE.min(size) as usize;
    let suffix_len = policy::SUFFIX_SIZE.min(size - prefix_len as u64) as usize;

    let mut file = File::open(path)?;
    let mut buf = vec![0u8; prefix_len + suffix_len];

    file.read_exact(&mut buf[..prefix_len])?;
    if suffix_len > 0 {
        file.seek(SeekFrom::Start(size - suffix_len as u64))?;
        file.read_exact(&mut buf[prefix_len..])?;
    }
    Ok(buf)
}
