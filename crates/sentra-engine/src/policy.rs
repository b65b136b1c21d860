//! Skip policy and CPU throttling for the detection cascade.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Files larger than this are skipped entirely (policy NOTICE).
pub const MAX_SIZE_SKIP: u64 = 500 * 1024 * 1024;
/// Files up to this size get a full-file rule scan.
pub const PARTIAL_MIN: u64 = 10 * 1024 * 1024;
/// Upper bound for the sampled (prefix+suffix) rule scan.
pub const PARTIAL_MAX: u64 = 500 * 1024 * 1024;
/// Bytes sampled from the start of a medium-sized file.
pub const PREFIX_SIZE: u64 = 4 * 1024 * 1024;
/// Bytes sampled from the end of a medium-sized file.
pub const SUFFIX_SIZE: u64 = 1024 * 1024;

/// Work below this duration does not trigger a throttle sleep.
const MIN_WORK_TO_THROTTLE: Duration = Duration::from_millis(2);

/// Path fragments that are never scanned. Matched case-insensitively as
/// substrings of the full path: the engine's own data, device namespaces,
/// system directories, package caches and the engine's artifacts.
const DEFAULT_EXCLUSIONS: &[&str] = &[
    "/var/lib/sentra",
    "c:\\programdata\\sentra",
    "\\device\\",
    "\\windows\\system32",
    "\\windows\\winsxs",
    "\\$recycle.bin",
    "system volume information",
    "\\appdata\\local\\temp",
    "node_modules",
    ".git",
    "rules.compiled",
    "signatures.db",
];

/// Inter-file throttle settings.
///
/// After scanning a file that took work time `W`, the folder walk sleeps
/// `min(W * (1 - duty) / duty, max_sleep)` before the next file, targeting
/// the configured duty cycle.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Fraction of wall time spent working, in `(0, 1)`. Out-of-range
    /// values disable throttling.
    pub duty_cycle: f64,
    pub max_sleep: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            duty_cycle: 0.5,
            max_sleep: Duration::from_millis(500),
        }
    }
}

impl ThrottleConfig {
    /// Sleep duration owed for work that started at `work_start`.
    pub fn sleep_for(&self, work_start: Instant) -> Option<Duration> {
        let work = work_start.elapsed();
        if work < MIN_WORK_TO_THROTTLE {
            return None;
        }
        if self.duty_cycle <= 0.0 || self.duty_cycle >= 1.0 {
            return None;
        }
        let sleep = work.mul_f64((1.0 - self.duty_cycle) / self.duty_cycle);
        let sleep = sleep.min(self.max_sleep);
        (!sleep.is_zero()).then_some(sleep)
    }
}

/// Size thresholds, exclusion list and the full-scan override.
#[derive(Debug)]
pub struct ScanPolicy {
    exclusions: Vec<String>,
    full_scan: AtomicBool,
    throttle: parking_lot::Mutex<ThrottleConfig>,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            exclusions: DEFAULT_EXCLUSIONS.iter().map(|s| s.to_string()).collect(),
            full_scan: AtomicBool::new(false),
            throttle: parking_lot::Mutex::new(ThrottleConfig::default()),
        }
    }
}

impl ScanPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the exclusion list. Entries are matched case-insensitively.
    pub fn with_exclusions(mut self, exclusions: Vec<String>) -> Self {
        self.exclusions = exclusions;
        self
    }

    /// Whether `path` matches the exclusion list.
    pub fn is_excluded(&self, path: &Path) -> bool {
        let lowered = path.display().to_string().to_lowercase();
        self.exclusions
            .iter()
            .any(|kw| !kw.is_empty() && lowered.contains(&kw.to_lowercase()))
    }

    /// Operator-set forensic override: bypasses exclusions, the size skip,
    /// the trust skip and the whitelist short-circuit.
    pub fn set_full_scan(&self, enabled: bool) {
        self.full_scan.store(enabled, Ordering::Relaxed);
    }

    pub fn is_full_scan(&self) -> bool {
        self.full_scan.load(Ordering::Relaxed)
    }

    /// Duty in `(0, 1)`; anything else disables throttling.
    pub fn set_throttle_duty(&self, duty: f64) {
        let mut throttle = self.throttle.lock();
        throttle.duty_cycle = if duty > 0.0 && duty < 1.0 { duty } else { 0.0 };
    }

    pub fn set_throttle_max_sleep(&self, max_sleep: Duration) {
        self.throttle.lock().max_sleep = max_sleep;
    }

    pub fn throttle(&self) -> ThrottleConfig {
        self.throttle.lock().clone()
    }
}
