//! The per-file result model emitted through result sinks.
//!
//! Every detection, policy skip, and scan error is reported as one
//! [`ScanResult`]. Consumers receive results from background threads, so the
//! type is a plain serializable value with no handles attached.

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::digest::{DigestAlgorithm, DigestSet};

/// Severity attached to a scan result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Notice,
    Warning,
    High,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Notice => "NOTICE",
            Self::Warning => "WARNING",
            Self::High => "HIGH",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which tier of the detection cascade produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DetectionSource {
    /// Cryptographic hash matched the signature catalog.
    Hash,
    /// One or more pattern rules matched.
    Rules,
    /// Hash present in the whitelist; detection short-circuited.
    Whitelist,
    /// Skip policy (size, trusted publisher, exclusion).
    Policy,
    /// Scan-time failure on this file.
    Error,
    /// Informational engine status (init progress, shutdown).
    Notice,
}

impl DetectionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hash => "HASH",
            Self::Rules => "RULES",
            Self::Whitelist => "WHITELIST",
            Self::Policy => "POLICY",
            Self::Error => "ERROR",
            Self::Notice => "NOTICE",
        }
    }
}

impl fmt::Display for DetectionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single per-file scan result.
///
/// Invariants: `is_malware` implies `detection_source` is `Hash` or `Rules`
/// and at least one of `matched_hash` / `matched_rules` is populated;
/// `Whitelist` results are never malware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub is_malware: bool,
    /// Local wall-clock time the result was produced, `YYYY-MM-DD HH:MM:SS`.
    pub timestamp: String,
    /// Identifier of the machine the engine runs on.
    pub host_name: String,
    pub severity: Severity,
    pub file_name: String,
    pub file_path: String,
    /// Human-readable reason for the result.
    pub description: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,

    /// The hex digest that hit the signature catalog, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_hash: Option<String>,
    /// Uppercase algorithm token for `matched_hash` (`SHA256`, `SHA1`, `MD5`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_hash_type: Option<String>,

    pub detection_source: DetectionSource,

    /// Catalog-side label for a hash hit, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub malware_name: Option<String>,

    pub matched_rules_count: usize,
    pub matched_rules: Vec<String>,
}

impl ScanResult {
    /// A result skeleton for `path` with no detection fields populated.
    pub fn for_path(path: &Path, severity: Severity, source: DetectionSource) -> Self {
        Self {
            is_malware: false,
            timestamp: local_timestamp(),
            host_name: host_name(),
            severity,
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            file_path: path.display().to_string(),
            description: String::new(),
            md5: None,
            sha1: None,
            sha256: None,
            matched_hash: None,
            matched_hash_type: None,
            detection_source: source,
            malware_name: None,
            matched_rules_count: 0,
            matched_rules: Vec::new(),
        }
    }

    /// An engine status event not tied to a particular file.
    pub fn status(severity: Severity, description: impl Into<String>) -> Self {
        let mut r = Self::for_path(Path::new(""), severity, DetectionSource::Notice);
        r.description = description.into();
        r
    }

    /// A NOTICE result for a policy or whitelist skip.
    pub fn skip(path: &Path, source: DetectionSource, description: impl Into<String>) -> Self {
        let mut r = Self::for_path(path, Severity::Notice, source);
        r.description = description.into();
        r
    }

    /// A per-file scan error.
    pub fn scan_error(path: &Path, description: impl Into<String>) -> Self {
        let mut r = Self::for_path(path, Severity::Error, DetectionSource::Error);
        r.description = description.into();
        r
    }

    /// A malware detection from a signature-catalog hash hit.
    pub fn hash_hit(
        path: &Path,
        algorithm: DigestAlgorithm,
        hash: impl Into<String>,
        malware_name: impl Into<String>,
        digests: &DigestSet,
    ) -> Self {
        let hash = hash.into();
        let mut r = Self::for_path(path, Severity::High, DetectionSource::Hash);
        r.is_malware = true;
        r.description = format!("Matched {} in signature catalog", algorithm.upper());
        r.matched_hash = Some(hash);
        r.matched_hash_type = Some(algorithm.upper().to_string());
        r.malware_name = Some(malware_name.into());
        r.attach_digests(digests);
        r
    }

    /// A malware detection aggregated from pattern-rule matches.
    pub fn rule_hit(path: &Path, matched_rules: Vec<String>, digests: &DigestSet) -> Self {
        let count = matched_rules.len();
        let mut r = Self::for_path(path, Severity::Warning, DetectionSource::Rules);
        r.is_malware = true;
        r.description = format!(
            "Matched by {} rule{}: {}",
            count,
            if count == 1 { "" } else { "s" },
            matched_rules.join(", ")
        );
        r.matched_rules_count = count;
        r.matched_rules = matched_rules;
        r.attach_digests(digests);
        r
    }

    /// Copy any computed digests onto the result.
    pub fn attach_digests(&mut self, digests: &DigestSet) {
        self.md5 = digests.md5.clone();
        self.sha1 = digests.sha1.clone();
        self.sha256 = digests.sha256.clone();
    }
}

/// Local wall-clock timestamp in the engine's canonical format.
pub fn local_timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Best-effort machine identifier.
pub fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_renders_uppercase() {
        assert_eq!(Severity::Notice.to_string(), "NOTICE");
        assert_eq!(Severity::High.to_string(), "HIGH");
    }

    #[test]
    fn hash_hit_carries_invariant_fields() {
        let digests = DigestSet {
            md5: Some("aa".into()),
            sha1: None,
            sha256: Some("bb".into()),
        };
        let r = ScanResult::hash_hit(
            Path::new("/tmp/evil.bin"),
            DigestAlgorithm::Sha256,
            "bb",
            "Trojan.Test",
            &digests,
        );
        assert!(r.is_malware);
        assert_eq!(r.detection_source, DetectionSource::Hash);
        assert_eq!(r.matched_hash_type.as_deref(), Some("SHA256"));
        assert_eq!(r.matched_hash.as_deref(), Some("bb"));
        assert_eq!(r.malware_name.as_deref(), Some("Trojan.Test"));
        assert_eq!(r.md5.as_deref(), Some("aa"));
        assert_eq!(r.file_name, "evil.bin");
    }

    #[test]
    fn rule_hit_description_lists_identifiers() {
        let r = ScanResult::rule_hit(
            Path::new("/tmp/sample"),
            vec!["EICAR_TEST".into(), "SUSP_PACKER".into()],
            &DigestSet::default(),
        );
        assert!(r.is_malware);
        assert_eq!(r.matched_rules_count, 2);
        assert_eq!(r.description, "Matched by 2 rules: EICAR_TEST, SUSP_PACKER");

        let single = ScanResult::rule_hit(
            Path::new("/tmp/sample"),
            vec!["EICAR_TEST".into()],
            &DigestSet::default(),
        );
        assert_eq!(single.description, "Matched by 1 rule: EICAR_TEST");
    }

    #[test]
    fn whitelist_skip_is_never_malware() {
        let r = ScanResult::skip(
            Path::new("/bin/ls"),
            DetectionSource::Whitelist,
            "Skipped: hash whitelisted",
        );
        assert!(!r.is_malware);
        assert_eq!(r.severity, Severity::Notice);
    }
}
