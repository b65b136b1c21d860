//! Pattern-rule matcher adapter.
//!
//! The rule engine itself is an external collaborator: the engine only
//! requires something that can scan a file or byte buffer and report matched
//! rule identifiers into a per-invocation [`MatchContext`]. The scanner
//! aggregates the context into at most one result per scan, so repeated
//! per-rule callbacks never cause repeated sink emissions.
//!
//! The default production backend wraps a pre-compiled YARA rule set behind
//! the `yara` feature. [`MockRules`] provides a byte-pattern matcher for
//! tests and environments without libyara.

use std::path::Path;

use crate::error::EngineError;
use crate::Result;

/// Collects rule identifiers matched during one scan invocation.
///
/// A fresh context is created per `scan_file` call; matchers must not retain
/// state across invocations.
#[derive(Debug, Default)]
pub struct MatchContext {
    matched: Vec<String>,
}

impl MatchContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one matched rule identifier. Called once per matching rule.
    pub fn record(&mut self, rule_id: impl Into<String>) {
        self.matched.push(rule_id.into());
    }

    pub fn is_empty(&self) -> bool {
        self.matched.is_empty()
    }

    /// Consume the context, yielding all matched identifiers in match order.
    pub fn into_matches(self) -> Vec<String> {
        self.matched
    }
}

/// The seam between the scanner and the opaque rule engine.
///
/// Implementations run in "fast mode" semantics: per rule, the first match
/// suffices; there is no requirement to enumerate every occurrence.
pub trait RuleMatcher: Send + Sync {
    /// Scan the file at `path`, recording matched rule ids into `ctx`.
    fn scan_file(&self, path: &Path, ctx: &mut MatchContext) -> Result<()>;

    /// Scan an in-memory buffer (used for prefix+suffix sampling).
    fn scan_mem(&self, buffer: &[u8], ctx: &mut MatchContext) -> Result<()>;
}

// ── YARA backend ────────────────────────────────────────────────────────

#[cfg(feature = "yara")]
pub use self::yara_backend::YaraRules;

#[cfg(feature = "yara")]
mod yara_backend {
    use super::*;
    use std::path::PathBuf;

    /// Seconds before an individual rule scan is abandoned.
    const SCAN_TIMEOUT_SECS: i32 = 60;

    /// A compiled YARA rule set loaded from disk.
    pub struct YaraRules {
        rules: yara::Rules,
        source: PathBuf,
    }

    impl YaraRules {
        /// Load a pre-compiled rule set (`.yarc`) from `path`.
        pub fn load(path: &Path) -> Result<Self> {
            let rules = yara::Rules::load_from_file(path).map_err(|e| EngineError::RulesLoad {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            Ok(Self {
                rules,
                source: path.to_path_buf(),
            })
        }

        pub fn source(&self) -> &Path {
            &self.source
        }
    }

    impl RuleMatcher for YaraRules {
        fn scan_file(&self, path: &Path, ctx: &mut MatchContext) -> Result<()> {
            let matches = self
                .rules
                .scan_file(path, SCAN_TIMEOUT_SECS)
                .map_err(|e| EngineError::RuleScan(e.to_string()))?;
            for rule in matches {
                ctx.record(rule.identifier);
            }
            Ok(())
        }

        fn scan_mem(&self, buffer: &[u8], ctx: &mut MatchContext) -> Result<()> {
            let matches = self
                .rules
                .scan_mem(buffer, SCAN_TIMEOUT_SECS)
                .map_err(|e| EngineError::RuleScan(e.to_string()))?;
            for rule in matches {
                ctx.record(rule.identifier);
            }
            Ok(())
        }
    }
}

// ── byte-pattern matcher for tests ──────────────────────────────────────

/// A matcher driven by literal byte patterns.
///
/// Each `(needle, rule_id)` pair reports `rule_id` when `needle` occurs in
/// the scanned content; a rule fires at most once per scan. Can also be
/// configured to fail, for exercising the scanner's error path.
#[derive(Debug, Default)]
pub struct MockRules {
    patterns: Vec<(Vec<u8>, String)>,
    fail_with: Option<String>,
}

impl MockRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `rule_id` whenever `needle` occurs in scanned content.
    pub fn with_pattern(mut self, needle: impl Into<Vec<u8>>, rule_id: impl Into<String>) -> Self {
        self.patterns.push((needle.into(), rule_id.into()));
        self
    }

    /// Make every scan fail with `reason`.
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            patterns: Vec::new(),
            fail_with: Some(reason.into()),
        }
    }

    fn scan_bytes(&self, data: &[u8], ctx: &mut MatchContext) -> Result<()> {
        if let Some(reason) = &self.fail_with {
            return Err(EngineError::RuleScan(reason.clone()));
        }
        for (needle, rule_id) in &self.patterns {
            if !needle.is_empty()
                && data.windows(needle.len()).any(|w| w == needle.as_slice())
            {
                ctx.record(rule_id.clone());
            }
        }
        Ok(())
    }
}

impl RuleMatcher for MockRules {
    fn scan_file(&self, path: &Path, ctx: &mut MatchContext) -> Result<()> {
        let data = std::fs::read(path)?;
        self.scan_bytes(&data, ctx)
    }

    fn scan_mem(&self, buffer: &[u8], ctx: &mut MatchContext) -> Result<()> {
        self.scan_bytes(buffer, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_reports_each_rule_once() {
        let rules = MockRules::new()
            .with_pattern(b"EVIL".to_vec(), "EICAR_TEST")
            .with_pattern(b"PACK".to_vec(), "SUSP_PACKER");

        let mut ctx = MatchContext::new();
        rules
            .scan_mem(b"xx EVIL yy EVIL zz PACK", &mut ctx)
            .unwrap();
        assert_eq!(ctx.into_matches(), vec!["EICAR_TEST", "SUSP_PACKER"]);
    }

    #[test]
    fn mock_reports_nothing_on_clean_buffer() {
        let rules = MockRules::new().with_pattern(b"EVIL".to_vec(), "EICAR_TEST");
        let mut ctx = MatchContext::new();
        rules.scan_mem(b"clean content", &mut ctx).unwrap();
        assert!(ctx.is_empty());
    }

    #[test]
    fn failing_mock_surfaces_rule_scan_error() {
        let rules = MockRules::failing("engine offline");
        let mut ctx = MatchContext::new();
        let err = rules.scan_mem(b"anything", &mut ctx).unwrap_err();
        assert!(matches!(err, EngineError::RuleScan(_)));
    }

    #[test]
    fn contexts_do_not_leak_between_invocations() {
        let rules = MockRules::new().with_pattern(b"EVIL".to_vec(), "EICAR_TEST");

        let mut first = MatchContext::new();
        rules.scan_mem(b"EVIL", &mut first).unwrap();
        assert_eq!(first.into_matches().len(), 1);

        let mut second = MatchContext::new();
        rules.scan_mem(b"clean", &mut second).unwrap();
        assert!(second.is_empty());
    }
}
