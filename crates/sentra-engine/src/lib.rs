//! Sentra scanning engine.
//!
//! Two subsystems built on `sentra-core`:
//!
//! - the **scanner**: a per-file detection cascade (exclusions → size/trust
//!   skip → whitelist → signature hashes → pattern rules) plus recursive
//!   folder scans with CPU throttling, and a realtime monitor that watches
//!   directory roots and feeds changed files through the same cascade;
//! - the **quarantine manager**: moves detected files into a size-bounded
//!   repository under a reversible XOR obfuscation, tracks them in the
//!   catalog, evicts oldest entries under pressure, and restores on demand.
//!
//! The engine is deliberately thread-based: watcher threads produce into a
//! debounced queue, a worker consumes it, and callers may scan concurrently.
//! All shared state is behind explicit locks; there is no async runtime.

pub mod engine;
pub mod error;
pub mod monitor;
pub mod policy;
pub mod quarantine;
pub mod rules;
pub mod scanner;
pub mod sink;
pub mod trust;
pub mod watch_spec;

pub use engine::Engine;
pub use error::EngineError;
pub use monitor::{Monitor, MonitorState, PathWatcher};
pub use policy::{ScanPolicy, ThrottleConfig};
pub use quarantine::{QuarantineConfig, QuarantineManager, QuarantineOutcome};
pub use rules::{MockRules, RuleMatcher};
pub use scanner::Scanner;
pub use sink::ResultSink;

pub use sentra_core::{DetectionSource, ScanResult, Severity};

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
