//! Shared foundation for the Sentra anti-malware engine.
//!
//! This crate holds the pieces both the scanner and the quarantine manager
//! depend on: the `ScanResult` model emitted through result sinks, the
//! streaming digest service, and the SQLite-backed signature catalog
//! (malware hash tables, whitelist, quarantine records, key-value config).

pub mod catalog;
pub mod digest;
pub mod error;
pub mod result;

pub use catalog::{Catalog, QuarantineRecord};
pub use digest::{DigestAlgorithm, DigestSet};
pub use error::CoreError;
pub use result::{DetectionSource, ScanResult, Severity};

/// Result type for catalog and digest operations.
pub type Result<T> = std::result::Result<T, CoreError>;
