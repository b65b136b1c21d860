//! Result sink contract.
//!
//! Callers supply a single callable that receives every [`ScanResult`].
//! Invocations can come from watcher worker threads as well as the caller's
//! own threads, so the sink must be `Send + Sync`. A failing sink never takes
//! the scanner down: panics are caught, logged and swallowed.

use sentra_core::ScanResult;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::error;

/// Caller-supplied result callback.
pub type ResultSink = Arc<dyn Fn(ScanResult) + Send + Sync>;

/// Build a sink from a closure.
pub fn sink_from<F>(f: F) -> ResultSink
where
    F: Fn(ScanResult) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Invoke `sink` with `result`, isolating the engine from callback panics.
pub fn deliver(sink: &ResultSink, result: ScanResult) {
    let outcome = catch_unwind(AssertUnwindSafe(|| sink(result)));
    if outcome.is_err() {
        error!("result sink panicked; continuing");
    }
}

/// Invoke `sink` only while `enabled` is set. Used by the realtime monitor,
/// which disables callbacks before tearing its threads down.
pub fn deliver_gated(sink: &ResultSink, enabled: &AtomicBool, result: ScanResult) {
    if !enabled.load(Ordering::Acquire) {
        return;
    }
    deliver(sink, result);
}
