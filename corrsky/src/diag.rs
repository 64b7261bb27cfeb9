//! Run-wide diagnostics context.
//!
//! Warnings are emitted through `tracing` and counted in a thread-safe
//! counter carried through the pipeline, so the total can be reported at
//! exit and tests can assert on it without ambient global state.

use std::fmt::Display;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Shared warning counter, injected by reference into every stage.
#[derive(Debug, Default)]
pub struct Diagnostics {
    warnings: AtomicUsize,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit a warning and bump the counter.
    pub fn warn(&self, message: impl Display) {
        tracing::warn!("{message}");
        self.warnings.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of warnings emitted so far.
    pub fn warnings(&self) -> usize {
        self.warnings.load(Ordering::Relaxed)
    }
}
