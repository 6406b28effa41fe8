//! Progress-callback trait for per-document run events.
//!
//! Inject an [`Arc<dyn RunProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the runner works through the discovered files. The CLI uses it
//! to drive a terminal progress bar; a service could forward the events to a
//! channel or a log sink instead.
//!
//! # Example
//!
//! ```rust
//! use edgequake_invoice::{PipelineConfig, RunProgressCallback};
//! use std::path::Path;
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     done: AtomicUsize,
//! }
//!
//! impl RunProgressCallback for CountingCallback {
//!     fn on_document_complete(&self, index: usize, total: usize, path: &Path, _found: usize) {
//!         self.done.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{}/{} {}", index, total, path.display());
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { done: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::output::RunSummary;
use std::path::Path;
use std::sync::Arc;

/// Called by the runner as it processes each document.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. `index` is 1-based.
pub trait RunProgressCallback: Send + Sync {
    /// Called once after discovery, before the first document.
    fn on_run_start(&self, total_documents: usize) {
        let _ = total_documents;
    }

    /// Called before a document is fingerprinted and rendered.
    fn on_document_start(&self, index: usize, total: usize, path: &Path) {
        let _ = (index, total, path);
    }

    /// Called when a document's fingerprint was already processed.
    fn on_document_skipped(&self, index: usize, total: usize, path: &Path) {
        let _ = (index, total, path);
    }

    /// Called when a document was extracted and recorded.
    ///
    /// `fields_found` counts the schema fields that were not absent.
    fn on_document_complete(&self, index: usize, total: usize, path: &Path, fields_found: usize) {
        let _ = (index, total, path, fields_found);
    }

    /// Called when a document failed.
    fn on_document_error(&self, index: usize, total: usize, path: &Path, error: &str) {
        let _ = (index, total, path, error);
    }

    /// Called once after exports were written (or the run aborted).
    fn on_run_complete(&self, summary: &RunSummary) {
        let _ = summary;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl RunProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn RunProgressCallback>;
