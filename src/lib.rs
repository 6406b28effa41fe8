//! # edgequake-invoice
//!
//! Extract structured fields from utility invoices with Vision Language
//! Models, keep an audit trail in SQLite, and export review-ready CSVs.
//!
//! ## Why this crate?
//!
//! Utility bills arrive as e-bill PDFs and phone scans with wildly different
//! layouts. Template-based parsers break on every new vendor. This crate
//! rasterises each page and lets a VLM read it as a clerk would, then
//! normalises the answer into typed fields (dates, amounts, quantities)
//! and records every attempt so nothing is processed twice or lost.
//!
//! ## Pipeline Overview
//!
//! ```text
//! input dirs
//!  │
//!  ├─ 1. Discover  list files, SHA-256 fingerprint, lexicographic order
//!  ├─ 2. Record    one store row per fingerprint; skip if already processed
//!  ├─ 3. Render    pdfium pages / decoded scans (CPU-bound, spawn_blocking)
//!  ├─ 4. Extract   one VLM call per document, bounded retry
//!  ├─ 5. Persist   extraction record + status, one transaction
//!  └─ 6. Export    pretty / staging / audit CSVs
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_invoice::{run, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = PipelineConfig::builder()
//!         .input_dirs(["data/bills"])
//!         .output_dir("outputs")
//!         .build()?;
//!     let summary = run(&config).await?;
//!     eprintln!(
//!         "{} processed, {} skipped, {} failed",
//!         summary.processed, summary.skipped, summary.failed
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `invoice-extract` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-invoice = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod export;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod runner;
pub mod schema;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use error::{DocumentError, ExtractError, InvoiceError};
pub use export::{export_all, ExportOptions};
pub use model::{
    AuditRow, DocumentStatus, ExtractionRecord, ExtractionResponse, PageImage, SourceDocument,
    StagingRow,
};
pub use output::{ExportPaths, FailedDocument, RunAbort, RunSummary};
pub use pipeline::extract::{FieldExtractor, RetryPolicy, VisionExtractor};
pub use pipeline::render::{DocumentRenderer, PageRenderer, RenderOptions};
pub use progress::{NoopProgressCallback, ProgressCallback, RunProgressCallback};
pub use runner::{export_only, run, run_sync, run_with_store, Runner};
pub use schema::{ExtractedFields, FieldKind, FieldSchema, FieldSpec, FieldValue};
pub use store::Store;
