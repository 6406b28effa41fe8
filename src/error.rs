//! Error types for the edgequake-invoice library.
//!
//! Three error types reflect three failure scopes:
//!
//! * [`InvoiceError`]: **Fatal**: the run cannot proceed (invalid config,
//!   store unusable, provider not configured). Returned as `Err` from
//!   [`crate::runner::run`].
//!
//! * [`DocumentError`]: **Per document**: one file could not be rendered or
//!   extracted. Recorded with `mark_failed` and listed in the run summary;
//!   the runner moves on to the next file. The one exception is
//!   [`DocumentError::QuotaExceeded`], which halts further submissions.
//!
//! * [`ExtractError`]: the contract of the external field extractor.
//!   Converted into a [`DocumentError`] at the runner's per-file boundary.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-invoice library.
#[derive(Debug, Error)]
pub enum InvoiceError {
    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configuration file could not be read.
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for [`crate::config::PipelineConfig`].
    #[error("Failed to parse config file '{path}': {detail}")]
    ConfigParse { path: PathBuf, detail: String },

    // ── Input errors ──────────────────────────────────────────────────────
    /// An input directory does not exist or is not a directory.
    #[error("Input directory not found: '{path}'")]
    InputDirNotFound { path: PathBuf },

    // ── Store errors ──────────────────────────────────────────────────────
    /// The SQLite store could not be opened or migrated.
    #[error("Failed to open store '{path}': {detail}")]
    StoreOpenFailed { path: PathBuf, detail: String },

    /// A read or write against the store failed; the persistence layer is unusable.
    #[error("Store write failure: {0}")]
    StoreWriteFailure(String),

    // ── LLM errors ────────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an export file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for InvoiceError {
    fn from(e: sqlx::Error) -> Self {
        InvoiceError::StoreWriteFailure(e.to_string())
    }
}

/// A failure scoped to a single input document.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum DocumentError {
    /// The file could not be read from disk.
    #[error("UnreadableDocument: {detail}")]
    Io { detail: String },

    /// The bytes are not a document of an expected format, or are corrupt.
    #[error("UnreadableDocument: {detail}")]
    UnreadableDocument { detail: String },

    /// The rendering engine (pdfium) is not available in this environment.
    #[error("RenderingUnavailable: {detail}")]
    RenderingUnavailable { detail: String },

    /// The extraction service stayed unavailable through every attempt.
    #[error("ServiceUnavailable: {detail} (after {attempts} attempts)")]
    ServiceUnavailable { attempts: u32, detail: String },

    /// The extraction service refused further work for this run.
    #[error("QuotaExceeded: {detail}")]
    QuotaExceeded { detail: String },

    /// The extraction reply could not be parsed into the field schema.
    #[error("MalformedResponse: {detail}")]
    MalformedResponse { detail: String },
}

impl DocumentError {
    /// Short taxonomy name used in summaries and the audit export.
    pub fn kind(&self) -> &'static str {
        match self {
            DocumentError::Io { .. } | DocumentError::UnreadableDocument { .. } => {
                "UnreadableDocument"
            }
            DocumentError::RenderingUnavailable { .. } => "RenderingUnavailable",
            DocumentError::ServiceUnavailable { .. } => "ServiceUnavailable",
            DocumentError::QuotaExceeded { .. } => "QuotaExceeded",
            DocumentError::MalformedResponse { .. } => "MalformedResponse",
        }
    }

    /// `true` when the error must halt the remaining run.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, DocumentError::QuotaExceeded { .. })
    }
}

/// Failure modes of the external field extractor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    /// Transient: network error, 5xx, or the call exceeded its timeout.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The account has no remaining quota; retrying will not help.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The reply was not a JSON object matching the schema.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl ExtractError {
    /// Only `ServiceUnavailable` is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExtractError::ServiceUnavailable(_))
    }

    /// Convert into a per-document error once retries are exhausted.
    pub fn into_document_error(self, attempts: u32) -> DocumentError {
        match self {
            ExtractError::ServiceUnavailable(detail) => {
                DocumentError::ServiceUnavailable { attempts, detail }
            }
            ExtractError::QuotaExceeded(detail) => DocumentError::QuotaExceeded { detail },
            ExtractError::MalformedResponse(detail) => DocumentError::MalformedResponse { detail },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_error_display_starts_with_kind() {
        let e = DocumentError::UnreadableDocument {
            detail: "not a PDF or image".into(),
        };
        assert_eq!(e.kind(), "UnreadableDocument");
        assert!(e.to_string().starts_with("UnreadableDocument: "));
    }

    #[test]
    fn io_errors_report_as_unreadable() {
        let e = DocumentError::Io {
            detail: "permission denied".into(),
        };
        assert_eq!(e.kind(), "UnreadableDocument");
    }

    #[test]
    fn only_quota_is_run_fatal() {
        assert!(DocumentError::QuotaExceeded { detail: "x".into() }.is_run_fatal());
        assert!(!DocumentError::MalformedResponse { detail: "x".into() }.is_run_fatal());
        assert!(!DocumentError::ServiceUnavailable {
            attempts: 3,
            detail: "x".into()
        }
        .is_run_fatal());
    }

    #[test]
    fn service_unavailable_display_includes_attempts() {
        let e = ExtractError::ServiceUnavailable("HTTP 503".into()).into_document_error(3);
        let msg = e.to_string();
        assert!(msg.contains("HTTP 503"), "got: {msg}");
        assert!(msg.contains("3 attempts"), "got: {msg}");
    }

    #[test]
    fn retryable_classification() {
        assert!(ExtractError::ServiceUnavailable("x".into()).is_retryable());
        assert!(!ExtractError::QuotaExceeded("x".into()).is_retryable());
        assert!(!ExtractError::MalformedResponse("x".into()).is_retryable());
    }
}
