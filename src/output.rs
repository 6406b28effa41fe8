//! Run-level results returned to callers.

use serde::Serialize;
use std::path::PathBuf;

/// A document that failed during this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedDocument {
    pub path: PathBuf,
    /// `<Kind>: <detail>`, as stored in the audit trail.
    pub reason: String,
}

/// Why a run stopped before reaching the last file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunAbort {
    /// The file being processed when the run stopped; left `pending`.
    pub path: PathBuf,
    pub reason: String,
}

/// Files written by the export stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExportPaths {
    pub pretty: PathBuf,
    pub staging: PathBuf,
    pub audit: PathBuf,
    pub snapshot: Option<PathBuf>,
}

/// Outcome of [`crate::runner::run`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    /// Candidate files found in the input directories.
    pub discovered: usize,
    /// Documents extracted and recorded in this run.
    pub processed: usize,
    /// Documents already processed in an earlier run (same fingerprint).
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<FailedDocument>,
    pub aborted: Option<RunAbort>,
    pub exports: Option<ExportPaths>,
    pub duration_ms: u64,
}

impl RunSummary {
    /// Every document either succeeded or was cleanly skipped.
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.aborted.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_requires_no_failures_and_no_abort() {
        let mut s = RunSummary {
            processed: 2,
            skipped: 1,
            ..Default::default()
        };
        assert!(s.is_clean());

        s.aborted = Some(RunAbort {
            path: PathBuf::from("c.pdf"),
            reason: "QuotaExceeded: out of credit".into(),
        });
        assert!(!s.is_clean());

        s.aborted = None;
        s.failed = 1;
        assert!(!s.is_clean());
    }
}
