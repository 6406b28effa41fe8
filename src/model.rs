//! Persisted entities and their derived projections.

use crate::schema::ExtractedFields;
use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Processing status of a [`SourceDocument`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Processed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processed => "processed",
            DocumentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DocumentStatus::Pending),
            "processed" => Ok(DocumentStatus::Processed),
            "failed" => Ok(DocumentStatus::Failed),
            other => Err(format!("unknown document status '{other}'")),
        }
    }
}

/// One input file, keyed by content fingerprint. Never deleted: this is the
/// audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub id: i64,
    /// Path at which the content was first discovered.
    pub path: PathBuf,
    pub file_name: String,
    /// SHA-256 of the file bytes, lowercase hex.
    pub fingerprint: String,
    pub byte_size: u64,
    pub mime: String,
    pub discovered_at: DateTime<Utc>,
    pub status: DocumentStatus,
    pub failure_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Input to [`crate::store::Store::record_document`].
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub path: PathBuf,
    pub fingerprint: String,
    pub byte_size: u64,
    pub mime: String,
}

/// Result of recording a discovered file.
#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub document: SourceDocument,
    /// `false` when a row with the same fingerprint already existed.
    pub created: bool,
}

impl RecordOutcome {
    pub fn already_processed(&self) -> bool {
        !self.created && self.document.status == DocumentStatus::Processed
    }
}

/// One rendered page. Lives only for the duration of one extraction attempt.
#[derive(Debug, Clone)]
pub struct PageImage {
    /// 0-based.
    pub page_index: usize,
    pub width: u32,
    pub height: u32,
    pub image: DynamicImage,
}

impl PageImage {
    pub fn new(page_index: usize, image: DynamicImage) -> Self {
        Self {
            page_index,
            width: image.width(),
            height: image.height(),
            image,
        }
    }
}

/// What the extractor returned for one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionResponse {
    pub fields: ExtractedFields,
    /// Verbatim reply text, kept for auditing.
    pub raw_response: String,
    pub validation_errors: Vec<String>,
    /// Provider/model label, e.g. `openai/gpt-4.1-nano`.
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A persisted extraction attempt. Later attempts supersede, never overwrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub id: i64,
    pub document_id: i64,
    pub fields: ExtractedFields,
    pub raw_response: String,
    pub validation_errors: Vec<String>,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub extracted_at: DateTime<Utc>,
}

/// Export projection: a processed document and its latest extraction.
#[derive(Debug, Clone)]
pub struct StagingRow {
    pub document: SourceDocument,
    pub record: ExtractionRecord,
}

/// Export projection: every document regardless of outcome.
#[derive(Debug, Clone)]
pub struct AuditRow {
    pub document: SourceDocument,
    pub extraction_count: u64,
    pub latest_record_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for s in [
            DocumentStatus::Pending,
            DocumentStatus::Processed,
            DocumentStatus::Failed,
        ] {
            assert_eq!(s.as_str().parse::<DocumentStatus>().unwrap(), s);
        }
        assert!("done".parse::<DocumentStatus>().is_err());
    }

    #[test]
    fn page_image_takes_dimensions_from_image() {
        let img = DynamicImage::new_rgb8(40, 30);
        let page = PageImage::new(0, img);
        assert_eq!((page.width, page.height), (40, 30));
    }
}
