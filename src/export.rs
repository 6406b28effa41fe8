//! Export stage: render the store into three CSV files.
//!
//! | File | Rows | Purpose |
//! |------|------|---------|
//! | `invoices_staging_pretty.csv` | processed documents | human review, amounts at 2 dp |
//! | `invoices_staging.csv` | processed documents | every field at full precision + diagnostics |
//! | `invoices_raw.csv` | every document | audit trail incl. failures |
//!
//! Output depends only on store contents, so exporting twice without new
//! extractions yields byte-identical files. Each file is written to a
//! temporary sibling and renamed into place.

use crate::config::PipelineConfig;
use crate::error::InvoiceError;
use crate::model::{AuditRow, StagingRow};
use crate::output::ExportPaths;
use crate::schema::FieldSchema;
use crate::store::Store;
use chrono::{DateTime, SecondsFormat, Utc};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

pub const PRETTY_FILE: &str = "invoices_staging_pretty.csv";
pub const STAGING_FILE: &str = "invoices_staging.csv";
pub const AUDIT_FILE: &str = "invoices_raw.csv";

/// What to export and where.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub output_dir: PathBuf,
    /// Column set and order for the field columns.
    pub schema: FieldSchema,
    /// Also write `invoices_staging_<YYYYmmdd_HHMMSS>.csv`.
    pub snapshot: bool,
}

impl ExportOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            schema: config.extraction_field_schema.clone(),
            snapshot: config.snapshot_exports,
        }
    }
}

/// Write all exports. Read-only with respect to the store.
///
/// Rows are read on the runtime; CSV rendering and file writes run on the
/// blocking pool.
pub async fn export_all(store: &Store, options: &ExportOptions) -> Result<ExportPaths, InvoiceError> {
    let staging = store.all_staging_rows().await?;
    let audit = store.all_audit_rows().await?;
    let (staging_count, audit_count) = (staging.len(), audit.len());

    let task_options = options.clone();
    let paths = tokio::task::spawn_blocking(move || write_exports(&staging, &audit, &task_options))
        .await
        .map_err(|e| InvoiceError::Internal(format!("export task failed: {}", e)))??;

    info!(
        "Exported {} staging rows and {} audit rows to {}",
        staging_count,
        audit_count,
        options.output_dir.display()
    );
    Ok(paths)
}

fn write_exports(
    staging: &[StagingRow],
    audit: &[AuditRow],
    options: &ExportOptions,
) -> Result<ExportPaths, InvoiceError> {
    std::fs::create_dir_all(&options.output_dir).map_err(|source| {
        InvoiceError::OutputWriteFailed {
            path: options.output_dir.clone(),
            source,
        }
    })?;

    let pretty_path = options.output_dir.join(PRETTY_FILE);
    let staging_path = options.output_dir.join(STAGING_FILE);
    let audit_path = options.output_dir.join(AUDIT_FILE);

    let pretty_csv = render_pretty(staging, &options.schema).map_err(|e| write_failed(&pretty_path, e))?;
    let staging_csv =
        render_staging(staging, &options.schema).map_err(|e| write_failed(&staging_path, e))?;
    let audit_csv = render_audit(audit).map_err(|e| write_failed(&audit_path, e))?;

    write_atomic(&pretty_path, &pretty_csv)?;
    write_atomic(&staging_path, &staging_csv)?;
    write_atomic(&audit_path, &audit_csv)?;

    let snapshot = if options.snapshot {
        let name = format!("invoices_staging_{}.csv", Utc::now().format("%Y%m%d_%H%M%S"));
        let path = options.output_dir.join(name);
        write_atomic(&path, &staging_csv)?;
        Some(path)
    } else {
        None
    };

    Ok(ExportPaths {
        pretty: pretty_path,
        staging: staging_path,
        audit: audit_path,
        snapshot,
    })
}

// ── Renderers ─────────────────────────────────────────────────────────────

fn render_pretty(rows: &[StagingRow], schema: &FieldSchema) -> Result<Vec<u8>, std::io::Error> {
    let mut header = vec!["document_id".to_string(), "file_name".to_string()];
    header.extend(schema.fields().iter().map(|f| f.name.clone()));
    header.push("validation_errors".to_string());

    let mut out = writer();
    out.write_record(&header)?;
    for row in rows {
        let mut record = vec![row.document.id.to_string(), row.document.file_name.clone()];
        record.extend(
            schema
                .fields()
                .iter()
                .map(|f| row.record.fields.get(&f.name).to_display_string()),
        );
        record.push(row.record.validation_errors.join("; "));
        out.write_record(&record)?;
    }
    finish(out)
}

fn render_staging(rows: &[StagingRow], schema: &FieldSchema) -> Result<Vec<u8>, std::io::Error> {
    let mut header: Vec<String> = [
        "document_id",
        "record_id",
        "path",
        "fingerprint",
        "discovered_at",
        "extracted_at",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    header.extend(schema.fields().iter().map(|f| f.name.clone()));
    header.extend(
        [
            "model",
            "input_tokens",
            "output_tokens",
            "validation_errors",
            "raw_response",
        ]
        .iter()
        .map(|s| s.to_string()),
    );

    let mut out = writer();
    out.write_record(&header)?;
    for row in rows {
        let mut record = vec![
            row.document.id.to_string(),
            row.record.id.to_string(),
            row.document.path.display().to_string(),
            row.document.fingerprint.clone(),
            iso(row.document.discovered_at),
            iso(row.record.extracted_at),
        ];
        record.extend(
            schema
                .fields()
                .iter()
                .map(|f| row.record.fields.get(&f.name).to_raw_string()),
        );
        record.push(row.record.model.clone());
        record.push(row.record.input_tokens.to_string());
        record.push(row.record.output_tokens.to_string());
        record.push(row.record.validation_errors.join("; "));
        record.push(row.record.raw_response.clone());
        out.write_record(&record)?;
    }
    finish(out)
}

fn render_audit(rows: &[AuditRow]) -> Result<Vec<u8>, std::io::Error> {
    let mut out = writer();
    out.write_record([
        "document_id",
        "path",
        "file_name",
        "fingerprint",
        "byte_size",
        "mime",
        "discovered_at",
        "updated_at",
        "status",
        "failure_reason",
        "extraction_count",
        "latest_record_id",
    ])?;
    for row in rows {
        let doc = &row.document;
        out.write_record([
            doc.id.to_string(),
            doc.path.display().to_string(),
            doc.file_name.clone(),
            doc.fingerprint.clone(),
            doc.byte_size.to_string(),
            doc.mime.clone(),
            iso(doc.discovered_at),
            iso(doc.updated_at),
            doc.status.to_string(),
            doc.failure_reason.clone().unwrap_or_default(),
            row.extraction_count.to_string(),
            row.latest_record_id.map(|id| id.to_string()).unwrap_or_default(),
        ])?;
    }
    finish(out)
}

// ── Helpers ───────────────────────────────────────────────────────────────

fn writer() -> csv::Writer<Vec<u8>> {
    csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new())
}

fn finish(out: csv::Writer<Vec<u8>>) -> Result<Vec<u8>, std::io::Error> {
    out.into_inner().map_err(|e| e.into_error())
}

fn iso(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn write_failed(path: &Path, source: std::io::Error) -> InvoiceError {
    InvoiceError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    }
}

/// Atomic write: temp file in the same directory, then rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), InvoiceError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| write_failed(path, e))?;
    tmp.write_all(bytes).map_err(|e| write_failed(path, e))?;
    tmp.flush().map_err(|e| write_failed(path, e))?;
    tmp.persist(path).map_err(|e| write_failed(path, e.error))?;
    Ok(())
}
