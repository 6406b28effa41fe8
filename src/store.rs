//! Persistence store: the SQLite audit trail behind every run.
//!
//! Two tables:
//!
//! * `source_documents`: one row per distinct content fingerprint. The
//!   `UNIQUE(fingerprint)` constraint is what prevents duplicates; inserts go
//!   through `ON CONFLICT DO NOTHING`, never check-then-insert.
//! * `extraction_records`: one row per successful extraction, referencing
//!   its document by foreign key. Forced reprocessing appends; the row with
//!   the highest id is the one exported.
//!
//! The pool holds a single connection: the runner is the only writer, and
//! every multi-statement update runs in its own transaction.

use crate::error::InvoiceError;
use crate::model::{
    AuditRow, DocumentStatus, ExtractionRecord, ExtractionResponse, NewDocument, RecordOutcome,
    SourceDocument, StagingRow,
};
use crate::schema::ExtractedFields;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

const DOCUMENT_COLUMNS: &str = "d.id, d.path, d.file_name, d.fingerprint, d.byte_size, d.mime, \
     d.discovered_at, d.status, d.failure_reason, d.updated_at";

const RECORD_COLUMNS: &str = "r.id AS record_id, r.document_id, r.fields_json, r.raw_response, \
     r.validation_errors_json, r.model, r.input_tokens, r.output_tokens, r.extracted_at";

/// Handle to the store. Owned by the runner for the duration of a run.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
    location: PathBuf,
}

impl Store {
    /// Open (creating if needed) the store file at `path`.
    pub async fn open(path: &Path) -> Result<Self, InvoiceError> {
        let open_failed = |detail: String| InvoiceError::StoreOpenFailed {
            path: path.to_path_buf(),
            detail,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| open_failed(e.to_string()))?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| open_failed(e.to_string()))?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        Self::connect(options, path.to_path_buf()).await
    }

    /// Open a private in-memory store. Its contents vanish on [`Store::close`].
    pub async fn open_in_memory() -> Result<Self, InvoiceError> {
        let location = PathBuf::from(":memory:");
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| InvoiceError::StoreOpenFailed {
                path: location.clone(),
                detail: e.to_string(),
            })?
            .foreign_keys(true);

        Self::connect(options, location).await
    }

    async fn connect(options: SqliteConnectOptions, location: PathBuf) -> Result<Self, InvoiceError> {
        // One connection that is never recycled: an in-memory database lives
        // exactly as long as its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| InvoiceError::StoreOpenFailed {
                path: location.clone(),
                detail: e.to_string(),
            })?;

        let store = Self { pool, location };
        store
            .migrate()
            .await
            .map_err(|e| InvoiceError::StoreOpenFailed {
                path: store.location.clone(),
                detail: e.to_string(),
            })?;

        info!("Store opened at {}", store.location.display());
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS source_documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL,
                file_name TEXT NOT NULL,
                fingerprint TEXT NOT NULL UNIQUE,
                byte_size INTEGER NOT NULL,
                mime TEXT NOT NULL,
                discovered_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'processed', 'failed')),
                failure_reason TEXT,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS extraction_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id INTEGER NOT NULL,
                fields_json TEXT NOT NULL,
                raw_response TEXT NOT NULL,
                validation_errors_json TEXT NOT NULL DEFAULT '[]',
                model TEXT NOT NULL,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                extracted_at TEXT NOT NULL,
                FOREIGN KEY (document_id) REFERENCES source_documents(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_records_document_id ON extraction_records(document_id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_documents_discovered_at ON source_documents(discovered_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Where the store lives (`:memory:` for in-memory stores).
    pub fn location(&self) -> &Path {
        &self.location
    }

    // ── Writes ────────────────────────────────────────────────────────────

    /// Insert the document unless its fingerprint is already known.
    ///
    /// An existing row is returned unchanged (including its original path);
    /// `created` tells the two cases apart.
    pub async fn record_document(&self, doc: &NewDocument) -> Result<RecordOutcome, InvoiceError> {
        let now = timestamp(Utc::now());
        let file_name = doc
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let inserted = sqlx::query(
            r#"
            INSERT INTO source_documents
                (path, file_name, fingerprint, byte_size, mime, discovered_at, status, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 'pending', ?)
            ON CONFLICT(fingerprint) DO NOTHING
            "#,
        )
        .bind(doc.path.to_string_lossy().into_owned())
        .bind(&file_name)
        .bind(&doc.fingerprint)
        .bind(doc.byte_size as i64)
        .bind(&doc.mime)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let created = inserted.rows_affected() == 1;
        let document = self
            .document_by_fingerprint(&doc.fingerprint)
            .await?
            .ok_or_else(|| {
                InvoiceError::StoreWriteFailure(format!(
                    "document {} vanished after insert",
                    doc.fingerprint
                ))
            })?;

        debug!(
            "Recorded document #{} ({}, created={})",
            document.id, document.status, created
        );
        Ok(RecordOutcome { document, created })
    }

    /// Append an extraction record and mark the document processed, atomically.
    pub async fn record_extraction(
        &self,
        document_id: i64,
        response: &ExtractionResponse,
    ) -> Result<ExtractionRecord, InvoiceError> {
        let extracted_at = Utc::now();
        let stamp = timestamp(extracted_at);
        let fields_json = serde_json::to_string(&response.fields)
            .map_err(|e| InvoiceError::StoreWriteFailure(format!("cannot encode fields: {e}")))?;
        let errors_json = serde_json::to_string(&response.validation_errors).map_err(|e| {
            InvoiceError::StoreWriteFailure(format!("cannot encode validation errors: {e}"))
        })?;

        let mut tx = self.pool.begin().await?;

        let record_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO extraction_records
                (document_id, fields_json, raw_response, validation_errors_json,
                 model, input_tokens, output_tokens, extracted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(document_id)
        .bind(&fields_json)
        .bind(&response.raw_response)
        .bind(&errors_json)
        .bind(&response.model)
        .bind(response.input_tokens as i64)
        .bind(response.output_tokens as i64)
        .bind(&stamp)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE source_documents SET status = 'processed', failure_reason = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(&stamp)
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!("Stored extraction #{} for document #{}", record_id, document_id);
        Ok(ExtractionRecord {
            id: record_id,
            document_id,
            fields: response.fields.clone(),
            raw_response: response.raw_response.clone(),
            validation_errors: response.validation_errors.clone(),
            model: response.model.clone(),
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
            extracted_at: parse_timestamp(&stamp)?,
        })
    }

    /// Mark a document failed. The row and any earlier records are kept.
    ///
    /// A document already failed for the same reason is left untouched, so
    /// retrying it on a rerun does not move `updated_at`.
    pub async fn mark_failed(&self, document_id: i64, reason: &str) -> Result<(), InvoiceError> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE source_documents SET status = 'failed', failure_reason = ?, updated_at = ? \
             WHERE id = ? AND NOT (status = 'failed' AND failure_reason IS ?)",
        )
        .bind(reason)
        .bind(timestamp(Utc::now()))
        .bind(document_id)
        .bind(reason)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM source_documents WHERE id = ?")
                .bind(document_id)
                .fetch_optional(&mut *tx)
                .await?
                .is_some();
            if !exists {
                tx.rollback().await?;
                return Err(InvoiceError::StoreWriteFailure(format!(
                    "cannot mark unknown document #{document_id} as failed"
                )));
            }
            debug!("Document #{} already failed with the same reason", document_id);
        }
        tx.commit().await?;
        Ok(())
    }

    // ── Reads ─────────────────────────────────────────────────────────────

    pub async fn document_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<SourceDocument>, InvoiceError> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM source_documents d WHERE d.fingerprint = ?"
        ))
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(document_from_row).transpose()
    }

    pub async fn document(&self, id: i64) -> Result<Option<SourceDocument>, InvoiceError> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM source_documents d WHERE d.id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(document_from_row).transpose()
    }

    /// Every extraction record of a document, oldest first.
    pub async fn extraction_records(
        &self,
        document_id: i64,
    ) -> Result<Vec<ExtractionRecord>, InvoiceError> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM extraction_records r WHERE r.document_id = ? ORDER BY r.id ASC"
        ))
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    /// Processed documents joined to their latest extraction, in discovery order.
    pub async fn all_staging_rows(&self) -> Result<Vec<StagingRow>, InvoiceError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {DOCUMENT_COLUMNS}, {RECORD_COLUMNS}
            FROM source_documents d
            JOIN extraction_records r ON r.id = (
                SELECT MAX(id) FROM extraction_records WHERE document_id = d.id
            )
            WHERE d.status = 'processed'
            ORDER BY d.discovered_at ASC, d.id ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(StagingRow {
                    document: document_from_row(row)?,
                    record: record_from_row(row)?,
                })
            })
            .collect()
    }

    /// Every document regardless of outcome, in discovery order.
    pub async fn all_audit_rows(&self) -> Result<Vec<AuditRow>, InvoiceError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {DOCUMENT_COLUMNS},
                   COUNT(r.id) AS extraction_count,
                   MAX(r.id) AS latest_record_id
            FROM source_documents d
            LEFT JOIN extraction_records r ON r.document_id = d.id
            GROUP BY d.id
            ORDER BY d.discovered_at ASC, d.id ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let count: i64 = row.try_get("extraction_count")?;
                Ok(AuditRow {
                    document: document_from_row(row)?,
                    extraction_count: count as u64,
                    latest_record_id: row.try_get("latest_record_id")?,
                })
            })
            .collect()
    }

    /// Total extraction records across all documents.
    pub async fn extraction_count(&self) -> Result<u64, InvoiceError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM extraction_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }

    /// Flush and close the pool.
    pub async fn close(self) {
        self.pool.close().await;
        debug!("Store closed: {}", self.location.display());
    }
}

// ── Row decoding ──────────────────────────────────────────────────────────

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, InvoiceError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| InvoiceError::StoreWriteFailure(format!("corrupt timestamp '{s}': {e}")))
}

fn document_from_row(row: &SqliteRow) -> Result<SourceDocument, InvoiceError> {
    let path: String = row.try_get("path")?;
    let byte_size: i64 = row.try_get("byte_size")?;
    let status: String = row.try_get("status")?;
    let discovered_at: String = row.try_get("discovered_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(SourceDocument {
        id: row.try_get("id")?,
        path: PathBuf::from(path),
        file_name: row.try_get("file_name")?,
        fingerprint: row.try_get("fingerprint")?,
        byte_size: byte_size as u64,
        mime: row.try_get("mime")?,
        discovered_at: parse_timestamp(&discovered_at)?,
        status: DocumentStatus::from_str(&status).map_err(InvoiceError::StoreWriteFailure)?,
        failure_reason: row.try_get("failure_reason")?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn record_from_row(row: &SqliteRow) -> Result<ExtractionRecord, InvoiceError> {
    let fields_json: String = row.try_get("fields_json")?;
    let errors_json: String = row.try_get("validation_errors_json")?;
    let input_tokens: i64 = row.try_get("input_tokens")?;
    let output_tokens: i64 = row.try_get("output_tokens")?;
    let extracted_at: String = row.try_get("extracted_at")?;

    let fields: ExtractedFields = serde_json::from_str(&fields_json)
        .map_err(|e| InvoiceError::StoreWriteFailure(format!("corrupt fields_json: {e}")))?;
    let validation_errors: Vec<String> = serde_json::from_str(&errors_json).map_err(|e| {
        InvoiceError::StoreWriteFailure(format!("corrupt validation_errors_json: {e}"))
    })?;

    Ok(ExtractionRecord {
        id: row.try_get("record_id")?,
        document_id: row.try_get("document_id")?,
        fields,
        raw_response: row.try_get("raw_response")?,
        validation_errors,
        model: row.try_get("model")?,
        input_tokens: input_tokens as u64,
        output_tokens: output_tokens as u64,
        extracted_at: parse_timestamp(&extracted_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldValue;
    use rust_decimal_macros::dec;

    fn new_doc(name: &str, fingerprint: &str) -> NewDocument {
        NewDocument {
            path: PathBuf::from(format!("/bills/{name}")),
            fingerprint: fingerprint.to_string(),
            byte_size: 42,
            mime: "application/pdf".into(),
        }
    }

    fn response(total: rust_decimal::Decimal) -> ExtractionResponse {
        let mut fields = ExtractedFields::new();
        fields.insert("vendor", FieldValue::Text("City Power".into()));
        fields.insert("total", FieldValue::Amount(total));
        fields.insert("due_date", FieldValue::Absent);
        ExtractionResponse {
            fields,
            raw_response: r#"{"vendor":"City Power"}"#.into(),
            validation_errors: vec!["missing required field 'account_number'".into()],
            model: "test/model".into(),
            input_tokens: 1200,
            output_tokens: 80,
        }
    }

    #[tokio::test]
    async fn record_document_is_unique_per_fingerprint() {
        let store = Store::open_in_memory().await.unwrap();

        let first = store.record_document(&new_doc("a.pdf", "fp1")).await.unwrap();
        assert!(first.created);
        assert_eq!(first.document.status, DocumentStatus::Pending);
        assert_eq!(first.document.file_name, "a.pdf");

        // Same bytes under another path: existing row, original path kept.
        let again = store.record_document(&new_doc("copy.pdf", "fp1")).await.unwrap();
        assert!(!again.created);
        assert_eq!(again.document.id, first.document.id);
        assert_eq!(again.document.path, PathBuf::from("/bills/a.pdf"));
        assert!(!again.already_processed());

        assert_eq!(store.all_audit_rows().await.unwrap().len(), 1);
        store.close().await;
    }

    #[tokio::test]
    async fn record_extraction_marks_processed_and_appends() {
        let store = Store::open_in_memory().await.unwrap();
        let doc = store.record_document(&new_doc("a.pdf", "fp1")).await.unwrap();
        let id = doc.document.id;

        let first = store.record_extraction(id, &response(dec!(10.5))).await.unwrap();
        let second = store.record_extraction(id, &response(dec!(99.999))).await.unwrap();
        assert!(second.id > first.id);

        let outcome = store.record_document(&new_doc("a.pdf", "fp1")).await.unwrap();
        assert!(outcome.already_processed());

        let records = store.extraction_records(id).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].fields.get("total"), &FieldValue::Amount(dec!(10.5)));
        assert_eq!(records[0].fields.get("due_date"), &FieldValue::Absent);
        assert_eq!(records[0].input_tokens, 1200);

        let staging = store.all_staging_rows().await.unwrap();
        assert_eq!(staging.len(), 1);
        assert_eq!(staging[0].record.id, second.id);
        assert_eq!(staging[0].record.fields.get("total"), &FieldValue::Amount(dec!(99.999)));
        assert_eq!(staging[0].record.validation_errors.len(), 1);
    }

    #[tokio::test]
    async fn failed_documents_stay_out_of_staging() {
        let store = Store::open_in_memory().await.unwrap();
        let a = store.record_document(&new_doc("a.pdf", "fp-a")).await.unwrap();
        let b = store.record_document(&new_doc("b.pdf", "fp-b")).await.unwrap();
        store.record_extraction(a.document.id, &response(dec!(1))).await.unwrap();
        store
            .mark_failed(b.document.id, "UnreadableDocument: corrupt PDF")
            .await
            .unwrap();

        let staging = store.all_staging_rows().await.unwrap();
        assert_eq!(staging.len(), 1);
        assert_eq!(staging[0].document.file_name, "a.pdf");

        let audit = store.all_audit_rows().await.unwrap();
        assert_eq!(audit.len(), 2);
        assert_eq!(audit[0].extraction_count, 1);
        assert_eq!(audit[1].document.status, DocumentStatus::Failed);
        assert_eq!(
            audit[1].document.failure_reason.as_deref(),
            Some("UnreadableDocument: corrupt PDF")
        );
        assert_eq!(audit[1].latest_record_id, None);
    }

    #[tokio::test]
    async fn success_after_failure_clears_reason() {
        let store = Store::open_in_memory().await.unwrap();
        let a = store.record_document(&new_doc("a.pdf", "fp-a")).await.unwrap();
        store.mark_failed(a.document.id, "ServiceUnavailable: 503").await.unwrap();
        store.record_extraction(a.document.id, &response(dec!(1))).await.unwrap();

        let doc = store.document(a.document.id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Processed);
        assert_eq!(doc.failure_reason, None);
    }

    #[tokio::test]
    async fn repeated_failure_keeps_updated_at() {
        let store = Store::open_in_memory().await.unwrap();
        let a = store.record_document(&new_doc("a.pdf", "fp-a")).await.unwrap();
        let id = a.document.id;

        store.mark_failed(id, "UnreadableDocument: corrupt").await.unwrap();
        let first = store.document(id).await.unwrap().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        store.mark_failed(id, "UnreadableDocument: corrupt").await.unwrap();
        let same = store.document(id).await.unwrap().unwrap();
        assert_eq!(same.updated_at, first.updated_at);

        store.mark_failed(id, "ServiceUnavailable: 503").await.unwrap();
        let changed = store.document(id).await.unwrap().unwrap();
        assert!(changed.updated_at > first.updated_at);
        assert_eq!(changed.failure_reason.as_deref(), Some("ServiceUnavailable: 503"));
    }

    #[tokio::test]
    async fn extraction_requires_existing_document() {
        let store = Store::open_in_memory().await.unwrap();
        let err = store.record_extraction(999, &response(dec!(1))).await.unwrap_err();
        assert!(matches!(err, InvoiceError::StoreWriteFailure(_)));
        assert_eq!(store.extraction_count().await.unwrap(), 0);

        let err = store.mark_failed(999, "x").await.unwrap_err();
        assert!(matches!(err, InvoiceError::StoreWriteFailure(_)));
    }

    #[tokio::test]
    async fn file_store_persists_across_reopen() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested/invoices.sqlite");

        let store = Store::open(&path).await.unwrap();
        let doc = store.record_document(&new_doc("a.pdf", "fp1")).await.unwrap();
        store.record_extraction(doc.document.id, &response(dec!(5))).await.unwrap();
        store.close().await;

        let store = Store::open(&path).await.unwrap();
        let found = store.document_by_fingerprint("fp1").await.unwrap().unwrap();
        assert_eq!(found.status, DocumentStatus::Processed);
        assert_eq!(store.extraction_count().await.unwrap(), 1);
        store.close().await;
    }

    #[test]
    fn timestamps_sort_lexicographically() {
        let a = timestamp(DateTime::parse_from_rfc3339("2024-01-02T03:04:05.006Z").unwrap().into());
        let b = timestamp(DateTime::parse_from_rfc3339("2024-01-02T03:04:05.120Z").unwrap().into());
        assert_eq!(a, "2024-01-02T03:04:05.006Z");
        assert!(a < b);
        assert_eq!(parse_timestamp(&a).unwrap().timestamp_subsec_millis(), 6);
    }
}
