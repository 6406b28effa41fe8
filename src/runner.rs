//! Pipeline runner: discovery → record → render → extract → persist → export.
//!
//! Documents are processed strictly one at a time in lexicographic path
//! order. Each file's outcome is committed before the next one starts, so a
//! run stopped between files leaves the store consistent.
//!
//! ## Failure scopes
//!
//! | Error | Effect |
//! |-------|--------|
//! | `UnreadableDocument`, `RenderingUnavailable`, `MalformedResponse`, exhausted `ServiceUnavailable` | `mark_failed`, next file |
//! | `QuotaExceeded` | stop submitting; current file stays as it was; exports still run |
//! | `StoreWriteFailure` | `Err` to the caller; everything committed so far is kept |

use crate::config::PipelineConfig;
use crate::error::{DocumentError, InvoiceError};
use crate::export::{export_all, ExportOptions};
use crate::model::{ExtractionResponse, SourceDocument};
use crate::output::{ExportPaths, FailedDocument, RunAbort, RunSummary};
use crate::pipeline::discover::{describe_file, discover_files};
use crate::pipeline::encode::save_pages;
use crate::pipeline::extract::{extract_with_retry, FieldExtractor, RetryPolicy, VisionExtractor};
use crate::pipeline::render::{DocumentRenderer, PageRenderer, RenderOptions};
use crate::store::Store;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Run the whole pipeline with the default renderer and a VLM extractor.
///
/// The store is opened at [`PipelineConfig::resolved_store_path`] and closed
/// before returning, on success and on error alike.
///
/// # Errors
/// Only run-level failures: invalid input directory, unusable store, or an
/// unconfigured provider. Per-document failures are listed in the summary.
pub async fn run(config: &PipelineConfig) -> Result<RunSummary, InvoiceError> {
    let extractor: Arc<dyn FieldExtractor> = Arc::new(VisionExtractor::from_config(config)?);
    let store = Store::open(&config.resolved_store_path()).await?;
    run_with_store(store, Arc::new(DocumentRenderer), extractor, config).await
}

/// Synchronous wrapper around [`run`] for non-async callers.
pub fn run_sync(config: &PipelineConfig) -> Result<RunSummary, InvoiceError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| InvoiceError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(run(config))
}

/// Run with caller-supplied collaborators; closes `store` when done.
pub async fn run_with_store(
    store: Store,
    renderer: Arc<dyn PageRenderer>,
    extractor: Arc<dyn FieldExtractor>,
    config: &PipelineConfig,
) -> Result<RunSummary, InvoiceError> {
    let runner = Runner::new(store, renderer, extractor, config.clone());
    let result = runner.run().await;
    runner.into_store().close().await;
    result
}

/// Re-render the CSV exports from the existing store without extracting.
pub async fn export_only(config: &PipelineConfig) -> Result<ExportPaths, InvoiceError> {
    let store = Store::open(&config.resolved_store_path()).await?;
    let result = export_all(&store, &ExportOptions::from_config(config)).await;
    store.close().await;
    result
}

/// Owns the store handle and the two collaborators for one run.
pub struct Runner {
    store: Store,
    renderer: Arc<dyn PageRenderer>,
    extractor: Arc<dyn FieldExtractor>,
    config: PipelineConfig,
}

/// How one document ended.
enum Outcome {
    Processed(usize),
    Skipped,
    Failed(String),
    Aborted(String),
}

impl Runner {
    pub fn new(
        store: Store,
        renderer: Arc<dyn PageRenderer>,
        extractor: Arc<dyn FieldExtractor>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            renderer,
            extractor,
            config,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Give back the store handle so the caller can close it.
    pub fn into_store(self) -> Store {
        self.store
    }

    /// Process every discovered file, then export.
    pub async fn run(&self) -> Result<RunSummary, InvoiceError> {
        let start = Instant::now();
        let files = discover_files(&self.config)?;
        let total = files.len();
        info!(
            "Starting run: {} files, extractor {}",
            total,
            self.extractor.label()
        );

        let cb = self.config.progress_callback.as_ref();
        if let Some(cb) = cb {
            cb.on_run_start(total);
        }

        let mut summary = RunSummary {
            discovered: total,
            ..Default::default()
        };
        // Documents attempted in this run; same content under another path is not resubmitted.
        let mut attempted: HashSet<i64> = HashSet::new();

        for (i, path) in files.iter().enumerate() {
            let index = i + 1;
            if let Some(cb) = cb {
                cb.on_document_start(index, total, path);
            }

            match self.process_file(path, &mut attempted).await? {
                Outcome::Processed(found) => {
                    summary.processed += 1;
                    if let Some(cb) = cb {
                        cb.on_document_complete(index, total, path, found);
                    }
                }
                Outcome::Skipped => {
                    summary.skipped += 1;
                    if let Some(cb) = cb {
                        cb.on_document_skipped(index, total, path);
                    }
                }
                Outcome::Failed(reason) => {
                    warn!("{} failed: {}", path.display(), reason);
                    if let Some(cb) = cb {
                        cb.on_document_error(index, total, path, &reason);
                    }
                    summary.failed += 1;
                    summary.failures.push(FailedDocument {
                        path: path.clone(),
                        reason,
                    });
                }
                Outcome::Aborted(reason) => {
                    warn!(
                        "Run aborted at {}: {} ({} files not attempted)",
                        path.display(),
                        reason,
                        total - index
                    );
                    if let Some(cb) = cb {
                        cb.on_document_error(index, total, path, &reason);
                    }
                    summary.aborted = Some(RunAbort {
                        path: path.clone(),
                        reason,
                    });
                    break;
                }
            }
        }

        summary.exports = Some(export_all(&self.store, &ExportOptions::from_config(&self.config)).await?);
        summary.duration_ms = start.elapsed().as_millis() as u64;

        info!(
            "Run complete: {} processed, {} skipped, {} failed{} in {}ms",
            summary.processed,
            summary.skipped,
            summary.failed,
            if summary.aborted.is_some() { ", aborted" } else { "" },
            summary.duration_ms
        );
        if let Some(cb) = cb {
            cb.on_run_complete(&summary);
        }
        Ok(summary)
    }

    /// One file, start to finish. `Err` only for store failures.
    async fn process_file(
        &self,
        path: &Path,
        attempted: &mut HashSet<i64>,
    ) -> Result<Outcome, InvoiceError> {
        let (new_doc, bytes) = match describe_file(path).await {
            Ok(described) => described,
            // No fingerprint, so no document row: the summary is the only record.
            Err(e) => return Ok(Outcome::Failed(e.to_string())),
        };

        let recorded = self.store.record_document(&new_doc).await?;
        if recorded.already_processed() && !self.config.force_reprocess {
            debug!(
                "Skipping {}: already processed as document #{}",
                path.display(),
                recorded.document.id
            );
            return Ok(Outcome::Skipped);
        }
        if !attempted.insert(recorded.document.id) {
            debug!(
                "Skipping {}: document #{} already attempted in this run",
                path.display(),
                recorded.document.id
            );
            return Ok(Outcome::Skipped);
        }

        let document = recorded.document;
        info!("Processing {} (document #{})", path.display(), document.id);

        match self.extract_document(&document, path, bytes).await {
            Ok(response) => {
                let found = response.fields.present_count();
                let record = self.store.record_extraction(document.id, &response).await?;
                info!(
                    "{}: {} fields, record #{}{}",
                    document.file_name,
                    found,
                    record.id,
                    if record.validation_errors.is_empty() {
                        String::new()
                    } else {
                        format!(", {} validation notes", record.validation_errors.len())
                    }
                );
                Ok(Outcome::Processed(found))
            }
            Err(e) if e.is_run_fatal() => Ok(Outcome::Aborted(e.to_string())),
            Err(e) => {
                let reason = e.to_string();
                self.store.mark_failed(document.id, &reason).await?;
                Ok(Outcome::Failed(reason))
            }
        }
    }

    /// Render then extract. Every failure here is scoped to this document.
    async fn extract_document(
        &self,
        document: &SourceDocument,
        path: &Path,
        bytes: Vec<u8>,
    ) -> Result<ExtractionResponse, DocumentError> {
        let options = RenderOptions {
            dpi: self.config.render_density_dpi,
            max_rendered_pixels: self.config.max_rendered_pixels,
        };
        let renderer = Arc::clone(&self.renderer);
        let pages = tokio::task::spawn_blocking(move || renderer.render(&bytes, &options))
            .await
            .map_err(|e| DocumentError::RenderingUnavailable {
                detail: format!("render task failed: {}", e),
            })??;
        debug!("{}: {} pages rendered", document.file_name, pages.len());

        if self.config.keep_page_images {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "document".to_string());
            let dir = self.config.output_dir.join("pages");
            if let Err(e) = save_pages(&dir, document.id, &stem, &pages) {
                warn!("Could not save page images for {}: {}", path.display(), e);
            }
        }

        let policy = RetryPolicy::from_config(&self.config);
        extract_with_retry(
            self.extractor.as_ref(),
            &pages,
            &self.config.extraction_field_schema,
            &policy,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExtractError;
    use crate::model::{DocumentStatus, PageImage};
    use crate::schema::{ExtractedFields, FieldSchema, FieldValue};
    use async_trait::async_trait;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FieldExtractor for Echo {
        async fn extract(
            &self,
            pages: &[PageImage],
            _schema: &FieldSchema,
        ) -> Result<ExtractionResponse, ExtractError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut fields = ExtractedFields::new();
            fields.insert("vendor", FieldValue::Text(format!("{} pages", pages.len())));
            Ok(ExtractionResponse {
                fields,
                raw_response: "{}".into(),
                validation_errors: vec![],
                model: "echo".into(),
                input_tokens: 0,
                output_tokens: 0,
            })
        }
    }

    fn png(shade: u8) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([shade, 0, 0])));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
        buf
    }

    #[tokio::test]
    async fn processes_then_skips_on_rerun() {
        let input = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        std::fs::write(input.path().join("a.png"), png(1)).unwrap();
        std::fs::write(input.path().join("b.png"), png(2)).unwrap();
        let config = PipelineConfig::builder()
            .input_dirs([input.path()])
            .output_dir(output.path())
            .keep_page_images(true)
            .build()
            .unwrap();

        let store = Store::open_in_memory().await.unwrap();
        let echo = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let runner = Runner::new(store, Arc::new(DocumentRenderer), echo.clone(), config);

        let first = runner.run().await.unwrap();
        assert_eq!((first.processed, first.skipped, first.failed), (2, 0, 0));
        assert!(first.is_clean());
        assert!(output.path().join("pages").read_dir().unwrap().count() == 2);

        let second = runner.run().await.unwrap();
        assert_eq!((second.processed, second.skipped), (0, 2));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 2);

        let audit = runner.store().all_audit_rows().await.unwrap();
        assert!(audit.iter().all(|r| r.document.status == DocumentStatus::Processed));
        runner.into_store().close().await;
    }

    #[tokio::test]
    async fn missing_input_dir_is_fatal() {
        let output = TempDir::new().unwrap();
        let config = PipelineConfig::builder()
            .input_dirs([output.path().join("nope")])
            .output_dir(output.path())
            .build()
            .unwrap();
        let store = Store::open_in_memory().await.unwrap();
        let err = run_with_store(
            store,
            Arc::new(DocumentRenderer),
            Arc::new(Echo {
                calls: AtomicUsize::new(0),
            }),
            &config,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, InvoiceError::InputDirNotFound { .. }));
    }
}
