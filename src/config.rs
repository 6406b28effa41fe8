//! Configuration types for an extraction run.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`] or loaded from a TOML file with
//! [`PipelineConfig::from_toml_file`]. CLI flags are applied on top of the
//! file through the same builder.
//!
//! ```toml
//! input_dirs = ["data"]
//! optional_input_dirs = ["data/invoices"]
//! output_dir = "outputs"
//! render_density_dpi = 300
//! service_timeout_seconds = 120
//! provider = "gemini"
//! model = "gemini-2.5-flash"
//!
//! [[extraction_field_schema]]
//! name = "vendor"
//! kind = "text"
//!
//! [[extraction_field_schema]]
//! name = "total_amount_due"
//! kind = "amount"
//! required = true
//! ```

use crate::error::InvoiceError;
use crate::progress::ProgressCallback;
use crate::schema::{FieldSchema, FieldSpec};
use edgequake_llm::LLMProvider;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default store file name inside `output_dir`.
pub const DEFAULT_STORE_FILE: &str = "invoices.sqlite";

/// Configuration for an extraction run.
#[derive(Clone)]
pub struct PipelineConfig {
    /// Directories scanned for candidate files. Each must exist.
    pub input_dirs: Vec<PathBuf>,

    /// Extra directories scanned only when present. Default: `data/invoices`.
    /// Setting `input_dirs` through the builder clears this list.
    pub optional_input_dirs: Vec<PathBuf>,

    /// Directory receiving the store (by default) and the CSV exports.
    pub output_dir: PathBuf,

    /// SQLite file. Default: `<output_dir>/invoices.sqlite`.
    pub store_path: Option<PathBuf>,

    /// Rendering density in dots per inch. Range: 72–600. Default: 300.
    pub render_density_dpi: u32,

    /// Upper bound on either edge of a rendered page, in pixels. Default: 4000.
    ///
    /// A 300-DPI render of a tabloid page is 3300 × 5100 px; larger sheets are
    /// scaled down so both edges stay under this cap.
    pub max_rendered_pixels: u32,

    /// Re-extract documents whose fingerprint is already processed. Default: false.
    pub force_reprocess: bool,

    /// Fields requested from the extractor, in export order.
    pub extraction_field_schema: FieldSchema,

    /// Per-call budget for the extraction service. `None` waits indefinitely.
    /// Default: 120 s.
    pub service_timeout_seconds: Option<u64>,

    /// Total attempts per document when the service is unavailable. Default: 3.
    pub max_attempts: u32,

    /// Initial retry delay in milliseconds, doubled per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Lower-case file extensions treated as candidates.
    pub extensions: Vec<String>,

    /// Descend into sub-directories of each input directory. Default: false.
    pub recursive: bool,

    /// Write rendered pages under `<output_dir>/pages/` for manual review.
    pub keep_page_images: bool,

    /// Also write a timestamped copy of the staging export. Default: false.
    pub snapshot_exports: bool,

    /// LLM provider name (e.g. "openai", "gemini", "anthropic").
    /// If None along with `provider`, the provider is auto-detected.
    pub provider_name: Option<String>,

    /// LLM model identifier. If None, uses the provider default.
    pub model: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.0.
    pub temperature: f32,

    /// Maximum tokens the model may generate per document. Default: 2048.
    pub max_tokens: usize,

    /// Custom extraction prompt. If None, built from the schema.
    pub system_prompt: Option<String>,

    /// Per-document progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_dirs: vec![PathBuf::from("data")],
            optional_input_dirs: vec![PathBuf::from("data").join("invoices")],
            output_dir: PathBuf::from("outputs"),
            store_path: None,
            render_density_dpi: 300,
            max_rendered_pixels: 4000,
            force_reprocess: false,
            extraction_field_schema: FieldSchema::default(),
            service_timeout_seconds: Some(120),
            max_attempts: 3,
            retry_backoff_ms: 500,
            extensions: ["pdf", "png", "jpg", "jpeg"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            recursive: false,
            keep_page_images: false,
            snapshot_exports: false,
            provider_name: None,
            model: None,
            provider: None,
            temperature: 0.0,
            max_tokens: 2048,
            system_prompt: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("input_dirs", &self.input_dirs)
            .field("optional_input_dirs", &self.optional_input_dirs)
            .field("output_dir", &self.output_dir)
            .field("store_path", &self.store_path)
            .field("render_density_dpi", &self.render_density_dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("force_reprocess", &self.force_reprocess)
            .field("fields", &self.extraction_field_schema.fields().len())
            .field("service_timeout_seconds", &self.service_timeout_seconds)
            .field("max_attempts", &self.max_attempts)
            .field("provider_name", &self.provider_name)
            .field("model", &self.model)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Load a builder pre-filled from a TOML file.
    ///
    /// Relative paths in the file are resolved against the file's directory.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<PipelineConfigBuilder, InvoiceError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| InvoiceError::ConfigRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml_str(&text, base).map_err(|detail| InvoiceError::ConfigParse {
            path: path.to_path_buf(),
            detail,
        })
    }

    /// Parse TOML text; relative paths are joined onto `base_dir`.
    pub fn from_toml_str(text: &str, base_dir: &Path) -> Result<PipelineConfigBuilder, String> {
        let file: FileConfig = toml::from_str(text).map_err(|e| e.to_string())?;
        Ok(file.apply(Self::builder(), base_dir))
    }

    /// Resolved path of the SQLite store.
    pub fn resolved_store_path(&self) -> PathBuf {
        self.store_path
            .clone()
            .unwrap_or_else(|| self.output_dir.join(DEFAULT_STORE_FILE))
    }

    /// `true` when `path` has one of the configured extensions.
    pub fn accepts_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| {
                let e = e.to_ascii_lowercase();
                self.extensions.iter().any(|x| *x == e)
            })
            .unwrap_or(false)
    }
}

/// Builder for [`PipelineConfig`].
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl fmt::Debug for PipelineConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl PipelineConfigBuilder {
    pub fn input_dirs<I, P>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.config.input_dirs = dirs.into_iter().map(Into::into).collect();
        self.config.optional_input_dirs.clear();
        self
    }

    pub fn optional_input_dirs<I, P>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.config.optional_input_dirs = dirs.into_iter().map(Into::into).collect();
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.store_path = Some(path.into());
        self
    }

    pub fn render_density_dpi(mut self, dpi: u32) -> Self {
        self.config.render_density_dpi = dpi;
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn force_reprocess(mut self, v: bool) -> Self {
        self.config.force_reprocess = v;
        self
    }

    pub fn extraction_field_schema(mut self, schema: FieldSchema) -> Self {
        self.config.extraction_field_schema = schema;
        self
    }

    pub fn service_timeout_seconds(mut self, secs: Option<u64>) -> Self {
        self.config.service_timeout_seconds = secs.filter(|s| *s > 0);
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn extensions<I, S>(mut self, exts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.config.extensions = exts
            .into_iter()
            .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
            .collect();
        self
    }

    pub fn recursive(mut self, v: bool) -> Self {
        self.config.recursive = v;
        self
    }

    pub fn keep_page_images(mut self, v: bool) -> Self {
        self.config.keep_page_images = v;
        self
    }

    pub fn snapshot_exports(mut self, v: bool) -> Self {
        self.config.snapshot_exports = v;
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, InvoiceError> {
        let c = &self.config;
        if c.render_density_dpi < 72 || c.render_density_dpi > 600 {
            return Err(InvoiceError::InvalidConfig(format!(
                "render_density_dpi must be 72–600, got {}",
                c.render_density_dpi
            )));
        }
        if c.max_attempts == 0 {
            return Err(InvoiceError::InvalidConfig(
                "max_attempts must be ≥ 1".into(),
            ));
        }
        if c.input_dirs.is_empty() {
            return Err(InvoiceError::InvalidConfig(
                "at least one input directory is required".into(),
            ));
        }
        if c.extensions.is_empty() {
            return Err(InvoiceError::InvalidConfig(
                "at least one file extension is required".into(),
            ));
        }
        c.extraction_field_schema
            .validate()
            .map_err(InvoiceError::InvalidConfig)?;
        Ok(self.config)
    }
}

/// On-disk shape of the TOML configuration. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    input_dirs: Option<Vec<PathBuf>>,
    optional_input_dirs: Option<Vec<PathBuf>>,
    output_dir: Option<PathBuf>,
    store_path: Option<PathBuf>,
    render_density_dpi: Option<u32>,
    max_rendered_pixels: Option<u32>,
    force_reprocess: Option<bool>,
    extraction_field_schema: Option<Vec<FieldSpec>>,
    service_timeout_seconds: Option<u64>,
    max_attempts: Option<u32>,
    retry_backoff_ms: Option<u64>,
    extensions: Option<Vec<String>>,
    recursive: Option<bool>,
    keep_page_images: Option<bool>,
    snapshot_exports: Option<bool>,
    provider: Option<String>,
    model: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<usize>,
    system_prompt: Option<String>,
}

impl FileConfig {
    fn apply(self, mut b: PipelineConfigBuilder, base: &Path) -> PipelineConfigBuilder {
        let rel = |p: PathBuf| if p.is_absolute() { p } else { base.join(p) };

        if let Some(dirs) = self.input_dirs {
            b = b.input_dirs(dirs.into_iter().map(rel));
        }
        if let Some(dirs) = self.optional_input_dirs {
            b = b.optional_input_dirs(dirs.into_iter().map(rel));
        }
        if let Some(d) = self.output_dir {
            b = b.output_dir(rel(d));
        }
        if let Some(p) = self.store_path {
            b = b.store_path(rel(p));
        }
        if let Some(v) = self.render_density_dpi {
            b = b.render_density_dpi(v);
        }
        if let Some(v) = self.max_rendered_pixels {
            b = b.max_rendered_pixels(v);
        }
        if let Some(v) = self.force_reprocess {
            b = b.force_reprocess(v);
        }
        if let Some(fields) = self.extraction_field_schema {
            b = b.extraction_field_schema(FieldSchema::new(fields));
        }
        if let Some(v) = self.service_timeout_seconds {
            b = b.service_timeout_seconds(Some(v));
        }
        if let Some(v) = self.max_attempts {
            b = b.max_attempts(v);
        }
        if let Some(v) = self.retry_backoff_ms {
            b = b.retry_backoff_ms(v);
        }
        if let Some(v) = self.extensions {
            b = b.extensions(v);
        }
        if let Some(v) = self.recursive {
            b = b.recursive(v);
        }
        if let Some(v) = self.keep_page_images {
            b = b.keep_page_images(v);
        }
        if let Some(v) = self.snapshot_exports {
            b = b.snapshot_exports(v);
        }
        if let Some(v) = self.provider {
            b = b.provider_name(v);
        }
        if let Some(v) = self.model {
            b = b.model(v);
        }
        if let Some(v) = self.temperature {
            b = b.temperature(v);
        }
        if let Some(v) = self.max_tokens {
            b = b.max_tokens(v);
        }
        if let Some(v) = self.system_prompt {
            b = b.system_prompt(v);
        }
        b
    }
}
