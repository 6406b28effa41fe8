//! CLI binary for edgequake-invoice.
//!
//! A thin shim over the library crate that maps a config file plus CLI flags
//! to `PipelineConfig`, runs the pipeline and prints the run summary.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_invoice::{
    export_only, run, PipelineConfig, ProgressCallback, RunProgressCallback, RunSummary,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar for the run, one log line per document.
struct CliProgressCallback {
    bar: ProgressBar,
    /// Start of the document currently being processed.
    started: Mutex<Option<Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} files  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        bar.set_style(style);
        bar.set_prefix("Extracting");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            started: Mutex::new(None),
            errors: AtomicUsize::new(0),
        })
    }

    fn elapsed_secs(&self) -> f64 {
        self.started
            .lock()
            .unwrap()
            .take()
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

impl RunProgressCallback for CliProgressCallback {
    fn on_run_start(&self, total_documents: usize) {
        self.bar.set_length(total_documents as u64);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Found {total_documents} candidate files…"))
        ));
    }

    fn on_document_start(&self, _index: usize, _total: usize, path: &Path) {
        *self.started.lock().unwrap() = Some(Instant::now());
        self.bar.set_message(display_name(path));
    }

    fn on_document_skipped(&self, index: usize, total: usize, path: &Path) {
        self.started.lock().unwrap().take();
        self.bar.println(format!(
            "  {} {:>3}/{:<3}  {:<40}  {}",
            dim("↷"),
            index,
            total,
            display_name(path),
            dim("already processed"),
        ));
        self.bar.inc(1);
    }

    fn on_document_complete(&self, index: usize, total: usize, path: &Path, fields_found: usize) {
        self.bar.println(format!(
            "  {} {:>3}/{:<3}  {:<40}  {}  {}",
            green("✓"),
            index,
            total,
            display_name(path),
            dim(&format!("{fields_found:>2} fields")),
            dim(&format!("{:.1}s", self.elapsed_secs())),
        ));
        self.bar.inc(1);
    }

    fn on_document_error(&self, index: usize, total: usize, path: &Path, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);

        // Truncate very long error messages to keep output tidy.
        let msg = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };

        self.bar.println(format!(
            "  {} {:>3}/{:<3}  {:<40}  {}  {}",
            red("✗"),
            index,
            total,
            display_name(path),
            red(&msg),
            dim(&format!("{:.1}s", self.elapsed_secs())),
        ));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, _summary: &RunSummary) {
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Process every bill under ./data and ./data/invoices, write store + CSVs to ./outputs
  invoice-extract

  # Several input directories, custom output directory
  invoice-extract bills/2023 bills/2024 -o reports

  # Settings from a TOML file, CLI flags override it
  invoice-extract --config invoices.toml

  # Re-extract everything, keep the rendered pages for review
  invoice-extract --force --keep-pages

  # Rewrite the CSVs from the existing store, no API calls
  invoice-extract --export-only

  # Machine-readable run summary
  invoice-extract --json > summary.json

OUTPUTS (under --output-dir):
  invoices.sqlite               audit store (documents + extraction records)
  invoices_staging_pretty.csv   one row per processed bill, amounts at 2 dp
  invoices_staging.csv          every field at full precision + diagnostics
  invoices_raw.csv              every file seen, including failures
  pages/                        rendered page PNGs (--keep-pages)

EXIT STATUS:
  0  every file was extracted or cleanly skipped
  1  a file failed, the run was aborted (quota), or a fatal error occurred

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to an existing libpdfium; skips auto-download
"#;

/// Extract structured fields from utility invoices using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "invoice-extract",
    version,
    about = "Extract structured fields from utility invoices using Vision LLMs",
    long_about = "Render every PDF or scanned bill in the input directories, ask a Vision \
Language Model to fill the invoice field schema, record the results in a local SQLite audit \
store and export review-ready CSV files. Files already processed are skipped on later runs.",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Input directories to scan (default: data, plus data/invoices when present).
    inputs: Vec<PathBuf>,

    /// TOML config file; CLI flags override its values.
    #[arg(short, long, env = "INVOICE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for the store and the CSV exports (default: outputs).
    #[arg(short, long, env = "INVOICE_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// SQLite store path (default: <output-dir>/invoices.sqlite).
    #[arg(long, env = "INVOICE_STORE")]
    store: Option<PathBuf>,

    /// Rendering DPI (72–600, default 300).
    #[arg(long, env = "INVOICE_DPI",
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: Option<u32>,

    /// Re-extract files that were already processed.
    #[arg(long, env = "INVOICE_FORCE")]
    force: bool,

    /// Per-call extraction timeout in seconds; 0 disables it (default 120).
    #[arg(long, env = "INVOICE_TIMEOUT")]
    timeout: Option<u64>,

    /// LLM model ID (e.g. gpt-4.1-nano, gpt-4.1, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Extraction attempts per file when the service is unavailable (default 3).
    #[arg(long, env = "INVOICE_MAX_ATTEMPTS",
          value_parser = clap::value_parser!(u32).range(1..))]
    max_attempts: Option<u32>,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, env = "INVOICE_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Save rendered pages as PNG under <output-dir>/pages/.
    #[arg(long, env = "INVOICE_KEEP_PAGES")]
    keep_pages: bool,

    /// Also write a timestamped copy of the staging export.
    #[arg(long, env = "INVOICE_SNAPSHOT")]
    snapshot: bool,

    /// Descend into subdirectories of the input directories.
    #[arg(short, long, env = "INVOICE_RECURSIVE")]
    recursive: bool,

    /// Only rewrite the CSV exports from the existing store.
    #[arg(long)]
    export_only: bool,

    /// Print the run summary as JSON on stdout.
    #[arg(long, env = "INVOICE_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "INVOICE_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "INVOICE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "INVOICE_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active;
    // the bar provides all the feedback that matters to the user.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.export_only;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn RunProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb).await?;

    // ── Export-only mode ─────────────────────────────────────────────────
    if cli.export_only {
        let paths = export_only(&config).await.context("Export failed")?;
        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&paths).context("Failed to serialise export paths")?
            );
        } else if !cli.quiet {
            eprintln!("{} Exports rewritten", green("✔"));
            for p in [&paths.pretty, &paths.staging, &paths.audit] {
                eprintln!("   {}", bold(&p.display().to_string()));
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    ensure_pdf_engine(cli.quiet);

    // ── Run pipeline ─────────────────────────────────────────────────────
    let summary = run(&config).await.context("Extraction run failed")?;

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("Failed to serialise summary")?
        );
    } else if !cli.quiet {
        print_summary(&summary);
    }

    Ok(if summary.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Make sure the pdfium engine is available before the first PDF.
///
/// Failure is not fatal here: scanned images still work, and each PDF is
/// then reported as `RenderingUnavailable` in the summary.
fn ensure_pdf_engine(quiet: bool) {
    if pdfium_auto::is_pdfium_cached() {
        return;
    }

    let result = if quiet {
        tokio::task::block_in_place(|| pdfium_auto::ensure_pdfium_library(None))
    } else {
        let dl_bar = ProgressBar::new(0);
        dl_bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  \
                 [{bar:42.green/238}] {bytes}/{total_bytes}  ETA {eta_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  "),
        );
        dl_bar.set_prefix("PDF engine");
        dl_bar.enable_steady_tick(Duration::from_millis(80));

        let bar = dl_bar.clone();
        // block_in_place keeps the closure borrow valid while the blocking
        // download runs off the async executor's hot path.
        let result = tokio::task::block_in_place(|| {
            pdfium_auto::ensure_pdfium_library(Some(&|downloaded, total| {
                if let Some(t) = total {
                    if bar.length().unwrap_or(0) != t {
                        bar.set_length(t);
                    }
                }
                bar.set_position(downloaded);
            }))
        });
        dl_bar.finish_and_clear();
        result
    };

    if let Err(e) = result {
        tracing::warn!("PDFium engine unavailable, PDFs will fail to render: {}", e);
    }
}

fn print_summary(summary: &RunSummary) {
    let mark = if summary.is_clean() {
        green("✔")
    } else if summary.aborted.is_some() || (summary.processed == 0 && summary.failed > 0) {
        red("✘")
    } else {
        cyan("⚠")
    };
    eprintln!(
        "{}  {} processed  {} skipped  {} failed  {}",
        mark,
        bold(&summary.processed.to_string()),
        summary.skipped,
        if summary.failed > 0 {
            red(&summary.failed.to_string())
        } else {
            summary.failed.to_string()
        },
        dim(&format!("{}ms", summary.duration_ms)),
    );

    for failure in &summary.failures {
        eprintln!(
            "   {} {}  {}",
            red("✗"),
            failure.path.display(),
            dim(&failure.reason)
        );
    }
    if let Some(ref abort) = summary.aborted {
        eprintln!(
            "   {} run stopped at {}  {}",
            red("■"),
            abort.path.display(),
            red(&abort.reason)
        );
    }
    if let Some(ref exports) = summary.exports {
        eprintln!("   exports → {}", bold(&exports.pretty.display().to_string()));
    }
}

/// Map the optional config file and CLI args to `PipelineConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let mut builder = match cli.config {
        Some(ref path) => PipelineConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => PipelineConfig::builder(),
    };

    if !cli.inputs.is_empty() {
        builder = builder.input_dirs(cli.inputs.iter().cloned());
    }
    if let Some(ref dir) = cli.output_dir {
        builder = builder.output_dir(dir);
    }
    if let Some(ref store) = cli.store {
        builder = builder.store_path(store);
    }
    if let Some(dpi) = cli.dpi {
        builder = builder.render_density_dpi(dpi);
    }
    if cli.force {
        builder = builder.force_reprocess(true);
    }
    if let Some(secs) = cli.timeout {
        builder = builder.service_timeout_seconds(Some(secs));
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(n) = cli.max_attempts {
        builder = builder.max_attempts(n);
    }
    if let Some(ref path) = cli.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }
    if cli.keep_pages {
        builder = builder.keep_page_images(true);
    }
    if cli.snapshot {
        builder = builder.snapshot_exports(true);
    }
    if cli.recursive {
        builder = builder.recursive(true);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
