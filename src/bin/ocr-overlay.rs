//! CLI binary for ocr-overlay.
//!
//! A thin shim over the library crate that maps CLI flags to `OcrConfig`,
//! picks the mode (searchable PDF, PDF directory, JSON export, image batch,
//! external engine) and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use ocr_overlay::export::recognize_images;
use ocr_overlay::external::{parse_plugins, DEFAULT_PROGRAM};
use ocr_overlay::pipeline::input::{batch_output_path, DEFAULT_IMAGE_EXTENSIONS};
use ocr_overlay::pipeline::render::inspect_document;
use ocr_overlay::{
    extract_text, languages_from_tesseract, make_searchable, make_searchable_dir, run_ocrmypdf,
    write_json, ExportedPage, ExternalOcrParams, JobProgressCallback, JobReport, OcrConfig,
    PageSelection, ProgressCallback, RecognitionLevel,
};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
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

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Live progress bar plus one log line per settled page. Pages settle in
/// whatever order the service answers.
struct CliProgressCallback {
    bar: ProgressBar,
    dispatched_at: Mutex<HashMap<usize, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Opening input…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            dispatched_at: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.reset();
        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.enable_steady_tick(Duration::from_millis(80));
        self.bar.set_prefix("Recognising");
        self.bar.reset_eta();
    }

    fn elapsed_secs(&self, page: usize) -> f64 {
        self.dispatched_at
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&page)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl JobProgressCallback for CliProgressCallback {
    fn on_job_start(&self, total_pages: usize) {
        self.activate_bar(total_pages);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Recognising {total_pages} pages…"))
        ));
    }

    fn on_page_dispatched(&self, page: usize, _total: usize) {
        self.dispatched_at
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(page, Instant::now());
        self.bar.set_message(format!("page {page}"));
    }

    fn on_page_complete(&self, page: usize, total: usize, items: usize) {
        let secs = self.elapsed_secs(page);
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {:<10}  {}",
            green("✓"),
            page,
            total,
            dim(&format!("{items:>4} runs")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page: usize, total: usize, error: &str) {
        let secs = self.elapsed_secs(page);
        self.errors.fetch_add(1, Ordering::SeqCst);

        let msg: String = if error.chars().count() > 80 {
            let head: String = error.chars().take(79).collect();
            format!("{head}\u{2026}")
        } else {
            error.to_string()
        };

        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}  {}",
            red("✗"),
            page,
            total,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_job_complete(&self, total_pages: usize, success_count: usize) {
        let failed = total_pages.saturating_sub(success_count);
        self.bar.finish_and_clear();

        if failed == 0 {
            eprintln!(
                "{} {} pages recognised",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} pages recognised  ({} failed)",
                if failed == total_pages {
                    red("✘")
                } else {
                    cyan("⚠")
                },
                bold(&success_count.to_string()),
                total_pages,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Searchable PDF next to the input (scan_ocr.pdf)
  ocr-overlay scan.pdf

  # Selected pages only, explicit output
  ocr-overlay --pages 1-3,7 --skip-pages 2 scan.pdf -o searchable.pdf

  # Every PDF in a directory into out/<name>_ocr.pdf
  ocr-overlay scans/ -o out/

  # Normalized-coordinate JSON instead of a PDF
  ocr-overlay --json scan.pdf -o text.json

  # A directory of images
  ocr-overlay --images photos/ -o photos.json

  # Delegate the whole PDF to ocrmypdf
  ocr-overlay --engine ocrmypdf --lang eng+chi_sim scan.pdf

ENVIRONMENT VARIABLES:
  OCR_OVERLAY_SERVICE     Recognition service executable (default: ocrbridge)
  PDFIUM_LIB_PATH         Path to an existing libpdfium (file or directory)
  RUST_LOG                Log filter, e.g. ocr_overlay=debug
"#;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum EngineArg {
    /// Built-in pipeline over the recognition service.
    Service,
    /// Hand the whole PDF to ocrmypdf.
    Ocrmypdf,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum LevelArg {
    Accurate,
    Fast,
}

impl From<LevelArg> for RecognitionLevel {
    fn from(v: LevelArg) -> Self {
        match v {
            LevelArg::Accurate => RecognitionLevel::Accurate,
            LevelArg::Fast => RecognitionLevel::Fast,
        }
    }
}

/// Make scanned PDFs searchable with an invisible OCR text layer.
#[derive(Parser, Debug)]
#[command(
    name = "ocr-overlay",
    version,
    about = "Make scanned PDFs searchable with an invisible OCR text layer",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// PDF file, directory of PDFs, or (with --images) an image or image directory.
    input: PathBuf,

    /// Output file (or directory when the input is a directory of PDFs).
    #[arg(short, long, env = "OCR_OVERLAY_OUTPUT")]
    output: Option<PathBuf>,

    /// Rendering DPI (72–1200).
    #[arg(long, env = "OCR_OVERLAY_DPI", default_value_t = 300,
          value_parser = clap::value_parser!(u32).range(72..=1200))]
    dpi: u32,

    /// Longest rendered edge in pixels.
    #[arg(long, env = "OCR_OVERLAY_MAX_PIXELS", default_value_t = 10_000)]
    max_pixels: u32,

    /// Recognise each page's full-page embedded image directly, rendering
    /// only pages without one.
    #[arg(long, env = "OCR_OVERLAY_EMBEDDED_IMAGES")]
    embedded_images: bool,

    /// Parallel render workers (default: number of CPUs).
    #[arg(short, long, env = "OCR_OVERLAY_WORKERS")]
    workers: Option<usize>,

    /// Pages to process, e.g. 1,3,5-10 (default: all).
    #[arg(long, env = "OCR_OVERLAY_PAGES")]
    pages: Option<String>,

    /// Pages to leave untouched, same syntax as --pages.
    #[arg(long, env = "OCR_OVERLAY_SKIP_PAGES")]
    skip_pages: Option<String>,

    /// Tesseract-style language spec (eng+chi_sim). Passed to ocrmypdf and
    /// mapped to BCP-47 tags for the service when --languages is not given.
    #[arg(long, env = "OCR_OVERLAY_LANG")]
    lang: Option<String>,

    /// Comma-separated BCP-47 languages for the service (default: zh-Hans,zh-Hant,en-US).
    #[arg(long, env = "OCR_OVERLAY_LANGUAGES", value_delimiter = ',')]
    languages: Vec<String>,

    /// Recognition engine for PDFs.
    #[arg(long, env = "OCR_OVERLAY_ENGINE", value_enum, default_value = "service")]
    engine: EngineArg,

    /// Recognition service executable.
    #[arg(long, env = "OCR_OVERLAY_SERVICE", default_value = "ocrbridge")]
    service_bin: PathBuf,

    /// Recognition level: accurate or fast.
    #[arg(long, env = "OCR_OVERLAY_LEVEL", value_enum, default_value = "accurate")]
    recognition_level: LevelArg,

    /// Ask the service not to use the GPU / neural engine.
    #[arg(long, env = "OCR_OVERLAY_CPU_ONLY")]
    uses_cpu_only: bool,

    /// Disable automatic language detection in the service.
    #[arg(long, env = "OCR_OVERLAY_NO_AUTO_DETECT")]
    no_auto_detect_language: bool,

    /// Treat the input as an image or a directory of images; output is JSON.
    #[arg(long)]
    images: bool,

    /// Image extensions accepted with --images.
    #[arg(long, env = "OCR_OVERLAY_IMAGE_EXTS", value_delimiter = ',',
          default_values_t = DEFAULT_IMAGE_EXTENSIONS.map(String::from))]
    image_exts: Vec<String>,

    /// Comma-separated ocrmypdf plugins (default: ocrmypdf_appleocr).
    #[arg(long, env = "OCR_OVERLAY_PLUGINS")]
    plugins: Option<String>,

    /// ocrmypdf: OCR pages that already contain text.
    #[arg(long, conflicts_with = "skip_text")]
    force_ocr: bool,

    /// ocrmypdf: skip pages that already contain text.
    #[arg(long)]
    skip_text: bool,

    /// Seconds to wait for one page's result.
    #[arg(long, env = "OCR_OVERLAY_PAGE_TIMEOUT", default_value_t = 120)]
    page_timeout: u64,

    /// Seconds allowed for the whole recognition phase.
    #[arg(long, env = "OCR_OVERLAY_JOB_TIMEOUT", default_value_t = 3600)]
    job_timeout: u64,

    /// Seconds to wait for outstanding results when shutting the service down.
    #[arg(long, env = "OCR_OVERLAY_DRAIN_TIMEOUT", default_value_t = 5)]
    drain_timeout: u64,

    /// TrueType font for the invisible text layer.
    #[arg(long, env = "OCR_OVERLAY_FONT")]
    font: Option<PathBuf>,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "OCR_OVERLAY_PASSWORD")]
    password: Option<String>,

    /// Write the job report as JSON to this file.
    #[arg(long, env = "OCR_OVERLAY_REPORT")]
    report: Option<PathBuf>,

    /// Export recognised text as normalized-coordinate JSON instead of a PDF.
    #[arg(long)]
    json: bool,

    /// Print PDF page count and geometry only.
    #[arg(long)]
    inspect_only: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "OCR_OVERLAY_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "OCR_OVERLAY_QUIET")]
    quiet: bool,

    /// Disable progress bar.
    #[arg(long, env = "OCR_OVERLAY_NO_PROGRESS")]
    no_progress: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet && !cli.no_progress && !cli.inspect_only;
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

    // ── Inspect-only mode ────────────────────────────────────────────────
    if cli.inspect_only {
        let info = inspect_document(&cli.input, cli.password.as_deref())
            .await
            .context("Failed to inspect PDF")?;
        println!("File:         {}", cli.input.display());
        if let Some(ref t) = info.title {
            println!("Title:        {}", t);
        }
        if let Some(ref a) = info.author {
            println!("Author:       {}", a);
        }
        println!("Pages:        {}", info.page_count);
        println!("PDF Version:  {}", info.pdf_version);
        if let Some(ref p) = info.producer {
            println!("Producer:     {}", p);
        }
        for (i, g) in info.pages.iter().enumerate() {
            println!(
                "  page {:>4}: {:.1} × {:.1} pt, rotated {}°",
                i + 1,
                g.width,
                g.height,
                g.rotation.degrees()
            );
        }
        return Ok(());
    }

    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new_dynamic() as Arc<dyn JobProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;

    // ── Image batch ──────────────────────────────────────────────────────
    if cli.images {
        let pages = recognize_images(&cli.input, &cli.image_exts, &config)
            .await
            .context("Image recognition failed")?;
        return emit_json(&cli, &pages).await;
    }

    // ── Directory of PDFs ────────────────────────────────────────────────
    if cli.input.is_dir() {
        let out_dir = cli.output.clone().unwrap_or_else(|| cli.input.clone());
        if cli.engine == EngineArg::Ocrmypdf {
            let pdfs = ocr_overlay::pipeline::input::collect_pdfs(&cli.input)?;
            for pdf in pdfs {
                let output = batch_output_path(&pdf, &out_dir);
                run_external(&cli, &pdf, &output).await?;
            }
            return Ok(());
        }

        let results = make_searchable_dir(&cli.input, &out_dir, &config)
            .await
            .context("Batch processing failed")?;
        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        if !cli.quiet {
            for (pdf, result) in &results {
                match result {
                    Ok(report) => print_summary(report),
                    Err(e) => eprintln!("{} {}  {}", red("✘"), pdf.display(), red(&e.to_string())),
                }
            }
        }
        if let Some(path) = &cli.report {
            let reports: Vec<&JobReport> = results.iter().filter_map(|(_, r)| r.as_ref().ok()).collect();
            write_report(path, &reports).await?;
        }
        if failed > 0 {
            anyhow::bail!("{failed}/{} files failed", results.len());
        }
        return Ok(());
    }

    // ── JSON export of a PDF ─────────────────────────────────────────────
    if cli.json {
        let pages = extract_text(&cli.input, &config)
            .await
            .context("Recognition failed")?;
        return emit_json(&cli, &pages).await;
    }

    let output = cli
        .output
        .clone()
        .unwrap_or_else(|| default_output(&cli.input));

    // ── External engine ──────────────────────────────────────────────────
    if cli.engine == EngineArg::Ocrmypdf {
        run_external(&cli, &cli.input, &output).await?;
        if !cli.quiet {
            eprintln!("{}  →  {}", green("✔"), bold(&output.display().to_string()));
        }
        return Ok(());
    }

    // ── Searchable PDF ───────────────────────────────────────────────────
    let report = make_searchable(&cli.input, &output, &config)
        .await
        .context("OCR failed")?;
    if !cli.quiet {
        print_summary(&report);
    }
    if let Some(path) = &cli.report {
        write_report(path, &report).await?;
    }
    Ok(())
}

/// Map CLI args to `OcrConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<OcrConfig> {
    let languages = if !cli.languages.is_empty() {
        cli.languages.clone()
    } else if let Some(lang) = &cli.lang {
        languages_from_tesseract(lang)
    } else {
        Vec::new()
    };

    let mut builder = OcrConfig::builder()
        .dpi(cli.dpi)
        .max_rendered_pixels(cli.max_pixels)
        .embedded_images(cli.embedded_images)
        .service_path(&cli.service_bin)
        .recognition_level(cli.recognition_level.into())
        .uses_cpu_only(cli.uses_cpu_only)
        .auto_detect_language(!cli.no_auto_detect_language)
        .page_timeout_secs(cli.page_timeout)
        .job_timeout_secs(cli.job_timeout)
        .drain_timeout_secs(cli.drain_timeout);

    if let Some(n) = cli.workers {
        builder = builder.workers(n);
    }
    if !languages.is_empty() {
        builder = builder.languages(languages);
    }
    if let Some(pages) = &cli.pages {
        builder = builder.pages(pages.clone());
    }
    if let Some(skip) = &cli.skip_pages {
        builder = builder.skip_pages(skip.clone());
    }
    if let Some(font) = &cli.font {
        builder = builder.font_path(font);
    }
    if let Some(pwd) = &cli.password {
        builder = builder.password(pwd.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// `<dir>/<stem>_ocr.pdf` next to the input.
fn default_output(input: &Path) -> PathBuf {
    let dir = input.parent().unwrap_or_else(|| Path::new("."));
    batch_output_path(input, dir)
}

async fn run_external(cli: &Cli, input: &Path, output: &Path) -> Result<()> {
    let mut params = ExternalOcrParams::new(input, output);
    params.pages = cli
        .pages
        .as_deref()
        .map(PageSelection::parse)
        .transpose()
        .context("Invalid --pages")?;
    if let Some(expr) = cli.skip_pages.as_deref() {
        let skip = PageSelection::parse(expr).context("Invalid --skip-pages")?;
        let info = inspect_document(input, cli.password.as_deref())
            .await
            .with_context(|| format!("Cannot read {}", input.display()))?;
        params.skip_pages(&skip, info.page_count)?;
    }
    params.language = cli.lang.clone();
    params.force_ocr = cli.force_ocr;
    params.skip_text = cli.skip_text;
    params.plugins = parse_plugins(cli.plugins.as_deref());
    params.jobs = cli.workers;

    run_ocrmypdf(Path::new(DEFAULT_PROGRAM), &params)
        .await
        .with_context(|| format!("ocrmypdf failed on {}", input.display()))
}

async fn emit_json(cli: &Cli, pages: &[ExportedPage]) -> Result<()> {
    match &cli.output {
        Some(path) => {
            write_json(pages, path).await?;
            if !cli.quiet {
                eprintln!("{}  →  {}", green("✔"), bold(&path.display().to_string()));
            }
        }
        None => {
            let json = serde_json::to_string_pretty(pages).context("Failed to serialise output")?;
            println!("{json}");
        }
    }
    Ok(())
}

async fn write_report<T: serde::Serialize + ?Sized>(path: &Path, report: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialise report")?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write report to {}", path.display()))
}

fn print_summary(report: &JobReport) {
    let total = report.pages.len();
    eprintln!(
        "{}  {}/{} pages  {}ms  →  {}",
        if report.failed.is_empty() {
            green("✔")
        } else {
            cyan("⚠")
        },
        report.processed.len(),
        total,
        report.timings.total_ms,
        bold(
            &report
                .output
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        ),
    );
    if !report.failed.is_empty() {
        let failed = PageSelection::from_pages(report.failed.iter().copied());
        eprintln!("   failed pages: {}", red(&failed.to_range_string()));
    }
    if report.anomalies + report.protocol_errors > 0 {
        eprintln!(
            "   {}",
            dim(&format!(
                "{} protocol anomalies, {} malformed lines",
                report.anomalies, report.protocol_errors
            ))
        );
    }
}
