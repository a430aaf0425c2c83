//! Job orchestration: page selection → render → recognise → compose.
//!
//! ```text
//! Parsing ─▶ Dispatching ─▶ AwaitingResults ─┬─▶ Composing ─▶ Done
//!                                            └─▶ PartiallyFailed ─▶ Composing
//!    (any non-terminal state) ─▶ Failed
//! ```
//!
//! Rendering, dispatch and result collection overlap: a page is sent to the
//! service as soon as its raster is ready, and its result is awaited on its
//! own slot while later pages are still rendering. Page failures are
//! recorded and the job carries on; only job-scoped failures (bad input,
//! bad range, service missing, channel lost before any page completed) end
//! in `Failed`, and those write nothing.

use crate::channel::{ChannelSummary, RecognitionChannel};
use crate::config::{OcrConfig, RecognitionOptions};
use crate::correlator::{deadline_after, PageOutcome};
use crate::error::{OcrError, PageError};
use crate::pages::PageSelection;
use crate::pipeline::input::{batch_output_path, collect_pdfs, resolve_pdf};
use crate::pipeline::overlay::{compose_document, plan_page, PageOverlay};
use crate::pipeline::render::{inspect_document, Rasterizer, RenderJob};
use crate::progress::ProgressCallback;
use crate::protocol::RecognitionRequest;
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::time::Instant;
use tracing::{error, info, warn};

// ── State machine ────────────────────────────────────────────────────────

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Parsing,
    Dispatching,
    AwaitingResults,
    PartiallyFailed,
    Composing,
    Done,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Done | Failed, _) => false,
            (_, Failed) => true,
            (Parsing, Dispatching)
            | (Dispatching, AwaitingResults)
            | (AwaitingResults, Composing)
            | (AwaitingResults, PartiallyFailed)
            | (PartiallyFailed, Composing)
            | (Composing, Done) => true,
            _ => false,
        }
    }
}

/// Tracks the current state and every state visited.
#[derive(Debug, Clone)]
pub struct JobTracker {
    history: Vec<JobState>,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTracker {
    pub fn new() -> Self {
        Self {
            history: vec![JobState::Parsing],
        }
    }

    pub fn state(&self) -> JobState {
        *self.history.last().unwrap_or(&JobState::Parsing)
    }

    pub fn history(&self) -> &[JobState] {
        &self.history
    }

    /// Move to `next`; an illegal transition is an internal error.
    pub fn advance(&mut self, next: JobState) -> Result<(), OcrError> {
        let current = self.state();
        if !current.can_transition_to(next) {
            return Err(OcrError::Internal(format!(
                "illegal job transition {:?} → {:?}",
                current, next
            )));
        }
        self.history.push(next);
        Ok(())
    }

    /// Move to `Failed` unless already terminal.
    pub fn fail(&mut self) {
        if !self.state().is_terminal() {
            self.history.push(JobState::Failed);
        }
    }
}

// ── Reports ──────────────────────────────────────────────────────────────

/// Per-page result as shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PageStatus {
    Ok { items: usize },
    Failed { kind: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageReport {
    pub page: usize,
    #[serde(flatten)]
    pub status: PageStatus,
}

/// Wall-clock milliseconds spent per phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobTimings {
    pub recognition_ms: u64,
    pub compose_ms: u64,
    pub total_ms: u64,
}

/// Outcome of a job that reached a terminal state without a fatal error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub input: PathBuf,
    pub output: Option<PathBuf>,
    pub state: JobState,
    pub transitions: Vec<JobState>,
    /// Selected pages as a compact range string.
    pub selection: String,
    pub pages: Vec<PageReport>,
    /// Pages that received a text layer.
    pub processed: Vec<usize>,
    pub failed: Vec<usize>,
    /// Responses for unknown or already-settled pages.
    pub anomalies: usize,
    /// Malformed or unattributable lines from the service.
    pub protocol_errors: usize,
    pub timings: JobTimings,
}

impl JobReport {
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }

    /// Treat any page failure as an error.
    pub fn into_result(self) -> Result<JobReport, OcrError> {
        if self.failed.is_empty() {
            Ok(self)
        } else {
            Err(OcrError::PartialFailure {
                success: self.processed.len(),
                failed: self.failed.len(),
                total: self.pages.len(),
            })
        }
    }
}

fn page_reports(outcomes: &BTreeMap<usize, Result<usize, PageError>>) -> Vec<PageReport> {
    outcomes
        .iter()
        .map(|(&page, outcome)| PageReport {
            page,
            status: match outcome {
                Ok(items) => PageStatus::Ok { items: *items },
                Err(e) => PageStatus::Failed {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                },
            },
        })
        .collect()
}

// ── Recognition round ────────────────────────────────────────────────────

/// Every selected page's outcome after one pass through the service.
#[derive(Debug, Clone, Default)]
pub struct RecognitionRound {
    pub outcomes: BTreeMap<usize, PageOutcome>,
    pub channel: ChannelSummary,
}

impl RecognitionRound {
    pub fn success_count(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_success()).count()
    }

    /// The channel died before a single page completed: nothing to write.
    pub fn is_fatal(&self) -> bool {
        self.channel.lost && self.success_count() == 0
    }

    /// Fail with [`OcrError::ChannelClosed`] when [`Self::is_fatal`].
    pub fn check_fatal(self) -> Result<Self, OcrError> {
        if self.is_fatal() {
            let pending = self.outcomes.len();
            error!("Recognition channel lost before any page completed");
            return Err(OcrError::ChannelClosed { pending });
        }
        Ok(self)
    }
}

/// Request for `job` with the configured recognition options.
pub fn build_request(job: &RenderJob, options: &RecognitionOptions) -> RecognitionRequest {
    RecognitionRequest {
        image_path: job.image_path.clone(),
        page_index: job.page_index,
        width: job.pixel_width,
        height: job.pixel_height,
        dpi: job.dpi,
        languages: options.languages.clone(),
        recognition_level: options.level,
        uses_cpu_only: options.uses_cpu_only,
        auto_detect_language: options.auto_detect_language,
    }
}

struct Tally {
    outcomes: BTreeMap<usize, PageOutcome>,
    total: usize,
    progress: ProgressCallback,
}

impl Tally {
    fn record(&mut self, outcome: PageOutcome) {
        let page = outcome.page_index();
        match &outcome {
            PageOutcome::Recognized(r) => {
                self.progress.on_page_complete(page, self.total, r.items.len())
            }
            PageOutcome::Failed(e) => {
                warn!("{}", e);
                self.progress.on_page_error(page, self.total, &e.to_string());
            }
        }
        self.outcomes.insert(page, outcome);
    }
}

/// Send every rendered page in `jobs` through `channel` and collect one
/// outcome per page in `selection`.
///
/// Pages are dispatched as they finish rendering and awaited concurrently;
/// each wait is bounded by the page timeout and the job timeout. Rasters are
/// released as soon as their page settles. Pages that never made it out of
/// the render stream before the job deadline are reported as timed out.
pub async fn recognize_pages<S>(
    channel: &RecognitionChannel,
    jobs: S,
    selection: &PageSelection,
    config: &OcrConfig,
) -> BTreeMap<usize, PageOutcome>
where
    S: Stream<Item = Result<RenderJob, PageError>>,
{
    let total = selection.len();
    let page_timeout = config.page_timeout();
    let job_timeout = config.job_timeout();
    let deadline = deadline_after(Instant::now(), job_timeout);

    let mut tally = Tally {
        outcomes: BTreeMap::new(),
        total,
        progress: config.progress(),
    };
    let mut waiting = FuturesUnordered::new();

    let jobs = jobs.fuse();
    tokio::pin!(jobs);
    let job_deadline = tokio::time::sleep_until(deadline);
    tokio::pin!(job_deadline);
    let mut dispatching = true;

    loop {
        tokio::select! {
            next = jobs.next(), if dispatching => match next {
                Some(Ok(job)) => {
                    let page = job.page_index;
                    match channel.submit(build_request(&job, &config.recognition)).await {
                        Ok(pending) => {
                            tally.progress.on_page_dispatched(page, total);
                            waiting.push(async move {
                                let outcome = pending.wait(page_timeout, Some(deadline)).await;
                                job.release().await;
                                outcome
                            });
                        }
                        Err(e) => {
                            job.release().await;
                            tally.record(PageOutcome::Failed(e));
                        }
                    }
                }
                Some(Err(e)) => tally.record(PageOutcome::Failed(e)),
                None => dispatching = false,
            },
            Some(outcome) = waiting.next(), if !waiting.is_empty() => tally.record(outcome),
            _ = &mut job_deadline, if dispatching => {
                warn!("Job deadline reached with pages still rendering");
                dispatching = false;
            }
            else => break,
        }
    }

    for page in selection.iter() {
        if !tally.outcomes.contains_key(&page) {
            tally.record(PageOutcome::Failed(PageError::Timeout {
                page,
                secs: job_timeout.as_secs(),
            }));
        }
    }
    tally.outcomes
}

/// Start the service, run `jobs` through it and shut it down again.
pub async fn run_recognition<S>(
    jobs: S,
    selection: &PageSelection,
    config: &OcrConfig,
) -> Result<RecognitionRound, OcrError>
where
    S: Stream<Item = Result<RenderJob, PageError>>,
{
    let channel = RecognitionChannel::spawn(&config.service_path)?;
    recognize_with(&channel, jobs, selection, config).await
}

/// [`run_recognition`] over an already-connected channel, which is closed
/// afterwards.
pub async fn recognize_with<S>(
    channel: &RecognitionChannel,
    jobs: S,
    selection: &PageSelection,
    config: &OcrConfig,
) -> Result<RecognitionRound, OcrError>
where
    S: Stream<Item = Result<RenderJob, PageError>>,
{
    let outcomes = recognize_pages(channel, jobs, selection, config).await;
    let summary = channel.close(config.drain_timeout()).await;
    RecognitionRound {
        outcomes,
        channel: summary,
    }
    .check_fatal()
}

// ── Searchable PDF ───────────────────────────────────────────────────────

/// Make `input` searchable, writing the result to `output`.
///
/// Pages that fail are copied through unchanged and listed in the report.
/// Returns `Err` only for job-scoped failures, in which case no output file
/// is written.
pub async fn make_searchable(
    input: &Path,
    output: &Path,
    config: &OcrConfig,
) -> Result<JobReport, OcrError> {
    make_searchable_inner(input, output, config, None).await
}

/// [`make_searchable`] over an already-connected channel.
pub async fn make_searchable_with(
    channel: RecognitionChannel,
    input: &Path,
    output: &Path,
    config: &OcrConfig,
) -> Result<JobReport, OcrError> {
    make_searchable_inner(input, output, config, Some(channel)).await
}

async fn make_searchable_inner(
    input: &Path,
    output: &Path,
    config: &OcrConfig,
    channel: Option<RecognitionChannel>,
) -> Result<JobReport, OcrError> {
    let started = Instant::now();
    let mut tracker = JobTracker::new();

    let result = run_job(input, output, config, channel, &mut tracker, started).await;
    if result.is_err() {
        tracker.fail();
        error!("Job failed for {} ({:?})", input.display(), tracker.history());
    }
    result
}

async fn run_job(
    input: &Path,
    output: &Path,
    config: &OcrConfig,
    channel: Option<RecognitionChannel>,
    tracker: &mut JobTracker,
    started: Instant,
) -> Result<JobReport, OcrError> {
    // ── Parsing ──
    let pdf = resolve_pdf(input)?;
    let info = inspect_document(&pdf, config.password.as_deref()).await?;
    let selection = config.resolve_selection(info.page_count)?;
    info!(
        "Selected pages {} of {} in {}",
        selection,
        info.page_count,
        pdf.display()
    );
    config.progress().on_job_start(selection.len());

    // ── Dispatching / AwaitingResults ──
    tracker.advance(JobState::Dispatching)?;
    let channel = match channel {
        Some(channel) => channel,
        None => RecognitionChannel::spawn(&config.service_path)?,
    };
    let scratch = tempfile::Builder::new()
        .prefix("ocr-overlay-")
        .tempdir()
        .map_err(|e| OcrError::Internal(format!("cannot create scratch directory: {e}")))?;
    let rasterizer = Rasterizer::new(&pdf, scratch.path(), config);
    tracker.advance(JobState::AwaitingResults)?;
    let round = recognize_with(
        &channel,
        rasterizer.render_stream(&selection),
        &selection,
        config,
    )
    .await?;
    let recognition_ms = started.elapsed().as_millis() as u64;

    // ── Planning ──
    let mut page_outcomes: BTreeMap<usize, Result<usize, PageError>> = BTreeMap::new();
    let mut overlays: BTreeMap<usize, PageOverlay> = BTreeMap::new();
    for (page, outcome) in round.outcomes {
        match outcome {
            PageOutcome::Recognized(recognized) => {
                let planned = info
                    .geometry(page)
                    .ok_or_else(|| PageError::Composition {
                        page,
                        detail: "page geometry unavailable".into(),
                    })
                    .and_then(|g| {
                        plan_page(&recognized, g, config.min_font_size, config.aspect_tolerance)
                    });
                match planned {
                    Ok(overlay) => {
                        page_outcomes.insert(page, Ok(overlay.runs.len()));
                        overlays.insert(page, overlay);
                    }
                    Err(e) => {
                        warn!("{}", e);
                        page_outcomes.insert(page, Err(e));
                    }
                }
            }
            PageOutcome::Failed(e) => {
                page_outcomes.insert(page, Err(e));
            }
        }
    }

    if page_outcomes.values().any(|o| o.is_err()) {
        tracker.advance(JobState::PartiallyFailed)?;
    }

    // ── Composing ──
    tracker.advance(JobState::Composing)?;
    let compose_started = Instant::now();
    let summary = compose_document(
        &pdf,
        output,
        config.password.as_deref(),
        overlays,
        config.font_path.as_deref(),
    )
    .await?;
    for e in summary.page_errors {
        page_outcomes.insert(e.page(), Err(e));
    }
    let compose_ms = compose_started.elapsed().as_millis() as u64;
    tracker.advance(JobState::Done)?;

    let failed: Vec<usize> = page_outcomes
        .iter()
        .filter(|(_, o)| o.is_err())
        .map(|(&p, _)| p)
        .collect();
    let processed: Vec<usize> = page_outcomes
        .iter()
        .filter(|(_, o)| o.is_ok())
        .map(|(&p, _)| p)
        .collect();

    config.progress().on_job_complete(selection.len(), processed.len());
    info!(
        "Done: {} pages overlaid, {} failed → {}",
        processed.len(),
        failed.len(),
        output.display()
    );

    Ok(JobReport {
        input: pdf,
        output: Some(output.to_path_buf()),
        state: tracker.state(),
        transitions: tracker.history().to_vec(),
        selection: selection.to_range_string(),
        pages: page_reports(&page_outcomes),
        processed,
        failed,
        anomalies: round.channel.anomalies,
        protocol_errors: round.channel.protocol_errors,
        timings: JobTimings {
            recognition_ms,
            compose_ms,
            total_ms: started.elapsed().as_millis() as u64,
        },
    })
}

/// Process every PDF in `input_dir` into `<output_dir>/<stem>_ocr.pdf`.
///
/// Each file is an independent job; one failing file does not stop the rest.
pub async fn make_searchable_dir(
    input_dir: &Path,
    output_dir: &Path,
    config: &OcrConfig,
) -> Result<Vec<(PathBuf, Result<JobReport, OcrError>)>, OcrError> {
    let pdfs = collect_pdfs(input_dir)?;
    info!("Found {} PDFs in {}", pdfs.len(), input_dir.display());

    let mut results = Vec::with_capacity(pdfs.len());
    for pdf in pdfs {
        let output = batch_output_path(&pdf, output_dir);
        let result = make_searchable(&pdf, &output, config).await;
        if let Err(e) = &result {
            error!("{}: {}", pdf.display(), e);
        }
        results.push((pdf, result));
    }
    Ok(results)
}
