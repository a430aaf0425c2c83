//! Delegation of the whole PDF path to the `ocrmypdf` command-line tool.
//!
//! The tool is a black box: it gets the input, output, page range, language
//! and plugin list, and either succeeds or fails. Nothing here looks inside
//! the document.

use crate::error::OcrError;
use crate::pages::PageSelection;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

/// Executable invoked when no other is configured.
pub const DEFAULT_PROGRAM: &str = "ocrmypdf";

/// Plugin loaded when the caller does not name any.
pub const DEFAULT_PLUGIN: &str = "ocrmypdf_appleocr";

/// Parameters of one `ocrmypdf` run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalOcrParams {
    pub input: PathBuf,
    pub output: PathBuf,
    pub pages: Option<PageSelection>,
    /// Tesseract-style language spec, e.g. `eng+chi_sim`.
    pub language: Option<String>,
    pub force_ocr: bool,
    pub skip_text: bool,
    pub plugins: Vec<String>,
    pub jobs: Option<usize>,
}

impl ExternalOcrParams {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            pages: None,
            language: None,
            force_ocr: false,
            skip_text: false,
            plugins: vec![DEFAULT_PLUGIN.to_string()],
            jobs: None,
        }
    }

    /// Drop `skip` from the page list.
    ///
    /// Without an explicit page list the run covers `total` pages, so the
    /// result always names the remaining pages.
    pub fn skip_pages(&mut self, skip: &PageSelection, total: usize) -> Result<(), OcrError> {
        let base = self.pages.take().unwrap_or_else(|| PageSelection::all(total));
        let remaining = base.without(skip);
        if remaining.is_empty() {
            return Err(OcrError::EmptySelection);
        }
        self.pages = Some(remaining);
        Ok(())
    }

    /// Command-line arguments, without the program name.
    pub fn build_args(&self) -> Result<Vec<OsString>, OcrError> {
        if self.force_ocr && self.skip_text {
            return Err(OcrError::InvalidConfig(
                "force_ocr and skip_text are mutually exclusive".into(),
            ));
        }

        let mut args: Vec<OsString> = Vec::new();
        if let Some(pages) = self.pages.as_ref().filter(|p| !p.is_empty()) {
            args.push("--pages".into());
            args.push(pages.to_range_string().into());
        }
        if let Some(lang) = self.language.as_deref().filter(|l| !l.trim().is_empty()) {
            args.push("--language".into());
            args.push(lang.trim().into());
        }
        if self.force_ocr {
            args.push("--force-ocr".into());
        }
        if self.skip_text {
            args.push("--skip-text".into());
        }
        if let Some(jobs) = self.jobs {
            args.push("--jobs".into());
            args.push(jobs.max(1).to_string().into());
        }
        for plugin in self.plugins.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
            args.push("--plugin".into());
            args.push(plugin.into());
        }
        args.push(self.input.clone().into_os_string());
        args.push(self.output.clone().into_os_string());
        Ok(args)
    }
}

/// Split a comma-separated plugin list, falling back to [`DEFAULT_PLUGIN`].
pub fn parse_plugins(spec: Option<&str>) -> Vec<String> {
    let plugins: Vec<String> = spec
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    if plugins.is_empty() {
        vec![DEFAULT_PLUGIN.to_string()]
    } else {
        plugins
    }
}

/// Run `program` (normally `ocrmypdf`) with `params`.
///
/// Its stderr is forwarded to the `debug` log and the last lines are kept
/// for the error message on failure.
pub async fn run_ocrmypdf(program: &Path, params: &ExternalOcrParams) -> Result<(), OcrError> {
    let tool = program.display().to_string();
    let args = params.build_args()?;
    info!(
        "Delegating {} → {} to {}",
        params.input.display(),
        params.output.display(),
        tool
    );

    let mut child = Command::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| OcrError::ExternalToolFailed {
            tool: tool.clone(),
            detail: format!("cannot start: {e}"),
        })?;

    let mut tail: Vec<String> = Vec::new();
    if let Some(stderr) = child.stderr.take() {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "ocr_overlay::external", "{}", line);
            tail.push(line);
            if tail.len() > 20 {
                tail.remove(0);
            }
        }
    }

    let status = child.wait().await.map_err(|e| OcrError::ExternalToolFailed {
        tool: tool.clone(),
        detail: e.to_string(),
    })?;
    if !status.success() {
        return Err(OcrError::ExternalToolFailed {
            tool,
            detail: format!("{}\n{}", status, tail.join("\n")),
        });
    }
    Ok(())
}
