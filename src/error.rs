//! Error types for the ocr-overlay library.
//!
//! Three error types reflect three distinct failure scopes:
//!
//! * [`OcrError`]: **job-scoped**. The job cannot produce output at all
//!   (bad page range, unreadable input, service missing, channel lost before
//!   any page completed). Returned as `Err(OcrError)` from the top-level
//!   entry points; nothing is written.
//!
//! * [`PageError`]: **page-scoped**. One page failed (render glitch, engine
//!   error, timeout, dimension mismatch) while every other page carries on.
//!   Stored in the per-page report so callers can inspect partial success.
//!
//! * [`ProtocolError`]: **line-scoped**. A single inbound line from the
//!   recognition service was unusable. Logged and counted, never fatal.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::pages::PageRangeError;

/// All fatal errors returned by the ocr-overlay library.
///
/// Page-level failures use [`PageError`] and are stored in
/// [`crate::job::PageReport`] rather than propagated here.
#[derive(Debug, Error)]
pub enum OcrError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Input not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// A directory was required (image batch mode) but the path is not one.
    #[error("Not a directory: '{path}'")]
    NotADirectory { path: PathBuf },

    /// Image batch mode found nothing matching the extension whitelist.
    #[error("No images found in '{path}' (extensions: {extensions})")]
    NoImagesFound { path: PathBuf, extensions: String },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    // ── Page selection errors ─────────────────────────────────────────────
    /// The page-range expression could not be parsed.
    #[error("Invalid page range: {0}")]
    InvalidPageRange(#[from] PageRangeError),

    /// A selected page number exceeds the actual page count.
    #[error("Page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    /// Every page was excluded (e.g. `--skip-pages` covers the whole selection).
    #[error("No pages left to process after applying the page selection")]
    EmptySelection,

    // ── Recognition service errors ────────────────────────────────────────
    /// The recognition service executable does not exist.
    #[error("Recognition service not found: '{path}'\nBuild it or point --service-bin at it.")]
    ServiceNotFound { path: PathBuf },

    /// The recognition service could not be started.
    #[error("Failed to start recognition service '{path}': {source}")]
    ServiceSpawnFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The channel closed before a single page completed; no output is written.
    #[error("Recognition channel closed unexpectedly before any page completed ({pending} pages pending)")]
    ChannelClosed { pending: usize },

    /// Some pages succeeded but at least one failed.
    ///
    /// Returned by [`crate::job::JobReport::into_result`] when the caller
    /// wants to treat any page failure as an error.
    #[error("{failed}/{total} pages failed during recognition")]
    PartialFailure {
        success: usize,
        failed: usize,
        total: usize,
    },

    // ── Output errors ─────────────────────────────────────────────────────
    /// Could not create or write the output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The composed document could not be saved.
    #[error("Failed to compose '{path}': {detail}")]
    CompositionFailed { path: PathBuf, detail: String },

    /// The delegated external OCR tool failed.
    #[error("External tool '{tool}' failed: {detail}")]
    ExternalToolFailed { tool: String, detail: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
You can:\n\
  • Set PDFIUM_LIB_PATH=/path/to/libpdfium to use an existing copy.\n\
  • Place libpdfium next to the executable or in the working directory.\n\
  • Install pdfium system-wide.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single page.
///
/// The overall job continues; the page is copied through unmodified.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum PageError {
    /// Page rasterisation failed.
    #[error("Page {page}: rasterisation failed: {detail}")]
    RenderFailed { page: usize, detail: String },

    /// The recognition service reported an `error` for this page.
    #[error("Page {page}: recognition engine error: {message}")]
    Engine { page: usize, message: String },

    /// No response arrived before the page or job deadline.
    #[error("Page {page}: no recognition result within {secs}s")]
    Timeout { page: usize, secs: u64 },

    /// The channel went away while the page was pending.
    #[error("Page {page}: recognition channel lost: {detail}")]
    ChannelLost { page: usize, detail: String },

    /// Recognised geometry does not fit the destination page.
    #[error("Page {page}: composition failed: {detail}")]
    Composition { page: usize, detail: String },

    /// The same page index was submitted while a request for it was in flight.
    #[error("Page {page}: a request for this page is already in flight")]
    DuplicateRequest { page: usize },
}

impl PageError {
    /// The 1-based page this error belongs to.
    pub fn page(&self) -> usize {
        match self {
            PageError::RenderFailed { page, .. }
            | PageError::Engine { page, .. }
            | PageError::Timeout { page, .. }
            | PageError::ChannelLost { page, .. }
            | PageError::Composition { page, .. }
            | PageError::DuplicateRequest { page } => *page,
        }
    }

    /// Short, stable name of the failure reason used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            PageError::RenderFailed { .. } => "render",
            PageError::Engine { .. } => "engine",
            PageError::Timeout { .. } => "timeout",
            PageError::ChannelLost { .. } => "channel",
            PageError::Composition { .. } => "composition",
            PageError::DuplicateRequest { .. } => "duplicate",
        }
    }
}

/// An unusable inbound line or an uncorrelatable response.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    /// The line is not valid JSON, or lacks a field required for its type.
    #[error("line {line}: malformed message: {detail}")]
    Malformed { line: u64, detail: String },

    /// An `error` response carried no page index, so it cannot be attributed.
    #[error("line {line}: error response without page_index: {message}")]
    Unattributed { line: u64, message: String },

    /// A response arrived for a page with no pending request.
    #[error("response for page {page} has no pending request")]
    UnknownPage { page: usize },

    /// A response arrived for a page that was already settled.
    #[error("duplicate response for already settled page {page}")]
    AlreadySettled { page: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_failure_display() {
        let e = OcrError::PartialFailure {
            success: 9,
            failed: 1,
            total: 10,
        };
        let msg = e.to_string();
        assert!(msg.contains("1/10"), "got: {msg}");
    }

    #[test]
    fn page_error_reports_its_page_and_kind() {
        let e = PageError::Timeout { page: 7, secs: 30 };
        assert_eq!(e.page(), 7);
        assert_eq!(e.kind(), "timeout");
        assert!(e.to_string().contains("30s"));

        let e = PageError::Engine {
            page: 2,
            message: "bad image".into(),
        };
        assert_eq!(e.page(), 2);
        assert_eq!(e.kind(), "engine");
    }

    #[test]
    fn page_range_error_converts_into_fatal() {
        let e: OcrError = PageRangeError::Descending { start: 5, end: 3 }.into();
        assert!(matches!(e, OcrError::InvalidPageRange(_)));
        assert!(e.to_string().contains("5-3"), "got: {e}");
    }

    #[test]
    fn protocol_error_mentions_line() {
        let e = ProtocolError::Malformed {
            line: 12,
            detail: "expected value".into(),
        };
        assert!(e.to_string().starts_with("line 12"));
    }

    #[test]
    fn page_error_serialises() {
        let e = PageError::ChannelLost {
            page: 4,
            detail: "EOF".into(),
        };
        let json = serde_json::to_string(&e).unwrap();
        let back: PageError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }
}
