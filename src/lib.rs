//! # ocr-overlay
//!
//! Make scanned PDFs searchable with an external text-recognition service.
//!
//! Each selected page is rasterised, sent to a long-lived recognition
//! service over a newline-delimited JSON channel, and the recognised text is
//! written back onto the original page as an invisible, precisely positioned
//! layer. The visible content of every page is left untouched.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Select   parse the page range, subtract skipped pages
//!  ├─ 2. Render   rasterise pages via pdfium (bounded spawn_blocking pool)
//!  ├─ 3. Submit   one `ocr` line per page on the shared channel
//!  ├─ 4. Collect  correlate out-of-order responses by page index
//!  ├─ 5. Map      normalized boxes → page points (rotation aware)
//!  └─ 6. Compose  invisible text runs, atomic save
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ocr_overlay::{make_searchable, OcrConfig};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = OcrConfig::builder().pages("1-10").build()?;
//!     let report = make_searchable(Path::new("scan.pdf"), Path::new("scan_ocr.pdf"), &config).await?;
//!     eprintln!("{} pages overlaid, {} failed", report.processed.len(), report.failed.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `ocr-overlay` binary (clap + anyhow + tracing-subscriber + indicatif) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod channel;
pub mod config;
pub mod correlator;
pub mod error;
pub mod export;
pub mod external;
pub mod job;
pub mod pages;
pub mod pipeline;
pub mod progress;
pub mod protocol;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use channel::{ChannelSummary, RecognitionChannel};
pub use config::{languages_from_tesseract, OcrConfig, OcrConfigBuilder, RecognitionOptions};
pub use correlator::{PageOutcome, PendingPage, RecognizedPage, ResultCorrelator};
pub use error::{OcrError, PageError, ProtocolError};
pub use export::{extract_text, recognize_images, write_json, ExportedPage};
pub use external::{run_ocrmypdf, ExternalOcrParams};
pub use job::{make_searchable, make_searchable_dir, JobReport, JobState, PageReport, PageStatus};
pub use pages::{PageRangeError, PageSelection};
pub use pipeline::geometry::{map_to_page, NormalizedBox, PageGeometry, PageRect, PageRotation};
pub use progress::{JobProgressCallback, NoopProgressCallback, ProgressCallback};
pub use protocol::{RecognitionLevel, RecognitionRequest, RecognizedItem};
