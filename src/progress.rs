//! Progress-callback trait for per-page job events.
//!
//! Inject an [`Arc<dyn JobProgressCallback>`] via
//! [`crate::config::OcrConfigBuilder::progress_callback`] to observe pages
//! as they are rendered, dispatched to the recognition service and settled.
//!
//! # Example
//!
//! ```rust
//! use ocr_overlay::{JobProgressCallback, OcrConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct Counter(AtomicUsize);
//!
//! impl JobProgressCallback for Counter {
//!     fn on_page_complete(&self, page: usize, total: usize, items: usize) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("page {page}/{total}: {items} text runs");
//!     }
//! }
//!
//! let config = OcrConfig::builder()
//!     .progress_callback(Arc::new(Counter(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the job pipeline as pages move through it.
///
/// Pages settle in whatever order the service answers, so the page methods
/// may be called concurrently and out of page order. All methods default to
/// no-ops.
pub trait JobProgressCallback: Send + Sync {
    /// Called once the page selection is known, before any page renders.
    fn on_job_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called when a rendered page has been written to the service.
    fn on_page_dispatched(&self, page: usize, total_pages: usize) {
        let _ = (page, total_pages);
    }

    /// Called when a page's recognition result arrived.
    ///
    /// `items` is the number of recognised text runs.
    fn on_page_complete(&self, page: usize, total_pages: usize, items: usize) {
        let _ = (page, total_pages, items);
    }

    /// Called when a page failed (render, engine, timeout or channel loss).
    fn on_page_error(&self, page: usize, total_pages: usize, error: &str) {
        let _ = (page, total_pages, error);
    }

    /// Called once after every page has settled.
    fn on_job_complete(&self, total_pages: usize, success_count: usize) {
        let _ = (total_pages, success_count);
    }
}

/// A no-op implementation, used when no callback is configured.
pub struct NoopProgressCallback;

impl JobProgressCallback for NoopProgressCallback {}

/// Type stored in [`crate::config::OcrConfig`].
pub type ProgressCallback = Arc<dyn JobProgressCallback>;
