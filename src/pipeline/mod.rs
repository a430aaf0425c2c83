//! Page-level stages of a job.
//!
//! ```text
//! input ──▶ render ──▶ (recognition channel) ──▶ geometry ──▶ overlay
//! (path)    (pdfium)                             (bbox→pt)    (text layer)
//! ```
//!
//! 1. [`input`]    validate PDFs, collect image batches
//! 2. [`render`]   rasterise selected pages; pdfium runs in `spawn_blocking`
//! 3. [`geometry`] map normalized boxes onto page point space
//! 4. [`overlay`]  plan and write the invisible text layer

pub mod geometry;
pub mod input;
pub mod overlay;
pub mod render;
