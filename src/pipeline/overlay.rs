//! Invisible text-layer synthesis.
//!
//! Composition happens in two steps:
//!
//! 1. [`plan_page`] turns a page's recognition result into positioned
//!    [`TextRun`]s. Pure and pdfium-free; this is where degenerate items are
//!    dropped and raster/page mismatches are caught.
//! 2. [`compose_document`] opens the source PDF, appends one invisible text
//!    object per run to each planned page and saves the result atomically.
//!    Pages without a plan are never loaded, so they leave the save
//!    untouched apart from the container.
//!
//! Each run is drawn in render mode 3 (invisible), with its font size taken
//! from the rectangle height, stretched horizontally to the rectangle width
//! and lifted by 15% of the height so glyphs sit inside the box.

use crate::correlator::RecognizedPage;
use crate::error::{OcrError, PageError};
use crate::pipeline::geometry::{aspect_ratio_consistent, PageGeometry, PageRect};
use crate::pipeline::render::{bind_pdfium, open_document};
use pdfium_render::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Fraction of the box height the baseline is raised by.
const BASELINE_LIFT: f64 = 0.15;

/// System fonts tried, in order, when no font is configured.
const CJK_FONT_CANDIDATES: [&str; 6] = [
    "/System/Library/Fonts/PingFang.ttc",
    "/System/Library/Fonts/Hiragino Sans GB.ttc",
    "/System/Library/Fonts/STHeiti Light.ttc",
    "/Library/Fonts/Arial Unicode.ttf",
    "/usr/share/fonts/truetype/droid/DroidSansFallbackFull.ttf",
    "/usr/share/fonts/opentype/noto/NotoSansCJK-Regular.ttc",
];

/// One invisible text run in displayed page space.
#[derive(Debug, Clone, PartialEq)]
pub struct TextRun {
    pub text: String,
    pub rect: PageRect,
    pub font_size: f32,
}

/// Everything needed to overlay one page.
#[derive(Debug, Clone, PartialEq)]
pub struct PageOverlay {
    pub page_index: usize,
    pub geometry: PageGeometry,
    pub runs: Vec<TextRun>,
    /// Items dropped for blank text or a degenerate box.
    pub dropped: usize,
}

/// Outcome of [`compose_document`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComposeSummary {
    /// Pages that received a text layer.
    pub pages_overlaid: Vec<usize>,
    pub runs_written: usize,
    /// Pages whose overlay could not be applied; copied through unchanged.
    pub page_errors: Vec<PageError>,
}

/// Font size for a run `height` points tall.
pub fn font_size_for(height: f64, min_font_size: f32) -> f32 {
    (height.floor() as f32).max(min_font_size)
}

/// Position every recognised item of `page` on a page of `geometry`.
///
/// Fails when the raster's aspect ratio does not match the page, which means
/// the result belongs to a different rendering than the one being composed.
pub fn plan_page(
    page: &RecognizedPage,
    geometry: &PageGeometry,
    min_font_size: f32,
    aspect_tolerance: f64,
) -> Result<PageOverlay, PageError> {
    if !aspect_ratio_consistent(
        page.width,
        page.height,
        geometry.width,
        geometry.height,
        aspect_tolerance,
    ) {
        return Err(PageError::Composition {
            page: page.page_index,
            detail: format!(
                "raster {}x{} px does not match page {:.1}x{:.1} pt",
                page.width, page.height, geometry.width, geometry.height
            ),
        });
    }

    let mut runs = Vec::with_capacity(page.items.len());
    let mut dropped = 0;
    for item in &page.items {
        if item.text.trim().is_empty() {
            dropped += 1;
            continue;
        }
        match geometry.map(&item.bbox) {
            Some(rect) => runs.push(TextRun {
                text: item.text.clone(),
                font_size: font_size_for(rect.height, min_font_size),
                rect,
            }),
            None => dropped += 1,
        }
    }

    if dropped > 0 {
        debug!("Page {}: dropped {} unusable items", page.page_index, dropped);
    }

    Ok(PageOverlay {
        page_index: page.page_index,
        geometry: *geometry,
        runs,
        dropped,
    })
}

/// Write `source` to `output` with an invisible text layer on every page in
/// `overlays`. The output replaces any existing file atomically.
pub async fn compose_document(
    source: &Path,
    output: &Path,
    password: Option<&str>,
    overlays: BTreeMap<usize, PageOverlay>,
    font_path: Option<&Path>,
) -> Result<ComposeSummary, OcrError> {
    let source = source.to_path_buf();
    let output = output.to_path_buf();
    let pwd = password.map(|s| s.to_string());
    let font = font_path.map(Path::to_path_buf);

    tokio::task::spawn_blocking(move || {
        compose_blocking(&source, &output, pwd.as_deref(), &overlays, font.as_deref())
    })
    .await
    .map_err(|e| OcrError::Internal(format!("Compose task panicked: {}", e)))?
}

fn load_font(document: &mut PdfDocument, font_path: Option<&Path>) -> PdfFontToken {
    let configured = font_path.map(Path::to_path_buf);
    let candidates = configured
        .into_iter()
        .chain(CJK_FONT_CANDIDATES.iter().map(PathBuf::from));

    for path in candidates {
        if !path.exists() {
            continue;
        }
        match document.fonts_mut().load_true_type_from_file(&path, true) {
            Ok(token) => {
                debug!("Overlay font: {}", path.display());
                return token;
            }
            Err(e) => warn!("Cannot embed font {}: {:?}", path.display(), e),
        }
    }

    debug!("Overlay font: built-in Helvetica");
    document.fonts_mut().helvetica()
}

fn compose_blocking(
    source: &Path,
    output: &Path,
    password: Option<&str>,
    overlays: &BTreeMap<usize, PageOverlay>,
    font_path: Option<&Path>,
) -> Result<ComposeSummary, OcrError> {
    let pdfium = bind_pdfium()?;
    let mut document = open_document(&pdfium, source, password)?;
    let font = if overlays.is_empty() {
        None
    } else {
        Some(load_font(&mut document, font_path))
    };

    let mut summary = ComposeSummary::default();
    if let Some(font) = font {
        for (&page_index, overlay) in overlays {
            match overlay_page(&document, font, overlay) {
                Ok(written) => {
                    summary.pages_overlaid.push(page_index);
                    summary.runs_written += written;
                }
                Err(detail) => {
                    warn!("Page {}: overlay skipped: {}", page_index, detail);
                    summary.page_errors.push(PageError::Composition {
                        page: page_index,
                        detail,
                    });
                }
            }
        }
    }

    save_atomically(&document, output)?;
    info!(
        "Wrote {} ({} pages overlaid, {} text runs)",
        output.display(),
        summary.pages_overlaid.len(),
        summary.runs_written
    );
    Ok(summary)
}

fn overlay_page(
    document: &PdfDocument,
    font: PdfFontToken,
    overlay: &PageOverlay,
) -> Result<usize, String> {
    let index = overlay
        .page_index
        .checked_sub(1)
        .and_then(|i| u16::try_from(i).ok())
        .ok_or_else(|| format!("page index {} is not addressable", overlay.page_index))?;
    let mut page = document
        .pages()
        .get(index)
        .map_err(|e| format!("{:?}", e))?;

    let geometry = &overlay.geometry;
    let angle = geometry.text_rotation_ccw();
    let mut written = 0;

    for run in &overlay.runs {
        let mut object = PdfPageTextObject::new(
            document,
            &run.text,
            font,
            PdfPoints::new(run.font_size),
        )
        .map_err(|e| format!("{:?}", e))?;
        object
            .set_render_mode(PdfPageTextRenderMode::Invisible)
            .map_err(|e| format!("{:?}", e))?;

        // Stretch so the run spans exactly the recognised box.
        if let Ok(measured) = object.width() {
            let measured = measured.value as f64;
            if measured > 0.0 {
                let scale_x = run.rect.width / measured;
                object
                    .scale(scale_x as f32, 1.0)
                    .map_err(|e| format!("{:?}", e))?;
            }
        }

        let baseline_y = run.rect.y + BASELINE_LIFT * run.rect.height;
        let (ux, uy) = geometry.to_user_space(run.rect.x, baseline_y);
        if angle != 0.0 {
            object
                .rotate_counter_clockwise_degrees(angle as f32)
                .map_err(|e| format!("{:?}", e))?;
        }
        object
            .translate(PdfPoints::new(ux as f32), PdfPoints::new(uy as f32))
            .map_err(|e| format!("{:?}", e))?;

        page.objects_mut()
            .add_text_object(object)
            .map_err(|e| format!("{:?}", e))?;
        written += 1;
    }

    debug!("Page {}: {} invisible runs", overlay.page_index, written);
    Ok(written)
}

fn save_atomically(document: &PdfDocument, output: &Path) -> Result<(), OcrError> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| OcrError::OutputWriteFailed {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    let tmp_path = output.with_extension("pdf.tmp");
    document
        .save_to_file(&tmp_path)
        .map_err(|e| OcrError::CompositionFailed {
            path: output.to_path_buf(),
            detail: format!("{:?}", e),
        })?;
    std::fs::rename(&tmp_path, output).map_err(|e| {
        let _ = std::fs::remove_file(&tmp_path);
        OcrError::OutputWriteFailed {
            path: output.to_path_buf(),
            source: e,
        }
    })
}
