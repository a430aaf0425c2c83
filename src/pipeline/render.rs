//! PDF rasterisation and inspection via pdfium.
//!
//! pdfium is not async-safe, so every call runs inside
//! `tokio::task::spawn_blocking`. The [`Rasterizer`] renders selected pages
//! through a bounded pool: at most `workers` pages are in flight at once and
//! each page is rendered independently, so one corrupt page only fails its
//! own [`RenderJob`].

use crate::config::OcrConfig;
use crate::error::{OcrError, PageError};
use crate::pages::PageSelection;
use crate::pipeline::geometry::{PageGeometry, PageRotation};
use futures::stream::{self, Stream, StreamExt};
use image::DynamicImage;
use pdfium_render::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A page rendered to a raster image, ready for recognition.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderJob {
    /// 1-based page number (or image ordinal in batch mode).
    pub page_index: usize,
    /// Effective resolution; `0` for images that were never rendered.
    pub dpi: u32,
    pub image_path: PathBuf,
    pub pixel_width: u32,
    pub pixel_height: u32,
    /// The image is ours to delete once recognition settles.
    pub temporary: bool,
}

impl RenderJob {
    /// Delete the raster if it is a temporary file. Errors are only logged.
    pub async fn release(&self) {
        if !self.temporary {
            return;
        }
        if let Err(e) = tokio::fs::remove_file(&self.image_path).await {
            debug!(
                "Page {}: could not remove {}: {}",
                self.page_index,
                self.image_path.display(),
                e
            );
        }
    }
}

/// Page count, per-page geometry and a few metadata fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub page_count: usize,
    /// Geometry of every page, index 0 = page 1.
    pub pages: Vec<PageGeometry>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub producer: Option<String>,
    pub pdf_version: String,
}

impl DocumentInfo {
    /// Geometry of 1-based `page`.
    pub fn geometry(&self, page: usize) -> Option<&PageGeometry> {
        page.checked_sub(1).and_then(|i| self.pages.get(i))
    }
}

/// Bind to a pdfium library.
///
/// Resolution order: `PDFIUM_LIB_PATH` (file or directory), the working
/// directory, the directory of the running executable, then the system
/// library search path.
pub fn bind_pdfium() -> Result<Pdfium, OcrError> {
    let mut attempts = Vec::new();

    if let Ok(path) = std::env::var("PDFIUM_LIB_PATH") {
        let path = PathBuf::from(path);
        let lib = if path.is_dir() {
            Pdfium::pdfium_platform_library_name_at_path(&path)
        } else {
            path
        };
        match Pdfium::bind_to_library(&lib) {
            Ok(bindings) => return Ok(Pdfium::new(bindings)),
            Err(e) => attempts.push(format!("{}: {:?}", lib.display(), e)),
        }
    }

    let mut dirs = vec![PathBuf::from("./")];
    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
    {
        dirs.push(exe_dir);
    }
    for dir in dirs {
        let lib = Pdfium::pdfium_platform_library_name_at_path(&dir);
        if !lib.exists() {
            continue;
        }
        match Pdfium::bind_to_library(&lib) {
            Ok(bindings) => return Ok(Pdfium::new(bindings)),
            Err(e) => attempts.push(format!("{}: {:?}", lib.display(), e)),
        }
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(e) => {
            attempts.push(format!("system library: {:?}", e));
            Err(OcrError::PdfiumBindingFailed(attempts.join("; ")))
        }
    }
}

/// Open a document, mapping pdfium's load errors onto [`OcrError`].
pub(crate) fn open_document<'a>(
    pdfium: &'a Pdfium,
    pdf_path: &Path,
    password: Option<&'a str>,
) -> Result<PdfDocument<'a>, OcrError> {
    pdfium.load_pdf_from_file(pdf_path, password).map_err(|e| {
        let err_str = format!("{:?}", e);
        if err_str.contains("Password") || err_str.contains("password") {
            if password.is_some() {
                OcrError::WrongPassword {
                    path: pdf_path.to_path_buf(),
                }
            } else {
                OcrError::PasswordRequired {
                    path: pdf_path.to_path_buf(),
                }
            }
        } else {
            OcrError::CorruptPdf {
                path: pdf_path.to_path_buf(),
                detail: err_str,
            }
        }
    })
}

/// Displayed geometry of a loaded page.
pub(crate) fn page_geometry(page: &PdfPage) -> PageGeometry {
    let rotation = match page.rotation() {
        Ok(PdfPageRenderRotation::Degrees90) => PageRotation::Cw90,
        Ok(PdfPageRenderRotation::Degrees180) => PageRotation::Cw180,
        Ok(PdfPageRenderRotation::Degrees270) => PageRotation::Cw270,
        _ => PageRotation::None,
    };
    PageGeometry::new(page.width().value as f64, page.height().value as f64).with_rotation(rotation)
}

/// Read page count, page geometry and metadata without rendering.
pub async fn inspect_document(
    pdf_path: &Path,
    password: Option<&str>,
) -> Result<DocumentInfo, OcrError> {
    let path = pdf_path.to_path_buf();
    let pwd = password.map(|s| s.to_string());

    tokio::task::spawn_blocking(move || inspect_document_blocking(&path, pwd.as_deref()))
        .await
        .map_err(|e| OcrError::Internal(format!("Inspect task panicked: {}", e)))?
}

fn inspect_document_blocking(
    pdf_path: &Path,
    password: Option<&str>,
) -> Result<DocumentInfo, OcrError> {
    let pdfium = bind_pdfium()?;
    let document = open_document(&pdfium, pdf_path, password)?;

    let metadata = document.metadata();
    let get_meta = |tag: PdfDocumentMetadataTagType| -> Option<String> {
        metadata.get(tag).and_then(|t| {
            let v = t.value().to_string();
            if v.is_empty() {
                None
            } else {
                Some(v)
            }
        })
    };

    let pages: Vec<PageGeometry> = document.pages().iter().map(|p| page_geometry(&p)).collect();
    info!("PDF loaded: {} pages", pages.len());

    Ok(DocumentInfo {
        page_count: pages.len(),
        pages,
        title: get_meta(PdfDocumentMetadataTagType::Title),
        author: get_meta(PdfDocumentMetadataTagType::Author),
        producer: get_meta(PdfDocumentMetadataTagType::Producer),
        pdf_version: format!("{:?}", document.version()),
    })
}

/// Scale factor (pixels per point) for `dpi`, lowered so the longest edge
/// stays within `max_pixels`.
pub fn render_scale(width_pt: f64, height_pt: f64, dpi: u32, max_pixels: u32) -> f64 {
    let scale = dpi as f64 / 72.0;
    let longest = width_pt.max(height_pt);
    if longest <= 0.0 {
        return scale;
    }
    let cap = max_pixels as f64 / longest;
    scale.min(cap)
}

/// Renders selected pages into PNG files under a scratch directory.
#[derive(Debug, Clone)]
pub struct Rasterizer {
    pdf_path: PathBuf,
    password: Option<String>,
    out_dir: PathBuf,
    dpi: u32,
    max_rendered_pixels: u32,
    workers: usize,
    embedded_images: bool,
    aspect_tolerance: f64,
}

impl Rasterizer {
    pub fn new(pdf_path: &Path, out_dir: &Path, config: &OcrConfig) -> Self {
        Self {
            pdf_path: pdf_path.to_path_buf(),
            password: config.password.clone(),
            out_dir: out_dir.to_path_buf(),
            dpi: config.dpi,
            max_rendered_pixels: config.max_rendered_pixels,
            workers: config.workers.max(1),
            embedded_images: config.embedded_images,
            aspect_tolerance: config.aspect_tolerance,
        }
    }

    /// Render every selected page, yielding jobs in completion order.
    ///
    /// At most `workers` pages render concurrently; the stream applies
    /// back-pressure so a new page only starts when a slot frees up.
    pub fn render_stream(
        &self,
        selection: &PageSelection,
    ) -> impl Stream<Item = Result<RenderJob, PageError>> + Send + 'static {
        let this = self.clone();
        let workers = self.workers;
        info!(
            "Rendering {} pages at {} DPI with {} workers",
            selection.len(),
            self.dpi,
            workers
        );

        stream::iter(selection.pages().to_vec())
            .map(move |page| {
                let r = this.clone();
                async move {
                    tokio::task::spawn_blocking(move || r.render_page_blocking(page))
                        .await
                        .unwrap_or_else(|e| {
                            Err(PageError::RenderFailed {
                                page,
                                detail: format!("render task panicked: {e}"),
                            })
                        })
                }
            })
            .buffer_unordered(workers)
    }

    fn render_page_blocking(&self, page_index: usize) -> Result<RenderJob, PageError> {
        let fail = |detail: String| PageError::RenderFailed {
            page: page_index,
            detail,
        };

        let pdfium = bind_pdfium().map_err(|e| fail(e.to_string()))?;
        let document = open_document(&pdfium, &self.pdf_path, self.password.as_deref())
            .map_err(|e| fail(e.to_string()))?;

        let index = u16::try_from(page_index - 1)
            .map_err(|_| fail(format!("page index {page_index} exceeds pdfium's limit")))?;
        let page = document
            .pages()
            .get(index)
            .map_err(|e| fail(format!("{:?}", e)))?;

        std::fs::create_dir_all(&self.out_dir).map_err(|e| fail(e.to_string()))?;
        let image_path = self.out_dir.join(format!("page_{:06}.png", page_index));

        if self.embedded_images {
            if let Some(image) = embedded_page_image(&page, page_index, self.aspect_tolerance) {
                image
                    .save_with_format(&image_path, image::ImageFormat::Png)
                    .map_err(|e| fail(format!("could not write embedded image: {e}")))?;
                debug!(
                    "Page {}: using embedded image {}x{} px",
                    page_index,
                    image.width(),
                    image.height()
                );
                return Ok(RenderJob {
                    page_index,
                    dpi: 0,
                    image_path,
                    pixel_width: image.width(),
                    pixel_height: image.height(),
                    temporary: true,
                });
            }
            debug!("Page {}: no full-page image, rendering instead", page_index);
        }

        let scale = render_scale(
            page.width().value as f64,
            page.height().value as f64,
            self.dpi,
            self.max_rendered_pixels,
        );
        let effective_dpi = (scale * 72.0).round() as u32;
        if effective_dpi < self.dpi {
            warn!(
                "Page {}: capped at {} DPI to stay within {} px",
                page_index, effective_dpi, self.max_rendered_pixels
            );
        }

        let render_config = PdfRenderConfig::new().scale_page_by_factor(scale as f32);
        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| fail(format!("{:?}", e)))?;
        let image = bitmap.as_image();
        image
            .save_with_format(&image_path, image::ImageFormat::Png)
            .map_err(|e| fail(format!("could not write raster: {e}")))?;

        debug!(
            "Rendered page {} → {}x{} px ({} DPI)",
            page_index,
            image.width(),
            image.height(),
            effective_dpi
        );

        Ok(RenderJob {
            page_index,
            dpi: effective_dpi,
            image_path,
            pixel_width: image.width(),
            pixel_height: image.height(),
            temporary: true,
        })
    }
}

/// The largest image placed on `page`, provided it covers the whole page.
///
/// Only unrotated pages qualify: the raw image is stored in unrotated page
/// space and recognition boxes are mapped onto the displayed page.
fn embedded_page_image(
    page: &PdfPage,
    page_index: usize,
    tolerance: f64,
) -> Option<DynamicImage> {
    if !matches!(page.rotation(), Ok(PdfPageRenderRotation::None)) {
        return None;
    }

    let largest = page
        .objects()
        .iter()
        .filter_map(|object| {
            let image = object.as_image_object()?;
            let area = i64::from(image.width().ok()?) * i64::from(image.height().ok()?);
            Some((area, object))
        })
        .max_by_key(|(area, _)| *area)
        .map(|(_, object)| object)?;

    let bounds = largest.bounds().ok()?;
    let (page_w, page_h) = (page.width().value as f64, page.height().value as f64);
    let covers = bounds.width().value as f64 >= page_w * (1.0 - tolerance)
        && bounds.height().value as f64 >= page_h * (1.0 - tolerance);
    if !covers {
        debug!(
            "Page {}: largest image is {:.0}x{:.0} pt on a {:.0}x{:.0} pt page",
            page_index,
            bounds.width().value,
            bounds.height().value,
            page_w,
            page_h
        );
        return None;
    }

    match largest.as_image_object()?.get_raw_image() {
        Ok(image) if image.width() > 0 && image.height() > 0 => Some(image),
        Ok(_) => None,
        Err(e) => {
            warn!("Page {}: embedded image unreadable: {:?}", page_index, e);
            None
        }
    }
}
