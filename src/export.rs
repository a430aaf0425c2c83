//! Normalized-coordinate JSON export.
//!
//! Recognition results are written as an ordered array, one entry per page
//! or image, with bounding boxes left in the unit square:
//!
//! ```json
//! [
//!   {"page_index": 1, "image": "scans/001.png", "width": 2480, "height": 3508,
//!    "items": [{"text": "Invoice", "bbox": {"x": 0.1, "y": 0.9, "w": 0.2, "h": 0.02},
//!               "confidence": 0.97}]},
//!   {"page_index": 2, "image": "scans/002.png", "width": 0, "height": 0,
//!    "items": [], "error": "Page 2: no recognition result within 120s"}
//! ]
//! ```

use crate::channel::RecognitionChannel;
use crate::config::OcrConfig;
use crate::correlator::PageOutcome;
use crate::error::OcrError;
use crate::job::{recognize_with, run_recognition};
use crate::pages::PageSelection;
use crate::pipeline::input::{collect_images, image_dimensions, resolve_pdf};
use crate::pipeline::render::{inspect_document, Rasterizer, RenderJob};
use crate::protocol::RecognizedItem;
use futures::stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// One page (or image) in the export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedPage {
    pub page_index: usize,
    /// Source image, for image batches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<PathBuf>,
    pub width: u32,
    pub height: u32,
    pub items: Vec<RecognizedItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
struct ImageSource {
    path: PathBuf,
    width: u32,
    height: u32,
}

fn to_export(
    outcomes: BTreeMap<usize, PageOutcome>,
    sources: &BTreeMap<usize, ImageSource>,
) -> Vec<ExportedPage> {
    outcomes
        .into_iter()
        .map(|(page, outcome)| {
            let source = sources.get(&page);
            let mut exported = ExportedPage {
                page_index: page,
                image: source.map(|s| s.path.clone()),
                width: source.map(|s| s.width).unwrap_or(0),
                height: source.map(|s| s.height).unwrap_or(0),
                items: Vec::new(),
                error: None,
            };
            match outcome {
                PageOutcome::Recognized(r) => {
                    exported.width = r.width;
                    exported.height = r.height;
                    exported.items = r.items;
                }
                PageOutcome::Failed(e) => exported.error = Some(e.to_string()),
            }
            exported
        })
        .collect()
}

/// Recognise the selected pages of a PDF without composing an overlay.
pub async fn extract_text(input: &Path, config: &OcrConfig) -> Result<Vec<ExportedPage>, OcrError> {
    let pdf = resolve_pdf(input)?;
    let info = inspect_document(&pdf, config.password.as_deref()).await?;
    let selection = config.resolve_selection(info.page_count)?;
    config.progress().on_job_start(selection.len());

    let scratch = tempfile::Builder::new()
        .prefix("ocr-overlay-")
        .tempdir()
        .map_err(|e| OcrError::Internal(format!("cannot create scratch directory: {e}")))?;
    let rasterizer = Rasterizer::new(&pdf, scratch.path(), config);
    let round = run_recognition(rasterizer.render_stream(&selection), &selection, config).await?;

    let pages = to_export(round.outcomes, &BTreeMap::new());
    finish(config, &pages);
    Ok(pages)
}

/// Recognise a single image or a directory of images (sorted by file name).
///
/// Images are sent as-is with `dpi = 0`; ordinals start at 1.
pub async fn recognize_images(
    path: &Path,
    extensions: &[String],
    config: &OcrConfig,
) -> Result<Vec<ExportedPage>, OcrError> {
    let channel = RecognitionChannel::spawn(&config.service_path)?;
    recognize_images_with(channel, path, extensions, config).await
}

/// [`recognize_images`] over an already-connected channel.
pub async fn recognize_images_with(
    channel: RecognitionChannel,
    path: &Path,
    extensions: &[String],
    config: &OcrConfig,
) -> Result<Vec<ExportedPage>, OcrError> {
    let images = collect_images(path, extensions)?;
    let selection = PageSelection::all(images.len());
    config.progress().on_job_start(selection.len());

    let mut sources = BTreeMap::new();
    let mut jobs = Vec::with_capacity(images.len());
    for (i, image) in images.into_iter().enumerate() {
        let page = i + 1;
        // The service may run in another working directory.
        let image = std::fs::canonicalize(&image).unwrap_or(image);
        let job = image_dimensions(page, &image).map(|(width, height)| {
            sources.insert(
                page,
                ImageSource {
                    path: image.clone(),
                    width,
                    height,
                },
            );
            RenderJob {
                page_index: page,
                dpi: 0,
                image_path: image.clone(),
                pixel_width: width,
                pixel_height: height,
                temporary: false,
            }
        });
        if job.is_err() {
            sources.insert(
                page,
                ImageSource {
                    path: image,
                    width: 0,
                    height: 0,
                },
            );
        }
        jobs.push(job);
    }

    let round = recognize_with(&channel, stream::iter(jobs), &selection, config).await?;
    let pages = to_export(round.outcomes, &sources);
    finish(config, &pages);
    Ok(pages)
}

fn finish(config: &OcrConfig, pages: &[ExportedPage]) {
    let ok = pages.iter().filter(|p| p.error.is_none()).count();
    config.progress().on_job_complete(pages.len(), ok);
    info!("Recognised {}/{} pages", ok, pages.len());
}

/// Write `pages` as pretty JSON, replacing `output` atomically.
pub async fn write_json(pages: &[ExportedPage], output: &Path) -> Result<(), OcrError> {
    let json = serde_json::to_string_pretty(pages)
        .map_err(|e| OcrError::Internal(format!("cannot serialise export: {e}")))?;

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| OcrError::OutputWriteFailed {
                path: parent.to_path_buf(),
                source: e,
            })?;
    }

    let tmp_path = output.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, json)
        .await
        .map_err(|e| OcrError::OutputWriteFailed {
            path: tmp_path.clone(),
            source: e,
        })?;
    tokio::fs::rename(&tmp_path, output)
        .await
        .map_err(|e| OcrError::OutputWriteFailed {
            path: output.to_path_buf(),
            source: e,
        })?;
    info!("Wrote {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::RecognizedPage;
    use crate::error::PageError;
    use crate::pipeline::geometry::NormalizedBox;

    #[test]
    fn export_keeps_page_order_and_failures() {
        let mut outcomes = BTreeMap::new();
        outcomes.insert(
            2,
            PageOutcome::Failed(PageError::Engine {
                page: 2,
                message: "bad image".into(),
            }),
        );
        outcomes.insert(
            1,
            PageOutcome::Recognized(RecognizedPage {
                page_index: 1,
                width: 10,
                height: 20,
                items: vec![RecognizedItem {
                    text: "a".into(),
                    bbox: NormalizedBox::new(0.0, 0.0, 0.5, 0.5),
                    confidence: 1.0,
                }],
            }),
        );
        let mut sources = BTreeMap::new();
        sources.insert(
            2,
            ImageSource {
                path: PathBuf::from("b.png"),
                width: 30,
                height: 40,
            },
        );

        let pages = to_export(outcomes, &sources);
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].page_index, 1);
        assert_eq!(pages[0].items.len(), 1);
        assert!(pages[0].image.is_none());
        assert_eq!(pages[1].width, 30);
        assert!(pages[1].error.as_deref().unwrap().contains("bad image"));

        let v = serde_json::to_value(&pages).unwrap();
        assert!(v[0].get("error").is_none());
        assert!(v[0].get("image").is_none());
        assert_eq!(v[1]["image"], "b.png");
    }

    #[tokio::test]
    async fn json_is_written_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested").join("result.json");
        let pages = vec![ExportedPage {
            page_index: 1,
            image: None,
            width: 1,
            height: 1,
            items: vec![],
            error: None,
        }];
        write_json(&pages, &out).await.unwrap();

        let back: Vec<ExportedPage> =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(back, pages);
        assert!(!out.with_extension("json.tmp").exists());
    }
}
