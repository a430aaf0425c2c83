//! Overlay composition against real PDFs generated with pdfium.
//!
//! Skipped when no pdfium library can be bound. Point `PDFIUM_LIB_PATH` at
//! an existing libpdfium to run them:
//!   PDFIUM_LIB_PATH=/opt/pdfium/lib cargo test --test compose -- --nocapture

mod common;

use common::{connect, Reply, Script};
use ocr_overlay::job::make_searchable_with;
use ocr_overlay::pipeline::overlay::{compose_document, plan_page};
use ocr_overlay::pipeline::render::{bind_pdfium, inspect_document};
use ocr_overlay::{
    JobState, NormalizedBox, OcrConfig, OcrError, PageStatus, RecognizedItem, RecognizedPage,
};
use pdfium_render::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// ── Test helpers ─────────────────────────────────────────────────────────────

macro_rules! skip_without_pdfium {
    () => {{
        if bind_pdfium().is_err() {
            println!("SKIP — pdfium library not found (set PDFIUM_LIB_PATH)");
            return;
        }
    }};
}

fn square() -> PdfPagePaperSize {
    PdfPagePaperSize::Custom(PdfPoints::new(500.0), PdfPoints::new(500.0))
}

/// Two 500×500 pt pages; page 2 carries visible text.
fn write_fixture(path: &Path) {
    let pdfium = bind_pdfium().unwrap();
    let mut document = pdfium.create_new_pdf().unwrap();
    document.pages_mut().create_page_at_end(square()).unwrap();
    let font = document.fonts_mut().helvetica();
    {
        let mut page2 = document.pages_mut().create_page_at_end(square()).unwrap();
        page2
            .objects_mut()
            .create_text_object(
                PdfPoints::new(50.0),
                PdfPoints::new(400.0),
                "original text",
                font,
                PdfPoints::new(12.0),
            )
            .unwrap();
    }
    document.save_to_file(path).unwrap();
}

/// Page 1 is a full-page 250×250 px scan; page 2 only carries a small logo.
fn write_scanned_fixture(path: &Path) {
    let pdfium = bind_pdfium().unwrap();
    let mut document = pdfium.create_new_pdf().unwrap();
    let scan = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
        250,
        250,
        image::Rgb([240, 240, 240]),
    ));
    let logo = image::DynamicImage::ImageRgb8(image::RgbImage::new(40, 40));
    {
        let mut page1 = document.pages_mut().create_page_at_end(square()).unwrap();
        page1
            .objects_mut()
            .create_image_object(
                PdfPoints::new(0.0),
                PdfPoints::new(0.0),
                &scan,
                Some(PdfPoints::new(500.0)),
                Some(PdfPoints::new(500.0)),
            )
            .unwrap();
    }
    {
        let mut page2 = document.pages_mut().create_page_at_end(square()).unwrap();
        page2
            .objects_mut()
            .create_image_object(
                PdfPoints::new(20.0),
                PdfPoints::new(420.0),
                &logo,
                Some(PdfPoints::new(60.0)),
                Some(PdfPoints::new(60.0)),
            )
            .unwrap();
    }
    document.save_to_file(path).unwrap();
}

struct PageDump {
    text: String,
    objects: usize,
    /// Type and bounds of every page object, in content order.
    layout: Vec<String>,
    media: String,
    /// RGBA pixels of a 100 px wide render.
    pixels: Vec<u8>,
}

fn dump(path: &Path) -> Vec<PageDump> {
    let pdfium = bind_pdfium().unwrap();
    let document = pdfium.load_pdf_from_file(path, None).unwrap();
    let render = PdfRenderConfig::new().set_target_width(100);
    document
        .pages()
        .iter()
        .map(|page| PageDump {
            text: page.text().unwrap().all(),
            objects: page.objects().len(),
            layout: page
                .objects()
                .iter()
                .map(|o| format!("{:?} {:?}", o.object_type(), o.bounds()))
                .collect(),
            media: format!("{:?}", page.boundaries().media().map(|b| b.bounds)),
            pixels: page.render_with_config(&render).unwrap().as_rgba_bytes(),
        })
        .collect()
}

fn metadata(path: &Path) -> Vec<PdfDocumentMetadataTag> {
    let pdfium = bind_pdfium().unwrap();
    let document = pdfium.load_pdf_from_file(path, None).unwrap();
    let tags = document.metadata().iter().cloned().collect();
    tags
}

fn recognized(page: usize, text: &str) -> RecognizedPage {
    RecognizedPage {
        page_index: page,
        width: 1000,
        height: 1000,
        items: vec![RecognizedItem {
            text: text.into(),
            bbox: NormalizedBox::new(0.1, 0.8, 0.5, 0.05),
            confidence: 0.9,
        }],
    }
}

fn fixture() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("scan.pdf");
    write_fixture(&input);
    (dir, input)
}

// ── Composition ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_overlay_page_one_leaves_page_two_untouched() {
    skip_without_pdfium!();
    let (dir, input) = fixture();
    let output = dir.path().join("out").join("scan_ocr.pdf");

    let info = inspect_document(&input, None).await.unwrap();
    assert_eq!(info.page_count, 2);
    let geometry = info.geometry(1).unwrap();
    let overlay = plan_page(&recognized(1, "searchable words"), geometry, 6.0, 0.02).unwrap();
    assert_eq!(overlay.runs.len(), 1);

    let mut overlays = BTreeMap::new();
    overlays.insert(1, overlay);
    let summary = compose_document(&input, &output, None, overlays, None)
        .await
        .unwrap();
    assert_eq!(summary.pages_overlaid, vec![1]);
    assert_eq!(summary.runs_written, 1);
    assert!(summary.page_errors.is_empty());
    assert!(!output.with_extension("pdf.tmp").exists());

    let before = dump(&input);
    let after = dump(&output);
    assert_eq!(after.len(), 2);
    assert!(after[0].text.contains("searchable words"));
    assert_eq!(after[0].objects, before[0].objects + 1);
    assert_eq!(after[0].media, before[0].media);
    assert_eq!(after[0].pixels, before[0].pixels);

    assert_eq!(after[1].text, before[1].text);
    assert_eq!(after[1].objects, before[1].objects);
    assert_eq!(after[1].layout, before[1].layout);
    assert_eq!(after[1].media, before[1].media);
    assert_eq!(after[1].pixels, before[1].pixels);
    assert_eq!(metadata(&output), metadata(&input));
}

#[tokio::test]
async fn test_compose_without_overlays_copies_document() {
    skip_without_pdfium!();
    let (dir, input) = fixture();
    let output = dir.path().join("copy.pdf");

    let summary = compose_document(&input, &output, None, BTreeMap::new(), None)
        .await
        .unwrap();
    assert!(summary.pages_overlaid.is_empty());

    let after = dump(&output);
    assert_eq!(after.len(), 2);
    assert!(after[1].text.contains("original text"));
}

// ── Whole job ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_full_page_scan_is_sent_without_rendering() {
    skip_without_pdfium!();
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("scan.pdf");
    write_scanned_fixture(&input);
    let output = dir.path().join("scan_ocr.pdf");

    let (channel, service) = connect(Script::new(2, vec![Reply::Result(2), Reply::Result(1)]));
    let config = OcrConfig::builder()
        .dpi(72)
        .embedded_images(true)
        .page_timeout_secs(10)
        .drain_timeout_secs(1)
        .build()
        .unwrap();

    let report = make_searchable_with(channel, &input, &output, &config)
        .await
        .unwrap();
    assert_eq!(report.processed, vec![1, 2]);

    let transcript = service.await.unwrap();
    let request = |page: u64| {
        transcript
            .requests
            .iter()
            .find(|r| r["page_index"] == page)
            .unwrap()
    };
    assert_eq!(request(1)["dpi"], 0);
    assert_eq!(request(1)["width"], 250);
    assert_eq!(request(1)["height"], 250);
    // The logo does not cover page 2, so it is rendered.
    assert_eq!(request(2)["dpi"], 72);
    assert_eq!(request(2)["width"], 500);

    let after = dump(&output);
    assert!(after[0].text.contains("page 1"));
    assert!(after[1].text.contains("page 2"));
}

#[tokio::test]
async fn test_job_with_failed_page_still_writes_output() {
    skip_without_pdfium!();
    let (dir, input) = fixture();
    let output = dir.path().join("scan_ocr.pdf");

    let (channel, service) = connect(Script::new(
        2,
        vec![Reply::Error(2, "engine crashed"), Reply::Result(1)],
    ));
    let config = OcrConfig::builder()
        .dpi(72)
        .page_timeout_secs(10)
        .drain_timeout_secs(1)
        .build()
        .unwrap();

    let report = make_searchable_with(channel, &input, &output, &config)
        .await
        .unwrap();

    assert_eq!(report.state, JobState::Done);
    assert!(report.transitions.contains(&JobState::PartiallyFailed));
    assert_eq!(report.processed, vec![1]);
    assert_eq!(report.failed, vec![2]);
    assert!(report.is_partial());
    assert!(matches!(
        report.pages[1].status,
        PageStatus::Failed { ref kind, .. } if kind == "engine"
    ));

    let after = dump(&output);
    assert!(after[0].text.contains("page 1"));
    assert!(after[1].text.contains("original text"));
    assert!(!after[1].text.contains("page 2"));

    let transcript = service.await.unwrap();
    assert_eq!(transcript.requests.len(), 2);
    assert_eq!(transcript.requests[0]["dpi"], 72);
}

#[tokio::test]
async fn test_out_of_range_selection_fails_before_writing() {
    skip_without_pdfium!();
    let (dir, input) = fixture();
    let output = dir.path().join("never.pdf");

    let (channel, _service) = connect(Script::new(1, vec![]));
    let config = OcrConfig::builder().pages("1-5").build().unwrap();

    let err = make_searchable_with(channel, &input, &output, &config)
        .await
        .unwrap_err();
    assert!(matches!(err, OcrError::PageOutOfRange { page: 5, total: 2 }));
    assert!(!output.exists());
}
