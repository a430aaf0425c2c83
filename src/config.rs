//! Configuration types for searchable-PDF jobs.
//!
//! All job behaviour is controlled through [`OcrConfig`], built via its
//! [`OcrConfigBuilder`]. Options forwarded verbatim to the recognition
//! service live in [`RecognitionOptions`].

use crate::error::OcrError;
use crate::pages::{PageRangeError, PageSelection};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::protocol::{RecognitionLevel, DEFAULT_DPI, DEFAULT_LANGUAGES};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default executable name of the recognition service.
pub const DEFAULT_SERVICE: &str = "ocrbridge";

/// Options sent with every `ocr` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionOptions {
    /// BCP-47 language tags, in priority order.
    pub languages: Vec<String>,
    pub level: RecognitionLevel,
    pub uses_cpu_only: bool,
    pub auto_detect_language: bool,
}

impl Default for RecognitionOptions {
    fn default() -> Self {
        Self {
            languages: DEFAULT_LANGUAGES.iter().map(|s| s.to_string()).collect(),
            level: RecognitionLevel::default(),
            uses_cpu_only: false,
            auto_detect_language: true,
        }
    }
}

/// Translate a Tesseract-style language spec (`eng+chi_sim`) into BCP-47
/// tags (`["en-US", "zh-Hans"]`). Unknown codes pass through unchanged.
pub fn languages_from_tesseract(spec: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for code in spec.split('+').map(str::trim).filter(|c| !c.is_empty()) {
        let tag = match code {
            "eng" => "en-US",
            "chi_sim" => "zh-Hans",
            "chi_tra" => "zh-Hant",
            "jpn" => "ja-JP",
            "kor" => "ko-KR",
            "fra" => "fr-FR",
            "deu" => "de-DE",
            "spa" => "es-ES",
            other => other,
        };
        if !out.iter().any(|t| t == tag) {
            out.push(tag.to_string());
        }
    }
    out
}

/// Configuration for one searchable-PDF or export job.
///
/// Built via [`OcrConfig::builder()`] or using [`OcrConfig::default()`].
///
/// # Example
/// ```rust
/// use ocr_overlay::OcrConfig;
///
/// let config = OcrConfig::builder()
///     .dpi(200)
///     .workers(4)
///     .pages("1-3,7")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct OcrConfig {
    /// Rendering DPI. Range: 72–1200. Default: 300.
    pub dpi: u32,

    /// Longest rendered edge in pixels. Default: 10000.
    ///
    /// Pages whose render at `dpi` would exceed this are rendered at a
    /// lower effective DPI instead.
    pub max_rendered_pixels: u32,

    /// Send a page's full-page embedded image as-is (`dpi = 0`) instead of
    /// rendering it. Pages without one are rendered at `dpi`. Default: false.
    pub embedded_images: bool,

    /// Width of the render pool. Default: available parallelism.
    pub workers: usize,

    /// Recognition service executable. Default: `ocrbridge` on `PATH`.
    pub service_path: PathBuf,

    pub recognition: RecognitionOptions,

    /// Page-range expression; `None` selects every page.
    pub pages: Option<String>,

    /// Pages removed from the selection.
    pub skip_pages: Option<String>,

    /// Per-page deadline, measured from dispatch. Default: 120.
    pub page_timeout_secs: u64,

    /// Deadline for the whole recognition phase. Default: 3600.
    pub job_timeout_secs: u64,

    /// How long `close` waits for in-flight responses. Default: 5.
    pub drain_timeout_secs: u64,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// TrueType font used for the invisible layer.
    ///
    /// When unset, a list of CJK-capable system fonts is tried before
    /// falling back to the built-in Helvetica.
    pub font_path: Option<PathBuf>,

    /// Smallest font size used for a text run, in points. Default: 6.
    pub min_font_size: f32,

    /// Relative tolerance between raster and page aspect ratios. Default: 0.02.
    pub aspect_tolerance: f64,

    /// Optional per-page progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            dpi: DEFAULT_DPI,
            max_rendered_pixels: 10_000,
            embedded_images: false,
            workers: default_workers(),
            service_path: PathBuf::from(DEFAULT_SERVICE),
            recognition: RecognitionOptions::default(),
            pages: None,
            skip_pages: None,
            page_timeout_secs: 120,
            job_timeout_secs: 3600,
            drain_timeout_secs: 5,
            password: None,
            font_path: None,
            min_font_size: 6.0,
            aspect_tolerance: 0.02,
            progress_callback: None,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl fmt::Debug for OcrConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OcrConfig")
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("embedded_images", &self.embedded_images)
            .field("workers", &self.workers)
            .field("service_path", &self.service_path)
            .field("recognition", &self.recognition)
            .field("pages", &self.pages)
            .field("skip_pages", &self.skip_pages)
            .field("page_timeout_secs", &self.page_timeout_secs)
            .field("job_timeout_secs", &self.job_timeout_secs)
            .field("drain_timeout_secs", &self.drain_timeout_secs)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("font_path", &self.font_path)
            .field("min_font_size", &self.min_font_size)
            .field("aspect_tolerance", &self.aspect_tolerance)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn JobProgressCallback>"),
            )
            .finish()
    }
}

impl OcrConfig {
    /// Create a new builder for `OcrConfig`.
    pub fn builder() -> OcrConfigBuilder {
        OcrConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// The configured progress callback, or a no-op one.
    pub fn progress(&self) -> ProgressCallback {
        self.progress_callback
            .clone()
            .unwrap_or_else(|| Arc::new(NoopProgressCallback))
    }

    /// Resolve `pages` minus `skip_pages` against a `total`-page document.
    ///
    /// Out-of-range pages and an empty result are fatal.
    pub fn resolve_selection(&self, total: usize) -> Result<PageSelection, OcrError> {
        let selection = match &self.pages {
            Some(expr) => PageSelection::parse_bounded(expr, total).map_err(|e| match e {
                PageRangeError::OutOfBounds { page, total } => {
                    OcrError::PageOutOfRange { page, total }
                }
                other => OcrError::InvalidPageRange(other),
            })?,
            None => PageSelection::all(total),
        };
        let selection = match &self.skip_pages {
            Some(expr) => selection.without(&PageSelection::parse(expr)?),
            None => selection,
        };
        if selection.is_empty() {
            return Err(OcrError::EmptySelection);
        }
        Ok(selection)
    }
}

/// Builder for [`OcrConfig`].
#[derive(Debug)]
pub struct OcrConfigBuilder {
    config: OcrConfig,
}

impl OcrConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 1200);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.config.workers = n.max(1);
        self
    }

    pub fn service_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.service_path = path.into();
        self
    }

    pub fn recognition(mut self, options: RecognitionOptions) -> Self {
        self.config.recognition = options;
        self
    }

    pub fn languages<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.recognition.languages = languages.into_iter().map(Into::into).collect();
        self
    }

    pub fn recognition_level(mut self, level: RecognitionLevel) -> Self {
        self.config.recognition.level = level;
        self
    }

    pub fn uses_cpu_only(mut self, v: bool) -> Self {
        self.config.recognition.uses_cpu_only = v;
        self
    }

    pub fn auto_detect_language(mut self, v: bool) -> Self {
        self.config.recognition.auto_detect_language = v;
        self
    }

    pub fn pages(mut self, expr: impl Into<String>) -> Self {
        self.config.pages = Some(expr.into());
        self
    }

    pub fn skip_pages(mut self, expr: impl Into<String>) -> Self {
        self.config.skip_pages = Some(expr.into());
        self
    }

    pub fn page_timeout_secs(mut self, secs: u64) -> Self {
        self.config.page_timeout_secs = secs;
        self
    }

    pub fn job_timeout_secs(mut self, secs: u64) -> Self {
        self.config.job_timeout_secs = secs;
        self
    }

    pub fn drain_timeout_secs(mut self, secs: u64) -> Self {
        self.config.drain_timeout_secs = secs;
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn font_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.font_path = Some(path.into());
        self
    }

    pub fn min_font_size(mut self, size: f32) -> Self {
        self.config.min_font_size = size;
        self
    }

    pub fn embedded_images(mut self, enabled: bool) -> Self {
        self.config.embedded_images = enabled;
        self
    }

    pub fn aspect_tolerance(mut self, tolerance: f64) -> Self {
        self.config.aspect_tolerance = tolerance;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<OcrConfig, OcrError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 1200 {
            return Err(OcrError::InvalidConfig(format!(
                "DPI must be 72–1200, got {}",
                c.dpi
            )));
        }
        if c.workers == 0 {
            return Err(OcrError::InvalidConfig("Workers must be ≥ 1".into()));
        }
        if c.page_timeout_secs == 0 || c.job_timeout_secs == 0 {
            return Err(OcrError::InvalidConfig("Timeouts must be ≥ 1 second".into()));
        }
        if c.recognition.languages.is_empty() {
            return Err(OcrError::InvalidConfig(
                "At least one recognition language is required".into(),
            ));
        }
        if !(c.min_font_size.is_finite() && c.min_font_size > 0.0) {
            return Err(OcrError::InvalidConfig(format!(
                "Minimum font size must be positive, got {}",
                c.min_font_size
            )));
        }
        if !(c.aspect_tolerance.is_finite() && c.aspect_tolerance >= 0.0) {
            return Err(OcrError::InvalidConfig(format!(
                "Aspect tolerance must be ≥ 0, got {}",
                c.aspect_tolerance
            )));
        }
        // Syntax errors surface here; bounds are checked once the page count is known.
        if let Some(expr) = &c.pages {
            PageSelection::parse(expr)?;
        }
        if let Some(expr) = &c.skip_pages {
            PageSelection::parse(expr)?;
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = OcrConfig::default();
        assert_eq!(c.dpi, 300);
        assert_eq!(c.service_path, PathBuf::from("ocrbridge"));
        assert_eq!(c.recognition.languages, vec!["zh-Hans", "zh-Hant", "en-US"]);
        assert!(c.recognition.auto_detect_language);
        assert!(c.workers >= 1);
        assert_eq!(c.page_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn builder_clamps_dpi_and_workers() {
        let c = OcrConfig::builder().dpi(5000).workers(0).build().unwrap();
        assert_eq!(c.dpi, 1200);
        assert_eq!(c.workers, 1);
    }

    #[test]
    fn builder_rejects_bad_range_syntax() {
        let err = OcrConfig::builder().pages("3-1").build().unwrap_err();
        assert!(matches!(
            err,
            OcrError::InvalidPageRange(PageRangeError::Descending { start: 3, end: 1 })
        ));
    }

    #[test]
    fn builder_rejects_empty_languages() {
        let err = OcrConfig::builder()
            .languages(Vec::<String>::new())
            .build()
            .unwrap_err();
        assert!(matches!(err, OcrError::InvalidConfig(_)));
    }

    #[test]
    fn selection_applies_skip_pages() {
        let c = OcrConfig::builder()
            .pages("1-6")
            .skip_pages("2,4-5")
            .build()
            .unwrap();
        assert_eq!(c.resolve_selection(10).unwrap().pages(), &[1, 3, 6]);
    }

    #[test]
    fn selection_defaults_to_all_pages() {
        let c = OcrConfig::default();
        assert_eq!(c.resolve_selection(3).unwrap().pages(), &[1, 2, 3]);
    }

    #[test]
    fn selection_out_of_bounds_is_fatal() {
        let c = OcrConfig::builder().pages("2-5").build().unwrap();
        assert!(matches!(
            c.resolve_selection(4),
            Err(OcrError::PageOutOfRange { page: 5, total: 4 })
        ));
    }

    #[test]
    fn skip_pages_beyond_the_document_are_ignored() {
        let c = OcrConfig::builder().skip_pages("3-9").build().unwrap();
        assert_eq!(c.resolve_selection(4).unwrap().pages(), &[1, 2]);
    }

    #[test]
    fn selection_fully_skipped_is_fatal() {
        let c = OcrConfig::builder().skip_pages("1-3").build().unwrap();
        assert!(matches!(c.resolve_selection(3), Err(OcrError::EmptySelection)));
    }

    #[test]
    fn tesseract_codes_map_to_bcp47() {
        assert_eq!(languages_from_tesseract("eng+chi_sim"), vec!["en-US", "zh-Hans"]);
        assert_eq!(languages_from_tesseract("chi_tra"), vec!["zh-Hant"]);
        assert_eq!(languages_from_tesseract("eng+eng+xyz"), vec!["en-US", "xyz"]);
        assert!(languages_from_tesseract("").is_empty());
    }

    #[test]
    fn debug_redacts_password() {
        let c = OcrConfig::builder().password("hunter2").build().unwrap();
        let s = format!("{c:?}");
        assert!(!s.contains("hunter2"));
        assert!(s.contains("<redacted>"));
    }
}
