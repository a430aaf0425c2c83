//! Wire format of the recognition service: one JSON object per line.
//!
//! ```text
//! → {"cmd":"ocr","image_path":"/tmp/p_000003.png","page_index":3,"width":2480,"height":3508,
//!    "dpi":300,"languages":["en-US"],"recognition_level":"accurate",
//!    "uses_cpu_only":false,"auto_detect_language":true}
//! ← {"type":"result","page_index":3,"width":2480,"height":3508,
//!    "items":[{"text":"Hello","bbox":{"x":0.1,"y":0.8,"w":0.2,"h":0.02},"confidence":0.98}]}
//! ← {"type":"error","page_index":3,"message":"cannot load image"}
//! → {"cmd":"stop"}
//! ```
//!
//! Both directions are independent; responses carry no request id, so the
//! page index is the only correlation key.

use crate::error::ProtocolError;
use crate::pipeline::geometry::NormalizedBox;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default DPI advertised to the service when the caller leaves it unset.
pub const DEFAULT_DPI: u32 = 300;

/// Default recognition languages (Simplified Chinese, Traditional Chinese, US English).
pub const DEFAULT_LANGUAGES: [&str; 3] = ["zh-Hans", "zh-Hant", "en-US"];

/// Speed/accuracy trade-off requested from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecognitionLevel {
    #[default]
    Accurate,
    Fast,
}

/// A command sent to the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum Request {
    /// Recognise one image.
    Ocr(RecognitionRequest),
    /// Graceful shutdown; the service sends no reply.
    Stop,
}

/// Payload of an `ocr` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionRequest {
    pub image_path: PathBuf,
    pub page_index: usize,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_dpi")]
    pub dpi: u32,
    #[serde(default = "default_languages")]
    pub languages: Vec<String>,
    #[serde(default)]
    pub recognition_level: RecognitionLevel,
    #[serde(default)]
    pub uses_cpu_only: bool,
    #[serde(default = "default_true")]
    pub auto_detect_language: bool,
}

/// A message received from the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Response {
    Result(ResultPayload),
    Error(ErrorPayload),
}

/// Successful recognition of one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    pub page_index: usize,
    pub width: u32,
    pub height: u32,
    pub items: Vec<RecognizedItem>,
}

/// Engine failure, attributed to a page when the service could tell which.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub page_index: Option<usize>,
    #[serde(default = "default_error_message")]
    pub message: String,
}

/// One recognised text run with its normalized bounding box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizedItem {
    pub text: String,
    pub bbox: NormalizedBox,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_dpi() -> u32 {
    DEFAULT_DPI
}

fn default_languages() -> Vec<String> {
    DEFAULT_LANGUAGES.iter().map(|s| s.to_string()).collect()
}

fn default_true() -> bool {
    true
}

fn default_error_message() -> String {
    "recognition service error".to_string()
}

fn default_confidence() -> f64 {
    1.0
}

/// Serialise a request as a single `\n`-terminated line.
pub fn encode_line(request: &Request) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    Ok(line)
}

/// Parse one inbound line. `line_no` is 1-based and only used for reporting.
///
/// Returns `Ok(None)` for blank lines.
pub fn decode_line(line: &str, line_no: u64) -> Result<Option<Response>, ProtocolError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|e| ProtocolError::Malformed {
            line: line_no,
            detail: e.to_string(),
        })
}
