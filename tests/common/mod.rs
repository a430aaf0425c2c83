//! Scripted in-process recognition service for integration tests.
//!
//! The fake speaks the same line-framed JSON as the real service over a
//! `tokio::io::duplex` pipe: it reads a fixed number of `ocr` requests,
//! writes a scripted batch of replies, then either keeps reading until
//! `stop` or exits abruptly.

#![allow(dead_code)]

use ocr_overlay::pipeline::render::RenderJob;
use ocr_overlay::{PageError, RecognitionChannel};
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;

/// One scripted line written back to the client.
#[derive(Debug, Clone)]
pub enum Reply {
    /// A result with one text run named after the page.
    Result(usize),
    /// An engine error attributed to a page.
    Error(usize, &'static str),
    /// Written verbatim (plus newline).
    Raw(&'static str),
}

/// What the fake does after writing its replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum After {
    /// Keep reading until `stop` or EOF.
    KeepOpen,
    /// Close both directions immediately.
    Exit,
}

#[derive(Debug, Clone)]
pub struct Script {
    /// Requests to read before replying.
    pub collect: usize,
    pub replies: Vec<Reply>,
    pub after: After,
}

impl Script {
    pub fn new(collect: usize, replies: Vec<Reply>) -> Self {
        Self {
            collect,
            replies,
            after: After::KeepOpen,
        }
    }

    pub fn then_exit(mut self) -> Self {
        self.after = After::Exit;
        self
    }
}

/// Everything the fake saw on its input.
#[derive(Debug, Default)]
pub struct Transcript {
    pub requests: Vec<Value>,
    pub got_stop: bool,
}

impl Transcript {
    pub fn pages(&self) -> Vec<u64> {
        self.requests
            .iter()
            .filter_map(|r| r["page_index"].as_u64())
            .collect()
    }
}

pub fn result_line(page: usize) -> String {
    json!({
        "type": "result",
        "page_index": page,
        "width": 1000,
        "height": 1000,
        "items": [{
            "text": format!("page {page}"),
            "bbox": {"x": 0.1, "y": 0.8, "w": 0.5, "h": 0.05},
            "confidence": 0.9
        }]
    })
    .to_string()
}

fn render(reply: &Reply) -> String {
    match reply {
        Reply::Result(page) => result_line(*page),
        Reply::Error(page, message) => {
            json!({"type": "error", "page_index": page, "message": message}).to_string()
        }
        Reply::Raw(line) => line.to_string(),
    }
}

/// Connect a channel to a fake service running `script`.
pub fn connect(script: Script) -> (RecognitionChannel, JoinHandle<Transcript>) {
    let (client, service) = tokio::io::duplex(64 * 1024);
    let (client_r, client_w) = tokio::io::split(client);
    let channel = RecognitionChannel::from_io(client_r, client_w);

    let handle = tokio::spawn(async move {
        let (service_r, mut service_w) = tokio::io::split(service);
        let mut lines = BufReader::new(service_r).lines();
        let mut transcript = Transcript::default();
        let mut replied = false;

        loop {
            if !replied && transcript.requests.len() >= script.collect {
                for reply in &script.replies {
                    let mut line = render(reply);
                    line.push('\n');
                    if service_w.write_all(line.as_bytes()).await.is_err() {
                        return transcript;
                    }
                }
                let _ = service_w.flush().await;
                replied = true;
                if script.after == After::Exit {
                    return transcript;
                }
            }

            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                _ => return transcript,
            };
            let value: Value = serde_json::from_str(&line).expect("client sent invalid JSON");
            match value["cmd"].as_str() {
                Some("stop") => {
                    transcript.got_stop = true;
                    return transcript;
                }
                Some("ocr") => transcript.requests.push(value),
                other => panic!("unexpected command {other:?}"),
            }
        }
    });

    (channel, handle)
}

/// A render job for a raster that is never read by the fake.
pub fn job(page: usize) -> RenderJob {
    RenderJob {
        page_index: page,
        dpi: 300,
        image_path: PathBuf::from(format!("/tmp/ocr-overlay-test/page_{page:06}.png")),
        pixel_width: 1000,
        pixel_height: 1000,
        temporary: false,
    }
}

pub fn jobs(pages: &[usize]) -> Vec<Result<RenderJob, PageError>> {
    pages.iter().map(|&p| Ok(job(p))).collect()
}
