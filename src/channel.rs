//! The persistent duplex connection to the recognition service.
//!
//! One [`RecognitionChannel`] owns both halves of the connection:
//!
//! * the **write half**, behind an async mutex. [`RecognitionChannel::submit`]
//!   holds the lock across `write_all` + `flush`, so concurrent callers
//!   produce whole, non-interleaved lines;
//! * the **read half**, consumed by a single background task that decodes
//!   each line and settles the matching slot in the [`ResultCorrelator`].
//!
//! The two halves only meet through the correlator. Responses may arrive in
//! any order; malformed lines are logged and counted without closing the
//! channel. If the service closes its output while pages are pending, every
//! pending page fails with [`PageError::ChannelLost`] and pages that already
//! completed keep their results.

use crate::correlator::{
    deadline_after, PageOutcome, PendingPage, RecognizedPage, ResultCorrelator,
};
use crate::error::{OcrError, PageError, ProtocolError};
use crate::protocol::{decode_line, encode_line, RecognitionRequest, Request, Response};
use futures::StreamExt;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, error, info, warn};

/// How long the service gets to exit after `stop` before it is killed.
const STOP_GRACE: Duration = Duration::from_secs(5);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// State shared between the channel handle and its reader task.
struct ReaderState {
    correlator: ResultCorrelator,
    closing: AtomicBool,
    eof: AtomicBool,
    lost: AtomicBool,
    protocol_errors: AtomicUsize,
}

/// What [`RecognitionChannel::close`] observed while shutting down.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelSummary {
    /// Every in-flight response arrived before the drain deadline.
    pub drained: bool,
    /// Pages still pending at shutdown, failed as channel loss.
    pub abandoned: usize,
    /// Pages settled with a recognition result.
    pub completed: usize,
    /// Responses for unknown or already-settled pages.
    pub anomalies: usize,
    /// Malformed or unattributable lines.
    pub protocol_errors: usize,
    /// The service closed its output before we asked it to stop.
    pub lost: bool,
}

/// A single long-lived connection to the recognition service.
pub struct RecognitionChannel {
    writer: tokio::sync::Mutex<Option<BufWriter<BoxedWriter>>>,
    state: Arc<ReaderState>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
    child: std::sync::Mutex<Option<Child>>,
    service: Option<PathBuf>,
}

impl RecognitionChannel {
    /// Start the service executable and connect to its stdin/stdout.
    ///
    /// Its stderr is forwarded line by line to the `debug` log. A bare name
    /// without path separators is looked up on `PATH`.
    pub fn spawn(service_path: &Path) -> Result<Self, OcrError> {
        let explicit = service_path.components().count() > 1 || service_path.is_absolute();
        if explicit && !service_path.exists() {
            return Err(OcrError::ServiceNotFound {
                path: service_path.to_path_buf(),
            });
        }

        let mut child = Command::new(service_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => OcrError::ServiceNotFound {
                    path: service_path.to_path_buf(),
                },
                _ => OcrError::ServiceSpawnFailed {
                    path: service_path.to_path_buf(),
                    source: e,
                },
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| OcrError::Internal("service stdin was not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OcrError::Internal("service stdout was not captured".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr));
        }

        info!(
            "Recognition service started: {} (pid {})",
            service_path.display(),
            child.id().map(|id| id.to_string()).unwrap_or_else(|| "?".into())
        );

        let mut channel = Self::from_io(stdout, stdin);
        channel.child = std::sync::Mutex::new(Some(child));
        channel.service = Some(service_path.to_path_buf());
        Ok(channel)
    }

    /// Connect to a service over arbitrary byte streams.
    ///
    /// Must be called from within a Tokio runtime; the reader task is
    /// spawned immediately.
    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let state = Arc::new(ReaderState {
            correlator: ResultCorrelator::new(),
            closing: AtomicBool::new(false),
            eof: AtomicBool::new(false),
            lost: AtomicBool::new(false),
            protocol_errors: AtomicUsize::new(0),
        });
        let handle = tokio::spawn(read_responses(reader, state.clone()));
        let writer: BoxedWriter = Box::new(writer);

        Self {
            writer: tokio::sync::Mutex::new(Some(BufWriter::new(writer))),
            state,
            reader: std::sync::Mutex::new(Some(handle)),
            child: std::sync::Mutex::new(None),
            service: None,
        }
    }

    /// The correlation table fed by this channel.
    pub fn correlator(&self) -> &ResultCorrelator {
        &self.state.correlator
    }

    /// `true` once the service closed its output without being asked to.
    pub fn is_lost(&self) -> bool {
        self.state.lost.load(Ordering::SeqCst)
    }

    pub fn protocol_error_count(&self) -> usize {
        self.state.protocol_errors.load(Ordering::Relaxed)
    }

    fn unavailable(&self, page: usize) -> Option<PageError> {
        if self.state.closing.load(Ordering::SeqCst) {
            Some(PageError::ChannelLost {
                page,
                detail: "channel is closing".into(),
            })
        } else if self.state.eof.load(Ordering::SeqCst) {
            Some(PageError::ChannelLost {
                page,
                detail: "service closed its output".into(),
            })
        } else {
            None
        }
    }

    /// Send one `ocr` request and return the handle to await its result.
    ///
    /// The page's slot is registered before the line is written, so a
    /// response can never overtake its own registration. Waits for the
    /// write lock; returns once the line is flushed.
    pub async fn submit(&self, request: RecognitionRequest) -> Result<PendingPage, PageError> {
        let page = request.page_index;
        if let Some(err) = self.unavailable(page) {
            return Err(err);
        }

        let line = encode_line(&Request::Ocr(request)).map_err(|e| PageError::ChannelLost {
            page,
            detail: format!("cannot encode request: {e}"),
        })?;

        let pending = self.state.correlator.register(page)?;
        // The reader may have hit EOF between the check above and registration.
        if let Some(err) = self.unavailable(page) {
            self.state.correlator.expire(page);
            return Err(err);
        }

        let written = {
            let mut guard = self.writer.lock().await;
            match guard.as_mut() {
                Some(w) => write_line(w, line.as_bytes()).await,
                None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "writer closed")),
            }
        };

        if let Err(e) = written {
            self.state.correlator.expire(page);
            return Err(PageError::ChannelLost {
                page,
                detail: format!("write failed: {e}"),
            });
        }
        debug!("Page {}: request sent", page);
        Ok(pending)
    }

    /// Drain in-flight responses, then stop the service.
    ///
    /// Waits up to `drain` for pending slots to settle, sends `stop`, closes
    /// the write half and gives the service a few seconds to exit before
    /// killing it. Slots still pending afterwards fail as channel loss.
    pub async fn close(&self, drain: Duration) -> ChannelSummary {
        let correlator = &self.state.correlator;
        let drained = correlator.wait_drained(deadline_after(Instant::now(), drain)).await;
        if !drained {
            warn!(
                "{} requests still pending after {}s drain",
                correlator.pending_count(),
                drain.as_secs()
            );
        }

        self.state.closing.store(true, Ordering::SeqCst);

        let writer = self.writer.lock().await.take();
        if let Some(mut w) = writer {
            if let Ok(stop) = encode_line(&Request::Stop) {
                if let Err(e) = write_line(&mut w, stop.as_bytes()).await {
                    debug!("Could not send stop: {}", e);
                }
            }
            let _ = w.shutdown().await;
        }

        let child = self
            .child
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(mut child) = child {
            match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!("Recognition service exited: {}", status),
                Ok(Err(e)) => warn!("Waiting for recognition service failed: {}", e),
                Err(_) => {
                    warn!(
                        "Recognition service {} did not exit within {}s; killing it",
                        self.service
                            .as_deref()
                            .map(|p| p.display().to_string())
                            .unwrap_or_default(),
                        STOP_GRACE.as_secs()
                    );
                    let _ = child.kill().await;
                }
            }
        }

        let handle = self
            .reader
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err() {
                debug!("Reader task still running after stop; aborting");
                handle.abort();
            }
        }

        let abandoned = correlator.fail_all(|page| PageError::ChannelLost {
            page,
            detail: "channel closed before a response arrived".into(),
        });

        ChannelSummary {
            drained,
            abandoned,
            completed: correlator.completed_count(),
            anomalies: correlator.anomaly_count(),
            protocol_errors: self.protocol_error_count(),
            lost: self.is_lost(),
        }
    }
}

impl Drop for RecognitionChannel {
    fn drop(&mut self) {
        if let Some(handle) = self
            .reader
            .get_mut()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

async fn write_line(writer: &mut BufWriter<BoxedWriter>, line: &[u8]) -> io::Result<()> {
    writer.write_all(line).await?;
    writer.flush().await
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim_end();
        if !line.is_empty() {
            debug!(target: "ocr_overlay::service", "{}", line);
        }
    }
}

async fn read_responses<R>(reader: R, state: Arc<ReaderState>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = LinesStream::new(BufReader::new(reader).lines());
    let mut line_no: u64 = 0;

    while let Some(next) = lines.next().await {
        line_no += 1;
        let line = match next {
            Ok(line) => line,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                state.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!("{}", ProtocolError::Malformed {
                    line: line_no,
                    detail: e.to_string(),
                });
                continue;
            }
            Err(e) => {
                warn!("Reading from recognition service failed: {}", e);
                break;
            }
        };

        match decode_line(&line, line_no) {
            Ok(None) => {}
            Ok(Some(response)) => route_response(&state, response, line_no),
            Err(e) => {
                state.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!("{}", e);
            }
        }
    }

    state.eof.store(true, Ordering::SeqCst);
    if state.closing.load(Ordering::SeqCst) {
        debug!("Recognition service output closed");
        return;
    }

    state.lost.store(true, Ordering::SeqCst);
    let failed = state.correlator.fail_all(|page| PageError::ChannelLost {
        page,
        detail: "service closed its output".into(),
    });
    if failed > 0 {
        error!(
            "Recognition service closed unexpectedly; {} pending pages failed",
            failed
        );
    } else {
        warn!("Recognition service closed unexpectedly");
    }
}

fn route_response(state: &ReaderState, response: Response, line_no: u64) {
    match response {
        Response::Result(payload) => {
            let page = payload.page_index;
            debug!("Page {}: {} items received", page, payload.items.len());
            // Anomalies are logged and counted by the correlator.
            let _ = state.correlator.fulfill(
                page,
                PageOutcome::Recognized(RecognizedPage {
                    page_index: page,
                    width: payload.width,
                    height: payload.height,
                    items: payload.items,
                }),
            );
        }
        Response::Error(payload) => match payload.page_index {
            Some(page) => {
                warn!("Page {}: engine error: {}", page, payload.message);
                let _ = state.correlator.fulfill(
                    page,
                    PageOutcome::Failed(PageError::Engine {
                        page,
                        message: payload.message,
                    }),
                );
            }
            None => {
                state.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "{}",
                    ProtocolError::Unattributed {
                        line: line_no,
                        message: payload.message,
                    }
                );
            }
        },
    }
}


impl std::fmt::Debug for RecognitionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecognitionChannel")
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}
