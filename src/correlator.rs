//! Correlation of asynchronous responses back to their pages.
//!
//! Every dispatched page gets a single-fulfilment slot keyed by its page
//! index. The reader side of the channel settles slots as responses arrive,
//! in whatever order the service emits them; the dispatch side awaits each
//! page's [`PendingPage`] independently, bounded by a per-page timeout and
//! the job deadline.
//!
//! A slot is settled exactly once: by a response, by a timeout, or by the
//! channel going away. Anything that arrives for a page afterwards (or for a
//! page that was never registered) is a protocol anomaly: logged, counted,
//! discarded.

use crate::error::{PageError, ProtocolError};
use crate::protocol::RecognizedItem;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Horizon used when a timeout is too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + timeout`, saturating at a point decades away instead of
/// overflowing the clock.
pub(crate) fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

/// Recognition output for one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizedPage {
    pub page_index: usize,
    /// Pixel dimensions echoed by the service.
    pub width: u32,
    pub height: u32,
    pub items: Vec<RecognizedItem>,
}

/// Final state of a page slot.
#[derive(Debug, Clone, PartialEq)]
pub enum PageOutcome {
    Recognized(RecognizedPage),
    Failed(PageError),
}

impl PageOutcome {
    pub fn page_index(&self) -> usize {
        match self {
            PageOutcome::Recognized(p) => p.page_index,
            PageOutcome::Failed(e) => e.page(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PageOutcome::Recognized(_))
    }
}

#[derive(Default)]
struct Slots {
    pending: HashMap<usize, oneshot::Sender<PageOutcome>>,
    settled: HashSet<usize>,
}

struct Shared {
    slots: Mutex<Slots>,
    settled_notify: Notify,
    anomalies: AtomicUsize,
    completed: AtomicUsize,
}

/// Table of pending page slots shared between dispatch and response handling.
///
/// Cheap to clone; all clones refer to the same table.
#[derive(Clone)]
pub struct ResultCorrelator {
    shared: Arc<Shared>,
}

impl Default for ResultCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultCorrelator {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                slots: Mutex::new(Slots::default()),
                settled_notify: Notify::new(),
                anomalies: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
            }),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        // A poisoned table only means another thread panicked mid-update;
        // the map itself is still consistent.
        self.shared
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open a slot for `page`. Fails if a request for it is already in flight.
    ///
    /// A page that was settled earlier in the job may be registered again
    /// (e.g. a retry); its old settlement is forgotten.
    pub fn register(&self, page: usize) -> Result<PendingPage, PageError> {
        let (tx, rx) = oneshot::channel();
        let mut slots = self.slots();
        if slots.pending.contains_key(&page) {
            return Err(PageError::DuplicateRequest { page });
        }
        slots.settled.remove(&page);
        slots.pending.insert(page, tx);
        drop(slots);

        debug!("Page {}: slot registered", page);
        Ok(PendingPage {
            page_index: page,
            registered_at: Instant::now(),
            rx,
            correlator: self.clone(),
        })
    }

    /// Settle the slot for `page` with `outcome`.
    ///
    /// Responses for unknown or already-settled pages are anomalies; they are
    /// counted and returned as errors but never panic or block.
    pub fn fulfill(&self, page: usize, outcome: PageOutcome) -> Result<(), ProtocolError> {
        let sender = {
            let mut slots = self.slots();
            match slots.pending.remove(&page) {
                Some(tx) => {
                    slots.settled.insert(page);
                    tx
                }
                None => {
                    let err = if slots.settled.contains(&page) {
                        ProtocolError::AlreadySettled { page }
                    } else {
                        ProtocolError::UnknownPage { page }
                    };
                    drop(slots);
                    self.shared.anomalies.fetch_add(1, Ordering::Relaxed);
                    warn!("Protocol anomaly: {}", err);
                    return Err(err);
                }
            }
        };

        if outcome.is_success() {
            self.shared.completed.fetch_add(1, Ordering::Relaxed);
        }
        // The waiter may have given up already; nothing else to do then.
        if sender.send(outcome).is_err() {
            debug!("Page {}: waiter dropped before settlement", page);
        }
        self.shared.settled_notify.notify_waiters();
        Ok(())
    }

    /// Settle a slot without a response (timeout, send failure).
    ///
    /// Returns `false` when the slot was already settled.
    pub fn expire(&self, page: usize) -> bool {
        let removed = {
            let mut slots = self.slots();
            let removed = slots.pending.remove(&page).is_some();
            if removed {
                slots.settled.insert(page);
            }
            removed
        };
        if removed {
            self.shared.settled_notify.notify_waiters();
        }
        removed
    }

    /// Settle every pending slot with a failure built by `make_error`.
    ///
    /// Already-settled pages keep their outcome. Returns how many were failed.
    pub fn fail_all(&self, make_error: impl Fn(usize) -> PageError) -> usize {
        let drained: Vec<(usize, oneshot::Sender<PageOutcome>)> = {
            let mut slots = self.slots();
            let drained: Vec<_> = slots.pending.drain().collect();
            for (page, _) in &drained {
                slots.settled.insert(*page);
            }
            drained
        };

        let count = drained.len();
        for (page, tx) in drained {
            let _ = tx.send(PageOutcome::Failed(make_error(page)));
        }
        if count > 0 {
            self.shared.settled_notify.notify_waiters();
        }
        count
    }

    /// Number of slots still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.slots().pending.len()
    }

    /// Number of slots settled with a successful recognition.
    pub fn completed_count(&self) -> usize {
        self.shared.completed.load(Ordering::Relaxed)
    }

    /// Number of discarded responses (unknown or already-settled pages).
    pub fn anomaly_count(&self) -> usize {
        self.shared.anomalies.load(Ordering::Relaxed)
    }

    /// Wait until no slot is pending or `deadline` passes. Returns `true` if drained.
    pub async fn wait_drained(&self, deadline: Instant) -> bool {
        loop {
            let notified = self.shared.settled_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending_count() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.pending_count() == 0;
            }
        }
    }
}

/// Handle for one page's pending result.
pub struct PendingPage {
    page_index: usize,
    registered_at: Instant,
    rx: oneshot::Receiver<PageOutcome>,
    correlator: ResultCorrelator,
}

impl PendingPage {
    pub fn page_index(&self) -> usize {
        self.page_index
    }

    /// Await the outcome, giving up at `registered_at + page_timeout` or at
    /// `job_deadline`, whichever comes first.
    ///
    /// Never blocks other pages; on expiry the slot is settled as a
    /// [`PageError::Timeout`] so late responses are discarded as anomalies.
    pub async fn wait(self, page_timeout: Duration, job_deadline: Option<Instant>) -> PageOutcome {
        let page_deadline = deadline_after(self.registered_at, page_timeout);
        let deadline = match job_deadline {
            Some(job) if job < page_deadline => job,
            _ => page_deadline,
        };
        let page = self.page_index;
        let mut rx = self.rx;

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => PageOutcome::Failed(PageError::ChannelLost {
                page,
                detail: "slot dropped without a response".into(),
            }),
            Err(_) => {
                if self.correlator.expire(page) {
                    let secs = deadline.duration_since(self.registered_at).as_secs();
                    warn!("Page {}: timed out after {}s", page, secs);
                    PageOutcome::Failed(PageError::Timeout { page, secs })
                } else {
                    // Settled between the timer firing and the expiry; take it.
                    match rx.try_recv() {
                        Ok(outcome) => outcome,
                        Err(_) => PageOutcome::Failed(PageError::Timeout {
                            page,
                            secs: page_timeout.as_secs(),
                        }),
                    }
                }
            }
        }
    }
}


impl std::fmt::Debug for PendingPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingPage")
            .field("page_index", &self.page_index)
            .field("registered_at", &self.registered_at)
            .finish_non_exhaustive()
    }
}
