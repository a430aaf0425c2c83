//! Integration tests for the recognition channel against a scripted service.

mod common;

use common::{connect, Reply, Script};
use futures::future::join_all;
use ocr_overlay::{PageError, PageOutcome, RecognitionLevel, RecognitionRequest};
use std::path::PathBuf;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

fn request(page: usize) -> RecognitionRequest {
    RecognitionRequest {
        image_path: PathBuf::from(format!("/tmp/page_{page:06}.png")),
        page_index: page,
        width: 1000,
        height: 1000,
        dpi: 300,
        languages: vec!["en-US".into()],
        recognition_level: RecognitionLevel::Accurate,
        uses_cpu_only: false,
        auto_detect_language: true,
    }
}

fn text_of(outcome: &PageOutcome) -> String {
    match outcome {
        PageOutcome::Recognized(r) => r.items[0].text.clone(),
        PageOutcome::Failed(e) => panic!("page failed: {e}"),
    }
}

// ── Framing ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_submits_stay_one_request_per_line() {
    let pages: Vec<usize> = (1..=20).collect();
    let replies = pages.iter().rev().map(|&p| Reply::Result(p)).collect();
    let (channel, service) = connect(Script::new(pages.len(), replies));

    let pending = join_all(pages.iter().map(|&p| channel.submit(request(p)))).await;
    let waits = pending
        .into_iter()
        .map(|p| p.expect("submit failed").wait(WAIT, None));
    let outcomes = join_all(waits).await;

    for (page, outcome) in pages.iter().zip(&outcomes) {
        assert_eq!(outcome.page_index(), *page);
        assert_eq!(text_of(outcome), format!("page {page}"));
    }

    let summary = channel.close(Duration::from_secs(1)).await;
    assert!(summary.drained);
    assert_eq!(summary.completed, 20);
    assert_eq!(summary.abandoned, 0);
    assert!(!summary.lost);

    let transcript = service.await.unwrap();
    let mut seen = transcript.pages();
    seen.sort_unstable();
    assert_eq!(seen, (1..=20).collect::<Vec<u64>>());
    assert!(transcript.got_stop);
}

// ── Correlation ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_out_of_order_results_reach_their_pages() {
    let (channel, service) = connect(Script::new(
        3,
        vec![Reply::Result(3), Reply::Result(1), Reply::Result(2)],
    ));

    let p1 = channel.submit(request(1)).await.unwrap();
    let p2 = channel.submit(request(2)).await.unwrap();
    let p3 = channel.submit(request(3)).await.unwrap();

    assert_eq!(text_of(&p3.wait(WAIT, None).await), "page 3");
    assert_eq!(text_of(&p1.wait(WAIT, None).await), "page 1");
    assert_eq!(text_of(&p2.wait(WAIT, None).await), "page 2");

    channel.close(Duration::from_secs(1)).await;
    assert_eq!(service.await.unwrap().pages(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_malformed_and_stray_lines_are_counted_and_skipped() {
    let (channel, _service) = connect(Script::new(
        2,
        vec![
            Reply::Raw("not json at all"),
            Reply::Raw("{\"type\":\"progress\",\"page_index\":1}"),
            Reply::Result(99),
            Reply::Result(1),
            Reply::Result(1),
            Reply::Raw(""),
            Reply::Error(2, "unsupported image"),
        ],
    ));

    let p1 = channel.submit(request(1)).await.unwrap();
    let p2 = channel.submit(request(2)).await.unwrap();

    assert_eq!(text_of(&p1.wait(WAIT, None).await), "page 1");
    match p2.wait(WAIT, None).await {
        PageOutcome::Failed(PageError::Engine { page: 2, message }) => {
            assert_eq!(message, "unsupported image")
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    let summary = channel.close(Duration::from_secs(1)).await;
    // Unknown page 99 and the duplicate result for page 1.
    assert_eq!(summary.anomalies, 2);
    // Invalid JSON and the unknown message type.
    assert_eq!(summary.protocol_errors, 2);
    assert_eq!(summary.completed, 1);
    assert!(!summary.lost);
}

#[tokio::test]
async fn test_duplicate_in_flight_page_is_rejected() {
    let (channel, service) = connect(Script::new(1, vec![]));

    let first = channel.submit(request(4)).await.unwrap();
    let err = channel.submit(request(4)).await.err().expect("duplicate accepted");
    assert!(matches!(err, PageError::DuplicateRequest { page: 4 }));

    let summary = channel.close(Duration::from_millis(100)).await;
    assert_eq!(summary.abandoned, 1);
    assert!(!first.wait(WAIT, None).await.is_success());
    assert_eq!(service.await.unwrap().pages(), vec![4]);
}

// ── Timeouts and shutdown ────────────────────────────────────────────────────

#[tokio::test]
async fn test_page_timeout_settles_only_its_slot() {
    let (channel, _service) = connect(Script::new(2, vec![Reply::Result(2)]));

    let p1 = channel.submit(request(1)).await.unwrap();
    let p2 = channel.submit(request(2)).await.unwrap();

    assert!(p2.wait(WAIT, None).await.is_success());
    match p1.wait(Duration::from_millis(200), None).await {
        PageOutcome::Failed(PageError::Timeout { page: 1, .. }) => {}
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(channel.correlator().pending_count(), 0);

    let summary = channel.close(Duration::from_millis(100)).await;
    assert!(summary.drained);
    assert_eq!(summary.abandoned, 0);
}

#[tokio::test]
async fn test_close_abandons_unanswered_pages_after_drain() {
    let (channel, service) = connect(Script::new(1, vec![]));

    let p1 = channel.submit(request(1)).await.unwrap();
    let summary = channel.close(Duration::from_millis(200)).await;
    assert!(!summary.drained);
    assert_eq!(summary.abandoned, 1);
    assert!(!summary.lost);

    match p1.wait(WAIT, None).await {
        PageOutcome::Failed(PageError::ChannelLost { page: 1, .. }) => {}
        other => panic!("expected channel loss, got {other:?}"),
    }
    assert!(service.await.unwrap().got_stop);

    let err = channel.submit(request(2)).await.err().expect("submit after close");
    assert!(matches!(err, PageError::ChannelLost { page: 2, .. }));
}

#[tokio::test]
async fn test_service_exit_fails_pending_pages() {
    let (channel, _service) = connect(Script::new(2, vec![Reply::Result(1)]).then_exit());

    let p1 = channel.submit(request(1)).await.unwrap();
    let p2 = channel.submit(request(2)).await.unwrap();

    assert!(p1.wait(WAIT, None).await.is_success());
    match p2.wait(WAIT, None).await {
        PageOutcome::Failed(PageError::ChannelLost { page: 2, .. }) => {}
        other => panic!("expected channel loss, got {other:?}"),
    }
    assert!(channel.is_lost());

    let summary = channel.close(Duration::from_millis(100)).await;
    assert!(summary.lost);
    assert_eq!(summary.completed, 1);
}

#[tokio::test]
async fn test_close_with_unbounded_drain_returns_once_drained() {
    let (channel, _service) = connect(Script::new(1, vec![Reply::Result(1)]));

    let p1 = channel.submit(request(1)).await.unwrap();
    assert!(p1.wait(Duration::MAX, None).await.is_success());

    let summary = channel.close(Duration::MAX).await;
    assert!(summary.drained);
    assert_eq!(summary.completed, 1);
}
