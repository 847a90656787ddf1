// Consumer end-to-end over captured firehose files.

use std::io::Write;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use slowwatch::detector::{DOPPLER_ORIGIN, TRUNCATING_BUFFER_COUNTER};
use slowwatch::{
    AlertKind, Consumer, ConsumerConfig, ConsumerError, Envelope, FeedMode, FeedRecord,
    FileFirehose, PipelineState, StreamError,
};
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

async fn next<T>(rx: &mut mpsc::Receiver<T>) -> Option<T> {
    timeout(WAIT, rx.recv()).await.expect("channel stalled")
}

fn capture(records: &[FeedRecord]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    for rec in records {
        file.write_all(rec.to_jsonl().as_bytes()).unwrap();
    }
    file.flush().unwrap();
    file
}

fn consumer(file: &NamedTempFile, mode: FeedMode) -> Consumer<FileFirehose> {
    let addr = format!("file://{}", file.path().display());
    let cfg = ConsumerConfig::new(addr, "bearer test", "slowwatch-it");
    Consumer::new(cfg, |c| Ok(FileFirehose::from_config(c, mode))).unwrap()
}

#[tokio::test]
async fn replay_relays_capture_and_raises_alerts() {
    let cpu = Envelope::value_metric("router", "cpu", 0.5, "%");
    let file = capture(&[
        FeedRecord::Envelope(Envelope::counter(DOPPLER_ORIGIN, TRUNCATING_BUFFER_COUNTER, 5, 5)),
        FeedRecord::Envelope(cpu.clone()),
        FeedRecord::Error(StreamError::close(1008, "too slow")),
    ]);
    let mut consumer = consumer(&file, FeedMode::Replay { speed: 0.0 });
    consumer.start().unwrap();
    let streams = consumer.streams().unwrap();

    let mut kinds = vec![
        next(&mut streams.detects).await.unwrap().kind,
        next(&mut streams.detects).await.unwrap().kind,
    ];
    kinds.sort_by_key(|k| k.to_string());
    assert_eq!(kinds, vec![AlertKind::BufferOverflow, AlertKind::PolicyViolation]);

    assert_eq!(next(&mut streams.events).await.unwrap().counter_name(), Some(TRUNCATING_BUFFER_COUNTER));
    assert_eq!(next(&mut streams.events).await, Some(cpu));
    assert_eq!(next(&mut streams.events).await, None);

    // end of capture closes the raw streams, no cancellation marker
    assert_eq!(next(&mut streams.errors).await, Some(StreamError::close(1008, "too slow")));
    assert_eq!(next(&mut streams.errors).await, None);

    timeout(WAIT, consumer.stopped()).await.unwrap();
    assert_eq!(consumer.state(), Some(PipelineState::Stopped));
    consumer.close().unwrap();
}

#[tokio::test]
async fn replay_skips_unparseable_lines() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "not json at all").unwrap();
    file.write_all(FeedRecord::Envelope(Envelope::value_metric("rep", "mem", 1.0, "GB")).to_jsonl().as_bytes())
        .unwrap();
    writeln!(file).unwrap();
    file.flush().unwrap();

    let mut consumer = consumer(&file, FeedMode::Replay { speed: 0.0 });
    consumer.start().unwrap();
    let events = consumer.events().unwrap();
    assert_eq!(next(events).await.map(|e| e.origin), Some("rep".to_string()));
    assert_eq!(next(events).await, None);
}

#[tokio::test]
async fn replay_skips_invalid_utf8_lines() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(FeedRecord::Envelope(Envelope::value_metric("a", "cpu", 0.1, "%")).to_jsonl().as_bytes())
        .unwrap();
    file.write_all(b"\xff\xfe garbage\n").unwrap();
    file.write_all(FeedRecord::Envelope(Envelope::value_metric("b", "cpu", 0.2, "%")).to_jsonl().as_bytes())
        .unwrap();
    file.flush().unwrap();

    let mut consumer = consumer(&file, FeedMode::Replay { speed: 0.0 });
    consumer.start().unwrap();
    let streams = consumer.streams().unwrap();

    assert_eq!(next(&mut streams.events).await.map(|e| e.origin), Some("a".to_string()));
    assert_eq!(next(&mut streams.events).await.map(|e| e.origin), Some("b".to_string()));
    assert_eq!(next(&mut streams.events).await, None);
    assert_eq!(next(&mut streams.errors).await, None);
}

#[tokio::test]
async fn tail_keeps_following_after_invalid_utf8_line() {
    let mut file = NamedTempFile::new().unwrap();
    let mut consumer = consumer(&file, FeedMode::Tail);
    consumer.start().unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    file.write_all(b"\xff\xfe garbage\n").unwrap();
    let after = Envelope::value_metric("after", "cpu", 0.3, "%");
    file.write_all(FeedRecord::Envelope(after.clone()).to_jsonl().as_bytes()).unwrap();
    file.flush().unwrap();

    assert_eq!(next(consumer.events().unwrap()).await, Some(after));
    consumer.close().unwrap();
}

#[tokio::test]
async fn replay_paces_by_timestamp() {
    let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let file = capture(&[
        FeedRecord::Envelope(Envelope::value_metric("rep", "cpu", 0.1, "%").with_timestamp(t0)),
        FeedRecord::Envelope(
            Envelope::value_metric("rep", "cpu", 0.2, "%").with_timestamp(t0 + chrono::Duration::seconds(2)),
        ),
    ]);
    // 2s of capture at 10x
    let mut consumer = consumer(&file, FeedMode::Replay { speed: 10.0 });
    let started = std::time::Instant::now();
    consumer.start().unwrap();
    let events = consumer.events().unwrap();
    next(events).await.unwrap();
    next(events).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn tail_only_follows_appended_lines() {
    let mut file = capture(&[FeedRecord::Envelope(Envelope::value_metric("old", "cpu", 0.9, "%"))]);
    let mut consumer = consumer(&file, FeedMode::Tail);
    consumer.start().unwrap();

    // let the reader reach the end of the existing content
    tokio::time::sleep(Duration::from_millis(200)).await;
    let fresh = Envelope::value_metric("new", "cpu", 0.1, "%");
    file.write_all(FeedRecord::Envelope(fresh.clone()).to_jsonl().as_bytes()).unwrap();
    file.flush().unwrap();

    assert_eq!(next(consumer.events().unwrap()).await, Some(fresh));

    consumer.close().unwrap();
    let errors = consumer.errors().unwrap();
    while let Some(err) = next(errors).await {
        assert_eq!(err, StreamError::Cancelled);
    }
    timeout(WAIT, consumer.stopped()).await.unwrap();
}

#[tokio::test]
async fn missing_capture_fails_to_start() {
    let cfg = ConsumerConfig::new("/nonexistent/slowwatch/capture.jsonl", "bearer test", "slowwatch-it");
    let mut consumer = Consumer::new(cfg, |c| Ok(FileFirehose::from_config(c, FeedMode::Tail))).unwrap();
    assert!(matches!(consumer.start(), Err(ConsumerError::Connection(_))));
    assert!(consumer.events().is_none());
    assert!(matches!(consumer.close(), Err(ConsumerError::NotConnected)));
}
