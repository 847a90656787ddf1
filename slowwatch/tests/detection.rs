// Detection pipeline behaviour through the public API.

use std::time::Duration;

use slowwatch::detector::{DOPPLER_ORIGIN, TRUNCATING_BUFFER_COUNTER};
use slowwatch::{
    AlertKind, ConfigError, Consumer, ConsumerConfig, ConsumerError, DetectStreams, DetectorError,
    Envelope, FeedMode, FileFirehose, PipelineState, SlowDetector, StreamError,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

async fn next<T>(rx: &mut mpsc::Receiver<T>) -> Option<T> {
    timeout(WAIT, rx.recv()).await.expect("channel stalled")
}

async fn drain<T>(rx: &mut mpsc::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Some(item) = next(rx).await {
        out.push(item);
    }
    out
}

fn overflow() -> Envelope {
    Envelope::counter(DOPPLER_ORIGIN, TRUNCATING_BUFFER_COUNTER, 12, 340)
}

#[tokio::test]
async fn overflow_then_cpu_yields_one_alert_and_both_envelopes() {
    let (ev_tx, ev_rx) = mpsc::channel(8);
    let (_err_tx, err_rx) = mpsc::channel::<StreamError>(8);
    let mut detector = SlowDetector::new(8);
    let mut streams = detector.detect(ev_rx, err_rx);

    let cpu = Envelope::value_metric("router", "cpu", 0.5, "%");
    ev_tx.send(overflow()).await.unwrap();
    ev_tx.send(cpu.clone()).await.unwrap();
    drop(ev_tx);

    let alert = next(&mut streams.detects).await.unwrap();
    assert_eq!(alert.kind, AlertKind::BufferOverflow);
    assert_eq!(drain(&mut streams.events).await, vec![overflow(), cpu]);
    assert_eq!(detector.metrics().snapshot().alerts_buffer_overflow, 1);
}

#[tokio::test]
async fn policy_violation_close_alerts_then_relays() {
    let (_ev_tx, ev_rx) = mpsc::channel::<Envelope>(8);
    let (err_tx, err_rx) = mpsc::channel(8);
    let mut detector = SlowDetector::new(8);
    let mut streams = detector.detect(ev_rx, err_rx);

    err_tx.send(StreamError::close(1008, "")).await.unwrap();
    drop(err_tx);

    let alert = next(&mut streams.detects).await.unwrap();
    assert_eq!(alert.kind, AlertKind::PolicyViolation);
    assert_eq!(drain(&mut streams.errors).await, vec![StreamError::close(1008, "")]);
}

#[tokio::test]
async fn ordinary_traffic_passes_through_unchanged_and_in_order() {
    let (ev_tx, ev_rx) = mpsc::channel(4);
    let (err_tx, err_rx) = mpsc::channel(4);
    let mut detector = SlowDetector::new(4);
    let DetectStreams { mut events, mut errors, mut detects } = detector.detect(ev_rx, err_rx);

    let sent: Vec<Envelope> = (0..20)
        .map(|i| Envelope::counter("router", "requests", 1, i))
        .chain([Envelope::counter("metron", TRUNCATING_BUFFER_COUNTER, 1, 1)])
        .collect();
    let expected = sent.clone();
    let producer = tokio::spawn(async move {
        for env in sent {
            ev_tx.send(env).await.unwrap();
        }
        err_tx.send(StreamError::close(1006, "eof")).await.unwrap();
        err_tx.send(StreamError::Transport("reset".into())).await.unwrap();
    });

    assert_eq!(drain(&mut events).await, expected);
    assert_eq!(
        drain(&mut errors).await,
        vec![StreamError::close(1006, "eof"), StreamError::Transport("reset".into())]
    );
    assert_eq!(next(&mut detects).await, None);
    producer.await.unwrap();
    timeout(WAIT, detector.stopped()).await.unwrap();
}

#[tokio::test]
async fn stop_closes_both_outputs_with_one_cancellation_per_loop() {
    let (_ev_tx, ev_rx) = mpsc::channel::<Envelope>(8);
    let (_err_tx, err_rx) = mpsc::channel::<StreamError>(8);
    let mut detector = SlowDetector::new(8);

    assert_eq!(detector.stop(), Err(DetectorError::NotStarted));
    let mut streams = detector.detect(ev_rx, err_rx);
    assert_eq!(detector.state(), Some(PipelineState::Running));

    detector.stop().unwrap();
    detector.stop().unwrap();

    assert_eq!(drain(&mut streams.errors).await, vec![StreamError::Cancelled, StreamError::Cancelled]);
    assert_eq!(next(&mut streams.events).await, None);
    timeout(WAIT, detector.stopped()).await.unwrap();
    assert_eq!(detector.state(), Some(PipelineState::Stopped));
    assert_eq!(detector.metrics().snapshot().cancellations, 2);
}

#[tokio::test]
async fn blocked_forward_still_observes_cancellation() {
    let (ev_tx, ev_rx) = mpsc::channel(8);
    let (_err_tx, err_rx) = mpsc::channel::<StreamError>(8);
    let mut detector = SlowDetector::new(1);
    let mut streams = detector.detect(ev_rx, err_rx);

    // first fills the output buffer, second parks the relay on a full send
    for i in 0..3 {
        ev_tx.send(Envelope::counter("router", "requests", 1, i)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    detector.stop().unwrap();

    // errors has room for one marker at a time
    assert_eq!(drain(&mut streams.errors).await, vec![StreamError::Cancelled, StreamError::Cancelled]);
    let relayed = drain(&mut streams.events).await;
    assert!(relayed.len() <= 2, "relayed {} envelopes after cancellation", relayed.len());
}

#[tokio::test]
async fn error_relay_not_blocked_by_stalled_events() {
    let (ev_tx, ev_rx) = mpsc::channel(8);
    let (err_tx, err_rx) = mpsc::channel(8);
    let mut detector = SlowDetector::new(1);
    let mut streams = detector.detect(ev_rx, err_rx);

    // nobody reads events: the event relay parks on a full output
    for i in 0..4 {
        ev_tx.send(Envelope::counter("router", "requests", 1, i)).await.unwrap();
    }
    for i in 0..3 {
        err_tx.send(StreamError::Transport(format!("reset {i}"))).await.unwrap();
    }

    for i in 0..3 {
        assert_eq!(next(&mut streams.errors).await, Some(StreamError::Transport(format!("reset {i}"))));
    }
    assert_eq!(detector.state(), Some(PipelineState::Running));
}

#[tokio::test]
async fn stop_after_error_stream_ended_still_stops() {
    let (_ev_tx, ev_rx) = mpsc::channel::<Envelope>(8);
    let (err_tx, err_rx) = mpsc::channel::<StreamError>(8);
    let mut detector = SlowDetector::new(8);
    let mut streams = detector.detect(ev_rx, err_rx);

    drop(err_tx);
    assert_eq!(next(&mut streams.errors).await, None);
    assert_eq!(detector.state(), Some(PipelineState::Running));

    // the event relay's marker has nowhere to go and is dropped
    detector.stop().unwrap();
    assert_eq!(next(&mut streams.events).await, None);
    timeout(WAIT, detector.stopped()).await.unwrap();
    assert_eq!(detector.state(), Some(PipelineState::Stopped));
    assert_eq!(detector.metrics().snapshot().cancellations, 0);
}

#[test]
fn empty_subscription_id_is_rejected_at_construction() {
    let cfg = ConsumerConfig::new("/tmp/capture.jsonl", "bearer t", "");
    let res = Consumer::new(cfg, |c| Ok(FileFirehose::from_config(c, FeedMode::Tail)));
    match res {
        Err(ConsumerError::Config(e @ ConfigError::Missing(_))) => {
            assert_eq!(e.to_string(), "subscription_id must not be empty");
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("consumer built without subscription id"),
    }
}
