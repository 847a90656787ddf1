// slowwatch/src/pipeline.rs
//
// Slow-consumer detection pipeline.
//
// Two relay tasks, one per raw stream:
//
//   raw events ──▶ [event relay] ──▶ events out
//                       │
//                       ├──▶ detects (shared alert channel)
//                       │
//   raw errors ──▶ [error relay] ──▶ errors out
//
// Each relay inspects an item, emits an alert if it matches a slow-consumer
// signature, then forwards the item unchanged. Events and errors use separate
// tasks so a stalled event reader cannot hold up error delivery.
//
// Every receive and every forward is raced against the detection scope
// (`biased`, cancellation first). On cancellation a relay emits exactly one
// `StreamError::Cancelled` on the error output and exits; items still queued
// upstream are dropped. Alert sends are NOT raced: the caller must keep
// `detects` drained or both relays stall on the next match.
//
// The alert is sent before the item is forwarded. That ordering is kept for
// compatibility even though an undrained alert channel then blocks relay.
//
// The event relay holds the error output weakly so the error channel closes
// as soon as the error relay is done with it. On cancellation the error relay
// keeps the channel open until the event relay has exited, so both
// cancellation markers get through.
//
// Lifecycle: Running → Cancelled → Stopped. The last relay to exit cancels the
// scope (a no-op if `stop` already did) before marking the pipeline Stopped, so
// a natural drain goes through Cancelled too.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, Receiver, Sender, WeakSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::detector::{self, SlowConsumerAlert};
use crate::error::{DetectorError, StreamError};
use crate::events::Envelope;
use crate::metrics::RelayMetrics;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Running,
    Cancelled,
    Stopped,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Receiving ends handed back by [`SlowDetector::detect`].
#[derive(Debug)]
pub struct DetectStreams {
    pub events: Receiver<Envelope>,
    pub errors: Receiver<StreamError>,
    pub detects: Receiver<SlowConsumerAlert>,
}

// ── Lifecycle ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Lifecycle {
    scope: CancellationToken,
    stopped: CancellationToken,
    live_relays: AtomicUsize,
}

impl Lifecycle {
    fn new(scope: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            scope,
            stopped: CancellationToken::new(),
            live_relays: AtomicUsize::new(2),
        })
    }

    fn state(&self) -> PipelineState {
        if self.stopped.is_cancelled() {
            PipelineState::Stopped
        } else if self.scope.is_cancelled() {
            PipelineState::Cancelled
        } else {
            PipelineState::Running
        }
    }

    /// Called by each relay after its senders are dropped.
    fn relay_exited(&self) {
        if self.live_relays.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.scope.cancel();
            self.stopped.cancel();
            debug!("detection pipeline stopped");
        }
    }
}

// ── Detector ──────────────────────────────────────────────────────────────────

pub struct SlowDetector {
    capacity: usize,
    metrics: Arc<RelayMetrics>,
    lifecycle: Option<Arc<Lifecycle>>,
}

impl SlowDetector {
    /// `capacity` bounds each output channel (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), metrics: RelayMetrics::new(), lifecycle: None }
    }

    pub fn with_metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> Arc<RelayMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Start detecting under a fresh, detector-owned scope.
    pub fn detect(&mut self, events: Receiver<Envelope>, errors: Receiver<StreamError>) -> DetectStreams {
        self.spawn(CancellationToken::new(), events, errors)
    }

    /// Start detecting under a child of `parent`: cancelling the parent stops
    /// the pipeline, and `stop` cancels only this pipeline.
    pub fn detect_with(
        &mut self,
        parent: &CancellationToken,
        events: Receiver<Envelope>,
        errors: Receiver<StreamError>,
    ) -> DetectStreams {
        self.spawn(parent.child_token(), events, errors)
    }

    fn spawn(
        &mut self,
        scope: CancellationToken,
        raw_events: Receiver<Envelope>,
        raw_errors: Receiver<StreamError>,
    ) -> DetectStreams {
        if let Some(previous) = self.lifecycle.take() {
            warn!("detector restarted: cancelling previous pipeline");
            previous.scope.cancel();
        }

        info!("Start detecting slowConsumerAlert event");

        let (events_tx, events_rx) = mpsc::channel(self.capacity);
        let (errors_tx, errors_rx) = mpsc::channel(self.capacity);
        let (alerts_tx, alerts_rx) = mpsc::channel(self.capacity);

        let lifecycle = Lifecycle::new(scope.clone());
        self.lifecycle = Some(Arc::clone(&lifecycle));
        let event_relay_done = CancellationToken::new();

        let event_relay = EventRelay {
            raw: raw_events,
            out: events_tx,
            errors: errors_tx.downgrade(),
            alerts: alerts_tx.clone(),
            scope: scope.clone(),
            metrics: Arc::clone(&self.metrics),
        };
        let error_relay = ErrorRelay {
            raw: raw_errors,
            out: errors_tx,
            alerts: alerts_tx,
            scope,
            event_relay_done: event_relay_done.clone(),
            metrics: Arc::clone(&self.metrics),
        };

        let lc = Arc::clone(&lifecycle);
        tokio::spawn(async move {
            event_relay.run().await;
            event_relay_done.cancel();
            lc.relay_exited();
        });
        tokio::spawn(async move {
            error_relay.run().await;
            lifecycle.relay_exited();
        });

        DetectStreams { events: events_rx, errors: errors_rx, detects: alerts_rx }
    }

    /// Cancel the detection scope. Only the first call has an effect.
    pub fn stop(&self) -> Result<(), DetectorError> {
        let lifecycle = self.lifecycle.as_ref().ok_or(DetectorError::NotStarted)?;
        if !lifecycle.scope.is_cancelled() {
            info!("Stop detecting slowConsumerAlert event");
            lifecycle.scope.cancel();
        }
        Ok(())
    }

    /// `None` until the first `detect` call.
    pub fn state(&self) -> Option<PipelineState> {
        self.lifecycle.as_ref().map(|lc| lc.state())
    }

    /// Resolves once both relays have exited and every output channel is
    /// closed. Returns immediately if the detector was never started.
    pub async fn stopped(&self) {
        if let Some(lc) = &self.lifecycle {
            lc.stopped.cancelled().await;
        }
    }
}

impl Default for SlowDetector {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

// ── Relays ────────────────────────────────────────────────────────────────────

struct EventRelay {
    raw: Receiver<Envelope>,
    out: Sender<Envelope>,
    errors: WeakSender<StreamError>,
    alerts: Sender<SlowConsumerAlert>,
    scope: CancellationToken,
    metrics: Arc<RelayMetrics>,
}

impl EventRelay {
    async fn run(mut self) {
        loop {
            let envelope = tokio::select! {
                biased;
                _ = self.scope.cancelled() => break,
                next = self.raw.recv() => match next {
                    Some(envelope) => envelope,
                    None => {
                        debug!("raw event stream closed: closing event channel");
                        return;
                    }
                },
            };

            if let Some(alert) = detector::inspect_envelope(&envelope) {
                emit_alert(&self.alerts, &self.metrics, alert).await;
            }

            tokio::select! {
                biased;
                _ = self.scope.cancelled() => break,
                sent = self.out.send(envelope) => {
                    if sent.is_err() {
                        debug!("event receiver dropped: stopping event relay");
                        return;
                    }
                    self.metrics.record_event();
                }
            }
        }

        info!("Cancelled detection scope: closing event channel");
        // Error relay may already be gone, in which case nobody is listening.
        if let Some(errors) = self.errors.upgrade() {
            if errors.send(StreamError::Cancelled).await.is_ok() {
                self.metrics.record_cancellation();
            }
        }
    }
}

struct ErrorRelay {
    raw: Receiver<StreamError>,
    out: Sender<StreamError>,
    alerts: Sender<SlowConsumerAlert>,
    scope: CancellationToken,
    event_relay_done: CancellationToken,
    metrics: Arc<RelayMetrics>,
}

impl ErrorRelay {
    async fn run(mut self) {
        loop {
            let err = tokio::select! {
                biased;
                _ = self.scope.cancelled() => break,
                next = self.raw.recv() => match next {
                    Some(err) => err,
                    None => {
                        debug!("raw error stream closed: closing error channel");
                        return;
                    }
                },
            };

            if let Some(alert) = detector::inspect_error(&err) {
                emit_alert(&self.alerts, &self.metrics, alert).await;
            }

            tokio::select! {
                biased;
                _ = self.scope.cancelled() => break,
                sent = self.out.send(err) => {
                    if sent.is_err() {
                        debug!("error receiver dropped: stopping error relay");
                        return;
                    }
                    self.metrics.record_error();
                }
            }
        }

        info!("Cancelled detection scope: closing error channel");
        if self.out.send(StreamError::Cancelled).await.is_ok() {
            self.metrics.record_cancellation();
        }
        // hold `out` until the event relay has reported its own cancellation
        self.event_relay_done.cancelled().await;
    }
}

async fn emit_alert(alerts: &Sender<SlowConsumerAlert>, metrics: &RelayMetrics, alert: SlowConsumerAlert) {
    warn!(kind = %alert.kind, "slow consumer detected: {}", alert.message);
    metrics.record_alert(alert.kind);
    if alerts.send(alert).await.is_err() {
        debug!("alert receiver dropped");
    }
}
