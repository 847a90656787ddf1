// slowwatch/src/consumer.rs
//
// Consumer = raw source + slow detector behind one handle.
//
//   RawSource::consume ──▶ SlowDetector::detect ──▶ events / detects / errors
//
// The consumer owns the raw source exclusively; the detector only ever sees
// the two channels the source hands out. `close` tears down in that order:
// connection first, then the detector, since cancelling detection while the
// connection is still feeding it achieves nothing.

use std::sync::Arc;

use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ConsumerConfig;
use crate::detector::SlowConsumerAlert;
use crate::error::{ConsumerError, StreamError};
use crate::events::Envelope;
use crate::metrics::RelayMetrics;
use crate::pipeline::{DetectStreams, PipelineState, SlowDetector};

/// Upstream firehose connection.
///
/// `consume` starts background delivery and hands back the two raw channels;
/// both close when the connection ends. Retrying is the source's business.
pub trait RawSource: Send {
    fn consume(&mut self) -> Result<(Receiver<Envelope>, Receiver<StreamError>), ConsumerError>;

    /// Sever the connection. `NotConnected` if `consume` never ran.
    fn close(&mut self) -> Result<(), ConsumerError>;
}

pub struct Consumer<S: RawSource> {
    config: ConsumerConfig,
    source: S,
    detector: SlowDetector,
    streams: Option<DetectStreams>,
}

impl<S: RawSource> Consumer<S> {
    /// Validate `config`, then build the raw source from it.
    pub fn new<F>(config: ConsumerConfig, connect: F) -> Result<Self, ConsumerError>
    where
        F: FnOnce(&ConsumerConfig) -> Result<S, ConsumerError>,
    {
        config.validate()?;
        let source = connect(&config)?;
        let detector = SlowDetector::new(config.channel_capacity);
        Ok(Self { config, source, detector, streams: None })
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn start(&mut self) -> Result<(), ConsumerError> {
        let (events, errors) = self.acquire()?;
        self.streams = Some(self.detector.detect(events, errors));
        Ok(())
    }

    /// Like [`start`](Self::start), with detection bound to `parent`.
    pub fn start_with(&mut self, parent: &CancellationToken) -> Result<(), ConsumerError> {
        let (events, errors) = self.acquire()?;
        self.streams = Some(self.detector.detect_with(parent, events, errors));
        Ok(())
    }

    fn acquire(&mut self) -> Result<(Receiver<Envelope>, Receiver<StreamError>), ConsumerError> {
        if self.streams.is_some() {
            return Err(ConsumerError::AlreadyStarted);
        }
        info!(
            subscription = %self.config.subscription_id,
            "Start consuming firehose events from {}", self.config.doppler_addr
        );
        self.source.consume()
    }

    pub fn events(&mut self) -> Option<&mut Receiver<Envelope>> {
        self.streams.as_mut().map(|s| &mut s.events)
    }

    pub fn detects(&mut self) -> Option<&mut Receiver<SlowConsumerAlert>> {
        self.streams.as_mut().map(|s| &mut s.detects)
    }

    pub fn errors(&mut self) -> Option<&mut Receiver<StreamError>> {
        self.streams.as_mut().map(|s| &mut s.errors)
    }

    /// All three receivers at once, for callers that `select!` over them.
    pub fn streams(&mut self) -> Option<&mut DetectStreams> {
        self.streams.as_mut()
    }

    pub fn metrics(&self) -> Arc<RelayMetrics> {
        self.detector.metrics()
    }

    pub fn state(&self) -> Option<PipelineState> {
        self.detector.state()
    }

    /// Wait until both relays have exited.
    pub async fn stopped(&self) {
        self.detector.stopped().await
    }

    /// Close the connection, then stop detection. A failure to close the
    /// connection is returned as-is and detection is left running.
    pub fn close(&mut self) -> Result<(), ConsumerError> {
        self.source.close()?;
        self.detector.stop()?;
        Ok(())
    }
}
