// slowwatch/src/lib.rs
//
// Slow-consumer detection for telemetry firehose streams.
//
//   RawSource ──▶ SlowDetector ──▶ events   (envelopes, unchanged)
//                              ├─▶ errors   (stream errors, plus Cancelled)
//                              └─▶ detects  (slow-consumer alerts)

pub mod config;
pub mod consumer;
pub mod detector;
pub mod error;
pub mod events;
pub mod metrics;
pub mod pipeline;
pub mod source;

pub use config::ConsumerConfig;
pub use consumer::{Consumer, RawSource};
pub use detector::{AlertKind, SlowConsumerAlert};
pub use error::{ConfigError, ConsumerError, DetectorError, StreamError};
pub use events::{Envelope, EventType};
pub use metrics::{MetricsServer, RelayMetrics};
pub use pipeline::{DetectStreams, PipelineState, SlowDetector};
pub use source::{FeedMode, FeedRecord, FileFirehose};
