// slowwatch/src/detector.rs
//
// Slow-consumer signatures. Both are wire-level contracts with the upstream
// transport and must match exactly:
//
//   buffer overflow   — doppler reports it dropped messages from its
//                       TruncatingBuffer because this consumer fell behind
//   policy violation  — the websocket was closed with status 1008, which
//                       doppler uses when the client does not keep up
//
// Classification is a best-effort heuristic. Anything that does not match
// cleanly (missing payload, wrong type tag) is simply not an anomaly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StreamError, CLOSE_POLICY_VIOLATION};
use crate::events::{Envelope, EventType};

pub const TRUNCATING_BUFFER_COUNTER: &str = "TruncatingBuffer.DroppedMessages";
pub const DOPPLER_ORIGIN: &str = "doppler";

// ── Alert ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertKind {
    BufferOverflow,
    PolicyViolation,
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BufferOverflow => write!(f, "buffer_overflow"),
            Self::PolicyViolation => write!(f, "policy_violation"),
        }
    }
}

/// Out-of-band notification that the consumer is falling behind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowConsumerAlert {
    pub kind: AlertKind,
    pub message: String,
    pub detected_at: DateTime<Utc>,
}

impl SlowConsumerAlert {
    fn new(kind: AlertKind) -> Self {
        let message = match kind {
            AlertKind::BufferOverflow => {
                "doppler dropped messages from its queue because the consumer is slow"
            }
            AlertKind::PolicyViolation => {
                "websocket terminated the connection because the consumer is too slow (ClosePolicyViolation)"
            }
        };
        Self { kind, message: message.to_string(), detected_at: Utc::now() }
    }
}

impl std::fmt::Display for SlowConsumerAlert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

// ── Predicates ────────────────────────────────────────────────────────────────

/// Doppler could not hand messages to us as fast as the firehose produced them.
pub fn is_buffer_overflow(envelope: &Envelope) -> bool {
    envelope.event_type == EventType::CounterEvent
        && envelope.counter_name() == Some(TRUNCATING_BUFFER_COUNTER)
        && envelope.origin == DOPPLER_ORIGIN
}

/// Transport closed the connection with 1008 (RFC 6455 §7.4.1).
pub fn is_policy_violation_close(err: &StreamError) -> bool {
    err.close_code() == Some(CLOSE_POLICY_VIOLATION)
}

pub fn inspect_envelope(envelope: &Envelope) -> Option<SlowConsumerAlert> {
    is_buffer_overflow(envelope).then(|| SlowConsumerAlert::new(AlertKind::BufferOverflow))
}

pub fn inspect_error(err: &StreamError) -> Option<SlowConsumerAlert> {
    is_policy_violation_close(err).then(|| SlowConsumerAlert::new(AlertKind::PolicyViolation))
}
