// slowwatch/src/error.rs
//
// Error taxonomy.
//   ConfigError    — construction-time validation, fatal to that construction
//   ConsumerError  — acquiring / closing the raw stream, lifecycle misuse
//   DetectorError  — stopping a detector that was never started
//   StreamError    — values travelling on the error channel: relayed transport
//                    errors plus the cancellation marker emitted on shutdown

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── WebSocket close codes (RFC 6455 §7.4.1) ──────────────────────────────────

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Endpoint is terminating the connection because a message violated its
/// policy. Doppler uses it when the client is too slow to read frames.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_MESSAGE_TOO_BIG: u16 = 1009;

fn close_code_name(code: &u16) -> &'static str {
    match *code {
        CLOSE_NORMAL => "normal closure",
        CLOSE_GOING_AWAY => "going away",
        CLOSE_ABNORMAL => "abnormal closure",
        CLOSE_POLICY_VIOLATION => "policy violation",
        CLOSE_MESSAGE_TOO_BIG => "message too big",
        _ => "unknown",
    }
}

// ── Stream errors ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamError {
    /// Transport close frame.
    #[error("websocket: close {code} ({}){}", close_code_name(.code), fmt_reason(.reason))]
    Close {
        code: u16,
        #[serde(default)]
        reason: String,
    },

    #[error("transport error: {0}")]
    Transport(String),

    /// Emitted once per relay loop when the detection scope is cancelled.
    #[error("detection scope cancelled")]
    Cancelled,
}

fn fmt_reason(reason: &str) -> String {
    if reason.is_empty() { String::new() } else { format!(": {}", reason) }
}

impl StreamError {
    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        Self::Close { code, reason: reason.into() }
    }

    /// Close status code, for close errors only.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::Close { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

// ── Construction / lifecycle errors ───────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    Missing(&'static str),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DetectorError {
    #[error("detector has not been started: no cancellation scope")]
    NotStarted,
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("no connection with firehose")]
    NotConnected,

    #[error("consumer already started")]
    AlreadyStarted,

    #[error(transparent)]
    Detector(#[from] DetectorError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
