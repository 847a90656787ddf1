// slowwatch/src/events.rs
//
// Firehose envelope types flowing through slowwatch.
// Field layout follows the dropsonde envelope: a type tag, an origin, common
// metadata, and one optional payload per event type. Only the payload named
// by `event_type` is expected to be set; envelopes where the two disagree are
// still relayed, the detector just treats them as unremarkable.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Event type tag ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    HttpStartStop,
    LogMessage,
    ValueMetric,
    CounterEvent,
    Error,
    ContainerMetric,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HttpStartStop => write!(f, "HttpStartStop"),
            Self::LogMessage => write!(f, "LogMessage"),
            Self::ValueMetric => write!(f, "ValueMetric"),
            Self::CounterEvent => write!(f, "CounterEvent"),
            Self::Error => write!(f, "Error"),
            Self::ContainerMetric => write!(f, "ContainerMetric"),
        }
    }
}

// ── Payloads ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueMetric {
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterEvent {
    pub name: String,
    pub delta: u64,
    #[serde(default)]
    pub total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "OUT")]
    Out,
    #[serde(rename = "ERR")]
    Err,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogMessage {
    pub message: String,
    pub message_type: MessageType,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub source_type: Option<String>,
    #[serde(default)]
    pub source_instance: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpStartStop {
    pub start_timestamp: i64, // unix nanos
    pub stop_timestamp: i64,
    pub request_id: Option<String>,
    pub method: String,
    pub uri: String,
    pub status_code: u16,
    pub content_length: i64,
    #[serde(default)]
    pub application_id: Option<String>,
}

/// Error event carried *inside* the stream (as opposed to a transport error).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub source: String,
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerMetric {
    pub application_id: String,
    pub instance_index: i32,
    pub cpu_percentage: f64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
}

// ── Envelope ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub origin: String,
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_start_stop: Option<HttpStartStop>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_message: Option<LogMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_metric: Option<ValueMetric>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter_event: Option<CounterEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_metric: Option<ContainerMetric>,
}

impl Envelope {
    /// Bare envelope with no payload set.
    pub fn new(origin: impl Into<String>, event_type: EventType) -> Self {
        Self {
            origin: origin.into(),
            event_type,
            timestamp: None,
            deployment: None,
            job: None,
            index: None,
            ip: None,
            tags: BTreeMap::new(),
            http_start_stop: None,
            log_message: None,
            value_metric: None,
            counter_event: None,
            error: None,
            container_metric: None,
        }
    }

    pub fn counter(origin: impl Into<String>, name: impl Into<String>, delta: u64, total: u64) -> Self {
        let mut env = Self::new(origin, EventType::CounterEvent);
        env.counter_event = Some(CounterEvent { name: name.into(), delta, total });
        env
    }

    pub fn value_metric(
        origin: impl Into<String>,
        name: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
    ) -> Self {
        let mut env = Self::new(origin, EventType::ValueMetric);
        env.value_metric = Some(ValueMetric { name: name.into(), value, unit: unit.into() });
        env
    }

    pub fn log(origin: impl Into<String>, message: impl Into<String>, message_type: MessageType) -> Self {
        let mut env = Self::new(origin, EventType::LogMessage);
        env.log_message = Some(LogMessage {
            message: message.into(),
            message_type,
            app_id: None,
            source_type: None,
            source_instance: None,
        });
        env
    }

    pub fn with_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = Some(ts);
        self
    }

    /// Counter name, if this envelope carries a counter payload.
    pub fn counter_name(&self) -> Option<&str> {
        self.counter_event.as_ref().map(|c| c.name.as_str())
    }
}

impl std::fmt::Display for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} origin={}", self.event_type, self.origin)?;
        if let Some(vm) = &self.value_metric {
            write!(f, " {}={}{}", vm.name, vm.value, vm.unit)?;
        }
        if let Some(c) = &self.counter_event {
            write!(f, " {}+{} total={}", c.name, c.delta, c.total)?;
        }
        Ok(())
    }
}
