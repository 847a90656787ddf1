// slowwatch/src/metrics.rs
//
// Relay counters, exported in Prometheus text format.
//
//   slowwatch_events_relayed_total        Counter — envelopes forwarded downstream
//   slowwatch_errors_relayed_total        Counter — stream errors forwarded downstream
//   slowwatch_alerts_total{kind}          Counter — slow-consumer alerts by signature
//   slowwatch_cancellations_total         Counter — cancellation markers delivered
//
// Prometheus endpoint: GET /metrics (enabled with --metrics-addr)

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::info;

use crate::detector::AlertKind;

#[derive(Debug, Default)]
pub struct RelayMetrics {
    pub events_relayed: AtomicU64,
    pub errors_relayed: AtomicU64,
    pub alerts_buffer_overflow: AtomicU64,
    pub alerts_policy_violation: AtomicU64,
    pub cancellations: AtomicU64,
}

impl RelayMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_event(&self) {
        self.events_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alert(&self, kind: AlertKind) {
        match kind {
            AlertKind::BufferOverflow => self.alerts_buffer_overflow.fetch_add(1, Ordering::Relaxed),
            AlertKind::PolicyViolation => self.alerts_policy_violation.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_cancellation(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelaySnapshot {
        RelaySnapshot {
            events_relayed: self.events_relayed.load(Ordering::Relaxed),
            errors_relayed: self.errors_relayed.load(Ordering::Relaxed),
            alerts_buffer_overflow: self.alerts_buffer_overflow.load(Ordering::Relaxed),
            alerts_policy_violation: self.alerts_policy_violation.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
        }
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn prometheus_text(&self) -> String {
        let snap = self.snapshot();
        let mut out = String::with_capacity(1024);

        macro_rules! counter {
            ($name:expr, $help:expr, $val:expr) => {
                out.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} counter\n{} {}\n",
                    $name, $help, $name, $name, $val
                ));
            };
        }

        counter!(
            "slowwatch_events_relayed_total",
            "Envelopes forwarded downstream",
            snap.events_relayed
        );
        counter!(
            "slowwatch_errors_relayed_total",
            "Stream errors forwarded downstream",
            snap.errors_relayed
        );

        out.push_str("# HELP slowwatch_alerts_total Slow-consumer alerts by signature\n");
        out.push_str("# TYPE slowwatch_alerts_total counter\n");
        out.push_str(&format!(
            "slowwatch_alerts_total{{kind=\"{}\"}} {}\n",
            AlertKind::BufferOverflow,
            snap.alerts_buffer_overflow
        ));
        out.push_str(&format!(
            "slowwatch_alerts_total{{kind=\"{}\"}} {}\n",
            AlertKind::PolicyViolation,
            snap.alerts_policy_violation
        ));

        counter!(
            "slowwatch_cancellations_total",
            "Cancellation markers delivered on the error stream",
            snap.cancellations
        );

        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelaySnapshot {
    pub events_relayed: u64,
    pub errors_relayed: u64,
    pub alerts_buffer_overflow: u64,
    pub alerts_policy_violation: u64,
    pub cancellations: u64,
}

impl RelaySnapshot {
    pub fn total_alerts(&self) -> u64 {
        self.alerts_buffer_overflow + self.alerts_policy_violation
    }
}

// ── HTTP /metrics endpoint ─────────────────────────────────────────────────────

pub struct MetricsServer {
    pub metrics: Arc<RelayMetrics>,
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn new(metrics: Arc<RelayMetrics>, addr: SocketAddr) -> Self {
        Self { metrics, addr }
    }

    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("/metrics endpoint listening on {}", self.addr);

        loop {
            let (mut stream, _) = listener.accept().await?;
            let metrics = Arc::clone(&self.metrics);

            tokio::spawn(async move {
                let body = metrics.prometheus_text();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(), body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    }
}
