// slowwatch/src/main.rs
//
// slowwatch — slow-consumer detection on a telemetry firehose
//
// Reads a firehose capture, relays every envelope and stream error through the
// slow detector and reports alerts as they are raised.
//
// Two modes:
//   tail    — follow a JSONL capture as it grows (default)
//   replay  — play a captured JSONL file at scaled speed
//
// Usage:
//   slowwatch --doppler-addr /var/log/firehose.jsonl --token "bearer x"
//   slowwatch --mode replay --doppler-addr captured.jsonl --speed 10.0
//   DOPPLER_ADDR=... CF_ACCESS_TOKEN=... slowwatch --metrics-addr 127.0.0.1:9464

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use slowwatch::config::{ENV_DOPPLER_ADDR, ENV_SUBSCRIPTION_ID, ENV_TOKEN};
use slowwatch::{
    AlertKind, Consumer, ConsumerConfig, Envelope, EventType, FeedMode, FileFirehose,
    MetricsServer, RelayMetrics, SlowConsumerAlert, StreamError,
};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "slowwatch",
    about   = "Slow-consumer detection for telemetry firehose streams",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, env = ENV_DOPPLER_ADDR, help = "Firehose endpoint (capture path for tail/replay)")]
    doppler_addr: String,

    #[arg(long, env = ENV_TOKEN, hide_env_values = true, help = "Access token")]
    token: String,

    #[arg(long, env = ENV_SUBSCRIPTION_ID, default_value = "slowwatch-example-A",
          help = "Subscription ID shared by cooperating consumers")]
    subscription_id: String,

    #[arg(long, help = "Skip TLS certificate verification")]
    insecure: bool,

    #[arg(long, value_enum, default_value = "tail")]
    mode: Mode,

    #[arg(long, default_value = "1.0", help = "Replay speed multiplier (0 = as fast as possible)")]
    speed: f64,

    #[arg(long, default_value = "64", help = "Bounded channel capacity")]
    capacity: usize,

    #[arg(long, help = "Serve Prometheus metrics on this address")]
    metrics_addr: Option<SocketAddr>,
}

#[derive(Clone, ValueEnum)]
enum Mode {
    Tail,    // follow a live JSONL capture
    Replay,  // replay a static JSONL capture at scaled speed
}

impl Cli {
    fn config(&self) -> ConsumerConfig {
        ConsumerConfig {
            insecure: self.insecure,
            channel_capacity: self.capacity,
            ..ConsumerConfig::new(&self.doppler_addr, &self.token, &self.subscription_id)
        }
    }

    fn feed_mode(&self) -> FeedMode {
        match self.mode {
            Mode::Tail => FeedMode::Tail,
            Mode::Replay => FeedMode::Replay { speed: self.speed },
        }
    }
}

// ── Terminal output ───────────────────────────────────────────────────────────

fn print_banner(cli: &Cli) {
    println!("\x1b[1m\n  slowwatch\x1b[0m  \x1b[90mslow-consumer detection | firehose relay\x1b[0m\n");
    match cli.mode {
        Mode::Tail => println!("  Mode: \x1b[96mTAIL\x1b[0m  |  {}", cli.doppler_addr),
        Mode::Replay => println!(
            "  Mode: \x1b[93mREPLAY\x1b[0m  |  {}  speed={:.1}x",
            cli.doppler_addr, cli.speed
        ),
    }
    println!("  Subscription: \x1b[90m{}\x1b[0m", cli.subscription_id);
    println!("  Press Ctrl+C to stop.\n");
}

fn print_alert(alert: &SlowConsumerAlert) {
    let color = match alert.kind {
        AlertKind::BufferOverflow => "\x1b[93;1m",
        AlertKind::PolicyViolation => "\x1b[91;1m",
    };
    println!(
        "\n{}SLOW CONSUMER {}\x1b[0m  {}",
        color, alert.kind, alert.detected_at.format("%H:%M:%S%.3f")
    );
    println!("  {}", alert.message);
}

fn print_event(event: &Envelope) {
    if event.event_type == EventType::ValueMetric {
        println!("  {}", event);
    }
}

async fn print_stats_loop(metrics: Arc<RelayMetrics>, start: Instant) {
    loop {
        tokio::time::sleep(tokio::time::Duration::from_secs(30)).await;
        let elapsed = start.elapsed().as_secs_f64();
        let snap = metrics.snapshot();
        println!(
            "\n\x1b[1m── stats  uptime={:.0}s  events={}  eps={:.1}  errors={}  alerts={} ──\x1b[0m",
            elapsed, snap.events_relayed, snap.events_relayed as f64 / elapsed,
            snap.errors_relayed, snap.total_alerts()
        );
    }
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env()
            .add_directive("slowwatch=info".parse()?))
        .compact().init();

    let cli = Cli::parse();
    let mode = cli.feed_mode();
    let mut consumer = Consumer::new(cli.config(), |cfg| Ok(FileFirehose::from_config(cfg, mode)))?;

    print_banner(&cli);

    let metrics = consumer.metrics();
    tokio::spawn(print_stats_loop(Arc::clone(&metrics), Instant::now()));

    if let Some(addr) = cli.metrics_addr {
        let server = Arc::new(MetricsServer::new(Arc::clone(&metrics), addr));
        tokio::spawn(async move {
            if let Err(e) = server.serve().await {
                warn!("metrics endpoint stopped: {}", e);
            }
        });
    }

    let root = CancellationToken::new();
    let shutdown = root.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling detection");
            shutdown.cancel();
        }
    });

    consumer.start_with(&root)?;

    if let Some(streams) = consumer.streams() {
        loop {
            tokio::select! {
                Some(event) = streams.events.recv() => print_event(&event),
                Some(alert) = streams.detects.recv() => {
                    warn!("slow consumer detected: {}", alert);
                    print_alert(&alert);
                }
                Some(err) = streams.errors.recv() => {
                    match err {
                        StreamError::Cancelled => info!("{}", err),
                        _ => warn!("firehose error: {}", err),
                    }
                    break;
                }
                else => break,
            }
        }
    }

    consumer.close()?;
    let snap = metrics.snapshot();
    info!(
        "Relayed {} events, {} errors, raised {} alerts",
        snap.events_relayed, snap.errors_relayed, snap.total_alerts()
    );
    Ok(())
}
