// slowwatch/src/source.rs
//
// File-backed firehose: a RawSource over a captured stream in JSON lines.
//
//   {"envelope": {"origin": "doppler", "eventType": "CounterEvent", ...}}
//   {"error": {"close": {"code": 1008, "reason": "slow consumer"}}}
//
// Two modes:
//   tail    — skip what is already in the file, follow appended lines
//   replay  — play the whole capture, paced by envelope timestamps / speed
//
// `doppler_addr` is the capture path (a `file://` prefix is accepted).
// Lines that fail to parse are logged and skipped.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConsumerConfig;
use crate::consumer::RawSource;
use crate::error::{ConsumerError, StreamError};
use crate::events::Envelope;

const TAIL_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeedMode {
    Tail,
    Replay { speed: f64 },
}

/// One line of a capture file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedRecord {
    Envelope(Envelope),
    Error(StreamError),
}

impl FeedRecord {
    pub fn to_jsonl(&self) -> String {
        serde_json::to_string(self).unwrap_or_default() + "\n"
    }
}

pub struct FileFirehose {
    path: PathBuf,
    subscription_id: String,
    insecure: bool,
    mode: FeedMode,
    capacity: usize,
    connection: Option<CancellationToken>,
}

impl FileFirehose {
    pub fn from_config(config: &ConsumerConfig, mode: FeedMode) -> Self {
        let addr = &config.doppler_addr;
        let path = addr.strip_prefix("file://").unwrap_or(addr);
        Self {
            path: PathBuf::from(path),
            subscription_id: config.subscription_id.clone(),
            insecure: config.insecure,
            mode,
            capacity: config.channel_capacity.max(1),
            connection: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RawSource for FileFirehose {
    fn consume(&mut self) -> Result<(Receiver<Envelope>, Receiver<StreamError>), ConsumerError> {
        if self.connection.is_some() {
            return Err(ConsumerError::AlreadyStarted);
        }
        if !self.path.is_file() {
            return Err(ConsumerError::Connection(format!(
                "capture {} not found",
                self.path.display()
            )));
        }
        if self.insecure {
            warn!("insecure transport requested: TLS verification is not applicable to file captures");
        }
        info!(
            "Start consuming firehose capture {} ({:?}) with subscription ID {:?}",
            self.path.display(), self.mode, self.subscription_id
        );

        let (ev_tx, ev_rx) = mpsc::channel(self.capacity);
        let (err_tx, err_rx) = mpsc::channel(self.capacity);
        let connection = CancellationToken::new();

        let path = self.path.clone();
        let mode = self.mode;
        let token = connection.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => Ok(()),
                r = read_feed(&path, mode, &ev_tx, &err_tx) => r,
            };
            if let Err(e) = result {
                warn!("firehose capture {} failed: {}", path.display(), e);
                let _ = err_tx.send(StreamError::Transport(e.to_string())).await;
            }
            debug!("firehose reader exited: closing raw streams");
        });

        self.connection = Some(connection);
        Ok((ev_rx, err_rx))
    }

    fn close(&mut self) -> Result<(), ConsumerError> {
        info!("Stop consuming firehose events");
        let connection = self.connection.as_ref().ok_or(ConsumerError::NotConnected)?;
        connection.cancel();
        Ok(())
    }
}

// ── Readers ───────────────────────────────────────────────────────────────────

async fn read_feed(
    path: &Path,
    mode: FeedMode,
    events: &Sender<Envelope>,
    errors: &Sender<StreamError>,
) -> Result<()> {
    match mode {
        FeedMode::Tail => tail_feed(path, events, errors).await,
        FeedMode::Replay { speed } => replay_feed(path, speed, events, errors).await,
    }
}

/// One raw line, newline already stripped. Invalid UTF-8 is skipped like any
/// other unparseable line.
fn parse_line(line: &[u8]) -> Option<FeedRecord> {
    let line = match std::str::from_utf8(line) {
        Ok(line) => line.trim(),
        Err(e) => {
            warn!("Parse error: {}", e);
            return None;
        }
    };
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<FeedRecord>(line) {
        Ok(rec) => Some(rec),
        Err(e) => {
            warn!("Parse error: {}", e);
            None
        }
    }
}

/// False once the downstream receiver is gone.
async fn deliver(rec: FeedRecord, events: &Sender<Envelope>, errors: &Sender<StreamError>) -> bool {
    match rec {
        FeedRecord::Envelope(env) => events.send(env).await.is_ok(),
        FeedRecord::Error(err) => errors.send(err).await.is_ok(),
    }
}

async fn tail_feed(path: &Path, events: &Sender<Envelope>, errors: &Sender<StreamError>) -> Result<()> {
    let file = tokio::fs::File::open(path).await?;
    let mut lines = BufReader::new(file).split(b'\n');

    while lines.next_segment().await?.is_some() {} // consume existing

    info!("Tailing {}", path.display());
    loop {
        match lines.next_segment().await? {
            Some(line) => {
                if let Some(rec) = parse_line(&line) {
                    if !deliver(rec, events, errors).await {
                        break;
                    }
                }
            }
            None => tokio::time::sleep(TAIL_POLL).await,
        }
    }
    Ok(())
}

/// Wall-clock delay for a record `delta_ms` after the first timestamp.
/// `None` when pacing is off or the scaled delay is not representable.
fn replay_offset(delta_ms: i64, speed: f64) -> Option<Duration> {
    if !(speed > 0.0) {
        return None;
    }
    let secs = delta_ms.max(0) as f64 / 1000.0 / speed;
    Duration::try_from_secs_f64(secs).ok()
}

/// Records are replayed in file order. Envelopes with a timestamp are held
/// back until their offset from the first timestamp (divided by `speed`) has
/// elapsed; everything else goes out immediately. `speed <= 0` disables pacing,
/// and so does a speed small enough to push the delay out of range.
async fn replay_feed(
    path: &Path,
    speed: f64,
    events: &Sender<Envelope>,
    errors: &Sender<StreamError>,
) -> Result<()> {
    let content = tokio::fs::read(path).await?;
    let records: Vec<FeedRecord> = content.split(|b| *b == b'\n').filter_map(parse_line).collect();
    if records.is_empty() {
        return Ok(());
    }

    let base_wall = Instant::now();
    let mut base_ts = None;

    for rec in records {
        if let FeedRecord::Envelope(Envelope { timestamp: Some(ts), .. }) = &rec {
            let base = *base_ts.get_or_insert(*ts);
            let delta_ms = (*ts - base).num_milliseconds();
            if let Some(target) = replay_offset(delta_ms, speed).and_then(|d| base_wall.checked_add(d)) {
                let now = Instant::now();
                if target > now {
                    tokio::time::sleep(target - now).await;
                }
            }
        }
        if !deliver(rec, events, errors).await {
            break;
        }
    }
    info!("Replay of {} finished", path.display());
    Ok(())
}
