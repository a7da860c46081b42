//! Raw sample sources and windowing.
//!
//! A source task reads samples, cuts them into overlapping windows and hands
//! them to the classifier loop over a bounded channel. The task ends when
//! the stream ends or the session is cancelled; either way its sender drops,
//! which ends the classifier loop.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use emgadapt::features::Window;

use crate::config::{replay_period, SensorConfig, SensorSource};
use crate::error::SessionError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Sliding window over an interleaved sample stream.
#[derive(Debug, Clone)]
pub struct Windower {
    channels: usize,
    size: usize,
    increment: usize,
    buf: Vec<f32>,
    since_last: usize,
    primed: bool,
    rejected: u64,
}

impl Windower {
    pub fn new(channels: usize, size: usize, increment: usize) -> Self {
        Self {
            channels: channels.max(1),
            size: size.max(1),
            increment: increment.max(1),
            buf: Vec::with_capacity(size.max(1) * channels.max(1)),
            since_last: 0,
            primed: false,
            rejected: 0,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Samples ignored for holding NaN or infinite values.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Feed one sample (one value per channel). Returns a window once `size`
    /// samples are buffered, then every `increment` samples after that.
    /// Samples of the wrong width or with non-finite values are ignored.
    pub fn push(&mut self, sample: &[f32], timestamp: f64) -> Option<Window> {
        if sample.len() != self.channels {
            return None;
        }
        if sample.iter().any(|v| !v.is_finite()) {
            self.rejected += 1;
            return None;
        }
        if self.buf.len() == self.size * self.channels {
            self.buf.drain(..self.channels);
        }
        self.buf.extend_from_slice(sample);
        self.since_last += 1;

        if self.buf.len() < self.size * self.channels {
            return None;
        }
        if self.primed && self.since_last < self.increment {
            return None;
        }
        self.primed = true;
        self.since_last = 0;
        Some(Window {
            timestamp,
            channels: self.channels,
            samples: self.buf.clone(),
        })
    }
}

/// One line from the live streamer: a bare array or an object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SampleLine {
    Bare(Vec<f32>),
    Tagged {
        #[serde(default)]
        timestamp: Option<f64>,
        emg: Vec<f32>,
    },
}

fn parse_sample_line(line: &str) -> Option<(Vec<f32>, f64)> {
    match serde_json::from_str::<SampleLine>(line).ok()? {
        SampleLine::Bare(v) => Some((v, now_secs())),
        SampleLine::Tagged { timestamp, emg } => Some((emg, timestamp.unwrap_or_else(now_secs))),
    }
}

fn parse_csv_row(line: &str) -> Option<Vec<f32>> {
    line.trim()
        .split(',')
        .map(|c| c.trim().parse::<f32>().ok())
        .collect()
}

/// Open the configured source and spawn its reader task. Failing to reach
/// the stream is reported here, before anything else starts.
pub async fn start_source(
    cfg: &SensorConfig,
    tx: mpsc::Sender<Window>,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>, SessionError> {
    let windower = Windower::new(cfg.channels, cfg.window_size, cfg.window_increment);
    match &cfg.source {
        SensorSource::Tcp { addr } => {
            let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await
            {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => {
                    return Err(SessionError::StreamUnavailable(format!("{addr}: {e}")));
                }
                Err(_) => {
                    return Err(SessionError::StreamUnavailable(format!(
                        "{addr}: connect timed out after {CONNECT_TIMEOUT:?}"
                    )));
                }
            };
            info!("Sensor stream connected: {}", addr);
            Ok(tokio::spawn(run_tcp(stream, windower, tx, cancel)))
        }
        SensorSource::Csv {
            path,
            sample_rate_hz,
        } => {
            let file = open_recording(path).await?;
            info!("Replaying recording {:?}", path);
            Ok(tokio::spawn(run_csv(
                file,
                *sample_rate_hz,
                windower,
                tx,
                cancel,
            )))
        }
    }
}

async fn open_recording(path: &Path) -> Result<tokio::fs::File, SessionError> {
    tokio::fs::File::open(path)
        .await
        .map_err(|e| SessionError::StreamUnavailable(format!("{}: {e}", path.display())))
}

async fn run_tcp(
    stream: TcpStream,
    mut windower: Windower,
    tx: mpsc::Sender<Window>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stream).lines();
    let mut dropped: u64 = 0;
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(l)) => l,
            Ok(None) => {
                info!(
                    "Sensor stream closed by peer ({} non-finite samples ignored)",
                    windower.rejected()
                );
                break;
            }
            Err(e) => {
                warn!("Sensor stream read failed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let Some((sample, ts)) = parse_sample_line(&line) else {
            debug!("Ignoring malformed sample line");
            continue;
        };
        if sample.len() != windower.channels() {
            warn!(
                "Sample has {} channels, expected {}",
                sample.len(),
                windower.channels()
            );
            continue;
        }
        if let Some(window) = windower.push(&sample, ts) {
            // Live data: never block the socket on a slow consumer.
            match tx.try_send(window) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    dropped += 1;
                    if dropped.is_power_of_two() {
                        warn!("Classifier falling behind; {} windows dropped", dropped);
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
    }
}

async fn run_csv(
    file: tokio::fs::File,
    sample_rate_hz: f32,
    mut windower: Windower,
    tx: mpsc::Sender<Window>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(file).lines();
    let mut pace = replay_period(sample_rate_hz).map(|period| {
        let mut iv = tokio::time::interval(period);
        iv.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);
        iv
    });
    let mut samples: u64 = 0;
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(l)) => l,
            Ok(None) => {
                info!(
                    "Recording finished after {} samples ({} non-finite ignored)",
                    samples,
                    windower.rejected()
                );
                break;
            }
            Err(e) => {
                warn!("Recording read failed: {}", e);
                break;
            }
        };
        // Header and blank rows don't parse as numbers.
        let Some(sample) = parse_csv_row(&line) else {
            continue;
        };
        if sample.len() != windower.channels() {
            warn!(
                "Row has {} columns, expected {}",
                sample.len(),
                windower.channels()
            );
            continue;
        }
        if let Some(iv) = pace.as_mut() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = iv.tick() => {}
            }
        }
        samples += 1;
        if let Some(window) = windower.push(&sample, now_secs()) {
            let sent = tokio::select! {
                _ = cancel.cancelled() => break,
                r = tx.send(window) => r,
            };
            if sent.is_err() {
                break;
            }
        }
    }
}
