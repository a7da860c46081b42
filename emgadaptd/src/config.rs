//! Session configuration.
//!
//! Built once at startup (JSON file, environment overrides, defaults) and
//! handed to the orchestrator by value. Nothing here is global.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Environment override for the session directory.
pub const ENV_SESSION_DIR: &str = "EMGADAPT_SESSION_DIR";

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_handshake_port() -> u16 {
    12350
}

fn default_context_port() -> u16 {
    12348
}

fn default_num_classes() -> usize {
    5
}

fn default_majority_vote() -> usize {
    1
}

fn default_context_timeout_ms() -> u64 {
    1000
}

fn default_handshake_timeout_ms() -> u64 {
    120_000
}

fn default_true() -> bool {
    true
}

fn default_channels() -> usize {
    8
}

fn default_window_size() -> usize {
    50
}

fn default_window_increment() -> usize {
    10
}

fn default_sample_rate_hz() -> f32 {
    200.0
}

fn default_stream_addr() -> String {
    "127.0.0.1:12345".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SensorSource {
    /// Live streamer emitting one JSON sample per line.
    Tcp {
        #[serde(default = "default_stream_addr")]
        addr: String,
    },
    /// Offline replay of a CSV recording (one sample per row).
    Csv {
        path: PathBuf,
        /// Replay pace; 0 replays as fast as the classifier consumes.
        #[serde(default = "default_sample_rate_hz")]
        sample_rate_hz: f32,
    },
}

/// Interval between replayed samples. `None` for an unpaced replay (rate 0)
/// or a rate whose period does not fit a non-zero `Duration`.
pub fn replay_period(sample_rate_hz: f32) -> Option<std::time::Duration> {
    if sample_rate_hz <= 0.0 {
        return None;
    }
    std::time::Duration::try_from_secs_f64(1.0 / f64::from(sample_rate_hz))
        .ok()
        .filter(|d| !d.is_zero())
}

impl Default for SensorSource {
    fn default() -> Self {
        SensorSource::Tcp {
            addr: default_stream_addr(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    #[serde(default)]
    pub source: SensorSource,
    #[serde(default = "default_channels")]
    pub channels: usize,
    /// Samples per classification window.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Samples between consecutive windows.
    #[serde(default = "default_window_increment")]
    pub window_increment: usize,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            source: SensorSource::default(),
            channels: default_channels(),
            window_size: default_window_size(),
            window_increment: default_window_increment(),
        }
    }
}

/// What each adaptation round fits on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStrategy {
    /// Fine-tune on the records collected this cycle only.
    #[default]
    Incremental,
    /// Refit from the whole session memory each cycle.
    FullMemory,
}

/// Classifier head built for a fresh model. A loaded checkpoint keeps its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadKind {
    #[default]
    Cosine,
    /// Shrinkage LDA.
    Lda,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    #[serde(default = "default_handshake_port")]
    pub handshake_port: u16,
    #[serde(default = "default_context_port")]
    pub context_port: u16,

    #[serde(default)]
    pub sensor: SensorConfig,

    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    /// Number of recent predictions voted over; 1 disables smoothing.
    #[serde(default = "default_majority_vote")]
    pub majority_vote: usize,
    /// Windows whose best score is below this are reported as Unknown.
    #[serde(default)]
    pub rejection_threshold: Option<f32>,

    #[serde(default = "default_context_timeout_ms")]
    pub context_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default)]
    pub head: HeadKind,
    #[serde(default)]
    pub fit_strategy: FitStrategy,
    /// Write one memory snapshot per adaptation cycle.
    #[serde(default = "default_true")]
    pub persist_memory: bool,

    /// Where logs, memory snapshots and the final model go. Defaults to a
    /// new per-run directory; an existing one is appended to.
    #[serde(default)]
    pub session_dir: Option<PathBuf>,
    /// Checkpoint to start from; a fresh model is built when absent.
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    /// Memory directory of an earlier session to fit a fresh model on.
    #[serde(default)]
    pub warm_start_dir: Option<PathBuf>,
    /// Seed for memory shuffling; clock-seeded when absent.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            handshake_port: default_handshake_port(),
            context_port: default_context_port(),
            sensor: SensorConfig::default(),
            num_classes: default_num_classes(),
            majority_vote: default_majority_vote(),
            rejection_threshold: None,
            context_timeout_ms: default_context_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            head: HeadKind::default(),
            fit_strategy: FitStrategy::default(),
            persist_memory: true,
            session_dir: None,
            model_path: None,
            warm_start_dir: None,
            seed: None,
        }
    }
}

impl SessionConfig {
    /// Read a JSON config file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SessionError::Config(format!("cannot read {}: {e}", path.display())))?;
        let cfg: Self = serde_json::from_str(&text)
            .map_err(|e| SessionError::Config(format!("cannot parse {}: {e}", path.display())))?;
        Ok(cfg)
    }

    /// Apply environment overrides.
    pub fn with_env(mut self) -> Self {
        if let Some(dir) = std::env::var_os(ENV_SESSION_DIR) {
            self.session_dir = Some(PathBuf::from(dir));
        }
        self
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        let bad = |msg: &str| Err(SessionError::Config(msg.to_string()));
        if self.num_classes < 2 {
            return bad("num_classes must be at least 2");
        }
        if self.sensor.channels == 0 {
            return bad("sensor.channels must be positive");
        }
        if self.sensor.window_size == 0 || self.sensor.window_increment == 0 {
            return bad("sensor.window_size and sensor.window_increment must be positive");
        }
        if let Some(t) = self.rejection_threshold {
            if !(0.0..=1.0).contains(&t) {
                return bad("rejection_threshold must be within [0, 1]");
            }
        }
        if let SensorSource::Csv { sample_rate_hz, .. } = &self.sensor.source {
            if !sample_rate_hz.is_finite() || *sample_rate_hz < 0.0 {
                return bad("sensor.source.sample_rate_hz must be finite and non-negative");
            }
            if *sample_rate_hz > 0.0 && replay_period(*sample_rate_hz).is_none() {
                return bad("sensor.source.sample_rate_hz is outside the replayable range");
            }
        }
        if self.context_timeout_ms == 0 {
            return bad("context_timeout_ms must be positive");
        }
        Ok(())
    }

    pub fn context_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.context_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.handshake_timeout_ms)
    }
}
