//! Session file layout
//!
//! By default every run gets its own `session-<unix millis>` directory under
//! the OS data dir:
//! - Linux: ~/.local/share/emgadapt/sessions/
//! - Windows: %APPDATA%\emgadapt\sessions\
//! - MacOS: ~/Library/Application Support/emgadapt/sessions/
//!
//! An explicit directory is used as is, so rerunning into it appends to the
//! memory snapshots already there.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::SessionError;

#[derive(Debug, Clone)]
pub struct SessionPaths {
    session_dir: PathBuf,
}

impl SessionPaths {
    /// Use `dir` when given, otherwise a fresh directory under the OS data
    /// dir. Creates the directory tree, including `memory/`.
    pub fn new(dir: Option<&Path>) -> Result<Self, SessionError> {
        let session_dir = match dir {
            Some(d) => d.to_path_buf(),
            None => Self::fresh_dir(&Self::sessions_root()?, SystemTime::now()),
        };
        fs::create_dir_all(session_dir.join("memory")).map_err(|e| {
            SessionError::Config(format!(
                "failed to create session directory {}: {e}",
                session_dir.display()
            ))
        })?;
        Ok(Self { session_dir })
    }

    fn sessions_root() -> Result<PathBuf, SessionError> {
        let base = dirs::data_dir()
            .ok_or_else(|| SessionError::Config("could not determine data directory".into()))?;
        Ok(base.join("emgadapt").join("sessions"))
    }

    /// First unused `session-<millis>[-n]` under `root`.
    fn fresh_dir(root: &Path, now: SystemTime) -> PathBuf {
        let millis = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let stem = format!("session-{millis}");
        let mut dir = root.join(&stem);
        let mut n = 1;
        while dir.exists() {
            dir = root.join(format!("{stem}-{n}"));
            n += 1;
        }
        dir
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// Prediction log shared between the classifier loop and the manager.
    pub fn preds_log(&self) -> PathBuf {
        self.session_dir.join("live_preds.csv")
    }

    /// One `classifier_memory_{i}.bin` per adaptation cycle.
    pub fn memory_dir(&self) -> PathBuf {
        self.session_dir.join("memory")
    }

    /// Adapted model written once at shutdown.
    pub fn final_model(&self) -> PathBuf {
        self.session_dir.join("model_post.emgm")
    }
}
