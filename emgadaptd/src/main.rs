//! emgadaptd - online adaptation session for an EMG gesture classifier
//!
//! Runs one session end to end:
//! - classifies live sensor windows and logs every prediction
//! - fine-tunes the live model from game/robot context while inference runs
//! - persists the session memory per cycle and the adapted model at exit
//!
//! Storage locations, one `session-<unix millis>` dir per run (overridable
//! with `session_dir` or EMGADAPT_SESSION_DIR):
//! - Linux: ~/.local/share/emgadapt/sessions/
//! - Windows: %APPDATA%\emgadapt\sessions\
//! - MacOS: ~/Library/Application Support/emgadapt/sessions/

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod adaptation;
mod classifier_loop;
mod config;
mod context;
mod error;
mod handshake;
mod paths;
mod sensor;
mod session;

use config::SessionConfig;
use session::Session;

const USAGE: &str = "usage: emgadaptd [--config <session.json>]";

fn config_path_from_args() -> Result<Option<PathBuf>, String> {
    let mut args = std::env::args().skip(1);
    let mut path = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                let p = args.next().ok_or_else(|| format!("--config needs a path\n{USAGE}"))?;
                path = Some(PathBuf::from(p));
            }
            "-h" | "--help" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}\n{USAGE}")),
        }
    }
    Ok(path)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = match config_path_from_args()? {
        Some(path) => SessionConfig::load(&path)?,
        None => SessionConfig::default(),
    }
    .with_env();

    let session = Session::new(config)?;
    info!("Session directory: {:?}", session.paths().session_dir());

    let shutdown = CancellationToken::new();
    let run = session.run(shutdown.clone());
    tokio::pin!(run);
    let result = tokio::select! {
        r = &mut run => r,
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C: finishing current cycle and saving");
            shutdown.cancel();
            run.await
        }
    };

    match result {
        Ok(summary) => {
            info!(
                "Session complete: {} windows classified, {} adaptation rounds, \
                 model v{} saved to {:?}",
                summary.classifier.windows,
                summary.adaptation.fits,
                summary.generation,
                summary.final_model
            );
            Ok(())
        }
        Err(e) => {
            error!("Session failed: {}", e);
            Err(e.into())
        }
    }
}
