//! Online classifier loop: window → features → live model → vote → log.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use emgadapt::classifier::Classifier;
use emgadapt::features::{FeatureExtractor, Window};
use emgadapt::prediction_log::{PredictionLogWriter, PredictionRecord};
use emgadapt::registry::ModelRegistry;
use emgadapt::vote::{decide, MajorityVote};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    pub windows: u64,
    pub logged: u64,
    pub write_failures: u64,
    pub unknown: u64,
}

pub struct ClassifierLoop<M: Classifier, E: FeatureExtractor> {
    registry: Arc<ModelRegistry<M>>,
    extractor: E,
    vote: MajorityVote,
    rejection_threshold: Option<f32>,
    log: PredictionLogWriter,
}

impl<M: Classifier, E: FeatureExtractor> ClassifierLoop<M, E> {
    pub fn new(
        registry: Arc<ModelRegistry<M>>,
        extractor: E,
        majority_vote: usize,
        rejection_threshold: Option<f32>,
        log: PredictionLogWriter,
    ) -> Self {
        Self {
            registry,
            extractor,
            vote: MajorityVote::new(majority_vote),
            rejection_threshold,
            log,
        }
    }

    /// Classify one window against whatever model is live right now.
    pub fn classify(&mut self, window: &Window) -> PredictionRecord {
        let features = self.extractor.extract(window);
        let probabilities = self.registry.read_model().predict_proba(&features);
        let raw = decide(&probabilities, self.rejection_threshold);
        let predicted = self.vote.push(raw);
        PredictionRecord {
            timestamp: window.timestamp,
            predicted,
            probabilities,
            features,
        }
    }

    /// Runs until the window channel closes or the session is cancelled.
    pub async fn run(
        mut self,
        mut windows: mpsc::Receiver<Window>,
        cancel: CancellationToken,
    ) -> LoopStats {
        let mut stats = LoopStats::default();
        loop {
            let window = tokio::select! {
                _ = cancel.cancelled() => break,
                w = windows.recv() => match w {
                    Some(w) => w,
                    None => {
                        debug!("Window stream ended");
                        break;
                    }
                },
            };
            stats.windows += 1;
            let record = self.classify(&window);
            if record.predicted.is_none() {
                stats.unknown += 1;
            }
            match self.log.append(&record) {
                Ok(()) => stats.logged += 1,
                Err(e) => {
                    stats.write_failures += 1;
                    warn!("Prediction log write failed: {}", e);
                }
            }
        }
        info!(
            "Classifier loop stopped: {} windows, {} logged, {} unknown, {} write failures",
            stats.windows, stats.logged, stats.unknown, stats.write_failures
        );
        stats
    }
}
