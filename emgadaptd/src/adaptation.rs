//! Adaptation manager.
//!
//! One cycle per context message:
//!
//! ```text
//! WaitForContext → CollectNewPredictions → BuildMemoryBatch → Retrain → Publish
//! ```
//!
//! Predictions logged since the previous cycle are judged against the
//! context, folded into the session memory and used to fine-tune the live
//! model through the registry. Inference keeps running throughout.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use emgadapt::classifier::Classifier;
use emgadapt::memory::{ClassId, ExperienceBatch, Memory, Outcome};
use emgadapt::prediction_log::{LogCursor, PredictionRecord};
use emgadapt::prng::Prng;
use emgadapt::registry::ModelRegistry;

use crate::config::FitStrategy;
use crate::context::ContextChannel;
use crate::error::SessionError;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AdaptationStats {
    /// Context messages acted on.
    pub cycles: u64,
    pub fits: u64,
    pub training_failures: u64,
    pub context_timeouts: u64,
    /// Records folded into memory.
    pub records: u64,
    /// Logged rows left out of a batch (non-finite or wrong width).
    pub dropped_rows: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptReport {
    pub records: usize,
    pub positives: usize,
    pub negatives: usize,
    pub memory_len: usize,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Cancelled,
    ContextTimeout,
    /// Context arrived but nothing usable was classified since the last cycle.
    NoPredictions,
    /// The fit was rejected; the previous weights stay live.
    TrainingFailed,
    Adapted(AdaptReport),
}

/// Turn logged predictions into a contextual batch. A record is positive
/// when its prediction matched the context. Rows with non-finite features,
/// or whose width differs from the first usable row, are dropped.
pub fn label_against_context(records: &[PredictionRecord], context: ClassId) -> ExperienceBatch {
    let usable = |r: &&PredictionRecord| r.features.iter().all(|v| v.is_finite());
    let dim = records.iter().find(usable).map_or(0, |r| r.features.len());
    let mut batch = ExperienceBatch::new(dim);
    for r in records
        .iter()
        .filter(usable)
        .filter(|r| r.features.len() == dim)
    {
        batch.push(
            &r.features,
            r.predicted,
            context,
            Outcome::judge(r.predicted, context),
            r.timestamp,
        );
    }
    batch
}

pub struct AdaptationManager<M: Classifier> {
    registry: Arc<ModelRegistry<M>>,
    cursor: LogCursor,
    num_classes: usize,
    strategy: FitStrategy,
    memory: Memory,
    memory_dir: Option<PathBuf>,
    next_index: u32,
    rng: Prng,
    pending: Option<Memory>,
    stats: AdaptationStats,
}

impl<M: Classifier> AdaptationManager<M> {
    pub fn new(
        registry: Arc<ModelRegistry<M>>,
        cursor: LogCursor,
        num_classes: usize,
        strategy: FitStrategy,
        rng: Prng,
    ) -> Self {
        Self {
            registry,
            cursor,
            num_classes,
            strategy,
            memory: Memory::new(),
            memory_dir: None,
            next_index: 0,
            rng,
            pending: None,
            stats: AdaptationStats::default(),
        }
    }

    /// Persist each cycle's batch under `dir`. Numbering continues after any
    /// snapshots already there.
    pub fn persist_to(mut self, dir: PathBuf) -> Result<Self, SessionError> {
        self.next_index = Memory::snapshot_indices(&dir)?
            .last()
            .map_or(0, |&i| i.saturating_add(1));
        self.memory_dir = Some(dir);
        Ok(self)
    }

    /// Start from an existing memory (e.g. a previous session's).
    pub fn with_memory(mut self, memory: Memory) -> Self {
        self.memory = memory;
        self
    }

    #[allow(dead_code)]
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn stats(&self) -> AdaptationStats {
        self.stats
    }

    /// Rows appended to the log since the last call, each returned once.
    pub fn poll_new_predictions(&mut self) -> Result<Vec<PredictionRecord>, SessionError> {
        let polled = self.cursor.poll()?;
        if polled.skipped > 0 {
            warn!("Skipped {} unreadable prediction log rows", polled.skipped);
        }
        Ok(polled.records)
    }

    /// Fine-tune the live model on `batch` and fold it into memory. On
    /// failure the live model and the memory are untouched and nothing is
    /// queued to publish.
    pub async fn adapt(&mut self, batch: ExperienceBatch) -> Result<AdaptReport, SessionError> {
        let cycle = Memory::from_batch(batch)?;
        let mut merged = self.memory.clone();
        merged.merge(&cycle)?;

        let (x, y) = match self.strategy {
            FitStrategy::Incremental => {
                let mut shuffled = cycle.clone();
                shuffled.shuffle_with(&mut self.rng);
                shuffled.training_set()
            }
            FitStrategy::FullMemory => {
                merged.shuffle_with(&mut self.rng);
                let set = merged.training_set();
                // Snapshots and later merges expect capture order.
                merged.unshuffle();
                set
            }
        };

        let dim = cycle.dim();
        let refit = self.strategy == FitStrategy::FullMemory;
        let registry = Arc::clone(&self.registry);
        let fitted = tokio::task::spawn_blocking(move || {
            registry.with_model(|m| {
                if refit {
                    m.refit(&x, dim, &y)
                } else {
                    m.fit(&x, dim, &y)
                }
            })
        })
        .await?;
        if let Err(e) = fitted {
            self.stats.training_failures += 1;
            return Err(e.into());
        }
        self.memory = merged;
        self.stats.fits += 1;
        self.stats.records += cycle.len() as u64;

        let (positives, negatives) = cycle.outcome_counts();
        let report = AdaptReport {
            records: cycle.len(),
            positives,
            negatives,
            memory_len: self.memory.len(),
            generation: self.registry.generation(),
        };
        self.pending = Some(cycle);
        Ok(report)
    }

    /// Write the last adapted batch as the next memory snapshot.
    pub fn publish(&mut self) -> Result<Option<PathBuf>, SessionError> {
        let Some(cycle) = self.pending.take() else {
            return Ok(None);
        };
        let Some(dir) = &self.memory_dir else {
            return Ok(None);
        };
        let path = cycle.persist(dir, self.next_index)?;
        self.next_index += 1;
        debug!("Memory snapshot written: {:?}", path);
        Ok(Some(path))
    }

    /// Run one full cycle. A cycle that got as far as Retrain always
    /// publishes, even if cancellation arrived meanwhile.
    pub async fn cycle(
        &mut self,
        context: &ContextChannel,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome, SessionError> {
        let received = tokio::select! {
            _ = cancel.cancelled() => return Ok(CycleOutcome::Cancelled),
            r = context.recv(timeout, self.num_classes) => r,
        };
        let correct = match received {
            Ok(c) => c,
            Err(SessionError::ContextTimeout(_)) => {
                self.stats.context_timeouts += 1;
                return Ok(CycleOutcome::ContextTimeout);
            }
            Err(e) => return Err(e),
        };
        self.stats.cycles += 1;

        let records = self.poll_new_predictions()?;
        if records.is_empty() {
            debug!("Context {} arrived with no new predictions", correct);
            return Ok(CycleOutcome::NoPredictions);
        }
        let batch = label_against_context(&records, correct);
        let dropped = records.len() - batch.len();
        if dropped > 0 {
            warn!("Dropped {} unusable prediction rows", dropped);
            self.stats.dropped_rows += dropped as u64;
        }
        if batch.is_empty() {
            return Ok(CycleOutcome::NoPredictions);
        }

        let report = match self.adapt(batch).await {
            Ok(r) => r,
            Err(SessionError::Training(e)) => {
                warn!("Adaptation fit failed, keeping previous model: {}", e);
                return Ok(CycleOutcome::TrainingFailed);
            }
            Err(e) => return Err(e),
        };
        if cancel.is_cancelled() {
            debug!("Shutdown requested; publishing the batch just trained");
        }
        self.publish()?;
        info!(
            "Adapted on {} records ({} correct, {} wrong), memory {}, model v{}",
            report.records,
            report.positives,
            report.negatives,
            report.memory_len,
            report.generation
        );
        Ok(CycleOutcome::Adapted(report))
    }

    /// Cycle until cancelled. Recoverable errors are logged and the loop
    /// carries on; anything fatal ends it.
    pub async fn run(
        mut self,
        context: ContextChannel,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<AdaptationStats, SessionError> {
        while !cancel.is_cancelled() {
            match self.cycle(&context, timeout, &cancel).await {
                Ok(CycleOutcome::Cancelled) => break,
                Ok(_) => {}
                Err(e) if !e.is_fatal() => warn!("Adaptation cycle failed: {}", e),
                Err(e) => return Err(e),
            }
        }
        let stats = self.stats();
        info!(
            "Adaptation stopped: {} cycles, {} fits ({} records), {} failed, {} context timeouts, \
             {} rows dropped",
            stats.cycles,
            stats.fits,
            stats.records,
            stats.training_failures,
            stats.context_timeouts,
            stats.dropped_rows
        );
        Ok(stats)
    }
}
