//! # emgadapt
//!
//! Core of an online adaptation loop for EMG gesture classifiers.
//!
//! Live windows are classified against a model that can be fine-tuned while
//! inference keeps running; each classification is logged, judged against
//! context supplied by a game or robot, and folded into an experience
//! [`memory::Memory`] that drives the next fine-tuning round.
//!
//! ## Quick Start
//!
//! ```
//! use emgadapt::prelude::*;
//!
//! let registry = ModelRegistry::new(CosineClassifier::new(3, 2));
//!
//! // Fine-tune on a labelled batch; inference never sees a half-written model.
//! registry
//!     .with_model(|m| m.fit(&[1.0, 0.0, 0.0, 1.0, -1.0, -1.0], 2, &[0, 1, 2]))
//!     .unwrap();
//!
//! let model = registry.read_model();
//! assert_eq!(model.predict(&[0.9, 0.1]), 0);
//! ```
//!
//! ## Feature Flags
//!
//! - `serde` (default): serde derives on records and windows
//! - `parallel`: batch inference via rayon
//! - `simd`: `wide` dot products in the classifier heads
//!
//! ## Modules
//!
//! - [`memory`]: experience buffer with merge/shuffle/persistence
//! - [`registry`]: hot-swap guard around the live classifier
//! - [`classifier`]: classifier contract, cosine head, runtime head choice, checkpoints
//! - [`lda`]: shrinkage LDA head
//! - [`features`]: windows and feature extraction
//! - [`vote`]: rejection and majority-vote smoothing
//! - [`prediction_log`]: append-only log with an exactly-once cursor

#[path = "core/storage.rs"]
pub mod storage;

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/memory.rs"]
pub mod memory;

#[path = "core/classifier.rs"]
pub mod classifier;

#[path = "core/lda.rs"]
pub mod lda;

#[path = "core/registry.rs"]
pub mod registry;

#[path = "core/features.rs"]
pub mod features;

#[path = "core/vote.rs"]
pub mod vote;

#[path = "core/prediction_log.rs"]
pub mod prediction_log;

/// Prelude module for convenient imports.
///
/// ```
/// use emgadapt::prelude::*;
/// ```
pub mod prelude {
    pub use crate::classifier::{
        argmax, predict_batch, Checkpoint, Classifier, CosineClassifier, FeatureScaler, Head,
        TrainingError,
    };
    pub use crate::lda::LdaClassifier;
    pub use crate::features::{FeatureExtractor, TimeDomainFeatures, Window};
    pub use crate::memory::{
        ClassId, ExperienceBatch, ExperienceRecord, Memory, MemoryError, Outcome,
    };
    pub use crate::prediction_log::{LogCursor, Polled, PredictionLogWriter, PredictionRecord};
    pub use crate::prng::Prng;
    pub use crate::registry::ModelRegistry;
    pub use crate::vote::{decide, MajorityVote};
}
