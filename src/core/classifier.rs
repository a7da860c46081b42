//! Classifier contract and the cosine-similarity head used for online adaptation.
//!
//! The adaptation loop only needs four things from a model: its class count,
//! class probabilities for one feature vector, the argmax of those, and an
//! incremental `fit`. Anything implementing [`Classifier`] can sit behind a
//! [`crate::registry::ModelRegistry`]. [`Head`] picks between the cosine head
//! and [`crate::lda::LdaClassifier`] at runtime.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[cfg(feature = "simd")]
use wide::f32x4;

use crate::lda::LdaClassifier;
use crate::memory::ClassId;
use crate::storage;

pub const CHECKPOINT_MAGIC: &[u8; 8] = b"EMGMODL1";
pub const CHECKPOINT_VERSION: u32 = 1;

pub(crate) const TAG_META: [u8; 4] = *b"META";
pub(crate) const TAG_SCALER: [u8; 4] = *b"SCAL";
const TAG_CENTROIDS: [u8; 4] = *b"CENT";
pub(crate) const TAG_COUNTS: [u8; 4] = *b"NSMP";

#[derive(Debug, Clone, PartialEq)]
pub enum TrainingError {
    EmptyBatch,
    ShapeMismatch { expected: usize, got: usize },
    NonFinite,
    UnknownClass(ClassId),
    /// The pooled covariance could not be factorised.
    Singular,
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::EmptyBatch => write!(f, "no samples to fit"),
            TrainingError::ShapeMismatch { expected, got } => {
                write!(f, "feature width mismatch: expected {expected}, got {got}")
            }
            TrainingError::NonFinite => write!(f, "non-finite feature value in batch"),
            TrainingError::UnknownClass(c) => {
                write!(f, "label {c} is outside the model's classes")
            }
            TrainingError::Singular => write!(f, "covariance is not positive definite"),
        }
    }
}

impl std::error::Error for TrainingError {}

pub trait Classifier: Clone + Send + Sync + 'static {
    fn num_classes(&self) -> usize;

    /// Feature width the model expects.
    fn dim(&self) -> usize;

    /// One probability-like score per class, each in `[0, 1]`.
    fn predict_proba(&self, features: &[f32]) -> Vec<f32>;

    fn predict(&self, features: &[f32]) -> ClassId {
        argmax(&self.predict_proba(features)).0
    }

    /// Fine-tune on `labels.len()` rows of `dim` features each.
    fn fit(
        &mut self,
        features: &[f32],
        dim: usize,
        labels: &[ClassId],
    ) -> Result<(), TrainingError>;

    /// Train on exactly these rows, forgetting earlier fits. Models that
    /// have no notion of history can leave this as `fit`.
    fn refit(
        &mut self,
        features: &[f32],
        dim: usize,
        labels: &[ClassId],
    ) -> Result<(), TrainingError> {
        self.fit(features, dim, labels)
    }
}

/// Single-file save/load with bit-identical inference after a round trip.
pub trait Checkpoint: Sized {
    fn save_to<W: Write>(&self, w: &mut W) -> io::Result<()>;
    fn load_from<R: Read>(r: &mut R) -> io::Result<Self>;

    fn save_checkpoint(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut w = BufWriter::new(File::create(path)?);
        self.save_to(&mut w)?;
        w.flush()
    }

    fn load_checkpoint(path: &Path) -> io::Result<Self> {
        let mut r = BufReader::new(File::open(path)?);
        Self::load_from(&mut r)
    }
}

/// Index and value of the largest score. Ties go to the lowest class id.
pub fn argmax(scores: &[f32]) -> (ClassId, f32) {
    let mut best = (0 as ClassId, f32::NEG_INFINITY);
    for (i, &s) in scores.iter().enumerate() {
        if s > best.1 {
            best = (i as ClassId, s);
        }
    }
    best
}

/// Predict every row of a flat feature matrix.
pub fn predict_batch<M: Classifier>(model: &M, features: &[f32], dim: usize) -> Vec<ClassId> {
    if dim == 0 {
        return Vec::new();
    }
    #[cfg(feature = "parallel")]
    {
        features.par_chunks(dim).map(|row| model.predict(row)).collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        features.chunks(dim).map(|row| model.predict(row)).collect()
    }
}

pub(crate) fn validate_batch(
    features: &[f32],
    dim: usize,
    labels: &[ClassId],
    model_dim: usize,
    num_classes: usize,
) -> Result<(), TrainingError> {
    if labels.is_empty() {
        return Err(TrainingError::EmptyBatch);
    }
    if dim != model_dim {
        return Err(TrainingError::ShapeMismatch {
            expected: model_dim,
            got: dim,
        });
    }
    if features.len() != labels.len() * dim {
        return Err(TrainingError::ShapeMismatch {
            expected: labels.len() * dim,
            got: features.len(),
        });
    }
    if features.iter().any(|v| !v.is_finite()) {
        return Err(TrainingError::NonFinite);
    }
    if let Some(&bad) = labels.iter().find(|&&c| c as usize >= num_classes) {
        return Err(TrainingError::UnknownClass(bad));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Feature scaler
// ═══════════════════════════════════════════════════════════════════════════

/// Per-feature z-score normalisation, fitted once on the first training set.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureScaler {
    pub(crate) mean: Vec<f32>,
    pub(crate) std: Vec<f32>,
    pub(crate) fitted: bool,
}

impl FeatureScaler {
    pub fn identity(dim: usize) -> Self {
        Self {
            mean: vec![0.0; dim],
            std: vec![1.0; dim],
            fitted: false,
        }
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted
    }

    pub fn fit(&mut self, features: &[f32], dim: usize) {
        let rows = features.len() / dim.max(1);
        if rows == 0 {
            return;
        }
        let mut mean = vec![0.0f64; dim];
        for row in features.chunks_exact(dim) {
            for (m, &v) in mean.iter_mut().zip(row) {
                *m += v as f64;
            }
        }
        for m in &mut mean {
            *m /= rows as f64;
        }
        let mut var = vec![0.0f64; dim];
        for row in features.chunks_exact(dim) {
            for ((s, &v), &m) in var.iter_mut().zip(row).zip(&mean) {
                let d = v as f64 - m;
                *s += d * d;
            }
        }
        self.mean = mean.iter().map(|&m| m as f32).collect();
        self.std = var
            .iter()
            .map(|&s| {
                let sd = (s / rows as f64).sqrt() as f32;
                // Constant features would divide by zero.
                if sd > f32::EPSILON {
                    sd
                } else {
                    1.0
                }
            })
            .collect();
        self.fitted = true;
    }

    pub fn transform(&self, x: &[f32]) -> Vec<f32> {
        x.iter()
            .zip(self.mean.iter().zip(&self.std))
            .map(|(&v, (&m, &s))| (v - m) / s)
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Cosine-similarity head
// ═══════════════════════════════════════════════════════════════════════════

/// Nearest-centroid classifier scored by cosine similarity.
///
/// Centroids are running means in scaled feature space, so fitting a new
/// batch refines them without revisiting old data.
#[derive(Debug, Clone, PartialEq)]
pub struct CosineClassifier {
    num_classes: usize,
    dim: usize,
    scaler: FeatureScaler,
    centroids: Vec<f32>,
    counts: Vec<u64>,
}

impl CosineClassifier {
    pub fn new(num_classes: usize, dim: usize) -> Self {
        Self {
            num_classes,
            dim,
            scaler: FeatureScaler::identity(dim),
            centroids: vec![0.0; num_classes * dim],
            counts: vec![0; num_classes],
        }
    }

    pub fn scaler(&self) -> &FeatureScaler {
        &self.scaler
    }

    pub fn class_counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn centroid(&self, class: ClassId) -> &[f32] {
        let c = class as usize;
        &self.centroids[c * self.dim..(c + 1) * self.dim]
    }

    pub fn is_trained(&self) -> bool {
        self.counts.iter().any(|&n| n > 0)
    }
}

impl Classifier for CosineClassifier {
    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn dim(&self) -> usize {
        self.dim
    }

    /// Cosine similarity mapped from `[-1, 1]` to `[0, 1]`. Classes that have
    /// never been fitted score 0, as does every class for a wrongly sized input.
    fn predict_proba(&self, features: &[f32]) -> Vec<f32> {
        let mut out = vec![0.0; self.num_classes];
        if features.len() != self.dim {
            return out;
        }
        let x = self.scaler.transform(features);
        let x_norm = dot(&x, &x).sqrt();
        for (c, slot) in out.iter_mut().enumerate() {
            if self.counts[c] == 0 {
                continue;
            }
            let centroid = &self.centroids[c * self.dim..(c + 1) * self.dim];
            let c_norm = dot(centroid, centroid).sqrt();
            let cos = if x_norm > 0.0 && c_norm > 0.0 {
                (dot(&x, centroid) / (x_norm * c_norm)).clamp(-1.0, 1.0)
            } else {
                0.0
            };
            *slot = (cos + 1.0) / 2.0;
        }
        out
    }

    fn fit(
        &mut self,
        features: &[f32],
        dim: usize,
        labels: &[ClassId],
    ) -> Result<(), TrainingError> {
        validate_batch(features, dim, labels, self.dim, self.num_classes)?;

        if !self.scaler.is_fitted() {
            self.scaler.fit(features, dim);
        }

        let mut sums = vec![0.0f64; self.num_classes * dim];
        let mut added = vec![0u64; self.num_classes];
        for (row, &label) in features.chunks_exact(dim).zip(labels) {
            let c = label as usize;
            added[c] += 1;
            let scaled = self.scaler.transform(row);
            for (s, v) in sums[c * dim..(c + 1) * dim].iter_mut().zip(scaled) {
                *s += v as f64;
            }
        }

        for c in 0..self.num_classes {
            if added[c] == 0 {
                continue;
            }
            let old_n = self.counts[c] as f64;
            let new_n = old_n + added[c] as f64;
            let centroid = &mut self.centroids[c * dim..(c + 1) * dim];
            for (m, s) in centroid.iter_mut().zip(&sums[c * dim..(c + 1) * dim]) {
                *m = ((*m as f64 * old_n + s) / new_n) as f32;
            }
            self.counts[c] += added[c];
        }
        Ok(())
    }

    /// Keeps the feature scaling so scores stay comparable across refits.
    fn refit(
        &mut self,
        features: &[f32],
        dim: usize,
        labels: &[ClassId],
    ) -> Result<(), TrainingError> {
        validate_batch(features, dim, labels, self.dim, self.num_classes)?;
        self.centroids.iter_mut().for_each(|v| *v = 0.0);
        self.counts.iter_mut().for_each(|n| *n = 0);
        self.fit(features, dim, labels)
    }
}

impl Checkpoint for CosineClassifier {
    fn save_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        storage::write_header(w, CHECKPOINT_MAGIC, CHECKPOINT_VERSION)?;
        let meta = serde_json::json!({
            "kind": "cosine",
            "num_classes": self.num_classes,
            "dim": self.dim,
            "scaler_fitted": self.scaler.fitted,
        });
        let meta = serde_json::to_vec(&meta)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        storage::write_chunk_lz4(w, TAG_META, &meta)?;

        let mut scal = storage::f32s_to_bytes(&self.scaler.mean);
        scal.extend(storage::f32s_to_bytes(&self.scaler.std));
        storage::write_chunk_lz4(w, TAG_SCALER, &scal)?;
        storage::write_chunk_lz4(w, TAG_CENTROIDS, &storage::f32s_to_bytes(&self.centroids))?;
        storage::write_chunk_lz4(w, TAG_COUNTS, &storage::u64s_to_bytes(&self.counts))
    }

    fn load_from<R: Read>(r: &mut R) -> io::Result<Self> {
        storage::read_header(r, CHECKPOINT_MAGIC, CHECKPOINT_VERSION)?;

        let mut meta: Option<serde_json::Value> = None;
        let mut scal: Option<Vec<f32>> = None;
        let mut centroids: Option<Vec<f32>> = None;
        let mut counts: Option<Vec<u64>> = None;
        while let Some((tag, payload)) = storage::read_chunk_lz4(r)? {
            match tag {
                TAG_META => {
                    meta = Some(
                        serde_json::from_slice(&payload)
                            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
                    )
                }
                TAG_SCALER => scal = Some(storage::bytes_to_f32s(&payload)?),
                TAG_CENTROIDS => centroids = Some(storage::bytes_to_f32s(&payload)?),
                TAG_COUNTS => counts = Some(storage::bytes_to_u64s(&payload)?),
                _ => {}
            }
        }

        let missing = |what: &str| storage::invalid_data(&format!("checkpoint missing {what}"));
        let meta = meta.ok_or_else(|| missing("META"))?;
        if meta["kind"] != "cosine" {
            return Err(storage::invalid_data("checkpoint is not a cosine classifier"));
        }
        let num_classes = meta["num_classes"]
            .as_u64()
            .ok_or_else(|| missing("num_classes"))? as usize;
        let dim = meta["dim"].as_u64().ok_or_else(|| missing("dim"))? as usize;
        let fitted = meta["scaler_fitted"].as_bool().unwrap_or(false);

        let scal = scal.ok_or_else(|| missing("SCAL"))?;
        let centroids = centroids.ok_or_else(|| missing("CENT"))?;
        let counts = counts.ok_or_else(|| missing("NSMP"))?;
        if scal.len() != 2 * dim
            || centroids.len() != num_classes * dim
            || counts.len() != num_classes
        {
            return Err(storage::invalid_data("checkpoint chunk sizes disagree with META"));
        }
        let (mean, std) = scal.split_at(dim);

        Ok(Self {
            num_classes,
            dim,
            scaler: FeatureScaler {
                mean: mean.to_vec(),
                std: std.to_vec(),
                fitted,
            },
            centroids,
            counts,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Runtime head selection
// ═══════════════════════════════════════════════════════════════════════════

/// The `kind` recorded in a checkpoint's META chunk.
pub fn checkpoint_kind<R: Read>(r: &mut R) -> io::Result<String> {
    storage::read_header(r, CHECKPOINT_MAGIC, CHECKPOINT_VERSION)?;
    while let Some((tag, payload)) = storage::read_chunk_lz4(r)? {
        if tag == TAG_META {
            let meta: serde_json::Value = serde_json::from_slice(&payload)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            return meta["kind"]
                .as_str()
                .map(str::to_owned)
                .ok_or_else(|| storage::invalid_data("checkpoint META has no kind"));
        }
    }
    Err(storage::invalid_data("checkpoint missing META"))
}

/// Either classifier head, chosen at runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum Head {
    Cosine(CosineClassifier),
    Lda(LdaClassifier),
}

impl Head {
    pub fn kind(&self) -> &'static str {
        match self {
            Head::Cosine(_) => "cosine",
            Head::Lda(_) => "lda",
        }
    }
}

impl From<CosineClassifier> for Head {
    fn from(m: CosineClassifier) -> Self {
        Head::Cosine(m)
    }
}

impl From<LdaClassifier> for Head {
    fn from(m: LdaClassifier) -> Self {
        Head::Lda(m)
    }
}

impl Classifier for Head {
    fn num_classes(&self) -> usize {
        match self {
            Head::Cosine(m) => m.num_classes(),
            Head::Lda(m) => m.num_classes(),
        }
    }

    fn dim(&self) -> usize {
        match self {
            Head::Cosine(m) => m.dim(),
            Head::Lda(m) => m.dim(),
        }
    }

    fn predict_proba(&self, features: &[f32]) -> Vec<f32> {
        match self {
            Head::Cosine(m) => m.predict_proba(features),
            Head::Lda(m) => m.predict_proba(features),
        }
    }

    fn fit(
        &mut self,
        features: &[f32],
        dim: usize,
        labels: &[ClassId],
    ) -> Result<(), TrainingError> {
        match self {
            Head::Cosine(m) => m.fit(features, dim, labels),
            Head::Lda(m) => m.fit(features, dim, labels),
        }
    }

    fn refit(
        &mut self,
        features: &[f32],
        dim: usize,
        labels: &[ClassId],
    ) -> Result<(), TrainingError> {
        match self {
            Head::Cosine(m) => m.refit(features, dim, labels),
            Head::Lda(m) => m.refit(features, dim, labels),
        }
    }
}

impl Checkpoint for Head {
    fn save_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self {
            Head::Cosine(m) => m.save_to(w),
            Head::Lda(m) => m.save_to(w),
        }
    }

    fn load_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut buf = Vec::new();
        r.read_to_end(&mut buf)?;
        match checkpoint_kind(&mut buf.as_slice())?.as_str() {
            "cosine" => CosineClassifier::load_from(&mut buf.as_slice()).map(Head::Cosine),
            "lda" => LdaClassifier::load_from(&mut buf.as_slice()).map(Head::Lda),
            other => Err(storage::invalid_data(&format!(
                "unknown classifier kind {other:?}"
            ))),
        }
    }
}

#[cfg(not(feature = "simd"))]
#[inline]
pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(feature = "simd")]
pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    let simd_end = n - (n % 4);
    let mut acc = f32x4::splat(0.0);
    for i in (0..simd_end).step_by(4) {
        let va = f32x4::from([a[i], a[i + 1], a[i + 2], a[i + 3]]);
        let vb = f32x4::from([b[i], b[i + 1], b[i + 2], b[i + 3]]);
        acc += va * vb;
    }
    let mut sum: f32 = acc.to_array().iter().sum();
    for i in simd_end..n {
        sum += a[i] * b[i];
    }
    sum
}
