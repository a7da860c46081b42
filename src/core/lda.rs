//! Linear discriminant analysis head with covariance shrinkage.
//!
//! The model keeps running sufficient statistics (per-class counts and sums
//! plus the pooled second moment) in scaled feature space, so `fit` folds a
//! new batch in without revisiting old data and `refit` starts them over.
//! Discriminant weights are re-solved after every fit with a Cholesky
//! factorisation of the shrunk pooled covariance
//! `(1 - λ)·Σ + λ·(tr Σ / d)·I`.

use std::io::{self, Read, Write};

use crate::classifier::{
    dot, validate_batch, Checkpoint, Classifier, FeatureScaler, TrainingError, CHECKPOINT_MAGIC,
    CHECKPOINT_VERSION, TAG_COUNTS, TAG_META, TAG_SCALER,
};
use crate::memory::ClassId;
use crate::storage;

/// Shrinkage used by [`LdaClassifier::new`].
pub const DEFAULT_SHRINKAGE: f64 = 0.1;

const TAG_SUMS: [u8; 4] = *b"SUMS";
const TAG_MOMENT: [u8; 4] = *b"MOM2";

/// Floor for the mean variance, so a batch of identical rows still factorises.
const MIN_VARIANCE: f64 = 1e-6;

const PIVOT_TOLERANCE: f64 = 1e-10;

#[derive(Debug, Clone, PartialEq)]
pub struct LdaClassifier {
    num_classes: usize,
    dim: usize,
    shrinkage: f64,
    scaler: FeatureScaler,
    counts: Vec<u64>,
    /// Per-class feature sums, `num_classes * dim`.
    sums: Vec<f64>,
    /// Sum of `x xᵀ` over every sample, `dim * dim`.
    moment: Vec<f64>,
    coef: Vec<f32>,
    intercept: Vec<f32>,
}

impl LdaClassifier {
    pub fn new(num_classes: usize, dim: usize) -> Self {
        Self::with_shrinkage(num_classes, dim, DEFAULT_SHRINKAGE)
    }

    /// `shrinkage` is clamped to `[0, 1]`. Zero is plain LDA and fails on
    /// rank-deficient batches.
    pub fn with_shrinkage(num_classes: usize, dim: usize, shrinkage: f64) -> Self {
        Self {
            num_classes,
            dim,
            shrinkage: if shrinkage.is_finite() {
                shrinkage.clamp(0.0, 1.0)
            } else {
                DEFAULT_SHRINKAGE
            },
            scaler: FeatureScaler::identity(dim),
            counts: vec![0; num_classes],
            sums: vec![0.0; num_classes * dim],
            moment: vec![0.0; dim * dim],
            coef: vec![0.0; num_classes * dim],
            intercept: vec![0.0; num_classes],
        }
    }

    pub fn shrinkage(&self) -> f64 {
        self.shrinkage
    }

    pub fn scaler(&self) -> &FeatureScaler {
        &self.scaler
    }

    pub fn class_counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn is_trained(&self) -> bool {
        self.counts.iter().any(|&n| n > 0)
    }

    fn clear_stats(&mut self) {
        self.counts.iter_mut().for_each(|n| *n = 0);
        self.sums.iter_mut().for_each(|v| *v = 0.0);
        self.moment.iter_mut().for_each(|v| *v = 0.0);
    }

    fn accumulate(&mut self, features: &[f32], labels: &[ClassId]) {
        let d = self.dim;
        for (raw, &label) in features.chunks_exact(d).zip(labels) {
            let row = self.scaler.transform(raw);
            let c = label as usize;
            self.counts[c] += 1;
            for (s, &v) in self.sums[c * d..(c + 1) * d].iter_mut().zip(&row) {
                *s += v as f64;
            }
            for (i, &xi) in row.iter().enumerate() {
                let xi = xi as f64;
                for (m, &xj) in self.moment[i * d..(i + 1) * d].iter_mut().zip(&row) {
                    *m += xi * xj as f64;
                }
            }
        }
    }

    /// Recompute discriminant weights from the current statistics.
    fn solve(&mut self) -> Result<(), TrainingError> {
        let d = self.dim;
        let total: u64 = self.counts.iter().sum();
        if total == 0 {
            self.coef.iter_mut().for_each(|v| *v = 0.0);
            self.intercept.iter_mut().for_each(|v| *v = 0.0);
            return Ok(());
        }
        let n = total as f64;

        // Pooled within-class covariance.
        let mut cov = self.moment.clone();
        for (c, &nc) in self.counts.iter().enumerate() {
            if nc == 0 {
                continue;
            }
            let s = &self.sums[c * d..(c + 1) * d];
            for i in 0..d {
                for j in 0..d {
                    cov[i * d + j] -= s[i] * s[j] / nc as f64;
                }
            }
        }
        cov.iter_mut().for_each(|v| *v /= n);

        let mean_var = (0..d).map(|i| cov[i * d + i]).sum::<f64>() / d.max(1) as f64;
        let ridge = self.shrinkage * mean_var.max(MIN_VARIANCE);
        cov.iter_mut().for_each(|v| *v *= 1.0 - self.shrinkage);
        for i in 0..d {
            cov[i * d + i] += ridge;
        }
        let l = cholesky(&cov, d).ok_or(TrainingError::Singular)?;

        let mut coef = vec![0.0f32; self.num_classes * d];
        let mut intercept = vec![0.0f32; self.num_classes];
        for (c, &nc) in self.counts.iter().enumerate() {
            if nc == 0 {
                continue;
            }
            let nc = nc as f64;
            let mean: Vec<f64> = self.sums[c * d..(c + 1) * d]
                .iter()
                .map(|s| s / nc)
                .collect();
            let w = cholesky_solve(&l, &mean, d);
            let mw: f64 = mean.iter().zip(&w).map(|(a, b)| a * b).sum();
            intercept[c] = (-0.5 * mw + (nc / n).ln()) as f32;
            for (dst, &v) in coef[c * d..(c + 1) * d].iter_mut().zip(&w) {
                *dst = v as f32;
            }
        }
        self.coef = coef;
        self.intercept = intercept;
        Ok(())
    }
}

impl Classifier for LdaClassifier {
    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn dim(&self) -> usize {
        self.dim
    }

    /// Softmax of the discriminant scores over the classes seen so far.
    /// Unseen classes, and every class for a wrongly sized input, score 0.
    fn predict_proba(&self, features: &[f32]) -> Vec<f32> {
        let mut out = vec![0.0; self.num_classes];
        if features.len() != self.dim || !self.is_trained() {
            return out;
        }
        let x = self.scaler.transform(features);
        let d = self.dim;
        let mut best = f32::NEG_INFINITY;
        for (c, slot) in out.iter_mut().enumerate() {
            if self.counts[c] == 0 {
                continue;
            }
            *slot = dot(&self.coef[c * d..(c + 1) * d], &x) + self.intercept[c];
            best = best.max(*slot);
        }
        let mut total = 0.0;
        for (c, slot) in out.iter_mut().enumerate() {
            if self.counts[c] == 0 {
                continue;
            }
            *slot = (*slot - best).exp();
            total += *slot;
        }
        if total > 0.0 && total.is_finite() {
            out.iter_mut().for_each(|v| *v /= total);
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
        let mut next = self.clone();
        if !next.scaler.is_fitted() {
            next.scaler.fit(features, dim);
        }
        next.accumulate(features, labels);
        next.solve()?;
        *self = next;
        Ok(())
    }

    /// Keeps the feature scaling, like the cosine head.
    fn refit(
        &mut self,
        features: &[f32],
        dim: usize,
        labels: &[ClassId],
    ) -> Result<(), TrainingError> {
        validate_batch(features, dim, labels, self.dim, self.num_classes)?;
        let mut next = self.clone();
        next.clear_stats();
        if !next.scaler.is_fitted() {
            next.scaler.fit(features, dim);
        }
        next.accumulate(features, labels);
        next.solve()?;
        *self = next;
        Ok(())
    }
}

impl Checkpoint for LdaClassifier {
    fn save_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        storage::write_header(w, CHECKPOINT_MAGIC, CHECKPOINT_VERSION)?;
        let meta = serde_json::json!({
            "kind": "lda",
            "num_classes": self.num_classes,
            "dim": self.dim,
            "shrinkage": self.shrinkage,
            "scaler_fitted": self.scaler.fitted,
        });
        let meta = serde_json::to_vec(&meta)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        storage::write_chunk_lz4(w, TAG_META, &meta)?;

        let mut scal = storage::f32s_to_bytes(&self.scaler.mean);
        scal.extend(storage::f32s_to_bytes(&self.scaler.std));
        storage::write_chunk_lz4(w, TAG_SCALER, &scal)?;
        storage::write_chunk_lz4(w, TAG_COUNTS, &storage::u64s_to_bytes(&self.counts))?;
        storage::write_chunk_lz4(w, TAG_SUMS, &storage::f64s_to_bytes(&self.sums))?;
        storage::write_chunk_lz4(w, TAG_MOMENT, &storage::f64s_to_bytes(&self.moment))
    }

    /// Weights are re-solved from the saved statistics, which reproduces them
    /// exactly.
    fn load_from<R: Read>(r: &mut R) -> io::Result<Self> {
        storage::read_header(r, CHECKPOINT_MAGIC, CHECKPOINT_VERSION)?;

        let mut meta: Option<serde_json::Value> = None;
        let mut scal: Option<Vec<f32>> = None;
        let mut counts: Option<Vec<u64>> = None;
        let mut sums: Option<Vec<f64>> = None;
        let mut moment: Option<Vec<f64>> = None;
        while let Some((tag, payload)) = storage::read_chunk_lz4(r)? {
            match tag {
                TAG_META => {
                    meta = Some(
                        serde_json::from_slice(&payload)
                            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
                    )
                }
                TAG_SCALER => scal = Some(storage::bytes_to_f32s(&payload)?),
                TAG_COUNTS => counts = Some(storage::bytes_to_u64s(&payload)?),
                TAG_SUMS => sums = Some(storage::bytes_to_f64s(&payload)?),
                TAG_MOMENT => moment = Some(storage::bytes_to_f64s(&payload)?),
                _ => {}
            }
        }

        let missing = |what: &str| storage::invalid_data(&format!("checkpoint missing {what}"));
        let meta = meta.ok_or_else(|| missing("META"))?;
        if meta["kind"] != "lda" {
            return Err(storage::invalid_data("checkpoint is not an LDA classifier"));
        }
        let num_classes = meta["num_classes"]
            .as_u64()
            .ok_or_else(|| missing("num_classes"))? as usize;
        let dim = meta["dim"].as_u64().ok_or_else(|| missing("dim"))? as usize;
        let shrinkage = meta["shrinkage"]
            .as_f64()
            .ok_or_else(|| missing("shrinkage"))?;
        let fitted = meta["scaler_fitted"].as_bool().unwrap_or(false);

        let scal = scal.ok_or_else(|| missing("SCAL"))?;
        let counts = counts.ok_or_else(|| missing("NSMP"))?;
        let sums = sums.ok_or_else(|| missing("SUMS"))?;
        let moment = moment.ok_or_else(|| missing("MOM2"))?;
        if scal.len() != 2 * dim
            || counts.len() != num_classes
            || sums.len() != num_classes * dim
            || moment.len() != dim * dim
        {
            return Err(storage::invalid_data("checkpoint chunk sizes disagree with META"));
        }
        let (mean, std) = scal.split_at(dim);

        let mut model = Self::with_shrinkage(num_classes, dim, shrinkage);
        model.scaler = FeatureScaler {
            mean: mean.to_vec(),
            std: std.to_vec(),
            fitted,
        };
        model.counts = counts;
        model.sums = sums;
        model.moment = moment;
        model
            .solve()
            .map_err(|e| storage::invalid_data(&format!("checkpoint statistics: {e}")))?;
        Ok(model)
    }
}

/// Lower-triangular factor of a symmetric positive definite `n x n` matrix.
fn cholesky(a: &[f64], n: usize) -> Option<Vec<f64>> {
    let mut l = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[i * n + j];
            for k in 0..j {
                sum -= l[i * n + k] * l[j * n + k];
            }
            if i == j {
                // A pivot lost to cancellation means the matrix was singular.
                if !(sum > a[i * n + i].abs() * PIVOT_TOLERANCE && sum.is_finite()) {
                    return None;
                }
                l[i * n + i] = sum.sqrt();
            } else {
                l[i * n + j] = sum / l[j * n + j];
            }
        }
    }
    Some(l)
}

/// Solve `L Lᵀ x = b` given the factor from [`cholesky`].
fn cholesky_solve(l: &[f64], b: &[f64], n: usize) -> Vec<f64> {
    let mut y = vec![0.0; n];
    for i in 0..n {
        let mut s = b[i];
        for k in 0..i {
            s -= l[i * n + k] * y[k];
        }
        y[i] = s / l[i * n + i];
    }
    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let mut s = y[i];
        for k in i + 1..n {
            s -= l[k * n + i] * x[k];
        }
        x[i] = s / l[i * n + i];
    }
    x
}
