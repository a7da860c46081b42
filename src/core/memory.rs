//! Experience memory: the buffer the adaptation loop fine-tunes from.
//!
//! Records are stored column-wise (one `Vec` per field) so whole batches can
//! be appended, permuted and written without per-record allocation. The
//! invariant every operation preserves:
//!
//! `count == ids.len() == targets.len() == data.len() / dim`
//!
//! and, when the buffer carries context, `context`, `outcome` and
//! `timestamps` have `count` entries too. `ids` is always a permutation of
//! `0..count`, which is what lets [`Memory::unshuffle`] restore capture order.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::prng::Prng;
use crate::storage;

/// Gesture class index as used by the classifier.
pub type ClassId = u32;

pub const SNAPSHOT_MAGIC: &[u8; 8] = b"EMGMEM01";
pub const SNAPSHOT_VERSION: u32 = 1;

const TAG_HEAD: [u8; 4] = *b"HEAD";
const TAG_IDS: [u8; 4] = *b"IDS_";
const TAG_TARGETS: [u8; 4] = *b"TRGT";
const TAG_DATA: [u8; 4] = *b"DATA";
const TAG_CONTEXT: [u8; 4] = *b"CTXT";
const TAG_OUTCOME: [u8; 4] = *b"OUTC";
const TAG_TIME: [u8; 4] = *b"TIME";

/// On-disk encoding of a missing (rejected) target.
const NO_TARGET: u32 = u32::MAX;

const SNAPSHOT_PREFIX: &str = "classifier_memory_";
const SNAPSHOT_EXT: &str = "bin";

/// Verdict of a live prediction against the context-correct class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Outcome {
    Positive,
    Negative,
}

impl Outcome {
    pub fn judge(predicted: Option<ClassId>, correct: ClassId) -> Self {
        if predicted == Some(correct) {
            Outcome::Positive
        } else {
            Outcome::Negative
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Outcome::Positive => 1,
            Outcome::Negative => 0,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Outcome::Positive),
            0 => Some(Outcome::Negative),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum MemoryError {
    /// A batch (or merge operand) whose fields disagree in length or width.
    ShapeMismatch {
        field: &'static str,
        expected: usize,
        got: usize,
    },
    /// A snapshot decoded but violates the buffer invariants.
    Corrupt(String),
    Io(io::Error),
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::ShapeMismatch {
                field,
                expected,
                got,
            } => write!(
                f,
                "shape mismatch in `{field}`: expected {expected}, got {got}"
            ),
            MemoryError::Corrupt(msg) => write!(f, "corrupt memory snapshot: {msg}"),
            MemoryError::Io(e) => write!(f, "memory snapshot i/o: {e}"),
        }
    }
}

impl std::error::Error for MemoryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MemoryError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for MemoryError {
    fn from(e: io::Error) -> Self {
        MemoryError::Io(e)
    }
}

/// One labelled classification event, materialised from the columns.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperienceRecord {
    pub id: u64,
    pub data: Vec<f32>,
    pub target: Option<ClassId>,
    pub context: Option<ClassId>,
    pub outcome: Option<Outcome>,
    pub timestamp: Option<f64>,
}

/// A batch to append. `context`, `outcome` and `timestamps` are either all
/// empty (screen-guided training data) or all `targets.len()` long.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExperienceBatch {
    pub dim: usize,
    pub data: Vec<f32>,
    pub targets: Vec<Option<ClassId>>,
    pub context: Vec<ClassId>,
    pub outcome: Vec<Outcome>,
    pub timestamps: Vec<f64>,
}

impl ExperienceBatch {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            ..Self::default()
        }
    }

    /// Batch of labelled samples without game context.
    pub fn labelled(dim: usize, data: Vec<f32>, targets: Vec<ClassId>) -> Self {
        Self {
            dim,
            data,
            targets: targets.into_iter().map(Some).collect(),
            ..Self::default()
        }
    }

    /// Append one contextual record.
    pub fn push(
        &mut self,
        features: &[f32],
        target: Option<ClassId>,
        context: ClassId,
        outcome: Outcome,
        timestamp: f64,
    ) {
        self.data.extend_from_slice(features);
        self.targets.push(target);
        self.context.push(context);
        self.outcome.push(outcome);
        self.timestamps.push(timestamp);
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    fn has_context(&self) -> bool {
        !self.context.is_empty()
    }

    fn validate(&self) -> Result<(), MemoryError> {
        let n = self.targets.len();
        if self.dim == 0 {
            return Err(MemoryError::ShapeMismatch {
                field: "dim",
                expected: 1,
                got: 0,
            });
        }
        if self.data.len() != n * self.dim {
            return Err(MemoryError::ShapeMismatch {
                field: "data",
                expected: n * self.dim,
                got: self.data.len(),
            });
        }
        let optional = [
            ("context", self.context.len()),
            ("outcome", self.outcome.len()),
            ("timestamps", self.timestamps.len()),
        ];
        let expected = if self.has_context() { n } else { 0 };
        for (field, len) in optional {
            if len != expected {
                return Err(MemoryError::ShapeMismatch {
                    field,
                    expected,
                    got: len,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Memory {
    dim: usize,
    data: Vec<f32>,
    targets: Vec<Option<ClassId>>,
    context: Vec<ClassId>,
    outcome: Vec<Outcome>,
    timestamps: Vec<f64>,
    ids: Vec<u64>,
    count: usize,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_batch(batch: ExperienceBatch) -> Result<Self, MemoryError> {
        let mut m = Self::new();
        m.add(batch)?;
        Ok(m)
    }

    pub fn len(&self) -> usize {
        self.count
    }

    /// Alias of [`Memory::len`].
    pub fn size(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Feature width; 0 until the first batch lands.
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn has_context(&self) -> bool {
        !self.context.is_empty()
    }

    pub fn ids(&self) -> &[u64] {
        &self.ids
    }

    pub fn targets(&self) -> &[Option<ClassId>] {
        &self.targets
    }

    pub fn context(&self) -> &[ClassId] {
        &self.context
    }

    pub fn outcomes(&self) -> &[Outcome] {
        &self.outcome
    }

    pub fn timestamps(&self) -> &[f64] {
        &self.timestamps
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }

    pub fn record(&self, i: usize) -> Option<ExperienceRecord> {
        if i >= self.count {
            return None;
        }
        let ctx = self.has_context();
        Some(ExperienceRecord {
            id: self.ids[i],
            data: self.row(i).to_vec(),
            target: self.targets[i],
            context: ctx.then(|| self.context[i]),
            outcome: ctx.then(|| self.outcome[i]),
            timestamp: ctx.then(|| self.timestamps[i]),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = ExperienceRecord> + '_ {
        (0..self.count).filter_map(move |i| self.record(i))
    }

    /// Append one batch. An empty batch is a no-op.
    pub fn add(&mut self, batch: ExperienceBatch) -> Result<&mut Self, MemoryError> {
        if batch.targets.is_empty() {
            return Ok(self);
        }
        batch.validate()?;
        let n = batch.len();

        if self.is_empty() {
            self.dim = batch.dim;
            self.data = batch.data;
            self.targets = batch.targets;
            self.context = batch.context;
            self.outcome = batch.outcome;
            self.timestamps = batch.timestamps;
            self.ids = (0..n as u64).collect();
            self.count = n;
            return Ok(self);
        }

        self.check_compatible(batch.dim, batch.has_context())?;
        let start = self.count as u64;
        self.data.extend(batch.data);
        self.targets.extend(batch.targets);
        self.context.extend(batch.context);
        self.outcome.extend(batch.outcome);
        self.timestamps.extend(batch.timestamps);
        self.ids.extend(start..start + n as u64);
        self.count += n;
        Ok(self)
    }

    /// Append every record of `other`. Its ids are offset by `self.len()` so
    /// they stay unique and contiguous, and a shuffled `other` still unshuffles
    /// into its own capture order after ours.
    pub fn merge(&mut self, other: &Memory) -> Result<&mut Self, MemoryError> {
        if other.is_empty() {
            return Ok(self);
        }
        if self.is_empty() {
            *self = other.clone();
            return Ok(self);
        }

        self.check_compatible(other.dim, other.has_context())?;
        let offset = self.count as u64;
        self.data.extend_from_slice(&other.data);
        self.targets.extend_from_slice(&other.targets);
        self.context.extend_from_slice(&other.context);
        self.outcome.extend_from_slice(&other.outcome);
        self.timestamps.extend_from_slice(&other.timestamps);
        self.ids.extend(other.ids.iter().map(|id| id + offset));
        self.count += other.count;
        Ok(self)
    }

    fn check_compatible(&self, dim: usize, has_context: bool) -> Result<(), MemoryError> {
        if dim != self.dim {
            return Err(MemoryError::ShapeMismatch {
                field: "dim",
                expected: self.dim,
                got: dim,
            });
        }
        if has_context != self.has_context() {
            return Err(MemoryError::ShapeMismatch {
                field: "context",
                expected: if self.has_context() { 1 } else { 0 },
                got: if has_context { 1 } else { 0 },
            });
        }
        Ok(())
    }

    /// Shuffle with a clock-seeded generator.
    pub fn shuffle(&mut self) {
        self.shuffle_with(&mut Prng::from_time());
    }

    /// Apply one random permutation to every field.
    pub fn shuffle_with(&mut self, rng: &mut Prng) {
        if self.is_empty() {
            return;
        }
        let order = rng.permutation(self.count);
        self.reorder(&order);
    }

    /// Restore capture order (ascending ids). Exact inverse of any sequence of shuffles.
    pub fn unshuffle(&mut self) {
        if self.is_empty() {
            return;
        }
        let mut order: Vec<usize> = (0..self.count).collect();
        order.sort_unstable_by_key(|&i| self.ids[i]);
        self.reorder(&order);
    }

    fn reorder(&mut self, order: &[usize]) {
        let dim = self.dim;
        let mut data = Vec::with_capacity(self.data.len());
        for &i in order {
            data.extend_from_slice(&self.data[i * dim..(i + 1) * dim]);
        }
        self.data = data;
        self.targets = gather(&self.targets, order);
        self.ids = gather(&self.ids, order);
        if self.has_context() {
            self.context = gather(&self.context, order);
            self.outcome = gather(&self.outcome, order);
            self.timestamps = gather(&self.timestamps, order);
        }
    }

    /// Features and labels to fit on. Context (the game's verdict of what the
    /// user meant) wins over the live prediction; records without either are skipped.
    pub fn training_set(&self) -> (Vec<f32>, Vec<ClassId>) {
        let mut x = Vec::with_capacity(self.data.len());
        let mut y = Vec::with_capacity(self.count);
        for i in 0..self.count {
            let label = if self.has_context() {
                Some(self.context[i])
            } else {
                self.targets[i]
            };
            if let Some(label) = label {
                x.extend_from_slice(self.row(i));
                y.push(label);
            }
        }
        (x, y)
    }

    /// `(positive, negative)` outcome tally.
    pub fn outcome_counts(&self) -> (usize, usize) {
        let pos = self
            .outcome
            .iter()
            .filter(|o| **o == Outcome::Positive)
            .count();
        (pos, self.outcome.len() - pos)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────

    pub fn snapshot_path(dir: &Path, index: u32) -> PathBuf {
        dir.join(format!("{SNAPSHOT_PREFIX}{index}.{SNAPSHOT_EXT}"))
    }

    /// Write this buffer as snapshot `index` in `dir` (created if missing).
    pub fn persist(&self, dir: &Path, index: u32) -> Result<PathBuf, MemoryError> {
        fs::create_dir_all(dir)?;
        let path = Self::snapshot_path(dir, index);
        let mut w = BufWriter::new(File::create(&path)?);
        self.write_to(&mut w)?;
        w.flush()?;
        Ok(path)
    }

    pub fn load(dir: &Path, index: u32) -> Result<Self, MemoryError> {
        let file = File::open(Self::snapshot_path(dir, index))?;
        Self::read_from(&mut BufReader::new(file))
    }

    /// The snapshot with the highest index, or an empty buffer if there is none.
    pub fn load_latest(dir: &Path) -> Result<Self, MemoryError> {
        match Self::snapshot_indices(dir)?.last() {
            Some(&index) => Self::load(dir, index),
            None => Ok(Self::new()),
        }
    }

    /// Every snapshot in `dir`, merged in ascending index order.
    pub fn load_all(dir: &Path) -> Result<Self, MemoryError> {
        let mut all = Self::new();
        for index in Self::snapshot_indices(dir)? {
            let m = Self::load(dir, index)?;
            all.merge(&m)?;
        }
        Ok(all)
    }

    /// Snapshot indices present in `dir`, ascending. A missing directory has none.
    pub fn snapshot_indices(dir: &Path) -> Result<Vec<u32>, MemoryError> {
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            let index = name
                .strip_prefix(SNAPSHOT_PREFIX)
                .and_then(|rest| rest.strip_suffix(SNAPSHOT_EXT))
                .and_then(|rest| rest.strip_suffix('.'))
                .and_then(|digits| digits.parse::<u32>().ok());
            if let Some(index) = index {
                out.push(index);
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        storage::write_header(w, SNAPSHOT_MAGIC, SNAPSHOT_VERSION)?;

        let mut head = Vec::with_capacity(16);
        storage::write_u64_le(&mut head, self.count as u64)?;
        storage::write_u32_le(&mut head, self.dim as u32)?;
        storage::write_u32_le(&mut head, u32::from(self.has_context()))?;
        storage::write_chunk_lz4(w, TAG_HEAD, &head)?;

        storage::write_chunk_lz4(w, TAG_IDS, &storage::u64s_to_bytes(&self.ids))?;
        let targets: Vec<u32> = self
            .targets
            .iter()
            .map(|t| t.unwrap_or(NO_TARGET))
            .collect();
        storage::write_chunk_lz4(w, TAG_TARGETS, &storage::u32s_to_bytes(&targets))?;
        storage::write_chunk_lz4(w, TAG_DATA, &storage::f32s_to_bytes(&self.data))?;
        if self.has_context() {
            storage::write_chunk_lz4(w, TAG_CONTEXT, &storage::u32s_to_bytes(&self.context))?;
            let outcome: Vec<u8> = self.outcome.iter().map(|o| o.to_byte()).collect();
            storage::write_chunk_lz4(w, TAG_OUTCOME, &outcome)?;
            storage::write_chunk_lz4(w, TAG_TIME, &storage::f64s_to_bytes(&self.timestamps))?;
        }
        Ok(())
    }

    pub fn read_from<R: io::Read>(r: &mut R) -> Result<Self, MemoryError> {
        storage::read_header(r, SNAPSHOT_MAGIC, SNAPSHOT_VERSION)?;

        let mut head: Option<(usize, usize, bool)> = None;
        let mut m = Self::new();
        while let Some((tag, payload)) = storage::read_chunk_lz4(r)? {
            match tag {
                TAG_HEAD => {
                    let mut cur = io::Cursor::new(payload);
                    let count = storage::read_u64_le(&mut cur)? as usize;
                    let dim = storage::read_u32_le(&mut cur)? as usize;
                    let has_context = storage::read_u32_le(&mut cur)? != 0;
                    head = Some((count, dim, has_context));
                }
                TAG_IDS => m.ids = storage::bytes_to_u64s(&payload)?,
                TAG_TARGETS => {
                    m.targets = storage::bytes_to_u32s(&payload)?
                        .into_iter()
                        .map(|t| (t != NO_TARGET).then_some(t))
                        .collect();
                }
                TAG_DATA => m.data = storage::bytes_to_f32s(&payload)?,
                TAG_CONTEXT => m.context = storage::bytes_to_u32s(&payload)?,
                TAG_OUTCOME => {
                    m.outcome = payload
                        .iter()
                        .map(|&b| {
                            Outcome::from_byte(b)
                                .ok_or_else(|| MemoryError::Corrupt(format!("outcome byte {b}")))
                        })
                        .collect::<Result<_, _>>()?;
                }
                TAG_TIME => m.timestamps = storage::bytes_to_f64s(&payload)?,
                _ => {}
            }
        }

        let (count, dim, has_context) =
            head.ok_or_else(|| MemoryError::Corrupt("missing HEAD chunk".to_string()))?;
        m.count = count;
        m.dim = dim;
        m.check_invariants(has_context)?;
        Ok(m)
    }

    fn check_invariants(&self, has_context: bool) -> Result<(), MemoryError> {
        let n = self.count;
        let corrupt = |what: &str| Err(MemoryError::Corrupt(what.to_string()));
        if self.ids.len() != n || self.targets.len() != n {
            return corrupt("ids/targets length differs from count");
        }
        if self.data.len() != n * self.dim {
            return corrupt("data length differs from count * dim");
        }
        let expected = if has_context { n } else { 0 };
        if self.context.len() != expected
            || self.outcome.len() != expected
            || self.timestamps.len() != expected
        {
            return corrupt("context columns disagree with count");
        }
        let mut seen = vec![false; n];
        for &id in &self.ids {
            match seen.get_mut(id as usize) {
                Some(slot) if !*slot => *slot = true,
                _ => return corrupt("ids are not a permutation of 0..count"),
            }
        }
        Ok(())
    }
}

fn gather<T: Clone>(src: &[T], order: &[usize]) -> Vec<T> {
    order.iter().map(|&i| src[i].clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contextual(n: usize, dim: usize, base: f32) -> ExperienceBatch {
        let mut b = ExperienceBatch::new(dim);
        for i in 0..n {
            let row: Vec<f32> = (0..dim).map(|d| base + i as f32 + d as f32 * 0.1).collect();
            let predicted = (i % 3) as ClassId;
            let correct = 2;
            b.push(
                &row,
                Some(predicted),
                correct,
                Outcome::judge(Some(predicted), correct),
                1000.0 + base as f64 + i as f64,
            );
        }
        b
    }

    #[test]
    fn add_assigns_sequential_ids() {
        let mut m = Memory::new();
        m.add(contextual(3, 2, 0.0)).unwrap();
        m.add(contextual(2, 2, 10.0)).unwrap();
        assert_eq!(m.len(), 5);
        assert_eq!(m.ids(), &[0, 1, 2, 3, 4]);
        assert_eq!(m.row(3), &[10.0, 10.1]);
        assert_eq!(m.record(4).unwrap().timestamp, Some(1011.0));
    }

    #[test]
    fn empty_targets_is_a_noop() {
        let mut m = Memory::from_batch(contextual(2, 2, 0.0)).unwrap();
        let before = m.clone();
        m.add(ExperienceBatch::new(5)).unwrap();
        assert_eq!(m, before);
    }

    #[test]
    fn shape_mismatch_leaves_buffer_untouched() {
        let mut m = Memory::from_batch(contextual(2, 2, 0.0)).unwrap();
        let before = m.clone();

        let mut bad = contextual(2, 2, 5.0);
        bad.data.pop();
        assert!(matches!(
            m.add(bad),
            Err(MemoryError::ShapeMismatch { field: "data", .. })
        ));

        let wider = contextual(1, 3, 5.0);
        assert!(matches!(
            m.add(wider),
            Err(MemoryError::ShapeMismatch { field: "dim", .. })
        ));

        let sgt = ExperienceBatch::labelled(2, vec![0.0; 2], vec![1]);
        assert!(matches!(
            m.add(sgt),
            Err(MemoryError::ShapeMismatch {
                field: "context",
                ..
            })
        ));

        let mut partial = contextual(2, 2, 5.0);
        partial.timestamps.clear();
        assert!(m.add(partial).is_err());
        assert_eq!(m, before);
    }

    #[test]
    fn merge_into_empty_is_identity() {
        let mut b = Memory::from_batch(contextual(4, 3, 1.0)).unwrap();
        b.shuffle_with(&mut Prng::new(9));
        let mut a = Memory::new();
        a.merge(&b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn merge_with_empty_right_is_identity() {
        let mut a = Memory::from_batch(contextual(4, 3, 1.0)).unwrap();
        let before = a.clone();
        a.merge(&Memory::new()).unwrap();
        assert_eq!(a, before);
    }

    #[test]
    fn merge_keeps_ids_unique_and_contiguous() {
        let mut a = Memory::from_batch(contextual(5, 2, 0.0)).unwrap();
        let b = Memory::from_batch(contextual(7, 2, 50.0)).unwrap();
        let b_before = b.clone();
        a.merge(&b).unwrap();

        assert_eq!(a.len(), 12);
        let mut ids = a.ids().to_vec();
        ids.sort_unstable();
        assert_eq!(ids, (0..12).collect::<Vec<u64>>());
        assert_eq!(b, b_before);
    }

    #[test]
    fn shuffled_operands_unshuffle_to_concatenation() {
        let plain_a = Memory::from_batch(contextual(6, 2, 0.0)).unwrap();
        let plain_b = Memory::from_batch(contextual(6, 2, 100.0)).unwrap();
        let mut expected = plain_a.clone();
        expected.merge(&plain_b).unwrap();

        let mut rng = Prng::new(3);
        let mut a = plain_a.clone();
        let mut b = plain_b.clone();
        a.shuffle_with(&mut rng);
        b.shuffle_with(&mut rng);
        a.merge(&b).unwrap();
        a.unshuffle();
        assert_eq!(a, expected);
    }

    #[test]
    fn unshuffle_inverts_shuffle_on_every_field() {
        let original = Memory::from_batch(contextual(40, 4, 0.0)).unwrap();
        for seed in 1..20 {
            let mut m = original.clone();
            m.shuffle_with(&mut Prng::new(seed));
            assert_ne!(m, original);
            m.unshuffle();
            assert_eq!(m.data(), original.data());
            assert_eq!(m.targets(), original.targets());
            assert_eq!(m.context(), original.context());
            assert_eq!(m.outcomes(), original.outcomes());
            assert_eq!(m.timestamps(), original.timestamps());
            assert_eq!(m.ids(), original.ids());
        }
    }

    #[test]
    fn shuffle_keeps_records_intact() {
        let mut m = Memory::from_batch(contextual(10, 3, 0.0)).unwrap();
        let by_id: Vec<ExperienceRecord> = m.iter().collect();
        m.shuffle_with(&mut Prng::new(11));
        for rec in m.iter() {
            assert_eq!(rec, by_id[rec.id as usize]);
        }
    }

    #[test]
    fn unshuffle_without_context_restores_all_columns() {
        let data: Vec<f32> = (0..20).map(|v| v as f32).collect();
        let targets: Vec<ClassId> = (0..10).map(|i| i % 4).collect();
        let original = Memory::from_batch(ExperienceBatch::labelled(2, data, targets)).unwrap();
        let mut m = original.clone();
        m.shuffle_with(&mut Prng::new(5));
        m.unshuffle();
        assert_eq!(m, original);
    }

    #[test]
    fn shuffle_of_empty_is_noop() {
        let mut m = Memory::new();
        m.shuffle();
        m.unshuffle();
        assert!(m.is_empty());
    }

    #[test]
    fn training_set_prefers_context_labels() {
        let mut b = ExperienceBatch::new(1);
        b.push(&[1.0], Some(0), 2, Outcome::Negative, 0.0);
        b.push(&[2.0], None, 1, Outcome::Negative, 0.1);
        let m = Memory::from_batch(b).unwrap();
        let (x, y) = m.training_set();
        assert_eq!(x, vec![1.0, 2.0]);
        assert_eq!(y, vec![2, 1]);

        let sgt = ExperienceBatch {
            dim: 1,
            data: vec![5.0, 6.0],
            targets: vec![Some(3), None],
            ..ExperienceBatch::default()
        };
        let m = Memory::from_batch(sgt).unwrap();
        assert_eq!(m.training_set(), (vec![5.0], vec![3]));
    }

    #[test]
    fn outcome_tally() {
        let m = Memory::from_batch(contextual(6, 1, 0.0)).unwrap();
        // predictions cycle 0,1,2 against context 2
        assert_eq!(m.outcome_counts(), (2, 4));
    }

    #[test]
    fn snapshot_round_trip_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = Memory::from_batch(contextual(9, 3, 0.5)).unwrap();
        m.shuffle_with(&mut Prng::new(21));
        m.persist(dir.path(), 0).unwrap();
        assert_eq!(Memory::load(dir.path(), 0).unwrap(), m);
    }

    #[test]
    fn load_all_equals_in_order_merge() {
        let dir = tempfile::tempdir().unwrap();
        let m1 = Memory::from_batch(contextual(3, 2, 0.0)).unwrap();
        let m2 = Memory::from_batch(contextual(4, 2, 20.0)).unwrap();
        let m3 = Memory::from_batch(contextual(2, 2, 40.0)).unwrap();
        // written out of order; 10 must sort after 2 numerically
        m3.persist(dir.path(), 10).unwrap();
        m1.persist(dir.path(), 1).unwrap();
        m2.persist(dir.path(), 2).unwrap();

        let mut expected = m1.clone();
        expected.merge(&m2).unwrap().merge(&m3).unwrap();
        assert_eq!(Memory::load_all(dir.path()).unwrap(), expected);
        assert_eq!(Memory::snapshot_indices(dir.path()).unwrap(), vec![1, 2, 10]);
        assert_eq!(Memory::load_latest(dir.path()).unwrap(), m3);
    }

    #[test]
    fn load_all_of_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(Memory::load_all(&missing).unwrap().is_empty());
        assert!(Memory::load_latest(&missing).unwrap().is_empty());
    }

    #[test]
    fn unrelated_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("preds.csv"), "x").unwrap();
        std::fs::write(dir.path().join("classifier_memory_x.bin"), "x").unwrap();
        Memory::from_batch(contextual(1, 1, 0.0))
            .unwrap()
            .persist(dir.path(), 4)
            .unwrap();
        assert_eq!(Memory::snapshot_indices(dir.path()).unwrap(), vec![4]);
    }

    #[test]
    fn corrupt_ids_are_rejected() {
        let m = Memory::from_batch(contextual(3, 1, 0.0)).unwrap();
        let mut bad = m.clone();
        bad.ids = vec![0, 0, 2];
        let mut buf = Vec::new();
        bad.write_to(&mut buf).unwrap();
        assert!(matches!(
            Memory::read_from(&mut io::Cursor::new(buf)),
            Err(MemoryError::Corrupt(_))
        ));
    }
}
