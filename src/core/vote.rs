//! Majority-vote smoothing and confidence rejection for live predictions.

use std::collections::VecDeque;

use hashbrown::HashMap;

use crate::classifier::argmax;
use crate::memory::ClassId;

/// Raw decision for one window: `None` when the best score is under the
/// rejection threshold (the "Unknown" class).
pub fn decide(proba: &[f32], rejection_threshold: Option<f32>) -> Option<ClassId> {
    if proba.is_empty() {
        return None;
    }
    let (class, score) = argmax(proba);
    match rejection_threshold {
        Some(t) if score < t => None,
        _ => Some(class),
    }
}

/// Reports the mode of the last `n` decisions. Unknown votes count like any
/// other value; ties go to whichever tied value was seen most recently.
#[derive(Debug, Clone)]
pub struct MajorityVote {
    n: usize,
    recent: VecDeque<Option<ClassId>>,
}

impl MajorityVote {
    /// `n <= 1` disables smoothing.
    pub fn new(n: usize) -> Self {
        Self {
            n: n.max(1),
            recent: VecDeque::with_capacity(n.max(1)),
        }
    }

    pub fn window(&self) -> usize {
        self.n
    }

    pub fn push(&mut self, decision: Option<ClassId>) -> Option<ClassId> {
        if self.recent.len() == self.n {
            self.recent.pop_front();
        }
        self.recent.push_back(decision);
        if self.n == 1 {
            return decision;
        }

        let mut counts: HashMap<Option<ClassId>, usize> = HashMap::new();
        for d in &self.recent {
            *counts.entry(*d).or_insert(0) += 1;
        }
        let best = counts.values().copied().max().unwrap_or(0);
        // Walk back from the newest vote so ties resolve to the latest value.
        self.recent
            .iter()
            .rev()
            .copied()
            .find(|d| counts.get(d).copied() == Some(best))
            .unwrap_or(decision)
    }
}
