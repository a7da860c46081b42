//! Model registry: the only owner of the live classifier.
//!
//! Readers take an `Arc` snapshot and keep using it for as long as they like.
//! Writers are serialised by a mutex and work on a private copy that is
//! swapped in only when the update succeeds, so a reader sees either the old
//! weights or the new ones, never a mix, and a failed fit leaves nothing behind.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::classifier::Classifier;

#[derive(Debug)]
pub struct ModelRegistry<M> {
    current: RwLock<Arc<M>>,
    writer: Mutex<()>,
    generation: AtomicU64,
}

impl<M: Classifier> ModelRegistry<M> {
    pub fn new(model: M) -> Self {
        Self {
            current: RwLock::new(Arc::new(model)),
            writer: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Consistent snapshot of the current weights.
    pub fn read_model(&self) -> Arc<M> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Exclusive, scoped update. `f` mutates a copy of the live model; the copy
    /// replaces it only if `f` returns `Ok`. Updates never interleave.
    pub fn with_model<T, E>(&self, f: impl FnOnce(&mut M) -> Result<T, E>) -> Result<T, E> {
        // A panic inside an earlier `f` poisons the mutex but never touched the
        // live model, so the guard is still good.
        let _write = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let mut next = M::clone(&self.read_model());
        let out = f(&mut next)?;

        let mut slot = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Arc::new(next);
        drop(slot);
        self.generation.fetch_add(1, Ordering::Release);
        Ok(out)
    }

    /// Number of successful updates since construction.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Owned copy of the current model, for persistence.
    pub fn snapshot_owned(&self) -> M {
        M::clone(&self.read_model())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::TrainingError;
    use crate::memory::ClassId;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    /// Every weight equals the same value; a torn update would show two values.
    #[derive(Debug, Clone)]
    struct Uniform {
        weights: Vec<f32>,
    }

    impl Classifier for Uniform {
        fn num_classes(&self) -> usize {
            1
        }

        fn dim(&self) -> usize {
            self.weights.len()
        }

        fn predict_proba(&self, _features: &[f32]) -> Vec<f32> {
            vec![self.weights[0]]
        }

        fn fit(
            &mut self,
            features: &[f32],
            _dim: usize,
            _labels: &[ClassId],
        ) -> Result<(), TrainingError> {
            if features.is_empty() {
                return Err(TrainingError::EmptyBatch);
            }
            let v = features[0];
            for w in &mut self.weights {
                *w = v;
                // Widen the window in which a shared model would be half written.
                std::hint::spin_loop();
            }
            Ok(())
        }
    }

    #[test]
    fn readers_never_observe_partial_updates() {
        let registry = Arc::new(ModelRegistry::new(Uniform {
            weights: vec![0.0; 4096],
        }));
        let stop = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..6)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    let mut observed = 0u32;
                    while !stop.load(Ordering::Relaxed) {
                        let m = registry.read_model();
                        let first = m.weights[0];
                        assert!(m.weights.iter().all(|&w| w == first), "torn read");
                        observed += 1;
                    }
                    observed
                })
            })
            .collect();

        for step in 1..=50 {
            registry
                .with_model(|m| m.fit(&[step as f32], 1, &[0]))
                .unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        for r in readers {
            assert!(r.join().unwrap() > 0);
        }
        assert_eq!(registry.generation(), 50);
        assert_eq!(registry.read_model().weights[0], 50.0);
    }

    #[test]
    fn failed_update_keeps_previous_weights() {
        let registry = ModelRegistry::new(Uniform {
            weights: vec![1.0; 8],
        });
        let err = registry.with_model(|m| m.fit(&[], 1, &[]));
        assert_eq!(err, Err(TrainingError::EmptyBatch));
        assert_eq!(registry.generation(), 0);
        assert!(registry.read_model().weights.iter().all(|&w| w == 1.0));
    }

    #[test]
    fn held_snapshot_survives_swap() {
        let registry = ModelRegistry::new(Uniform {
            weights: vec![1.0; 2],
        });
        let old = registry.read_model();
        registry.with_model(|m| m.fit(&[9.0], 1, &[0])).unwrap();
        assert_eq!(old.weights, vec![1.0, 1.0]);
        assert_eq!(registry.read_model().weights, vec![9.0, 9.0]);
    }

    #[test]
    fn panic_in_writer_does_not_wedge_registry() {
        let registry = Arc::new(ModelRegistry::new(Uniform {
            weights: vec![3.0; 2],
        }));
        let r = Arc::clone(&registry);
        let joined = thread::spawn(move || {
            let _ = r.with_model(|_m| -> Result<(), TrainingError> { panic!("fit blew up") });
        })
        .join();
        assert!(joined.is_err());
        assert_eq!(registry.read_model().weights, vec![3.0, 3.0]);
        registry.with_model(|m| m.fit(&[4.0], 1, &[0])).unwrap();
        assert_eq!(registry.read_model().weights[0], 4.0);
    }

    #[test]
    fn writers_are_serialised() {
        let registry = Arc::new(ModelRegistry::new(Uniform {
            weights: vec![0.0; 1],
        }));
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for _ in 0..25 {
                        registry
                            .with_model(|m| {
                                let next = m.weights[0] + 1.0;
                                thread::sleep(Duration::from_micros(10));
                                m.fit(&[next], 1, &[0])
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }
        // Lost updates would leave this below 100.
        assert_eq!(registry.read_model().weights[0], 100.0);
    }
}
