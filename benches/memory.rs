//! Criterion benchmarks for the adaptation hot paths.
//!
//! Run with:
//!   cargo bench
//!   cargo bench --features "parallel simd"
//!
//! Results are saved to target/criterion/

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use emgadapt::classifier::{predict_batch, Classifier, CosineClassifier};
use emgadapt::lda::LdaClassifier;
use emgadapt::memory::{ExperienceBatch, Memory, Outcome};
use emgadapt::prng::Prng;

const DIM: usize = 40;
const CLASSES: usize = 5;

fn make_batch(n: usize, seed: u64) -> ExperienceBatch {
    let mut rng = Prng::new(seed);
    let mut batch = ExperienceBatch::new(DIM);
    for i in 0..n {
        let row: Vec<f32> = (0..DIM)
            .map(|_| rng.next_u32() as f32 / u32::MAX as f32)
            .collect();
        let class = (i % CLASSES) as u32;
        batch.push(&row, Some(class), class, Outcome::Positive, i as f64);
    }
    batch
}

/// Shuffle + unshuffle at growing memory sizes.
fn bench_reorder(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_reorder");

    for size in [1_000usize, 10_000, 50_000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        let mem = Memory::from_batch(make_batch(*size, 1)).expect("valid batch");

        group.bench_with_input(BenchmarkId::new("shuffle", size), size, |b, _| {
            let mut m = mem.clone();
            let mut rng = Prng::new(7);
            b.iter(|| {
                m.shuffle_with(&mut rng);
                black_box(m.ids()[0])
            });
        });

        group.bench_with_input(BenchmarkId::new("unshuffle", size), size, |b, _| {
            let mut m = mem.clone();
            let mut rng = Prng::new(7);
            b.iter(|| {
                m.shuffle_with(&mut rng);
                m.unshuffle();
                black_box(m.ids()[0])
            });
        });
    }

    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_merge");
    let base = Memory::from_batch(make_batch(10_000, 1)).expect("valid batch");
    let cycle = Memory::from_batch(make_batch(200, 2)).expect("valid batch");

    group.throughput(Throughput::Elements(200));
    group.bench_function("10k_plus_200", |b| {
        b.iter(|| {
            let mut m = base.clone();
            m.merge(&cycle).expect("compatible");
            black_box(m.len())
        });
    });

    group.finish();
}

fn bench_classifier(c: &mut Criterion) {
    let mut group = c.benchmark_group("classifier_heads");
    let mem = Memory::from_batch(make_batch(2_000, 3)).expect("valid batch");
    let (x, y) = mem.training_set();

    let mut model = CosineClassifier::new(CLASSES, DIM);
    model.fit(&x, DIM, &y).expect("fit");

    group.bench_function("predict_proba", |b| {
        let row = mem.row(0);
        b.iter(|| black_box(model.predict_proba(black_box(row))));
    });

    group.throughput(Throughput::Elements(y.len() as u64));
    group.bench_function("predict_batch_2k", |b| {
        b.iter(|| black_box(predict_batch(&model, &x, DIM)));
    });

    group.bench_function("fit_2k", |b| {
        b.iter(|| {
            let mut m = model.clone();
            m.fit(&x, DIM, &y).expect("fit");
            black_box(m.class_counts()[0])
        });
    });

    group.bench_function("lda_fit_2k", |b| {
        b.iter(|| {
            let mut m = LdaClassifier::new(CLASSES, DIM);
            m.fit(&x, DIM, &y).expect("fit");
            black_box(m.class_counts()[0])
        });
    });

    group.finish();
}

criterion_group!(benches, bench_reorder, bench_merge, bench_classifier);

criterion_main!(benches);
