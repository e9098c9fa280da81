use criterion::{Criterion, black_box, criterion_group, criterion_main};
use kakari_core::inference::{EisnerDecoder, log_partition, marginals};
use kakari_core::types::ScoreMatrix;
use oorandom::Rand32;

fn random_scores(n: usize, seed: u64) -> ScoreMatrix {
    let mut rng = Rand32::new(seed);
    ScoreMatrix::from_fn(n, |_, _| f64::from(rng.rand_float()) * 4.0 - 2.0)
}

fn bench_tree_inference(c: &mut Criterion) {
    let decoder = EisnerDecoder::new();
    let short = random_scores(16, 1);
    let long = random_scores(61, 2);

    c.bench_function("eisner_decode_15_words", |b| {
        b.iter(|| decoder.decode(black_box(&short)).unwrap());
    });

    c.bench_function("eisner_decode_60_words", |b| {
        b.iter(|| decoder.decode(black_box(&long)).unwrap());
    });

    c.bench_function("inside_60_words", |b| {
        b.iter(|| log_partition(black_box(&long)).unwrap());
    });

    c.bench_function("marginals_60_words", |b| {
        b.iter(|| marginals(black_box(&long)).unwrap());
    });
}

criterion_group!(benches, bench_tree_inference);
criterion_main!(benches);
