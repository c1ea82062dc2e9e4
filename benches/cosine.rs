use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use featuredb::vector::{best_match, cosine_similarity, count_above};
use ndarray::prelude::*;
use rand::prelude::*;

const DIM: usize = 512;

fn random_matrix(rows: usize) -> Array2<f32> {
    let mut rng = rand::rng();
    Array2::from_shape_simple_fn((rows, DIM), || rng.random_range(-1.0..1.0))
}

fn bench_cosine(c: &mut Criterion) {
    let mut group = c.benchmark_group("Cosine");
    let query = random_matrix(1).row(0).to_owned();

    // 人脸库通常只有几百条，误报库上限 1000 条
    for rows in [100, 1000, 10000] {
        let matrix = random_matrix(rows);
        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::new("best_match", rows), &matrix, |b, matrix| {
            b.iter(|| best_match(cosine_similarity(query.view(), black_box(matrix.view())).view()));
        });
        group.bench_with_input(BenchmarkId::new("count_above", rows), &matrix, |b, matrix| {
            b.iter(|| {
                count_above(cosine_similarity(query.view(), black_box(matrix.view())).view(), 0.8)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_cosine);
criterion_main!(benches);
