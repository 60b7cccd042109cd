use criterion::{black_box, criterion_group, criterion_main, Criterion};
use flint::checksum::adler32;

fn checksum_benchmark(c: &mut Criterion) {
    let small = vec![0x5Au8; 64];
    let full_frame = vec![0x5Au8; 4096];

    c.bench_function("adler32_64b", |b| b.iter(|| adler32(black_box(&small))));
    c.bench_function("adler32_4k", |b| b.iter(|| adler32(black_box(&full_frame))));
}

criterion_group!(benches, checksum_benchmark);
criterion_main!(benches);
