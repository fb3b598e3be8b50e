#![allow(clippy::unwrap_used, clippy::uninlined_format_args)]

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use p7_protocol::utils::compression::{compress, decompress, DEFAULT_LEVEL};

/// Text-like input so deflate has something to work with.
fn sample(size: usize) -> Vec<u8> {
    b"wired.file.file_list /Uploads/archive.tar.gz "
        .iter()
        .copied()
        .cycle()
        .take(size)
        .collect()
}

fn bench_compression(c: &mut Criterion) {
    let mut group = c.benchmark_group("deflate");
    let sizes = [64usize, 512, 4096, 65536, 1024 * 1024];

    for &size in &sizes {
        let data = sample(size);
        group.throughput(Throughput::Bytes(size as u64));

        for level in [1, DEFAULT_LEVEL, 9] {
            group.bench_function(format!("compress_l{}_{}b", level, size), |b| {
                b.iter_batched(
                    || data.clone(),
                    |d| {
                        let _ = compress(&d, level).unwrap();
                    },
                    BatchSize::SmallInput,
                )
            });
        }

        group.bench_function(format!("decompress_{}b", size), |b| {
            let compressed = compress(&data, DEFAULT_LEVEL).unwrap();
            b.iter(|| {
                let out = decompress(&compressed).unwrap();
                assert_eq!(out.len(), data.len());
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_compression);
criterion_main!(benches);
