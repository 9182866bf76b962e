// Global allocator setup for jemalloc
#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
use jemallocator::Jemalloc;

#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ndarray::Array2;
use rand::distributions::Uniform;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::time::{Duration, Instant};
use streaming_pca::{
    Algorithm, ChunkedRandomizedSvd, InMemoryRows, NormalizationSettings, RandomizedSvdConfig, StreamingPca,
    StreamingPcaConfig,
};

#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
use jemalloc_ctl::{epoch, stats};

/// Generates random data of shape (n_samples x n_features) with values 0, 1, or 2 (as f64), seeded for reproducibility.
fn generate_random_data(n_samples: usize, n_features: usize, seed: u64) -> Array2<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let distribution = Uniform::new_inclusive(0, 2);
    Array2::from_shape_fn((n_samples, n_features), |_| rng.sample(distribution) as f64)
}

/// Resident bytes according to jemalloc, or 0 without the allocator.
fn resident_bytes() -> usize {
    #[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
    {
        if epoch::advance().is_ok() {
            return stats::resident::read().unwrap_or(0);
        }
    }
    0
}

/// Runs `run` once and returns its wall time, printing the resident-memory delta.
fn timed_run<F: FnMut()>(label: &str, mut run: F) -> Duration {
    let resident_before = resident_bytes();
    let start_time = Instant::now();
    run();
    let duration = start_time.elapsed();
    let resident_after = resident_bytes();
    if resident_after > 0 {
        eprintln!(
            "{}: {:.3?}, RSS delta {} KB",
            label,
            duration,
            resident_after.saturating_sub(resident_before) / 1024
        );
    }
    duration
}

fn bench_streaming_epochs(c: &mut Criterion) {
    let scenarios: &[(&str, usize, usize)] = &[("small", 500, 200), ("wide", 200, 2000)];
    for &(name, n_samples, n_features) in scenarios {
        let data = generate_random_data(n_samples, n_features, 1926);
        let column_sums = data.sum_axis(ndarray::Axis(0));
        let source = InMemoryRows::new(data);
        let mut group = c.benchmark_group(format!("streaming_epoch/{}", name));
        group.sample_size(10);
        group.throughput(Throughput::Elements(n_samples as u64));

        for algorithm in [Algorithm::Oja, Algorithm::Rsgd, Algorithm::Svrg, Algorithm::Ccipca] {
            let config = StreamingPcaConfig {
                algorithm,
                num_components: 10,
                stepsize: 0.01,
                num_epochs: 1,
                normalization: NormalizationSettings {
                    column_sums: Some(column_sums.clone()),
                    ..Default::default()
                },
                ..Default::default()
            };
            let pca = StreamingPca::new(config).expect("valid benchmark configuration");
            let id = BenchmarkId::new(algorithm.name(), format!("s{}_f{}", n_samples, n_features));
            group.bench_with_input(id, &source, |b, source| {
                b.iter_custom(|iters| {
                    let mut total_duration = Duration::new(0, 0);
                    for _ in 0..iters {
                        total_duration += timed_run(algorithm.name(), || {
                            let output = pca.fit(source).expect("streaming fit failed");
                            assert_eq!(output.scores.nrows(), n_samples);
                        });
                    }
                    total_duration
                });
            });
        }
        group.finish();
    }
}

fn bench_chunked_rsvd(c: &mut Criterion) {
    let scenarios: &[(&str, usize, usize, usize)] = &[("tall", 5000, 300, 500), ("wide", 300, 20000, 64)];
    for &(name, n_samples, n_features, chunk_size) in scenarios {
        let data = generate_random_data(n_samples, n_features, 42);
        let source = InMemoryRows::new(data);
        let input_size_bytes = (n_samples * n_features * std::mem::size_of::<f64>()) as u64;
        let mut group = c.benchmark_group(format!("rsvd/{}", name));
        group.sample_size(10);
        group.throughput(Throughput::Bytes(input_size_bytes));

        let engine = ChunkedRandomizedSvd::new(RandomizedSvdConfig {
            num_components: 10,
            chunk_size,
            ..Default::default()
        });
        let id = BenchmarkId::new("fit", format!("s{}_f{}_chunk{}", n_samples, n_features, chunk_size));
        group.bench_with_input(id, &source, |b, source| {
            b.iter_custom(|iters| {
                let mut total_duration = Duration::new(0, 0);
                for _ in 0..iters {
                    total_duration += timed_run("rsvd", || {
                        let output = engine.fit(source).expect("rsvd failed");
                        assert_eq!(output.eigenvectors.ncols(), 10);
                    });
                }
                total_duration
            });
        });
        group.finish();
    }
}

criterion_group!(benches, bench_streaming_epochs, bench_chunked_rsvd);
criterion_main!(benches);
