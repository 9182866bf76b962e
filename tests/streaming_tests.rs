// In tests/streaming_tests.rs

use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use streaming_pca::monitor::load_checkpoint;
use streaming_pca::retraction::{orthonormality_error, retract};
use streaming_pca::{
    Algorithm, DirectoryCheckpointSink, InMemoryRows, NormalizationSettings, PcaOutput, StreamingPca,
    StreamingPcaConfig,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// `x = Σ a_k σ_k u_k + noise`, returns rows and the true directions.
fn low_rank_rows(n_rows: usize, n_cols: usize, sigmas: &[f64], noise: f64, seed: u64) -> (Array2<f64>, Array2<f64>) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let raw = Array2::from_shape_fn((n_cols, sigmas.len()), |_| rng.gen_range(-1.0..1.0));
    let directions = retract(raw).unwrap();
    let mut rows = Array2::<f64>::zeros((n_rows, n_cols));
    for mut row in rows.axis_iter_mut(Axis(0)) {
        for (k, &sigma) in sigmas.iter().enumerate() {
            let a: f64 = rng.sample(StandardNormal);
            row.scaled_add(a * sigma, &directions.column(k));
        }
        row.mapv_inplace(|v| v + noise * rng.sample::<f64, _>(StandardNormal));
    }
    (rows, directions)
}

fn mean_reconstruction_error(rows: &Array2<f64>, basis: ArrayView2<f64>) -> f64 {
    let mut total = 0.0;
    for x in rows.axis_iter(Axis(0)) {
        let residual = &x - &basis.dot(&x.dot(&basis));
        total += residual.dot(&residual);
    }
    total / rows.nrows() as f64
}

fn abs_cosine(a: ndarray::ArrayView1<f64>, b: ndarray::ArrayView1<f64>) -> f64 {
    (a.dot(&b) / (a.dot(&a).sqrt() * b.dot(&b).sqrt())).abs()
}

#[test]
fn test_ccipca_recovers_dominant_direction() {
    init_logging();
    let (rows, directions) = low_rank_rows(500, 10, &[5.0], 0.1, 2024);
    let source = InMemoryRows::new(rows);
    let config = StreamingPcaConfig {
        algorithm: Algorithm::Ccipca,
        num_components: 2,
        stepsize: 0.0,
        num_epochs: 3,
        ..Default::default()
    };
    let output = StreamingPca::new(config).unwrap().fit(&source).unwrap();
    let cosine = abs_cosine(output.eigenvectors.column(0), directions.column(0));
    println!("CCIPCA cosine similarity to the true direction: {:.6}", cosine);
    assert!(cosine > 0.99, "cosine similarity {} <= 0.99", cosine);
    assert!(output.eigenvalues[0] > output.eigenvalues[1]);
}

#[test]
fn test_variance_reduction_beats_plain_stochastic_updates() {
    init_logging();
    let (rows, _) = low_rank_rows(300, 20, &[5.0, 3.0], 0.1, 42);
    let source = InMemoryRows::new(rows.clone());

    for (plain, reduced) in [(Algorithm::Oja, Algorithm::Svrg), (Algorithm::Rsgd, Algorithm::Rsvrg)] {
        let run = |algorithm: Algorithm| -> f64 {
            let config = StreamingPcaConfig {
                algorithm,
                num_components: 2,
                stepsize: 0.01,
                num_epochs: 3,
                ..Default::default()
            };
            let output = StreamingPca::new(config).unwrap().fit(&source).unwrap();
            assert!(orthonormality_error(&output.eigenvectors) < 1e-8);
            mean_reconstruction_error(&rows, output.eigenvectors.view())
        };
        let plain_error = run(plain);
        let reduced_error = run(reduced);
        println!(
            "{} reconstruction error {:.6}, {} reconstruction error {:.6}",
            plain, plain_error, reduced, reduced_error
        );
        assert!(
            reduced_error < plain_error,
            "{} ({}) should end below {} ({})",
            reduced,
            reduced_error,
            plain,
            plain_error
        );
    }
}

#[test]
fn test_masked_column_never_influences_the_basis() {
    init_logging();
    let (rows, _) = low_rank_rows(200, 6, &[4.0, 2.0], 0.1, 8);
    let mut rng = ChaCha8Rng::seed_from_u64(77);
    let mut with_extra = Array2::<f64>::zeros((200, 7));
    with_extra.slice_mut(s![.., ..3]).assign(&rows.slice(s![.., ..3]));
    with_extra.slice_mut(s![.., 4..]).assign(&rows.slice(s![.., 3..]));
    for v in with_extra.column_mut(3).iter_mut() {
        *v = rng.gen_range(-100.0..100.0);
    }

    let base = StreamingPcaConfig {
        algorithm: Algorithm::Ccipca,
        num_components: 2,
        stepsize: 1.0,
        num_epochs: 2,
        ..Default::default()
    };
    let reference = StreamingPca::new(base.clone()).unwrap().fit(&InMemoryRows::new(rows)).unwrap();
    let masked_config = StreamingPcaConfig {
        normalization: NormalizationSettings { column_mask: Some(vec![0, 1, 2, 4, 5, 6]), ..Default::default() },
        ..base
    };
    let masked = StreamingPca::new(masked_config)
        .unwrap()
        .fit(&InMemoryRows::new(with_extra))
        .unwrap();

    assert_eq!(masked.eigenvectors.dim(), (6, 2));
    for (a, b) in masked.eigenvectors.iter().zip(reference.eigenvectors.iter()) {
        assert!((a - b).abs() < 1e-10, "{} vs {}", a, b);
    }
    for (a, b) in masked.eigenvalues.iter().zip(reference.eigenvalues.iter()) {
        assert!((a - b).abs() < 1e-10);
    }
}

#[test]
fn test_row_statistics_normalization_runs_for_riemannian_variants() {
    init_logging();
    let (rows, _) = low_rank_rows(60, 8, &[3.0, 1.5], 0.1, 5);
    let shifted = rows.mapv(|v| v + 10.0);
    let row_means = shifted.mean_axis(Axis(1)).unwrap();
    let row_variances: Array1<f64> = shifted
        .axis_iter(Axis(0))
        .zip(row_means.iter())
        .map(|(row, mean)| row.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / row.len() as f64)
        .collect();
    let config = StreamingPcaConfig {
        algorithm: Algorithm::Rsvrg,
        num_components: 2,
        stepsize: 0.05,
        num_epochs: 2,
        normalization: NormalizationSettings {
            row_means: Some(row_means),
            row_variances: Some(row_variances),
            ..Default::default()
        },
        ..Default::default()
    };
    let output = StreamingPca::new(config).unwrap().fit(&InMemoryRows::new(shifted)).unwrap();
    assert!(output.eigenvalues.iter().all(|v| v.is_finite()));
    assert!(orthonormality_error(&output.eigenvectors) < 1e-8);
}

#[test]
fn test_output_and_checkpoints_persist() {
    init_logging();
    let (rows, _) = low_rank_rows(50, 5, &[3.0, 1.0], 0.1, 31);
    let source = InMemoryRows::new(rows);
    let dir = tempfile::tempdir().unwrap();
    let mut sink = DirectoryCheckpointSink::new(dir.path()).unwrap();
    let config = StreamingPcaConfig {
        algorithm: Algorithm::Oja,
        scheduling: "momentum".to_string(),
        num_components: 2,
        stepsize: 0.01,
        num_epochs: 2,
        eval_frequency: Some(25),
        eval_rows: Some(10),
        ..Default::default()
    };
    let output = StreamingPca::new(config).unwrap().fit_with_checkpoints(&source, &mut sink).unwrap();

    // samples 25, 50, 75, 100 plus the final snapshot
    assert_eq!(sink.written().len(), 5);
    let last = load_checkpoint(sink.written().last().unwrap()).unwrap();
    assert!(last.is_final);
    assert_eq!(last.sample, 100);

    let path = dir.path().join("pca_output.bin");
    output.save(&path).unwrap();
    let loaded = PcaOutput::load(&path).unwrap();
    assert_eq!(loaded.eigenvectors, output.eigenvectors);
    assert_eq!(loaded.scores, output.scores);
    assert_eq!(loaded.stop_reason, output.stop_reason);
}
