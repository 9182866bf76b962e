// In tests/rsvd_tests.rs

use float_cmp::assert_approx_eq;
use ndarray::{Array1, Array2, Axis};
use ndarray_linalg::SVD;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use streaming_pca::retraction::orthonormality_error;
use streaming_pca::stream::CsrMatrixSource;
use streaming_pca::{
    csr_from_dense, BufferedChunks, ChunkedRandomizedSvd, InMemoryRows, NormalizationSettings, RandomizedSvdConfig,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Exact rank-3 matrix plus tiny noise.
fn rank_three_matrix(n_rows: usize, n_cols: usize, seed: u64) -> Array2<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let left = Array2::from_shape_fn((n_rows, 3), |_| rng.gen_range(-1.0..1.0));
    let right = Array2::from_shape_fn((3, n_cols), |_| rng.gen_range(-1.0..1.0));
    let scales = Array2::from_diag(&Array1::from(vec![10.0, 5.0, 2.0]));
    let mut matrix = left.dot(&scales).dot(&right);
    matrix.mapv_inplace(|v| v + rng.gen_range(-1e-6..1e-6));
    matrix
}

fn reference_singular_values(matrix: &Array2<f64>) -> Array1<f64> {
    let (_, s, _) = matrix.svd(false, false).unwrap();
    s
}

fn small_config() -> RandomizedSvdConfig {
    RandomizedSvdConfig {
        num_components: 3,
        oversample: 5,
        num_power_iterations: 2,
        chunk_size: 7,
        seed: 2025,
        normalization: NormalizationSettings::default(),
    }
}

#[test]
fn test_chunked_singular_values_match_full_svd() {
    init_logging();
    let matrix = rank_three_matrix(40, 30, 1);
    let output = ChunkedRandomizedSvd::new(small_config())
        .fit(&InMemoryRows::new(matrix.clone()))
        .unwrap();
    let reference = reference_singular_values(&matrix);
    let found = output.singular_values.as_ref().unwrap();
    for k in 0..3 {
        let relative = (found[k] - reference[k]).abs() / reference[k];
        println!("sigma_{}: chunked {:.8}, full {:.8}, relative error {:.2e}", k, found[k], reference[k], relative);
        assert!(relative < 1e-3, "component {} relative error {}", k, relative);
    }

    assert_eq!(output.eigenvectors.dim(), (30, 3));
    assert_eq!(output.loadings.dim(), (40, 3));
    assert!(orthonormality_error(&output.eigenvectors) < 1e-8);
    assert!(orthonormality_error(&output.loadings) < 1e-8);
    for k in 0..3 {
        assert_approx_eq!(f64, output.eigenvalues[k], found[k] * found[k] / 30.0, epsilon = 1e-9);
    }

    let total = output.total_variance.unwrap();
    assert_approx_eq!(f64, total, matrix.iter().map(|v| v * v).sum::<f64>(), epsilon = 1e-6);
    let ratio_sum: f64 = output.explained_variance_ratio.as_ref().unwrap().sum();
    assert!(ratio_sum <= 1.0 + 1e-9 && ratio_sum > 0.999, "ratio sum {}", ratio_sum);
}

#[test]
fn test_lazy_centering_matches_explicitly_centered_svd() {
    init_logging();
    let mut matrix = rank_three_matrix(40, 30, 2);
    matrix.mapv_inplace(|v| v + 3.0);
    let row_means = matrix.mean_axis(Axis(1)).unwrap();
    let mut centered = matrix.clone();
    for (mut row, mean) in centered.axis_iter_mut(Axis(0)).zip(row_means.iter()) {
        row.mapv_inplace(|v| v - mean);
    }

    let config = RandomizedSvdConfig {
        normalization: NormalizationSettings { row_means: Some(row_means), ..Default::default() },
        ..small_config()
    };
    let output = ChunkedRandomizedSvd::new(config).fit(&InMemoryRows::new(matrix)).unwrap();
    let reference = reference_singular_values(&centered);
    let found = output.singular_values.as_ref().unwrap();
    for k in 0..3 {
        let relative = (found[k] - reference[k]).abs() / reference[k];
        assert!(relative < 1e-3, "component {} relative error {}", k, relative);
    }
    assert_approx_eq!(
        f64,
        output.total_variance.unwrap(),
        centered.iter().map(|v| v * v).sum::<f64>(),
        epsilon = 1e-6
    );
}

#[test]
fn test_sparse_and_buffered_sources_agree_with_dense() {
    init_logging();
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let matrix = Array2::from_shape_fn((35, 25), |_| {
        if rng.gen_bool(0.3) {
            rng.gen_range(1..20) as f64
        } else {
            0.0
        }
    });
    let column_sums = matrix.sum_axis(Axis(0));
    let config = RandomizedSvdConfig {
        normalization: NormalizationSettings { column_sums: Some(column_sums), ..Default::default() },
        ..small_config()
    };
    let engine = ChunkedRandomizedSvd::new(config);

    let dense_source = InMemoryRows::new(matrix.clone());
    let dense = engine.fit(&dense_source).unwrap();
    let sparse = engine
        .fit(&CsrMatrixSource::new(csr_from_dense(&matrix.view())))
        .unwrap();
    let buffered = engine.fit(&BufferedChunks::new(&dense_source)).unwrap();

    for other in [&sparse, &buffered] {
        for (a, b) in dense.singular_values.as_ref().unwrap().iter().zip(other.singular_values.as_ref().unwrap().iter()) {
            assert_approx_eq!(f64, *a, *b, epsilon = 1e-9);
        }
        for (a, b) in dense.eigenvectors.columns().into_iter().zip(other.eigenvectors.columns()) {
            assert_approx_eq!(f64, a.dot(&b).abs(), 1.0, epsilon = 1e-8);
        }
    }
}
