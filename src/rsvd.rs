// src/rsvd.rs

use crate::config::RandomizedSvdConfig;
use crate::linalg_backends::{BackendLU, BackendQR, BackendSVD, NdarrayLinAlgBackend};
use crate::normalize::RowNormalizer;
use crate::output::{PcaOutput, StopReason};
use crate::stream::{BufferedChunks, ChunkSource, RowChunk, RowStream};
use crate::ThreadSafeStdError;
use log::{debug, info, log_enabled, trace, Level};
use ndarray::{s, Array1, Array2, Axis};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use std::time::Instant;
use sysinfo::System;

/// Chunked randomized SVD with lazy row centering.
///
/// The normalized matrix is `Xc = A − μ fᵗ`, where `A` holds the scaled and
/// column-divided chunk values, `μ` the row means and `f` the column factors.
/// `Xc` is never materialized: every product is taken with `A` chunk by chunk
/// and the rank-one correction is applied afterwards.
#[derive(Clone, Debug)]
pub struct ChunkedRandomizedSvd {
    config: RandomizedSvdConfig,
}

/// Analytic correction terms shared by every pass.
struct Centering {
    /// Row means, length N, if centering is active.
    row_means: Option<Array1<f64>>,
    /// Column factors `f`, length M.
    column_factors: Array1<f64>,
}

impl ChunkedRandomizedSvd {
    pub fn new(config: RandomizedSvdConfig) -> Self {
        ChunkedRandomizedSvd { config }
    }

    pub fn config(&self) -> &RandomizedSvdConfig {
        &self.config
    }

    /// Runs over any row stream by buffering it into dense chunks.
    pub fn fit_rows(&self, source: &dyn RowStream) -> Result<PcaOutput, ThreadSafeStdError> {
        self.fit(&BufferedChunks::new(source))
    }

    /// Computes the top-d factors of the normalized matrix.
    ///
    /// Passes over the data: one sketch pass, two per LU power iteration, one for
    /// the final projection, so `2·niter` in total.
    pub fn fit(&self, source: &dyn ChunkSource) -> Result<PcaOutput, ThreadSafeStdError> {
        let config = &self.config;
        let (n_rows, n_cols) = source.dimensions();
        config.validate(n_rows, n_cols)?;
        let normalizer = RowNormalizer::new(&config.normalization, n_rows, n_cols)?;
        let backend = NdarrayLinAlgBackend;
        let sketch_width = config.sketch_width();
        let d = config.num_components;
        let run_start = Instant::now();
        info!(
            "Randomized SVD: d={}, oversample={}, niter={}, chunk_size={} on a {}x{} matrix",
            d, config.oversample, config.num_power_iterations, config.chunk_size, n_rows, n_cols
        );

        let centering = Centering {
            row_means: config.normalization.row_means.clone(),
            column_factors: normalizer.column_factors().unwrap_or_else(|| Array1::ones(n_cols)),
        };

        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let omega = Array2::<f64>::random_using((n_cols, sketch_width), StandardNormal, &mut rng);

        let mut passes = 0usize;
        let (mut sketch, total_variance) = self.forward_pass(source, &normalizer, &centering, &omega, true)?;
        passes += 1;
        log_memory_usage("sketch pass");

        for iteration in 1..config.num_power_iterations {
            let renormalized = backend
                .lu_permuted_lower(&sketch)
                .map_err(|e| format!("LU renormalization of the sketch failed in power iteration {}: {}", iteration, e))?;
            let transposed = self.transpose_pass(source, &normalizer, &centering, &renormalized)?;
            let transposed = backend
                .lu_permuted_lower(&transposed)
                .map_err(|e| format!("LU renormalization of Xᵗ Q failed in power iteration {}: {}", iteration, e))?;
            let (next, _) = self.forward_pass(source, &normalizer, &centering, &transposed, false)?;
            sketch = next;
            passes += 2;
            debug!("Power iteration {}/{} done", iteration, config.num_power_iterations - 1);
            log_memory_usage("power iteration");
        }

        let range_basis = backend
            .qr_q_factor(&sketch)
            .map_err(|e| format!("QR decomposition of the final sketch failed: {}", e))?;
        let projected_t = self.transpose_pass(source, &normalizer, &centering, &range_basis)?;
        passes += 1;
        log_memory_usage("projection pass");

        // B = Qᵗ Xc, (l x M)
        let svd = backend
            .svd_into(projected_t.t().to_owned(), true, true)
            .map_err(|e| format!("SVD of the projected matrix B failed: {}", e))?;
        let u_small = svd.u.ok_or("SVD of B did not return left singular vectors.")?;
        let vt = svd.vt.ok_or("SVD of B did not return right singular vectors.")?;
        let rank = svd.s.len().min(d);
        if rank < d {
            return Err(format!("Projected matrix has rank {} < num_components={}.", rank, d).into());
        }

        let singular_values = svd.s.slice(s![..d]).to_owned();
        let loadings = range_basis.dot(&u_small.slice(s![.., ..d]));
        let eigenvectors = vt.slice(s![..d, ..]).t().to_owned();
        let scores = &loadings * &singular_values;
        let eigenvalues = singular_values.mapv(|sv| sv * sv / n_cols as f64);
        let explained_variance_ratio = if total_variance > 0.0 {
            singular_values.mapv(|sv| sv * sv / total_variance)
        } else {
            Array1::zeros(d)
        };

        info!(
            "Randomized SVD finished in {:.3?} after {} passes; top singular value {:.6e}",
            run_start.elapsed(),
            passes,
            singular_values[0]
        );
        Ok(PcaOutput {
            eigenvectors,
            eigenvalues,
            loadings,
            scores,
            singular_values: Some(singular_values),
            explained_variance_ratio: Some(explained_variance_ratio),
            total_variance: Some(total_variance),
            stop_reason: StopReason::Completed,
            epochs_completed: passes,
            samples_processed: (passes * n_rows) as u64,
        })
    }

    /// Folds `step(acc, first_row, normalized_chunk)` over one pass of normalized chunks.
    fn fold_chunks<T, F>(
        &self,
        source: &dyn ChunkSource,
        normalizer: &RowNormalizer,
        init: T,
        mut step: F,
    ) -> Result<T, ThreadSafeStdError>
    where
        F: FnMut(T, usize, &RowChunk) -> Result<T, ThreadSafeStdError>,
    {
        let (n_rows, n_cols) = source.dimensions();
        let mut rows_seen = 0usize;
        let acc = source.chunks(self.config.chunk_size)?.try_fold(init, |acc, item| -> Result<T, ThreadSafeStdError> {
            let (start, chunk) = item?;
            if chunk.ncols() != n_cols || start != rows_seen || start + chunk.nrows() > n_rows {
                return Err(format!(
                    "Chunk at row {} with shape {}x{} does not continue a {}x{} matrix (expected start {}).",
                    start,
                    chunk.nrows(),
                    chunk.ncols(),
                    n_rows,
                    n_cols,
                    rows_seen
                )
                .into());
            }
            let chunk = normalize_chunk(chunk, normalizer)?;
            rows_seen += chunk.nrows();
            trace!("Processed rows {}..{} of {}", start, rows_seen, n_rows);
            step(acc, start, &chunk)
        })?;
        if rows_seen != n_rows {
            return Err(format!("Chunk source yielded {} rows but declares {}.", rows_seen, n_rows).into());
        }
        Ok(acc)
    }

    /// `Xc · rhs` (N x l). With `with_total`, also returns `‖Xc‖²_F`.
    fn forward_pass(
        &self,
        source: &dyn ChunkSource,
        normalizer: &RowNormalizer,
        centering: &Centering,
        rhs: &Array2<f64>,
        with_total: bool,
    ) -> Result<(Array2<f64>, f64), ThreadSafeStdError> {
        let (n_rows, _) = source.dimensions();
        let f = &centering.column_factors;
        let f_rhs = f.dot(rhs);
        let f_norm_sq = f.dot(f);
        let started = Instant::now();

        let init = (Array2::<f64>::zeros((n_rows, rhs.ncols())), 0.0f64);
        let (product, total) = self.fold_chunks(source, normalizer, init, |(mut product, mut total), start, chunk| {
            let mut block = chunk.dot(rhs);
            let rows = chunk.nrows();
            if let Some(means) = &centering.row_means {
                for (i, mut row) in block.axis_iter_mut(Axis(0)).enumerate() {
                    row.scaled_add(-means[start + i], &f_rhs);
                }
            }
            product.slice_mut(s![start..start + rows, ..]).assign(&block);

            if with_total {
                let (sum_sq, weighted_row_sums) = chunk_row_stats(chunk, f);
                total += sum_sq;
                if let Some(means) = &centering.row_means {
                    for (i, weighted) in weighted_row_sums.iter().enumerate() {
                        let mu = means[start + i];
                        total += -2.0 * mu * weighted + mu * mu * f_norm_sq;
                    }
                }
            }
            Ok((product, total))
        })?;
        debug!("Forward pass ({} columns) took {:.3?}", rhs.ncols(), started.elapsed());
        Ok((product, total.max(0.0)))
    }

    /// `Xcᵗ · rhs` (M x l); `rhs` is (N x l).
    fn transpose_pass(
        &self,
        source: &dyn ChunkSource,
        normalizer: &RowNormalizer,
        centering: &Centering,
        rhs: &Array2<f64>,
    ) -> Result<Array2<f64>, ThreadSafeStdError> {
        let (_, n_cols) = source.dimensions();
        let started = Instant::now();
        let init = Array2::<f64>::zeros((n_cols, rhs.ncols()));
        let mut product = self.fold_chunks(source, normalizer, init, |mut product, start, chunk| {
            let rows = chunk.nrows();
            product += &chunk.t_dot(&rhs.slice(s![start..start + rows, ..]));
            Ok(product)
        })?;
        if let Some(means) = &centering.row_means {
            // subtract f (μᵗ rhs)
            let mu_rhs = means.dot(rhs);
            for (mut row, &fj) in product.axis_iter_mut(Axis(0)).zip(centering.column_factors.iter()) {
                row.scaled_add(-fj, &mu_rhs);
            }
        }
        debug!("Transpose pass ({} columns) took {:.3?}", rhs.ncols(), started.elapsed());
        Ok(product)
    }
}

/// Applies the scale transform and column-sum division to every stored value.
/// Row centering is left to the caller.
fn normalize_chunk(chunk: RowChunk, normalizer: &RowNormalizer) -> Result<RowChunk, ThreadSafeStdError> {
    match chunk {
        RowChunk::Dense(mut block) => {
            block.axis_iter_mut(Axis(0)).into_par_iter().for_each(|mut row| {
                for (j, value) in row.iter_mut().enumerate() {
                    *value = normalizer.scale_and_divide(j, *value);
                }
            });
            Ok(RowChunk::Dense(block))
        }
        RowChunk::Sparse(mut csr) => {
            if !normalizer.is_zero_preserving() {
                return Err(format!(
                    "Scale mode \"{}\" maps 0 to a non-zero value and cannot be applied to sparse chunks.",
                    normalizer.scale_mode().name()
                )
                .into());
            }
            for (_, j, value) in csr.triplet_iter_mut() {
                *value = normalizer.scale_and_divide(j, *value);
            }
            Ok(RowChunk::Sparse(csr))
        }
    }
}

/// `(Σ a², A·f)` for one normalized chunk.
fn chunk_row_stats(chunk: &RowChunk, f: &Array1<f64>) -> (f64, Array1<f64>) {
    match chunk {
        RowChunk::Dense(block) => (block.iter().map(|v| v * v).sum(), block.dot(f)),
        RowChunk::Sparse(csr) => {
            let per_row: Vec<(f64, f64)> = (0..csr.nrows())
                .into_par_iter()
                .map(|i| {
                    let row = csr.row(i);
                    row.col_indices()
                        .iter()
                        .zip(row.values())
                        .fold((0.0, 0.0), |(sq, weighted), (&j, &v)| (sq + v * v, weighted + v * f[j]))
                })
                .collect();
            let sum_sq = per_row.iter().map(|(sq, _)| sq).sum();
            (sum_sq, per_row.iter().map(|&(_, weighted)| weighted).collect())
        }
    }
}

/// Logs resident memory of this process at debug level.
fn log_memory_usage(stage: &str) {
    if !log_enabled!(Level::Debug) {
        return;
    }
    let mut sys = System::new_all();
    sys.refresh_all();
    let memory = sysinfo::get_current_pid()
        .ok()
        .and_then(|pid| sys.process(pid).map(|process| process.memory()));
    match memory {
        Some(bytes) => debug!("Resident memory after {}: {:.1} MiB", stage, bytes as f64 / (1024.0 * 1024.0)),
        None => debug!("Resident memory after {}: unavailable", stage),
    }
}
