// src/output.rs

use crate::normalize::RowNormalizer;
use crate::stream::{NormalizedRows, RowStream};
use crate::ThreadSafeStdError;
use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::ops::ControlFlow;
use std::path::Path;
use tempfile::NamedTempFile;

/// Singular values at or below this are treated as zero when normalizing loadings.
const ZERO_SINGULAR_VALUE: f64 = 1e-12;

/// Why a run ended.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum StopReason {
    /// Every configured epoch ran.
    Completed,
    /// Relative change of the reconstruction error fell below the lower bound.
    Converged { sample: u64, relative_change: f64 },
    /// Relative change exceeded the upper bound.
    Diverged { sample: u64, relative_change: f64 },
}

impl StopReason {
    pub fn is_early_stop(&self) -> bool {
        !matches!(self, StopReason::Completed)
    }
}

/// Final factors of a run. Components are ordered by descending eigenvalue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PcaOutput {
    /// Orthonormal basis, shape (M, d) with M the (masked) row length.
    pub eigenvectors: Array2<f64>,
    /// Length d, descending.
    pub eigenvalues: Array1<f64>,
    /// Unit-norm columns, shape (N, d).
    pub loadings: Array2<f64>,
    /// Projections of the rows onto the eigenvectors, shape (N, d).
    pub scores: Array2<f64>,
    pub singular_values: Option<Array1<f64>>,
    /// Eigenvalue divided by the total variance; randomized SVD only.
    pub explained_variance_ratio: Option<Array1<f64>>,
    /// Sum of squares of the normalized matrix; randomized SVD only.
    pub total_variance: Option<f64>,
    pub stop_reason: StopReason,
    pub epochs_completed: usize,
    pub samples_processed: u64,
}

/// Reorders the columns of a 2D array by `order`.
pub fn reorder_columns_owned<T: Clone>(matrix: &Array2<T>, order: &[usize]) -> Array2<T> {
    matrix.select(Axis(1), order)
}

/// Reorders the elements of a 1D array by `order`.
pub fn reorder_array_owned<T: Clone>(array: &Array1<T>, order: &[usize]) -> Array1<T> {
    array.select(Axis(0), order)
}

/// Indices of `values` sorted descending; NaN sorts last.
pub fn descending_order(values: &Array1<f64>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| {
        values[b]
            .partial_cmp(&values[a])
            .unwrap_or_else(|| values[a].is_nan().cmp(&values[b].is_nan()))
    });
    order
}

/// Summary fields carried from the run into the output.
#[derive(Clone, Copy, Debug)]
pub struct RunSummary {
    pub stop_reason: StopReason,
    pub epochs_completed: usize,
    pub samples_processed: u64,
}

/// Computes scores `P = X·W` with one normalized pass, then assembles the output.
pub fn assemble_from_stream(
    source: &dyn RowStream,
    normalizer: &RowNormalizer,
    basis: Array2<f64>,
    summary: RunSummary,
) -> Result<PcaOutput, ThreadSafeStdError> {
    let (n_rows, _) = source.dimensions();
    let mut scores = Array2::<f64>::zeros((n_rows, basis.ncols()));
    NormalizedRows::new(source, normalizer).for_each_sample(|_, row_index, x| {
        scores.row_mut(row_index).assign(&x.dot(&basis));
        Ok(ControlFlow::Continue(()))
    })?;
    assemble(basis, scores, summary)
}

/// Turns a basis and its scores into eigenvalues and unit loadings.
///
/// `σ_k = ‖P_k‖`, `λ_k = σ_k² / M`, loadings `P_k / σ_k`.
pub fn assemble(basis: Array2<f64>, scores: Array2<f64>, summary: RunSummary) -> Result<PcaOutput, ThreadSafeStdError> {
    let (n_features, d) = basis.dim();
    if scores.ncols() != d {
        return Err(format!("Scores have {} columns but the basis has {}.", scores.ncols(), d).into());
    }
    if n_features == 0 {
        return Err("Cannot assemble output for a basis with zero features.".into());
    }
    let singular_values: Array1<f64> = scores
        .axis_iter(Axis(1))
        .map(|col| col.dot(&col).sqrt())
        .collect();
    let eigenvalues = singular_values.mapv(|s| s * s / n_features as f64);
    let mut loadings = scores.clone();
    for (mut col, &sigma) in loadings.axis_iter_mut(Axis(1)).zip(singular_values.iter()) {
        if sigma > ZERO_SINGULAR_VALUE {
            col.mapv_inplace(|v| v / sigma);
        } else {
            col.fill(0.0);
        }
    }

    let order = descending_order(&eigenvalues);
    debug!("Component order after sorting by eigenvalue: {:?}", order);
    Ok(PcaOutput {
        eigenvectors: reorder_columns_owned(&basis, &order),
        eigenvalues: reorder_array_owned(&eigenvalues, &order),
        loadings: reorder_columns_owned(&loadings, &order),
        scores: reorder_columns_owned(&scores, &order),
        singular_values: Some(reorder_array_owned(&singular_values, &order)),
        explained_variance_ratio: None,
        total_variance: None,
        stop_reason: summary.stop_reason,
        epochs_completed: summary.epochs_completed,
        samples_processed: summary.samples_processed,
    })
}

impl PcaOutput {
    pub fn num_components(&self) -> usize {
        self.eigenvalues.len()
    }

    /// Eigenvectors as a view, shape (M, d).
    pub fn basis(&self) -> ArrayView2<'_, f64> {
        self.eigenvectors.view()
    }

    /// Saves the output with bincode.
    ///
    /// The bytes go to a temporary file in the destination directory that is
    /// renamed over `path` only after a complete write.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ThreadSafeStdError> {
        let path = path.as_ref();
        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut staging = NamedTempFile::new_in(directory)
            .map_err(|e| format!("Failed to create a temporary file in {:?}: {}", directory, e))?;
        {
            let mut writer = BufWriter::new(staging.as_file_mut());
            bincode::serde::encode_into_std_write(self, &mut writer, bincode::config::standard())
                .map_err(|e| format!("Failed to serialize PCA output: {}", e))?;
            writer
                .flush()
                .map_err(|e| format!("Failed to write PCA output to {:?}: {}", path, e))?;
        }
        staging
            .persist(path)
            .map_err(|e| format!("Failed to move PCA output into place at {:?}: {}", path, e.error))?;
        info!("Saved {} components to {:?}", self.num_components(), path);
        Ok(())
    }

    /// Loads an output written by [`PcaOutput::save`] and checks that its shapes agree.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ThreadSafeStdError> {
        let file = File::open(path.as_ref())
            .map_err(|e| format!("Failed to open file at {:?}: {}", path.as_ref(), e))?;
        let mut reader = BufReader::new(file);
        let output: PcaOutput = bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
            .map_err(|e| format!("Failed to deserialize PCA output: {}", e))?;
        output.check_shapes()?;
        Ok(output)
    }

    fn check_shapes(&self) -> Result<(), ThreadSafeStdError> {
        let d = self.eigenvalues.len();
        let n_rows = self.loadings.nrows();
        if self.eigenvectors.ncols() != d {
            return Err(format!("Eigenvectors have {} columns, expected {}.", self.eigenvectors.ncols(), d).into());
        }
        if self.loadings.ncols() != d || self.scores.dim() != (n_rows, d) {
            return Err(format!(
                "Loadings {:?} and scores {:?} do not match {} components.",
                self.loadings.dim(),
                self.scores.dim(),
                d
            )
            .into());
        }
        for (label, values) in [
            ("singular_values", self.singular_values.as_ref()),
            ("explained_variance_ratio", self.explained_variance_ratio.as_ref()),
        ] {
            if let Some(v) = values {
                if v.len() != d {
                    return Err(format!("{} has length {}, expected {}.", label, v.len(), d).into());
                }
            }
        }
        Ok(())
    }
}
