// src/linalg_backends.rs

use lax::layout::MatrixLayout;
use lax::Lapack;
use log::debug;
use ndarray::{Array1, Array2, ArrayView2};
use ndarray_linalg::svddc::JobSvd;
use ndarray_linalg::{SVDDCInto, QR};
use std::error::Error;

/// Output of a thin Singular Value Decomposition.
#[derive(Debug)]
pub struct SVDOutput<F: 'static> {
    /// Left singular vectors, shape (m, k) with k = min(m, n).
    pub u: Option<Array2<F>>,
    /// Singular values in descending order, length k.
    pub s: Array1<F>,
    /// Right singular vectors transposed, shape (k, n).
    pub vt: Option<Array2<F>>,
}

/// Trait for thin QR decomposition, focusing on retrieving the Q factor.
/// For an (m x n) input with m >= n the Q factor is (m x n) with orthonormal columns.
pub trait BackendQR<F: 'static + Copy + Send + Sync> {
    fn qr_q_factor(&self, matrix: &Array2<F>) -> Result<Array2<F>, Box<dyn Error + Send + Sync>>;
}

/// Trait for thin Singular Value Decomposition.
pub trait BackendSVD<F: 'static + Copy + Send + Sync> {
    fn svd_into(&self, matrix: Array2<F>, compute_u: bool, compute_v: bool) -> Result<SVDOutput<F>, Box<dyn Error + Send + Sync>>;
}

/// Trait for an LU factorization with partial pivoting that returns the
/// row-permuted unit lower-trapezoidal factor `P * L`, so that `A = (P * L) * U`.
///
/// For a full-rank `A` the permuted L factor spans the same column space and is
/// used to renormalize between power iterations.
pub trait BackendLU<F: 'static + Copy + Send + Sync> {
    fn lu_permuted_lower(&self, matrix: &Array2<F>) -> Result<Array2<F>, Box<dyn Error + Send + Sync>>;
}

/// Backend built on `ndarray-linalg` (LAPACK) for QR, SVD and LU.
#[derive(Debug, Default, Copy, Clone)]
pub struct NdarrayLinAlgBackend;

// Helper to convert ndarray-linalg's error to Box<dyn Error + Send + Sync>
fn to_dyn_error<E: Error + Send + Sync + 'static>(e: E) -> Box<dyn Error + Send + Sync> {
    Box::new(e)
}

impl BackendQR<f64> for NdarrayLinAlgBackend {
    fn qr_q_factor(&self, matrix: &Array2<f64>) -> Result<Array2<f64>, Box<dyn Error + Send + Sync>> {
        let (nrows, ncols) = matrix.dim();
        if nrows == 0 || ncols == 0 {
            return Ok(Array2::zeros((nrows, nrows.min(ncols))));
        }
        let (q_factor, _r) = matrix.qr().map_err(to_dyn_error)?;
        Ok(q_factor)
    }
}

impl BackendSVD<f64> for NdarrayLinAlgBackend {
    fn svd_into(&self, matrix: Array2<f64>, compute_u: bool, compute_v: bool) -> Result<SVDOutput<f64>, Box<dyn Error + Send + Sync>> {
        let (nrows, ncols) = matrix.dim();
        if matrix.is_empty() {
            let k_dim = nrows.min(ncols);
            return Ok(SVDOutput {
                u: if compute_u { Some(Array2::zeros((nrows, k_dim))) } else { None },
                s: Array1::zeros(k_dim),
                vt: if compute_v { Some(Array2::zeros((k_dim, ncols))) } else { None },
            });
        }
        // Divide-and-conquer with thin factors: a full V would be (n x n), which is
        // prohibitive when n is the number of columns of a streamed matrix.
        let job = if compute_u || compute_v { JobSvd::Some } else { JobSvd::None };
        let (u, s, vt) = matrix.svddc_into(job).map_err(to_dyn_error)?;
        Ok(SVDOutput {
            u: if compute_u { u } else { None },
            s,
            vt: if compute_v { vt } else { None },
        })
    }
}

impl BackendLU<f64> for NdarrayLinAlgBackend {
    /// An exactly singular `U` falls back to the thin Q factor.
    fn lu_permuted_lower(&self, matrix: &Array2<f64>) -> Result<Array2<f64>, Box<dyn Error + Send + Sync>> {
        match permuted_lower_factor(&matrix.view()) {
            Err(LuFailure::Singular(return_code)) => {
                debug!(
                    "getrf found a zero pivot at column {} of a {}x{} matrix; renormalizing with QR instead.",
                    return_code,
                    matrix.nrows(),
                    matrix.ncols()
                );
                self.qr_q_factor(matrix)
            }
            Err(LuFailure::Other(e)) => Err(e),
            Ok(permuted_lower) => Ok(permuted_lower),
        }
    }
}

/// Why `permuted_lower_factor` produced no factor.
#[derive(Debug)]
pub(crate) enum LuFailure {
    /// `getrf` completed but `U[i, i]` is exactly zero for this 1-based `i`.
    Singular(i32),
    Other(Box<dyn Error + Send + Sync>),
}

impl From<String> for LuFailure {
    fn from(message: String) -> Self {
        LuFailure::Other(message.into())
    }
}

/// LAPACK `getrf` on an (m x n) matrix, m >= n, expanded into `P * L`.
pub(crate) fn permuted_lower_factor(matrix: &ArrayView2<f64>) -> Result<Array2<f64>, LuFailure> {
    let (m_rows, n_cols) = matrix.dim();
    if m_rows < n_cols {
        return Err(format!("LU renormalization expects a tall matrix, got {}x{}.", m_rows, n_cols).into());
    }
    if matrix.iter().any(|v| !v.is_finite()) {
        return Err(format!(
            "LU renormalization received a {}x{} matrix with non-finite entries.",
            m_rows, n_cols
        )
        .into());
    }
    if n_cols == 0 {
        return Ok(Array2::zeros((m_rows, 0)));
    }

    // column-major copy; entry (i, j) sits at j * m + i
    let mut factored: Vec<f64> = matrix.t().iter().copied().collect();
    let layout = MatrixLayout::F { col: n_cols as i32, lda: m_rows as i32 };
    let pivots = f64::lu(layout, &mut factored).map_err(|e| match e {
        lax::error::Error::LapackComputationalFailure { return_code } => LuFailure::Singular(return_code),
        other => LuFailure::Other(Box::new(other)),
    })?;

    // ipiv is 1-based and applied in order
    let mut row_of: Vec<usize> = (0..m_rows).collect();
    for (k, &pivot) in pivots.iter().enumerate() {
        row_of.swap(k, pivot as usize - 1);
    }

    let mut permuted_lower = Array2::<f64>::zeros((m_rows, n_cols));
    for (i, &target) in row_of.iter().enumerate() {
        for j in 0..n_cols.min(i + 1) {
            permuted_lower[[target, j]] = if i == j { 1.0 } else { factored[j * m_rows + i] };
        }
    }
    Ok(permuted_lower)
}
