// src/retraction.rs

use crate::linalg_backends::{BackendQR, NdarrayLinAlgBackend};
use crate::ThreadSafeStdError;
use ndarray::{Array2, Axis, Zip};

/// Maps an updated (M x d) basis back onto the Stiefel manifold with the
/// default backend. See [`retract_with`].
pub fn retract(updated: Array2<f64>) -> Result<Array2<f64>, ThreadSafeStdError> {
    retract_with(&NdarrayLinAlgBackend, updated)
}

/// Thin QR retraction `W ← qf(W + ΔW)`.
///
/// Column signs are flipped so that `diag(R) ≥ 0`, which keeps consecutive
/// bases in the same frame. A rank-deficient update still yields orthonormal
/// columns from the Householder factorization. Non-finite input is returned
/// unchanged for the monitor to report.
pub fn retract_with<B: BackendQR<f64>>(backend: &B, updated: Array2<f64>) -> Result<Array2<f64>, ThreadSafeStdError> {
    let (m_rows, d_cols) = updated.dim();
    if m_rows < d_cols {
        return Err(format!(
            "Cannot retract a {}x{} basis: more components than features.",
            m_rows, d_cols
        )
        .into());
    }
    if updated.iter().any(|v| !v.is_finite()) {
        return Ok(updated);
    }

    let mut q = backend
        .qr_q_factor(&updated)
        .map_err(|e| format!("QR retraction of a {}x{} basis failed: {}", m_rows, d_cols, e))?;
    if q.ncols() > d_cols {
        q = q.slice_move(ndarray::s![.., ..d_cols]);
    }

    // r_jj = q_jᵗ a_j
    Zip::from(q.axis_iter_mut(Axis(1)))
        .and(updated.axis_iter(Axis(1)))
        .for_each(|mut q_col, a_col| {
            if q_col.dot(&a_col) < 0.0 {
                q_col.mapv_inplace(|v| -v);
            }
        });
    Ok(q)
}

/// Frobenius norm of `WᵗW − I`.
pub fn orthonormality_error(basis: &Array2<f64>) -> f64 {
    let gram = basis.t().dot(basis);
    let identity = Array2::<f64>::eye(basis.ncols());
    (&gram - &identity).iter().map(|v| v * v).sum::<f64>().sqrt()
}
