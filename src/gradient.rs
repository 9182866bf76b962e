// src/gradient.rs

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

/// Fixed diagonal weighting `D = diag(d, d-1, ..., 1)`.
///
/// Strictly decreasing weights break the rotational symmetry of the top-d
/// subspace objective, so ascent converges to ordered eigenvectors.
#[derive(Clone, Debug, PartialEq)]
pub struct DiagonalWeights {
    weights: Array1<f64>,
}

impl DiagonalWeights {
    pub fn new(num_components: usize) -> Self {
        DiagonalWeights {
            weights: Array1::from_iter((1..=num_components).rev().map(|w| w as f64)),
        }
    }

    pub fn as_array(&self) -> &Array1<f64> {
        &self.weights
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

/// Per-sample gradient of the weighted Rayleigh-quotient objective
/// `tr(Wᵗ x xᵗ W D) / M`.
///
/// The plain variant is `G = (2c/M) · x · (xᵗW) · D`; rows where `x` is exactly
/// zero are never touched, so sparse counts cost only their non-zeros. With a
/// positive `offset` δ the overflow-safe variant `(2c/M) · (x (xᵗW) D + δ)` is
/// used instead.
#[derive(Clone, Debug)]
pub struct TangentGradient {
    weights: DiagonalWeights,
    n_features: usize,
    offset: f64,
}

impl TangentGradient {
    pub fn new(num_components: usize, n_features: usize, offset: f64) -> Self {
        TangentGradient {
            weights: DiagonalWeights::new(num_components),
            n_features,
            offset,
        }
    }

    pub fn weights(&self) -> &DiagonalWeights {
        &self.weights
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// Gradient for sample `x` at basis `basis`, scaled by `scale`.
    pub fn compute(&self, basis: ArrayView2<f64>, x: ArrayView1<f64>, scale: f64) -> Array2<f64> {
        let mut gradient = Array2::<f64>::zeros(basis.raw_dim());
        self.accumulate(basis, x, scale, &mut gradient);
        gradient
    }

    /// Adds the gradient for sample `x` into `out` without allocating an M x d temporary.
    pub fn accumulate(&self, basis: ArrayView2<f64>, x: ArrayView1<f64>, scale: f64, out: &mut Array2<f64>) {
        let factor = 2.0 * scale / self.n_features as f64;
        // (xᵗW) D, length d
        let weighted_projection = x.dot(&basis) * self.weights.as_array();

        if self.offset > 0.0 {
            out.mapv_inplace(|v| v + factor * self.offset);
        }
        for (xi, mut out_row) in x.iter().zip(out.axis_iter_mut(Axis(0))) {
            if *xi != 0.0 {
                out_row.scaled_add(factor * xi, &weighted_projection);
            }
        }
    }
}

/// Projects a Euclidean gradient onto the tangent space of the Stiefel manifold
/// at `basis`: `G − W · sym(Wᵗ G)` with `sym(A) = (A + Aᵗ) / 2`.
pub fn project_to_tangent(basis: ArrayView2<f64>, gradient: &Array2<f64>) -> Array2<f64> {
    let wtg = basis.t().dot(gradient);
    let sym = (&wtg + &wtg.t()) * 0.5;
    gradient - &basis.dot(&sym)
}
