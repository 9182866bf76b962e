// src/ccipca.rs

use crate::engine::{OptimizationContext, SampleUpdate};
use crate::retraction::retract;
use crate::ThreadSafeStdError;
use ndarray::{Array2, ArrayView1, Axis};

/// Estimates with a norm at or below this are treated as empty and re-seeded.
const EMPTY_ESTIMATE: f64 = 1e-300;

/// Candid covariance-free incremental PCA.
///
/// Column `i` of the context basis holds an unnormalized estimate `v_i` whose
/// norm tracks the i-th eigenvalue. For the k-th sample (absolute 1-based index)
/// every active estimate is updated with
///
/// `v_i ← w1·v_i + w2·x·(xᵗv_i)/‖v_i‖`, `w1 = (k−1−ℓ)/k`, `w2 = (1+ℓ)/k`
///
/// where ℓ is the amnesic parameter, and `x` is then deflated by `v_i` before
/// moving to the next component.
#[derive(Clone, Debug)]
pub struct CcipcaUpdate {
    amnesic: f64,
    num_components: usize,
    seeded: bool,
}

impl CcipcaUpdate {
    /// `seeded` is true when the caller supplied an initial basis or loadings; the
    /// first `d` samples then update the given estimates instead of replacing them.
    pub fn new(amnesic: f64, num_components: usize, seeded: bool) -> Self {
        CcipcaUpdate { amnesic, num_components, seeded }
    }

    /// `(w1, w2)` for absolute sample index `k`. While `k ≤ 1 + ℓ` the old
    /// estimate is dropped entirely (`w1 = 0`, `w2 = 1`).
    pub fn weights(&self, k: u64) -> (f64, f64) {
        let k = k.max(1) as f64;
        let w1 = (k - 1.0 - self.amnesic) / k;
        if w1 < 0.0 {
            (0.0, 1.0)
        } else {
            (w1, (1.0 + self.amnesic) / k)
        }
    }

    /// Applies sample `x` with absolute index `k` to `estimates` (M x d).
    pub fn step(&self, estimates: &mut Array2<f64>, x: ArrayView1<f64>, k: u64) {
        let k = k.max(1);
        let (w1, w2) = self.weights(k);
        let active = (self.num_components as u64).min(k) as usize;
        let mut residual = x.to_owned();

        for (i, mut estimate) in estimates.axis_iter_mut(Axis(1)).take(active).enumerate() {
            let norm = estimate.dot(&estimate).sqrt();
            let first_visit = !self.seeded && i as u64 == k - 1;
            if first_visit || norm <= EMPTY_ESTIMATE {
                estimate.assign(&residual);
            } else {
                let coefficient = w2 * residual.dot(&estimate) / norm;
                estimate.mapv_inplace(|v| v * w1);
                estimate.scaled_add(coefficient, &residual);
            }

            let norm_sq = estimate.dot(&estimate);
            if norm_sq > EMPTY_ESTIMATE {
                let projection = residual.dot(&estimate) / norm_sq;
                residual.scaled_add(-projection, &estimate);
            }
        }
    }
}

impl SampleUpdate for CcipcaUpdate {
    fn update(&mut self, context: &mut OptimizationContext, sample: ArrayView1<f64>) -> Result<(), ThreadSafeStdError> {
        let k = context.cursor.global_index();
        self.step(&mut context.basis, sample, k);
        Ok(())
    }

    fn orthonormal_basis(&self, context: &OptimizationContext) -> Result<Array2<f64>, ThreadSafeStdError> {
        retract(context.basis.clone())
    }
}
