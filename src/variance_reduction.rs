// src/variance_reduction.rs

use crate::engine::{OptimizationContext, SampleUpdate};
use crate::gradient::{project_to_tangent, TangentGradient};
use crate::retraction::retract;
use crate::schedule::SchedulingPolicy;
use crate::stream::NormalizedRows;
use crate::ThreadSafeStdError;
use log::debug;
use ndarray::{Array2, ArrayView1, ArrayView2};
use std::ops::ControlFlow;
use std::time::Instant;

/// Basis and full gradient frozen at the start of an epoch.
#[derive(Clone, Debug)]
struct Snapshot {
    basis: Array2<f64>,
    /// Mean unit-scale gradient over all rows at `basis`, projected at `basis` for RSVRG.
    full_gradient: Array2<f64>,
    /// Epoch step `stepsize / epoch`.
    scale: f64,
}

/// SVRG and RSVRG.
///
/// Each epoch first takes a full pass at the frozen basis `Ws` to build the mean
/// gradient `u`. Every sample then hands the corrected gradient
/// `∇(W) − ∇(Ws) + u` (each term projected onto its own tangent space for
/// RSVRG) to the scheduling policy at the epoch step `stepsize / epoch`, and
/// retracts. Robbins–Monro for this family decays per epoch only, so it uses
/// the epoch step as is.
#[derive(Clone, Debug)]
pub struct VarianceReducedDriver {
    gradient: TangentGradient,
    policy: SchedulingPolicy,
    stepsize: f64,
    riemannian: bool,
    snapshot: Option<Snapshot>,
}

impl VarianceReducedDriver {
    pub fn new(gradient: TangentGradient, policy: SchedulingPolicy, stepsize: f64, riemannian: bool) -> Self {
        VarianceReducedDriver { gradient, policy, stepsize, riemannian, snapshot: None }
    }

    /// Freezes `basis` and computes the full-data gradient for `epoch` (1-based).
    pub fn take_snapshot(
        &mut self,
        basis: &Array2<f64>,
        epoch: usize,
        rows: &NormalizedRows<'_>,
    ) -> Result<(), ThreadSafeStdError> {
        let started = Instant::now();
        let scale = self.stepsize / epoch.max(1) as f64;
        let mut full_gradient = Array2::<f64>::zeros(basis.raw_dim());
        let visited = rows.for_each_sample(|_, _, sample| {
            self.gradient.accumulate(basis.view(), sample, 1.0, &mut full_gradient);
            Ok(ControlFlow::Continue(()))
        })?;
        if visited == 0 {
            return Err("Variance reduction needs at least one row for the full gradient.".into());
        }
        full_gradient.mapv_inplace(|v| v / visited as f64);
        if self.riemannian {
            full_gradient = project_to_tangent(basis.view(), &full_gradient);
        }
        debug!(
            "Full-gradient snapshot for epoch {} over {} rows in {:.3?} (epoch step {:e}, scheduling={})",
            epoch,
            visited,
            started.elapsed(),
            scale,
            self.policy.name()
        );
        self.snapshot = Some(Snapshot { basis: basis.clone(), full_gradient, scale });
        Ok(())
    }

    fn snapshot(&self) -> Result<&Snapshot, ThreadSafeStdError> {
        self.snapshot
            .as_ref()
            .ok_or_else(|| "Variance-reduced update requested before the epoch snapshot was taken.".into())
    }

    /// `scale · (∇(W) − ∇(Ws) + u)` for one sample at `point`.
    pub fn corrected_gradient(
        &self,
        point: ArrayView2<f64>,
        sample: ArrayView1<f64>,
        scale: f64,
    ) -> Result<Array2<f64>, ThreadSafeStdError> {
        let snapshot = self.snapshot()?;
        Ok(self.corrected_against(snapshot, point, sample, scale))
    }

    fn corrected_against(&self, snapshot: &Snapshot, point: ArrayView2<f64>, sample: ArrayView1<f64>, scale: f64) -> Array2<f64> {
        let current = self.gradient.compute(point, sample, scale);
        let frozen = self.gradient.compute(snapshot.basis.view(), sample, scale);
        let mut corrected = if self.riemannian {
            project_to_tangent(point, &current) - project_to_tangent(snapshot.basis.view(), &frozen)
        } else {
            current - frozen
        };
        corrected.scaled_add(scale, &snapshot.full_gradient);
        corrected
    }
}

impl SampleUpdate for VarianceReducedDriver {
    fn begin_epoch(&mut self, context: &mut OptimizationContext, rows: &NormalizedRows<'_>) -> Result<(), ThreadSafeStdError> {
        let epoch = context.cursor.epoch();
        self.take_snapshot(&context.basis, epoch, rows)
    }

    fn update(&mut self, context: &mut OptimizationContext, sample: ArrayView1<f64>) -> Result<(), ThreadSafeStdError> {
        let snapshot = self.snapshot()?;
        let increment = match self.policy {
            SchedulingPolicy::RobbinsMonro => {
                self.corrected_against(snapshot, context.basis.view(), sample, snapshot.scale)
            }
            policy => policy.apply(
                &mut context.policy_state,
                context.basis.view(),
                snapshot.scale,
                context.cursor.global_index(),
                |point, scale| self.corrected_against(snapshot, point, sample, scale),
            ),
        };
        let updated = &context.basis + &increment;
        context.basis = retract(updated)?;
        Ok(())
    }
}
