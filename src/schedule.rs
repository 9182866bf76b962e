// src/schedule.rs

use crate::ThreadSafeStdError;
use ndarray::{Array2, ArrayView2, Zip};

/// Turns gradients into a basis increment.
///
/// The policy itself is immutable for a run; anything that evolves between
/// samples lives in a caller-owned [`PolicyState`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SchedulingPolicy {
    /// Step decays as `stepsize / global_index`.
    RobbinsMonro,
    /// Heavy-ball momentum `v ← g·v + ∇(W)`.
    Momentum { decay: f64 },
    /// Nesterov look-ahead `v ← g·v + ∇(W − g·v)`.
    Nesterov { decay: f64 },
    /// Per-entry adaptive step from accumulated squared gradients.
    Adagrad { epsilon: f64 },
}

/// Velocity (Momentum, NAG) or squared-gradient accumulator (Adagrad).
/// Created as zeros on first use and carried across epochs.
#[derive(Clone, Debug, Default)]
pub struct PolicyState {
    velocity: Option<Array2<f64>>,
}

impl PolicyState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn velocity(&self) -> Option<&Array2<f64>> {
        self.velocity.as_ref()
    }

    fn velocity_for(&mut self, shape: (usize, usize)) -> &mut Array2<f64> {
        let needs_reset = self.velocity.as_ref().map_or(true, |v| v.dim() != shape);
        if needs_reset {
            self.velocity = Some(Array2::zeros(shape));
        }
        self.velocity.get_or_insert_with(|| Array2::zeros(shape))
    }
}

/// `stepsize / global_index`, the Robbins-Monro step for the 1-based absolute
/// sample index.
#[inline]
pub fn robbins_monro_step(stepsize: f64, global_index: u64) -> f64 {
    stepsize / global_index.max(1) as f64
}

impl SchedulingPolicy {
    /// Resolves a policy by name: `robbins-monro`, `momentum`, `nag`, `adagrad`.
    pub fn from_name(name: &str, decay: f64, epsilon: f64) -> Result<Self, ThreadSafeStdError> {
        let policy = match name.trim().to_ascii_lowercase().as_str() {
            "robbins-monro" => SchedulingPolicy::RobbinsMonro,
            "momentum" => SchedulingPolicy::Momentum { decay },
            "nag" => SchedulingPolicy::Nesterov { decay },
            "adagrad" => SchedulingPolicy::Adagrad { epsilon },
            _ => {
                return Err(Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!(
                        "Unknown scheduling policy scheduling=\"{}\"; expected one of robbins-monro, momentum, nag, adagrad.",
                        name
                    ),
                )))
            }
        };
        match policy {
            SchedulingPolicy::Momentum { decay } | SchedulingPolicy::Nesterov { decay }
                if !(decay.is_finite() && (0.0..1.0).contains(&decay)) =>
            {
                Err(format!("momentum_decay={} must lie in [0, 1) for {}.", decay, policy.name()).into())
            }
            SchedulingPolicy::Adagrad { epsilon } if !(epsilon.is_finite() && epsilon > 0.0) => {
                Err(format!("adagrad_epsilon={} must be finite and positive.", epsilon).into())
            }
            _ => Ok(policy),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SchedulingPolicy::RobbinsMonro => "robbins-monro",
            SchedulingPolicy::Momentum { .. } => "momentum",
            SchedulingPolicy::Nesterov { .. } => "nag",
            SchedulingPolicy::Adagrad { .. } => "adagrad",
        }
    }

    /// Produces the increment for one sample.
    ///
    /// `gradient_at(point, scale)` returns the per-sample gradient at `point`
    /// scaled by `scale`; NAG calls it at the look-ahead point, the others at
    /// `basis`. The increment is added to the basis before retraction.
    pub fn apply<F>(
        &self,
        state: &mut PolicyState,
        basis: ArrayView2<f64>,
        stepsize: f64,
        global_index: u64,
        mut gradient_at: F,
    ) -> Array2<f64>
    where
        F: FnMut(ArrayView2<f64>, f64) -> Array2<f64>,
    {
        match *self {
            SchedulingPolicy::RobbinsMonro => gradient_at(basis, robbins_monro_step(stepsize, global_index)),
            SchedulingPolicy::Momentum { decay } => {
                let gradient = gradient_at(basis, stepsize);
                let velocity = state.velocity_for(basis.dim());
                velocity.mapv_inplace(|v| v * decay);
                *velocity += &gradient;
                velocity.clone()
            }
            SchedulingPolicy::Nesterov { decay } => {
                let velocity = state.velocity_for(basis.dim());
                let lookahead = &basis - &(&*velocity * decay);
                let gradient = gradient_at(lookahead.view(), stepsize);
                velocity.mapv_inplace(|v| v * decay);
                *velocity += &gradient;
                velocity.clone()
            }
            SchedulingPolicy::Adagrad { epsilon } => {
                let gradient = gradient_at(basis, 1.0);
                let accumulator = state.velocity_for(basis.dim());
                Zip::from(&mut *accumulator).and(&gradient).for_each(|acc, &g| *acc += g * g);
                let mut increment = gradient;
                Zip::from(&mut increment)
                    .and(&*accumulator)
                    .for_each(|g, &acc| *g = stepsize * *g / (acc.sqrt() + epsilon));
                increment
            }
        }
    }
}
