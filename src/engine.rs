// src/engine.rs

use crate::ccipca::CcipcaUpdate;
use crate::config::{Algorithm, StreamingPcaConfig};
use crate::gradient::{project_to_tangent, TangentGradient};
use crate::monitor::{reconstruction_error, Checkpoint, CheckpointSink, ConvergenceMonitor, MonitorSignal, NoCheckpoints, RunLabel};
use crate::normalize::RowNormalizer;
use crate::output::{assemble_from_stream, PcaOutput, RunSummary, StopReason};
use crate::retraction::retract;
use crate::schedule::{PolicyState, SchedulingPolicy};
use crate::stream::{NormalizedRows, RowStream, StreamCursor};
use crate::variance_reduction::VarianceReducedDriver;
use crate::ThreadSafeStdError;
use log::{debug, info, warn};
use ndarray::{Array2, ArrayView1};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::ops::ControlFlow;
use std::time::Instant;

/// Everything that evolves sample by sample, owned by one run.
#[derive(Clone, Debug)]
pub struct OptimizationContext {
    /// Current basis, shape (M, d). For CCIPCA these are the unnormalized estimates.
    pub basis: Array2<f64>,
    pub policy_state: PolicyState,
    pub cursor: StreamCursor,
}

impl OptimizationContext {
    pub fn new(basis: Array2<f64>, n_rows: usize) -> Self {
        OptimizationContext {
            basis,
            policy_state: PolicyState::new(),
            cursor: StreamCursor::new(n_rows),
        }
    }
}

/// One algorithm's per-sample update rule.
pub trait SampleUpdate {
    /// Runs before each epoch's stochastic pass. `rows` is the full normalized stream.
    fn begin_epoch(&mut self, _context: &mut OptimizationContext, _rows: &NormalizedRows<'_>) -> Result<(), ThreadSafeStdError> {
        Ok(())
    }

    /// Applies one sample. The cursor already points at this sample.
    fn update(&mut self, context: &mut OptimizationContext, sample: ArrayView1<f64>) -> Result<(), ThreadSafeStdError>;

    /// The orthonormal basis the run currently represents.
    fn orthonormal_basis(&self, context: &OptimizationContext) -> Result<Array2<f64>, ThreadSafeStdError> {
        Ok(context.basis.clone())
    }
}

/// Oja and RSGD: a scheduled stochastic gradient step followed by retraction.
#[derive(Clone, Debug)]
pub struct StochasticUpdate {
    gradient: TangentGradient,
    policy: SchedulingPolicy,
    stepsize: f64,
    riemannian: bool,
}

impl StochasticUpdate {
    pub fn new(gradient: TangentGradient, policy: SchedulingPolicy, stepsize: f64, riemannian: bool) -> Self {
        StochasticUpdate { gradient, policy, stepsize, riemannian }
    }
}

impl SampleUpdate for StochasticUpdate {
    fn update(&mut self, context: &mut OptimizationContext, sample: ArrayView1<f64>) -> Result<(), ThreadSafeStdError> {
        let global_index = context.cursor.global_index();
        let gradient = &self.gradient;
        let riemannian = self.riemannian;
        let increment = self.policy.apply(
            &mut context.policy_state,
            context.basis.view(),
            self.stepsize,
            global_index,
            |point, scale| {
                let euclidean = gradient.compute(point, sample, scale);
                if riemannian {
                    project_to_tangent(point, &euclidean)
                } else {
                    euclidean
                }
            },
        );
        let updated = &context.basis + &increment;
        context.basis = retract(updated)?;
        Ok(())
    }
}

/// Streaming PCA by stochastic optimization over a restartable row stream.
///
/// ```no_run
/// use streaming_pca::{InMemoryRows, StreamingPca, StreamingPcaConfig};
/// # fn main() -> Result<(), streaming_pca::ThreadSafeStdError> {
/// let rows = InMemoryRows::new(ndarray::Array2::<f64>::eye(6));
/// let config = StreamingPcaConfig { num_components: 2, ..Default::default() };
/// let output = StreamingPca::new(config)?.fit(&rows)?;
/// println!("{:?}", output.eigenvalues);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct StreamingPca {
    config: StreamingPcaConfig,
    policy: SchedulingPolicy,
}

impl StreamingPca {
    /// Validates the configuration. Every dimension-independent error surfaces here.
    pub fn new(config: StreamingPcaConfig) -> Result<Self, ThreadSafeStdError> {
        config.validate()?;
        let policy = config.scheduling_policy()?;
        if !config.algorithm.uses_scheduling() && policy != SchedulingPolicy::RobbinsMonro {
            warn!(
                "scheduling=\"{}\" is ignored by {}; it has its own step rule.",
                config.scheduling, config.algorithm
            );
        }
        Ok(StreamingPca { config, policy })
    }

    pub fn config(&self) -> &StreamingPcaConfig {
        &self.config
    }

    pub fn fit(&self, source: &dyn RowStream) -> Result<PcaOutput, ThreadSafeStdError> {
        self.fit_with_checkpoints(source, &mut NoCheckpoints)
    }

    /// Runs every epoch (or until the monitor stops the run) and assembles the output.
    /// Checkpoints go to `sink` at every evaluation and once at the end.
    pub fn fit_with_checkpoints(
        &self,
        source: &dyn RowStream,
        sink: &mut dyn CheckpointSink,
    ) -> Result<PcaOutput, ThreadSafeStdError> {
        let config = &self.config;
        let (n_rows, n_cols) = source.dimensions();
        if n_rows == 0 || n_cols == 0 {
            return Err(format!("Cannot run PCA on an empty {}x{} stream.", n_rows, n_cols).into());
        }
        let normalizer = RowNormalizer::new(&config.normalization, n_rows, n_cols)?;
        let n_features = normalizer.output_len();
        let d = config.num_components;
        if d > n_features {
            return Err(format!(
                "num_components={} exceeds the {} features available after masking.",
                d, n_features
            )
            .into());
        }
        if config.permute && !source.supports_random_access() {
            return Err("permute=true requires a stream with random row access.".into());
        }

        info!(
            "Starting {} with d={} on a {}x{} stream (features after masking: {}), {} epoch(s), stepsize={}",
            config.algorithm, d, n_rows, n_cols, n_features, config.num_epochs, config.stepsize
        );
        let run_start = Instant::now();

        let (initial, seeded) = self.initial_basis(source, &normalizer, n_rows, n_features)?;
        let mut context = OptimizationContext::new(initial, n_rows);
        let gradient = TangentGradient::new(d, n_features, config.numeric_offset);
        let mut updater: Box<dyn SampleUpdate> = match config.algorithm {
            Algorithm::Oja | Algorithm::Rsgd => Box::new(StochasticUpdate::new(
                gradient,
                self.policy,
                config.stepsize,
                config.algorithm.is_riemannian(),
            )),
            Algorithm::Ccipca => Box::new(CcipcaUpdate::new(config.stepsize, d, seeded)),
            Algorithm::Svrg | Algorithm::Rsvrg => Box::new(VarianceReducedDriver::new(
                gradient,
                self.policy,
                config.stepsize,
                config.algorithm.is_riemannian(),
            )),
        };

        let label = RunLabel {
            algorithm: config.algorithm.name().to_string(),
            scheduling: config.algorithm.uses_scheduling().then(|| self.policy.name().to_string()),
            stepsize: config.stepsize,
        };
        let mut monitor = ConvergenceMonitor::new(
            label,
            config.check_frequency,
            config.eval_frequency,
            config.stop_lower,
            config.stop_upper,
        );

        let mut samples_done: u64 = 0;
        let mut epochs_completed = 0usize;
        let mut stop_reason = StopReason::Completed;

        for epoch in 1..=config.num_epochs {
            let epoch_start = Instant::now();
            context.cursor.start_epoch(epoch);

            updater.begin_epoch(&mut context, &NormalizedRows::new(source, &normalizer))?;

            let order: Option<Vec<usize>> = config.permute.then(|| {
                let mut order: Vec<usize> = (0..n_rows).collect();
                let mut rng = ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(epoch as u64));
                order.shuffle(&mut rng);
                order
            });
            let mut rows = NormalizedRows::new(source, &normalizer);
            if let Some(order) = order.as_deref() {
                rows = rows.with_order(order);
            }

            let mut early_stop: Option<StopReason> = None;
            rows.for_each_sample(|_, _, sample| {
                let global_index = context.cursor.global_index();
                updater.update(&mut context, sample)?;
                context.cursor.advance();
                samples_done += 1;

                if monitor.is_check_due(samples_done) {
                    monitor.check_finite(context.basis.view(), epoch, global_index)?;
                }
                if monitor.is_evaluation_due(samples_done) {
                    let basis = updater.orthonormal_basis(&context)?;
                    monitor.check_finite(basis.view(), epoch, global_index)?;
                    let error = reconstruction_error(source, &normalizer, basis.view(), config.eval_rows)?;
                    sink.record(&Checkpoint {
                        epoch,
                        sample: global_index,
                        basis,
                        reconstruction_error: Some(error),
                        is_final: false,
                    })?;
                    if let MonitorSignal::Stop(reason) = monitor.observe_error(error, global_index) {
                        early_stop = Some(reason);
                        return Ok(ControlFlow::Break(()));
                    }
                }
                Ok(ControlFlow::Continue(()))
            })?;
            monitor.check_finite(context.basis.view(), epoch, samples_done)?;

            if let Some(reason) = early_stop {
                stop_reason = reason;
                break;
            }
            epochs_completed = epoch;
            info!(
                "Epoch {}/{} of {} finished in {:.3?} ({} samples so far)",
                epoch,
                config.num_epochs,
                config.algorithm,
                epoch_start.elapsed(),
                samples_done
            );
        }

        let basis = updater.orthonormal_basis(&context)?;
        monitor.check_finite(basis.view(), context.cursor.epoch(), samples_done)?;
        sink.record(&Checkpoint {
            epoch: context.cursor.epoch(),
            sample: samples_done,
            basis: basis.clone(),
            reconstruction_error: monitor.last_error(),
            is_final: true,
        })?;

        let output = assemble_from_stream(
            source,
            &normalizer,
            basis,
            RunSummary { stop_reason, epochs_completed, samples_processed: samples_done },
        )?;
        info!(
            "{} finished in {:.3?}: {} samples, stop reason {:?}",
            config.algorithm,
            run_start.elapsed(),
            samples_done,
            output.stop_reason
        );
        Ok(output)
    }

    /// Initial basis and whether it was supplied by the caller.
    fn initial_basis(
        &self,
        source: &dyn RowStream,
        normalizer: &RowNormalizer,
        n_rows: usize,
        n_features: usize,
    ) -> Result<(Array2<f64>, bool), ThreadSafeStdError> {
        let d = self.config.num_components;
        let keep_raw = self.config.algorithm == Algorithm::Ccipca;

        if let Some(basis) = &self.config.initial_basis {
            if basis.dim() != (n_features, d) {
                return Err(format!(
                    "initial_basis has shape {:?}, expected ({}, {}).",
                    basis.dim(),
                    n_features,
                    d
                )
                .into());
            }
            let basis = if keep_raw { basis.clone() } else { retract(basis.clone())? };
            return Ok((basis, true));
        }

        if let Some(loadings) = &self.config.initial_loadings {
            if loadings.dim() != (n_rows, d) {
                return Err(format!(
                    "initial_loadings has shape {:?}, expected ({}, {}).",
                    loadings.dim(),
                    n_rows,
                    d
                )
                .into());
            }
            debug!("Building the initial basis from loadings with one pass (W0 = Xᵗ V)");
            let mut basis = Array2::<f64>::zeros((n_features, d));
            NormalizedRows::new(source, normalizer).for_each_sample(|_, row_index, sample| {
                let weights = loadings.row(row_index);
                for (i, &value) in sample.iter().enumerate() {
                    if value != 0.0 {
                        basis.row_mut(i).scaled_add(value, &weights);
                    }
                }
                Ok(ControlFlow::Continue(()))
            })?;
            let basis = if keep_raw { basis } else { retract(basis)? };
            return Ok((basis, true));
        }

        let mut basis = Array2::<f64>::zeros((n_features, d));
        for j in 0..d {
            basis[[j, j]] = 1.0;
        }
        Ok((basis, false))
    }
}
