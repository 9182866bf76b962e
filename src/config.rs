// src/config.rs

use crate::schedule::SchedulingPolicy;
use crate::ThreadSafeStdError;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

fn invalid_config(message: String) -> ThreadSafeStdError {
    Box::new(std::io::Error::new(std::io::ErrorKind::InvalidInput, message))
}

/// Elementwise transform applied to every raw value before any other normalization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ScaleMode {
    /// Values are used as read.
    #[default]
    Raw,
    /// `ln(x + pseudocount)`.
    Log,
    /// `sqrt(x)`.
    Sqrt,
    /// Freeman-Tukey transform `sqrt(x) + sqrt(x + 1)`.
    VarianceStabilizing,
}

impl ScaleMode {
    pub fn name(&self) -> &'static str {
        match self {
            ScaleMode::Raw => "raw",
            ScaleMode::Log => "log",
            ScaleMode::Sqrt => "sqrt",
            ScaleMode::VarianceStabilizing => "ftt",
        }
    }
}

impl FromStr for ScaleMode {
    type Err = ThreadSafeStdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" => Ok(ScaleMode::Raw),
            "log" => Ok(ScaleMode::Log),
            "sqrt" => Ok(ScaleMode::Sqrt),
            "ftt" | "variance-stabilizing" => Ok(ScaleMode::VarianceStabilizing),
            other => Err(invalid_config(format!(
                "Unknown scale mode \"{}\"; expected one of raw, log, sqrt, ftt.",
                other
            ))),
        }
    }
}

/// The gradient-based streaming algorithms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Algorithm {
    /// Oja's rule: stochastic gradient ascent followed by retraction.
    #[default]
    Oja,
    /// Candid covariance-free incremental PCA.
    Ccipca,
    /// Riemannian stochastic gradient descent on the Stiefel manifold.
    Rsgd,
    /// Stochastic variance-reduced gradient.
    Svrg,
    /// Riemannian stochastic variance-reduced gradient.
    Rsvrg,
}

/// Which optional normalization inputs an algorithm accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NormalizationSupport {
    pub column_mask: bool,
    pub row_means: bool,
    pub row_variances: bool,
    pub column_sums: bool,
}

impl Algorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Oja => "oja",
            Algorithm::Ccipca => "ccipca",
            Algorithm::Rsgd => "rsgd",
            Algorithm::Svrg => "svrg",
            Algorithm::Rsvrg => "rsvrg",
        }
    }

    /// Normalization options differ between algorithm families and are kept that way.
    pub fn normalization_support(&self) -> NormalizationSupport {
        match self {
            Algorithm::Oja => NormalizationSupport {
                column_mask: false,
                row_means: true,
                row_variances: false,
                column_sums: true,
            },
            Algorithm::Ccipca => NormalizationSupport {
                column_mask: true,
                row_means: true,
                row_variances: false,
                column_sums: true,
            },
            Algorithm::Rsgd | Algorithm::Svrg | Algorithm::Rsvrg => NormalizationSupport {
                column_mask: false,
                row_means: true,
                row_variances: true,
                column_sums: true,
            },
        }
    }

    /// Whether the per-sample update goes through a `SchedulingPolicy`.
    pub fn uses_scheduling(&self) -> bool {
        !matches!(self, Algorithm::Ccipca)
    }

    /// Whether gradients are projected onto the tangent space before use.
    pub fn is_riemannian(&self) -> bool {
        matches!(self, Algorithm::Rsgd | Algorithm::Rsvrg)
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = ThreadSafeStdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "oja" => Ok(Algorithm::Oja),
            "ccipca" => Ok(Algorithm::Ccipca),
            "rsgd" => Ok(Algorithm::Rsgd),
            "svrg" => Ok(Algorithm::Svrg),
            "rsvrg" => Ok(Algorithm::Rsvrg),
            other => Err(invalid_config(format!(
                "Unknown algorithm \"{}\"; expected one of oja, ccipca, rsgd, svrg, rsvrg.",
                other
            ))),
        }
    }
}

/// Per-sample normalization inputs. Precomputed statistics come from a prior
/// full pass over the data; `None` means the step is skipped.
#[derive(Clone, Debug)]
pub struct NormalizationSettings {
    pub scale: ScaleMode,
    /// Offset used by `ScaleMode::Log` only.
    pub pseudocount: f64,
    /// Column indices to keep. Order in the output follows the input column order.
    pub column_mask: Option<Vec<usize>>,
    /// Length N; `row_means[n]` is subtracted from every entry of row n.
    pub row_means: Option<Array1<f64>>,
    /// Length N; row n is divided by `sqrt(row_variances[n])` after centering.
    pub row_variances: Option<Array1<f64>>,
    /// Length M (unmasked); every column is divided by its sum.
    pub column_sums: Option<Array1<f64>>,
}

impl Default for NormalizationSettings {
    fn default() -> Self {
        NormalizationSettings {
            scale: ScaleMode::Raw,
            pseudocount: 1.0,
            column_mask: None,
            row_means: None,
            row_variances: None,
            column_sums: None,
        }
    }
}

impl NormalizationSettings {
    /// Rejects options the given capability set does not cover.
    pub fn check_supported(&self, support: NormalizationSupport, owner: &str) -> Result<(), ThreadSafeStdError> {
        let mut rejected = Vec::new();
        if self.column_mask.is_some() && !support.column_mask {
            rejected.push("column_mask");
        }
        if self.row_means.is_some() && !support.row_means {
            rejected.push("row_means");
        }
        if self.row_variances.is_some() && !support.row_variances {
            rejected.push("row_variances");
        }
        if self.column_sums.is_some() && !support.column_sums {
            rejected.push("column_sums");
        }
        if rejected.is_empty() {
            Ok(())
        } else {
            Err(invalid_config(format!(
                "{} does not support the normalization option(s): {}.",
                owner,
                rejected.join(", ")
            )))
        }
    }

    fn check_values(&self) -> Result<(), ThreadSafeStdError> {
        if !self.pseudocount.is_finite() || self.pseudocount < 0.0 {
            return Err(invalid_config(format!(
                "pseudocount must be finite and non-negative, got {}.",
                self.pseudocount
            )));
        }
        Ok(())
    }
}

/// Configuration for the gradient-based streaming PCA engine.
#[derive(Clone, Debug)]
pub struct StreamingPcaConfig {
    pub algorithm: Algorithm,
    /// Target rank d.
    pub num_components: usize,
    /// Base learning rate. For CCIPCA this is the amnesic parameter.
    pub stepsize: f64,
    pub num_epochs: usize,
    /// One of `robbins-monro`, `momentum`, `nag`, `adagrad`.
    pub scheduling: String,
    /// Velocity decay g for momentum and NAG.
    pub momentum_decay: f64,
    /// Denominator offset for Adagrad.
    pub adagrad_epsilon: f64,
    /// Offset δ of the overflow-safe gradient. Zero selects the plain gradient.
    pub numeric_offset: f64,
    /// The basis is checked for NaN/Inf every this many samples.
    pub check_frequency: usize,
    /// Reconstruction error is evaluated every this many samples.
    pub eval_frequency: Option<usize>,
    /// Restrict reconstruction error to the first rows of the stream.
    pub eval_rows: Option<usize>,
    /// Relative change of the reconstruction error below this stops the run (converged).
    pub stop_lower: f64,
    /// Relative change above this stops the run (diverging).
    pub stop_upper: f64,
    /// Visit rows in a seeded random order every epoch.
    pub permute: bool,
    pub seed: u64,
    /// Initial basis, shape (features after masking, d).
    pub initial_basis: Option<Array2<f64>>,
    /// Initial loadings, shape (N, d). The initial basis becomes `Xᵗ V`.
    pub initial_loadings: Option<Array2<f64>>,
    pub normalization: NormalizationSettings,
}

impl Default for StreamingPcaConfig {
    fn default() -> Self {
        StreamingPcaConfig {
            algorithm: Algorithm::Oja,
            num_components: 3,
            stepsize: 0.1,
            num_epochs: 5,
            scheduling: "robbins-monro".to_string(),
            momentum_decay: 0.9,
            adagrad_epsilon: 1e-8,
            numeric_offset: 0.0,
            check_frequency: 1,
            eval_frequency: None,
            eval_rows: None,
            stop_lower: 0.0,
            stop_upper: f64::INFINITY,
            permute: false,
            seed: 2025,
            initial_basis: None,
            initial_loadings: None,
            normalization: NormalizationSettings::default(),
        }
    }
}

impl StreamingPcaConfig {
    /// Resolves the scheduling name into a policy. Unknown names are fatal.
    pub fn scheduling_policy(&self) -> Result<SchedulingPolicy, ThreadSafeStdError> {
        SchedulingPolicy::from_name(&self.scheduling, self.momentum_decay, self.adagrad_epsilon)
    }

    /// Checks every dimension-independent precondition. Shape checks against the
    /// stream happen when a run starts.
    pub fn validate(&self) -> Result<(), ThreadSafeStdError> {
        if self.num_components == 0 {
            return Err(invalid_config("num_components must be greater than 0.".to_string()));
        }
        let stepsize_ok = match self.algorithm {
            Algorithm::Ccipca => self.stepsize.is_finite() && self.stepsize >= 0.0,
            _ => self.stepsize.is_finite() && self.stepsize > 0.0,
        };
        if !stepsize_ok {
            return Err(invalid_config(format!(
                "stepsize={} is not valid for {} (must be finite and {}).",
                self.stepsize,
                self.algorithm,
                if self.algorithm == Algorithm::Ccipca { "non-negative" } else { "positive" }
            )));
        }
        if self.num_epochs == 0 {
            return Err(invalid_config("num_epochs must be at least 1.".to_string()));
        }
        // Resolved even for algorithms that ignore it, so a typo never passes silently.
        self.scheduling_policy()?;
        if !self.numeric_offset.is_finite() || self.numeric_offset < 0.0 {
            return Err(invalid_config(format!(
                "numeric_offset must be finite and non-negative, got {}.",
                self.numeric_offset
            )));
        }
        if self.check_frequency == 0 {
            return Err(invalid_config("check_frequency must be at least 1.".to_string()));
        }
        if self.eval_frequency == Some(0) {
            return Err(invalid_config("eval_frequency must be at least 1 when set.".to_string()));
        }
        if self.eval_rows == Some(0) {
            return Err(invalid_config("eval_rows must be at least 1 when set.".to_string()));
        }
        if !(self.stop_lower >= 0.0) || !(self.stop_upper > self.stop_lower) {
            return Err(invalid_config(format!(
                "stop bounds must satisfy 0 <= lower < upper, got lower={} upper={}.",
                self.stop_lower, self.stop_upper
            )));
        }
        if self.initial_basis.is_some() && self.initial_loadings.is_some() {
            return Err(invalid_config(
                "initial_basis and initial_loadings are mutually exclusive; supply at most one.".to_string(),
            ));
        }
        self.normalization.check_values()?;
        self.normalization
            .check_supported(self.algorithm.normalization_support(), self.algorithm.name())?;
        Ok(())
    }
}

/// Configuration for the chunked randomized SVD.
#[derive(Clone, Debug)]
pub struct RandomizedSvdConfig {
    /// Target rank d.
    pub num_components: usize,
    /// Extra sketch columns beyond d.
    pub oversample: usize,
    /// Number of passes used to build the range basis; all but the last renormalize by LU.
    pub num_power_iterations: usize,
    /// Rows per chunk.
    pub chunk_size: usize,
    pub seed: u64,
    pub normalization: NormalizationSettings,
}

impl Default for RandomizedSvdConfig {
    fn default() -> Self {
        RandomizedSvdConfig {
            num_components: 3,
            oversample: 10,
            num_power_iterations: 3,
            chunk_size: 1000,
            seed: 2025,
            normalization: NormalizationSettings::default(),
        }
    }
}

impl RandomizedSvdConfig {
    pub fn normalization_support() -> NormalizationSupport {
        NormalizationSupport {
            column_mask: false,
            row_means: true,
            row_variances: false,
            column_sums: true,
        }
    }

    pub fn sketch_width(&self) -> usize {
        self.num_components + self.oversample
    }

    /// Checks `0 < d <= d + oversample <= min(N, M)` and the remaining knobs.
    pub fn validate(&self, n_rows: usize, n_cols: usize) -> Result<(), ThreadSafeStdError> {
        let max_rank = n_rows.min(n_cols);
        if self.num_components == 0 || self.sketch_width() > max_rank {
            return Err(invalid_config(format!(
                "randomized SVD requires 0 < dim <= dim + oversample <= min(N, M); got dim={}, oversample={}, N={}, M={}.",
                self.num_components, self.oversample, n_rows, n_cols
            )));
        }
        if self.num_power_iterations == 0 {
            return Err(invalid_config("num_power_iterations must be at least 1.".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(invalid_config("chunk_size must be at least 1.".to_string()));
        }
        self.normalization.check_values()?;
        self.normalization
            .check_supported(Self::normalization_support(), "randomized SVD")?;
        Ok(())
    }
}
