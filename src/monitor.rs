// src/monitor.rs

use crate::normalize::RowNormalizer;
use crate::output::StopReason;
use crate::stream::{NormalizedRows, RowStream};
use crate::ThreadSafeStdError;
use log::{debug, warn};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// A snapshot of the basis handed to a [`CheckpointSink`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: usize,
    /// Absolute 1-based sample index at which the snapshot was taken.
    pub sample: u64,
    pub basis: Array2<f64>,
    pub reconstruction_error: Option<f64>,
    /// Set on the snapshot taken after the last update of the run.
    pub is_final: bool,
}

/// Receives periodic basis snapshots and reconstruction errors.
pub trait CheckpointSink {
    fn record(&mut self, checkpoint: &Checkpoint) -> Result<(), ThreadSafeStdError>;
}

/// Discards every checkpoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCheckpoints;

impl CheckpointSink for NoCheckpoints {
    fn record(&mut self, _checkpoint: &Checkpoint) -> Result<(), ThreadSafeStdError> {
        Ok(())
    }
}

/// Writes one bincode file per checkpoint into an existing directory.
#[derive(Debug)]
pub struct DirectoryCheckpointSink {
    directory: PathBuf,
    written: Vec<PathBuf>,
}

impl DirectoryCheckpointSink {
    pub fn new<P: AsRef<Path>>(directory: P) -> Result<Self, ThreadSafeStdError> {
        let directory = directory.as_ref().to_path_buf();
        if !directory.is_dir() {
            return Err(format!("Checkpoint directory {:?} does not exist.", directory).into());
        }
        Ok(DirectoryCheckpointSink { directory, written: Vec::new() })
    }

    /// Paths written so far, in order.
    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }
}

impl CheckpointSink for DirectoryCheckpointSink {
    fn record(&mut self, checkpoint: &Checkpoint) -> Result<(), ThreadSafeStdError> {
        let file_name = if checkpoint.is_final {
            "checkpoint_final.bin".to_string()
        } else {
            format!("checkpoint_{:012}.bin", checkpoint.sample)
        };
        let path = self.directory.join(file_name);
        let mut staging = NamedTempFile::new_in(&self.directory)
            .map_err(|e| format!("Failed to create a temporary file in {:?}: {}", self.directory, e))?;
        {
            let mut writer = BufWriter::new(staging.as_file_mut());
            bincode::serde::encode_into_std_write(checkpoint, &mut writer, bincode::config::standard())
                .map_err(|e| format!("Failed to serialize checkpoint: {}", e))?;
            writer.flush().map_err(|e| format!("Failed to write checkpoint {:?}: {}", path, e))?;
        }
        staging
            .persist(&path)
            .map_err(|e| format!("Failed to move checkpoint into place at {:?}: {}", path, e.error))?;
        debug!("Wrote checkpoint for sample {} to {:?}", checkpoint.sample, path);
        self.written.push(path);
        Ok(())
    }
}

/// Reads a checkpoint written by [`DirectoryCheckpointSink`].
pub fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<Checkpoint, ThreadSafeStdError> {
    let file = File::open(path.as_ref())
        .map_err(|e| format!("Failed to open checkpoint at {:?}: {}", path.as_ref(), e))?;
    let mut reader = BufReader::new(file);
    let checkpoint: Checkpoint = bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
        .map_err(|e| format!("Failed to deserialize checkpoint: {}", e))?;
    Ok(checkpoint)
}

/// Mean squared reconstruction error `‖x − W Wᵗ x‖²` over the first `limit`
/// rows (all rows when `None`).
pub fn reconstruction_error(
    source: &dyn RowStream,
    normalizer: &RowNormalizer,
    basis: ArrayView2<f64>,
    limit: Option<usize>,
) -> Result<f64, ThreadSafeStdError> {
    let mut pass = NormalizedRows::new(source, normalizer);
    if let Some(limit) = limit {
        pass = pass.with_limit(limit);
    }
    let mut total = 0.0;
    let visited = pass.for_each_sample(|_, _, x| {
        let coefficients = x.dot(&basis);
        let residual = &x - &basis.dot(&coefficients);
        total += residual.dot(&residual);
        Ok(ControlFlow::Continue(()))
    })?;
    if visited == 0 {
        return Err("Reconstruction error needs at least one row.".into());
    }
    Ok(total / visited as f64)
}

/// Identifies the run in fatal messages.
#[derive(Clone, Debug)]
pub struct RunLabel {
    pub algorithm: String,
    pub scheduling: Option<String>,
    pub stepsize: f64,
}

/// Result of an evaluation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MonitorSignal {
    Continue,
    Stop(StopReason),
}

/// Periodic NaN/Inf checks (fatal) and reconstruction-error bounds (advisory).
#[derive(Clone, Debug)]
pub struct ConvergenceMonitor {
    label: RunLabel,
    check_frequency: usize,
    eval_frequency: Option<usize>,
    stop_lower: f64,
    stop_upper: f64,
    previous_error: Option<f64>,
    last_error: Option<f64>,
}

impl ConvergenceMonitor {
    pub fn new(
        label: RunLabel,
        check_frequency: usize,
        eval_frequency: Option<usize>,
        stop_lower: f64,
        stop_upper: f64,
    ) -> Self {
        ConvergenceMonitor {
            label,
            check_frequency: check_frequency.max(1),
            eval_frequency,
            stop_lower,
            stop_upper,
            previous_error: None,
            last_error: None,
        }
    }

    /// `samples_done` counts updates since the run started.
    pub fn is_check_due(&self, samples_done: u64) -> bool {
        samples_done % self.check_frequency as u64 == 0
    }

    pub fn is_evaluation_due(&self, samples_done: u64) -> bool {
        self.eval_frequency.map_or(false, |f| samples_done % f as u64 == 0)
    }

    pub fn last_error(&self) -> Option<f64> {
        self.last_error
    }

    /// Fails if any entry of `basis` is NaN or infinite.
    pub fn check_finite(&self, basis: ArrayView2<f64>, epoch: usize, sample: u64) -> Result<(), ThreadSafeStdError> {
        if let Some(position) = basis.iter().position(|v| !v.is_finite()) {
            let d = basis.ncols().max(1);
            let scheduling = self
                .label
                .scheduling
                .as_ref()
                .map(|s| format!(", scheduling=\"{}\"", s))
                .unwrap_or_default();
            return Err(format!(
                "Basis became non-finite at entry ({}, {}) after sample {} in epoch {} \
                 (algorithm={}{}, stepsize={:e}); the stepsize is likely too large.",
                position / d,
                position % d,
                sample,
                epoch,
                self.label.algorithm,
                scheduling,
                self.label.stepsize
            )
            .into());
        }
        Ok(())
    }

    /// Records a new reconstruction error and compares its relative change with the bounds.
    pub fn observe_error(&mut self, error: f64, sample: u64) -> MonitorSignal {
        self.last_error = Some(error);
        let previous = match self.previous_error.replace(error) {
            Some(previous) => previous,
            None => {
                debug!("Reconstruction error at sample {}: {:.6e}", sample, error);
                return MonitorSignal::Continue;
            }
        };
        let relative_change = if previous == 0.0 {
            if error == 0.0 { 0.0 } else { f64::INFINITY }
        } else {
            (previous - error).abs() / previous.abs()
        };
        debug!(
            "Reconstruction error at sample {}: {:.6e} (relative change {:.3e})",
            sample, error, relative_change
        );
        if relative_change < self.stop_lower {
            warn!(
                "Stopping early at sample {}: relative change {:.3e} fell below {:.3e}.",
                sample, relative_change, self.stop_lower
            );
            MonitorSignal::Stop(StopReason::Converged { sample, relative_change })
        } else if relative_change > self.stop_upper || relative_change.is_nan() {
            warn!(
                "Stopping early at sample {}: relative change {:.3e} exceeded {:.3e}.",
                sample, relative_change, self.stop_upper
            );
            MonitorSignal::Stop(StopReason::Diverged { sample, relative_change })
        } else {
            MonitorSignal::Continue
        }
    }
}
