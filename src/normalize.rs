// src/normalize.rs

use crate::config::{NormalizationSettings, ScaleMode};
use crate::ThreadSafeStdError;
use ndarray::{Array1, ArrayView1};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Divisors smaller than this in magnitude are replaced by it.
pub const DIVISOR_EPSILON: f64 = 1e-12;

/// Applies a scale mode to a single raw value.
#[inline]
pub fn scale_value(mode: ScaleMode, pseudocount: f64, value: f64) -> f64 {
    match mode {
        ScaleMode::Raw => value,
        ScaleMode::Log => (value + pseudocount).ln(),
        ScaleMode::Sqrt => value.sqrt(),
        ScaleMode::VarianceStabilizing => value.sqrt() + (value + 1.0).sqrt(),
    }
}

#[inline]
fn guarded_divisor(divisor: f64) -> f64 {
    if divisor.abs() < DIVISOR_EPSILON {
        if divisor < 0.0 { -DIVISOR_EPSILON } else { DIVISOR_EPSILON }
    } else {
        divisor
    }
}

/// Turns a raw stream row into an analysis-ready vector.
///
/// The composition order is fixed: scale transform, column mask, row-mean
/// centering, row-variance scaling, column-sum scaling. Every step after the
/// transform is optional.
#[derive(Clone, Debug)]
pub struct RowNormalizer {
    scale: ScaleMode,
    pseudocount: f64,
    input_len: usize,
    mask: Option<Vec<usize>>,
    row_means: Option<Array1<f64>>,
    row_inv_std: Option<Array1<f64>>,
    column_divisors: Option<Array1<f64>>,
}

impl RowNormalizer {
    /// Builds a normalizer for a stream of `n_rows` rows of `n_cols` values.
    ///
    /// # Errors
    /// Returns an error if a statistic vector has the wrong length, a mask index is
    /// out of range, or a mask is empty.
    pub fn new(settings: &NormalizationSettings, n_rows: usize, n_cols: usize) -> Result<Self, ThreadSafeStdError> {
        let mask = match &settings.column_mask {
            Some(indices) => {
                let mut sorted = indices.clone();
                sorted.sort_unstable();
                sorted.dedup();
                if sorted.is_empty() {
                    return Err("column_mask must keep at least one column.".into());
                }
                if let Some(&last) = sorted.last() {
                    if last >= n_cols {
                        return Err(format!(
                            "column_mask index {} is out of range for {} columns.",
                            last, n_cols
                        )
                        .into());
                    }
                }
                Some(sorted)
            }
            None => None,
        };

        if let Some(means) = &settings.row_means {
            if means.len() != n_rows {
                return Err(format!("row_means has length {} but the stream has {} rows.", means.len(), n_rows).into());
            }
        }
        let row_inv_std = match &settings.row_variances {
            Some(variances) => {
                if variances.len() != n_rows {
                    return Err(format!(
                        "row_variances has length {} but the stream has {} rows.",
                        variances.len(),
                        n_rows
                    )
                    .into());
                }
                if variances.iter().any(|&v| !v.is_finite() || v < 0.0) {
                    return Err("row_variances must be finite and non-negative.".into());
                }
                Some(variances.mapv(|v| 1.0 / guarded_divisor(v.sqrt())))
            }
            None => None,
        };
        let column_divisors = match &settings.column_sums {
            Some(sums) => {
                if sums.len() != n_cols {
                    return Err(format!(
                        "column_sums has length {} but the stream has {} columns.",
                        sums.len(),
                        n_cols
                    )
                    .into());
                }
                let kept: Array1<f64> = match &mask {
                    Some(indices) => indices.iter().map(|&j| sums[j]).collect(),
                    None => sums.clone(),
                };
                Some(kept.mapv(guarded_divisor))
            }
            None => None,
        };

        Ok(RowNormalizer {
            scale: settings.scale,
            pseudocount: settings.pseudocount,
            input_len: n_cols,
            mask,
            row_means: settings.row_means.clone(),
            row_inv_std,
            column_divisors,
        })
    }

    /// Length of the raw rows this normalizer accepts.
    pub fn input_len(&self) -> usize {
        self.input_len
    }

    /// Length of normalized rows (the masked width).
    pub fn output_len(&self) -> usize {
        self.mask.as_ref().map_or(self.input_len, |m| m.len())
    }

    pub fn scale_mode(&self) -> ScaleMode {
        self.scale
    }

    /// True when the transform maps 0 to 0, so sparse entries stay implicit.
    pub fn is_zero_preserving(&self) -> bool {
        scale_value(self.scale, self.pseudocount, 0.0) == 0.0
    }

    pub fn row_mean(&self, row_index: usize) -> f64 {
        self.row_means.as_ref().map_or(0.0, |m| m[row_index])
    }

    pub fn has_row_means(&self) -> bool {
        self.row_means.is_some()
    }

    /// Reciprocal column divisors, if column-sum scaling is active.
    pub fn column_factors(&self) -> Option<Array1<f64>> {
        self.column_divisors.as_ref().map(|d| d.mapv(|v| 1.0 / v))
    }

    /// Applies the scale transform and the column-sum scaling to a single value of
    /// column `col`. Used by chunked paths that center lazily.
    #[inline]
    pub fn scale_and_divide(&self, col: usize, value: f64) -> f64 {
        let scaled = scale_value(self.scale, self.pseudocount, value);
        match &self.column_divisors {
            Some(divisors) => scaled / divisors[col],
            None => scaled,
        }
    }

    /// Normalizes row `row_index` of the stream.
    pub fn normalize(&self, row_index: usize, raw: ArrayView1<f64>) -> Result<Array1<f64>, ThreadSafeStdError> {
        if raw.len() != self.input_len {
            return Err(format!(
                "Row {} has {} values, expected {}.",
                row_index,
                raw.len(),
                self.input_len
            )
            .into());
        }
        let mut values: Array1<f64> = match &self.mask {
            Some(indices) => indices
                .iter()
                .map(|&j| scale_value(self.scale, self.pseudocount, raw[j]))
                .collect(),
            None => raw.mapv(|v| scale_value(self.scale, self.pseudocount, v)),
        };
        if let Some(means) = &self.row_means {
            let mean = means[row_index];
            values.mapv_inplace(|v| v - mean);
        }
        if let Some(inv_std) = &self.row_inv_std {
            let factor = inv_std[row_index];
            values.mapv_inplace(|v| v * factor);
        }
        if let Some(divisors) = &self.column_divisors {
            values /= divisors;
        }
        Ok(values)
    }
}

/// Reads a precomputed statistic (row means, row variances, column sums): one
/// float per entry separated by whitespace or newlines. Blank lines and lines
/// starting with `#` are skipped.
pub fn read_statistic_file<P: AsRef<Path>>(path: P) -> Result<Array1<f64>, ThreadSafeStdError> {
    let file = File::open(path.as_ref())
        .map_err(|e| format!("Failed to open statistic file {:?}: {}", path.as_ref(), e))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| format!("Failed to read {:?}: {}", path.as_ref(), e))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        for token in trimmed.split_whitespace() {
            let value: f64 = token.parse().map_err(|e| {
                format!(
                    "Invalid number \"{}\" on line {} of {:?}: {}",
                    token,
                    line_no + 1,
                    path.as_ref(),
                    e
                )
            })?;
            values.push(value);
        }
    }
    Ok(Array1::from(values))
}
