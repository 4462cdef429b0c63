/*!
Chain storage: append-friendly, indexable sequences of parameter vectors
and of scalars, with windowed and unified file output.

A [`VectorSequence`] owns the raw chain; positions are fixed-dimension
vectors indexed by position id. [`ScalarSequence`] is the companion store
for per-position log-likelihood and log-target values. Both write
themselves in fixed windows through the sinks in [`crate::io`], carrying a
`_sub<K>` suffix per sub-environment, and can be gathered into a unified
file across sub-environments.
*/

use std::path::{Path, PathBuf};

use nalgebra::{DMatrix, DVector};

use crate::comm::{Communicator, Environment};
use crate::config::ChainFileType;
use crate::error::{McmcError, Result};
use crate::io::{csv, matlab};
use crate::stats;

fn file_ext(file_type: ChainFileType) -> &'static str {
    match file_type {
        ChainFileType::Matlab => "m",
        ChainFileType::Csv => "csv",
    }
}

fn sub_file_path(stem: &Path, sub_id: usize, file_type: ChainFileType) -> PathBuf {
    PathBuf::from(format!(
        "{}_sub{}.{}",
        stem.display(),
        sub_id,
        file_ext(file_type)
    ))
}

fn unified_file_path(stem: &Path, file_type: ChainFileType) -> PathBuf {
    PathBuf::from(format!("{}.{}", stem.display(), file_ext(file_type)))
}

fn io_err(sub_id: usize, source: std::io::Error) -> McmcError {
    McmcError::Io {
        sub_id,
        rank: 0,
        source,
    }
}

/// An ordered sequence of fixed-dimension parameter vectors.
#[derive(Debug, Clone)]
pub struct VectorSequence {
    name: String,
    dim: usize,
    positions: Vec<DVector<f64>>,
}

impl VectorSequence {
    pub fn new(dim: usize, name: &str) -> Self {
        VectorSequence {
            name: name.to_string(),
            dim,
            positions: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Resizes to `n` positions, padding with zero vectors.
    pub fn resize(&mut self, n: usize) {
        self.positions.resize_with(n, || DVector::zeros(self.dim));
    }

    pub fn set_position(&mut self, id: usize, values: &DVector<f64>) {
        assert_eq!(values.len(), self.dim, "position dimension mismatch");
        self.positions[id] = values.clone();
    }

    pub fn position(&self, id: usize) -> &DVector<f64> {
        &self.positions[id]
    }

    pub fn positions(&self) -> &[DVector<f64>] {
        &self.positions
    }

    /// Mean of the half-open window `[start, start + count)`.
    pub fn sub_mean(&self, start: usize, count: usize) -> DVector<f64> {
        let mut mean = DVector::zeros(self.dim);
        for position in &self.positions[start..start + count] {
            mean += position;
        }
        mean / count as f64
    }

    /// Unbiased sample covariance of the window `[start, start + count)`.
    pub fn sample_covariance(&self, start: usize, count: usize) -> DMatrix<f64> {
        let mean = self.sub_mean(start, count);
        let mut cov = DMatrix::zeros(self.dim, self.dim);
        for position in &self.positions[start..start + count] {
            let diff = position - &mean;
            cov += &diff * diff.transpose();
        }
        cov / (count as f64 - 1.0)
    }

    /// Keeps every `spacing`-th position starting from `initial`.
    pub fn filter(&mut self, initial: usize, spacing: usize) {
        let spacing = spacing.max(1);
        let mut kept = Vec::new();
        let mut id = initial;
        while id < self.positions.len() {
            kept.push(self.positions[id].clone());
            id += spacing;
        }
        self.positions = kept;
    }

    /// Autocorrelation-based filter spacing: the smallest lag at which
    /// every component's autocorrelation over `[initial, len)` has decayed
    /// below 0.1, capped at `len / 10`.
    pub fn compute_filter_params(&self, initial: usize) -> (usize, usize) {
        let segment = &self.positions[initial..];
        let n = segment.len();
        if n < 4 {
            return (initial, 1);
        }
        let max_lag = (n / 10).max(1);
        let mean = self.sub_mean(initial, n);
        let mut variance = DVector::zeros(self.dim);
        for position in segment {
            let diff = position - &mean;
            variance += diff.component_mul(&diff);
        }
        for lag in 1..=max_lag {
            let mut worst: f64 = 0.0;
            for j in 0..self.dim {
                if variance[j] == 0.0 {
                    continue;
                }
                let mut autocov = 0.0;
                for i in 0..n - lag {
                    autocov += (segment[i][j] - mean[j]) * (segment[i + lag][j] - mean[j]);
                }
                worst = worst.max((autocov / variance[j]).abs());
            }
            if worst < 0.1 {
                return (initial, lag);
            }
        }
        (initial, max_lag)
    }

    /// Argmax over the paired `values`: the maximum value and every
    /// position attaining it, in chain order.
    pub fn positions_of_maximum(
        &self,
        values: &ScalarSequence,
    ) -> Result<(Vec<DVector<f64>>, f64)> {
        if self.is_empty() || values.len() != self.len() {
            return Err(McmcError::EmptySequence(self.name.clone()));
        }
        let max = values
            .values()
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        let positions = self
            .positions
            .iter()
            .zip(values.values())
            .filter(|(_, &v)| v == max)
            .map(|(p, _)| p.clone())
            .collect();
        Ok((positions, max))
    }

    /// The unified counterpart: gathers values and argmax candidates from
    /// the rank-0s of all sub-environments. Returns `Some` on the gathering
    /// rank, `None` elsewhere.
    pub fn unified_positions_of_maximum<C: Communicator>(
        &self,
        values: &ScalarSequence,
        env: &Environment<C>,
    ) -> Result<Option<(Vec<DVector<f64>>, f64)>> {
        let Some(inter0) = env.inter0_comm() else {
            return Ok(None);
        };
        let (local_positions, local_max) = self.positions_of_maximum(values)?;
        let maxima = inter0.gather_f64(&[local_max]);
        let candidates = inter0.gather_rows(&local_positions);
        match (maxima, candidates) {
            (Some(maxima), Some(candidates)) => {
                let global = maxima
                    .iter()
                    .map(|m| m[0])
                    .fold(f64::NEG_INFINITY, f64::max);
                let positions = maxima
                    .iter()
                    .zip(candidates)
                    .filter(|(m, _)| m[0] == global)
                    .flat_map(|(_, p)| p)
                    .collect();
                Ok(Some((positions, global)))
            }
            _ => Ok(None),
        }
    }

    /// Brooks-Gelman potential-scale-reduction estimate over the window
    /// `[initial_position, initial_position + count)`.
    pub fn estimate_conv_brooks_gelman(&self, initial_position: usize, count: usize) -> f64 {
        stats::brooks_gelman(&self.positions[initial_position..initial_position + count])
    }

    /// Writes the half-open window `[start, start + count)` to the
    /// sub-environment's own file (`<stem>_sub<K>`).
    pub fn sub_write_contents(
        &self,
        start: usize,
        count: usize,
        stem: &Path,
        file_type: ChainFileType,
        sub_id: usize,
    ) -> Result<()> {
        let path = sub_file_path(stem, sub_id, file_type);
        let rows = &self.positions[start..start + count];
        match file_type {
            ChainFileType::Matlab => {
                let var = format!("{}_sub{}", self.name, sub_id);
                matlab::append_vector_window(&path, &var, self.len(), self.dim, start, rows)
            }
            ChainFileType::Csv => csv::append_window(&path, self.dim, start, rows),
        }
        .map_err(|e| io_err(sub_id, e))
    }

    /// Gathers the chains of all sub-environments at the unified root and
    /// writes them as one `<name>_unified` variable (`<stem>.<ext>`).
    pub fn unified_write_contents<C: Communicator>(
        &self,
        stem: &Path,
        file_type: ChainFileType,
        env: &Environment<C>,
    ) -> Result<()> {
        let Some(inter0) = env.inter0_comm() else {
            return Ok(());
        };
        let Some(gathered) = inter0.gather_rows(&self.positions) else {
            return Ok(());
        };
        let rows: Vec<DVector<f64>> = gathered.into_iter().flatten().collect();
        let path = unified_file_path(stem, file_type);
        match file_type {
            ChainFileType::Matlab => {
                let var = format!("{}_unified", self.name);
                matlab::append_vector_window(&path, &var, rows.len(), self.dim, 0, &rows)
            }
            ChainFileType::Csv => csv::append_window(&path, self.dim, 0, &rows),
        }
        .map_err(|e| io_err(env.sub_id(), e))
    }

    /// Reads the first `expected_len` positions from a previously written
    /// MATLAB-format file.
    pub fn unified_read_contents(&mut self, path: &Path, expected_len: usize) -> Result<()> {
        let (_, rows) = matlab::read_vector_sequence(path)?;
        if rows.len() < expected_len {
            return Err(McmcError::MalformedChainFile {
                path: path.to_path_buf(),
                reason: format!("file holds {} positions, need {expected_len}", rows.len()),
            });
        }
        for row in &rows {
            if row.len() != self.dim {
                return Err(McmcError::DimensionMismatch {
                    expected: self.dim,
                    actual: row.len(),
                });
            }
        }
        self.positions = rows.into_iter().take(expected_len).collect();
        Ok(())
    }
}

/// An ordered sequence of scalars, index-aligned with a chain.
#[derive(Debug, Clone)]
pub struct ScalarSequence {
    name: String,
    values: Vec<f64>,
}

impl ScalarSequence {
    pub fn new(name: &str) -> Self {
        ScalarSequence {
            name: name.to_string(),
            values: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn resize(&mut self, n: usize) {
        self.values.resize(n, 0.0);
    }

    pub fn set_value(&mut self, id: usize, value: f64) {
        self.values[id] = value;
    }

    pub fn value(&self, id: usize) -> f64 {
        self.values[id]
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn filter(&mut self, initial: usize, spacing: usize) {
        let spacing = spacing.max(1);
        let mut kept = Vec::new();
        let mut id = initial;
        while id < self.values.len() {
            kept.push(self.values[id]);
            id += spacing;
        }
        self.values = kept;
    }

    pub fn sub_write_contents(
        &self,
        start: usize,
        count: usize,
        stem: &Path,
        file_type: ChainFileType,
        sub_id: usize,
    ) -> Result<()> {
        let path = sub_file_path(stem, sub_id, file_type);
        let window = &self.values[start..start + count];
        match file_type {
            ChainFileType::Matlab => {
                let var = format!("{}_sub{}", self.name, sub_id);
                matlab::append_scalar_window(&path, &var, self.len(), start, window)
            }
            ChainFileType::Csv => csv::append_scalar_window(&path, start, window),
        }
        .map_err(|e| io_err(sub_id, e))
    }

    pub fn unified_write_contents<C: Communicator>(
        &self,
        stem: &Path,
        file_type: ChainFileType,
        env: &Environment<C>,
    ) -> Result<()> {
        let Some(inter0) = env.inter0_comm() else {
            return Ok(());
        };
        let Some(gathered) = inter0.gather_f64(&self.values) else {
            return Ok(());
        };
        let all: Vec<f64> = gathered.into_iter().flatten().collect();
        let path = unified_file_path(stem, file_type);
        match file_type {
            ChainFileType::Matlab => {
                let var = format!("{}_unified", self.name);
                matlab::append_scalar_window(&path, &var, all.len(), 0, &all)
            }
            ChainFileType::Csv => csv::append_scalar_window(&path, 0, &all),
        }
        .map_err(|e| io_err(env.sub_id(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::dvector;
    use tempfile::TempDir;

    fn ramp_sequence(n: usize) -> VectorSequence {
        let mut seq = VectorSequence::new(2, "chain");
        seq.resize(n);
        for i in 0..n {
            seq.set_position(i, &dvector![i as f64, 2.0 * i as f64]);
        }
        seq
    }

    #[test]
    fn resize_pads_with_zeros() {
        let mut seq = VectorSequence::new(3, "chain");
        seq.resize(5);
        assert_eq!(seq.len(), 5);
        assert_eq!(seq.position(4), &dvector![0.0, 0.0, 0.0]);
    }

    #[test]
    fn filter_keeps_every_spacing_th() {
        let mut seq = ramp_sequence(10);
        seq.filter(2, 3);
        // Kept ids: 2, 5, 8.
        assert_eq!(seq.len(), 3);
        assert_eq!(seq.position(0)[0], 2.0);
        assert_eq!(seq.position(1)[0], 5.0);
        assert_eq!(seq.position(2)[0], 8.0);
    }

    #[test]
    fn sub_mean_and_covariance() {
        let mut seq = VectorSequence::new(1, "chain");
        seq.resize(4);
        for (i, v) in [1.0, 3.0, 5.0, 7.0].iter().enumerate() {
            seq.set_position(i, &dvector![*v]);
        }
        assert_abs_diff_eq!(seq.sub_mean(0, 4)[0], 4.0, epsilon = 1e-12);
        // Sample variance of {1,3,5,7}.
        assert_abs_diff_eq!(seq.sample_covariance(0, 4)[(0, 0)], 20.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn positions_of_maximum_reports_ties_in_order() {
        let seq = ramp_sequence(4);
        let mut values = ScalarSequence::new("logTargets");
        values.resize(4);
        for (i, v) in [0.5, 2.0, 2.0, -1.0].iter().enumerate() {
            values.set_value(i, *v);
        }
        let (positions, max) = seq.positions_of_maximum(&values).unwrap();
        assert_eq!(max, 2.0);
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0][0], 1.0);
        assert_eq!(positions[1][0], 2.0);
    }

    #[test]
    fn windowed_sub_write_round_trips() {
        let dir = TempDir::new().unwrap();
        let stem = dir.path().join("rawChain");
        let seq = ramp_sequence(10);
        for window in 0..5 {
            seq.sub_write_contents(window * 2, 2, &stem, ChainFileType::Matlab, 0)
                .unwrap();
        }
        let mut read_back = VectorSequence::new(2, "chain");
        read_back
            .unified_read_contents(&sub_file_path(&stem, 0, ChainFileType::Matlab), 10)
            .unwrap();
        assert_eq!(read_back.positions(), seq.positions());
    }

    #[test]
    fn unified_write_single_env_round_trips() {
        let dir = TempDir::new().unwrap();
        let stem = dir.path().join("rawChain");
        let seq = ramp_sequence(6);
        let env = Environment::single();
        seq.unified_write_contents(&stem, ChainFileType::Matlab, &env)
            .unwrap();
        let (name, rows) = matlab::read_vector_sequence(&unified_file_path(
            &stem,
            ChainFileType::Matlab,
        ))
        .unwrap();
        assert_eq!(name, "chain_unified");
        assert_eq!(rows.len(), 6);
        assert_eq!(&rows[3], seq.position(3));
    }

    #[test]
    fn filter_spacing_short_circuit_on_tiny_chains() {
        let seq = ramp_sequence(3);
        assert_eq!(seq.compute_filter_params(0), (0, 1));
    }

    #[test]
    fn filter_spacing_detects_independence() {
        // Alternating series decorrelates immediately.
        let mut seq = VectorSequence::new(1, "chain");
        seq.resize(100);
        for i in 0..100 {
            seq.set_position(i, &dvector![if i % 2 == 0 { 1.0 } else { -1.0 }]);
        }
        let (_, spacing) = seq.compute_filter_params(0);
        assert!(spacing >= 1);
    }

    #[test]
    fn scalar_sequence_filter_and_write() {
        let dir = TempDir::new().unwrap();
        let stem = dir.path().join("logTargets");
        let mut values = ScalarSequence::new("logTargets");
        values.resize(6);
        for i in 0..6 {
            values.set_value(i, i as f64);
        }
        values
            .sub_write_contents(0, 6, &stem, ChainFileType::Matlab, 1)
            .unwrap();
        let (name, rows) =
            matlab::read_vector_sequence(&sub_file_path(&stem, 1, ChainFileType::Matlab)).unwrap();
        assert_eq!(name, "logTargets_sub1");
        assert_eq!(rows[5][0], 5.0);

        values.filter(1, 2);
        assert_eq!(values.values(), &[1.0, 3.0, 5.0]);
    }
}
