//! Running chain statistics and the Brooks-Gelman convergence estimate.

use nalgebra::DVector;
use ndarray::{Array1, Array2, Axis};
use ndarray_stats::QuantileExt;

/// Streaming mean/variance tracker over chain positions.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainTracker {
    n: usize,
    mean: Array1<f64>,
    mean_sq: Array1<f64>,
    n_params: usize,
}

impl ChainTracker {
    pub fn new(n_params: usize) -> Self {
        Self {
            n: 0,
            mean: Array1::zeros(n_params),
            mean_sq: Array1::zeros(n_params),
            n_params,
        }
    }

    pub fn count(&self) -> usize {
        self.n
    }

    pub fn step(&mut self, x: &[f64]) {
        assert_eq!(x.len(), self.n_params, "tracker dimension mismatch");
        self.n += 1;
        let n = self.n as f64;
        let x_arr = Array1::from_iter(x.iter().copied());
        self.mean = (&self.mean * (n - 1.0) + &x_arr) / n;
        if self.n == 1 {
            self.mean_sq = x_arr.mapv(|v| v * v);
        } else {
            self.mean_sq = (&self.mean_sq * (n - 1.0) + x_arr.mapv(|v| v * v)) / n;
        }
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    /// Unbiased per-component sample variance.
    pub fn sm2(&self) -> Array1<f64> {
        let n = self.n as f64;
        (&self.mean_sq - &self.mean.mapv(|v| v * v)) * n / (n - 1.0)
    }
}

/// Brooks-Gelman potential-scale-reduction estimate over one chain
/// segment, using its two halves as pseudo-chains. Values near 1 indicate
/// the segment mixes; returns NaN for segments too short to split.
pub fn brooks_gelman(positions: &[DVector<f64>]) -> f64 {
    let total = positions.len();
    if total < 4 {
        return f64::NAN;
    }
    let half = total / 2;
    let dim = positions[0].len();
    let to_array =
        |slice: &[DVector<f64>]| Array2::from_shape_fn((slice.len(), dim), |(i, j)| slice[i][j]);
    let first = to_array(&positions[..half]);
    let second = to_array(&positions[total - half..]);

    let n = half as f64;
    let mean1 = first.mean_axis(Axis(0)).expect("half segment is non-empty");
    let mean2 = second.mean_axis(Axis(0)).expect("half segment is non-empty");
    let var1 = first.var_axis(Axis(0), 1.0);
    let var2 = second.var_axis(Axis(0), 1.0);

    let within = (&var1 + &var2) / 2.0;
    let grand = (&mean1 + &mean2) / 2.0;
    let between = ((&mean1 - &grand).mapv(|x| x * x) + (&mean2 - &grand).mapv(|x| x * x)) * n;
    let var_est = &within * ((n - 1.0) / n) + &between / n;

    let rhat = ndarray::Zip::from(&var_est)
        .and(&within)
        .map_collect(|&v, &w| if w > 0.0 { (v / w).sqrt() } else { 1.0 });
    match rhat.max() {
        Ok(max) => *max,
        Err(_) => f64::NAN,
    }
}
