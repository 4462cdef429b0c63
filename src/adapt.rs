/*!
Adaptive-Metropolis state: the running mean and sample covariance of the
chain, plus the positive-definiteness gate that stands between the adapted
covariance and the transition kernel.

The update recurrences follow Haario et al. (2006). The first call
bootstraps the moments from a sub-chain of at least two positions; every
later call folds positions in one at a time:

```text
d     = x_i - mean
r1    = 1 - 1/g          (g = global position id of x_i, must be >= 1)
r2    = 1 / (1 + g)
cov   = r1 * cov + r2 * d d^T
mean  = mean + r2 * d
```

Feeding one chunk in a single call or split across calls reaches the same
state up to floating-point noise.
*/

use nalgebra::{Cholesky, DMatrix, DVector};

use crate::error::{McmcError, Result};

/// Running adaptation moments `(count, mean, covariance)`.
#[derive(Debug, Clone)]
pub struct AdaptState {
    count: f64,
    mean: DVector<f64>,
    cov: DMatrix<f64>,
}

impl AdaptState {
    pub fn new(dim: usize) -> Self {
        AdaptState {
            count: 0.0,
            mean: DVector::zeros(dim),
            cov: DMatrix::zeros(dim, dim),
        }
    }

    /// Number of positions folded in so far.
    pub fn count(&self) -> f64 {
        self.count
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    pub fn cov(&self) -> &DMatrix<f64> {
        &self.cov
    }

    /// Folds `sub_chain` into the moments. `first_position_id` is the
    /// global chain id of `sub_chain[0]`; it must be >= 1 on every call
    /// after the bootstrap.
    pub fn update(&mut self, sub_chain: &[DVector<f64>], first_position_id: usize) -> Result<()> {
        let m = sub_chain.len();
        if self.count == 0.0 {
            if m < 2 {
                return Err(McmcError::SubChainTooShort(m));
            }
            let m_f = m as f64;
            let dim = self.mean.len();
            let mut mean = DVector::zeros(dim);
            for position in sub_chain {
                mean += position;
            }
            mean /= m_f;

            let mut cov = &mean * mean.transpose() * (-m_f);
            for position in sub_chain {
                cov += position * position.transpose();
            }
            cov /= m_f - 1.0;

            self.mean = mean;
            self.cov = cov;
        } else {
            if m < 1 {
                return Err(McmcError::SubChainTooShort(m));
            }
            if first_position_id < 1 {
                return Err(McmcError::SubChainTooEarly(first_position_id));
            }
            for (i, position) in sub_chain.iter().enumerate() {
                let g = (first_position_id + i) as f64;
                let diff = position - &self.mean;
                let ratio1 = 1.0 - 1.0 / g;
                let ratio2 = 1.0 / (1.0 + g);
                self.cov = &self.cov * ratio1 + &diff * diff.transpose() * ratio2;
                self.mean += diff * ratio2;
            }
        }
        self.count += m as f64;
        Ok(())
    }
}

/// The positive-definiteness gate.
///
/// Attempts `chol(cov)`; on failure retries `chol(cov + epsilon * I)`.
/// Returns the matrix that passed together with a flag saying whether the
/// ridge was needed, or [`McmcError::MatrixNotPositiveDefinite`] when both
/// attempts fail — the caller then leaves the kernel covariance unchanged.
pub fn gated_cholesky(cov: &DMatrix<f64>, epsilon: f64) -> Result<(DMatrix<f64>, bool)> {
    if Cholesky::new(cov.clone()).is_some() {
        return Ok((cov.clone(), false));
    }
    let ridged = cov + DMatrix::identity(cov.nrows(), cov.ncols()) * epsilon;
    if Cholesky::new(ridged.clone()).is_some() {
        Ok((ridged, true))
    } else {
        Err(McmcError::MatrixNotPositiveDefinite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::dvector;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn random_positions(n: usize, dim: usize, seed: u64) -> Vec<DVector<f64>> {
        let mut rng = SmallRng::seed_from_u64(seed);
        (0..n)
            .map(|_| DVector::from_fn(dim, |_, _| rng.gen::<f64>() * 4.0 - 2.0))
            .collect()
    }

    #[test]
    fn bootstrap_requires_two_positions() {
        let mut state = AdaptState::new(2);
        let short = random_positions(1, 2, 0);
        assert!(matches!(
            state.update(&short, 0),
            Err(McmcError::SubChainTooShort(1))
        ));
    }

    #[test]
    fn subsequent_update_requires_positive_first_id() {
        let mut state = AdaptState::new(1);
        state.update(&random_positions(4, 1, 1), 0).unwrap();
        assert!(matches!(
            state.update(&random_positions(2, 1, 2), 0),
            Err(McmcError::SubChainTooEarly(0))
        ));
    }

    #[test]
    fn bootstrap_matches_plain_sample_moments() {
        let positions = vec![dvector![1.0, 0.0], dvector![3.0, 2.0], dvector![5.0, 4.0]];
        let mut state = AdaptState::new(2);
        state.update(&positions, 0).unwrap();
        assert_abs_diff_eq!(state.mean()[0], 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(state.mean()[1], 2.0, epsilon = 1e-12);
        // Sample covariance of {1,3,5} is 4, and the components co-move
        // perfectly.
        assert_abs_diff_eq!(state.cov()[(0, 0)], 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(state.cov()[(0, 1)], 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(state.cov()[(1, 1)], 4.0, epsilon = 1e-12);
        assert_eq!(state.count(), 3.0);
    }

    #[test]
    fn one_call_equals_two_halves() {
        let chunk = random_positions(40, 3, 9);

        let mut whole = AdaptState::new(3);
        whole.update(&chunk[..20], 0).unwrap();
        whole.update(&chunk[20..], 20).unwrap();

        let mut split = AdaptState::new(3);
        split.update(&chunk[..20], 0).unwrap();
        split.update(&chunk[20..30], 20).unwrap();
        split.update(&chunk[30..], 30).unwrap();

        assert_eq!(whole.count(), split.count());
        for i in 0..3 {
            assert_abs_diff_eq!(whole.mean()[i], split.mean()[i], epsilon = 1e-10);
            for j in 0..3 {
                assert_abs_diff_eq!(whole.cov()[(i, j)], split.cov()[(i, j)], epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn gate_passes_pd_matrix_unchanged() {
        let cov = nalgebra::dmatrix![2.0, 0.5; 0.5, 1.0];
        let (attempted, ridged) = gated_cholesky(&cov, 1e-8).unwrap();
        assert!(!ridged);
        assert_eq!(attempted, cov);
    }

    #[test]
    fn gate_ridges_rank_deficient_matrix() {
        // Rank-1: all mass on the (1,1) direction.
        let cov = nalgebra::dmatrix![1.0, 1.0; 1.0, 1.0];
        assert!(Cholesky::new(cov.clone()).is_none());
        let (attempted, ridged) = gated_cholesky(&cov, 1e-6).unwrap();
        assert!(ridged);
        assert_abs_diff_eq!(attempted[(0, 0)], 1.0 + 1e-6, epsilon = 1e-15);
        assert!(Cholesky::new(attempted).is_some());
    }

    #[test]
    fn gate_reports_hopeless_matrix() {
        // Negative definite: no ridge of this size can rescue it.
        let cov = nalgebra::dmatrix![-1.0, 0.0; 0.0, -1.0];
        assert!(matches!(
            gated_cholesky(&cov, 1e-8),
            Err(McmcError::MatrixNotPositiveDefinite)
        ));
    }
}
