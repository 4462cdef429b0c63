/*!
Transition kernels: the proposal side of the sampler.

A kernel produces candidate positions for the Metropolis-Hastings step and
evaluates proposal log-densities for the delayed-rejection acceptance
ratios. The family is closed, a tagged union of two variants:

- [`ScaledCovKernel`]: Gaussian proposals with a fixed (or adapted) law
  covariance. Stage `k` of delayed rejection shrinks the covariance by the
  user scale `gamma_k^2`. Symmetric, so single-stage acceptance ratios can
  skip the kernel terms.
- [`HessianKernel`]: Gaussian proposals whose covariance comes from a
  user-supplied local Hessian at each pre-computing position. Asymmetric.

Both variants cache "pre-computing positions" per delayed-rejection stage;
[`TransitionKernel::rv`] then yields the proposal random variable for a
given stage-id list, from which candidates are drawn and log-densities
evaluated.
*/

use nalgebra::{Cholesky, DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{McmcError, Result};

/// A multivariate Gaussian with precomputed Cholesky factor.
///
/// `draw` realizes `mean + L z` with standard-normal `z`; `ln_density`
/// evaluates the exact log-density via one triangular solve.
#[derive(Debug, Clone)]
pub struct GaussianRv {
    mean: DVector<f64>,
    chol_lower: DMatrix<f64>,
    ln_det_half: f64,
}

impl GaussianRv {
    /// Fails with [`McmcError::MatrixNotPositiveDefinite`] when `cov` has
    /// no Cholesky factorization.
    pub fn new(mean: DVector<f64>, cov: &DMatrix<f64>) -> Result<Self> {
        let chol = Cholesky::new(cov.clone()).ok_or(McmcError::MatrixNotPositiveDefinite)?;
        let chol_lower = chol.l();
        let ln_det_half = (0..chol_lower.nrows())
            .map(|i| chol_lower[(i, i)].ln())
            .sum();
        Ok(GaussianRv {
            mean,
            chol_lower,
            ln_det_half,
        })
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    /// Same covariance, different center.
    pub fn with_mean(&self, mean: DVector<f64>) -> GaussianRv {
        GaussianRv {
            mean,
            chol_lower: self.chol_lower.clone(),
            ln_det_half: self.ln_det_half,
        }
    }

    /// The RV with covariance divided by `scale^2`.
    pub fn scaled_down(&self, scale: f64) -> GaussianRv {
        let dim = self.dim() as f64;
        GaussianRv {
            mean: self.mean.clone(),
            chol_lower: &self.chol_lower / scale,
            ln_det_half: self.ln_det_half - dim * scale.ln(),
        }
    }

    pub fn draw<R: Rng>(&self, rng: &mut R) -> DVector<f64> {
        let z = DVector::from_fn(self.dim(), |_, _| rng.sample(StandardNormal));
        &self.mean + &self.chol_lower * z
    }

    pub fn ln_density(&self, value: &DVector<f64>) -> f64 {
        let diff = value - &self.mean;
        let whitened = self
            .chol_lower
            .solve_lower_triangular(&diff)
            .expect("Cholesky factor has a strictly positive diagonal");
        let dim = self.dim() as f64;
        -0.5 * whitened.norm_squared() - 0.5 * dim * std::f64::consts::TAU.ln() - self.ln_det_half
    }
}

/// Gaussian kernel with a shared law covariance, scaled down per
/// delayed-rejection stage.
#[derive(Debug, Clone)]
pub struct ScaledCovKernel {
    dim: usize,
    /// `[1, gamma_1, gamma_2, ...]`: scale 1 for stage 0, then the user's
    /// extra-stage scales.
    scales: Vec<f64>,
    law_cov: DMatrix<f64>,
    /// Zero-mean proposal RVs per stage, covariance `law_cov / scale^2`.
    stage_rvs: Vec<GaussianRv>,
    pre: Vec<Option<DVector<f64>>>,
}

impl ScaledCovKernel {
    pub fn new(dim: usize, dr_scales: &[f64], law_cov: DMatrix<f64>) -> Result<Self> {
        if law_cov.nrows() != dim || law_cov.ncols() != dim {
            return Err(McmcError::DimensionMismatch {
                expected: dim,
                actual: law_cov.nrows(),
            });
        }
        let scales: Vec<f64> = std::iter::once(1.0).chain(dr_scales.iter().copied()).collect();
        let stage_rvs = Self::build_stage_rvs(dim, &scales, &law_cov)?;
        let num_slots = scales.len() + 1;
        Ok(ScaledCovKernel {
            dim,
            scales,
            law_cov,
            stage_rvs,
            pre: vec![None; num_slots],
        })
    }

    fn build_stage_rvs(
        dim: usize,
        scales: &[f64],
        law_cov: &DMatrix<f64>,
    ) -> Result<Vec<GaussianRv>> {
        let base = GaussianRv::new(DVector::zeros(dim), law_cov)?;
        Ok(scales.iter().map(|&s| base.scaled_down(s)).collect())
    }

    /// Replaces the law covariance. The caller is expected to have gated
    /// `cov` through a successful Cholesky already, so a failure here is
    /// surfaced as an error rather than handled.
    pub fn update_law_cov_matrix(&mut self, cov: DMatrix<f64>) -> Result<()> {
        self.stage_rvs = Self::build_stage_rvs(self.dim, &self.scales, &cov)?;
        self.law_cov = cov;
        Ok(())
    }

    pub fn law_cov_matrix(&self) -> &DMatrix<f64> {
        &self.law_cov
    }
}

/// Local-Hessian callback: returns the Hessian of the negative log-target
/// at a position, or `None` where it is unavailable or ill-defined.
pub type HessianFn = dyn Fn(&DVector<f64>) -> Option<DMatrix<f64>> + Send + Sync;

/// Gaussian kernel whose per-stage covariance is the inverse local Hessian
/// at the stage's pre-computing position.
pub struct HessianKernel {
    dim: usize,
    scales: Vec<f64>,
    hessian: Box<HessianFn>,
    pre: Vec<Option<(DVector<f64>, GaussianRv)>>,
}

impl HessianKernel {
    pub fn new(dim: usize, dr_scales: &[f64], hessian: Box<HessianFn>) -> Self {
        let scales: Vec<f64> = std::iter::once(1.0).chain(dr_scales.iter().copied()).collect();
        let num_slots = scales.len() + 1;
        HessianKernel {
            dim,
            scales,
            hessian,
            pre: vec![None; num_slots],
        }
    }

    /// Builds the stage RV at `position`: covariance `H(position)^{-1}`.
    /// Returns `None` when the callback declines or the Hessian is not
    /// positive definite.
    fn stage_rv(&self, position: &DVector<f64>) -> Option<GaussianRv> {
        let hessian = (self.hessian)(position)?;
        if hessian.nrows() != self.dim || hessian.ncols() != self.dim {
            return None;
        }
        let chol = Cholesky::new(hessian)?;
        let cov = chol.inverse();
        GaussianRv::new(position.clone(), &cov).ok()
    }
}

impl std::fmt::Debug for HessianKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HessianKernel")
            .field("dim", &self.dim)
            .field("scales", &self.scales)
            .finish_non_exhaustive()
    }
}

/// The closed kernel family.
#[derive(Debug)]
pub enum TransitionKernel {
    ScaledCov(ScaledCovKernel),
    Hessian(HessianKernel),
}

impl TransitionKernel {
    /// Caches `position` at the local stage slot. Returns `false` when the
    /// position is invalid for proposing (Hessian unavailable or not
    /// positive definite); the scaled-covariance variant always succeeds.
    pub fn set_pre_computing_position(&mut self, position: &DVector<f64>, stage: usize) -> bool {
        match self {
            TransitionKernel::ScaledCov(kernel) => {
                if stage >= kernel.pre.len() {
                    kernel.pre.resize(stage + 1, None);
                }
                kernel.pre[stage] = Some(position.clone());
                true
            }
            TransitionKernel::Hessian(kernel) => {
                if stage >= kernel.pre.len() {
                    kernel.pre.resize_with(stage + 1, || None);
                }
                match kernel.stage_rv(position) {
                    Some(rv) => {
                        kernel.pre[stage] = Some((position.clone(), rv));
                        true
                    }
                    None => {
                        kernel.pre[stage] = None;
                        false
                    }
                }
            }
        }
    }

    pub fn clear_pre_computing_positions(&mut self) {
        match self {
            TransitionKernel::ScaledCov(kernel) => kernel.pre.iter_mut().for_each(|p| *p = None),
            TransitionKernel::Hessian(kernel) => kernel.pre.iter_mut().for_each(|p| *p = None),
        }
    }

    pub fn pre_computing_position(&self, stage: usize) -> Option<&DVector<f64>> {
        match self {
            TransitionKernel::ScaledCov(kernel) => kernel.pre.get(stage)?.as_ref(),
            TransitionKernel::Hessian(kernel) => {
                kernel.pre.get(stage)?.as_ref().map(|(position, _)| position)
            }
        }
    }

    /// The proposal RV for a stage-id list: centered per the pre-computing
    /// position of `stage_ids[0]`, covariance scaled for stage
    /// `stage_ids.len() - 1`.
    pub fn rv(&self, stage_ids: &[usize]) -> Result<GaussianRv> {
        let anchor = *stage_ids.first().ok_or(McmcError::InvalidPreComputingPosition { stage: 0 })?;
        let stage_index = stage_ids.len() - 1;
        match self {
            TransitionKernel::ScaledCov(kernel) => {
                let mean = kernel
                    .pre
                    .get(anchor)
                    .and_then(|p| p.as_ref())
                    .ok_or(McmcError::InvalidPreComputingPosition { stage: anchor })?;
                let rv = kernel
                    .stage_rvs
                    .get(stage_index)
                    .ok_or(McmcError::InvalidPreComputingPosition { stage: stage_index })?;
                Ok(rv.with_mean(mean.clone()))
            }
            TransitionKernel::Hessian(kernel) => {
                let (_, rv) = kernel
                    .pre
                    .get(anchor)
                    .and_then(|p| p.as_ref())
                    .ok_or(McmcError::InvalidPreComputingPosition { stage: anchor })?;
                let scale = *kernel
                    .scales
                    .get(stage_index)
                    .ok_or(McmcError::InvalidPreComputingPosition { stage: stage_index })?;
                Ok(rv.scaled_down(scale))
            }
        }
    }

    /// Whether the proposal density satisfies `q(a, b) == q(b, a)`.
    pub fn symmetric(&self) -> bool {
        matches!(self, TransitionKernel::ScaledCov(_))
    }
}
