/*!
# The DRAM sampler

This module implements the Delayed Rejection + Adaptive Metropolis sampler
(Haario, Laine, Mira and Saksman, "DRAM: Efficient Adaptive MCMC",
Statistics and Computing (2006), 16:339-354) over a user
[`TargetPdf`](crate::target::TargetPdf).

## Overview

- **Candidate generation** comes from a [`TransitionKernel`]: Gaussian
  proposals from a scaled covariance (optionally adapted online) or from
  local Hessians.
- **Delayed rejection** re-proposes with a narrowed kernel after a
  rejection, up to `dr_max_num_extra_stages` times, using the recursive
  acceptance ratio that preserves the target distribution.
- **Adaptive Metropolis** periodically folds the chain so far into a
  running covariance and pushes it through a positive-definiteness gate
  into the kernel.
- **Checkpointing** streams the chain (and optional log-value sequences)
  to `_sub<K>`-suffixed files in fixed windows while sampling.

A sampler instance belongs to one sub-environment of the communicator
world; independent replicas run one sampler each (see [`run_replicas`]),
while a multi-rank sub-environment coordinates target evaluation through
the collective protocol in [`crate::target`].

## Example

```rust
use dram_mcmc::config::MhOptions;
use dram_mcmc::sampler::DramSampler;
use dram_mcmc::sequence::VectorSequence;
use dram_mcmc::target::TargetPdf;
use nalgebra::{dmatrix, dvector, DVector};

struct StandardNormal1D;

impl TargetPdf for StandardNormal1D {
    fn dim(&self) -> usize { 1 }
    fn contains(&self, _v: &DVector<f64>) -> bool { true }
    fn log_prior(&self, _v: &DVector<f64>) -> f64 { 0.0 }
    fn log_likelihood(&self, v: &DVector<f64>) -> f64 { -0.5 * v[0] * v[0] }
}

let mut options = MhOptions::default();
options.raw_chain_size = 500;
options.totally_mute = true;

let target = StandardNormal1D;
let mut sampler =
    DramSampler::new(options, &target, dvector![0.0], Some(dmatrix![1.0])).unwrap();
let mut chain = VectorSequence::new(1, "rawChain");
sampler.generate_sequence(&mut chain, None, None).unwrap();
assert_eq!(chain.len(), 500);
```
*/

use std::path::{Path, PathBuf};
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::adapt::{gated_cholesky, AdaptState};
use crate::comm::{Communicator, Environment, SelfComm};
use crate::config::MhOptions;
use crate::error::{McmcError, Result};
use crate::info::RawChainInfo;
use crate::io::matlab;
use crate::kernel::{HessianFn, HessianKernel, ScaledCovKernel, TransitionKernel};
use crate::position::Position;
use crate::sequence::{ScalarSequence, VectorSequence};
use crate::target::{SyncTarget, TargetPdf};

/// Rank and loop coordinates attached to numerical warnings.
#[derive(Debug, Clone, Copy)]
struct AlphaContext {
    sub_id: usize,
    sub_rank: usize,
    position_id: usize,
    stage_id: usize,
}

/// Metropolis-Hastings generator of chain positions implementing DRAM.
pub struct DramSampler<'a, T: TargetPdf, C: Communicator> {
    options: MhOptions,
    env: Environment<C>,
    target: &'a T,
    kernel: TransitionKernel,
    initial_position: DVector<f64>,
    adapt: Option<AdaptState>,
    info: RawChainInfo,
    rng: SmallRng,
    num_positions_not_sub_written: usize,
    ids_of_unique_positions: Vec<usize>,
    log_targets: Vec<f64>,
    alpha_quotients: Vec<f64>,
}

impl<'a, T: TargetPdf> DramSampler<'a, T, SelfComm> {
    /// Single-process sampler with the scaled-covariance kernel.
    ///
    /// `proposal_cov` may be `None` only when the options name an initial
    /// proposal covariance input file.
    pub fn new(
        options: MhOptions,
        target: &'a T,
        initial_position: DVector<f64>,
        proposal_cov: Option<DMatrix<f64>>,
    ) -> Result<Self> {
        Self::with_environment(
            options,
            Environment::single(),
            target,
            initial_position,
            proposal_cov,
        )
    }
}

impl<'a, T: TargetPdf, C: Communicator> DramSampler<'a, T, C> {
    /// Sampler bound to an explicit environment (replica id, rank group).
    pub fn with_environment(
        options: MhOptions,
        env: Environment<C>,
        target: &'a T,
        initial_position: DVector<f64>,
        proposal_cov: Option<DMatrix<f64>>,
    ) -> Result<Self> {
        options.validate()?;
        if options.tk_use_local_hessian {
            return Err(McmcError::MissingHessianCallback);
        }
        let dim = target.dim();
        let dr_scales = &options.dr_scales_for_extra_stages[..options.dr_max_num_extra_stages];

        let proposal_cov = match &options.initial_proposal_cov_matrix_data_input_file_name {
            Some(stem) => Some(read_matrix_file(stem, env.sub_id(), dim)?),
            None => proposal_cov,
        };
        let cov = proposal_cov.ok_or(McmcError::MissingProposalCovariance)?;
        let kernel = TransitionKernel::ScaledCov(ScaledCovKernel::new(dim, dr_scales, cov)?);

        Self::from_parts(options, env, target, initial_position, kernel)
    }

    /// Sampler using the Hessian-based kernel; `hessian` returns the local
    /// Hessian of the negative log-target, or `None` where unavailable.
    pub fn with_hessian(
        options: MhOptions,
        env: Environment<C>,
        target: &'a T,
        initial_position: DVector<f64>,
        hessian: Box<HessianFn>,
    ) -> Result<Self> {
        options.validate()?;
        let dim = target.dim();
        let dr_scales = &options.dr_scales_for_extra_stages[..options.dr_max_num_extra_stages];
        let kernel = TransitionKernel::Hessian(HessianKernel::new(dim, dr_scales, hessian));
        Self::from_parts(options, env, target, initial_position, kernel)
    }

    fn from_parts(
        options: MhOptions,
        env: Environment<C>,
        target: &'a T,
        mut initial_position: DVector<f64>,
        kernel: TransitionKernel,
    ) -> Result<Self> {
        let dim = target.dim();
        if let Some(stem) = &options.initial_position_data_input_file_name {
            initial_position = read_position_file(stem, env.sub_id(), dim)?;
        }
        if initial_position.len() != dim {
            return Err(McmcError::DimensionMismatch {
                expected: dim,
                actual: initial_position.len(),
            });
        }
        let rng = SmallRng::seed_from_u64(options.seed.wrapping_add(env.sub_id() as u64));
        Ok(DramSampler {
            options,
            env,
            target,
            kernel,
            initial_position,
            adapt: None,
            info: RawChainInfo::default(),
            rng,
            num_positions_not_sub_written: 0,
            ids_of_unique_positions: Vec::new(),
            log_targets: Vec::new(),
            alpha_quotients: Vec::new(),
        })
    }

    /// Counters and timers accumulated by the last `generate_sequence`.
    pub fn raw_chain_info(&self) -> &RawChainInfo {
        &self.info
    }

    /// The adapted covariance, once the sampler has entered the adaptive
    /// regime.
    pub fn adapted_covariance(&self) -> Option<&DMatrix<f64>> {
        self.adapt.as_ref().map(|a| a.cov())
    }

    /// The kernel's current law covariance (scaled-covariance variant).
    pub fn proposal_covariance(&self) -> Option<&DMatrix<f64>> {
        match &self.kernel {
            TransitionKernel::ScaledCov(tk) => Some(tk.law_cov_matrix()),
            TransitionKernel::Hessian(_) => None,
        }
    }

    /// Ids of the accepted (unique) positions of the last run.
    pub fn ids_of_unique_positions(&self) -> &[usize] {
        &self.ids_of_unique_positions
    }

    /// Generates the chain into `chain` (and the optional log-value
    /// sequences), then runs the post-sampling pipeline: final window
    /// flush, sub and unified writes, MLE/MAP reports, the info file, and
    /// the filtered chain.
    pub fn generate_sequence(
        &mut self,
        chain: &mut VectorSequence,
        mut log_likelihood_values: Option<&mut ScalarSequence>,
        mut log_target_values: Option<&mut ScalarSequence>,
    ) -> Result<()> {
        if chain.dim() != self.target.dim() {
            return Err(McmcError::DimensionMismatch {
                expected: self.target.dim(),
                actual: chain.dim(),
            });
        }
        self.env.sub_comm().barrier();

        match self.options.raw_chain_data_input_file_name.clone() {
            Some(path) => {
                chain.unified_read_contents(&path, self.options.raw_chain_size)?;
            }
            None => {
                self.generate_full_chain(
                    chain,
                    log_likelihood_values.as_deref_mut(),
                    log_target_values.as_deref_mut(),
                )?;
            }
        }

        if !self.options.totally_mute {
            self.write_outputs(
                chain,
                log_likelihood_values.as_deref(),
                log_target_values.as_deref(),
            )?;
            self.write_info(chain)?;
        }

        if self.options.filtered_chain_generate {
            self.generate_filtered_chain(
                chain,
                log_likelihood_values.as_deref_mut(),
                log_target_values.as_deref_mut(),
            )?;
        }

        self.env.sub_comm().barrier();
        Ok(())
    }

    /// Final flush, sub/unified chain files, MLE/MAP.
    fn write_outputs(
        &mut self,
        chain: &VectorSequence,
        log_likelihood_values: Option<&ScalarSequence>,
        log_target_values: Option<&ScalarSequence>,
    ) -> Result<()> {
        let Some(stem) = self.options.raw_chain_data_output_file_name.clone() else {
            return Ok(());
        };

        if self.num_positions_not_sub_written > 0 {
            let count = self.num_positions_not_sub_written;
            let start = self.options.raw_chain_size - count;
            sub_write_window(
                &self.options,
                self.env.sub_id(),
                self.env.sub_rank(),
                chain,
                log_likelihood_values,
                log_target_values,
                start,
                count,
            )?;
            debug!(
                "wrote remaining {count} chain positions, {start} <= pos <= {}",
                self.options.raw_chain_size - 1
            );
            self.num_positions_not_sub_written = 0;
        }

        if self.env.sub_rank() == 0 {
            let file_type = self.options.raw_chain_data_output_file_type;
            chain.unified_write_contents(&stem, file_type, &self.env)?;
            if let Some(values) = log_likelihood_values {
                values.unified_write_contents(
                    &stem_with_suffix(&stem, "_likelihood"),
                    file_type,
                    &self.env,
                )?;
            }
            if let Some(values) = log_target_values {
                values.unified_write_contents(
                    &stem_with_suffix(&stem, "_target"),
                    file_type,
                    &self.env,
                )?;
            }

            if let Some(values) = log_likelihood_values {
                self.report_maximum(chain, values, "MLE")?;
            }
            if let Some(values) = log_target_values {
                self.report_maximum(chain, values, "MAP")?;
            }
        }
        Ok(())
    }

    fn report_maximum(
        &self,
        chain: &VectorSequence,
        values: &ScalarSequence,
        what: &str,
    ) -> Result<()> {
        let (positions, value) = chain.positions_of_maximum(values)?;
        if positions.is_empty() {
            return Err(McmcError::EmptySequence(values.name().to_string()));
        }
        info!(
            "sub {} {what}: value = {value}, attained at {} position(s), first = {:?}",
            self.env.sub_id(),
            positions.len(),
            positions[0].as_slice()
        );
        if let Some((unified_positions, unified_value)) =
            chain.unified_positions_of_maximum(values, &self.env)?
        {
            info!(
                "unified {what}: value = {unified_value}, attained at {} position(s)",
                unified_positions.len()
            );
        }
        Ok(())
    }

    /// Extra-array dump: per-position log-targets, alpha quotients, and the
    /// rejection fraction.
    fn write_info(&self, chain: &VectorSequence) -> Result<()> {
        if !self.options.raw_chain_generate_extra || self.env.sub_rank() != 0 {
            return Ok(());
        }
        let Some(stem) = &self.options.raw_chain_data_output_file_name else {
            return Ok(());
        };
        if !self.options.sub_env_allowed_to_write(self.env.sub_id()) {
            return Ok(());
        }
        let sub_id = self.env.sub_id();
        let path = PathBuf::from(format!("{}_info_sub{}.m", stem.display(), sub_id));
        let to_io = |source| McmcError::Io {
            sub_id,
            rank: 0,
            source,
        };
        std::fs::write(&path, "").map_err(to_io)?;
        matlab::append_scalar_variable(&path, &format!("logTargets_sub{sub_id}"), &self.log_targets)
            .map_err(to_io)?;
        matlab::append_scalar_variable(
            &path,
            &format!("alphaQuotients_sub{sub_id}"),
            &self.alpha_quotients,
        )
        .map_err(to_io)?;
        let rejected =
            self.info.num_rejections as f64 / (chain.len().saturating_sub(1)).max(1) as f64;
        matlab::append_scalar_assignment(&path, "rejected", rejected).map_err(to_io)?;
        Ok(())
    }

    fn generate_filtered_chain(
        &mut self,
        chain: &mut VectorSequence,
        mut log_likelihood_values: Option<&mut ScalarSequence>,
        mut log_target_values: Option<&mut ScalarSequence>,
    ) -> Result<()> {
        let initial =
            (self.options.filtered_chain_discarded_portion * chain.len() as f64) as usize;
        let spacing = if self.options.filtered_chain_lag == 0 {
            chain.compute_filter_params(initial).1
        } else {
            self.options.filtered_chain_lag
        };

        chain.filter(initial, spacing);
        chain.set_name("filtChain");
        if let Some(values) = log_likelihood_values.as_deref_mut() {
            values.filter(initial, spacing);
        }
        if let Some(values) = log_target_values.as_deref_mut() {
            values.filter(initial, spacing);
        }
        if !self.options.totally_mute {
            info!(
                "filtered chain: initial = {initial}, spacing = {spacing}, {} positions kept",
                chain.len()
            );
        }

        let Some(stem) = self.options.filtered_chain_data_output_file_name.clone() else {
            return Ok(());
        };
        if self.options.totally_mute {
            return Ok(());
        }
        let file_type = self.options.filtered_chain_data_output_file_type;
        if self.options.sub_env_allowed_to_write(self.env.sub_id()) {
            chain.sub_write_contents(0, chain.len(), &stem, file_type, self.env.sub_id())?;
            if let Some(values) = log_likelihood_values.as_deref() {
                values.sub_write_contents(
                    0,
                    values.len(),
                    &stem_with_suffix(&stem, "_likelihood"),
                    file_type,
                    self.env.sub_id(),
                )?;
            }
            if let Some(values) = log_target_values.as_deref() {
                values.sub_write_contents(
                    0,
                    values.len(),
                    &stem_with_suffix(&stem, "_target"),
                    file_type,
                    self.env.sub_id(),
                )?;
            }
        }
        if self.env.sub_rank() == 0 {
            chain.unified_write_contents(&stem, file_type, &self.env)?;
        }
        Ok(())
    }

    /// The DRAM main loop.
    fn generate_full_chain(
        &mut self,
        chain: &mut VectorSequence,
        mut log_likelihood_values: Option<&mut ScalarSequence>,
        mut log_target_values: Option<&mut ScalarSequence>,
    ) -> Result<()> {
        let n = self.options.raw_chain_size;
        let measure = self.options.raw_chain_measure_run_times;
        let mute = self.options.totally_mute;
        let chain_timer = Instant::now();
        self.info.reset();
        self.adapt = None;

        if !mute {
            info!(
                "Starting the generation of Markov chain {}, with {} positions (sub {}, rank {})",
                chain.name(),
                n,
                self.env.sub_id(),
                self.env.sub_rank()
            );
        }

        if !self.target.contains(&self.initial_position) {
            log::error!(
                "initial position is out of target support (sub {}, rank {}): {:?}",
                self.env.sub_id(),
                self.env.sub_rank(),
                self.initial_position.as_slice()
            );
            return Err(McmcError::InitialPositionOutOfSupport);
        }

        let sync = SyncTarget::new(
            self.target,
            self.env.sub_comm(),
            self.options.likelihood_sign,
        );

        let target_timer = Instant::now();
        let initial_values = sync.call(&self.initial_position);
        if measure {
            self.info.target_run_time += target_timer.elapsed().as_secs_f64();
        }
        self.info.num_target_calls += 1;
        debug!(
            "initial position: logPrior = {}, logLikelihood = {}, logTarget = {}",
            initial_values.log_prior, initial_values.log_likelihood, initial_values.log_target
        );

        let mut current = Position::new(
            self.initial_position.clone(),
            false,
            initial_values.log_likelihood,
            initial_values.log_target,
        );

        chain.resize(n);
        self.num_positions_not_sub_written = 0;
        if let Some(values) = log_likelihood_values.as_deref_mut() {
            values.resize(n);
        }
        if let Some(values) = log_target_values.as_deref_mut() {
            values.resize(n);
        }
        self.ids_of_unique_positions.clear();
        if self.options.raw_chain_generate_extra {
            self.log_targets = vec![0.0; n];
            self.alpha_quotients = vec![0.0; n];
        }

        chain.set_position(0, current.values());
        self.ids_of_unique_positions.push(0);
        if let Some(values) = log_likelihood_values.as_deref_mut() {
            values.set_value(0, current.log_likelihood());
        }
        if let Some(values) = log_target_values.as_deref_mut() {
            values.set_value(0, current.log_target());
        }
        if self.options.raw_chain_generate_extra {
            self.log_targets[0] = current.log_target();
            self.alpha_quotients[0] = 1.0;
        }
        self.num_positions_not_sub_written += 1;
        let period = self.options.raw_chain_data_output_period;
        if period == 1 {
            sub_write_window(
                &self.options,
                self.env.sub_id(),
                self.env.sub_rank(),
                chain,
                log_likelihood_values.as_deref(),
                log_target_values.as_deref(),
                0,
                1,
            )?;
            self.num_positions_not_sub_written = 0;
        }

        // A sub-environment wider than one rank runs the chain loop on
        // sub-rank 0 only; the other ranks park in the collective target
        // protocol and fill their chain with a non-constant placeholder
        // (a constant one would produce zero variance downstream).
        if self.env.sub_comm().size() > 1 && self.env.sub_comm().rank() != 0 {
            let calls = sync.wait_loop();
            debug!(
                "sub {} rank {} released after {} collective target calls",
                self.env.sub_id(),
                self.env.sub_rank(),
                calls
            );
            for position_id in 1..n {
                chain.set_position(position_id, &(current.values() * position_id as f64));
                self.info.num_rejections += 1;
            }
            self.info.run_time += chain_timer.elapsed().as_secs_f64();
            return Ok(());
        }

        let progress = if !mute && self.options.raw_chain_display_period > 0 {
            let bar = ProgressBar::new(n as u64);
            bar.set_prefix(format!("Chain {}", self.env.sub_id()));
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            {
                bar.set_style(style.progress_chars("##-"));
            }
            bar.inc(1);
            Some(bar)
        } else {
            None
        };

        for position_id in 1..n {
            let mut stage_id = 0usize;
            self.kernel.clear_pre_computing_positions();
            if !self.kernel.set_pre_computing_position(current.values(), 0) {
                return Err(McmcError::InvalidPreComputingPosition { stage: 0 });
            }

            // Stage-0 candidate; resample while out of support unless the
            // options say to keep the first draw.
            let mut candidate_values;
            let mut out_of_support;
            loop {
                let candidate_timer = Instant::now();
                let rv = self.kernel.rv(&[0])?;
                candidate_values = rv.draw(&mut self.rng);
                if measure {
                    self.info.candidate_run_time += candidate_timer.elapsed().as_secs_f64();
                }
                out_of_support = !self.target.contains(&candidate_values);
                if self.options.put_out_of_bounds_in_chain || !out_of_support {
                    break;
                }
            }
            let mut valid_pre_computing =
                self.kernel.set_pre_computing_position(&candidate_values, stage_id + 1);

            let mut candidate = if out_of_support {
                self.info.num_out_of_target_support += 1;
                Position::new(candidate_values, true, f64::NEG_INFINITY, f64::NEG_INFINITY)
            } else {
                let target_timer = Instant::now();
                let values = sync.call(&candidate_values);
                if measure {
                    self.info.target_run_time += target_timer.elapsed().as_secs_f64();
                }
                self.info.num_target_calls += 1;
                Position::new(
                    candidate_values,
                    false,
                    values.log_likelihood,
                    values.log_target,
                )
            };

            let context = AlphaContext {
                sub_id: self.env.sub_id(),
                sub_rank: self.env.sub_rank(),
                position_id,
                stage_id,
            };

            let mut accept = false;
            if out_of_support {
                if self.options.raw_chain_generate_extra {
                    self.alpha_quotients[position_id] = 0.0;
                }
            } else {
                let alpha_timer = Instant::now();
                let (alpha, quotient) =
                    alpha_single(&self.kernel, &current, &candidate, 0, 1, &context);
                if measure {
                    self.info.mh_alpha_run_time += alpha_timer.elapsed().as_secs_f64();
                }
                if self.options.raw_chain_generate_extra {
                    self.alpha_quotients[position_id] = quotient;
                }
                accept = accept_alpha(&mut self.rng, alpha);
            }

            // Delayed rejection. Skipped during the AM warm-up window
            // unless explicitly allowed.
            if !accept && !out_of_support && self.options.dr_max_num_extra_stages > 0 {
                let in_am_warmup = !self.options.dr_during_am_non_adaptive_int
                    && self.options.adaptation_enabled()
                    && position_id <= self.options.am_init_non_adapt_interval;
                if !in_am_warmup {
                    let dr_timer = Instant::now();
                    let mut positions = vec![current.clone(), candidate.clone()];
                    let mut stage_ids: Vec<usize> = vec![0, 1];

                    while valid_pre_computing
                        && !accept
                        && stage_id < self.options.dr_max_num_extra_stages
                    {
                        self.info.num_drs += 1;
                        stage_id += 1;

                        let mut stage_values;
                        let mut stage_out;
                        loop {
                            let candidate_timer = Instant::now();
                            let rv = self.kernel.rv(&stage_ids)?;
                            stage_values = rv.draw(&mut self.rng);
                            if measure {
                                self.info.candidate_run_time +=
                                    candidate_timer.elapsed().as_secs_f64();
                            }
                            stage_out = !self.target.contains(&stage_values);
                            if self.options.put_out_of_bounds_in_chain || !stage_out {
                                break;
                            }
                        }
                        valid_pre_computing =
                            self.kernel.set_pre_computing_position(&stage_values, stage_id + 1);

                        candidate = if stage_out {
                            self.info.num_out_of_target_support_in_dr += 1;
                            Position::new(
                                stage_values,
                                true,
                                f64::NEG_INFINITY,
                                f64::NEG_INFINITY,
                            )
                        } else {
                            let target_timer = Instant::now();
                            let values = sync.call(&stage_values);
                            if measure {
                                self.info.target_run_time += target_timer.elapsed().as_secs_f64();
                            }
                            self.info.num_target_calls += 1;
                            Position::new(
                                stage_values,
                                false,
                                values.log_likelihood,
                                values.log_target,
                            )
                        };

                        positions.push(candidate.clone());
                        stage_ids.push(stage_id + 1);

                        if !stage_out {
                            let alpha_timer = Instant::now();
                            let refs: Vec<&Position> = positions.iter().collect();
                            let context = AlphaContext {
                                stage_id,
                                ..context
                            };
                            let alpha_dr =
                                alpha_positions(&self.kernel, &refs, &stage_ids, &context);
                            if measure {
                                self.info.dr_alpha_run_time += alpha_timer.elapsed().as_secs_f64();
                            }
                            accept = accept_alpha(&mut self.rng, alpha_dr);
                        }
                    }
                    if measure {
                        self.info.dr_run_time += dr_timer.elapsed().as_secs_f64();
                    }
                }
            }

            // Commit: accepted candidates enter the chain, rejections
            // re-state the current position.
            if accept {
                chain.set_position(position_id, candidate.values());
                self.ids_of_unique_positions.push(position_id);
                current = candidate;
            } else {
                chain.set_position(position_id, current.values());
                self.info.num_rejections += 1;
            }

            if let Some(values) = log_likelihood_values.as_deref_mut() {
                values.set_value(position_id, current.log_likelihood());
            }
            if let Some(values) = log_target_values.as_deref_mut() {
                values.set_value(position_id, current.log_target());
            }
            if self.options.raw_chain_generate_extra {
                self.log_targets[position_id] = current.log_target();
            }

            self.num_positions_not_sub_written += 1;
            if period > 0 && (position_id + 1) % period == 0 {
                sub_write_window(
                    &self.options,
                    self.env.sub_id(),
                    self.env.sub_rank(),
                    chain,
                    log_likelihood_values.as_deref(),
                    log_target_values.as_deref(),
                    position_id + 1 - period,
                    period,
                )?;
                self.num_positions_not_sub_written = 0;
            }

            let monitor = self.options.enable_brooks_gelman_conv_monitor;
            if monitor > 0
                && position_id % monitor == 0
                && position_id > self.options.brooks_gelman_lag + 1
            {
                let lag = self.options.brooks_gelman_lag;
                let estimate = chain.estimate_conv_brooks_gelman(lag, position_id - lag);
                if !mute {
                    info!("positionId = {position_id}, conv_est = {estimate}");
                }
            }

            if self.options.adaptation_enabled() {
                let am_timer = Instant::now();
                adapt_step(
                    &self.options,
                    self.env.sub_id(),
                    self.target.dim(),
                    &mut self.adapt,
                    &mut self.kernel,
                    position_id,
                    chain,
                )?;
                if measure {
                    self.info.am_run_time += am_timer.elapsed().as_secs_f64();
                }
            }

            if let Some(bar) = &progress {
                bar.inc(1);
            }
            let display = self.options.raw_chain_display_period;
            if !mute && display > 0 && (position_id + 1) % display == 0 {
                debug!("Finished generating {} positions", position_id + 1);
            }
        }

        if self.env.sub_comm().size() > 1 && self.env.sub_comm().rank() == 0 {
            sync.release();
        }
        if let Some(bar) = progress {
            bar.finish_and_clear();
        }

        self.info.run_time += chain_timer.elapsed().as_secs_f64();
        if !mute {
            self.log_summary(chain);
        }
        Ok(())
    }

    fn log_summary(&self, chain: &VectorSequence) {
        let n = chain.len() as f64;
        info!(
            "Finished the generation of Markov chain {}, with sub {} positions",
            chain.name(),
            chain.len()
        );
        info!("  Chain run time       = {:.6} seconds", self.info.run_time);
        if self.options.raw_chain_measure_run_times {
            info!("  Num target calls     = {}", self.info.num_target_calls);
            info!(
                "  Candidate run time   = {:.6} seconds",
                self.info.candidate_run_time
            );
            info!(
                "  Target d. run time   = {:.6} seconds",
                self.info.target_run_time
            );
            info!(
                "  Mh alpha run time    = {:.6} seconds",
                self.info.mh_alpha_run_time
            );
            info!(
                "  Dr alpha run time    = {:.6} seconds",
                self.info.dr_alpha_run_time
            );
            info!("  DR run time          = {:.6} seconds", self.info.dr_run_time);
            info!("  AM run time          = {:.6} seconds", self.info.am_run_time);
        }
        info!(
            "  Number of DRs = {} (num_DRs/chain_size = {})",
            self.info.num_drs,
            self.info.num_drs as f64 / n
        );
        info!(
            "  Out of target support in DR = {}",
            self.info.num_out_of_target_support_in_dr
        );
        info!(
            "  Rejection percentage = {} %",
            100.0 * self.info.num_rejections as f64 / n
        );
        info!(
            "  Out of target support percentage = {} %",
            100.0 * self.info.num_out_of_target_support as f64 / n
        );
    }
}

/// Runs `num_replicas` independent single-rank sampler replicas in
/// parallel, one sub-environment each, seeded `seed + sub_id`. Returns the
/// raw chains ordered by replica id.
pub fn run_replicas<T: TargetPdf + Sync>(
    options: &MhOptions,
    target: &T,
    initial_position: &DVector<f64>,
    proposal_cov: &DMatrix<f64>,
    num_replicas: usize,
) -> Result<Vec<VectorSequence>> {
    (0..num_replicas)
        .into_par_iter()
        .map(|sub_id| {
            let env = Environment::replica(sub_id, num_replicas);
            let mut sampler = DramSampler::with_environment(
                options.clone(),
                env,
                target,
                initial_position.clone(),
                Some(proposal_cov.clone()),
            )?;
            let mut chain = VectorSequence::new(target.dim(), "rawChain");
            sampler.generate_sequence(&mut chain, None, None)?;
            Ok(chain)
        })
        .collect()
}

fn stem_with_suffix(stem: &Path, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}{}", stem.display(), suffix))
}

/// One adaptation check at `position_id`: bootstrap at the end of the
/// non-adaptive window, then every `am_adapt_interval` positions fold the
/// newest sub-chain in and push the result through the
/// positive-definiteness gate into the kernel.
fn adapt_step(
    options: &MhOptions,
    sub_id: usize,
    dim: usize,
    adapt_state: &mut Option<AdaptState>,
    kernel: &mut TransitionKernel,
    position_id: usize,
    chain: &VectorSequence,
) -> Result<()> {
    let init = options.am_init_non_adapt_interval;
    let interval = options.am_adapt_interval;

    let mut window: Option<(usize, usize)> = None;
    let mut dump_matrix = false;
    if position_id < init {
        // Warm-up: nothing to do.
    } else if position_id == init {
        *adapt_state = Some(AdaptState::new(dim));
        window = Some((0, init + 1));
        dump_matrix = true;
    } else {
        let since_init = position_id - init;
        if since_init % interval == 0 {
            window = Some((position_id - interval, interval));
            let dump_period = options.am_adapted_matrices_data_output_period;
            if dump_period > 0 && since_init % dump_period == 0 {
                dump_matrix = true;
            }
        }
    }
    let Some((first_id, count)) = window else {
        return Ok(());
    };

    let adapt = adapt_state
        .as_mut()
        .expect("adaptation state exists once the adaptive regime started");
    adapt.update(&chain.positions()[first_id..first_id + count], first_id)?;

    if dump_matrix && !options.totally_mute {
        if let Some(stem) = &options.am_adapted_matrices_data_output_file_name {
            let path = PathBuf::from(format!(
                "{}_am{}_sub{}.m",
                stem.display(),
                position_id,
                sub_id
            ));
            matlab::write_matrix(&path, &format!("mat_am{position_id}"), adapt.cov()).map_err(
                |source| McmcError::Io {
                    sub_id,
                    rank: 0,
                    source,
                },
            )?;
        }
    }

    match gated_cholesky(adapt.cov(), options.am_epsilon) {
        Ok((attempted, ridged)) => {
            if ridged {
                debug!(
                    "adapted covariance needed a {} ridge at position {position_id}",
                    options.am_epsilon
                );
            }
            if let TransitionKernel::ScaledCov(scaled) = kernel {
                scaled.update_law_cov_matrix(attempted * options.am_eta)?;
            }
            Ok(())
        }
        Err(McmcError::MatrixNotPositiveDefinite) => {
            warn!(
                "adapted covariance still not positive definite after ridge at position \
                 {position_id} (sub {sub_id}); leaving proposal covariance unchanged"
            );
            Ok(())
        }
        Err(other) => Err(other),
    }
}

/// One checkpoint window for the chain and its companion sequences. Only
/// sub-rank 0 of a sub-environment writes.
fn sub_write_window(
    options: &MhOptions,
    sub_id: usize,
    sub_rank: usize,
    chain: &VectorSequence,
    log_likelihood_values: Option<&ScalarSequence>,
    log_target_values: Option<&ScalarSequence>,
    start: usize,
    count: usize,
) -> Result<()> {
    let Some(stem) = &options.raw_chain_data_output_file_name else {
        return Ok(());
    };
    if sub_rank != 0 || !options.sub_env_allowed_to_write(sub_id) {
        return Ok(());
    }
    let file_type = options.raw_chain_data_output_file_type;
    chain.sub_write_contents(start, count, stem, file_type, sub_id)?;
    if let Some(values) = log_likelihood_values {
        values.sub_write_contents(
            start,
            count,
            &stem_with_suffix(stem, "_likelihood"),
            file_type,
            sub_id,
        )?;
    }
    if let Some(values) = log_target_values {
        values.sub_write_contents(
            start,
            count,
            &stem_with_suffix(stem, "_target"),
            file_type,
            sub_id,
        )?;
    }
    Ok(())
}

fn read_position_file(stem: &Path, sub_id: usize, dim: usize) -> Result<DVector<f64>> {
    let path = PathBuf::from(format!("{}_sub{}.m", stem.display(), sub_id));
    let (_, rows) = matlab::read_vector_sequence(&path)?;
    let first = rows.into_iter().next().ok_or(McmcError::MalformedChainFile {
        path: path.clone(),
        reason: "initial position file holds no rows".into(),
    })?;
    if first.len() != dim {
        return Err(McmcError::DimensionMismatch {
            expected: dim,
            actual: first.len(),
        });
    }
    Ok(first)
}

fn read_matrix_file(stem: &Path, sub_id: usize, dim: usize) -> Result<DMatrix<f64>> {
    let path = PathBuf::from(format!("{}_sub{}.m", stem.display(), sub_id));
    let (_, rows) = matlab::read_vector_sequence(&path)?;
    if rows.len() != dim || rows.iter().any(|row| row.len() != dim) {
        return Err(McmcError::DimensionMismatch {
            expected: dim,
            actual: rows.len(),
        });
    }
    let mut matrix = DMatrix::zeros(dim, dim);
    for (i, row) in rows.iter().enumerate() {
        for j in 0..dim {
            matrix[(i, j)] = row[j];
        }
    }
    Ok(matrix)
}

/// Acceptance decision: reject at `alpha <= 0`, accept at `alpha >= 1`,
/// otherwise accept iff `alpha >= U` with uniform `U`.
fn accept_alpha(rng: &mut SmallRng, alpha: f64) -> bool {
    if alpha <= 0.0 {
        false
    } else if alpha >= 1.0 {
        true
    } else {
        alpha >= rng.gen::<f64>()
    }
}

/// Single-stage acceptance ratio. Returns `(min(1, quotient), quotient)`;
/// the quotient feeds the optional extra arrays.
///
/// A kernel that cannot produce the proposal RV (an invalid Hessian
/// pre-computing position) yields a zero ratio rather than an error: the
/// transition is simply never taken.
fn alpha_single(
    kernel: &TransitionKernel,
    x: &Position,
    y: &Position,
    x_stage_id: usize,
    y_stage_id: usize,
    context: &AlphaContext,
) -> (f64, f64) {
    match try_alpha_single(kernel, x, y, x_stage_id, y_stage_id, context) {
        Ok(result) => result,
        Err(error) => {
            warn!(
                "alpha(x,y) unavailable at position {}, stage {}: {error}; treating as zero",
                context.position_id, context.stage_id
            );
            (0.0, 0.0)
        }
    }
}

fn try_alpha_single(
    kernel: &TransitionKernel,
    x: &Position,
    y: &Position,
    x_stage_id: usize,
    y_stage_id: usize,
    context: &AlphaContext,
) -> Result<(f64, f64)> {
    if x.out_of_support() || y.out_of_support() {
        debug!(
            "alpha(x,y): endpoint out of support (x: {}, y: {})",
            x.out_of_support(),
            y.out_of_support()
        );
        return Ok((0.0, 0.0));
    }
    if !x.log_target().is_finite() {
        warn!(
            "alpha(x,y): x.logTarget = {} (sub {}, rank {}, position {}, stage {})",
            x.log_target(),
            context.sub_id,
            context.sub_rank,
            context.position_id,
            context.stage_id
        );
        return Ok((0.0, 0.0));
    }
    if !y.log_target().is_finite() {
        warn!(
            "alpha(x,y): y.logTarget = {} (sub {}, rank {}, position {}, stage {})",
            y.log_target(),
            context.sub_id,
            context.sub_rank,
            context.position_id,
            context.stage_id
        );
        return Ok((0.0, 0.0));
    }

    let log_ratio = if kernel.symmetric() {
        y.log_target() - x.log_target()
    } else {
        let q_y_to_x = kernel.rv(&[y_stage_id])?.ln_density(x.values());
        let q_x_to_y = kernel.rv(&[x_stage_id])?.ln_density(y.values());
        y.log_target() + q_y_to_x - x.log_target() - q_x_to_y
    };
    let quotient = log_ratio.exp();
    let alpha = if log_ratio >= 0.0 { 1.0 } else { quotient };
    Ok((alpha, quotient))
}

/// Delayed-rejection acceptance ratio over the visited positions
/// `x_0, y_1, .., y_k` and their kernel stage ids.
///
/// All exponentiation happens after the `min(1, .)` decision is taken in
/// log space. Like [`alpha_single`], an unavailable proposal RV degrades
/// to a zero ratio.
fn alpha_positions(
    kernel: &TransitionKernel,
    positions: &[&Position],
    stage_ids: &[usize],
    context: &AlphaContext,
) -> f64 {
    match try_alpha_positions(kernel, positions, stage_ids, context) {
        Ok(alpha) => alpha,
        Err(error) => {
            warn!(
                "alpha(vec) unavailable at position {}, stage {}: {error}; treating as zero",
                context.position_id, context.stage_id
            );
            0.0
        }
    }
}

/// The sub-ratios `alpha_j` the DR formula consumes all live on directed
/// contiguous segments of the visited-position list: walking a list needs
/// the ratios of its own prefixes and of the prefixes of its reversal, and
/// a prefix of a reversal is again a contiguous segment walked the other
/// way. So instead of recursing, two tables are filled bottom-up by
/// segment length — `forward[a][m]` for `positions[a .. a+m]` in chain
/// order, `backward[a][m]` for the same segment reversed — and the full
/// ratio is read off `forward[0][n]`. Every intermediate value stays
/// inspectable in the tables.
fn try_alpha_positions(
    kernel: &TransitionKernel,
    positions: &[&Position],
    stage_ids: &[usize],
    context: &AlphaContext,
) -> Result<f64> {
    let input_size = positions.len();
    debug_assert!(input_size >= 2, "delayed rejection needs two positions");

    if input_size == 2 {
        let (alpha, _) = try_alpha_single(
            kernel,
            positions[0],
            positions[1],
            stage_ids[0],
            stage_ids[1],
            context,
        )?;
        return Ok(alpha);
    }

    let mut forward = vec![vec![0.0f64; input_size + 1]; input_size];
    let mut backward = vec![vec![0.0f64; input_size + 1]; input_size];

    for m in 2..=input_size {
        for a in 0..=input_size - m {
            let fwd_positions: Vec<&Position> = positions[a..a + m].to_vec();
            let fwd_ids: Vec<usize> = stage_ids[a..a + m].to_vec();
            let bwd_positions: Vec<&Position> =
                positions[a..a + m].iter().rev().copied().collect();
            let bwd_ids: Vec<usize> = stage_ids[a..a + m].iter().rev().copied().collect();

            let fwd_alpha = directed_alpha(
                kernel,
                &fwd_positions,
                &fwd_ids,
                &bwd_positions,
                &bwd_ids,
                |j| forward[a][j],
                |j| backward[a + m - j][j],
                context,
            )?;
            let bwd_alpha = directed_alpha(
                kernel,
                &bwd_positions,
                &bwd_ids,
                &fwd_positions,
                &fwd_ids,
                |j| backward[a + m - j][j],
                |j| forward[a][j],
                context,
            )?;
            forward[a][m] = fwd_alpha;
            backward[a][m] = bwd_alpha;
        }
    }

    Ok(forward[0][input_size])
}

/// One directed segment's ratio: `list`/`ids` is the segment in walking
/// order, `rev_list`/`rev_ids` its reversal. `own_prefix_alpha(j)` and
/// `rev_prefix_alpha(j)` yield the already-computed ratios of the
/// length-`j` prefixes of the segment and of its reversal.
#[allow(clippy::too_many_arguments)]
fn directed_alpha(
    kernel: &TransitionKernel,
    list: &[&Position],
    ids: &[usize],
    rev_list: &[&Position],
    rev_ids: &[usize],
    own_prefix_alpha: impl Fn(usize) -> f64,
    rev_prefix_alpha: impl Fn(usize) -> f64,
    context: &AlphaContext,
) -> Result<f64> {
    let m = list.len();

    if list[0].out_of_support() || list[m - 1].out_of_support() {
        return Ok(0.0);
    }
    if !list[0].log_target().is_finite() {
        warn!(
            "alpha(vec): first logTarget = {} (sub {}, rank {}, position {}, stage {})",
            list[0].log_target(),
            context.sub_id,
            context.sub_rank,
            context.position_id,
            context.stage_id
        );
        return Ok(0.0);
    }
    if !list[m - 1].log_target().is_finite() {
        warn!(
            "alpha(vec): last logTarget = {} (sub {}, rank {}, position {}, stage {})",
            list[m - 1].log_target(),
            context.sub_id,
            context.sub_rank,
            context.position_id,
            context.stage_id
        );
        return Ok(0.0);
    }

    // Two positions: plain single-stage ratio.
    if m == 2 {
        let (alpha, _) = try_alpha_single(kernel, list[0], list[1], ids[0], ids[1], context)?;
        return Ok(alpha);
    }

    let mut log_numerator = 0.0;
    let mut log_denominator = 0.0;
    for l in 2..=m {
        let own_last = kernel
            .pre_computing_position(ids[l - 1])
            .ok_or(McmcError::InvalidPreComputingPosition { stage: ids[l - 1] })?;
        let rev_last = kernel
            .pre_computing_position(rev_ids[l - 1])
            .ok_or(McmcError::InvalidPreComputingPosition {
                stage: rev_ids[l - 1],
            })?;
        log_numerator += kernel.rv(&rev_ids[..l - 1])?.ln_density(rev_last);
        log_denominator += kernel.rv(&ids[..l - 1])?.ln_density(own_last);
    }
    log_numerator += rev_list[0].log_target();
    log_denominator += list[0].log_target();

    let mut alphas_numerator = 1.0;
    let mut alphas_denominator = 1.0;
    for j in 2..m {
        alphas_numerator *= 1.0 - rev_prefix_alpha(j);
        alphas_denominator *= 1.0 - own_prefix_alpha(j);
    }

    if alphas_numerator <= 0.0 {
        return Ok(0.0);
    }
    let log_ratio =
        alphas_numerator.ln() - alphas_denominator.ln() + log_numerator - log_denominator;
    Ok(if log_ratio >= 0.0 { 1.0 } else { log_ratio.exp() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::ScaledCovKernel;
    use approx::assert_abs_diff_eq;
    use nalgebra::{dmatrix, dvector};

    fn test_kernel() -> TransitionKernel {
        let mut kernel = TransitionKernel::ScaledCov(
            ScaledCovKernel::new(1, &[3.0, 5.0], dmatrix![1.0]).unwrap(),
        );
        kernel.set_pre_computing_position(&dvector![0.0], 0);
        kernel.set_pre_computing_position(&dvector![1.0], 1);
        kernel.set_pre_computing_position(&dvector![0.5], 2);
        kernel
    }

    fn context() -> AlphaContext {
        AlphaContext {
            sub_id: 0,
            sub_rank: 0,
            position_id: 1,
            stage_id: 0,
        }
    }

    fn position(v: f64, log_target: f64) -> Position {
        Position::new(dvector![v], false, log_target, log_target)
    }

    #[test]
    fn accept_alpha_bounds() {
        let mut rng = SmallRng::seed_from_u64(0);
        assert!(!accept_alpha(&mut rng, 0.0));
        assert!(!accept_alpha(&mut rng, -0.5));
        assert!(accept_alpha(&mut rng, 1.0));
        assert!(accept_alpha(&mut rng, 2.0));
    }

    #[test]
    fn symmetric_alpha_is_exp_delta_log_target() {
        let kernel = test_kernel();
        let x = position(0.0, -1.0);
        let y = position(1.0, -2.5);
        let (alpha, quotient) = alpha_single(&kernel, &x, &y, 0, 1, &context());
        assert_abs_diff_eq!(quotient, (-1.5f64).exp(), epsilon = 1e-12);
        assert_abs_diff_eq!(alpha, (-1.5f64).exp(), epsilon = 1e-12);

        // Uphill moves saturate at one.
        let (alpha, _) = alpha_single(&kernel, &y, &x, 0, 1, &context());
        assert_eq!(alpha, 1.0);
    }

    #[test]
    fn alpha_is_zero_for_non_finite_targets() {
        let kernel = test_kernel();
        let x = position(0.0, f64::NAN);
        let y = position(1.0, -1.0);
        let (alpha, _) = alpha_single(&kernel, &x, &y, 0, 1, &context());
        assert_eq!(alpha, 0.0);

        let x = position(0.0, -1.0);
        let y = position(1.0, f64::INFINITY);
        let (alpha, _) = alpha_single(&kernel, &x, &y, 0, 1, &context());
        assert_eq!(alpha, 0.0);
    }

    #[test]
    fn alpha_is_zero_out_of_support() {
        let kernel = test_kernel();
        let x = position(0.0, -1.0);
        let y = Position::new(dvector![1.0], true, -1.0, -1.0);
        let (alpha, quotient) = alpha_single(&kernel, &x, &y, 0, 1, &context());
        assert_eq!((alpha, quotient), (0.0, 0.0));
    }

    /// For two positions the recursive form must collapse to the
    /// single-stage ratio.
    #[test]
    fn dr_alpha_boundary_matches_single_stage() {
        let kernel = test_kernel();
        let x = position(0.0, -1.0);
        let y = position(1.0, -2.0);
        let (single, _) = alpha_single(&kernel, &x, &y, 0, 1, &context());
        let multi = alpha_positions(&kernel, &[&x, &y], &[0, 1], &context());
        assert_abs_diff_eq!(single, multi, epsilon = 1e-12);
    }

    #[test]
    fn dr_alpha_stays_in_unit_interval() {
        let kernel = test_kernel();
        let x0 = position(0.0, -1.0);
        let y1 = position(1.0, -4.0);
        let y2 = position(0.5, -1.2);
        let alpha = alpha_positions(&kernel, &[&x0, &y1, &y2], &[0, 1, 2], &context());
        assert!((0.0..=1.0).contains(&alpha), "alpha = {alpha}");
        // The second-stage candidate is nearly as good as the current
        // position, so the DR ratio should be well above zero.
        assert!(alpha > 0.05, "alpha = {alpha}");
    }

    #[test]
    fn dr_alpha_zero_when_last_position_out_of_support() {
        let kernel = test_kernel();
        let x0 = position(0.0, -1.0);
        let y1 = position(1.0, -4.0);
        let y2 = Position::new(dvector![0.5], true, 0.0, 0.0);
        let alpha = alpha_positions(&kernel, &[&x0, &y1, &y2], &[0, 1, 2], &context());
        assert_eq!(alpha, 0.0);
    }
}
