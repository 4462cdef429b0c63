/*!
Option surface for the Metropolis-Hastings sampler.

All algorithm knobs live in one explicit record, [`MhOptions`]. The sampler
never reads environment variables or ambient globals; construct the record,
adjust what you need, and hand it to the sampler.

# Examples

```rust
use dram_mcmc::config::MhOptions;

let mut options = MhOptions::default();
options.raw_chain_size = 20_000;
options.dr_max_num_extra_stages = 2;
options.dr_scales_for_extra_stages = vec![3.0, 5.0];
options.am_init_non_adapt_interval = 1_000;
options.am_adapt_interval = 200;
assert!(options.validate().is_ok());
```
*/

use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::error::{McmcError, Result};

/// How the user's log-likelihood and log-prior return values are
/// interpreted.
///
/// The original system fixed this at compile time; here it is an explicit
/// runtime option. With [`LikelihoodSign::MinusTwoLnLikelihood`] the user
/// returns `-2 ln L` (and `-2 ln prior`) and the sampler rescales by `-1/2`
/// at the evaluation boundary, so everything downstream is in plain
/// natural-log units either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LikelihoodSign {
    /// User returns `ln L` directly.
    #[default]
    LnLikelihood,
    /// User returns `-2 ln L`; the sampler applies the `-1/2` factor.
    MinusTwoLnLikelihood,
}

/// On-disk format for chain and scalar-sequence files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChainFileType {
    /// MATLAB-compatible ASCII: `name = zeros(N,D);` followed by indexed
    /// bracketed assignments. Readable back by the sampler.
    #[default]
    Matlab,
    /// Plain CSV with a `sample,dim_0,..` header. Write-only.
    Csv,
}

/// The full option record for one sampler instance.
///
/// Field names follow the original option surface (`rawChainSize`,
/// `drMaxNumExtraStages`, ...) in snake case. `None` file names disable the
/// corresponding sink or source.
#[derive(Debug, Clone)]
pub struct MhOptions {
    /// Number of positions `N` in the raw chain.
    pub raw_chain_size: usize,
    /// If set, the chain is read from this file instead of sampled.
    pub raw_chain_data_input_file_name: Option<PathBuf>,
    pub raw_chain_data_input_file_type: ChainFileType,
    /// Periodic checkpoint sink; `None` disables checkpointing.
    pub raw_chain_data_output_file_name: Option<PathBuf>,
    pub raw_chain_data_output_file_type: ChainFileType,
    /// Flush a window every this many positions; 0 disables periodic
    /// flushing (a single final write still happens when a sink is set).
    pub raw_chain_data_output_period: usize,
    /// Sub-environment ids allowed to write sub files. Empty set means all.
    pub raw_chain_data_output_allowed: BTreeSet<usize>,
    /// Record per-position log-targets and alpha quotients for `write_info`.
    pub raw_chain_generate_extra: bool,
    /// Progress display cadence; 0 disables the periodic progress line.
    pub raw_chain_display_period: usize,
    /// Enable per-phase wall-clock accounting.
    pub raw_chain_measure_run_times: bool,

    /// Maximum number of extra delayed-rejection stages; 0 disables DR.
    pub dr_max_num_extra_stages: usize,
    /// Scale factors `gamma_1, gamma_2, ...` for the extra stages; stage-k
    /// proposal variance shrinks by `gamma_k^2`. Each must be > 1.
    pub dr_scales_for_extra_stages: Vec<f64>,
    /// Allow DR during the AM warm-up window.
    pub dr_during_am_non_adaptive_int: bool,

    /// Select the Hessian-based transition kernel instead of the
    /// scaled-covariance one.
    pub tk_use_local_hessian: bool,

    /// Position id at which adaptation begins; 0 disables adaptation.
    pub am_init_non_adapt_interval: usize,
    /// Positions between adaptation updates; 0 disables adaptation.
    pub am_adapt_interval: usize,
    /// Dump the adapted covariance every this many adaptation intervals.
    pub am_adapted_matrices_data_output_period: usize,
    pub am_adapted_matrices_data_output_file_name: Option<PathBuf>,
    /// Scale applied to the adapted covariance before it reaches the kernel.
    pub am_eta: f64,
    /// Ridge added to the adapted covariance when its Cholesky fails.
    pub am_epsilon: f64,

    /// Keep the first out-of-support candidate instead of resampling.
    pub put_out_of_bounds_in_chain: bool,

    /// Convergence-monitor cadence; 0 disables the hook.
    pub enable_brooks_gelman_conv_monitor: usize,
    pub brooks_gelman_lag: usize,

    pub filtered_chain_generate: bool,
    /// Portion of the raw chain discarded before filtering, in `[0, 1)`.
    pub filtered_chain_discarded_portion: f64,
    /// Filter spacing; 0 means derive it from the chain autocorrelation.
    pub filtered_chain_lag: usize,
    pub filtered_chain_data_output_file_name: Option<PathBuf>,
    pub filtered_chain_data_output_file_type: ChainFileType,

    /// Read the initial position from a `_sub<K>`-suffixed file.
    pub initial_position_data_input_file_name: Option<PathBuf>,
    /// Read the initial proposal covariance from a `_sub<K>`-suffixed file.
    pub initial_proposal_cov_matrix_data_input_file_name: Option<PathBuf>,

    pub likelihood_sign: LikelihoodSign,
    /// Silence all non-error output (progress, summaries, info dumps).
    pub totally_mute: bool,
    /// Base RNG seed; each sub-environment uses `seed + sub_id`.
    pub seed: u64,
}

impl Default for MhOptions {
    fn default() -> Self {
        Self {
            raw_chain_size: 100,
            raw_chain_data_input_file_name: None,
            raw_chain_data_input_file_type: ChainFileType::Matlab,
            raw_chain_data_output_file_name: None,
            raw_chain_data_output_file_type: ChainFileType::Matlab,
            raw_chain_data_output_period: 0,
            raw_chain_data_output_allowed: BTreeSet::new(),
            raw_chain_generate_extra: false,
            raw_chain_display_period: 500,
            raw_chain_measure_run_times: false,
            dr_max_num_extra_stages: 0,
            dr_scales_for_extra_stages: Vec::new(),
            dr_during_am_non_adaptive_int: false,
            tk_use_local_hessian: false,
            am_init_non_adapt_interval: 0,
            am_adapt_interval: 0,
            am_adapted_matrices_data_output_period: 0,
            am_adapted_matrices_data_output_file_name: None,
            am_eta: 1.0,
            am_epsilon: 1.0e-5,
            put_out_of_bounds_in_chain: false,
            enable_brooks_gelman_conv_monitor: 0,
            brooks_gelman_lag: 100,
            filtered_chain_generate: false,
            filtered_chain_discarded_portion: 0.0,
            filtered_chain_lag: 0,
            filtered_chain_data_output_file_name: None,
            filtered_chain_data_output_file_type: ChainFileType::Matlab,
            initial_position_data_input_file_name: None,
            initial_proposal_cov_matrix_data_input_file_name: None,
            likelihood_sign: LikelihoodSign::default(),
            totally_mute: false,
            seed: 0,
        }
    }
}

impl MhOptions {
    /// Checks the internal consistency of the record. Called once by the
    /// sampler constructor; exposed for users who build options
    /// programmatically.
    pub fn validate(&self) -> Result<()> {
        if self.raw_chain_size < 1 {
            return Err(McmcError::InvalidOption {
                option: "raw_chain_size",
                reason: "chain must hold at least one position".into(),
            });
        }
        if self.dr_scales_for_extra_stages.len() < self.dr_max_num_extra_stages {
            return Err(McmcError::InvalidOption {
                option: "dr_scales_for_extra_stages",
                reason: format!(
                    "need {} scales for {} extra stages, got {}",
                    self.dr_max_num_extra_stages,
                    self.dr_max_num_extra_stages,
                    self.dr_scales_for_extra_stages.len()
                ),
            });
        }
        for (k, &scale) in self.dr_scales_for_extra_stages.iter().enumerate() {
            if !(scale > 1.0) {
                return Err(McmcError::InvalidOption {
                    option: "dr_scales_for_extra_stages",
                    reason: format!("scale {} for stage {} must be > 1", scale, k + 1),
                });
            }
        }
        if !(self.am_eta > 0.0) {
            return Err(McmcError::InvalidOption {
                option: "am_eta",
                reason: format!("must be > 0, got {}", self.am_eta),
            });
        }
        if !(self.am_epsilon > 0.0) {
            return Err(McmcError::InvalidOption {
                option: "am_epsilon",
                reason: format!("must be > 0, got {}", self.am_epsilon),
            });
        }
        if !(0.0..1.0).contains(&self.filtered_chain_discarded_portion) {
            return Err(McmcError::InvalidOption {
                option: "filtered_chain_discarded_portion",
                reason: format!(
                    "must be in [0, 1), got {}",
                    self.filtered_chain_discarded_portion
                ),
            });
        }
        if self.raw_chain_data_input_file_name.is_some()
            && self.raw_chain_data_input_file_type == ChainFileType::Csv
        {
            return Err(McmcError::InvalidOption {
                option: "raw_chain_data_input_file_type",
                reason: "CSV files are write-only; chain input must be MATLAB format".into(),
            });
        }
        Ok(())
    }

    /// Whether a sub-environment is allowed to write sub files.
    pub fn sub_env_allowed_to_write(&self, sub_id: usize) -> bool {
        self.raw_chain_data_output_allowed.is_empty()
            || self.raw_chain_data_output_allowed.contains(&sub_id)
    }

    /// Whether the adaptive-Metropolis machinery is active.
    pub fn adaptation_enabled(&self) -> bool {
        !self.tk_use_local_hessian
            && self.am_init_non_adapt_interval > 0
            && self.am_adapt_interval > 0
    }
}
