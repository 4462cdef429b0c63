//! Failure-path behavior: out-of-support initial positions abort without
//! producing files, and rank-deficient adapted covariances pass through
//! the ridge gate into the kernel.

use dram_mcmc::adapt::{gated_cholesky, AdaptState};
use dram_mcmc::config::MhOptions;
use dram_mcmc::error::McmcError;
use dram_mcmc::kernel::ScaledCovKernel;
use dram_mcmc::sampler::DramSampler;
use dram_mcmc::sequence::VectorSequence;
use dram_mcmc::target::TargetPdf;
use nalgebra::{dmatrix, dvector, Cholesky, DVector};
use tempfile::TempDir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Standard normal restricted to the positive half-line.
struct HalfLineNormal;

impl TargetPdf for HalfLineNormal {
    fn dim(&self) -> usize {
        1
    }
    fn contains(&self, v: &DVector<f64>) -> bool {
        v[0] > 0.0
    }
    fn log_prior(&self, _v: &DVector<f64>) -> f64 {
        0.0
    }
    fn log_likelihood(&self, v: &DVector<f64>) -> f64 {
        -0.5 * v[0] * v[0]
    }
}

#[test]
fn initial_position_out_of_support_is_fatal_and_writes_nothing() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let stem = dir.path().join("rawChain");

    let mut options = MhOptions::default();
    options.raw_chain_size = 100;
    options.totally_mute = true;
    options.raw_chain_data_output_file_name = Some(stem.clone());
    options.raw_chain_data_output_period = 10;

    let target = HalfLineNormal;
    let mut sampler = DramSampler::new(
        options,
        &target,
        dvector![-1.0], // outside the support
        Some(dmatrix![1.0]),
    )
    .unwrap();

    let mut chain = VectorSequence::new(1, "rawChain");
    let result = sampler.generate_sequence(&mut chain, None, None);
    assert!(matches!(result, Err(McmcError::InitialPositionOutOfSupport)));
    assert!(
        !dir.path().join("rawChain_sub0.m").exists(),
        "no chain file may be produced on a fatal startup error"
    );
}

#[test]
fn out_of_support_candidates_are_resampled_not_stored() {
    init_logging();
    let mut options = MhOptions::default();
    options.raw_chain_size = 2_000;
    options.seed = 3;
    options.totally_mute = true;
    options.raw_chain_display_period = 0;

    let target = HalfLineNormal;
    let mut sampler = DramSampler::new(
        options,
        &target,
        dvector![0.5],
        Some(dmatrix![1.0]),
    )
    .unwrap();
    let mut chain = VectorSequence::new(1, "rawChain");
    sampler.generate_sequence(&mut chain, None, None).unwrap();

    for position in chain.positions() {
        assert!(target.contains(position), "chain position out of support");
    }
    // Resampling means the counter stays at zero.
    assert_eq!(sampler.raw_chain_info().num_out_of_target_support, 0);
}

/// With `put_out_of_bounds_in_chain` the first draw is kept, counted, and
/// rejected, so the chain still only holds in-support positions.
#[test]
fn put_out_of_bounds_counts_but_preserves_support_occupancy() {
    init_logging();
    let mut options = MhOptions::default();
    options.raw_chain_size = 2_000;
    options.seed = 3;
    options.totally_mute = true;
    options.raw_chain_display_period = 0;
    options.put_out_of_bounds_in_chain = true;

    let target = HalfLineNormal;
    let mut sampler = DramSampler::new(
        options,
        &target,
        dvector![0.5],
        Some(dmatrix![1.0]),
    )
    .unwrap();
    let mut chain = VectorSequence::new(1, "rawChain");
    sampler.generate_sequence(&mut chain, None, None).unwrap();

    assert!(sampler.raw_chain_info().num_out_of_target_support > 0);
    for position in chain.positions() {
        assert!(target.contains(position), "chain position out of support");
    }
}

/// A rank-deficient empirical covariance fails the first Cholesky, passes
/// after the ridge, and reaches the kernel scaled by eta.
#[test]
fn pd_gate_feeds_ridged_covariance_to_kernel() {
    init_logging();
    // One frozen component: the sample covariance has an exactly-zero
    // column and cannot be factorized.
    let positions: Vec<DVector<f64>> = (0..50)
        .map(|i| dvector![i as f64, 3.0])
        .collect();
    let mut state = AdaptState::new(2);
    state.update(&positions, 0).unwrap();

    assert!(
        Cholesky::new(state.cov().clone()).is_none(),
        "rank-deficient covariance must fail the first factorization"
    );

    let epsilon = 1.0e-6;
    let (attempted, ridged) = gated_cholesky(state.cov(), epsilon).unwrap();
    assert!(ridged);
    assert!(Cholesky::new(attempted.clone()).is_some());

    let eta = 2.38 * 2.38 / 2.0;
    let mut kernel = ScaledCovKernel::new(2, &[], dmatrix![1.0, 0.0; 0.0, 1.0]).unwrap();
    kernel.update_law_cov_matrix(&attempted * eta).unwrap();
    assert_eq!(kernel.law_cov_matrix(), &(&attempted * eta));
}
