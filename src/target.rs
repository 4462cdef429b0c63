/*!
Target evaluation: the bridge between the user's Bayesian model and the
sampler.

A [`TargetPdf`] supplies the log-prior, the log-likelihood, and the support
test. [`SyncTarget`] wraps one for a rank group: when a sub-environment has
more than one rank, evaluation is a collective operation — sub-rank 0
drives it by broadcasting the candidate, the other ranks block in
[`SyncTarget::wait_loop`] evaluating alongside, and a sentinel broadcast
releases them once the chain loop is done.

The sign convention ([`LikelihoodSign`]) is applied here and nowhere else:
downstream of this module, every log-value is in plain natural-log units.

# Examples

```rust
use dram_mcmc::config::LikelihoodSign;
use dram_mcmc::comm::SelfComm;
use dram_mcmc::target::{SyncTarget, TargetPdf};
use nalgebra::{dvector, DVector};

struct StandardNormal1D;

impl TargetPdf for StandardNormal1D {
    fn dim(&self) -> usize { 1 }
    fn contains(&self, _v: &DVector<f64>) -> bool { true }
    fn log_prior(&self, _v: &DVector<f64>) -> f64 { 0.0 }
    fn log_likelihood(&self, v: &DVector<f64>) -> f64 { -0.5 * v[0] * v[0] }
}

let pdf = StandardNormal1D;
let comm = SelfComm;
let target = SyncTarget::new(&pdf, &comm, LikelihoodSign::LnLikelihood);
let values = target.call(&dvector![1.0]);
assert_eq!(values.log_target, -0.5);
```
*/

use nalgebra::DVector;

use crate::comm::Communicator;
use crate::config::LikelihoodSign;

/// The user-side target density, known up to a constant: prior times
/// likelihood over an explicit support.
pub trait TargetPdf {
    fn dim(&self) -> usize;

    /// Whether `v` lies in the support of the target.
    fn contains(&self, v: &DVector<f64>) -> bool;

    /// Log prior density at `v` (up to a constant), in the units selected
    /// by the configured [`LikelihoodSign`].
    fn log_prior(&self, v: &DVector<f64>) -> f64;

    /// Log likelihood at `v`, in the units selected by the configured
    /// [`LikelihoodSign`].
    fn log_likelihood(&self, v: &DVector<f64>) -> f64;
}

/// One target evaluation, always in natural-log units.
#[derive(Debug, Clone, Copy)]
pub struct TargetValues {
    pub log_prior: f64,
    pub log_likelihood: f64,
    pub log_target: f64,
}

/// Synchronized, parallel-safe target evaluation over one sub-environment.
pub struct SyncTarget<'a, T: TargetPdf, C: Communicator> {
    target: &'a T,
    comm: &'a C,
    sign: LikelihoodSign,
}

impl<'a, T: TargetPdf, C: Communicator> SyncTarget<'a, T, C> {
    pub fn new(target: &'a T, comm: &'a C, sign: LikelihoodSign) -> Self {
        SyncTarget { target, comm, sign }
    }

    fn evaluate(&self, v: &DVector<f64>) -> TargetValues {
        let (log_prior, log_likelihood) = match self.sign {
            LikelihoodSign::LnLikelihood => (self.target.log_prior(v), self.target.log_likelihood(v)),
            LikelihoodSign::MinusTwoLnLikelihood => (
                -0.5 * self.target.log_prior(v),
                -0.5 * self.target.log_likelihood(v),
            ),
        };
        TargetValues {
            log_prior,
            log_likelihood,
            log_target: log_prior + log_likelihood,
        }
    }

    /// Evaluates the target at `v`. Collective when the sub-environment
    /// has more than one rank: the candidate is broadcast so every rank
    /// participates in the same evaluation.
    pub fn call(&self, v: &DVector<f64>) -> TargetValues {
        if self.comm.size() > 1 {
            self.comm.broadcast_candidate(Some(v));
        }
        self.evaluate(v)
    }

    /// Entered by non-zero sub-ranks: repeatedly joins the collective
    /// evaluation until the release sentinel arrives. Returns the number
    /// of collective calls made, sentinel included.
    pub fn wait_loop(&self) -> usize {
        let mut calls = 0;
        loop {
            calls += 1;
            match self.comm.broadcast_candidate(None) {
                Some(v) => {
                    let _ = self.evaluate(&v);
                }
                None => return calls,
            }
        }
    }

    /// Issued once by sub-rank 0 after its chain loop finishes: the no-op
    /// sentinel that releases the ranks blocked in [`SyncTarget::wait_loop`].
    pub fn release(&self) {
        if self.comm.size() > 1 {
            self.comm.broadcast_candidate(None);
        }
    }
}
