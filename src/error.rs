//! Error taxonomy for the sampler.
//!
//! Exactly one variant, [`McmcError::MatrixNotPositiveDefinite`], is an
//! expected outcome that callers recover from (the adaptation gate retries
//! with a ridge and otherwise skips the update). Every other variant is a
//! contract violation or an environment failure and aborts the run.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, McmcError>;

#[derive(Error, Debug)]
pub enum McmcError {
    /// Cholesky factorization failed. Recoverable: the adaptation gate
    /// retries with a ridge and, failing that, keeps the previous proposal
    /// covariance in force.
    #[error("matrix is not positive definite")]
    MatrixNotPositiveDefinite,

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("initial position is out of target support")]
    InitialPositionOutOfSupport,

    #[error("a proposal covariance matrix is required when the scaled-covariance kernel is selected")]
    MissingProposalCovariance,

    #[error("a local Hessian callback is required when `tk_use_local_hessian` is set")]
    MissingHessianCallback,

    #[error("adaptation sub-chain must hold at least 2 positions on the first update, got {0}")]
    SubChainTooShort(usize),

    #[error("adaptation sub-chain must start at position id >= 1 on subsequent updates, got {0}")]
    SubChainTooEarly(usize),

    #[error("no pre-computing position cached at stage {stage}")]
    InvalidPreComputingPosition { stage: usize },

    #[error("invalid option `{option}`: {reason}")]
    InvalidOption { option: &'static str, reason: String },

    #[error("sequence `{0}` is empty")]
    EmptySequence(String),

    #[error("i/o failure on sub-environment {sub_id}, rank {rank}")]
    Io {
        sub_id: usize,
        rank: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed chain file {path:?}: {reason}")]
    MalformedChainFile { path: PathBuf, reason: String },
}
