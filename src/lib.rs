pub mod adapt;
pub mod comm;
pub mod config;
pub mod error;
pub mod info;
pub mod io;
pub mod kernel;
pub mod position;
pub mod sampler;
pub mod sequence;
pub mod stats;
pub mod target;

pub use config::{ChainFileType, LikelihoodSign, MhOptions};
pub use error::{McmcError, Result};
pub use sampler::{run_replicas, DramSampler};
pub use sequence::{ScalarSequence, VectorSequence};
pub use target::TargetPdf;
