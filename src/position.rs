//! Chain position record: parameter values plus the target evaluations
//! attached to them.

use nalgebra::DVector;

/// One evaluated point of the chain.
///
/// When `out_of_support` is set, all log-values are forced to `-inf` and
/// the position can never win an acceptance test.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    values: DVector<f64>,
    out_of_support: bool,
    log_likelihood: f64,
    log_target: f64,
}

impl Position {
    pub fn new(
        values: DVector<f64>,
        out_of_support: bool,
        log_likelihood: f64,
        log_target: f64,
    ) -> Self {
        if out_of_support {
            Position {
                values,
                out_of_support,
                log_likelihood: f64::NEG_INFINITY,
                log_target: f64::NEG_INFINITY,
            }
        } else {
            Position {
                values,
                out_of_support,
                log_likelihood,
                log_target,
            }
        }
    }

    pub fn values(&self) -> &DVector<f64> {
        &self.values
    }

    pub fn out_of_support(&self) -> bool {
        self.out_of_support
    }

    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    pub fn log_target(&self) -> f64 {
        self.log_target
    }
}
