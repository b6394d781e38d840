//! Pure, deterministic statistics over collections of scalars.
//!
//! Nothing in this module touches I/O, the database, or process time; it is
//! the leaf dependency of the whole crate (§2 dependency order).

pub mod constants;
pub mod limits;
pub mod zone;

use thiserror::Error;

pub use constants::SpcConstants;
pub use limits::{control_limits_from_sigma, ControlLimits, XbarRLimits};
pub use zone::{classify_zone, Zone, ZoneBoundaries};

/// Errors raised by pure statistics computations.
#[non_exhaustive]
#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("subgroup size must be between 1 and 25, got {0}")]
    InvalidSubgroupSize(i32),

    #[error("{what} cannot be empty")]
    EmptyInput { what: &'static str },

    #[error("{what} must have matching lengths, got {a} and {b}")]
    LengthMismatch {
        what: &'static str,
        a: usize,
        b: usize,
    },

    #[error("{what} cannot be negative")]
    NegativeValue { what: &'static str },

    #[error("sigma must be positive, got {0}")]
    NonPositiveSigma(f64),

    #[error("moving range span must be at least 2, got {0}")]
    InvalidSpan(usize),

    #[error("need at least {need} values for this calculation, got {got}")]
    InsufficientValues { need: usize, got: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Sigma-estimation method selected by subgroup size, per §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigmaMethod {
    /// n == 1: moving range / d2(span).
    MovingRange,
    /// 2 <= n <= 10: R-bar / d2(n).
    RBar,
    /// n >= 11: S-bar / c4(n).
    SBar,
}

impl SigmaMethod {
    pub fn for_subgroup_size(n: usize) -> Self {
        match n {
            0 => SigmaMethod::MovingRange, // defensive; validated elsewhere
            1 => SigmaMethod::MovingRange,
            2..=10 => SigmaMethod::RBar,
            _ => SigmaMethod::SBar,
        }
    }
}

/// Computes `(mean, range)` for one subgroup of readings. Range is `None` for
/// a single-reading subgroup (n=1, I-MR charts don't use a range per sample).
pub fn mean_range(values: &[f64]) -> (f64, Option<f64>) {
    if values.is_empty() {
        return (0.0, None);
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let range = if values.len() > 1 {
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        Some(max - min)
    } else {
        None
    };
    (mean, range)
}
