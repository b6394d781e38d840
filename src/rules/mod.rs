//! The eight stateless Nelson pattern detectors (§4.3).

pub mod library;
pub mod types;

pub use library::NelsonRuleLibrary;
pub use types::{RuleResult, Severity};
