//! Types shared by every Nelson rule checker.

use serde::{Deserialize, Serialize};

/// Violation severity, matching the `Violation.severity` enum in the data
/// model (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        }
    }
}

/// One fired rule, as produced by [`crate::rules::NelsonRuleLibrary::check_all`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleResult {
    pub rule_id: u8,
    pub rule_name: &'static str,
    pub severity: Severity,
    pub triggered: bool,
    pub involved_sample_ids: Vec<i64>,
    pub message: String,
}
