//! The eight Nelson rule checkers, run in rule-id order over an immutable
//! window snapshot (§4.3).

use std::collections::HashSet;

use crate::rules::types::{RuleResult, Severity};
use crate::window::RollingWindow;

/// Stateless library of pattern detectors. Holds no data of its own; every
/// call is a pure function of the window snapshot passed in.
#[derive(Debug, Default, Clone, Copy)]
pub struct NelsonRuleLibrary;

type Checker = fn(&RollingWindow) -> Option<RuleResult>;

const CHECKERS: [(u8, Checker); 8] = [
    (1, check_outlier),
    (2, check_shift),
    (3, check_trend),
    (4, check_alternator),
    (5, check_zone_a),
    (6, check_zone_b),
    (7, check_stratification),
    (8, check_mixture),
];

impl NelsonRuleLibrary {
    pub fn new() -> Self {
        NelsonRuleLibrary
    }

    /// Runs every enabled rule against `window` in rule-id order, returning
    /// the fired results. Rules absent from `enabled_rules` are skipped
    /// entirely (not evaluated).
    pub fn check_all(&self, window: &RollingWindow, enabled_rules: &HashSet<u8>) -> Vec<RuleResult> {
        CHECKERS
            .iter()
            .filter(|(id, _)| enabled_rules.contains(id))
            .filter_map(|(_, checker)| checker(window))
            .collect()
    }
}

fn sample_ids(window: &RollingWindow, n: usize) -> Vec<i64> {
    window.last(n).iter().map(|s| s.sample_id).collect()
}

/// Rule 1 — Outlier: newest sample's zone is beyond either control limit.
fn check_outlier(window: &RollingWindow) -> Option<RuleResult> {
    let newest = window.newest()?;
    if newest.zone.is_beyond_limits() {
        Some(RuleResult {
            rule_id: 1,
            rule_name: "Outlier",
            severity: Severity::Critical,
            triggered: true,
            involved_sample_ids: vec![newest.sample_id],
            message: "Sample is beyond the control limits".to_string(),
        })
    } else {
        None
    }
}

/// Rule 2 — Shift: last 9 samples all strictly on the same side of CL.
fn check_shift(window: &RollingWindow) -> Option<RuleResult> {
    if window.len() < 9 {
        return None;
    }
    let last9 = window.last(9);
    let all_above = last9.iter().all(|s| s.sigma_distance > 0.0);
    let all_below = last9.iter().all(|s| s.sigma_distance < 0.0);
    if all_above || all_below {
        Some(RuleResult {
            rule_id: 2,
            rule_name: "Shift",
            severity: Severity::Warning,
            triggered: true,
            involved_sample_ids: sample_ids(window, 9),
            message: "9 consecutive samples on the same side of the center line".to_string(),
        })
    } else {
        None
    }
}

/// Rule 3 — Trend: last 6 samples strictly monotonic.
fn check_trend(window: &RollingWindow) -> Option<RuleResult> {
    if window.len() < 6 {
        return None;
    }
    let last6 = window.last(6);
    let increasing = last6.windows(2).all(|w| w[0].value < w[1].value);
    let decreasing = last6.windows(2).all(|w| w[0].value > w[1].value);
    if increasing || decreasing {
        Some(RuleResult {
            rule_id: 3,
            rule_name: "Trend",
            severity: Severity::Warning,
            triggered: true,
            involved_sample_ids: sample_ids(window, 6),
            message: "6 consecutive samples strictly trending".to_string(),
        })
    } else {
        None
    }
}

/// Rule 4 — Alternator: of the 12 interior triplets in the last 14 samples,
/// every one reverses direction (strict zigzag, no ties).
fn check_alternator(window: &RollingWindow) -> Option<RuleResult> {
    if window.len() < 14 {
        return None;
    }
    let last14 = window.last(14);
    let directions: Vec<Option<std::cmp::Ordering>> = last14
        .windows(2)
        .map(|w| {
            let cmp = w[0].value.partial_cmp(&w[1].value)?;
            if cmp == std::cmp::Ordering::Equal {
                None
            } else {
                Some(cmp)
            }
        })
        .collect();

    let all_reverse = directions.windows(2).all(|pair| match (pair[0], pair[1]) {
        (Some(a), Some(b)) => a != b,
        _ => false,
    });

    if all_reverse {
        Some(RuleResult {
            rule_id: 4,
            rule_name: "Alternator",
            severity: Severity::Warning,
            triggered: true,
            involved_sample_ids: sample_ids(window, 14),
            message: "14 consecutive samples alternating up and down".to_string(),
        })
    } else {
        None
    }
}

/// Rule 5 — Zone A: >= 2 of the last 3 samples in Zone A (or beyond) on one
/// side.
fn check_zone_a(window: &RollingWindow) -> Option<RuleResult> {
    if window.len() < 3 {
        return None;
    }
    let last3 = window.last(3);
    let upper = last3.iter().filter(|s| s.zone.is_zone_a_or_beyond_upper()).count();
    let lower = last3.iter().filter(|s| s.zone.is_zone_a_or_beyond_lower()).count();
    if upper >= 2 || lower >= 2 {
        Some(RuleResult {
            rule_id: 5,
            rule_name: "Zone A",
            severity: Severity::Warning,
            triggered: true,
            involved_sample_ids: sample_ids(window, 3),
            message: "2 of 3 consecutive samples in Zone A or beyond".to_string(),
        })
    } else {
        None
    }
}

/// Rule 6 — Zone B: >= 4 of the last 5 samples in Zone B or tighter on one
/// side.
fn check_zone_b(window: &RollingWindow) -> Option<RuleResult> {
    if window.len() < 5 {
        return None;
    }
    let last5 = window.last(5);
    let upper = last5
        .iter()
        .filter(|s| s.zone.is_zone_b_or_tighter_upper())
        .count();
    let lower = last5
        .iter()
        .filter(|s| s.zone.is_zone_b_or_tighter_lower())
        .count();
    if upper >= 4 || lower >= 4 {
        Some(RuleResult {
            rule_id: 6,
            rule_name: "Zone B",
            severity: Severity::Warning,
            triggered: true,
            involved_sample_ids: sample_ids(window, 5),
            message: "4 of 5 consecutive samples in Zone B or beyond".to_string(),
        })
    } else {
        None
    }
}

/// Rule 7 — Stratification: last 15 samples all within ±1σ of CL.
fn check_stratification(window: &RollingWindow) -> Option<RuleResult> {
    if window.len() < 15 {
        return None;
    }
    let last15 = window.last(15);
    if last15.iter().all(|s| s.zone.is_within_one_sigma()) {
        Some(RuleResult {
            rule_id: 7,
            rule_name: "Stratification",
            severity: Severity::Warning,
            triggered: true,
            involved_sample_ids: sample_ids(window, 15),
            message: "15 consecutive samples within one sigma of the center line".to_string(),
        })
    } else {
        None
    }
}

/// Rule 8 — Mixture: last 8 samples all outside ±1σ of CL.
fn check_mixture(window: &RollingWindow) -> Option<RuleResult> {
    if window.len() < 8 {
        return None;
    }
    let last8 = window.last(8);
    if last8.iter().all(|s| !s.zone.is_within_one_sigma()) {
        Some(RuleResult {
            rule_id: 8,
            rule_name: "Mixture",
            severity: Severity::Warning,
            triggered: true,
            involved_sample_ids: sample_ids(window, 8),
            message: "8 consecutive samples outside one sigma of the center line".to_string(),
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::ZoneBoundaries;
    use chrono::Utc;

    fn window_from_values(values: &[f64], capacity: usize) -> RollingWindow {
        let mut w = RollingWindow::new(capacity);
        let b = ZoneBoundaries::new(100.0, 2.0).unwrap();
        for (i, v) in values.iter().enumerate() {
            w.append(i as i64 + 1, Utc::now(), *v, None, &b);
        }
        w
    }

    fn all_rules() -> HashSet<u8> {
        (1..=8).collect()
    }

    #[test]
    fn rule1_fires_on_outlier_scenario() {
        let mut values = vec![100.0; 25];
        values.push(110.0);
        let w = window_from_values(&values, 25);
        let lib = NelsonRuleLibrary::new();
        let results = lib.check_all(&w, &all_rules());
        assert!(results.iter().any(|r| r.rule_id == 1));
        let r1 = results.iter().find(|r| r.rule_id == 1).unwrap();
        assert_eq!(r1.involved_sample_ids.len(), 1);
    }

    #[test]
    fn rule2_fires_exactly_on_ninth_consecutive_above() {
        let w = window_from_values(&[102.5; 9], 25);
        let lib = NelsonRuleLibrary::new();
        let results = lib.check_all(&w, &all_rules());
        let r2 = results.iter().find(|r| r.rule_id == 2).unwrap();
        assert_eq!(r2.involved_sample_ids.len(), 9);
    }

    #[test]
    fn rule2_does_not_fire_on_eighth_sample() {
        let w = window_from_values(&[102.5; 8], 25);
        let lib = NelsonRuleLibrary::new();
        let results = lib.check_all(&w, &all_rules());
        assert!(!results.iter().any(|r| r.rule_id == 2));
    }

    #[test]
    fn rule3_fires_on_sixth_monotonic_sample() {
        let w = window_from_values(&[97.0, 99.0, 101.0, 103.0, 104.5, 105.5], 25);
        let lib = NelsonRuleLibrary::new();
        let results = lib.check_all(&w, &all_rules());
        assert!(results.iter().any(|r| r.rule_id == 3));
    }

    #[test]
    fn rule3_does_not_fire_with_a_tie() {
        let w = window_from_values(&[97.0, 99.0, 99.0, 103.0, 104.5, 105.5], 25);
        let lib = NelsonRuleLibrary::new();
        let results = lib.check_all(&w, &all_rules());
        assert!(!results.iter().any(|r| r.rule_id == 3));
    }

    #[test]
    fn rule4_fires_on_strict_zigzag() {
        let values = vec![
            100.0, 101.0, 99.0, 102.0, 98.0, 103.0, 97.0, 104.0, 96.0, 105.0, 95.0, 106.0, 94.0,
            107.0,
        ];
        let w = window_from_values(&values, 25);
        let lib = NelsonRuleLibrary::new();
        let results = lib.check_all(&w, &all_rules());
        assert!(results.iter().any(|r| r.rule_id == 4));
    }

    #[test]
    fn rule4_does_not_fire_when_one_triplet_fails_to_reverse() {
        let mut values = vec![
            100.0, 101.0, 99.0, 102.0, 98.0, 103.0, 97.0, 104.0, 96.0, 105.0, 95.0, 106.0, 94.0,
            107.0,
        ];
        values[7] = 94.5; // breaks the zigzag at one interior point
        let w = window_from_values(&values, 25);
        let lib = NelsonRuleLibrary::new();
        let results = lib.check_all(&w, &all_rules());
        assert!(!results.iter().any(|r| r.rule_id == 4));
    }

    #[test]
    fn rule5_fires_on_zone_a_example_from_spec() {
        let w = window_from_values(&[105.0, 100.0, 105.0], 25);
        let lib = NelsonRuleLibrary::new();
        let results = lib.check_all(&w, &all_rules());
        assert!(results.iter().any(|r| r.rule_id == 5));
    }

    #[test]
    fn rule6_fires_on_four_of_five_in_zone_b() {
        let w = window_from_values(&[103.0, 103.0, 100.0, 103.0, 103.0], 25);
        let lib = NelsonRuleLibrary::new();
        let results = lib.check_all(&w, &all_rules());
        assert!(results.iter().any(|r| r.rule_id == 6));
    }

    #[test]
    fn rule7_fires_on_fifteen_within_one_sigma() {
        let w = window_from_values(&[100.5; 15], 25);
        let lib = NelsonRuleLibrary::new();
        let results = lib.check_all(&w, &all_rules());
        assert!(results.iter().any(|r| r.rule_id == 7));
    }

    #[test]
    fn rule8_fires_on_eight_outside_one_sigma() {
        let values: Vec<f64> = (0..8)
            .map(|i| if i % 2 == 0 { 103.0 } else { 97.0 })
            .collect();
        let w = window_from_values(&values, 25);
        let lib = NelsonRuleLibrary::new();
        let results = lib.check_all(&w, &all_rules());
        assert!(results.iter().any(|r| r.rule_id == 8));
    }

    #[test]
    fn disabled_rules_are_skipped_entirely() {
        let mut values = vec![100.0; 25];
        values.push(110.0);
        let w = window_from_values(&values, 25);
        let lib = NelsonRuleLibrary::new();
        let enabled: HashSet<u8> = HashSet::new();
        let results = lib.check_all(&w, &enabled);
        assert!(results.is_empty());
    }

    #[test]
    fn empty_window_fires_nothing() {
        let w = RollingWindow::new(25);
        let lib = NelsonRuleLibrary::new();
        let results = lib.check_all(&w, &all_rules());
        assert!(results.is_empty());
    }
}
