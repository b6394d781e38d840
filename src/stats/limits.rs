//! Sigma estimators and control-limit calculators (§4.1).

use serde::{Deserialize, Serialize};

use super::constants::{get_c4, get_d2, get_d3, get_d4};
use super::{Error, Result};

/// Control limits for one chart (X-bar, R, S, I, or MR).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlLimits {
    pub center_line: f64,
    pub ucl: f64,
    pub lcl: f64,
    /// Process sigma (never sigma/sqrt(n)) — §4.1 requires limit calculators
    /// to return process sigma so zone boundaries can be derived from it
    /// directly.
    pub sigma: f64,
}

/// Paired limits for a subgrouped chart: the X-bar (or Individuals) chart and
/// its companion variation chart (R, S, or MR).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct XbarRLimits {
    pub xbar_limits: ControlLimits,
    pub r_limits: ControlLimits,
}

/// Estimates sigma via R-bar/d2, valid for subgroup sizes 2..10.
pub fn estimate_sigma_rbar(ranges: &[f64], subgroup_size: usize) -> Result<f64> {
    if ranges.is_empty() {
        return Err(Error::EmptyInput { what: "ranges" });
    }
    if !(2..=10).contains(&subgroup_size) {
        return Err(Error::InvalidSubgroupSize(subgroup_size as i32));
    }
    if ranges.iter().any(|&r| r < 0.0) {
        return Err(Error::NegativeValue { what: "ranges" });
    }
    let r_bar = ranges.iter().sum::<f64>() / ranges.len() as f64;
    Ok(r_bar / get_d2(subgroup_size)?)
}

/// Estimates sigma via S-bar/c4, valid for subgroup sizes >= 11.
pub fn estimate_sigma_sbar(std_devs: &[f64], subgroup_size: usize) -> Result<f64> {
    if std_devs.is_empty() {
        return Err(Error::EmptyInput {
            what: "standard deviations",
        });
    }
    if subgroup_size <= 10 {
        return Err(Error::InvalidSubgroupSize(subgroup_size as i32));
    }
    if std_devs.iter().any(|&s| s < 0.0) {
        return Err(Error::NegativeValue {
            what: "standard deviations",
        });
    }
    let s_bar = std_devs.iter().sum::<f64>() / std_devs.len() as f64;
    Ok(s_bar / get_c4(subgroup_size)?)
}

fn moving_ranges(values: &[f64], span: usize) -> Vec<f64> {
    if span == 2 {
        values.windows(2).map(|w| (w[1] - w[0]).abs()).collect()
    } else {
        values
            .windows(span)
            .map(|w| {
                let max = w.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                let min = w.iter().cloned().fold(f64::INFINITY, f64::min);
                max - min
            })
            .collect()
    }
}

/// Estimates sigma for individuals (n=1) via the moving-range method.
pub fn estimate_sigma_moving_range(values: &[f64], span: usize) -> Result<f64> {
    if span < 2 {
        return Err(Error::InvalidSpan(span));
    }
    if values.len() < span {
        return Err(Error::InsufficientValues {
            need: span,
            got: values.len(),
        });
    }
    let mrs = moving_ranges(values, span);
    let mr_bar = mrs.iter().sum::<f64>() / mrs.len() as f64;
    Ok(mr_bar / get_d2(span)?)
}

/// Calculates X-bar and R chart control limits from a collection of
/// subgroups, per §4.1 (`CL = mean(means)`, `UCL/LCL = CL ± 3·σ/√n`; R-chart
/// `CL = R̄`, `UCL = D4·R̄`, `LCL = D3·R̄`).
pub fn calculate_xbar_r_limits(
    subgroup_means: &[f64],
    ranges: &[f64],
    subgroup_size: usize,
) -> Result<XbarRLimits> {
    if subgroup_means.is_empty() || ranges.is_empty() {
        return Err(Error::EmptyInput {
            what: "subgroup means and ranges",
        });
    }
    if subgroup_means.len() != ranges.len() {
        return Err(Error::LengthMismatch {
            what: "subgroup means and ranges",
            a: subgroup_means.len(),
            b: ranges.len(),
        });
    }
    if !(2..=25).contains(&subgroup_size) {
        return Err(Error::InvalidSubgroupSize(subgroup_size as i32));
    }

    let xbar = subgroup_means.iter().sum::<f64>() / subgroup_means.len() as f64;
    let r_bar = ranges.iter().sum::<f64>() / ranges.len() as f64;
    let sigma = estimate_sigma_rbar(ranges, subgroup_size)?;

    // UCL/LCL expressed as CL ± 3*sigma/sqrt(n), equivalent to the classical
    // A2*R-bar formulation since A2 = 3/(d2*sqrt(n)).
    let spread = 3.0 * sigma / (subgroup_size as f64).sqrt();
    let xbar_limits = ControlLimits {
        center_line: xbar,
        ucl: xbar + spread,
        lcl: xbar - spread,
        sigma,
    };

    let d3 = get_d3(subgroup_size)?;
    let d4 = get_d4(subgroup_size)?;
    let r_limits = ControlLimits {
        center_line: r_bar,
        ucl: d4 * r_bar,
        lcl: d3 * r_bar,
        sigma,
    };

    Ok(XbarRLimits {
        xbar_limits,
        r_limits,
    })
}

/// Calculates X-bar and S chart control limits for subgroup sizes >= 11.
pub fn calculate_xbar_s_limits(
    subgroup_means: &[f64],
    std_devs: &[f64],
    subgroup_size: usize,
) -> Result<XbarRLimits> {
    if subgroup_means.is_empty() || std_devs.is_empty() {
        return Err(Error::EmptyInput {
            what: "subgroup means and standard deviations",
        });
    }
    if subgroup_means.len() != std_devs.len() {
        return Err(Error::LengthMismatch {
            what: "subgroup means and standard deviations",
            a: subgroup_means.len(),
            b: std_devs.len(),
        });
    }

    let xbar = subgroup_means.iter().sum::<f64>() / subgroup_means.len() as f64;
    let s_bar = std_devs.iter().sum::<f64>() / std_devs.len() as f64;
    let sigma = estimate_sigma_sbar(std_devs, subgroup_size)?;

    let spread = 3.0 * sigma / (subgroup_size as f64).sqrt();
    let xbar_limits = ControlLimits {
        center_line: xbar,
        ucl: xbar + spread,
        lcl: xbar - spread,
        sigma,
    };

    // The B3/B4 factor table for S-charts is out of scope — the companion
    // variation chart here uses the same process-sigma spread as the R-chart
    // path, clamped at zero since a standard deviation cannot go negative.
    let s_limits = ControlLimits {
        center_line: s_bar,
        ucl: s_bar + 3.0 * sigma,
        lcl: (s_bar - 3.0 * sigma).max(0.0),
        sigma,
    };

    Ok(XbarRLimits {
        xbar_limits,
        r_limits: s_limits,
    })
}

/// Calculates I-MR (Individuals / Moving Range) chart control limits for
/// subgroup size 1: `CL = mean(values)`, `UCL/LCL = CL ± 3·σ`.
pub fn calculate_imr_limits(values: &[f64], span: usize) -> Result<XbarRLimits> {
    if values.len() < span {
        return Err(Error::InsufficientValues {
            need: span,
            got: values.len(),
        });
    }

    let x_bar = values.iter().sum::<f64>() / values.len() as f64;
    let sigma = estimate_sigma_moving_range(values, span)?;

    let i_limits = ControlLimits {
        center_line: x_bar,
        ucl: x_bar + 3.0 * sigma,
        lcl: x_bar - 3.0 * sigma,
        sigma,
    };

    let mrs = moving_ranges(values, span);
    let mr_bar = mrs.iter().sum::<f64>() / mrs.len() as f64;
    let d3 = get_d3(span)?;
    let d4 = get_d4(span)?;
    let mr_limits = ControlLimits {
        center_line: mr_bar,
        ucl: d4 * mr_bar,
        lcl: d3 * mr_bar,
        sigma,
    };

    Ok(XbarRLimits {
        xbar_limits: i_limits,
        r_limits: mr_limits,
    })
}

/// General-purpose control limits from an already-known center line and
/// sigma, used by `recalculate_limits` once sigma has been estimated by the
/// method appropriate for the characteristic's subgroup size.
pub fn control_limits_from_sigma(center_line: f64, sigma: f64, n_sigma: f64) -> Result<ControlLimits> {
    if sigma <= 0.0 {
        return Err(Error::NonPositiveSigma(sigma));
    }
    if n_sigma < 0.0 {
        return Err(Error::NegativeValue { what: "n_sigma" });
    }
    Ok(ControlLimits {
        center_line,
        ucl: center_line + n_sigma * sigma,
        lcl: center_line - n_sigma * sigma,
        sigma,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigma_rbar_matches_formula() {
        let ranges = [5.0, 6.0, 4.5, 5.5];
        let sigma = estimate_sigma_rbar(&ranges, 5).unwrap();
        let r_bar = ranges.iter().sum::<f64>() / ranges.len() as f64;
        assert!((sigma - r_bar / get_d2(5).unwrap()).abs() < 1e-10);
    }

    #[test]
    fn sigma_rbar_rejects_out_of_range_n() {
        assert!(estimate_sigma_rbar(&[1.0], 1).is_err());
        assert!(estimate_sigma_rbar(&[1.0], 11).is_err());
    }

    #[test]
    fn sigma_sbar_requires_n_above_ten() {
        assert!(estimate_sigma_sbar(&[1.0], 10).is_err());
        assert!(estimate_sigma_sbar(&[1.0], 11).is_ok());
    }

    #[test]
    fn moving_range_default_span_matches_manual_diff() {
        let values = [10.0, 12.0, 11.0, 13.0, 10.0];
        let sigma = estimate_sigma_moving_range(&values, 2).unwrap();
        let mrs = [2.0, 1.0, 2.0, 3.0];
        let mr_bar = mrs.iter().sum::<f64>() / mrs.len() as f64;
        assert!((sigma - mr_bar / get_d2(2).unwrap()).abs() < 1e-10);
    }

    #[test]
    fn xbar_r_limits_are_symmetric_about_center_line() {
        let means = [10.0, 10.2, 9.8, 10.1];
        let ranges = [1.2, 1.5, 1.0, 1.3];
        let limits = calculate_xbar_r_limits(&means, &ranges, 5).unwrap();
        let upper = limits.xbar_limits.ucl - limits.xbar_limits.center_line;
        let lower = limits.xbar_limits.center_line - limits.xbar_limits.lcl;
        assert!((upper - lower).abs() < 1e-10);
    }

    #[test]
    fn xbar_r_limits_spread_equals_three_sigma_over_sqrt_n() {
        let means = [10.0, 10.2, 9.8, 10.1];
        let ranges = [1.2, 1.5, 1.0, 1.3];
        let n = 5;
        let limits = calculate_xbar_r_limits(&means, &ranges, n).unwrap();
        let expected_spread = 3.0 * limits.xbar_limits.sigma / (n as f64).sqrt();
        assert!((limits.xbar_limits.ucl - limits.xbar_limits.center_line - expected_spread).abs() < 1e-9);
    }

    #[test]
    fn imr_limits_spread_is_exactly_three_sigma() {
        let values = [10.0, 12.0, 11.0, 13.0, 10.0, 12.0];
        let limits = calculate_imr_limits(&values, 2).unwrap();
        let spread = limits.xbar_limits.ucl - limits.xbar_limits.center_line;
        assert!((spread - 3.0 * limits.xbar_limits.sigma).abs() < 1e-10);
    }

    #[test]
    fn control_limits_from_sigma_matches_outlier_scenario() {
        let limits = control_limits_from_sigma(100.0, 2.0, 3.0).unwrap();
        assert_eq!(limits.ucl, 106.0);
        assert_eq!(limits.lcl, 94.0);
    }

    #[test]
    fn rejects_mismatched_lengths() {
        let means = [1.0, 2.0];
        let ranges = [1.0];
        assert!(calculate_xbar_r_limits(&means, &ranges, 3).is_err());
    }

    #[test]
    fn rejects_negative_ranges() {
        assert!(estimate_sigma_rbar(&[-1.0, 2.0], 5).is_err());
    }
}
