//! Zone boundaries and value-to-zone classification (§4.1, §4.2).

use serde::{Deserialize, Serialize};

use super::{Error, Result};

/// The eight zone labels a subgroup mean can fall into relative to a
/// characteristic's control limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Zone {
    BeyondUcl,
    ZoneAUpper,
    ZoneBUpper,
    ZoneCUpper,
    ZoneCLower,
    ZoneBLower,
    ZoneALower,
    BeyondLcl,
}

impl Zone {
    /// True for zones strictly above the center line.
    pub fn is_above_center(self) -> bool {
        matches!(
            self,
            Zone::BeyondUcl | Zone::ZoneAUpper | Zone::ZoneBUpper | Zone::ZoneCUpper
        )
    }

    /// True for the four zones within the Zone C band (|sigma distance| < 1).
    pub fn is_within_one_sigma(self) -> bool {
        matches!(self, Zone::ZoneCUpper | Zone::ZoneCLower)
    }

    /// True for Zone A (inclusive of beyond-limits) on the upper side.
    pub fn is_zone_a_or_beyond_upper(self) -> bool {
        matches!(self, Zone::ZoneAUpper | Zone::BeyondUcl)
    }

    pub fn is_zone_a_or_beyond_lower(self) -> bool {
        matches!(self, Zone::ZoneALower | Zone::BeyondLcl)
    }

    /// Zone B, A, or beyond, upper side (§4.3 Rule 6).
    pub fn is_zone_b_or_tighter_upper(self) -> bool {
        matches!(self, Zone::ZoneBUpper | Zone::ZoneAUpper | Zone::BeyondUcl)
    }

    pub fn is_zone_b_or_tighter_lower(self) -> bool {
        matches!(self, Zone::ZoneBLower | Zone::ZoneALower | Zone::BeyondLcl)
    }

    pub fn is_beyond_limits(self) -> bool {
        matches!(self, Zone::BeyondUcl | Zone::BeyondLcl)
    }
}

/// The seven boundary values (CL ± 1σ, ± 2σ, ± 3σ) used to classify a
/// subgroup mean into a [`Zone`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoneBoundaries {
    pub center_line: f64,
    pub plus_1_sigma: f64,
    pub plus_2_sigma: f64,
    pub plus_3_sigma: f64,
    pub minus_1_sigma: f64,
    pub minus_2_sigma: f64,
    pub minus_3_sigma: f64,
}

impl ZoneBoundaries {
    /// Derives zone boundaries from a center line and process sigma.
    ///
    /// # Errors
    /// Returns [`Error::NonPositiveSigma`] when `sigma <= 0`.
    pub fn new(center_line: f64, sigma: f64) -> Result<Self> {
        if sigma <= 0.0 {
            return Err(Error::NonPositiveSigma(sigma));
        }
        Ok(ZoneBoundaries {
            center_line,
            plus_1_sigma: center_line + sigma,
            plus_2_sigma: center_line + 2.0 * sigma,
            plus_3_sigma: center_line + 3.0 * sigma,
            minus_1_sigma: center_line - sigma,
            minus_2_sigma: center_line - 2.0 * sigma,
            minus_3_sigma: center_line - 3.0 * sigma,
        })
    }

    /// Process sigma implied by these boundaries (inverse of `new`).
    pub fn sigma(&self) -> f64 {
        self.plus_1_sigma - self.center_line
    }

    pub fn sigma_distance(&self, value: f64) -> f64 {
        (value - self.center_line) / self.sigma()
    }
}

/// Classifies `value` into a [`Zone`] given `boundaries`, per §4.2:
///
/// ```text
/// beyond_ucl   if v >= +3σ
/// zone_a_upper if +2σ <= v < +3σ
/// zone_b_upper if +1σ <= v < +2σ
/// zone_c_upper if  CL <= v < +1σ
/// zone_c_lower if -1σ <= v <  CL
/// zone_b_lower if -2σ <= v < -1σ
/// zone_a_lower if -3σ <= v < -2σ
/// beyond_lcl   if v < -3σ
/// ```
pub fn classify_zone(value: f64, boundaries: &ZoneBoundaries) -> Zone {
    if value >= boundaries.plus_3_sigma {
        Zone::BeyondUcl
    } else if value >= boundaries.plus_2_sigma {
        Zone::ZoneAUpper
    } else if value >= boundaries.plus_1_sigma {
        Zone::ZoneBUpper
    } else if value >= boundaries.center_line {
        Zone::ZoneCUpper
    } else if value >= boundaries.minus_1_sigma {
        Zone::ZoneCLower
    } else if value >= boundaries.minus_2_sigma {
        Zone::ZoneBLower
    } else if value >= boundaries.minus_3_sigma {
        Zone::ZoneALower
    } else {
        Zone::BeyondLcl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boundaries() -> ZoneBoundaries {
        ZoneBoundaries::new(100.0, 2.0).unwrap()
    }

    #[test]
    fn boundaries_match_spec_example() {
        let z = boundaries();
        assert_eq!(z.plus_1_sigma, 102.0);
        assert_eq!(z.plus_3_sigma, 106.0);
        assert_eq!(z.minus_2_sigma, 96.0);
    }

    #[test]
    fn classify_each_zone() {
        let z = boundaries();
        assert_eq!(classify_zone(110.0, &z), Zone::BeyondUcl);
        assert_eq!(classify_zone(105.0, &z), Zone::ZoneAUpper);
        assert_eq!(classify_zone(103.0, &z), Zone::ZoneBUpper);
        assert_eq!(classify_zone(101.0, &z), Zone::ZoneCUpper);
        assert_eq!(classify_zone(99.0, &z), Zone::ZoneCLower);
        assert_eq!(classify_zone(97.0, &z), Zone::ZoneBLower);
        assert_eq!(classify_zone(95.0, &z), Zone::ZoneALower);
        assert_eq!(classify_zone(90.0, &z), Zone::BeyondLcl);
    }

    #[test]
    fn boundary_edges_are_inclusive_on_the_outer_side() {
        let z = boundaries();
        assert_eq!(classify_zone(106.0, &z), Zone::BeyondUcl);
        assert_eq!(classify_zone(100.0, &z), Zone::ZoneCUpper);
    }

    #[test]
    fn rejects_non_positive_sigma() {
        assert!(ZoneBoundaries::new(100.0, 0.0).is_err());
        assert!(ZoneBoundaries::new(100.0, -1.0).is_err());
    }

    #[test]
    fn sigma_round_trips_through_boundaries() {
        let z = ZoneBoundaries::new(50.0, 3.5).unwrap();
        assert!((z.sigma() - 3.5).abs() < 1e-10);
    }
}
