//! One characteristic's rolling window of classified subgroup samples.

use std::collections::VecDeque;

use crate::stats::{classify_zone, Zone, ZoneBoundaries};

/// One classified entry in a rolling window.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSample {
    pub sample_id: i64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub value: f64,
    pub range: Option<f64>,
    pub zone: Zone,
    pub is_above_center: bool,
    pub sigma_distance: f64,
}

/// A bounded, newest-at-the-tail sequence of up to `capacity` classified
/// subgroups for one characteristic, plus the boundaries they were
/// classified under.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    capacity: usize,
    entries: VecDeque<WindowSample>,
    boundaries: Option<ZoneBoundaries>,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        RollingWindow {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.max(1)),
            boundaries: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn boundaries(&self) -> Option<&ZoneBoundaries> {
        self.boundaries.as_ref()
    }

    pub fn set_boundaries(&mut self, boundaries: ZoneBoundaries) {
        self.boundaries = Some(boundaries);
    }

    /// Returns the most recent `n` entries, oldest first within that slice,
    /// or fewer if the window doesn't yet have `n` entries.
    pub fn last(&self, n: usize) -> Vec<&WindowSample> {
        let len = self.entries.len();
        let start = len.saturating_sub(n);
        self.entries.iter().skip(start).collect()
    }

    pub fn newest(&self) -> Option<&WindowSample> {
        self.entries.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WindowSample> {
        self.entries.iter()
    }

    /// Classifies `value` under `boundaries`, appends the resulting entry,
    /// evicting the oldest entry if the window is already at capacity
    /// (§8 invariant 4: "append-when-full drops exactly the oldest entry").
    pub fn append(
        &mut self,
        sample_id: i64,
        timestamp: chrono::DateTime<chrono::Utc>,
        value: f64,
        range: Option<f64>,
        boundaries: &ZoneBoundaries,
    ) -> WindowSample {
        let zone = classify_zone(value, boundaries);
        let entry = WindowSample {
            sample_id,
            timestamp,
            value,
            range,
            zone,
            is_above_center: value > boundaries.center_line,
            sigma_distance: boundaries.sigma_distance(value),
        };
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry.clone());
        self.boundaries = Some(*boundaries);
        entry
    }
}
