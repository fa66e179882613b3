//! Velocity statistics and speed repair.
//!
//! All speeds are km/h. Points that did not record a velocity are ignored
//! by the statistics rather than treated as zero.

use serde::{Deserialize, Serialize};

use crate::spatial::track_distance;
use crate::TrackPoint;

/// Speed substituted when a glitch has no reasonable neighbour on either side.
pub const DEFAULT_WALKING_SPEED_KMH: f64 = 5.0;

/// Summary of the recorded velocities in a point window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VelocityStats {
    pub median: f64,
    pub p95: f64,
    pub max: f64,
    pub mean: f64,
    /// Number of points that contributed a velocity
    pub samples: usize,
}

impl VelocityStats {
    /// Statistics over the points' recorded velocities.
    ///
    /// Returns `None` when no point in the window has a velocity.
    pub fn from_points(points: &[TrackPoint]) -> Option<Self> {
        let speeds: Vec<f64> = points.iter().filter_map(|p| p.velocity).collect();
        Self::from_speeds(&speeds)
    }

    /// Statistics over raw speed values (non-finite values are dropped).
    pub fn from_speeds(speeds: &[f64]) -> Option<Self> {
        let mut sorted: Vec<f64> = speeds.iter().copied().filter(|v| v.is_finite()).collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_by(|a, b| a.total_cmp(b));

        let n = sorted.len();
        let mean = sorted.iter().sum::<f64>() / n as f64;
        // Nearest-rank percentile
        let p95_rank = ((0.95 * n as f64).ceil() as usize).clamp(1, n);

        Some(Self {
            median: median_of_sorted(&sorted),
            p95: sorted[p95_rank - 1],
            max: sorted[n - 1],
            mean,
            samples: n,
        })
    }
}

fn median_of_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    }
}

/// Median recorded velocity of a window, `None` if nothing was recorded.
pub fn median_velocity(points: &[TrackPoint]) -> Option<f64> {
    VelocityStats::from_points(points).map(|s| s.median)
}

/// Speeds derived from consecutive positions and timestamps.
///
/// The result has `points.len() - 1` entries. Pairs sharing a timestamp
/// yield `f64::INFINITY` when they moved, which the realism filter then
/// repairs.
pub fn derive_speeds(points: &[TrackPoint]) -> Vec<f64> {
    points
        .windows(2)
        .map(|w| {
            let meters = track_distance(&w[0], &w[1]);
            let seconds = (w[1].timestamp - w[0].timestamp).num_milliseconds() as f64 / 1000.0;
            if seconds <= 0.0 {
                if meters > 0.0 {
                    f64::INFINITY
                } else {
                    0.0
                }
            } else {
                meters / seconds * 3.6
            }
        })
        .collect()
}

/// Replace speeds outside `[0, max_reasonable]` with a plausible value.
///
/// A glitch takes the average of the nearest reasonable speed on each
/// side, the single neighbour if only one side has one, or
/// [`DEFAULT_WALKING_SPEED_KMH`] if neither does. Sample positions are kept.
pub fn filter_unrealistic_speeds(speeds: &[f64], max_reasonable: f64) -> Vec<f64> {
    let reasonable = |v: f64| v.is_finite() && (0.0..=max_reasonable).contains(&v);

    speeds
        .iter()
        .enumerate()
        .map(|(i, &speed)| {
            if reasonable(speed) {
                return speed;
            }
            let before = speeds[..i].iter().rev().copied().find(|&v| reasonable(v));
            let after = speeds[i + 1..].iter().copied().find(|&v| reasonable(v));
            match (before, after) {
                (Some(b), Some(a)) => (b + a) / 2.0,
                (Some(v), None) | (None, Some(v)) => v,
                (None, None) => DEFAULT_WALKING_SPEED_KMH,
            }
        })
        .collect()
}
