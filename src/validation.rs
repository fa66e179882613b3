//! Guards on configuration and input.
//!
//! Every guard reports the exact field or invariant it rejected so callers
//! can surface it verbatim.

use chrono::{DateTime, Duration, Utc};

use crate::spatial::DEFAULT_ACCURACY_METERS;
use crate::{Result, TimelineConfig, TimelineError, TrackPoint};

/// Longest time range a single timeline request may cover.
pub const MAX_TIMELINE_RANGE_DAYS: i64 = 31;

/// Fewest points automatic stay/trip detection will trust.
pub const MIN_POINTS_FOR_DETECTION: usize = 3;

fn non_negative(field: &str, label: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(TimelineError::invalid_config(
            field,
            format!("{} must be non-negative", label),
        ));
    }
    Ok(())
}

fn non_negative_secs(field: &str, label: &str, value: i64) -> Result<()> {
    if value < 0 {
        return Err(TimelineError::invalid_config(
            field,
            format!("{} must be non-negative", label),
        ));
    }
    Ok(())
}

/// Check every distance, duration and ratio invariant of a configuration.
pub fn validate_config(config: &TimelineConfig) -> Result<()> {
    non_negative(
        "max_accuracy_threshold",
        "accuracy threshold",
        config.max_accuracy_threshold,
    )?;
    non_negative(
        "velocity_threshold",
        "velocity threshold",
        config.velocity_threshold,
    )?;
    non_negative(
        "trip_min_distance",
        "trip minimum distance",
        config.trip_min_distance,
    )?;
    non_negative(
        "merge_max_distance",
        "merge maximum distance",
        config.merge_max_distance,
    )?;
    non_negative(
        "path_simplification_tolerance",
        "path simplification tolerance",
        config.path_simplification_tolerance,
    )?;
    non_negative(
        "max_reasonable_speed",
        "maximum reasonable speed",
        config.max_reasonable_speed,
    )?;
    non_negative_secs(
        "stay_min_duration_seconds",
        "stay minimum duration",
        config.stay_min_duration_seconds,
    )?;
    non_negative_secs(
        "trip_min_duration_seconds",
        "trip minimum duration",
        config.trip_min_duration_seconds,
    )?;
    non_negative_secs(
        "merge_max_time_gap_seconds",
        "merge maximum time gap",
        config.merge_max_time_gap_seconds,
    )?;
    non_negative_secs(
        "data_gap_threshold_seconds",
        "data gap threshold",
        config.data_gap_threshold_seconds,
    )?;
    non_negative_secs(
        "data_gap_min_duration_seconds",
        "data gap minimum duration",
        config.data_gap_min_duration_seconds,
    )?;

    if !(0.0..=1.0).contains(&config.min_accuracy_ratio) {
        return Err(TimelineError::invalid_config(
            "min_accuracy_ratio",
            "accuracy ratio must be between 0 and 1",
        ));
    }
    Ok(())
}

/// Check a requested `[start, end)` window.
pub fn validate_time_range(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
    if start >= end {
        return Err(TimelineError::InvalidInput(format!(
            "start {} must be before end {}",
            start, end
        )));
    }
    if end - start > Duration::days(MAX_TIMELINE_RANGE_DAYS) {
        return Err(TimelineError::InvalidInput(format!(
            "time range exceeds {} days",
            MAX_TIMELINE_RANGE_DAYS
        )));
    }
    Ok(())
}

/// Check that points are well-formed and chronologically ordered.
pub fn validate_points(points: &[TrackPoint]) -> Result<()> {
    for (i, p) in points.iter().enumerate() {
        check_point(i, p)?;
        if i > 0 && p.timestamp < points[i - 1].timestamp {
            return Err(TimelineError::InvalidInput(format!(
                "point {} is earlier than its predecessor",
                i
            )));
        }
    }
    Ok(())
}

fn check_point(i: usize, p: &TrackPoint) -> Result<()> {
    if !p.position().is_valid() {
        return Err(TimelineError::InvalidInput(format!(
            "point {} has invalid coordinates ({}, {})",
            i, p.latitude, p.longitude
        )));
    }
    if p.accuracy.is_some_and(|a| !a.is_finite() || a < 0.0) {
        return Err(TimelineError::InvalidInput(format!(
            "point {} accuracy must be non-negative",
            i
        )));
    }
    if p.velocity.is_some_and(|v| v.is_nan()) {
        return Err(TimelineError::InvalidInput(format!(
            "point {} velocity is not a number",
            i
        )));
    }
    Ok(())
}

/// Keep the well-formed points that do not step back in time.
///
/// A point earlier than the last kept one is dropped rather than reordered.
pub fn retain_valid_points(points: &[TrackPoint]) -> Vec<TrackPoint> {
    let mut kept: Vec<TrackPoint> = Vec::with_capacity(points.len());
    for (i, p) in points.iter().enumerate() {
        if check_point(i, p).is_err() {
            continue;
        }
        if kept.last().is_some_and(|last| p.timestamp < last.timestamp) {
            continue;
        }
        kept.push(p.clone());
    }
    kept
}

/// Share of points whose accuracy is within `max_accuracy` (0 for no points).
///
/// Points without a reported accuracy count with the default accuracy.
pub fn accuracy_ratio(points: &[TrackPoint], max_accuracy: f64) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    let accurate = points
        .iter()
        .filter(|p| p.accuracy.unwrap_or(DEFAULT_ACCURACY_METERS) <= max_accuracy)
        .count();
    accurate as f64 / points.len() as f64
}

/// Whether a window has enough accurate points to trust automatic detection.
pub fn has_sufficient_data(points: &[TrackPoint], config: &TimelineConfig) -> bool {
    points.len() >= MIN_POINTS_FOR_DETECTION
        && accuracy_ratio(points, config.max_accuracy_threshold) >= config.min_accuracy_ratio
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 15, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&TimelineConfig::default()).is_ok());
    }

    #[test]
    fn test_negative_velocity_threshold_named() {
        let config = TimelineConfig {
            velocity_threshold: -0.5,
            ..TimelineConfig::default()
        };
        let err = validate_config(&config).unwrap_err();
        assert_eq!(
            err,
            TimelineError::invalid_config(
                "velocity_threshold",
                "velocity threshold must be non-negative"
            )
        );
    }

    #[test]
    fn test_ratio_out_of_range() {
        let config = TimelineConfig {
            min_accuracy_ratio: 1.5,
            ..TimelineConfig::default()
        };
        assert!(matches!(
            validate_config(&config),
            Err(TimelineError::InvalidConfig { field, .. }) if field == "min_accuracy_ratio"
        ));
    }

    #[test]
    fn test_time_range_guards() {
        assert!(validate_time_range(at(8), at(9)).is_ok());
        assert!(validate_time_range(at(9), at(9)).is_err());
        let too_long = validate_time_range(at(0), at(0) + Duration::days(40)).unwrap_err();
        assert!(too_long.to_string().contains("exceeds 31 days"));
    }

    #[test]
    fn test_points_must_be_ordered() {
        let points = vec![
            TrackPoint::new(at(9), 52.0, 13.0),
            TrackPoint::new(at(8), 52.0, 13.0),
        ];
        assert!(matches!(
            validate_points(&points),
            Err(TimelineError::InvalidInput(_))
        ));
        assert!(validate_points(&[]).is_ok());
    }

    #[test]
    fn test_retain_valid_points_drops_glitches() {
        let points = vec![
            TrackPoint::new(at(8), 52.0, 13.0),
            TrackPoint::new(at(9), 91.0, 13.0),
            TrackPoint::new(at(10), 52.0, 13.0).with_accuracy(f64::NAN),
            TrackPoint::new(at(11), 52.0, 13.0),
            TrackPoint::new(at(7), 52.0, 13.0),
            TrackPoint::new(at(12), 52.0, 13.0),
        ];
        let kept: Vec<_> = retain_valid_points(&points).iter().map(|p| p.timestamp).collect();
        assert_eq!(kept, vec![at(8), at(11), at(12)]);
    }

    #[test]
    fn test_sufficient_data_heuristic() {
        let config = TimelineConfig::default();
        let good: Vec<TrackPoint> = (0..4)
            .map(|h| TrackPoint::new(at(h), 52.0, 13.0).with_accuracy(10.0))
            .collect();
        assert!(has_sufficient_data(&good, &config));
        assert!(!has_sufficient_data(&good[..2], &config));

        let bad: Vec<TrackPoint> = (0..4)
            .map(|h| TrackPoint::new(at(h), 52.0, 13.0).with_accuracy(300.0))
            .collect();
        assert_eq!(accuracy_ratio(&bad, config.max_accuracy_threshold), 0.0);
        assert!(!has_sufficient_data(&bad, &config));
    }
}
