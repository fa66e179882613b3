//! Spatial analysis over point sequences.
//!
//! Pure, stateless functions: great-circle distance, accuracy-weighted
//! centroid and the cluster scan used by stay detection. Functions that
//! need at least one point reject empty input with
//! [`TimelineError::InvalidArgument`]; callers decide whether to skip the
//! point or the whole window.

use crate::{GpsPoint, Result, TimelineConfig, TimelineError, TrackPoint};

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Accuracy assumed for points that did not report one (meters).
pub const DEFAULT_ACCURACY_METERS: f64 = 10.0;

/// Great-circle distance in meters between two points.
///
/// # Example
/// ```
/// use geotimeline::{GpsPoint, haversine_distance};
/// let d = haversine_distance(&GpsPoint::new(0.0, 0.0), &GpsPoint::new(0.0, 1.0));
/// assert!((d - 111_195.0).abs() < 500.0);
/// ```
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let lat1 = p1.latitude.to_radians();
    let lat2 = p2.latitude.to_radians();
    let dlat = (p2.latitude - p1.latitude).to_radians();
    let dlng = (p2.longitude - p1.longitude).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_METERS * c
}

/// Distance between two track points in meters.
pub fn track_distance(p1: &TrackPoint, p2: &TrackPoint) -> f64 {
    haversine_distance(&p1.position(), &p2.position())
}

/// Cumulative distance along a path in meters.
pub fn path_distance(points: &[GpsPoint]) -> Result<f64> {
    if points.is_empty() {
        return Err(TimelineError::InvalidArgument(
            "cannot measure an empty path".to_string(),
        ));
    }
    Ok(points
        .windows(2)
        .map(|w| haversine_distance(&w[0], &w[1]))
        .sum())
}

/// Convert a distance in meters to degrees of latitude/longitude at `ref_lat`.
///
/// Returns `(lat_degrees, lng_degrees)`. Longitude degrees widen toward
/// the poles, so the cosine is clamped to keep the envelope finite.
pub fn meters_to_degrees(meters: f64, ref_lat: f64) -> (f64, f64) {
    let lat_deg = meters / 111_320.0;
    let cos_lat = ref_lat.to_radians().cos().abs().max(0.01);
    (lat_deg, lat_deg / cos_lat)
}

/// Mean position weighted by `1 / max(1, accuracy)`.
///
/// Points without a reported accuracy are weighted as if they had
/// [`DEFAULT_ACCURACY_METERS`].
pub fn weighted_centroid(points: &[TrackPoint]) -> Result<GpsPoint> {
    if points.is_empty() {
        return Err(TimelineError::InvalidArgument(
            "cannot compute centroid of an empty point set".to_string(),
        ));
    }

    let mut weight_sum = 0.0;
    let mut lat_sum = 0.0;
    let mut lng_sum = 0.0;

    for p in points {
        if !p.latitude.is_finite() || !p.longitude.is_finite() {
            return Err(TimelineError::InvalidArgument(format!(
                "non-finite coordinate at {}",
                p.timestamp
            )));
        }
        let accuracy = p.accuracy.unwrap_or(DEFAULT_ACCURACY_METERS);
        let weight = 1.0 / accuracy.max(1.0);
        weight_sum += weight;
        lat_sum += p.latitude * weight;
        lng_sum += p.longitude * weight;
    }

    Ok(GpsPoint::new(lat_sum / weight_sum, lng_sum / weight_sum))
}

/// Exclusive end index of the stay cluster anchored at `start`.
///
/// Advances while each point stays within `trip_min_distance` of the
/// anchor and below `velocity_threshold`. With accuracy filtering enabled,
/// points worse than `max_accuracy_threshold` are stepped over without
/// breaking the cluster. Points without a velocity never break it on speed.
pub fn cluster_end_index(points: &[TrackPoint], start: usize, config: &TimelineConfig) -> usize {
    if start >= points.len() {
        return points.len();
    }

    let anchor = &points[start];
    let mut j = start + 1;

    while j < points.len() {
        let candidate = &points[j];

        if config.use_velocity_accuracy
            && candidate
                .accuracy
                .is_some_and(|a| a > config.max_accuracy_threshold)
        {
            j += 1;
            continue;
        }

        if track_distance(anchor, candidate) >= config.trip_min_distance {
            break;
        }
        if candidate
            .velocity
            .is_some_and(|v| v >= config.velocity_threshold)
        {
            break;
        }
        j += 1;
    }

    j
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn point_at(minute: i64, lat: f64, lng: f64) -> TrackPoint {
        let base = Utc.with_ymd_and_hms(2025, 6, 15, 8, 0, 0).unwrap();
        TrackPoint::new(base + Duration::minutes(minute), lat, lng)
    }

    #[test]
    fn test_haversine_one_degree_at_equator() {
        let d = haversine_distance(&GpsPoint::new(0.0, 0.0), &GpsPoint::new(0.0, 1.0));
        assert!((d - 111_200.0).abs() / 111_200.0 < 0.005);
    }

    #[test]
    fn test_haversine_same_point() {
        let p = GpsPoint::new(51.5074, -0.1278);
        assert_eq!(haversine_distance(&p, &p), 0.0);
    }

    #[test]
    fn test_path_distance() {
        let path = vec![
            GpsPoint::new(0.0, 0.0),
            GpsPoint::new(0.0, 0.5),
            GpsPoint::new(0.0, 1.0),
        ];
        let d = path_distance(&path).unwrap();
        let direct = haversine_distance(&path[0], &path[2]);
        assert!((d - direct).abs() < 1.0);
        assert_eq!(path_distance(&path[..1]).unwrap(), 0.0);
        assert!(path_distance(&[]).is_err());
    }

    #[test]
    fn test_weighted_centroid_prefers_accurate_point() {
        let precise = point_at(0, 52.0, 13.0).with_accuracy(5.0);
        let sloppy = point_at(1, 52.001, 13.001).with_accuracy(20.0);
        let centroid = weighted_centroid(&[precise.clone(), sloppy.clone()]).unwrap();

        let simple = GpsPoint::new(52.0005, 13.0005);
        let to_precise = haversine_distance(&centroid, &precise.position());
        let simple_to_precise = haversine_distance(&simple, &precise.position());
        assert!(to_precise < simple_to_precise);
    }

    #[test]
    fn test_weighted_centroid_empty() {
        assert!(matches!(
            weighted_centroid(&[]),
            Err(TimelineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_cluster_end_index_breaks_on_distance() {
        let config = TimelineConfig::default();
        let points = vec![
            point_at(0, 52.0, 13.0),
            point_at(1, 52.0001, 13.0),
            point_at(2, 52.0002, 13.0),
            point_at(3, 52.01, 13.0), // ~1.1 km away
            point_at(4, 52.0, 13.0),
        ];
        assert_eq!(cluster_end_index(&points, 0, &config), 3);
    }

    #[test]
    fn test_cluster_end_index_breaks_on_velocity() {
        let config = TimelineConfig::default();
        let points = vec![
            point_at(0, 52.0, 13.0),
            point_at(1, 52.0001, 13.0).with_velocity(2.0),
            point_at(2, 52.0001, 13.0).with_velocity(30.0),
        ];
        assert_eq!(cluster_end_index(&points, 0, &config), 2);
    }

    #[test]
    fn test_cluster_end_index_skips_inaccurate_points() {
        let config = TimelineConfig::default();
        let points = vec![
            point_at(0, 52.0, 13.0),
            point_at(1, 52.01, 13.0).with_accuracy(500.0),
            point_at(2, 52.0001, 13.0),
        ];
        assert_eq!(cluster_end_index(&points, 0, &config), 3);

        let unfiltered = TimelineConfig {
            use_velocity_accuracy: false,
            ..TimelineConfig::default()
        };
        assert_eq!(cluster_end_index(&points, 0, &unfiltered), 1);
    }

    #[test]
    fn test_meters_to_degrees() {
        let (lat, lng) = meters_to_degrees(111_320.0, 0.0);
        assert!((lat - 1.0).abs() < 1e-9);
        assert!((lng - 1.0).abs() < 1e-9);
        let (_, lng_north) = meters_to_degrees(111_320.0, 60.0);
        assert!(lng_north > 1.9);
    }
}
