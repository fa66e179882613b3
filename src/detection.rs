//! Stay/trip detection.
//!
//! The timeline pipeline treats detection as a black box behind
//! [`TimelineGenerator`]. [`ClusterTimelineGenerator`] is the reference
//! implementation:
//!
//! 1. Split the points wherever the silence exceeds the data-gap threshold
//! 2. Scan each segment for stay clusters (distance + velocity bounds)
//! 3. Merge consecutive stays at the same place
//! 4. Turn the movement between stays into trips, dropping trips that are
//!    too short in distance or time
//!
//! Output is deterministic for a given point sequence and configuration,
//! which is what makes regeneration idempotent.

use std::borrow::Cow;

use chrono::Duration;
use geo::{algorithm::simplify::Simplify, Coord, LineString};
use log::{debug, warn};

use crate::spatial::{meters_to_degrees, path_distance, weighted_centroid};
use crate::timeline::{DataGap, MovementType, TimelineEvent, TimelineStay, TimelineTrip};
use crate::validation::{has_sufficient_data, retain_valid_points, validate_points};
use crate::velocity::{derive_speeds, filter_unrealistic_speeds, VelocityStats};
use crate::{
    cluster_end_index, haversine_distance, DetectionAlgorithm, GpsPoint, Result, TimelineConfig,
    TrackPoint, UserId,
};

/// Turns an ordered point sequence into stays, trips and data gaps.
pub trait TimelineGenerator: Send + Sync {
    /// Events are returned in chronological order. Stays carry no name yet.
    fn generate(
        &self,
        user: UserId,
        points: &[TrackPoint],
        config: &TimelineConfig,
    ) -> Result<Vec<TimelineEvent>>;
}

/// Clustering-based reference detector.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClusterTimelineGenerator;

/// Index range `[start, end)` of a stay within a segment.
#[derive(Debug, Clone, Copy)]
struct StayRange {
    start: usize,
    end: usize,
}

impl TimelineGenerator for ClusterTimelineGenerator {
    fn generate(
        &self,
        user: UserId,
        points: &[TrackPoint],
        config: &TimelineConfig,
    ) -> Result<Vec<TimelineEvent>> {
        let points: Cow<'_, [TrackPoint]> = match validate_points(points) {
            Ok(()) => Cow::Borrowed(points),
            Err(e) => {
                let kept = retain_valid_points(points);
                warn!(
                    "[Detection] user {}: dropped {} of {} points ({})",
                    user,
                    points.len() - kept.len(),
                    points.len(),
                    e
                );
                Cow::Owned(kept)
            }
        };
        let points = points.as_ref();
        if points.is_empty() {
            return Ok(Vec::new());
        }

        let trusted = has_sufficient_data(points, config);
        let scan_config = match config.algorithm {
            DetectionAlgorithm::Enhanced if trusted => config.clone(),
            DetectionAlgorithm::Enhanced => {
                debug!("[Detection] user {}: too few accurate points, clustering by distance", user);
                distance_only(config)
            }
            DetectionAlgorithm::Clustering => distance_only(config),
        };

        let mut events = Vec::new();
        let threshold = Duration::seconds(config.data_gap_threshold_seconds);
        let min_gap = Duration::seconds(config.data_gap_min_duration_seconds);

        let mut segment_start = 0;
        for i in 1..=points.len() {
            let split = i == points.len() || points[i].timestamp - points[i - 1].timestamp > threshold;
            if !split {
                continue;
            }
            events.extend(detect_segment(&points[segment_start..i], &scan_config)?);
            if i < points.len() {
                let silence = points[i].timestamp - points[i - 1].timestamp;
                if silence >= min_gap {
                    events.push(TimelineEvent::DataGap(DataGap::new(
                        points[i - 1].timestamp,
                        points[i].timestamp,
                    )));
                }
            }
            segment_start = i;
        }

        debug!(
            "[Detection] user {}: {} points -> {} events",
            user,
            points.len(),
            events.len()
        );
        Ok(events)
    }
}

/// Speed and accuracy never break a cluster.
fn distance_only(config: &TimelineConfig) -> TimelineConfig {
    TimelineConfig {
        velocity_threshold: f64::INFINITY,
        use_velocity_accuracy: false,
        ..config.clone()
    }
}

fn detect_segment(segment: &[TrackPoint], config: &TimelineConfig) -> Result<Vec<TimelineEvent>> {
    let stays = merge_stays(segment, find_stays(segment, config), config)?;
    let mut events = Vec::new();

    // Movement before the first stay, between stays, and after the last one.
    let mut cursor = 0;
    for stay in &stays {
        if stay.start > cursor {
            // Connect the trip to the stay on both ends.
            let from = cursor.saturating_sub(1);
            if let Some(trip) = build_trip(&segment[from..=stay.start], config)? {
                events.push(TimelineEvent::Trip(trip));
            }
        }
        events.push(TimelineEvent::Stay(build_stay(&segment[stay.start..stay.end], config)?));
        cursor = stay.end;
    }
    if cursor < segment.len() {
        let from = cursor.saturating_sub(1);
        if let Some(trip) = build_trip(&segment[from..], config)? {
            events.push(TimelineEvent::Trip(trip));
        }
    }

    Ok(events)
}

fn find_stays(segment: &[TrackPoint], config: &TimelineConfig) -> Vec<StayRange> {
    let min_dwell = Duration::seconds(config.stay_min_duration_seconds);
    let mut stays = Vec::new();
    let mut i = 0;

    while i < segment.len() {
        let j = cluster_end_index(segment, i, config);
        let dwell = segment[j - 1].timestamp - segment[i].timestamp;
        if j - i >= 2 && dwell >= min_dwell {
            stays.push(StayRange { start: i, end: j });
            i = j;
        } else {
            i += 1;
        }
    }
    stays
}

fn merge_stays(
    segment: &[TrackPoint],
    stays: Vec<StayRange>,
    config: &TimelineConfig,
) -> Result<Vec<StayRange>> {
    if !config.merge_enabled || stays.len() < 2 {
        return Ok(stays);
    }

    let max_gap = Duration::seconds(config.merge_max_time_gap_seconds);
    let mut merged: Vec<StayRange> = Vec::with_capacity(stays.len());

    for stay in stays {
        if let Some(last) = merged.last_mut() {
            let time_gap = segment[stay.start].timestamp - segment[last.end - 1].timestamp;
            let a = weighted_centroid(&segment[last.start..last.end])?;
            let b = weighted_centroid(&segment[stay.start..stay.end])?;
            if time_gap <= max_gap && haversine_distance(&a, &b) <= config.merge_max_distance {
                last.end = stay.end;
                continue;
            }
        }
        merged.push(stay);
    }
    Ok(merged)
}

fn build_stay(points: &[TrackPoint], config: &TimelineConfig) -> Result<TimelineStay> {
    let accurate: Vec<TrackPoint> = points
        .iter()
        .filter(|p| {
            !config.use_velocity_accuracy
                || p.accuracy.map_or(true, |a| a <= config.max_accuracy_threshold)
        })
        .cloned()
        .collect();
    let centroid = if accurate.is_empty() {
        weighted_centroid(points)?
    } else {
        weighted_centroid(&accurate)?
    };

    let start = points[0].timestamp;
    let end = points[points.len() - 1].timestamp;
    Ok(TimelineStay::new(start, end, centroid))
}

fn build_trip(points: &[TrackPoint], config: &TimelineConfig) -> Result<Option<TimelineTrip>> {
    if points.len() < 2 {
        return Ok(None);
    }

    let start = points[0].timestamp;
    let end = points[points.len() - 1].timestamp;
    let duration = end - start;

    let raw_path: Vec<GpsPoint> = points.iter().map(TrackPoint::position).collect();
    let distance = path_distance(&raw_path)?;

    if distance < config.trip_min_distance
        || duration < Duration::seconds(config.trip_min_duration_seconds)
    {
        return Ok(None);
    }

    let stats = match VelocityStats::from_points(points) {
        Some(recorded) => {
            let speeds: Vec<f64> = points.iter().filter_map(|p| p.velocity).collect();
            VelocityStats::from_speeds(&filter_unrealistic_speeds(
                &speeds,
                config.max_reasonable_speed,
            ))
            .unwrap_or(recorded)
        }
        None => VelocityStats::from_speeds(&filter_unrealistic_speeds(
            &derive_speeds(points),
            config.max_reasonable_speed,
        ))
        .unwrap_or(VelocityStats {
            median: f64::NAN,
            p95: f64::NAN,
            max: f64::NAN,
            mean: f64::NAN,
            samples: 0,
        }),
    };

    Ok(Some(TimelineTrip {
        id: None,
        start,
        duration_seconds: duration.num_seconds(),
        path: simplify_path(&raw_path, config),
        distance_meters: distance,
        movement_type: MovementType::from_speeds(stats.median, stats.p95),
        stale: false,
    }))
}

/// Douglas-Peucker simplification with a tolerance given in meters.
fn simplify_path(path: &[GpsPoint], config: &TimelineConfig) -> Vec<GpsPoint> {
    if !config.path_simplification_enabled || path.len() < 3 {
        return path.to_vec();
    }

    let (tolerance_deg, _) = meters_to_degrees(config.path_simplification_tolerance, path[0].latitude);
    let line = LineString::new(
        path.iter()
            .map(|p| Coord {
                x: p.longitude,
                y: p.latitude,
            })
            .collect(),
    );
    line.simplify(&tolerance_deg)
        .0
        .iter()
        .map(|c| GpsPoint::new(c.y, c.x))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventKind;
    use chrono::{DateTime, TimeZone, Utc};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 15, 8, 0, 0).unwrap()
    }

    fn point(minute: i64, lat: f64, lng: f64) -> TrackPoint {
        TrackPoint::new(base() + Duration::minutes(minute), lat, lng)
    }

    /// 30 minutes at home, a 30 minute walk north, 30 minutes at work.
    fn home_walk_work() -> Vec<TrackPoint> {
        let mut points = Vec::new();
        for m in 0..=30 {
            points.push(point(m, 52.0, 13.0));
        }
        for step in 1..30 {
            points.push(point(30 + step, 52.0 + step as f64 * 0.0008, 13.0).with_velocity(5.0));
        }
        for m in 60..=90 {
            points.push(point(m, 52.024, 13.0));
        }
        points
    }

    #[test]
    fn test_home_walk_work() {
        let config = TimelineConfig::default();
        let events = ClusterTimelineGenerator
            .generate(UserId::new_v4(), &home_walk_work(), &config)
            .unwrap();

        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec![EventKind::Stay, EventKind::Trip, EventKind::Stay]);

        assert_eq!(events[0].start(), base());
        assert_eq!(events[0].end(), base() + Duration::minutes(30));
        assert_eq!(events[1].start(), events[0].end());
        assert_eq!(events[1].end(), events[2].start());

        match &events[1] {
            TimelineEvent::Trip(trip) => {
                assert!(trip.distance_meters > 2_500.0);
                assert_eq!(trip.movement_type, MovementType::Walk);
                // a straight walk collapses to its endpoints
                assert_eq!(trip.path.len(), 2);
            }
            other => panic!("expected trip, got {:?}", other),
        }
    }

    #[test]
    fn test_silence_becomes_data_gap() {
        let config = TimelineConfig::default();
        let mut points: Vec<TrackPoint> = (0..=20).map(|m| point(m, 52.0, 13.0)).collect();
        // five hours of silence
        points.extend((320..=340).map(|m| point(m, 52.0, 13.0)));

        let events = ClusterTimelineGenerator
            .generate(UserId::new_v4(), &points, &config)
            .unwrap();
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec![EventKind::Stay, EventKind::DataGap, EventKind::Stay]);
        assert_eq!(events[1].start(), base() + Duration::minutes(20));
        assert_eq!(events[1].end(), base() + Duration::minutes(320));
    }

    #[test]
    fn test_nearby_stays_merge() {
        let config = TimelineConfig::default();
        let mut points: Vec<TrackPoint> = (0..=10).map(|m| point(m, 52.0, 13.0)).collect();
        // a brief excursion ~120 m away then back
        points.push(point(11, 52.0011, 13.0));
        points.extend((12..=25).map(|m| point(m, 52.0, 13.0)));

        let events = ClusterTimelineGenerator
            .generate(UserId::new_v4(), &points, &config)
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].end(), base() + Duration::minutes(25));
    }

    #[test]
    fn test_deterministic() {
        let config = TimelineConfig::default();
        let user = UserId::new_v4();
        let a = ClusterTimelineGenerator
            .generate(user, &home_walk_work(), &config)
            .unwrap();
        let b = ClusterTimelineGenerator
            .generate(user, &home_walk_work(), &config)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_input() {
        let events = ClusterTimelineGenerator
            .generate(UserId::new_v4(), &[], &TimelineConfig::default())
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_glitch_point_is_dropped_not_fatal() {
        let mut points: Vec<TrackPoint> = (0..=48).map(|m| point(m * 5, 52.0, 13.0)).collect();
        points.insert(10, point(47, 91.0, 13.0));

        let events = ClusterTimelineGenerator
            .generate(UserId::new_v4(), &points, &TimelineConfig::default())
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::Stay);
        assert_eq!(events[0].start(), base());
        assert_eq!(events[0].end(), base() + Duration::minutes(240));
    }
}
