//! Timeline events and the per-response timeline aggregate.
//!
//! Stays, trips and data gaps are plain value records: updates return a
//! modified copy and storage applies them explicitly.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{GpsPoint, UserId};

/// Discriminator of a persisted timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Stay,
    Trip,
    DataGap,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Stay => "STAY",
            EventKind::Trip => "TRIP",
            EventKind::DataGap => "DATA_GAP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STAY" => Some(EventKind::Stay),
            "TRIP" => Some(EventKind::Trip),
            "DATA_GAP" => Some(EventKind::DataGap),
            _ => None,
        }
    }
}

/// Where a timeline's events came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataSource {
    /// Generated on the fly, never persisted
    Live,
    /// Read from (or regenerated into) persisted events
    Cached,
    /// Cached past combined with live today
    Mixed,
}

/// How a trip was most likely travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementType {
    Walk,
    Bicycle,
    Car,
    Unknown,
}

impl MovementType {
    /// Classify from median and 95th percentile speed (km/h).
    pub fn from_speeds(median_kmh: f64, p95_kmh: f64) -> Self {
        if !median_kmh.is_finite() {
            return MovementType::Unknown;
        }
        if median_kmh < 7.0 && p95_kmh < 12.0 {
            MovementType::Walk
        } else if median_kmh < 25.0 && p95_kmh < 40.0 {
            MovementType::Bicycle
        } else {
            MovementType::Car
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MovementType::Walk => "WALK",
            MovementType::Bicycle => "BICYCLE",
            MovementType::Car => "CAR",
            MovementType::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "WALK" => MovementType::Walk,
            "BICYCLE" => MovementType::Bicycle,
            "CAR" => MovementType::Car,
            _ => MovementType::Unknown,
        }
    }
}

/// Foreign reference from a stay to the fact that named it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LocationRef {
    Favorite(i64),
    Geocoding(i64),
}

/// A period the user remained within a small radius.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineStay {
    /// Storage id; `None` until persisted
    pub id: Option<i64>,
    pub start: DateTime<Utc>,
    pub duration_seconds: i64,
    pub location: GpsPoint,
    pub location_name: String,
    pub location_ref: Option<LocationRef>,
    pub stale: bool,
}

impl TimelineStay {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, location: GpsPoint) -> Self {
        Self {
            id: None,
            start,
            duration_seconds: (end - start).num_seconds().max(0),
            location,
            location_name: String::new(),
            location_ref: None,
            stale: false,
        }
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.start + Duration::seconds(self.duration_seconds)
    }

    pub fn geocoding_id(&self) -> Option<i64> {
        match self.location_ref {
            Some(LocationRef::Geocoding(id)) => Some(id),
            _ => None,
        }
    }
}

/// A period of continuous movement between two stays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineTrip {
    pub id: Option<i64>,
    pub start: DateTime<Utc>,
    pub duration_seconds: i64,
    pub path: Vec<GpsPoint>,
    pub distance_meters: f64,
    pub movement_type: MovementType,
    pub stale: bool,
}

impl TimelineTrip {
    pub fn end(&self) -> DateTime<Utc> {
        self.start + Duration::seconds(self.duration_seconds)
    }
}

/// A period with no usable GPS data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataGap {
    pub id: Option<i64>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub stale: bool,
}

impl DataGap {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            id: None,
            start,
            end,
            stale: false,
        }
    }

    pub fn duration_seconds(&self) -> i64 {
        (self.end - self.start).num_seconds()
    }
}

/// Any one timeline event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TimelineEvent {
    Stay(TimelineStay),
    Trip(TimelineTrip),
    DataGap(DataGap),
}

impl TimelineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TimelineEvent::Stay(_) => EventKind::Stay,
            TimelineEvent::Trip(_) => EventKind::Trip,
            TimelineEvent::DataGap(_) => EventKind::DataGap,
        }
    }

    pub fn id(&self) -> Option<i64> {
        match self {
            TimelineEvent::Stay(s) => s.id,
            TimelineEvent::Trip(t) => t.id,
            TimelineEvent::DataGap(g) => g.id,
        }
    }

    pub fn set_id(&mut self, id: Option<i64>) {
        match self {
            TimelineEvent::Stay(s) => s.id = id,
            TimelineEvent::Trip(t) => t.id = id,
            TimelineEvent::DataGap(g) => g.id = id,
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        match self {
            TimelineEvent::Stay(s) => s.start,
            TimelineEvent::Trip(t) => t.start,
            TimelineEvent::DataGap(g) => g.start,
        }
    }

    pub fn end(&self) -> DateTime<Utc> {
        match self {
            TimelineEvent::Stay(s) => s.end(),
            TimelineEvent::Trip(t) => t.end(),
            TimelineEvent::DataGap(g) => g.end,
        }
    }

    pub fn is_stale(&self) -> bool {
        match self {
            TimelineEvent::Stay(s) => s.stale,
            TimelineEvent::Trip(t) => t.stale,
            TimelineEvent::DataGap(g) => g.stale,
        }
    }

    /// Copy of this event stretched or shrunk to end at `end`.
    pub fn with_end(&self, end: DateTime<Utc>) -> Self {
        let mut event = self.clone();
        match &mut event {
            TimelineEvent::Stay(s) => s.duration_seconds = (end - s.start).num_seconds().max(0),
            TimelineEvent::Trip(t) => t.duration_seconds = (end - t.start).num_seconds().max(0),
            TimelineEvent::DataGap(g) => g.end = end.max(g.start),
        }
        event
    }

    /// Copy of this event moved to begin at `start`, keeping its end.
    pub fn with_start(&self, start: DateTime<Utc>) -> Self {
        let end = self.end();
        let mut event = self.clone();
        match &mut event {
            TimelineEvent::Stay(s) => {
                s.start = start;
                s.duration_seconds = (end - start).num_seconds().max(0);
            }
            TimelineEvent::Trip(t) => {
                t.start = start;
                t.duration_seconds = (end - start).num_seconds().max(0);
            }
            TimelineEvent::DataGap(g) => g.start = start,
        }
        event
    }

    /// Whether the event covers any instant of `[start, end)`.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start() < end && self.end() > start
    }
}

/// Ordered stays, trips and data gaps for one user over one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementTimeline {
    pub user_id: UserId,
    pub stays: Vec<TimelineStay>,
    pub trips: Vec<TimelineTrip>,
    pub data_gaps: Vec<DataGap>,
    pub data_source: DataSource,
    pub last_updated: DateTime<Utc>,
}

impl MovementTimeline {
    pub fn empty(user_id: UserId, data_source: DataSource, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            stays: Vec::new(),
            trips: Vec::new(),
            data_gaps: Vec::new(),
            data_source,
            last_updated: now,
        }
    }

    pub fn from_events(
        user_id: UserId,
        events: impl IntoIterator<Item = TimelineEvent>,
        data_source: DataSource,
        now: DateTime<Utc>,
    ) -> Self {
        let mut timeline = Self::empty(user_id, data_source, now);
        for event in events {
            timeline.push(event);
        }
        timeline.sort();
        timeline
    }

    pub fn push(&mut self, event: TimelineEvent) {
        match event {
            TimelineEvent::Stay(s) => self.stays.push(s),
            TimelineEvent::Trip(t) => self.trips.push(t),
            TimelineEvent::DataGap(g) => self.data_gaps.push(g),
        }
    }

    /// Sort each list chronologically by start time.
    pub fn sort(&mut self) {
        self.stays.sort_by_key(|s| s.start);
        self.trips.sort_by_key(|t| t.start);
        self.data_gaps.sort_by_key(|g| g.start);
    }

    /// True when there are real stays or trips, not just gaps.
    pub fn has_activity(&self) -> bool {
        !self.stays.is_empty() || !self.trips.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_activity() && self.data_gaps.is_empty()
    }

    pub fn event_count(&self) -> usize {
        self.stays.len() + self.trips.len() + self.data_gaps.len()
    }

    /// All events merged into one chronological list.
    pub fn events(&self) -> Vec<TimelineEvent> {
        let mut events: Vec<TimelineEvent> = self
            .stays
            .iter()
            .cloned()
            .map(TimelineEvent::Stay)
            .chain(self.trips.iter().cloned().map(TimelineEvent::Trip))
            .chain(self.data_gaps.iter().cloned().map(TimelineEvent::DataGap))
            .collect();
        events.sort_by_key(|e| (e.start(), e.kind()));
        events
    }

    /// Earliest start among stays and trips.
    pub fn first_activity_start(&self) -> Option<DateTime<Utc>> {
        self.stays
            .iter()
            .map(|s| s.start)
            .chain(self.trips.iter().map(|t| t.start))
            .min()
    }

    /// Latest end among stays and trips.
    pub fn last_activity_end(&self) -> Option<DateTime<Utc>> {
        self.stays
            .iter()
            .map(|s| s.end())
            .chain(self.trips.iter().map(|t| t.end()))
            .max()
    }

    pub fn with_source(mut self, data_source: DataSource) -> Self {
        self.data_source = data_source;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 15, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_stay_end_from_duration() {
        let stay = TimelineStay::new(at(8), at(10), GpsPoint::new(52.0, 13.0));
        assert_eq!(stay.duration_seconds, 7200);
        assert_eq!(stay.end(), at(10));
    }

    #[test]
    fn test_with_end_and_with_start() {
        let event = TimelineEvent::Stay(TimelineStay::new(at(8), at(10), GpsPoint::new(0.0, 0.0)));
        assert_eq!(event.with_end(at(12)).end(), at(12));
        assert_eq!(event.with_end(at(12)).start(), at(8));

        let moved = event.with_start(at(9));
        assert_eq!(moved.start(), at(9));
        assert_eq!(moved.end(), at(10));

        let gap = TimelineEvent::DataGap(DataGap::new(at(1), at(3)));
        assert_eq!(gap.with_end(at(0)).end(), at(1));
    }

    #[test]
    fn test_from_events_sorts_each_list() {
        let user = UserId::new_v4();
        let timeline = MovementTimeline::from_events(
            user,
            vec![
                TimelineEvent::Stay(TimelineStay::new(at(12), at(13), GpsPoint::new(0.0, 0.0))),
                TimelineEvent::DataGap(DataGap::new(at(1), at(3))),
                TimelineEvent::Stay(TimelineStay::new(at(8), at(9), GpsPoint::new(0.0, 0.0))),
            ],
            DataSource::Cached,
            at(23),
        );
        assert_eq!(timeline.stays[0].start, at(8));
        assert_eq!(timeline.stays[1].start, at(12));
        assert_eq!(timeline.first_activity_start(), Some(at(8)));
        assert_eq!(timeline.last_activity_end(), Some(at(13)));
        assert_eq!(timeline.events()[0].kind(), EventKind::DataGap);
    }

    #[test]
    fn test_gap_only_timeline_has_no_activity() {
        let mut timeline = MovementTimeline::empty(UserId::new_v4(), DataSource::Live, at(0));
        assert!(timeline.is_empty());
        timeline.push(TimelineEvent::DataGap(DataGap::new(at(1), at(2))));
        assert!(!timeline.has_activity());
        assert!(!timeline.is_empty());
    }

    #[test]
    fn test_movement_type_classification() {
        assert_eq!(MovementType::from_speeds(4.5, 6.0), MovementType::Walk);
        assert_eq!(MovementType::from_speeds(18.0, 30.0), MovementType::Bicycle);
        assert_eq!(MovementType::from_speeds(60.0, 110.0), MovementType::Car);
        assert_eq!(MovementType::from_speeds(f64::NAN, 0.0), MovementType::Unknown);
    }
}
