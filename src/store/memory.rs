//! In-process reference store.
//!
//! Implements all three storage seams behind one `RwLock`, so every bulk
//! operation (range delete, stay repointing) is atomic with respect to
//! other callers. Geocoding facts are indexed in an R-tree over their
//! request coordinates for radius lookups.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use rstar::{PointDistance, RTree, RTreeObject, AABB};

use crate::geocoding::GeocodingLocation;
use crate::spatial::meters_to_degrees;
use crate::store::{EventStore, GeocodingStore, PointSource};
use crate::timeline::{LocationRef, TimelineEvent, TimelineStay};
use crate::{haversine_distance, GpsPoint, OptionExt, Result, TimelineError, TrackPoint, UserId};

/// A geocoding fact's request coordinate for R-tree queries.
#[derive(Debug, Clone, Copy, PartialEq)]
struct IndexedLocation {
    id: i64,
    lat: f64,
    lng: f64,
}

impl RTreeObject for IndexedLocation {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.lat, self.lng])
    }
}

impl PointDistance for IndexedLocation {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dlat = self.lat - point[0];
        let dlng = self.lng - point[1];
        dlat * dlat + dlng * dlng
    }
}

#[derive(Debug, Default)]
struct Inner {
    points: HashMap<UserId, Vec<TrackPoint>>,
    events: HashMap<UserId, BTreeMap<i64, TimelineEvent>>,
    next_event_id: i64,
    locations: BTreeMap<i64, GeocodingLocation>,
    location_index: RTree<IndexedLocation>,
    next_location_id: i64,
}

/// Thread-safe in-memory implementation of every storage seam.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| TimelineError::Persistence("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| TimelineError::Persistence("memory store lock poisoned".to_string()))
    }

    /// Append points for a user, keeping them sorted by timestamp.
    pub fn add_points(&self, user: UserId, points: impl IntoIterator<Item = TrackPoint>) -> Result<()> {
        let mut inner = self.write()?;
        let stored = inner.points.entry(user).or_default();
        stored.extend(points);
        stored.sort_by_key(|p| p.timestamp);
        Ok(())
    }

    /// Every persisted event of a user, chronological.
    pub fn all_events(&self, user: UserId) -> Result<Vec<TimelineEvent>> {
        let inner = self.read()?;
        Ok(sorted(
            inner
                .events
                .get(&user)
                .map(|events| events.values().cloned().collect())
                .unwrap_or_default(),
        ))
    }
}

fn sorted(mut events: Vec<TimelineEvent>) -> Vec<TimelineEvent> {
    events.sort_by_key(|e| (e.start(), e.kind()));
    events
}

impl PointSource for MemoryStore {
    fn list_points(
        &self,
        user: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TrackPoint>> {
        let inner = self.read()?;
        Ok(inner
            .points
            .get(&user)
            .map(|points| {
                points
                    .iter()
                    .filter(|p| p.timestamp >= start && p.timestamp < end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

impl EventStore for MemoryStore {
    fn find_events_in_range(
        &self,
        user: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TimelineEvent>> {
        let inner = self.read()?;
        let events = inner
            .events
            .get(&user)
            .map(|events| {
                events
                    .values()
                    .filter(|e| e.start() >= start && e.start() < end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(sorted(events))
    }

    fn find_events_with_boundary_expansion(
        &self,
        user: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TimelineEvent>> {
        let inner = self.read()?;
        let events = inner
            .events
            .get(&user)
            .map(|events| {
                events
                    .values()
                    .filter(|e| e.start() < end && (e.start() >= start || e.end() > start))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(sorted(events))
    }

    fn find_latest_event_before(
        &self,
        user: UserId,
        before: DateTime<Utc>,
    ) -> Result<Option<TimelineEvent>> {
        let inner = self.read()?;
        Ok(inner.events.get(&user).and_then(|events| {
            events
                .values()
                .filter(|e| e.start() < before)
                .max_by_key(|e| (e.start(), e.end()))
                .cloned()
        }))
    }

    fn delete_events_in_range(
        &self,
        user: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize> {
        let mut inner = self.write()?;
        let Some(events) = inner.events.get_mut(&user) else {
            return Ok(0);
        };
        let before = events.len();
        events.retain(|_, e| !(e.start() >= start && e.start() < end));
        Ok(before - events.len())
    }

    fn persist(&self, user: UserId, mut event: TimelineEvent) -> Result<TimelineEvent> {
        let mut inner = self.write()?;
        inner.next_event_id += 1;
        let id = inner.next_event_id;
        event.set_id(Some(id));
        inner.events.entry(user).or_default().insert(id, event.clone());
        Ok(event)
    }

    fn update_event(&self, user: UserId, event: &TimelineEvent) -> Result<()> {
        let id = event.id().ok_or_invalid("cannot update an event without id")?;
        let mut inner = self.write()?;
        let slot = inner
            .events
            .get_mut(&user)
            .and_then(|events| events.get_mut(&id))
            .ok_or_not_found("TimelineEvent", id)?;
        *slot = event.clone();
        Ok(())
    }

    fn mark_stale(&self, user: UserId, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.write()?;
        let Some(events) = inner.events.get_mut(&user) else {
            return Ok(0);
        };
        let mut count = 0;
        for event in events.values_mut().filter(|e| e.overlaps(start, end)) {
            match event {
                TimelineEvent::Stay(s) => s.stale = true,
                TimelineEvent::Trip(t) => t.stale = true,
                TimelineEvent::DataGap(g) => g.stale = true,
            }
            count += 1;
        }
        Ok(count)
    }

    fn event_bounds(&self, user: UserId) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let inner = self.read()?;
        Ok(inner.events.get(&user).and_then(|events| {
            let start = events.values().map(|e| e.start()).min()?;
            let end = events.values().map(|e| e.end()).max()?;
            Some((start, end))
        }))
    }

    fn find_stays_by_location(
        &self,
        user: UserId,
        location: LocationRef,
    ) -> Result<Vec<TimelineStay>> {
        let inner = self.read()?;
        let mut stays: Vec<TimelineStay> = inner
            .events
            .get(&user)
            .map(|events| {
                events
                    .values()
                    .filter_map(|e| match e {
                        TimelineEvent::Stay(s) if s.location_ref == Some(location) => {
                            Some(s.clone())
                        }
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        stays.sort_by_key(|s| s.start);
        Ok(stays)
    }

    fn repoint_stays(&self, user: UserId, from_geocoding_id: i64, to_geocoding_id: i64) -> Result<usize> {
        let mut inner = self.write()?;
        let Some(events) = inner.events.get_mut(&user) else {
            return Ok(0);
        };
        let mut count = 0;
        for event in events.values_mut() {
            if let TimelineEvent::Stay(s) = event {
                if s.location_ref == Some(LocationRef::Geocoding(from_geocoding_id)) {
                    s.location_ref = Some(LocationRef::Geocoding(to_geocoding_id));
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    fn rename_stays(&self, user: Option<UserId>, geocoding_id: i64, name: &str) -> Result<usize> {
        let mut inner = self.write()?;
        let mut count = 0;
        for (owner, events) in inner.events.iter_mut() {
            if user.is_some_and(|u| u != *owner) {
                continue;
            }
            for event in events.values_mut() {
                if let TimelineEvent::Stay(s) = event {
                    if s.geocoding_id() == Some(geocoding_id) {
                        s.location_name = name.to_string();
                        count += 1;
                    }
                }
            }
        }
        Ok(count)
    }
}

impl GeocodingStore for MemoryStore {
    fn get_location(&self, id: i64) -> Result<Option<GeocodingLocation>> {
        Ok(self.read()?.locations.get(&id).cloned())
    }

    fn find_nearest_location(
        &self,
        point: &GpsPoint,
        radius_meters: f64,
        user: Option<UserId>,
    ) -> Result<Option<GeocodingLocation>> {
        let inner = self.read()?;
        let (dlat, dlng) = meters_to_degrees(radius_meters, point.latitude);
        let envelope = AABB::from_corners(
            [point.latitude - dlat, point.longitude - dlng],
            [point.latitude + dlat, point.longitude + dlng],
        );

        let best = inner
            .location_index
            .locate_in_envelope(&envelope)
            .filter_map(|entry| inner.locations.get(&entry.id))
            .filter(|loc| loc.user_id.is_none() || loc.user_id == user)
            .map(|loc| (loc, haversine_distance(point, &loc.request_point)))
            .filter(|(_, d)| *d <= radius_meters)
            // own copies first, then nearest
            .min_by(|(a, da), (b, db)| {
                let a_own = a.user_id.is_some();
                let b_own = b.user_id.is_some();
                b_own.cmp(&a_own).then(da.total_cmp(db))
            })
            .map(|(loc, _)| loc.clone());
        Ok(best)
    }

    fn find_user_copy(&self, user: UserId, source_id: i64) -> Result<Option<GeocodingLocation>> {
        Ok(self
            .read()?
            .locations
            .values()
            .find(|loc| loc.user_id == Some(user) && loc.source_id == Some(source_id))
            .cloned())
    }

    fn insert_location(&self, mut location: GeocodingLocation) -> Result<GeocodingLocation> {
        let mut inner = self.write()?;
        inner.next_location_id += 1;
        let id = inner.next_location_id;
        location.id = Some(id);
        inner.location_index.insert(IndexedLocation {
            id,
            lat: location.request_point.latitude,
            lng: location.request_point.longitude,
        });
        inner.locations.insert(id, location.clone());
        Ok(location)
    }

    fn update_location(&self, location: &GeocodingLocation) -> Result<()> {
        let id = location
            .id
            .ok_or_invalid("cannot update a geocoding location without id")?;
        let mut inner = self.write()?;
        let previous = inner
            .locations
            .get(&id)
            .cloned()
            .ok_or_not_found("GeocodingLocation", id)?;
        if previous.request_point != location.request_point {
            inner.location_index.remove(&IndexedLocation {
                id,
                lat: previous.request_point.latitude,
                lng: previous.request_point.longitude,
            });
            inner.location_index.insert(IndexedLocation {
                id,
                lat: location.request_point.latitude,
                lng: location.request_point.longitude,
            });
        }
        inner.locations.insert(id, location.clone());
        Ok(())
    }
}
