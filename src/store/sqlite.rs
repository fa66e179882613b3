//! SQLite-backed reference store.
//!
//! One connection behind a mutex. Timestamps are stored as UTC
//! microseconds, trip paths as MessagePack BLOBs. Radius lookups prefilter
//! on a lat/lng bounding box in SQL and finish with Haversine in Rust.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::debug;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::geocoding::{BoundingBox, GeocodingLocation};
use crate::spatial::meters_to_degrees;
use crate::store::{EventStore, GeocodingStore, PointSource};
use crate::timeline::{
    DataGap, EventKind, LocationRef, MovementType, TimelineEvent, TimelineStay, TimelineTrip,
};
use crate::{haversine_distance, GpsPoint, Result, TimelineError, TrackPoint, UserId};

const EVENT_COLUMNS: &str = "id, kind, start_us, end_us, stale, latitude, longitude, \
     location_name, favorite_id, geocoding_id, path, distance, movement_type";

const LOCATION_COLUMNS: &str = "id, user_id, source_id, request_lat, request_lng, result_lat, \
     result_lng, bbox_min_lat, bbox_max_lat, bbox_min_lng, bbox_max_lng, display_name, city, \
     country, provider_name, created_us, updated_us";

pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database at `db_path`.
    pub fn new(db_path: &str) -> Result<Self> {
        let db = Connection::open(db_path)?;
        Self::init_schema(&db)?;
        Ok(Self { db: Mutex::new(db) })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- Raw points, read-only for the timeline core
            CREATE TABLE IF NOT EXISTS gps_points (
                user_id TEXT NOT NULL,
                ts_us INTEGER NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                accuracy REAL,
                velocity REAL
            );

            -- Stays, trips and data gaps
            CREATE TABLE IF NOT EXISTS timeline_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                start_us INTEGER NOT NULL,
                end_us INTEGER NOT NULL,
                stale INTEGER NOT NULL DEFAULT 0,
                latitude REAL,
                longitude REAL,
                location_name TEXT,
                favorite_id INTEGER,
                geocoding_id INTEGER,
                path BLOB,
                distance REAL,
                movement_type TEXT
            );

            -- Geocoding facts; user_id NULL marks a shared original
            CREATE TABLE IF NOT EXISTS geocoding_locations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT,
                source_id INTEGER REFERENCES geocoding_locations(id),
                request_lat REAL NOT NULL,
                request_lng REAL NOT NULL,
                result_lat REAL NOT NULL,
                result_lng REAL NOT NULL,
                bbox_min_lat REAL,
                bbox_max_lat REAL,
                bbox_min_lng REAL,
                bbox_max_lng REAL,
                display_name TEXT NOT NULL,
                city TEXT,
                country TEXT,
                provider_name TEXT NOT NULL,
                created_us INTEGER NOT NULL,
                updated_us INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_points_user_ts ON gps_points(user_id, ts_us);
            CREATE INDEX IF NOT EXISTS idx_events_user_start ON timeline_events(user_id, start_us);
            CREATE INDEX IF NOT EXISTS idx_events_user_geocoding ON timeline_events(user_id, geocoding_id);
            CREATE INDEX IF NOT EXISTS idx_locations_request ON geocoding_locations(request_lat, request_lng);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_locations_user_copy
                ON geocoding_locations(user_id, source_id) WHERE user_id IS NOT NULL;
        "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| TimelineError::Persistence("sqlite connection lock poisoned".to_string()))
    }

    /// Append points for a user.
    pub fn add_points(&self, user: UserId, points: &[TrackPoint]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO gps_points (user_id, ts_us, latitude, longitude, accuracy, velocity)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )?;
            for p in points {
                stmt.execute(params![
                    user.to_string(),
                    p.timestamp.timestamp_micros(),
                    p.latitude,
                    p.longitude,
                    p.accuracy,
                    p.velocity
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn query_events(&self, sql: &str, user: UserId, a: i64, b: i64) -> Result<Vec<TimelineEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let events = stmt
            .query_map(params![user.to_string(), a, b], row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }
}

// ============================================================================
// Row conversion
// ============================================================================

fn micros(us: i64, col: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(us).ok_or(rusqlite::Error::IntegralValueOutOfRange(col, us))
}

fn conversion_error(col: usize, ty: Type, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, ty, Box::new(e))
}

fn parse_user(raw: &str, col: usize) -> rusqlite::Result<UserId> {
    UserId::parse_str(raw).map_err(|e| conversion_error(col, Type::Text, e))
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<TimelineEvent> {
    let id: i64 = row.get(0)?;
    let kind: String = row.get(1)?;
    let start = micros(row.get(2)?, 2)?;
    let end = micros(row.get(3)?, 3)?;
    let stale: bool = row.get(4)?;

    match EventKind::parse(&kind) {
        Some(EventKind::Stay) => {
            let favorite: Option<i64> = row.get(8)?;
            let geocoding: Option<i64> = row.get(9)?;
            let mut stay = TimelineStay::new(start, end, GpsPoint::new(row.get(5)?, row.get(6)?));
            stay.id = Some(id);
            stay.stale = stale;
            stay.location_name = row.get::<_, Option<String>>(7)?.unwrap_or_default();
            stay.location_ref = favorite
                .map(LocationRef::Favorite)
                .or(geocoding.map(LocationRef::Geocoding));
            Ok(TimelineEvent::Stay(stay))
        }
        Some(EventKind::Trip) => {
            let blob: Option<Vec<u8>> = row.get(10)?;
            let path: Vec<GpsPoint> = match blob {
                Some(bytes) => rmp_serde::from_slice(&bytes).map_err(|e| conversion_error(10, Type::Blob, e))?,
                None => Vec::new(),
            };
            Ok(TimelineEvent::Trip(TimelineTrip {
                id: Some(id),
                start,
                duration_seconds: (end - start).num_seconds(),
                path,
                distance_meters: row.get::<_, Option<f64>>(11)?.unwrap_or(0.0),
                movement_type: MovementType::parse(&row.get::<_, Option<String>>(12)?.unwrap_or_default()),
                stale,
            }))
        }
        Some(EventKind::DataGap) => Ok(TimelineEvent::DataGap(DataGap {
            id: Some(id),
            start,
            end,
            stale,
        })),
        None => Err(rusqlite::Error::InvalidColumnType(1, kind, Type::Text)),
    }
}

fn row_to_location(row: &Row<'_>) -> rusqlite::Result<GeocodingLocation> {
    let user_id = match row.get::<_, Option<String>>(1)? {
        Some(raw) => Some(parse_user(&raw, 1)?),
        None => None,
    };
    let bbox: (Option<f64>, Option<f64>, Option<f64>, Option<f64>) =
        (row.get(7)?, row.get(8)?, row.get(9)?, row.get(10)?);
    let bounding_box = match bbox {
        (Some(min_latitude), Some(max_latitude), Some(min_longitude), Some(max_longitude)) => Some(BoundingBox {
            min_latitude,
            max_latitude,
            min_longitude,
            max_longitude,
        }),
        _ => None,
    };

    Ok(GeocodingLocation {
        id: Some(row.get(0)?),
        user_id,
        source_id: row.get(2)?,
        request_point: GpsPoint::new(row.get(3)?, row.get(4)?),
        result_point: GpsPoint::new(row.get(5)?, row.get(6)?),
        bounding_box,
        display_name: row.get(11)?,
        city: row.get(12)?,
        country: row.get(13)?,
        provider_name: row.get(14)?,
        created_at: micros(row.get(15)?, 15)?,
        updated_at: micros(row.get(16)?, 16)?,
    })
}

/// Column values shared by insert and update of an event.
struct EventRow {
    kind: &'static str,
    start_us: i64,
    end_us: i64,
    stale: bool,
    latitude: Option<f64>,
    longitude: Option<f64>,
    location_name: Option<String>,
    favorite_id: Option<i64>,
    geocoding_id: Option<i64>,
    path: Option<Vec<u8>>,
    distance: Option<f64>,
    movement_type: Option<&'static str>,
}

impl EventRow {
    fn from_event(event: &TimelineEvent) -> Result<Self> {
        let mut row = EventRow {
            kind: event.kind().as_str(),
            start_us: event.start().timestamp_micros(),
            end_us: event.end().timestamp_micros(),
            stale: event.is_stale(),
            latitude: None,
            longitude: None,
            location_name: None,
            favorite_id: None,
            geocoding_id: None,
            path: None,
            distance: None,
            movement_type: None,
        };
        match event {
            TimelineEvent::Stay(s) => {
                row.latitude = Some(s.location.latitude);
                row.longitude = Some(s.location.longitude);
                row.location_name = Some(s.location_name.clone());
                match s.location_ref {
                    Some(LocationRef::Favorite(id)) => row.favorite_id = Some(id),
                    Some(LocationRef::Geocoding(id)) => row.geocoding_id = Some(id),
                    None => {}
                }
            }
            TimelineEvent::Trip(t) => {
                row.path = Some(
                    rmp_serde::to_vec(&t.path)
                        .map_err(|e| TimelineError::Persistence(format!("path encoding: {}", e)))?,
                );
                row.distance = Some(t.distance_meters);
                row.movement_type = Some(t.movement_type.as_str());
            }
            TimelineEvent::DataGap(_) => {}
        }
        Ok(row)
    }
}

impl PointSource for SqliteStore {
    fn list_points(
        &self,
        user: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TrackPoint>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT ts_us, latitude, longitude, accuracy, velocity FROM gps_points
             WHERE user_id = ? AND ts_us >= ? AND ts_us < ? ORDER BY ts_us",
        )?;
        let points = stmt
            .query_map(
                params![user.to_string(), start.timestamp_micros(), end.timestamp_micros()],
                |row| {
                    Ok(TrackPoint {
                        timestamp: micros(row.get(0)?, 0)?,
                        latitude: row.get(1)?,
                        longitude: row.get(2)?,
                        accuracy: row.get(3)?,
                        velocity: row.get(4)?,
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(points)
    }

    fn latest_point_time(
        &self,
        user: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        let latest: Option<i64> = conn.query_row(
            "SELECT MAX(ts_us) FROM gps_points WHERE user_id = ? AND ts_us >= ? AND ts_us < ?",
            params![user.to_string(), start.timestamp_micros(), end.timestamp_micros()],
            |row| row.get(0),
        )?;
        Ok(latest.and_then(DateTime::from_timestamp_micros))
    }
}

impl EventStore for SqliteStore {
    fn find_events_in_range(
        &self,
        user: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TimelineEvent>> {
        self.query_events(
            &format!(
                "SELECT {} FROM timeline_events WHERE user_id = ? AND start_us >= ? AND start_us < ?
                 ORDER BY start_us, kind",
                EVENT_COLUMNS
            ),
            user,
            start.timestamp_micros(),
            end.timestamp_micros(),
        )
    }

    fn find_events_with_boundary_expansion(
        &self,
        user: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TimelineEvent>> {
        self.query_events(
            &format!(
                "SELECT {} FROM timeline_events WHERE user_id = ?1 AND start_us < ?3
                 AND (start_us >= ?2 OR end_us > ?2) ORDER BY start_us, kind",
                EVENT_COLUMNS
            ),
            user,
            start.timestamp_micros(),
            end.timestamp_micros(),
        )
    }

    fn find_latest_event_before(
        &self,
        user: UserId,
        before: DateTime<Utc>,
    ) -> Result<Option<TimelineEvent>> {
        let conn = self.conn()?;
        let event = conn
            .query_row(
                &format!(
                    "SELECT {} FROM timeline_events WHERE user_id = ? AND start_us < ?
                     ORDER BY start_us DESC, end_us DESC LIMIT 1",
                    EVENT_COLUMNS
                ),
                params![user.to_string(), before.timestamp_micros()],
                row_to_event,
            )
            .optional()?;
        Ok(event)
    }

    fn delete_events_in_range(
        &self,
        user: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM timeline_events WHERE user_id = ? AND start_us >= ? AND start_us < ?",
            params![user.to_string(), start.timestamp_micros(), end.timestamp_micros()],
        )?;
        Ok(deleted)
    }

    fn persist(&self, user: UserId, mut event: TimelineEvent) -> Result<TimelineEvent> {
        let row = EventRow::from_event(&event)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO timeline_events (user_id, kind, start_us, end_us, stale, latitude, longitude,
                location_name, favorite_id, geocoding_id, path, distance, movement_type)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                user.to_string(),
                row.kind,
                row.start_us,
                row.end_us,
                row.stale,
                row.latitude,
                row.longitude,
                row.location_name,
                row.favorite_id,
                row.geocoding_id,
                row.path,
                row.distance,
                row.movement_type
            ],
        )?;
        event.set_id(Some(conn.last_insert_rowid()));
        Ok(event)
    }

    fn update_event(&self, user: UserId, event: &TimelineEvent) -> Result<()> {
        let id = event
            .id()
            .ok_or_else(|| TimelineError::InvalidArgument("cannot update an event without id".to_string()))?;
        let row = EventRow::from_event(event)?;
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE timeline_events SET kind = ?, start_us = ?, end_us = ?, stale = ?, latitude = ?,
                longitude = ?, location_name = ?, favorite_id = ?, geocoding_id = ?, path = ?,
                distance = ?, movement_type = ?
             WHERE id = ? AND user_id = ?",
            params![
                row.kind,
                row.start_us,
                row.end_us,
                row.stale,
                row.latitude,
                row.longitude,
                row.location_name,
                row.favorite_id,
                row.geocoding_id,
                row.path,
                row.distance,
                row.movement_type,
                id,
                user.to_string()
            ],
        )?;
        if updated == 0 {
            return Err(TimelineError::NotFound {
                entity: "TimelineEvent",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    fn mark_stale(&self, user: UserId, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let marked = conn.execute(
            "UPDATE timeline_events SET stale = 1 WHERE user_id = ? AND start_us < ? AND end_us > ?",
            params![user.to_string(), end.timestamp_micros(), start.timestamp_micros()],
        )?;
        Ok(marked)
    }

    fn event_bounds(&self, user: UserId) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let conn = self.conn()?;
        let (min, max): (Option<i64>, Option<i64>) = conn.query_row(
            "SELECT MIN(start_us), MAX(end_us) FROM timeline_events WHERE user_id = ?",
            params![user.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(match (min, max) {
            (Some(min), Some(max)) => DateTime::from_timestamp_micros(min).zip(DateTime::from_timestamp_micros(max)),
            _ => None,
        })
    }

    fn find_stays_by_location(
        &self,
        user: UserId,
        location: LocationRef,
    ) -> Result<Vec<TimelineStay>> {
        let (column, id) = match location {
            LocationRef::Favorite(id) => ("favorite_id", id),
            LocationRef::Geocoding(id) => ("geocoding_id", id),
        };
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM timeline_events WHERE user_id = ? AND kind = 'STAY' AND {} = ?
             ORDER BY start_us",
            EVENT_COLUMNS, column
        ))?;
        let stays = stmt
            .query_map(params![user.to_string(), id], row_to_event)?
            .filter_map(|event| match event {
                Ok(TimelineEvent::Stay(stay)) => Some(Ok(stay)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            })
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(stays)
    }

    fn repoint_stays(&self, user: UserId, from_geocoding_id: i64, to_geocoding_id: i64) -> Result<usize> {
        let conn = self.conn()?;
        let moved = conn.execute(
            "UPDATE timeline_events SET geocoding_id = ?
             WHERE user_id = ? AND kind = 'STAY' AND geocoding_id = ?",
            params![to_geocoding_id, user.to_string(), from_geocoding_id],
        )?;
        Ok(moved)
    }

    fn rename_stays(&self, user: Option<UserId>, geocoding_id: i64, name: &str) -> Result<usize> {
        let conn = self.conn()?;
        let renamed = match user {
            Some(user) => conn.execute(
                "UPDATE timeline_events SET location_name = ?
                 WHERE user_id = ? AND kind = 'STAY' AND geocoding_id = ?",
                params![name, user.to_string(), geocoding_id],
            )?,
            None => conn.execute(
                "UPDATE timeline_events SET location_name = ? WHERE kind = 'STAY' AND geocoding_id = ?",
                params![name, geocoding_id],
            )?,
        };
        debug!("[SqliteStore] renamed {} stays for geocoding {}", renamed, geocoding_id);
        Ok(renamed)
    }
}

impl GeocodingStore for SqliteStore {
    fn get_location(&self, id: i64) -> Result<Option<GeocodingLocation>> {
        let conn = self.conn()?;
        let location = conn
            .query_row(
                &format!("SELECT {} FROM geocoding_locations WHERE id = ?", LOCATION_COLUMNS),
                params![id],
                row_to_location,
            )
            .optional()?;
        Ok(location)
    }

    fn find_nearest_location(
        &self,
        point: &GpsPoint,
        radius_meters: f64,
        user: Option<UserId>,
    ) -> Result<Option<GeocodingLocation>> {
        let (dlat, dlng) = meters_to_degrees(radius_meters, point.latitude);
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM geocoding_locations
             WHERE request_lat BETWEEN ? AND ? AND request_lng BETWEEN ? AND ?
               AND (user_id IS NULL OR user_id = ?)",
            LOCATION_COLUMNS
        ))?;
        let candidates = stmt
            .query_map(
                params![
                    point.latitude - dlat,
                    point.latitude + dlat,
                    point.longitude - dlng,
                    point.longitude + dlng,
                    user.map(|u| u.to_string())
                ],
                row_to_location,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(candidates
            .into_iter()
            .map(|loc| {
                let d = haversine_distance(point, &loc.request_point);
                (loc, d)
            })
            .filter(|(_, d)| *d <= radius_meters)
            // own copies first, then nearest
            .min_by(|(a, da), (b, db)| {
                b.user_id.is_some().cmp(&a.user_id.is_some()).then(da.total_cmp(db))
            })
            .map(|(loc, _)| loc))
    }

    fn find_user_copy(&self, user: UserId, source_id: i64) -> Result<Option<GeocodingLocation>> {
        let conn = self.conn()?;
        let location = conn
            .query_row(
                &format!(
                    "SELECT {} FROM geocoding_locations WHERE user_id = ? AND source_id = ?",
                    LOCATION_COLUMNS
                ),
                params![user.to_string(), source_id],
                row_to_location,
            )
            .optional()?;
        Ok(location)
    }

    fn insert_location(&self, mut location: GeocodingLocation) -> Result<GeocodingLocation> {
        let bbox = location.bounding_box;
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO geocoding_locations ({}) VALUES (NULL, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                LOCATION_COLUMNS
            ),
            params![
                location.user_id.map(|u| u.to_string()),
                location.source_id,
                location.request_point.latitude,
                location.request_point.longitude,
                location.result_point.latitude,
                location.result_point.longitude,
                bbox.map(|b| b.min_latitude),
                bbox.map(|b| b.max_latitude),
                bbox.map(|b| b.min_longitude),
                bbox.map(|b| b.max_longitude),
                location.display_name,
                location.city,
                location.country,
                location.provider_name,
                location.created_at.timestamp_micros(),
                location.updated_at.timestamp_micros()
            ],
        )?;
        location.id = Some(conn.last_insert_rowid());
        Ok(location)
    }

    fn update_location(&self, location: &GeocodingLocation) -> Result<()> {
        let id = location.id.ok_or_else(|| {
            TimelineError::InvalidArgument("cannot update a geocoding location without id".to_string())
        })?;
        let bbox = location.bounding_box;
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE geocoding_locations SET user_id = ?, source_id = ?, request_lat = ?, request_lng = ?,
                result_lat = ?, result_lng = ?, bbox_min_lat = ?, bbox_max_lat = ?, bbox_min_lng = ?,
                bbox_max_lng = ?, display_name = ?, city = ?, country = ?, provider_name = ?,
                updated_us = ?
             WHERE id = ?",
            params![
                location.user_id.map(|u| u.to_string()),
                location.source_id,
                location.request_point.latitude,
                location.request_point.longitude,
                location.result_point.latitude,
                location.result_point.longitude,
                bbox.map(|b| b.min_latitude),
                bbox.map(|b| b.max_latitude),
                bbox.map(|b| b.min_longitude),
                bbox.map(|b| b.max_longitude),
                location.display_name,
                location.city,
                location.country,
                location.provider_name,
                location.updated_at.timestamp_micros(),
                id
            ],
        )?;
        if updated == 0 {
            return Err(TimelineError::NotFound {
                entity: "GeocodingLocation",
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_event_roundtrip_and_ranges() {
        let store = SqliteStore::in_memory().unwrap();
        let user = UserId::new_v4();

        let mut stay = TimelineStay::new(at(14, 20), at(15, 9), GpsPoint::new(52.52, 13.405));
        stay.location_name = "Home".to_string();
        stay.location_ref = Some(LocationRef::Geocoding(3));
        let stay = store.persist(user, TimelineEvent::Stay(stay)).unwrap();

        let trip = TimelineTrip {
            id: None,
            start: at(15, 9),
            duration_seconds: 1800,
            path: vec![GpsPoint::new(52.52, 13.405), GpsPoint::new(52.50, 13.30)],
            distance_meters: 7_800.0,
            movement_type: MovementType::Car,
            stale: false,
        };
        store.persist(user, TimelineEvent::Trip(trip.clone())).unwrap();

        let in_range = store.find_events_in_range(user, at(15, 0), at(16, 0)).unwrap();
        assert_eq!(in_range.len(), 1);
        let TimelineEvent::Trip(loaded) = &in_range[0] else {
            panic!("expected trip");
        };
        assert_eq!(loaded.path, trip.path);
        assert_eq!(loaded.movement_type, MovementType::Car);

        let expanded = store
            .find_events_with_boundary_expansion(user, at(15, 0), at(16, 0))
            .unwrap();
        assert_eq!(expanded.len(), 2);
        assert_eq!(expanded[0], stay);

        assert_eq!(store.find_latest_event_before(user, at(15, 0)).unwrap(), Some(stay));
        assert_eq!(store.delete_events_in_range(user, at(15, 0), at(16, 0)).unwrap(), 1);
    }

    #[test]
    fn test_points_and_latest() {
        let store = SqliteStore::in_memory().unwrap();
        let user = UserId::new_v4();
        store
            .add_points(
                user,
                &[
                    TrackPoint::new(at(10, 8), 1.0, 1.0).with_accuracy(5.0),
                    TrackPoint::new(at(10, 9), 1.0, 1.0),
                ],
            )
            .unwrap();
        assert_eq!(store.list_points(user, at(10, 0), at(11, 0)).unwrap().len(), 2);
        assert_eq!(store.latest_point_time(user, at(10, 0), at(11, 0)).unwrap(), Some(at(10, 9)));
        assert_eq!(store.latest_point_time(user, at(11, 0), at(12, 0)).unwrap(), None);
    }

    #[test]
    fn test_location_lookup_and_repoint() {
        let store = SqliteStore::in_memory().unwrap();
        let alice = UserId::new_v4();
        let here = GpsPoint::new(48.8566, 2.3522);

        let original = store
            .insert_location(GeocodingLocation::original(here, "Paris", "test"))
            .unwrap();
        let mut copy = original.user_copy(alice);
        copy.display_name = "Office".to_string();
        let copy = store.insert_location(copy).unwrap();

        let near = GpsPoint::new(48.85662, 2.3522);
        assert_eq!(store.find_nearest_location(&near, 25.0, Some(alice)).unwrap().unwrap().id, copy.id);
        assert_eq!(store.find_nearest_location(&near, 25.0, None).unwrap().unwrap().id, original.id);
        assert_eq!(
            store.find_user_copy(alice, original.id.unwrap()).unwrap().unwrap().id,
            copy.id
        );

        let mut stay = TimelineStay::new(at(10, 8), at(10, 9), here);
        stay.location_ref = Some(LocationRef::Geocoding(original.id.unwrap()));
        store.persist(alice, TimelineEvent::Stay(stay)).unwrap();
        assert_eq!(store.repoint_stays(alice, original.id.unwrap(), copy.id.unwrap()).unwrap(), 1);
        assert_eq!(store.rename_stays(Some(alice), copy.id.unwrap(), "Office").unwrap(), 1);

        let stays = store
            .find_stays_by_location(alice, LocationRef::Geocoding(copy.id.unwrap()))
            .unwrap();
        assert_eq!(stays[0].location_name, "Office");
    }
}
