//! Storage seams.
//!
//! The timeline core never talks to a database directly. It consumes
//! points through [`PointSource`], persists day-scoped results through
//! [`EventStore`] and caches geocoding facts through [`GeocodingStore`].
//! All three are synchronous; transaction boundaries belong to the
//! implementation.
//!
//! Range conventions shared by every implementation:
//! - "in range" means the event *starts* inside `[start, end)`
//! - "boundary expansion" adds events that start earlier but end after `start`
//! - "latest before t" is the event with the greatest start strictly before `t`

mod memory;
pub use memory::MemoryStore;

#[cfg(feature = "persistence")]
mod sqlite;
#[cfg(feature = "persistence")]
pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};

use crate::geocoding::GeocodingLocation;
use crate::timeline::{LocationRef, TimelineEvent, TimelineStay};
use crate::{GpsPoint, Result, TrackPoint, UserId};

/// Ordered raw points per user.
pub trait PointSource: Send + Sync {
    /// Points with `start <= timestamp < end`, oldest first.
    fn list_points(
        &self,
        user: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TrackPoint>>;

    /// Timestamp of the newest point in `[start, end)`.
    fn latest_point_time(
        &self,
        user: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .list_points(user, start, end)?
            .last()
            .map(|p| p.timestamp))
    }
}

/// Persisted stays, trips and data gaps.
pub trait EventStore: Send + Sync {
    /// Events starting in `[start, end)`, chronological.
    fn find_events_in_range(
        &self,
        user: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TimelineEvent>>;

    /// Events overlapping `[start, end)`, including ones that began earlier.
    fn find_events_with_boundary_expansion(
        &self,
        user: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TimelineEvent>>;

    /// Whether any event overlaps `[start, end)`.
    fn has_events_in_range(
        &self,
        user: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(!self
            .find_events_with_boundary_expansion(user, start, end)?
            .is_empty())
    }

    fn find_latest_event_before(
        &self,
        user: UserId,
        before: DateTime<Utc>,
    ) -> Result<Option<TimelineEvent>>;

    /// Delete events starting in `[start, end)`. Deleting nothing is fine.
    fn delete_events_in_range(
        &self,
        user: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize>;

    /// Insert an event and return it with its assigned id.
    fn persist(&self, user: UserId, event: TimelineEvent) -> Result<TimelineEvent>;

    /// Overwrite an already persisted event (matched by id).
    fn update_event(&self, user: UserId, event: &TimelineEvent) -> Result<()>;

    /// Flag events overlapping `[start, end)` as stale.
    fn mark_stale(&self, user: UserId, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<usize>;

    /// Earliest start and latest end over all of a user's events.
    fn event_bounds(&self, user: UserId) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>>;

    /// Stays referencing a favorite or geocoding fact.
    fn find_stays_by_location(&self, user: UserId, location: LocationRef)
        -> Result<Vec<TimelineStay>>;

    /// Repoint every stay of `user` from one geocoding fact to another in
    /// one atomic bulk update.
    fn repoint_stays(&self, user: UserId, from_geocoding_id: i64, to_geocoding_id: i64)
        -> Result<usize>;

    /// Rewrite the denormalized name of stays referencing `geocoding_id`,
    /// for one user or (with `None`) for everyone.
    fn rename_stays(&self, user: Option<UserId>, geocoding_id: i64, name: &str) -> Result<usize>;
}

/// Cached coordinate → display-name facts.
pub trait GeocodingStore: Send + Sync {
    fn get_location(&self, id: i64) -> Result<Option<GeocodingLocation>>;

    /// Nearest fact within `radius_meters` of `point` visible to `user`:
    /// the user's own copies win over shared originals; other users'
    /// copies are never returned.
    fn find_nearest_location(
        &self,
        point: &GpsPoint,
        radius_meters: f64,
        user: Option<UserId>,
    ) -> Result<Option<GeocodingLocation>>;

    /// The copy `user` already made of the original `source_id`, if any.
    fn find_user_copy(&self, user: UserId, source_id: i64) -> Result<Option<GeocodingLocation>>;

    /// Insert and return with its assigned id.
    fn insert_location(&self, location: GeocodingLocation) -> Result<GeocodingLocation>;

    /// Overwrite an existing fact (matched by id).
    fn update_location(&self, location: &GeocodingLocation) -> Result<()>;
}
