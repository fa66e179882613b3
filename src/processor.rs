//! Day-boundary aware timeline regeneration.
//!
//! A full UTC day is processed with the overnight algorithm:
//!
//! 1. Find the latest persisted event before the day starts
//! 2. Without one, generate the day on its own
//! 3. Otherwise regenerate from that event's original start through the
//!    day's end, so a stay that began yesterday sees today's points
//! 4. Stretch the persisted prior event to its recomputed end and persist
//!    only what starts at or after the day boundary
//!
//! Any other range (partial day, several days) is generated in one pass
//! from the start of an event it can continue, with a trailing data gap
//! when GPS data stops before the range ends.

use std::sync::Arc;

use chrono::{DateTime, Duration, Timelike, Utc};
use log::{debug, info};

use crate::detection::TimelineGenerator;
use crate::geocoding::{format_coordinates, LocationResolver};
use crate::store::{EventStore, PointSource};
use crate::timeline::{DataGap, LocationRef, TimelineEvent};
use crate::{Result, TimelineConfig, UserId};

/// A regenerated event is the continuation of the persisted prior event
/// when both have the same kind and their starts differ by at most this.
const MATCH_TOLERANCE_SECONDS: i64 = 60;

pub struct OvernightProcessor {
    points: Arc<dyn PointSource>,
    events: Arc<dyn EventStore>,
    generator: Arc<dyn TimelineGenerator>,
    resolver: Option<Arc<dyn LocationResolver>>,
}

/// Whether `[start, end)` is exactly one UTC calendar day.
pub fn is_full_utc_day(start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    start.num_seconds_from_midnight() == 0
        && start.nanosecond() == 0
        && end - start == Duration::days(1)
}

impl OvernightProcessor {
    pub fn new(
        points: Arc<dyn PointSource>,
        events: Arc<dyn EventStore>,
        generator: Arc<dyn TimelineGenerator>,
    ) -> Self {
        Self {
            points,
            events,
            generator,
            resolver: None,
        }
    }

    /// Name new stays through `resolver` instead of by coordinates.
    pub fn with_resolver(mut self, resolver: Arc<dyn LocationResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Regenerate and persist `[start, end)` for `user`.
    ///
    /// Callers delete leftovers in the range first. Returns the events that
    /// were newly persisted; the stretched prior event is updated in place
    /// and not part of the result.
    pub fn process(
        &self,
        user: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        config: &TimelineConfig,
    ) -> Result<Vec<TimelineEvent>> {
        if is_full_utc_day(start, end) {
            self.process_day(user, start, end, config)
        } else {
            self.process_range(user, start, end, config)
        }
    }

    fn process_day(
        &self,
        user: UserId,
        day_start: DateTime<Utc>,
        day_end: DateTime<Utc>,
        config: &TimelineConfig,
    ) -> Result<Vec<TimelineEvent>> {
        if self.points.latest_point_time(user, day_start, day_end)?.is_none() {
            debug!("[OvernightProcessor] {} has no points on {}", user, day_start.date_naive());
            return self.persist_gap(user, day_start, day_end);
        }

        let Some(prior) = self.continuable_prior(user, day_start, config)? else {
            let points = self.points.list_points(user, day_start, day_end)?;
            let generated = self.generator.generate(user, &points, config)?;
            return self.persist_all(user, generated);
        };

        let generated = self.regenerate_from(user, &prior, day_start, day_end, config)?;
        info!(
            "[OvernightProcessor] {} day {}: continued from {} event at {}",
            user,
            day_start.date_naive(),
            prior.kind().as_str(),
            prior.start()
        );
        self.persist_all(user, generated)
    }

    fn process_range(
        &self,
        user: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        config: &TimelineConfig,
    ) -> Result<Vec<TimelineEvent>> {
        let Some(last_gps) = self.points.latest_point_time(user, start, end)? else {
            debug!("[OvernightProcessor] {} has no points in [{}, {})", user, start, end);
            return self.persist_gap(user, start, end);
        };

        let mut generated = match &self.continuable_prior(user, start, config)? {
            Some(prior) => self.regenerate_from(user, prior, start, end, config)?,
            None => {
                let points = self.points.list_points(user, start, end)?;
                self.generator.generate(user, &points, config)?
            }
        };

        if end - last_gps >= Duration::seconds(config.data_gap_min_duration_seconds) {
            generated.push(TimelineEvent::DataGap(DataGap::new(last_gps, end)));
        }
        self.persist_all(user, generated)
    }

    /// The latest event before `boundary`, if it reaches into it or ended
    /// no more than the data-gap threshold before it.
    fn continuable_prior(
        &self,
        user: UserId,
        boundary: DateTime<Utc>,
        config: &TimelineConfig,
    ) -> Result<Option<TimelineEvent>> {
        let threshold = Duration::seconds(config.data_gap_threshold_seconds);
        Ok(self
            .events
            .find_latest_event_before(user, boundary)?
            .filter(|p| boundary - p.end() <= threshold))
    }

    /// Regenerate from `prior.start()`, stretch `prior` to its recomputed
    /// end and return the events that belong to `[boundary, end)`.
    fn regenerate_from(
        &self,
        user: UserId,
        prior: &TimelineEvent,
        boundary: DateTime<Utc>,
        end: DateTime<Utc>,
        config: &TimelineConfig,
    ) -> Result<Vec<TimelineEvent>> {
        let points = self.points.list_points(user, prior.start(), end)?;
        let generated = self.generator.generate(user, &points, config)?;
        let tolerance = Duration::seconds(MATCH_TOLERANCE_SECONDS);

        let mut matched = false;
        let mut result = Vec::with_capacity(generated.len());
        for event in generated {
            let is_continuation = !matched
                && event.kind() == prior.kind()
                && (event.start() - prior.start()).abs() <= tolerance;

            if is_continuation {
                matched = true;
                if event.end() > prior.end() {
                    let extended = prior.with_end(event.end());
                    self.events.update_event(user, &extended)?;
                    debug!(
                        "[OvernightProcessor] extended {} {:?} to {}",
                        prior.kind().as_str(),
                        prior.id(),
                        event.end()
                    );
                }
            } else if event.start() >= boundary {
                result.push(event);
            } else if event.end() > boundary {
                // Straddles the boundary without continuing the prior event
                result.push(event.with_start(boundary));
            }
        }
        Ok(result)
    }

    /// Cover `[start, end)` with one gap, starting after any event that
    /// already reaches into the range.
    fn persist_gap(
        &self,
        user: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TimelineEvent>> {
        let covered_until = self
            .events
            .find_latest_event_before(user, start)?
            .map_or(start, |prior| prior.end().max(start));
        if covered_until >= end {
            return Ok(Vec::new());
        }
        self.persist_all(user, vec![TimelineEvent::DataGap(DataGap::new(covered_until, end))])
    }

    fn persist_all(&self, user: UserId, events: Vec<TimelineEvent>) -> Result<Vec<TimelineEvent>> {
        let mut persisted = Vec::with_capacity(events.len());
        for event in self.name_stays(user, events) {
            persisted.push(self.events.persist(user, event)?);
        }
        debug!("[OvernightProcessor] persisted {} events for {}", persisted.len(), user);
        Ok(persisted)
    }

    /// Attach location names to stays that have none.
    pub fn name_stays(&self, user: UserId, events: Vec<TimelineEvent>) -> Vec<TimelineEvent> {
        events.into_iter().map(|e| self.name_stay(user, e)).collect()
    }

    fn name_stay(&self, user: UserId, event: TimelineEvent) -> TimelineEvent {
        let TimelineEvent::Stay(mut stay) = event else {
            return event;
        };
        if !stay.location_name.is_empty() {
            return TimelineEvent::Stay(stay);
        }
        match &self.resolver {
            Some(resolver) => {
                let resolved = resolver.resolve_name(user, &stay.location);
                stay.location_name = resolved.name;
                stay.location_ref = resolved.geocoding_id.map(LocationRef::Geocoding);
            }
            None => stay.location_name = format_coordinates(&stay.location),
        }
        TimelineEvent::Stay(stay)
    }
}
