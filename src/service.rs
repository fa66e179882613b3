//! Public entry point: routes a request to the past or mixed handler.
//!
//! A timeline request never fails on missing or inconsistent backing data.
//! Only caller errors (bad range, invalid configuration) are surfaced; a
//! storage failure degrades to an empty timeline.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use log::{debug, info, warn};

use crate::assembler::TimelineAssembler;
use crate::config::ConfigStore;
use crate::detection::TimelineGenerator;
use crate::geocoding::LocationResolver;
use crate::processor::OvernightProcessor;
use crate::router::{classify_request, RequestKind};
use crate::store::{EventStore, PointSource};
use crate::timeline::{DataSource, MovementTimeline};
use crate::validation::validate_time_range;
use crate::{Result, TimelineConfig, UserId};

/// Source of "now"; "today" is its UTC date.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock frozen at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl FixedClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self(now)
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

pub struct TimelineService {
    points: Arc<dyn PointSource>,
    events: Arc<dyn EventStore>,
    config: Arc<dyn ConfigStore>,
    generator: Arc<dyn TimelineGenerator>,
    processor: OvernightProcessor,
    assembler: TimelineAssembler,
    clock: Arc<dyn Clock>,
}

impl TimelineService {
    pub fn new(
        points: Arc<dyn PointSource>,
        events: Arc<dyn EventStore>,
        config: Arc<dyn ConfigStore>,
        generator: Arc<dyn TimelineGenerator>,
    ) -> Self {
        Self {
            processor: OvernightProcessor::new(points.clone(), events.clone(), generator.clone()),
            assembler: TimelineAssembler::new(events.clone()),
            points,
            events,
            config,
            generator,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Name stays through `resolver` (typically a
    /// [`BlockingResolver`](crate::geocoding::BlockingResolver)).
    pub fn with_resolver(mut self, resolver: Arc<dyn LocationResolver>) -> Self {
        self.processor = self.processor.with_resolver(resolver);
        self
    }

    /// Timeline of `user` over `[start, end)`.
    pub fn get_timeline(
        &self,
        user: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<MovementTimeline> {
        validate_time_range(start, end)?;
        let config = self.config.effective_config(user)?;
        let now = self.clock.now();

        let kind = classify_request(start, end, now.date_naive());
        debug!("[TimelineService] {} [{}, {}) -> {:?}", user, start, end, kind);
        Ok(match kind {
            RequestKind::PastOnly => self.handle_past(user, start, end, &config),
            RequestKind::Mixed => self.handle_mixed(user, start, end, &config),
            RequestKind::FutureOnly => MovementTimeline::empty(user, DataSource::Live, now),
        })
    }

    /// Drop persisted events starting in `[start, end)` and regenerate.
    ///
    /// Unlike [`get_timeline`](Self::get_timeline) this surfaces storage
    /// errors, so background jobs can record them.
    pub fn force_regenerate(
        &self,
        user: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<MovementTimeline> {
        validate_time_range(start, end)?;
        let config = self.config.effective_config(user)?;
        info!("[TimelineService] force regenerate {} [{}, {})", user, start, end);
        self.regenerate(user, start, end, &config)?;
        self.load_cached(user, start, end)
    }

    fn handle_past(
        &self,
        user: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        config: &TimelineConfig,
    ) -> MovementTimeline {
        match self.cached_or_regenerated(user, start, end, config) {
            Ok(timeline) => timeline,
            Err(e) => {
                warn!(
                    "[TimelineService] past timeline for {} [{}, {}) unavailable: {}",
                    user, start, end, e
                );
                MovementTimeline::empty(user, DataSource::Cached, self.clock.now())
            }
        }
    }

    fn cached_or_regenerated(
        &self,
        user: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        config: &TimelineConfig,
    ) -> Result<MovementTimeline> {
        if !self.events.has_events_in_range(user, start, end)? {
            self.regenerate(user, start, end, config)?;
        }
        self.load_cached(user, start, end)
    }

    fn load_cached(&self, user: UserId, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<MovementTimeline> {
        let events = self.events.find_events_with_boundary_expansion(user, start, end)?;
        let timeline = MovementTimeline::from_events(user, events, DataSource::Cached, self.clock.now());
        Ok(self.assembler.add_previous_context(timeline, user, start))
    }

    /// Delete, then run the processor; a persistence conflict is retried once.
    fn regenerate(
        &self,
        user: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        config: &TimelineConfig,
    ) -> Result<()> {
        match self.regenerate_once(user, start, end, config) {
            Err(e) if e.is_retryable() => {
                warn!("[TimelineService] retrying regeneration for {} after: {}", user, e);
                self.regenerate_once(user, start, end, config)
            }
            other => other,
        }
    }

    /// Events starting in the range are rebuilt from the range's points
    /// only. When a deleted event had been extended past `end`, the
    /// following days it reached are regenerated too so the continuation is
    /// restored.
    fn regenerate_once(
        &self,
        user: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        config: &TimelineConfig,
    ) -> Result<()> {
        let today_start = day_start(self.clock.now());
        let (mut from, mut to) = (start, end);
        let mut reach = end;

        loop {
            if let Some(latest) = self
                .events
                .find_events_in_range(user, from, to)?
                .iter()
                .map(|e| e.end())
                .max()
            {
                reach = reach.max(latest);
            }

            let deleted = self.events.delete_events_in_range(user, from, to)?;
            if deleted > 0 {
                debug!("[TimelineService] removed {} leftover events for {}", deleted, user);
            }
            self.processor.process(user, from, to, config)?;

            let next_end = day_start(to) + Duration::days(1);
            if reach <= to || next_end > today_start {
                return Ok(());
            }
            debug!(
                "[TimelineService] {} had events up to {}, continuing into {}",
                user,
                reach,
                to.date_naive()
            );
            (from, to) = (to, next_end);
        }
    }

    fn handle_mixed(
        &self,
        user: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        config: &TimelineConfig,
    ) -> MovementTimeline {
        let now = self.clock.now();
        let today_start = day_start(now);

        if start >= today_start {
            let live = self.generate_live(user, start, end, config);
            return self.assembler.add_previous_context(live, user, start);
        }

        let past = self.handle_past(user, start, today_start, config);
        let live = if end > today_start {
            self.generate_live(user, today_start, end, config)
        } else {
            MovementTimeline::empty(user, DataSource::Live, now)
        };
        self.assembler.combine(past, live, config)
    }

    /// Generate without persisting; today's data can still change.
    fn generate_live(
        &self,
        user: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        config: &TimelineConfig,
    ) -> MovementTimeline {
        let now = self.clock.now();
        let generated = self
            .points
            .list_points(user, start, end)
            .and_then(|points| self.generator.generate(user, &points, config));

        match generated {
            Ok(events) => {
                let events = self.processor.name_stays(user, events);
                MovementTimeline::from_events(user, events, DataSource::Live, now)
            }
            Err(e) => {
                warn!("[TimelineService] live timeline for {} unavailable: {}", user, e);
                MovementTimeline::empty(user, DataSource::Live, now)
            }
        }
    }
}

/// UTC midnight starting the day of `t`.
pub fn day_start(t: DateTime<Utc>) -> DateTime<Utc> {
    t.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Every whole UTC day touched by `[start, end)`.
pub fn covering_days(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut days = Vec::new();
    let mut day = day_start(start);
    while day < end {
        let next = day + Duration::days(1);
        days.push((day, next));
        day = next;
    }
    days
}
