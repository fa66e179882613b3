//! Enhancement and combination of partial timelines.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};

use crate::store::EventStore;
use crate::timeline::{DataGap, DataSource, MovementTimeline, TimelineEvent};
use crate::{TimelineConfig, UserId};

pub struct TimelineAssembler {
    events: Arc<dyn EventStore>,
}

impl TimelineAssembler {
    pub fn new(events: Arc<dyn EventStore>) -> Self {
        Self { events }
    }

    /// Prepend the event preceding the window, stretched to the first
    /// stay or trip, so the timeline does not open on a blank.
    ///
    /// Gap-only timelines are returned unchanged, as are timelines that
    /// already contain the preceding event. Storage errors only cost the
    /// context.
    pub fn add_previous_context(
        &self,
        mut timeline: MovementTimeline,
        user: UserId,
        start: DateTime<Utc>,
    ) -> MovementTimeline {
        let Some(first_start) = timeline.first_activity_start() else {
            return timeline;
        };

        let prior = match self.events.find_latest_event_before(user, start) {
            Ok(Some(prior)) => prior,
            Ok(None) => return timeline,
            Err(e) => {
                warn!("[TimelineAssembler] previous context lookup failed for {}: {}", user, e);
                return timeline;
            }
        };

        let already_present = prior.id().is_some()
            && timeline.events().iter().any(|e| e.id() == prior.id());
        if already_present || prior.start() >= first_start {
            return timeline;
        }

        debug!(
            "[TimelineAssembler] prepending {} from {} for {}",
            prior.kind().as_str(),
            prior.start(),
            user
        );
        timeline.push(prior.with_end(first_start));
        timeline.sort();
        timeline
    }

    /// Merge a cached past timeline with today's live one.
    pub fn combine(
        &self,
        past: MovementTimeline,
        live: MovementTimeline,
        config: &TimelineConfig,
    ) -> MovementTimeline {
        combine(past, live, config)
    }
}

/// Concatenate, insert the cross-day gap, sort and merge touching gaps.
/// The result is tagged MIXED.
pub fn combine(
    past: MovementTimeline,
    live: MovementTimeline,
    config: &TimelineConfig,
) -> MovementTimeline {
    let cross_day = cross_day_gap(&past, &live, config);
    let last_updated = past.last_updated.max(live.last_updated);

    let mut combined = past;
    combined.stays.extend(live.stays);
    combined.trips.extend(live.trips);
    combined.data_gaps.extend(live.data_gaps);
    if let Some(gap) = cross_day {
        combined.push(TimelineEvent::DataGap(gap));
    }
    combined.sort();
    combined.data_gaps = merge_data_gaps(std::mem::take(&mut combined.data_gaps));
    combined.data_source = DataSource::Mixed;
    combined.last_updated = last_updated;
    combined
}

/// Gap between the last past activity and the first live activity when it
/// exceeds the gap threshold and the minimum gap duration.
pub fn cross_day_gap(
    past: &MovementTimeline,
    live: &MovementTimeline,
    config: &TimelineConfig,
) -> Option<DataGap> {
    let last_end = past.last_activity_end()?;
    let first_start = live.first_activity_start()?;
    let silence = first_start - last_end;

    if silence > Duration::seconds(config.data_gap_threshold_seconds)
        && silence >= Duration::seconds(config.data_gap_min_duration_seconds)
    {
        Some(DataGap::new(last_end, first_start))
    } else {
        None
    }
}

/// Merge gaps that overlap or touch (within one nanosecond).
pub fn merge_data_gaps(mut gaps: Vec<DataGap>) -> Vec<DataGap> {
    gaps.sort_by_key(|g| g.start);
    let touch = Duration::nanoseconds(1);

    let mut merged: Vec<DataGap> = Vec::with_capacity(gaps.len());
    for gap in gaps {
        if let Some(last) = merged.last_mut() {
            if gap.start <= last.end + touch {
                last.end = last.end.max(gap.end);
                last.stale |= gap.stale;
                continue;
            }
        }
        merged.push(gap);
    }
    merged
}
