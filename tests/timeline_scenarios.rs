//! End-to-end timeline scenarios over the in-memory store.
//!
//! Run with: `cargo test --test timeline_scenarios`

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use geotimeline::{
    classify_request, ClusterTimelineGenerator, DataSource, EventKind, EventStore, FixedClock,
    LayeredConfigStore, MemoryStore, RequestKind, TimelineEvent, TimelineService, TrackPoint,
    UserId,
};

const HOME: (f64, f64) = (52.5200, 13.4050);
const WORK: (f64, f64) = (52.5000, 13.3000);

fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, d, h, m, 0).unwrap()
}

fn day(d: u32) -> DateTime<Utc> {
    at(d, 0, 0)
}

/// Points every five minutes at one place, inclusive of both ends.
fn dwell(from: DateTime<Utc>, to: DateTime<Utc>, place: (f64, f64)) -> Vec<TrackPoint> {
    let mut points = Vec::new();
    let mut t = from;
    while t <= to {
        points.push(TrackPoint::new(t, place.0, place.1).with_accuracy(10.0));
        t += Duration::minutes(5);
    }
    points
}

/// Straight-line commute sampled every minute.
fn commute(from: DateTime<Utc>, minutes: i64, a: (f64, f64), b: (f64, f64)) -> Vec<TrackPoint> {
    (1..minutes)
        .map(|i| {
            let f = i as f64 / minutes as f64;
            TrackPoint::new(
                from + Duration::minutes(i),
                a.0 + (b.0 - a.0) * f,
                a.1 + (b.1 - a.1) * f,
            )
            .with_accuracy(10.0)
            .with_velocity(8.0)
        })
        .collect()
}

fn init_logging() {
    env_logger::builder().is_test(true).try_init().ok();
}

fn service(store: &Arc<MemoryStore>, now: DateTime<Utc>) -> TimelineService {
    init_logging();
    TimelineService::new(
        store.clone(),
        store.clone(),
        Arc::new(LayeredConfigStore::default()),
        Arc::new(ClusterTimelineGenerator),
    )
    .with_clock(Arc::new(FixedClock::at(now)))
}

fn seed_overnight(store: &MemoryStore, user: UserId) {
    store.add_points(user, dwell(at(14, 8, 0), at(14, 17, 0), WORK)).unwrap();
    store.add_points(user, commute(at(14, 17, 0), 30, WORK, HOME)).unwrap();
    store.add_points(user, dwell(at(14, 17, 30), at(15, 9, 0), HOME)).unwrap();
    store.add_points(user, commute(at(15, 9, 0), 30, HOME, WORK)).unwrap();
    store.add_points(user, dwell(at(15, 9, 30), at(15, 17, 0), WORK)).unwrap();
}

fn stays_of(store: &MemoryStore, user: UserId) -> Vec<TimelineEvent> {
    store
        .all_events(user)
        .unwrap()
        .into_iter()
        .filter(|e| e.kind() == EventKind::Stay)
        .collect()
}

// ============================================================================
// Day boundary
// ============================================================================

#[test]
fn overnight_stay_is_not_split_at_midnight() {
    let store = Arc::new(MemoryStore::new());
    let user = UserId::new_v4();
    seed_overnight(&store, user);
    let service = service(&store, at(20, 12, 0));

    let first = service.get_timeline(user, day(14), day(15)).unwrap();
    assert_eq!(first.data_source, DataSource::Cached);

    let second = service.get_timeline(user, day(15), day(16)).unwrap();
    let home: Vec<_> = second
        .stays
        .iter()
        .filter(|s| s.start < day(15))
        .collect();
    assert_eq!(home.len(), 1, "the night at home is served through boundary expansion");
    assert!(home[0].end() >= at(15, 8, 55));

    let crossing = stays_of(&store, user)
        .into_iter()
        .filter(|e| e.start() < day(15) && e.end() > day(15))
        .count();
    assert_eq!(crossing, 1);
    assert!(stays_of(&store, user)
        .iter()
        .all(|e| e.start() != day(15)), "no stay opens at midnight");
}

#[test]
fn multi_day_request_keeps_overnight_stay_whole() {
    let store = Arc::new(MemoryStore::new());
    let user = UserId::new_v4();
    seed_overnight(&store, user);

    service(&store, at(20, 12, 0)).force_regenerate(user, day(14), day(16)).unwrap();

    let stays = stays_of(&store, user);
    assert!(stays.iter().all(|e| e.start() != day(15)));
    assert_eq!(
        stays.iter().filter(|e| e.start() < day(15) && e.end() > day(15)).count(),
        1
    );
}

#[test]
fn regenerating_first_day_restores_overnight_extension() {
    let store = Arc::new(MemoryStore::new());
    let user = UserId::new_v4();
    seed_overnight(&store, user);
    let service = service(&store, at(20, 12, 0));

    service.get_timeline(user, day(14), day(15)).unwrap();
    service.get_timeline(user, day(15), day(16)).unwrap();
    let before = store.all_events(user).unwrap();

    service.force_regenerate(user, day(14), day(15)).unwrap();
    let after = store.all_events(user).unwrap();

    let shape = |events: &[TimelineEvent]| -> Vec<(EventKind, DateTime<Utc>, DateTime<Utc>)> {
        events.iter().map(|e| (e.kind(), e.start(), e.end())).collect()
    };
    assert_eq!(shape(&after), shape(&before));
    assert!(after
        .iter()
        .any(|e| e.kind() == EventKind::Stay && e.start() < day(15) && e.end() >= at(15, 8, 55)));
}

#[test]
fn force_regenerate_twice_yields_same_shape() {
    let store = Arc::new(MemoryStore::new());
    let user = UserId::new_v4();
    seed_overnight(&store, user);
    let service = service(&store, at(20, 12, 0));

    let shape = |store: &MemoryStore| -> Vec<(EventKind, DateTime<Utc>, DateTime<Utc>)> {
        store
            .all_events(user)
            .unwrap()
            .iter()
            .map(|e| (e.kind(), e.start(), e.end()))
            .collect()
    };

    service.force_regenerate(user, day(14), day(15)).unwrap();
    let first = shape(&store);
    service.force_regenerate(user, day(14), day(15)).unwrap();
    assert_eq!(shape(&store), first);
}

// ============================================================================
// Routing
// ============================================================================

#[test]
fn classification_against_fixed_today() {
    let today = NaiveDate::from_ymd_opt(2025, 6, 15).unwrap();
    assert_eq!(classify_request(day(13), day(14), today), RequestKind::PastOnly);
    assert_eq!(classify_request(day(14), day(16), today), RequestKind::Mixed);
    assert_eq!(classify_request(at(15, 6, 0), at(15, 9, 0), today), RequestKind::Mixed);
    assert_eq!(classify_request(day(16), day(17), today), RequestKind::FutureOnly);
}

#[test]
fn mixed_request_merges_past_and_live() {
    let store = Arc::new(MemoryStore::new());
    let user = UserId::new_v4();
    seed_overnight(&store, user);

    let timeline = service(&store, at(15, 18, 0)).get_timeline(user, day(14), day(16)).unwrap();
    assert_eq!(timeline.data_source, DataSource::Mixed);
    assert!(timeline.stays.iter().any(|s| s.start >= at(15, 9, 0)));

    // only the past day was persisted
    assert!(store.all_events(user).unwrap().iter().all(|e| e.start() < day(15)));
}

#[test]
fn empty_past_day_is_one_gap() {
    let store = Arc::new(MemoryStore::new());
    let user = UserId::new_v4();

    let timeline = service(&store, at(20, 12, 0)).get_timeline(user, day(12), day(13)).unwrap();
    assert!(timeline.stays.is_empty());
    assert_eq!(timeline.data_gaps.len(), 1);
    assert_eq!(timeline.data_gaps[0].start, day(12));
    assert_eq!(timeline.data_gaps[0].end, day(13));

    // served from cache on the second call
    let again = service(&store, at(20, 12, 0)).get_timeline(user, day(12), day(13)).unwrap();
    assert_eq!(again.data_gaps, timeline.data_gaps);
    assert_eq!(store.all_events(user).unwrap().len(), 1);
}

#[test]
fn glitch_point_does_not_empty_the_day() {
    let store = Arc::new(MemoryStore::new());
    let user = UserId::new_v4();
    store.add_points(user, dwell(at(10, 8, 0), at(10, 12, 0), HOME)).unwrap();
    store
        .add_points(user, vec![TrackPoint::new(at(10, 9, 2), 91.0, HOME.1)])
        .unwrap();

    let timeline = service(&store, at(20, 12, 0)).get_timeline(user, day(10), day(11)).unwrap();
    assert_eq!(timeline.stays.len(), 1);
    assert_eq!(timeline.stays[0].start, at(10, 8, 0));
    assert!(!store.all_events(user).unwrap().is_empty());
}

#[test]
fn stale_marking_is_visible_to_readers() {
    let store = Arc::new(MemoryStore::new());
    let user = UserId::new_v4();
    seed_overnight(&store, user);
    service(&store, at(20, 12, 0)).force_regenerate(user, day(14), day(15)).unwrap();

    let marked = store.mark_stale(user, day(14), day(15)).unwrap();
    assert!(marked > 0);
    assert!(store
        .find_events_in_range(user, day(14), day(15))
        .unwrap()
        .iter()
        .all(|e| e.is_stale()));
}
