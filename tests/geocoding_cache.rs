//! Geocoding cache, copy-on-write edits and naming of generated stays.
//!
//! Providers point at a closed local port, so every provider call fails
//! fast and only the cache and the coordinate fallback can name a stay.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use geotimeline::geocoding::{BlockingResolver, LocationEdit};
use geotimeline::{
    ClusterTimelineGenerator, EventStore, FixedClock, GeocodingConfig, GeocodingLocation,
    GeocodingService, GeocodingStore, GpsPoint, LayeredConfigStore, LocationRef, MemoryStore,
    ProviderKind, TimelineError, TimelineService, TrackPoint, UserId,
};

fn at(d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, d, h, 0, 0).unwrap()
}

fn offline_config() -> GeocodingConfig {
    let mut config = GeocodingConfig::default();
    for kind in ProviderKind::ALL {
        if let Some(provider) = config.provider_mut(kind) {
            provider.base_url = "http://127.0.0.1:9".to_string();
            provider.timeout_ms = 2_000;
        }
    }
    config
}

fn dwell(store: &MemoryStore, user: UserId, from: DateTime<Utc>, to: DateTime<Utc>, place: GpsPoint) {
    let mut points = Vec::new();
    let mut t = from;
    while t <= to {
        points.push(TrackPoint::new(t, place.latitude, place.longitude).with_accuracy(10.0));
        t += Duration::minutes(5);
    }
    store.add_points(user, points).unwrap();
}

fn init_logging() {
    env_logger::builder().is_test(true).try_init().ok();
}

fn timeline_service(store: &Arc<MemoryStore>) -> TimelineService {
    init_logging();
    let geocoding = Arc::new(GeocodingService::new(offline_config(), store.clone(), store.clone()).unwrap());
    let resolver = BlockingResolver::new(geocoding).unwrap();
    TimelineService::new(
        store.clone(),
        store.clone(),
        Arc::new(LayeredConfigStore::default()),
        Arc::new(ClusterTimelineGenerator),
    )
    .with_clock(Arc::new(FixedClock::at(at(20, 12))))
    .with_resolver(Arc::new(resolver))
}

#[test]
fn cached_name_reaches_generated_stays() {
    let store = Arc::new(MemoryStore::new());
    let user = UserId::new_v4();
    let office = GpsPoint::new(52.5000, 13.3000);
    let cached = store
        .insert_location(GeocodingLocation::original(office, "Potsdamer Platz", "test"))
        .unwrap();
    dwell(&store, user, at(10, 9), at(10, 12), office);

    let timeline = timeline_service(&store).get_timeline(user, at(10, 0), at(11, 0)).unwrap();
    assert_eq!(timeline.stays.len(), 1);
    assert_eq!(timeline.stays[0].location_name, "Potsdamer Platz");
    assert_eq!(timeline.stays[0].geocoding_id(), cached.id);
}

#[test]
fn provider_outage_falls_back_to_coordinates() {
    let store = Arc::new(MemoryStore::new());
    let user = UserId::new_v4();
    dwell(&store, user, at(10, 9), at(10, 12), GpsPoint::new(48.8566, 2.3522));

    let timeline = timeline_service(&store).get_timeline(user, at(10, 0), at(11, 0)).unwrap();
    assert_eq!(timeline.stays.len(), 1);
    assert!(timeline.stays[0].location_name.starts_with("Unknown location"));
    assert_eq!(timeline.stays[0].geocoding_id(), None);
}

#[test]
fn user_edit_never_touches_shared_original() {
    let store = Arc::new(MemoryStore::new());
    let alice = UserId::new_v4();
    let bob = UserId::new_v4();
    let office = GpsPoint::new(52.5000, 13.3000);
    let original = store
        .insert_location(GeocodingLocation::original(office, "Potsdamer Platz", "test"))
        .unwrap();
    let original_id = original.id.unwrap();
    dwell(&store, alice, at(10, 9), at(10, 12), office);
    dwell(&store, bob, at(10, 9), at(10, 12), office);

    let service = timeline_service(&store);
    service.get_timeline(alice, at(10, 0), at(11, 0)).unwrap();
    service.get_timeline(bob, at(10, 0), at(11, 0)).unwrap();

    let geocoding = GeocodingService::new(offline_config(), store.clone(), store.clone()).unwrap();
    let copy = geocoding
        .edit_location(alice, original_id, &LocationEdit::rename("My Office"))
        .unwrap();

    assert_eq!(store.get_location(original_id).unwrap().unwrap().display_name, "Potsdamer Platz");
    let alice_stays = store
        .find_stays_by_location(alice, LocationRef::Geocoding(copy.id.unwrap()))
        .unwrap();
    assert_eq!(alice_stays.len(), 1);
    assert_eq!(alice_stays[0].location_name, "My Office");

    let bob_stays = store
        .find_stays_by_location(bob, LocationRef::Geocoding(original_id))
        .unwrap();
    assert_eq!(bob_stays.len(), 1);
    assert_eq!(bob_stays[0].location_name, "Potsdamer Platz");

    // Bob cannot edit Alice's copy
    let denied = geocoding.edit_location(bob, copy.id.unwrap(), &LocationEdit::rename("Mine"));
    assert!(matches!(denied, Err(TimelineError::PermissionDenied(_))));

    // a second edit by Alice updates her copy in place
    let again = geocoding
        .edit_location(alice, original_id, &LocationEdit::rename("HQ"))
        .unwrap();
    assert_eq!(again.id, copy.id);
}
