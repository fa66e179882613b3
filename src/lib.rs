//! # GeoTimeline
//!
//! Derives a semantic timeline from a raw GPS point stream: periods of
//! staying (stays), moving (trips) and missing data (data gaps).
//!
//! This library provides:
//! - Spatial and velocity analysis over point sequences
//! - A day-boundary ("overnight") processor that extends yesterday's last
//!   event into today instead of splitting it at midnight
//! - A request router that serves past ranges from cache, regenerates
//!   them when missing, and merges today's live data on top
//! - Reverse geocoding with provider failover and a copy-on-write cache
//!
//! ## Features
//!
//! - **`persistence`** - Enable the SQLite-backed reference store
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use chrono::{TimeZone, Utc};
//! use geotimeline::{
//!     ClusterTimelineGenerator, FixedClock, LayeredConfigStore, MemoryStore, TimelineService,
//! };
//!
//! let store = Arc::new(MemoryStore::new());
//! let service = TimelineService::new(
//!     store.clone(),
//!     store.clone(),
//!     Arc::new(LayeredConfigStore::default()),
//!     Arc::new(ClusterTimelineGenerator),
//! )
//! .with_clock(Arc::new(FixedClock::at(Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap())));
//!
//! let user = uuid::Uuid::new_v4();
//! let start = Utc.with_ymd_and_hms(2025, 6, 16, 0, 0, 0).unwrap();
//! let end = Utc.with_ymd_and_hms(2025, 6, 17, 0, 0, 0).unwrap();
//! let timeline = service.get_timeline(user, start, end).unwrap();
//! assert!(timeline.stays.is_empty());
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{OptionExt, Result, TimelineError};

// Distance, centroid, clustering
pub mod spatial;
pub use spatial::{cluster_end_index, haversine_distance, path_distance, weighted_centroid};

// Velocity statistics and speed repair
pub mod velocity;
pub use velocity::{filter_unrealistic_speeds, median_velocity, VelocityStats};

// Layered per-user configuration
pub mod config;
pub use config::{
    ConfigStore, DetectionAlgorithm, GeocodingConfig, LayeredConfigStore, ProviderConfig,
    TimelineConfig, TimelineConfigOverride,
};

// Setting-key registry and batch validation
pub mod settings;
pub use settings::{SettingDefinition, SettingKind, ValidationContext, SETTINGS};

// Guards on configuration and input
pub mod validation;

// Timeline events and aggregate
pub mod timeline;
pub use timeline::{
    DataGap, DataSource, EventKind, LocationRef, MovementTimeline, MovementType, TimelineEvent,
    TimelineStay, TimelineTrip,
};

// Stay/trip detection
pub mod detection;
pub use detection::{ClusterTimelineGenerator, TimelineGenerator};

// Storage seams and reference implementations
pub mod store;
pub use store::{EventStore, GeocodingStore, MemoryStore, PointSource};
#[cfg(feature = "persistence")]
pub use store::SqliteStore;

// Day-boundary processor
pub mod processor;
pub use processor::OvernightProcessor;

// Previous context, timeline combination, gap merging
pub mod assembler;
pub use assembler::TimelineAssembler;

// Request classification
pub mod router;
pub use router::{classify_request, RequestKind};

// Public entry point
pub mod service;
pub use service::{Clock, FixedClock, SystemClock, TimelineService};

// Stale-event regeneration queue
pub mod invalidation;
pub use invalidation::{InvalidationQueue, JobId, JobRegistry, JobStatus, StaleEvent};

// Reverse geocoding with copy-on-write cache
pub mod geocoding;
pub use geocoding::{
    GeocodingLocation, GeocodingProvider, GeocodingResult, GeocodingService, ProviderKind,
};

/// Identifier of the user owning a timeline.
pub type UserId = uuid::Uuid;

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use geotimeline::GpsPoint;
/// let point = GpsPoint::new(51.5074, -0.1278); // London
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// A single recorded GPS fix.
///
/// Transient: produced by point ingestion and consumed only by detection
/// and analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy in meters
    pub accuracy: Option<f64>,
    /// Velocity in km/h
    pub velocity: Option<f64>,
}

impl TrackPoint {
    pub fn new(timestamp: DateTime<Utc>, latitude: f64, longitude: f64) -> Self {
        Self {
            timestamp,
            latitude,
            longitude,
            accuracy: None,
            velocity: None,
        }
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = Some(accuracy);
        self
    }

    pub fn with_velocity(mut self, velocity: f64) -> Self {
        self.velocity = Some(velocity);
        self
    }

    pub fn position(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_gps_point_validation() {
        assert!(GpsPoint::new(51.5074, -0.1278).is_valid());
        assert!(!GpsPoint::new(91.0, 0.0).is_valid());
        assert!(!GpsPoint::new(0.0, 181.0).is_valid());
        assert!(!GpsPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_track_point_builders() {
        let t = Utc.with_ymd_and_hms(2025, 6, 15, 8, 0, 0).unwrap();
        let p = TrackPoint::new(t, 52.52, 13.40)
            .with_accuracy(12.0)
            .with_velocity(4.5);
        assert_eq!(p.accuracy, Some(12.0));
        assert_eq!(p.velocity, Some(4.5));
        assert_eq!(p.position(), GpsPoint::new(52.52, 13.40));
    }
}
