//! Reverse geocoding.
//!
//! Stays are named by looking their centroid up in a spatial-tolerance
//! cache of [`GeocodingLocation`] facts and, on a miss, by asking the
//! configured providers in failover order. Facts without an owner are
//! shared originals; user edits never touch them and instead produce a
//! user-owned copy (see [`cow`]).

pub mod circuit_breaker;
pub mod cow;
mod provider;
mod service;

pub use circuit_breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use cow::{EditPlan, LocationEdit, LocationWrite, StayCommand};
pub use provider::{parse_response, GeocodingProvider, ProviderKind};
pub use service::{BlockingResolver, GeocodingService};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{GpsPoint, UserId};

/// Axis-aligned extent of a geocoding result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_latitude: f64,
    pub max_latitude: f64,
    pub min_longitude: f64,
    pub max_longitude: f64,
}

/// What a provider returns for one coordinate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodingResult {
    pub display_name: String,
    pub result_point: GpsPoint,
    pub bounding_box: Option<BoundingBox>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub provider_name: String,
}

/// A cached coordinate → display-name fact.
///
/// `user_id == None` marks a shared original. A user copy carries its
/// owner and the id of the original it was copied from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodingLocation {
    pub id: Option<i64>,
    pub user_id: Option<UserId>,
    pub source_id: Option<i64>,
    /// Coordinate the lookup was made for; the cache is keyed on it
    pub request_point: GpsPoint,
    pub result_point: GpsPoint,
    pub bounding_box: Option<BoundingBox>,
    pub display_name: String,
    pub city: Option<String>,
    pub country: Option<String>,
    pub provider_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GeocodingLocation {
    /// A new shared original built from a provider result.
    pub fn from_result(request_point: GpsPoint, result: GeocodingResult, now: DateTime<Utc>) -> Self {
        Self {
            id: None,
            user_id: None,
            source_id: None,
            request_point,
            result_point: result.result_point,
            bounding_box: result.bounding_box,
            display_name: result.display_name,
            city: result.city,
            country: result.country,
            provider_name: result.provider_name,
            created_at: now,
            updated_at: now,
        }
    }

    /// A minimal shared original, mostly for seeding caches.
    pub fn original(
        point: GpsPoint,
        display_name: impl Into<String>,
        provider_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            user_id: None,
            source_id: None,
            request_point: point,
            result_point: point,
            bounding_box: None,
            display_name: display_name.into(),
            city: None,
            country: None,
            provider_name: provider_name.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_original(&self) -> bool {
        self.user_id.is_none()
    }

    pub fn is_owned_by(&self, user: UserId) -> bool {
        self.user_id == Some(user)
    }

    /// Unsaved copy of this fact owned by `user`.
    pub fn user_copy(&self, user: UserId) -> Self {
        Self {
            id: None,
            user_id: Some(user),
            source_id: self.id,
            ..self.clone()
        }
    }

    /// Same place data, ignoring identity and timestamps.
    pub fn same_data(&self, other: &GeocodingLocation) -> bool {
        self.display_name == other.display_name
            && self.city == other.city
            && self.country == other.country
            && self.result_point == other.result_point
            && self.bounding_box == other.bounding_box
            && self.provider_name == other.provider_name
    }

    /// Copy with a fresh provider result applied.
    pub fn with_result(&self, result: &GeocodingResult, now: DateTime<Utc>) -> Self {
        Self {
            result_point: result.result_point,
            bounding_box: result.bounding_box,
            display_name: result.display_name.clone(),
            city: result.city.clone(),
            country: result.country.clone(),
            provider_name: result.provider_name.clone(),
            updated_at: now,
            ..self.clone()
        }
    }
}

/// The name a stay ends up with.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedName {
    pub name: String,
    /// Cached fact backing the name; `None` for the coordinate fallback
    pub geocoding_id: Option<i64>,
}

/// Synchronous naming seam used while assembling stays.
///
/// Implementations must not fail: a missing name falls back to
/// [`format_coordinates`].
pub trait LocationResolver: Send + Sync {
    fn resolve_name(&self, user: UserId, point: &GpsPoint) -> ResolvedName;
}

/// Name used when no provider could resolve a point.
pub fn format_coordinates(point: &GpsPoint) -> String {
    format!(
        "Unknown location ({:.6}, {:.6})",
        point.latitude, point.longitude
    )
}
