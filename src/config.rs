//! Per-user timeline configuration.
//!
//! The effective configuration for a user is resolved by layering:
//! built-in defaults ← global overrides (environment) ← per-user override.
//! Every lookup returns an immutable `Arc` snapshot, so concurrent callers
//! never share mutable state.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use log::info;
use serde::{Deserialize, Serialize};

use crate::geocoding::circuit_breaker::BreakerConfig;
use crate::geocoding::ProviderKind;
use crate::validation::validate_config;
use crate::{Result, TimelineError, UserId};

/// Prefix for environment variables holding global overrides.
pub const ENV_PREFIX: &str = "GEOTIMELINE_";

/// Stay/trip detection flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionAlgorithm {
    /// Velocity- and accuracy-aware clustering
    #[default]
    Enhanced,
    /// Distance-only clustering
    Clustering,
}

impl FromStr for DetectionAlgorithm {
    type Err = TimelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "enhanced" => Ok(DetectionAlgorithm::Enhanced),
            "clustering" => Ok(DetectionAlgorithm::Clustering),
            other => Err(TimelineError::invalid_config(
                "algorithm",
                format!("unknown detection algorithm '{}'", other),
            )),
        }
    }
}

/// Effective configuration for timeline generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineConfig {
    pub algorithm: DetectionAlgorithm,

    /// Skip inaccurate points when clustering stays.
    /// Default: true
    pub use_velocity_accuracy: bool,

    /// Points with a worse accuracy are ignored by clustering (meters).
    /// Default: 60.0
    pub max_accuracy_threshold: f64,

    /// Velocity at or above which a point counts as moving (km/h).
    /// Default: 8.0
    pub velocity_threshold: f64,

    /// Minimum share of accurate points for automatic detection, in [0, 1].
    /// Default: 0.5
    pub min_accuracy_ratio: f64,

    /// Minimum dwell time for a stay (seconds).
    /// Default: 420
    pub stay_min_duration_seconds: i64,

    /// Stay radius and minimum trip length (meters).
    /// Default: 50.0
    pub trip_min_distance: f64,

    /// Minimum trip duration (seconds).
    /// Default: 420
    pub trip_min_duration_seconds: i64,

    /// Merge consecutive stays at the same place.
    /// Default: true
    pub merge_enabled: bool,

    /// Maximum distance between stays to merge (meters).
    /// Default: 150.0
    pub merge_max_distance: f64,

    /// Maximum time between stays to merge (seconds).
    /// Default: 900
    pub merge_max_time_gap_seconds: i64,

    /// Silence between points above which a data gap is recorded (seconds).
    /// Default: 10800 (3 hours)
    pub data_gap_threshold_seconds: i64,

    /// Shortest data gap worth recording (seconds).
    /// Default: 1800
    pub data_gap_min_duration_seconds: i64,

    /// Simplify trip paths with Douglas-Peucker.
    /// Default: true
    pub path_simplification_enabled: bool,

    /// Douglas-Peucker tolerance (meters).
    /// Default: 15.0
    pub path_simplification_tolerance: f64,

    /// Speeds above this are treated as GPS glitches (km/h).
    /// Default: 250.0
    pub max_reasonable_speed: f64,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            algorithm: DetectionAlgorithm::Enhanced,
            use_velocity_accuracy: true,
            max_accuracy_threshold: 60.0,
            velocity_threshold: 8.0,
            min_accuracy_ratio: 0.5,
            stay_min_duration_seconds: 420,
            trip_min_distance: 50.0,
            trip_min_duration_seconds: 420,
            merge_enabled: true,
            merge_max_distance: 150.0,
            merge_max_time_gap_seconds: 900,
            data_gap_threshold_seconds: 10_800,
            data_gap_min_duration_seconds: 1_800,
            path_simplification_enabled: true,
            path_simplification_tolerance: 15.0,
            max_reasonable_speed: 250.0,
        }
    }
}

/// A partial configuration; `None` fields inherit from the layer below.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelineConfigOverride {
    pub algorithm: Option<DetectionAlgorithm>,
    pub use_velocity_accuracy: Option<bool>,
    pub max_accuracy_threshold: Option<f64>,
    pub velocity_threshold: Option<f64>,
    pub min_accuracy_ratio: Option<f64>,
    pub stay_min_duration_seconds: Option<i64>,
    pub trip_min_distance: Option<f64>,
    pub trip_min_duration_seconds: Option<i64>,
    pub merge_enabled: Option<bool>,
    pub merge_max_distance: Option<f64>,
    pub merge_max_time_gap_seconds: Option<i64>,
    pub data_gap_threshold_seconds: Option<i64>,
    pub data_gap_min_duration_seconds: Option<i64>,
    pub path_simplification_enabled: Option<bool>,
    pub path_simplification_tolerance: Option<f64>,
    pub max_reasonable_speed: Option<f64>,
}

impl TimelineConfigOverride {
    /// Layer this override on top of `base`.
    pub fn apply_to(&self, base: &TimelineConfig) -> TimelineConfig {
        TimelineConfig {
            algorithm: self.algorithm.unwrap_or(base.algorithm),
            use_velocity_accuracy: self
                .use_velocity_accuracy
                .unwrap_or(base.use_velocity_accuracy),
            max_accuracy_threshold: self
                .max_accuracy_threshold
                .unwrap_or(base.max_accuracy_threshold),
            velocity_threshold: self.velocity_threshold.unwrap_or(base.velocity_threshold),
            min_accuracy_ratio: self.min_accuracy_ratio.unwrap_or(base.min_accuracy_ratio),
            stay_min_duration_seconds: self
                .stay_min_duration_seconds
                .unwrap_or(base.stay_min_duration_seconds),
            trip_min_distance: self.trip_min_distance.unwrap_or(base.trip_min_distance),
            trip_min_duration_seconds: self
                .trip_min_duration_seconds
                .unwrap_or(base.trip_min_duration_seconds),
            merge_enabled: self.merge_enabled.unwrap_or(base.merge_enabled),
            merge_max_distance: self.merge_max_distance.unwrap_or(base.merge_max_distance),
            merge_max_time_gap_seconds: self
                .merge_max_time_gap_seconds
                .unwrap_or(base.merge_max_time_gap_seconds),
            data_gap_threshold_seconds: self
                .data_gap_threshold_seconds
                .unwrap_or(base.data_gap_threshold_seconds),
            data_gap_min_duration_seconds: self
                .data_gap_min_duration_seconds
                .unwrap_or(base.data_gap_min_duration_seconds),
            path_simplification_enabled: self
                .path_simplification_enabled
                .unwrap_or(base.path_simplification_enabled),
            path_simplification_tolerance: self
                .path_simplification_tolerance
                .unwrap_or(base.path_simplification_tolerance),
            max_reasonable_speed: self
                .max_reasonable_speed
                .unwrap_or(base.max_reasonable_speed),
        }
    }

    /// Read global overrides from `GEOTIMELINE_*` environment variables.
    ///
    /// Unset variables leave the field empty; malformed values are a
    /// configuration error rather than a silent default.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            algorithm: env_parse("ALGORITHM")?,
            use_velocity_accuracy: env_parse("USE_VELOCITY_ACCURACY")?,
            max_accuracy_threshold: env_parse("MAX_ACCURACY_THRESHOLD")?,
            velocity_threshold: env_parse("VELOCITY_THRESHOLD")?,
            min_accuracy_ratio: env_parse("MIN_ACCURACY_RATIO")?,
            stay_min_duration_seconds: env_parse("STAY_MIN_DURATION_SECONDS")?,
            trip_min_distance: env_parse("TRIP_MIN_DISTANCE")?,
            trip_min_duration_seconds: env_parse("TRIP_MIN_DURATION_SECONDS")?,
            merge_enabled: env_parse("MERGE_ENABLED")?,
            merge_max_distance: env_parse("MERGE_MAX_DISTANCE")?,
            merge_max_time_gap_seconds: env_parse("MERGE_MAX_TIME_GAP_SECONDS")?,
            data_gap_threshold_seconds: env_parse("DATA_GAP_THRESHOLD_SECONDS")?,
            data_gap_min_duration_seconds: env_parse("DATA_GAP_MIN_DURATION_SECONDS")?,
            path_simplification_enabled: env_parse("PATH_SIMPLIFICATION_ENABLED")?,
            path_simplification_tolerance: env_parse("PATH_SIMPLIFICATION_TOLERANCE")?,
            max_reasonable_speed: env_parse("MAX_REASONABLE_SPEED")?,
        })
    }
}

fn env_parse<T: FromStr>(suffix: &str) -> Result<Option<T>> {
    let key = format!("{}{}", ENV_PREFIX, suffix);
    match env::var(&key) {
        Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            TimelineError::invalid_config(&key, format!("cannot parse value '{}'", raw))
        }),
        Err(_) => Ok(None),
    }
}

/// Source of effective per-user configuration.
pub trait ConfigStore: Send + Sync {
    /// Fully layered configuration for `user`.
    fn effective_config(&self, user: UserId) -> Result<Arc<TimelineConfig>>;
}

/// In-process [`ConfigStore`] holding the global layer and per-user overrides.
#[derive(Debug)]
pub struct LayeredConfigStore {
    global: Arc<TimelineConfig>,
    user_overrides: RwLock<HashMap<UserId, TimelineConfigOverride>>,
}

impl LayeredConfigStore {
    /// Build a store whose global layer is `global` applied over the defaults.
    pub fn new(global: &TimelineConfigOverride) -> Result<Self> {
        let layered = global.apply_to(&TimelineConfig::default());
        validate_config(&layered)?;
        Ok(Self {
            global: Arc::new(layered),
            user_overrides: RwLock::new(HashMap::new()),
        })
    }

    /// Build a store whose global layer comes from the environment.
    pub fn from_env() -> Result<Self> {
        let store = Self::new(&TimelineConfigOverride::from_env()?)?;
        info!("[Config] Loaded global timeline configuration from environment");
        Ok(store)
    }

    /// Store a per-user override after validating the layered result.
    pub fn set_user_override(&self, user: UserId, value: TimelineConfigOverride) -> Result<()> {
        validate_config(&value.apply_to(&self.global))?;
        self.user_overrides
            .write()
            .map_err(|_| TimelineError::Persistence("config lock poisoned".to_string()))?
            .insert(user, value);
        Ok(())
    }

    /// Drop a user's override; returns whether one existed.
    pub fn clear_user_override(&self, user: UserId) -> Result<bool> {
        Ok(self
            .user_overrides
            .write()
            .map_err(|_| TimelineError::Persistence("config lock poisoned".to_string()))?
            .remove(&user)
            .is_some())
    }

    pub fn global(&self) -> Arc<TimelineConfig> {
        Arc::clone(&self.global)
    }
}

impl Default for LayeredConfigStore {
    fn default() -> Self {
        Self {
            global: Arc::new(TimelineConfig::default()),
            user_overrides: RwLock::new(HashMap::new()),
        }
    }
}

impl ConfigStore for LayeredConfigStore {
    fn effective_config(&self, user: UserId) -> Result<Arc<TimelineConfig>> {
        let overrides = self
            .user_overrides
            .read()
            .map_err(|_| TimelineError::Persistence("config lock poisoned".to_string()))?;
        Ok(match overrides.get(&user) {
            Some(o) => Arc::new(o.apply_to(&self.global)),
            None => Arc::clone(&self.global),
        })
    }
}

// ============================================================================
// Geocoding configuration
// ============================================================================

/// Connection and protection settings for one geocoding provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub enabled: bool,
    pub base_url: String,
    pub api_key: Option<String>,
    /// Concurrent in-flight requests allowed for this provider
    pub max_concurrency: usize,
    pub timeout_ms: u64,
    pub breaker: BreakerConfig,
}

impl ProviderConfig {
    /// Public endpoint defaults; only Nominatim works without credentials.
    pub fn default_for(kind: ProviderKind) -> Self {
        let (base_url, max_concurrency, enabled) = match kind {
            // Nominatim's usage policy allows a single connection
            ProviderKind::Nominatim => ("https://nominatim.openstreetmap.org", 1, true),
            ProviderKind::Photon => ("https://photon.komoot.io", 4, false),
            ProviderKind::GoogleMaps => ("https://maps.googleapis.com", 10, false),
            ProviderKind::Mapbox => ("https://api.mapbox.com", 10, false),
        };
        Self {
            kind,
            enabled,
            base_url: base_url.to_string(),
            api_key: None,
            max_concurrency,
            timeout_ms: 10_000,
            breaker: BreakerConfig::default(),
        }
    }
}

/// Provider selection and cache tolerance for reverse geocoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodingConfig {
    /// Cached results within this distance are reused (meters).
    /// Default: 25.0
    pub cache_radius_meters: f64,
    pub primary: ProviderKind,
    pub fallback: Option<ProviderKind>,
    pub providers: Vec<ProviderConfig>,
}

impl Default for GeocodingConfig {
    fn default() -> Self {
        Self {
            cache_radius_meters: 25.0,
            primary: ProviderKind::Nominatim,
            fallback: None,
            providers: ProviderKind::ALL
                .iter()
                .map(|&k| ProviderConfig::default_for(k))
                .collect(),
        }
    }
}

impl GeocodingConfig {
    pub fn provider(&self, kind: ProviderKind) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.kind == kind)
    }

    pub fn provider_mut(&mut self, kind: ProviderKind) -> Option<&mut ProviderConfig> {
        self.providers.iter_mut().find(|p| p.kind == kind)
    }

    /// Defaults overridden by `GEOTIMELINE_GEOCODING_*` variables.
    ///
    /// Supplying an API key for Google Maps or Mapbox enables that provider.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(radius) = env_parse::<f64>("GEOCODING_CACHE_RADIUS")? {
            config.cache_radius_meters = radius;
        }
        if let Some(primary) = env_parse::<ProviderKind>("GEOCODING_PRIMARY")? {
            config.primary = primary;
        }
        if let Some(fallback) = env_parse::<ProviderKind>("GEOCODING_FALLBACK")? {
            config.fallback = Some(fallback);
        }
        for (kind, key_var) in [
            (ProviderKind::GoogleMaps, "GEOCODING_GOOGLE_API_KEY"),
            (ProviderKind::Mapbox, "GEOCODING_MAPBOX_ACCESS_TOKEN"),
        ] {
            if let Some(key) = env_parse::<String>(key_var)? {
                if let Some(provider) = config.provider_mut(kind) {
                    provider.api_key = Some(key);
                    provider.enabled = true;
                }
            }
        }
        if let Some(enabled) = env_parse::<bool>("GEOCODING_PHOTON_ENABLED")? {
            if let Some(provider) = config.provider_mut(ProviderKind::Photon) {
                provider.enabled = enabled;
            }
        }
        if config.cache_radius_meters < 0.0 {
            return Err(TimelineError::invalid_config(
                "cache_radius_meters",
                "cache radius must be non-negative",
            ));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_layers_only_set_fields() {
        let base = TimelineConfig::default();
        let o = TimelineConfigOverride {
            velocity_threshold: Some(12.0),
            merge_enabled: Some(false),
            ..Default::default()
        };
        let layered = o.apply_to(&base);
        assert_eq!(layered.velocity_threshold, 12.0);
        assert!(!layered.merge_enabled);
        assert_eq!(layered.trip_min_distance, base.trip_min_distance);
    }

    #[test]
    fn test_user_override_on_top_of_global() {
        let global = TimelineConfigOverride {
            trip_min_distance: Some(80.0),
            ..Default::default()
        };
        let store = LayeredConfigStore::new(&global).unwrap();
        let alice = UserId::new_v4();
        let bob = UserId::new_v4();

        store
            .set_user_override(
                alice,
                TimelineConfigOverride {
                    velocity_threshold: Some(5.0),
                    ..Default::default()
                },
            )
            .unwrap();

        let a = store.effective_config(alice).unwrap();
        assert_eq!(a.velocity_threshold, 5.0);
        assert_eq!(a.trip_min_distance, 80.0);

        let b = store.effective_config(bob).unwrap();
        assert_eq!(b.velocity_threshold, 8.0);
        assert_eq!(b.trip_min_distance, 80.0);
    }

    #[test]
    fn test_invalid_user_override_rejected() {
        let store = LayeredConfigStore::default();
        let user = UserId::new_v4();
        let result = store.set_user_override(
            user,
            TimelineConfigOverride {
                velocity_threshold: Some(-1.0),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(TimelineError::InvalidConfig { .. })));
        assert_eq!(store.effective_config(user).unwrap().velocity_threshold, 8.0);
    }

    #[test]
    fn test_override_deserializes_partially() {
        let o: TimelineConfigOverride =
            serde_json::from_str(r#"{"algorithm":"clustering","trip_min_distance":75.0}"#).unwrap();
        assert_eq!(o.algorithm, Some(DetectionAlgorithm::Clustering));
        assert_eq!(o.trip_min_distance, Some(75.0));
        assert!(o.velocity_threshold.is_none());
    }

    #[test]
    fn test_default_geocoding_config() {
        let config = GeocodingConfig::default();
        assert_eq!(config.cache_radius_meters, 25.0);
        assert_eq!(config.primary, ProviderKind::Nominatim);
        assert!(config.provider(ProviderKind::Nominatim).unwrap().enabled);
        assert!(!config.provider(ProviderKind::GoogleMaps).unwrap().enabled);
        assert_eq!(config.providers.len(), 4);
    }
}
