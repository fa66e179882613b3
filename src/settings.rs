//! Setting-key registry and batch validation.
//!
//! [`SETTINGS`] is built once and never mutated: it maps every user-facing
//! setting key to its type and bounds. [`ValidationContext`] overlays a
//! batch of pending string edits on a persisted configuration, checks each
//! key against its definition, then checks the layered result as a whole.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;

use crate::validation::validate_config;
use crate::{DetectionAlgorithm, Result, TimelineConfig, TimelineConfigOverride, TimelineError};

/// Value type and bounds of a setting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SettingKind {
    Float { min: f64, max: Option<f64> },
    Seconds { min: i64 },
    Boolean,
    Algorithm,
}

/// Definition of one configurable setting.
#[derive(Debug, Clone, Copy)]
pub struct SettingDefinition {
    pub key: &'static str,
    pub kind: SettingKind,
    pub description: &'static str,
}

fn float(key: &'static str, min: f64, max: Option<f64>, description: &'static str) -> SettingDefinition {
    SettingDefinition {
        key,
        kind: SettingKind::Float { min, max },
        description,
    }
}

fn seconds(key: &'static str, description: &'static str) -> SettingDefinition {
    SettingDefinition {
        key,
        kind: SettingKind::Seconds { min: 0 },
        description,
    }
}

fn boolean(key: &'static str, description: &'static str) -> SettingDefinition {
    SettingDefinition {
        key,
        kind: SettingKind::Boolean,
        description,
    }
}

/// Immutable registry of all timeline settings, keyed by setting key.
pub static SETTINGS: Lazy<BTreeMap<&'static str, SettingDefinition>> = Lazy::new(|| {
    [
        SettingDefinition {
            key: "timeline.algorithm",
            kind: SettingKind::Algorithm,
            description: "Stay/trip detection algorithm",
        },
        boolean("timeline.use_velocity_accuracy", "Ignore inaccurate points when clustering"),
        float("timeline.max_accuracy_threshold", 0.0, None, "Worst usable accuracy (m)"),
        float("timeline.velocity_threshold", 0.0, None, "Moving speed threshold (km/h)"),
        float("timeline.min_accuracy_ratio", 0.0, Some(1.0), "Required share of accurate points"),
        seconds("timeline.stay_min_duration_seconds", "Minimum stay duration"),
        float("timeline.trip_min_distance", 0.0, None, "Minimum trip distance (m)"),
        seconds("timeline.trip_min_duration_seconds", "Minimum trip duration"),
        boolean("timeline.merge_enabled", "Merge nearby consecutive stays"),
        float("timeline.merge_max_distance", 0.0, None, "Stay merge distance (m)"),
        seconds("timeline.merge_max_time_gap_seconds", "Stay merge time gap"),
        seconds("timeline.data_gap_threshold_seconds", "Silence that starts a data gap"),
        seconds("timeline.data_gap_min_duration_seconds", "Shortest recorded data gap"),
        boolean("timeline.path_simplification_enabled", "Simplify trip paths"),
        float("timeline.path_simplification_tolerance", 0.0, None, "Path simplification tolerance (m)"),
        float("timeline.max_reasonable_speed", 0.0, None, "Speed treated as a GPS glitch (km/h)"),
    ]
    .into_iter()
    .map(|d| (d.key, d))
    .collect()
});

/// Current value of a setting in `config`, formatted as its string form.
pub fn current_value(config: &TimelineConfig, key: &str) -> Option<String> {
    let value = match key {
        "timeline.algorithm" => match config.algorithm {
            DetectionAlgorithm::Enhanced => "enhanced".to_string(),
            DetectionAlgorithm::Clustering => "clustering".to_string(),
        },
        "timeline.use_velocity_accuracy" => config.use_velocity_accuracy.to_string(),
        "timeline.max_accuracy_threshold" => config.max_accuracy_threshold.to_string(),
        "timeline.velocity_threshold" => config.velocity_threshold.to_string(),
        "timeline.min_accuracy_ratio" => config.min_accuracy_ratio.to_string(),
        "timeline.stay_min_duration_seconds" => config.stay_min_duration_seconds.to_string(),
        "timeline.trip_min_distance" => config.trip_min_distance.to_string(),
        "timeline.trip_min_duration_seconds" => config.trip_min_duration_seconds.to_string(),
        "timeline.merge_enabled" => config.merge_enabled.to_string(),
        "timeline.merge_max_distance" => config.merge_max_distance.to_string(),
        "timeline.merge_max_time_gap_seconds" => config.merge_max_time_gap_seconds.to_string(),
        "timeline.data_gap_threshold_seconds" => config.data_gap_threshold_seconds.to_string(),
        "timeline.data_gap_min_duration_seconds" => {
            config.data_gap_min_duration_seconds.to_string()
        }
        "timeline.path_simplification_enabled" => config.path_simplification_enabled.to_string(),
        "timeline.path_simplification_tolerance" => {
            config.path_simplification_tolerance.to_string()
        }
        "timeline.max_reasonable_speed" => config.max_reasonable_speed.to_string(),
        _ => return None,
    };
    Some(value)
}

/// Typed value parsed from a pending string edit.
enum Parsed {
    Float(f64),
    Seconds(i64),
    Boolean(bool),
    Algorithm(DetectionAlgorithm),
}

fn parse_value(def: &SettingDefinition, raw: &str) -> Result<Parsed> {
    let bad = |message: String| TimelineError::invalid_config(def.key, message);
    let raw = raw.trim();
    match def.kind {
        SettingKind::Float { min, max } => {
            let v: f64 = raw
                .parse()
                .map_err(|_| bad(format!("'{}' is not a number", raw)))?;
            if !v.is_finite() || v < min {
                return Err(bad(format!("must be at least {}", min)));
            }
            if let Some(max) = max {
                if v > max {
                    return Err(bad(format!("must be at most {}", max)));
                }
            }
            Ok(Parsed::Float(v))
        }
        SettingKind::Seconds { min } => {
            let v: i64 = raw
                .parse()
                .map_err(|_| bad(format!("'{}' is not a whole number of seconds", raw)))?;
            if v < min {
                return Err(bad(format!("must be at least {} seconds", min)));
            }
            Ok(Parsed::Seconds(v))
        }
        SettingKind::Boolean => raw
            .parse()
            .map(Parsed::Boolean)
            .map_err(|_| bad(format!("'{}' is not true/false", raw))),
        SettingKind::Algorithm => raw.parse().map(Parsed::Algorithm),
    }
}

fn apply_parsed(target: &mut TimelineConfigOverride, key: &str, value: Parsed) {
    match (key, value) {
        ("timeline.algorithm", Parsed::Algorithm(v)) => target.algorithm = Some(v),
        ("timeline.use_velocity_accuracy", Parsed::Boolean(v)) => {
            target.use_velocity_accuracy = Some(v)
        }
        ("timeline.max_accuracy_threshold", Parsed::Float(v)) => {
            target.max_accuracy_threshold = Some(v)
        }
        ("timeline.velocity_threshold", Parsed::Float(v)) => target.velocity_threshold = Some(v),
        ("timeline.min_accuracy_ratio", Parsed::Float(v)) => target.min_accuracy_ratio = Some(v),
        ("timeline.stay_min_duration_seconds", Parsed::Seconds(v)) => {
            target.stay_min_duration_seconds = Some(v)
        }
        ("timeline.trip_min_distance", Parsed::Float(v)) => target.trip_min_distance = Some(v),
        ("timeline.trip_min_duration_seconds", Parsed::Seconds(v)) => {
            target.trip_min_duration_seconds = Some(v)
        }
        ("timeline.merge_enabled", Parsed::Boolean(v)) => target.merge_enabled = Some(v),
        ("timeline.merge_max_distance", Parsed::Float(v)) => target.merge_max_distance = Some(v),
        ("timeline.merge_max_time_gap_seconds", Parsed::Seconds(v)) => {
            target.merge_max_time_gap_seconds = Some(v)
        }
        ("timeline.data_gap_threshold_seconds", Parsed::Seconds(v)) => {
            target.data_gap_threshold_seconds = Some(v)
        }
        ("timeline.data_gap_min_duration_seconds", Parsed::Seconds(v)) => {
            target.data_gap_min_duration_seconds = Some(v)
        }
        ("timeline.path_simplification_enabled", Parsed::Boolean(v)) => {
            target.path_simplification_enabled = Some(v)
        }
        ("timeline.path_simplification_tolerance", Parsed::Float(v)) => {
            target.path_simplification_tolerance = Some(v)
        }
        ("timeline.max_reasonable_speed", Parsed::Float(v)) => {
            target.max_reasonable_speed = Some(v)
        }
        // The registry and the parser agree on kinds for every key.
        _ => {}
    }
}

/// Pending setting edits layered over persisted settings for one
/// validation pass. Consumed by [`ValidationContext::validate`].
#[derive(Debug)]
pub struct ValidationContext<'a> {
    persisted: &'a TimelineConfig,
    pending: BTreeMap<String, String>,
}

impl<'a> ValidationContext<'a> {
    pub fn new(persisted: &'a TimelineConfig) -> Self {
        Self {
            persisted,
            pending: BTreeMap::new(),
        }
    }

    /// Stage an edit. Unknown keys are rejected immediately.
    pub fn set_pending(&mut self, key: &str, value: impl Into<String>) -> Result<()> {
        if !SETTINGS.contains_key(key) {
            return Err(TimelineError::InvalidInput(format!(
                "unknown setting '{}'",
                key
            )));
        }
        self.pending.insert(key.to_string(), value.into());
        Ok(())
    }

    /// Pending value if staged, otherwise the persisted one.
    pub fn effective_value(&self, key: &str) -> Option<String> {
        self.pending
            .get(key)
            .cloned()
            .or_else(|| current_value(self.persisted, key))
    }

    pub fn pending_keys(&self) -> impl Iterator<Item = &str> {
        self.pending.keys().map(String::as_str)
    }

    /// Validate the batch and return the configuration it would produce.
    pub fn validate(self) -> Result<TimelineConfig> {
        let mut changes = TimelineConfigOverride::default();
        for (key, raw) in &self.pending {
            let def = SETTINGS
                .get(key.as_str())
                .ok_or_else(|| TimelineError::InvalidInput(format!("unknown setting '{}'", key)))?;
            let value = parse_value(def, raw)?;
            apply_parsed(&mut changes, key, value);
        }

        let merged = changes.apply_to(self.persisted);
        validate_config(&merged)?;

        if merged.data_gap_min_duration_seconds > merged.data_gap_threshold_seconds {
            return Err(TimelineError::invalid_config(
                "data_gap_min_duration_seconds",
                "minimum data gap duration cannot exceed the data gap threshold",
            ));
        }
        if merged.merge_enabled && merged.merge_max_distance < merged.trip_min_distance {
            return Err(TimelineError::invalid_config(
                "merge_max_distance",
                "merge distance must be at least the trip minimum distance",
            ));
        }
        Ok(merged)
    }
}
