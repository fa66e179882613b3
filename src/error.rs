//! Unified error handling for the timeline library.
//!
//! Every fallible operation in the crate returns [`TimelineError`]. The
//! variants follow the caller's point of view: input and configuration
//! errors are surfaced immediately, provider errors are absorbed by the
//! geocoding fallback chain, and persistence conflicts are retried once at
//! the regeneration boundary.

use thiserror::Error;

/// Unified error type for timeline operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TimelineError {
    /// A pure function received an argument it cannot work with
    /// (empty point slice, non-finite coordinate).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Caller-supplied input is malformed (bad time range, unordered points).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A configuration field violates its invariant.
    #[error("Invalid configuration '{field}': {message}")]
    InvalidConfig { field: String, message: String },

    /// A geocoding provider failed or is disabled / tripped.
    #[error("Geocoding provider {provider} unavailable: {message}")]
    ProviderUnavailable { provider: String, message: String },

    /// Concurrent writers touched the same rows; safe to retry once.
    #[error("Persistence conflict: {0}")]
    PersistenceConflict(String),

    /// Any other storage failure.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Copy-on-write violation: editing a fact owned by another user.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Referenced entity does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
}

impl TimelineError {
    pub fn invalid_config(field: &str, message: impl Into<String>) -> Self {
        TimelineError::InvalidConfig {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// Only persistence conflicts are worth a second attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TimelineError::PersistenceConflict(_))
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for TimelineError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                TimelineError::PersistenceConflict(e.to_string())
            }
            _ => TimelineError::Persistence(e.to_string()),
        }
    }
}

/// Result type alias for timeline operations.
pub type Result<T> = std::result::Result<T, TimelineError>;

/// Extension trait for converting Option to TimelineError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a not-found error.
    fn ok_or_not_found(self, entity: &'static str, id: impl ToString) -> Result<T>;

    /// Convert Option to Result with an invalid-argument error.
    fn ok_or_invalid(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, entity: &'static str, id: impl ToString) -> Result<T> {
        self.ok_or_else(|| TimelineError::NotFound {
            entity,
            id: id.to_string(),
        })
    }

    fn ok_or_invalid(self, message: &str) -> Result<T> {
        self.ok_or_else(|| TimelineError::InvalidArgument(message.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TimelineError::invalid_config(
            "velocity_threshold",
            "velocity threshold must be non-negative",
        );
        assert!(err.to_string().contains("velocity_threshold"));
        assert!(err.to_string().contains("non-negative"));
    }

    #[test]
    fn test_option_ext() {
        let none: Option<i32> = None;
        let result = none.ok_or_not_found("GeocodingLocation", 42);
        assert!(matches!(result, Err(TimelineError::NotFound { .. })));
        assert_eq!(
            result.unwrap_err().to_string(),
            "GeocodingLocation 42 not found"
        );
    }

    #[test]
    fn test_only_conflicts_are_retryable() {
        assert!(TimelineError::PersistenceConflict("busy".into()).is_retryable());
        assert!(!TimelineError::Persistence("disk".into()).is_retryable());
        assert!(!TimelineError::InvalidInput("bad".into()).is_retryable());
    }
}
