//! Error taxonomy for the safety engine.

use crate::capabilities::CapabilityError;
use crate::config::ConfigError;

/// Result type for engine operations
pub type SentinelResult<T> = Result<T, SentinelError>;

/// Errors that can occur in the detection and response layers
#[derive(Debug, thiserror::Error)]
pub enum SentinelError {
    /// A platform capability was denied; callers degrade instead of failing.
    #[error("Permission unavailable: {0}")]
    PermissionUnavailable(String),

    /// The sensor stream ended or failed; monitoring stops.
    #[error("Sensor unavailable: {0}")]
    SensorUnavailable(String),

    /// Neither a fresh nor a last-known fix could be obtained.
    #[error("Location unresolved")]
    LocationUnresolved,

    /// Every SMS in a batch failed (partial failures are only logged).
    #[error("SMS dispatch failed for {failed} of {total} recipients")]
    DispatchFailure { failed: usize, total: usize },

    /// Another alert already owns the emergency state.
    #[error("Emergency already active: {active}")]
    CoordinatorConflict { active: String },

    /// A recent cancellation still blocks new emergencies.
    #[error("Emergency refused during cancellation cooldown")]
    CooldownActive,

    #[error("Capability error: {0}")]
    Capability(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<CapabilityError> for SentinelError {
    fn from(err: CapabilityError) -> Self {
        match err {
            CapabilityError::PermissionDenied(what) => SentinelError::PermissionUnavailable(what),
            other => SentinelError::Capability(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_maps_to_permission_unavailable() {
        let err: SentinelError = CapabilityError::PermissionDenied("location".into()).into();
        assert!(matches!(err, SentinelError::PermissionUnavailable(ref w) if w == "location"));
    }

    #[test]
    fn test_dispatch_failure_message() {
        let err = SentinelError::DispatchFailure { failed: 2, total: 2 };
        assert_eq!(err.to_string(), "SMS dispatch failed for 2 of 2 recipients");
    }
}
