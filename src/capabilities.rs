//! Capability interfaces the engine consumes from the platform.
//!
//! Raw device access (sensors, GPS, geocoding, SMS, speaker, vibration motor,
//! torch) and settings persistence live outside this crate. The engine only
//! sees these traits, injected as `Arc<dyn Trait>` handles, so the same core
//! runs against the real platform, the simulators in `sim`, and test fakes.
//!
//! A denied or missing capability is reported as a `CapabilityError`; callers
//! degrade rather than abort.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::SentinelResult;
use crate::types::{LocationFix, SensorSample};

/// Failure reported by a platform capability.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("capability unavailable: {0}")]
    Unavailable(String),

    #[error("capability failed: {0}")]
    Failed(String),
}

/// Result type for capability calls
pub type CapabilityResult<T> = Result<T, CapabilityError>;

/// Receiving half of a sensor subscription.
///
/// The stream pushes samples (or a terminal error). The channel closing means
/// the platform stopped the stream; dropping the receiver unsubscribes.
pub type SampleReceiver = mpsc::Receiver<CapabilityResult<SensorSample>>;

/// Push-based accelerometer + gyroscope source.
#[async_trait]
pub trait SensorStream: Send + Sync {
    /// Start delivering samples at roughly `sample_period`.
    async fn subscribe(&self, sample_period: Duration) -> CapabilityResult<SampleReceiver>;
}

/// GPS and geocoding.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Request a fresh fix, giving up after `timeout`.
    async fn current_fix(&self, timeout: Duration) -> CapabilityResult<LocationFix>;

    /// The platform's cached fix, if any.
    async fn last_known_fix(&self) -> CapabilityResult<Option<LocationFix>>;

    /// Human-readable address for a coordinate, if the geocoder knows one.
    async fn reverse_geocode(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> CapabilityResult<Option<String>>;
}

/// Speaker output for the alarm siren.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Start the looping siren asset at `volume` in [0, 1].
    async fn play_siren(&self, volume: f32) -> CapabilityResult<()>;

    /// Play one short system beep.
    async fn play_beep(&self) -> CapabilityResult<()>;

    /// Stop anything playing. Safe to call when idle.
    async fn stop(&self);
}

/// Vibration motor.
#[async_trait]
pub trait VibrationMotor: Send + Sync {
    /// Run one pass of an on/off pattern, in milliseconds, starting with "on".
    async fn vibrate(&self, pattern_ms: &[u64]) -> CapabilityResult<()>;

    /// Stop vibrating. Safe to call when idle.
    async fn stop(&self);
}

/// Camera flashlight.
#[async_trait]
pub trait Torch: Send + Sync {
    async fn set_torch(&self, on: bool) -> CapabilityResult<()>;
}

/// Device SMS sender.
#[async_trait]
pub trait SmsGateway: Send + Sync {
    /// Send `message` to every recipient. One result per recipient, in order.
    async fn send_batch(&self, message: &str, recipients: &[String]) -> Vec<CapabilityResult<()>>;
}

/// Key-value settings store.
///
/// List entries are JSON-encoded strings; the store has no schema beyond that.
pub trait ConfigStore: Send + Sync {
    fn get_bool(&self, key: &str) -> Option<bool>;
    fn get_int(&self, key: &str) -> Option<i64>;
    fn get_float(&self, key: &str) -> Option<f64>;
    fn get_string(&self, key: &str) -> Option<String>;
    fn get_string_list(&self, key: &str) -> Option<Vec<String>>;

    fn set_bool(&self, key: &str, value: bool) -> SentinelResult<()>;
    fn set_int(&self, key: &str, value: i64) -> SentinelResult<()>;
    fn set_float(&self, key: &str, value: f64) -> SentinelResult<()>;
    fn set_string(&self, key: &str, value: &str) -> SentinelResult<()>;
    fn set_string_list(&self, key: &str, value: &[String]) -> SentinelResult<()>;

    fn remove(&self, key: &str) -> SentinelResult<()>;
}
