//! Core data types for the safety engine.
//!
//! This module defines the values that flow between the detection layer and
//! the emergency response layer. Detection types are small `Copy` values
//! produced once per sensor tick; response types are owned records that are
//! persisted to the alert history.
//!
//! Design principle: if a concept exists, it gets a type. Raw tuples and
//! stringly-typed statuses never cross module boundaries.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single raw motion sample from the device.
///
/// Three-axis accelerometer, three-axis gyroscope and a monotonic timestamp.
/// Produced once per tick by the platform sensor stream and consumed by the
/// signal processor. Never retained beyond the rolling buffer window.
///
/// Design note: f32 matches what mobile sensor APIs deliver and is plenty
/// for threshold-based detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    /// Monotonic timestamp in milliseconds.
    pub timestamp_ms: u64,

    /// Accelerometer reading [x, y, z] in m/s², gravity included.
    pub accel: [f32; 3],

    /// Gyroscope reading [x, y, z] in rad/s.
    pub gyro: [f32; 3],
}

impl SensorSample {
    /// Creates a new sample.
    ///
    /// Assumptions:
    /// - timestamp_ms must be monotonically increasing within a sequence
    /// - accel includes gravity (a device at rest reads ~9.81 m/s²)
    pub fn new(timestamp_ms: u64, accel: [f32; 3], gyro: [f32; 3]) -> Self {
        Self {
            timestamp_ms,
            accel,
            gyro,
        }
    }

    /// Euclidean norm of the accelerometer reading, in m/s².
    pub fn magnitude(&self) -> f32 {
        norm(self.accel)
    }

    /// Euclidean norm of the gyroscope reading, in rad/s.
    pub fn gyro_magnitude(&self) -> f32 {
        norm(self.gyro)
    }

    /// True when every axis holds a finite number.
    ///
    /// Samples with NaN or infinite components are skipped by the signal
    /// processor instead of poisoning the baseline.
    pub fn is_finite(&self) -> bool {
        self.accel.iter().chain(self.gyro.iter()).all(|v| v.is_finite())
    }
}

fn norm(v: [f32; 3]) -> f32 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

/// Derived per-sample view emitted by the signal processor for display and logging.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    /// Timestamp of the sample this snapshot was derived from.
    pub timestamp_ms: u64,
    /// Acceleration magnitude in m/s².
    pub magnitude: f32,
    /// Baseline (resting magnitude) at the time of the sample.
    pub baseline: f32,
    /// |magnitude - baseline|.
    pub magnitude_change: f32,
    /// Gyroscope magnitude in rad/s.
    pub gyro_magnitude: f32,
}

/// A discrete detection produced by the event detectors.
///
/// Delivered at most once per physical event: the fall detector arms one
/// window per free-fall entry, the impact detector is debounced by
/// consecutive confirmation plus a cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectionEvent {
    /// Free fall followed by an impact inside the free-fall window.
    Fall {
        /// Timestamp of the sample that closed the window.
        timestamp_ms: u64,
    },
    /// Sustained deviation from the baseline while the device is rotating.
    Impact {
        /// Timestamp of the confirming sample.
        timestamp_ms: u64,
    },
}

impl DetectionEvent {
    /// Timestamp carried by the event.
    pub fn timestamp_ms(&self) -> u64 {
        match self {
            DetectionEvent::Fall { timestamp_ms } | DetectionEvent::Impact { timestamp_ms } => {
                *timestamp_ms
            }
        }
    }

    /// The alert type a confirmed detection raises.
    pub fn alert_type(&self) -> AlertType {
        match self {
            DetectionEvent::Fall { .. } => AlertType::Fall,
            DetectionEvent::Impact { .. } => AlertType::Impact,
        }
    }
}

/// Kind of emergency an alert represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Fall,
    Impact,
    Panic,
    Inactivity,
    Medical,
    Custom,
    Manual,
}

impl AlertType {
    /// Severity assigned to freshly created alerts of this type.
    pub fn default_severity(&self) -> AlertSeverity {
        match self {
            AlertType::Fall | AlertType::Medical | AlertType::Panic => AlertSeverity::Critical,
            AlertType::Impact | AlertType::Manual | AlertType::Custom => AlertSeverity::High,
            AlertType::Inactivity => AlertSeverity::Medium,
        }
    }

    /// Human-readable label used in SMS bodies.
    pub fn label(&self) -> &'static str {
        match self {
            AlertType::Fall => "Fall detected",
            AlertType::Impact => "Impact detected",
            AlertType::Panic => "Panic button",
            AlertType::Inactivity => "Inactivity detected",
            AlertType::Medical => "Medical emergency",
            AlertType::Custom => "Emergency",
            AlertType::Manual => "Manual alert",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Urgency of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Lifecycle status of an alert.
///
/// `Triggered` is the only non-terminal state. An alert leaves it exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Triggered,
    Sent,
    Cancelled,
    Failed,
}

impl AlertStatus {
    /// True for Sent, Cancelled and Failed.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AlertStatus::Triggered)
    }
}

/// Which execution context started a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// Detection while the app is in the foreground.
    Foreground,
    /// Detection from the background monitoring service.
    Background,
    /// User-initiated (panic button and friends).
    Manual,
}

/// Who resolved an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionActor {
    /// The user cancelled during the countdown.
    User,
    /// The response workflow finished on its own.
    System,
}

/// A position fix reported by the platform location provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy in meters, when the platform reports one.
    pub accuracy_m: Option<f32>,
}

impl LocationFix {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy_m: None,
        }
    }
}

/// Location attached to an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertLocation {
    pub latitude: f64,
    pub longitude: f64,
    /// Reverse-geocoded address, when geocoding succeeded.
    pub address: Option<String>,
    /// True when the coordinates came from the last-known fix.
    pub stale: bool,
}

impl AlertLocation {
    /// Link that opens the coordinates in a maps application.
    pub fn maps_link(&self) -> String {
        format!(
            "https://maps.google.com/?q={:.6},{:.6}",
            self.latitude, self.longitude
        )
    }
}

static LAST_ALERT_MS: AtomicI64 = AtomicI64::new(0);

/// Generates a unique alert id from the creation instant.
///
/// Ids are `alert_<unix millis>`; two alerts created within the same
/// millisecond get consecutive values so ids never collide in-process.
fn next_alert_id(now: DateTime<Utc>) -> String {
    let now_ms = now.timestamp_millis();
    let mut last = LAST_ALERT_MS.load(Ordering::Relaxed);
    loop {
        let candidate = now_ms.max(last + 1);
        match LAST_ALERT_MS.compare_exchange_weak(
            last,
            candidate,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => return format!("alert_{candidate}"),
            Err(actual) => last = actual,
        }
    }
}

/// A single emergency alert and its response outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub source: TriggerSource,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub sensor_snapshot: Option<SensorSnapshot>,
    #[serde(default)]
    pub location: Option<AlertLocation>,
    #[serde(default)]
    pub notified_contact_ids: Vec<String>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolved_by: Option<ResolutionActor>,
}

impl Alert {
    /// Creates a triggered alert stamped with the current time.
    pub fn new(alert_type: AlertType, source: TriggerSource) -> Self {
        let now = Utc::now();
        Self {
            id: next_alert_id(now),
            alert_type,
            severity: alert_type.default_severity(),
            status: AlertStatus::Triggered,
            source,
            timestamp: now,
            sensor_snapshot: None,
            location: None,
            notified_contact_ids: Vec::new(),
            resolved_at: None,
            resolved_by: None,
        }
    }

    pub fn with_snapshot(mut self, snapshot: Option<SensorSnapshot>) -> Self {
        self.sensor_snapshot = snapshot;
        self
    }

    pub fn with_location(mut self, location: Option<AlertLocation>) -> Self {
        self.location = location;
        self
    }

    /// Moves the alert out of `Triggered`.
    ///
    /// Returns false (and changes nothing) when the alert is already terminal
    /// or `status` is `Triggered`.
    pub fn transition(&mut self, status: AlertStatus) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        true
    }

    /// Stamps the resolution fields. Allowed on terminal alerts.
    pub fn resolve(&mut self, actor: ResolutionActor) {
        self.resolved_at = Some(Utc::now());
        self.resolved_by = Some(actor);
    }
}

/// A person notified by SMS when an alert is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyContact {
    pub id: String,
    pub name: String,
    pub phone_number: String,
    #[serde(default)]
    pub relationship: Option<String>,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default = "enabled_by_default")]
    pub is_enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl EmergencyContact {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        phone_number: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            phone_number: phone_number.into(),
            relationship: None,
            is_primary: false,
            is_enabled: true,
        }
    }

    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.is_enabled = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_magnitudes() {
        let sample = SensorSample::new(0, [3.0, 4.0, 0.0], [0.0, 0.0, 2.0]);
        assert!((sample.magnitude() - 5.0).abs() < 1e-6);
        assert!((sample.gyro_magnitude() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_sample_rejects_nan() {
        let sample = SensorSample::new(0, [f32::NAN, 0.0, 9.81], [0.0; 3]);
        assert!(!sample.is_finite());
        let sample = SensorSample::new(0, [0.0, 0.0, 9.81], [0.0, f32::INFINITY, 0.0]);
        assert!(!sample.is_finite());
    }

    #[test]
    fn test_detection_event_mapping() {
        let fall = DetectionEvent::Fall { timestamp_ms: 10 };
        let impact = DetectionEvent::Impact { timestamp_ms: 20 };
        assert_eq!(fall.alert_type(), AlertType::Fall);
        assert_eq!(impact.alert_type(), AlertType::Impact);
        assert_eq!(impact.timestamp_ms(), 20);
    }

    #[test]
    fn test_alert_ids_are_unique() {
        let a = Alert::new(AlertType::Fall, TriggerSource::Foreground);
        let b = Alert::new(AlertType::Fall, TriggerSource::Foreground);
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("alert_"));
    }

    #[test]
    fn test_alert_transitions_once() {
        let mut alert = Alert::new(AlertType::Impact, TriggerSource::Background);
        assert_eq!(alert.status, AlertStatus::Triggered);
        assert_eq!(alert.severity, AlertSeverity::High);

        assert!(!alert.transition(AlertStatus::Triggered));
        assert!(alert.transition(AlertStatus::Sent));
        assert!(!alert.transition(AlertStatus::Cancelled));
        assert_eq!(alert.status, AlertStatus::Sent);

        alert.resolve(ResolutionActor::System);
        assert_eq!(alert.resolved_by, Some(ResolutionActor::System));
        assert!(alert.resolved_at.is_some());
    }

    #[test]
    fn test_alert_json_round_trip_keeps_optional_fields() {
        let mut alert = Alert::new(AlertType::Panic, TriggerSource::Manual).with_location(Some(
            AlertLocation {
                latitude: 51.5,
                longitude: -0.12,
                address: Some("Trafalgar Square".into()),
                stale: false,
            },
        ));
        alert.notified_contact_ids.push("c1".into());

        let json = serde_json::to_string(&alert).unwrap();
        assert!(json.contains("\"alert_type\":\"panic\""));
        let back: Alert = serde_json::from_str(&json).unwrap();
        assert_eq!(back, alert);
    }

    #[test]
    fn test_maps_link() {
        let location = AlertLocation {
            latitude: 1.5,
            longitude: 2.25,
            address: None,
            stale: true,
        };
        assert_eq!(location.maps_link(), "https://maps.google.com/?q=1.500000,2.250000");
    }

    #[test]
    fn test_contact_defaults_to_enabled() {
        let json = r#"{"id":"1","name":"Ann","phone_number":"+15550100"}"#;
        let contact: EmergencyContact = serde_json::from_str(json).unwrap();
        assert!(contact.is_enabled);
        assert!(!contact.is_primary);
    }
}
