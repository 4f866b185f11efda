//! Engine configuration.
//!
//! Layers, lowest priority first:
//! 1. Built-in defaults
//! 2. Default TOML file, then user TOML file, merged key by key
//! 3. `SENTINEL_*` environment variables
//! 4. User settings from the key-value store (what the settings screen writes)

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capabilities::ConfigStore;
use crate::pipeline::DetectionConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
    #[error("Environment variable error: {0}")]
    EnvVar(#[from] env::VarError),
}

/// Keys the settings screen writes into the `ConfigStore`.
pub mod keys {
    pub const APP_ENABLED: &str = "settings.app_enabled";
    pub const FALL_DETECTION_ENABLED: &str = "settings.fall_detection_enabled";
    pub const IMPACT_DETECTION_ENABLED: &str = "settings.impact_detection_enabled";
    pub const FALL_THRESHOLD: &str = "settings.fall_threshold";
    pub const IMPACT_THRESHOLD: &str = "settings.impact_threshold";
    pub const COUNTDOWN_SECS: &str = "settings.countdown_secs";
    pub const ALARM_DURATION_SECS: &str = "settings.alarm_duration_secs";
    pub const SOUND_ENABLED: &str = "settings.sound_enabled";
    pub const VIBRATION_ENABLED: &str = "settings.vibration_enabled";
    pub const FLASHLIGHT_ENABLED: &str = "settings.flashlight_enabled";
    pub const USER_NAME: &str = "settings.user_name";
    pub const SMS_TEMPLATE: &str = "settings.sms_template";
}

/// Default SMS body. Placeholders: {name} {alertType} {timestamp} {location}.
pub const DEFAULT_SMS_TEMPLATE: &str = concat!(
    "EMERGENCY: {alertType} for {name} at {timestamp}. ",
    "Location: {location}. Please check on them immediately."
);

/// Settings for the emergency response workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseConfig {
    /// Master switch. When false detections are logged and ignored.
    pub app_enabled: bool,
    /// User's window to cancel before SMS go out (s).
    pub countdown_secs: u64,
    /// Cap on siren, vibration and strobe (s).
    pub alarm_duration_secs: u64,
    /// Siren volume in [0, 1].
    pub alarm_volume: f32,
    pub sound_enabled: bool,
    pub vibration_enabled: bool,
    pub flashlight_enabled: bool,
    /// Vibration pattern, ms, alternating on/off starting with on.
    pub vibration_pattern_ms: Vec<u64>,
    /// Torch strobe half-period (ms).
    pub strobe_interval_ms: u64,
    /// Pause between fallback beeps (ms).
    pub beep_interval_ms: u64,
    /// Coordinator refuses new emergencies this long after a cancellation (s).
    pub coordinator_cooldown_secs: u64,
    /// How long the cancelled flag stays raised after a cancellation (ms).
    pub cancel_grace_ms: u64,
    /// Minimum spacing between background-originated responses (s).
    pub background_cooldown_secs: u64,
    /// Fresh GPS fix timeout (s).
    pub location_timeout_secs: u64,
    /// Upper bound on one SMS batch (s).
    pub sms_timeout_secs: u64,
    /// Name substituted for {name}.
    pub user_name: String,
    pub sms_template: String,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            app_enabled: true,
            countdown_secs: 30,
            alarm_duration_secs: 30,
            alarm_volume: 1.0,
            sound_enabled: true,
            vibration_enabled: true,
            flashlight_enabled: true,
            vibration_pattern_ms: vec![1000, 500, 300, 500, 1000, 500],
            strobe_interval_ms: 250,
            beep_interval_ms: 700,
            coordinator_cooldown_secs: 30,
            cancel_grace_ms: 500,
            background_cooldown_secs: 300,
            location_timeout_secs: 10,
            sms_timeout_secs: 60,
            user_name: "Sentinel user".to_string(),
            sms_template: DEFAULT_SMS_TEMPLATE.to_string(),
        }
    }
}

impl ResponseConfig {
    pub fn countdown(&self) -> Duration {
        Duration::from_secs(self.countdown_secs)
    }

    pub fn alarm_duration(&self) -> Duration {
        Duration::from_secs(self.alarm_duration_secs)
    }

    pub fn background_cooldown(&self) -> Duration {
        Duration::from_secs(self.background_cooldown_secs)
    }

    pub fn location_timeout(&self) -> Duration {
        Duration::from_secs(self.location_timeout_secs)
    }

    pub fn sms_timeout(&self) -> Duration {
        Duration::from_secs(self.sms_timeout_secs)
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    pub detection: DetectionConfig,
    pub response: ResponseConfig,
}

macro_rules! env_override {
    ($var:literal, $target:expr) => {
        if let Ok(val) = env::var($var) {
            $target = val
                .parse()
                .map_err(|_| ConfigError::Validation(concat!("Invalid ", $var).to_string()))?;
        }
    };
}

/// Overlay `layer` onto `base`, descending into tables present in both.
fn merge_tables(base: &mut toml::Table, layer: toml::Table) {
    for (key, value) in layer {
        match value {
            toml::Value::Table(incoming) => match base.get_mut(&key) {
                Some(toml::Value::Table(existing)) => merge_tables(existing, incoming),
                _ => {
                    base.insert(key, toml::Value::Table(incoming));
                }
            },
            value => {
                base.insert(key, value);
            }
        }
    }
}

impl SentinelConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: SentinelConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. User config file (if exists)
    /// 3. Default config file (if exists)
    /// 4. Built-in defaults (lowest priority)
    ///
    /// Files are merged key by key: a user file that only sets
    /// `response.countdown_secs` keeps everything else from the default file.
    pub fn load_layered(
        default_path: Option<&Path>,
        user_path: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();
        for path in [default_path, user_path].into_iter().flatten() {
            if path.exists() {
                let layer: toml::Table = toml::from_str(&fs::read_to_string(path)?)?;
                merge_tables(&mut merged, layer);
            }
        }

        let mut config: SentinelConfig = toml::Value::Table(merged).try_into()?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SENTINEL_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        env_override!("SENTINEL_SAMPLE_PERIOD_MS", self.detection.sample_period_ms);
        env_override!("SENTINEL_FREE_FALL_THRESHOLD", self.detection.fall.free_fall_threshold);
        env_override!("SENTINEL_FALL_THRESHOLD", self.detection.fall.fall_detection_threshold);
        env_override!("SENTINEL_FREE_FALL_DURATION_MS", self.detection.fall.free_fall_duration_ms);
        env_override!(
            "SENTINEL_IMPACT_THRESHOLD",
            self.detection.impact.impact_detection_threshold
        );
        env_override!("SENTINEL_GYRO_SENSITIVITY", self.detection.impact.gyroscope_sensitivity);
        env_override!("SENTINEL_IMPACT_CONFIRMATIONS", self.detection.impact.confirmation_count);
        env_override!("SENTINEL_COUNTDOWN_SECS", self.response.countdown_secs);
        env_override!("SENTINEL_ALARM_DURATION_SECS", self.response.alarm_duration_secs);
        env_override!("SENTINEL_APP_ENABLED", self.response.app_enabled);
        if let Ok(name) = env::var("SENTINEL_USER_NAME") {
            self.response.user_name = name;
        }
        Ok(())
    }

    /// Overlay user settings written by the settings screen.
    ///
    /// Missing keys leave the current value; out-of-range numbers are ignored
    /// with a warning rather than failing startup.
    pub fn apply_store_overrides(&mut self, store: &dyn ConfigStore) {
        let response = &mut self.response;
        let detection = &mut self.detection;

        if let Some(v) = store.get_bool(keys::APP_ENABLED) {
            response.app_enabled = v;
        }
        if let Some(v) = store.get_bool(keys::FALL_DETECTION_ENABLED) {
            detection.fall.enabled = v;
        }
        if let Some(v) = store.get_bool(keys::IMPACT_DETECTION_ENABLED) {
            detection.impact.enabled = v;
        }
        if let Some(v) = store.get_bool(keys::SOUND_ENABLED) {
            response.sound_enabled = v;
        }
        if let Some(v) = store.get_bool(keys::VIBRATION_ENABLED) {
            response.vibration_enabled = v;
        }
        if let Some(v) = store.get_bool(keys::FLASHLIGHT_ENABLED) {
            response.flashlight_enabled = v;
        }
        match store.get_float(keys::FALL_THRESHOLD) {
            Some(v) if v > detection.fall.free_fall_threshold as f64 => {
                detection.fall.fall_detection_threshold = v as f32;
            }
            Some(v) => log::warn!("ignoring stored fall threshold {v}"),
            None => {}
        }
        match store.get_float(keys::IMPACT_THRESHOLD) {
            Some(v) if v > 0.0 => detection.impact.impact_detection_threshold = v as f32,
            Some(v) => log::warn!("ignoring stored impact threshold {v}"),
            None => {}
        }
        match store.get_int(keys::COUNTDOWN_SECS) {
            Some(v) if v > 0 => response.countdown_secs = v as u64,
            Some(v) => log::warn!("ignoring stored countdown {v}"),
            None => {}
        }
        match store.get_int(keys::ALARM_DURATION_SECS) {
            Some(v) if v > 0 => response.alarm_duration_secs = v as u64,
            Some(v) => log::warn!("ignoring stored alarm duration {v}"),
            None => {}
        }
        if let Some(v) = store.get_string(keys::USER_NAME) {
            if !v.trim().is_empty() {
                response.user_name = v;
            }
        }
        if let Some(v) = store.get_string(keys::SMS_TEMPLATE) {
            if !v.trim().is_empty() {
                response.sms_template = v;
            }
        }
    }

    /// Reject configurations the detectors or the workflow cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.detection;
        let r = &self.response;

        if d.sample_period_ms == 0 {
            return Err(ConfigError::Validation("sample_period_ms must be > 0".into()));
        }
        if d.fall.free_fall_threshold <= 0.0 || d.fall.fall_detection_threshold <= 0.0 {
            return Err(ConfigError::Validation("fall thresholds must be > 0".into()));
        }
        if d.fall.free_fall_threshold >= d.fall.fall_detection_threshold {
            return Err(ConfigError::Validation(
                "free_fall_threshold must be below fall_detection_threshold".into(),
            ));
        }
        if d.fall.free_fall_duration_ms == 0 {
            return Err(ConfigError::Validation("free_fall_duration_ms must be > 0".into()));
        }
        if d.impact.impact_detection_threshold <= 0.0 || d.impact.gyroscope_sensitivity < 0.0 {
            return Err(ConfigError::Validation("impact thresholds must be positive".into()));
        }
        if d.impact.confirmation_count == 0 {
            return Err(ConfigError::Validation("confirmation_count must be >= 1".into()));
        }
        if d.signal.baseline_window == 0
            || d.signal.baseline_min_samples == 0
            || d.signal.baseline_min_samples > d.signal.baseline_window
        {
            return Err(ConfigError::Validation(
                "baseline_min_samples must be in 1..=baseline_window".into(),
            ));
        }
        if d.signal.display_buffer_capacity < d.signal.baseline_window {
            return Err(ConfigError::Validation(
                "display_buffer_capacity must hold at least baseline_window samples".into(),
            ));
        }
        if r.countdown_secs == 0 {
            return Err(ConfigError::Validation("countdown_secs must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&r.alarm_volume) {
            return Err(ConfigError::Validation("alarm_volume must be in [0, 1]".into()));
        }
        if r.vibration_pattern_ms.is_empty() || r.vibration_pattern_ms.iter().all(|&ms| ms == 0) {
            return Err(ConfigError::Validation("vibration_pattern_ms must not be empty".into()));
        }
        if r.strobe_interval_ms == 0 || r.beep_interval_ms == 0 {
            return Err(ConfigError::Validation("alarm intervals must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_defaults_are_valid() {
        let config = SentinelConfig::default();
        config.validate().unwrap();
        assert_eq!(config.response.countdown_secs, 30);
        assert_eq!(config.response.coordinator_cooldown_secs, 30);
        assert_eq!(config.response.background_cooldown_secs, 300);
        assert_eq!(config.detection.signal.display_buffer_capacity, 100);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let toml = r#"
            [detection.fall]
            fall_detection_threshold = 30.0

            [response]
            countdown_secs = 15
            user_name = "Alex"
        "#;
        let config: SentinelConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.detection.fall.fall_detection_threshold, 30.0);
        assert_eq!(config.detection.fall.free_fall_threshold, 2.0);
        assert_eq!(config.response.countdown_secs, 15);
        assert_eq!(config.response.user_name, "Alex");
        assert_eq!(config.response.alarm_duration_secs, 30);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.toml");
        fs::write(&path, "[response]\ncountdown_secs = 5\n").unwrap();
        let config = SentinelConfig::from_file(&path).unwrap();
        assert_eq!(config.response.countdown_secs, 5);

        let missing = SentinelConfig::load_layered(Some(&dir.path().join("nope.toml")), None);
        assert!(missing.is_ok());
    }

    #[test]
    fn test_user_file_merges_over_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let default_path = dir.path().join("default.toml");
        let user_path = dir.path().join("user.toml");
        fs::write(
            &default_path,
            "[detection.fall]\nfall_detection_threshold = 30.0\n\n\
             [response]\ncountdown_secs = 15\nuser_name = \"Alex\"\n",
        )
        .unwrap();
        fs::write(&user_path, "[response]\ncountdown_secs = 5\n").unwrap();

        let config = SentinelConfig::load_layered(Some(&default_path), Some(&user_path)).unwrap();
        assert_eq!(config.response.countdown_secs, 5);
        assert_eq!(config.response.user_name, "Alex");
        assert_eq!(config.detection.fall.fall_detection_threshold, 30.0);
        assert_eq!(config.detection.fall.free_fall_threshold, 2.0);
    }

    #[test]
    fn test_layered_merge_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        let default_path = dir.path().join("default.toml");
        let user_path = dir.path().join("user.toml");
        fs::write(&default_path, "[detection.fall]\nfall_detection_threshold = 20.0\n").unwrap();
        // Fine against the built-in 25.0, inverted against the default file.
        fs::write(&user_path, "[detection.fall]\nfree_fall_threshold = 22.0\n").unwrap();

        let err = SentinelConfig::load_layered(Some(&default_path), Some(&user_path)).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_validation_rejects_inverted_fall_thresholds() {
        let mut config = SentinelConfig::default();
        config.detection.fall.free_fall_threshold = 30.0;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_validation_rejects_zero_confirmations() {
        let mut config = SentinelConfig::default();
        config.detection.impact.confirmation_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_store_overrides() {
        let store = MemoryStore::new();
        store.set_bool(keys::APP_ENABLED, false).unwrap();
        store.set_bool(keys::IMPACT_DETECTION_ENABLED, false).unwrap();
        store.set_int(keys::COUNTDOWN_SECS, 10).unwrap();
        store.set_float(keys::FALL_THRESHOLD, 28.0).unwrap();
        store.set_string(keys::USER_NAME, "Robin").unwrap();
        // Nonsense values are ignored.
        store.set_int(keys::ALARM_DURATION_SECS, -4).unwrap();

        let mut config = SentinelConfig::default();
        config.apply_store_overrides(&store);

        assert!(!config.response.app_enabled);
        assert!(!config.detection.impact.enabled);
        assert!(config.detection.fall.enabled);
        assert_eq!(config.response.countdown_secs, 10);
        assert_eq!(config.detection.fall.fall_detection_threshold, 28.0);
        assert_eq!(config.response.user_name, "Robin");
        assert_eq!(config.response.alarm_duration_secs, 30);
        config.validate().unwrap();
    }
}
