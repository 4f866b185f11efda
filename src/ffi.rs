//! C FFI bindings for native mobile hosts.
//!
//! Exposes the synchronous detection pipeline over a C ABI so iOS and Android
//! shells can feed raw sensor callbacks straight into it. The response
//! workflow stays on the Rust side of the app; hosts only need detections.
//!
//! Memory Safety:
//! - The detector instance must be freed with `sentinel_detector_destroy()`
//! - NULL checks are performed on all pointer inputs
//! - `sentinel_version()` returns a static string, never free it
//!
//! Thread Safety:
//! - A detector is NOT thread-safe. Use it from one thread or behind a mutex.

use std::os::raw::c_char;

use crate::pipeline::{DetectionConfig, DetectionPipeline};
use crate::types::{DetectionEvent, SensorSample};

// ============================================================================
// OPAQUE HANDLE TYPES
// ============================================================================

/// Opaque handle to a detection pipeline.
pub struct SentinelDetector {
    pipeline: DetectionPipeline,
}

/// Result status codes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentinelStatus {
    /// Operation succeeded.
    Ok = 0,
    /// Null pointer provided.
    NullPointer = 1,
    /// Sample contained NaN or infinite values and was skipped.
    InvalidSample = 2,
}

/// Detector thresholds. Zero (or negative) fields keep the default.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SentinelDetectorConfig {
    /// Free-fall entry threshold in m/s².
    pub free_fall_threshold: f32,
    /// Peak magnitude that confirms a fall, m/s².
    pub fall_detection_threshold: f32,
    /// Free-fall window length in ms.
    pub free_fall_duration_ms: u64,
    /// Deviation from baseline that counts as an impact sample, m/s².
    pub impact_detection_threshold: f32,
    /// Minimum rotation for an impact sample, rad/s.
    pub gyroscope_sensitivity: f32,
    /// Consecutive impact samples needed.
    pub impact_confirmation_count: u32,
    /// Minimum spacing between impacts in ms.
    pub impact_cooldown_ms: u64,
    /// Non-zero disables fall detection.
    pub disable_fall: i32,
    /// Non-zero disables impact detection.
    pub disable_impact: i32,
}

/// Output from processing one sample.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SentinelSampleOutput {
    /// Timestamp in milliseconds.
    pub timestamp_ms: u64,
    /// Acceleration magnitude in m/s².
    pub magnitude: f32,
    /// Current baseline in m/s².
    pub baseline: f32,
    /// Gyroscope magnitude in rad/s.
    pub gyro_magnitude: f32,
    /// Fall confirmed by this call (0 or 1).
    pub fall_detected: i32,
    /// Impact confirmed by this call (0 or 1).
    pub impact_detected: i32,
}

fn detection_config(config: &SentinelDetectorConfig) -> DetectionConfig {
    let mut detection = DetectionConfig::default();
    if config.free_fall_threshold > 0.0 {
        detection.fall.free_fall_threshold = config.free_fall_threshold;
    }
    if config.fall_detection_threshold > 0.0 {
        detection.fall.fall_detection_threshold = config.fall_detection_threshold;
    }
    if config.free_fall_duration_ms > 0 {
        detection.fall.free_fall_duration_ms = config.free_fall_duration_ms;
    }
    if config.impact_detection_threshold > 0.0 {
        detection.impact.impact_detection_threshold = config.impact_detection_threshold;
    }
    if config.gyroscope_sensitivity > 0.0 {
        detection.impact.gyroscope_sensitivity = config.gyroscope_sensitivity;
    }
    if config.impact_confirmation_count > 0 {
        detection.impact.confirmation_count = config.impact_confirmation_count;
    }
    if config.impact_cooldown_ms > 0 {
        detection.impact.cooldown_ms = config.impact_cooldown_ms;
    }
    detection.fall.enabled = config.disable_fall == 0;
    detection.impact.enabled = config.disable_impact == 0;
    detection
}

fn record_events(output: &mut SentinelSampleOutput, events: &[DetectionEvent]) {
    for event in events {
        match event {
            DetectionEvent::Fall { .. } => output.fall_detected = 1,
            DetectionEvent::Impact { .. } => output.impact_detected = 1,
        }
    }
}

// ============================================================================
// DETECTOR LIFECYCLE
// ============================================================================

/// Create a detector.
///
/// # Safety
/// - `config` may be NULL (all defaults) or must point to a valid config.
/// - The returned pointer must be freed with `sentinel_detector_destroy()`.
#[no_mangle]
pub unsafe extern "C" fn sentinel_detector_create(
    config: *const SentinelDetectorConfig,
) -> *mut SentinelDetector {
    let detection = if config.is_null() {
        DetectionConfig::default()
    } else {
        detection_config(&*config)
    };
    Box::into_raw(Box::new(SentinelDetector {
        pipeline: DetectionPipeline::new(detection),
    }))
}

/// Destroy a detector.
///
/// # Safety
/// - `detector` must come from `sentinel_detector_create()`.
/// - Must not be called more than once for the same pointer.
#[no_mangle]
pub unsafe extern "C" fn sentinel_detector_destroy(detector: *mut SentinelDetector) {
    if !detector.is_null() {
        drop(Box::from_raw(detector));
    }
}

/// Reset baseline, windows and counters.
///
/// # Safety
/// - `detector` must be a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn sentinel_detector_reset(
    detector: *mut SentinelDetector,
) -> SentinelStatus {
    if detector.is_null() {
        return SentinelStatus::NullPointer;
    }
    (*detector).pipeline.reset();
    SentinelStatus::Ok
}

// ============================================================================
// SAMPLE PROCESSING
// ============================================================================

/// Process one accelerometer + gyroscope sample.
///
/// # Safety
/// - `detector` must be a valid pointer.
/// - `output` must be a valid pointer to receive results.
///
/// # Parameters
/// - `timestamp_ms`: monotonic timestamp in milliseconds.
/// - `accel_x/y/z`: accelerometer in m/s², gravity included.
/// - `gyro_x/y/z`: gyroscope in rad/s.
#[no_mangle]
pub unsafe extern "C" fn sentinel_detector_process_sample(
    detector: *mut SentinelDetector,
    timestamp_ms: u64,
    accel_x: f32, accel_y: f32, accel_z: f32,
    gyro_x: f32, gyro_y: f32, gyro_z: f32,
    output: *mut SentinelSampleOutput,
) -> SentinelStatus {
    if detector.is_null() || output.is_null() {
        return SentinelStatus::NullPointer;
    }
    let detector = &mut *detector;
    let output = &mut *output;
    *output = SentinelSampleOutput {
        timestamp_ms,
        ..SentinelSampleOutput::default()
    };

    let sample = SensorSample::new(
        timestamp_ms,
        [accel_x, accel_y, accel_z],
        [gyro_x, gyro_y, gyro_z],
    );
    let result = detector.pipeline.process_sample(&sample);
    let Some(snapshot) = result.snapshot else {
        output.baseline = detector.pipeline.baseline();
        return SentinelStatus::InvalidSample;
    };

    output.magnitude = snapshot.magnitude;
    output.baseline = snapshot.baseline;
    output.gyro_magnitude = snapshot.gyro_magnitude;
    record_events(output, &result.events);
    SentinelStatus::Ok
}

/// Close free-fall windows that expired at `now_ms` with no new sample.
///
/// Hosts with irregular sensor delivery call this from a timer.
///
/// # Safety
/// - `detector` and `output` must be valid pointers.
#[no_mangle]
pub unsafe extern "C" fn sentinel_detector_poll(
    detector: *mut SentinelDetector,
    now_ms: u64,
    output: *mut SentinelSampleOutput,
) -> SentinelStatus {
    if detector.is_null() || output.is_null() {
        return SentinelStatus::NullPointer;
    }
    let detector = &mut *detector;
    let output = &mut *output;
    *output = SentinelSampleOutput {
        timestamp_ms: now_ms,
        baseline: detector.pipeline.baseline(),
        ..SentinelSampleOutput::default()
    };
    if let Some(event) = detector.pipeline.poll(now_ms) {
        record_events(output, &[event]);
    }
    SentinelStatus::Ok
}

// ============================================================================
// STATUS QUERIES
// ============================================================================

/// Next free-fall deadline in ms, or 0 when no window is open.
#[no_mangle]
pub unsafe extern "C" fn sentinel_detector_next_deadline(detector: *const SentinelDetector) -> u64 {
    if detector.is_null() {
        return 0;
    }
    (*detector).pipeline.next_deadline_ms().unwrap_or(0)
}

/// Total accepted samples, or -1 on NULL.
#[no_mangle]
pub unsafe extern "C" fn sentinel_detector_sample_count(detector: *const SentinelDetector) -> i64 {
    if detector.is_null() {
        return -1;
    }
    (*detector).pipeline.total_samples() as i64
}

/// Total detections, or -1 on NULL.
#[no_mangle]
pub unsafe extern "C" fn sentinel_detector_event_count(detector: *const SentinelDetector) -> i64 {
    if detector.is_null() {
        return -1;
    }
    (*detector).pipeline.total_events() as i64
}

// ============================================================================
// VERSION INFO
// ============================================================================

/// Get the library version string.
///
/// # Returns
/// - Static string, do NOT free.
#[no_mangle]
pub extern "C" fn sentinel_version() -> *const c_char {
    static VERSION: &[u8] = concat!("sentinel-safety/", env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}

/// Default thresholds, for hosts that want to tweak one field.
#[no_mangle]
pub extern "C" fn sentinel_default_config() -> SentinelDetectorConfig {
    let detection = DetectionConfig::default();
    SentinelDetectorConfig {
        free_fall_threshold: detection.fall.free_fall_threshold,
        fall_detection_threshold: detection.fall.fall_detection_threshold,
        free_fall_duration_ms: detection.fall.free_fall_duration_ms,
        impact_detection_threshold: detection.impact.impact_detection_threshold,
        gyroscope_sensitivity: detection.impact.gyroscope_sensitivity,
        impact_confirmation_count: detection.impact.confirmation_count,
        impact_cooldown_ms: detection.impact.cooldown_ms,
        disable_fall: 0,
        disable_impact: 0,
    }
}

// ============================================================================
// TESTS
// ============================================================================
