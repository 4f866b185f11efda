//! Signal processing over the raw motion stream.
//!
//! This module provides the low-level per-sample processing both detectors
//! share:
//! - Acceleration magnitude extraction
//! - A bounded FIFO of recent magnitudes (display and baseline windows)
//! - A robust baseline ("resting" magnitude) from an interquartile mean
//!
//! Design note: the baseline must stay insensitive to the very spikes the
//! impact detector looks for, so it is a trimmed mean over the middle half of
//! the last N samples rather than a running average. N is small (20), so the
//! sort per sample is cheap.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::types::{SensorSample, SensorSnapshot};

/// Standard gravity in m/s². Baseline before enough samples have arrived.
pub const STANDARD_GRAVITY: f32 = 9.81;

/// Parameters for signal processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Capacity of the display buffer (magnitudes kept for UI graphs).
    pub display_buffer_capacity: usize,

    /// Number of most recent magnitudes the baseline is estimated from.
    pub baseline_window: usize,

    /// Minimum buffered magnitudes before the baseline is recomputed.
    /// Below this the baseline stays at `gravity`.
    pub baseline_min_samples: usize,

    /// Resting magnitude assumed before the baseline has converged, and
    /// restored on reset. Typical: 9.81 m/s².
    pub gravity: f32,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            display_buffer_capacity: 100,
            baseline_window: 20,
            baseline_min_samples: 10,
            gravity: STANDARD_GRAVITY,
        }
    }
}

/// Bounded ordered sequence of recent magnitudes.
///
/// Oldest value is evicted when a push would exceed capacity.
/// Invariant: `len() <= capacity()` at all times.
#[derive(Debug, Clone)]
pub struct RollingMagnitudeBuffer {
    values: VecDeque<f32>,
    capacity: usize,
}

impl RollingMagnitudeBuffer {
    /// Creates an empty buffer. A capacity of zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a magnitude, evicting the oldest one when full.
    pub fn push(&mut self, magnitude: f32) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(magnitude);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most recently pushed value.
    pub fn latest(&self) -> Option<f32> {
        self.values.back().copied()
    }

    /// Values from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &f32> + '_ {
        self.values.iter()
    }

    /// Copy of the buffered values, oldest first.
    pub fn to_vec(&self) -> Vec<f32> {
        self.values.iter().copied().collect()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

/// Robust estimate of the resting acceleration magnitude.
///
/// Recomputed from the interquartile range of the last `baseline_window`
/// magnitudes: sort, take indices `[floor(0.25 n), ceil(0.75 n))`, average.
#[derive(Debug, Clone)]
pub struct BaselineEstimator {
    window: RollingMagnitudeBuffer,
    min_samples: usize,
    gravity: f32,
    baseline: f32,
    scratch: Vec<f32>,
}

impl BaselineEstimator {
    pub fn new(config: &SignalConfig) -> Self {
        Self {
            window: RollingMagnitudeBuffer::new(config.baseline_window),
            min_samples: config.baseline_min_samples,
            gravity: config.gravity,
            baseline: config.gravity,
            scratch: Vec::with_capacity(config.baseline_window),
        }
    }

    /// Adds a magnitude and recomputes the baseline once enough are buffered.
    pub fn update(&mut self, magnitude: f32) -> f32 {
        self.window.push(magnitude);
        if self.window.len() >= self.min_samples {
            self.scratch.clear();
            self.scratch.extend(self.window.iter().copied());
            self.baseline = interquartile_mean(&mut self.scratch).unwrap_or(self.gravity);
        }
        self.baseline
    }

    /// Current baseline in m/s².
    pub fn baseline(&self) -> f32 {
        self.baseline
    }

    /// Number of magnitudes in the estimation window.
    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Forget history and fall back to gravity.
    pub fn reset(&mut self) {
        self.window.clear();
        self.baseline = self.gravity;
    }
}

/// Mean of the interquartile slice of `values`. Sorts `values` in place.
///
/// Returns None for an empty slice.
pub fn interquartile_mean(values: &mut [f32]) -> Option<f32> {
    let n = values.len();
    if n == 0 {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));

    let start = n / 4;
    let end = ((3 * n + 3) / 4).min(n);
    let slice = &values[start..end.max(start + 1)];
    let sum: f32 = slice.iter().sum();
    Some(sum / slice.len() as f32)
}

/// Per-sample front end shared by both detectors.
///
/// This is the hot-path component: one magnitude, one push per buffer and
/// one small sort per sample.
pub struct SignalProcessor {
    display_buffer: RollingMagnitudeBuffer,
    baseline: BaselineEstimator,
    config: SignalConfig,
    samples_processed: u64,
    samples_rejected: u64,
}

impl SignalProcessor {
    /// Create a new signal processor with default configuration.
    pub fn new() -> Self {
        Self::with_config(SignalConfig::default())
    }

    /// Create a new signal processor with custom configuration.
    pub fn with_config(config: SignalConfig) -> Self {
        Self {
            display_buffer: RollingMagnitudeBuffer::new(config.display_buffer_capacity),
            baseline: BaselineEstimator::new(&config),
            config,
            samples_processed: 0,
            samples_rejected: 0,
        }
    }

    /// Ingest one sample.
    ///
    /// Appends the magnitude to the rolling buffers, refreshes the baseline
    /// and returns the derived snapshot. Samples with non-finite components
    /// are counted and skipped; they never reach the buffers.
    pub fn ingest(&mut self, sample: &SensorSample) -> Option<SensorSnapshot> {
        if !sample.is_finite() {
            self.samples_rejected += 1;
            return None;
        }

        let magnitude = sample.magnitude();
        self.display_buffer.push(magnitude);
        let baseline = self.baseline.update(magnitude);
        self.samples_processed += 1;

        Some(SensorSnapshot {
            timestamp_ms: sample.timestamp_ms,
            magnitude,
            baseline,
            magnitude_change: (magnitude - baseline).abs(),
            gyro_magnitude: sample.gyro_magnitude(),
        })
    }

    /// Current baseline in m/s².
    pub fn baseline(&self) -> f32 {
        self.baseline.baseline()
    }

    /// Most recent accepted magnitude.
    pub fn latest_magnitude(&self) -> Option<f32> {
        self.display_buffer.latest()
    }

    /// Recent magnitudes for display, oldest first.
    pub fn display_buffer(&self) -> &RollingMagnitudeBuffer {
        &self.display_buffer
    }

    pub fn samples_processed(&self) -> u64 {
        self.samples_processed
    }

    pub fn samples_rejected(&self) -> u64 {
        self.samples_rejected
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    /// Clear buffers and restore the baseline to gravity (monitoring stop).
    pub fn reset(&mut self) {
        self.display_buffer.clear();
        self.baseline.reset();
        self.samples_processed = 0;
        self.samples_rejected = 0;
    }
}

impl Default for SignalProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn still(ts: u64, z: f32) -> SensorSample {
        SensorSample::new(ts, [0.0, 0.0, z], [0.0; 3])
    }

    #[test]
    fn test_buffer_evicts_oldest() {
        let mut buffer = RollingMagnitudeBuffer::new(3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            buffer.push(v);
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.to_vec(), vec![2.0, 3.0, 4.0]);
        assert_eq!(buffer.latest(), Some(4.0));
    }

    #[test]
    fn test_buffer_never_exceeds_capacity() {
        let mut buffer = RollingMagnitudeBuffer::new(100);
        for i in 0..1000 {
            buffer.push(i as f32);
            assert!(buffer.len() <= buffer.capacity());
        }
        assert_eq!(buffer.iter().next().copied(), Some(900.0));
    }

    #[test]
    fn test_interquartile_mean_ignores_outliers() {
        // 20 values: 18 at 9.8 and two huge spikes
        let mut values = vec![9.8; 18];
        values.push(60.0);
        values.push(0.1);
        let mean = interquartile_mean(&mut values).unwrap();
        assert!((mean - 9.8).abs() < 1e-4);
    }

    #[test]
    fn test_interquartile_mean_slice_bounds() {
        // n = 10 -> indices [2, 8): values 3..=8 -> mean 5.5
        let mut values: Vec<f32> = (1..=10).rev().map(|v| v as f32).collect();
        let mean = interquartile_mean(&mut values).unwrap();
        assert!((mean - 5.5).abs() < 1e-6);
        assert_eq!(interquartile_mean(&mut []), None);
    }

    #[test]
    fn test_baseline_stays_at_gravity_until_min_samples() {
        let mut processor = SignalProcessor::new();
        for i in 0..9 {
            processor.ingest(&still(i * 20, 5.0));
        }
        assert_eq!(processor.baseline(), STANDARD_GRAVITY);
        processor.ingest(&still(200, 5.0));
        assert!((processor.baseline() - 5.0).abs() < 1e-5);
    }

    #[test]
    fn test_baseline_converges_to_constant_stream() {
        let mut processor = SignalProcessor::new();
        for i in 0..5 {
            processor.ingest(&still(i * 20, 9.81));
        }
        // Switch to a new resting level; within one baseline window the
        // estimate must equal it exactly.
        for i in 5..25 {
            processor.ingest(&still(i * 20, 7.0));
        }
        assert!((processor.baseline() - 7.0).abs() < 1e-5);
    }

    #[test]
    fn test_nan_samples_are_skipped() {
        let mut processor = SignalProcessor::new();
        let bad = SensorSample::new(0, [f32::NAN, 0.0, 0.0], [0.0; 3]);
        assert!(processor.ingest(&bad).is_none());
        assert_eq!(processor.samples_rejected(), 1);
        assert!(processor.display_buffer().is_empty());
    }

    #[test]
    fn test_snapshot_fields() {
        let mut processor = SignalProcessor::new();
        let sample = SensorSample::new(40, [0.0, 0.0, 12.81], [0.0, 0.0, 1.0]);
        let snapshot = processor.ingest(&sample).unwrap();
        assert_eq!(snapshot.timestamp_ms, 40);
        assert!((snapshot.magnitude_change - 3.0).abs() < 1e-4);
        assert!((snapshot.gyro_magnitude - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_reset_restores_gravity() {
        let mut processor = SignalProcessor::new();
        for i in 0..30 {
            processor.ingest(&still(i * 20, 3.0));
        }
        processor.reset();
        assert_eq!(processor.baseline(), STANDARD_GRAVITY);
        assert!(processor.display_buffer().is_empty());
        assert_eq!(processor.samples_processed(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_baseline_converges_to_constant(
            history in prop::collection::vec(0.5f32..50.0, 0..60),
            level in 0.5f32..50.0,
        ) {
            let mut processor = SignalProcessor::new();
            let mut ts = 0;
            for z in history {
                processor.ingest(&still(ts, z));
                ts += 20;
            }
            // One full baseline window of the new level.
            for _ in 0..SignalConfig::default().baseline_window {
                processor.ingest(&still(ts, level));
                ts += 20;
            }
            prop_assert!((processor.baseline() - level).abs() <= level * 1e-5);
        }
    }
}
