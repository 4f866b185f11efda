//! Complete detection pipeline integrating signal processing and both detectors.
//!
//! This module orchestrates the per-sample data flow from a raw motion sample
//! through the signal processor to the fall and impact detectors.
//!
//! # Architecture
//!
//! 1. **Signal Processing**: magnitude, rolling buffers, robust baseline
//! 2. **Fall Detection**: free-fall windows closed by an impact spike
//! 3. **Impact Detection**: gyro-gated baseline deviation with confirmation
//!
//! The pipeline is synchronous and allocation-light; the async monitor in
//! `monitor` drives it from a sample channel and a deadline timer.

use serde::{Deserialize, Serialize};

use crate::fall_detection::{FallConfig, FallDetector, FallState};
use crate::impact_detection::{ImpactConfig, ImpactDetector};
use crate::signal::{SignalConfig, SignalProcessor};
use crate::types::{DetectionEvent, SensorSample, SensorSnapshot};

/// Configuration for the complete detection pipeline.
///
/// Bundles all sub-component configurations into a single package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Requested sensor sampling period (ms). Typical: 20 (50Hz).
    pub sample_period_ms: u64,

    /// Signal processing configuration (buffers, baseline).
    pub signal: SignalConfig,

    /// Fall detector thresholds.
    pub fall: FallConfig,

    /// Impact detector thresholds.
    pub impact: ImpactConfig,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            sample_period_ms: 20,
            signal: SignalConfig::default(),
            fall: FallConfig::default(),
            impact: ImpactConfig::default(),
        }
    }
}

/// Result of processing one sample.
#[derive(Debug, Clone, Default)]
pub struct PipelineOutput {
    /// Derived snapshot, absent when the sample was rejected.
    pub snapshot: Option<SensorSnapshot>,
    /// Detections confirmed by this sample (usually empty).
    pub events: Vec<DetectionEvent>,
}

/// Signal processor plus fall and impact detectors.
pub struct DetectionPipeline {
    config: DetectionConfig,
    signal_processor: SignalProcessor,
    fall_detector: FallDetector,
    impact_detector: ImpactDetector,
    total_events: u64,
}

impl DetectionPipeline {
    /// Creates a new pipeline with given configuration.
    pub fn new(config: DetectionConfig) -> Self {
        Self {
            signal_processor: SignalProcessor::with_config(config.signal.clone()),
            fall_detector: FallDetector::new(config.fall.clone()),
            impact_detector: ImpactDetector::new(config.impact.clone()),
            config,
            total_events: 0,
        }
    }

    /// Processes a single sample through every stage.
    pub fn process_sample(&mut self, sample: &SensorSample) -> PipelineOutput {
        let Some(snapshot) = self.signal_processor.ingest(sample) else {
            log::trace!("skipping non-finite sample at {}ms", sample.timestamp_ms);
            return PipelineOutput::default();
        };

        let mut events = Vec::new();
        if let Some(event) = self
            .fall_detector
            .process(snapshot.timestamp_ms, snapshot.magnitude)
        {
            events.push(event);
        }
        if let Some(event) = self.impact_detector.process(&snapshot) {
            events.push(event);
        }
        self.total_events += events.len() as u64;

        PipelineOutput {
            snapshot: Some(snapshot),
            events,
        }
    }

    /// Closes free-fall windows that expired at `now_ms` without a sample.
    pub fn poll(&mut self, now_ms: u64) -> Option<DetectionEvent> {
        let event = self.fall_detector.poll(now_ms);
        if event.is_some() {
            self.total_events += 1;
        }
        event
    }

    /// Earliest pending free-fall deadline.
    pub fn next_deadline_ms(&self) -> Option<u64> {
        self.fall_detector.next_deadline_ms()
    }

    /// Current baseline in m/s².
    pub fn baseline(&self) -> f32 {
        self.signal_processor.baseline()
    }

    /// Recent magnitudes for display, oldest first.
    pub fn display_magnitudes(&self) -> Vec<f32> {
        self.signal_processor.display_buffer().to_vec()
    }

    pub fn fall_state(&self) -> FallState {
        self.fall_detector.state()
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Returns the total sample count accepted so far.
    pub fn total_samples(&self) -> u64 {
        self.signal_processor.samples_processed()
    }

    /// Samples dropped for non-finite components.
    pub fn rejected_samples(&self) -> u64 {
        self.signal_processor.samples_rejected()
    }

    /// Returns the total number of detections emitted.
    pub fn total_events(&self) -> u64 {
        self.total_events
    }

    /// Resets every stage; the baseline returns to gravity.
    pub fn reset(&mut self) {
        self.signal_processor.reset();
        self.fall_detector.reset();
        self.impact_detector.reset();
        self.total_events = 0;
    }
}

impl Default for DetectionPipeline {
    fn default() -> Self {
        Self::new(DetectionConfig::default())
    }
}
