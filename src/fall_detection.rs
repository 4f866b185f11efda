//! Fall detection: free fall followed by an impact.
//!
//! A fall shows up on the accelerometer as a short stretch of near-zero
//! apparent gravity (the device is falling with the body) followed by a
//! large spike when it hits the ground.
//!
//! State machine per free-fall window:
//!
//! ```text
//!   Idle --(magnitude < free_fall_threshold)--> AwaitingImpact
//!   AwaitingImpact --(window elapsed, peak > fall_threshold)--> Idle + Fall
//!   AwaitingImpact --(window elapsed, no spike)--> Idle
//! ```
//!
//! Windows are independent: each free-fall entry arms its own deadline, and
//! several may be open at once. Timing is driven by sample timestamps;
//! `poll` closes windows when no sample arrives before their deadline.

use serde::{Deserialize, Serialize};

use crate::types::DetectionEvent;

/// Configuration for fall detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallConfig {
    /// Whether the fall detector runs at all.
    pub enabled: bool,
    /// Magnitude below which the device is considered in free fall (m/s²).
    pub free_fall_threshold: f32,
    /// Peak magnitude that counts as the landing impact (m/s²).
    pub fall_detection_threshold: f32,
    /// How long a free-fall window waits for the impact (ms).
    pub free_fall_duration_ms: u64,
}

impl Default for FallConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            free_fall_threshold: 2.0,
            fall_detection_threshold: 25.0,
            free_fall_duration_ms: 300,
        }
    }
}

/// Coarse detector state, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallState {
    Idle,
    AwaitingImpact,
}

#[derive(Debug, Clone, Copy)]
struct FreeFallWindow {
    deadline_ms: u64,
    peak_magnitude: f32,
}

/// Free-fall → impact detector.
#[derive(Debug, Clone)]
pub struct FallDetector {
    config: FallConfig,
    windows: Vec<FreeFallWindow>,
    in_free_fall: bool,
    falls_detected: u64,
}

impl FallDetector {
    pub fn new(config: FallConfig) -> Self {
        Self {
            config,
            windows: Vec::with_capacity(4),
            in_free_fall: false,
            falls_detected: 0,
        }
    }

    /// Process the magnitude of one sample.
    ///
    /// The sample first feeds every window still open at its timestamp, then
    /// windows whose deadline has been reached are evaluated, then a new
    /// window is armed if this sample enters free fall.
    pub fn process(&mut self, timestamp_ms: u64, magnitude: f32) -> Option<DetectionEvent> {
        if !self.config.enabled {
            return None;
        }

        for window in self.windows.iter_mut() {
            if timestamp_ms <= window.deadline_ms && magnitude > window.peak_magnitude {
                window.peak_magnitude = magnitude;
            }
        }

        let event = self.close_expired(timestamp_ms);

        let below = magnitude < self.config.free_fall_threshold;
        if below && !self.in_free_fall {
            log::trace!("free fall entered at {timestamp_ms}ms ({magnitude:.2} m/s²)");
            self.windows.push(FreeFallWindow {
                deadline_ms: timestamp_ms.saturating_add(self.config.free_fall_duration_ms),
                peak_magnitude: magnitude,
            });
        }
        self.in_free_fall = below;

        event
    }

    /// Timer expiry without a new sample: close windows due by `now_ms`.
    pub fn poll(&mut self, now_ms: u64) -> Option<DetectionEvent> {
        if !self.config.enabled {
            return None;
        }
        self.close_expired(now_ms)
    }

    /// Earliest deadline among open windows, for arming an external timer.
    pub fn next_deadline_ms(&self) -> Option<u64> {
        self.windows.iter().map(|w| w.deadline_ms).min()
    }

    pub fn state(&self) -> FallState {
        if self.windows.is_empty() {
            FallState::Idle
        } else {
            FallState::AwaitingImpact
        }
    }

    /// Number of windows currently awaiting an impact.
    pub fn open_windows(&self) -> usize {
        self.windows.len()
    }

    pub fn falls_detected(&self) -> u64 {
        self.falls_detected
    }

    pub fn reset(&mut self) {
        self.windows.clear();
        self.in_free_fall = false;
    }

    fn close_expired(&mut self, now_ms: u64) -> Option<DetectionEvent> {
        let threshold = self.config.fall_detection_threshold;
        let mut fired_at = None;

        self.windows.retain(|window| {
            if window.deadline_ms > now_ms {
                return true;
            }
            if fired_at.is_none() && window.peak_magnitude > threshold {
                fired_at = Some(window.deadline_ms);
            }
            false
        });

        let timestamp_ms = fired_at?;
        // Every other open window saw the same landing spike.
        self.windows.clear();
        self.falls_detected += 1;
        log::info!("fall detected at {timestamp_ms}ms");
        Some(DetectionEvent::Fall { timestamp_ms })
    }
}

impl Default for FallDetector {
    fn default() -> Self {
        Self::new(FallConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const GRAVITY: f32 = 9.81;

    fn feed(detector: &mut FallDetector, samples: &[(u64, f32)]) -> Vec<DetectionEvent> {
        samples
            .iter()
            .filter_map(|&(ts, mag)| detector.process(ts, mag))
            .collect()
    }

    #[test]
    fn test_free_fall_then_impact_fires_once() {
        let mut detector = FallDetector::default();
        let events = feed(
            &mut detector,
            &[
                (0, GRAVITY),
                (20, 0.8),
                (40, 0.5),
                (60, 0.6),
                (80, 0.9),
                (100, 32.0),
                (120, 12.0),
                (140, GRAVITY),
                (200, GRAVITY),
                (340, GRAVITY),
                (400, GRAVITY),
            ],
        );
        assert_eq!(events, vec![DetectionEvent::Fall { timestamp_ms: 320 }]);
        assert_eq!(detector.state(), FallState::Idle);
        assert_eq!(detector.falls_detected(), 1);
    }

    #[test]
    fn test_free_fall_without_impact_is_silent() {
        let mut detector = FallDetector::default();
        let events = feed(
            &mut detector,
            &[(0, 1.0), (100, 1.0), (200, 9.0), (300, 12.0), (400, GRAVITY)],
        );
        assert!(events.is_empty());
        assert_eq!(detector.state(), FallState::Idle);
    }

    #[test]
    fn test_short_free_fall_without_spike_never_fires() {
        let mut detector = FallDetector::default();
        let mut events = Vec::new();
        for i in 0..10u64 {
            events.extend(detector.process(i * 20, 1.5));
        }
        for i in 10..40u64 {
            events.extend(detector.process(i * 20, GRAVITY));
        }
        assert!(events.is_empty());
    }

    #[test]
    fn test_spike_after_window_is_ignored() {
        let mut detector = FallDetector::default();
        let events = feed(&mut detector, &[(0, 0.5), (301, 40.0), (320, GRAVITY)]);
        assert!(events.is_empty());
    }

    #[test]
    fn test_spike_on_deadline_counts() {
        let mut detector = FallDetector::default();
        let events = feed(&mut detector, &[(0, 0.5), (300, 40.0)]);
        assert_eq!(events, vec![DetectionEvent::Fall { timestamp_ms: 300 }]);
    }

    #[test]
    fn test_poll_closes_window_without_new_samples() {
        let mut detector = FallDetector::default();
        assert!(detector.process(0, 0.5).is_none());
        assert!(detector.process(50, 30.0).is_none());
        assert_eq!(detector.next_deadline_ms(), Some(300));
        assert!(detector.poll(299).is_none());
        assert_eq!(detector.poll(300), Some(DetectionEvent::Fall { timestamp_ms: 300 }));
        assert!(detector.poll(1000).is_none());
    }

    #[test]
    fn test_overlapping_windows_are_independent() {
        let mut detector = FallDetector::default();
        // Two distinct free-fall entries 100ms apart.
        detector.process(0, 0.5);
        detector.process(50, GRAVITY);
        detector.process(100, 0.5);
        assert_eq!(detector.open_windows(), 2);

        // First window closes with no spike; second still open.
        assert!(detector.process(310, GRAVITY).is_none());
        assert_eq!(detector.open_windows(), 1);

        assert!(detector.process(350, 30.0).is_none());
        assert_eq!(
            detector.process(420, GRAVITY),
            Some(DetectionEvent::Fall { timestamp_ms: 400 })
        );
        assert_eq!(detector.open_windows(), 0);
    }

    #[test]
    fn test_shared_spike_reports_single_fall() {
        let mut detector = FallDetector::default();
        detector.process(0, 0.5);
        detector.process(20, GRAVITY);
        detector.process(40, 0.5);
        detector.process(60, 35.0);
        let events = feed(&mut detector, &[(400, GRAVITY), (500, GRAVITY)]);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_disabled_detector() {
        let mut detector = FallDetector::new(FallConfig {
            enabled: false,
            ..FallConfig::default()
        });
        let events = feed(&mut detector, &[(0, 0.5), (100, 40.0), (400, GRAVITY)]);
        assert!(events.is_empty());
    }

    #[test]
    fn test_window_near_clock_end_saturates() {
        let mut detector = FallDetector::default();
        assert!(detector.process(u64::MAX - 10, 0.5).is_none());
        assert_eq!(detector.next_deadline_ms(), Some(u64::MAX));
        assert!(detector.process(u64::MAX - 5, 30.0).is_none());
        assert_eq!(
            detector.poll(u64::MAX),
            Some(DetectionEvent::Fall { timestamp_ms: u64::MAX })
        );
        assert_eq!(detector.state(), FallState::Idle);
    }

    // ========================================================================
    // Properties over generated magnitude sequences (50Hz)
    // ========================================================================
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_free_fall_without_landing_never_fires(
            falling in prop::collection::vec(0.0f32..2.0, 1..15),
            after in prop::collection::vec(2.0f32..=25.0, 20..60),
        ) {
            let mut detector = FallDetector::default();
            let mut fired = 0;
            for (i, magnitude) in falling.iter().chain(after.iter()).enumerate() {
                fired += detector.process(i as u64 * 20, *magnitude).into_iter().count();
            }
            fired += detector.poll(u64::MAX).into_iter().count();
            prop_assert_eq!(fired, 0);
            prop_assert_eq!(detector.falls_detected(), 0);
        }

        #[test]
        fn prop_landing_inside_window_fires_exactly_once(
            lead in 0u64..20,
            falling in 1u64..10,
            gap in 0u64..5,
            spike in 25.5f32..80.0,
        ) {
            let mut detector = FallDetector::default();
            let mut samples = Vec::new();
            samples.extend((0..lead).map(|_| GRAVITY));
            samples.extend((0..falling).map(|_| 0.5));
            samples.extend((0..gap).map(|_| GRAVITY));
            samples.push(spike);
            samples.extend((0..50).map(|_| GRAVITY));

            let events: Vec<_> = samples
                .iter()
                .enumerate()
                .filter_map(|(i, m)| detector.process(i as u64 * 20, *m))
                .collect();
            let first_free_fall_ms = lead * 20;
            prop_assert_eq!(
                events,
                vec![DetectionEvent::Fall { timestamp_ms: first_free_fall_ms + 300 }]
            );
        }
    }
}
