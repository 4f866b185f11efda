//! Impact detection: sustained deviation from the resting baseline.
//!
//! A single sample over threshold is usually noise (a knock on the table, a
//! bad reading). An impact is confirmed only after `confirmation_count`
//! consecutive-ish high readings while the device is actually rotating:
//! each qualifying sample increments a counter, each other sample decrements
//! it towards zero. Confirmed impacts are then rate limited by a cooldown;
//! anything confirmed inside the cooldown is dropped, not deferred.

use serde::{Deserialize, Serialize};

use crate::types::{DetectionEvent, SensorSnapshot};

/// Configuration for impact detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImpactConfig {
    /// Whether the impact detector runs at all.
    pub enabled: bool,
    /// |magnitude - baseline| above which a sample counts as high (m/s²).
    pub impact_detection_threshold: f32,
    /// Minimum gyroscope magnitude for the device to count as moving (rad/s).
    /// Rejects static artifacts such as magnets or a phone being set down.
    pub gyroscope_sensitivity: f32,
    /// High readings needed to confirm an impact.
    pub confirmation_count: u32,
    /// Minimum spacing between two reported impacts (ms).
    pub cooldown_ms: u64,
}

impl Default for ImpactConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            impact_detection_threshold: 15.0,
            gyroscope_sensitivity: 0.5,
            confirmation_count: 3,
            cooldown_ms: 2000,
        }
    }
}

/// Debounced impact detector.
#[derive(Debug, Clone)]
pub struct ImpactDetector {
    config: ImpactConfig,
    consecutive_high: u32,
    last_impact_ms: Option<u64>,
    impacts_detected: u64,
    impacts_suppressed: u64,
}

impl ImpactDetector {
    pub fn new(config: ImpactConfig) -> Self {
        Self {
            config,
            consecutive_high: 0,
            last_impact_ms: None,
            impacts_detected: 0,
            impacts_suppressed: 0,
        }
    }

    /// Process the snapshot of one sample.
    pub fn process(&mut self, snapshot: &SensorSnapshot) -> Option<DetectionEvent> {
        if !self.config.enabled {
            return None;
        }

        let moving = snapshot.gyro_magnitude > self.config.gyroscope_sensitivity;
        if moving && snapshot.magnitude_change > self.config.impact_detection_threshold {
            self.consecutive_high += 1;
        } else {
            self.consecutive_high = self.consecutive_high.saturating_sub(1);
        }

        if self.consecutive_high < self.config.confirmation_count {
            return None;
        }
        self.consecutive_high = 0;

        let now = snapshot.timestamp_ms;
        if self.in_cooldown(now) {
            self.impacts_suppressed += 1;
            log::debug!("impact at {now}ms suppressed by cooldown");
            return None;
        }

        self.last_impact_ms = Some(now);
        self.impacts_detected += 1;
        log::info!(
            "impact detected at {now}ms (change {:.2} m/s²)",
            snapshot.magnitude_change
        );
        Some(DetectionEvent::Impact { timestamp_ms: now })
    }

    /// True while `now_ms` is within the cooldown of the last confirmed impact.
    pub fn in_cooldown(&self, now_ms: u64) -> bool {
        self.last_impact_ms
            .is_some_and(|last| now_ms.saturating_sub(last) < self.config.cooldown_ms)
    }

    /// Current value of the confirmation counter.
    pub fn consecutive_high(&self) -> u32 {
        self.consecutive_high
    }

    pub fn impacts_detected(&self) -> u64 {
        self.impacts_detected
    }

    pub fn impacts_suppressed(&self) -> u64 {
        self.impacts_suppressed
    }

    pub fn reset(&mut self) {
        self.consecutive_high = 0;
        self.last_impact_ms = None;
    }
}

impl Default for ImpactDetector {
    fn default() -> Self {
        Self::new(ImpactConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn snapshot(timestamp_ms: u64, change: f32, gyro: f32) -> SensorSnapshot {
        SensorSnapshot {
            timestamp_ms,
            magnitude: 9.81 + change,
            baseline: 9.81,
            magnitude_change: change,
            gyro_magnitude: gyro,
        }
    }

    fn high(ts: u64) -> SensorSnapshot {
        snapshot(ts, 20.0, 2.0)
    }

    #[test]
    fn test_below_confirmation_count_is_silent() {
        let mut detector = ImpactDetector::default();
        assert!(detector.process(&high(0)).is_none());
        assert!(detector.process(&high(20)).is_none());
        assert!(detector.process(&snapshot(40, 0.1, 0.0)).is_none());
        assert_eq!(detector.consecutive_high(), 1);
    }

    #[test]
    fn test_fires_exactly_at_confirmation_count() {
        let mut detector = ImpactDetector::default();
        assert!(detector.process(&high(0)).is_none());
        assert!(detector.process(&high(20)).is_none());
        assert_eq!(
            detector.process(&high(40)),
            Some(DetectionEvent::Impact { timestamp_ms: 40 })
        );
        assert_eq!(detector.consecutive_high(), 0);
        assert_eq!(detector.impacts_detected(), 1);
    }

    #[test]
    fn test_requires_device_motion() {
        let mut detector = ImpactDetector::default();
        for i in 0..10 {
            assert!(detector.process(&snapshot(i * 20, 30.0, 0.1)).is_none());
        }
        assert_eq!(detector.consecutive_high(), 0);
    }

    #[test]
    fn test_counter_decays_but_not_below_zero() {
        let mut detector = ImpactDetector::default();
        detector.process(&high(0));
        detector.process(&high(20));
        detector.process(&snapshot(40, 0.0, 0.0));
        detector.process(&snapshot(60, 0.0, 0.0));
        detector.process(&snapshot(80, 0.0, 0.0));
        assert_eq!(detector.consecutive_high(), 0);
        // Interleaved high/low readings never confirm.
        for i in 0..20 {
            let s = if i % 2 == 0 { high(100 + i * 20) } else { snapshot(100 + i * 20, 0.0, 0.0) };
            assert!(detector.process(&s).is_none());
        }
    }

    #[test]
    fn test_cooldown_suppresses_repeat_impacts() {
        let mut detector = ImpactDetector::default();
        let mut events = Vec::new();
        // Continuous threshold-exceeding input for 5 seconds at 50Hz.
        for i in 0..250u64 {
            events.extend(detector.process(&high(i * 20)));
        }
        assert!(events.len() >= 2);
        for pair in events.windows(2) {
            let gap = pair[1].timestamp_ms() - pair[0].timestamp_ms();
            assert!(gap >= 2000, "impacts {gap}ms apart");
        }
        assert!(detector.impacts_suppressed() > 0);
    }

    #[test]
    fn test_impact_after_cooldown() {
        let mut detector = ImpactDetector::default();
        for ts in [0, 20, 40] {
            detector.process(&high(ts));
        }
        for ts in [1000, 1020, 1040] {
            assert!(detector.process(&high(ts)).is_none());
        }
        let mut fired = None;
        for ts in [2100, 2120, 2140] {
            fired = fired.or(detector.process(&high(ts)));
        }
        assert_eq!(fired, Some(DetectionEvent::Impact { timestamp_ms: 2140 }));
    }

    // ========================================================================
    // Properties over generated high/low runs
    // ========================================================================
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_confirmation_count_is_exact(
            count in 1u32..8,
            change in 15.5f32..100.0,
            gyro in 0.6f32..10.0,
        ) {
            let config = ImpactConfig {
                confirmation_count: count,
                ..ImpactConfig::default()
            };

            // One short of the count, then quiet: nothing.
            let mut detector = ImpactDetector::new(config.clone());
            let mut fired = 0;
            for i in 0..u64::from(count - 1) {
                fired += detector.process(&snapshot(i * 20, change, gyro)).into_iter().count();
            }
            for i in 0..20u64 {
                fired += detector
                    .process(&snapshot(1000 + i * 20, 0.0, 0.0))
                    .into_iter()
                    .count();
            }
            prop_assert_eq!(fired, 0);

            // Exactly the count: one impact, on the last high sample.
            let mut detector = ImpactDetector::new(config);
            let events: Vec<_> = (0..u64::from(count))
                .filter_map(|i| detector.process(&snapshot(i * 20, change, gyro)))
                .collect();
            let last_ms = (u64::from(count) - 1) * 20;
            prop_assert_eq!(events, vec![DetectionEvent::Impact { timestamp_ms: last_ms }]);
        }

        #[test]
        fn prop_impacts_respect_cooldown(
            pattern in prop::collection::vec((any::<bool>(), 1u64..200), 1..600),
            cooldown_ms in 100u64..5000,
        ) {
            let mut detector = ImpactDetector::new(ImpactConfig {
                cooldown_ms,
                ..ImpactConfig::default()
            });
            let mut now = 0u64;
            let mut impacts = Vec::new();
            for (is_high, step) in pattern {
                now += step;
                let s = if is_high { high(now) } else { snapshot(now, 0.0, 0.0) };
                impacts.extend(detector.process(&s).map(|e| e.timestamp_ms()));
            }
            for pair in impacts.windows(2) {
                prop_assert!(pair[1] - pair[0] >= cooldown_ms);
            }
        }
    }
}
