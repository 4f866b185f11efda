//! Simulated capabilities.
//!
//! Deterministic stand-ins for the platform: a replayed sensor trace, a
//! scripted location provider, a recording SMS gateway and recording alarm
//! actuators with switchable failures. The `sentinel` binary runs on these,
//! and so do the tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::capabilities::{
    AudioOutput, CapabilityError, CapabilityResult, LocationProvider, SampleReceiver, SensorStream,
    SmsGateway, Torch, VibrationMotor,
};
use crate::signal::STANDARD_GRAVITY;
use crate::types::{LocationFix, SensorSample};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// SYNTHETIC TRACES
// ============================================================================

/// Device lying still: gravity on z, small alternating noise.
pub fn resting_trace(start_ms: u64, period_ms: u64, count: usize) -> Vec<SensorSample> {
    (0..count)
        .map(|i| {
            let noise = if i % 2 == 0 { 0.05 } else { -0.05 };
            SensorSample::new(
                start_ms + i as u64 * period_ms,
                [0.02, -0.01, STANDARD_GRAVITY + noise],
                [0.01, 0.0, -0.01],
            )
        })
        .collect()
}

/// One second at rest, 200 ms of free fall, a three-sample tumbling impact
/// spike, then two seconds at rest.
pub fn fall_trace(start_ms: u64, period_ms: u64) -> Vec<SensorSample> {
    let mut samples = resting_trace(start_ms, period_ms, (1000 / period_ms) as usize);
    let mut t = start_ms + samples.len() as u64 * period_ms;

    for _ in 0..(200 / period_ms) {
        samples.push(SensorSample::new(t, [0.1, 0.2, 0.4], [1.5, 0.8, 0.3]));
        t += period_ms;
    }
    for _ in 0..3 {
        samples.push(SensorSample::new(t, [12.0, -20.0, 31.0], [3.0, 2.5, 1.0]));
        t += period_ms;
    }
    samples.extend(resting_trace(t, period_ms, (2000 / period_ms) as usize));
    samples
}

// ============================================================================
// SENSOR STREAM
// ============================================================================

/// Replays a fixed sample list through a subscription channel.
pub struct ReplaySensorStream {
    samples: Vec<SensorSample>,
    pace: Option<Duration>,
    subscribe_error: Option<CapabilityError>,
    terminal_error: Option<CapabilityError>,
    hold_open: bool,
    subscriptions: AtomicUsize,
}

impl ReplaySensorStream {
    pub fn new(samples: Vec<SensorSample>) -> Self {
        Self {
            samples,
            pace: None,
            subscribe_error: None,
            terminal_error: None,
            hold_open: false,
            subscriptions: AtomicUsize::new(0),
        }
    }

    /// Sleep `pace` before each sample instead of sending them in a burst.
    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    /// Refuse to subscribe.
    pub fn failing(error: CapabilityError) -> Self {
        let mut stream = Self::new(Vec::new());
        stream.subscribe_error = Some(error);
        stream
    }

    /// Push `error` after the last sample.
    pub fn with_terminal_error(mut self, error: CapabilityError) -> Self {
        self.terminal_error = Some(error);
        self
    }

    /// Keep the channel open after the trace until the receiver goes away.
    pub fn held_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SensorStream for ReplaySensorStream {
    async fn subscribe(&self, _sample_period: Duration) -> CapabilityResult<SampleReceiver> {
        if let Some(err) = &self.subscribe_error {
            return Err(err.clone());
        }
        self.subscriptions.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(256);
        let samples = self.samples.clone();
        let pace = self.pace;
        let terminal = self.terminal_error.clone();
        let hold_open = self.hold_open;
        tokio::spawn(async move {
            for sample in samples {
                if let Some(pace) = pace {
                    tokio::time::sleep(pace).await;
                }
                if tx.send(Ok(sample)).await.is_err() {
                    return;
                }
            }
            if let Some(err) = terminal {
                let _ = tx.send(Err(err)).await;
                return;
            }
            if hold_open {
                tx.closed().await;
            }
        });
        Ok(rx)
    }
}

// ============================================================================
// LOCATION
// ============================================================================

/// Location provider with canned answers.
pub struct ScriptedLocationProvider {
    current: CapabilityResult<LocationFix>,
    last_known: CapabilityResult<Option<LocationFix>>,
    address: Option<String>,
    delay: Duration,
    fix_requests: AtomicUsize,
}

impl ScriptedLocationProvider {
    /// Fresh fix available immediately, nothing cached.
    pub fn fixed(latitude: f64, longitude: f64) -> Self {
        Self {
            current: Ok(LocationFix::new(latitude, longitude)),
            last_known: Ok(None),
            address: None,
            delay: Duration::ZERO,
            fix_requests: AtomicUsize::new(0),
        }
    }

    /// No fix of any kind.
    pub fn unavailable() -> Self {
        Self {
            current: Err(CapabilityError::Unavailable("no GPS signal".into())),
            ..Self::fixed(0.0, 0.0)
        }
    }

    /// Location permission denied.
    pub fn denied() -> Self {
        let denied = CapabilityError::PermissionDenied("location".into());
        Self {
            current: Err(denied.clone()),
            last_known: Err(denied),
            ..Self::fixed(0.0, 0.0)
        }
    }

    pub fn with_last_known(mut self, fix: LocationFix) -> Self {
        self.last_known = Ok(Some(fix));
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Delay before the fresh fix answers.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fix_requests(&self) -> usize {
        self.fix_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocationProvider for ScriptedLocationProvider {
    async fn current_fix(&self, _timeout: Duration) -> CapabilityResult<LocationFix> {
        self.fix_requests.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.current.clone()
    }

    async fn last_known_fix(&self) -> CapabilityResult<Option<LocationFix>> {
        self.last_known.clone()
    }

    async fn reverse_geocode(
        &self,
        _latitude: f64,
        _longitude: f64,
    ) -> CapabilityResult<Option<String>> {
        Ok(self.address.clone())
    }
}

// ============================================================================
// SMS
// ============================================================================

/// One recorded `send_batch` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsBatch {
    pub message: String,
    pub recipients: Vec<String>,
}

/// SMS gateway that records every batch instead of sending.
#[derive(Default)]
pub struct RecordingSmsGateway {
    batches: Mutex<Vec<SmsBatch>>,
    failing_numbers: Mutex<HashSet<String>>,
    fail_all: AtomicBool,
    delay: Mutex<Duration>,
}

impl RecordingSmsGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recipient fails.
    pub fn failing() -> Self {
        let gateway = Self::default();
        gateway.fail_all.store(true, Ordering::SeqCst);
        gateway
    }

    /// Sends to `number` fail from now on.
    pub fn fail_number(&self, number: impl Into<String>) {
        lock(&self.failing_numbers).insert(number.into());
    }

    /// Delay each batch by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    /// Number of `send_batch` calls so far.
    pub fn batch_count(&self) -> usize {
        lock(&self.batches).len()
    }

    pub fn batches(&self) -> Vec<SmsBatch> {
        lock(&self.batches).clone()
    }

    pub fn last_batch(&self) -> Option<SmsBatch> {
        lock(&self.batches).last().cloned()
    }
}

#[async_trait]
impl SmsGateway for RecordingSmsGateway {
    async fn send_batch(&self, message: &str, recipients: &[String]) -> Vec<CapabilityResult<()>> {
        lock(&self.batches).push(SmsBatch {
            message: message.to_string(),
            recipients: recipients.to_vec(),
        });
        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let fail_all = self.fail_all.load(Ordering::SeqCst);
        let failing = lock(&self.failing_numbers).clone();
        recipients
            .iter()
            .map(|number| {
                if fail_all || failing.contains(number) {
                    Err(CapabilityError::Failed(format!("carrier rejected {number}")))
                } else {
                    Ok(())
                }
            })
            .collect()
    }
}

// ============================================================================
// ALARM ACTUATORS
// ============================================================================

/// Speaker, vibration motor and torch that count calls.
#[derive(Default)]
pub struct RecordingActuators {
    siren_fails: AtomicBool,
    beep_fails: AtomicBool,
    vibration_fails: AtomicBool,
    torch_fails: AtomicBool,

    sirens: AtomicUsize,
    beeps: AtomicUsize,
    audio_stops: AtomicUsize,
    vibrations: AtomicUsize,
    vibration_stops: AtomicUsize,
    torch_switches: AtomicUsize,
    torch_lit: AtomicBool,
    audio_stop_delay: Mutex<Duration>,
}

impl RecordingActuators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Siren asset fails to load, forcing the beep fallback.
    pub fn with_failing_siren(self) -> Self {
        self.siren_fails.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_failing_vibration(self) -> Self {
        self.vibration_fails.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_failing_torch(self) -> Self {
        self.torch_fails.store(true, Ordering::SeqCst);
        self
    }

    /// Each audio stop takes `delay` to release the speaker.
    pub fn with_slow_audio_stop(self, delay: Duration) -> Self {
        *lock(&self.audio_stop_delay) = delay;
        self
    }

    /// Nothing works.
    pub fn broken() -> Self {
        let actuators = Self::new()
            .with_failing_siren()
            .with_failing_vibration()
            .with_failing_torch();
        actuators.beep_fails.store(true, Ordering::SeqCst);
        actuators
    }

    pub fn sirens(&self) -> usize {
        self.sirens.load(Ordering::SeqCst)
    }

    pub fn beeps(&self) -> usize {
        self.beeps.load(Ordering::SeqCst)
    }

    pub fn audio_stops(&self) -> usize {
        self.audio_stops.load(Ordering::SeqCst)
    }

    pub fn vibrations(&self) -> usize {
        self.vibrations.load(Ordering::SeqCst)
    }

    pub fn vibration_stops(&self) -> usize {
        self.vibration_stops.load(Ordering::SeqCst)
    }

    pub fn torch_switches(&self) -> usize {
        self.torch_switches.load(Ordering::SeqCst)
    }

    pub fn torch_lit(&self) -> bool {
        self.torch_lit.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioOutput for RecordingActuators {
    async fn play_siren(&self, _volume: f32) -> CapabilityResult<()> {
        if self.siren_fails.load(Ordering::SeqCst) {
            return Err(CapabilityError::Failed("siren asset missing".into()));
        }
        self.sirens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn play_beep(&self) -> CapabilityResult<()> {
        if self.beep_fails.load(Ordering::SeqCst) {
            return Err(CapabilityError::Unavailable("tone generator".into()));
        }
        self.beeps.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        let delay = *lock(&self.audio_stop_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.audio_stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl VibrationMotor for RecordingActuators {
    async fn vibrate(&self, _pattern_ms: &[u64]) -> CapabilityResult<()> {
        if self.vibration_fails.load(Ordering::SeqCst) {
            return Err(CapabilityError::Unavailable("no vibrator".into()));
        }
        self.vibrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.vibration_stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Torch for RecordingActuators {
    async fn set_torch(&self, on: bool) -> CapabilityResult<()> {
        if self.torch_fails.load(Ordering::SeqCst) {
            return Err(CapabilityError::PermissionDenied("camera".into()));
        }
        self.torch_switches.fetch_add(1, Ordering::SeqCst);
        self.torch_lit.store(on, Ordering::SeqCst);
        Ok(())
    }
}
