//! Local alarm actuation.
//!
//! Siren, vibration and torch strobe each run as their own task so one
//! failing actuator never holds up the others. Each cycle ends by itself
//! after the configured alarm duration.
//!
//! Every actuator has one owner. Starting an actuator that is already running
//! aborts the previous cycle and stops the hardware first, so two cycles never
//! overlap on the same device.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::capabilities::{AudioOutput, Torch, VibrationMotor};
use crate::config::ResponseConfig;

/// Alarm behaviour, taken from `ResponseConfig`.
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmSettings {
    pub duration: Duration,
    pub volume: f32,
    pub sound_enabled: bool,
    pub vibration_enabled: bool,
    pub flashlight_enabled: bool,
    pub vibration_pattern_ms: Vec<u64>,
    pub strobe_interval: Duration,
    pub beep_interval: Duration,
}

impl From<&ResponseConfig> for AlarmSettings {
    fn from(config: &ResponseConfig) -> Self {
        Self {
            duration: config.alarm_duration(),
            volume: config.alarm_volume.clamp(0.0, 1.0),
            sound_enabled: config.sound_enabled,
            vibration_enabled: config.vibration_enabled,
            flashlight_enabled: config.flashlight_enabled,
            vibration_pattern_ms: config.vibration_pattern_ms.clone(),
            strobe_interval: Duration::from_millis(config.strobe_interval_ms.max(1)),
            beep_interval: Duration::from_millis(config.beep_interval_ms.max(1)),
        }
    }
}

impl Default for AlarmSettings {
    fn default() -> Self {
        Self::from(&ResponseConfig::default())
    }
}

/// Which actuator cycles were started by `start_all`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlarmStart {
    pub audio: bool,
    pub vibration: bool,
    pub torch: bool,
}

#[derive(Default)]
struct Cycles {
    audio: Option<JoinHandle<()>>,
    vibration: Option<JoinHandle<()>>,
    torch: Option<JoinHandle<()>>,
}

/// Owner of the alarm actuators.
pub struct AlarmController {
    audio: Option<Arc<dyn AudioOutput>>,
    vibration: Option<Arc<dyn VibrationMotor>>,
    torch: Option<Arc<dyn Torch>>,
    settings: AlarmSettings,
    cycles: Mutex<Cycles>,
}

impl AlarmController {
    pub fn new(settings: AlarmSettings) -> Self {
        Self {
            audio: None,
            vibration: None,
            torch: None,
            settings,
            cycles: Mutex::new(Cycles::default()),
        }
    }

    pub fn with_audio(mut self, audio: Arc<dyn AudioOutput>) -> Self {
        self.audio = Some(audio);
        self
    }

    pub fn with_vibration(mut self, vibration: Arc<dyn VibrationMotor>) -> Self {
        self.vibration = Some(vibration);
        self
    }

    pub fn with_torch(mut self, torch: Arc<dyn Torch>) -> Self {
        self.torch = Some(torch);
        self
    }

    pub fn settings(&self) -> &AlarmSettings {
        &self.settings
    }

    fn cycles(&self) -> MutexGuard<'_, Cycles> {
        self.cycles.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start every enabled actuator.
    pub async fn start_all(&self) -> AlarmStart {
        let (audio, vibration, torch) =
            tokio::join!(self.start_audio(), self.start_vibration(), self.start_torch());
        let started = AlarmStart {
            audio,
            vibration,
            torch,
        };
        log::info!("alarms started: {started:?}");
        started
    }

    /// Start the siren cycle. Falls back to a beep loop if the siren fails.
    pub async fn start_audio(&self) -> bool {
        let Some(audio) = self.audio.clone() else {
            return false;
        };
        if !self.settings.sound_enabled {
            return false;
        }
        self.stop_audio().await;

        let volume = self.settings.volume;
        let duration = self.settings.duration;
        let beep_interval = self.settings.beep_interval;
        let handle = tokio::spawn(async move {
            let deadline = Instant::now() + duration;
            match audio.play_siren(volume).await {
                Ok(()) => tokio::time::sleep_until(deadline).await,
                Err(e) => {
                    log::warn!("siren failed ({e}), falling back to beeps");
                    while Instant::now() < deadline {
                        if let Err(e) = audio.play_beep().await {
                            log::warn!("beep failed: {e}");
                            break;
                        }
                        sleep(beep_interval).await;
                    }
                }
            }
            audio.stop().await;
        });
        let previous = self.cycles().audio.replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        true
    }

    /// Start repeating the vibration pattern.
    pub async fn start_vibration(&self) -> bool {
        let Some(motor) = self.vibration.clone() else {
            return false;
        };
        if !self.settings.vibration_enabled || self.settings.vibration_pattern_ms.is_empty() {
            return false;
        }
        self.stop_vibration().await;

        let pattern = self.settings.vibration_pattern_ms.clone();
        let pass = Duration::from_millis(pattern.iter().sum::<u64>().max(1));
        let duration = self.settings.duration;
        let handle = tokio::spawn(async move {
            let deadline = Instant::now() + duration;
            while Instant::now() < deadline {
                if let Err(e) = motor.vibrate(&pattern).await {
                    log::warn!("vibration failed: {e}");
                    break;
                }
                sleep(pass.min(deadline.saturating_duration_since(Instant::now()))).await;
            }
            motor.stop().await;
        });
        let previous = self.cycles().vibration.replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        true
    }

    /// Start strobing the torch.
    pub async fn start_torch(&self) -> bool {
        let Some(torch) = self.torch.clone() else {
            return false;
        };
        if !self.settings.flashlight_enabled {
            return false;
        }
        self.stop_torch().await;

        let interval = self.settings.strobe_interval;
        let duration = self.settings.duration;
        let handle = tokio::spawn(async move {
            let deadline = Instant::now() + duration;
            let mut lit = false;
            while Instant::now() < deadline {
                lit = !lit;
                if let Err(e) = torch.set_torch(lit).await {
                    log::warn!("torch failed: {e}");
                    return;
                }
                sleep(interval).await;
            }
            if lit {
                let _ = torch.set_torch(false).await;
            }
        });
        let previous = self.cycles().torch.replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        true
    }

    pub async fn stop_audio(&self) {
        let handle = self.cycles().audio.take();
        if let Some(handle) = handle {
            handle.abort();
            if let Some(audio) = &self.audio {
                audio.stop().await;
            }
        }
    }

    pub async fn stop_vibration(&self) {
        let handle = self.cycles().vibration.take();
        if let Some(handle) = handle {
            handle.abort();
            if let Some(motor) = &self.vibration {
                motor.stop().await;
            }
        }
    }

    pub async fn stop_torch(&self) {
        let handle = self.cycles().torch.take();
        if let Some(handle) = handle {
            handle.abort();
            if let Some(torch) = &self.torch {
                if let Err(e) = torch.set_torch(false).await {
                    log::debug!("torch off failed: {e}");
                }
            }
        }
    }

    /// Stop everything. Safe to call when nothing is running.
    pub async fn stop_all(&self) {
        tokio::join!(self.stop_audio(), self.stop_vibration(), self.stop_torch());
        log::debug!("alarms stopped");
    }

    /// True while any actuator cycle is still running.
    pub fn is_running(&self) -> bool {
        let cycles = self.cycles();
        let running = [&cycles.audio, &cycles.vibration, &cycles.torch]
            .into_iter()
            .flatten()
            .any(|handle| !handle.is_finished());
        running
    }
}
