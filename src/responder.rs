//! Emergency response workflow.
//!
//! One `EmergencyResponder` runs per execution context (foreground app,
//! background service). Responders never talk to each other; they agree on
//! who owns the emergency through the shared `EmergencyCoordinator`.
//!
//! Lifecycle of one alert:
//!
//! ```text
//! gates -> contacts -> location -> coordinator.claim -> persist -> alarms
//!       -> countdown --(elapsed)--> claim -> SMS -> Sent | Failed
//!                    \-(cancel)---> stop countdown -> stop alarms -> Cancelled
//! ```
//!
//! The countdown and `cancel` race for a single `live` flag with
//! compare-and-swap. Whoever flips it owns the outcome, so an SMS can never
//! go out after a cancellation was accepted, and a cancellation arriving after
//! the send was claimed reports `false`.
//!
//! Failures inside the workflow never reach the detection side. They mark the
//! alert Failed and release the coordinator.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::alarms::AlarmController;
use crate::config::ResponseConfig;
use crate::contacts::ContactBook;
use crate::coordinator::EmergencyCoordinator;
use crate::dispatch::{render_message, SmsDispatcher};
use crate::error::SentinelResult;
use crate::history::AlertHistory;
use crate::location::LocationResolver;
use crate::monitor::Detection;
use crate::types::{
    Alert, AlertStatus, AlertType, EmergencyContact, ResolutionActor, SensorSnapshot,
    TriggerSource,
};

/// Stage reached by a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponsePhase {
    Triggered,
    AlarmsStarted,
    Cancelled,
    Sent,
    Failed,
}

impl ResponsePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResponsePhase::Cancelled | ResponsePhase::Sent | ResponsePhase::Failed
        )
    }
}

/// Progress notification for UI and notification layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseEvent {
    pub alert_id: String,
    pub phase: ResponsePhase,
}

/// Why a detection did not start a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateRejection {
    AppDisabled,
    EmergencyActive,
    RecentlyCancelled,
    CoordinatorCooldown,
    BackgroundCooldown,
}

impl fmt::Display for GateRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            GateRejection::AppDisabled => "app disabled",
            GateRejection::EmergencyActive => "emergency already active",
            GateRejection::RecentlyCancelled => "emergency just cancelled",
            GateRejection::CoordinatorCooldown => "cooldown after cancellation",
            GateRejection::BackgroundCooldown => "background detection cooldown",
        };
        f.write_str(reason)
    }
}

/// Collaborators a responder is built from.
pub struct ResponderParts {
    pub config: ResponseConfig,
    pub coordinator: Arc<EmergencyCoordinator>,
    pub contacts: ContactBook,
    pub history: AlertHistory,
    pub location: LocationResolver,
    pub alarms: Arc<AlarmController>,
    pub dispatcher: SmsDispatcher,
}

struct ActiveResponse {
    alert_id: String,
    /// Raised until either the countdown claims the send or a cancel lands.
    live: Arc<AtomicBool>,
    stop_countdown: Option<oneshot::Sender<()>>,
    deadline: Instant,
}

struct Shared {
    config: ResponseConfig,
    coordinator: Arc<EmergencyCoordinator>,
    contacts: ContactBook,
    history: AlertHistory,
    location: LocationResolver,
    alarms: Arc<AlarmController>,
    dispatcher: SmsDispatcher,
    active: Mutex<Option<ActiveResponse>>,
    last_background: Mutex<Option<Instant>>,
    events: broadcast::Sender<ResponseEvent>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Orchestrates the response to a detection or a manual trigger.
#[derive(Clone)]
pub struct EmergencyResponder {
    shared: Arc<Shared>,
}

impl EmergencyResponder {
    pub fn new(parts: ResponderParts) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                config: parts.config,
                coordinator: parts.coordinator,
                contacts: parts.contacts,
                history: parts.history,
                location: parts.location,
                alarms: parts.alarms,
                dispatcher: parts.dispatcher,
                active: Mutex::new(None),
                last_background: Mutex::new(None),
                events,
            }),
        }
    }

    pub fn config(&self) -> &ResponseConfig {
        &self.shared.config
    }

    pub fn coordinator(&self) -> &Arc<EmergencyCoordinator> {
        &self.shared.coordinator
    }

    pub fn history(&self) -> &AlertHistory {
        &self.shared.history
    }

    pub fn contacts(&self) -> &ContactBook {
        &self.shared.contacts
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResponseEvent> {
        self.shared.events.subscribe()
    }

    fn emit(&self, alert_id: &str, phase: ResponsePhase) {
        let _ = self.shared.events.send(ResponseEvent {
            alert_id: alert_id.to_string(),
            phase,
        });
    }

    /// Id of the alert this responder is counting down on, if any.
    pub fn active_alert_id(&self) -> Option<String> {
        lock(&self.shared.active).as_ref().map(|a| a.alert_id.clone())
    }

    pub fn is_responding(&self) -> bool {
        lock(&self.shared.active).is_some()
    }

    /// Time left before the SMS go out.
    pub fn countdown_remaining(&self) -> Option<Duration> {
        lock(&self.shared.active)
            .as_ref()
            .map(|a| a.deadline.saturating_duration_since(Instant::now()))
    }

    /// Check whether a response from `source` may start now.
    pub fn check_gates(&self, source: TriggerSource) -> Result<(), GateRejection> {
        let coordinator = &self.shared.coordinator;
        if !self.shared.config.app_enabled {
            return Err(GateRejection::AppDisabled);
        }
        if coordinator.is_active() {
            return Err(GateRejection::EmergencyActive);
        }
        if coordinator.is_cancelled() {
            return Err(GateRejection::RecentlyCancelled);
        }
        if !coordinator.can_start_new_emergency() {
            return Err(GateRejection::CoordinatorCooldown);
        }
        if source == TriggerSource::Background {
            let cooldown = self.shared.config.background_cooldown();
            if lock(&self.shared.last_background).is_some_and(|at| at.elapsed() < cooldown) {
                return Err(GateRejection::BackgroundCooldown);
            }
        }
        Ok(())
    }

    /// Respond to a confirmed detection.
    pub async fn handle_detection(
        &self,
        detection: Detection,
        source: TriggerSource,
    ) -> Option<String> {
        log::info!(
            "{} at {}ms ({source:?})",
            detection.event.alert_type(),
            detection.event.timestamp_ms()
        );
        self.respond(detection.event.alert_type(), source, detection.snapshot)
            .await
    }

    /// User-initiated alert. Skips the background cooldown only.
    pub async fn trigger_manual(&self, alert_type: AlertType) -> Option<String> {
        self.respond(alert_type, TriggerSource::Manual, None).await
    }

    /// Run the workflow up to the armed countdown.
    ///
    /// Returns the alert id when a response started. Gate rejections, an
    /// empty contact list and coordinator conflicts return None; they are
    /// logged, never raised.
    pub async fn respond(
        &self,
        alert_type: AlertType,
        source: TriggerSource,
        snapshot: Option<SensorSnapshot>,
    ) -> Option<String> {
        if let Err(reason) = self.check_gates(source) {
            log::info!("{alert_type} from {source:?} ignored: {reason}");
            return None;
        }

        let contacts = self.shared.contacts.enabled();
        if contacts.is_empty() {
            log::warn!("{alert_type} ignored: no enabled emergency contacts");
            return None;
        }

        let location = self.shared.location.resolve().await;
        let alert = Alert::new(alert_type, source)
            .with_snapshot(snapshot)
            .with_location(location);

        // Subscribed before the claim: no later release of this alert is missed.
        let changes = self.shared.coordinator.subscribe();
        if let Err(e) = self.shared.coordinator.claim_emergency(&alert.id) {
            log::info!("{} not started: {e}", alert.id);
            return None;
        }
        if source == TriggerSource::Background {
            *lock(&self.shared.last_background) = Some(Instant::now());
        }

        if let Err(e) = self.shared.history.append(&alert) {
            log::error!("could not persist {}: {e}", alert.id);
            self.shared.coordinator.complete_emergency(&alert.id);
            self.emit(&alert.id, ResponsePhase::Failed);
            return None;
        }

        let countdown = self.shared.config.countdown();
        let live = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = oneshot::channel();
        {
            let mut active = lock(&self.shared.active);
            if let Some(previous) = active.as_ref() {
                log::warn!("replacing stale response {}", previous.alert_id);
            }
            *active = Some(ActiveResponse {
                alert_id: alert.id.clone(),
                live: live.clone(),
                stop_countdown: Some(stop_tx),
                deadline: Instant::now() + countdown,
            });
        }
        log::info!(
            "{} triggered ({alert_type}, {source:?}), {}s to cancel",
            alert.id,
            countdown.as_secs()
        );
        self.emit(&alert.id, ResponsePhase::Triggered);

        self.shared.alarms.start_all().await;
        if live.load(Ordering::SeqCst) {
            self.emit(&alert.id, ResponsePhase::AlarmsStarted);
        } else {
            // Cancelled while the actuators were starting.
            self.shared.alarms.stop_all().await;
        }

        let alert_id = alert.id.clone();
        let fallback = alert.clone();
        let workflow = {
            let responder = self.clone();
            tokio::spawn(async move {
                responder
                    .run_countdown(alert, contacts, stop_rx, changes, live)
                    .await
            })
        };
        let supervisor = self.clone();
        tokio::spawn(async move {
            let reason = match workflow.await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.to_string(),
                Err(e) => format!("workflow aborted: {e}"),
            };
            supervisor.fail(fallback, &reason).await;
        });

        Some(alert_id)
    }

    async fn run_countdown(
        &self,
        mut alert: Alert,
        contacts: Vec<EmergencyContact>,
        mut stop: oneshot::Receiver<()>,
        mut changes: broadcast::Receiver<bool>,
        live: Arc<AtomicBool>,
    ) -> SentinelResult<()> {
        let coordinator = &self.shared.coordinator;
        let mut watching = true;
        let mut stop_armed = true;
        if !coordinator.is_active_alert(&alert.id) {
            if live
                .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                log::info!("{} released before the countdown started", alert.id);
                self.clear_active(&alert.id);
                self.finish_cancelled(&alert.id).await;
            }
            return Ok(());
        }
        let timer = tokio::time::sleep(self.shared.config.countdown());
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = &mut timer => break,
                result = &mut stop, if stop_armed => match result {
                    Ok(()) => return Ok(()),
                    Err(_) => stop_armed = false,
                },
                change = changes.recv(), if watching => match change {
                    Ok(true) => {}
                    Ok(false) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        if !coordinator.is_active_alert(&alert.id) {
                            if live
                                .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                                .is_ok()
                            {
                                log::info!("{} released by another context", alert.id);
                                self.clear_active(&alert.id);
                                self.finish_cancelled(&alert.id).await;
                            }
                            return Ok(());
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => watching = false,
                },
            }
        }

        if live
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::debug!("{} cancelled before dispatch", alert.id);
            return Ok(());
        }
        self.clear_active(&alert.id);

        if !coordinator.is_active_alert(&alert.id) {
            log::info!("{} no longer active, not sending", alert.id);
            self.finish_cancelled(&alert.id).await;
            return Ok(());
        }

        let config = &self.shared.config;
        let message = render_message(&config.sms_template, &config.user_name, &alert);
        let report = self.shared.dispatcher.dispatch(&message, &contacts).await?;

        alert.notified_contact_ids = report.delivered;
        alert.transition(AlertStatus::Sent);
        alert.resolve(ResolutionActor::System);
        if let Err(e) = self.shared.history.update(&alert) {
            log::warn!("could not record dispatch of {}: {e}", alert.id);
        }
        coordinator.complete_emergency(&alert.id);
        log::info!(
            "{} sent to {} contact(s)",
            alert.id,
            alert.notified_contact_ids.len()
        );
        self.emit(&alert.id, ResponsePhase::Sent);
        Ok(())
    }

    /// Cancel the running response.
    ///
    /// Stops the countdown before touching the alarms. Returns false when
    /// there was nothing to cancel or the send was already claimed. Safe to
    /// call repeatedly.
    pub async fn cancel(&self) -> bool {
        let Some(mut active) = lock(&self.shared.active).take() else {
            log::debug!("cancel with no active response");
            return false;
        };
        if active
            .live
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::info!("{} already dispatching, too late to cancel", active.alert_id);
            return false;
        }
        if let Some(stop) = active.stop_countdown.take() {
            let _ = stop.send(());
        }
        self.shared.coordinator.cancel_emergency(&active.alert_id);
        self.finish_cancelled(&active.alert_id).await;
        log::info!("{} cancelled by user", active.alert_id);
        true
    }

    fn clear_active(&self, alert_id: &str) {
        let mut active = lock(&self.shared.active);
        if active.as_ref().is_some_and(|a| a.alert_id == alert_id) {
            *active = None;
        }
    }

    async fn finish_cancelled(&self, alert_id: &str) {
        self.shared.alarms.stop_all().await;

        let history = &self.shared.history;
        match history.get(alert_id) {
            Some(mut alert) => {
                alert.transition(AlertStatus::Cancelled);
                if let Err(e) = history.update(&alert) {
                    log::warn!("could not record cancellation of {alert_id}: {e}");
                }
            }
            None => log::warn!("{alert_id} missing from history"),
        }
        if let Err(e) = history.resolve(alert_id, ResolutionActor::User) {
            log::warn!("could not resolve {alert_id}: {e}");
        }
        self.emit(alert_id, ResponsePhase::Cancelled);
    }

    async fn fail(&self, alert: Alert, reason: &str) {
        log::error!("{} failed: {reason}", alert.id);
        let taken = {
            let mut active = lock(&self.shared.active);
            match active.as_ref() {
                Some(a) if a.alert_id == alert.id => active.take(),
                _ => None,
            }
        };
        if let Some(active) = taken {
            active.live.store(false, Ordering::SeqCst);
        }

        let history = &self.shared.history;
        let mut stored = history.get(&alert.id).unwrap_or(alert);
        if stored.transition(AlertStatus::Failed) {
            stored.resolve(ResolutionActor::System);
            if let Err(e) = history.update(&stored) {
                log::warn!("could not record failure of {}: {e}", stored.id);
            }
        }
        self.shared.coordinator.complete_emergency(&stored.id);
        self.emit(&stored.id, ResponsePhase::Failed);
    }

    /// Feed detections from a monitor into this responder until the channel
    /// closes.
    pub fn follow(
        &self,
        mut detections: broadcast::Receiver<Detection>,
        source: TriggerSource,
    ) -> JoinHandle<()> {
        let responder = self.clone();
        tokio::spawn(async move {
            loop {
                match detections.recv().await {
                    Ok(detection) => {
                        responder.handle_detection(detection, source).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("responder lagged, {skipped} detection(s) dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            log::debug!("{source:?} detection feed closed");
        })
    }
}
