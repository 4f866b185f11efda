//! Process-wide emergency state.
//!
//! Foreground detection, the background monitoring service and the user's
//! cancel button do not share a call stack. They agree on whether an
//! emergency is active, cancelled or cooling down only through this object,
//! constructed once per process and handed out as `Arc<EmergencyCoordinator>`.
//!
//! Every mutator is keyed by alert id. Cancelling or completing with a stale
//! id (after a newer alert started) is a no-op, so late callers can never
//! stomp on somebody else's alert.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::ResponseConfig;
use crate::error::{SentinelError, SentinelResult};

/// Read-only view of the emergency state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmergencyState {
    pub is_active: bool,
    pub is_cancelled: bool,
    pub active_alert_id: Option<String>,
    pub last_cancellation: Option<Instant>,
}

#[derive(Debug, Default)]
struct Inner {
    is_active: bool,
    active_alert_id: Option<String>,
    /// Raised by a cancellation, lowered by the grace delay or a new start.
    cancelled_at: Option<Instant>,
    last_cancellation: Option<Instant>,
}

/// Arbiter of the emergency-active / cancelled / cooldown state.
#[derive(Debug)]
pub struct EmergencyCoordinator {
    inner: Mutex<Inner>,
    cooldown: Duration,
    cancel_grace: Duration,
    changes: broadcast::Sender<bool>,
}

impl EmergencyCoordinator {
    /// Creates a coordinator.
    ///
    /// `cooldown` blocks new emergencies after a cancellation; `cancel_grace`
    /// is how long `is_cancelled` stays raised.
    pub fn new(cooldown: Duration, cancel_grace: Duration) -> Self {
        let (changes, _) = broadcast::channel(32);
        Self {
            inner: Mutex::new(Inner::default()),
            cooldown,
            cancel_grace,
            changes,
        }
    }

    pub fn from_config(config: &ResponseConfig) -> Self {
        Self::new(
            Duration::from_secs(config.coordinator_cooldown_secs),
            Duration::from_millis(config.cancel_grace_ms),
        )
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self, active: bool) {
        // No subscribers is fine.
        let _ = self.changes.send(active);
    }

    /// Mark `alert_id` as the active emergency.
    ///
    /// Idempotent for the alert that already owns the state. Fails with
    /// `CoordinatorConflict` while a different alert is active.
    pub fn start_emergency(&self, alert_id: &str) -> SentinelResult<()> {
        Self::claim(&mut self.lock(), alert_id)?;
        log::debug!("emergency {alert_id} started");
        self.notify(true);
        Ok(())
    }

    /// Claim the emergency for a detection-driven alert.
    ///
    /// Like `start_emergency`, but refuses with `CooldownActive` while the
    /// cancelled flag is raised or the cancellation cooldown is running. The
    /// check and the claim happen under one lock, so a cancel that lands
    /// while the caller was resolving a location cannot be skipped.
    pub fn claim_emergency(&self, alert_id: &str) -> SentinelResult<()> {
        {
            let mut inner = self.lock();
            if self.cancelled_flag(&inner) || !self.cooldown_elapsed(&inner) {
                log::info!("refusing {alert_id}: cancellation cooldown active");
                return Err(SentinelError::CooldownActive);
            }
            Self::claim(&mut inner, alert_id)?;
        }
        log::debug!("emergency {alert_id} claimed");
        self.notify(true);
        Ok(())
    }

    fn claim(inner: &mut Inner, alert_id: &str) -> SentinelResult<()> {
        if inner.is_active {
            match inner.active_alert_id.as_deref() {
                Some(active) if active == alert_id => return Ok(()),
                Some(active) => {
                    return Err(SentinelError::CoordinatorConflict {
                        active: active.to_string(),
                    })
                }
                None => {}
            }
        }
        inner.is_active = true;
        inner.cancelled_at = None;
        inner.active_alert_id = Some(alert_id.to_string());
        Ok(())
    }

    /// Cancel `alert_id`.
    ///
    /// No-op (returns false) when a different alert is active. Otherwise the
    /// state goes inactive, the cancellation is stamped, and new emergencies
    /// are refused until the cooldown passes.
    pub fn cancel_emergency(&self, alert_id: &str) -> bool {
        {
            let mut inner = self.lock();
            if !Self::owns(&inner, alert_id) {
                log::debug!("ignoring cancel for stale alert {alert_id}");
                return false;
            }
            let now = Instant::now();
            inner.is_active = false;
            inner.active_alert_id = None;
            inner.cancelled_at = Some(now);
            inner.last_cancellation = Some(now);
        }
        log::debug!("emergency {alert_id} cancelled");
        self.notify(false);
        true
    }

    /// Release `alert_id` after its workflow finished.
    ///
    /// Same id guard as `cancel_emergency`; does not start a cooldown.
    pub fn complete_emergency(&self, alert_id: &str) -> bool {
        {
            let mut inner = self.lock();
            if !Self::owns(&inner, alert_id) {
                log::debug!("ignoring completion for stale alert {alert_id}");
                return false;
            }
            inner.is_active = false;
            inner.active_alert_id = None;
            inner.cancelled_at = None;
        }
        log::debug!("emergency {alert_id} completed");
        self.notify(false);
        true
    }

    fn owns(inner: &Inner, alert_id: &str) -> bool {
        match inner.active_alert_id.as_deref() {
            Some(active) => active == alert_id,
            None => true,
        }
    }

    /// False while a cancellation happened within the cooldown window.
    pub fn can_start_new_emergency(&self) -> bool {
        let inner = self.lock();
        self.cooldown_elapsed(&inner)
    }

    fn cooldown_elapsed(&self, inner: &Inner) -> bool {
        inner
            .last_cancellation
            .map_or(true, |at| at.elapsed() >= self.cooldown)
    }

    pub fn is_active(&self) -> bool {
        self.lock().is_active
    }

    /// True for `cancel_grace` after a cancellation.
    pub fn is_cancelled(&self) -> bool {
        let inner = self.lock();
        self.cancelled_flag(&inner)
    }

    fn cancelled_flag(&self, inner: &Inner) -> bool {
        inner
            .cancelled_at
            .is_some_and(|at| at.elapsed() < self.cancel_grace)
    }

    pub fn active_alert_id(&self) -> Option<String> {
        self.lock().active_alert_id.clone()
    }

    /// True when `alert_id` currently owns the active emergency.
    pub fn is_active_alert(&self, alert_id: &str) -> bool {
        let inner = self.lock();
        inner.is_active && inner.active_alert_id.as_deref() == Some(alert_id)
    }

    pub fn state(&self) -> EmergencyState {
        let inner = self.lock();
        EmergencyState {
            is_active: inner.is_active,
            is_cancelled: self.cancelled_flag(&inner),
            active_alert_id: inner.active_alert_id.clone(),
            last_cancellation: inner.last_cancellation,
        }
    }

    /// Receive `true` on start and `false` on cancel/complete/reset.
    pub fn subscribe(&self) -> broadcast::Receiver<bool> {
        self.changes.subscribe()
    }

    /// Force-clear everything, including the cooldown.
    pub fn reset_state(&self) {
        let was_active = {
            let mut inner = self.lock();
            let was_active = inner.is_active;
            *inner = Inner::default();
            was_active
        };
        log::warn!("emergency state reset");
        if was_active {
            self.notify(false);
        }
    }
}

impl Default for EmergencyCoordinator {
    fn default() -> Self {
        Self::from_config(&ResponseConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_start_and_complete() {
        let coordinator = EmergencyCoordinator::default();
        let mut changes = coordinator.subscribe();

        coordinator.start_emergency("a1").unwrap();
        assert!(coordinator.is_active());
        assert!(coordinator.is_active_alert("a1"));
        assert_eq!(changes.recv().await.unwrap(), true);

        assert!(coordinator.complete_emergency("a1"));
        let state = coordinator.state();
        assert!(!state.is_active);
        assert!(!state.is_cancelled);
        assert_eq!(state.active_alert_id, None);
        assert_eq!(changes.recv().await.unwrap(), false);
        assert!(coordinator.can_start_new_emergency());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_with_other_id_is_noop() {
        let coordinator = EmergencyCoordinator::default();
        coordinator.start_emergency("current").unwrap();

        assert!(!coordinator.cancel_emergency("stale"));
        assert!(!coordinator.complete_emergency("stale"));
        assert!(coordinator.is_active_alert("current"));
        assert!(coordinator.can_start_new_emergency());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_alert_conflicts() {
        let coordinator = EmergencyCoordinator::default();
        coordinator.start_emergency("first").unwrap();
        coordinator.start_emergency("first").unwrap();
        let err = coordinator.start_emergency("second").unwrap_err();
        assert!(matches!(
            err,
            SentinelError::CoordinatorConflict { ref active } if active == "first"
        ));
        assert_eq!(coordinator.active_alert_id().as_deref(), Some("first"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let coordinator = EmergencyCoordinator::default();
        coordinator.start_emergency("a").unwrap();
        assert!(coordinator.cancel_emergency("a"));
        assert!(coordinator.cancel_emergency("a"));
        let state = coordinator.state();
        assert!(!state.is_active);
        assert!(state.is_cancelled);
        assert!(!(state.is_active && state.is_cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_after_cancellation() {
        let coordinator = EmergencyCoordinator::default();
        coordinator.start_emergency("a").unwrap();
        coordinator.cancel_emergency("a");
        assert!(!coordinator.can_start_new_emergency());

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!coordinator.can_start_new_emergency());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(coordinator.can_start_new_emergency());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_flag_clears_after_grace() {
        let coordinator = EmergencyCoordinator::default();
        coordinator.start_emergency("a").unwrap();
        coordinator.cancel_emergency("a");
        assert!(coordinator.is_cancelled());

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(!coordinator.is_cancelled());
        // Cooldown is a separate, longer guard.
        assert!(!coordinator.can_start_new_emergency());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_lowers_cancelled_flag() {
        let coordinator = EmergencyCoordinator::default();
        coordinator.cancel_emergency("x");
        assert!(coordinator.is_cancelled());
        coordinator.start_emergency("y").unwrap();
        let state = coordinator.state();
        assert!(state.is_active);
        assert!(!state.is_cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_everything() {
        let coordinator = EmergencyCoordinator::default();
        coordinator.start_emergency("a").unwrap();
        coordinator.cancel_emergency("a");
        coordinator.reset_state();
        let state = coordinator.state();
        assert_eq!(
            state,
            EmergencyState {
                is_active: false,
                is_cancelled: false,
                active_alert_id: None,
                last_cancellation: None,
            }
        );
        assert!(coordinator.can_start_new_emergency());
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_refused_during_cooldown() {
        let coordinator = EmergencyCoordinator::default();
        coordinator.claim_emergency("a").unwrap();
        coordinator.cancel_emergency("a");

        let err = coordinator.claim_emergency("b").unwrap_err();
        assert!(matches!(err, SentinelError::CooldownActive));
        assert!(!coordinator.is_active());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(coordinator.claim_emergency("b").is_err());
        assert!(!coordinator.is_active());

        tokio::time::advance(Duration::from_secs(25)).await;
        coordinator.claim_emergency("b").unwrap();
        assert!(coordinator.is_active_alert("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_conflicts_like_start() {
        let coordinator = EmergencyCoordinator::default();
        coordinator.claim_emergency("first").unwrap();
        coordinator.claim_emergency("first").unwrap();
        let err = coordinator.claim_emergency("second").unwrap_err();
        assert!(matches!(
            err,
            SentinelError::CoordinatorConflict { ref active } if active == "first"
        ));
    }

    #[test]
    fn test_never_cancelled_can_start() {
        let coordinator = EmergencyCoordinator::default();
        assert!(coordinator.can_start_new_emergency());
        assert!(!coordinator.is_cancelled());
    }
}
