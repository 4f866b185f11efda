//! Bounded alert history.
//!
//! Alerts are stored oldest first as JSON string-list entries under one store
//! key. The list never holds more than `capacity` alerts; appending past the
//! cap evicts from the front.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;

use crate::capabilities::ConfigStore;
use crate::error::{SentinelError, SentinelResult};
use crate::types::{Alert, AlertStatus, ResolutionActor};

/// Store key holding the history list.
pub const HISTORY_KEY: &str = "alert_history";

/// Maximum number of retained alerts.
pub const MAX_HISTORY: usize = 100;

/// Alerts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryCounts {
    pub triggered: usize,
    pub sent: usize,
    pub cancelled: usize,
    pub failed: usize,
}

impl HistoryCounts {
    pub fn total(&self) -> usize {
        self.triggered + self.sent + self.cancelled + self.failed
    }
}

/// Persisted alert log shared by the foreground and background responders.
#[derive(Clone)]
pub struct AlertHistory {
    store: Arc<dyn ConfigStore>,
    capacity: usize,
    /// Serialises read-modify-write cycles against the store.
    write_lock: Arc<Mutex<()>>,
}

impl AlertHistory {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self::with_capacity(store, MAX_HISTORY)
    }

    pub fn with_capacity(store: Arc<dyn ConfigStore>, capacity: usize) -> Self {
        Self {
            store,
            capacity: capacity.max(1),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load(&self) -> Vec<Alert> {
        self.store
            .get_string_list(HISTORY_KEY)
            .unwrap_or_default()
            .iter()
            .filter_map(|entry| match serde_json::from_str(entry) {
                Ok(alert) => Some(alert),
                Err(e) => {
                    log::warn!("dropping undecodable history entry: {e}");
                    None
                }
            })
            .collect()
    }

    fn save(&self, alerts: &[Alert]) -> SentinelResult<()> {
        let entries = alerts
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;
        self.store.set_string_list(HISTORY_KEY, &entries)
    }

    /// Append an alert, evicting the oldest entries beyond capacity.
    pub fn append(&self, alert: &Alert) -> SentinelResult<()> {
        let _guard = self.guard();
        let mut alerts = self.load();
        alerts.push(alert.clone());
        if alerts.len() > self.capacity {
            let excess = alerts.len() - self.capacity;
            alerts.drain(..excess);
            log::debug!("history full, evicted {excess} oldest alert(s)");
        }
        self.save(&alerts)
    }

    /// Replace the stored copy of `alert`.
    ///
    /// Returns false when the alert is no longer in the history (evicted or
    /// cleared), which is not an error.
    pub fn update(&self, alert: &Alert) -> SentinelResult<bool> {
        self.modify(&alert.id, |stored| *stored = alert.clone())
    }

    /// Stamp `resolved_at` and `resolved_by` on a stored alert.
    pub fn resolve(&self, id: &str, actor: ResolutionActor) -> SentinelResult<bool> {
        self.modify(id, |stored| {
            stored.resolved_at = Some(Utc::now());
            stored.resolved_by = Some(actor);
        })
    }

    fn modify(&self, id: &str, apply: impl FnOnce(&mut Alert)) -> SentinelResult<bool> {
        let _guard = self.guard();
        let mut alerts = self.load();
        match alerts.iter_mut().find(|a| a.id == id) {
            Some(stored) => {
                apply(stored);
                self.save(&alerts)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn get(&self, id: &str) -> Option<Alert> {
        self.load().into_iter().find(|a| a.id == id)
    }

    /// Every retained alert, oldest first.
    pub fn all(&self) -> Vec<Alert> {
        self.load()
    }

    /// Up to `n` alerts, newest first.
    pub fn recent(&self, n: usize) -> Vec<Alert> {
        self.load().into_iter().rev().take(n).collect()
    }

    pub fn len(&self) -> usize {
        self.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counts(&self) -> HistoryCounts {
        let mut counts = HistoryCounts::default();
        for alert in self.load() {
            match alert.status {
                AlertStatus::Triggered => counts.triggered += 1,
                AlertStatus::Sent => counts.sent += 1,
                AlertStatus::Cancelled => counts.cancelled += 1,
                AlertStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn clear(&self) -> SentinelResult<()> {
        let _guard = self.guard();
        self.store
            .remove(HISTORY_KEY)
            .map_err(|e| SentinelError::Store(format!("clear history: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{AlertType, TriggerSource};

    fn history() -> AlertHistory {
        AlertHistory::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_append_and_get() {
        let history = history();
        let alert = Alert::new(AlertType::Fall, TriggerSource::Foreground);
        history.append(&alert).unwrap();

        assert_eq!(history.len(), 1);
        assert_eq!(history.get(&alert.id), Some(alert));
        assert_eq!(history.get("missing"), None);
    }

    #[test]
    fn test_evicts_oldest_past_capacity() {
        let history = history();
        let alerts: Vec<_> = (0..=MAX_HISTORY)
            .map(|_| Alert::new(AlertType::Impact, TriggerSource::Background))
            .collect();
        for alert in &alerts {
            history.append(alert).unwrap();
        }

        assert_eq!(history.len(), MAX_HISTORY);
        assert!(history.get(&alerts[0].id).is_none());
        assert_eq!(history.all()[0].id, alerts[1].id);
        assert_eq!(history.recent(1)[0].id, alerts[MAX_HISTORY].id);
    }

    #[test]
    fn test_update_and_resolve() {
        let history = history();
        let mut alert = Alert::new(AlertType::Panic, TriggerSource::Manual);
        history.append(&alert).unwrap();

        alert.transition(AlertStatus::Cancelled);
        assert!(history.update(&alert).unwrap());
        assert!(history.resolve(&alert.id, ResolutionActor::User).unwrap());

        let stored = history.get(&alert.id).unwrap();
        assert_eq!(stored.status, AlertStatus::Cancelled);
        assert_eq!(stored.resolved_by, Some(ResolutionActor::User));
        assert!(stored.resolved_at.is_some());

        let stray = Alert::new(AlertType::Fall, TriggerSource::Foreground);
        assert!(!history.update(&stray).unwrap());
    }

    #[test]
    fn test_recent_and_counts() {
        let history = history();
        let mut sent = Alert::new(AlertType::Fall, TriggerSource::Foreground);
        sent.transition(AlertStatus::Sent);
        let mut failed = Alert::new(AlertType::Impact, TriggerSource::Foreground);
        failed.transition(AlertStatus::Failed);
        let pending = Alert::new(AlertType::Fall, TriggerSource::Background);
        for alert in [&sent, &failed, &pending] {
            history.append(alert).unwrap();
        }

        let recent = history.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, pending.id);
        assert_eq!(recent[1].id, failed.id);

        let counts = history.counts();
        assert_eq!(counts.sent, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.triggered, 1);
        assert_eq!(counts.total(), 3);
    }

    #[test]
    fn test_clear() {
        let history = history();
        history
            .append(&Alert::new(AlertType::Fall, TriggerSource::Foreground))
            .unwrap();
        history.clear().unwrap();
        assert!(history.is_empty());
    }
}
