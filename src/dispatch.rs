//! SMS alert rendering and dispatch.

use std::sync::Arc;
use std::time::Duration;

use crate::capabilities::SmsGateway;
use crate::error::{SentinelError, SentinelResult};
use crate::types::{Alert, AlertLocation, EmergencyContact};

/// Text substituted for `{location}`.
///
/// Address plus maps link when geocoding worked, the link alone otherwise.
/// A last-known fix is labelled as such.
pub fn location_text(location: Option<&AlertLocation>) -> String {
    let Some(location) = location else {
        return "Location unavailable".to_string();
    };
    let mut text = match &location.address {
        Some(address) => format!("{address} ({})", location.maps_link()),
        None => location.maps_link(),
    };
    if location.stale {
        text.push_str(" [last known]");
    }
    text
}

/// Fill the SMS template for `alert`.
///
/// Placeholders: `{name}`, `{alertType}`, `{timestamp}`, `{location}`.
/// Unknown placeholders are left as they are.
pub fn render_message(template: &str, user_name: &str, alert: &Alert) -> String {
    template
        .replace("{name}", user_name)
        .replace("{alertType}", alert.alert_type.label())
        .replace(
            "{timestamp}",
            &alert.timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        )
        .replace("{location}", &location_text(alert.location.as_ref()))
}

/// Outcome of one SMS batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Contact ids whose message was accepted.
    pub delivered: Vec<String>,
    /// Contact ids and failure reasons.
    pub failed: Vec<(String, String)>,
}

impl DispatchReport {
    pub fn total(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }

    pub fn all_failed(&self) -> bool {
        self.delivered.is_empty() && !self.failed.is_empty()
    }
}

/// Sends alert SMS through the platform gateway.
#[derive(Clone)]
pub struct SmsDispatcher {
    gateway: Arc<dyn SmsGateway>,
    timeout: Duration,
}

impl SmsDispatcher {
    pub fn new(gateway: Arc<dyn SmsGateway>, timeout: Duration) -> Self {
        Self { gateway, timeout }
    }

    /// Send `message` to every contact in one batch.
    ///
    /// Individual failures are logged and reported; the call only fails when
    /// no recipient got the message or the batch timed out.
    pub async fn dispatch(
        &self,
        message: &str,
        contacts: &[EmergencyContact],
    ) -> SentinelResult<DispatchReport> {
        if contacts.is_empty() {
            return Ok(DispatchReport::default());
        }
        let numbers: Vec<String> = contacts.iter().map(|c| c.phone_number.clone()).collect();

        let results = tokio::time::timeout(self.timeout, self.gateway.send_batch(message, &numbers))
            .await
            .map_err(|_| SentinelError::Timeout(format!("SMS batch after {:?}", self.timeout)))?;

        let mut report = DispatchReport::default();
        for (i, contact) in contacts.iter().enumerate() {
            match results.get(i) {
                Some(Ok(())) => report.delivered.push(contact.id.clone()),
                Some(Err(e)) => {
                    log::warn!("SMS to contact {} failed: {e}", contact.id);
                    report.failed.push((contact.id.clone(), e.to_string()));
                }
                None => {
                    log::warn!("gateway returned no result for contact {}", contact.id);
                    report
                        .failed
                        .push((contact.id.clone(), "no result from gateway".to_string()));
                }
            }
        }

        if report.all_failed() {
            return Err(SentinelError::DispatchFailure {
                failed: report.failed.len(),
                total: report.total(),
            });
        }
        log::info!(
            "SMS delivered to {} of {} contacts",
            report.delivered.len(),
            report.total()
        );
        Ok(report)
    }
}
