//! Best-effort alert location.
//!
//! A fresh fix is requested with a timeout. If that fails or times out the
//! platform's last-known fix is used and marked stale. If both fail the alert
//! goes out without a location. Reverse geocoding is attempted afterwards and
//! only ever adds an address.

use std::sync::Arc;
use std::time::Duration;

use crate::capabilities::{CapabilityError, LocationProvider};
use crate::error::{SentinelError, SentinelResult};
use crate::types::{AlertLocation, LocationFix};

/// Resolves the location attached to a new alert.
#[derive(Clone)]
pub struct LocationResolver {
    provider: Option<Arc<dyn LocationProvider>>,
    timeout: Duration,
}

impl LocationResolver {
    pub fn new(provider: Arc<dyn LocationProvider>, timeout: Duration) -> Self {
        Self {
            provider: Some(provider),
            timeout,
        }
    }

    /// Resolver for hosts without location support. Always resolves to None.
    pub fn disabled() -> Self {
        Self {
            provider: None,
            timeout: Duration::ZERO,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Location for an alert, or None when nothing could be resolved.
    pub async fn resolve(&self) -> Option<AlertLocation> {
        match self.try_resolve().await {
            Ok(location) => Some(location),
            Err(e) => {
                log::warn!("continuing without location: {e}");
                None
            }
        }
    }

    /// Like `resolve`, but reports why nothing was found.
    pub async fn try_resolve(&self) -> SentinelResult<AlertLocation> {
        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| SentinelError::PermissionUnavailable("no location provider".into()))?;

        let (fix, stale) = match self.fresh_fix(provider.as_ref()).await {
            Ok(fix) => (fix, false),
            Err(e) => {
                log::info!("fresh fix unavailable ({e}), trying last known");
                match provider.last_known_fix().await {
                    Ok(Some(fix)) => (fix, true),
                    Ok(None) => return Err(SentinelError::LocationUnresolved),
                    Err(CapabilityError::PermissionDenied(what)) => {
                        return Err(SentinelError::PermissionUnavailable(what))
                    }
                    Err(e) => {
                        log::debug!("last known fix failed: {e}");
                        return Err(SentinelError::LocationUnresolved);
                    }
                }
            }
        };

        let address = self.geocode(provider.as_ref(), &fix).await;
        Ok(AlertLocation {
            latitude: fix.latitude,
            longitude: fix.longitude,
            address,
            stale,
        })
    }

    async fn fresh_fix(&self, provider: &dyn LocationProvider) -> SentinelResult<LocationFix> {
        match tokio::time::timeout(self.timeout, provider.current_fix(self.timeout)).await {
            Ok(result) => result.map_err(SentinelError::from),
            Err(_) => Err(SentinelError::Timeout(format!(
                "location fix after {:?}",
                self.timeout
            ))),
        }
    }

    async fn geocode(&self, provider: &dyn LocationProvider, fix: &LocationFix) -> Option<String> {
        match tokio::time::timeout(
            self.timeout,
            provider.reverse_geocode(fix.latitude, fix.longitude),
        )
        .await
        {
            Ok(Ok(address)) => address,
            Ok(Err(e)) => {
                log::debug!("reverse geocode failed: {e}");
                None
            }
            Err(_) => {
                log::debug!("reverse geocode timed out");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::ScriptedLocationProvider;

    #[tokio::test(start_paused = true)]
    async fn test_fresh_fix_with_address() {
        let provider = Arc::new(
            ScriptedLocationProvider::fixed(51.5, -0.12).with_address("Trafalgar Square"),
        );
        let resolver = LocationResolver::new(provider, Duration::from_secs(10));

        let location = resolver.resolve().await.unwrap();
        assert!(!location.stale);
        assert_eq!(location.address.as_deref(), Some("Trafalgar Square"));
        assert_eq!(location.latitude, 51.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_falls_back_to_last_known() {
        let provider = Arc::new(
            ScriptedLocationProvider::fixed(1.0, 2.0)
                .with_delay(Duration::from_secs(60))
                .with_last_known(LocationFix::new(3.0, 4.0)),
        );
        let resolver = LocationResolver::new(provider, Duration::from_secs(10));

        let location = resolver.resolve().await.unwrap();
        assert!(location.stale);
        assert_eq!((location.latitude, location.longitude), (3.0, 4.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_available() {
        let provider = Arc::new(ScriptedLocationProvider::unavailable());
        let resolver = LocationResolver::new(provider, Duration::from_secs(10));

        assert!(matches!(
            resolver.try_resolve().await,
            Err(SentinelError::LocationUnresolved)
        ));
        assert!(resolver.resolve().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_degrades() {
        let provider = Arc::new(ScriptedLocationProvider::denied());
        let resolver = LocationResolver::new(provider, Duration::from_secs(10));

        assert!(matches!(
            resolver.try_resolve().await,
            Err(SentinelError::PermissionUnavailable(_))
        ));
        assert!(LocationResolver::disabled().resolve().await.is_none());
    }
}
