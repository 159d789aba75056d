//! Admission controller
//!
//! Gates a job start on device conditions. The charging check is
//! synchronous so a job that cannot run never touches the network; the
//! interface check waits for the device to report its active interface.

use std::sync::Arc;

use fedlink_core::traits::{DeviceMonitor, NetworkInterface};
use fedlink_core::{EligibilityConstraint, Error, Result};

/// Checks battery and network constraints before a job negotiates
#[derive(Clone)]
pub struct AdmissionController {
    device: Arc<dyn DeviceMonitor>,
}

impl core::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AdmissionController").finish_non_exhaustive()
    }
}

impl AdmissionController {
    /// Create a controller reading status from `device`
    pub fn new(device: Arc<dyn DeviceMonitor>) -> Self {
        Self { device }
    }

    /// Fail immediately when charging is required and the device is on battery
    pub fn check_charging(&self, require_charging: bool) -> Result<()> {
        if require_charging && !self.device.is_charging() {
            tracing::info!("admission denied: device is not charging");
            return Err(Error::Eligibility(EligibilityConstraint::Charging));
        }
        Ok(())
    }

    /// Resolve the active interface when Wi-Fi is required
    pub async fn check_network(&self, require_wifi: bool) -> Result<()> {
        if !require_wifi {
            return Ok(());
        }
        let interface = self.device.active_interface().await;
        if interface != NetworkInterface::Wifi {
            tracing::info!(?interface, "admission denied: device is not on wifi");
            return Err(Error::Eligibility(EligibilityConstraint::Network));
        }
        Ok(())
    }

    /// Run both checks, charging first
    pub async fn can_start(&self, require_charging: bool, require_wifi: bool) -> Result<()> {
        self.check_charging(require_charging)?;
        self.check_network(require_wifi).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use fedlink_core::traits::StaticDevice;

    struct CountingDevice {
        charging: bool,
        interface_queries: AtomicUsize,
    }

    #[async_trait]
    impl DeviceMonitor for CountingDevice {
        fn is_charging(&self) -> bool {
            self.charging
        }

        async fn active_interface(&self) -> NetworkInterface {
            self.interface_queries.fetch_add(1, Ordering::SeqCst);
            NetworkInterface::Cellular
        }
    }

    #[tokio::test]
    async fn unconstrained_start_is_admitted() {
        let controller = AdmissionController::new(Arc::new(
            StaticDevice::plugged_in()
                .with_charging(false)
                .with_interface(NetworkInterface::Other),
        ));
        controller.can_start(false, false).await.unwrap();
    }

    #[tokio::test]
    async fn battery_failure_skips_interface_query() {
        let device = Arc::new(CountingDevice {
            charging: false,
            interface_queries: AtomicUsize::new(0),
        });
        let controller = AdmissionController::new(device.clone());
        let err = controller.can_start(true, true).await.unwrap_err();
        assert!(matches!(err, Error::Eligibility(EligibilityConstraint::Charging)));
        assert_eq!(device.interface_queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn wifi_is_only_queried_when_required() {
        let device = Arc::new(CountingDevice {
            charging: true,
            interface_queries: AtomicUsize::new(0),
        });
        let controller = AdmissionController::new(device.clone());
        controller.can_start(true, false).await.unwrap();
        assert_eq!(device.interface_queries.load(Ordering::SeqCst), 0);

        let err = controller.can_start(true, true).await.unwrap_err();
        assert!(matches!(err, Error::Eligibility(EligibilityConstraint::Network)));
        assert_eq!(device.interface_queries.load(Ordering::SeqCst), 1);
    }
}
