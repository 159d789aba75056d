//! Device capability traits
//!
//! Battery and network status come from the host platform; the client only
//! consumes them through [`DeviceMonitor`].

use async_trait::async_trait;

/// Active network interface of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkInterface {
    /// Wireless LAN
    Wifi,
    /// Mobile data
    Cellular,
    /// Ethernet or similar
    Wired,
    /// Anything else, or not connected
    Other,
}

/// Source of device battery and connectivity status
#[async_trait]
pub trait DeviceMonitor: Send + Sync {
    /// Whether the device is currently charging
    fn is_charging(&self) -> bool;

    /// Resolve the currently active network interface
    async fn active_interface(&self) -> NetworkInterface;
}

/// Fixed device status, for hosts without battery or interface probing
#[derive(Debug, Clone, Copy)]
pub struct StaticDevice {
    /// Reported charging state
    pub charging: bool,
    /// Reported network interface
    pub interface: NetworkInterface,
}

impl StaticDevice {
    /// A plugged-in device on Wi-Fi
    pub fn plugged_in() -> Self {
        Self {
            charging: true,
            interface: NetworkInterface::Wifi,
        }
    }

    /// Set the charging state
    pub fn with_charging(mut self, charging: bool) -> Self {
        self.charging = charging;
        self
    }

    /// Set the active interface
    pub fn with_interface(mut self, interface: NetworkInterface) -> Self {
        self.interface = interface;
        self
    }
}

impl Default for StaticDevice {
    fn default() -> Self {
        Self::plugged_in()
    }
}

#[async_trait]
impl DeviceMonitor for StaticDevice {
    fn is_charging(&self) -> bool {
        self.charging
    }

    async fn active_interface(&self) -> NetworkInterface {
        self.interface
    }
}
