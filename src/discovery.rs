//! Receiver discovery boundary
//!
//! Discovery only reports what is out there; merging results into the
//! device set is the connection manager's job. Network browsing is left to
//! implementors of [`DeviceDiscovery`].

use tracing::debug;

use crate::device::DeviceInfo;
use crate::error::DiscoveryError;

/// Source of receiver records, queried on demand
pub trait DeviceDiscovery: Send + Sync {
    fn discover(&self) -> Result<Vec<DeviceInfo>, DiscoveryError>;
}

/// Fixed receiver list, typically from the configuration file
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    devices: Vec<DeviceInfo>,
}

impl StaticDiscovery {
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self { devices }
    }
}

impl DeviceDiscovery for StaticDiscovery {
    fn discover(&self) -> Result<Vec<DeviceInfo>, DiscoveryError> {
        let mut seen = std::collections::HashSet::new();
        let mut devices = Vec::with_capacity(self.devices.len());
        for device in &self.devices {
            if device.id.is_empty() {
                return Err(DiscoveryError::Failed(format!(
                    "receiver '{}' has no id",
                    device.name
                )));
            }
            if seen.insert(device.id.clone()) {
                devices.push(device.clone());
            } else {
                debug!(id = %device.id, "Duplicate receiver ignored");
            }
        }
        Ok(devices)
    }
}
