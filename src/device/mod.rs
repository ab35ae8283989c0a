//! Receivers: identity, connection state, and the manager that connects them

pub mod manager;
pub mod state;

pub use manager::{DeviceConnectionManager, DiscoveryDiff};
pub use state::{ConnectionState, Device, DeviceHandle, DeviceInfo, DeviceSnapshot};
