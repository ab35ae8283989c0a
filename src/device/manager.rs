//! Device registry and connection lifecycle
//!
//! Holds the devices reported by discovery, the user's enable flags, and
//! drives the active [`OutputSink`] as devices are toggled. The registry lock
//! only guards membership; sink calls happen after it is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{ConnectionState, Device, DeviceHandle, DeviceInfo, DeviceSnapshot};
use crate::error::{Error, Result};
use crate::settings::SavedDevice;
use crate::sink::OutputSink;

/// What a discovery pass changed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiscoveryDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
}

/// Owns the device set and keeps the sink in step with it
pub struct DeviceConnectionManager {
    sink: Arc<dyn OutputSink>,
    /// Devices in discovery order
    devices: Mutex<Vec<DeviceHandle>>,
    /// Enable flags from settings, including devices not currently visible
    saved: Mutex<Vec<SavedDevice>>,
    streaming: AtomicBool,
}

impl DeviceConnectionManager {
    pub fn new(sink: Arc<dyn OutputSink>, saved: Vec<SavedDevice>) -> Self {
        Self {
            sink,
            devices: Mutex::new(Vec::new()),
            saved: Mutex::new(saved),
            streaming: AtomicBool::new(false),
        }
    }

    pub fn sink(&self) -> &Arc<dyn OutputSink> {
        &self.sink
    }

    pub fn devices(&self) -> Vec<DeviceHandle> {
        self.devices.lock().clone()
    }

    pub fn get(&self, id: &str) -> Option<DeviceHandle> {
        self.devices.lock().iter().find(|d| d.id() == id).cloned()
    }

    /// While streaming, toggles and new devices connect immediately
    pub fn set_streaming(&self, streaming: bool) {
        self.streaming.store(streaming, Ordering::SeqCst);
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    fn saved_enabled(&self, info: &DeviceInfo) -> Option<bool> {
        let saved = self.saved.lock();
        saved
            .iter()
            .find(|s| s.id == info.id)
            .or_else(|| saved.iter().find(|s| s.name == info.name))
            .map(|s| s.enabled)
    }

    /// Merge a discovery result into the device set.
    ///
    /// Vanished devices are disconnected and removed, new devices get their
    /// saved enable flag back, and known devices pick up new addresses.
    pub fn apply_discovery(&self, discovered: Vec<DeviceInfo>) -> DiscoveryDiff {
        let mut diff = DiscoveryDiff::default();
        let mut removed = Vec::new();
        let mut added = Vec::new();

        {
            let mut devices = self.devices.lock();

            devices.retain(|device| {
                let keep = discovered.iter().any(|info| info.id == device.id());
                if !keep {
                    removed.push(device.clone());
                }
                keep
            });

            for info in discovered {
                match devices.iter().find(|d| d.id() == info.id) {
                    Some(existing) => {
                        if existing.info() != info {
                            existing.update_info(info);
                            diff.updated.push(existing.id().to_string());
                        }
                    }
                    None => {
                        let enabled = self.saved_enabled(&info).unwrap_or(false);
                        let device = Device::handle(info);
                        device.set_enabled(enabled);
                        devices.push(device.clone());
                        added.push(device);
                    }
                }
            }
        }

        for device in removed {
            if device.state() != ConnectionState::Disconnected
                && device.state() != ConnectionState::Discovering
            {
                self.sink.disconnect_device(&device);
            }
            info!(device = %device.name(), "Device no longer available");
            diff.removed.push(device.id().to_string());
        }

        for device in added {
            info!(device = %device.name(), enabled = device.is_enabled(), "Discovered device");
            if self.is_streaming() && device.is_enabled() && device.info().is_resolved() {
                if let Err(e) = self.sink.connect_device(&device) {
                    warn!(device = %device.name(), "Failed to connect new device: {}", e);
                }
            }
            diff.added.push(device.id().to_string());
        }

        diff
    }

    /// Record the user's intent for `id`, connecting or disconnecting now
    /// when a session is running.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let device = self
            .get(id)
            .ok_or_else(|| Error::DeviceNotFound(id.to_string()))?;
        device.set_enabled(enabled);
        self.remember(&device);
        info!(device = %device.name(), enabled, "Device toggled");

        if !self.is_streaming() {
            return Ok(());
        }
        if enabled {
            self.sink.connect_device(&device)?;
        } else {
            self.sink.disconnect_device(&device);
        }
        Ok(())
    }

    fn remember(&self, device: &Device) {
        let info = device.info();
        let enabled = device.is_enabled();
        let mut saved = self.saved.lock();
        match saved.iter_mut().find(|s| s.id == info.id) {
            Some(entry) => {
                entry.name = info.name;
                entry.enabled = enabled;
            }
            None => saved.push(SavedDevice {
                id: info.id,
                name: info.name,
                enabled,
            }),
        }
    }

    /// Connect every enabled device that is not already active.
    ///
    /// Individual failures leave that device in `Error` and are logged;
    /// returns how many devices are active afterwards.
    pub fn connect_enabled(&self) -> Result<usize> {
        let enabled = self.enabled_devices();
        if enabled.is_empty() {
            return Err(Error::NoDevicesEnabled);
        }

        let mut active = 0;
        for device in enabled {
            if device.state().is_active() {
                active += 1;
                continue;
            }
            if !device.info().is_resolved() {
                debug!(device = %device.name(), "Skipping unresolved device");
                continue;
            }
            match self.sink.connect_device(&device) {
                Ok(()) => active += 1,
                Err(e) => warn!(device = %device.name(), "Failed to connect: {}", e),
            }
        }
        Ok(active)
    }

    /// Explicit recovery from `Error`
    pub fn reconnect(&self, id: &str) -> Result<()> {
        let device = self
            .get(id)
            .ok_or_else(|| Error::DeviceNotFound(id.to_string()))?;
        self.sink.disconnect_device(&device);
        self.sink.connect_device(&device)?;
        Ok(())
    }

    pub fn disconnect(&self, id: &str) -> Result<()> {
        let device = self
            .get(id)
            .ok_or_else(|| Error::DeviceNotFound(id.to_string()))?;
        self.sink.disconnect_device(&device);
        Ok(())
    }

    pub fn any_enabled(&self) -> bool {
        self.devices.lock().iter().any(|d| d.is_enabled())
    }

    pub fn enabled_devices(&self) -> Vec<DeviceHandle> {
        self.devices
            .lock()
            .iter()
            .filter(|d| d.is_enabled())
            .cloned()
            .collect()
    }

    pub fn stop_all(&self) {
        self.sink.stop_all();
    }

    /// Enable flags to persist: visible devices plus saved devices that are
    /// currently offline
    pub fn saved_devices(&self) -> Vec<SavedDevice> {
        for device in self.devices() {
            self.remember(&device);
        }
        self.saved.lock().clone()
    }

    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        self.devices().iter().map(|d| d.snapshot()).collect()
    }
}
