//! In-memory sink
//!
//! Records every byte per device. Failures can be injected per device, which
//! makes it the sink of choice for exercising the pipeline without receivers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use tracing::{info, warn};

use super::{clamp_volume, OutputSink, SendReport};
use crate::constants::DEFAULT_VOLUME;
use crate::device::{ConnectionState, DeviceHandle};
use crate::error::SinkError;

#[derive(Default)]
struct Failures {
    connect: HashSet<String>,
    write: HashSet<String>,
}

/// Sink that keeps received audio in memory
pub struct MemorySink {
    devices: Mutex<HashMap<String, DeviceHandle>>,
    received: Mutex<HashMap<String, Vec<u8>>>,
    failures: Mutex<Failures>,
    volume: AtomicU8,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            received: Mutex::new(HashMap::new()),
            failures: Mutex::new(Failures::default()),
            volume: AtomicU8::new(DEFAULT_VOLUME),
        }
    }

    /// Make every future write to `id` fail
    pub fn fail_device(&self, id: &str) {
        self.failures.lock().write.insert(id.to_string());
    }

    /// Make every future connect of `id` fail
    pub fn fail_connect(&self, id: &str) {
        self.failures.lock().connect.insert(id.to_string());
    }

    /// Bytes delivered to `id` so far
    pub fn received(&self, id: &str) -> Vec<u8> {
        self.received.lock().get(id).cloned().unwrap_or_default()
    }

    pub fn received_len(&self, id: &str) -> usize {
        self.received.lock().get(id).map_or(0, Vec::len)
    }

    pub fn connected_count(&self) -> usize {
        self.devices.lock().len()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn connect_device(&self, device: &DeviceHandle) -> Result<(), SinkError> {
        device.set_state(ConnectionState::Connecting);
        if self.failures.lock().connect.contains(device.id()) {
            let err = SinkError::Unavailable {
                device: device.name(),
                reason: "connection refused".to_string(),
            };
            device.mark_error(err.to_string());
            return Err(err);
        }

        self.devices.lock().insert(device.id().to_string(), device.clone());
        device.set_state(ConnectionState::Connected);
        info!(device = %device.name(), "Memory sink connected");
        Ok(())
    }

    fn disconnect_device(&self, device: &DeviceHandle) {
        self.devices.lock().remove(device.id());
        device.set_state(ConnectionState::Disconnected);
    }

    fn send_to_all(&self, data: &[u8]) -> SendReport {
        let targets: Vec<DeviceHandle> = self
            .devices
            .lock()
            .values()
            .filter(|d| d.accepts_audio())
            .cloned()
            .collect();

        let mut report = SendReport::default();
        for device in targets {
            if self.failures.lock().write.contains(device.id()) {
                warn!(device = %device.name(), "Simulated write failure");
                device.mark_error("simulated write failure");
                report.failed += 1;
                continue;
            }
            self.received
                .lock()
                .entry(device.id().to_string())
                .or_default()
                .extend_from_slice(data);
            device.record_send();
            report.delivered += 1;
        }
        report
    }

    fn set_volume(&self, level: i32) {
        self.volume.store(clamp_volume(level), Ordering::Relaxed);
    }

    fn volume(&self) -> u8 {
        self.volume.load(Ordering::Relaxed)
    }

    fn stop_all(&self) {
        let devices: Vec<DeviceHandle> = self.devices.lock().drain().map(|(_, d)| d).collect();
        for device in devices {
            device.set_state(ConnectionState::Disconnected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceInfo};

    fn enabled(id: &str) -> DeviceHandle {
        let device = Device::handle(DeviceInfo::new(id, id).with_address("127.0.0.1"));
        device.set_enabled(true);
        device
    }

    #[test]
    fn test_failure_isolated_to_one_device() {
        let sink = MemorySink::new();
        let (a, b, c) = (enabled("a"), enabled("b"), enabled("c"));
        for d in [&a, &b, &c] {
            sink.connect_device(d).unwrap();
        }
        sink.fail_device("c");

        let report = sink.send_to_all(&[9u8; 8]);
        assert_eq!(report, SendReport { delivered: 2, failed: 1 });
        assert_eq!(a.state(), ConnectionState::Streaming);
        assert_eq!(c.state(), ConnectionState::Error);

        // Errored devices are skipped afterwards
        let report = sink.send_to_all(&[9u8; 8]);
        assert_eq!(report, SendReport { delivered: 2, failed: 0 });
        assert_eq!(sink.received_len("a"), 16);
        assert_eq!(sink.received_len("c"), 0);
    }

    #[test]
    fn test_disabled_device_skipped() {
        let sink = MemorySink::new();
        let a = enabled("a");
        sink.connect_device(&a).unwrap();
        a.set_enabled(false);

        assert_eq!(sink.send_to_all(&[1, 2]).delivered, 0);
    }

    #[test]
    fn test_connect_failure_marks_error() {
        let sink = MemorySink::new();
        let a = enabled("a");
        sink.fail_connect("a");

        assert!(sink.connect_device(&a).is_err());
        assert_eq!(a.state(), ConnectionState::Error);
        assert_eq!(sink.connected_count(), 0);
    }
}
