//! Output sinks delivering the PCM stream to receivers
//!
//! An [`OutputSink`] owns whatever resource reaches the receivers and keeps
//! each device's [`ConnectionState`](crate::device::ConnectionState) current.
//! Two strategies are provided:
//!
//! - [`PersistentConnectionSink`]: one shared socket or pipe into a streaming
//!   server, with per-device outputs toggled through an [`OutputController`]
//! - [`PerDeviceProcessSink`]: one player subprocess per device, fed on stdin
//!
//! [`MemorySink`] records everything in memory and can simulate failures.

mod memory;
mod persistent;
mod process;
mod volume;

pub use memory::MemorySink;
pub use persistent::{Endpoint, PersistentConnectionSink, PersistentSinkConfig};
pub use process::{PerDeviceProcessSink, ProcessSinkConfig};
pub use volume::VolumeDispatcher;

use crate::device::{DeviceHandle, DeviceInfo};
use crate::error::SinkError;

/// Outcome of one fan-out write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendReport {
    /// Devices that accepted the payload
    pub delivered: usize,
    /// Devices whose write failed during this call
    pub failed: usize,
}

/// A destination for the continuous PCM byte stream.
///
/// Methods take `&self`; implementations guard their device collection with
/// a lock held only for membership changes, never across I/O, so `send_to_all`
/// may run concurrently with connects and disconnects.
pub trait OutputSink: Send + Sync {
    /// Name for logs
    fn name(&self) -> &str;

    /// Establish whatever `device` needs to receive audio.
    ///
    /// Moves the device through `Connecting` to `Connected`; on failure the
    /// device is left in `Error` with a message and the error is returned.
    fn connect_device(&self, device: &DeviceHandle) -> Result<(), SinkError>;

    /// Best-effort teardown. Always leaves the device `Disconnected`;
    /// teardown failures are logged, not returned.
    fn disconnect_device(&self, device: &DeviceHandle);

    /// Deliver `data` to every enabled, connected device.
    ///
    /// A failure on one device marks it `Error` and does not prevent
    /// delivery to the others.
    fn send_to_all(&self, data: &[u8]) -> SendReport;

    /// Clamp to 0..=100 and apply without blocking the caller
    fn set_volume(&self, level: i32);

    /// Current volume after clamping
    fn volume(&self) -> u8;

    /// Disconnect every device and release shared resources. Idempotent.
    fn stop_all(&self);
}

/// Control plane of a shared streaming server.
///
/// The wire protocol is up to the implementation; calls may block, so the
/// sinks never make them from the audio path.
pub trait OutputController: Send + Sync {
    /// Enable or disable the server output for `device`
    fn set_output_enabled(&self, device: &DeviceInfo, enabled: bool) -> Result<(), SinkError>;

    /// Make sure the server is playing its PCM input
    fn start_playback(&self) -> Result<(), SinkError> {
        Ok(())
    }

    fn set_master_volume(&self, level: u8) -> Result<(), SinkError>;
}

/// Controller for servers that need no per-output control, such as a
/// plain PCM listener that forwards to preconfigured receivers
#[derive(Debug, Default, Clone, Copy)]
pub struct PassiveController;

impl OutputController for PassiveController {
    fn set_output_enabled(&self, device: &DeviceInfo, enabled: bool) -> Result<(), SinkError> {
        tracing::debug!(device = %device.name, enabled, "Passive controller: output toggle ignored");
        Ok(())
    }

    fn set_master_volume(&self, level: u8) -> Result<(), SinkError> {
        tracing::debug!(level, "Passive controller: volume ignored");
        Ok(())
    }
}

/// Clamp a requested volume into 0..=100
pub fn clamp_volume(level: i32) -> u8 {
    level.clamp(0, 100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_volume() {
        assert_eq!(clamp_volume(-5), 0);
        assert_eq!(clamp_volume(42), 42);
        assert_eq!(clamp_volume(250), 100);
    }
}
