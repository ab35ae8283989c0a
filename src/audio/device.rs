//! Local capture-device enumeration and lookup
//!
//! System audio is captured by opening the render endpoint as an input
//! (WASAPI loopback) or, on hosts without loopback, a monitor input device
//! selected by name.

use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;

use crate::error::CaptureError;

/// Description of a device usable as a capture source
#[derive(Debug, Clone, Serialize)]
pub struct CaptureDeviceInfo {
    pub name: String,
    /// Render endpoint captured through loopback
    pub is_loopback: bool,
    pub is_default: bool,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
}

/// A resolved capture device with the config it will be opened with
pub struct CaptureDevice {
    inner: cpal::Device,
    pub name: String,
    pub is_loopback: bool,
    pub config: cpal::SupportedStreamConfig,
}

impl CaptureDevice {
    pub fn into_inner(self) -> cpal::Device {
        self.inner
    }
}

/// List output endpoints (loopback candidates) followed by input devices
pub fn list_capture_devices() -> Vec<CaptureDeviceInfo> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());
    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());

    if let Ok(outputs) = host.output_devices() {
        for device in outputs {
            if let Ok(name) = device.name() {
                let config = device.default_output_config().ok();
                devices.push(CaptureDeviceInfo {
                    is_default: default_output_name.as_ref() == Some(&name),
                    name,
                    is_loopback: true,
                    sample_rate: config.as_ref().map(|c| c.sample_rate().0),
                    channels: config.as_ref().map(|c| c.channels()),
                });
            }
        }
    }

    if let Ok(inputs) = host.input_devices() {
        for device in inputs {
            if let Ok(name) = device.name() {
                let config = device.default_input_config().ok();
                devices.push(CaptureDeviceInfo {
                    is_default: default_input_name.as_ref() == Some(&name),
                    name,
                    is_loopback: false,
                    sample_rate: config.as_ref().map(|c| c.sample_rate().0),
                    channels: config.as_ref().map(|c| c.channels()),
                });
            }
        }
    }

    devices
}

/// Resolve the device to capture system audio from.
///
/// A `preferred` name is looked up among input devices first (monitor
/// sources), then render endpoints. Without a preference the default render
/// endpoint is used on hosts that support loopback, otherwise the default
/// input device.
pub fn find_capture_device(preferred: Option<&str>) -> Result<CaptureDevice, CaptureError> {
    let host = cpal::default_host();

    if let Some(wanted) = preferred.filter(|name| !name.is_empty()) {
        if let Ok(inputs) = host.input_devices() {
            for device in inputs {
                if device.name().ok().as_deref() == Some(wanted) {
                    return resolve(device, false);
                }
            }
        }
        if let Ok(outputs) = host.output_devices() {
            for device in outputs {
                if device.name().ok().as_deref() == Some(wanted) {
                    return resolve(device, true);
                }
            }
        }
        return Err(CaptureError::DeviceNotFound(wanted.to_string()));
    }

    if cfg!(target_os = "windows") {
        let device = host
            .default_output_device()
            .ok_or_else(|| CaptureError::DeviceNotFound("No default output device".to_string()))?;
        resolve(device, true)
    } else {
        let device = host
            .default_input_device()
            .ok_or_else(|| CaptureError::DeviceNotFound("No default input device".to_string()))?;
        resolve(device, false)
    }
}

fn resolve(device: cpal::Device, is_loopback: bool) -> Result<CaptureDevice, CaptureError> {
    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    let config = if is_loopback {
        device.default_output_config()
    } else {
        device.default_input_config()
    }
    .map_err(|e| CaptureError::StreamError(format!("{}: {}", name, e)))?;

    Ok(CaptureDevice {
        inner: device,
        name,
        is_loopback,
        config,
    })
}
