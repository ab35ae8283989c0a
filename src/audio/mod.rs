//! Audio subsystem module

pub mod buffer;
pub mod capture;
#[cfg(feature = "capture")]
pub mod device;
#[cfg(feature = "capture")]
pub mod loopback;

pub use buffer::{cancellation, AudioFrame, CancelHandle, CancelToken, Dequeued, JitterBuffer};
pub use capture::{CaptureCallback, CaptureFormat, CaptureSource, ReaderCapture, SampleKind};
#[cfg(feature = "capture")]
pub use device::{find_capture_device, list_capture_devices, CaptureDeviceInfo};
#[cfg(feature = "capture")]
pub use loopback::LoopbackCapture;
