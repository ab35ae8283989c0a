//! System audio capture through cpal
//!
//! The cpal stream is not `Send`, so it is built and owned by a dedicated
//! thread that lives until capture stops.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use crossbeam_channel::{bounded, Receiver};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::capture::{CaptureCallback, CaptureFormat, CaptureSource};
use crate::audio::device::find_capture_device;
use crate::error::CaptureError;

/// Capture of the machine's audio output
pub struct LoopbackCapture {
    device_name: Option<String>,
    format: CaptureFormat,
    sample_format: SampleFormat,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Option<Receiver<CaptureError>>,
    bytes_captured: Arc<AtomicU64>,
}

impl LoopbackCapture {
    /// Resolve the capture device now so the format is known before start
    pub fn new(device_name: Option<&str>) -> Result<Self, CaptureError> {
        let device = find_capture_device(device_name)?;
        let sample_format = device.config.sample_format();
        let sample_rate = device.config.sample_rate().0;
        let channels = device.config.channels();

        let format = match sample_format {
            SampleFormat::F32 => CaptureFormat::float32(sample_rate, channels),
            SampleFormat::I16 => CaptureFormat::int16(sample_rate, channels),
            other => {
                return Err(CaptureError::UnsupportedFormat(format!(
                    "{} delivers {:?}",
                    device.name, other
                )))
            }
        };

        tracing::info!(
            "Capture device: {} ({}) - Format: {}",
            device.name,
            if device.is_loopback { "loopback" } else { "input" },
            format
        );

        Ok(Self {
            device_name: Some(device.name),
            format,
            sample_format,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            error_rx: None,
            bytes_captured: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Total bytes handed to the callback
    pub fn bytes_captured(&self) -> u64 {
        self.bytes_captured.load(Ordering::Relaxed)
    }

    /// Check for asynchronous stream errors
    pub fn check_errors(&self) -> Option<CaptureError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl CaptureSource for LoopbackCapture {
    fn format(&self) -> CaptureFormat {
        self.format
    }

    fn start(&mut self, mut on_data: CaptureCallback) -> Result<(), CaptureError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let device = find_capture_device(self.device_name.as_deref())?;
        let (error_tx, error_rx) = bounded::<CaptureError>(16);
        self.error_rx = Some(error_rx);

        let running = self.running.clone();
        let running_for_loop = self.running.clone();
        let bytes_captured = self.bytes_captured.clone();
        let sample_format = self.sample_format;
        let config: StreamConfig = device.config.config();
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("capture-loopback".to_string())
            .spawn(move || {
                let cpal_device = device.into_inner();
                let mut scratch: Vec<u8> = Vec::new();
                let err_fn = move |err: cpal::StreamError| {
                    let _ = error_tx.try_send(CaptureError::StreamError(err.to_string()));
                };

                let stream = match sample_format {
                    SampleFormat::F32 => cpal_device.build_input_stream(
                        &config,
                        move |data: &[f32], _: &cpal::InputCallbackInfo| {
                            if !running.load(Ordering::Relaxed) {
                                return;
                            }
                            scratch.clear();
                            scratch.extend(data.iter().flat_map(|s| s.to_le_bytes()));
                            bytes_captured.fetch_add(scratch.len() as u64, Ordering::Relaxed);
                            on_data(&scratch);
                        },
                        err_fn,
                        None,
                    ),
                    _ => cpal_device.build_input_stream(
                        &config,
                        move |data: &[i16], _: &cpal::InputCallbackInfo| {
                            if !running.load(Ordering::Relaxed) {
                                return;
                            }
                            scratch.clear();
                            scratch.extend(data.iter().flat_map(|s| s.to_le_bytes()));
                            bytes_captured.fetch_add(scratch.len() as u64, Ordering::Relaxed);
                            on_data(&scratch);
                        },
                        err_fn,
                        None,
                    ),
                };

                match stream {
                    Ok(stream) => {
                        if let Err(e) = stream.play() {
                            tracing::error!("Failed to start capture stream: {}", e);
                            running_for_loop.store(false, Ordering::SeqCst);
                            return;
                        }

                        while running_for_loop.load(Ordering::Relaxed) {
                            thread::sleep(Duration::from_millis(10));
                        }
                        // Stream is dropped here, stopping capture
                    }
                    Err(e) => {
                        tracing::error!("Failed to build capture stream: {}", e);
                        running_for_loop.store(false, Ordering::SeqCst);
                    }
                }
            })
            .map_err(|e| CaptureError::StreamError(e.to_string()))?;

        self.thread_handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            tracing::info!("Audio capture stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for LoopbackCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
