//! Streaming session
//!
//! Wires capture, encoder, jitter buffer, pacing loop and sink together and
//! owns their start/stop ordering. Shutdown always runs:
//!
//! 1. stop capture, so no new input arrives
//! 2. cancel the pacing loop
//! 3. stop the sink, which unblocks a write the loop may be stuck in
//! 4. join the pacing loop (bounded)
//! 5. clear the jitter buffer

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, trace, warn};

use crate::audio::buffer::{cancellation, CancelHandle, JitterBuffer};
use crate::audio::capture::{CaptureCallback, CaptureSource};
use crate::codec::{EncoderStats, PcmEncoder};
use crate::config::PipelineConfig;
use crate::device::{DeviceConnectionManager, DeviceSnapshot, DiscoveryDiff};
use crate::discovery::DeviceDiscovery;
use crate::error::{Error, Result, SinkError};
use crate::settings::{Settings, SettingsStore};
use crate::sink::OutputSink;
use crate::transport::{PacingConfig, PacingHandle, PacingSnapshot, PacingTransport};

/// Capture events logged at info before switching to trace
const LOGGED_CAPTURE_EVENTS: u64 = 3;

struct ActiveStream {
    capture: Box<dyn CaptureSource>,
    cancel: CancelHandle,
    pacing: Option<PacingHandle>,
}

/// Point-in-time status for display
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub streaming: bool,
    pub volume: u8,
    pub devices: Vec<DeviceSnapshot>,
    pub buffered_frames: usize,
    pub dropped_frames: usize,
    pub encoder: EncoderStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pacing: Option<PacingSnapshot>,
}

/// Orchestrates one capture-to-receivers pipeline
pub struct StreamingSession {
    manager: Arc<DeviceConnectionManager>,
    buffer: Arc<JitterBuffer>,
    encoder: Arc<Mutex<PcmEncoder>>,
    pipeline: PipelineConfig,
    settings: Mutex<Settings>,
    store: Option<SettingsStore>,
    active: Mutex<Option<ActiveStream>>,
}

impl StreamingSession {
    /// Settings are loaded from `store` when given and never saved otherwise
    pub fn new(
        sink: Arc<dyn OutputSink>,
        pipeline: PipelineConfig,
        store: Option<SettingsStore>,
    ) -> Self {
        let settings = store.as_ref().map(|s| s.load()).unwrap_or_default();
        sink.set_volume(i32::from(settings.global_volume));
        let manager = Arc::new(DeviceConnectionManager::new(
            sink,
            settings.saved_devices.clone(),
        ));

        Self {
            manager,
            buffer: Arc::new(JitterBuffer::new(pipeline.max_frames)),
            encoder: Arc::new(Mutex::new(PcmEncoder::new())),
            pipeline,
            settings: Mutex::new(settings),
            store,
            active: Mutex::new(None),
        }
    }

    pub fn manager(&self) -> &Arc<DeviceConnectionManager> {
        &self.manager
    }

    pub fn buffer(&self) -> &Arc<JitterBuffer> {
        &self.buffer
    }

    pub fn settings(&self) -> Settings {
        self.settings.lock().clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Start streaming from `capture` to every enabled device.
    ///
    /// Fails without side effects when nothing is enabled; any later
    /// failure rolls the partial start back.
    pub fn start(&self, mut capture: Box<dyn CaptureSource>) -> Result<()> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(Error::AlreadyStreaming);
        }
        if !self.manager.any_enabled() {
            return Err(Error::NoDevicesEnabled);
        }

        info!("Starting streaming session");
        self.manager.set_streaming(true);

        let connected = match self.manager.connect_enabled() {
            Ok(0) => Err(Error::Sink(SinkError::Unavailable {
                device: "all enabled devices".to_string(),
                reason: "none could be connected".to_string(),
            })),
            other => other,
        };
        let connected = match connected {
            Ok(n) => n,
            Err(e) => {
                self.manager.set_streaming(false);
                self.manager.stop_all();
                return Err(e);
            }
        };

        let format = capture.format();
        if let Err(e) = self.encoder.lock().initialize(format) {
            self.manager.set_streaming(false);
            self.manager.stop_all();
            return Err(e.into());
        }

        self.buffer.clear();
        let (cancel, token) = cancellation();
        let pacing = PacingTransport::new(
            self.buffer.clone(),
            self.manager.sink().clone(),
            token,
            PacingConfig {
                dequeue_timeout: self.pipeline.dequeue_timeout(),
                ..Default::default()
            },
        )
        .spawn();

        let pacing = match pacing {
            Ok(handle) => handle,
            Err(e) => {
                self.manager.set_streaming(false);
                self.manager.stop_all();
                return Err(e.into());
            }
        };

        if let Err(e) = capture.start(self.capture_callback()) {
            error!("Failed to start capture: {}", e);
            self.shutdown(capture.as_mut(), &cancel, Some(pacing));
            return Err(e.into());
        }
        *active = Some(ActiveStream {
            capture,
            cancel,
            pacing: Some(pacing),
        });

        info!("Streaming {} to {} device(s)", format, connected);
        Ok(())
    }

    fn capture_callback(&self) -> CaptureCallback {
        let encoder = self.encoder.clone();
        let buffer = self.buffer.clone();
        let mut events: u64 = 0;

        Box::new(move |data: &[u8]| {
            events += 1;
            let n = events;
            if n <= LOGGED_CAPTURE_EVENTS {
                info!("Capture event #{}: {} bytes", n, data.len());
            } else if n == LOGGED_CAPTURE_EVENTS + 1 {
                info!("Capture working normally (further capture logs at trace)");
            } else {
                trace!("Capture event #{}: {} bytes", n, data.len());
            }

            match encoder.lock().encode(data) {
                Ok(pcm) if pcm.is_empty() => {}
                Ok(pcm) => buffer.push(pcm),
                Err(e) => error!("Error encoding audio: {}", e),
            }
        })
    }

    fn shutdown(
        &self,
        capture: &mut dyn CaptureSource,
        cancel: &CancelHandle,
        pacing: Option<PacingHandle>,
    ) -> Option<PacingSnapshot> {
        capture.stop();
        cancel.cancel();
        self.manager.set_streaming(false);
        self.manager.stop_all();

        let snapshot = pacing.map(|mut pacing| {
            if !pacing.join(self.pipeline.shutdown_timeout()) {
                warn!("Continuing shutdown with pacing loop still running");
            }
            pacing.stats()
        });

        self.buffer.clear();
        snapshot
    }

    /// Stop streaming. Idempotent; returns the final pacing counters.
    pub fn stop(&self) -> Option<PacingSnapshot> {
        let mut stream = self.active.lock().take()?;
        info!("Stopping streaming session");
        let snapshot = self.shutdown(stream.capture.as_mut(), &stream.cancel, stream.pacing.take());
        self.encoder.lock().reset();
        info!("Streaming stopped");
        snapshot
    }

    /// Clamp, apply without waiting, and persist
    pub fn set_volume(&self, level: i32) {
        let sink = self.manager.sink();
        sink.set_volume(level);
        self.settings.lock().global_volume = sink.volume();
        self.persist();
    }

    pub fn volume(&self) -> u8 {
        self.manager.sink().volume()
    }

    /// Enable or disable a device and persist the choice
    pub fn toggle_device(&self, id: &str, enabled: bool) -> Result<()> {
        let result = self.manager.set_enabled(id, enabled);
        if !matches!(result, Err(Error::DeviceNotFound(_))) {
            self.persist();
        }
        result
    }

    /// Run one discovery pass and merge it
    pub fn refresh_devices(&self, discovery: &dyn DeviceDiscovery) -> Result<DiscoveryDiff> {
        let found = discovery.discover()?;
        let diff = self.manager.apply_discovery(found);
        if !diff.added.is_empty() || !diff.removed.is_empty() {
            info!(
                added = diff.added.len(),
                removed = diff.removed.len(),
                "Device list changed"
            );
        }
        Ok(diff)
    }

    fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let settings = {
            let mut settings = self.settings.lock();
            settings.saved_devices = self.manager.saved_devices();
            settings.clone()
        };
        if let Err(e) = store.save(&settings) {
            error!("Failed to save settings: {}", e);
        }
    }

    pub fn status(&self) -> SessionStatus {
        let active = self.active.lock();
        SessionStatus {
            streaming: active.is_some(),
            volume: self.volume(),
            devices: self.manager.snapshots(),
            buffered_frames: self.buffer.len(),
            dropped_frames: self.buffer.dropped_count(),
            encoder: self.encoder.lock().stats(),
            pacing: active
                .as_ref()
                .and_then(|s| s.pacing.as_ref())
                .map(|p| p.stats()),
        }
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        self.stop();
    }
}
