//! Capture boundary
//!
//! A [`CaptureSource`] delivers raw interleaved PCM chunks on its own thread
//! together with a fixed [`CaptureFormat`]. The slice handed to the callback
//! is only valid for the duration of the call; consumers copy what they keep.

use serde::{Deserialize, Serialize};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::CaptureError;

/// Sample encoding of a capture stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleKind {
    /// IEEE float
    Float,
    /// Signed integer
    Int,
}

/// Format of the PCM a capture source produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub sample_kind: SampleKind,
}

impl CaptureFormat {
    /// Interleaved 32-bit float
    pub fn float32(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: 32,
            sample_kind: SampleKind::Float,
        }
    }

    /// Interleaved 16-bit signed little-endian
    pub fn int16(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: 16,
            sample_kind: SampleKind::Int,
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        self.bits_per_sample as usize / 8
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }

    pub fn bytes_per_second(&self) -> usize {
        self.bytes_per_frame() * self.sample_rate as usize
    }
}

impl std::fmt::Display for CaptureFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.sample_kind {
            SampleKind::Float => "float",
            SampleKind::Int => "int",
        };
        write!(
            f,
            "{}Hz {}ch {}-bit {}",
            self.sample_rate, self.channels, self.bits_per_sample, kind
        )
    }
}

/// Callback receiving each captured chunk
pub type CaptureCallback = Box<dyn FnMut(&[u8]) + Send + 'static>;

/// A live PCM source
pub trait CaptureSource: Send {
    /// Format of every chunk this source delivers
    fn format(&self) -> CaptureFormat;

    /// Start delivering chunks to `on_data`. Starting twice is a no-op.
    fn start(&mut self, on_data: CaptureCallback) -> Result<(), CaptureError>;

    /// Stop delivering chunks. No callback runs after this returns.
    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

/// Capture from any byte reader producing raw PCM in a known format,
/// such as a pipe from `parec` or `arecord`
pub struct ReaderCapture {
    format: CaptureFormat,
    chunk_bytes: usize,
    reader: Option<Box<dyn Read + Send>>,
    running: Arc<AtomicBool>,
    /// Held for the duration of each callback
    delivering: Arc<Mutex<()>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl ReaderCapture {
    /// `chunk_frames` frames are read per callback
    pub fn new(reader: Box<dyn Read + Send>, format: CaptureFormat, chunk_frames: usize) -> Self {
        Self {
            format,
            chunk_bytes: chunk_frames.max(1) * format.bytes_per_frame(),
            reader: Some(reader),
            running: Arc::new(AtomicBool::new(false)),
            delivering: Arc::new(Mutex::new(())),
            thread_handle: None,
        }
    }

    /// Capture raw PCM from standard input
    pub fn stdin(format: CaptureFormat, chunk_frames: usize) -> Self {
        Self::new(Box::new(std::io::stdin()), format, chunk_frames)
    }
}

impl CaptureSource for ReaderCapture {
    fn format(&self) -> CaptureFormat {
        self.format
    }

    fn start(&mut self, mut on_data: CaptureCallback) -> Result<(), CaptureError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut reader = self
            .reader
            .take()
            .ok_or_else(|| CaptureError::StreamError("reader already consumed".to_string()))?;

        let running = self.running.clone();
        let delivering = self.delivering.clone();
        let chunk_bytes = self.chunk_bytes;
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("capture-reader".to_string())
            .spawn(move || {
                let mut chunk = vec![0u8; chunk_bytes];
                while running.load(Ordering::Relaxed) {
                    match reader.read_exact(&mut chunk) {
                        Ok(()) => {
                            let _delivery = delivering.lock();
                            if running.load(Ordering::SeqCst) {
                                on_data(&chunk);
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                            info!("Capture input reached end of stream");
                            break;
                        }
                        Err(e) => {
                            warn!("Capture read failed: {}", e);
                            break;
                        }
                    }
                }
                running.store(false, Ordering::SeqCst);
            })
            .map_err(|e| CaptureError::StreamError(e.to_string()))?;

        info!("Reader capture started - Format: {}", self.format);
        self.thread_handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // Wait out a callback in progress; later ones see `running` cleared
        drop(self.delivering.lock());
        if let Some(handle) = self.thread_handle.take() {
            // A read blocked on a pipe cannot be interrupted; leave it detached.
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                debug!("Capture reader still blocked in read, detaching");
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for ReaderCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
