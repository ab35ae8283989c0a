//! Constant-bitrate pacing loop
//!
//! Receivers expect an unbroken stream at exactly the output byte rate. The
//! loop forwards whatever the jitter buffer yields and, whenever the running
//! total falls behind wall-clock time, pads the gap with silence. Bytes are
//! only ever sent to reach the expected total, never to exceed it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::audio::buffer::{CancelToken, Dequeued, JitterBuffer};
use crate::constants::{DEQUEUE_TIMEOUT_MS, OUTPUT_BYTES_PER_SECOND, OUTPUT_FRAME_BYTES};
use crate::sink::OutputSink;

/// Frames logged at info before switching to trace
const LOGGED_FRAMES: u64 = 3;

/// Bytes of silence owed after `elapsed_ms`, rounded down to whole frames
pub fn silence_deficit(elapsed_ms: u64, total_sent: u64, bytes_per_second: u64, frame_bytes: u64) -> u64 {
    let expected = elapsed_ms.saturating_mul(bytes_per_second) / 1000;
    let deficit = expected.saturating_sub(total_sent);
    deficit - deficit % frame_bytes.max(1)
}

/// Monotonic clock plus a running count of emitted bytes
#[derive(Debug)]
pub struct PacingClock {
    start: Instant,
    bytes_per_second: u64,
    frame_bytes: u64,
    total_sent: u64,
}

impl PacingClock {
    pub fn start(bytes_per_second: u64, frame_bytes: u64) -> Self {
        Self {
            start: Instant::now(),
            bytes_per_second,
            frame_bytes,
            total_sent: 0,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn record(&mut self, bytes: usize) {
        self.total_sent += bytes as u64;
    }

    pub fn total_sent(&self) -> u64 {
        self.total_sent
    }

    /// Silence needed right now to catch up with the clock
    pub fn deficit(&self) -> u64 {
        silence_deficit(self.elapsed_ms(), self.total_sent, self.bytes_per_second, self.frame_bytes)
    }
}

/// Pacing loop settings
#[derive(Debug, Clone)]
pub struct PacingConfig {
    /// Upper bound on one wait for audio; also bounds exit latency
    pub dequeue_timeout: Duration,
    pub bytes_per_second: u64,
    /// Silence is emitted in multiples of this
    pub frame_bytes: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            dequeue_timeout: Duration::from_millis(DEQUEUE_TIMEOUT_MS),
            bytes_per_second: OUTPUT_BYTES_PER_SECOND,
            frame_bytes: OUTPUT_FRAME_BYTES,
        }
    }
}

/// Counters updated by the loop
#[derive(Debug, Default)]
pub struct PacingStats {
    frames_sent: AtomicU64,
    audio_bytes: AtomicU64,
    silence_bytes: AtomicU64,
    silence_fills: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PacingSnapshot {
    pub frames_sent: u64,
    pub audio_bytes: u64,
    pub silence_bytes: u64,
    pub silence_fills: u64,
}

impl PacingSnapshot {
    pub fn total_bytes(&self) -> u64 {
        self.audio_bytes + self.silence_bytes
    }
}

impl PacingStats {
    pub fn snapshot(&self) -> PacingSnapshot {
        PacingSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            audio_bytes: self.audio_bytes.load(Ordering::Relaxed),
            silence_bytes: self.silence_bytes.load(Ordering::Relaxed),
            silence_fills: self.silence_fills.load(Ordering::Relaxed),
        }
    }
}

/// Background loop draining the jitter buffer into a sink
pub struct PacingTransport {
    buffer: Arc<JitterBuffer>,
    sink: Arc<dyn OutputSink>,
    cancel: CancelToken,
    config: PacingConfig,
    stats: Arc<PacingStats>,
}

impl PacingTransport {
    pub fn new(
        buffer: Arc<JitterBuffer>,
        sink: Arc<dyn OutputSink>,
        cancel: CancelToken,
        config: PacingConfig,
    ) -> Self {
        Self {
            buffer,
            sink,
            cancel,
            config,
            stats: Arc::new(PacingStats::default()),
        }
    }

    /// Run the loop on a dedicated thread
    pub fn spawn(self) -> std::io::Result<PacingHandle> {
        let stats = self.stats.clone();
        let handle = thread::Builder::new()
            .name("pacing".to_string())
            .spawn(move || self.run())?;
        Ok(PacingHandle {
            handle: Some(handle),
            stats,
        })
    }

    /// Run until cancelled. Cancellation is a normal exit.
    pub fn run(self) {
        info!(
            "Pacing loop started: {} bytes/s, {:?} dequeue timeout",
            self.config.bytes_per_second, self.config.dequeue_timeout
        );

        let mut clock = PacingClock::start(self.config.bytes_per_second, self.config.frame_bytes);
        let mut silence: Vec<u8> = Vec::new();

        loop {
            match self.buffer.dequeue_timeout(self.config.dequeue_timeout, &self.cancel) {
                Dequeued::Frame(frame) => {
                    self.sink.send_to_all(&frame);
                    clock.record(frame.len());

                    let n = self.stats.frames_sent.fetch_add(1, Ordering::Relaxed) + 1;
                    self.stats.audio_bytes.fetch_add(frame.len() as u64, Ordering::Relaxed);
                    if n <= LOGGED_FRAMES {
                        info!("Sent audio frame #{}: {} bytes", n, frame.len());
                    } else if n == LOGGED_FRAMES + 1 {
                        info!("Audio frames flowing normally (further frame logs at trace)");
                    } else {
                        trace!("Sent audio frame #{}: {} bytes", n, frame.len());
                    }
                }
                Dequeued::TimedOut => {}
                Dequeued::Cancelled => break,
            }

            if self.cancel.is_cancelled() {
                break;
            }

            let deficit = clock.deficit() as usize;
            if deficit > 0 {
                if silence.len() < deficit {
                    silence.resize(deficit, 0);
                }
                self.sink.send_to_all(&silence[..deficit]);
                clock.record(deficit);
                self.stats.silence_bytes.fetch_add(deficit as u64, Ordering::Relaxed);
                self.stats.silence_fills.fetch_add(1, Ordering::Relaxed);
                trace!("Filled {} bytes of silence", deficit);
            }
        }

        let snapshot = self.stats.snapshot();
        info!(
            frames = snapshot.frames_sent,
            audio_bytes = snapshot.audio_bytes,
            silence_bytes = snapshot.silence_bytes,
            "Pacing loop stopped after {} ms",
            clock.elapsed_ms()
        );
    }
}

/// Handle to a running pacing thread
pub struct PacingHandle {
    handle: Option<JoinHandle<()>>,
    stats: Arc<PacingStats>,
}

impl PacingHandle {
    pub fn stats(&self) -> PacingSnapshot {
        self.stats.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Wait up to `timeout` for the loop to exit.
    ///
    /// Returns false if it is still running; the thread is then left
    /// detached.
    pub fn join(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };

        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("Pacing loop did not stop within {:?}", timeout);
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }

        if handle.join().is_err() {
            warn!("Pacing loop panicked");
        }
        debug!("Pacing loop joined");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::cancellation;
    use crate::device::{Device, DeviceHandle, DeviceInfo};
    use crate::sink::MemorySink;

    fn memory_sink() -> (Arc<MemorySink>, DeviceHandle) {
        let sink = Arc::new(MemorySink::new());
        let device = Device::handle(DeviceInfo::new("a", "A").with_address("h"));
        device.set_enabled(true);
        sink.connect_device(&device).unwrap();
        (sink, device)
    }

    #[test]
    fn test_silence_deficit_rounds_to_frames() {
        assert_eq!(silence_deficit(0, 0, 176_400, 4), 0);
        assert_eq!(silence_deficit(10, 0, 176_400, 4), 1764);
        // 1 ms = 176.4 bytes -> 176
        assert_eq!(silence_deficit(1, 0, 176_400, 4), 176);
        assert_eq!(silence_deficit(10, 1000, 176_400, 4), 764);
        // 3 ms = 529.2 -> 529 expected, 529 - 100 = 429 -> 428
        assert_eq!(silence_deficit(3, 100, 176_400, 4), 428);
    }

    #[test]
    fn test_no_surplus_ever_sent() {
        assert_eq!(silence_deficit(10, 1764, 176_400, 4), 0);
        assert_eq!(silence_deficit(10, 5000, 176_400, 4), 0);
    }

    #[test]
    fn test_silence_only_stream_holds_rate() {
        let (sink, _device) = memory_sink();
        let buffer = Arc::new(JitterBuffer::new(50));
        let (cancel, token) = cancellation();

        let start = Instant::now();
        let mut handle =
            PacingTransport::new(buffer, sink.clone(), token, PacingConfig::default())
                .spawn()
                .unwrap();
        thread::sleep(Duration::from_millis(300));
        cancel.cancel();
        assert!(handle.join(Duration::from_secs(1)));
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let received = sink.received("a");
        let stats = handle.stats();
        assert_eq!(received.len() as u64, stats.total_bytes());
        assert_eq!(stats.audio_bytes, 0);
        assert!(received.iter().all(|&b| b == 0));
        assert_eq!(received.len() % 4, 0);

        let upper = elapsed_ms * 176_400 / 1000;
        let lower = 280 * 176_400 / 1000;
        assert!(received.len() as u64 <= upper, "{} > {}", received.len(), upper);
        assert!(received.len() as u64 >= lower, "{} < {}", received.len(), lower);
    }

    #[test]
    fn test_real_audio_forwarded_in_order() {
        let (sink, _device) = memory_sink();
        let buffer = Arc::new(JitterBuffer::new(50));
        let (cancel, token) = cancellation();

        // 8000 bytes is ~45 ms of stream, so no silence is owed between them
        buffer.enqueue(&[1u8; 8000]);
        buffer.enqueue(&[2u8; 8000]);

        let mut handle =
            PacingTransport::new(buffer, sink.clone(), token, PacingConfig::default())
                .spawn()
                .unwrap();
        thread::sleep(Duration::from_millis(50));
        cancel.cancel();
        assert!(handle.join(Duration::from_secs(1)));

        let received = sink.received("a");
        assert_eq!(&received[..8000], &[1u8; 8000][..]);
        assert_eq!(&received[8000..16000], &[2u8; 8000][..]);
        assert_eq!(handle.stats().frames_sent, 2);
    }

    #[test]
    fn test_cancel_exits_within_a_tick() {
        let (sink, _device) = memory_sink();
        let buffer = Arc::new(JitterBuffer::new(50));
        let (cancel, token) = cancellation();
        let config = PacingConfig {
            dequeue_timeout: Duration::from_secs(10),
            ..Default::default()
        };

        let mut handle = PacingTransport::new(buffer, sink, token, config).spawn().unwrap();
        thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        cancel.cancel();
        assert!(handle.join(Duration::from_secs(1)));
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
