//! End-to-end pipeline tests: capture → encoder → jitter buffer → pacing → sink

use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use airplay_streamer::audio::{CaptureCallback, CaptureFormat, CaptureSource, ReaderCapture};
use airplay_streamer::codec::PcmEncoder;
use airplay_streamer::config::PipelineConfig;
use airplay_streamer::device::{ConnectionState, DeviceHandle, DeviceInfo};
use airplay_streamer::discovery::StaticDiscovery;
use airplay_streamer::error::{CaptureError, SinkError};
use airplay_streamer::session::StreamingSession;
use airplay_streamer::sink::{MemorySink, OutputSink, SendReport};

fn float_sine(frames: usize, channels: usize, rate: f32, offset: usize) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(frames * channels * 4);
    for i in 0..frames {
        let t = (offset + i) as f32 / rate;
        let sample = (t * 2.0 * std::f32::consts::PI * 1000.0).sin() * 0.5;
        for _ in 0..channels {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
    }
    bytes
}

fn session_with(sink: Arc<dyn OutputSink>, ids: &[&str]) -> StreamingSession {
    let session = StreamingSession::new(sink, PipelineConfig::default(), None);
    let devices = ids
        .iter()
        .map(|id| DeviceInfo::new(*id, *id).with_address("127.0.0.1"))
        .collect();
    session.refresh_devices(&StaticDiscovery::new(devices)).unwrap();
    for id in ids {
        session.toggle_device(id, true).unwrap();
    }
    session
}

/// Reader that releases one chunk per `interval`, like a live device
struct PacedReader {
    inner: Cursor<Vec<u8>>,
    interval: Duration,
}

impl Read for PacedReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        thread::sleep(self.interval);
        self.inner.read(buf)
    }
}

#[test]
fn test_48k_chunks_convert_to_target_rate() {
    let mut encoder = PcmEncoder::new();
    encoder.initialize(CaptureFormat::float32(48_000, 2)).unwrap();

    // 1920 bytes: 240 stereo float frames (5 ms)
    let small = encoder.encode(&float_sine(240, 2, 48_000.0, 0)).unwrap();
    assert_eq!(small.len() % 4, 0);
    assert!((small.len() as i64 - 882).abs() <= 8, "got {} bytes", small.len());

    // 20 ms: 960 frames -> ~882 output frames, 1764 int16 samples
    let chunk = encoder.encode(&float_sine(960, 2, 48_000.0, 240)).unwrap();
    assert_eq!(chunk.len() % 4, 0);
    assert!((chunk.len() as i64 - 3528).abs() <= 8, "got {} bytes", chunk.len());
}

#[test]
fn test_session_streams_at_constant_rate() {
    let sink = Arc::new(MemorySink::new());
    let session = session_with(sink.clone(), &["a", "b"]);

    let format = CaptureFormat::float32(48_000, 2);
    let audio = float_sine(480 * 100, 2, 48_000.0, 0);
    let reader = PacedReader {
        inner: Cursor::new(audio),
        interval: Duration::from_millis(10),
    };
    let capture = ReaderCapture::new(Box::new(reader), format, 480);

    let start = Instant::now();
    session.start(Box::new(capture)).unwrap();
    thread::sleep(Duration::from_millis(400));
    let stats = session.stop().unwrap();
    let elapsed_ms = start.elapsed().as_millis() as u64;

    let a = sink.received("a");
    assert_eq!(a, sink.received("b"));
    assert_eq!(a.len() % 4, 0);
    assert_eq!(a.len() as u64, stats.total_bytes());
    assert!(stats.frames_sent > 0);
    assert!(a.iter().any(|&b| b != 0));

    // At most a frame or two ahead of the clock; silence covers the rest
    assert!(a.len() as u64 <= elapsed_ms * 176_400 / 1000 + 2 * 1764);
    assert!(a.len() as u64 >= 350 * 176_400 / 1000);

    assert!(session.buffer().is_empty());
    assert_eq!(
        session.manager().get("a").unwrap().state(),
        ConnectionState::Disconnected
    );
}

#[test]
fn test_failing_device_does_not_stop_stream() {
    let sink = Arc::new(MemorySink::new());
    let session = session_with(sink.clone(), &["a", "b", "c"]);
    sink.fail_device("c");

    let format = CaptureFormat::float32(44_100, 2);
    let capture = ReaderCapture::new(Box::new(Cursor::new(vec![0u8; 0])), format, 441);
    session.start(Box::new(capture)).unwrap();
    thread::sleep(Duration::from_millis(100));

    let manager = session.manager();
    assert_eq!(manager.get("c").unwrap().state(), ConnectionState::Error);
    assert_eq!(manager.get("a").unwrap().state(), ConnectionState::Streaming);
    let before = sink.received_len("a");
    thread::sleep(Duration::from_millis(50));
    assert!(sink.received_len("a") > before);

    session.stop();
    assert_eq!(sink.received_len("c"), 0);
}

/// Sink whose writes block until `stop_all`, like a stalled socket
struct StallingSink {
    inner: MemorySink,
    closed: Mutex<bool>,
    unblocked: Condvar,
    events: Arc<Mutex<Vec<&'static str>>>,
}

impl OutputSink for StallingSink {
    fn name(&self) -> &str {
        "stalling"
    }

    fn connect_device(&self, device: &DeviceHandle) -> Result<(), SinkError> {
        self.inner.connect_device(device)
    }

    fn disconnect_device(&self, device: &DeviceHandle) {
        self.inner.disconnect_device(device)
    }

    fn send_to_all(&self, data: &[u8]) -> SendReport {
        let report = self.inner.send_to_all(data);
        let mut closed = self.closed.lock();
        while !*closed {
            self.unblocked.wait(&mut closed);
        }
        report
    }

    fn set_volume(&self, level: i32) {
        self.inner.set_volume(level)
    }

    fn volume(&self) -> u8 {
        self.inner.volume()
    }

    fn stop_all(&self) {
        self.events.lock().push("sink.stop_all");
        *self.closed.lock() = true;
        self.unblocked.notify_all();
        self.inner.stop_all();
    }
}

/// Capture that emits a float chunk every 10 ms and records its stop
struct TickingCapture {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    events: Arc<Mutex<Vec<&'static str>>>,
}

impl CaptureSource for TickingCapture {
    fn format(&self) -> CaptureFormat {
        CaptureFormat::float32(48_000, 2)
    }

    fn start(&mut self, mut on_data: CaptureCallback) -> Result<(), CaptureError> {
        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        self.handle = Some(thread::spawn(move || {
            let mut offset = 0;
            while running.load(Ordering::SeqCst) {
                on_data(&float_sine(480, 2, 48_000.0, offset));
                offset += 480;
                thread::sleep(Duration::from_millis(10));
            }
        }));
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.events.lock().push("capture.stop");
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[test]
fn test_stop_closes_sink_before_joining_pacing() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::new(StallingSink {
        inner: MemorySink::new(),
        closed: Mutex::new(false),
        unblocked: Condvar::new(),
        events: events.clone(),
    });
    let session = session_with(sink.clone(), &["a"]);

    let capture = TickingCapture {
        running: Arc::new(AtomicBool::new(false)),
        handle: None,
        events: events.clone(),
    };
    session.start(Box::new(capture)).unwrap();
    // The pacing loop is now parked inside a write
    thread::sleep(Duration::from_millis(100));

    let start = Instant::now();
    assert!(session.stop().is_some());
    assert!(
        start.elapsed() < Duration::from_secs(1),
        "stop waited {:?}",
        start.elapsed()
    );

    assert_eq!(*events.lock(), vec!["capture.stop", "sink.stop_all"]);
    assert!(session.buffer().is_empty());
    assert!(!session.is_streaming());
}
