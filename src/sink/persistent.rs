//! Shared-transport sink
//!
//! All devices are fed through one connection into a streaming server that
//! fans the PCM out to its enabled outputs. The connection is reference
//! counted by the set of connected devices: it opens with the first device
//! and closes when the last one disconnects.

use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{clamp_volume, OutputController, OutputSink, SendReport, VolumeDispatcher};
use crate::constants::DEFAULT_VOLUME;
use crate::device::{ConnectionState, DeviceHandle};
use crate::error::SinkError;

/// Where the shared stream is written
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `host:port` of a TCP listener
    Tcp(String),
    /// Named pipe or FIFO path
    Pipe(PathBuf),
}

impl FromStr for Endpoint {
    type Err = String;

    /// Accepts `tcp://host:port`, `fifo:///path`, `pipe:///path` or a bare `host:port`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(addr) = s.strip_prefix("tcp://") {
            return Ok(Endpoint::Tcp(addr.to_string()));
        }
        for prefix in ["fifo://", "pipe://"] {
            if let Some(path) = s.strip_prefix(prefix) {
                if path.is_empty() {
                    return Err(format!("empty pipe path in {}", s));
                }
                return Ok(Endpoint::Pipe(PathBuf::from(path)));
            }
        }
        if s.contains(':') && !s.contains('/') {
            return Ok(Endpoint::Tcp(s.to_string()));
        }
        Err(format!("unrecognized endpoint: {}", s))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            Endpoint::Pipe(path) => write!(f, "fifo://{}", path.display()),
        }
    }
}

/// Shared-transport settings
#[derive(Debug, Clone)]
pub struct PersistentSinkConfig {
    pub endpoint: Endpoint,
    pub connect_timeout: Duration,
    /// A stalled write fails after this long
    pub write_timeout: Duration,
    /// Minimum spacing between reopen attempts after a failure
    pub reopen_interval: Duration,
}

impl Default for PersistentSinkConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::Tcp("127.0.0.1:5555".to_string()),
            connect_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(2),
            reopen_interval: Duration::from_secs(1),
        }
    }
}

/// Granularity at which a stalled pipe write notices a close
#[cfg(unix)]
const PIPE_POLL_SLICE: Duration = Duration::from_millis(20);

/// Non-blocking FIFO writer with the same stall timeout as the TCP path.
/// A close from another thread interrupts a pending write.
#[cfg(unix)]
struct PipeWriter {
    file: std::fs::File,
    write_timeout: Duration,
    closed: Arc<AtomicBool>,
}

#[cfg(unix)]
impl PipeWriter {
    fn open(path: &std::path::Path, write_timeout: Duration, closed: Arc<AtomicBool>) -> std::io::Result<Self> {
        use std::os::unix::fs::OpenOptionsExt;

        // Fails with ENXIO instead of blocking when nothing reads the FIFO
        let file = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;
        Ok(Self {
            file,
            write_timeout,
            closed,
        })
    }

    fn wait_writable(&self, timeout: Duration) -> std::io::Result<()> {
        use std::os::unix::io::AsRawFd;

        let mut pollfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLOUT,
            revents: 0,
        };
        let millis = timeout.as_millis().clamp(1, i32::MAX as u128) as libc::c_int;
        // SAFETY: `pollfd` is a valid, exclusively borrowed array of length 1
        let rc = unsafe { libc::poll(&mut pollfd, 1, millis) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let deadline = Instant::now() + self.write_timeout;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "transport closed",
                ));
            }
            match self.file.write(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "pipe write stalled",
                        ));
                    }
                    self.wait_writable((deadline - now).min(PIPE_POLL_SLICE))?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

/// An open transport. The writer lock is held only by the sender; closing
/// goes through the `closed` flag and a separate socket handle so it can
/// interrupt a blocked write.
struct Connection {
    writer: Mutex<Box<dyn Write + Send>>,
    shutdown: Option<TcpStream>,
    closed: Arc<AtomicBool>,
}

impl Connection {
    fn open(config: &PersistentSinkConfig) -> Result<Self, SinkError> {
        let closed = Arc::new(AtomicBool::new(false));
        match &config.endpoint {
            Endpoint::Tcp(addr) => {
                let target = addr
                    .to_socket_addrs()
                    .map_err(|e| SinkError::TransportFailure(format!("{}: {}", addr, e)))?
                    .next()
                    .ok_or_else(|| SinkError::TransportFailure(format!("{}: no address", addr)))?;

                let socket = Socket::new(Domain::for_address(target), Type::STREAM, Some(Protocol::TCP))
                    .map_err(|e| SinkError::TransportFailure(e.to_string()))?;
                socket
                    .connect_timeout(&target.into(), config.connect_timeout)
                    .map_err(|e| match e.kind() {
                        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                            SinkError::Timeout(format!("connecting to {}", addr))
                        }
                        _ => SinkError::TransportFailure(format!("{}: {}", addr, e)),
                    })?;
                socket
                    .set_nodelay(true)
                    .map_err(|e| SinkError::TransportFailure(e.to_string()))?;
                socket
                    .set_write_timeout(Some(config.write_timeout))
                    .map_err(|e| SinkError::TransportFailure(e.to_string()))?;

                let stream: TcpStream = socket.into();
                let shutdown = stream
                    .try_clone()
                    .map_err(|e| SinkError::TransportFailure(e.to_string()))?;
                Ok(Self {
                    writer: Mutex::new(Box::new(stream)),
                    shutdown: Some(shutdown),
                    closed,
                })
            }
            Endpoint::Pipe(path) => {
                #[cfg(unix)]
                let writer: Box<dyn Write + Send> = Box::new(
                    PipeWriter::open(path, config.write_timeout, closed.clone())
                        .map_err(|e| SinkError::TransportFailure(format!("{}: {}", path.display(), e)))?,
                );
                #[cfg(not(unix))]
                let writer: Box<dyn Write + Send> = Box::new(
                    OpenOptions::new()
                        .write(true)
                        .open(path)
                        .map_err(|e| SinkError::TransportFailure(format!("{}: {}", path.display(), e)))?,
                );
                Ok(Self {
                    writer: Mutex::new(writer),
                    shutdown: None,
                    closed,
                })
            }
        }
    }

    fn write(&self, data: &[u8]) -> Result<(), SinkError> {
        let mut writer = self.writer.lock();
        writer
            .write_all(data)
            .and_then(|_| writer.flush())
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                    SinkError::Timeout("transport write stalled".to_string())
                }
                _ => SinkError::TransportFailure(e.to_string()),
            })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(stream) = &self.shutdown {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                debug!("Error closing transport: {}", e);
            }
        }
    }
}

/// What a send should write through
enum SendPath {
    Ready(Arc<Connection>),
    /// Reopen is held off until the reopen interval passes
    Backoff,
    /// No device holds a reference any more
    Released,
    Failed(SinkError),
}

/// Sink writing one stream into a shared streaming server
pub struct PersistentConnectionSink {
    config: PersistentSinkConfig,
    controller: Arc<dyn OutputController>,
    /// Devices holding a reference on the transport, keyed by id
    enabled: Mutex<HashMap<String, DeviceHandle>>,
    connection: Mutex<Option<Arc<Connection>>>,
    last_failure: Mutex<Option<Instant>>,
    volume: VolumeDispatcher,
    opens: AtomicU64,
    chunks_sent: AtomicUsize,
}

impl PersistentConnectionSink {
    pub fn new(config: PersistentSinkConfig, controller: Arc<dyn OutputController>) -> Self {
        let volume_controller = controller.clone();
        let volume = VolumeDispatcher::new(DEFAULT_VOLUME, move |level| {
            volume_controller.set_master_volume(level)
        });

        Self {
            config,
            controller,
            enabled: Mutex::new(HashMap::new()),
            connection: Mutex::new(None),
            last_failure: Mutex::new(None),
            volume,
            opens: AtomicU64::new(0),
            chunks_sent: AtomicUsize::new(0),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.config.endpoint
    }

    /// Times the transport has been opened
    pub fn open_count(&self) -> u64 {
        self.opens.load(Ordering::Relaxed)
    }

    pub fn is_transport_open(&self) -> bool {
        self.connection.lock().is_some()
    }

    /// Devices currently holding a reference on the transport
    pub fn reference_count(&self) -> usize {
        self.enabled.lock().len()
    }

    fn ensure_connection(&self) -> Result<Arc<Connection>, SinkError> {
        let mut slot = self.connection.lock();
        self.open_locked(&mut slot)
    }

    fn open_locked(&self, slot: &mut Option<Arc<Connection>>) -> Result<Arc<Connection>, SinkError> {
        if let Some(connection) = slot.as_ref() {
            return Ok(connection.clone());
        }

        info!("Opening transport to {}", self.config.endpoint);
        let connection = Arc::new(Connection::open(&self.config)?);
        self.opens.fetch_add(1, Ordering::Relaxed);
        *slot = Some(connection.clone());
        *self.last_failure.lock() = None;
        info!("Transport established");
        Ok(connection)
    }

    fn close_connection(&self) {
        if let Some(connection) = self.connection.lock().take() {
            connection.close();
            info!("Transport to {} closed", self.config.endpoint);
        }
    }

    /// Current connection, reopening it if the last failure is old enough.
    /// Reopens only while a device still holds a reference; the check runs
    /// under the connection lock so a concurrent release cannot be undone.
    fn connection_for_send(&self) -> SendPath {
        let mut slot = self.connection.lock();
        if let Some(connection) = slot.as_ref() {
            return SendPath::Ready(connection.clone());
        }
        if self.enabled.lock().is_empty() {
            return SendPath::Released;
        }
        if let Some(failed_at) = *self.last_failure.lock() {
            if failed_at.elapsed() < self.config.reopen_interval {
                return SendPath::Backoff;
            }
        }
        match self.open_locked(&mut slot) {
            Ok(connection) => SendPath::Ready(connection),
            Err(e) => SendPath::Failed(e),
        }
    }

    fn fail_transport(&self, targets: &[DeviceHandle], error: &SinkError) {
        error!("Error sending audio through shared transport: {}", error);
        for device in targets {
            device.mark_error(error.to_string());
        }
        self.close_connection();
        *self.last_failure.lock() = Some(Instant::now());
    }
}

impl OutputSink for PersistentConnectionSink {
    fn name(&self) -> &str {
        "persistent"
    }

    fn connect_device(&self, device: &DeviceHandle) -> Result<(), SinkError> {
        let info = device.info();
        if self.enabled.lock().contains_key(device.id()) && device.state().is_active() {
            warn!(device = %info.name, "Device is already connected");
            return Ok(());
        }

        info!(device = %info.name, output = ?info.output_id, "Enabling output");
        device.set_state(ConnectionState::Connecting);

        let result = self
            .controller
            .set_output_enabled(&info, true)
            .and_then(|_| self.controller.start_playback())
            .and_then(|_| self.ensure_connection());

        match result {
            Ok(_) => {
                self.enabled.lock().insert(device.id().to_string(), device.clone());
                device.set_state(ConnectionState::Connected);
                info!(device = %info.name, "Successfully enabled device");
                Ok(())
            }
            Err(e) => {
                device.mark_error(e.to_string());
                error!(device = %info.name, "Failed to connect to device: {}", e);
                Err(e)
            }
        }
    }

    fn disconnect_device(&self, device: &DeviceHandle) {
        let info = device.info();
        info!(device = %info.name, "Disabling output");

        if let Err(e) = self.controller.set_output_enabled(&info, false) {
            warn!(device = %info.name, "Failed to disable output: {}", e);
        }

        let any_enabled = {
            let mut enabled = self.enabled.lock();
            enabled.remove(device.id());
            !enabled.is_empty()
        };
        device.set_state(ConnectionState::Disconnected);

        if !any_enabled {
            self.close_connection();
        }
        info!(device = %info.name, "Disconnected from device");
    }

    fn send_to_all(&self, data: &[u8]) -> SendReport {
        let targets: Vec<DeviceHandle> = self
            .enabled
            .lock()
            .values()
            .filter(|d| d.is_enabled())
            .cloned()
            .collect();
        if targets.is_empty() {
            return SendReport::default();
        }

        let connection = match self.connection_for_send() {
            SendPath::Ready(connection) => connection,
            SendPath::Failed(e) => {
                self.fail_transport(&targets, &e);
                return SendReport { delivered: 0, failed: targets.len() };
            }
            SendPath::Backoff => return SendReport { delivered: 0, failed: targets.len() },
            SendPath::Released => return SendReport::default(),
        };

        if let Err(e) = connection.write(data) {
            if connection.is_closed() {
                debug!("Write interrupted by transport close");
                return SendReport::default();
            }
            self.fail_transport(&targets, &e);
            return SendReport { delivered: 0, failed: targets.len() };
        }

        for device in &targets {
            // A successful write after reopen reconnects dependents
            if device.state() == ConnectionState::Error {
                device.set_state(ConnectionState::Connected);
            }
            device.record_send();
        }

        let count = self.chunks_sent.fetch_add(1, Ordering::Relaxed) + 1;
        if count <= 5 {
            info!("Sent audio chunk #{} via transport: {} bytes", count, data.len());
        } else if count == 6 {
            info!("Audio streaming via transport normally (further chunk logs suppressed)");
        }

        SendReport { delivered: targets.len(), failed: 0 }
    }

    fn set_volume(&self, level: i32) {
        self.volume.set(clamp_volume(level));
    }

    fn volume(&self) -> u8 {
        self.volume.current()
    }

    fn stop_all(&self) {
        info!("Stopping all shared-transport outputs");

        let devices: Vec<DeviceHandle> = self.enabled.lock().drain().map(|(_, d)| d).collect();

        // Close first so a write blocked in the pacing loop returns
        self.close_connection();
        self.chunks_sent.store(0, Ordering::Relaxed);

        for device in &devices {
            device.set_state(ConnectionState::Disconnected);
        }
        if devices.is_empty() {
            return;
        }

        // The controller may be slow; disable outputs off the caller's thread
        let controller = self.controller.clone();
        let spawned = thread::Builder::new()
            .name("disable-outputs".to_string())
            .spawn(move || {
                for device in devices {
                    let info = device.info();
                    if let Err(e) = controller.set_output_enabled(&info, false) {
                        warn!(device = %info.name, "Failed to disable output: {}", e);
                    }
                }
            });
        if let Err(e) = spawned {
            warn!("Failed to spawn output teardown: {}", e);
        }
    }
}

impl Drop for PersistentConnectionSink {
    fn drop(&mut self) {
        self.close_connection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceInfo};
    use crate::sink::PassiveController;
    use std::io::Read;
    use std::net::TcpListener;

    #[derive(Default)]
    struct RecordingController {
        toggles: Mutex<Vec<(String, bool)>>,
        fail_enable: Mutex<bool>,
    }

    impl OutputController for RecordingController {
        fn set_output_enabled(&self, device: &DeviceInfo, enabled: bool) -> Result<(), SinkError> {
            if enabled && *self.fail_enable.lock() {
                return Err(SinkError::Controller("output unknown".into()));
            }
            self.toggles.lock().push((device.id.clone(), enabled));
            Ok(())
        }

        fn set_master_volume(&self, _level: u8) -> Result<(), SinkError> {
            Ok(())
        }
    }

    fn listener() -> (TcpListener, PersistentSinkConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = PersistentSinkConfig {
            endpoint: Endpoint::Tcp(listener.local_addr().unwrap().to_string()),
            reopen_interval: Duration::from_millis(0),
            ..Default::default()
        };
        (listener, config)
    }

    fn device(id: &str) -> DeviceHandle {
        let device = Device::handle(DeviceInfo::new(id, id).with_output_id(id));
        device.set_enabled(true);
        device
    }

    #[test]
    fn test_endpoint_parsing() {
        assert_eq!(
            "tcp://127.0.0.1:5555".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("127.0.0.1:5555".into())
        );
        assert_eq!(
            "fifo:///tmp/pcm".parse::<Endpoint>().unwrap(),
            Endpoint::Pipe(PathBuf::from("/tmp/pcm"))
        );
        assert_eq!("localhost:9".parse::<Endpoint>().unwrap(), Endpoint::Tcp("localhost:9".into()));
        assert!("nonsense".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_transport_reference_counting() {
        let (listener, config) = listener();
        let controller = Arc::new(RecordingController::default());
        let sink = PersistentConnectionSink::new(config, controller.clone());
        let a = device("a");
        let b = device("b");

        sink.connect_device(&a).unwrap();
        sink.connect_device(&b).unwrap();
        assert_eq!(sink.open_count(), 1);
        assert_eq!(sink.reference_count(), 2);

        sink.disconnect_device(&a);
        assert!(sink.is_transport_open());
        assert_eq!(a.state(), ConnectionState::Disconnected);

        sink.disconnect_device(&b);
        assert!(!sink.is_transport_open());

        sink.connect_device(&a).unwrap();
        assert_eq!(a.state(), ConnectionState::Connected);
        assert_eq!(sink.open_count(), 2);

        // Repeat connect of a connected device is a no-op
        sink.connect_device(&a).unwrap();
        assert_eq!(sink.open_count(), 2);
        drop(listener);
    }

    #[test]
    fn test_send_reaches_listener() {
        let (listener, config) = listener();
        let sink = PersistentConnectionSink::new(config, Arc::new(RecordingController::default()));
        let a = device("a");
        sink.connect_device(&a).unwrap();

        let (mut server, _) = listener.accept().unwrap();
        let report = sink.send_to_all(&[1, 2, 3, 4]);
        assert_eq!(report, SendReport { delivered: 1, failed: 0 });
        assert_eq!(a.state(), ConnectionState::Streaming);

        let mut received = [0u8; 4];
        server.read_exact(&mut received).unwrap();
        assert_eq!(received, [1, 2, 3, 4]);
    }

    #[test]
    fn test_controller_failure_marks_error() {
        let (_listener, config) = listener();
        let controller = Arc::new(RecordingController::default());
        *controller.fail_enable.lock() = true;
        let sink = PersistentConnectionSink::new(config, controller);
        let a = device("a");

        assert!(sink.connect_device(&a).is_err());
        assert_eq!(a.state(), ConnectionState::Error);
        assert!(a.error_message().unwrap().contains("output unknown"));
        assert_eq!(sink.reference_count(), 0);
    }

    #[test]
    fn test_unreachable_transport_fails_connect() {
        let (listener, config) = listener();
        drop(listener);
        let sink = PersistentConnectionSink::new(config, Arc::new(PassiveController));
        let a = device("a");

        assert!(sink.connect_device(&a).is_err());
        assert_eq!(a.state(), ConnectionState::Error);
    }

    #[test]
    fn test_transport_failure_marks_all_dependents_and_reopens() {
        let (listener, config) = listener();
        let sink = PersistentConnectionSink::new(config, Arc::new(PassiveController));
        let a = device("a");
        let b = device("b");
        sink.connect_device(&a).unwrap();
        sink.connect_device(&b).unwrap();
        let (server, _) = listener.accept().unwrap();

        // Peer goes away; writes eventually fail with a reset
        drop(server);
        let mut failed = false;
        for _ in 0..50 {
            if sink.send_to_all(&[0u8; 4096]).failed > 0 {
                failed = true;
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(failed);
        assert_eq!(a.state(), ConnectionState::Error);
        assert_eq!(b.state(), ConnectionState::Error);
        assert!(!sink.is_transport_open());

        // Next send reopens cleanly and restores dependents
        let report = sink.send_to_all(&[0u8; 4]);
        assert_eq!(report.delivered, 2);
        assert_eq!(a.state(), ConnectionState::Streaming);
        assert_eq!(sink.open_count(), 2);
    }

    #[test]
    fn test_stop_all_is_idempotent() {
        let (_listener, config) = listener();
        let controller = Arc::new(RecordingController::default());
        let sink = PersistentConnectionSink::new(config, controller);
        let a = device("a");
        sink.connect_device(&a).unwrap();

        sink.stop_all();
        sink.stop_all();
        assert_eq!(a.state(), ConnectionState::Disconnected);
        assert!(!sink.is_transport_open());
        assert_eq!(sink.send_to_all(&[0u8; 4]), SendReport::default());
    }

    #[test]
    fn test_released_transport_is_not_reopened() {
        let (_listener, config) = listener();
        let sink = PersistentConnectionSink::new(config, Arc::new(PassiveController));
        let a = device("a");
        sink.connect_device(&a).unwrap();

        // A send that picked up the connection just before the release
        let SendPath::Ready(connection) = sink.connection_for_send() else {
            panic!("transport should be open");
        };
        sink.stop_all();
        assert!(connection.is_closed());
        assert!(connection.write(&[0u8; 4]).is_err());

        assert!(matches!(sink.connection_for_send(), SendPath::Released));
        assert!(!sink.is_transport_open());
        assert_eq!(sink.open_count(), 1);
        assert_eq!(a.state(), ConnectionState::Disconnected);
    }

    #[cfg(unix)]
    mod fifo {
        use super::*;
        use std::ffi::CString;
        use std::fs::File;
        use std::os::unix::ffi::OsStrExt;
        use std::os::unix::fs::OpenOptionsExt;
        use std::path::Path;

        fn make_fifo(dir: &Path) -> PathBuf {
            let path = dir.join("pcm");
            let c_path = CString::new(path.as_os_str().as_bytes()).unwrap();
            assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) }, 0);
            path
        }

        /// Reader end that is open but never read
        fn idle_reader(path: &Path) -> File {
            OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(path)
                .unwrap()
        }

        fn fifo_sink(path: &Path, write_timeout: Duration) -> Arc<PersistentConnectionSink> {
            let config = PersistentSinkConfig {
                endpoint: Endpoint::Pipe(path.to_path_buf()),
                write_timeout,
                reopen_interval: Duration::from_millis(0),
                ..Default::default()
            };
            Arc::new(PersistentConnectionSink::new(config, Arc::new(PassiveController)))
        }

        #[test]
        fn test_stop_all_interrupts_stalled_pipe_write() {
            let dir = tempfile::tempdir().unwrap();
            let path = make_fifo(dir.path());
            let _reader = idle_reader(&path);
            let sink = fifo_sink(&path, Duration::from_secs(30));
            let a = device("a");
            sink.connect_device(&a).unwrap();

            let writer = {
                let sink = sink.clone();
                thread::spawn(move || sink.send_to_all(&vec![0u8; 1 << 20]))
            };
            thread::sleep(Duration::from_millis(100));
            assert!(!writer.is_finished());

            sink.stop_all();
            let deadline = Instant::now() + Duration::from_secs(2);
            while !writer.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            assert!(writer.is_finished(), "pipe write survived stop_all");
            assert_eq!(writer.join().unwrap(), SendReport::default());
            assert_eq!(a.state(), ConnectionState::Disconnected);
        }

        #[test]
        fn test_stalled_pipe_write_times_out() {
            let dir = tempfile::tempdir().unwrap();
            let path = make_fifo(dir.path());
            let _reader = idle_reader(&path);
            let sink = fifo_sink(&path, Duration::from_millis(100));
            let a = device("a");
            sink.connect_device(&a).unwrap();

            let report = sink.send_to_all(&vec![0u8; 1 << 20]);
            assert_eq!(report, SendReport { delivered: 0, failed: 1 });
            assert_eq!(a.state(), ConnectionState::Error);
            assert!(!sink.is_transport_open());
        }

        #[test]
        fn test_pipe_without_reader_fails_connect() {
            let dir = tempfile::tempdir().unwrap();
            let path = make_fifo(dir.path());
            let sink = fifo_sink(&path, Duration::from_secs(1));
            let a = device("a");

            assert!(sink.connect_device(&a).is_err());
            assert_eq!(a.state(), ConnectionState::Error);
        }
    }

    #[test]
    fn test_volume_is_clamped() {
        let (_listener, config) = listener();
        let sink = PersistentConnectionSink::new(config, Arc::new(PassiveController));
        sink.set_volume(140);
        assert_eq!(sink.volume(), 100);
        sink.set_volume(-3);
        assert_eq!(sink.volume(), 0);
    }
}
