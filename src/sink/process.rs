//! Per-device player processes
//!
//! Each connected device gets its own player subprocess that reads the PCM
//! stream on stdin. Processes are independent: one dying marks only its own
//! device as failed.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{clamp_volume, OutputSink, SendReport};
use crate::constants::{DEFAULT_STARTUP_GRACE_MS, DEFAULT_VOLUME, PLAYER_QUEUE_CHUNKS};
use crate::device::{ConnectionState, DeviceHandle, DeviceInfo};
use crate::error::SinkError;

/// How player processes are launched.
///
/// `args` may contain `{address}`, `{port}`, `{name}` and `{volume}`, which
/// are substituted per device at spawn time.
#[derive(Debug, Clone)]
pub struct ProcessSinkConfig {
    pub program: String,
    pub args: Vec<String>,
    /// A process that exits within this window counts as a failed connect
    pub startup_grace: Duration,
}

impl Default for ProcessSinkConfig {
    fn default() -> Self {
        Self {
            program: "raop_play".to_string(),
            args: ["-v", "{volume}", "-e", "{address}", "-"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            startup_grace: Duration::from_millis(DEFAULT_STARTUP_GRACE_MS),
        }
    }
}

impl ProcessSinkConfig {
    fn render_args(&self, info: &DeviceInfo, volume: u8) -> Result<Vec<String>, SinkError> {
        let uses_address = self.args.iter().any(|a| a.contains("{address}"));
        let address = match info.address.as_deref() {
            Some(a) if !a.is_empty() => a,
            _ if uses_address => return Err(SinkError::MissingAddress(info.name.clone())),
            _ => "",
        };
        let port = info.port.map(|p| p.to_string()).unwrap_or_default();
        let volume = volume.to_string();

        Ok(self
            .args
            .iter()
            .map(|arg| {
                arg.replace("{address}", address)
                    .replace("{port}", &port)
                    .replace("{name}", &info.name)
                    .replace("{volume}", &volume)
            })
            .collect())
    }
}

struct DeviceProcess {
    device: DeviceHandle,
    child: Mutex<Child>,
    /// Chunks waiting for the stdin writer; `None` once terminated
    queue: Mutex<Option<Sender<Bytes>>>,
    /// Set by the stdin writer when the pipe breaks
    write_error: Arc<Mutex<Option<String>>>,
    last_send: Arc<Mutex<DateTime<Utc>>>,
}

impl DeviceProcess {
    fn has_exited(&self) -> bool {
        match self.child.lock().try_wait() {
            Ok(Some(status)) => {
                debug!(device = %self.device.id(), "Player exited with {}", status);
                true
            }
            Ok(None) => false,
            Err(_) => true,
        }
    }

    /// Queue a chunk for the player. Never blocks: a player that stops
    /// reading fills its queue and fails here instead of stalling the caller.
    fn write(&self, data: &[u8]) -> Result<(), SinkError> {
        if let Some(reason) = self.write_error.lock().clone() {
            return Err(SinkError::TransportFailure(reason));
        }
        let queue = self.queue.lock();
        let tx = queue
            .as_ref()
            .ok_or_else(|| SinkError::ProcessExited(self.device.name()))?;
        match tx.try_send(Bytes::copy_from_slice(data)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SinkError::Timeout(format!(
                "player for {} stopped reading",
                self.device.name()
            ))),
            Err(TrySendError::Disconnected(_)) => Err(match self.write_error.lock().clone() {
                Some(reason) => SinkError::TransportFailure(reason),
                None => SinkError::ProcessExited(self.device.name()),
            }),
        }
    }

    fn terminate(&self) {
        // Dropping the queue ends the writer once it drains; the kill below
        // breaks a write the player is no longer reading.
        self.queue.lock().take();
        let mut child = self.child.lock();
        if let Err(e) = child.kill() {
            debug!(device = %self.device.id(), "Kill failed: {}", e);
        }
        if let Err(e) = child.wait() {
            warn!(device = %self.device.name(), "Error reaping player process: {}", e);
        }
    }
}

/// Copy queued chunks into a player's stdin until the queue closes or the pipe breaks
fn feed_stdin(
    device: String,
    mut stdin: ChildStdin,
    rx: Receiver<Bytes>,
    write_error: Arc<Mutex<Option<String>>>,
    last_send: Arc<Mutex<DateTime<Utc>>>,
) {
    for chunk in rx {
        if let Err(e) = stdin.write_all(&chunk).and_then(|_| stdin.flush()) {
            debug!(device = %device, "Player stdin closed: {}", e);
            *write_error.lock() = Some(e.to_string());
            return;
        }
        *last_send.lock() = Utc::now();
    }
}

/// Sink running one player process per device
pub struct PerDeviceProcessSink {
    config: ProcessSinkConfig,
    processes: Mutex<HashMap<String, Arc<DeviceProcess>>>,
    volume: AtomicU8,
}

impl PerDeviceProcessSink {
    pub fn new(config: ProcessSinkConfig) -> Self {
        Self {
            config,
            processes: Mutex::new(HashMap::new()),
            volume: AtomicU8::new(DEFAULT_VOLUME),
        }
    }

    pub fn process_count(&self) -> usize {
        self.processes.lock().len()
    }

    /// When `id` last accepted a write
    pub fn last_send(&self, id: &str) -> Option<DateTime<Utc>> {
        let process = self.processes.lock().get(id).cloned()?;
        let last = *process.last_send.lock();
        Some(last)
    }

    fn spawn(&self, device: &DeviceHandle) -> Result<Arc<DeviceProcess>, SinkError> {
        let info = device.info();
        let args = self.config.render_args(&info, self.volume())?;
        info!(device = %info.name, "Starting {} {:?}", self.config.program, args);

        let mut child = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SinkError::Spawn {
                device: info.name.clone(),
                source,
            })?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(&info.name, stdout, false);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(&info.name, stderr, true);
        }

        let (tx, rx) = bounded(PLAYER_QUEUE_CHUNKS);
        let write_error = Arc::new(Mutex::new(None));
        let last_send = Arc::new(Mutex::new(Utc::now()));
        if let Some(stdin) = child.stdin.take() {
            let device = info.name.clone();
            let write_error = write_error.clone();
            let last_send = last_send.clone();
            let spawned = thread::Builder::new()
                .name("player-stdin".to_string())
                .spawn(move || feed_stdin(device, stdin, rx, write_error, last_send));
            if let Err(e) = spawned {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SinkError::Spawn {
                    device: info.name.clone(),
                    source: e,
                });
            }
        }

        Ok(Arc::new(DeviceProcess {
            device: device.clone(),
            child: Mutex::new(child),
            queue: Mutex::new(Some(tx)),
            write_error,
            last_send,
        }))
    }
}

/// Relay a player's output stream into the log, line by line
fn forward_output<R: Read + Send + 'static>(device: &str, stream: R, is_stderr: bool) {
    let device = device.to_string();
    let spawned = thread::Builder::new()
        .name(format!("player-{}", if is_stderr { "stderr" } else { "stdout" }))
        .spawn(move || {
            for line in BufReader::new(stream).lines() {
                match line {
                    Ok(line) if line.is_empty() => {}
                    Ok(line) if is_stderr => warn!("[{}] {}", device, line),
                    Ok(line) => info!("[{}] {}", device, line),
                    Err(_) => break,
                }
            }
        });
    if let Err(e) = spawned {
        warn!("Failed to spawn output relay: {}", e);
    }
}

impl OutputSink for PerDeviceProcessSink {
    fn name(&self) -> &str {
        "process"
    }

    fn connect_device(&self, device: &DeviceHandle) -> Result<(), SinkError> {
        let name = device.name();
        if self.processes.lock().contains_key(device.id()) {
            warn!(device = %name, "Device is already connected");
            return Ok(());
        }

        info!(device = %name, "Connecting to device");
        device.set_state(ConnectionState::Connecting);

        let process = match self.spawn(device) {
            Ok(process) => process,
            Err(e) => {
                device.mark_error(e.to_string());
                error!(device = %name, "Failed to connect to device: {}", e);
                return Err(e);
            }
        };

        thread::sleep(self.config.startup_grace);
        if process.has_exited() {
            process.terminate();
            let err = SinkError::ProcessExited(name.clone());
            device.mark_error("Process exited immediately");
            error!(device = %name, "Failed to connect to device: {}", err);
            return Err(err);
        }

        {
            let mut processes = self.processes.lock();
            if processes.contains_key(device.id()) {
                // A concurrent connect won the race; keep its player
                drop(processes);
                process.terminate();
                warn!(device = %name, "Device is already connected");
                return Ok(());
            }
            processes.insert(device.id().to_string(), process);
        }
        device.set_state(ConnectionState::Connected);
        info!(device = %name, "Successfully connected to device");
        Ok(())
    }

    fn disconnect_device(&self, device: &DeviceHandle) {
        let process = self.processes.lock().remove(device.id());
        match process {
            Some(process) => {
                info!(device = %device.name(), "Disconnecting from device");
                process.terminate();
            }
            None => debug!(device = %device.name(), "Device not in active connections"),
        }
        device.set_state(ConnectionState::Disconnected);
    }

    fn send_to_all(&self, data: &[u8]) -> SendReport {
        let processes: Vec<Arc<DeviceProcess>> = self
            .processes
            .lock()
            .values()
            .filter(|p| p.device.accepts_audio())
            .cloned()
            .collect();

        let mut report = SendReport::default();
        for process in processes {
            let device = &process.device;
            if process.has_exited() {
                warn!(device = %device.name(), "Process has exited");
                device.mark_error("Process terminated unexpectedly");
                report.failed += 1;
                continue;
            }
            match process.write(data) {
                Ok(()) => {
                    device.record_send();
                    report.delivered += 1;
                }
                Err(e) => {
                    error!(device = %device.name(), "Error sending audio: {}", e);
                    device.mark_error(e.to_string());
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Applies to processes started after the change
    fn set_volume(&self, level: i32) {
        let level = clamp_volume(level);
        self.volume.store(level, Ordering::Relaxed);
        info!("Volume set to {}", level);
    }

    fn volume(&self) -> u8 {
        self.volume.load(Ordering::Relaxed)
    }

    fn stop_all(&self) {
        info!("Stopping all devices");
        let processes: Vec<Arc<DeviceProcess>> =
            self.processes.lock().drain().map(|(_, p)| p).collect();
        for process in processes {
            process.terminate();
            process.device.set_state(ConnectionState::Disconnected);
        }
    }
}

impl Drop for PerDeviceProcessSink {
    fn drop(&mut self) {
        self.stop_all();
    }
}
