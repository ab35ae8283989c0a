//! Receiver records and their connection state

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Identity of a receiver as reported by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    /// Host name or IP address, used by per-device players
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Output identifier on a shared streaming server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_id: Option<String>,
}

impl DeviceInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: None,
            port: None,
            output_id: None,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_output_id(mut self, output_id: impl Into<String>) -> Self {
        self.output_id = Some(output_id.into());
        self
    }

    /// Whether any sink strategy has enough information to reach the device
    pub fn is_resolved(&self) -> bool {
        self.address.as_deref().is_some_and(|a| !a.is_empty())
            || self.output_id.as_deref().is_some_and(|o| !o.is_empty())
    }
}

/// Connection lifecycle of a receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Discovering,
    Connecting,
    Connected,
    Streaming,
    Error,
}

impl ConnectionState {
    /// Connected or streaming: eligible to receive audio
    pub fn is_active(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Streaming)
    }

    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (_, Error) | (_, Disconnected) => true,
            (Disconnected, Discovering) => true,
            (Disconnected | Discovering | Error, Connecting) => true,
            (Connecting | Error, Connected) => true,
            (Connected, Streaming) => true,
            (a, b) => a == b,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Discovering => "discovering",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct DeviceStatus {
    enabled: bool,
    state: ConnectionState,
    error_message: Option<String>,
    last_send: Option<DateTime<Utc>>,
}

/// A receiver shared between the connection manager and the sinks
#[derive(Debug)]
pub struct Device {
    id: String,
    info: RwLock<DeviceInfo>,
    status: Mutex<DeviceStatus>,
}

/// Shared handle to a device
pub type DeviceHandle = Arc<Device>;

impl Device {
    /// Unresolved devices start in `Discovering`
    pub fn new(info: DeviceInfo) -> Self {
        let state = if info.is_resolved() {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Discovering
        };
        Self {
            id: info.id.clone(),
            info: RwLock::new(info),
            status: Mutex::new(DeviceStatus {
                enabled: false,
                state,
                error_message: None,
                last_send: None,
            }),
        }
    }

    pub fn handle(info: DeviceInfo) -> DeviceHandle {
        Arc::new(Self::new(info))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> String {
        self.info.read().name.clone()
    }

    pub fn info(&self) -> DeviceInfo {
        self.info.read().clone()
    }

    /// Replace identity details from a newer discovery pass
    pub(crate) fn update_info(&self, info: DeviceInfo) {
        let resolved = info.is_resolved();
        *self.info.write() = info;
        let mut status = self.status.lock();
        if resolved && status.state == ConnectionState::Discovering {
            status.state = ConnectionState::Disconnected;
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.status.lock().enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.status.lock().enabled = enabled;
    }

    pub fn state(&self) -> ConnectionState {
        self.status.lock().state
    }

    /// Move to `next`, clearing any error message
    pub fn set_state(&self, next: ConnectionState) {
        let mut status = self.status.lock();
        if !status.state.can_transition_to(next) {
            debug!(device = %self.id, "Unusual state transition {} -> {}", status.state, next);
        }
        status.state = next;
        if next != ConnectionState::Error {
            status.error_message = None;
        }
    }

    pub fn mark_error(&self, message: impl Into<String>) {
        let mut status = self.status.lock();
        status.state = ConnectionState::Error;
        status.error_message = Some(message.into());
    }

    pub fn error_message(&self) -> Option<String> {
        self.status.lock().error_message.clone()
    }

    /// Enabled and connected: audio should be delivered
    pub fn accepts_audio(&self) -> bool {
        let status = self.status.lock();
        status.enabled && status.state.is_active()
    }

    /// Record a successful write, promoting `Connected` to `Streaming`
    pub fn record_send(&self) {
        let mut status = self.status.lock();
        if status.state == ConnectionState::Connected {
            status.state = ConnectionState::Streaming;
        }
        status.last_send = Some(Utc::now());
    }

    pub fn last_send(&self) -> Option<DateTime<Utc>> {
        self.status.lock().last_send
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        let info = self.info();
        let status = self.status.lock();
        DeviceSnapshot {
            id: info.id,
            name: info.name,
            address: info.address,
            enabled: status.enabled,
            state: status.state,
            error_message: status.error_message.clone(),
            last_send: status.last_send,
        }
    }
}

/// Point-in-time view of a device for status output
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub enabled: bool,
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_send: Option<DateTime<Utc>>,
}
