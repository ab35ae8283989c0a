//! Error types for the streaming pipeline

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("No devices enabled")]
    NoDevicesEnabled,

    #[error("Streaming already active")]
    AlreadyStreaming,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sample format conversion errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encoder not initialized")]
    NotInitialized,

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Resampler failed: {0}")]
    Resampler(String),
}

/// Output sink errors
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Device {device} unavailable: {reason}")]
    Unavailable { device: String, reason: String },

    #[error("Shared transport failed: {0}")]
    TransportFailure(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Failed to spawn player for {device}: {source}")]
    Spawn {
        device: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Player for {0} exited immediately after start")]
    ProcessExited(String),

    #[error("Device {0} has no usable address")]
    MissingAddress(String),

    #[error("Output controller error: {0}")]
    Controller(String),
}

/// Capture boundary errors
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Capture device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported capture format: {0}")]
    UnsupportedFormat(String),
}

/// Receiver discovery errors, propagated as-is
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Discovery failed: {0}")]
    Failed(String),

    #[error("Discovery timed out")]
    Timeout,
}

/// Configuration and settings file errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("Failed to serialize: {0}")]
    Serialize(String),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("No configuration directory available")]
    NoConfigDir,
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
