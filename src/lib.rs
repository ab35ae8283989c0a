//! # AirPlay Streamer
//!
//! Streams the system audio mix to AirPlay receivers as one continuous,
//! constant-bitrate PCM stream.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                               STREAMER                                    │
//! │  ┌─────────────────┐                                                      │
//! │  │ Capture source  │  cpal loopback / raw PCM reader (audio::loopback)    │
//! │  └────────┬────────┘                                                      │
//! │           │ capture callback: any rate, float32 or int16                  │
//! │           ▼                                                               │
//! │  ┌─────────────────┐                                                      │
//! │  │   PcmEncoder    │  persistent resampler → 44.1kHz s16le stereo         │
//! │  └────────┬────────┘  (codec::encoder, codec::resampler)                  │
//! │           ▼                                                               │
//! │  ┌─────────────────┐                                                      │
//! │  │  Jitter Buffer  │  bounded, drop-oldest (audio::buffer)                │
//! │  └────────┬────────┘                                                      │
//! │           ▼                                                               │
//! │  ┌─────────────────┐                                                      │
//! │  │  Pacing Thread  │  real audio, or silence up to 176400 B/s             │
//! │  └────────┬────────┘  (transport::pacing)                                 │
//! │           ▼                                                               │
//! │  ┌──────────────────────────────────────────────────────────────────┐    │
//! │  │                      OutputSink (sink)                            │    │
//! │  │   shared socket/pipe into a streaming server  │  player per device │    │
//! │  └──────────────────────────────────────────────────────────────────┘    │
//! │           │            │            │         DeviceConnectionManager     │
//! └───────────┼────────────┼────────────┼─────────────────────────────────────┘
//!             ▼            ▼            ▼
//!        ┌─────────┐  ┌─────────┐  ┌─────────┐
//!        │ Kitchen │  │ Office  │  │ Bedroom │
//!        └─────────┘  └─────────┘  └─────────┘
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod session;
pub mod settings;
pub mod sink;
pub mod transport;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Output sample rate every receiver is fed
    pub const TARGET_SAMPLE_RATE: u32 = 44_100;

    /// Output channel count (stereo)
    pub const OUTPUT_CHANNELS: u16 = 2;

    /// Bytes in one output frame: 16-bit stereo
    pub const OUTPUT_FRAME_BYTES: u64 = 4;

    /// Output byte rate the pacing loop holds
    pub const OUTPUT_BYTES_PER_SECOND: u64 = TARGET_SAMPLE_RATE as u64 * OUTPUT_FRAME_BYTES;

    /// Jitter buffer capacity in frames (~500 ms of 10 ms chunks)
    pub const JITTER_BUFFER_MAX_FRAMES: usize = 50;

    /// Input frames per resampler pass
    pub const RESAMPLER_CHUNK_FRAMES: usize = 16;

    /// Extra output frames allowed per encode beyond the nominal count
    pub const RESAMPLE_MARGIN_FRAMES: usize = 32;

    /// Pacing loop wait per dequeue
    pub const DEQUEUE_TIMEOUT_MS: u64 = 5;

    /// Upper bound on waiting for the pacing loop at shutdown
    pub const SHUTDOWN_TIMEOUT_MS: u64 = 3_000;

    pub const DEFAULT_VOLUME: u8 = 75;

    pub const DEFAULT_TRANSPORT_ENDPOINT: &str = "tcp://127.0.0.1:5555";

    /// A player process must survive this long to count as started
    pub const DEFAULT_STARTUP_GRACE_MS: u64 = 500;

    pub const DEFAULT_REOPEN_INTERVAL_MS: u64 = 1_000;

    /// Chunks queued for one player before it counts as stalled
    pub const PLAYER_QUEUE_CHUNKS: usize = 50;
}
