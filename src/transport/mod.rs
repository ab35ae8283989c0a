//! Stream transport: paces the encoded stream out to the sinks

pub mod pacing;

pub use pacing::{
    silence_deficit, PacingClock, PacingConfig, PacingHandle, PacingSnapshot, PacingStats,
    PacingTransport,
};
