//! PCM format conversion
//!
//! Converts capture-format audio into the fixed stream format with a
//! persistent resampler so output stays continuous across capture chunks.

pub mod encoder;
pub mod resampler;

pub use encoder::{Conversion, EncoderStats, PcmEncoder};
pub use resampler::StreamResampler;
