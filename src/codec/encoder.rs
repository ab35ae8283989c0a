//! Capture-format to output-format PCM conversion
//!
//! Turns interleaved float32 or int16 capture chunks at any rate into the
//! stream format receivers expect: 16-bit little-endian stereo at 44.1kHz.
//! Resampler state persists across calls so chunk boundaries are seamless.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::info;

use crate::audio::capture::{CaptureFormat, SampleKind};
use crate::codec::resampler::StreamResampler;
use crate::constants::{OUTPUT_CHANNELS, RESAMPLE_MARGIN_FRAMES, TARGET_SAMPLE_RATE};
use crate::error::CodecError;

/// How a chunk is converted, decided once at initialization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    /// Already int16 stereo at the target rate
    PassThrough,
    /// int16 at the target rate, channel layout differs
    Remix,
    /// float32 at the target rate
    FloatToInt16,
    /// Any input at another rate
    Resample,
}

struct EncoderState {
    format: CaptureFormat,
    conversion: Conversion,
    resampler: Option<StreamResampler>,
    /// Reused stereo float scratch
    scratch: Vec<f32>,
}

/// Stateful PCM encoder for one streaming session
#[derive(Default)]
pub struct PcmEncoder {
    state: Option<EncoderState>,
    chunks_encoded: u64,
    bytes_in: u64,
    bytes_out: u64,
}

impl PcmEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the capture format and build the resampler if one is needed.
    ///
    /// Calling again replaces all previous state.
    pub fn initialize(&mut self, format: CaptureFormat) -> Result<(), CodecError> {
        match (format.sample_kind, format.bits_per_sample) {
            (SampleKind::Float, 32) | (SampleKind::Int, 16) => {}
            (kind, bits) => {
                return Err(CodecError::UnsupportedFormat(format!(
                    "{:?} {}-bit samples",
                    kind, bits
                )))
            }
        }
        if format.channels == 0 || format.sample_rate == 0 {
            return Err(CodecError::UnsupportedFormat(format!(
                "{}Hz with {} channels",
                format.sample_rate, format.channels
            )));
        }

        let conversion = if format.sample_rate != TARGET_SAMPLE_RATE {
            Conversion::Resample
        } else if format.sample_kind == SampleKind::Float {
            Conversion::FloatToInt16
        } else if format.channels == OUTPUT_CHANNELS {
            Conversion::PassThrough
        } else {
            Conversion::Remix
        };

        let resampler = match conversion {
            Conversion::Resample => Some(StreamResampler::new(
                format.sample_rate,
                TARGET_SAMPLE_RATE,
                OUTPUT_CHANNELS as usize,
            )?),
            _ => None,
        };

        info!(
            "Encoder initialized - SampleRate: {}, Channels: {}, BitsPerSample: {}, Kind: {:?}, Conversion: {:?}",
            format.sample_rate, format.channels, format.bits_per_sample, format.sample_kind, conversion
        );

        self.state = Some(EncoderState {
            format,
            conversion,
            resampler,
            scratch: Vec::new(),
        });
        Ok(())
    }

    /// Convert one capture chunk. Empty input yields empty output.
    pub fn encode(&mut self, pcm: &[u8]) -> Result<Bytes, CodecError> {
        let state = self.state.as_mut().ok_or(CodecError::NotInitialized)?;
        if pcm.is_empty() {
            return Ok(Bytes::new());
        }

        let out = match state.conversion {
            Conversion::PassThrough => Bytes::copy_from_slice(pcm),
            Conversion::Remix => remix_int16(pcm, state.format.channels),
            Conversion::FloatToInt16 => {
                decode_to_stereo(pcm, &state.format, &mut state.scratch);
                float_to_int16(&state.scratch)
            }
            Conversion::Resample => {
                decode_to_stereo(pcm, &state.format, &mut state.scratch);
                let input_frames = state.scratch.len() / OUTPUT_CHANNELS as usize;
                let resampler = state.resampler.as_mut().ok_or(CodecError::NotInitialized)?;
                resampler.push_interleaved(&state.scratch);

                let max_frames = resampler.expected_output_frames(input_frames) + RESAMPLE_MARGIN_FRAMES;
                state.scratch.clear();
                resampler.pull(max_frames, &mut state.scratch)?;
                float_to_int16(&state.scratch)
            }
        };

        self.chunks_encoded += 1;
        self.bytes_in += pcm.len() as u64;
        self.bytes_out += out.len() as u64;
        Ok(out)
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    pub fn format(&self) -> Option<&CaptureFormat> {
        self.state.as_ref().map(|s| &s.format)
    }

    pub fn conversion(&self) -> Option<Conversion> {
        self.state.as_ref().map(|s| s.conversion)
    }

    /// Drop all session state; `encode` fails until re-initialized
    pub fn reset(&mut self) {
        self.state = None;
    }

    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            chunks_encoded: self.chunks_encoded,
            bytes_in: self.bytes_in,
            bytes_out: self.bytes_out,
            resampler_backlog_frames: self
                .state
                .as_ref()
                .and_then(|s| s.resampler.as_ref())
                .map(|r| r.buffered_frames())
                .unwrap_or(0),
        }
    }
}

/// Encoder statistics
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncoderStats {
    pub chunks_encoded: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub resampler_backlog_frames: usize,
}

/// Clamp to [-1, 1], scale by 32767 and truncate toward zero
#[inline]
pub fn float_sample_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}

fn float_to_int16(samples: &[f32]) -> Bytes {
    let mut out = BytesMut::with_capacity(samples.len() * 2);
    for &sample in samples {
        out.put_i16_le(float_sample_to_i16(sample));
    }
    out.freeze()
}

/// Decode whole frames into interleaved stereo floats in `out`
fn decode_to_stereo(pcm: &[u8], format: &CaptureFormat, out: &mut Vec<f32>) {
    out.clear();
    let channels = format.channels as usize;
    let sample_bytes = format.bytes_per_sample();
    let frame_bytes = channels * sample_bytes;

    let read = |bytes: &[u8]| -> f32 {
        match format.sample_kind {
            SampleKind::Float => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            SampleKind::Int => i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / 32768.0,
        }
    };

    out.reserve(pcm.len() / frame_bytes * 2);
    for frame in pcm.chunks_exact(frame_bytes) {
        let left = read(&frame[..sample_bytes]);
        let right = if channels > 1 {
            read(&frame[sample_bytes..2 * sample_bytes])
        } else {
            left
        };
        out.push(left);
        out.push(right);
    }
}

/// Map int16 frames of any channel count onto stereo without leaving int16
fn remix_int16(pcm: &[u8], channels: u16) -> Bytes {
    let frame_bytes = channels as usize * 2;
    let mut out = BytesMut::with_capacity(pcm.len() / frame_bytes * 4);
    for frame in pcm.chunks_exact(frame_bytes) {
        out.put_slice(&frame[..2]);
        if channels > 1 {
            out.put_slice(&frame[2..4]);
        } else {
            out.put_slice(&frame[..2]);
        }
    }
    out.freeze()
}
