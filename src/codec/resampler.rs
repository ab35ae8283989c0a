//! Streaming sample-rate conversion using rubato
//!
//! The filter is fed in small fixed chunks from a pending-sample queue, so
//! arbitrary capture chunk sizes can be pushed without resetting filter
//! phase. Samples that do not yet fill a chunk stay queued for the next call.

use rubato::{
    Resampler as RubatoResampler, SincFixedIn, SincInterpolationParameters,
    SincInterpolationType, WindowFunction,
};
use tracing::debug;

use crate::constants::RESAMPLER_CHUNK_FRAMES;
use crate::error::CodecError;

/// Persistent resampler state for one streaming session
pub struct StreamResampler {
    resampler: SincFixedIn<f32>,
    channels: usize,
    input_rate: u32,
    output_rate: u32,
    /// Planar samples pushed but not yet consumed by the filter
    pending: Vec<Vec<f32>>,
    /// Reused planar output scratch
    output: Vec<Vec<f32>>,
    pushed_frames: u64,
    consumed_frames: u64,
    produced_frames: u64,
}

impl StreamResampler {
    /// Create a resampler converting `channels` interleaved channels from
    /// `input_rate` to `output_rate`
    pub fn new(input_rate: u32, output_rate: u32, channels: usize) -> Result<Self, CodecError> {
        if input_rate == 0 || output_rate == 0 || channels == 0 {
            return Err(CodecError::UnsupportedFormat(format!(
                "{}Hz -> {}Hz with {} channels",
                input_rate, output_rate, channels
            )));
        }

        let params = SincInterpolationParameters {
            sinc_len: 64,
            f_cutoff: 0.925,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };

        let resampler = SincFixedIn::<f32>::new(
            output_rate as f64 / input_rate as f64,
            1.0,
            params,
            RESAMPLER_CHUNK_FRAMES,
            channels,
        )
        .map_err(|e| CodecError::Resampler(format!("Failed to create resampler: {}", e)))?;

        let output = vec![vec![0.0; resampler.output_frames_max()]; channels];

        debug!(
            "Resampler created: {}Hz -> {}Hz, {} channels, {} frame chunks",
            input_rate, output_rate, channels, RESAMPLER_CHUNK_FRAMES
        );

        Ok(Self {
            resampler,
            channels,
            input_rate,
            output_rate,
            pending: vec![Vec::new(); channels],
            output,
            pushed_frames: 0,
            consumed_frames: 0,
            produced_frames: 0,
        })
    }

    /// Queue interleaved samples. A trailing partial frame is ignored.
    pub fn push_interleaved(&mut self, samples: &[f32]) {
        let mut frames = 0u64;
        for frame in samples.chunks_exact(self.channels) {
            for (channel, sample) in self.pending.iter_mut().zip(frame) {
                channel.push(*sample);
            }
            frames += 1;
        }
        self.pushed_frames += frames;
    }

    /// Run the filter over queued input, appending interleaved output to `out`.
    ///
    /// Stops when the queue no longer holds a full chunk or when another chunk
    /// would exceed `max_frames` output frames. Returns the frames appended;
    /// this may be fewer than requested and output is never padded.
    pub fn pull(&mut self, max_frames: usize, out: &mut Vec<f32>) -> Result<usize, CodecError> {
        let mut offset = 0usize;
        let mut produced = 0usize;

        loop {
            let needed = self.resampler.input_frames_next();
            let available = self.pending[0].len() - offset;
            if available < needed || produced + self.resampler.output_frames_next() > max_frames {
                break;
            }

            let input: Vec<&[f32]> = self
                .pending
                .iter()
                .map(|channel| &channel[offset..offset + needed])
                .collect();

            let (read, written) = self
                .resampler
                .process_into_buffer(&input, &mut self.output, None)
                .map_err(|e| CodecError::Resampler(e.to_string()))?;

            offset += read;
            produced += written;

            out.reserve(written * self.channels);
            for i in 0..written {
                for channel in &self.output {
                    out.push(channel[i]);
                }
            }
        }

        if offset > 0 {
            for channel in &mut self.pending {
                channel.drain(..offset);
            }
        }

        self.consumed_frames += offset as u64;
        self.produced_frames += produced as u64;
        Ok(produced)
    }

    /// Output frames expected for `input_frames` of input, rounded up
    pub fn expected_output_frames(&self, input_frames: usize) -> usize {
        (input_frames as u64 * self.output_rate as u64).div_ceil(self.input_rate as u64) as usize
    }

    /// Frames queued but not yet consumed by the filter
    pub fn buffered_frames(&self) -> usize {
        self.pending[0].len()
    }

    pub fn pushed_frames(&self) -> u64 {
        self.pushed_frames
    }

    pub fn consumed_frames(&self) -> u64 {
        self.consumed_frames
    }

    pub fn produced_frames(&self) -> u64 {
        self.produced_frames
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_sine(freq: f32, rate: u32, frames: usize, phase_start: usize) -> Vec<f32> {
        let mut samples = Vec::with_capacity(frames * 2);
        for n in phase_start..phase_start + frames {
            let v = (2.0 * std::f32::consts::PI * freq * n as f32 / rate as f32).sin() * 0.5;
            samples.push(v);
            samples.push(v);
        }
        samples
    }

    #[test]
    fn test_rejects_zero_rate() {
        assert!(StreamResampler::new(0, 44100, 2).is_err());
        assert!(StreamResampler::new(48000, 44100, 0).is_err());
    }

    #[test]
    fn test_partial_chunk_stays_queued() {
        let mut resampler = StreamResampler::new(48000, 44100, 2).unwrap();
        let short = RESAMPLER_CHUNK_FRAMES / 2;
        resampler.push_interleaved(&vec![0.1; short * 2]);

        let mut out = Vec::new();
        assert_eq!(resampler.pull(usize::MAX, &mut out).unwrap(), 0);
        assert!(out.is_empty());
        assert_eq!(resampler.buffered_frames(), short);
    }

    #[test]
    fn test_no_sample_loss_across_calls() {
        let mut resampler = StreamResampler::new(48000, 44100, 2).unwrap();
        let mut out = Vec::new();

        for size in [100usize, 7, 333, 16, 1, 480] {
            resampler.push_interleaved(&vec![0.0; size * 2]);
            resampler.pull(usize::MAX, &mut out).unwrap();
            assert_eq!(
                resampler.consumed_frames() + resampler.buffered_frames() as u64,
                resampler.pushed_frames()
            );
        }
        assert!(resampler.buffered_frames() < RESAMPLER_CHUNK_FRAMES);
    }

    #[test]
    fn test_output_cap_is_respected() {
        let mut resampler = StreamResampler::new(48000, 44100, 2).unwrap();
        resampler.push_interleaved(&vec![0.0; 960 * 2]);

        let mut out = Vec::new();
        let produced = resampler.pull(100, &mut out).unwrap();
        assert!(produced <= 100);
        assert_eq!(out.len(), produced * 2);
        assert!(resampler.buffered_frames() > 0);
    }

    #[test]
    fn test_sine_frequency_preserved() {
        let input_rate = 48000;
        let freq = 1000.0;
        let chunk = 480;
        let mut resampler = StreamResampler::new(input_rate, 44100, 2).unwrap();
        let mut out = Vec::new();

        // One second in 10 ms chunks
        for i in 0..100 {
            resampler.push_interleaved(&stereo_sine(freq, input_rate, chunk, i * chunk));
            let max = resampler.expected_output_frames(chunk + resampler.buffered_frames()) + 32;
            resampler.pull(max, &mut out).unwrap();
        }

        let frames = out.len() / 2;
        assert!((44100 - 16..=44100 + 1).contains(&frames), "got {} frames", frames);

        let left: Vec<f32> = out.iter().step_by(2).copied().collect();
        let rising = left.windows(2).filter(|w| w[0] < 0.0 && w[1] >= 0.0).count();
        assert!((995..=1005).contains(&rising), "got {} rising crossings", rising);
    }
}
