//! Capture-path encoder benchmark
//!
//! The capture callback runs encode + enqueue for every chunk, so both must
//! stay far below the chunk duration (10 ms at 480 frames / 48kHz).

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use airplay_streamer::audio::{CaptureFormat, JitterBuffer};
use airplay_streamer::codec::PcmEncoder;

fn sine_chunk(frames: usize, channels: usize) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(frames * channels * 4);
    for i in 0..frames {
        let sample = (i as f32 * 2.0 * std::f32::consts::PI * 440.0 / 48_000.0).sin() * 0.5;
        for _ in 0..channels {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
    }
    bytes
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    let chunk = sine_chunk(480, 2);
    group.throughput(Throughput::Bytes(chunk.len() as u64));

    group.bench_function("resample_48k_float_10ms", |b| {
        let mut encoder = PcmEncoder::new();
        encoder.initialize(CaptureFormat::float32(48_000, 2)).unwrap();
        b.iter(|| black_box(encoder.encode(black_box(&chunk)).unwrap()));
    });

    group.bench_function("convert_44k_float_10ms", |b| {
        let chunk = sine_chunk(441, 2);
        let mut encoder = PcmEncoder::new();
        encoder.initialize(CaptureFormat::float32(44_100, 2)).unwrap();
        b.iter(|| black_box(encoder.encode(black_box(&chunk)).unwrap()));
    });

    group.bench_function("resample_mono_to_stereo_10ms", |b| {
        let chunk = sine_chunk(480, 1);
        let mut encoder = PcmEncoder::new();
        encoder.initialize(CaptureFormat::float32(48_000, 1)).unwrap();
        b.iter(|| black_box(encoder.encode(black_box(&chunk)).unwrap()));
    });

    group.finish();
}

fn bench_jitter_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("jitter_buffer");
    let frame = vec![0u8; 1764];

    group.bench_function("enqueue_dequeue", |b| {
        let buffer = JitterBuffer::new(50);
        b.iter(|| {
            buffer.enqueue(black_box(&frame));
            black_box(buffer.try_dequeue());
        });
    });

    group.bench_function("enqueue_overflow", |b| {
        let buffer = JitterBuffer::new(50);
        b.iter(|| buffer.enqueue(black_box(&frame)));
    });

    group.finish();
}

criterion_group!(benches, bench_encode, bench_jitter_buffer);
criterion_main!(benches);
