//! AirPlay Streamer Application
//!
//! Captures the system audio mix and streams it to the configured receivers.
//!
//! Usage: `streamer [config.toml] [--stdin]`
//!
//! With `--stdin` (or without the `capture` feature) raw interleaved float32
//! stereo PCM at 48kHz is read from standard input instead of the loopback
//! device.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use airplay_streamer::{
    audio::{CaptureFormat, CaptureSource, ReaderCapture},
    config::AppConfig,
    discovery::StaticDiscovery,
    session::StreamingSession,
    settings::SettingsStore,
};

/// Interval between discovery passes
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(10);

/// Frames per read when capturing from stdin (10 ms at 48kHz)
const STDIN_CHUNK_FRAMES: usize = 480;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting AirPlay Streamer");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let use_stdin = args.iter().any(|a| a == "--stdin");
    let config_path = match args.iter().find(|a| !a.starts_with("--")) {
        Some(path) => PathBuf::from(path),
        None => AppConfig::default_path()?,
    };

    let config = AppConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    if !use_stdin {
        print_capture_devices();
    }

    let store = SettingsStore::new(config.settings_path()?);
    let sink = config.sink.build()?;
    tracing::info!("Using {} sink", sink.name());

    let session = Arc::new(StreamingSession::new(
        sink,
        config.pipeline.clone(),
        Some(store),
    ));

    let discovery = Arc::new(StaticDiscovery::new(config.devices.clone()));
    let diff = session.refresh_devices(discovery.as_ref())?;
    tracing::info!("{} receiver(s) known", diff.added.len());

    if !session.manager().any_enabled() {
        // First run: nothing saved yet, so stream to every configured receiver
        for device in session.manager().devices() {
            session.toggle_device(device.id(), true)?;
        }
    }

    let capture = open_capture(&config, use_stdin)?;
    session.start(capture)?;

    // Periodic discovery
    let refresh_session = session.clone();
    let refresh_discovery = discovery.clone();
    let discovery_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(DISCOVERY_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let session = refresh_session.clone();
            let discovery = refresh_discovery.clone();
            let result =
                tokio::task::spawn_blocking(move || session.refresh_devices(discovery.as_ref()))
                    .await;
            match result {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::warn!("Discovery failed: {}", e),
                Err(e) => tracing::warn!("Discovery task failed: {}", e),
            }
        }
    });

    // Periodic stats logging
    let stats_session = session.clone();
    let stats_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        interval.tick().await;
        loop {
            interval.tick().await;
            let status = stats_session.status();
            if let Some(pacing) = status.pacing {
                tracing::info!(
                    "Stats: {} frames, {:.1} KB audio, {:.1} KB silence, {} dropped, {} buffered",
                    pacing.frames_sent,
                    pacing.audio_bytes as f64 / 1024.0,
                    pacing.silence_bytes as f64 / 1024.0,
                    status.dropped_frames,
                    status.buffered_frames
                );
            }
        }
    });

    tracing::info!("Streaming - press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    discovery_task.abort();
    stats_task.abort();

    let stop_session = session.clone();
    if let Some(stats) = tokio::task::spawn_blocking(move || stop_session.stop()).await? {
        tracing::info!(
            "Sent {} frames and {} bytes of silence",
            stats.frames_sent,
            stats.silence_bytes
        );
    }

    Ok(())
}

#[cfg(feature = "capture")]
fn print_capture_devices() {
    println!("\n=== Available Capture Devices ===");
    for device in airplay_streamer::audio::list_capture_devices() {
        let kind = if device.is_loopback { "Loopback" } else { "Input" };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}:", device.name, kind, default_marker);
        if let (Some(rate), Some(channels)) = (device.sample_rate, device.channels) {
            println!("    Format: {}Hz, {} channels", rate, channels);
        }
    }
    println!();
}

#[cfg(not(feature = "capture"))]
fn print_capture_devices() {
    tracing::info!("Built without the capture feature, reading PCM from stdin");
}

#[cfg(feature = "capture")]
fn open_capture(config: &AppConfig, use_stdin: bool) -> Result<Box<dyn CaptureSource>> {
    if use_stdin {
        return Ok(stdin_capture());
    }
    let capture = airplay_streamer::audio::LoopbackCapture::new(config.capture.device.as_deref())?;
    tracing::info!("Capturing system audio: {}", capture.format());
    Ok(Box::new(capture))
}

#[cfg(not(feature = "capture"))]
fn open_capture(_config: &AppConfig, _use_stdin: bool) -> Result<Box<dyn CaptureSource>> {
    Ok(stdin_capture())
}

fn stdin_capture() -> Box<dyn CaptureSource> {
    let format = CaptureFormat::float32(48_000, 2);
    tracing::info!("Capturing raw PCM from stdin: {}", format);
    Box::new(ReaderCapture::stdin(format, STDIN_CHUNK_FRAMES))
}
