//! Application configuration
//!
//! Loaded from TOML. Every field has a default, so an empty or missing file
//! is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::constants::*;
use crate::device::DeviceInfo;
use crate::error::ConfigError;
use crate::sink::{
    Endpoint, OutputSink, PassiveController, PerDeviceProcessSink, PersistentConnectionSink,
    PersistentSinkConfig, ProcessSinkConfig,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub pipeline: PipelineConfig,
    pub capture: CaptureConfig,
    pub sink: SinkConfig,
    /// Receivers for static discovery
    pub devices: Vec<DeviceInfo>,
    /// Overrides the default settings location
    pub settings_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Jitter buffer capacity in frames
    pub max_frames: usize,
    pub dequeue_timeout_ms: u64,
    /// Upper bound on waiting for the pacing loop during stop
    pub shutdown_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_frames: JITTER_BUFFER_MAX_FRAMES,
            dequeue_timeout_ms: DEQUEUE_TIMEOUT_MS,
            shutdown_timeout_ms: SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl PipelineConfig {
    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Capture device name; the platform default when unset
    pub device: Option<String>,
}

/// Which sink strategy to run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum SinkConfig {
    Persistent {
        #[serde(default = "default_endpoint")]
        endpoint: String,
        #[serde(default = "default_connect_timeout_ms")]
        connect_timeout_ms: u64,
        #[serde(default = "default_reopen_interval_ms")]
        reopen_interval_ms: u64,
    },
    Process {
        #[serde(default = "default_program")]
        program: String,
        #[serde(default = "default_args")]
        args: Vec<String>,
        #[serde(default = "default_startup_grace_ms")]
        startup_grace_ms: u64,
    },
}

fn default_endpoint() -> String {
    DEFAULT_TRANSPORT_ENDPOINT.to_string()
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_reopen_interval_ms() -> u64 {
    DEFAULT_REOPEN_INTERVAL_MS
}

fn default_program() -> String {
    ProcessSinkConfig::default().program
}

fn default_args() -> Vec<String> {
    ProcessSinkConfig::default().args
}

fn default_startup_grace_ms() -> u64 {
    DEFAULT_STARTUP_GRACE_MS
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig::Persistent {
            endpoint: default_endpoint(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reopen_interval_ms: default_reopen_interval_ms(),
        }
    }
}

impl SinkConfig {
    /// Construct the configured sink
    pub fn build(&self) -> Result<Arc<dyn OutputSink>, ConfigError> {
        match self {
            SinkConfig::Persistent {
                endpoint,
                connect_timeout_ms,
                reopen_interval_ms,
            } => {
                let endpoint: Endpoint = endpoint.parse().map_err(|reason| ConfigError::Invalid {
                    field: "sink.endpoint",
                    reason,
                })?;
                let config = PersistentSinkConfig {
                    endpoint,
                    connect_timeout: Duration::from_millis(*connect_timeout_ms),
                    reopen_interval: Duration::from_millis(*reopen_interval_ms),
                    ..Default::default()
                };
                Ok(Arc::new(PersistentConnectionSink::new(
                    config,
                    Arc::new(PassiveController),
                )))
            }
            SinkConfig::Process {
                program,
                args,
                startup_grace_ms,
            } => {
                if program.trim().is_empty() {
                    return Err(ConfigError::Invalid {
                        field: "sink.program",
                        reason: "must not be empty".to_string(),
                    });
                }
                Ok(Arc::new(PerDeviceProcessSink::new(ProcessSinkConfig {
                    program: program.clone(),
                    args: args.clone(),
                    startup_grace: Duration::from_millis(*startup_grace_ms),
                })))
            }
        }
    }
}

impl AppConfig {
    /// `config.toml` in the per-user config directory
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        directories::ProjectDirs::from("", "", "airplay-streamer")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Load from `path`; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Parse {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })
            }
        };
        let config = Self::from_toml(&text).map_err(|e| match e {
            ConfigError::Parse { reason, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                reason,
            },
            other => other,
        })?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load(&Self::default_path()?)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: "<inline>".to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.max_frames == 0 {
            return Err(ConfigError::Invalid {
                field: "pipeline.max_frames",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.pipeline.dequeue_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "pipeline.dequeue_timeout_ms",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn settings_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.settings_path {
            Some(path) => Ok(path.clone()),
            None => crate::settings::SettingsStore::default_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.pipeline.max_frames, 50);
        assert_eq!(config.pipeline.dequeue_timeout(), Duration::from_millis(5));
        assert!(matches!(config.sink, SinkConfig::Persistent { .. }));
        assert!(config.devices.is_empty());
    }

    #[test]
    fn test_process_sink_and_devices() {
        let text = r#"
            [pipeline]
            max_frames = 20

            [sink]
            strategy = "process"
            program = "/usr/local/bin/raop_play"

            [[devices]]
            id = "kitchen"
            name = "Kitchen"
            address = "192.168.1.20"
        "#;
        let config = AppConfig::from_toml(text).unwrap();
        assert_eq!(config.pipeline.max_frames, 20);
        match &config.sink {
            SinkConfig::Process { program, args, startup_grace_ms } => {
                assert_eq!(program, "/usr/local/bin/raop_play");
                assert_eq!(args[0], "-v");
                assert_eq!(*startup_grace_ms, 500);
            }
            other => panic!("unexpected sink {:?}", other),
        }
        assert_eq!(config.devices[0].address.as_deref(), Some("192.168.1.20"));
        assert_eq!(config.sink.build().unwrap().name(), "process");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            AppConfig::from_toml("[pipeline]\nmax_frames = 0"),
            Err(ConfigError::Invalid { field: "pipeline.max_frames", .. })
        ));

        let config = AppConfig::from_toml("[sink]\nstrategy = \"persistent\"\nendpoint = \"bogus\"").unwrap();
        assert!(config.sink.build().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config.pipeline.shutdown_timeout_ms, 3000);
    }
}
