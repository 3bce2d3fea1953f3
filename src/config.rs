//! Bridge configuration.
//!
//! Values come from (lowest to highest precedence) built-in defaults, the
//! JSON file at `$XDG_CONFIG_HOME/pw-lambda/config.json` (or `--config`),
//! and command-line options.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::{SampleFormat, SampleSpec, default_channel_map};
use crate::error::BridgeError;

pub const DEFAULT_SINK_NAME: &str = "lambda_sink";
pub const DEFAULT_SOURCE_NAME: &str = "lambda_source";
/// Capacity of the inbound chunk the loop reads filter output into.
pub const DEFAULT_CHUNK_CAPACITY: usize = 16 * 1024;

pub const MAX_CHANNELS: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Shell command line run as `sh -c <command>`.
    pub command: String,
    pub sink_name: String,
    pub source_name: String,
    pub sink_description: String,
    pub source_description: String,
    /// Capture from this PipeWire object instead of exposing a virtual sink.
    pub capture_target: Option<String>,
    /// Play to this PipeWire object instead of exposing a virtual source.
    pub playback_target: Option<String>,
    pub format: SampleFormat,
    pub rate: u32,
    pub channels: usize,
    pub channel_map: Option<Vec<String>>,
    /// Requested quantum, also exported as `PA_LAMBDA_BUFFER_SIZE`.
    pub buffer_frames: u32,
    pub chunk_capacity: usize,
    /// Bytes of filter output that may queue up between the loop and the
    /// source endpoint.
    pub ring_capacity: usize,
    pub terminate_grace_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            sink_name: DEFAULT_SINK_NAME.to_string(),
            source_name: DEFAULT_SOURCE_NAME.to_string(),
            sink_description: "Lambda Sink".to_string(),
            source_description: "Lambda Source".to_string(),
            capture_target: None,
            playback_target: None,
            format: SampleFormat::default(),
            rate: 48000,
            channels: 2,
            channel_map: None,
            buffer_frames: 1024,
            chunk_capacity: DEFAULT_CHUNK_CAPACITY,
            ring_capacity: 4 * DEFAULT_CHUNK_CAPACITY,
            terminate_grace_ms: 2000,
        }
    }
}

impl BridgeConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("pw-lambda").join("config.json"))
    }

    /// Load the config file at `path`. A missing file yields the defaults;
    /// an unreadable or malformed one is an error.
    pub fn load(path: &Path) -> Result<Self, BridgeError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No config file at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(BridgeError::Config(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )));
            }
        };
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| BridgeError::Config(format!("{}: {}", path.display(), e)))?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.command.trim().is_empty() {
            return Err(BridgeError::Config("no filter command specified".into()));
        }
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(BridgeError::Config(format!(
                "channel count {} out of range 1..={}",
                self.channels, MAX_CHANNELS
            )));
        }
        if let Some(map) = &self.channel_map
            && map.len() != self.channels
        {
            return Err(BridgeError::Config(format!(
                "channel map has {} positions but {} channels are configured",
                map.len(),
                self.channels
            )));
        }
        if self.rate == 0 || self.buffer_frames == 0 {
            return Err(BridgeError::Config(
                "rate and buffer size must be non-zero".into(),
            ));
        }
        if self.chunk_capacity == 0 || self.ring_capacity < self.spec().bytes_per_frame() {
            return Err(BridgeError::Config(
                "chunk capacity must be non-zero and the ring must hold at least one frame"
                    .into(),
            ));
        }
        Ok(())
    }

    pub fn spec(&self) -> SampleSpec {
        SampleSpec {
            format: self.format,
            rate: self.rate,
            channels: self.channels,
        }
    }

    pub fn positions(&self) -> Vec<String> {
        self.channel_map
            .clone()
            .unwrap_or_else(|| default_channel_map(self.channels))
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_command(cmd: &str) -> BridgeConfig {
        BridgeConfig {
            command: cmd.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_match_module_names() {
        let config = BridgeConfig::default();
        assert_eq!(config.sink_name, "lambda_sink");
        assert_eq!(config.source_name, "lambda_source");
        assert_eq!(config.chunk_capacity, 16384);
        assert_eq!(config.format, SampleFormat::S16le);
    }

    #[test]
    fn test_validate_rejects_empty_command() {
        assert!(matches!(
            with_command("  ").validate(),
            Err(BridgeError::Config(_))
        ));
        assert!(with_command("cat").validate().is_ok());
    }

    #[test]
    fn test_validate_channel_map_length() {
        let mut config = with_command("cat");
        config.channel_map = Some(vec!["MONO".into()]);
        assert!(config.validate().is_err());
        config.channels = 1;
        assert!(config.validate().is_ok());
        assert_eq!(config.positions(), vec!["MONO"]);
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "command": "sox -t raw - -t raw -", "format": "f32le", "rate": 44100 }"#)
            .unwrap();

        let config = BridgeConfig::load(&path).unwrap();
        assert_eq!(config.command, "sox -t raw - -t raw -");
        assert_eq!(config.format, SampleFormat::F32le);
        assert_eq!(config.rate, 44100);
        assert_eq!(config.channels, 2);
        assert_eq!(config.sink_name, DEFAULT_SINK_NAME);
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn test_load_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            BridgeConfig::load(&path),
            Err(BridgeError::Config(_))
        ));
    }
}
