//! Application configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{DuocamError, DuocamResult};

/// MIME type of the H.264 elementary stream the merge produces.
pub const DEFAULT_OUTPUT_MIME: &str = "video/avc";

/// File name of the merged artifact inside the output directory.
pub const DEFAULT_OUTPUT_FILE_NAME: &str = "merged_output.mp4";

/// Global application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory the merged artifact is written to.
    pub output_dir: PathBuf,

    /// File name of the merged artifact.
    pub output_file_name: String,

    /// Output encoder parameters.
    pub encoder: EncoderSettings,

    /// Merge loop timing.
    pub pipeline: PipelineSettings,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Fixed output encoder configuration. Every merge uses the same values
/// regardless of the inputs' resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    pub mime: String,
    pub width: u32,
    pub height: u32,
    /// Target bitrate in bits per second.
    pub bit_rate: u32,
    pub frame_rate: u32,
    /// Seconds between key frames.
    pub key_frame_interval_secs: u32,
}

/// Timeouts and rendering constants for the merge loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Bounded wait for decoder buffer dequeues.
    pub codec_timeout_ms: u64,

    /// Poll interval used while draining the encoder at end of stream.
    pub eos_poll_ms: u64,

    /// Upper bound for the end-of-stream drain.
    pub eos_drain_timeout_ms: u64,

    /// Abort the merge if neither source produces a frame for this long.
    pub stall_timeout_ms: u64,

    /// RGBA clear colour applied before each composed frame.
    pub clear_color: [f32; 4],

    /// Warn once when the two sources' timestamps diverge by more than this.
    pub drift_warn_ms: f64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "duocam=debug,warn").
    pub level: String,

    /// Whether to output structured JSON logs.
    pub json: bool,

    /// Optional log file path.
    pub file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            output_dir: dirs_default_output(),
            output_file_name: DEFAULT_OUTPUT_FILE_NAME.to_string(),
            encoder: EncoderSettings::default(),
            pipeline: PipelineSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            mime: DEFAULT_OUTPUT_MIME.to_string(),
            width: 1920,
            height: 1080,
            bit_rate: 5_000_000,
            frame_rate: 30,
            key_frame_interval_secs: 1,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            codec_timeout_ms: 10,
            eos_poll_ms: 10,
            eos_drain_timeout_ms: 5_000,
            stall_timeout_ms: 10_000,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            drift_warn_ms: 500.0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

impl EncoderSettings {
    /// Reject values no encoder would accept.
    pub fn validate(&self) -> DuocamResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(DuocamError::config(format!(
                "output size {}x{} must be non-zero",
                self.width, self.height
            )));
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(DuocamError::config(format!(
                "output size {}x{} must be even for 4:2:0 chroma",
                self.width, self.height
            )));
        }
        if self.bit_rate == 0 {
            return Err(DuocamError::config("bit_rate must be positive"));
        }
        if self.frame_rate == 0 {
            return Err(DuocamError::config("frame_rate must be positive"));
        }
        if self.key_frame_interval_secs == 0 {
            return Err(DuocamError::config("key_frame_interval_secs must be positive"));
        }
        Ok(())
    }

    /// Number of frames between key frames.
    pub fn key_frame_interval_frames(&self) -> u32 {
        self.frame_rate * self.key_frame_interval_secs
    }
}

impl PipelineSettings {
    pub fn codec_timeout(&self) -> Duration {
        Duration::from_millis(self.codec_timeout_ms)
    }

    pub fn eos_poll(&self) -> Duration {
        Duration::from_millis(self.eos_poll_ms)
    }

    pub fn eos_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.eos_drain_timeout_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

impl AppConfig {
    /// Load config from the standard location, falling back to defaults.
    pub fn load() -> Self {
        Self::load_from(&config_file_path())
    }

    /// Load config from an explicit path, falling back to defaults.
    pub fn load_from(config_path: &std::path::Path) -> Self {
        if config_path.exists() {
            match std::fs::read_to_string(config_path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Failed to parse config at {:?}: {}", config_path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read config at {:?}: {}", config_path, e);
                }
            }
        }
        Self::default()
    }

    /// Save config to the standard location.
    pub fn save(&self) -> DuocamResult<()> {
        self.save_to(&config_file_path())
    }

    pub fn save_to(&self, config_path: &std::path::Path) -> DuocamResult<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(config_path, json)?;
        Ok(())
    }

    /// Full path of the merged artifact.
    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join(&self.output_file_name)
    }
}

/// Standard config file location.
pub fn config_file_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        });
    base.join("duocam").join("config.json")
}

/// Default directory for merged output.
fn dirs_default_output() -> PathBuf {
    let base = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local").join("share")
        });
    base.join("duocam").join("merged")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_encoder_matches_output_contract() {
        let enc = EncoderSettings::default();
        assert_eq!(enc.mime, "video/avc");
        assert_eq!((enc.width, enc.height), (1920, 1080));
        assert_eq!(enc.bit_rate, 5_000_000);
        assert_eq!(enc.frame_rate, 30);
        assert_eq!(enc.key_frame_interval_frames(), 30);
        assert!(enc.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_odd_size() {
        let enc = EncoderSettings {
            width: 641,
            ..Default::default()
        };
        assert!(matches!(enc.validate(), Err(DuocamError::Config { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_rate() {
        let enc = EncoderSettings {
            frame_rate: 0,
            ..Default::default()
        };
        assert!(enc.validate().is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = AppConfig::default();
        config.output_file_name = "out.mp4".into();
        config.pipeline.stall_timeout_ms = 42;
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path);
        assert_eq!(loaded.output_file_name, "out.mp4");
        assert_eq!(loaded.pipeline.stall_timeout_ms, 42);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"encoder": {"bit_rate": 1000}}"#).unwrap();
        let loaded = AppConfig::load_from(&path);
        assert_eq!(loaded.encoder.bit_rate, 1000);
        assert_eq!(loaded.encoder.width, 1920);
        assert_eq!(loaded.output_file_name, DEFAULT_OUTPUT_FILE_NAME);
    }

    #[test]
    fn test_invalid_config_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();
        let loaded = AppConfig::load_from(&path);
        assert_eq!(loaded.encoder, EncoderSettings::default());
    }
}
