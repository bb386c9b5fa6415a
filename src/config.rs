//! Stream configuration
//!
//! Values are layered lowest to highest: built-in defaults, an optional JSON file,
//! then `VOSPI_*` environment variables. The binary applies CLI flags on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::colormap::Palette;
use crate::frame_buffer::OverflowPolicy;
use crate::packet::FrameGeometry;

/// Largest line number the 12-bit identifier field can carry
const MAX_LINE_FIELD: usize = 0x0FFF;

/// Errors that can occur while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// I/O error reading the configuration file.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// File that failed to load
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Configuration file is not valid JSON for [`StreamConfig`].
    #[error("invalid config file: {0}")]
    Json(#[from] serde_json::Error),

    /// A value is out of its allowed range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type alias for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Bus parameters handed to the transport opener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpiConfig {
    /// Device node, e.g. `/dev/spidev0.0`
    pub device: String,
    /// SPI mode (0-3); the sensor uses mode 3
    pub mode: u8,
    /// Bits per word
    pub bits_per_word: u8,
    /// Maximum clock rate in Hz
    pub speed_hz: u32,
}

impl Default for SpiConfig {
    fn default() -> Self {
        Self {
            device: "/dev/spidev0.0".to_string(),
            mode: 3,
            bits_per_word: 8,
            speed_hz: 10_000_000,
        }
    }
}

/// Synchronization and resync backoff policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Consecutive discard packets tolerated while locating frame start
    pub max_discards: u32,
    /// Consecutive failed frames tolerated before the capture path idles the bus
    pub resync_threshold: u32,
    /// Bus idle time for a resync, at least the sensor's 5-frame minimum (185 ms)
    pub backoff_ms: u64,
    /// Check each packet's CRC-16 before trusting its payload
    pub verify_crc: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_discards: 200,
            resync_threshold: 5,
            backoff_ms: 185,
            verify_crc: false,
        }
    }
}

impl SyncConfig {
    /// Backoff interval as a `Duration`
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Pacing and hand-off settings for the stream controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Target presentation rate in frames per second
    pub target_fps: u32,
    /// Frames the hand-off buffer can hold
    pub queue_capacity: usize,
    /// What happens when the capture path outruns the consumer
    pub overflow: OverflowPolicy,
    /// Consumer sleep when the buffer is empty, in microseconds
    pub idle_poll_us: u64,
    /// Interval between FPS/status log lines, in milliseconds
    pub status_interval_ms: u64,
    /// Consecutive resync backoffs before the link is reported as "no signal"
    pub no_signal_after: u32,
    /// Initial bus idle before the first sync attempt, in milliseconds
    pub startup_idle_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            target_fps: 27,
            queue_capacity: 3,
            overflow: OverflowPolicy::DropOldest,
            idle_poll_us: 1000,
            status_interval_ms: 1000,
            no_signal_after: 5,
            startup_idle_ms: 300,
        }
    }
}

impl ControllerConfig {
    /// Time budget for one render-and-present cycle
    pub fn frame_budget(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.target_fps.max(1)))
    }

    /// Consumer poll interval when no frame is ready
    pub fn idle_poll(&self) -> Duration {
        Duration::from_micros(self.idle_poll_us)
    }

    /// Interval between status summaries
    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }
}

/// Automatic gain control tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgcConfig {
    /// Minimum dynamic range in raw units
    pub min_range: u16,
    /// Running minimum at process start
    pub initial_min: u16,
    /// Running maximum at process start
    pub initial_max: u16,
}

impl Default for AgcConfig {
    fn default() -> Self {
        Self {
            min_range: 100,
            initial_min: 0,
            initial_max: u16::MAX,
        }
    }
}

/// Complete configuration for a streaming session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Bus parameters
    pub spi: SpiConfig,
    /// Frame geometry
    pub geometry: FrameGeometry,
    /// Synchronizer policy
    pub sync: SyncConfig,
    /// Controller pacing and buffering
    pub controller: ControllerConfig,
    /// Gain control
    pub agc: AgcConfig,
    /// Palette active at startup
    pub initial_palette: Palette,
    /// Directory that receives saved snapshots
    pub snapshot_dir: PathBuf,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            spi: SpiConfig::default(),
            geometry: FrameGeometry::default(),
            sync: SyncConfig::default(),
            controller: ControllerConfig::default(),
            agc: AgcConfig::default(),
            initial_palette: Palette::default(),
            snapshot_dir: PathBuf::from("."),
        }
    }
}

impl StreamConfig {
    /// Load a configuration from a JSON file; missing fields take defaults
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` if the file cannot be read and
    /// `ConfigError::Json` if it does not parse.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: StreamConfig = serde_json::from_str(&json)?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Apply `VOSPI_*` environment variable overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(device) = lookup("VOSPI_DEVICE") {
            self.spi.device = device;
        }
        if let Some(speed) = parse_env(&lookup, "VOSPI_SPEED_HZ") {
            self.spi.speed_hz = speed;
        }
        if let Some(fps) = parse_env(&lookup, "VOSPI_TARGET_FPS") {
            self.controller.target_fps = fps;
        }
        if let Some(capacity) = parse_env(&lookup, "VOSPI_QUEUE_CAPACITY") {
            self.controller.queue_capacity = capacity;
        }
        if let Some(raw) = lookup("VOSPI_OVERFLOW") {
            match OverflowPolicy::from_env_str(&raw) {
                Some(policy) => self.controller.overflow = policy,
                None => log::warn!("Ignoring VOSPI_OVERFLOW='{}': unknown policy", raw),
            }
        }
        if let Some(raw) = lookup("VOSPI_PALETTE") {
            match Palette::from_env_str(&raw) {
                Some(palette) => self.initial_palette = palette,
                None => log::warn!("Ignoring VOSPI_PALETTE='{}': unknown palette", raw),
            }
        }
        if let Some(verify) = lookup("VOSPI_VERIFY_CRC") {
            self.sync.verify_crc = matches!(
                verify.to_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
    }

    /// Check that the configuration describes a usable stream
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first offending value.
    pub fn validate(&self) -> Result<()> {
        if self.geometry.width == 0 || self.geometry.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "frame geometry {}x{} has no samples",
                self.geometry.width, self.geometry.height
            )));
        }
        if self.geometry.height > MAX_LINE_FIELD {
            return Err(ConfigError::Invalid(format!(
                "frame height {} does not fit the 12-bit line field",
                self.geometry.height
            )));
        }
        if self.controller.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue capacity must be at least 1".to_string(),
            ));
        }
        if self.controller.target_fps == 0 {
            return Err(ConfigError::Invalid(
                "target fps must be at least 1".to_string(),
            ));
        }
        if self.spi.mode > 3 {
            return Err(ConfigError::Invalid(format!(
                "SPI mode {} is not 0-3",
                self.spi.mode
            )));
        }
        Ok(())
    }
}

fn parse_env<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring {}='{}': not a valid value", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_sensor() {
        let config = StreamConfig::default();
        assert_eq!(config.spi.device, "/dev/spidev0.0");
        assert_eq!(config.spi.mode, 3);
        assert_eq!(config.spi.speed_hz, 10_000_000);
        assert_eq!(config.geometry, FrameGeometry::LEPTON);
        assert_eq!(config.sync.max_discards, 200);
        assert_eq!(config.sync.backoff(), Duration::from_millis(185));
        assert_eq!(config.controller.target_fps, 27);
        assert_eq!(config.controller.frame_budget(), Duration::from_millis(37));
        assert_eq!(config.controller.overflow, OverflowPolicy::DropOldest);
        assert_eq!(config.agc.min_range, 100);
        assert_eq!(config.initial_palette, Palette::Iron);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = StreamConfig::default();
        config.apply_env_with(lookup_from(&[
            ("VOSPI_DEVICE", "/dev/spidev1.0"),
            ("VOSPI_SPEED_HZ", "16000000"),
            ("VOSPI_TARGET_FPS", "9"),
            ("VOSPI_QUEUE_CAPACITY", "2"),
            ("VOSPI_OVERFLOW", "drop-newest"),
            ("VOSPI_PALETTE", "grayscale"),
            ("VOSPI_VERIFY_CRC", "true"),
        ]));

        assert_eq!(config.spi.device, "/dev/spidev1.0");
        assert_eq!(config.spi.speed_hz, 16_000_000);
        assert_eq!(config.controller.target_fps, 9);
        assert_eq!(config.controller.queue_capacity, 2);
        assert_eq!(config.controller.overflow, OverflowPolicy::DropNewest);
        assert_eq!(config.initial_palette, Palette::Grayscale);
        assert!(config.sync.verify_crc);
    }

    #[test]
    fn test_env_ignores_garbage_numbers() {
        let mut config = StreamConfig::default();
        config.apply_env_with(lookup_from(&[
            ("VOSPI_TARGET_FPS", "fast"),
            ("VOSPI_PALETTE", "plasma"),
            ("VOSPI_OVERFLOW", "block"),
        ]));
        assert_eq!(config.controller.target_fps, 27);
        assert_eq!(config.initial_palette, Palette::Iron);
        assert_eq!(config.controller.overflow, OverflowPolicy::DropOldest);
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let json = r#"{ "controller": { "target_fps": 9 }, "initial_palette": "rainbow" }"#;
        let config: StreamConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.controller.target_fps, 9);
        assert_eq!(config.controller.queue_capacity, 3);
        assert_eq!(config.initial_palette, Palette::Rainbow);
        assert_eq!(config.geometry, FrameGeometry::LEPTON);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.json");
        std::fs::write(&path, r#"{ "geometry": { "width": 160, "height": 120 } }"#).unwrap();

        let config = StreamConfig::from_file(&path).unwrap();
        assert_eq!(config.geometry, FrameGeometry::new(160, 120));
        assert_eq!(config.geometry.packet_size(), 324);
    }

    #[test]
    fn test_from_file_missing() {
        let result = StreamConfig::from_file(Path::new("/nonexistent/stream.json"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = StreamConfig::default();
        config.controller.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = StreamConfig::default();
        config.geometry = FrameGeometry::new(80, 0);
        assert!(config.validate().is_err());

        let mut config = StreamConfig::default();
        config.geometry = FrameGeometry::new(80, 5000);
        assert!(config.validate().is_err());

        let mut config = StreamConfig::default();
        config.controller.target_fps = 0;
        assert!(config.validate().is_err());
    }
}
