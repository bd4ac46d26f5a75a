use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::engine::{StreamKind, Timecode, TimecodeError};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no streams configured")]
    NoStreams,
    #[error("invalid timecode threshold: {0}")]
    Timecode(#[from] TimecodeError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SplitConfig {
    /// 0 disables the byte threshold
    #[serde(default)]
    pub max_size_bytes: u64,
    /// 0 disables the time threshold
    #[serde(default = "default_max_size_time_ms")]
    pub max_size_time_ms: u64,
    #[serde(default)]
    pub max_size_timecode: Option<String>,
    #[serde(default = "default_timecode_framerate")]
    pub timecode_framerate: String,
    #[serde(default = "default_mux_overhead")]
    pub mux_overhead: f64,
    #[serde(default)]
    pub alignment_threshold_ms: u64,
    #[serde(default)]
    pub use_robust_muxing: bool,
}

fn default_max_size_time_ms() -> u64 {
    15_000
}

fn default_timecode_framerate() -> String {
    "30".to_string()
}

fn default_mux_overhead() -> f64 {
    0.02
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 0,
            max_size_time_ms: default_max_size_time_ms(),
            max_size_timecode: None,
            timecode_framerate: default_timecode_framerate(),
            mux_overhead: default_mux_overhead(),
            alignment_threshold_ms: 0,
            use_robust_muxing: false,
        }
    }
}

impl SplitConfig {
    /// Parsed timecode threshold, if one is configured.
    pub fn timecode(&self) -> Result<Option<Timecode>, ConfigError> {
        match &self.max_size_timecode {
            Some(tc) => Ok(Some(Timecode::parse(tc, &self.timecode_framerate)?)),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_soft_max_bytes")]
    pub soft_max_bytes: u64,
    #[serde(default = "default_soft_max_time_ms")]
    pub soft_max_time_ms: u64,
    #[serde(default = "default_hard_max_bytes")]
    pub hard_max_bytes: u64,
}

fn default_soft_max_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_soft_max_time_ms() -> u64 {
    3_000
}

fn default_hard_max_bytes() -> u64 {
    256 * 1024 * 1024
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            soft_max_bytes: default_soft_max_bytes(),
            soft_max_time_ms: default_soft_max_time_ms(),
            hard_max_bytes: default_hard_max_bytes(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    #[default]
    Disk,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    #[serde(default)]
    pub cache_mode: CacheMode,
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity_bytes: usize,
}

fn default_location() -> String {
    "segment%05d.ts".to_string()
}

fn default_directory() -> PathBuf {
    PathBuf::from("fragments")
}

fn default_memory_capacity() -> usize {
    32 * 1024 * 1024
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            location: default_location(),
            directory: default_directory(),
            cache_mode: CacheMode::default(),
            memory_capacity_bytes: default_memory_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistConfig {
    /// 0 keeps every entry
    #[serde(default = "default_playlist_length")]
    pub length: usize,
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

fn default_playlist_length() -> usize {
    5
}

fn default_max_files() -> usize {
    10
}

impl Default for PlaylistConfig {
    fn default() -> Self {
        Self {
            length: default_playlist_length(),
            max_files: default_max_files(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    pub kind: StreamKind,
    #[serde(default)]
    pub caps: Option<String>,
    #[serde(default = "default_fps")]
    pub fps: f64,
    #[serde(default = "default_gop_frames")]
    pub gop_frames: u32,
    #[serde(default = "default_bitrate_kbps")]
    pub bitrate_kbps: u32,
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
    #[serde(default)]
    pub start_offset_ms: i64,
}

fn default_fps() -> f64 {
    30.0
}

fn default_gop_frames() -> u32 {
    60
}

fn default_bitrate_kbps() -> u32 {
    2_000
}

fn default_duration_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub split: SplitConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub playlist: PlaylistConfig,
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.streams.is_empty() {
            return Err(ConfigError::NoStreams);
        }
        if !(self.split.mux_overhead >= 0.0 && self.split.mux_overhead.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "mux_overhead must be a non-negative number, got {}",
                self.split.mux_overhead
            )));
        }
        if self.queue.hard_max_bytes < self.queue.soft_max_bytes {
            return Err(ConfigError::Invalid(
                "queue.hard_max_bytes must not be below queue.soft_max_bytes".to_string(),
            ));
        }
        for stream in &self.streams {
            if stream.fps <= 0.0 || !stream.fps.is_finite() {
                return Err(ConfigError::Invalid(format!(
                    "stream {} has invalid fps {}",
                    stream.name, stream.fps
                )));
            }
            if stream.gop_frames == 0 {
                return Err(ConfigError::Invalid(format!(
                    "stream {} has gop_frames = 0",
                    stream.name
                )));
            }
        }
        self.split.timecode()?;
        Ok(())
    }
}
