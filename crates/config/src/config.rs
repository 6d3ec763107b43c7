//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Bind address (default 0.0.0.0)
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port (default 8765)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Externally reachable base URL used in stream/download links.
    /// Falls back to `http://{host}:{port}` when unset.
    #[serde(default)]
    pub public_url: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8765
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: None,
        }
    }
}

impl ServerConfig {
    /// Base URL for links handed out to clients.
    pub fn base_url(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.host, self.port),
        }
    }
}

/// Transcoding pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscodingConfig {
    /// Maximum concurrent jobs (0 = derive from hardware tier)
    #[serde(default)]
    pub max_concurrent_jobs: u32,
    /// HLS segment duration in seconds (default 4)
    #[serde(default = "default_segment_duration_s")]
    pub segment_duration_s: u32,
    /// Root directory for per-job working directories
    #[serde(default = "default_temp_directory")]
    pub temp_directory: PathBuf,
    /// Whether the abr mode is offered at all (default true)
    #[serde(default = "default_true")]
    pub enable_abr: bool,
    /// Maximum quality variants for abr mode (default 4)
    #[serde(default = "default_abr_max_variants")]
    pub abr_max_variants: u32,
    /// Insert a tone-mapping stage for HDR sources targeting 8-bit codecs
    #[serde(default = "default_true")]
    pub tone_map_hdr: bool,
    /// Retries for transient encoder failures (default 3)
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Seconds without progress before the encoder is considered stalled
    #[serde(default = "default_stall_timeout_s")]
    pub stall_timeout_s: u64,
}

fn default_segment_duration_s() -> u32 {
    4
}

fn default_temp_directory() -> PathBuf {
    PathBuf::from("/tmp/streamforge")
}

fn default_true() -> bool {
    true
}

fn default_abr_max_variants() -> u32 {
    4
}

fn default_retry_count() -> u32 {
    3
}

fn default_stall_timeout_s() -> u64 {
    120
}

impl Default for TranscodingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 0,
            segment_duration_s: default_segment_duration_s(),
            temp_directory: default_temp_directory(),
            enable_abr: true,
            abr_max_variants: default_abr_max_variants(),
            tone_map_hdr: true,
            retry_count: default_retry_count(),
            stall_timeout_s: default_stall_timeout_s(),
        }
    }
}

/// Hardware acceleration configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HardwareConfig {
    /// Prefer hardware encoders when `hw_accel = auto` (default true)
    #[serde(default = "default_true")]
    pub prefer_hw_accel: bool,
    /// Replan onto a software encoder when a hardware encoder faults
    #[serde(default = "default_true")]
    pub fallback_to_software: bool,
    /// NVENC preset passed to ffmpeg (default p4)
    #[serde(default = "default_nvenc_preset")]
    pub nvenc_preset: String,
}

fn default_nvenc_preset() -> String {
    "p4".to_string()
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            prefer_hw_accel: true,
            fallback_to_software: true,
            nvenc_preset: default_nvenc_preset(),
        }
    }
}

/// Security configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SecurityConfig {
    /// Shared API token; requests must carry it when set (default none)
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub transcoding: TranscodingConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the file and fills missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - SERVER_HOST -> server.host
    /// - SERVER_PORT -> server.port
    /// - MAX_CONCURRENT_JOBS -> transcoding.max_concurrent_jobs
    /// - TEMP_DIRECTORY -> transcoding.temp_directory
    /// - STALL_TIMEOUT_S -> transcoding.stall_timeout_s
    /// - RETRY_COUNT -> transcoding.retry_count
    /// - API_KEY -> security.api_key
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("SERVER_HOST") {
            if !val.is_empty() {
                self.server.host = val;
            }
        }

        if let Ok(val) = env::var("SERVER_PORT") {
            if let Ok(port) = val.parse::<u16>() {
                self.server.port = port;
            }
        }

        if let Ok(val) = env::var("MAX_CONCURRENT_JOBS") {
            if let Ok(jobs) = val.parse::<u32>() {
                self.transcoding.max_concurrent_jobs = jobs;
            }
        }

        if let Ok(val) = env::var("TEMP_DIRECTORY") {
            if !val.is_empty() {
                self.transcoding.temp_directory = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("STALL_TIMEOUT_S") {
            if let Ok(secs) = val.parse::<u64>() {
                self.transcoding.stall_timeout_s = secs;
            }
        }

        if let Ok(val) = env::var("RETRY_COUNT") {
            if let Ok(count) = val.parse::<u32>() {
                self.transcoding.retry_count = count;
            }
        }

        if let Ok(val) = env::var("API_KEY") {
            if !val.is_empty() {
                self.security.api_key = Some(val);
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Default configuration with environment overrides applied
    ///
    /// Used when no config file is present on disk.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }
}
