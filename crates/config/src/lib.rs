//! Configuration crate for the StreamForge transcoding server.

mod config;

pub use config::{
    Config, ConfigError, HardwareConfig, SecurityConfig, ServerConfig, TranscodingConfig,
};
