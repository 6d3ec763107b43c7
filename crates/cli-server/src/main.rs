//! CLI entry point for the StreamForge transcoding server.
//!
//! Parses command line arguments, loads configuration, and runs the server.
//! Exit codes: 0 clean shutdown, 1 fatal startup error, 2 encoder tool
//! missing.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use streamforge::{ServiceError, TranscodeServer};
use streamforge_config::Config;
use tracing_subscriber::{fmt, EnvFilter};

/// StreamForge - adaptive video transcoding server
#[derive(Parser, Debug)]
#[command(name = "streamforge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (TOML). Defaults are used when the
    /// file does not exist.
    #[arg(short, long, default_value = "streamforge.toml")]
    config: PathBuf,

    /// Override the bind port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the temp directory for job working directories.
    #[arg(short, long)]
    temp_dir: Option<PathBuf>,
}

const EXIT_FATAL: u8 = 1;
const EXIT_ENCODER_MISSING: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let mut config = if args.config.exists() {
        match Config::load(&args.config) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(path = %args.config.display(), error = %e, "failed to load config");
                return ExitCode::from(EXIT_FATAL);
            }
        }
    } else {
        Config::from_env()
    };

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(temp_dir) = args.temp_dir {
        config.transcoding.temp_directory = temp_dir;
    }

    let server = match TranscodeServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize server");
            return if e.is_encoder_missing() {
                ExitCode::from(EXIT_ENCODER_MISSING)
            } else {
                ExitCode::from(EXIT_FATAL)
            };
        }
    };

    tracing::info!(
        tier = %server.capabilities().tier,
        "streamforge starting"
    );

    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ ServiceError::Server(_)) => {
            tracing::error!(error = %e, "server error");
            ExitCode::from(EXIT_FATAL)
        }
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            ExitCode::from(EXIT_FATAL)
        }
    }
}
