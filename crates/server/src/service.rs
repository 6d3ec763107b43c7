//! Server assembly and lifecycle.
//!
//! Wires the hardware profile, load monitor, registry, engine, bus, and
//! HTTP surface together, and runs the background tasks.

use std::path::PathBuf;
use std::sync::Arc;
use streamforge_config::Config;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

use crate::api::{build_router, AppState};
use crate::bus::ProgressBus;
use crate::engine::TranscodeEngine;
use crate::hardware::{self, Capabilities, ProbeError};
use crate::monitor::LoadMonitor;
use crate::registry::JobRegistry;
use crate::startup::{run_startup_checks, StartupError};
use crate::stats::new_shared_stats;

/// Error type for server assembly and serving.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The encoder tool is missing; maps to exit code 2.
    #[error("startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Hardware probing failed fatally (encoder tool absent).
    #[error("hardware probe failed: {0}")]
    Probe(#[from] ProbeError),

    /// Could not create the temp root.
    #[error("failed to prepare temp directory: {0}")]
    TempDir(std::io::Error),

    /// Could not bind or serve.
    #[error("server error: {0}")]
    Server(std::io::Error),
}

impl ServiceError {
    /// Whether the failure means the encoder tool is absent.
    pub fn is_encoder_missing(&self) -> bool {
        matches!(
            self,
            ServiceError::Startup(StartupError::FfmpegMissing(_))
                | ServiceError::Probe(ProbeError::FfmpegMissing(_))
        )
    }
}

/// The assembled transcoding server.
pub struct TranscodeServer {
    config: Arc<Config>,
    capabilities: Arc<Capabilities>,
    registry: Arc<JobRegistry>,
    engine: Arc<TranscodeEngine>,
    bus: Arc<ProgressBus>,
    monitor: LoadMonitor,
    state: AppState,
    queue_rx: Option<mpsc::Receiver<String>>,
}

impl TranscodeServer {
    /// Assemble the server: run startup checks, probe the hardware, and
    /// build every component. Does not start any background task yet.
    pub fn new(config: Config) -> Result<Self, ServiceError> {
        let ffmpeg_path = PathBuf::from("ffmpeg");
        run_startup_checks(&ffmpeg_path)?;

        let capabilities = Arc::new(hardware::probe(&ffmpeg_path)?);
        info!(
            tier = %capabilities.tier,
            ffmpeg = %capabilities.ffmpeg_version,
            families = ?capabilities.available_families(),
            "hardware profile ready"
        );

        std::fs::create_dir_all(&config.transcoding.temp_directory)
            .map_err(ServiceError::TempDir)?;

        let config = Arc::new(config);
        let bus = ProgressBus::new();
        let stats = new_shared_stats();
        let monitor = LoadMonitor::new();

        let (registry, queue_rx) = JobRegistry::new(
            bus.clone(),
            config.server.base_url(),
            config.transcoding.temp_directory.clone(),
        );

        let engine = TranscodeEngine::new(
            registry.clone(),
            bus.clone(),
            stats.clone(),
            capabilities.clone(),
            monitor.sample_handle(),
            config.transcoding.clone(),
            config.hardware.clone(),
            ffmpeg_path,
        );

        let state = AppState {
            registry: registry.clone(),
            bus: bus.clone(),
            capabilities: capabilities.clone(),
            sample: monitor.sample_handle(),
            stats,
            config: config.clone(),
        };

        Ok(Self {
            config,
            capabilities,
            registry,
            engine,
            bus,
            monitor,
            state,
            queue_rx: Some(queue_rx),
        })
    }

    pub fn capabilities(&self) -> &Arc<Capabilities> {
        &self.capabilities
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<ProgressBus> {
        &self.bus
    }

    /// The application router; useful for tests.
    pub fn router(&self) -> axum::Router {
        build_router(self.state.clone())
    }

    /// Start background tasks and serve until shutdown.
    pub async fn run(mut self) -> Result<(), ServiceError> {
        self.registry.sweep_orphaned_dirs().await;

        let _monitor_task = self.monitor.spawn();
        let _janitor_task = self.registry.spawn_janitor();
        let queue_rx = self
            .queue_rx
            .take()
            .expect("run consumes the server exactly once");
        let _dispatcher_task = self.engine.spawn_dispatcher(queue_rx);

        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(ServiceError::Server)?;
        info!(addr = %addr, "server listening");

        axum::serve(listener, self.router())
            .await
            .map_err(ServiceError::Server)
    }
}
