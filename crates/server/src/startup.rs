//! Startup checks.
//!
//! The only fatal precondition is a missing encoder tool; everything else
//! (GPU utilities, battery hints) degrades at probe time.

use std::path::Path;
use std::process::Command;
use thiserror::Error;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("ffmpeg not available: {0}")]
    FfmpegMissing(String),

    #[error("ffprobe not available: {0}")]
    FfprobeMissing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Verify the encoder tool runs at all.
pub fn check_ffmpeg_available(ffmpeg_path: &Path) -> Result<(), StartupError> {
    let output = Command::new(ffmpeg_path)
        .arg("-version")
        .output()
        .map_err(|e| {
            StartupError::FfmpegMissing(format!(
                "{} -version failed; is ffmpeg installed and in PATH? Error: {}",
                ffmpeg_path.display(),
                e
            ))
        })?;

    if !output.status.success() {
        return Err(StartupError::FfmpegMissing(format!(
            "{} -version exited with {}",
            ffmpeg_path.display(),
            output.status
        )));
    }
    Ok(())
}

/// Verify ffprobe runs; probing is required to plan any job.
pub fn check_ffprobe_available() -> Result<(), StartupError> {
    let output = Command::new("ffprobe").arg("-version").output().map_err(|e| {
        StartupError::FfprobeMissing(format!(
            "ffprobe -version failed; is ffprobe installed and in PATH? Error: {}",
            e
        ))
    })?;

    if !output.status.success() {
        return Err(StartupError::FfprobeMissing(
            "ffprobe -version failed".to_string(),
        ));
    }
    Ok(())
}

/// Run all startup checks in order.
pub fn run_startup_checks(ffmpeg_path: &Path) -> Result<(), StartupError> {
    check_ffmpeg_available(ffmpeg_path)?;
    check_ffprobe_available()?;
    Ok(())
}
