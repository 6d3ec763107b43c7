//! Media probing via ffprobe.
//!
//! Collects the source facts the planner needs: dimensions, duration,
//! frame rate, audio channels, and the color metadata used for HDR
//! detection.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

/// Error type for media probe operations.
#[derive(Debug, Error)]
pub enum MediaProbeError {
    /// ffprobe could not be executed or exited non-zero.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// The source has no usable video stream.
    #[error("no video stream in source")]
    NoVideoStream,

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Facts about a media source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub width: u32,
    pub height: u32,
    pub duration_s: f64,
    pub fps: f32,
    pub video_codec: String,
    pub audio_channels: u32,
    pub pix_fmt: String,
    pub color_transfer: Option<String>,
    pub color_primaries: Option<String>,
}

impl MediaInfo {
    /// Whether the source is HDR.
    ///
    /// Transfer function smpte2084 or arib-std-b67, or a deep pixel format
    /// combined with wide (bt2020) primaries.
    pub fn is_hdr(&self) -> bool {
        if let Some(transfer) = &self.color_transfer {
            let t = transfer.to_lowercase();
            if t == "smpte2084" || t == "arib-std-b67" {
                return true;
            }
        }
        let deep = self.pix_fmt.contains("10") || self.pix_fmt.contains("12");
        let wide = self
            .color_primaries
            .as_deref()
            .map(|p| p.to_lowercase().contains("bt2020"))
            .unwrap_or(false);
        deep && wide
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub r_frame_rate: Option<String>,
        pub channels: Option<u32>,
        pub pix_fmt: Option<String>,
        pub color_transfer: Option<String>,
        pub color_primaries: Option<String>,
        pub duration: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }
}

/// Parse an ffprobe rational like "30000/1001" into frames per second.
fn parse_frame_rate(rate: &str) -> f32 {
    let mut parts = rate.split('/');
    let num: f32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0.0);
    let den: f32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(1.0);
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

/// Parse ffprobe JSON output into MediaInfo.
pub fn parse_ffprobe_output(json_str: &str) -> Result<MediaInfo, MediaProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| MediaProbeError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();

    let video = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or(MediaProbeError::NoVideoStream)?;

    let audio_channels = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"))
        .and_then(|s| s.channels)
        .unwrap_or(0);

    let duration_s = ffprobe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_ref())
        .or(video.duration.as_ref())
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    Ok(MediaInfo {
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        duration_s,
        fps: video
            .r_frame_rate
            .as_deref()
            .map(parse_frame_rate)
            .unwrap_or(0.0),
        video_codec: video.codec_name.clone().unwrap_or_default(),
        audio_channels,
        pix_fmt: video.pix_fmt.clone().unwrap_or_default(),
        color_transfer: video.color_transfer.clone(),
        color_primaries: video.color_primaries.clone(),
    })
}

/// Probe a source with ffprobe.
///
/// Runs `ffprobe -v quiet -print_format json -show_streams -show_format`.
pub async fn probe_source(source: &str) -> Result<MediaInfo, MediaProbeError> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ])
        .arg(source)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(MediaProbeError::FfprobeFailed(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    parse_ffprobe_output(&String::from_utf8_lossy(&output.stdout))
}
