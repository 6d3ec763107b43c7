//! Job data model for the transcoding server.
//!
//! Defines the validated transcode request, the job record owned by the
//! registry for the job's whole lifetime, and the status state machine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

/// Transcoding mode requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscodeMode {
    /// Single-rendition HLS stream.
    Stream,
    /// Adaptive-bitrate HLS with a quality ladder.
    Abr,
    /// Single-file output in the requested container.
    Batch,
}

impl std::fmt::Display for TranscodeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranscodeMode::Stream => write!(f, "stream"),
            TranscodeMode::Abr => write!(f, "abr"),
            TranscodeMode::Batch => write!(f, "batch"),
        }
    }
}

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is waiting in the queue.
    Queued,
    /// Job has an active encoder subprocess (or is between retry attempts).
    Processing,
    /// Job finished and its artifacts are complete.
    Ready,
    /// Job failed after retries and fallback were exhausted.
    Error,
    /// Job was cancelled by the client.
    Cancelled,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Ready => write!(f, "ready"),
            JobStatus::Error => write!(f, "error"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl JobStatus {
    /// Check if the status is terminal (ready, error, or cancelled).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Ready | JobStatus::Error | JobStatus::Cancelled
        )
    }

    /// Check if a transition to `next` is legal for an external observer.
    ///
    /// The internal retry path (processing staying processing across
    /// attempts) is covered by the identity transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (a, b) if *a == b => true,
            (JobStatus::Queued, JobStatus::Processing) => true,
            (JobStatus::Queued, JobStatus::Cancelled) => true,
            (JobStatus::Processing, JobStatus::Ready) => true,
            (JobStatus::Processing, JobStatus::Error) => true,
            (JobStatus::Processing, JobStatus::Cancelled) => true,
            _ => false,
        }
    }
}

/// Output resolution selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Resolution {
    /// Let the admission controller and tier pick.
    #[default]
    #[serde(rename = "auto")]
    Auto,
    /// Keep the source resolution (still capped by the tier).
    #[serde(rename = "original")]
    Original,
    #[serde(rename = "2160p", alias = "4k")]
    P2160,
    #[serde(rename = "1440p")]
    P1440,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "360p")]
    P360,
}

impl Resolution {
    /// Target height in pixels, if the selector names one.
    pub fn height(&self) -> Option<u32> {
        match self {
            Resolution::Auto | Resolution::Original => None,
            Resolution::P2160 => Some(2160),
            Resolution::P1440 => Some(1440),
            Resolution::P1080 => Some(1080),
            Resolution::P720 => Some(720),
            Resolution::P480 => Some(480),
            Resolution::P360 => Some(360),
        }
    }
}

/// Target video codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VideoCodec {
    #[default]
    H264,
    H265,
    Vp9,
    Av1,
    Copy,
}

impl VideoCodec {
    /// Whether the codec is an 8-bit H.264/H.265 target that needs a
    /// tone-mapping stage for HDR sources.
    pub fn needs_tonemap_for_hdr(&self) -> bool {
        matches!(self, VideoCodec::H264 | VideoCodec::H265)
    }
}

/// Target audio codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AudioCodec {
    #[default]
    Aac,
    Opus,
    Mp3,
    Flac,
    Copy,
}

/// Container for batch mode output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Mp4,
    Mkv,
    Webm,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "mp4",
            OutputFormat::Mkv => "mkv",
            OutputFormat::Webm => "webm",
        }
    }
}

/// Requested hardware acceleration family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HwAccelChoice {
    #[default]
    Auto,
    Nvenc,
    Qsv,
    Vaapi,
    Amf,
    Videotoolbox,
    Software,
}

impl std::fmt::Display for HwAccelChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HwAccelChoice::Auto => "auto",
            HwAccelChoice::Nvenc => "nvenc",
            HwAccelChoice::Qsv => "qsv",
            HwAccelChoice::Vaapi => "vaapi",
            HwAccelChoice::Amf => "amf",
            HwAccelChoice::Videotoolbox => "videotoolbox",
            HwAccelChoice::Software => "software",
        };
        write!(f, "{}", s)
    }
}

/// A subtitle track declared with the request.
///
/// Tracks are fetched into the job's working directory and referenced by the
/// master playlist as SUBTITLES media entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleTrack {
    /// Where to fetch the track from.
    pub url: String,
    /// Language code; also names the file on disk.
    pub lang: String,
    /// Human readable name shown by players.
    #[serde(default)]
    pub name: Option<String>,
    /// Whether the track is the default selection.
    #[serde(default)]
    pub default: bool,
}

/// Output configuration for a transcode request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OutputConfig {
    #[serde(default)]
    pub resolution: Resolution,
    #[serde(default)]
    pub video_codec: VideoCodec,
    #[serde(default)]
    pub audio_codec: AudioCodec,
    /// Container for batch mode; ignored for stream/abr.
    #[serde(default)]
    pub format: OutputFormat,
    /// Explicit video bitrate like "8M" or "800k"; derived from the ladder
    /// when absent.
    #[serde(default)]
    pub bitrate: Option<String>,
    #[serde(default)]
    pub hw_accel: HwAccelChoice,
    /// Audio is downmixed to at most this many channels.
    #[serde(default = "default_max_audio_channels")]
    pub max_audio_channels: u32,
    /// Two-pass encoding for batch mode.
    #[serde(default)]
    pub two_pass: bool,
}

fn default_max_audio_channels() -> u32 {
    2
}

/// A validated transcoding request. Immutable for the job's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeRequest {
    /// Source URL or path handed to the encoder.
    pub source: String,
    pub mode: TranscodeMode,
    #[serde(default)]
    pub output: OutputConfig,
    /// Seek offset in seconds, passed as an input-side seek.
    #[serde(default)]
    pub start_time: f64,
    #[serde(default)]
    pub subtitles: Vec<SubtitleTrack>,
    /// POSTed a single status snapshot when the job completes.
    #[serde(default)]
    pub callback_url: Option<String>,
}

/// Latest encoding telemetry reported by the subprocess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct JobTelemetry {
    /// Percentage 0-100, non-decreasing within one attempt.
    pub progress: f32,
    pub current_time_s: f64,
    pub duration_s: f64,
    pub speed: f32,
    pub fps: f32,
    pub frame: u64,
    pub eta_s: Option<u64>,
}

/// The central job record, owned by the registry for its entire lifetime.
///
/// Mutated exclusively through the worker that owns the job once it leaves
/// the queue; everyone else reads cloned snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub request: TranscodeRequest,
    pub status: JobStatus,
    #[serde(flatten)]
    pub telemetry: JobTelemetry,
    /// Encoder family actually used in the current attempt.
    pub hw_accel_used: Option<String>,
    pub stream_url: Option<String>,
    pub download_url: Option<String>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub updated_at: i64,
    pub finished_at: Option<i64>,
    /// 0-based retry counter; reset when replanning onto software.
    pub attempt: u32,
    pub working_dir: PathBuf,
    /// Last time a client touched the job (status read or segment fetch).
    #[serde(skip)]
    pub last_accessed: i64,
    /// One-shot cancellation handle observed by the worker.
    #[serde(skip)]
    pub cancel: CancellationToken,
}

impl Job {
    /// Create a new queued job record.
    pub fn new(id: String, request: TranscodeRequest, working_dir: PathBuf) -> Self {
        let now = now_ms();
        Self {
            id,
            request,
            status: JobStatus::Queued,
            telemetry: JobTelemetry::default(),
            hw_accel_used: None,
            stream_url: None,
            download_url: None,
            error_message: None,
            created_at: now,
            started_at: None,
            updated_at: now,
            finished_at: None,
            attempt: 0,
            working_dir,
            last_accessed: now,
            cancel: CancellationToken::new(),
        }
    }

    /// Update the job's updated_at timestamp to now.
    pub fn touch(&mut self) {
        self.updated_at = now_ms();
    }

    /// Record a client access for janitor bookkeeping.
    pub fn touch_access(&mut self) {
        self.last_accessed = now_ms();
    }

    /// Set the job status, stamping the relevant lifecycle timestamps.
    pub fn set_status(&mut self, status: JobStatus) {
        if status == JobStatus::Processing && self.started_at.is_none() {
            self.started_at = Some(now_ms());
        }
        if status.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(now_ms());
        }
        self.status = status;
        self.touch();
    }

    /// Mark the job as failed with a reason.
    pub fn fail(&mut self, reason: &str) {
        self.error_message = Some(reason.to_string());
        self.set_status(JobStatus::Error);
    }

    /// Apply telemetry from the progress stream.
    ///
    /// Progress is clamped to be non-decreasing within the current attempt;
    /// everything else is taken as reported.
    pub fn apply_telemetry(&mut self, update: &JobTelemetry) {
        let floor = self.telemetry.progress;
        self.telemetry = update.clone();
        if self.telemetry.progress < floor {
            self.telemetry.progress = floor;
        }
        self.touch();
    }

    /// Reset telemetry for a fresh attempt.
    pub fn begin_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
        self.telemetry.progress = 0.0;
        self.telemetry.current_time_s = 0.0;
        self.telemetry.speed = 0.0;
        self.telemetry.fps = 0.0;
        self.telemetry.frame = 0;
        self.telemetry.eta_s = None;
        self.touch();
    }

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The JSON snapshot posted to completion callbacks.
    pub fn callback_snapshot(&self) -> serde_json::Value {
        let mut map = BTreeMap::new();
        map.insert("job_id", serde_json::json!(self.id));
        map.insert("status", serde_json::json!(self.status));
        map.insert("progress", serde_json::json!(self.telemetry.progress));
        map.insert("stream_url", serde_json::json!(self.stream_url));
        map.insert("download_url", serde_json::json!(self.download_url));
        map.insert("hw_accel_used", serde_json::json!(self.hw_accel_used));
        map.insert("error_message", serde_json::json!(self.error_message));
        serde_json::to_value(map).unwrap_or_default()
    }
}

/// Current timestamp in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
