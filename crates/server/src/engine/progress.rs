//! Progress stream parsing.
//!
//! The encoder is spawned with a progress channel that emits key=value
//! lines (`frame`, `fps`, `out_time_ms`, `speed`) terminated by a
//! `progress=continue|end` line per block. The parser accumulates a block
//! and yields one snapshot per terminator; downstream, snapshots update the
//! registry on every record while bus events are rate limited.

use std::time::{Duration, Instant};

use crate::jobs::JobTelemetry;

/// Minimum interval between progress events per job.
pub const EVENT_INTERVAL: Duration = Duration::from_millis(500);

/// One complete progress block from the encoder.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProgressSnapshot {
    pub frame: Option<u64>,
    pub fps: Option<f32>,
    /// Output position in milliseconds.
    pub out_time_ms: Option<u64>,
    pub speed: Option<f32>,
    /// True when the encoder reported `progress=end`.
    pub finished: bool,
}

/// Incremental parser over the progress stream.
#[derive(Debug, Default)]
pub struct ProgressParser {
    current: ProgressSnapshot,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line; returns a snapshot when the line completes a block.
    pub fn feed_line(&mut self, line: &str) -> Option<ProgressSnapshot> {
        let (key, value) = line.trim().split_once('=')?;
        let value = value.trim();

        match key.trim() {
            "frame" => {
                self.current.frame = value.parse().ok();
                None
            }
            "fps" => {
                if value != "N/A" {
                    self.current.fps = value.parse().ok();
                }
                None
            }
            "out_time_ms" => {
                if value != "N/A" {
                    self.current.out_time_ms = value.parse().ok();
                }
                None
            }
            "speed" => {
                let stripped = value.trim_end_matches('x');
                if stripped != "N/A" {
                    self.current.speed = stripped.parse().ok();
                }
                None
            }
            "progress" => {
                let mut snapshot = self.current.clone();
                snapshot.finished = value == "end";
                Some(snapshot)
            }
            _ => None,
        }
    }
}

/// Convert a snapshot to job telemetry.
///
/// `start_offset_s` is the input-side seek; reported positions are offset
/// by it so that progress reflects the position in the full source.
pub fn telemetry_from(
    snapshot: &ProgressSnapshot,
    duration_s: f64,
    start_offset_s: f64,
    previous: &JobTelemetry,
) -> JobTelemetry {
    let out_time_s = snapshot.out_time_ms.map(|ms| ms as f64 / 1000.0);
    let current_time_s = out_time_s
        .map(|t| start_offset_s + t)
        .unwrap_or(previous.current_time_s);

    let progress = if snapshot.finished {
        100.0
    } else if duration_s > 0.0 && current_time_s > 0.0 {
        ((current_time_s / duration_s) * 100.0).min(99.9) as f32
    } else {
        previous.progress
    };

    let speed = snapshot.speed.unwrap_or(previous.speed);
    let eta_s = if speed > 0.0 && duration_s > current_time_s {
        Some(((duration_s - current_time_s) / speed as f64) as u64)
    } else {
        previous.eta_s
    };

    JobTelemetry {
        progress,
        current_time_s,
        duration_s,
        speed,
        fps: snapshot.fps.unwrap_or(previous.fps),
        frame: snapshot.frame.unwrap_or(previous.frame),
        eta_s,
    }
}

/// Per-job rate limiter for progress events.
#[derive(Debug)]
pub struct EventLimiter {
    min_interval: Duration,
    last_emit: Option<Instant>,
}

impl EventLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_emit: None,
        }
    }

    /// Whether an event may be emitted now; records the emission if so.
    pub fn allow(&mut self, now: Instant) -> bool {
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}

impl Default for EventLimiter {
    fn default() -> Self {
        Self::new(EVENT_INTERVAL)
    }
}
