//! Load monitor: continuous sampling of CPU/GPU/memory/power state.
//!
//! A long-running sampler with a fixed 2 s period. Maintains an
//! exponentially smoothed load factor and a short ring buffer used for
//! trend detection. Snapshots are published through a shared handle and
//! never block on external collectors; metrics a collector cannot supply
//! are reported as `None` and excluded from the load maximum.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::jobs::now_ms;

/// Sampling period of the monitor.
pub const SAMPLE_PERIOD: Duration = Duration::from_secs(2);

/// Samples kept for trend detection (30 s window at a 2 s period).
pub const TREND_WINDOW: usize = 15;

/// Smoothing coefficient for the load factor.
const EWMA_ALPHA: f32 = 0.3;

/// Least-squares slope (percentage points per sample) below which the load
/// is considered stable.
const STABLE_SLOPE: f32 = 0.5;

/// Short-window load direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadTrend {
    Rising,
    Falling,
    #[default]
    Stable,
}

impl std::fmt::Display for LoadTrend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadTrend::Rising => write!(f, "rising"),
            LoadTrend::Falling => write!(f, "falling"),
            LoadTrend::Stable => write!(f, "stable"),
        }
    }
}

/// One realtime sample of system pressure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RealtimeSample {
    pub cpu_percent: Option<f32>,
    pub gpu_percent: Option<f32>,
    pub gpu_temp_c: Option<f32>,
    pub memory_percent: Option<f32>,
    pub on_battery: bool,
    pub ac_power: bool,
    /// Smoothed max(cpu, gpu) / 100, in [0, 1].
    pub load_factor: f32,
    pub trend: LoadTrend,
    pub sampled_at_ms: i64,
}

/// Shared sample handle for concurrent access across components.
pub type SharedSample = Arc<RwLock<RealtimeSample>>;

/// Creates a new SharedSample with default values.
pub fn new_shared_sample() -> SharedSample {
    Arc::new(RwLock::new(RealtimeSample {
        ac_power: true,
        ..RealtimeSample::default()
    }))
}

/// Exponential smoothing step.
pub fn ewma(previous: f32, current: f32, alpha: f32) -> f32 {
    alpha * current + (1.0 - alpha) * previous
}

/// Least-squares slope of a window of load values (in percent).
///
/// Returns the change in percentage points per sample step.
pub fn window_slope(window: &[f32]) -> f32 {
    let n = window.len();
    if n < 2 {
        return 0.0;
    }
    let n_f = n as f32;
    let mean_x = (n_f - 1.0) / 2.0;
    let mean_y = window.iter().sum::<f32>() / n_f;

    let mut num = 0.0f32;
    let mut den = 0.0f32;
    for (i, y) in window.iter().enumerate() {
        let dx = i as f32 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

/// Classify the trend of a window of load percentages.
pub fn trend_of(window: &[f32]) -> LoadTrend {
    let slope = window_slope(window);
    if slope.abs() < STABLE_SLOPE {
        LoadTrend::Stable
    } else if slope > 0.0 {
        LoadTrend::Rising
    } else {
        LoadTrend::Falling
    }
}

/// Parse the vendor GPU utility's realtime query output.
///
/// Expects `utilization.gpu [%], temperature.gpu` CSV, e.g. `37 %, 62`.
pub fn parse_gpu_realtime(output: &str) -> Option<(f32, f32)> {
    let line = output.lines().find(|l| !l.trim().is_empty())?;
    let mut fields = line.split(',').map(|f| f.trim());

    let util = fields
        .next()?
        .split_whitespace()
        .next()?
        .parse::<f32>()
        .ok()?;
    let temp = fields
        .next()?
        .split_whitespace()
        .next()?
        .parse::<f32>()
        .ok()?;
    Some((util, temp))
}

fn collect_gpu() -> Option<(f32, f32)> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=utilization.gpu,temperature.gpu", "--format=csv,noheader"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_gpu_realtime(&String::from_utf8_lossy(&output.stdout))
}

/// Read the power state from the platform.
///
/// Returns `(on_battery, ac_power)`.
fn collect_power() -> (bool, bool) {
    #[cfg(target_os = "linux")]
    {
        let mut on_battery = false;
        let mut ac_online = false;
        let mut saw_ac = false;
        if let Ok(entries) = std::fs::read_dir("/sys/class/power_supply") {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_uppercase();
                let online = std::fs::read_to_string(entry.path().join("online"))
                    .map(|s| s.trim() == "1")
                    .unwrap_or(false);
                if name.starts_with("AC") || name.starts_with("ADP") {
                    saw_ac = true;
                    ac_online = ac_online || online;
                }
                if name.starts_with("BAT") {
                    let status = std::fs::read_to_string(entry.path().join("status"))
                        .unwrap_or_default();
                    if status.trim() == "Discharging" {
                        on_battery = true;
                    }
                }
            }
        }
        // Desktops without an AC supply node count as mains powered.
        (on_battery, if saw_ac { ac_online } else { !on_battery })
    }
    #[cfg(not(target_os = "linux"))]
    {
        (false, true)
    }
}

/// The load monitor task owner.
pub struct LoadMonitor {
    shared: SharedSample,
}

impl LoadMonitor {
    pub fn new() -> Self {
        Self {
            shared: new_shared_sample(),
        }
    }

    /// Shared handle the admission controller reads from.
    pub fn sample_handle(&self) -> SharedSample {
        self.shared.clone()
    }

    /// Spawn the background sampler.
    pub fn spawn(&self) -> tokio::task::JoinHandle<()> {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut sys = sysinfo::System::new();
            let mut smoothed = 0.0f32;
            let mut history: VecDeque<f32> = VecDeque::with_capacity(TREND_WINDOW);
            let mut ticker = tokio::time::interval(SAMPLE_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                sys.refresh_cpu_usage();
                sys.refresh_memory();

                let cpu = Some(sys.global_cpu_usage());
                let memory = {
                    let total = sys.total_memory();
                    if total > 0 {
                        Some((sys.used_memory() as f64 / total as f64 * 100.0) as f32)
                    } else {
                        None
                    }
                };

                // GPU query is a subprocess; run it off the sampler path so a
                // wedged vendor tool cannot stall the loop.
                let gpu = tokio::task::spawn_blocking(collect_gpu)
                    .await
                    .unwrap_or(None);
                let (gpu_percent, gpu_temp_c) = match gpu {
                    Some((util, temp)) => (Some(util), Some(temp)),
                    None => (None, None),
                };

                let (on_battery, ac_power) = collect_power();

                let instant_load = [cpu, gpu_percent]
                    .iter()
                    .flatten()
                    .fold(0.0f32, |acc, v| acc.max(*v))
                    / 100.0;
                smoothed = ewma(smoothed, instant_load.clamp(0.0, 1.0), EWMA_ALPHA);

                if history.len() == TREND_WINDOW {
                    history.pop_front();
                }
                history.push_back(instant_load * 100.0);
                let window: Vec<f32> = history.iter().copied().collect();

                let sample = RealtimeSample {
                    cpu_percent: cpu,
                    gpu_percent,
                    gpu_temp_c,
                    memory_percent: memory,
                    on_battery,
                    ac_power,
                    load_factor: smoothed.clamp(0.0, 1.0),
                    trend: trend_of(&window),
                    sampled_at_ms: now_ms(),
                };

                *shared.write().await = sample;
            }
        })
    }
}

impl Default for LoadMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ewma_converges() {
        let mut v = 0.0;
        for _ in 0..50 {
            v = ewma(v, 1.0, EWMA_ALPHA);
        }
        assert!(v > 0.99);
    }

    #[test]
    fn test_ewma_smooths_spikes() {
        let v = ewma(0.2, 1.0, EWMA_ALPHA);
        assert!(v < 0.5, "single spike should not dominate: {}", v);
    }

    #[test]
    fn test_slope_of_flat_window_is_zero() {
        let window = vec![40.0; 15];
        assert_eq!(window_slope(&window), 0.0);
        assert_eq!(trend_of(&window), LoadTrend::Stable);
    }

    #[test]
    fn test_trend_rising() {
        // +2 percentage points per sample.
        let window: Vec<f32> = (0..15).map(|i| 30.0 + 2.0 * i as f32).collect();
        assert!(window_slope(&window) > STABLE_SLOPE);
        assert_eq!(trend_of(&window), LoadTrend::Rising);
    }

    #[test]
    fn test_trend_falling() {
        let window: Vec<f32> = (0..15).map(|i| 80.0 - 2.0 * i as f32).collect();
        assert_eq!(trend_of(&window), LoadTrend::Falling);
    }

    #[test]
    fn test_trend_small_drift_is_stable() {
        // +0.1 percentage points per sample stays under the threshold.
        let window: Vec<f32> = (0..15).map(|i| 50.0 + 0.1 * i as f32).collect();
        assert_eq!(trend_of(&window), LoadTrend::Stable);
    }

    #[test]
    fn test_trend_short_window_is_stable() {
        assert_eq!(trend_of(&[]), LoadTrend::Stable);
        assert_eq!(trend_of(&[90.0]), LoadTrend::Stable);
    }

    #[test]
    fn test_parse_gpu_realtime() {
        assert_eq!(parse_gpu_realtime("37 %, 62\n"), Some((37.0, 62.0)));
        assert_eq!(parse_gpu_realtime("0 %, 45"), Some((0.0, 45.0)));
        assert_eq!(parse_gpu_realtime(""), None);
        assert_eq!(parse_gpu_realtime("N/A, N/A"), None);
    }

    #[test]
    fn test_sample_serializes_nulls_for_missing_metrics() {
        let sample = RealtimeSample {
            cpu_percent: Some(12.5),
            gpu_percent: None,
            ..RealtimeSample::default()
        };
        let json = serde_json::to_string(&sample).unwrap();
        assert!(json.contains("\"gpu_percent\":null"));
        assert!(json.contains("\"cpu_percent\":12.5"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // EWMA output always stays inside the hull of its inputs.
        #[test]
        fn prop_ewma_bounded(prev in 0.0f32..1.0, cur in 0.0f32..1.0) {
            let v = ewma(prev, cur, EWMA_ALPHA);
            let lo = prev.min(cur);
            let hi = prev.max(cur);
            prop_assert!(v >= lo - 1e-6 && v <= hi + 1e-6);
        }

        // A strictly increasing window is never classified as falling, and
        // a strictly decreasing one never as rising.
        #[test]
        fn prop_trend_sign_matches_direction(
            start in 0.0f32..50.0,
            step in 0.6f32..5.0,
            len in 3usize..TREND_WINDOW,
        ) {
            let rising: Vec<f32> = (0..len).map(|i| start + step * i as f32).collect();
            prop_assert_eq!(trend_of(&rising), LoadTrend::Rising);

            let falling: Vec<f32> = (0..len).map(|i| start + 100.0 - step * i as f32).collect();
            prop_assert_eq!(trend_of(&falling), LoadTrend::Falling);
        }
    }
}
