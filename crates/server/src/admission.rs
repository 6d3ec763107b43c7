//! Adaptive admission controller.
//!
//! Derives the current concurrency ceiling and a quality hint from the
//! static capabilities snapshot and the latest load sample. The decision is
//! a pure function so that every rule is directly testable.

use serde::Serialize;

use crate::hardware::Capabilities;
use crate::monitor::{LoadTrend, RealtimeSample};

/// GPU temperature at which the ceiling is reduced.
const HOT_GPU_TEMP_C: f32 = 80.0;

/// Load factor above which no new jobs are admitted.
const LOAD_REFUSE: f32 = 0.85;

/// Load factor above which a rising trend freezes admissions.
const LOAD_FREEZE: f32 = 0.7;

/// Outcome of one admission decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdmissionDecision {
    /// Whether a new job may start now.
    pub allow: bool,
    /// Current concurrency ceiling.
    pub effective_max_jobs: u32,
    /// Multiplicative downscaling hint for resolution/bitrate, in (0, 1].
    pub quality_factor: f32,
    /// Textual justification for observability.
    pub reason: String,
}

/// Decide whether a new job may be admitted right now.
///
/// Rules are applied in order and may each tighten the result of the
/// previous one:
/// 1. on battery: ceiling capped at 1, quality capped at 0.6;
/// 2. GPU temperature at or above 80C: ceiling lowered by one (floor 1),
///    quality capped at 0.75;
/// 3. load factor at or above 0.85: refuse unless nothing is running;
/// 4. rising trend with load at or above 0.7: ceiling frozen at the
///    current active count;
/// 5. otherwise the tier suggestion (or configured override) applies.
///
/// `configured_max` of zero means "derive from the hardware tier".
pub fn decide(
    capabilities: &Capabilities,
    sample: &RealtimeSample,
    configured_max: u32,
    active_jobs: u32,
) -> AdmissionDecision {
    let base = if configured_max > 0 {
        configured_max
    } else {
        capabilities.suggested_max_jobs.max(1)
    };

    let mut effective = base;
    let mut quality = 1.0f32;
    let mut reasons: Vec<String> = Vec::new();

    if sample.on_battery {
        effective = effective.min(1);
        quality = quality.min(0.6);
        reasons.push("on battery".to_string());
    }

    if let Some(temp) = sample.gpu_temp_c {
        if temp >= HOT_GPU_TEMP_C {
            effective = effective.saturating_sub(1).max(1);
            quality = quality.min(0.75);
            reasons.push(format!("gpu at {:.0}C", temp));
        }
    }

    let mut allow = true;

    if sample.load_factor >= LOAD_REFUSE && active_jobs > 0 {
        allow = false;
        reasons.push(format!("load factor {:.2}", sample.load_factor));
    } else if sample.trend == LoadTrend::Rising && sample.load_factor >= LOAD_FREEZE {
        effective = active_jobs;
        reasons.push("load rising".to_string());
    }

    if active_jobs >= effective {
        allow = false;
        if reasons.is_empty() {
            reasons.push(format!("{} of {} slots in use", active_jobs, effective));
        }
    }

    let reason = if reasons.is_empty() {
        format!("tier {} allows {} jobs", capabilities.tier, effective)
    } else {
        reasons.join(", ")
    };

    AdmissionDecision {
        allow,
        effective_max_jobs: effective,
        quality_factor: quality,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{Capabilities, HwAccel, HwAccelCapability, Tier};
    use crate::monitor::LoadTrend;
    use proptest::prelude::*;

    fn make_capabilities(tier: Tier) -> Capabilities {
        let mut caps = Capabilities::software_only("7.1".to_string());
        caps.tier = tier;
        caps.suggested_max_jobs = tier.limits().suggested_max_jobs;
        if tier != Tier::Minimal {
            caps.hw_accels.push(HwAccelCapability {
                family: HwAccel::Nvenc,
                available: true,
                encoders: vec!["h264_nvenc".to_string()],
            });
        }
        caps
    }

    fn idle_sample() -> RealtimeSample {
        RealtimeSample {
            cpu_percent: Some(10.0),
            gpu_percent: Some(5.0),
            gpu_temp_c: Some(45.0),
            memory_percent: Some(30.0),
            on_battery: false,
            ac_power: true,
            load_factor: 0.1,
            trend: LoadTrend::Stable,
            sampled_at_ms: 0,
        }
    }

    #[test]
    fn test_idle_machine_uses_tier_suggestion() {
        let caps = make_capabilities(Tier::Ultra);
        let decision = decide(&caps, &idle_sample(), 0, 0);

        assert!(decision.allow);
        assert_eq!(decision.effective_max_jobs, 4);
        assert_eq!(decision.quality_factor, 1.0);
    }

    #[test]
    fn test_configured_ceiling_overrides_tier() {
        let caps = make_capabilities(Tier::Ultra);
        let decision = decide(&caps, &idle_sample(), 2, 0);
        assert_eq!(decision.effective_max_jobs, 2);
    }

    #[test]
    fn test_battery_caps_ceiling_and_quality() {
        let caps = make_capabilities(Tier::Ultra);
        let mut sample = idle_sample();
        sample.on_battery = true;

        let decision = decide(&caps, &sample, 0, 0);
        assert_eq!(decision.effective_max_jobs, 1);
        assert!(decision.quality_factor <= 0.6);
        assert!(decision.reason.contains("battery"));
    }

    #[test]
    fn test_hot_gpu_reduces_ceiling() {
        let caps = make_capabilities(Tier::Ultra);
        let mut sample = idle_sample();
        sample.gpu_temp_c = Some(83.0);

        let decision = decide(&caps, &sample, 0, 0);
        assert_eq!(decision.effective_max_jobs, 3);
        assert!(decision.quality_factor <= 0.75);
    }

    #[test]
    fn test_hot_gpu_floor_is_one() {
        let caps = make_capabilities(Tier::Low);
        let mut sample = idle_sample();
        sample.gpu_temp_c = Some(95.0);

        let decision = decide(&caps, &sample, 0, 0);
        assert_eq!(decision.effective_max_jobs, 1);
    }

    #[test]
    fn test_battery_and_hot_gpu_take_tightest_quality() {
        let caps = make_capabilities(Tier::Ultra);
        let mut sample = idle_sample();
        sample.on_battery = true;
        sample.gpu_temp_c = Some(85.0);

        let decision = decide(&caps, &sample, 0, 0);
        assert_eq!(decision.effective_max_jobs, 1);
        assert!((decision.quality_factor - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_high_load_refuses_unless_idle() {
        let caps = make_capabilities(Tier::Ultra);
        let mut sample = idle_sample();
        sample.load_factor = 0.9;

        // Something is running: refuse.
        let decision = decide(&caps, &sample, 0, 1);
        assert!(!decision.allow);

        // Nothing running: external load alone does not starve the queue.
        let decision = decide(&caps, &sample, 0, 0);
        assert!(decision.allow);
    }

    #[test]
    fn test_rising_trend_freezes_ceiling_at_active() {
        let caps = make_capabilities(Tier::Ultra);
        let mut sample = idle_sample();
        sample.load_factor = 0.75;
        sample.trend = LoadTrend::Rising;

        let decision = decide(&caps, &sample, 0, 2);
        assert_eq!(decision.effective_max_jobs, 2);
        assert!(!decision.allow);
        assert!(decision.reason.contains("rising"));
    }

    #[test]
    fn test_rising_trend_below_freeze_threshold_ignored() {
        let caps = make_capabilities(Tier::Ultra);
        let mut sample = idle_sample();
        sample.load_factor = 0.5;
        sample.trend = LoadTrend::Rising;

        let decision = decide(&caps, &sample, 0, 2);
        assert_eq!(decision.effective_max_jobs, 4);
        assert!(decision.allow);
    }

    #[test]
    fn test_at_capacity_refuses() {
        let caps = make_capabilities(Tier::Medium);
        let decision = decide(&caps, &idle_sample(), 0, 2);
        assert!(!decision.allow);
        assert_eq!(decision.effective_max_jobs, 2);
    }

    #[test]
    fn test_missing_gpu_temp_skips_thermal_rule() {
        let caps = make_capabilities(Tier::Ultra);
        let mut sample = idle_sample();
        sample.gpu_temp_c = None;

        let decision = decide(&caps, &sample, 0, 0);
        assert_eq!(decision.effective_max_jobs, 4);
        assert_eq!(decision.quality_factor, 1.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        // The ceiling never exceeds the base and quality stays in (0, 1].
        #[test]
        fn prop_decision_bounds(
            load in 0.0f32..1.0,
            temp in 20.0f32..100.0,
            on_battery in proptest::bool::ANY,
            trend_idx in 0usize..3,
            active in 0u32..8,
            configured in 0u32..6,
        ) {
            let trends = [LoadTrend::Rising, LoadTrend::Falling, LoadTrend::Stable];
            let caps = make_capabilities(Tier::Ultra);
            let sample = RealtimeSample {
                cpu_percent: Some(load * 100.0),
                gpu_percent: None,
                gpu_temp_c: Some(temp),
                memory_percent: Some(40.0),
                on_battery,
                ac_power: !on_battery,
                load_factor: load,
                trend: trends[trend_idx],
                sampled_at_ms: 0,
            };

            let decision = decide(&caps, &sample, configured, active);
            let base = if configured > 0 { configured } else { caps.suggested_max_jobs };

            prop_assert!(decision.effective_max_jobs <= base.max(active));
            prop_assert!(decision.quality_factor > 0.0);
            prop_assert!(decision.quality_factor <= 1.0);
            prop_assert!(!decision.reason.is_empty());
        }

        // Whenever the decision allows admission, the active count is
        // strictly below the ceiling.
        #[test]
        fn prop_allow_implies_capacity(
            load in 0.0f32..1.0,
            active in 0u32..8,
            on_battery in proptest::bool::ANY,
        ) {
            let caps = make_capabilities(Tier::High);
            let sample = RealtimeSample {
                load_factor: load,
                on_battery,
                ac_power: !on_battery,
                gpu_temp_c: Some(50.0),
                ..idle_sample()
            };

            let decision = decide(&caps, &sample, 0, active);
            if decision.allow {
                prop_assert!(active < decision.effective_max_jobs);
            }
        }

        // On battery the ceiling is always exactly one.
        #[test]
        fn prop_battery_ceiling_is_one(load in 0.0f32..0.6, active in 0u32..3) {
            let caps = make_capabilities(Tier::Ultra);
            let mut sample = idle_sample();
            sample.on_battery = true;
            sample.load_factor = load;

            let decision = decide(&caps, &sample, 0, active);
            prop_assert_eq!(decision.effective_max_jobs, 1);
        }
    }
}
