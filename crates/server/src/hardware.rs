//! Hardware profiler: startup-only probing of encoder and GPU capabilities.
//!
//! Inspects the encoder tool's advertised encoder list, queries the vendor
//! GPU utility for identity and VRAM, and classifies the machine into a
//! coarse hardware tier that drives default concurrency and quality limits.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;
use thiserror::Error;

/// Error type for hardware probing.
///
/// Only a missing encoder tool is fatal; every other probe failure degrades
/// the capabilities to software-only.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The encoder tool could not be executed at all.
    #[error("ffmpeg not available: {0}")]
    FfmpegMissing(String),

    /// IO error during probing.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Hardware acceleration family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HwAccel {
    Nvenc,
    Qsv,
    Vaapi,
    Amf,
    Videotoolbox,
    Software,
}

impl HwAccel {
    pub fn as_str(&self) -> &'static str {
        match self {
            HwAccel::Nvenc => "nvenc",
            HwAccel::Qsv => "qsv",
            HwAccel::Vaapi => "vaapi",
            HwAccel::Amf => "amf",
            HwAccel::Videotoolbox => "videotoolbox",
            HwAccel::Software => "software",
        }
    }

    /// Encoder-name suffix that marks an encoder as belonging to the family.
    fn encoder_marker(&self) -> &'static str {
        match self {
            HwAccel::Nvenc => "_nvenc",
            HwAccel::Qsv => "_qsv",
            HwAccel::Vaapi => "_vaapi",
            HwAccel::Amf => "_amf",
            HwAccel::Videotoolbox => "_videotoolbox",
            HwAccel::Software => "",
        }
    }
}

impl std::fmt::Display for HwAccel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Hardware families in auto-selection preference order.
pub const HW_PREFERENCE_ORDER: &[HwAccel] = &[
    HwAccel::Nvenc,
    HwAccel::Qsv,
    HwAccel::Vaapi,
    HwAccel::Amf,
    HwAccel::Videotoolbox,
];

/// Identity of the detected GPU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub name: String,
    pub vram_mb: u64,
    pub driver_version: String,
    /// Discrete vs. integrated, judged from the adapter name.
    pub discrete: bool,
}

/// One hardware acceleration family and the encoders it offers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HwAccelCapability {
    pub family: HwAccel,
    pub available: bool,
    pub encoders: Vec<String>,
}

/// Coarse classification of the host's encoding capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Ultra,
    High,
    Medium,
    Low,
    Minimal,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Ultra => write!(f, "ultra"),
            Tier::High => write!(f, "high"),
            Tier::Medium => write!(f, "medium"),
            Tier::Low => write!(f, "low"),
            Tier::Minimal => write!(f, "minimal"),
        }
    }
}

/// Resource limits a tier maps to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierLimits {
    pub max_height: u32,
    pub max_bitrate_kbps: u32,
    pub suggested_max_jobs: u32,
}

impl Tier {
    /// Fixed limit table per tier.
    pub fn limits(&self) -> TierLimits {
        match self {
            Tier::Ultra => TierLimits {
                max_height: 2160,
                max_bitrate_kbps: 25_000,
                suggested_max_jobs: 4,
            },
            Tier::High => TierLimits {
                max_height: 1440,
                max_bitrate_kbps: 15_000,
                suggested_max_jobs: 3,
            },
            Tier::Medium => TierLimits {
                max_height: 1080,
                max_bitrate_kbps: 8_000,
                suggested_max_jobs: 2,
            },
            Tier::Low => TierLimits {
                max_height: 720,
                max_bitrate_kbps: 4_000,
                suggested_max_jobs: 1,
            },
            Tier::Minimal => TierLimits {
                max_height: 480,
                max_bitrate_kbps: 2_000,
                suggested_max_jobs: 1,
            },
        }
    }
}

/// Static capabilities snapshot, immutable after startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub hw_accels: Vec<HwAccelCapability>,
    pub software_encoders: Vec<String>,
    pub formats: Vec<String>,
    pub tier: Tier,
    pub suggested_max_jobs: u32,
    pub ffmpeg_version: String,
    pub platform: String,
    pub gpu: Option<GpuInfo>,
    pub battery_present: bool,
}

impl Capabilities {
    /// Hardware families that are actually available on this host.
    pub fn available_families(&self) -> Vec<HwAccel> {
        self.hw_accels
            .iter()
            .filter(|c| c.available)
            .map(|c| c.family)
            .collect()
    }

    /// Whether the given family is available (software always is).
    pub fn has_family(&self, family: HwAccel) -> bool {
        if family == HwAccel::Software {
            return true;
        }
        self.hw_accels
            .iter()
            .any(|c| c.family == family && c.available)
    }

    /// Best family for `auto` requests, in preference order.
    pub fn best_available(&self, prefer_hw: bool) -> HwAccel {
        if prefer_hw {
            for family in HW_PREFERENCE_ORDER {
                if self.has_family(*family) {
                    return *family;
                }
            }
        }
        HwAccel::Software
    }

    /// A capabilities snapshot describing a software-only host.
    pub fn software_only(ffmpeg_version: String) -> Self {
        Self {
            hw_accels: Vec::new(),
            software_encoders: vec![
                "libx264".to_string(),
                "libx265".to_string(),
                "libvpx-vp9".to_string(),
                "libsvtav1".to_string(),
            ],
            formats: default_formats(),
            tier: Tier::Minimal,
            suggested_max_jobs: Tier::Minimal.limits().suggested_max_jobs,
            ffmpeg_version,
            platform: std::env::consts::OS.to_string(),
            gpu: None,
            battery_present: false,
        }
    }
}

fn default_formats() -> Vec<String> {
    vec![
        "hls".to_string(),
        "mp4".to_string(),
        "matroska".to_string(),
        "webm".to_string(),
    ]
}

/// Software encoders worth advertising when found in the encoder list.
const KNOWN_SOFTWARE_ENCODERS: &[&str] = &[
    "libx264",
    "libx265",
    "libvpx-vp9",
    "libsvtav1",
    "libaom-av1",
    "aac",
    "libopus",
    "libmp3lame",
    "flac",
];

/// Adapter-name keywords that indicate an integrated GPU.
const INTEGRATED_GPU_KEYWORDS: &[&str] = &["integrated", "iris", "uhd graphics", "vega 8", "radeon graphics"];

/// Parse the encoder tool's `-encoders` listing.
///
/// Lines look like ` V....D h264_nvenc    NVIDIA NVENC H.264 encoder`.
/// Returns the hardware families found (with their encoder names) and the
/// recognised software encoders.
pub fn parse_encoder_list(output: &str) -> (Vec<HwAccelCapability>, Vec<String>) {
    let mut families: Vec<HwAccelCapability> = Vec::new();
    let mut software: Vec<String> = Vec::new();

    for line in output.lines() {
        let trimmed = line.trim_start();
        // Encoder rows start with a capability column like "V....." or "A.....".
        let mut parts = trimmed.split_whitespace();
        let flags = match parts.next() {
            Some(f) if f.starts_with('V') || f.starts_with('A') => f,
            _ => continue,
        };
        if flags.len() < 6 {
            continue;
        }
        let name = match parts.next() {
            Some(n) => n,
            None => continue,
        };

        let mut matched_family = None;
        for family in HW_PREFERENCE_ORDER {
            if name.ends_with(family.encoder_marker()) {
                matched_family = Some(*family);
                break;
            }
        }

        if let Some(family) = matched_family {
            match families.iter_mut().find(|c| c.family == family) {
                Some(cap) => cap.encoders.push(name.to_string()),
                None => families.push(HwAccelCapability {
                    family,
                    available: true,
                    encoders: vec![name.to_string()],
                }),
            }
        } else if KNOWN_SOFTWARE_ENCODERS.contains(&name) {
            software.push(name.to_string());
        }
    }

    (families, software)
}

/// Parse the vendor GPU utility's CSV output.
///
/// Expects one line of `name, memory.total [MiB], driver_version`, the shape
/// produced by `nvidia-smi --query-gpu=... --format=csv,noheader`.
pub fn parse_gpu_query(output: &str) -> Option<GpuInfo> {
    let line = output.lines().find(|l| !l.trim().is_empty())?;
    let mut fields = line.split(',').map(|f| f.trim());

    let name = fields.next()?.to_string();
    if name.is_empty() {
        return None;
    }
    let vram_mb = fields
        .next()?
        .split_whitespace()
        .next()?
        .parse::<u64>()
        .ok()?;
    let driver_version = fields.next().unwrap_or("").to_string();

    let lower = name.to_lowercase();
    let discrete = !INTEGRATED_GPU_KEYWORDS.iter().any(|k| lower.contains(k));

    Some(GpuInfo {
        name,
        vram_mb,
        driver_version,
        discrete,
    })
}

/// Extract the version token from `ffmpeg -version` output.
///
/// Handles version strings prefixed with `n` (e.g. `n7.1-...`).
pub fn parse_ffmpeg_version(version_output: &str) -> Option<String> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .trim()
        .split_whitespace()
        .next()?
        .to_string();

    let cleaned = version_part.trim_start_matches('n').to_string();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Derive the hardware tier from the GPU identity and encoder availability.
///
/// First-match rules:
/// - ultra: discrete GPU with >= 8 GB VRAM and a hardware encoder;
/// - high: >= 6 GB VRAM with a hardware encoder;
/// - medium: >= 4 GB VRAM with a hardware encoder;
/// - low: hardware encoder present but below 4 GB VRAM or integrated;
/// - minimal: software only.
pub fn classify_tier(gpu: Option<&GpuInfo>, has_hw_encoder: bool) -> Tier {
    if !has_hw_encoder {
        return Tier::Minimal;
    }

    match gpu {
        Some(info) if info.discrete && info.vram_mb >= 8192 => Tier::Ultra,
        Some(info) if info.vram_mb >= 6144 => Tier::High,
        Some(info) if info.vram_mb >= 4096 => Tier::Medium,
        _ => Tier::Low,
    }
}

/// Detect whether a battery is present (laptop chassis hint).
fn detect_battery() -> bool {
    #[cfg(target_os = "linux")]
    {
        if let Ok(entries) = std::fs::read_dir("/sys/class/power_supply") {
            for entry in entries.flatten() {
                if entry
                    .file_name()
                    .to_string_lossy()
                    .to_uppercase()
                    .starts_with("BAT")
                {
                    return true;
                }
            }
        }
        false
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

/// Probe the host at startup and build the capabilities snapshot.
///
/// Fails only if the encoder tool itself cannot be executed; a missing or
/// failing GPU utility degrades silently to a software-only snapshot.
pub fn probe(ffmpeg_path: &Path) -> Result<Capabilities, ProbeError> {
    let version_output = Command::new(ffmpeg_path)
        .arg("-version")
        .output()
        .map_err(|e| {
            ProbeError::FfmpegMissing(format!(
                "failed to run {} -version: {}",
                ffmpeg_path.display(),
                e
            ))
        })?;

    if !version_output.status.success() {
        return Err(ProbeError::FfmpegMissing(format!(
            "{} -version exited with {}",
            ffmpeg_path.display(),
            version_output.status
        )));
    }

    let ffmpeg_version = parse_ffmpeg_version(&String::from_utf8_lossy(&version_output.stdout))
        .unwrap_or_else(|| "unknown".to_string());

    let encoders_output = Command::new(ffmpeg_path)
        .args(["-hide_banner", "-encoders"])
        .output();

    let (mut hw_accels, software_encoders) = match encoders_output {
        Ok(out) if out.status.success() => {
            parse_encoder_list(&String::from_utf8_lossy(&out.stdout))
        }
        _ => (Vec::new(), Vec::new()),
    };

    // Advertised NVENC encoders without a driver are not usable; verify with
    // the vendor utility and demote when it is absent.
    let gpu = Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,memory.total,driver_version",
            "--format=csv,noheader",
        ])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| parse_gpu_query(&String::from_utf8_lossy(&out.stdout)));

    if gpu.is_none() {
        if let Some(cap) = hw_accels.iter_mut().find(|c| c.family == HwAccel::Nvenc) {
            cap.available = false;
        }
    }

    let has_hw_encoder = hw_accels.iter().any(|c| c.available);
    let tier = classify_tier(gpu.as_ref(), has_hw_encoder);

    let software_encoders = if software_encoders.is_empty() {
        Capabilities::software_only(String::new()).software_encoders
    } else {
        software_encoders
    };

    Ok(Capabilities {
        hw_accels,
        software_encoders,
        formats: default_formats(),
        tier,
        suggested_max_jobs: tier.limits().suggested_max_jobs,
        ffmpeg_version,
        platform: std::env::consts::OS.to_string(),
        gpu,
        battery_present: detect_battery(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn make_gpu(name: &str, vram_mb: u64, discrete: bool) -> GpuInfo {
        GpuInfo {
            name: name.to_string(),
            vram_mb,
            driver_version: "550.54".to_string(),
            discrete,
        }
    }

    const SAMPLE_ENCODERS: &str = r#"Encoders:
 V..... = Video
 A..... = Audio
 ------
 V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC (codec h264)
 V....D libx265              libx265 H.265 / HEVC (codec hevc)
 V....D h264_nvenc           NVIDIA NVENC H.264 encoder (codec h264)
 V....D hevc_nvenc           NVIDIA NVENC hevc encoder (codec hevc)
 V....D h264_vaapi           H.264/AVC (VAAPI) (codec h264)
 V....D libvpx-vp9           libvpx VP9 (codec vp9)
 A....D aac                  AAC (Advanced Audio Coding)
 A....D libopus              libopus Opus
"#;

    #[test]
    fn test_parse_encoder_list_families() {
        let (families, software) = parse_encoder_list(SAMPLE_ENCODERS);

        let nvenc = families
            .iter()
            .find(|c| c.family == HwAccel::Nvenc)
            .expect("nvenc family");
        assert!(nvenc.available);
        assert_eq!(nvenc.encoders, vec!["h264_nvenc", "hevc_nvenc"]);

        let vaapi = families
            .iter()
            .find(|c| c.family == HwAccel::Vaapi)
            .expect("vaapi family");
        assert_eq!(vaapi.encoders, vec!["h264_vaapi"]);

        assert!(software.contains(&"libx264".to_string()));
        assert!(software.contains(&"libx265".to_string()));
        assert!(software.contains(&"aac".to_string()));
    }

    #[test]
    fn test_parse_encoder_list_software_only() {
        let output = " V....D libx264    libx264 H.264\n A....D aac    AAC\n";
        let (families, software) = parse_encoder_list(output);
        assert!(families.is_empty());
        assert_eq!(software, vec!["libx264", "aac"]);
    }

    #[test]
    fn test_parse_gpu_query() {
        let out = "NVIDIA GeForce RTX 4070, 12282 MiB, 550.54.14\n";
        let gpu = parse_gpu_query(out).expect("should parse");
        assert_eq!(gpu.name, "NVIDIA GeForce RTX 4070");
        assert_eq!(gpu.vram_mb, 12282);
        assert_eq!(gpu.driver_version, "550.54.14");
        assert!(gpu.discrete);
    }

    #[test]
    fn test_parse_gpu_query_integrated() {
        let out = "Intel Iris Xe Graphics, 2048 MiB, 31.0.101\n";
        let gpu = parse_gpu_query(out).expect("should parse");
        assert!(!gpu.discrete);
    }

    #[test]
    fn test_parse_gpu_query_garbage() {
        assert!(parse_gpu_query("").is_none());
        assert!(parse_gpu_query("not csv at all").is_none());
        assert!(parse_gpu_query(", , ,").is_none());
    }

    #[test]
    fn test_parse_ffmpeg_version_standard() {
        let out = "ffmpeg version 7.1 Copyright (c) 2000-2024";
        assert_eq!(parse_ffmpeg_version(out), Some("7.1".to_string()));
    }

    #[test]
    fn test_parse_ffmpeg_version_n_prefixed() {
        let out = "ffmpeg version n7.1-123-gabcdef Copyright (c) 2000-2024";
        assert_eq!(parse_ffmpeg_version(out), Some("7.1-123-gabcdef".to_string()));
    }

    #[test]
    fn test_parse_ffmpeg_version_invalid() {
        assert_eq!(parse_ffmpeg_version("not ffmpeg output"), None);
        assert_eq!(parse_ffmpeg_version(""), None);
    }

    #[test]
    fn test_classify_tier_table() {
        // ultra: discrete, >= 8 GB, hw encoder
        let gpu = make_gpu("RTX 4080", 16384, true);
        assert_eq!(classify_tier(Some(&gpu), true), Tier::Ultra);

        // high: 6-8 GB
        let gpu = make_gpu("RTX 2060", 6144, true);
        assert_eq!(classify_tier(Some(&gpu), true), Tier::High);

        // medium: 4-6 GB
        let gpu = make_gpu("GTX 1650", 4096, true);
        assert_eq!(classify_tier(Some(&gpu), true), Tier::Medium);

        // low: hw encoder but small / integrated
        let gpu = make_gpu("Intel UHD Graphics 630", 1024, false);
        assert_eq!(classify_tier(Some(&gpu), true), Tier::Low);
        assert_eq!(classify_tier(None, true), Tier::Low);

        // minimal: software only, regardless of GPU
        let gpu = make_gpu("RTX 4090", 24576, true);
        assert_eq!(classify_tier(Some(&gpu), false), Tier::Minimal);
        assert_eq!(classify_tier(None, false), Tier::Minimal);
    }

    #[test]
    fn test_integrated_gpu_never_ultra() {
        // Plenty of shared VRAM but integrated: capped below ultra.
        let gpu = make_gpu("AMD Radeon Graphics", 16384, false);
        assert_eq!(classify_tier(Some(&gpu), true), Tier::High);
    }

    #[test]
    fn test_tier_limits_table() {
        assert_eq!(
            Tier::Ultra.limits(),
            TierLimits { max_height: 2160, max_bitrate_kbps: 25_000, suggested_max_jobs: 4 }
        );
        assert_eq!(
            Tier::High.limits(),
            TierLimits { max_height: 1440, max_bitrate_kbps: 15_000, suggested_max_jobs: 3 }
        );
        assert_eq!(
            Tier::Medium.limits(),
            TierLimits { max_height: 1080, max_bitrate_kbps: 8_000, suggested_max_jobs: 2 }
        );
        assert_eq!(
            Tier::Low.limits(),
            TierLimits { max_height: 720, max_bitrate_kbps: 4_000, suggested_max_jobs: 1 }
        );
        assert_eq!(
            Tier::Minimal.limits(),
            TierLimits { max_height: 480, max_bitrate_kbps: 2_000, suggested_max_jobs: 1 }
        );
    }

    #[test]
    fn test_best_available_preference_order() {
        let mut caps = Capabilities::software_only("7.1".to_string());
        assert_eq!(caps.best_available(true), HwAccel::Software);

        caps.hw_accels.push(HwAccelCapability {
            family: HwAccel::Vaapi,
            available: true,
            encoders: vec!["h264_vaapi".to_string()],
        });
        assert_eq!(caps.best_available(true), HwAccel::Vaapi);

        caps.hw_accels.push(HwAccelCapability {
            family: HwAccel::Nvenc,
            available: true,
            encoders: vec!["h264_nvenc".to_string()],
        });
        assert_eq!(caps.best_available(true), HwAccel::Nvenc);

        // Hardware present but not preferred.
        assert_eq!(caps.best_available(false), HwAccel::Software);
    }

    #[test]
    fn test_has_family_software_always_available() {
        let caps = Capabilities::software_only("7.1".to_string());
        assert!(caps.has_family(HwAccel::Software));
        assert!(!caps.has_family(HwAccel::Nvenc));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // The tier table is total and consistent: every VRAM size maps to
        // exactly one tier, and more VRAM never yields a lower tier.
        #[test]
        fn prop_tier_monotonic_in_vram(
            vram_a in 0u64..32768,
            vram_b in 0u64..32768,
        ) {
            let (lo, hi) = if vram_a <= vram_b { (vram_a, vram_b) } else { (vram_b, vram_a) };
            let tier_rank = |t: Tier| match t {
                Tier::Ultra => 4,
                Tier::High => 3,
                Tier::Medium => 2,
                Tier::Low => 1,
                Tier::Minimal => 0,
            };

            let gpu_lo = make_gpu("GPU", lo, true);
            let gpu_hi = make_gpu("GPU", hi, true);
            prop_assert!(
                tier_rank(classify_tier(Some(&gpu_hi), true))
                    >= tier_rank(classify_tier(Some(&gpu_lo), true))
            );
        }

        // Parsing arbitrary junk never panics and never invents a family.
        #[test]
        fn prop_parse_encoder_list_no_panic(input in ".{0,400}") {
            let (families, _software) = parse_encoder_list(&input);
            for cap in families {
                prop_assert!(cap.family != HwAccel::Software);
            }
        }
    }
}
