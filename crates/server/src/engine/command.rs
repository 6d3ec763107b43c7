//! Invocation planning: building encoder command lines for each mode.
//!
//! The planner turns a validated request plus the probed media facts into
//! one or two ffmpeg argument lists (two for two-pass batch jobs), capped
//! by the hardware tier and the admission controller's quality factor.
//! Resolution is never upscaled past the source.

use std::path::Path;
use streamforge_config::{HardwareConfig, TranscodingConfig};

use crate::engine::encoders::{audio_encoder, hw_decode_args, video_encoder};
use crate::engine::probe::MediaInfo;
use crate::hardware::{HwAccel, TierLimits};
use crate::jobs::{OutputFormat, TranscodeMode, TranscodeRequest};
use crate::playlist;

/// HDR to SDR tone mapping chain (mobius operator for natural colors).
const TONEMAP_FILTER: &str = "zscale=tin=smpte2084:min=bt2020nc:pin=bt2020:t=linear:npl=100,\
format=gbrpf32le,zscale=p=bt709,tonemap=tonemap=mobius:desat=0,\
zscale=t=bt709:m=bt709:r=tv";

/// One rendition of the quality ladder.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityRung {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate: &'static str,
}

impl QualityRung {
    /// Bandwidth advertised in the master playlist, in bits per second.
    pub fn bandwidth_bps(&self) -> u64 {
        self.video_bitrate_kbps as u64 * 1000
    }
}

/// The fixed ladder abr renditions are drawn from.
fn quality_ladder() -> Vec<QualityRung> {
    vec![
        QualityRung { name: "2160p".into(), width: 3840, height: 2160, video_bitrate_kbps: 20_000, audio_bitrate: "192k" },
        QualityRung { name: "1080p".into(), width: 1920, height: 1080, video_bitrate_kbps: 8_000, audio_bitrate: "192k" },
        QualityRung { name: "720p".into(), width: 1280, height: 720, video_bitrate_kbps: 4_000, audio_bitrate: "128k" },
        QualityRung { name: "480p".into(), width: 854, height: 480, video_bitrate_kbps: 1_500, audio_bitrate: "96k" },
        QualityRung { name: "360p".into(), width: 640, height: 360, video_bitrate_kbps: 800, audio_bitrate: "64k" },
    ]
}

/// Audio bitrate for a channel count.
fn audio_bitrate_for_channels(channels: u32) -> &'static str {
    match channels {
        0 | 1 => "64k",
        2 => "128k",
        3..=6 => "384k",
        _ => "512k",
    }
}

/// A fully planned encoder invocation.
#[derive(Debug, Clone)]
pub struct InvocationPlan {
    /// Argument lists to run sequentially (two for two-pass batch).
    pub passes: Vec<Vec<String>>,
    pub video_encoder: String,
    pub family: HwAccel,
    /// Primary artifact: the master playlist or the batch output file.
    pub output_path: std::path::PathBuf,
    /// Renditions produced (one for stream, the ladder for abr, none for
    /// batch).
    pub variants: Vec<QualityRung>,
}

/// Tier cap scaled by the admission controller's quality factor, kept even
/// for encoder friendliness.
pub fn effective_cap_height(limits: &TierLimits, quality_factor: f32) -> u32 {
    let scaled = (limits.max_height as f32 * quality_factor) as u32;
    (scaled.max(144) / 2) * 2
}

/// Resolve the output height: requested resolution, capped by the scaled
/// tier limit and by the source height. Never upscales.
pub fn resolve_target_height(
    requested: Option<u32>,
    source_height: u32,
    limits: &TierLimits,
    quality_factor: f32,
) -> u32 {
    let cap = effective_cap_height(limits, quality_factor);
    let wanted = requested.unwrap_or(cap).min(cap);
    let capped = if source_height > 0 {
        wanted.min(source_height)
    } else {
        wanted
    };
    (capped.max(144) / 2) * 2
}

/// Target video bitrate in kbps: explicit request, else the ladder value
/// for the height, scaled by the quality factor and capped by the tier.
pub fn resolve_bitrate_kbps(
    explicit: Option<&str>,
    target_height: u32,
    limits: &TierLimits,
    quality_factor: f32,
) -> u32 {
    let base = match explicit.and_then(parse_bitrate_kbps) {
        Some(kbps) => kbps,
        None => quality_ladder()
            .iter()
            .filter(|r| r.height <= target_height)
            .map(|r| r.video_bitrate_kbps)
            .next()
            .unwrap_or(800),
    };
    let scaled = (base as f32 * quality_factor) as u32;
    scaled.clamp(200, limits.max_bitrate_kbps)
}

/// Parse a bitrate string like "8M", "800k", or "2.5M" into kbps.
pub fn parse_bitrate_kbps(bitrate: &str) -> Option<u32> {
    let trimmed = bitrate.trim();
    if trimmed.is_empty() {
        return None;
    }
    let (number, multiplier) = match trimmed.chars().last() {
        Some('M') | Some('m') => (&trimmed[..trimmed.len() - 1], 1000.0),
        Some('K') | Some('k') => (&trimmed[..trimmed.len() - 1], 1.0),
        _ => (trimmed, 0.001),
    };
    number
        .parse::<f64>()
        .ok()
        .map(|v| (v * multiplier).round() as u32)
        .filter(|v| *v > 0)
}

/// Renditions for an abr job: ladder rungs whose height fits under both the
/// source and the (quality-scaled) tier cap, newest first, bounded by the
/// variant cap. A source below the whole ladder still gets one rung at its
/// own height.
pub fn abr_rungs(
    source_height: u32,
    limits: &TierLimits,
    quality_factor: f32,
    max_variants: u32,
) -> Vec<QualityRung> {
    let cap = effective_cap_height(limits, quality_factor).min(source_height.max(144));
    let mut rungs: Vec<QualityRung> = quality_ladder()
        .into_iter()
        .filter(|r| r.height <= cap)
        .take(max_variants.max(1) as usize)
        .collect();

    if rungs.is_empty() {
        let height = (source_height.max(144) / 2) * 2;
        let width = (height * 16 / 9 / 2) * 2;
        rungs.push(QualityRung {
            name: format!("{}p", height),
            width,
            height,
            video_bitrate_kbps: 800,
            audio_bitrate: "64k",
        });
    }
    rungs
}

fn push(args: &mut Vec<String>, items: &[&str]) {
    args.extend(items.iter().map(|s| s.to_string()));
}

/// Reconnect options for http sources so short network hiccups surface as
/// retries inside the encoder rather than immediate failures.
fn protocol_args(source: &str) -> Vec<String> {
    if source.starts_with("http://") || source.starts_with("https://") {
        vec![
            "-reconnect".into(),
            "1".into(),
            "-reconnect_streamed".into(),
            "1".into(),
            "-reconnect_delay_max".into(),
            "5".into(),
        ]
    } else {
        Vec::new()
    }
}

/// Shared invocation prefix: overwrite, quiet banner, no stdin, progress
/// stream on stdout, errors only on stderr.
fn common_prefix() -> Vec<String> {
    vec![
        "-y".into(),
        "-hide_banner".into(),
        "-nostdin".into(),
        "-progress".into(),
        "pipe:1".into(),
        "-loglevel".into(),
        "error".into(),
    ]
}

struct PlanInputs<'a> {
    request: &'a TranscodeRequest,
    media: &'a MediaInfo,
    limits: &'a TierLimits,
    transcoding: &'a TranscodingConfig,
    hardware: &'a HardwareConfig,
    quality_factor: f32,
    family: HwAccel,
    working_dir: &'a Path,
}

/// Build the invocation plan for a job attempt.
///
/// `family` is the encoder family chosen for this attempt; a fallback
/// attempt calls this again with [`HwAccel::Software`].
#[allow(clippy::too_many_arguments)]
pub fn plan_job(
    request: &TranscodeRequest,
    media: &MediaInfo,
    limits: &TierLimits,
    transcoding: &TranscodingConfig,
    hardware: &HardwareConfig,
    quality_factor: f32,
    family: HwAccel,
    working_dir: &Path,
) -> InvocationPlan {
    let inputs = PlanInputs {
        request,
        media,
        limits,
        transcoding,
        hardware,
        quality_factor,
        family,
        working_dir,
    };
    match request.mode {
        TranscodeMode::Stream => plan_stream(&inputs),
        TranscodeMode::Abr => plan_abr(&inputs),
        TranscodeMode::Batch => plan_batch(&inputs),
    }
}

fn needs_tonemap(inputs: &PlanInputs<'_>) -> bool {
    inputs.transcoding.tone_map_hdr
        && inputs.media.is_hdr()
        && inputs.request.output.video_codec.needs_tonemap_for_hdr()
}

/// Input-side arguments shared by every mode: protocol options, hardware
/// decode (unless CPU filters are required), seek, source, stream maps.
fn input_args(inputs: &PlanInputs<'_>, encoder: &str, tonemap: bool) -> Vec<String> {
    let mut args = common_prefix();
    args.extend(protocol_args(&inputs.request.source));
    if !tonemap {
        args.extend(hw_decode_args(encoder));
    }
    if inputs.request.start_time > 0.0 {
        push(&mut args, &["-ss", &format_seconds(inputs.request.start_time)]);
    }
    push(&mut args, &["-i", &inputs.request.source]);
    args
}

fn format_seconds(secs: f64) -> String {
    if secs.fract() == 0.0 {
        format!("{}", secs as u64)
    } else {
        format!("{:.3}", secs)
    }
}

/// Video filter chain: tone mapping first, then downscale, then the pixel
/// format pin for software encoders.
fn video_filters(inputs: &PlanInputs<'_>, encoder: &str, target_height: u32, tonemap: bool) -> Vec<String> {
    let mut filters = Vec::new();
    if tonemap {
        filters.push(TONEMAP_FILTER.to_string());
    }
    if inputs.media.height > 0 && target_height < inputs.media.height {
        filters.push(format!("scale=-2:{}", target_height));
    }
    if (tonemap || !filters.is_empty()) && encoder.starts_with("lib") {
        filters.push("format=yuv420p".to_string());
    } else if tonemap {
        filters.push("format=yuv420p".to_string());
    }
    filters
}

fn audio_args(inputs: &PlanInputs<'_>) -> Vec<String> {
    let (encoder, extra) = audio_encoder(inputs.request.output.audio_codec);
    let mut args = vec!["-c:a".to_string(), encoder.clone()];
    if encoder != "copy" {
        let source_channels = inputs.media.audio_channels.max(1);
        let channels = source_channels.min(inputs.request.output.max_audio_channels.max(1));
        args.extend(extra);
        push(&mut args, &["-b:a", audio_bitrate_for_channels(channels)]);
        push(&mut args, &["-ac", &channels.to_string()]);
    }
    args
}

/// Keyframe cadence: a keyframe every two seconds keeps segments seekable.
fn gop_args(fps: f32) -> Vec<String> {
    let fps = if fps > 0.0 { fps } else { 30.0 };
    let gop = (fps * 2.0).round() as u32;
    vec![
        "-g".into(),
        gop.to_string(),
        "-keyint_min".into(),
        gop.to_string(),
    ]
}

fn hls_output_args(
    transcoding: &TranscodingConfig,
    segment_pattern: &Path,
    playlist_path: &Path,
) -> Vec<String> {
    vec![
        "-f".into(),
        "hls".into(),
        "-hls_time".into(),
        transcoding.segment_duration_s.to_string(),
        "-hls_list_size".into(),
        "0".into(),
        "-hls_segment_filename".into(),
        segment_pattern.to_string_lossy().into_owned(),
        "-hls_flags".into(),
        "independent_segments+append_list+temp_file".into(),
        "-hls_segment_type".into(),
        "mpegts".into(),
        "-hls_playlist_type".into(),
        "vod".into(),
        playlist_path.to_string_lossy().into_owned(),
    ]
}

fn plan_stream(inputs: &PlanInputs<'_>) -> InvocationPlan {
    let (encoder, encoder_args) = video_encoder(
        inputs.request.output.video_codec,
        inputs.family,
        inputs.hardware,
    );
    let tonemap = needs_tonemap(inputs);

    let target_height = resolve_target_height(
        inputs.request.output.resolution.height(),
        inputs.media.height,
        inputs.limits,
        inputs.quality_factor,
    );
    let bitrate_kbps = resolve_bitrate_kbps(
        inputs.request.output.bitrate.as_deref(),
        target_height,
        inputs.limits,
        inputs.quality_factor,
    );

    let variant = QualityRung {
        name: format!("{}p", target_height),
        width: (target_height * 16 / 9 / 2) * 2,
        height: target_height,
        video_bitrate_kbps: bitrate_kbps,
        audio_bitrate: audio_bitrate_for_channels(
            inputs
                .media
                .audio_channels
                .min(inputs.request.output.max_audio_channels)
                .max(1),
        ),
    };

    let mut args = input_args(inputs, &encoder, tonemap);
    push(&mut args, &["-map", "0:v:0", "-map", "0:a:0?"]);
    push(&mut args, &["-c:v", &encoder]);
    args.extend(encoder_args);

    let filters = video_filters(inputs, &encoder, target_height, tonemap);
    if !filters.is_empty() {
        push(&mut args, &["-vf", &filters.join(",")]);
    }

    if encoder != "copy" {
        let rate = format!("{}k", bitrate_kbps);
        let bufsize = format!("{}k", bitrate_kbps * 2);
        push(&mut args, &["-b:v", &rate, "-maxrate", &rate, "-bufsize", &bufsize]);
        args.extend(gop_args(inputs.media.fps));
    }

    args.extend(audio_args(inputs));

    let variant_dir = playlist::variant_dir(inputs.working_dir, &variant.name);
    args.extend(hls_output_args(
        inputs.transcoding,
        &playlist::segment_pattern(&variant_dir),
        &playlist::variant_playlist(&variant_dir),
    ));

    InvocationPlan {
        passes: vec![args],
        video_encoder: encoder,
        family: inputs.family,
        output_path: playlist::master_path(inputs.working_dir),
        variants: vec![variant],
    }
}

fn plan_abr(inputs: &PlanInputs<'_>) -> InvocationPlan {
    let (encoder, _encoder_args) = video_encoder(
        inputs.request.output.video_codec,
        inputs.family,
        inputs.hardware,
    );
    let tonemap = needs_tonemap(inputs);

    let rungs = abr_rungs(
        inputs.media.height,
        inputs.limits,
        inputs.quality_factor,
        inputs.transcoding.abr_max_variants,
    );

    let mut args = input_args(inputs, &encoder, tonemap);

    // Split the decoded stream once and scale each branch; tone mapping runs
    // before the split so it is paid once.
    let mut chains = Vec::new();
    let source_label = if tonemap {
        chains.push(format!("[0:v]{},format=yuv420p[vsrc]", TONEMAP_FILTER));
        "[vsrc]".to_string()
    } else {
        "[0:v]".to_string()
    };
    let split_outputs: Vec<String> = (0..rungs.len()).map(|i| format!("[vin{}]", i)).collect();
    chains.push(format!(
        "{}split={}{}",
        source_label,
        rungs.len(),
        split_outputs.join("")
    ));
    for (i, rung) in rungs.iter().enumerate() {
        let pin = if encoder.starts_with("lib") {
            ",format=yuv420p"
        } else {
            ""
        };
        chains.push(format!("[vin{}]scale=-2:{}{}[v{}]", i, rung.height, pin, i));
    }
    push(&mut args, &["-filter_complex", &chains.join(";")]);

    let (audio_enc, _) = audio_encoder(inputs.request.output.audio_codec);
    let channels = inputs
        .media
        .audio_channels
        .min(inputs.request.output.max_audio_channels.max(1))
        .max(1);

    for (i, rung) in rungs.iter().enumerate() {
        push(&mut args, &["-map", &format!("[v{}]", i)]);
        push(&mut args, &[&format!("-c:v:{}", i), &encoder]);
        let rate = format!("{}k", rung.video_bitrate_kbps);
        push(&mut args, &[&format!("-b:v:{}", i), &rate]);
        push(&mut args, &[&format!("-maxrate:v:{}", i), &rate]);
        push(
            &mut args,
            &[&format!("-bufsize:v:{}", i), &format!("{}k", rung.video_bitrate_kbps * 2)],
        );
        let fps = if inputs.media.fps > 0.0 { inputs.media.fps } else { 30.0 };
        let gop = (fps * 2.0).round() as u32;
        push(&mut args, &[&format!("-g:v:{}", i), &gop.to_string()]);
    }

    // One audio stream per rendition so the stream map stays rectangular.
    for (i, rung) in rungs.iter().enumerate() {
        push(&mut args, &["-map", "0:a:0?"]);
        push(&mut args, &[&format!("-c:a:{}", i), &audio_enc]);
        if audio_enc != "copy" {
            push(&mut args, &[&format!("-b:a:{}", i), rung.audio_bitrate]);
            push(&mut args, &[&format!("-ac:a:{}", i), &channels.to_string()]);
        }
    }

    let stream_map: Vec<String> = rungs
        .iter()
        .enumerate()
        .map(|(i, rung)| format!("v:{},a:{},name:{}", i, i, rung.name))
        .collect();

    let segment_pattern = inputs.working_dir.join("%v").join("segment_%05d.ts");
    let playlist_pattern = inputs.working_dir.join("%v").join("playlist.m3u8");

    push(&mut args, &["-var_stream_map", &stream_map.join(" ")]);
    args.extend(hls_output_args(
        inputs.transcoding,
        &segment_pattern,
        &playlist_pattern,
    ));

    InvocationPlan {
        passes: vec![args],
        video_encoder: encoder,
        family: inputs.family,
        output_path: playlist::master_path(inputs.working_dir),
        variants: rungs,
    }
}

fn plan_batch(inputs: &PlanInputs<'_>) -> InvocationPlan {
    let (encoder, encoder_args) = video_encoder(
        inputs.request.output.video_codec,
        inputs.family,
        inputs.hardware,
    );
    let tonemap = needs_tonemap(inputs);

    let target_height = resolve_target_height(
        inputs.request.output.resolution.height(),
        inputs.media.height,
        inputs.limits,
        inputs.quality_factor,
    );
    let bitrate_kbps = resolve_bitrate_kbps(
        inputs.request.output.bitrate.as_deref(),
        target_height,
        inputs.limits,
        inputs.quality_factor,
    );

    let format = inputs.request.output.format;
    let output_path = inputs
        .working_dir
        .join(format!("output.{}", format.extension()));

    // Two-pass only makes sense for software rate control.
    let two_pass = inputs.request.output.two_pass && inputs.family == HwAccel::Software;
    let passlog = inputs.working_dir.join("passlog");

    // `pass_num` of None builds the single-pass invocation.
    let build_pass = |pass_num: Option<u32>| -> Vec<String> {
        let mut args = input_args(inputs, &encoder, tonemap);
        push(&mut args, &["-map", "0:v:0", "-map", "0:a:0?"]);
        push(&mut args, &["-c:v", &encoder]);
        args.extend(encoder_args.clone());

        if let Some(n) = pass_num {
            push(&mut args, &["-pass", &n.to_string()]);
            push(&mut args, &["-passlogfile", &passlog.to_string_lossy()]);
        }

        let filters = video_filters(inputs, &encoder, target_height, tonemap);
        if !filters.is_empty() {
            push(&mut args, &["-vf", &filters.join(",")]);
        }

        if encoder != "copy" {
            push(&mut args, &["-b:v", &format!("{}k", bitrate_kbps)]);
        }

        if pass_num == Some(1) {
            // First pass only gathers statistics.
            push(&mut args, &["-an", "-f", "null", "/dev/null"]);
        } else {
            args.extend(audio_args(inputs));
            match format {
                OutputFormat::Mp4 => push(&mut args, &["-movflags", "+faststart"]),
                OutputFormat::Webm => push(&mut args, &["-f", "webm"]),
                OutputFormat::Mkv => push(&mut args, &["-f", "matroska"]),
            }
            args.push(output_path.to_string_lossy().into_owned());
        }
        args
    };

    let passes = if two_pass {
        vec![build_pass(Some(1)), build_pass(Some(2))]
    } else {
        vec![build_pass(None)]
    };

    InvocationPlan {
        passes,
        video_encoder: encoder,
        family: inputs.family,
        output_path,
        variants: Vec::new(),
    }
}
