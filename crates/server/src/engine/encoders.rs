//! Encoder selection: mapping codec requests onto concrete ffmpeg encoders.
//!
//! Explicit hardware requests are honoured when the family is available;
//! `auto` walks the preference order NVENC, QSV, VAAPI, AMF, VideoToolbox,
//! then software.

use streamforge_config::HardwareConfig;
use thiserror::Error;

use crate::hardware::{Capabilities, HwAccel};
use crate::jobs::{AudioCodec, HwAccelChoice, VideoCodec};

/// Error type for encoder selection.
#[derive(Debug, Error)]
pub enum SelectionError {
    /// The explicitly requested family is not available on this host.
    #[error("hardware acceleration '{0}' is not available on this machine")]
    Unavailable(HwAccelChoice),
}

/// Resolve the requested acceleration choice to a concrete family.
///
/// Explicit requests fail when the family is missing (surfaced as a
/// validation error at submit time); `auto` never fails.
pub fn select_family(
    choice: HwAccelChoice,
    capabilities: &Capabilities,
    prefer_hw: bool,
) -> Result<HwAccel, SelectionError> {
    let explicit = match choice {
        HwAccelChoice::Auto => return Ok(capabilities.best_available(prefer_hw)),
        HwAccelChoice::Software => return Ok(HwAccel::Software),
        HwAccelChoice::Nvenc => HwAccel::Nvenc,
        HwAccelChoice::Qsv => HwAccel::Qsv,
        HwAccelChoice::Vaapi => HwAccel::Vaapi,
        HwAccelChoice::Amf => HwAccel::Amf,
        HwAccelChoice::Videotoolbox => HwAccel::Videotoolbox,
    };

    if capabilities.has_family(explicit) {
        Ok(explicit)
    } else {
        Err(SelectionError::Unavailable(choice))
    }
}

/// Concrete video encoder and its extra arguments for a codec and family.
///
/// Families without an encoder for the codec (VP9 and AV1 have patchy
/// hardware support) fall through to the software encoder.
pub fn video_encoder(
    codec: VideoCodec,
    family: HwAccel,
    hw_config: &HardwareConfig,
) -> (String, Vec<String>) {
    let preset = hw_config.nvenc_preset.clone();
    let own = |s: &str| s.to_string();

    match codec {
        VideoCodec::Copy => (own("copy"), vec![]),
        VideoCodec::H264 => match family {
            HwAccel::Nvenc => (own("h264_nvenc"), vec![own("-preset"), preset]),
            HwAccel::Qsv => (own("h264_qsv"), vec![own("-preset"), own("medium")]),
            HwAccel::Vaapi => (own("h264_vaapi"), vec![]),
            HwAccel::Amf => (own("h264_amf"), vec![]),
            HwAccel::Videotoolbox => (own("h264_videotoolbox"), vec![]),
            HwAccel::Software => (
                own("libx264"),
                vec![own("-preset"), own("medium"), own("-crf"), own("23")],
            ),
        },
        VideoCodec::H265 => match family {
            HwAccel::Nvenc => (own("hevc_nvenc"), vec![own("-preset"), preset]),
            HwAccel::Qsv => (own("hevc_qsv"), vec![own("-preset"), own("medium")]),
            HwAccel::Vaapi => (own("hevc_vaapi"), vec![]),
            HwAccel::Amf => (own("hevc_amf"), vec![]),
            HwAccel::Videotoolbox => (own("hevc_videotoolbox"), vec![]),
            HwAccel::Software => (
                own("libx265"),
                vec![own("-preset"), own("medium"), own("-crf"), own("28")],
            ),
        },
        VideoCodec::Vp9 => match family {
            HwAccel::Vaapi => (own("vp9_vaapi"), vec![]),
            HwAccel::Qsv => (own("vp9_qsv"), vec![]),
            _ => (
                own("libvpx-vp9"),
                vec![
                    own("-cpu-used"),
                    own("4"),
                    own("-crf"),
                    own("30"),
                    own("-b:v"),
                    own("0"),
                ],
            ),
        },
        VideoCodec::Av1 => match family {
            HwAccel::Nvenc => (own("av1_nvenc"), vec![own("-preset"), preset]),
            HwAccel::Qsv => (own("av1_qsv"), vec![own("-preset"), own("medium")]),
            HwAccel::Vaapi => (own("av1_vaapi"), vec![]),
            _ => (
                own("libsvtav1"),
                vec![own("-preset"), own("6"), own("-crf"), own("30")],
            ),
        },
    }
}

/// Concrete audio encoder and its extra arguments.
pub fn audio_encoder(codec: AudioCodec) -> (String, Vec<String>) {
    let own = |s: &str| s.to_string();
    match codec {
        AudioCodec::Copy => (own("copy"), vec![]),
        AudioCodec::Aac => (own("aac"), vec![own("-b:a"), own("192k")]),
        AudioCodec::Opus => (own("libopus"), vec![own("-b:a"), own("128k")]),
        AudioCodec::Mp3 => (own("libmp3lame"), vec![own("-b:a"), own("192k")]),
        AudioCodec::Flac => (own("flac"), vec![]),
    }
}

/// Hardware decode arguments matching a chosen encoder.
pub fn hw_decode_args(video_encoder: &str) -> Vec<String> {
    let own = |s: &str| s.to_string();
    if video_encoder.contains("nvenc") {
        vec![own("-hwaccel"), own("cuda")]
    } else if video_encoder.contains("qsv") {
        vec![own("-hwaccel"), own("qsv")]
    } else if video_encoder.contains("vaapi") {
        vec![
            own("-hwaccel"),
            own("vaapi"),
            own("-hwaccel_device"),
            own("/dev/dri/renderD128"),
        ]
    } else if video_encoder.contains("videotoolbox") {
        vec![own("-hwaccel"), own("videotoolbox")]
    } else {
        vec![]
    }
}

/// The family a concrete encoder name belongs to.
pub fn family_of_encoder(encoder: &str) -> HwAccel {
    if encoder.contains("nvenc") {
        HwAccel::Nvenc
    } else if encoder.contains("qsv") {
        HwAccel::Qsv
    } else if encoder.contains("vaapi") {
        HwAccel::Vaapi
    } else if encoder.contains("amf") {
        HwAccel::Amf
    } else if encoder.contains("videotoolbox") {
        HwAccel::Videotoolbox
    } else {
        HwAccel::Software
    }
}
