//! Playlist and segment layout for the streaming tree.
//!
//! Every job owns `{temp_root}/{job_id}/` with a master playlist at its
//! root, one directory per rendition holding the media playlist and its
//! segments, and fetched subtitle files under `subs/`. All paths inside
//! playlists are relative. Playlists are replaced with write-then-rename so
//! a reader never observes a partial file; segments referenced by a
//! playlist are complete on disk before the playlist names them.

use std::io;
use std::path::{Component, Path, PathBuf};

use crate::engine::command::QualityRung;
use crate::jobs::SubtitleTrack;

/// Working directory for a job.
pub fn working_dir(temp_root: &Path, job_id: &str) -> PathBuf {
    temp_root.join(job_id)
}

/// Master playlist path inside a working directory.
pub fn master_path(working_dir: &Path) -> PathBuf {
    working_dir.join("master.m3u8")
}

/// Directory of one rendition.
pub fn variant_dir(working_dir: &Path, variant: &str) -> PathBuf {
    working_dir.join(variant)
}

/// Media playlist path of one rendition.
pub fn variant_playlist(variant_dir: &Path) -> PathBuf {
    variant_dir.join("playlist.m3u8")
}

/// Segment filename pattern of one rendition.
pub fn segment_pattern(variant_dir: &Path) -> PathBuf {
    variant_dir.join("segment_%05d.ts")
}

/// Subtitle directory inside a working directory.
pub fn subs_dir(working_dir: &Path) -> PathBuf {
    working_dir.join("subs")
}

/// On-disk path of one subtitle track.
pub fn subtitle_path(working_dir: &Path, lang: &str) -> PathBuf {
    subs_dir(working_dir).join(format!("{}.vtt", lang))
}

/// Write a file atomically: write to a sibling temp file, then rename.
pub fn write_atomic(path: &Path, content: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("m3u8.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)
}

/// Render the master playlist for a set of renditions.
///
/// Declares one SUBTITLES media entry per fetched track and one stream
/// entry per rendition, all with relative URIs. The playlist carries the
/// VOD marker so clients treat the stream as seekable while it grows.
pub fn master_playlist(variants: &[QualityRung], subtitles: &[SubtitleTrack]) -> String {
    let mut lines = vec![
        "#EXTM3U".to_string(),
        "#EXT-X-VERSION:3".to_string(),
        "#EXT-X-PLAYLIST-TYPE:VOD".to_string(),
    ];

    for track in subtitles {
        let name = track.name.clone().unwrap_or_else(|| track.lang.clone());
        lines.push(format!(
            "#EXT-X-MEDIA:TYPE=SUBTITLES,GROUP-ID=\"subs\",NAME=\"{}\",LANGUAGE=\"{}\",DEFAULT={},AUTOSELECT=YES,URI=\"subs/{}.vtt\"",
            name,
            track.lang,
            if track.default { "YES" } else { "NO" },
            track.lang
        ));
    }

    let subtitles_attr = if subtitles.is_empty() {
        String::new()
    } else {
        ",SUBTITLES=\"subs\"".to_string()
    };

    for variant in variants {
        lines.push(format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{},NAME=\"{}\"{}",
            variant.bandwidth_bps(),
            variant.width,
            variant.height,
            variant.name,
            subtitles_attr
        ));
        lines.push(format!("{}/playlist.m3u8", variant.name));
    }

    lines.join("\n") + "\n"
}

/// Resolve a client-supplied stream path inside a job's working directory.
///
/// Rejects traversal outside the working directory. Returns `None` for
/// illegal paths; a missing file is the caller's 404.
pub fn resolve_stream_path(temp_root: &Path, job_id: &str, rest: &str) -> Option<PathBuf> {
    if job_id.contains('/') || job_id.contains("..") {
        return None;
    }
    let relative = Path::new(rest);
    for component in relative.components() {
        match component {
            Component::Normal(_) => {}
            _ => return None,
        }
    }
    Some(working_dir(temp_root, job_id).join(relative))
}

/// Content type for a streaming artifact.
pub fn content_type_for(filename: &str) -> &'static str {
    if filename.ends_with(".m3u8") {
        "application/vnd.apple.mpegurl"
    } else if filename.ends_with(".ts") {
        "video/mp2t"
    } else if filename.ends_with(".mp4") {
        "video/mp4"
    } else if filename.ends_with(".vtt") {
        "text/vtt"
    } else {
        "application/octet-stream"
    }
}
