//! Encoder failure classification.
//!
//! Maps the stderr tail of a failed encoder run onto a recovery class:
//! hardware faults trigger the software fallback, transient faults are
//! retried with backoff, everything else is fatal for the job.

/// Recovery class of an encoder failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Driver, device, or encoder-session fault: replan onto software.
    Hardware,
    /// Network or resource hiccup: retry the same plan with backoff.
    Transient,
    /// Unrecoverable source/codec issue: surface as job error.
    Fatal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Hardware => write!(f, "encoder_hardware"),
            ErrorClass::Transient => write!(f, "encoder_transient"),
            ErrorClass::Fatal => write!(f, "encoder_fatal"),
        }
    }
}

/// Ordered pattern table. The first matching pattern wins, so the more
/// specific hardware patterns sit above the generic ones and fatal
/// patterns that contain transient-looking words sit above those.
const ERROR_PATTERNS: &[(&str, ErrorClass)] = &[
    // NVENC / CUDA
    ("no nvenc capable devices", ErrorClass::Hardware),
    ("no capable devices found", ErrorClass::Hardware),
    ("openencodesessionex failed", ErrorClass::Hardware),
    ("encodesessionlimitexceeded", ErrorClass::Hardware),
    ("nvenc", ErrorClass::Hardware),
    ("cuda", ErrorClass::Hardware),
    ("exceeds level limit", ErrorClass::Hardware),
    // QSV
    ("mfx_err", ErrorClass::Hardware),
    ("qsv", ErrorClass::Hardware),
    // AMF / D3D
    ("amf", ErrorClass::Hardware),
    ("d3d11", ErrorClass::Hardware),
    // VAAPI
    ("vaapi", ErrorClass::Hardware),
    ("/dev/dri", ErrorClass::Hardware),
    // VideoToolbox
    ("videotoolbox", ErrorClass::Hardware),
    // Generic hardware
    ("hw_frames_ctx", ErrorClass::Hardware),
    ("hwaccel", ErrorClass::Hardware),
    ("hwupload", ErrorClass::Hardware),
    ("driver", ErrorClass::Hardware),
    ("gpu", ErrorClass::Hardware),
    ("out of memory on device", ErrorClass::Hardware),
    // Fatal classes that would otherwise match a transient word below.
    ("404 not found", ErrorClass::Fatal),
    ("403 forbidden", ErrorClass::Fatal),
    ("invalid data", ErrorClass::Fatal),
    ("invalid argument", ErrorClass::Fatal),
    ("no such file", ErrorClass::Fatal),
    ("permission denied", ErrorClass::Fatal),
    ("codec not found", ErrorClass::Fatal),
    ("encoder not found", ErrorClass::Fatal),
    ("decoder not found", ErrorClass::Fatal),
    ("filter not found", ErrorClass::Fatal),
    ("moov atom not found", ErrorClass::Fatal),
    ("no space left", ErrorClass::Fatal),
    // Transient network / IO faults on the source.
    ("connection refused", ErrorClass::Transient),
    ("connection reset", ErrorClass::Transient),
    ("connection timed out", ErrorClass::Transient),
    ("timeout", ErrorClass::Transient),
    ("timed out", ErrorClass::Transient),
    ("temporarily unavailable", ErrorClass::Transient),
    ("network is unreachable", ErrorClass::Transient),
    ("no route to host", ErrorClass::Transient),
    ("end of file", ErrorClass::Transient),
    ("server returned 5", ErrorClass::Transient),
    ("broken pipe", ErrorClass::Transient),
    ("tls", ErrorClass::Transient),
    ("ssl", ErrorClass::Transient),
    ("cannot allocate", ErrorClass::Transient),
    ("too many open files", ErrorClass::Transient),
    ("stalled", ErrorClass::Transient),
];

/// Classify an encoder failure from its stderr tail.
///
/// Unrecognised failures are fatal; retrying an unknown error just burns
/// attempts against the same wall.
pub fn classify(stderr: &str) -> ErrorClass {
    let lower = stderr.to_lowercase();
    for (pattern, class) in ERROR_PATTERNS {
        if lower.contains(pattern) {
            return *class;
        }
    }
    ErrorClass::Fatal
}
