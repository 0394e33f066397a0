// THEORY:
// The `media` module holds the two "dumb" data containers that flow through every
// run: the `MediaReference`, which names *where* units come from, and the `Frame`,
// which is a single unit of pixels pulled from it.
//
// A `MediaReference` arrives already classified. The orchestrator never looks at
// a file's bytes or a URL's scheme to decide what it is; that is the job of a media
// resolver. `MediaReference::resolve` is the default resolver (extension and
// scheme based) and is offered for callers without one of their own.

use crate::core_modules::task::MediaKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "webp", "tiff"];
const VIDEO_EXTENSIONS: [&str; 5] = ["mp4", "avi", "mkv", "mov", "webm"];
const LIVE_SCHEMES: [&str; 6] = ["rtsp://", "rtmp://", "http://", "https://", "udp://", "tcp://"];
const WEBCAM_PREFIX: &str = "webcam:";

/// Where a media source lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Locator {
    Path(PathBuf),
    Url(String),
    Device(u32),
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Path(path) => write!(f, "{}", path.display()),
            Locator::Url(url) => f.write_str(url),
            Locator::Device(index) => write!(f, "{WEBCAM_PREFIX}{index}"),
        }
    }
}

/// An opaque handle to a source plus its resolved kind. Read-only once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaReference {
    locator: Locator,
    kind: MediaKind,
}

impl MediaReference {
    pub fn new(locator: Locator, kind: MediaKind) -> Self {
        Self { locator, kind }
    }

    pub fn image(path: impl Into<PathBuf>) -> Self {
        Self::new(Locator::Path(path.into()), MediaKind::Image)
    }

    pub fn video(path: impl Into<PathBuf>) -> Self {
        Self::new(Locator::Path(path.into()), MediaKind::Video)
    }

    pub fn live(url: impl Into<String>) -> Self {
        Self::new(Locator::Url(url.into()), MediaKind::Live)
    }

    pub fn webcam(index: u32) -> Self {
        Self::new(Locator::Device(index), MediaKind::Live)
    }

    /// Default resolver: `webcam:<n>` is a device, known stream schemes are live,
    /// and files are classified by extension. Anything else is `Unknown`.
    pub fn resolve(raw: &str) -> Self {
        let raw = raw.trim();
        if let Some(index) = raw.strip_prefix(WEBCAM_PREFIX) {
            return match index.parse::<u32>() {
                Ok(index) => Self::webcam(index),
                Err(_) => Self::new(Locator::Url(raw.to_string()), MediaKind::Unknown),
            };
        }

        let lowered = raw.to_ascii_lowercase();
        if LIVE_SCHEMES.iter().any(|scheme| lowered.starts_with(scheme)) {
            return Self::live(raw);
        }

        let path = Path::new(raw);
        let kind = match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) => MediaKind::Image,
            Some(ext) if VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) => MediaKind::Video,
            _ => MediaKind::Unknown,
        };
        Self::new(Locator::Path(path.to_path_buf()), kind)
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }
}

impl fmt::Display for MediaReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.locator, self.kind)
    }
}

/// A single media unit: a whole still image, or one frame of a video or stream.
/// Pixel data is RGBA8 and shared, so handing a frame around never copies it.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Position of this unit within its source, starting at 0.
    pub index: u64,
    /// Milliseconds since the start of the source (or since the stream was opened).
    pub timestamp_ms: u64,
    pub width: u32,
    pub height: u32,
    pub data: Arc<[u8]>,
}

impl Frame {
    pub fn new(index: u64, timestamp_ms: u64, width: u32, height: u32, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            index,
            timestamp_ms,
            width,
            height,
            data: data.into(),
        }
    }

    /// Number of pixels the frame claims to hold.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}
