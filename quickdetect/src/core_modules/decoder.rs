// THEORY:
// Static media (images and video files) is turned into units by a `MediaDecoder`.
// Decoding is an external concern, so this module only fixes the seam and ships
// one concrete decoder for still images, built on the `image` crate. Video
// container decoding is left to whoever embeds the orchestrator.
//
// A decoder opens a reference into a `UnitReader`, a blocking pull iterator the
// run drives one unit at a time. Pulling instead of pushing keeps cancellation
// cheap: a cancelled run simply stops asking for the next unit.

use crate::core_modules::media::{Frame, Locator, MediaReference};
use crate::core_modules::task::MediaKind;
use crate::error::MediaError;

/// Blocking, pull-based reader over the units of one static media reference.
pub trait UnitReader: Send {
    /// Total number of units, if known up front.
    fn total_units(&self) -> Option<u64>;

    /// The next unit in source order, or `None` once exhausted.
    fn next_unit(&mut self) -> Option<Result<Frame, MediaError>>;
}

/// Opens static media references into unit readers.
pub trait MediaDecoder: Send + Sync {
    fn open(&self, media: &MediaReference) -> Result<Box<dyn UnitReader>, MediaError>;
}

/// Decodes still images from the filesystem into a single RGBA8 unit.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageFileDecoder;

impl MediaDecoder for ImageFileDecoder {
    fn open(&self, media: &MediaReference) -> Result<Box<dyn UnitReader>, MediaError> {
        let locator = media.locator().to_string();
        let path = match (media.kind(), media.locator()) {
            (MediaKind::Image, Locator::Path(path)) => path,
            (kind, _) => {
                return Err(MediaError::Unsupported {
                    locator,
                    reason: format!("{kind} media is not decoded by the image decoder"),
                });
            }
        };

        let bytes = std::fs::read(path).map_err(|e| MediaError::Read {
            locator: locator.clone(),
            reason: e.to_string(),
        })?;
        let image = image::load_from_memory(&bytes).map_err(|e| MediaError::Decode {
            locator: locator.clone(),
            reason: e.to_string(),
        })?;
        let rgba = image.to_rgba8();
        let (width, height) = rgba.dimensions();
        let frame = Frame::new(0, 0, width, height, rgba.into_raw());

        Ok(Box::new(SingleUnit { frame: Some(frame) }))
    }
}

/// A reader over exactly one unit.
struct SingleUnit {
    frame: Option<Frame>,
}

impl UnitReader for SingleUnit {
    fn total_units(&self) -> Option<u64> {
        Some(1)
    }

    fn next_unit(&mut self) -> Option<Result<Frame, MediaError>> {
        self.frame.take().map(Ok)
    }
}

/// Reader over frames already held in memory. Useful for callers that decode
/// video themselves and for tests.
pub struct InMemoryReader {
    frames: std::vec::IntoIter<Frame>,
    total: u64,
}

impl InMemoryReader {
    pub fn new(frames: Vec<Frame>) -> Self {
        let total = frames.len() as u64;
        Self {
            frames: frames.into_iter(),
            total,
        }
    }
}

impl UnitReader for InMemoryReader {
    fn total_units(&self) -> Option<u64> {
        Some(self.total)
    }

    fn next_unit(&mut self) -> Option<Result<Frame, MediaError>> {
        self.frames.next().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgba};

    #[test]
    fn decodes_png_into_one_rgba_unit() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("square.png");
        let buffer: ImageBuffer<Rgba<u8>, Vec<u8>> = ImageBuffer::from_pixel(4, 3, Rgba([10, 20, 30, 255]));
        buffer.save(&path).expect("write png");

        let mut reader = ImageFileDecoder.open(&MediaReference::image(&path)).expect("open image");
        assert_eq!(reader.total_units(), Some(1));

        let frame = reader.next_unit().expect("one unit").expect("decoded");
        assert_eq!((frame.width, frame.height), (4, 3));
        assert_eq!(frame.data.len(), 4 * 3 * 4);
        assert_eq!(&frame.data[..4], &[10, 20, 30, 255]);
        assert!(reader.next_unit().is_none());
    }

    #[test]
    fn refuses_video_and_reports_missing_files() {
        let video = ImageFileDecoder.open(&MediaReference::video("clip.mp4"));
        assert!(matches!(video, Err(MediaError::Unsupported { .. })));

        let missing = ImageFileDecoder.open(&MediaReference::image("/definitely/not/here.png"));
        assert!(matches!(missing, Err(MediaError::Read { .. })));
    }
}
