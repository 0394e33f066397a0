// THEORY:
// A `Preset` is the named bundle of knobs a user picks before running a task:
// which weights to load, on which device and precision, which thresholds apply,
// and how results should later be rendered. The orchestrator never owns presets;
// callers hand one in as an `Arc<Preset>` and every run only borrows it.
//
// Presets come from user-edited files, so they are checked twice:
// - `validate` is strict and is what `submit` uses. A bad preset is rejected
//   before any run exists.
// - `sanitize` is lenient and is what loaders use. Every invalid field is reverted
//   to its default with a warning, and the caller learns whether anything changed
//   so it can write the repaired preset back.

use crate::error::PresetError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;
const DEFAULT_IOU_THRESHOLD: f32 = 0.7;
const DEFAULT_BOX_THICKNESS: f32 = 2.0;
const DEFAULT_TEXT_SIZE: f32 = 1.5;
const IMAGE_FORMATS: [&str; 2] = ["png", "jpg"];
const VIDEO_FORMATS: [&str; 2] = ["mp4", "avi"];

pub type Rgba = [u8; 4];

/// Compute device a model is loaded on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(Option<u32>),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda(None) => f.write_str("cuda"),
            Device::Cuda(Some(index)) => write!(f, "cuda:{index}"),
        }
    }
}

impl FromStr for Device {
    type Err = PresetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PresetError::Device(s.to_string());
        let (name, index) = match s.split_once(':') {
            Some((name, index)) => (name, Some(index)),
            None => (s, None),
        };
        let index = match index {
            None => None,
            Some(digits) if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) => {
                Some(digits.parse::<u32>().map_err(|_| invalid())?)
            }
            Some(_) => return Err(invalid()),
        };
        match (name, index) {
            ("cpu", None) => Ok(Device::Cpu),
            // `cpu:<n>` is accepted but the index carries no meaning.
            ("cpu", Some(_)) => Ok(Device::Cpu),
            ("cuda", index) => Ok(Device::Cuda(index)),
            _ => Err(invalid()),
        }
    }
}

impl Serialize for Device {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Device {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Named bundle of model, thresholds and rendering options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preset {
    pub name: String,
    /// Identifier of the weights the model provider should load.
    pub weight_id: String,
    pub device: Device,
    pub half_precision: bool,
    /// Instances scoring below this are dropped from results.
    pub confidence_threshold: f32,
    pub iou_threshold: f32,

    // --- Rendering options, passed through to result sinks untouched ---
    pub image_format: String,
    pub video_format: String,
    pub box_color: Rgba,
    pub box_color_per_class: bool,
    pub segment_color: Rgba,
    pub segment_color_per_class: bool,
    pub text_color: Rgba,
    pub box_thickness: f32,
    pub text_size: f32,
}

impl Default for Preset {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            weight_id: String::new(),
            device: Device::Cpu,
            half_precision: false,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            image_format: "png".to_string(),
            video_format: "mp4".to_string(),
            box_color: [0, 255, 0, 255],
            box_color_per_class: false,
            segment_color: [0, 255, 0, 255],
            segment_color_per_class: false,
            text_color: [0, 0, 0, 255],
            box_thickness: DEFAULT_BOX_THICKNESS,
            text_size: DEFAULT_TEXT_SIZE,
        }
    }
}

impl Preset {
    pub fn new(name: impl Into<String>, weight_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weight_id: weight_id.into(),
            ..Self::default()
        }
    }

    /// Strict check used at submission time.
    pub fn validate(&self) -> Result<(), PresetError> {
        if self.weight_id.trim().is_empty() {
            return Err(PresetError::EmptyWeight);
        }
        check_unit_interval("confidence", self.confidence_threshold)?;
        check_unit_interval("iou", self.iou_threshold)?;
        if !IMAGE_FORMATS.contains(&self.image_format.as_str()) {
            return Err(PresetError::ImageFormat(self.image_format.clone()));
        }
        if !VIDEO_FORMATS.contains(&self.video_format.as_str()) {
            return Err(PresetError::VideoFormat(self.video_format.clone()));
        }
        check_non_negative("box thickness", self.box_thickness)?;
        check_non_negative("text size", self.text_size)?;
        Ok(())
    }

    /// Reverts every invalid field to its default. Returns `true` if anything changed.
    pub fn sanitize(&mut self) -> bool {
        let defaults = Preset::default();
        let mut changed = false;

        if check_unit_interval("confidence", self.confidence_threshold).is_err() {
            warn!(preset = %self.name, value = self.confidence_threshold, "invalid confidence threshold, reverting");
            self.confidence_threshold = defaults.confidence_threshold;
            changed = true;
        }
        if check_unit_interval("iou", self.iou_threshold).is_err() {
            warn!(preset = %self.name, value = self.iou_threshold, "invalid iou threshold, reverting");
            self.iou_threshold = defaults.iou_threshold;
            changed = true;
        }
        if !IMAGE_FORMATS.contains(&self.image_format.as_str()) {
            warn!(preset = %self.name, value = %self.image_format, "invalid image format, reverting");
            self.image_format = defaults.image_format;
            changed = true;
        }
        if !VIDEO_FORMATS.contains(&self.video_format.as_str()) {
            warn!(preset = %self.name, value = %self.video_format, "invalid video format, reverting");
            self.video_format = defaults.video_format;
            changed = true;
        }
        if check_non_negative("box thickness", self.box_thickness).is_err() {
            warn!(preset = %self.name, value = self.box_thickness, "invalid box thickness, reverting");
            self.box_thickness = defaults.box_thickness;
            changed = true;
        }
        if check_non_negative("text size", self.text_size).is_err() {
            warn!(preset = %self.name, value = self.text_size, "invalid text size, reverting");
            self.text_size = defaults.text_size;
            changed = true;
        }

        changed
    }

    /// Parses a preset from JSON, sanitizing whatever it finds.
    /// Returns the preset and whether it had to be repaired.
    pub fn from_json(raw: &str) -> Result<(Self, bool), serde_json::Error> {
        let mut preset: Preset = serde_json::from_str(raw)?;
        let changed = preset.sanitize();
        Ok((preset, changed))
    }

    /// The subset of the preset a model sees at inference time.
    pub fn inference_params(&self) -> InferenceParams {
        InferenceParams {
            confidence_threshold: self.confidence_threshold,
            iou_threshold: self.iou_threshold,
            half_precision: self.half_precision,
        }
    }
}

/// Per-call parameters handed to `Model::infer`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InferenceParams {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub half_precision: bool,
}

fn check_unit_interval(name: &'static str, value: f32) -> Result<(), PresetError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(PresetError::Threshold { name, value })
    }
}

fn check_non_negative(name: &'static str, value: f32) -> Result<(), PresetError> {
    if value >= 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(PresetError::Negative { name, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_strings_round_trip_through_parsing() {
        assert_eq!("cpu".parse::<Device>(), Ok(Device::Cpu));
        assert_eq!("cuda".parse::<Device>(), Ok(Device::Cuda(None)));
        assert_eq!("cuda:1".parse::<Device>(), Ok(Device::Cuda(Some(1))));
        assert_eq!(Device::Cuda(Some(3)).to_string(), "cuda:3");
        assert!("cuda:".parse::<Device>().is_err());
        assert!("cuda:x".parse::<Device>().is_err());
        assert!("metal".parse::<Device>().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_thresholds() {
        let mut preset = Preset::new("p", "yolo11n");
        assert!(preset.validate().is_ok());

        preset.iou_threshold = 1.5;
        assert_eq!(
            preset.validate(),
            Err(PresetError::Threshold { name: "iou", value: 1.5 })
        );
    }

    #[test]
    fn validate_requires_weights() {
        assert_eq!(Preset::default().validate(), Err(PresetError::EmptyWeight));
    }

    #[test]
    fn sanitize_reverts_only_invalid_fields() {
        let mut preset = Preset::new("p", "yolo11n");
        preset.confidence_threshold = -0.2;
        preset.video_format = "mkv".to_string();
        preset.box_thickness = 4.0;

        assert!(preset.sanitize());
        assert_eq!(preset.confidence_threshold, DEFAULT_CONFIDENCE_THRESHOLD);
        assert_eq!(preset.video_format, "mp4");
        assert_eq!(preset.box_thickness, 4.0);
        assert!(!preset.sanitize());
    }

    #[test]
    fn json_presets_fill_missing_fields_with_defaults() {
        let (preset, changed) =
            Preset::from_json(r#"{"name": "night", "weight_id": "yolo11s", "device": "cuda:0", "image_format": "gif"}"#)
                .expect("parse preset");
        assert!(changed);
        assert_eq!(preset.device, Device::Cuda(Some(0)));
        assert_eq!(preset.image_format, "png");
        assert_eq!(preset.iou_threshold, DEFAULT_IOU_THRESHOLD);
    }

    #[test]
    fn json_presets_reject_bad_devices() {
        assert!(Preset::from_json(r#"{"device": "tpu"}"#).is_err());
    }
}
