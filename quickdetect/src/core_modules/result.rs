// THEORY:
// The `result` module defines what a run produces and how it leaves the core.
//
// A `TaskOutput` is the raw, task-shaped answer a model gives for one unit. The run
// wraps it (after applying the preset's confidence threshold) into a `ResultUnit`,
// stamps it with the run, source and unit identity, and from then on it is
// immutable and shared as `Arc<ResultUnit>`.
//
// Results leave the core through the `ResultSink` seam: the rendering and history
// collaborators implement it and receive every unit as it is produced, followed by
// exactly one terminal `RunReport`. Sinks must accept reports for cancelled and
// failed runs too; those reports still carry every unit completed before the end.
// A static reference that cannot be read does not end a batch: it is reported to
// sinks as it happens, listed in the report, and the run moves on.

use crate::core_modules::media::MediaReference;
use crate::core_modules::run::{RunId, RunState};
use crate::core_modules::task::TaskKind;
use crate::error::{MediaError, RunError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: u32,
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub detection: Detection,
    /// Mask outline as a closed polygon in pixel coordinates.
    pub polygon: Vec<[f32; 2]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub class_id: u32,
    pub label: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedObject {
    /// Identity that persists across consecutive units of the same source.
    pub track_id: u64,
    pub detection: Detection,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseInstance {
    pub detection: Detection,
    pub keypoints: Vec<Keypoint>,
}

/// The task-shaped output of a model for a single unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", content = "instances", rename_all = "lowercase")]
pub enum TaskOutput {
    Detect(Vec<Detection>),
    Segment(Vec<Segment>),
    Classify(Vec<Classification>),
    Track(Vec<TrackedObject>),
    Pose(Vec<PoseInstance>),
}

impl TaskOutput {
    pub fn task(&self) -> TaskKind {
        match self {
            TaskOutput::Detect(_) => TaskKind::Detect,
            TaskOutput::Segment(_) => TaskKind::Segment,
            TaskOutput::Classify(_) => TaskKind::Classify,
            TaskOutput::Track(_) => TaskKind::Track,
            TaskOutput::Pose(_) => TaskKind::Pose,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TaskOutput::Detect(items) => items.len(),
            TaskOutput::Segment(items) => items.len(),
            TaskOutput::Classify(items) => items.len(),
            TaskOutput::Track(items) => items.len(),
            TaskOutput::Pose(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every instance scoring below `threshold`.
    pub fn retain_confident(&mut self, threshold: f32) {
        match self {
            TaskOutput::Detect(items) => items.retain(|d| d.confidence >= threshold),
            TaskOutput::Segment(items) => items.retain(|s| s.detection.confidence >= threshold),
            TaskOutput::Classify(items) => items.retain(|c| c.confidence >= threshold),
            TaskOutput::Track(items) => items.retain(|t| t.detection.confidence >= threshold),
            TaskOutput::Pose(items) => items.retain(|p| p.detection.confidence >= threshold),
        }
    }
}

/// One task's output for one media unit. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultUnit {
    pub run_id: RunId,
    pub source: MediaReference,
    pub unit_index: u64,
    pub timestamp_ms: u64,
    pub output: TaskOutput,
}

/// The terminal summary of a run, handed to sinks exactly once.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    pub task: TaskKind,
    pub state: RunState,
    /// Units processed before the run ended, whatever the terminal state.
    pub units_processed: u64,
    /// Every emitted result, unless the run was live and retention is disabled.
    pub results: Vec<Arc<ResultUnit>>,
    /// Static references skipped because they could not be opened or decoded.
    pub skipped: Vec<MediaError>,
    pub error: Option<RunError>,
}

/// Events published on the orchestrator's broadcast bus.
#[derive(Debug, Clone)]
pub enum RunEvent {
    Started { run_id: RunId },
    Result(Arc<ResultUnit>),
    MediaSkipped { run_id: RunId, error: MediaError },
    Finished(Arc<RunReport>),
}

/// Receives results from the core. Implemented by rendering and history collaborators.
pub trait ResultSink: Send + Sync {
    fn on_result(&self, unit: &Arc<ResultUnit>);

    /// A static reference could not be read; the run continues with the next one.
    fn on_media_error(&self, _run_id: RunId, _error: &MediaError) {}

    fn on_finished(&self, report: &RunReport);
}

/// A sink that forwards everything into an unbounded channel, for consumers that
/// prefer to `await` results instead of being called back.
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<RunEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl ResultSink for ChannelSink {
    fn on_result(&self, unit: &Arc<ResultUnit>) {
        let _ = self.sender.send(RunEvent::Result(Arc::clone(unit)));
    }

    fn on_media_error(&self, run_id: RunId, error: &MediaError) {
        let _ = self.sender.send(RunEvent::MediaSkipped { run_id, error: error.clone() });
    }

    fn on_finished(&self, report: &RunReport) {
        let _ = self.sender.send(RunEvent::Finished(Arc::new(report.clone())));
    }
}

/// Fans run output out to every registered sink and to broadcast subscribers.
#[derive(Clone)]
pub struct ResultDispatch {
    sinks: Arc<[Arc<dyn ResultSink>]>,
    events: broadcast::Sender<RunEvent>,
}

impl ResultDispatch {
    pub fn new(sinks: Vec<Arc<dyn ResultSink>>, events: broadcast::Sender<RunEvent>) -> Self {
        Self {
            sinks: sinks.into(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    pub fn started(&self, run_id: RunId) {
        // No subscribers is not an error.
        let _ = self.events.send(RunEvent::Started { run_id });
    }

    pub fn result(&self, unit: &Arc<ResultUnit>) {
        for sink in self.sinks.iter() {
            sink.on_result(unit);
        }
        let _ = self.events.send(RunEvent::Result(Arc::clone(unit)));
    }

    pub fn media_skipped(&self, run_id: RunId, error: &MediaError) {
        for sink in self.sinks.iter() {
            sink.on_media_error(run_id, error);
        }
        let _ = self.events.send(RunEvent::MediaSkipped {
            run_id,
            error: error.clone(),
        });
    }

    pub fn finished(&self, report: &Arc<RunReport>) {
        for sink in self.sinks.iter() {
            sink.on_finished(report);
        }
        let _ = self.events.send(RunEvent::Finished(Arc::clone(report)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(confidence: f32) -> Detection {
        Detection {
            class_id: 0,
            label: "person".to_string(),
            confidence,
            bbox: BoundingBox { x1: 0.0, y1: 0.0, x2: 10.0, y2: 20.0 },
        }
    }

    #[test]
    fn confidence_filter_applies_to_nested_detections() {
        let mut output = TaskOutput::Pose(vec![
            PoseInstance { detection: detection(0.9), keypoints: vec![] },
            PoseInstance { detection: detection(0.1), keypoints: vec![] },
        ]);
        output.retain_confident(0.5);
        assert_eq!(output.len(), 1);
        assert_eq!(output.task(), TaskKind::Pose);
    }

    #[test]
    fn outputs_serialize_with_their_task_tag() {
        let output = TaskOutput::Classify(vec![Classification {
            class_id: 3,
            label: "dog".to_string(),
            confidence: 0.75,
        }]);
        let json = serde_json::to_value(&output).expect("serialize output");
        assert_eq!(json["task"], "classify");
        assert_eq!(json["instances"][0]["label"], "dog");
    }
}
