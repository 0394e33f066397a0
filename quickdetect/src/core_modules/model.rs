// THEORY:
// The `model` module is the seam between the orchestrator and whatever actually
// runs a neural network. The core treats a model as an opaque capability: it asks
// a `ModelProvider` for one, calls `infer` once per unit, and never inspects
// weights, download state or tensors.
//
// Both traits are synchronous. Loading weights and running inference are blocking,
// CPU/GPU-bound operations; the run moves them onto tokio's blocking pool so the
// async control path is never stalled by a slow model.

use crate::core_modules::media::Frame;
use crate::core_modules::preset::{Device, InferenceParams, Preset};
use crate::core_modules::result::TaskOutput;
use crate::core_modules::task::TaskKind;
use crate::error::{ModelError, ModelUnavailable};

/// Everything a provider needs to pick and load a model.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelRequest {
    pub task: TaskKind,
    pub weight_id: String,
    pub device: Device,
    pub half_precision: bool,
}

impl ModelRequest {
    pub fn from_preset(task: TaskKind, preset: &Preset) -> Self {
        Self {
            task,
            weight_id: preset.weight_id.clone(),
            device: preset.device,
            half_precision: preset.half_precision,
        }
    }
}

/// A loaded, runnable model instance. Each run owns its own.
pub trait Model: Send {
    /// The task this model was built for.
    fn task(&self) -> TaskKind;

    fn infer(&mut self, unit: &Frame, params: &InferenceParams) -> Result<TaskOutput, ModelError>;
}

/// Supplies runnable models. Implementations may download or cache weights;
/// the core only sees the outcome.
pub trait ModelProvider: Send + Sync {
    fn get_model(&self, request: &ModelRequest) -> Result<Box<dyn Model>, ModelUnavailable>;
}
