// THEORY:
// Every failure the orchestrator can report lives here, split by *when* it can
// happen. `SubmitError`s are policy or request violations caught synchronously in
// `submit`, before any run, buffer or task is allocated. `RunError`s happen while
// a run is executing; they never cross the asynchronous boundary as a returned
// error. Instead they are recorded on the run and surfaced through `status` and
// the terminal `RunReport` handed to result sinks.
//
// The leaf errors (`MediaError`, `ModelError`, `BufferError`, ...) belong to the
// external seams (decoders, model providers, live sources) and are wrapped by
// `RunError` unchanged so the caller sees the collaborator's own message.

use crate::core_modules::task::{MediaKind, TaskKind};
use thiserror::Error;

/// Rejections returned synchronously by `PipelineOrchestrator::submit`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SubmitError {
    #[error("task {task} is not compatible with {media} media")]
    IncompatibleTask { media: MediaKind, task: TaskKind },

    #[error("media kind of '{locator}' could not be resolved")]
    UnresolvedMedia { locator: String },

    #[error("run request contains no media")]
    EmptyRequest,

    #[error("a live run accepts exactly one source, got {count}")]
    MultipleLiveSources { count: usize },

    #[error("live sources cannot be mixed with static media in one run")]
    MixedMedia,

    #[error("no live source is configured to open '{locator}'")]
    NoLiveSource { locator: String },

    #[error("invalid preset: {0}")]
    InvalidPreset(#[from] PresetError),

    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

/// Execution-time failures recorded on a run that ends in `Failed`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RunError {
    #[error(transparent)]
    ModelUnavailable(#[from] ModelUnavailable),

    #[error("model serves task {actual}, run requested {expected}")]
    ModelTaskMismatch { expected: TaskKind, actual: TaskKind },

    #[error("model produced {actual} output for a {expected} run")]
    OutputMismatch { expected: TaskKind, actual: TaskKind },

    #[error("inference failed on unit {unit_index}: {source}")]
    Inference {
        unit_index: u64,
        #[source]
        source: ModelError,
    },

    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("stream I/O error: {0}")]
    StreamIo(String),

    #[error("worker task aborted: {0}")]
    Worker(String),
}

/// The model provider could not supply a runnable model.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("model '{weight_id}' for task {task} is unavailable: {reason}")]
pub struct ModelUnavailable {
    pub task: TaskKind,
    pub weight_id: String,
    pub reason: String,
}

/// Raised by `Model::infer` for a single unit.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("inference backend error: {0}")]
    Backend(String),
}

/// Raised by media decoders while opening or reading static media.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MediaError {
    #[error("unsupported media '{locator}': {reason}")]
    Unsupported { locator: String, reason: String },

    #[error("failed to read '{locator}': {reason}")]
    Read { locator: String, reason: String },

    #[error("failed to decode '{locator}': {reason}")]
    Decode { locator: String, reason: String },
}

/// Raised by the stream buffer once it has been closed.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("stream buffer is closed")]
    Closed,
}

/// Raised by a live source while connecting or reading.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("live source '{locator}': {reason}")]
pub struct StreamIoError {
    pub locator: String,
    pub reason: String,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PresetError {
    #[error("invalid device '{0}', expected cpu, cuda or cuda:<index>")]
    Device(String),

    #[error("{name} threshold {value} is outside [0, 1]")]
    Threshold { name: &'static str, value: f32 },

    #[error("unsupported image format '{0}'")]
    ImageFormat(String),

    #[error("unsupported video format '{0}'")]
    VideoFormat(String),

    #[error("{name} must not be negative, got {value}")]
    Negative { name: &'static str, value: f32 },

    #[error("weight identifier is empty")]
    EmptyWeight,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {key}='{value}' is invalid: {reason}")]
    Env {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("an orchestrator must be built inside a tokio runtime: {0}")]
    NoRuntime(String),
}

/// Result type for submission
pub type SubmitResult<T> = std::result::Result<T, SubmitError>;
