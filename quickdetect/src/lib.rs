// THEORY:
// This file is the main entry point for the `quickdetect` library crate.
// It follows the standard Rust convention of using `lib.rs` to define the public
// API that will be exposed to external consumers (a desktop shell, a web
// service, the bundled example runner).
//
// The primary goal is to export the `PipelineOrchestrator` and its associated
// data structures (`RunRequest`, `RunHandle`, `RunReport`, etc.) as the clean,
// high-level interface for the whole inference engine. The building blocks live
// in `core_modules`; they stay public so embedders can implement the model,
// decoder, live-source and sink seams.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod live_pipeline;
pub mod pipeline;

pub use config::OrchestratorConfig;
pub use core_modules::decoder::{ImageFileDecoder, InMemoryReader, MediaDecoder, UnitReader};
pub use core_modules::fetcher::{LiveSource, LiveStream};
pub use core_modules::model::{Model, ModelProvider, ModelRequest};
pub use core_modules::result::ChannelSink;
pub use core_modules::run::{RunHandle, RunId, RunStatus};
pub use core_modules::task::{CompatibilityTable, is_compatible};
pub use error::{ConfigError, MediaError, ModelError, ModelUnavailable, RunError, StreamIoError, SubmitError};
pub use pipeline::{OrchestratorBuilder, PipelineOrchestrator, RunRequest};
