// THEORY:
// The `pipeline` module is the top-level API of the orchestrator. It encapsulates
// the whole stack (compatibility policy, runs, live fetchers and buffers, result
// fan-out) behind a small control surface: `submit`, `cancel`, `status`,
// `subscribe` and `shutdown`.
//
// Key architectural principles:
// 1.  **Validate Before Allocating**: `submit` checks the request synchronously
//     (media resolved, live/static shape, task compatibility, preset) and returns
//     a `SubmitError` before any run, buffer or task exists.
// 2.  **Never Await Inference**: `submit` and `cancel` return immediately. All work
//     happens on spawned tasks; callers observe it through `RunHandle`s, result
//     sinks and the event bus.
// 3.  **Explicit Registry**: The only state the orchestrator keeps is its
//     active-run registry. An entry is created on submit and removed once the
//     run's terminal report has been handed to every sink and its fetcher (if
//     any) has stopped.
// 4.  **Clean Shutdown**: `shutdown` cancels every active run and waits for all of
//     their tasks, so no producer outlives the orchestrator. The shutdown flag is
//     only flipped and checked under the registry lock, so a submission either
//     lands in the registry before it is drained or is refused.
// 5.  **Owned Runtime**: `build` captures the tokio runtime it is called from and
//     every run is spawned onto it, so `submit` works from any thread.

use crate::config::OrchestratorConfig;
use crate::core_modules::decoder::{ImageFileDecoder, MediaDecoder};
use crate::core_modules::fetcher::LiveSource;
use crate::core_modules::model::ModelProvider;
use crate::core_modules::result::ResultDispatch;
use crate::core_modules::run::{InferenceRun, RunHandle, RunId, RunShared, RunStatus, UnitSource};
use crate::core_modules::stream_buffer::EndReason;
use crate::core_modules::task::CompatibilityTable;
use crate::error::{ConfigError, SubmitError, SubmitResult};
use crate::live_pipeline::LivePipeline;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// Re-export key data structures for the public API.
pub use crate::core_modules::media::{Frame, Locator, MediaReference};
pub use crate::core_modules::preset::{Device, Preset};
pub use crate::core_modules::result::{ResultSink, ResultUnit, RunEvent, RunReport, TaskOutput};
pub use crate::core_modules::run::{Progress, RunState};
pub use crate::core_modules::stream_buffer::{LiveStats, OverflowPolicy};
pub use crate::core_modules::task::{MediaKind, TaskKind};

/// Everything needed to start one run. There is no ambient "current" preset or
/// media; each request carries its own. The preset names a single weight, so
/// comparing weights takes one request per weight.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub media: Vec<MediaReference>,
    pub task: TaskKind,
    pub preset: Arc<Preset>,
}

impl RunRequest {
    pub fn new(media: impl IntoIterator<Item = MediaReference>, task: TaskKind, preset: impl Into<Arc<Preset>>) -> Self {
        Self {
            media: media.into_iter().collect(),
            task,
            preset: preset.into(),
        }
    }

    pub fn single(media: MediaReference, task: TaskKind, preset: impl Into<Arc<Preset>>) -> Self {
        Self::new([media], task, preset)
    }
}

/// The validated shape of a request.
enum Plan {
    Static {
        kind: MediaKind,
    },
    Live {
        source: Arc<dyn LiveSource>,
        reference: MediaReference,
    },
}

struct ActiveRun {
    handle: RunHandle,
    /// Present for live runs only.
    stop: Option<Arc<watch::Sender<bool>>>,
    task: JoinHandle<()>,
}

type Registry = Arc<Mutex<HashMap<RunId, ActiveRun>>>;

/// Assembles a `PipelineOrchestrator`. Only the model provider is mandatory.
pub struct OrchestratorBuilder {
    provider: Arc<dyn ModelProvider>,
    decoder: Arc<dyn MediaDecoder>,
    live_source: Option<Arc<dyn LiveSource>>,
    compatibility: CompatibilityTable,
    sinks: Vec<Arc<dyn ResultSink>>,
    config: OrchestratorConfig,
}

impl OrchestratorBuilder {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            provider,
            decoder: Arc::new(ImageFileDecoder),
            live_source: None,
            compatibility: CompatibilityTable::default(),
            sinks: Vec::new(),
            config: OrchestratorConfig::default(),
        }
    }

    pub fn decoder(mut self, decoder: Arc<dyn MediaDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn live_source(mut self, source: Arc<dyn LiveSource>) -> Self {
        self.live_source = Some(source);
        self
    }

    pub fn compatibility(mut self, table: CompatibilityTable) -> Self {
        self.compatibility = table;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Must be called from within a tokio runtime; runs are spawned onto it.
    pub fn build(self) -> Result<PipelineOrchestrator, ConfigError> {
        self.config.validate()?;
        let runtime = Handle::try_current().map_err(|e| ConfigError::NoRuntime(e.to_string()))?;
        let (events, _) = broadcast::channel(self.config.event_capacity);
        info!(
            max_concurrent_runs = self.config.max_concurrent_runs,
            buffer_capacity = self.config.buffer_capacity,
            overflow_policy = %self.config.overflow_policy,
            "orchestrator ready"
        );
        Ok(PipelineOrchestrator {
            slots: Arc::new(Semaphore::new(self.config.max_concurrent_runs)),
            dispatch: ResultDispatch::new(self.sinks, events),
            provider: self.provider,
            decoder: self.decoder,
            live_source: self.live_source,
            compatibility: self.compatibility,
            config: self.config,
            registry: Arc::new(Mutex::new(HashMap::new())),
            shutting_down: AtomicBool::new(false),
            runtime,
        })
    }
}

/// The main, top-level struct of the orchestrator.
pub struct PipelineOrchestrator {
    provider: Arc<dyn ModelProvider>,
    decoder: Arc<dyn MediaDecoder>,
    live_source: Option<Arc<dyn LiveSource>>,
    compatibility: CompatibilityTable,
    dispatch: ResultDispatch,
    config: OrchestratorConfig,
    slots: Arc<Semaphore>,
    registry: Registry,
    shutting_down: AtomicBool,
    runtime: Handle,
}

impl PipelineOrchestrator {
    pub fn builder(provider: Arc<dyn ModelProvider>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(provider)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn compatibility(&self) -> &CompatibilityTable {
        &self.compatibility
    }

    /// Validates the request and starts a run for it. Never waits on inference,
    /// and may be called from any thread.
    pub fn submit(&self, request: RunRequest) -> SubmitResult<RunHandle> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(SubmitError::ShuttingDown);
        }
        let plan = self.validate(&request)?;
        let RunRequest { media, task, preset } = request;

        // Held until the entry is inserted, so a run that finishes instantly
        // cannot try to deregister before it was registered.
        let mut registry = self.registry.lock();
        // Checked again under the lock: `shutdown` may have drained the registry
        // since the first check.
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(SubmitError::ShuttingDown);
        }
        let _runtime = self.runtime.enter();
        let active = match plan {
            Plan::Static { kind } => {
                let shared = RunShared::new(task, kind, None);
                let handle = RunHandle::new(Arc::clone(&shared));
                let run = InferenceRun::new(shared, preset, Arc::clone(&self.provider), self.dispatch.clone(), true);
                let source = UnitSource::Static {
                    decoder: Arc::clone(&self.decoder),
                    media,
                };
                let slots = Arc::clone(&self.slots);
                let registry_ref = Arc::clone(&self.registry);
                let id = handle.id();
                let task = self.runtime.spawn(async move {
                    run.execute(source, slots).await;
                    registry_ref.lock().remove(&id);
                });
                ActiveRun { handle, stop: None, task }
            }
            Plan::Live { source, reference } => {
                let pipeline = LivePipeline::new(source, reference, &self.config);
                let shared = RunShared::new(task, MediaKind::Live, Some(pipeline.buffer()));
                let handle = RunHandle::new(Arc::clone(&shared));
                let run = InferenceRun::new(
                    shared,
                    preset,
                    Arc::clone(&self.provider),
                    self.dispatch.clone(),
                    self.config.retain_live_results,
                );
                let stop = pipeline.stopper();
                let tasks = pipeline.start(run, Arc::clone(&self.slots));
                let registry_ref = Arc::clone(&self.registry);
                let id = handle.id();
                let task = self.runtime.spawn(async move {
                    if let Err(e) = tasks.consumer.await {
                        warn!(run = %id, error = %e, "live consumer task aborted");
                    }
                    match tasks.fetcher.await {
                        Ok(EndReason::Failed(message)) => debug!(run = %id, %message, "fetcher ended with a failure"),
                        Ok(reason) => debug!(run = %id, ?reason, "fetcher ended"),
                        Err(e) => warn!(run = %id, error = %e, "fetcher task aborted"),
                    }
                    registry_ref.lock().remove(&id);
                });
                ActiveRun {
                    handle,
                    stop: Some(stop),
                    task,
                }
            }
        };

        let handle = active.handle.clone();
        info!(run = %handle.id(), task = %handle.task(), "run submitted");
        registry.insert(handle.id(), active);
        Ok(handle)
    }

    /// Requests cancellation. For live runs the fetcher is stopped as well.
    /// Idempotent; cancelling a finished run is a no-op and returns `false`.
    pub fn cancel(&self, handle: &RunHandle) -> bool {
        let requested = handle.cancel();
        if let Some(active) = self.registry.lock().get(&handle.id()) {
            if let Some(stop) = &active.stop {
                stop.send_replace(true);
            }
        }
        if requested {
            info!(run = %handle.id(), "cancellation requested");
        }
        requested
    }

    pub fn status(&self, handle: &RunHandle) -> RunStatus {
        handle.status()
    }

    /// A receiver for every run event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.dispatch.subscribe()
    }

    /// Handles of every run that has not yet been fully handed off.
    pub fn active_runs(&self) -> Vec<RunHandle> {
        self.registry.lock().values().map(|active| active.handle.clone()).collect()
    }

    pub fn run(&self, id: RunId) -> Option<RunHandle> {
        self.registry.lock().get(&id).map(|active| active.handle.clone())
    }

    /// Rejects new submissions, cancels every active run and waits until all of
    /// their tasks (consumers and fetchers) have finished.
    pub async fn shutdown(&self) {
        let active: Vec<ActiveRun> = {
            let mut registry = self.registry.lock();
            self.shutting_down.store(true, Ordering::Release);
            registry.drain().map(|(_, active)| active).collect()
        };
        info!(runs = active.len(), "shutting down");

        let mut tasks = Vec::with_capacity(active.len());
        for run in active {
            run.handle.cancel();
            if let Some(stop) = &run.stop {
                stop.send_replace(true);
            }
            tasks.push(run.task);
        }
        for joined in futures::future::join_all(tasks).await {
            if let Err(e) = joined {
                warn!(error = %e, "run task aborted during shutdown");
            }
        }
        info!("shutdown complete");
    }

    fn validate(&self, request: &RunRequest) -> SubmitResult<Plan> {
        if request.media.is_empty() {
            return Err(SubmitError::EmptyRequest);
        }
        if let Some(unresolved) = request.media.iter().find(|m| m.kind() == MediaKind::Unknown) {
            return Err(SubmitError::UnresolvedMedia {
                locator: unresolved.locator().to_string(),
            });
        }

        let live = request.media.iter().filter(|m| m.kind() == MediaKind::Live).count();
        if live > 0 && live < request.media.len() {
            return Err(SubmitError::MixedMedia);
        }
        if live > 1 {
            return Err(SubmitError::MultipleLiveSources { count: live });
        }

        for reference in &request.media {
            if !self.compatibility.is_compatible(reference.kind(), request.task) {
                return Err(SubmitError::IncompatibleTask {
                    media: reference.kind(),
                    task: request.task,
                });
            }
        }

        request.preset.validate()?;

        if live == 1 {
            let reference = request.media[0].clone();
            let source = self.live_source.clone().ok_or_else(|| SubmitError::NoLiveSource {
                locator: reference.locator().to_string(),
            })?;
            return Ok(Plan::Live { source, reference });
        }
        let kind = if request.media.iter().any(|m| m.kind() == MediaKind::Video) {
            MediaKind::Video
        } else {
            MediaKind::Image
        };
        Ok(Plan::Static { kind })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::model::{Model, ModelRequest};
    use crate::error::{ModelUnavailable, PresetError};

    struct NeverCalled;

    impl ModelProvider for NeverCalled {
        fn get_model(&self, request: &ModelRequest) -> Result<Box<dyn Model>, ModelUnavailable> {
            Err(ModelUnavailable {
                task: request.task,
                weight_id: request.weight_id.clone(),
                reason: "not in this test".to_string(),
            })
        }
    }

    fn orchestrator() -> PipelineOrchestrator {
        PipelineOrchestrator::builder(Arc::new(NeverCalled)).build().expect("default config")
    }

    fn preset() -> Arc<Preset> {
        Arc::new(Preset::new("default", "yolo-n"))
    }

    #[tokio::test]
    async fn request_shape_is_checked_before_anything_runs() {
        let orchestrator = orchestrator();

        let empty = orchestrator.submit(RunRequest::new(Vec::new(), TaskKind::Detect, preset()));
        assert_eq!(empty.unwrap_err(), SubmitError::EmptyRequest);

        let unknown = orchestrator.submit(RunRequest::single(MediaReference::resolve("notes.txt"), TaskKind::Detect, preset()));
        assert!(matches!(unknown, Err(SubmitError::UnresolvedMedia { .. })));

        let mixed = orchestrator.submit(RunRequest::new(
            [MediaReference::image("a.png"), MediaReference::webcam(0)],
            TaskKind::Detect,
            preset(),
        ));
        assert_eq!(mixed.unwrap_err(), SubmitError::MixedMedia);

        let two_cameras = orchestrator.submit(RunRequest::new(
            [MediaReference::webcam(0), MediaReference::webcam(1)],
            TaskKind::Detect,
            preset(),
        ));
        assert_eq!(two_cameras.unwrap_err(), SubmitError::MultipleLiveSources { count: 2 });

        let no_camera = orchestrator.submit(RunRequest::single(MediaReference::webcam(0), TaskKind::Detect, preset()));
        assert!(matches!(no_camera, Err(SubmitError::NoLiveSource { .. })));

        assert!(orchestrator.active_runs().is_empty());
    }

    #[tokio::test]
    async fn tracking_a_still_image_is_incompatible() {
        let orchestrator = orchestrator();
        let err = orchestrator
            .submit(RunRequest::single(MediaReference::image("a.png"), TaskKind::Track, preset()))
            .unwrap_err();
        assert_eq!(
            err,
            SubmitError::IncompatibleTask {
                media: MediaKind::Image,
                task: TaskKind::Track
            }
        );
        assert!(orchestrator.active_runs().is_empty());
    }

    #[tokio::test]
    async fn invalid_presets_are_rejected() {
        let orchestrator = orchestrator();
        let mut bad = Preset::new("bad", "yolo-n");
        bad.confidence_threshold = 1.5;
        let err = orchestrator
            .submit(RunRequest::single(MediaReference::image("a.png"), TaskKind::Detect, bad))
            .unwrap_err();
        assert!(matches!(err, SubmitError::InvalidPreset(PresetError::Threshold { .. })));
    }

    #[tokio::test]
    async fn registry_empties_once_a_run_is_handed_off() {
        let orchestrator = orchestrator();
        let handle = orchestrator
            .submit(RunRequest::single(MediaReference::image("a.png"), TaskKind::Detect, preset()))
            .expect("accepted");
        assert!(orchestrator.run(handle.id()).is_some());

        let report = handle.wait().await;
        assert_eq!(report.state, RunState::Failed);

        orchestrator.shutdown().await;
        assert!(orchestrator.active_runs().is_empty());
        assert!(!orchestrator.cancel(&handle));

        let late = orchestrator.submit(RunRequest::single(MediaReference::image("b.png"), TaskKind::Detect, preset()));
        assert_eq!(late.unwrap_err(), SubmitError::ShuttingDown);
    }

    #[test]
    fn building_outside_a_runtime_is_an_error() {
        let built = PipelineOrchestrator::builder(Arc::new(NeverCalled)).build();
        assert!(matches!(built, Err(ConfigError::NoRuntime(_))));
    }

    #[test]
    fn runs_can_be_submitted_from_a_plain_thread() {
        let runtime = tokio::runtime::Runtime::new().expect("runtime");
        let orchestrator = runtime.block_on(async { orchestrator() });

        let handle = std::thread::scope(|scope| {
            scope
                .spawn(|| orchestrator.submit(RunRequest::single(MediaReference::image("a.png"), TaskKind::Detect, preset())))
                .join()
                .expect("submitting thread")
        })
        .expect("accepted");

        let report = runtime.block_on(handle.wait());
        assert_eq!(report.state, RunState::Failed);
        runtime.block_on(orchestrator.shutdown());
    }
}
