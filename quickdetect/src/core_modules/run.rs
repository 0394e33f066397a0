// THEORY:
// The `run` module is the consumer half of every pipeline and the unit of work the
// orchestrator hands out. An `InferenceRun` is a small state machine:
//
//     Pending ──▶ Running ──▶ Completed | Cancelled | Failed
//
// - `Pending` while waiting for a free run slot.
// - `Running` is the only state in which the model is invoked.
// - `Completed` once every static unit is processed, or a live source has ended
//   and its buffer is drained.
// - `Cancelled` once a cancel request is observed at a checkpoint between units.
//   In-flight inference is never interrupted.
// - `Failed` when the model provider, the model or the live source raises an
//   unrecoverable error. A static reference that cannot be opened or decoded is
//   recorded and skipped; the batch carries on with the next one.
//
// Whatever the terminal state, every result produced before it is preserved and
// reported. Observation is split between the run task (the only writer) and any
// number of `RunHandle`s, which read a shared snapshot without ever blocking it.
// Blocking collaborators (model loading, inference, decoding) are moved onto
// tokio's blocking pool one call at a time, so cancellation latency is bounded by
// a single unit.

use crate::core_modules::decoder::{MediaDecoder, UnitReader};
use crate::core_modules::media::{Frame, MediaReference};
use crate::core_modules::model::{Model, ModelProvider, ModelRequest};
use crate::core_modules::preset::Preset;
use crate::core_modules::result::{ResultDispatch, ResultUnit, RunReport};
use crate::core_modules::stream_buffer::{EndReason, LiveStats, Popped, StreamBuffer};
use crate::core_modules::task::{MediaKind, TaskKind};
use crate::error::{MediaError, RunError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{Semaphore, watch};
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

/// Unique identity of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Cancelled | RunState::Failed)
    }
}

/// How far a run has come.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub processed: u64,
    /// Known for static media once its readers report a length; never known for live media.
    pub total: Option<u64>,
}

impl Progress {
    /// Fraction done in [0, 1], if the total is known.
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(1.0),
            Some(total) => Some((self.processed as f64 / total as f64).min(1.0)),
            None => None,
        }
    }
}

/// Non-blocking snapshot of a run.
#[derive(Debug, Clone)]
pub struct RunStatus {
    pub id: RunId,
    pub task: TaskKind,
    pub media_kind: MediaKind,
    pub state: RunState,
    pub progress: Progress,
    /// Present only for live runs.
    pub live: Option<LiveStats>,
    pub error: Option<RunError>,
}

/// State shared between a run task and its handles. The run task is the only writer.
pub(crate) struct RunShared {
    id: RunId,
    task: TaskKind,
    media_kind: MediaKind,
    state: watch::Sender<RunState>,
    cancel: watch::Sender<bool>,
    processed: AtomicU64,
    total: Mutex<Option<u64>>,
    error: Mutex<Option<RunError>>,
    buffer: Option<Arc<StreamBuffer>>,
    report: OnceLock<Arc<RunReport>>,
}

impl RunShared {
    pub(crate) fn new(task: TaskKind, media_kind: MediaKind, buffer: Option<Arc<StreamBuffer>>) -> Arc<Self> {
        let (state, _) = watch::channel(RunState::Pending);
        let (cancel, _) = watch::channel(false);
        Arc::new(Self {
            id: RunId::new(),
            task,
            media_kind,
            state,
            cancel,
            processed: AtomicU64::new(0),
            total: Mutex::new(None),
            error: Mutex::new(None),
            buffer,
            report: OnceLock::new(),
        })
    }

    /// A receiver that flips to `true` once cancellation is requested.
    pub(crate) fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    fn is_cancel_requested(&self) -> bool {
        *self.cancel.borrow()
    }
}

/// Caller-side handle to a submitted run. Cheap to clone; outlives the run itself.
#[derive(Clone)]
pub struct RunHandle {
    shared: Arc<RunShared>,
}

impl fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunHandle")
            .field("id", &self.shared.id)
            .field("task", &self.shared.task)
            .field("state", &self.state())
            .finish()
    }
}

impl RunHandle {
    pub(crate) fn new(shared: Arc<RunShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> RunId {
        self.shared.id
    }

    pub fn task(&self) -> TaskKind {
        self.shared.task
    }

    pub fn state(&self) -> RunState {
        *self.shared.state.borrow()
    }

    pub fn status(&self) -> RunStatus {
        let shared = &self.shared;
        RunStatus {
            id: shared.id,
            task: shared.task,
            media_kind: shared.media_kind,
            state: self.state(),
            progress: Progress {
                processed: shared.processed.load(Ordering::Acquire),
                total: *shared.total.lock(),
            },
            live: shared.buffer.as_ref().map(|buffer| buffer.stats()),
            error: shared.error.lock().clone(),
        }
    }

    /// Requests cooperative cancellation. Returns `true` only for the call that
    /// actually raised the flag; repeated calls and calls on finished runs are no-ops.
    pub fn cancel(&self) -> bool {
        if self.state().is_terminal() {
            return false;
        }
        !self.shared.cancel.send_replace(true)
    }

    /// The terminal report, if the run has finished.
    pub fn report(&self) -> Option<Arc<RunReport>> {
        self.shared.report.get().cloned()
    }

    /// Waits for the run to reach a terminal state and returns its report.
    pub async fn wait(&self) -> Arc<RunReport> {
        let mut state = self.shared.state.subscribe();
        loop {
            if let Some(report) = self.shared.report.get() {
                return Arc::clone(report);
            }
            // The sender lives in `shared`, which this handle keeps alive.
            let _ = state.changed().await;
        }
    }
}

/// Where a run pulls its units from.
pub enum UnitSource {
    /// Image and video references, processed one after another.
    Static {
        decoder: Arc<dyn MediaDecoder>,
        media: Vec<MediaReference>,
    },
    /// A single live source, fed through a stream buffer by a fetcher.
    Live {
        buffer: Arc<StreamBuffer>,
        media: MediaReference,
    },
}

/// Why the unit loop stopped.
enum Exit {
    Exhausted,
    Cancelled,
    Failed(RunError),
}

/// The consumer: pulls units, invokes the model, emits results.
pub struct InferenceRun {
    shared: Arc<RunShared>,
    preset: Arc<Preset>,
    provider: Arc<dyn ModelProvider>,
    dispatch: ResultDispatch,
    retain_results: bool,
    results: Vec<Arc<ResultUnit>>,
    skipped: Vec<MediaError>,
}

impl InferenceRun {
    pub(crate) fn new(
        shared: Arc<RunShared>,
        preset: Arc<Preset>,
        provider: Arc<dyn ModelProvider>,
        dispatch: ResultDispatch,
        retain_results: bool,
    ) -> Self {
        Self {
            shared,
            preset,
            provider,
            dispatch,
            retain_results,
            results: Vec::new(),
            skipped: Vec::new(),
        }
    }

    pub fn id(&self) -> RunId {
        self.shared.id
    }

    /// Drives the run to a terminal state. Waits for a slot in `slots` first.
    pub async fn execute(self, source: UnitSource, slots: Arc<Semaphore>) -> Arc<RunReport> {
        let span = info_span!("run", id = %self.shared.id, task = %self.shared.task);
        self.execute_inner(source, slots).instrument(span).await
    }

    async fn execute_inner(mut self, source: UnitSource, slots: Arc<Semaphore>) -> Arc<RunReport> {
        let mut cancel = self.shared.cancel_signal();
        let permit = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => None,
            permit = slots.acquire_owned() => permit.ok(),
        };
        let Some(_permit) = permit else {
            info!("cancelled before starting");
            return self.finish(Exit::Cancelled);
        };

        self.shared.state.send_replace(RunState::Running);
        self.dispatch.started(self.shared.id);
        info!("running");

        let exit = match self.load_model().await {
            Ok(model) => match source {
                UnitSource::Static { decoder, media } => self.consume_static(model, decoder, media).await,
                UnitSource::Live { buffer, media } => self.consume_live(model, buffer, media).await,
            },
            Err(e) => Exit::Failed(e),
        };
        self.finish(exit)
    }

    async fn load_model(&self) -> Result<Box<dyn Model>, RunError> {
        let request = ModelRequest::from_preset(self.shared.task, &self.preset);
        let provider = Arc::clone(&self.provider);
        let model = tokio::task::spawn_blocking(move || provider.get_model(&request))
            .await
            .map_err(|e| RunError::Worker(e.to_string()))??;

        if model.task() != self.shared.task {
            return Err(RunError::ModelTaskMismatch {
                expected: self.shared.task,
                actual: model.task(),
            });
        }
        Ok(model)
    }

    async fn consume_static(
        &mut self,
        mut model: Box<dyn Model>,
        decoder: Arc<dyn MediaDecoder>,
        media: Vec<MediaReference>,
    ) -> Exit {
        // Every still image is exactly one unit, so the total is known up front.
        let all_images = media.iter().all(|m| m.kind() == MediaKind::Image);
        let mut known_total = Some(if all_images { media.len() as u64 } else { 0 });
        if all_images {
            self.publish_total(known_total);
        }

        let count = media.len();
        for (position, reference) in media.into_iter().enumerate() {
            if self.shared.is_cancel_requested() {
                return Exit::Cancelled;
            }
            // From here on the published total tracks every correction.
            let published = all_images || position + 1 == count;

            let mut reader = match open_reader(Arc::clone(&decoder), reference.clone()).await {
                Ok(reader) => reader,
                Err(RunError::Media(e)) => {
                    if all_images {
                        known_total = known_total.map(|total| total.saturating_sub(1));
                    }
                    self.skip(e);
                    if published {
                        self.publish_total(known_total);
                    }
                    continue;
                }
                Err(e) => return Exit::Failed(e),
            };
            let units = reader.total_units();
            if !all_images {
                known_total = match (known_total, units) {
                    (Some(sum), Some(units)) => Some(sum + units),
                    _ => None,
                };
                if published {
                    self.publish_total(known_total);
                }
            }
            debug!(source = %reference, "opened media");

            let mut produced = 0u64;
            loop {
                if self.shared.is_cancel_requested() {
                    return Exit::Cancelled;
                }

                let (returned, next) = match next_unit(reader).await {
                    Ok(pulled) => pulled,
                    Err(e) => return Exit::Failed(e),
                };
                reader = returned;

                let frame = match next {
                    None => break,
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        // The rest of this reference will never be produced.
                        if let (Some(total), Some(units)) = (known_total.as_mut(), units) {
                            *total = total.saturating_sub(units.saturating_sub(produced));
                        }
                        self.skip(e);
                        if published {
                            self.publish_total(known_total);
                        }
                        break;
                    }
                };

                model = match self.process(model, frame, &reference).await {
                    Ok(model) => model,
                    Err(e) => return Exit::Failed(e),
                };
                produced += 1;
            }
        }
        Exit::Exhausted
    }

    fn publish_total(&self, total: Option<u64>) {
        *self.shared.total.lock() = total;
    }

    /// Records an unreadable static reference and reports it to the sinks.
    fn skip(&mut self, error: MediaError) {
        warn!(error = %error, "skipping unreadable media");
        self.dispatch.media_skipped(self.shared.id, &error);
        self.skipped.push(error);
    }

    async fn consume_live(&mut self, mut model: Box<dyn Model>, buffer: Arc<StreamBuffer>, media: MediaReference) -> Exit {
        let mut cancel = self.shared.cancel_signal();
        loop {
            if self.shared.is_cancel_requested() {
                return Exit::Cancelled;
            }

            let popped = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => return Exit::Cancelled,
                popped = buffer.pop() => popped,
            };

            let frame = match popped {
                Popped::Frame(frame) => frame,
                Popped::EndOfStream(EndReason::SourceEnded) => return Exit::Exhausted,
                Popped::EndOfStream(EndReason::Stopped) => return Exit::Cancelled,
                Popped::EndOfStream(EndReason::Failed(message)) => return Exit::Failed(RunError::StreamIo(message)),
            };

            model = match self.process(model, frame, &media).await {
                Ok(model) => model,
                Err(e) => return Exit::Failed(e),
            };
        }
    }

    /// Runs one unit through the model and emits its result. Hands the model back
    /// so the next unit can reuse it.
    async fn process(
        &mut self,
        mut model: Box<dyn Model>,
        frame: Frame,
        source: &MediaReference,
    ) -> Result<Box<dyn Model>, RunError> {
        let params = self.preset.inference_params();
        let unit_index = frame.index;
        let timestamp_ms = frame.timestamp_ms;

        let (model, inferred) = tokio::task::spawn_blocking(move || {
            let inferred = model.infer(&frame, &params);
            (model, inferred)
        })
        .await
        .map_err(|e| RunError::Worker(e.to_string()))?;

        let mut output = inferred.map_err(|source| RunError::Inference { unit_index, source })?;
        if output.task() != self.shared.task {
            return Err(RunError::OutputMismatch {
                expected: self.shared.task,
                actual: output.task(),
            });
        }
        output.retain_confident(self.preset.confidence_threshold);

        let unit = Arc::new(ResultUnit {
            run_id: self.shared.id,
            source: source.clone(),
            unit_index,
            timestamp_ms,
            output,
        });
        self.shared.processed.fetch_add(1, Ordering::AcqRel);
        debug!(unit_index, instances = unit.output.len(), "unit processed");

        self.dispatch.result(&unit);
        if self.retain_results {
            self.results.push(unit);
        }
        Ok(model)
    }

    fn finish(self, exit: Exit) -> Arc<RunReport> {
        let (state, run_error) = match exit {
            Exit::Exhausted => (RunState::Completed, None),
            Exit::Cancelled => (RunState::Cancelled, None),
            Exit::Failed(e) => (RunState::Failed, Some(e)),
        };

        let units_processed = self.shared.processed.load(Ordering::Acquire);
        match &run_error {
            Some(e) => error!(units_processed, error = %e, "run failed"),
            None => info!(units_processed, skipped = self.skipped.len(), ?state, "run finished"),
        }

        *self.shared.error.lock() = run_error.clone();
        let report = Arc::new(RunReport {
            run_id: self.shared.id,
            task: self.shared.task,
            state,
            units_processed,
            results: self.results,
            skipped: self.skipped,
            error: run_error,
        });

        // Publish the report before the state so `wait` always finds it.
        if self.shared.report.set(Arc::clone(&report)).is_err() {
            warn!("run report was already published");
        }
        self.shared.state.send_replace(state);
        self.dispatch.finished(&report);
        report
    }
}

/// Resolves once cancellation is requested or the controlling side has gone away.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

async fn open_reader(decoder: Arc<dyn MediaDecoder>, media: MediaReference) -> Result<Box<dyn UnitReader>, RunError> {
    tokio::task::spawn_blocking(move || decoder.open(&media))
        .await
        .map_err(|e| RunError::Worker(e.to_string()))?
        .map_err(RunError::from)
}

type Pulled = (Box<dyn UnitReader>, Option<Result<Frame, MediaError>>);

async fn next_unit(mut reader: Box<dyn UnitReader>) -> Result<Pulled, RunError> {
    tokio::task::spawn_blocking(move || {
        let next = reader.next_unit();
        (reader, next)
    })
    .await
    .map_err(|e| RunError::Worker(e.to_string()))
}
