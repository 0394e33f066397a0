// THEORY:
// A live pipeline is two independently scheduled tasks joined by one bounded
// buffer:
//
//     LiveSource ──▶ FrameFetcher ──▶ StreamBuffer ──▶ InferenceRun ──▶ sinks
//      (producer task)                                 (consumer task)
//
// The pipeline owns the fetcher's stop signal. It is always raised when the
// consumer task ends, for whatever reason, so a run that fails on its own (model
// unavailable, inference error) never leaves a producer feeding a buffer nobody
// reads. The orchestrator may also raise it early on cancel, so the source is
// released without waiting for an in-flight inference to return.

use crate::config::OrchestratorConfig;
use crate::core_modules::fetcher::{FrameFetcher, LiveSource};
use crate::core_modules::media::MediaReference;
use crate::core_modules::result::RunReport;
use crate::core_modules::run::{InferenceRun, UnitSource};
use crate::core_modules::stream_buffer::{EndReason, StreamBuffer};
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::debug;

/// The spawned halves of one live pipeline.
pub struct LiveTasks {
    pub fetcher: JoinHandle<EndReason>,
    pub consumer: JoinHandle<Arc<RunReport>>,
}

/// A fetcher and buffer wired for one live run, not yet started.
pub struct LivePipeline {
    buffer: Arc<StreamBuffer>,
    fetcher: FrameFetcher,
    media: MediaReference,
    stop: Arc<watch::Sender<bool>>,
}

impl LivePipeline {
    pub fn new(source: Arc<dyn LiveSource>, media: MediaReference, config: &OrchestratorConfig) -> Self {
        let buffer = Arc::new(StreamBuffer::new(config.buffer_capacity, config.overflow_policy));
        let (stop, stop_rx) = watch::channel(false);
        let fetcher = FrameFetcher::new(source, media.clone(), Arc::clone(&buffer), stop_rx, config.max_fetch_fps);
        Self {
            buffer,
            fetcher,
            media,
            stop: Arc::new(stop),
        }
    }

    /// The buffer between the two tasks, for telemetry.
    pub fn buffer(&self) -> Arc<StreamBuffer> {
        Arc::clone(&self.buffer)
    }

    /// Raising this signal stops the fetcher without waiting for the consumer.
    pub fn stopper(&self) -> Arc<watch::Sender<bool>> {
        Arc::clone(&self.stop)
    }

    /// Spawns the fetcher and the consumer. The fetcher is stopped as soon as the
    /// consumer finishes.
    pub fn start(self, run: InferenceRun, slots: Arc<Semaphore>) -> LiveTasks {
        let LivePipeline {
            buffer,
            fetcher,
            media,
            stop,
        } = self;

        let fetcher = fetcher.spawn();
        let source = UnitSource::Live {
            buffer: Arc::clone(&buffer),
            media,
        };
        let consumer = tokio::spawn(async move {
            let report = run.execute(source, slots).await;
            stop.send_replace(true);
            // Frames still queued after a cancel or failure will never be consumed.
            let discarded = buffer.clear();
            if discarded > 0 {
                debug!(discarded, "discarded unconsumed live frames");
            }
            report
        });

        LiveTasks { fetcher, consumer }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::fetcher::LiveStream;
    use crate::core_modules::media::Frame;
    use crate::core_modules::model::{Model, ModelProvider, ModelRequest};
    use crate::core_modules::preset::{InferenceParams, Preset};
    use crate::core_modules::result::{ResultDispatch, TaskOutput};
    use crate::core_modules::run::{RunHandle, RunShared, RunState};
    use crate::core_modules::task::{MediaKind, TaskKind};
    use crate::error::{ModelError, ModelUnavailable, StreamIoError};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::broadcast;

    /// A camera that never runs out of frames.
    struct Endless;

    struct EndlessStream {
        next: u64,
    }

    #[async_trait]
    impl LiveSource for Endless {
        async fn connect(&self, _media: &MediaReference) -> Result<Box<dyn LiveStream>, StreamIoError> {
            Ok(Box::new(EndlessStream { next: 0 }))
        }
    }

    #[async_trait]
    impl LiveStream for EndlessStream {
        fn native_fps(&self) -> Option<f64> {
            Some(500.0)
        }

        async fn next_frame(&mut self) -> Result<Option<Frame>, StreamIoError> {
            self.next += 1;
            Ok(Some(Frame::new(self.next, self.next * 2, 1, 1, vec![0u8; 4])))
        }
    }

    struct Empty;

    impl Model for Empty {
        fn task(&self) -> TaskKind {
            TaskKind::Detect
        }

        fn infer(&mut self, _unit: &Frame, _params: &InferenceParams) -> Result<TaskOutput, ModelError> {
            std::thread::sleep(Duration::from_millis(2));
            Ok(TaskOutput::Detect(Vec::new()))
        }
    }

    struct Provider {
        available: bool,
    }

    impl ModelProvider for Provider {
        fn get_model(&self, request: &ModelRequest) -> Result<Box<dyn Model>, ModelUnavailable> {
            if self.available {
                Ok(Box::new(Empty))
            } else {
                Err(ModelUnavailable {
                    task: request.task,
                    weight_id: request.weight_id.clone(),
                    reason: "offline".to_string(),
                })
            }
        }
    }

    fn wire(available: bool) -> (LiveTasks, RunHandle, Arc<StreamBuffer>) {
        let config = OrchestratorConfig {
            buffer_capacity: 4,
            max_fetch_fps: 500.0,
            ..OrchestratorConfig::default()
        };
        let pipeline = LivePipeline::new(Arc::new(Endless), MediaReference::webcam(0), &config);
        let buffer = pipeline.buffer();
        let shared = RunShared::new(TaskKind::Detect, MediaKind::Live, Some(Arc::clone(&buffer)));
        let (events, _) = broadcast::channel(8);
        let run = InferenceRun::new(
            Arc::clone(&shared),
            Arc::new(Preset::new("live", "det-small")),
            Arc::new(Provider { available }),
            ResultDispatch::new(Vec::new(), events),
            false,
        );
        let tasks = pipeline.start(run, Arc::new(Semaphore::new(1)));
        (tasks, RunHandle::new(shared), buffer)
    }

    #[tokio::test]
    async fn cancelling_the_run_stops_the_fetcher() {
        let (tasks, handle, buffer) = wire(true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.state(), RunState::Running);
        assert!(handle.cancel());

        let report = tokio::time::timeout(Duration::from_secs(2), tasks.consumer)
            .await
            .expect("consumer finished")
            .expect("join");
        assert_eq!(report.state, RunState::Cancelled);
        assert!(report.units_processed > 0);

        let reason = tokio::time::timeout(Duration::from_secs(2), tasks.fetcher)
            .await
            .expect("fetcher finished")
            .expect("join");
        assert_eq!(reason, EndReason::Stopped);
        assert!(buffer.is_closed());
    }

    #[tokio::test]
    async fn a_failed_run_does_not_orphan_its_fetcher() {
        let (tasks, _handle, _buffer) = wire(false);
        let report = tasks.consumer.await.expect("join");
        assert_eq!(report.state, RunState::Failed);

        let reason = tokio::time::timeout(Duration::from_secs(2), tasks.fetcher)
            .await
            .expect("fetcher finished")
            .expect("join");
        assert_eq!(reason, EndReason::Stopped);
    }
}
