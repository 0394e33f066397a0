// THEORY:
// The `FrameFetcher` is the producer half of a live pipeline. It runs as its own
// tokio task, independent of the inference consumer, and its only job is to move
// frames from a live source into a `StreamBuffer` at a sustainable pace.
//
// Key architectural principles:
// 1.  **Pacing**: Reads are paced to `min(source fps, max_fetch_fps)`. Sources that
//     cannot report a frame rate are paced at `max_fetch_fps`. Ticks missed while
//     the source was slow are skipped, never replayed in a burst. The rate is
//     never allowed below `MIN_FETCH_FPS`, whatever the source advertises.
// 2.  **Always Close**: However the loop ends (source ended, stop signal, or an
//     unrecoverable I/O failure) the fetcher closes the buffer with the matching
//     `EndReason`. The consumer is guaranteed to see `EndOfStream`, even if the
//     task unwinds.
// 3.  **Prompt Stop**: Every await point (connecting, waiting for a tick, reading,
//     pushing into a blocking buffer) races against the stop signal.

use crate::core_modules::media::{Frame, MediaReference};
use crate::core_modules::stream_buffer::{EndReason, PushOutcome, StreamBuffer};
use crate::error::StreamIoError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Slowest pace a fetcher will ever be scheduled at, in frames per second.
pub const MIN_FETCH_FPS: f64 = 0.01;

/// Connects to live sources (network streams, capture devices).
#[async_trait]
pub trait LiveSource: Send + Sync {
    async fn connect(&self, media: &MediaReference) -> Result<Box<dyn LiveStream>, StreamIoError>;
}

/// An open live stream.
#[async_trait]
pub trait LiveStream: Send {
    /// Frame rate the source advertises, if any.
    fn native_fps(&self) -> Option<f64>;

    /// The next frame, or `None` once the source has ended.
    async fn next_frame(&mut self) -> Result<Option<Frame>, StreamIoError>;
}

/// Producer moving frames from a live source into a stream buffer.
pub struct FrameFetcher {
    source: Arc<dyn LiveSource>,
    media: MediaReference,
    buffer: Arc<StreamBuffer>,
    stop: watch::Receiver<bool>,
    max_fps: f64,
}

impl FrameFetcher {
    pub fn new(
        source: Arc<dyn LiveSource>,
        media: MediaReference,
        buffer: Arc<StreamBuffer>,
        stop: watch::Receiver<bool>,
        max_fps: f64,
    ) -> Self {
        Self {
            source,
            media,
            buffer,
            stop,
            max_fps,
        }
    }

    /// Starts the fetcher on its own task. The task resolves to the reason it ended.
    pub fn spawn(self) -> JoinHandle<EndReason> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) -> EndReason {
        let guard = CloseOnDrop(Arc::clone(&self.buffer));
        let reason = self.fetch_loop().await;
        match &reason {
            EndReason::Failed(message) => warn!(source = %self.media, %message, "fetcher lost its source"),
            other => info!(source = %self.media, reason = ?other, "fetcher finished"),
        }
        self.buffer.close(reason.clone());
        drop(guard);
        reason
    }

    async fn fetch_loop(&mut self) -> EndReason {
        let connected = tokio::select! {
            biased;
            _ = stop_requested(&mut self.stop) => return EndReason::Stopped,
            connected = self.source.connect(&self.media) => connected,
        };
        let mut stream = match connected {
            Ok(stream) => stream,
            Err(e) => return EndReason::Failed(e.to_string()),
        };

        let fps = pacing_fps(stream.native_fps(), self.max_fps);
        info!(source = %self.media, fps, "fetcher connected");
        let mut ticker = tokio::time::interval(tick_period(fps));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut index = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = stop_requested(&mut self.stop) => return EndReason::Stopped,
                _ = ticker.tick() => {}
            }

            let next = tokio::select! {
                biased;
                _ = stop_requested(&mut self.stop) => return EndReason::Stopped,
                next = stream.next_frame() => next,
            };

            let mut frame = match next {
                Ok(Some(frame)) => frame,
                Ok(None) => return EndReason::SourceEnded,
                Err(e) => return EndReason::Failed(e.to_string()),
            };
            frame.index = index;
            index += 1;

            let pushed = tokio::select! {
                biased;
                _ = stop_requested(&mut self.stop) => return EndReason::Stopped,
                pushed = self.buffer.push(frame) => pushed,
            };
            match pushed {
                Ok(PushOutcome::Queued) => {}
                Ok(PushOutcome::DroppedOldest { evicted }) => debug!(evicted, "buffer full, dropped oldest frame"),
                Ok(PushOutcome::DroppedNewest { discarded }) => debug!(discarded, "buffer full, dropped newest frame"),
                // Closed from the consumer side; nothing left to feed.
                Err(_) => return EndReason::Stopped,
            }
        }
    }
}

/// Closes the buffer if the fetcher task unwinds or is aborted before closing it.
/// The first close wins, so this is a no-op after a normal exit.
struct CloseOnDrop(Arc<StreamBuffer>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if !self.0.is_closed() {
            self.0.close(EndReason::Failed("fetcher stopped unexpectedly".to_string()));
        }
    }
}

/// Resolves once a stop has been requested or the controlling side has gone away.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

fn pacing_fps(native: Option<f64>, max_fps: f64) -> f64 {
    let cap = if max_fps.is_finite() && max_fps > 0.0 { max_fps.max(MIN_FETCH_FPS) } else { MIN_FETCH_FPS };
    match native {
        Some(fps) if fps.is_finite() && fps > 0.0 => fps.clamp(MIN_FETCH_FPS, cap),
        _ => cap,
    }
}

/// Interval period for a paced rate. `interval` rejects a zero period.
fn tick_period(fps: f64) -> Duration {
    Duration::try_from_secs_f64(1.0 / fps)
        .unwrap_or(Duration::from_secs_f64(1.0 / MIN_FETCH_FPS))
        .max(Duration::from_micros(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::stream_buffer::{OverflowPolicy, Popped};
    use std::collections::VecDeque;

    /// Plays back a fixed script of reads.
    struct Scripted {
        reads: parking_lot::Mutex<Option<VecDeque<Result<Option<Frame>, StreamIoError>>>>,
        fps: Option<f64>,
    }

    impl Scripted {
        fn new(reads: Vec<Result<Option<Frame>, StreamIoError>>) -> Arc<Self> {
            Self::advertising(None, reads)
        }

        fn advertising(fps: Option<f64>, reads: Vec<Result<Option<Frame>, StreamIoError>>) -> Arc<Self> {
            Arc::new(Self {
                reads: parking_lot::Mutex::new(Some(reads.into())),
                fps,
            })
        }
    }

    struct ScriptedStream {
        reads: VecDeque<Result<Option<Frame>, StreamIoError>>,
        fps: Option<f64>,
    }

    #[async_trait]
    impl LiveSource for Scripted {
        async fn connect(&self, media: &MediaReference) -> Result<Box<dyn LiveStream>, StreamIoError> {
            let reads = self.reads.lock().take().ok_or_else(|| StreamIoError {
                locator: media.locator().to_string(),
                reason: "already connected".to_string(),
            })?;
            Ok(Box::new(ScriptedStream { reads, fps: self.fps }))
        }
    }

    #[async_trait]
    impl LiveStream for ScriptedStream {
        fn native_fps(&self) -> Option<f64> {
            self.fps
        }

        async fn next_frame(&mut self) -> Result<Option<Frame>, StreamIoError> {
            match self.reads.pop_front() {
                Some(read) => read,
                // Never ends on its own; only a stop signal gets us out.
                None => std::future::pending().await,
            }
        }
    }

    fn frame(ts: u64) -> Frame {
        Frame::new(999, ts, 1, 1, vec![0u8; 4])
    }

    async fn drain(buffer: &StreamBuffer) -> (Vec<u64>, EndReason) {
        let mut indices = Vec::new();
        loop {
            match buffer.pop().await {
                Popped::Frame(frame) => indices.push(frame.index),
                Popped::EndOfStream(reason) => return (indices, reason),
            }
        }
    }

    #[tokio::test]
    async fn source_end_closes_the_buffer_after_all_frames() {
        let source = Scripted::new(vec![Ok(Some(frame(0))), Ok(Some(frame(10))), Ok(Some(frame(20))), Ok(None)]);
        let buffer = Arc::new(StreamBuffer::new(8, OverflowPolicy::DropOldest));
        let (_stop_tx, stop_rx) = watch::channel(false);

        let fetcher = FrameFetcher::new(source, MediaReference::live("rtsp://cam"), Arc::clone(&buffer), stop_rx, 1000.0);
        assert_eq!(fetcher.spawn().await.expect("join"), EndReason::SourceEnded);

        let (indices, reason) = drain(&buffer).await;
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(reason, EndReason::SourceEnded);
    }

    #[tokio::test]
    async fn io_failure_is_reported_as_the_end_reason() {
        let failure = StreamIoError {
            locator: "rtsp://cam".to_string(),
            reason: "connection reset".to_string(),
        };
        let source = Scripted::new(vec![Ok(Some(frame(0))), Err(failure)]);
        let buffer = Arc::new(StreamBuffer::new(8, OverflowPolicy::DropOldest));
        let (_stop_tx, stop_rx) = watch::channel(false);

        let reason = FrameFetcher::new(source, MediaReference::live("rtsp://cam"), Arc::clone(&buffer), stop_rx, 1000.0)
            .run()
            .await;
        assert!(matches!(&reason, EndReason::Failed(message) if message.contains("connection reset")));

        let (indices, end) = drain(&buffer).await;
        assert_eq!(indices, vec![0]);
        assert_eq!(end, reason);
    }

    #[tokio::test]
    async fn stop_signal_ends_an_endless_source() {
        let source = Scripted::new(vec![Ok(Some(frame(0)))]);
        let buffer = Arc::new(StreamBuffer::new(8, OverflowPolicy::DropOldest));
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = FrameFetcher::new(source, MediaReference::webcam(0), Arc::clone(&buffer), stop_rx, 1000.0).spawn();
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop_tx.send_replace(true);

        let reason = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("fetcher stopped")
            .expect("join");
        assert_eq!(reason, EndReason::Stopped);
        assert!(buffer.is_closed());
    }

    #[tokio::test]
    async fn failed_connection_still_closes_the_buffer() {
        let source = Scripted::new(vec![]);
        // Take the script so the connection attempt fails.
        source.reads.lock().take();
        let buffer = Arc::new(StreamBuffer::new(2, OverflowPolicy::DropOldest));
        let (_stop_tx, stop_rx) = watch::channel(false);

        let reason = FrameFetcher::new(source, MediaReference::webcam(1), Arc::clone(&buffer), stop_rx, 30.0)
            .run()
            .await;
        assert!(matches!(reason, EndReason::Failed(_)));
        assert!(matches!(buffer.pop().await, Popped::EndOfStream(EndReason::Failed(_))));
    }

    #[test]
    fn pacing_never_exceeds_the_cap() {
        assert_eq!(pacing_fps(Some(60.0), 30.0), 30.0);
        assert_eq!(pacing_fps(Some(12.5), 30.0), 12.5);
        assert_eq!(pacing_fps(None, 30.0), 30.0);
        assert_eq!(pacing_fps(Some(f64::NAN), 30.0), 30.0);
        assert_eq!(pacing_fps(Some(0.0), 30.0), 30.0);
    }

    #[test]
    fn pacing_has_a_floor() {
        assert_eq!(pacing_fps(Some(1e-30), 30.0), MIN_FETCH_FPS);
        assert_eq!(pacing_fps(None, 1e-20), MIN_FETCH_FPS);
        assert_eq!(pacing_fps(Some(f64::MIN_POSITIVE), 30.0), MIN_FETCH_FPS);
        assert_eq!(tick_period(MIN_FETCH_FPS), Duration::from_secs(100));
        assert_eq!(tick_period(1e300), Duration::from_micros(1));
    }

    #[tokio::test]
    async fn a_source_advertising_a_vanishing_rate_still_closes_the_buffer() {
        let source = Scripted::advertising(Some(1e-30), vec![Ok(Some(frame(0))), Ok(None)]);
        let buffer = Arc::new(StreamBuffer::new(4, OverflowPolicy::DropOldest));
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = FrameFetcher::new(source, MediaReference::live("rtsp://slow"), Arc::clone(&buffer), stop_rx, 30.0).spawn();
        // The first tick fires at once, so one frame arrives before the long wait.
        let first = tokio::time::timeout(Duration::from_secs(1), buffer.pop()).await.expect("first frame");
        assert!(matches!(first, Popped::Frame(_)));

        stop_tx.send_replace(true);
        let reason = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("fetcher stopped")
            .expect("fetcher did not panic");
        assert_eq!(reason, EndReason::Stopped);
        assert!(buffer.is_closed());
    }

    #[tokio::test]
    async fn an_aborted_fetcher_still_closes_the_buffer() {
        let source = Scripted::new(vec![]);
        let buffer = Arc::new(StreamBuffer::new(2, OverflowPolicy::DropOldest));
        let (_stop_tx, stop_rx) = watch::channel(false);

        let handle = FrameFetcher::new(source, MediaReference::webcam(2), Arc::clone(&buffer), stop_rx, 1000.0).spawn();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.abort();
        assert!(handle.await.is_err());

        let end = tokio::time::timeout(Duration::from_secs(1), buffer.pop()).await.expect("end of stream");
        assert!(matches!(end, Popped::EndOfStream(EndReason::Failed(_))));
    }
}
