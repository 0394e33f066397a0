// THEORY:
// The `StreamBuffer` decouples a live source's arrival rate from the inference
// consumer's processing rate. It is the only shared-mutable resource between the
// fetcher task (single producer) and the run task (single consumer).
//
// Key architectural principles:
// 1.  **Bounded, Ordered**: Frames are held in a FIFO whose occupancy never exceeds
//     its capacity. Nothing is ever reordered; tracking downstream depends on it.
// 2.  **Explicit Overflow Policy**: What happens when the producer outruns the
//     consumer is a deployment choice, fixed per buffer:
//     - `Block`: the producer waits for space (true backpressure).
//     - `DropOldest` (default): evict the head; for live preview a stale frame is
//       worse than a missing one.
//     - `DropNewest`: discard the incoming frame.
//     Every dropped frame is counted.
// 3.  **End of Stream Is a Value**: The producer always closes the buffer with an
//     `EndReason` (source ended, stopped, or failed). The consumer drains what is
//     left and then receives `EndOfStream(reason)`, so it can never block forever.
// 4.  **Non-Blocking Telemetry**: Occupancy and counters are atomics; the rate
//     meters sit behind their own short-held locks, separate from the queue lock.
//     A telemetry read never waits on, or delays, a push or pop.

use crate::core_modules::media::Frame;
use crate::error::BufferError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::Notify;

/// Weight of the newest sample in the exponential rate average.
const RATE_SMOOTHING: f64 = 0.2;

/// What the buffer does with a new frame when it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    Block,
    #[default]
    DropOldest,
    DropNewest,
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OverflowPolicy::Block => "block",
            OverflowPolicy::DropOldest => "drop_oldest",
            OverflowPolicy::DropNewest => "drop_newest",
        };
        f.write_str(name)
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "block" => Ok(OverflowPolicy::Block),
            "drop_oldest" => Ok(OverflowPolicy::DropOldest),
            "drop_newest" => Ok(OverflowPolicy::DropNewest),
            other => Err(format!("unknown overflow policy '{other}'")),
        }
    }
}

/// Why the producer stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The source reported its end.
    SourceEnded,
    /// The orchestrator asked the fetcher to stop.
    Stopped,
    /// The source failed and could not recover.
    Failed(String),
}

/// What the consumer receives from `pop`.
#[derive(Debug, Clone, PartialEq)]
pub enum Popped {
    Frame(Frame),
    EndOfStream(EndReason),
}

/// What happened to a pushed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The frame was queued and the head frame with this index was evicted.
    DroppedOldest { evicted: u64 },
    /// The incoming frame with this index was discarded.
    DroppedNewest { discarded: u64 },
}

/// Point-in-time telemetry of a live pipeline's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LiveStats {
    /// Rolling rate of frames arriving from the fetcher, per second.
    pub fetch_fps: f64,
    /// Rolling rate of frames taken by the consumer, per second.
    pub consume_fps: f64,
    pub buffer_size: usize,
    pub buffer_capacity: usize,
    /// Occupancy as a fraction of capacity, in [0, 1].
    pub buffer_rate: f64,
    pub pushed: u64,
    pub popped: u64,
    pub dropped: u64,
    pub closed: bool,
}

struct Queue {
    frames: VecDeque<Frame>,
    closed: Option<EndReason>,
}

#[derive(Default)]
struct RateState {
    last: Option<Instant>,
    average: f64,
}

/// Exponentially smoothed events-per-second estimate. Decays once events stop.
#[derive(Default)]
struct RateMeter {
    state: Mutex<RateState>,
}

impl RateMeter {
    fn record(&self, now: Instant) {
        let mut state = self.state.lock();
        if let Some(last) = state.last {
            let elapsed = now.saturating_duration_since(last).as_secs_f64();
            if elapsed > 0.0 {
                let instant = 1.0 / elapsed;
                state.average = if state.average == 0.0 {
                    instant
                } else {
                    RATE_SMOOTHING * instant + (1.0 - RATE_SMOOTHING) * state.average
                };
            }
        }
        state.last = Some(now);
    }

    fn rate(&self, now: Instant) -> f64 {
        let state = self.state.lock();
        match state.last {
            Some(last) if state.average > 0.0 => {
                let idle = now.saturating_duration_since(last).as_secs_f64();
                // A silent source must not keep reporting its last healthy rate.
                if idle > 1.0 / state.average {
                    1.0 / idle
                } else {
                    state.average
                }
            }
            _ => 0.0,
        }
    }
}

/// Bounded FIFO between one fetcher and one consumer.
pub struct StreamBuffer {
    capacity: usize,
    policy: OverflowPolicy,
    queue: Mutex<Queue>,
    not_empty: Notify,
    not_full: Notify,
    occupancy: AtomicUsize,
    pushed: AtomicU64,
    popped: AtomicU64,
    dropped: AtomicU64,
    fetch_rate: RateMeter,
    consume_rate: RateMeter,
}

impl StreamBuffer {
    /// Creates a buffer. A capacity of 0 is raised to 1.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            policy,
            queue: Mutex::new(Queue {
                frames: VecDeque::with_capacity(capacity),
                closed: None,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            occupancy: AtomicUsize::new(0),
            pushed: AtomicU64::new(0),
            popped: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            fetch_rate: RateMeter::default(),
            consume_rate: RateMeter::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.occupancy.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.queue.lock().closed.is_some()
    }

    /// Appends a frame, applying the overflow policy when full. Only `Block`
    /// ever waits. Fails once the buffer has been closed.
    pub async fn push(&self, frame: Frame) -> Result<PushOutcome, BufferError> {
        self.fetch_rate.record(Instant::now());
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut queue = self.queue.lock();
                if queue.closed.is_some() {
                    return Err(BufferError::Closed);
                }

                if queue.frames.len() < self.capacity {
                    queue.frames.push_back(frame);
                    self.occupancy.store(queue.frames.len(), Ordering::Release);
                    drop(queue);
                    self.pushed.fetch_add(1, Ordering::Relaxed);
                    self.not_empty.notify_one();
                    return Ok(PushOutcome::Queued);
                }

                match self.policy {
                    OverflowPolicy::DropOldest => {
                        let evicted = queue.frames.pop_front().map(|f| f.index).unwrap_or_default();
                        queue.frames.push_back(frame);
                        self.occupancy.store(queue.frames.len(), Ordering::Release);
                        drop(queue);
                        self.pushed.fetch_add(1, Ordering::Relaxed);
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        self.not_empty.notify_one();
                        return Ok(PushOutcome::DroppedOldest { evicted });
                    }
                    OverflowPolicy::DropNewest => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return Ok(PushOutcome::DroppedNewest { discarded: frame.index });
                    }
                    OverflowPolicy::Block => {}
                }
            }

            notified.await;
        }
    }

    /// Takes the head frame without waiting. `None` means empty but still open.
    pub fn try_pop(&self) -> Option<Popped> {
        let mut queue = self.queue.lock();
        match queue.frames.pop_front() {
            Some(frame) => {
                self.occupancy.store(queue.frames.len(), Ordering::Release);
                drop(queue);
                self.popped.fetch_add(1, Ordering::Relaxed);
                self.consume_rate.record(Instant::now());
                self.not_full.notify_one();
                Some(Popped::Frame(frame))
            }
            None => queue.closed.clone().map(Popped::EndOfStream),
        }
    }

    /// Takes the head frame, waiting while the buffer is empty and open.
    pub async fn pop(&self) -> Popped {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(popped) = self.try_pop() {
                return popped;
            }

            notified.await;
        }
    }

    /// Marks the end of the stream. The first reason wins; later calls are ignored.
    /// Frames already queued stay poppable.
    pub fn close(&self, reason: EndReason) {
        {
            let mut queue = self.queue.lock();
            if queue.closed.is_some() {
                return;
            }
            queue.closed = Some(reason);
        }
        self.not_empty.notify_one();
        self.not_full.notify_one();
    }

    /// Discards every queued frame, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let cleared = {
            let mut queue = self.queue.lock();
            let cleared = queue.frames.len();
            queue.frames.clear();
            self.occupancy.store(0, Ordering::Release);
            cleared
        };
        self.dropped.fetch_add(cleared as u64, Ordering::Relaxed);
        self.not_full.notify_one();
        cleared
    }

    pub fn stats(&self) -> LiveStats {
        let now = Instant::now();
        let buffer_size = self.len();
        LiveStats {
            fetch_fps: self.fetch_rate.rate(now),
            consume_fps: self.consume_rate.rate(now),
            buffer_size,
            buffer_capacity: self.capacity,
            buffer_rate: buffer_size as f64 / self.capacity as f64,
            pushed: self.pushed.load(Ordering::Relaxed),
            popped: self.popped.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            closed: self.is_closed(),
        }
    }
}
