//! Stream flow control: bounded buffering, backpressure, rate limiting,
//! and chunk batching between the SSE producer and the callback consumer.
//!
//! A [`FlowController`] owns a bounded buffer shared by exactly two tasks:
//! the producer (network read → chunk parse → [`FlowController::push`]) and
//! the consumer ([`run_consumer`]: pop → rate limit → batch → callback).
//! Push and pop are atomic under the buffer lock; callback invocations are
//! strictly serialized and preserve arrival order. Distinct streams are
//! fully independent.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::types::StreamChunk;

/// What to do with a new chunk when the buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowStrategy {
    /// Discard the incoming chunk and count it.
    DropNewest,
    /// Evict the oldest undelivered chunk to make room.
    OverwriteOldest,
    /// Suspend the producer until the consumer catches up.
    BlockProducer,
}

/// Batching settings for the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Deliver once this many chunks have accumulated.
    pub size: usize,
    /// Deliver a partial batch after this long.
    pub timeout: Duration,
}

/// Flow-control settings for one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowOptions {
    /// Buffer capacity in chunks.
    pub capacity: usize,
    /// Overflow strategy.
    pub overflow: OverflowStrategy,
    /// Fill ratio at which the producer is asked to pause.
    pub backpressure_threshold: f64,
    /// Minimum time between callback invocations.
    pub rate_limit: Duration,
    /// Optional chunk batching.
    pub batch: Option<BatchOptions>,
}

impl Default for FlowOptions {
    fn default() -> Self {
        Self {
            capacity: 100,
            overflow: OverflowStrategy::BlockProducer,
            backpressure_threshold: 0.8,
            rate_limit: Duration::from_millis(5),
            batch: None,
        }
    }
}

/// Counters shared by the producer and consumer. All monotonic.
#[derive(Debug, Default)]
struct Counters {
    chunks_received: AtomicU64,
    chunks_delivered: AtomicU64,
    chunks_dropped: AtomicU64,
    bytes_received: AtomicU64,
    backpressure_events: AtomicU64,
    max_buffer_fill: AtomicUsize,
    consumer_errors: AtomicU64,
}

/// A point-in-time snapshot of a stream's flow metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowMetrics {
    /// Chunks pushed by the producer.
    pub chunks_received: u64,
    /// Chunks delivered to the callback.
    pub chunks_delivered: u64,
    /// Chunks discarded by the overflow strategy or cancellation.
    pub chunks_dropped: u64,
    /// Content bytes received.
    pub bytes_received: u64,
    /// Producer pause episodes.
    pub backpressure_events: u64,
    /// High-water mark of the buffer fill.
    pub max_buffer_fill: usize,
    /// Delivered chunks per second since the stream started.
    pub throughput_cps: f64,
    /// Received bytes per second since the stream started.
    pub throughput_bps: f64,
    /// Callback invocations that panicked.
    pub consumer_errors: u64,
}

/// Bounded buffer coordinating one stream's producer and consumer.
pub struct FlowController {
    options: FlowOptions,
    queue: Mutex<VecDeque<StreamChunk>>,
    space: Notify,
    items: Notify,
    closed: AtomicBool,
    cancelled: AtomicBool,
    in_backpressure: AtomicBool,
    counters: Counters,
    started_at: Instant,
}

impl FlowController {
    /// Create a controller with the given settings.
    pub fn new(options: FlowOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            queue: Mutex::new(VecDeque::new()),
            space: Notify::new(),
            items: Notify::new(),
            closed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            in_backpressure: AtomicBool::new(false),
            counters: Counters::default(),
            started_at: Instant::now(),
        })
    }

    fn pause_fill(&self) -> usize {
        let threshold =
            (self.options.capacity as f64 * self.options.backpressure_threshold).ceil() as usize;
        threshold.max(1)
    }

    fn resume_fill(&self) -> usize {
        (self.pause_fill() / 2).max(1)
    }

    /// Push a chunk from the producer.
    ///
    /// Applies the overflow strategy and backpressure policy. Returns
    /// `false` once the stream is cancelled, signalling the producer to
    /// stop reading.
    pub async fn push(&self, chunk: StreamChunk) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return false;
        }

        self.counters.chunks_received.fetch_add(1, Ordering::Relaxed);
        if let Some(content) = &chunk.content {
            self.counters
                .bytes_received
                .fetch_add(content.len() as u64, Ordering::Relaxed);
        }

        loop {
            {
                let mut queue = self.queue.lock().expect("flow buffer lock");
                let fill = queue.len();

                if fill >= self.pause_fill() {
                    if !self.in_backpressure.swap(true, Ordering::SeqCst) {
                        self.counters
                            .backpressure_events
                            .fetch_add(1, Ordering::Relaxed);
                        debug!(fill, "backpressure engaged");
                    }
                } else {
                    self.in_backpressure.store(false, Ordering::SeqCst);
                }

                let full = fill >= self.options.capacity;
                let paused = fill >= self.pause_fill();

                match self.options.overflow {
                    OverflowStrategy::DropNewest if full => {
                        self.counters.chunks_dropped.fetch_add(1, Ordering::Relaxed);
                        return true;
                    }
                    OverflowStrategy::OverwriteOldest if full => {
                        queue.pop_front();
                        self.counters.chunks_dropped.fetch_add(1, Ordering::Relaxed);
                        self.enqueue(&mut queue, chunk);
                        return true;
                    }
                    OverflowStrategy::BlockProducer if paused => {
                        // Fall through to await below, lock released first.
                    }
                    _ => {
                        self.enqueue(&mut queue, chunk);
                        return true;
                    }
                }
            }

            // BlockProducer: wait for the consumer to drain below the
            // resume mark, re-checking cancellation on every wakeup. All
            // wakeups use notify_one, whose stored permit survives the gap
            // between the condition check and the await (one producer and
            // one consumer per controller).
            loop {
                if self.cancelled.load(Ordering::SeqCst) {
                    self.counters.chunks_dropped.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
                let notified = self.space.notified();
                let fill = self.queue.lock().expect("flow buffer lock").len();
                if fill < self.resume_fill() {
                    break;
                }
                notified.await;
            }
        }
    }

    fn enqueue(&self, queue: &mut VecDeque<StreamChunk>, chunk: StreamChunk) {
        queue.push_back(chunk);
        let fill = queue.len();
        self.counters
            .max_buffer_fill
            .fetch_max(fill, Ordering::Relaxed);
        self.items.notify_one();
    }

    /// Pop the next chunk, waiting while the buffer is empty.
    ///
    /// Returns `None` once the stream is closed and drained, or cancelled.
    pub async fn pop(&self) -> Option<StreamChunk> {
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return None;
            }
            let notified = self.items.notified();
            {
                let mut queue = self.queue.lock().expect("flow buffer lock");
                if let Some(chunk) = queue.pop_front() {
                    self.space.notify_one();
                    return Some(chunk);
                }
                if self.closed.load(Ordering::SeqCst) {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark the producer side finished. The consumer drains what remains.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.items.notify_one();
    }

    /// Cancel the stream: drop buffered chunks and wake both sides.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let dropped = {
            let mut queue = self.queue.lock().expect("flow buffer lock");
            let n = queue.len();
            queue.clear();
            n
        };
        self.counters
            .chunks_dropped
            .fetch_add(dropped as u64, Ordering::Relaxed);
        self.items.notify_one();
        self.space.notify_one();
    }

    /// Whether the stream has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Record one successful callback delivery.
    fn record_delivered(&self, chunks: u64) {
        self.counters
            .chunks_delivered
            .fetch_add(chunks, Ordering::Relaxed);
    }

    /// Current metrics snapshot.
    pub fn metrics(&self) -> FlowMetrics {
        let elapsed = self.started_at.elapsed().as_secs_f64().max(1e-9);
        let delivered = self.counters.chunks_delivered.load(Ordering::Relaxed);
        let bytes = self.counters.bytes_received.load(Ordering::Relaxed);
        FlowMetrics {
            chunks_received: self.counters.chunks_received.load(Ordering::Relaxed),
            chunks_delivered: delivered,
            chunks_dropped: self.counters.chunks_dropped.load(Ordering::Relaxed),
            bytes_received: bytes,
            backpressure_events: self.counters.backpressure_events.load(Ordering::Relaxed),
            max_buffer_fill: self.counters.max_buffer_fill.load(Ordering::Relaxed),
            throughput_cps: delivered as f64 / elapsed,
            throughput_bps: bytes as f64 / elapsed,
            consumer_errors: self.counters.consumer_errors.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for FlowController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowController")
            .field("options", &self.options)
            .field("metrics", &self.metrics())
            .finish()
    }
}

/// Merge a batch of chunks into one delivery.
///
/// Contents are concatenated in order; terminal metadata (done flag,
/// finish reason, usage, model) is taken from the last chunk carrying it.
fn merge_batch(batch: Vec<StreamChunk>) -> StreamChunk {
    let mut merged = StreamChunk::default();
    let mut content = String::new();
    for chunk in batch {
        if let Some(c) = chunk.content {
            content.push_str(&c);
        }
        if chunk.role.is_some() {
            merged.role = chunk.role;
        }
        if chunk.finish_reason.is_some() {
            merged.finish_reason = chunk.finish_reason;
        }
        if chunk.model.is_some() {
            merged.model = chunk.model;
        }
        if chunk.usage.is_some() {
            merged.usage = chunk.usage;
        }
        merged.done = merged.done || chunk.done;
    }
    if !content.is_empty() {
        merged.content = Some(content);
    }
    merged
}

/// Drain the controller, invoking `callback` for each delivery.
///
/// Enforces the rate limit between invocations and applies batching when
/// configured. Invocations are serialized by construction -- this function
/// is the only caller. Returns when the stream is closed and drained, or
/// cancelled.
pub async fn run_consumer(
    controller: Arc<FlowController>,
    callback: impl Fn(StreamChunk) + Send + 'static,
) {
    let rate_limit = controller.options.rate_limit;
    let batch_opts = controller.options.batch;
    let mut last_delivery: Option<Instant> = None;
    let mut pending: Vec<StreamChunk> = Vec::new();
    let mut batch_deadline: Option<Instant> = None;

    let deliver = |pending: &mut Vec<StreamChunk>, last_delivery: &mut Option<Instant>| {
        if pending.is_empty() {
            return;
        }
        let count = pending.len() as u64;
        let chunk = if count == 1 {
            pending.remove(0)
        } else {
            merge_batch(std::mem::take(pending))
        };
        pending.clear();
        let ok = std::panic::catch_unwind(AssertUnwindSafe(|| callback(chunk))).is_ok();
        if ok {
            controller.record_delivered(count);
        } else {
            warn!("stream callback panicked");
            controller
                .counters
                .consumer_errors
                .fetch_add(1, Ordering::Relaxed);
        }
        *last_delivery = Some(Instant::now());
    };

    loop {
        // Honor a pending batch deadline while waiting for the next chunk.
        let next = match batch_deadline {
            Some(deadline) => {
                match tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), controller.pop())
                    .await
                {
                    Ok(chunk) => chunk,
                    Err(_) => {
                        // Deadline hit: flush the partial batch.
                        batch_deadline = None;
                        deliver(&mut pending, &mut last_delivery);
                        continue;
                    }
                }
            }
            None => controller.pop().await,
        };

        let Some(chunk) = next else {
            // Stream over: flush whatever is pending.
            deliver(&mut pending, &mut last_delivery);
            return;
        };

        match batch_opts {
            Some(batch) => {
                if pending.is_empty() {
                    batch_deadline = Some(Instant::now() + batch.timeout);
                }
                let terminal = chunk.done;
                pending.push(chunk);
                if pending.len() >= batch.size || terminal {
                    batch_deadline = None;
                    pace(rate_limit, last_delivery).await;
                    deliver(&mut pending, &mut last_delivery);
                }
            }
            None => {
                pace(rate_limit, last_delivery).await;
                pending.push(chunk);
                deliver(&mut pending, &mut last_delivery);
            }
        }
    }
}

/// Sleep long enough to keep `rate_limit` between deliveries.
async fn pace(rate_limit: Duration, last_delivery: Option<Instant>) {
    if rate_limit.is_zero() {
        return;
    }
    if let Some(last) = last_delivery {
        let since = last.elapsed();
        if since < rate_limit {
            tokio::time::sleep(rate_limit - since).await;
        }
    }
}
