//! Stream execution: coordinator plugs, producer/consumer tasks, and the
//! active-stream registry behind `cancel_stream`.
//!
//! Each stream runs two cooperating tasks. The producer opens the
//! provider's byte stream, frames it (SSE or NDJSON), parses frames into
//! [`StreamChunk`]s, appends content to the recovery record, and pushes
//! into the [`FlowController`]. The consumer drains the controller and
//! invokes the user callback under the flow-control policy. On recoverable
//! failures the producer re-issues a continuation request per the
//! recovery settings before giving up.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::flow::{run_consumer, FlowController};
use crate::http::HttpTransport;
use crate::pipeline::Plug;
use crate::providers::{self, ChunkParse, Operation, ProviderFormat, StreamFraming};
use crate::recovery::{self, RecoveryOptions};
use crate::request::{Request, RequestState};
use crate::sse::{SseItem, SseParser};
use crate::types::{StreamChunk, Usage};

/// The user callback receiving stream chunks.
pub type ChunkCallback = Arc<dyn Fn(StreamChunk) + Send + Sync>;

/// A boxed byte stream feeding the producer.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Source of the streaming response body. One `open` per attempt; recovery
/// re-opens with a rewritten body.
#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Open the byte stream for the given request body.
    async fn open(&self, body: &Value) -> Result<ByteStream>;
}

/// HTTP-backed stream source.
pub struct HttpStreamSource {
    transport: Arc<HttpTransport>,
    path: String,
}

#[async_trait]
impl StreamSource for HttpStreamSource {
    async fn open(&self, body: &Value) -> Result<ByteStream> {
        let resp = self.transport.post_stream(&self.path, body).await?;
        let stream = resp.bytes_stream().map(|item| match item {
            Ok(bytes) => Ok(bytes.to_vec()),
            Err(e) => Err(Error::from(e)),
        });
        Ok(Box::pin(stream))
    }
}

/// Line framer for newline-delimited JSON bodies (Ollama). Buffers bytes
/// across chunk boundaries and yields complete lines.
#[derive(Debug, Default)]
struct NdjsonFramer {
    buffer: String,
}

impl NdjsonFramer {
    fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }
}

struct ActiveStream {
    cancel: Arc<AtomicBool>,
    flow: Arc<FlowController>,
}

type ActiveRegistry = Mutex<HashMap<String, ActiveStream>>;

static ACTIVE: OnceLock<ActiveRegistry> = OnceLock::new();

fn active() -> &'static ActiveRegistry {
    ACTIVE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Cancel a running stream.
///
/// Buffered chunks are dropped; the callback receives one final chunk with
/// `finish_reason = "cancelled"`.
pub fn cancel(stream_id: &str) -> Result<()> {
    let map = active().lock().expect("active stream registry lock");
    let Some(entry) = map.get(stream_id) else {
        return Err(Error::StreamNotFound(stream_id.to_string()));
    };
    entry.cancel.store(true, Ordering::SeqCst);
    entry.flow.cancel();
    debug!(stream = %stream_id, "stream cancelled");
    Ok(())
}

/// Flow metrics of a running stream, if it is still registered.
pub fn metrics(stream_id: &str) -> Option<crate::flow::FlowMetrics> {
    active()
        .lock()
        .expect("active stream registry lock")
        .get(stream_id)
        .map(|entry| entry.flow.metrics())
}

fn unregister(stream_id: &str) {
    active()
        .lock()
        .expect("active stream registry lock")
        .remove(stream_id);
}

/// Initialises the stream context: recovery registration and lifecycle
/// logging. The stream id and callback are allocated when the request is
/// built; this plug completes the context before execution.
pub struct StreamCoordinator;

#[async_trait]
impl Plug for StreamCoordinator {
    fn name(&self) -> &'static str {
        "stream_coordinator"
    }

    async fn call(&self, mut req: Request) -> Result<Request> {
        let Some(ctx) = req.stream.as_mut() else {
            return Err(Error::Exception("stream context missing".into()));
        };

        if let Some(opts) = req.options.stream_recovery.clone() {
            if opts.enabled {
                let id = recovery::register(
                    req.provider.clone(),
                    req.messages.clone(),
                    recovery::DEFAULT_TTL,
                );
                ctx.recovery_id = Some(id);
            }
        }

        debug!(
            stream = %ctx.stream_id,
            provider = %req.provider,
            recovery = ctx.recovery_id.as_deref().unwrap_or("off"),
            "stream initialised"
        );
        Ok(req)
    }
}

/// Posts the streaming request and hands the body to the producer task.
pub struct ExecuteStreamRequest;

#[async_trait]
impl Plug for ExecuteStreamRequest {
    fn name(&self) -> &'static str {
        "execute_stream_request"
    }

    async fn call(&self, req: Request) -> Result<Request> {
        let transport = req
            .transport
            .clone()
            .ok_or_else(|| Error::Exception("http client not built".into()))?;
        let provider = providers::lookup(&req.provider)?;
        let model = req.config()?.model.clone();
        let source = Arc::new(HttpStreamSource {
            transport,
            path: provider.format.path(Operation::Stream, &model),
        });
        spawn_stream(req, source)
    }
}

/// Spawn the producer and consumer tasks for a prepared stream request.
///
/// Shared by the HTTP path and in-process sources (mock provider, tests).
/// Returns the request in the `Streaming` state; chunks are delivered on
/// the spawned tasks.
pub fn spawn_stream(mut req: Request, source: Arc<dyn StreamSource>) -> Result<Request> {
    let ctx = req
        .stream
        .clone()
        .ok_or_else(|| Error::Exception("stream context missing".into()))?;
    let provider = providers::lookup(&req.provider)?;
    let body = req
        .provider_request
        .clone()
        .ok_or_else(|| Error::Exception("request not prepared".into()))?;

    let flow = FlowController::new(req.options.flow_control.clone().unwrap_or_default());
    active().lock().expect("active stream registry lock").insert(
        ctx.stream_id.clone(),
        ActiveStream {
            cancel: req.cancel.clone(),
            flow: flow.clone(),
        },
    );

    let recovery_opts = req
        .options
        .stream_recovery
        .clone()
        .filter(|o| o.enabled)
        .zip(ctx.recovery_id.clone())
        .map(|(opts, id)| (id, opts));

    let job = StreamJob {
        format: provider.format.clone(),
        framing: provider.format.framing(),
        flow: flow.clone(),
        source,
        body,
        req: req.clone(),
        recovery: recovery_opts,
        cancel: req.cancel.clone(),
    };
    tokio::spawn(produce(job));

    let callback = ctx.callback.clone();
    let consumer_flow = flow;
    let stream_id = ctx.stream_id.clone();
    let recovery_id = ctx.recovery_id.clone();
    tokio::spawn(async move {
        let deliver = callback.clone();
        run_consumer(consumer_flow.clone(), move |chunk| deliver(chunk)).await;

        if consumer_flow.is_cancelled() {
            callback(StreamChunk {
                finish_reason: Some("cancelled".to_string()),
                done: true,
                ..StreamChunk::default()
            });
            if let Some(id) = &recovery_id {
                recovery::abandon(id);
            }
        }
        unregister(&stream_id);
        debug!(stream = %stream_id, metrics = ?consumer_flow.metrics(), "stream finished");
    });

    req.state = RequestState::Streaming;
    Ok(req)
}

/// Everything the producer task needs.
struct StreamJob {
    format: Arc<dyn ProviderFormat>,
    framing: StreamFraming,
    flow: Arc<FlowController>,
    source: Arc<dyn StreamSource>,
    body: Value,
    req: Request,
    recovery: Option<(String, RecoveryOptions)>,
    cancel: Arc<AtomicBool>,
}

/// Terminal bookkeeping accumulated across chunks and resume attempts.
#[derive(Default)]
struct Tail {
    finish_reason: Option<String>,
    model: Option<String>,
    usage: Option<Usage>,
    terminal_pushed: bool,
}

impl Tail {
    fn observe(&mut self, chunk: &StreamChunk) {
        if chunk.finish_reason.is_some() {
            self.finish_reason = chunk.finish_reason.clone();
        }
        if chunk.model.is_some() {
            self.model = chunk.model.clone();
        }
        if let Some(delta) = chunk.usage {
            match &mut self.usage {
                Some(total) => total.add(&delta),
                None => self.usage = Some(delta),
            }
        }
        if chunk.done {
            self.terminal_pushed = true;
        }
    }
}

/// The producer task: streams, parses, recovers, and finally closes the
/// flow controller.
async fn produce(mut job: StreamJob) {
    let mut tail = Tail::default();

    loop {
        match run_attempt(&job, &mut tail).await {
            Ok(()) => {
                if !tail.terminal_pushed {
                    job.flow
                        .push(StreamChunk {
                            finish_reason: tail
                                .finish_reason
                                .clone()
                                .or_else(|| Some("stop".to_string())),
                            model: tail.model.clone(),
                            usage: tail.usage,
                            done: true,
                            ..StreamChunk::default()
                        })
                        .await;
                }
                if let Some((id, _)) = &job.recovery {
                    recovery::complete(id);
                }
                break;
            }
            Err(Error::Cancelled) => break,
            Err(e) => {
                let resumable = match &job.recovery {
                    Some((id, opts)) if e.is_recoverable_stream_error() => {
                        recovery::mark_interrupted(id, opts.max_attempts)
                    }
                    _ => false,
                };

                if !resumable {
                    if let Some((id, _)) = &job.recovery {
                        recovery::abandon(id);
                    }
                    warn!(error = %e, "stream failed without recovery");
                    let surfaced = Error::StreamInterrupted(e.to_string());
                    job.flow
                        .push(StreamChunk {
                            finish_reason: Some("error".to_string()),
                            done: true,
                            provider_raw: Some(json!({
                                "error": surfaced.to_string(),
                                "kind": surfaced.kind(),
                            })),
                            ..StreamChunk::default()
                        })
                        .await;
                    break;
                }

                let Some((id, opts)) = job.recovery.clone() else {
                    break;
                };
                let attempt = recovery::attempts(&id) + 1;
                let delay = recovery::backoff_delay(attempt);
                warn!(
                    recovery = %id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "stream interrupted, resuming"
                );
                tokio::time::sleep(delay).await;
                if job.cancel.load(Ordering::SeqCst) {
                    break;
                }

                let Some((messages, partial)) = recovery::begin_resume(&id, opts.strategy)
                else {
                    break;
                };
                let mut resumed = job.req.clone();
                resumed.messages = job.format.continuation(&messages, &partial);
                match job.format.prepare(&resumed) {
                    Ok(body) => {
                        job.body = body;
                        recovery::mark_active(&id);
                    }
                    Err(prep_err) => {
                        recovery::abandon(&id);
                        warn!(error = %prep_err, "continuation prepare failed");
                        break;
                    }
                }
            }
        }
    }

    job.flow.close();
}

/// One streaming attempt: open the source, frame, parse, push.
async fn run_attempt(job: &StreamJob, tail: &mut Tail) -> Result<()> {
    let mut stream = job.source.open(&job.body).await?;
    let mut sse = SseParser::new();
    let mut ndjson = NdjsonFramer::default();
    let mut malformed: u64 = 0;

    while let Some(item) = stream.next().await {
        if job.cancel.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        let bytes = item?;

        let (payloads, done) = match job.framing {
            StreamFraming::Sse => {
                let mut payloads = Vec::new();
                let mut done = false;
                for parsed in sse.feed(&bytes) {
                    match parsed {
                        SseItem::Event(event) => payloads.push(event.data),
                        SseItem::Done => done = true,
                    }
                }
                (payloads, done)
            }
            StreamFraming::Ndjson => (ndjson.feed(&bytes), false),
        };

        for payload in payloads {
            if !deliver_payload(job, tail, &payload, &mut malformed).await? {
                return Ok(());
            }
        }
        if done {
            return Ok(());
        }
    }

    // Source exhausted without an explicit terminator. Flush framers.
    let trailing: Vec<String> = match job.framing {
        StreamFraming::Sse => match sse.flush() {
            Some(SseItem::Event(event)) => vec![event.data],
            Some(SseItem::Done) => return Ok(()),
            None => Vec::new(),
        },
        StreamFraming::Ndjson => ndjson.flush().into_iter().collect(),
    };
    for payload in trailing {
        if !deliver_payload(job, tail, &payload, &mut malformed).await? {
            return Ok(());
        }
    }

    if malformed > 0 {
        warn!(count = malformed, "dropped malformed stream frames");
    }

    // A close after a finish-reason chunk is a normal end; a close before
    // one is an interruption.
    if tail.terminal_pushed || tail.finish_reason.is_some() {
        Ok(())
    } else {
        Err(Error::StreamInterrupted(
            "connection closed before completion".into(),
        ))
    }
}

/// Parse and push one frame payload. Returns `Ok(false)` when the stream
/// is complete (terminal chunk), `Err(Cancelled)` when the flow rejects
/// the push.
async fn deliver_payload(
    job: &StreamJob,
    tail: &mut Tail,
    payload: &str,
    malformed: &mut u64,
) -> Result<bool> {
    match job.format.parse_chunk(payload) {
        ChunkParse::Chunk(chunk) => {
            if let Some(content) = &chunk.content {
                if let Some((id, _)) = &job.recovery {
                    recovery::append_content(id, content);
                }
            }
            tail.observe(&chunk);
            let done = chunk.done;
            if !job.flow.push(chunk).await {
                return Err(Error::Cancelled);
            }
            Ok(!done)
        }
        ChunkParse::Done => Ok(false),
        ChunkParse::Skip => Ok(true),
        ChunkParse::Error(msg) => {
            *malformed += 1;
            warn!(error = %msg, "malformed stream frame dropped");
            Ok(true)
        }
    }
}
