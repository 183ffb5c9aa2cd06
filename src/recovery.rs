//! Resumable recovery for interrupted streams.
//!
//! Each recoverable stream registers a record keyed by `recovery_id` in a
//! process-wide registry. The producer appends chunks as they arrive; on a
//! recoverable error the stream can be resumed by rewriting the request
//! with the provider's continuation format and re-issuing it. Records
//! outlive a single request and are garbage-collected on completion or TTL
//! expiry by a background sweeper.
//!
//! State machine per record:
//! `active → interrupted → resuming → active | abandoned`, with
//! `completed`, `expired`, and `abandoned` terminal.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::providers::ProviderId;
use crate::types::Message;

/// Default record TTL.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

/// Default maximum resume attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Cap on the resume backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// How the continuation request is derived from the partial response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeStrategy {
    /// Continue from the exact cutoff.
    Exact,
    /// Drop content after the last paragraph boundary (`"\n\n"`) and
    /// resume from there.
    Paragraph,
    /// Condense the accumulated content before asking for continuation.
    Summarize,
}

/// Per-call stream recovery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryOptions {
    /// Whether recovery is enabled for this stream.
    pub enabled: bool,
    /// Resume strategy.
    pub strategy: ResumeStrategy,
    /// Maximum resume attempts before giving up.
    pub max_attempts: u32,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: ResumeStrategy::Exact,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Lifecycle state of a recovery record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    /// Chunks are being appended.
    Active,
    /// A recoverable error was recorded; a resume may be attempted.
    Interrupted,
    /// A continuation request has been issued.
    Resuming,
    /// The stream finished; the record awaits collection.
    Completed,
    /// The TTL elapsed before completion.
    Expired,
    /// Resume attempts were exhausted or the error was not recoverable.
    Abandoned,
}

struct RecoveryRecord {
    state: RecoveryState,
    provider: ProviderId,
    messages: Vec<Message>,
    content: String,
    attempts: u32,
    deadline: Instant,
}

type Registry = Mutex<HashMap<String, RecoveryRecord>>;

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn with_record<T>(id: &str, f: impl FnOnce(&mut RecoveryRecord) -> T) -> Option<T> {
    let mut map = registry().lock().expect("recovery registry lock");
    map.get_mut(id).map(f)
}

/// Register a recovery record for a stream. Returns the `recovery_id`.
///
/// The first registration also starts the background TTL sweeper.
pub fn register(provider: ProviderId, messages: Vec<Message>, ttl: Duration) -> String {
    let id = format!("recovery-{:016x}", fastrand::u64(..));
    registry().lock().expect("recovery registry lock").insert(
        id.clone(),
        RecoveryRecord {
            state: RecoveryState::Active,
            provider,
            messages,
            content: String::new(),
            attempts: 0,
            deadline: Instant::now() + ttl,
        },
    );
    start_sweeper();
    debug!(recovery = %id, "registered stream recovery record");
    id
}

/// Append delivered content to a record.
pub fn append_content(id: &str, content: &str) {
    with_record(id, |record| {
        record.content.push_str(content);
    });
}

/// Accumulated content of a record.
pub fn content(id: &str) -> Option<String> {
    with_record(id, |record| record.content.clone())
}

/// Current state of a record.
pub fn state(id: &str) -> Option<RecoveryState> {
    with_record(id, |record| record.state)
}

/// Mark a stream complete and drop its record.
pub fn complete(id: &str) {
    let mut map = registry().lock().expect("recovery registry lock");
    if let Some(record) = map.get_mut(id) {
        record.state = RecoveryState::Completed;
    }
    map.remove(id);
}

/// Mark a record abandoned (kept until the sweeper collects it, so late
/// inspection can observe the terminal state).
pub fn abandon(id: &str) {
    with_record(id, |record| {
        record.state = RecoveryState::Abandoned;
    });
}

/// Record a recoverable interruption. Returns `false` when the record is
/// missing or attempts are exhausted (the caller should abandon).
pub fn mark_interrupted(id: &str, max_attempts: u32) -> bool {
    with_record(id, |record| {
        if record.attempts >= max_attempts {
            record.state = RecoveryState::Abandoned;
            return false;
        }
        record.state = RecoveryState::Interrupted;
        true
    })
    .unwrap_or(false)
}

/// Begin a resume attempt: bumps the attempt counter, applies the strategy
/// cut to the stored content, and returns the continuation conversation
/// `(messages, partial)` to prepare the new request from.
///
/// Returns `None` when the record is missing or terminal.
pub fn begin_resume(id: &str, strategy: ResumeStrategy) -> Option<(Vec<Message>, String)> {
    with_record(id, |record| {
        if !matches!(record.state, RecoveryState::Interrupted) {
            return None;
        }
        record.attempts += 1;
        record.state = RecoveryState::Resuming;
        record.content = apply_strategy(&record.content, strategy);
        Some((record.messages.clone(), record.content.clone()))
    })
    .flatten()
}

/// Mark a resume attempt as streaming again.
pub fn mark_active(id: &str) {
    with_record(id, |record| {
        record.state = RecoveryState::Active;
    });
}

/// The attempt counter of a record.
pub fn attempts(id: &str) -> u32 {
    with_record(id, |record| record.attempts).unwrap_or(0)
}

/// Backoff before resume attempt N (1-indexed): 1 s, 2 s, 4 s … capped.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = Duration::from_secs(1 << exp);
    delay.min(MAX_BACKOFF)
}

/// Cut the accumulated content per the resume strategy.
fn apply_strategy(content: &str, strategy: ResumeStrategy) -> String {
    match strategy {
        ResumeStrategy::Exact => content.to_string(),
        ResumeStrategy::Paragraph => match content.rfind("\n\n") {
            Some(pos) => content[..pos + 2].to_string(),
            // No paragraph boundary yet: restart from the beginning of the
            // response rather than mid-sentence.
            None => {
                // A single trailing word fragment is the common case;
                // keep whole leading words up to the last space.
                match content.rfind(' ') {
                    Some(pos) => content[..pos + 1].to_string(),
                    None => String::new(),
                }
            }
        },
        ResumeStrategy::Summarize => summarize(content),
    }
}

/// Local condensation used by [`ResumeStrategy::Summarize`]: the opening
/// and closing paragraphs, elided in the middle. Model-generated summaries
/// would need a second LLM round-trip mid-recovery.
fn summarize(content: &str) -> String {
    let paragraphs: Vec<&str> = content.split("\n\n").filter(|p| !p.is_empty()).collect();
    match paragraphs.len() {
        0 | 1 | 2 => content.to_string(),
        _ => format!(
            "{}\n\n[...]\n\n{}",
            paragraphs[0],
            paragraphs[paragraphs.len() - 1]
        ),
    }
}

/// Number of live records. Test and diagnostics hook.
pub fn live_records() -> usize {
    registry().lock().expect("recovery registry lock").len()
}

fn start_sweeper() {
    static SWEEPER: OnceLock<()> = OnceLock::new();
    SWEEPER.get_or_init(|| {
        // Outside a runtime (sync-only tests) there is nothing to sweep.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async {
                loop {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    sweep();
                }
            });
        }
    });
}

/// Drop expired and terminal records.
fn sweep() {
    let mut map = registry().lock().expect("recovery registry lock");
    let now = Instant::now();
    map.retain(|id, record| {
        let expired = record.deadline <= now;
        if expired {
            warn!(recovery = %id, "recovery record expired");
            record.state = RecoveryState::Expired;
        }
        let terminal = matches!(
            record.state,
            RecoveryState::Expired | RecoveryState::Completed | RecoveryState::Abandoned
        );
        !(expired || terminal)
    });
}
