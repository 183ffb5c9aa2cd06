//! Per-provider circuit breaker with optional bulkhead.
//!
//! State machine: `closed → open → half_open → closed|open`. In `open`,
//! calls fail fast with [`Error::CircuitOpen`] without touching the network.
//! In `half_open`, exactly one probe call is admitted; its outcome decides
//! the next state. The optional bulkhead bounds concurrent calls per
//! provider, queueing up to `max_queued` waiters.
//!
//! Breakers are process-wide singletons shared by every request to a
//! provider; see [`breaker_for`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Bulkhead concurrency limits.
#[derive(Debug, Clone)]
pub struct BulkheadConfig {
    /// Maximum concurrent calls admitted.
    pub max_concurrent: usize,
    /// Maximum callers allowed to wait for a slot.
    pub max_queued: usize,
    /// How long a queued caller waits before giving up.
    pub queue_timeout: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_queued: 50,
            queue_timeout: Duration::from_secs(5),
        }
    }
}

/// Circuit breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time the circuit stays open before admitting a probe.
    pub recovery_time: Duration,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
    /// Per-call deadline enforced by the breaker, if set.
    pub call_timeout: Option<Duration>,
    /// Optional concurrency bulkhead.
    pub bulkhead: Option<BulkheadConfig>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_time: Duration::from_secs(30),
            success_threshold: 2,
            call_timeout: None,
            bulkhead: None,
        }
    }
}

/// Current position in the breaker state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls flow normally; consecutive failures are counted.
    Closed,
    /// Calls fail fast until the recovery window elapses.
    Open,
    /// One probe call at a time decides whether to close or re-open.
    HalfOpen,
}

/// Hook invoked on every state transition: `(breaker_name, from, to)`.
pub type TransitionHook = Arc<dyn Fn(&str, BreakerState, BreakerState) + Send + Sync>;

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    probe_in_flight: bool,
    opened_at: Option<Instant>,
}

/// Failure-threshold circuit breaker with bulkhead concurrency limit.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    bulkhead: Option<Arc<Semaphore>>,
    queued: AtomicUsize,
    hook: Mutex<Option<TransitionHook>>,
}

impl CircuitBreaker {
    /// Create a breaker with the given name (used in errors and logs).
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let bulkhead = config
            .bulkhead
            .as_ref()
            .map(|b| Arc::new(Semaphore::new(b.max_concurrent)));
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                probe_in_flight: false,
                opened_at: None,
            }),
            bulkhead,
            queued: AtomicUsize::new(0),
            hook: Mutex::new(None),
        }
    }

    /// Install a hook invoked on every state transition.
    pub fn on_transition(&self, hook: TransitionHook) {
        *self.hook.lock().expect("breaker hook lock") = Some(hook);
    }

    /// The breaker's current state.
    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock").state
    }

    /// Run `f` through the breaker.
    ///
    /// Fails fast with `CircuitOpen` when open, `BulkheadFull` when the
    /// bulkhead and its queue are saturated, and `Timeout` when the
    /// configured call deadline elapses. Success/failure of the inner call
    /// feeds the state machine; `Cancelled` results are not counted either
    /// way.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit()?;

        let _permit = match self.acquire_bulkhead().await {
            Ok(p) => p,
            Err(e) => {
                self.release_probe();
                return Err(e);
            }
        };

        let outcome = match self.config.call_timeout {
            Some(deadline) => match tokio::time::timeout(deadline, f()).await {
                Ok(res) => res,
                Err(_) => Err(Error::Timeout),
            },
            None => f().await,
        };

        match &outcome {
            Ok(_) => self.record_success(),
            Err(Error::Cancelled) => self.release_probe(),
            Err(e) if Self::counts_as_failure(e) => self.record_failure(),
            Err(_) => self.release_probe(),
        }

        outcome
    }

    /// Whether an error feeds the failure counter.
    ///
    /// Provider-side and transport failures count; caller mistakes
    /// (validation, auth) do not open the circuit.
    fn counts_as_failure(error: &Error) -> bool {
        matches!(
            error,
            Error::Server { .. }
                | Error::Network(_)
                | Error::Timeout
                | Error::RateLimited { .. }
                | Error::StreamInterrupted(_)
        )
    }

    /// Gate a call on the current state, reserving the half-open probe slot.
    fn admit(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.recovery_time {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(Error::CircuitOpen(self.name.clone()))
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(Error::CircuitOpen(self.name.clone()))
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    async fn acquire_bulkhead(&self) -> Result<Option<tokio::sync::OwnedSemaphorePermit>> {
        let Some(semaphore) = &self.bulkhead else {
            return Ok(None);
        };
        let config = self.config.bulkhead.as_ref().expect("bulkhead config");

        if let Ok(permit) = semaphore.clone().try_acquire_owned() {
            return Ok(Some(permit));
        }

        if self.queued.load(Ordering::SeqCst) >= config.max_queued {
            return Err(Error::BulkheadFull(self.name.clone()));
        }

        self.queued.fetch_add(1, Ordering::SeqCst);
        let acquired =
            tokio::time::timeout(config.queue_timeout, semaphore.clone().acquire_owned()).await;
        self.queued.fetch_sub(1, Ordering::SeqCst);

        match acquired {
            Ok(Ok(permit)) => Ok(Some(permit)),
            // Semaphore closed never happens (we never close it).
            Ok(Err(_)) => Err(Error::BulkheadFull(self.name.clone())),
            Err(_) => Err(Error::BulkheadFull(self.name.clone())),
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    self.transition(&mut inner, BreakerState::Closed);
                }
            }
            BreakerState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                self.transition(&mut inner, BreakerState::Open);
            }
            BreakerState::Open => {}
        }
    }

    /// Release the half-open probe slot without counting the outcome.
    fn release_probe(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        if inner.state == BreakerState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        match to {
            BreakerState::Open => {
                inner.opened_at = Some(Instant::now());
                inner.half_open_successes = 0;
                warn!(breaker = %self.name, "circuit opened");
            }
            BreakerState::HalfOpen => {
                inner.half_open_successes = 0;
                debug!(breaker = %self.name, "circuit half-open, probing");
            }
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                debug!(breaker = %self.name, "circuit closed");
            }
        }
        if let Some(hook) = self.hook.lock().expect("breaker hook lock").as_ref() {
            hook(&self.name, from, to);
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

static BREAKERS: OnceLock<Mutex<HashMap<String, Arc<CircuitBreaker>>>> = OnceLock::new();

/// The process-wide breaker for a provider, created on first use.
pub fn breaker_for(provider: &str) -> Arc<CircuitBreaker> {
    let registry = BREAKERS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = registry.lock().expect("breaker registry lock");
    map.entry(provider.to_string())
        .or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                provider.to_string(),
                BreakerConfig::default(),
            ))
        })
        .clone()
}
