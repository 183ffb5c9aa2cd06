//! Plug contract and pipeline runner.
//!
//! A pipeline is an ordered list of plugs. The runner folds a [`Request`]
//! through the plugs in order: once the request is halted, remaining plugs
//! are skipped; a plug returning `Err` is converted into an error entry on
//! the request. Errors never propagate past [`Pipeline::run`] -- the runner
//! always returns a terminal request value.
//!
//! Per-plug option initialisation happens at construction time: a plug's
//! struct fields are its compiled options, built once when the pipeline is
//! assembled.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::request::{Request, RequestState};

/// A single transformation step in a pipeline.
///
/// Implementations take the request by value and return a new value; the
/// runner never observes shared mutation. Expected failures should be
/// recorded with [`Request::halt_with_error`] and returned as `Ok`; the
/// `Err` channel is for unexpected failures (`?` on serde, I/O, etc.),
/// which the runner converts into an error entry against this plug.
#[async_trait]
pub trait Plug: Send + Sync {
    /// Stable plug name, recorded in error entries and logs.
    fn name(&self) -> &'static str;

    /// Transform the request.
    async fn call(&self, req: Request) -> Result<Request>;
}

/// An ordered list of plugs executed by [`Pipeline::run`].
#[derive(Clone)]
pub struct Pipeline {
    plugs: Vec<Arc<dyn Plug>>,
}

impl Pipeline {
    /// Build a pipeline from an ordered plug list.
    pub fn new(plugs: Vec<Arc<dyn Plug>>) -> Self {
        Self { plugs }
    }

    /// Append a plug.
    pub fn push(mut self, plug: Arc<dyn Plug>) -> Self {
        self.plugs.push(plug);
        self
    }

    /// The plugs in execution order.
    pub fn plugs(&self) -> &[Arc<dyn Plug>] {
        &self.plugs
    }

    /// Fold the request through the pipeline.
    ///
    /// Records pipeline timing in `metadata` and normalizes the terminal
    /// state: a request with errors ends in `Error`, a request with a result
    /// ends in `Completed`, and a halted request without either ends in
    /// `Halted`.
    pub async fn run(&self, mut req: Request) -> Request {
        let started = Instant::now();
        req.metadata.start_time = Some(started);

        for plug in &self.plugs {
            if req.halted {
                break;
            }
            if req.is_cancelled() {
                req = req.halt_with_error(plug.name(), crate::error::Error::Cancelled);
                break;
            }

            debug!(plug = plug.name(), request = %req.id, "running plug");
            let snapshot = req.clone();
            req = match plug.call(req).await {
                Ok(next) => next,
                Err(e) => {
                    debug!(plug = plug.name(), error = %e, "plug failed");
                    snapshot.halt_with_error(plug.name(), e)
                }
            };
        }

        req.metadata.end_time = Some(Instant::now());
        req.metadata.duration_ms = Some(started.elapsed().as_millis() as u64);

        // Terminal-state normalization.
        if !req.errors.is_empty() {
            req.state = RequestState::Error;
            req.halted = true;
        } else if req.result.is_some() {
            req.state = RequestState::Completed;
        } else if req.halted && req.state != RequestState::Streaming {
            req.state = RequestState::Halted;
        }

        req
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field(
                "plugs",
                &self.plugs.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
