//! Per-outbound-request bookkeeping (§3 "OutstandingRequest").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::model::{ErrorData, ProgressToken};
use crate::protocol::timeout::TimeoutHandle;

/// What a pending outbound request resolves to.
pub type RequestOutcome = Result<serde_json::Value, ErrorData>;

/// Everything `Protocol` needs to resolve, reject, or tear down a single
/// outbound request. Lives from send until resolve/reject/abort/timeout/close
/// (§3).
pub struct OutstandingRequest {
    pub resolver: Option<oneshot::Sender<RequestOutcome>>,
    pub progress_token: Option<ProgressToken>,
    pub timeout: Option<TimeoutHandle>,
    /// Set by `fire_timeout` before it settles the resolver, so the waiting
    /// caller can tell "our own soft timeout fired" apart from "the peer
    /// happened to send back the same wire error code" — both arrive as the
    /// same `ErrorData::request_timeout` through the same channel.
    pub timed_out: Arc<AtomicBool>,
}

impl OutstandingRequest {
    /// Fulfill or reject exactly once; the second call on an already-settled
    /// request is a documented no-op (§8 invariant 1).
    pub fn settle(&mut self, outcome: RequestOutcome) {
        if let Some(resolver) = self.resolver.take() {
            let _ = resolver.send(outcome);
        }
        if let Some(timeout) = self.timeout.take() {
            timeout.cancel();
        }
    }

    /// Mark that this request's soft timeout (rather than the peer) produced
    /// the rejection about to be settled.
    pub fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
    }
}
