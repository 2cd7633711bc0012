//! Per-request deadline bookkeeping (§4.2 "Outbound request").
//!
//! Each outstanding request owns one [`TimeoutHandle`]. The soft timer can be
//! restarted on progress; the hard cap, if set, cannot.

use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Default soft timeout applied to an outbound request when the caller does
/// not specify one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-request timeout configuration, mirroring the three knobs in §4.2:
/// a soft `timeout`, an optional `reset_on_progress`, and an optional
/// absolute `max_total_timeout` that progress can never push back.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    pub timeout: Duration,
    pub reset_on_progress: bool,
    pub max_total_timeout: Option<Duration>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            reset_on_progress: false,
            max_total_timeout: None,
        }
    }
}

/// Handle to a running per-request timer task.
///
/// Dropping this does not stop the timer by itself; call [`TimeoutHandle::cancel`]
/// to detach it, matching the "detach timer" step of the common cancellation
/// cleanup (§5).
pub struct TimeoutHandle {
    reset_tx: watch::Sender<()>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl TimeoutHandle {
    /// Spawn a timer that invokes `on_fire` once, unless reset or cancelled
    /// first. `on_fire` runs on the timer task, so it should be cheap (e.g.
    /// send on a channel) rather than perform blocking work.
    pub fn spawn<F>(config: TimeoutConfig, on_fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (reset_tx, mut reset_rx) = watch::channel(());
        let cancel = CancellationToken::new();
        let cancel_child = cancel.clone();
        let task = tokio::spawn(async move {
            let deadline_start = tokio::time::Instant::now();
            let soft_sleep = tokio::time::sleep(config.timeout);
            tokio::pin!(soft_sleep);
            loop {
                tokio::select! {
                    _ = &mut soft_sleep => {
                        // no reset arrived before the soft deadline: a real timeout.
                        break;
                    }
                    changed = reset_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if !config.reset_on_progress {
                            // this request opted out of progress resets; the soft
                            // deadline keeps counting down unperturbed.
                            continue;
                        }
                        if let Some(max) = config.max_total_timeout {
                            if deadline_start.elapsed() >= max {
                                break;
                            }
                        }
                        soft_sleep.as_mut().reset(tokio::time::Instant::now() + config.timeout);
                        continue;
                    }
                    _ = cancel_child.cancelled() => {
                        return;
                    }
                }
            }
            on_fire();
        });
        Self {
            reset_tx,
            cancel,
            task,
        }
    }

    /// Restart the soft timer. A no-op once the timer has already fired or
    /// been cancelled.
    pub fn reset_on_progress(&self) {
        let _ = self.reset_tx.send(());
    }

    /// Detach the timer so it never fires `on_fire`, then abort its task.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.task.abort();
    }
}
