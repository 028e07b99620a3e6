//! Preemption handler
//!
//! Turns a host termination notice into cooperative cancellation. The
//! generation loop checks the token at every record boundary; a hard deadline
//! inside the host's grace period backs it up in case the loop is stuck in a
//! slow inference call.

use crate::config::PreemptionConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Exit code used when the hard deadline forces the process down.
pub const DEADLINE_EXIT_CODE: i32 = 143;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreemptionState {
    Running,
    ShutdownRequested,
    Terminated,
}

pub type DeadlineAction = Arc<dyn Fn() + Send + Sync>;

pub struct PreemptionHandler {
    cancel: CancellationToken,
    terminated: CancellationToken,
    state: Mutex<PreemptionState>,
    hard_deadline: Duration,
    on_deadline: DeadlineAction,
}

impl PreemptionHandler {
    pub fn new(config: &PreemptionConfig) -> Self {
        Self {
            cancel: CancellationToken::new(),
            terminated: CancellationToken::new(),
            state: Mutex::new(PreemptionState::Running),
            hard_deadline: config.hard_deadline(),
            on_deadline: Arc::new(|| std::process::exit(DEADLINE_EXIT_CODE)),
        }
    }

    /// Replace what happens when the hard deadline passes.
    pub fn with_deadline_action(mut self, action: DeadlineAction) -> Self {
        self.on_deadline = action;
        self
    }

    /// Token handed to the generation loop.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> PreemptionState {
        *self.state.lock()
    }

    /// Move to ShutdownRequested, cancel the loop token and arm the hard
    /// deadline. Only the first call has an effect. Must run inside a tokio
    /// runtime.
    pub fn request_shutdown(&self, reason: &str) -> bool {
        {
            let mut state = self.state.lock();
            if *state != PreemptionState::Running {
                return false;
            }
            *state = PreemptionState::ShutdownRequested;
        }

        warn!(
            reason,
            hard_deadline_secs = self.hard_deadline.as_secs(),
            "Shutdown requested, stopping at next record boundary"
        );
        self.cancel.cancel();

        let terminated = self.terminated.clone();
        let deadline = self.hard_deadline;
        let action = self.on_deadline.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = terminated.cancelled() => {}
                _ = tokio::time::sleep(deadline) => {
                    error!(
                        deadline_secs = deadline.as_secs(),
                        "Graceful shutdown did not finish before the hard deadline"
                    );
                    action();
                }
            }
        });
        true
    }

    /// The worker finished its shutdown work; disarm the deadline.
    pub fn mark_terminated(&self) {
        let mut state = self.state.lock();
        if *state == PreemptionState::Terminated {
            return;
        }
        *state = PreemptionState::Terminated;
        self.terminated.cancel();
        info!("Worker terminated cleanly");
    }

    /// Forward SIGTERM and Ctrl-C to `request_shutdown`.
    pub fn listen_for_signals(self: &Arc<Self>) -> JoinHandle<()> {
        let handler = Arc::clone(self);
        tokio::spawn(async move {
            let reason = wait_for_termination_signal().await;
            handler.request_shutdown(reason);
        })
    }
}

#[cfg(unix)]
async fn wait_for_termination_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = tokio::signal::ctrl_c() => "SIGINT",
            }
        }
        Err(err) => {
            warn!(error = %err, "Failed to install SIGTERM handler, listening for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_termination_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "ctrl-c"
}
