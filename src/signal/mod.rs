//! Ctrl-C handling for a running submission
//!
//! On the first SIGINT/SIGTERM the shared [`CancelToken`] is set; the poll
//! loop sees it before its next probe, the run log is persisted and the
//! process exits with [`EXIT_CODE_CANCELLED`]. A second signal exits
//! immediately with the same code.
//!
//! Job and pool are not deleted on cancel. Teardown stays an explicit step.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Exit code for cancelled runs
pub const EXIT_CODE_CANCELLED: i32 = 80;

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Action to take after receiving a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// First signal: stop polling at the next iteration
    InitiateCancellation,
    /// Second signal: exit now
    ImmediateExit,
    /// Third+ signal
    Ignore,
}

/// Signal bookkeeping for one process
#[derive(Debug, Default)]
pub struct SignalState {
    token: CancelToken,
    signal_count: AtomicU8,
    /// Job the run is currently polling, reported on immediate exit
    active_job: Mutex<Option<String>>,
}

impl SignalState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    pub fn signal_count(&self) -> u8 {
        self.signal_count.load(Ordering::SeqCst)
    }

    pub fn handle_signal(&self) -> SignalAction {
        match self.signal_count.fetch_add(1, Ordering::SeqCst) {
            0 => {
                self.token.cancel();
                SignalAction::InitiateCancellation
            }
            1 => SignalAction::ImmediateExit,
            _ => SignalAction::Ignore,
        }
    }

    pub fn set_active_job(&self, job_id: Option<String>) {
        *self.active_job.lock().unwrap_or_else(PoisonError::into_inner) = job_id;
    }

    pub fn active_job(&self) -> Option<String> {
        self.active_job
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Installs the process-wide Ctrl-C handler
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SignalState::new()),
        }
    }

    pub fn state(&self) -> Arc<SignalState> {
        Arc::clone(&self.state)
    }

    pub fn token(&self) -> CancelToken {
        self.state.token()
    }

    /// Install handlers for SIGINT and SIGTERM; call once at startup
    pub fn install(&self) -> Result<(), ctrlc::Error> {
        let state = Arc::clone(&self.state);
        ctrlc::set_handler(move || match state.handle_signal() {
            SignalAction::InitiateCancellation => {
                tracing::warn!("interrupt received, stopping after the current poll");
            }
            SignalAction::ImmediateExit => {
                match state.active_job() {
                    Some(job) => eprintln!(
                        "\nSecond interrupt, exiting. Job {} was left in place; run teardown to remove it.",
                        job
                    ),
                    None => eprintln!("\nSecond interrupt, exiting."),
                }
                std::process::exit(EXIT_CODE_CANCELLED);
            }
            SignalAction::Ignore => {}
        })
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}
