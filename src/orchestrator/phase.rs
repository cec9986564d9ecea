//! Job phase state machine
//!
//! CREATED → SUBMITTED → POLLING → {COMPLETED | TIMED_OUT | CANCELLED} → TORN_DOWN
//!
//! A re-poll of a TIMED_OUT job stays in TIMED_OUT while it runs and moves
//! forward to COMPLETED or CANCELLED; it never goes back to POLLING.
//! A poll that fails on a service error also lands in TIMED_OUT.
//! Teardown is allowed from any phase except TORN_DOWN.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPhase {
    /// Handle exists, nothing submitted yet
    Created,
    /// Job and tasks are with the service
    Submitted,
    /// Waiting for tasks to finish
    Polling,
    /// Every task reached a terminal state before the deadline
    Completed,
    /// Polling stopped with tasks outstanding
    TimedOut,
    /// Stopped by the cancel token
    Cancelled,
    /// Job and pool deleted
    TornDown,
}

impl JobPhase {
    pub fn can_transition_to(&self, target: JobPhase) -> bool {
        use JobPhase::*;
        match (self, target) {
            (Created, Submitted) => true,
            (Submitted, Polling) => true,
            (Polling, Completed | TimedOut | Cancelled) => true,

            // Re-poll after a timeout
            (TimedOut, Completed | Cancelled) => true,

            (Created | Submitted | Polling | Completed | TimedOut | Cancelled, TornDown) => true,

            _ => false,
        }
    }

    /// Outputs may be read once polling has stopped
    pub fn allows_output_collection(&self) -> bool {
        matches!(
            self,
            JobPhase::Completed | JobPhase::TimedOut | JobPhase::Cancelled
        )
    }

    pub fn is_torn_down(&self) -> bool {
        matches!(self, JobPhase::TornDown)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Invalid phase transition from {from:?} to {to:?}")]
pub struct PhaseError {
    pub from: JobPhase,
    pub to: JobPhase,
}

/// A phase change, kept on the handle for the run log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseChange {
    pub phase: JobPhase,
    pub at: DateTime<Utc>,
}

/// Current phase plus history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTracker {
    current: JobPhase,
    history: Vec<PhaseChange>,
}

impl PhaseTracker {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            current: JobPhase::Created,
            history: vec![PhaseChange {
                phase: JobPhase::Created,
                at,
            }],
        }
    }

    pub fn current(&self) -> JobPhase {
        self.current
    }

    pub fn history(&self) -> &[PhaseChange] {
        &self.history
    }

    pub fn transition(&mut self, to: JobPhase, at: DateTime<Utc>) -> Result<(), PhaseError> {
        if !self.current.can_transition_to(to) {
            return Err(PhaseError {
                from: self.current,
                to,
            });
        }
        self.current = to;
        self.history.push(PhaseChange { phase: to, at });
        Ok(())
    }
}
