// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry/error classification.
//!
//! Maps the outcome of staging and processing to the terminal action taken
//! for a message. Deterministic failures (an explicit abort, a failed
//! external command) go straight to the error queue; anything else is
//! resubmitted until the retry budget is spent.

use thiserror::Error;

use crate::outbox::{ControlMessage, JobStatus};

/// Default retry budget.
pub const DEFAULT_MAX_RETRY: u32 = 10;

/// Failure reported by a processing routine (or by staging on its behalf).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProcessError {
    /// Explicit non-retryable failure.
    #[error("Extraction aborted: {0}")]
    Abort(String),

    /// An external command exited unsuccessfully.
    #[error("Command `{command}` failed with exit code {code}: {stderr}")]
    Subprocess {
        /// Command line that was run
        command: String,
        /// Exit code
        code: i32,
        /// Captured standard error (possibly truncated)
        stderr: String,
    },

    /// The worker itself is being stopped (signal, runtime shutdown).
    #[error("Interrupted: {0}")]
    Interrupted(String),

    /// Any other failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProcessError {
    /// Shorthand for [`ProcessError::Other`] with a plain message.
    pub fn other(message: impl std::fmt::Display) -> Self {
        ProcessError::Other(anyhow::anyhow!("{}", message))
    }
}

/// What to do with a message once its job has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Acknowledge.
    Ok,
    /// Republish with the given retry count.
    Resubmit {
        /// Retry count of the republished message
        retry_count: u32,
    },
    /// Republish without consuming the retry budget, then stop the handler.
    Interrupted {
        /// Retry count of the republished message (unchanged)
        retry_count: u32,
    },
    /// Send to the error queue.
    Error,
}

impl Verdict {
    /// Status reported right before the terminal message.
    pub fn status(&self) -> JobStatus {
        match self {
            Verdict::Ok => JobStatus::Succeeded,
            Verdict::Resubmit { .. } | Verdict::Interrupted { .. } => JobStatus::Resubmitted,
            Verdict::Error => JobStatus::Error,
        }
    }

    /// The terminal control message for this verdict.
    pub fn control_message(&self) -> ControlMessage {
        match *self {
            Verdict::Ok => ControlMessage::Ok,
            Verdict::Resubmit { retry_count } | Verdict::Interrupted { retry_count } => {
                ControlMessage::Resubmit { retry_count }
            }
            Verdict::Error => ControlMessage::Error,
        }
    }
}

/// Retry budget and classification rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Resubmissions allowed before a failure becomes an error
    pub max_retry: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry: DEFAULT_MAX_RETRY,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given budget.
    pub fn new(max_retry: u32) -> Self {
        Self { max_retry }
    }

    /// Classify an outcome for a message that has been resubmitted
    /// `retry_count` times already.
    pub fn classify(&self, outcome: Result<(), &ProcessError>, retry_count: u32) -> Verdict {
        let Err(error) = outcome else {
            return Verdict::Ok;
        };
        match error {
            ProcessError::Interrupted(_) => Verdict::Interrupted { retry_count },
            ProcessError::Abort(_) | ProcessError::Subprocess { .. } => Verdict::Error,
            ProcessError::Other(_) if retry_count < self.max_retry => Verdict::Resubmit {
                retry_count: retry_count + 1,
            },
            ProcessError::Other(_) => Verdict::Error,
        }
    }
}
