// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbox: the only state shared between a message handler and the gateway.
//!
//! The handler appends [`ControlMessage`]s; the gateway drains them and turns
//! each into a broker action. Any number of status updates may be queued,
//! followed by exactly one terminal message (`Ok`, `Error` or `Resubmit`).
//! Queueing the terminal message sets the finished flag; anything pushed
//! after that is dropped.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::warn;

/// Status reported to the hosting repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Message accepted
    Started,
    /// Inputs being staged or processed
    Processing,
    /// Processing succeeded
    Succeeded,
    /// Check decided to ignore the message
    Skipped,
    /// Job failed for good
    Error,
    /// Job put back on the work queue
    Resubmitted,
}

impl JobStatus {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Started => "STARTED",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Skipped => "SKIPPED",
            JobStatus::Error => "ERROR",
            JobStatus::Resubmitted => "RESUBMITTED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status update with the time it was produced.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    /// Status
    pub status: JobStatus,
    /// Free-text detail
    pub message: String,
    /// When the update was produced
    pub at: DateTime<Utc>,
}

impl StatusUpdate {
    /// Create an update stamped with the current time.
    pub fn now(status: JobStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            at: Utc::now(),
        }
    }

    /// `STATUS: message` as sent on the wire.
    pub fn status_line(&self) -> String {
        format!("{}: {}", self.status, self.message)
    }
}

/// An outgoing control message.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Progress report, replied to the sender when it asked for replies
    Status(StatusUpdate),
    /// Acknowledge the message
    Ok,
    /// Route the message to the error queue and acknowledge it
    Error,
    /// Republish the message with a new retry count and acknowledge it
    Resubmit {
        /// Retry count carried by the republished message
        retry_count: u32,
    },
}

impl ControlMessage {
    /// Whether this message ends the job.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ControlMessage::Status(_))
    }
}

/// Status payload published to the reply queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    /// Target ID
    pub file_id: String,
    /// Name of the reporting extractor
    pub extractor_id: String,
    /// Job correlation ID
    pub job_id: Option<String>,
    /// `STATUS: message`
    pub status: String,
    /// Time of the update (RFC 3339 with offset)
    pub start: String,
    /// Always `status`
    pub message_type: &'static str,
    /// Free-text detail
    pub message: String,
}

impl StatusReport {
    /// Build the wire payload for an update.
    pub fn new(
        update: &StatusUpdate,
        file_id: impl Into<String>,
        extractor_id: impl Into<String>,
        job_id: Option<String>,
    ) -> Self {
        Self {
            file_id: file_id.into(),
            extractor_id: extractor_id.into(),
            job_id,
            status: update.status_line(),
            start: update.at.to_rfc3339(),
            message_type: "status",
            message: update.message.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct OutboxState {
    queue: VecDeque<ControlMessage>,
    finished: bool,
}

#[derive(Debug, Default)]
struct OutboxInner {
    state: Mutex<OutboxState>,
    changed: Notify,
}

/// Lock-guarded FIFO of control messages for one handler.
///
/// Cloning yields another handle to the same queue.
#[derive(Debug, Clone, Default)]
pub struct Outbox {
    inner: Arc<OutboxInner>,
}

impl Outbox {
    /// Create an empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, OutboxState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a message. Returns false if the job already finished.
    pub fn push(&self, message: ControlMessage) -> bool {
        {
            let mut state = self.state();
            if state.finished {
                warn!(?message, "Outbox already finished, dropping message");
                return false;
            }
            if message.is_terminal() {
                state.finished = true;
            }
            state.queue.push_back(message);
        }
        self.inner.changed.notify_one();
        true
    }

    /// Append a status update.
    pub fn status(&self, status: JobStatus, message: impl Into<String>) -> bool {
        self.push(ControlMessage::Status(StatusUpdate::now(status, message)))
    }

    /// Take every queued message in order.
    pub fn drain(&self) -> Vec<ControlMessage> {
        self.state().queue.drain(..).collect()
    }

    /// True once the terminal message has been queued.
    pub fn is_finished(&self) -> bool {
        self.state().finished
    }

    /// Wait until something is pushed.
    ///
    /// A push that happens while nobody waits is remembered, so a drain loop
    /// that awaits this after draining never misses a message.
    pub async fn changed(&self) {
        self.inner.changed.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fifo_and_terminal_flag() {
        let outbox = Outbox::new();
        assert!(outbox.status(JobStatus::Started, "accepted"));
        assert!(!outbox.is_finished());
        assert!(outbox.push(ControlMessage::Resubmit { retry_count: 1 }));
        assert!(outbox.is_finished());

        let drained = outbox.drain();
        assert_eq!(drained.len(), 2);
        assert!(matches!(&drained[0], ControlMessage::Status(u) if u.status == JobStatus::Started));
        assert_eq!(drained[1], ControlMessage::Resubmit { retry_count: 1 });
        assert!(outbox.drain().is_empty());
    }

    #[test]
    fn test_nothing_after_terminal() {
        let outbox = Outbox::new();
        outbox.push(ControlMessage::Ok);
        assert!(!outbox.push(ControlMessage::Error));
        assert!(!outbox.status(JobStatus::Processing, "late"));
        assert_eq!(outbox.drain(), vec![ControlMessage::Ok]);
    }

    #[test]
    fn test_status_report_fields() {
        let update = StatusUpdate::now(JobStatus::Succeeded, "Done.");
        let report = StatusReport::new(&update, "f1", "wordcount", Some("job-1".into()));
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["status"], "SUCCEEDED: Done.");
        assert_eq!(json["message_type"], "status");
        assert_eq!(json["file_id"], "f1");
        assert_eq!(json["extractor_id"], "wordcount");
        assert_eq!(json["job_id"], "job-1");
        assert!(json["start"].as_str().unwrap().ends_with("+00:00"));
    }

    #[tokio::test]
    async fn test_changed_wakes_on_push_from_another_thread() {
        let outbox = Outbox::new();
        let handle = outbox.clone();

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle.push(ControlMessage::Ok);
        });

        tokio::time::timeout(Duration::from_secs(5), outbox.changed())
            .await
            .unwrap();
        assert_eq!(outbox.drain(), vec![ControlMessage::Ok]);
    }

    #[tokio::test]
    async fn test_push_before_wait_is_not_lost() {
        let outbox = Outbox::new();
        outbox.status(JobStatus::Started, "");
        tokio::time::timeout(Duration::from_secs(1), outbox.changed())
            .await
            .unwrap();
    }
}
