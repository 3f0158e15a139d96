// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Batch runner: processes job descriptors read from local files.
//!
//! Used where no broker is reachable (batch schedulers). Each input file
//! holds one JSON descriptor object or an array of them. Jobs run one after
//! another through the same [`MessageHandler`] as broker jobs, and every
//! control message becomes a line in the status log:
//!
//! ```text
//! 2025-03-01T10:00:00.000000+00:00 [f1] STARTED: Started processing file f1
//! 2025-03-01T10:00:02.000000+00:00 [f1] SUCCEEDED: Done.
//! 2025-03-01T10:00:02.000000+00:00 [f1] OK
//! ```
//!
//! There is no queue to resubmit to: a resubmission is logged and the runner
//! moves on.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::descriptor::DecodedJob;
use crate::error::{Error, Result};
use crate::handler::{HandlerContext, MessageHandler};
use crate::outbox::{ControlMessage, Outbox};
use crate::retry::Verdict;

/// Outcome counts of a batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Descriptors handed to a handler
    pub jobs: usize,
    /// Jobs acknowledged (processed or skipped)
    pub succeeded: usize,
    /// Jobs that ended in error
    pub failed: usize,
    /// Jobs that asked to be resubmitted
    pub resubmitted: usize,
    /// Inputs that could not be read or parsed
    pub malformed: usize,
}

/// Runs descriptors from files and writes a status log.
pub struct BatchRunner {
    context: Arc<HandlerContext>,
    log_path: PathBuf,
}

impl BatchRunner {
    /// Create a runner appending to `log_path`.
    pub fn new(context: Arc<HandlerContext>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            context,
            log_path: log_path.into(),
        }
    }

    /// Process every descriptor in `inputs`, in order.
    ///
    /// Stops early only when a handler is interrupted.
    pub async fn run(&self, inputs: &[PathBuf]) -> Result<BatchSummary> {
        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;
        let mut summary = BatchSummary::default();

        for input in inputs {
            let values = match read_descriptors(input).await {
                Ok(values) => values,
                Err(reason) => {
                    warn!(input = %input.display(), error = %reason, "Cannot read job file");
                    summary.malformed += 1;
                    write_line(&mut log, &malformed_line(input, &reason)).await?;
                    continue;
                }
            };

            for value in values {
                let job = match DecodedJob::from_value(value) {
                    Ok(job) => job,
                    Err(e) => {
                        summary.malformed += 1;
                        write_line(&mut log, &malformed_line(input, &e.to_string())).await?;
                        continue;
                    }
                };
                summary.jobs += 1;
                self.run_job(job, &mut log, &mut summary).await?;
            }
        }

        log.flush().await?;
        info!(
            jobs = summary.jobs,
            succeeded = summary.succeeded,
            failed = summary.failed,
            resubmitted = summary.resubmitted,
            malformed = summary.malformed,
            log = %self.log_path.display(),
            "Batch finished"
        );
        Ok(summary)
    }

    async fn run_job(
        &self,
        job: DecodedJob,
        log: &mut tokio::fs::File,
        summary: &mut BatchSummary,
    ) -> Result<()> {
        let id = job.descriptor.id.clone();
        info!(id = %id, "Running batch job");

        let outbox = Outbox::new();
        let result = MessageHandler::new(self.context.clone(), job, outbox.clone())
            .run()
            .await;

        for message in outbox.drain() {
            write_line(log, &render(&id, &message)).await?;
        }

        match result {
            Ok(Verdict::Ok) => summary.succeeded += 1,
            Ok(Verdict::Error) => summary.failed += 1,
            Ok(Verdict::Resubmit { .. } | Verdict::Interrupted { .. }) => summary.resubmitted += 1,
            Err(e) => {
                summary.resubmitted += 1;
                log.flush().await?;
                return Err(Error::Handler(e));
            }
        }
        Ok(())
    }
}

/// Status log line for a control message.
pub fn render(id: &str, message: &ControlMessage) -> String {
    match message {
        ControlMessage::Status(update) => format!(
            "{} [{}] {}",
            update.at.to_rfc3339(),
            id,
            update.status_line()
        ),
        ControlMessage::Ok => format!("{} [{}] OK", Utc::now().to_rfc3339(), id),
        ControlMessage::Error => format!("{} [{}] ERROR", Utc::now().to_rfc3339(), id),
        ControlMessage::Resubmit { retry_count } => format!(
            "{} [{}] RESUBMIT retry_count={} (not requeued in batch mode)",
            Utc::now().to_rfc3339(),
            id,
            retry_count
        ),
    }
}

fn malformed_line(input: &Path, reason: &str) -> String {
    format!(
        "{} [{}] MALFORMED: {}",
        Utc::now().to_rfc3339(),
        input.display(),
        reason
    )
}

async fn write_line(log: &mut tokio::fs::File, line: &str) -> Result<()> {
    log.write_all(line.as_bytes()).await?;
    log.write_all(b"\n").await?;
    Ok(())
}

/// Read one descriptor object or an array of them.
async fn read_descriptors(path: &Path) -> std::result::Result<Vec<Value>, String> {
    let raw = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
    match serde_json::from_slice::<Value>(&raw).map_err(|e| e.to_string())? {
        Value::Array(items) => Ok(items),
        object @ Value::Object(_) => Ok(vec![object]),
        _ => Err("expected a JSON object or array".to_string()),
    }
}
