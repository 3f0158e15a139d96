// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message handler: runs one job from descriptor to terminal outcome.
//!
//! ```text
//! received ─► classified ─┬─► ignored ───────────────────────┐
//!                         └─► staged ─► processed ─► released ┴─► ok | resubmit | error
//! ```
//!
//! Every step reports through the [`Outbox`]; the handler never touches the
//! broker. Check and Process callbacks are blocking and run on the blocking
//! thread pool. Staged temporaries are released on every exit path before
//! the terminal message is queued.

use std::sync::Arc;

use extractor_repository::{Endpoint, Repository, RepositoryError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::descriptor::{DecodedJob, JobDescriptor};
use crate::extractor::{Decision, Extractor};
use crate::notify::{Notice, Notifier};
use crate::outbox::{ControlMessage, JobStatus, Outbox};
use crate::resolver::{ResourceResolver, StagedFiles};
use crate::resource::{Resource, ResourceKind, classify_kind};
use crate::retry::{ProcessError, RetryPolicy, Verdict};

/// Abnormal end of a handler.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HandlerError {
    /// The job was resubmitted because the worker is being stopped.
    #[error("Handler interrupted: {0}")]
    Interrupted(String),
}

/// Everything a handler needs besides the message itself.
pub struct HandlerContext {
    /// Identity and callbacks
    pub extractor: Extractor,
    /// Input staging
    pub resolver: ResourceResolver,
    /// Repository used for resource enrichment
    pub repository: Arc<dyn Repository>,
    /// Completion notices
    pub notifier: Arc<dyn Notifier>,
    /// Retry budget
    pub retry: RetryPolicy,
    /// Replaces the descriptor's host for repository calls
    pub host_override: Option<String>,
}

/// Handles a single decoded message.
pub struct MessageHandler {
    context: Arc<HandlerContext>,
    job: DecodedJob,
    outbox: Outbox,
}

impl MessageHandler {
    /// Create a handler reporting into `outbox`.
    pub fn new(context: Arc<HandlerContext>, job: DecodedJob, outbox: Outbox) -> Self {
        Self {
            context,
            job,
            outbox,
        }
    }

    /// Run the handler on its own task.
    pub fn spawn(self) -> JoinHandle<Result<Verdict, HandlerError>> {
        tokio::spawn(self.run())
    }

    /// Run the job to completion.
    ///
    /// Returns the verdict whose terminal message was queued, or
    /// [`HandlerError::Interrupted`] after queueing a resubmission when the
    /// processing routine reported an interrupt.
    pub async fn run(self) -> Result<Verdict, HandlerError> {
        let descriptor = &self.job.descriptor;
        let endpoint = descriptor.endpoint(self.context.host_override.as_deref());
        let extractor = &self.context.extractor;

        let kind = classify_kind(
            descriptor.routing_key.as_deref(),
            &descriptor.id,
            descriptor.dataset_id.as_deref(),
            extractor.name(),
            extractor.default_kind(),
        );
        self.outbox.status(
            JobStatus::Started,
            format!("Started processing {} {}", kind, descriptor.id),
        );

        let mut resource = match self.build_resource(kind, &endpoint).await {
            Ok(resource) => resource,
            Err(e) => {
                warn!(id = %descriptor.id, kind = %kind, error = %e, "Cannot resolve descriptor");
                self.outbox.status(
                    JobStatus::Error,
                    format!("Cannot resolve {} {}: {}", kind, descriptor.id, e),
                );
                self.outbox.push(ControlMessage::Error);
                return Ok(Verdict::Error);
            }
        };

        let decision = match self.check(&resource, &endpoint).await {
            Ok(decision) => decision,
            Err(e) => return self.finish(Err(e), &resource),
        };
        debug!(id = %resource.id, ?decision, "Check decided");

        if decision == Decision::Ignore {
            info!(id = %resource.id, kind = %resource.kind, "Skipping message");
            self.outbox
                .status(JobStatus::Skipped, "Check callback declined the message");
            self.outbox.push(ControlMessage::Ok);
            return Ok(Verdict::Ok);
        }

        let mut staged = StagedFiles::new();
        let outcome = self
            .stage_and_process(decision, &endpoint, &mut resource, &mut staged)
            .await;
        staged.release();

        if outcome.is_ok() {
            self.send_notices(&resource, &endpoint).await;
        }
        self.finish(outcome, &resource)
    }

    async fn stage_and_process(
        &self,
        decision: Decision,
        endpoint: &Endpoint,
        resource: &mut Resource,
        staged: &mut StagedFiles,
    ) -> Result<(), ProcessError> {
        if decision == Decision::Download {
            self.outbox.status(
                JobStatus::Processing,
                format!("Staging {} {}", resource.kind, resource.id),
            );
            self.context
                .resolver
                .stage(endpoint, resource, staged)
                .await
                .map_err(|e| ProcessError::Other(e.into()))?;
        }

        let process = self.context.extractor.process_fn();
        let resource = resource.clone();
        let descriptor = self.callback_descriptor(endpoint);
        run_blocking(move || process(&resource, &descriptor)).await
    }

    async fn check(
        &self,
        resource: &Resource,
        endpoint: &Endpoint,
    ) -> Result<Decision, ProcessError> {
        let Some(check) = self.context.extractor.check_fn() else {
            return Ok(Decision::Download);
        };
        let resource = resource.clone();
        let descriptor = self.callback_descriptor(endpoint);
        run_blocking(move || Ok(check(&resource, &descriptor))).await
    }

    /// Descriptor handed to callbacks, pointing at the host actually used.
    fn callback_descriptor(&self, endpoint: &Endpoint) -> JobDescriptor {
        let mut descriptor = self.job.descriptor.clone();
        descriptor.host = endpoint.host.clone();
        descriptor
    }

    /// Classify, report and queue the terminal message.
    fn finish(
        &self,
        outcome: Result<(), ProcessError>,
        resource: &Resource,
    ) -> Result<Verdict, HandlerError> {
        let retry_count = self.job.descriptor.retry_count;
        let verdict = self
            .context
            .retry
            .classify(outcome.as_ref().map(|_| ()), retry_count);

        let message = match (&verdict, &outcome) {
            (Verdict::Ok, _) => "Done.".to_string(),
            (Verdict::Resubmit { retry_count }, Err(e)) => {
                format!("Resubmitting (retry {}): {}", retry_count, e)
            }
            (Verdict::Interrupted { .. }, Err(e)) => format!("Interrupted, resubmitting: {}", e),
            (_, Err(e)) => format!("Error processing: {}", e),
            (_, Ok(())) => String::new(),
        };

        match &outcome {
            Ok(()) => info!(id = %resource.id, kind = %resource.kind, "Processing succeeded"),
            Err(e) => warn!(
                id = %resource.id,
                kind = %resource.kind,
                retry_count,
                ?verdict,
                error = %e,
                "Processing failed"
            ),
        }

        self.outbox.status(verdict.status(), message);
        self.outbox.push(verdict.control_message());

        match (verdict, outcome) {
            (Verdict::Interrupted { .. }, Err(e)) => Err(HandlerError::Interrupted(e.to_string())),
            _ => Ok(verdict),
        }
    }

    /// Derive the resource and enrich it from the repository.
    async fn build_resource(
        &self,
        kind: ResourceKind,
        endpoint: &Endpoint,
    ) -> Result<Resource, RepositoryError> {
        let descriptor = &self.job.descriptor;
        let repository = &self.context.repository;

        match kind {
            ResourceKind::Dataset => {
                let id = descriptor.dataset_id.as_deref().unwrap_or(&descriptor.id);
                let info = repository.dataset_info(endpoint, id).await?;
                let files = repository.dataset_files(endpoint, id).await?;
                let mut resource = Resource::new(kind, id);
                resource.name = info.name.clone();
                resource.dataset_info = Some(info);
                resource.files = files;
                resource.triggering_file = descriptor.filename.clone();
                Ok(resource)
            }
            ResourceKind::File => {
                let name = match &descriptor.filename {
                    Some(name) => name.clone(),
                    None => repository.file_info(endpoint, &descriptor.id).await?.filename,
                };
                let mut resource = Resource::new(kind, &descriptor.id).with_name(name);
                if let Some(dataset_id) = &descriptor.dataset_id {
                    resource = resource.with_parent(ResourceKind::Dataset, dataset_id);
                }
                Ok(resource)
            }
            ResourceKind::Metadata => Ok(metadata_resource(descriptor)),
        }
    }

    async fn send_notices(&self, resource: &Resource, endpoint: &Endpoint) {
        let recipients = &self.job.descriptor.notifies;
        if recipients.is_empty() {
            return;
        }
        let notice = Notice::processed(
            self.context.extractor.name(),
            resource,
            &endpoint.host,
            recipients.clone(),
        );
        if let Err(e) = self.context.notifier.notify(&notice).await {
            warn!(id = %resource.id, error = %e, "Failed to send notification");
        }
    }
}

fn metadata_resource(descriptor: &JobDescriptor) -> Resource {
    let id = descriptor.resource_id.as_deref().unwrap_or(&descriptor.id);
    let parent_kind = descriptor
        .resource_type
        .as_deref()
        .and_then(|t| t.parse().ok())
        .unwrap_or(ResourceKind::File);
    let mut resource = Resource::new(ResourceKind::Metadata, id).with_parent(parent_kind, id);
    resource.metadata = descriptor.metadata.clone();
    resource
}

/// Run a blocking callback, mapping task failures to process errors.
async fn run_blocking<T, F>(f: F) -> Result<T, ProcessError>
where
    F: FnOnce() -> Result<T, ProcessError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Err(ProcessError::Interrupted(
            "processing task was cancelled".to_string(),
        )),
        Err(e) => Err(ProcessError::other(format!("callback panicked: {}", e))),
    }
}
