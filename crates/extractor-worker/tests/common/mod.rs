// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for extractor-worker integration tests.
//!
//! Provides TestWorld: an in-memory repository, a recording notifier and a
//! staging directory, wired into a HandlerContext.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use extractor_repository::MockRepository;
use tempfile::TempDir;

use extractor_worker::descriptor::{DecodedJob, decode_payload};
use extractor_worker::handler::HandlerContext;
use extractor_worker::mount::MountTable;
use extractor_worker::notify::{Notice, Notifier, NotifyError};
use extractor_worker::outbox::ControlMessage;
use extractor_worker::resolver::ResourceResolver;
use extractor_worker::{Extractor, ExtractorInfo, Resource, RetryPolicy};

/// Notifier that keeps every notice it is given.
#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            notices: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notice: &Notice) -> Result<(), NotifyError> {
        self.notices.lock().unwrap().push(notice.clone());
        if self.fail {
            return Err(NotifyError::Build("smtp unavailable".to_string()));
        }
        Ok(())
    }
}

/// Resources seen by a Process callback, in call order.
#[derive(Clone, Default)]
pub struct Seen(Arc<Mutex<Vec<(Resource, usize)>>>);

impl Seen {
    pub fn record(&self, resource: &Resource) {
        let present = resource.local_paths.iter().filter(|p| p.exists()).count();
        self.0.lock().unwrap().push((resource.clone(), present));
    }

    pub fn all(&self) -> Vec<Resource> {
        self.0.lock().unwrap().iter().map(|(r, _)| r.clone()).collect()
    }

    /// Local paths of the last call that existed while Process ran.
    pub fn present(&self) -> usize {
        self.0.lock().unwrap().last().map(|(_, n)| *n).unwrap_or(0)
    }

    pub fn only(&self) -> Resource {
        let all = self.all();
        assert_eq!(all.len(), 1, "expected exactly one Process call");
        all.into_iter().next().unwrap()
    }
}

/// Test world: repository, notifier and staging directory.
pub struct TestWorld {
    pub repository: Arc<MockRepository>,
    pub notifier: Arc<RecordingNotifier>,
    pub staging: TempDir,
    pub mounts: MountTable,
    pub max_retry: u32,
    pub host_override: Option<String>,
}

impl TestWorld {
    pub fn new() -> Self {
        Self::with_notifier(RecordingNotifier::default())
    }

    pub fn with_notifier(notifier: RecordingNotifier) -> Self {
        Self {
            repository: Arc::new(MockRepository::new()),
            notifier: Arc::new(notifier),
            staging: TempDir::new().unwrap(),
            mounts: MountTable::default(),
            max_retry: 10,
            host_override: None,
        }
    }

    /// Build a handler context for `extractor`.
    pub fn context(&self, extractor: Extractor) -> Arc<HandlerContext> {
        let resolver = ResourceResolver::new(
            self.repository.clone(),
            Arc::new(self.mounts.clone()),
            self.staging.path(),
        );
        Arc::new(HandlerContext {
            extractor,
            resolver,
            repository: self.repository.clone(),
            notifier: self.notifier.clone(),
            retry: RetryPolicy::new(self.max_retry),
            host_override: self.host_override.clone(),
        })
    }

    /// Entries left in the staging directory.
    pub fn staged_entries(&self) -> usize {
        std::fs::read_dir(self.staging.path()).unwrap().count()
    }
}

/// Extractor that records every resource it processes and succeeds.
pub fn recording_extractor(name: &str, seen: &Seen) -> Extractor {
    let seen = seen.clone();
    Extractor::new(ExtractorInfo::new(name), move |resource, _| {
        seen.record(resource);
        Ok(())
    })
}

/// Decode a JSON descriptor literal.
pub fn job(json: serde_json::Value) -> DecodedJob {
    decode_payload(json.to_string().as_bytes()).unwrap()
}

/// Terminal message among `messages`.
pub fn terminal(messages: &[ControlMessage]) -> ControlMessage {
    let terminals: Vec<_> = messages.iter().filter(|m| m.is_terminal()).collect();
    assert_eq!(terminals.len(), 1, "expected exactly one terminal message");
    terminals[0].clone()
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn wait_for<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
