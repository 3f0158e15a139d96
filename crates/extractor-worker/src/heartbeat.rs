// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Heartbeat broadcaster.
//!
//! Periodically announces the worker's identity and queue on a durable
//! fanout exchange so monitoring tools can discover running extractors.
//! Heartbeats are snapshots: losing or duplicating one is harmless, so
//! failures are logged and retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerChannel, BrokerConnector, ExchangeKind, PublishProperties};
use crate::config::DEFAULT_HEARTBEAT_EXCHANGE;
use crate::extractor::ExtractorInfo;

/// Announcement published on every tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartbeatRecord {
    /// Worker instance ID, fixed for the life of the process
    pub id: Uuid,
    /// Work queue the worker consumes from
    pub queue: String,
    /// Capability descriptor
    pub extractor_info: ExtractorInfo,
}

impl HeartbeatRecord {
    /// Create a record with a fresh instance ID.
    pub fn new(queue: impl Into<String>, extractor_info: ExtractorInfo) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue: queue.into(),
            extractor_info,
        }
    }
}

/// Heartbeat settings.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Fanout exchange heartbeats are published to
    pub exchange: String,
    /// Time between heartbeats
    pub interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            exchange: DEFAULT_HEARTBEAT_EXCHANGE.to_string(),
            interval: Duration::from_secs(300),
        }
    }
}

/// Publishes heartbeats on its own connection.
pub struct HeartbeatBroadcaster {
    connector: Arc<dyn BrokerConnector>,
    record: HeartbeatRecord,
    config: HeartbeatConfig,
    shutdown: Arc<Notify>,
}

impl HeartbeatBroadcaster {
    /// Create a broadcaster for `record`.
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        record: HeartbeatRecord,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            connector,
            record,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run on a background task.
    pub fn spawn(self) -> HeartbeatHandle {
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(self.run());
        HeartbeatHandle { shutdown, task }
    }

    /// Publish immediately, then once per interval until shut down.
    pub async fn run(self) {
        info!(
            id = %self.record.id,
            exchange = %self.config.exchange,
            interval_secs = self.config.interval.as_secs(),
            "Heartbeat broadcaster started"
        );

        let mut channel: Option<Box<dyn BrokerChannel>> = None;
        loop {
            self.beat(&mut channel).await;

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                debug!(error = %e, "Failed to close heartbeat channel");
            }
        }
        info!("Heartbeat broadcaster stopped");
    }

    async fn beat(&self, channel: &mut Option<Box<dyn BrokerChannel>>) {
        if channel.is_none() {
            match self.open_channel().await {
                Ok(opened) => *channel = Some(opened),
                Err(e) => {
                    warn!(error = %e, "Heartbeat connection failed");
                    return;
                }
            }
        }
        let Some(open) = channel.as_mut() else {
            return;
        };

        let body = match serde_json::to_vec(&self.record) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Failed to serialize heartbeat");
                return;
            }
        };
        let properties = PublishProperties {
            content_type: Some("application/json".to_string()),
            ..Default::default()
        };
        match open
            .publish(&self.config.exchange, "", body, &properties)
            .await
        {
            Ok(()) => debug!(id = %self.record.id, "Heartbeat sent"),
            Err(e) => warn!(error = %e, "Failed to publish heartbeat"),
        }
    }

    async fn open_channel(&self) -> crate::broker::Result<Box<dyn BrokerChannel>> {
        let mut channel = self.connector.connect().await?;
        channel
            .declare_exchange(&self.config.exchange, ExchangeKind::Fanout, true)
            .await?;
        Ok(channel)
    }
}

/// Running broadcaster.
pub struct HeartbeatHandle {
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Stop broadcasting and wait for the task to end.
    pub async fn stop(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Heartbeat task ended abnormally");
        }
    }
}
