// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Broker gateway: the only owner of the work channel.
//!
//! The gateway loop alternates between two states:
//!
//! - **Idle**: wait (bounded by the poll interval) for the next delivery.
//!   Malformed payloads go straight to the error queue. Anything else starts
//!   a [`MessageHandler`].
//! - **Active**: wait for the handler's outbox to change (or the poll
//!   interval to pass), then turn each queued control message into a broker
//!   action. No new delivery is pulled until the terminal message has been
//!   handled; together with a prefetch of one this keeps a single job in
//!   flight per gateway.
//!
//! | Control message | Broker action |
//! |-----------------|---------------|
//! | `Status` | Publish a status report to `reply_to`, if the sender set one |
//! | `Ok` | Acknowledge |
//! | `Error` | Publish the raw payload to `error.<queue>`, acknowledge |
//! | `Resubmit` | Publish the payload with the new retry count to the work queue, acknowledge |
//!
//! Stopping does not cancel a running handler. Its message stays
//! unacknowledged and the broker redelivers it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerChannel, BrokerConnector, Delivery, ExchangeKind, PublishProperties};
use crate::descriptor::{DecodedJob, decode_payload};
use crate::error::{Error, Result};
use crate::handler::{HandlerContext, HandlerError, MessageHandler};
use crate::heartbeat::{HeartbeatBroadcaster, HeartbeatConfig, HeartbeatHandle, HeartbeatRecord};
use crate::outbox::{ControlMessage, Outbox, StatusReport, StatusUpdate};
use crate::retry::Verdict;

/// Prefix of the error queue name.
pub const ERROR_QUEUE_PREFIX: &str = "error.";

/// Gateway settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Work queue
    pub queue: String,
    /// Topic exchange to bind the work queue to, if any
    pub exchange: Option<String>,
    /// Routing keys bound on `exchange`
    pub routing_keys: Vec<String>,
    /// Upper bound on each wait in the loop
    pub poll_interval: Duration,
    /// Heartbeat settings
    pub heartbeat: HeartbeatConfig,
}

impl GatewayConfig {
    /// Settings for a work queue with defaults for everything else.
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            exchange: None,
            routing_keys: Vec::new(),
            poll_interval: Duration::from_secs(1),
            heartbeat: HeartbeatConfig::default(),
        }
    }

    /// Name of the paired error queue.
    pub fn error_queue(&self) -> String {
        format!("{}{}", ERROR_QUEUE_PREFIX, self.queue)
    }
}

/// The job currently in flight.
struct ActiveJob {
    delivery: Delivery,
    job: DecodedJob,
    job_id: Option<String>,
    outbox: Outbox,
    handle: JoinHandle<std::result::Result<Verdict, HandlerError>>,
}

enum Wake {
    Stop,
    Outbox,
}

/// Consumes the work queue and performs every broker action for it.
pub struct BrokerGateway {
    connector: Arc<dyn BrokerConnector>,
    record: HeartbeatRecord,
    receiver: Receiver,
    channel: Option<Box<dyn BrokerChannel>>,
    heartbeat: Option<HeartbeatHandle>,
}

/// State the receive loop reads while the channel is lent to it.
struct Receiver {
    context: Arc<HandlerContext>,
    config: GatewayConfig,
    shutdown: Arc<Notify>,
}

impl BrokerGateway {
    /// Create a gateway. Nothing is opened until [`connect`](Self::connect).
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        context: Arc<HandlerContext>,
        config: GatewayConfig,
    ) -> Self {
        let record = HeartbeatRecord::new(&config.queue, context.extractor.info().clone());
        Self {
            connector,
            record,
            receiver: Receiver {
                context,
                config,
                shutdown: Arc::new(Notify::new()),
            },
            channel: None,
            heartbeat: None,
        }
    }

    /// Worker instance ID announced in heartbeats.
    pub fn instance_id(&self) -> uuid::Uuid {
        self.record.id
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.receiver.shutdown.clone()
    }

    /// Ask the receive loop to exit.
    pub fn stop(&self) {
        self.receiver.shutdown.notify_one();
    }

    /// Gateway settings.
    pub fn config(&self) -> &GatewayConfig {
        &self.receiver.config
    }

    /// Declare the work and error queues, start consuming and start the
    /// heartbeat.
    pub async fn connect(&mut self) -> Result<()> {
        let config = &self.receiver.config;
        let queue = &config.queue;
        let error_queue = config.error_queue();

        let mut channel = self.connector.connect().await?;
        channel.declare_queue(queue, true).await?;
        channel.declare_queue(&error_queue, true).await?;

        if let Some(exchange) = &config.exchange {
            channel
                .declare_exchange(exchange, ExchangeKind::Topic, true)
                .await?;
            for routing_key in &config.routing_keys {
                channel.bind_queue(queue, exchange, routing_key).await?;
                debug!(queue = %queue, exchange = %exchange, routing_key = %routing_key, "Bound queue");
            }
        }

        channel.set_prefetch(1).await?;
        channel.consume(queue).await?;
        self.channel = Some(channel);

        let heartbeat = HeartbeatBroadcaster::new(
            self.connector.clone(),
            self.record.clone(),
            config.heartbeat.clone(),
        );
        self.heartbeat = Some(heartbeat.spawn());

        info!(
            queue = %queue,
            error_queue = %error_queue,
            instance_id = %self.record.id,
            "Gateway connected"
        );
        Ok(())
    }

    /// Run the receive loop until stopped.
    ///
    /// Returns an error when the broker fails or a handler reports an
    /// interrupt; the interrupted job has been resubmitted by then.
    pub async fn listen(&mut self) -> Result<()> {
        let mut channel = self
            .channel
            .take()
            .ok_or_else(|| Error::Other("listen called before connect".to_string()))?;

        let result = self.receiver.run(channel.as_mut()).await;

        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop().await;
        }
        if let Err(e) = channel.close().await {
            warn!(error = %e, "Failed to close broker channel");
        }
        info!(queue = %self.receiver.config.queue, "Gateway stopped");
        result
    }
}

impl Receiver {
    async fn run(&self, channel: &mut dyn BrokerChannel) -> Result<()> {
        loop {
            let delivery = tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Gateway received shutdown signal");
                    return Ok(());
                }

                delivery = channel.next_delivery(self.config.poll_interval) => delivery?,
            };
            let Some(delivery) = delivery else {
                continue;
            };

            let Some(active) = self.accept(channel, delivery).await? else {
                continue;
            };
            if !self.drive(channel, active).await? {
                return Ok(());
            }
        }
    }

    /// Decode a delivery and start its handler.
    async fn accept(
        &self,
        channel: &mut dyn BrokerChannel,
        delivery: Delivery,
    ) -> Result<Option<ActiveJob>> {
        let mut job = match decode_payload(&delivery.body) {
            Ok(job) => job,
            Err(e) => {
                warn!(
                    delivery_tag = delivery.delivery_tag,
                    routing_key = %delivery.routing_key,
                    error = %e,
                    "Malformed payload, routing to error queue"
                );
                self.route_to_error(channel, &delivery).await?;
                return Ok(None);
            }
        };
        job.inject_routing_key(&delivery.routing_key);
        let job_id = job.descriptor.job_id();

        info!(
            delivery_tag = delivery.delivery_tag,
            id = %job.descriptor.id,
            job_id = ?job_id,
            routing_key = ?job.descriptor.routing_key,
            retry_count = job.descriptor.retry_count,
            "Received job"
        );

        let outbox = Outbox::new();
        let handle = MessageHandler::new(self.context.clone(), job.clone(), outbox.clone()).spawn();
        Ok(Some(ActiveJob {
            delivery,
            job,
            job_id,
            outbox,
            handle,
        }))
    }

    /// Service the active job until its terminal message is handled.
    ///
    /// Returns false when the loop should stop.
    async fn drive(&self, channel: &mut dyn BrokerChannel, mut active: ActiveJob) -> Result<bool> {
        loop {
            let wake = tokio::select! {
                biased;

                _ = self.shutdown.notified() => Wake::Stop,
                _ = active.outbox.changed() => Wake::Outbox,
                _ = tokio::time::sleep(self.config.poll_interval) => Wake::Outbox,
            };
            if let Wake::Stop = wake {
                warn!(
                    delivery_tag = active.delivery.delivery_tag,
                    "Stopping with a job in flight; it will be redelivered"
                );
                return Ok(false);
            }

            if self.dispatch(channel, &active).await? {
                return match (&mut active.handle).await {
                    Ok(Ok(_)) => Ok(true),
                    Ok(Err(e)) => {
                        warn!(error = %e, "Handler interrupted, stopping gateway");
                        Err(e.into())
                    }
                    Err(e) => {
                        error!(error = %e, "Handler task failed after finishing its job");
                        Ok(true)
                    }
                };
            }

            if active.handle.is_finished() && !active.outbox.is_finished() {
                // Statuses pushed right before the handler died.
                self.dispatch(channel, &active).await?;
                error!(
                    delivery_tag = active.delivery.delivery_tag,
                    "Handler ended without an outcome, routing to error queue"
                );
                self.route_to_error(channel, &active.delivery).await?;
                return Ok(true);
            }
        }
    }

    /// Perform the broker action for every queued control message.
    ///
    /// Returns true once the terminal message has been handled.
    async fn dispatch(&self, channel: &mut dyn BrokerChannel, active: &ActiveJob) -> Result<bool> {
        let mut terminal = false;
        for message in active.outbox.drain() {
            match message {
                ControlMessage::Status(update) => {
                    self.reply_status(channel, active, &update).await?;
                }
                ControlMessage::Ok => {
                    channel.ack(active.delivery.delivery_tag).await?;
                    terminal = true;
                }
                ControlMessage::Error => {
                    self.route_to_error(channel, &active.delivery).await?;
                    terminal = true;
                }
                ControlMessage::Resubmit { retry_count } => {
                    self.resubmit(channel, active, retry_count).await?;
                    terminal = true;
                }
            }
        }
        Ok(terminal)
    }

    async fn reply_status(
        &self,
        channel: &mut dyn BrokerChannel,
        active: &ActiveJob,
        update: &StatusUpdate,
    ) -> Result<()> {
        let Some(reply_to) = &active.delivery.reply_to else {
            debug!(status = %update.status_line(), "No reply queue, status not sent");
            return Ok(());
        };
        let report = StatusReport::new(
            update,
            &active.job.descriptor.id,
            self.context.extractor.name(),
            active.job_id.clone(),
        );
        let properties = PublishProperties {
            correlation_id: active.delivery.correlation_id.clone(),
            content_type: Some("application/json".to_string()),
            ..Default::default()
        };
        channel
            .publish("", reply_to, serde_json::to_vec(&report)?, &properties)
            .await?;
        debug!(reply_to = %reply_to, status = %report.status, "Status sent");
        Ok(())
    }

    async fn resubmit(
        &self,
        channel: &mut dyn BrokerChannel,
        active: &ActiveJob,
        retry_count: u32,
    ) -> Result<()> {
        let body = active.job.resubmission_payload(
            retry_count,
            &active.delivery.exchange,
            &active.delivery.routing_key,
            &self.config.queue,
        );
        let properties = PublishProperties {
            correlation_id: active.delivery.correlation_id.clone(),
            reply_to: active.delivery.reply_to.clone(),
            content_type: Some("application/json".to_string()),
            persistent: true,
        };
        channel
            .publish(
                "",
                &self.config.queue,
                serde_json::to_vec(&body)?,
                &properties,
            )
            .await?;
        channel.ack(active.delivery.delivery_tag).await?;
        info!(
            delivery_tag = active.delivery.delivery_tag,
            retry_count, "Job resubmitted"
        );
        Ok(())
    }

    /// Publish the raw payload to the error queue and acknowledge it.
    async fn route_to_error(&self, channel: &mut dyn BrokerChannel, delivery: &Delivery) -> Result<()> {
        let properties = PublishProperties {
            correlation_id: delivery.correlation_id.clone(),
            reply_to: delivery.reply_to.clone(),
            persistent: true,
            ..Default::default()
        };
        channel
            .publish(
                "",
                &self.config.error_queue(),
                delivery.body.clone(),
                &properties,
            )
            .await?;
        channel.ack(delivery.delivery_tag).await?;
        info!(delivery_tag = delivery.delivery_tag, "Message sent to error queue");
        Ok(())
    }
}
