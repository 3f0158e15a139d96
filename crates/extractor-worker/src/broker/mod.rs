// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Broker abstraction.
//!
//! A [`BrokerChannel`] is not shareable: every method takes `&mut self` and
//! the value is owned by exactly one task (the gateway loop, or the
//! heartbeat loop on its own connection). Other tasks reach the broker only
//! through the gateway's outbox.
//!
//! Two implementations are provided:
//!
//! | Connector | Description |
//! |-----------|-------------|
//! | [`AmqpConnector`] | AMQP 0-9-1 over `amqprs` |
//! | [`MockBroker`] | In-memory broker recording every action, for tests |

mod amqp;
mod mock;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use amqp::{AmqpChannel, AmqpConnector};
pub use mock::{MockBroker, MockChannel, PublishedMessage};

/// Broker errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BrokerError {
    /// AMQP protocol or connection failure.
    #[error("AMQP error: {0}")]
    Amqp(#[from] amqprs::error::Error),

    /// The broker URI could not be parsed.
    #[error("Invalid broker URI: {0}")]
    InvalidUri(String),

    /// The consumer was closed by the broker.
    #[error("Broker channel closed")]
    Closed,

    /// `next_delivery` was called before `consume`.
    #[error("Not consuming from any queue")]
    NotConsuming,

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Exchange types used by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Broadcast to every bound queue
    Fanout,
    /// Route by pattern
    Topic,
}

impl ExchangeKind {
    /// AMQP type name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
        }
    }
}

/// A message received from the work queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Tag used to acknowledge the message
    pub delivery_tag: u64,
    /// Exchange the message was published to (empty for the default exchange)
    pub exchange: String,
    /// Routing key the message was published with
    pub routing_key: String,
    /// Queue status replies should go to
    pub reply_to: Option<String>,
    /// Correlation ID to echo in replies
    pub correlation_id: Option<String>,
    /// Raw payload
    pub body: Vec<u8>,
}

/// Properties attached to a published message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishProperties {
    /// Correlation ID
    pub correlation_id: Option<String>,
    /// Reply address
    pub reply_to: Option<String>,
    /// MIME type of the body
    pub content_type: Option<String>,
    /// Ask the broker to persist the message
    pub persistent: bool,
}

/// An open channel, owned by a single task.
#[async_trait]
pub trait BrokerChannel: Send {
    /// Declare a queue.
    async fn declare_queue(&mut self, name: &str, durable: bool) -> Result<()>;

    /// Declare an exchange.
    async fn declare_exchange(&mut self, name: &str, kind: ExchangeKind, durable: bool)
    -> Result<()>;

    /// Bind a queue to an exchange for a routing key.
    async fn bind_queue(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Limit the number of unacknowledged deliveries.
    async fn set_prefetch(&mut self, count: u16) -> Result<()>;

    /// Start consuming from a queue with manual acknowledgement.
    async fn consume(&mut self, queue: &str) -> Result<()>;

    /// Wait up to `timeout` for the next delivery.
    async fn next_delivery(&mut self, timeout: Duration) -> Result<Option<Delivery>>;

    /// Publish a message.
    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: &PublishProperties,
    ) -> Result<()>;

    /// Acknowledge a delivery.
    async fn ack(&mut self, delivery_tag: u64) -> Result<()>;

    /// Close the channel and its connection.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Opens channels on fresh connections.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Open a new connection and a channel on it.
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>>;
}
