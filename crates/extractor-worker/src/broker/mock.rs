// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory broker for testing.
//!
//! Every channel opened through a [`MockBroker`] shares its state: tests
//! inject deliveries with [`MockBroker::deliver`] and inspect what the
//! worker declared, published and acknowledged.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use super::{
    BrokerChannel, BrokerConnector, BrokerError, Delivery, ExchangeKind, PublishProperties, Result,
};

/// A message published through a mock channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Target exchange (empty for the default exchange)
    pub exchange: String,
    /// Routing key (the queue name on the default exchange)
    pub routing_key: String,
    /// Payload
    pub body: Vec<u8>,
    /// Properties
    pub properties: PublishProperties,
}

impl PublishedMessage {
    /// Payload parsed as JSON.
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Default)]
struct MockBrokerState {
    queues: Vec<String>,
    exchanges: Vec<(String, ExchangeKind)>,
    bindings: Vec<(String, String, String)>,
    prefetch: Option<u16>,
    consuming: Option<String>,
    published: Vec<PublishedMessage>,
    acks: Vec<u64>,
    failing_exchanges: HashSet<String>,
    connections: usize,
    closed: usize,
    next_tag: u64,
}

/// In-memory broker.
#[derive(Debug, Clone)]
pub struct MockBroker {
    state: Arc<Mutex<MockBrokerState>>,
    sender: UnboundedSender<Delivery>,
    receiver: Arc<Mutex<Option<UnboundedReceiver<Delivery>>>>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        let (sender, receiver) = unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(MockBrokerState::default())),
            sender,
            receiver: Arc::new(Mutex::new(Some(receiver))),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockBrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a delivery for the consuming channel. Returns its tag.
    pub fn deliver(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl Into<Vec<u8>>,
        reply_to: Option<&str>,
    ) -> u64 {
        let delivery_tag = {
            let mut state = self.state();
            state.next_tag += 1;
            state.next_tag
        };
        let delivery = Delivery {
            delivery_tag,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            reply_to: reply_to.map(str::to_string),
            correlation_id: Some(format!("corr-{}", delivery_tag)),
            body: body.into(),
        };
        // The receiver lives as long as the broker, so this cannot fail.
        let _ = self.sender.send(delivery);
        delivery_tag
    }

    /// Make every publish to `exchange` fail.
    pub fn fail_publishes_to(&self, exchange: &str) {
        self.state().failing_exchanges.insert(exchange.to_string());
    }

    /// Declared queues, in order.
    pub fn queues(&self) -> Vec<String> {
        self.state().queues.clone()
    }

    /// Declared exchanges, in order.
    pub fn exchanges(&self) -> Vec<(String, ExchangeKind)> {
        self.state().exchanges.clone()
    }

    /// Queue bindings as `(queue, exchange, routing_key)`.
    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.state().bindings.clone()
    }

    /// Last prefetch limit set.
    pub fn prefetch(&self) -> Option<u16> {
        self.state().prefetch
    }

    /// Queue being consumed, if any.
    pub fn consuming(&self) -> Option<String> {
        self.state().consuming.clone()
    }

    /// Everything published so far.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    /// Messages published with the given routing key.
    pub fn published_to(&self, routing_key: &str) -> Vec<PublishedMessage> {
        self.state()
            .published
            .iter()
            .filter(|m| m.routing_key == routing_key)
            .cloned()
            .collect()
    }

    /// Acknowledged delivery tags, in order.
    pub fn acks(&self) -> Vec<u64> {
        self.state().acks.clone()
    }

    /// Number of connections opened.
    pub fn connections(&self) -> usize {
        self.state().connections
    }

    /// Number of channels closed.
    pub fn closed(&self) -> usize {
        self.state().closed
    }
}

#[async_trait]
impl BrokerConnector for MockBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>> {
        self.state().connections += 1;
        Ok(Box::new(MockChannel {
            broker: self.clone(),
            consumer: None,
        }))
    }
}

/// Channel on a [`MockBroker`].
pub struct MockChannel {
    broker: MockBroker,
    consumer: Option<UnboundedReceiver<Delivery>>,
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn declare_queue(&mut self, name: &str, _durable: bool) -> Result<()> {
        self.broker.state().queues.push(name.to_string());
        Ok(())
    }

    async fn declare_exchange(
        &mut self,
        name: &str,
        kind: ExchangeKind,
        _durable: bool,
    ) -> Result<()> {
        self.broker
            .state()
            .exchanges
            .push((name.to_string(), kind));
        Ok(())
    }

    async fn bind_queue(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.broker.state().bindings.push((
            queue.to_string(),
            exchange.to_string(),
            routing_key.to_string(),
        ));
        Ok(())
    }

    async fn set_prefetch(&mut self, count: u16) -> Result<()> {
        self.broker.state().prefetch = Some(count);
        Ok(())
    }

    async fn consume(&mut self, queue: &str) -> Result<()> {
        let receiver = self
            .broker
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| BrokerError::Other("mock queue already consumed".to_string()))?;
        self.consumer = Some(receiver);
        self.broker.state().consuming = Some(queue.to_string());
        Ok(())
    }

    async fn next_delivery(&mut self, timeout: Duration) -> Result<Option<Delivery>> {
        let consumer = self.consumer.as_mut().ok_or(BrokerError::NotConsuming)?;
        match tokio::time::timeout(timeout, consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(BrokerError::Closed),
            Ok(Some(delivery)) => Ok(Some(delivery)),
        }
    }

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: &PublishProperties,
    ) -> Result<()> {
        let mut state = self.broker.state();
        if state.failing_exchanges.contains(exchange) {
            return Err(BrokerError::Other(format!(
                "publish to {} rejected",
                exchange
            )));
        }
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body,
            properties: properties.clone(),
        });
        Ok(())
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<()> {
        self.broker.state().acks.push(delivery_tag);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let this = *self;
        if let Some(receiver) = this.consumer {
            *this
                .broker
                .receiver
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(receiver);
        }
        this.broker.state().closed += 1;
        Ok(())
    }
}
