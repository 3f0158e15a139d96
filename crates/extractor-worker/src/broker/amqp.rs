// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AMQP 0-9-1 channel over `amqprs`.

use std::time::Duration;

use amqprs::{
    BasicProperties,
    callbacks::{DefaultChannelCallback, DefaultConnectionCallback},
    channel::{
        BasicAckArguments, BasicConsumeArguments, BasicPublishArguments, BasicQosArguments,
        Channel, ConsumerMessage, ExchangeDeclareArguments, QueueBindArguments,
        QueueDeclareArguments,
    },
    connection::{Connection, OpenConnectionArguments},
};
use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;

use super::{
    BrokerChannel, BrokerConnector, BrokerError, Delivery, ExchangeKind, PublishProperties, Result,
};

const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Connects to an AMQP broker.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    uri: String,
}

impl AmqpConnector {
    /// Create a connector for an `amqp://` URI.
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>> {
        let args = OpenConnectionArguments::try_from(self.uri.as_str())
            .map_err(|e| BrokerError::InvalidUri(e.to_string()))?;
        let connection = Connection::open(&args).await?;
        connection
            .register_callback(DefaultConnectionCallback)
            .await?;

        let channel = connection.open_channel(None).await?;
        channel.register_callback(DefaultChannelCallback).await?;
        debug!("AMQP channel opened");

        Ok(Box::new(AmqpChannel {
            connection,
            channel,
            consumer: None,
        }))
    }
}

/// A channel on its own connection.
pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
    consumer: Option<UnboundedReceiver<ConsumerMessage>>,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&mut self, name: &str, durable: bool) -> Result<()> {
        let args = QueueDeclareArguments::new(name).durable(durable).finish();
        self.channel.queue_declare(args).await?;
        Ok(())
    }

    async fn declare_exchange(
        &mut self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<()> {
        let args = ExchangeDeclareArguments::new(name, kind.as_str())
            .durable(durable)
            .finish();
        self.channel.exchange_declare(args).await?;
        Ok(())
    }

    async fn bind_queue(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(QueueBindArguments::new(queue, exchange, routing_key))
            .await?;
        Ok(())
    }

    async fn set_prefetch(&mut self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(BasicQosArguments::new(0, count, false))
            .await?;
        Ok(())
    }

    async fn consume(&mut self, queue: &str) -> Result<()> {
        let args = BasicConsumeArguments::default()
            .queue(queue.to_string())
            .auto_ack(false)
            .finish();
        let (consumer_tag, rx) = self.channel.basic_consume_rx(args).await?;
        debug!(queue = %queue, consumer_tag = %consumer_tag, "Consuming");
        self.consumer = Some(rx);
        Ok(())
    }

    async fn next_delivery(&mut self, timeout: Duration) -> Result<Option<Delivery>> {
        let consumer = self.consumer.as_mut().ok_or(BrokerError::NotConsuming)?;
        let message = match tokio::time::timeout(timeout, consumer.recv()).await {
            Err(_) => return Ok(None),
            Ok(None) => return Err(BrokerError::Closed),
            Ok(Some(message)) => message,
        };

        let Some(deliver) = message.deliver else {
            return Err(BrokerError::Other(
                "delivery without method frame".to_string(),
            ));
        };
        let properties = message.basic_properties.unwrap_or_default();

        Ok(Some(Delivery {
            delivery_tag: deliver.delivery_tag(),
            exchange: deliver.exchange().clone(),
            routing_key: deliver.routing_key().clone(),
            reply_to: properties.reply_to().cloned(),
            correlation_id: properties.correlation_id().cloned(),
            body: message.content.unwrap_or_default(),
        }))
    }

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: &PublishProperties,
    ) -> Result<()> {
        let mut props = BasicProperties::default();
        if let Some(correlation_id) = &properties.correlation_id {
            props.with_correlation_id(correlation_id);
        }
        if let Some(reply_to) = &properties.reply_to {
            props.with_reply_to(reply_to);
        }
        if let Some(content_type) = &properties.content_type {
            props.with_content_type(content_type);
        }
        if properties.persistent {
            props.with_delivery_mode(DELIVERY_MODE_PERSISTENT);
        }

        self.channel
            .basic_publish(
                props.finish(),
                body,
                BasicPublishArguments::new(exchange, routing_key),
            )
            .await?;
        Ok(())
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(BasicAckArguments::new(delivery_tag, false))
            .await?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let this = *self;
        drop(this.consumer);
        this.channel.close().await?;
        this.connection.close().await?;
        Ok(())
    }
}
