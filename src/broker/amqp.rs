//! Broker seams backed by RabbitMQ channels.

use async_trait::async_trait;
use rabbitmq::{
    ExchangeDeclaration, Message, Publisher, PublisherContext, QueueBinding, QueueDeclaration,
    Subscription, TopologyChannel,
};
use tracing::debug;

use super::{Delivery, DeliveryStream, ExchangeSink, OutboundMessage, TopologyDeclarer};
use crate::error::{ConnectionError, DeliveryError, PublishError, TopologyError};

pub struct AmqpTopology {
    channel: TopologyChannel,
}

impl AmqpTopology {
    pub(crate) fn new(channel: TopologyChannel) -> Self {
        Self { channel }
    }

    /// Closes the declaration channel once the topology is in place
    pub async fn close(self) -> Result<(), TopologyError> {
        self.channel
            .close()
            .await
            .map_err(|err| ConnectionError::Channel(err.to_string()).into())
    }
}

#[async_trait]
impl TopologyDeclarer for AmqpTopology {
    async fn declare_exchange(&self, exchange: &ExchangeDeclaration) -> Result<(), TopologyError> {
        self.channel
            .declare_exchange(exchange)
            .await
            .map_err(|err| TopologyError::Exchange {
                exchange: exchange.name.clone(),
                reason: err.to_string(),
            })
    }

    async fn declare_queue(&self, queue: &QueueDeclaration) -> Result<(), TopologyError> {
        let message_count = self
            .channel
            .declare_queue(queue)
            .await
            .map_err(|err| TopologyError::Queue {
                queue: queue.name.clone(),
                reason: err.to_string(),
            })?;

        debug!("queue {} holds {} message(s)", queue.name, message_count);
        Ok(())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), TopologyError> {
        self.channel
            .bind_queue(binding)
            .await
            .map_err(|err| TopologyError::Binding {
                queue: binding.queue.clone(),
                exchange: binding.exchange.clone(),
                routing_key: binding.routing_key.clone(),
                reason: err.to_string(),
            })
    }
}

pub struct AmqpExchangeSink {
    publisher: Publisher,
}

impl AmqpExchangeSink {
    pub(crate) fn new(publisher: Publisher) -> Self {
        Self { publisher }
    }

    pub async fn close(self) -> Result<(), PublishError> {
        Ok(self.publisher.close().await?)
    }
}

#[async_trait]
impl ExchangeSink for AmqpExchangeSink {
    fn exchange(&self) -> &str {
        self.publisher.exchange()
    }

    async fn send(&self, message: OutboundMessage) -> Result<(), PublishError> {
        let ctx = PublisherContext::new(&message.message_id)
            .with_correlation_id(&message.correlation_id)
            .with_timestamp(u64::try_from(message.timestamp.timestamp()).unwrap_or_default());

        self.publisher
            .publish(
                Message::new(message.payload, Some(message.routing_key)),
                ctx,
            )
            .await?;

        Ok(())
    }
}

pub struct AmqpDeliveryStream {
    subscription: Subscription,
}

impl AmqpDeliveryStream {
    pub(crate) fn new(subscription: Subscription) -> Self {
        Self { subscription }
    }

    pub fn queue_name(&self) -> &str {
        self.subscription.queue_name()
    }
}

#[async_trait]
impl DeliveryStream for AmqpDeliveryStream {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        let message = self.subscription.receive().await?;

        Some(Delivery {
            delivery_tag: message.delivery_tag,
            routing_key: message.routing_key,
            redelivered: message.redelivered,
            body: message.content,
        })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), DeliveryError> {
        Ok(self.subscription.ack(delivery_tag).await?)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), DeliveryError> {
        Ok(self.subscription.reject(delivery_tag, requeue).await?)
    }

    async fn close(self) -> Result<(), DeliveryError> {
        Ok(self.subscription.close().await?)
    }
}
