//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Seams between the event core and the message broker. Topology, publisher and consumer only
// talk to these traits; `amqp` implements them over the rabbitmq crate and `memory` implements
// them in process.
//
// | Trait             | Used by                  | Key Methods                         |
// |-------------------|--------------------------|-------------------------------------|
// | TopologyDeclarer  | ensure_topology          | declare_exchange, declare_queue,    |
// |                   |                          | bind_queue                          |
// | ExchangeSink      | ChallengeEventPublisher  | send                                |
// | DeliveryStream    | ConsumerDispatcher       | next_delivery, ack, reject, close   |
//--------------------------------------------------------------------------------------------------

pub mod amqp;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rabbitmq::{ExchangeDeclaration, QueueBinding, QueueDeclaration};

use crate::error::{DeliveryError, PublishError, TopologyError};

/// Declares broker entities.
///
/// Implementations must treat redeclaring an identical entity as success.
#[async_trait]
pub trait TopologyDeclarer: Send + Sync {
    async fn declare_exchange(&self, exchange: &ExchangeDeclaration) -> Result<(), TopologyError>;

    async fn declare_queue(&self, queue: &QueueDeclaration) -> Result<(), TopologyError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), TopologyError>;
}

/// A message ready to leave for an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub message_id: String,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Sends persistent messages to one exchange.
#[async_trait]
pub trait ExchangeSink: Send + Sync {
    fn exchange(&self) -> &str;

    async fn send(&self, message: OutboundMessage) -> Result<(), PublishError>;
}

/// A message handed to a consumer, unacknowledged until acked or rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
}

/// Deliveries from one queue with manual acknowledgement.
#[async_trait]
pub trait DeliveryStream: Send {
    /// Waits for the next delivery. `None` once the underlying channel is gone.
    async fn next_delivery(&mut self) -> Option<Delivery>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), DeliveryError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), DeliveryError>;

    /// Stops consuming. Deliveries neither acked nor rejected go back to the queue.
    async fn close(self) -> Result<(), DeliveryError>;
}
