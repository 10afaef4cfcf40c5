//--------------------------------------------------------------------------------------------------
// TOPOLOGY
//--------------------------------------------------------------------------------------------------
// | Entity   | Name (default)        | Attributes                               |
// |----------|-----------------------|------------------------------------------|
// | exchange | attempts.topic        | topic, durable                           |
// | queue    | gamification.queue    | durable, optional TTL and max length     |
// | binding  | queue <- exchange     | attempt.correct only                     |
//
// Every process declares what it uses at startup. Declarations are idempotent on the broker, so
// producers and consumers may run them concurrently and in any order.
//--------------------------------------------------------------------------------------------------

use std::time::Duration;

use rabbitmq::{ExchangeDeclaration, QueueBinding, QueueDeclaration};
use tracing::info;

use crate::broker::TopologyDeclarer;
use crate::error::TopologyError;
use crate::events::ROUTING_KEY_CORRECT;

pub const DEFAULT_EXCHANGE: &str = "attempts.topic";
pub const DEFAULT_QUEUE: &str = "gamification.queue";

/// Names and limits of the attempt topology
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyConfig {
    pub exchange: String,
    pub queue: String,
    pub message_ttl: Option<Duration>,
    pub max_length: Option<u32>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self::new(DEFAULT_EXCHANGE, DEFAULT_QUEUE)
    }
}

impl TopologyConfig {
    pub fn new(exchange: &str, queue: &str) -> Self {
        Self {
            exchange: exchange.to_owned(),
            queue: queue.to_owned(),
            message_ttl: None,
            max_length: None,
        }
    }

    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    pub fn with_max_length(mut self, max_length: u32) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn exchange_declaration(&self) -> ExchangeDeclaration {
        ExchangeDeclaration::durable_topic(&self.exchange)
    }

    pub fn queue_declaration(&self) -> QueueDeclaration {
        let mut queue = QueueDeclaration::durable(&self.queue);
        if let Some(ttl) = self.message_ttl {
            queue = queue.with_message_ttl(ttl);
        }
        if let Some(max_length) = self.max_length {
            queue = queue.with_max_length(max_length);
        }
        queue
    }

    /// Only correct attempts reach the queue; `attempt.wrong` is published but never bound.
    pub fn bindings(&self) -> Vec<QueueBinding> {
        vec![QueueBinding::new(
            &self.queue,
            &self.exchange,
            ROUTING_KEY_CORRECT,
        )]
    }
}

/// What [`ensure_topology`] left in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyHandle {
    exchange: String,
    queue: String,
    bindings: Vec<QueueBinding>,
}

impl TopologyHandle {
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn bindings(&self) -> &[QueueBinding] {
        &self.bindings
    }
}

/// Declares the exchange, the queue and its binding.
///
/// # Arguments
/// * `declarer` - Broker side that performs the declarations
/// * `config` - Names and queue limits
///
/// # Errors
/// Returns a `TopologyError` when the broker is unreachable or an entity already exists with
/// different attributes. Callers treat it as fatal.
pub async fn ensure_topology<D>(
    declarer: &D,
    config: &TopologyConfig,
) -> Result<TopologyHandle, TopologyError>
where
    D: TopologyDeclarer + ?Sized,
{
    declarer
        .declare_exchange(&config.exchange_declaration())
        .await?;
    declarer.declare_queue(&config.queue_declaration()).await?;

    let bindings = config.bindings();
    for binding in &bindings {
        declarer.bind_queue(binding).await?;
    }

    info!(
        "Topology ready: {} -> {} on {}",
        config.exchange, config.queue, ROUTING_KEY_CORRECT
    );

    Ok(TopologyHandle {
        exchange: config.exchange.clone(),
        queue: config.queue.clone(),
        bindings,
    })
}

/// Declares only the exchange, for processes that publish and never consume.
///
/// # Errors
/// Same as [`ensure_topology`].
pub async fn ensure_exchange<D>(declarer: &D, config: &TopologyConfig) -> Result<(), TopologyError>
where
    D: TopologyDeclarer + ?Sized,
{
    declarer
        .declare_exchange(&config.exchange_declaration())
        .await?;
    info!("Exchange ready: {}", config.exchange);
    Ok(())
}
