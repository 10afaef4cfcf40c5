//! In-process broker following RabbitMQ's routing and acknowledgement rules.
//!
//! Used by the tests and by anything that wants both services in one process.
//! Behaviour kept from the real broker:
//!
//! - redeclaring an identical exchange, queue or binding succeeds, a conflicting one fails
//! - topic exchanges match `*` against one word and `#` against zero or more words
//! - a message no binding matches is dropped
//! - competing consumers on one queue never receive the same delivery
//! - a rejected message is discarded unless requeued
//! - unacknowledged messages go back to the queue, flagged redelivered, when their consumer closes
//! - `x-max-length` drops from the head, `x-message-ttl` expires messages before delivery

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use rabbitmq::{ExchangeDeclaration, ExchangeKind, QueueBinding, QueueDeclaration};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Delivery, DeliveryStream, ExchangeSink, OutboundMessage, TopologyDeclarer};
use crate::error::{ConnectionError, DeliveryError, PublishError, TopologyError};

/// Shared handle to an in-memory broker. Clones see the same state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    /// Cancelled once by `shutdown`, observed by every waiting consumer
    closed: CancellationToken,
}

#[derive(Default)]
struct BrokerState {
    unreachable: bool,
    closed: bool,
    exchanges: HashMap<String, ExchangeDeclaration>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<QueueBinding>,
    published: Vec<PublishedMessage>,
    next_delivery_tag: u64,
    next_consumer_id: u64,
}

impl BrokerState {
    fn ensure_reachable(&self) -> Result<(), ConnectionError> {
        if self.unreachable || self.closed {
            return Err(ConnectionError::Closed);
        }
        Ok(())
    }

    fn route(&self, exchange: &ExchangeDeclaration, routing_key: &str) -> Vec<String> {
        let mut queues: Vec<String> = Vec::new();

        for binding in self.bindings.iter().filter(|b| b.exchange == exchange.name) {
            let matched = match exchange.kind {
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Fanout => true,
            };

            // A queue bound through several matching patterns still gets one copy
            if matched && !queues.contains(&binding.queue) {
                queues.push(binding.queue.clone());
            }
        }

        queues
    }
}

struct MemoryQueue {
    declaration: QueueDeclaration,
    ready: VecDeque<StoredMessage>,
    /// delivery tag -> (consumer id, message)
    unacked: HashMap<u64, (u64, StoredMessage)>,
    acked: u64,
    rejected: u64,
    dropped: u64,
    notify: Arc<Notify>,
}

impl MemoryQueue {
    fn new(declaration: QueueDeclaration) -> Self {
        Self {
            declaration,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            acked: 0,
            rejected: 0,
            dropped: 0,
            notify: Arc::new(Notify::new()),
        }
    }

    fn enqueue(&mut self, message: StoredMessage) {
        if let Some(max_length) = self.declaration.max_length {
            let max_length = max_length as usize;
            if max_length == 0 {
                self.dropped += 1;
                return;
            }
            while self.ready.len() >= max_length && self.ready.pop_front().is_some() {
                self.dropped += 1;
            }
        }

        self.ready.push_back(message);
        self.notify.notify_one();
    }

    fn pop_ready(&mut self, now: Instant) -> Option<StoredMessage> {
        while let Some(message) = self.ready.pop_front() {
            let expired = self
                .declaration
                .message_ttl
                .is_some_and(|ttl| now.duration_since(message.enqueued_at) >= ttl);

            if expired {
                self.dropped += 1;
                continue;
            }
            return Some(message);
        }
        None
    }

    fn requeue_front(&mut self, mut message: StoredMessage) {
        message.redelivered = true;
        self.ready.push_front(message);
        self.notify.notify_one();
    }

    fn take_unacked(&mut self, consumer_id: u64, delivery_tag: u64) -> Option<StoredMessage> {
        let owned = self
            .unacked
            .get(&delivery_tag)
            .is_some_and(|(owner, _)| *owner == consumer_id);

        if owned {
            self.unacked.remove(&delivery_tag).map(|(_, message)| message)
        } else {
            None
        }
    }
}

#[derive(Clone)]
struct StoredMessage {
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
    enqueued_at: Instant,
}

/// A message accepted by an exchange, with the queues it was routed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub message: OutboundMessage,
    pub routed_to: Vec<String>,
}

/// Point-in-time counters of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: usize,
    pub unacked: usize,
    pub acked: u64,
    pub rejected: u64,
    /// Messages discarded by the length limit or the TTL
    pub dropped: u64,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the broker going down (`false`) or coming back (`true`)
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unreachable = !reachable;
    }

    /// Closes the broker: every consumer stream ends and further calls fail
    pub fn shutdown(&self) {
        self.state.lock().closed = true;
        self.closed.cancel();
    }

    pub fn exchange_sink(&self, exchange: &str) -> MemoryExchangeSink {
        MemoryExchangeSink {
            broker: self.clone(),
            exchange: exchange.to_owned(),
        }
    }

    /// Starts a consumer on `queue`
    ///
    /// # Errors
    /// Fails like `basic.consume` on a missing queue, or when the broker is unreachable
    pub fn consume(&self, queue: &str) -> Result<MemoryDeliveryStream, ConnectionError> {
        let mut state = self.state.lock();
        state.ensure_reachable()?;

        let notify = state
            .queues
            .get(queue)
            .map(|q| Arc::clone(&q.notify))
            .ok_or_else(|| {
                ConnectionError::Channel(format!("NOT_FOUND - no queue '{}'", queue))
            })?;

        state.next_consumer_id += 1;
        let consumer_id = state.next_consumer_id;
        debug!("consumer {} attached to {}", consumer_id, queue);

        Ok(MemoryDeliveryStream {
            broker: self.clone(),
            queue: queue.to_owned(),
            consumer_id,
            notify,
        })
    }

    pub fn exchanges(&self) -> Vec<ExchangeDeclaration> {
        self.state.lock().exchanges.values().cloned().collect()
    }

    pub fn queues(&self) -> Vec<QueueDeclaration> {
        self.state
            .lock()
            .queues
            .values()
            .map(|q| q.declaration.clone())
            .collect()
    }

    pub fn bindings(&self) -> Vec<QueueBinding> {
        self.state.lock().bindings.clone()
    }

    /// Every message accepted by an exchange, in publish order
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().published.clone()
    }

    pub fn queue_stats(&self, queue: &str) -> Option<QueueStats> {
        self.state.lock().queues.get(queue).map(|q| QueueStats {
            ready: q.ready.len(),
            unacked: q.unacked.len(),
            acked: q.acked,
            rejected: q.rejected,
            dropped: q.dropped,
        })
    }
}

#[async_trait]
impl TopologyDeclarer for InMemoryBroker {
    async fn declare_exchange(&self, exchange: &ExchangeDeclaration) -> Result<(), TopologyError> {
        let mut state = self.state.lock();
        state.ensure_reachable()?;

        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing == exchange => Ok(()),
            Some(existing) => Err(TopologyError::Exchange {
                exchange: exchange.name.clone(),
                reason: format!(
                    "PRECONDITION_FAILED - inequivalent arg: declared {} durable={}, \
                     existing {} durable={}",
                    exchange.kind, exchange.durable, existing.kind, existing.durable
                ),
            }),
            None => {
                debug!("exchange {} created", exchange.name);
                state.exchanges.insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &QueueDeclaration) -> Result<(), TopologyError> {
        let mut state = self.state.lock();
        state.ensure_reachable()?;

        // Limits the AMQP declaration cannot carry are refused here too
        queue.arguments().map_err(|err| TopologyError::Queue {
            queue: queue.name.clone(),
            reason: err.to_string(),
        })?;

        match state.queues.get(&queue.name) {
            Some(existing) if existing.declaration == *queue => Ok(()),
            Some(_) => Err(TopologyError::Queue {
                queue: queue.name.clone(),
                reason: "PRECONDITION_FAILED - inequivalent queue arguments".to_owned(),
            }),
            None => {
                debug!("queue {} created", queue.name);
                state
                    .queues
                    .insert(queue.name.clone(), MemoryQueue::new(queue.clone()));
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), TopologyError> {
        let mut state = self.state.lock();
        state.ensure_reachable()?;

        let missing = if !state.exchanges.contains_key(&binding.exchange) {
            Some(format!("NOT_FOUND - no exchange '{}'", binding.exchange))
        } else if !state.queues.contains_key(&binding.queue) {
            Some(format!("NOT_FOUND - no queue '{}'", binding.queue))
        } else {
            None
        };

        if let Some(reason) = missing {
            return Err(TopologyError::Binding {
                queue: binding.queue.clone(),
                exchange: binding.exchange.clone(),
                routing_key: binding.routing_key.clone(),
                reason,
            });
        }

        if !state.bindings.contains(binding) {
            debug!(
                "queue {} bound to {} on {}",
                binding.queue, binding.exchange, binding.routing_key
            );
            state.bindings.push(binding.clone());
        }
        Ok(())
    }
}

/// Publishing side of [`InMemoryBroker`], bound to one exchange.
pub struct MemoryExchangeSink {
    broker: InMemoryBroker,
    exchange: String,
}

#[async_trait]
impl ExchangeSink for MemoryExchangeSink {
    fn exchange(&self) -> &str {
        &self.exchange
    }

    async fn send(&self, message: OutboundMessage) -> Result<(), PublishError> {
        let mut guard = self.broker.state.lock();
        let state = &mut *guard;
        state.ensure_reachable()?;

        let exchange = state
            .exchanges
            .get(&self.exchange)
            .ok_or_else(|| PublishError::ExchangeNotFound(self.exchange.clone()))?;

        let routed_to = state.route(exchange, &message.routing_key);
        if routed_to.is_empty() {
            debug!(
                "message {} on {} matched no binding, dropped",
                message.message_id, message.routing_key
            );
        }

        let now = Instant::now();
        for queue_name in &routed_to {
            if let Some(queue) = state.queues.get_mut(queue_name) {
                queue.enqueue(StoredMessage {
                    routing_key: message.routing_key.clone(),
                    body: message.payload.clone(),
                    redelivered: false,
                    enqueued_at: now,
                });
            }
        }

        state.published.push(PublishedMessage {
            exchange: self.exchange.clone(),
            message,
            routed_to,
        });

        Ok(())
    }
}

/// Consuming side of [`InMemoryBroker`], with manual acknowledgement.
pub struct MemoryDeliveryStream {
    broker: InMemoryBroker,
    queue: String,
    consumer_id: u64,
    notify: Arc<Notify>,
}

impl MemoryDeliveryStream {
    pub fn queue_name(&self) -> &str {
        &self.queue
    }
}

#[async_trait]
impl DeliveryStream for MemoryDeliveryStream {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        loop {
            {
                let mut guard = self.broker.state.lock();
                let state = &mut *guard;
                if state.closed {
                    return None;
                }

                let queue = state.queues.get_mut(&self.queue)?;
                if let Some(message) = queue.pop_ready(Instant::now()) {
                    state.next_delivery_tag += 1;
                    let delivery_tag = state.next_delivery_tag;

                    let delivery = Delivery {
                        delivery_tag,
                        routing_key: message.routing_key.clone(),
                        redelivered: message.redelivered,
                        body: message.body.clone(),
                    };
                    queue
                        .unacked
                        .insert(delivery_tag, (self.consumer_id, message));

                    return Some(delivery);
                }
            }

            tokio::select! {
                _ = self.broker.closed.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), DeliveryError> {
        let mut state = self.broker.state.lock();
        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or(DeliveryError::UnknownDeliveryTag(delivery_tag))?;

        queue
            .take_unacked(self.consumer_id, delivery_tag)
            .ok_or(DeliveryError::UnknownDeliveryTag(delivery_tag))?;
        queue.acked += 1;
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), DeliveryError> {
        let mut state = self.broker.state.lock();
        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or(DeliveryError::UnknownDeliveryTag(delivery_tag))?;

        let message = queue
            .take_unacked(self.consumer_id, delivery_tag)
            .ok_or(DeliveryError::UnknownDeliveryTag(delivery_tag))?;

        if requeue {
            queue.requeue_front(message);
        } else {
            queue.rejected += 1;
            warn!(
                "message {} on {} rejected, discarded",
                delivery_tag, self.queue
            );
        }
        Ok(())
    }

    async fn close(self) -> Result<(), DeliveryError> {
        // Requeueing happens in Drop
        Ok(())
    }
}

impl Drop for MemoryDeliveryStream {
    fn drop(&mut self) {
        let mut state = self.broker.state.lock();
        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return;
        };

        let mut in_flight: Vec<u64> = queue
            .unacked
            .iter()
            .filter(|(_, (owner, _))| *owner == self.consumer_id)
            .map(|(tag, _)| *tag)
            .collect();
        in_flight.sort_unstable();

        // Newest first so the oldest ends up at the head of the queue
        for tag in in_flight.into_iter().rev() {
            if let Some((_, message)) = queue.unacked.remove(&tag) {
                queue.requeue_front(message);
            }
        }
        debug!("consumer {} detached from {}", self.consumer_id, self.queue);
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more words
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| words_match(rest, &key[skip..])),
        Some((&"*", rest)) => key
            .split_first()
            .is_some_and(|(_, key_rest)| words_match(rest, key_rest)),
        Some((word, rest)) => key
            .split_first()
            .is_some_and(|(first, key_rest)| first == word && words_match(rest, key_rest)),
    }
}
