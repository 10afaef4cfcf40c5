//--------------------------------------------------------------------------------------------------
// CONSUMER DISPATCHER
//--------------------------------------------------------------------------------------------------
// | Name                     | Description                                 | Key Methods       |
// |--------------------------|---------------------------------------------|-------------------|
// | ChallengeSolvedHandler   | Domain reaction to a solved challenge       | handle            |
// | ConsumerDispatcher       | Drains one queue, settles every delivery    | dispatch, run     |
// | DispatchOutcome          | What happened to a single delivery          |                   |
// | DispatchStats            | Counters over the dispatcher's lifetime     |                   |
// | consume_with_resubscribe | Reopens the stream whenever it is lost      |                   |
//
// Per delivery:
//   RECEIVED -> DECODED -> handler ok      -> ack
//   RECEIVED -> decode failed              -> reject, no requeue
//   RECEIVED -> DECODED -> handler failed  -> reject, no requeue
// A failing message never stops the loop. Rejected messages are dropped by the broker.
// A stream that ends before shutdown (lost connection) is replaced by a fresh subscription.
//--------------------------------------------------------------------------------------------------

use std::any::Any;
use std::fmt::Display;
use std::ops::AddAssign;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Delivery, DeliveryStream};
use crate::error::{HandlerError, HandlerResult, error_chain};
use crate::events::ChallengeSolvedEvent;

/// Reacts to challenge solved events.
///
/// Returning an error rejects the message without requeue, so a handler should only fail for
/// events it will never be able to process.
#[async_trait]
pub trait ChallengeSolvedHandler: Send + Sync {
    async fn handle(&self, event: &ChallengeSolvedEvent) -> HandlerResult;
}

#[async_trait]
impl<H: ChallengeSolvedHandler + ?Sized> ChallengeSolvedHandler for Arc<H> {
    async fn handle(&self, event: &ChallengeSolvedEvent) -> HandlerResult {
        (**self).handle(event).await
    }
}

/// Final state of one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handled and acknowledged
    Acknowledged { attempt_id: i64 },
    /// Payload could not be decoded, rejected without requeue
    RejectedUndecodable,
    /// Handler failed, rejected without requeue
    RejectedByHandler { attempt_id: i64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub received: u64,
    pub acknowledged: u64,
    pub rejected_undecodable: u64,
    pub rejected_by_handler: u64,
    /// Acks or rejects the broker did not accept
    pub settle_failures: u64,
}

impl AddAssign for DispatchStats {
    fn add_assign(&mut self, other: DispatchStats) {
        self.received += other.received;
        self.acknowledged += other.acknowledged;
        self.rejected_undecodable += other.rejected_undecodable;
        self.rejected_by_handler += other.rejected_by_handler;
        self.settle_failures += other.settle_failures;
    }
}

/// Drains one queue through a handler, one delivery at a time.
pub struct ConsumerDispatcher<S, H> {
    queue: String,
    stream: S,
    handler: H,
    stats: DispatchStats,
}

impl<S, H> ConsumerDispatcher<S, H>
where
    S: DeliveryStream,
    H: ChallengeSolvedHandler,
{
    /// Creates a dispatcher for deliveries coming from `queue`.
    ///
    /// # Arguments
    /// * `queue` - Queue name, used in logs
    /// * `stream` - Deliveries with manual acknowledgement
    /// * `handler` - Domain handler invoked for every decoded event
    pub fn new(queue: &str, stream: S, handler: H) -> Self {
        Self {
            queue: queue.to_owned(),
            stream,
            handler,
            stats: DispatchStats::default(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Decodes, handles and settles a single delivery
    pub async fn dispatch(&mut self, delivery: Delivery) -> DispatchOutcome {
        self.stats.received += 1;
        let delivery_tag = delivery.delivery_tag;

        if delivery.redelivered {
            warn!(
                "Message {} on {} is a redelivery",
                delivery_tag, delivery.routing_key
            );
        }

        let event = match ChallengeSolvedEvent::decode(&delivery.body) {
            Ok(event) => event,
            Err(err) => {
                error!(
                    "Rejecting message {} from {}: {}",
                    delivery_tag, self.queue, err
                );
                self.settle(delivery_tag, false).await;
                self.stats.rejected_undecodable += 1;
                return DispatchOutcome::RejectedUndecodable;
            }
        };

        let attempt_id = event.attempt_id();
        info!(
            "Received challenge solved event for attempt {} (user {}, correct: {})",
            attempt_id,
            event.user_id(),
            event.is_correct()
        );

        match self.invoke_handler(&event).await {
            Ok(()) => {
                self.settle(delivery_tag, true).await;
                self.stats.acknowledged += 1;
                DispatchOutcome::Acknowledged { attempt_id }
            }
            Err(err) => {
                error!(
                    "Handler failed for attempt {}, rejecting: {}",
                    attempt_id,
                    error_chain(&err)
                );
                self.settle(delivery_tag, false).await;
                self.stats.rejected_by_handler += 1;
                DispatchOutcome::RejectedByHandler { attempt_id }
            }
        }
    }

    /// Waits for the next delivery and dispatches it. `None` once the stream has ended.
    pub async fn dispatch_next(&mut self) -> Option<DispatchOutcome> {
        let delivery = self.stream.next_delivery().await?;
        Some(self.dispatch(delivery).await)
    }

    /// Dispatches deliveries until `shutdown` is cancelled or the stream ends, then closes the
    /// stream.
    ///
    /// A delivery already being handled is settled before the loop checks for shutdown. Anything
    /// still unacknowledged when the stream closes is redelivered by the broker.
    ///
    /// # Returns
    /// Counters for every delivery seen
    pub async fn run(mut self, shutdown: CancellationToken) -> DispatchStats {
        info!("Consuming challenge solved events from {}", self.queue);

        loop {
            let next = tokio::select! {
                biased;

                _ = shutdown.cancelled() => None,
                delivery = self.stream.next_delivery() => Some(delivery),
            };

            match next {
                Some(Some(delivery)) => {
                    self.dispatch(delivery).await;
                }
                Some(None) => {
                    warn!("Delivery stream for {} ended", self.queue);
                    break;
                }
                None => {
                    info!("Shutdown requested, stopping consumer on {}", self.queue);
                    break;
                }
            }
        }

        let stats = self.stats;
        if let Err(err) = self.stream.close().await {
            warn!("Failed to close consumer on {}: {}", self.queue, err);
        }

        info!(
            "Consumer on {} stopped: {} received, {} acked, {} undecodable, {} failed",
            self.queue,
            stats.received,
            stats.acknowledged,
            stats.rejected_undecodable,
            stats.rejected_by_handler
        );
        stats
    }

    async fn invoke_handler(&self, event: &ChallengeSolvedEvent) -> HandlerResult {
        match AssertUnwindSafe(self.handler.handle(event))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(HandlerError::new(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }
    }

    async fn settle(&mut self, delivery_tag: u64, ack: bool) {
        let result = if ack {
            self.stream.ack(delivery_tag).await
        } else {
            self.stream.reject(delivery_tag, false).await
        };

        match result {
            Ok(()) => debug!(
                "Message {} {}",
                delivery_tag,
                if ack { "acked" } else { "rejected" }
            ),
            Err(err) => {
                self.stats.settle_failures += 1;
                error!(
                    "Failed to {} message {} on {}: {}",
                    if ack { "ack" } else { "reject" },
                    delivery_tag,
                    self.queue,
                    err
                );
            }
        }
    }
}

/// Consumes `queue` until `shutdown` is cancelled, subscribing again whenever the stream ends.
///
/// A stream ends early when the connection or channel behind it is lost. `subscribe` is then
/// called for a fresh stream after `retry_delay`, and a failed subscription is retried at the
/// same pace. Messages left unacknowledged by the lost stream are redelivered by the broker to
/// the new one.
///
/// # Arguments
/// * `queue` - Queue name, used in logs
/// * `handler` - Shared by every dispatcher, so state survives resubscription
/// * `subscribe` - Opens a new stream (reconnecting first if needed)
/// * `retry_delay` - Pause before each resubscription
/// * `shutdown` - Stops the loop, including a pending retry
///
/// # Returns
/// Counters summed over every stream
pub async fn consume_with_resubscribe<S, H, E, F, Fut>(
    queue: &str,
    handler: H,
    mut subscribe: F,
    retry_delay: Duration,
    shutdown: CancellationToken,
) -> DispatchStats
where
    S: DeliveryStream,
    H: ChallengeSolvedHandler + Clone,
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<S, E>>,
{
    let mut total = DispatchStats::default();
    let mut subscriptions: u64 = 0;

    loop {
        let subscribed = tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            subscribed = subscribe() => subscribed,
        };

        match subscribed {
            Ok(stream) => {
                subscriptions += 1;
                if subscriptions > 1 {
                    info!("Resubscribed to {} (subscription {})", queue, subscriptions);
                }
                let dispatcher = ConsumerDispatcher::new(queue, stream, handler.clone());
                total += dispatcher.run(shutdown.clone()).await;

                if shutdown.is_cancelled() {
                    break;
                }
                warn!(
                    "Lost the consumer on {}, resubscribing in {:?}",
                    queue, retry_delay
                );
            }
            Err(err) => {
                error!(
                    "Failed to subscribe to {}: {}, retrying in {:?}",
                    queue, err, retry_delay
                );
            }
        }

        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(retry_delay) => {}
        }
    }

    total
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::broker::memory::{InMemoryBroker, MemoryDeliveryStream};
    use crate::broker::{ExchangeSink, OutboundMessage};
    use crate::error::ConnectionError;
    use crate::topology::{TopologyConfig, ensure_topology};

    struct CountingHandler {
        handled: AtomicUsize,
    }

    impl CountingHandler {
        fn new() -> Self {
            Self {
                handled: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ChallengeSolvedHandler for CountingHandler {
        async fn handle(&self, _event: &ChallengeSolvedEvent) -> HandlerResult {
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Fails for one attempt id, succeeds for the rest
    struct FailingHandler {
        fail_for: i64,
    }

    #[async_trait]
    impl ChallengeSolvedHandler for FailingHandler {
        async fn handle(&self, event: &ChallengeSolvedEvent) -> HandlerResult {
            if event.attempt_id() == self.fail_for {
                return Err(HandlerError::new(format!(
                    "cannot score attempt {}",
                    event.attempt_id()
                )));
            }
            Ok(())
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl ChallengeSolvedHandler for PanickingHandler {
        async fn handle(&self, _event: &ChallengeSolvedEvent) -> HandlerResult {
            panic!("score table corrupted");
        }
    }

    async fn setup() -> (InMemoryBroker, MemoryDeliveryStream) {
        let broker = InMemoryBroker::new();
        let config = TopologyConfig::default();
        ensure_topology(&broker, &config).await.unwrap();
        let stream = broker.consume(&config.queue).unwrap();
        (broker, stream)
    }

    async fn publish_raw(broker: &InMemoryBroker, routing_key: &str, payload: &[u8]) {
        broker
            .exchange_sink("attempts.topic")
            .send(OutboundMessage {
                routing_key: routing_key.to_owned(),
                payload: payload.to_vec(),
                message_id: uuid::Uuid::new_v4().to_string(),
                correlation_id: String::new(),
                timestamp: chrono::Utc::now(),
            })
            .await
            .unwrap();
    }

    async fn wait_for_acks(broker: &InMemoryBroker, acked: u64) {
        for _ in 0..100 {
            if broker.queue_stats("gamification.queue").unwrap().acked >= acked {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue never reached {} acks", acked);
    }

    async fn publish_event(broker: &InMemoryBroker, attempt_id: i64) {
        let event = ChallengeSolvedEvent::new(attempt_id, true, 30, 40, 10, "john");
        publish_raw(broker, "attempt.correct", &event.encode().unwrap()).await;
    }

    #[tokio::test]
    async fn handled_message_is_acked() {
        let (broker, stream) = setup().await;
        let mut dispatcher =
            ConsumerDispatcher::new("gamification.queue", stream, CountingHandler::new());
        publish_event(&broker, 1).await;

        let outcome = dispatcher.dispatch_next().await.unwrap();

        assert_eq!(outcome, DispatchOutcome::Acknowledged { attempt_id: 1 });
        assert_eq!(dispatcher.handler().handled.load(Ordering::SeqCst), 1);
        let stats = broker.queue_stats("gamification.queue").unwrap();
        assert_eq!((stats.acked, stats.rejected, stats.unacked), (1, 0, 0));
    }

    #[tokio::test]
    async fn undecodable_message_is_rejected_without_calling_handler() {
        let (broker, stream) = setup().await;
        let mut dispatcher =
            ConsumerDispatcher::new("gamification.queue", stream, CountingHandler::new());
        publish_raw(&broker, "attempt.correct", b"{\"attemptId\":").await;

        let outcome = dispatcher.dispatch_next().await.unwrap();

        assert_eq!(outcome, DispatchOutcome::RejectedUndecodable);
        assert_eq!(dispatcher.handler().handled.load(Ordering::SeqCst), 0);
        let stats = broker.queue_stats("gamification.queue").unwrap();
        assert_eq!((stats.acked, stats.rejected, stats.ready), (0, 1, 0));
    }

    #[tokio::test]
    async fn handler_failure_rejects_and_loop_continues() {
        let (broker, stream) = setup().await;
        let mut dispatcher =
            ConsumerDispatcher::new("gamification.queue", stream, FailingHandler { fail_for: 1 });
        publish_event(&broker, 1).await;
        publish_event(&broker, 2).await;

        assert_eq!(
            dispatcher.dispatch_next().await.unwrap(),
            DispatchOutcome::RejectedByHandler { attempt_id: 1 }
        );
        assert_eq!(
            dispatcher.dispatch_next().await.unwrap(),
            DispatchOutcome::Acknowledged { attempt_id: 2 }
        );

        let stats = broker.queue_stats("gamification.queue").unwrap();
        assert_eq!((stats.acked, stats.rejected, stats.ready), (1, 1, 0));
    }

    #[tokio::test]
    async fn handler_panic_is_a_rejection() {
        let (broker, stream) = setup().await;
        let mut dispatcher =
            ConsumerDispatcher::new("gamification.queue", stream, PanickingHandler);
        publish_event(&broker, 7).await;

        assert_eq!(
            dispatcher.dispatch_next().await.unwrap(),
            DispatchOutcome::RejectedByHandler { attempt_id: 7 }
        );
        assert_eq!(broker.queue_stats("gamification.queue").unwrap().rejected, 1);
    }

    #[tokio::test]
    async fn shared_handler_through_arc() {
        let (broker, stream) = setup().await;
        let handler = Arc::new(CountingHandler::new());
        let mut dispatcher =
            ConsumerDispatcher::new("gamification.queue", stream, Arc::clone(&handler));
        publish_event(&broker, 1).await;

        dispatcher.dispatch_next().await.unwrap();
        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let (broker, stream) = setup().await;
        let handler = Arc::new(CountingHandler::new());
        let dispatcher =
            ConsumerDispatcher::new("gamification.queue", stream, Arc::clone(&handler));
        let shutdown = CancellationToken::new();

        for attempt_id in 1..=3 {
            publish_event(&broker, attempt_id).await;
        }
        publish_raw(&broker, "attempt.correct", b"garbage").await;

        let running = tokio::spawn(dispatcher.run(shutdown.clone()));
        for _ in 0..50 {
            if broker.queue_stats("gamification.queue").unwrap().ready == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        let stats = tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(stats.received, 4);
        assert_eq!(stats.acknowledged, 3);
        assert_eq!(stats.rejected_undecodable, 1);
        assert_eq!(stats.settle_failures, 0);
        assert_eq!(handler.handled.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_ends_with_the_stream() {
        let (broker, stream) = setup().await;
        let dispatcher =
            ConsumerDispatcher::new("gamification.queue", stream, CountingHandler::new());

        let running = tokio::spawn(dispatcher.run(CancellationToken::new()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.shutdown();

        let stats = tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats, DispatchStats::default());
    }

    #[tokio::test]
    async fn lost_stream_is_replaced_until_shutdown() {
        let first = setup().await.0;
        let second = setup().await.0;
        publish_event(&first, 1).await;
        publish_event(&second, 2).await;

        // The first subscription attempt fails, as if the broker were still down
        let pending = Arc::new(parking_lot::Mutex::new(VecDeque::from([
            None,
            Some(first.clone()),
            Some(second.clone()),
        ])));
        let calls = Arc::new(AtomicUsize::new(0));
        let subscribe = {
            let pending = Arc::clone(&pending);
            let calls = Arc::clone(&calls);
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                let next = pending.lock().pop_front().flatten();
                async move {
                    match next {
                        Some(broker) => broker.consume("gamification.queue"),
                        None => Err(ConnectionError::Closed),
                    }
                }
            }
        };

        let handler = Arc::new(CountingHandler::new());
        let shutdown = CancellationToken::new();
        let running = tokio::spawn(consume_with_resubscribe(
            "gamification.queue",
            Arc::clone(&handler),
            subscribe,
            Duration::from_millis(5),
            shutdown.clone(),
        ));

        wait_for_acks(&first, 1).await;
        first.shutdown();
        wait_for_acks(&second, 1).await;
        shutdown.cancel();

        let stats = tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.acknowledged, 2);
        assert_eq!(handler.handled.load(Ordering::SeqCst), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_pending_resubscribe() {
        let shutdown = CancellationToken::new();
        let running = tokio::spawn(consume_with_resubscribe(
            "gamification.queue",
            Arc::new(CountingHandler::new()),
            || async { Err::<MemoryDeliveryStream, _>(ConnectionError::Closed) },
            Duration::from_secs(60),
            shutdown.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.cancel();

        let stats = tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats, DispatchStats::default());
    }

    #[test]
    fn stats_add_up() {
        let mut total = DispatchStats {
            received: 2,
            acknowledged: 1,
            rejected_undecodable: 1,
            ..Default::default()
        };
        total += DispatchStats {
            received: 3,
            acknowledged: 2,
            rejected_by_handler: 1,
            settle_failures: 1,
            ..Default::default()
        };
        assert_eq!(
            total,
            DispatchStats {
                received: 5,
                acknowledged: 3,
                rejected_undecodable: 1,
                rejected_by_handler: 1,
                settle_failures: 1,
            }
        );
    }

    #[test]
    fn panic_messages() {
        let boxed: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(boxed.as_ref()), "static message");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(boxed.as_ref()), "owned message");

        let boxed: Box<dyn Any + Send> = Box::new(42_u32);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
