use chrono::Utc;
use tracing::{debug, error};
use uuid::Uuid;

use crate::broker::{ExchangeSink, OutboundMessage};
use crate::error::PublishError;
use crate::events::{ChallengeAttempt, ChallengeSolvedEvent, ROUTING_KEY_CORRECT, ROUTING_KEY_WRONG};

/// Routing key for an attempt outcome
pub fn routing_key_for(correct: bool) -> &'static str {
    if correct {
        ROUTING_KEY_CORRECT
    } else {
        ROUTING_KEY_WRONG
    }
}

/// Publishes challenge solved events to the attempts exchange.
///
/// Each call performs exactly one send. Failures are returned to the caller and nothing is
/// retried or buffered. The publisher holds no per-call state, so it can be shared behind an
/// `Arc` when the sink allows it.
pub struct ChallengeEventPublisher<S> {
    sink: S,
}

impl<S: ExchangeSink> ChallengeEventPublisher<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn exchange(&self) -> &str {
        self.sink.exchange()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Publishes one event, routed by its outcome
    ///
    /// # Arguments
    /// * `event` - The event to publish
    ///
    /// # Errors
    /// Returns `PublishError` if the event cannot be encoded or the broker refuses it
    pub async fn publish(&self, event: &ChallengeSolvedEvent) -> Result<(), PublishError> {
        let routing_key = event.routing_key();
        let message = OutboundMessage {
            routing_key: routing_key.to_owned(),
            payload: event.encode()?,
            message_id: Uuid::new_v4().to_string(),
            correlation_id: event.attempt_id().to_string(),
            timestamp: Utc::now(),
        };
        let message_id = message.message_id.clone();

        match self.sink.send(message).await {
            Ok(()) => {
                debug!(
                    "Published attempt {} to {} with key {} (message {})",
                    event.attempt_id(),
                    self.sink.exchange(),
                    routing_key,
                    message_id
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    "Failed to publish attempt {} to {}: {}",
                    event.attempt_id(),
                    self.sink.exchange(),
                    err
                );
                Err(err)
            }
        }
    }

    /// Builds the event for `attempt` and publishes it
    ///
    /// # Errors
    /// Same as [`ChallengeEventPublisher::publish`]
    pub async fn challenge_solved(
        &self,
        attempt: &ChallengeAttempt,
    ) -> Result<ChallengeSolvedEvent, PublishError> {
        let event = ChallengeSolvedEvent::from(attempt);
        self.publish(&event).await?;
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::broker::memory::InMemoryBroker;
    use crate::error::ConnectionError;
    use crate::events::User;
    use crate::topology::{TopologyConfig, ensure_exchange};

    /// Records what would have gone to the broker
    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<OutboundMessage>>,
        fail: bool,
    }

    #[async_trait]
    impl ExchangeSink for RecordingSink {
        fn exchange(&self) -> &str {
            "attempts.topic"
        }

        async fn send(&self, message: OutboundMessage) -> Result<(), PublishError> {
            self.sent.lock().push(message);
            if self.fail {
                return Err(PublishError::Connection(ConnectionError::Closed));
            }
            Ok(())
        }
    }

    #[test]
    fn routing_keys() {
        assert_eq!(routing_key_for(true), "attempt.correct");
        assert_eq!(routing_key_for(false), "attempt.wrong");
    }

    #[tokio::test]
    async fn correct_attempt_is_routed_as_correct() {
        let publisher = ChallengeEventPublisher::new(RecordingSink::default());
        let attempt = ChallengeAttempt::new(1, User::new(10, "john"), 30, 40, 1200, true);

        let event = publisher.challenge_solved(&attempt).await.unwrap();

        let sent = publisher.sink().sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].routing_key, "attempt.correct");
        assert_eq!(sent[0].correlation_id, "1");
        assert_eq!(ChallengeSolvedEvent::decode(&sent[0].payload).unwrap(), event);
        assert_eq!(event, ChallengeSolvedEvent::new(1, true, 30, 40, 10, "john"));
    }

    #[tokio::test]
    async fn wrong_attempt_is_routed_as_wrong() {
        let publisher = ChallengeEventPublisher::new(RecordingSink::default());
        let attempt = ChallengeAttempt::new(2, User::new(10, "john"), 30, 40, 1300, false);

        publisher.challenge_solved(&attempt).await.unwrap();

        let sent = publisher.sink().sent.lock();
        assert_eq!(sent[0].routing_key, "attempt.wrong");
    }

    #[tokio::test]
    async fn every_message_gets_its_own_id() {
        let publisher = ChallengeEventPublisher::new(RecordingSink::default());
        let event = ChallengeSolvedEvent::new(1, true, 30, 40, 10, "john");

        publisher.publish(&event).await.unwrap();
        publisher.publish(&event).await.unwrap();

        let sent = publisher.sink().sent.lock();
        assert_eq!(sent.len(), 2);
        assert_ne!(sent[0].message_id, sent[1].message_id);
        assert!(Uuid::parse_str(&sent[0].message_id).is_ok());
    }

    #[tokio::test]
    async fn failed_send_is_not_retried() {
        let sink = RecordingSink {
            fail: true,
            ..Default::default()
        };
        let publisher = ChallengeEventPublisher::new(sink);
        let event = ChallengeSolvedEvent::new(1, true, 30, 40, 10, "john");

        let result = publisher.publish(&event).await;

        assert!(matches!(result, Err(PublishError::Connection(_))));
        assert_eq!(publisher.sink().sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn publishing_before_exchange_exists_fails() {
        let broker = InMemoryBroker::new();
        let publisher = ChallengeEventPublisher::new(broker.exchange_sink("attempts.topic"));
        let event = ChallengeSolvedEvent::new(1, true, 30, 40, 10, "john");

        let result = publisher.publish(&event).await;
        assert!(matches!(result, Err(PublishError::ExchangeNotFound(_))));

        ensure_exchange(&broker, &TopologyConfig::default())
            .await
            .unwrap();
        publisher.publish(&event).await.unwrap();
        assert_eq!(broker.published().len(), 1);
    }
}
