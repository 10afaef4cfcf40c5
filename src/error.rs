//--------------------------------------------------------------------------------------------------
// ERRORS
//--------------------------------------------------------------------------------------------------
// | Name             | Raised by                         | Effect                               |
// |------------------|-----------------------------------|--------------------------------------|
// | ConnectionError  | BrokerConnection, broker adapters | fatal at startup                     |
// | TopologyError    | ensure_topology / ensure_exchange | fatal at startup                     |
// | PublishError     | ChallengeEventPublisher           | returned to the caller, no retry     |
// | DecodeError      | ChallengeSolvedEvent::decode      | message rejected without requeue     |
// | HandlerError     | ChallengeSolvedHandler            | message rejected without requeue     |
// | DeliveryError    | DeliveryStream ack / reject       | logged, consumer keeps running       |
// | ConfigError      | Config::try_from_env              | fatal at startup                     |
//--------------------------------------------------------------------------------------------------

use std::error::Error as StdError;
use std::fmt::{self, Write};

use rabbitmq::RabbitMQError;
use thiserror::Error;

/// The broker could not be reached or the connection is gone.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connection string could not be parsed; retrying will not help.
    #[error("invalid broker URI: {0}")]
    InvalidUri(String),

    /// Every connection attempt failed.
    #[error("broker unreachable after {attempts} attempt(s)")]
    Unreachable {
        attempts: u32,
        #[source]
        source: RabbitMQError,
    },

    /// A channel could not be opened on an otherwise open connection.
    #[error("failed to open broker channel: {0}")]
    Channel(String),

    /// The connection was closed.
    #[error("broker connection is closed")]
    Closed,
    /// Closing the connection at shutdown failed.
    #[error("failed to close broker connection: {0}")]
    Close(#[source] RabbitMQError),
}

/// Declaring an exchange, a queue or a binding failed.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("failed to declare exchange {exchange}: {reason}")]
    Exchange { exchange: String, reason: String },

    #[error("failed to declare queue {queue}: {reason}")]
    Queue { queue: String, reason: String },

    #[error("failed to bind queue {queue} to exchange {exchange} on {routing_key}: {reason}")]
    Binding {
        queue: String,
        exchange: String,
        routing_key: String,
        reason: String,
    },

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// A single publish attempt failed.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("exchange {0} does not exist")]
    ExchangeNotFound(String),

    #[error("broker rejected publish: {0}")]
    Broker(#[from] RabbitMQError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// The payload is not a well-formed challenge solved event.
#[derive(Debug, Error)]
#[error("malformed challenge solved payload: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// The domain handler could not process an event.
#[derive(Debug)]
pub struct HandlerError {
    message: String,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for HandlerError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|source| source as &(dyn StdError + 'static))
    }
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Acknowledging or rejecting a delivery failed.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    #[error(transparent)]
    Broker(#[from] RabbitMQError),
}

/// Configuration could not be loaded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to load environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for environment variable {name}")]
    Invalid { name: &'static str, value: String },
}

/// Result type returned by event handlers.
pub type HandlerResult = Result<(), HandlerError>;

/// Renders an error followed by its chain of causes, one per `caused by:` segment.
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();

    while let Some(cause) = source {
        let _ = write!(rendered, ": caused by: {}", cause);
        source = cause.source();
    }

    rendered
}
