// Expose the modules
pub mod broker;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod events;
pub mod publisher;
pub mod topology;

// Re-export key types for easier usage
pub use broker::memory::InMemoryBroker;
pub use broker::{Delivery, DeliveryStream, ExchangeSink, OutboundMessage, TopologyDeclarer};
pub use config::Config;
pub use connection::{BrokerConnection, BrokerSettings};
pub use consumer::{
    ChallengeSolvedHandler, ConsumerDispatcher, DispatchOutcome, DispatchStats,
    consume_with_resubscribe,
};
pub use error::{
    ConfigError, ConnectionError, DecodeError, DeliveryError, HandlerError, HandlerResult,
    PublishError, TopologyError,
};
pub use events::{ChallengeAttempt, ChallengeSolvedEvent, User};
pub use publisher::{ChallengeEventPublisher, routing_key_for};
pub use topology::{TopologyConfig, TopologyHandle, ensure_exchange, ensure_topology};
