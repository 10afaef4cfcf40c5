use std::time::Duration;

use rabbitmq::{DELIVERY_MODE_PERSISTENT, RabbitConnection, RabbitMQError};
use tracing::{info, warn};

use crate::broker::amqp::{AmqpDeliveryStream, AmqpExchangeSink, AmqpTopology};
use crate::error::ConnectionError;

pub const DEFAULT_CONNECT_RETRIES: u32 = 5;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);
/// One unacknowledged message per consumer at a time
pub const DEFAULT_PREFETCH: u16 = 1;

/// Where and how to connect to the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub url: String,
    pub app_id: String,
    /// Extra attempts after the first failed connect
    pub connect_retries: u32,
    pub retry_delay: Duration,
    pub prefetch: u16,
}

impl BrokerSettings {
    pub fn new(url: &str, app_id: &str) -> Self {
        Self {
            url: url.to_owned(),
            app_id: app_id.to_owned(),
            connect_retries: DEFAULT_CONNECT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            prefetch: DEFAULT_PREFETCH,
        }
    }

    pub fn with_retries(mut self, connect_retries: u32, retry_delay: Duration) -> Self {
        self.connect_retries = connect_retries;
        self.retry_delay = retry_delay;
        self
    }
}

/// One AMQP connection shared by the topology, publishing and consuming channels.
///
/// Connection and channel events (close, blocked, flow) are logged by callbacks registered when
/// the connection and each channel are opened.
pub struct BrokerConnection {
    connection: RabbitConnection,
    settings: BrokerSettings,
}

impl BrokerConnection {
    /// Opens the connection, retrying with a fixed delay while the broker is unreachable.
    ///
    /// # Arguments
    /// * `settings` - Broker URL, app id, retry policy and prefetch
    ///
    /// # Errors
    /// Returns `ConnectionError::InvalidUri` at once for a malformed URL, and
    /// `ConnectionError::Unreachable` once every attempt has failed.
    pub async fn connect(settings: &BrokerSettings) -> Result<Self, ConnectionError> {
        let max_attempts = settings.connect_retries.saturating_add(1);
        let mut attempt = 1;

        loop {
            match RabbitConnection::open(&settings.url, &settings.app_id).await {
                Ok(connection) => {
                    info!("Connected to broker as {}", settings.app_id);
                    return Ok(Self {
                        connection,
                        settings: settings.clone(),
                    });
                }
                Err(RabbitMQError::UriError(reason)) => {
                    return Err(ConnectionError::InvalidUri(reason));
                }
                Err(err) if attempt < max_attempts => {
                    warn!(
                        "Broker connection attempt {}/{} failed: {}, retrying in {:?}",
                        attempt, max_attempts, err, settings.retry_delay
                    );
                    tokio::time::sleep(settings.retry_delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(ConnectionError::Unreachable {
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    /// Channel for declaring the topology
    pub async fn topology(&self) -> Result<AmqpTopology, ConnectionError> {
        let channel = self
            .connection
            .topology_channel()
            .await
            .map_err(|err| ConnectionError::Channel(err.to_string()))?;
        Ok(AmqpTopology::new(channel))
    }

    /// Persistent JSON publisher bound to `exchange`
    pub async fn exchange_sink(&self, exchange: &str) -> Result<AmqpExchangeSink, ConnectionError> {
        let publisher = self
            .connection
            .publisher(exchange, DELIVERY_MODE_PERSISTENT)
            .await
            .map_err(|err| ConnectionError::Channel(err.to_string()))?;
        Ok(AmqpExchangeSink::new(publisher))
    }

    /// Manual-ack consumer on `queue`, limited to the configured prefetch
    pub async fn subscribe(&self, queue: &str) -> Result<AmqpDeliveryStream, ConnectionError> {
        let subscription = self
            .connection
            .subscribe(queue, self.settings.prefetch)
            .await
            .map_err(|err| ConnectionError::Channel(err.to_string()))?;
        Ok(AmqpDeliveryStream::new(subscription))
    }

    pub async fn close(self) -> Result<(), ConnectionError> {
        self.connection.close().await.map_err(ConnectionError::Close)?;
        info!("Broker connection closed");
        Ok(())
    }
}
