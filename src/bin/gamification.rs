//--------------------------------------------------------------------------------------------------
// GAMIFICATION SERVICE (CONSUMER)
//--------------------------------------------------------------------------------------------------
// Declares the attempts topology, then consumes challenge solved events from the gamification
// queue until Ctrl-C, keeping a score per user.
//
// A lost connection does not stop the service. The consumer reconnects, redeclares the topology
// and subscribes again, keeping the scores it already holds.
//
// | Component    | Description                                         |
// |--------------|-----------------------------------------------------|
// | ScoreBoard   | Handler adding points for every correct attempt     |
// | Session      | One connection and the consumer running on it       |
// | main         | Wiring: config, signal, resubscribing consumer      |
//--------------------------------------------------------------------------------------------------

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use challenge_events::broker::amqp::AmqpDeliveryStream;
use challenge_events::{
    BrokerConnection, ChallengeSolvedEvent, ChallengeSolvedHandler, Config, Delivery,
    DeliveryError, DeliveryStream, HandlerResult, consume_with_resubscribe, ensure_topology,
};

const POINTS_PER_CORRECT_ATTEMPT: u32 = 10;

/// Running score per user
#[derive(Default)]
struct ScoreBoard {
    scores: Mutex<HashMap<i64, (String, u32)>>,
}

impl ScoreBoard {
    fn leaders(&self) -> Vec<(String, u32)> {
        let mut leaders: Vec<(String, u32)> = self.scores.lock().values().cloned().collect();
        leaders.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        leaders
    }
}

#[async_trait]
impl ChallengeSolvedHandler for ScoreBoard {
    async fn handle(&self, event: &ChallengeSolvedEvent) -> HandlerResult {
        if !event.is_correct() {
            // Only reachable if someone binds attempt.wrong to the queue
            info!("Attempt {} was wrong, no points", event.attempt_id());
            return Ok(());
        }

        let mut scores = self.scores.lock();
        let entry = scores
            .entry(event.user_id())
            .or_insert_with(|| (event.user_alias().to_owned(), 0));
        entry.1 += POINTS_PER_CORRECT_ATTEMPT;

        info!(
            "{} scored {} points for attempt {}, total {}",
            event.user_alias(),
            POINTS_PER_CORRECT_ATTEMPT,
            event.attempt_id(),
            entry.1
        );
        Ok(())
    }
}

/// A consumer together with the connection it runs on, so both go away together
struct Session {
    connection: BrokerConnection,
    stream: AmqpDeliveryStream,
}

impl Session {
    /// Connects, declares the topology and subscribes to the gamification queue
    async fn open(config: &Config) -> Result<Session> {
        let connection = BrokerConnection::connect(&config.broker_settings())
            .await
            .context("failed to connect to the broker")?;

        let topology = connection.topology().await?;
        let handle = ensure_topology(&topology, &config.topology())
            .await
            .context("failed to declare the attempts topology")?;
        topology.close().await?;

        let stream = connection.subscribe(handle.queue()).await?;
        Ok(Session { connection, stream })
    }
}

#[async_trait]
impl DeliveryStream for Session {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        self.stream.next_delivery().await
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), DeliveryError> {
        self.stream.ack(delivery_tag).await
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), DeliveryError> {
        self.stream.reject(delivery_tag, requeue).await
    }

    async fn close(self) -> Result<(), DeliveryError> {
        let closed = self.stream.close().await;
        // After a lost connection both of these fail, which is expected
        if let Err(err) = self.connection.close().await {
            warn!("Failed to close the broker connection: {}", err);
        }
        closed
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::try_from_env()
        .context("failed to load configuration")?
        .with_app_id("gamification");

    // Startup failures end the process, later losses are retried
    let mut first = Some(Session::open(&config).await?);
    let config = &config;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received"),
            Err(err) => error!("Failed to listen for Ctrl-C: {}", err),
        }
        signal.cancel();
    });

    let scores = Arc::new(ScoreBoard::default());
    let stats = consume_with_resubscribe(
        &config.queue,
        Arc::clone(&scores),
        || {
            let ready = first.take();
            async move {
                match ready {
                    Some(session) => Ok(session),
                    None => Session::open(config).await,
                }
            }
        },
        config.connect_retry_delay,
        shutdown,
    )
    .await;

    info!(
        "Processed {} message(s): {} acked, {} rejected",
        stats.received,
        stats.acknowledged,
        stats.rejected_undecodable + stats.rejected_by_handler
    );
    for (alias, score) in scores.leaders() {
        info!("{}: {}", alias, score);
    }
    Ok(())
}
