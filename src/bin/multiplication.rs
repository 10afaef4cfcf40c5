//--------------------------------------------------------------------------------------------------
// MULTIPLICATION SERVICE (PRODUCER)
//--------------------------------------------------------------------------------------------------
// Checks one attempt at a multiplication challenge and publishes the resulting challenge solved
// event to the attempts exchange. Only the exchange is declared here; the queue and its binding
// belong to the gamification service.
//
// | Step            | Call                                        |
// |-----------------|---------------------------------------------|
// | configuration   | Config::try_from_env                        |
// | connection      | BrokerConnection::connect                   |
// | topology        | ensure_exchange                             |
// | publish         | ChallengeEventPublisher::challenge_solved   |
//--------------------------------------------------------------------------------------------------

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use challenge_events::{
    BrokerConnection, ChallengeAttempt, ChallengeEventPublisher, Config, User, ensure_exchange,
};

/// Command line arguments for the multiplication service
#[derive(Parser, Debug)]
#[command(author, version, about = "Submits a multiplication attempt and publishes its outcome")]
struct Args {
    /// Attempt identifier
    #[arg(long, default_value = "1")]
    attempt_id: i64,

    /// User identifier
    #[arg(long, default_value = "1")]
    user_id: i64,

    /// User alias shown by the gamification service
    #[arg(long, default_value = "anonymous")]
    alias: String,

    /// First factor
    #[arg(short = 'a', long)]
    factor_a: i32,

    /// Second factor
    #[arg(short = 'b', long)]
    factor_b: i32,

    /// The user's answer
    #[arg(short, long)]
    guess: i32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = Config::try_from_env()
        .context("failed to load configuration")?
        .with_app_id("multiplication");

    let connection = BrokerConnection::connect(&config.broker_settings())
        .await
        .context("failed to connect to the broker")?;

    let topology = connection.topology().await?;
    ensure_exchange(&topology, &config.topology())
        .await
        .context("failed to declare the attempts exchange")?;
    topology.close().await?;

    let publisher = ChallengeEventPublisher::new(connection.exchange_sink(&config.exchange).await?);

    let attempt = ChallengeAttempt::verified(
        args.attempt_id,
        User::new(args.user_id, &args.alias),
        args.factor_a,
        args.factor_b,
        args.guess,
    );
    info!(
        "Attempt {}: {} x {} = {} is {}",
        attempt.id,
        attempt.factor_a,
        attempt.factor_b,
        attempt.result_attempt,
        if attempt.correct { "correct" } else { "wrong" }
    );

    let event = publisher
        .challenge_solved(&attempt)
        .await
        .context("failed to publish challenge solved event")?;
    info!(
        "Published attempt {} with routing key {}",
        event.attempt_id(),
        event.routing_key()
    );

    publisher.into_sink().close().await?;
    connection.close().await?;
    Ok(())
}
