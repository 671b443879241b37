//! Game server: announces the pause state and records the shared game log.

use crate::routing::{
    declare_game_exchanges, game_log_topology, GameLog, PlayingState, EXCHANGE_PERIL_DIRECT,
    PAUSE_KEY,
};
use async_trait::async_trait;
use core_config::{AmqpConfig, Environment, FromEnv};
use eyre::{Result, WrapErr};
use pubsub::{
    AckDecision, AmqpBroker, Broker, BrokerChannel, Encoding, Handler, Publisher,
    SubscribeOptions, Subscription, SubscriptionStats,
};
use tracing::{debug, info};

/// Acks every game log entry after logging it.
pub struct GameLogHandler;

#[async_trait]
impl Handler<GameLog> for GameLogHandler {
    async fn handle(&self, log: GameLog) -> AckDecision {
        info!(
            username = %log.username,
            at = %log.current_time,
            "{}",
            log.message
        );
        AckDecision::Ack
    }
}

/// A started server.
pub struct Server<C: BrokerChannel> {
    publisher: Publisher<C>,
    game_logs: Subscription,
}

impl<C: BrokerChannel> Server<C> {
    /// Declare the game exchanges, subscribe to the game log and broadcast
    /// the initial pause.
    pub async fn start<B>(broker: &B, config: &AmqpConfig) -> Result<Self>
    where
        B: Broker<Channel = C>,
    {
        let channel = broker
            .open_channel()
            .await
            .wrap_err("Failed to open channel")?;
        declare_game_exchanges(&channel)
            .await
            .wrap_err("Failed to declare game exchanges")?;

        let mut options = SubscribeOptions::default().with_consumer_tag("peril-server-game-logs");
        if let Some(prefetch) = config.prefetch {
            options = options.with_prefetch(prefetch);
        }
        let game_logs = pubsub::subscribe(
            broker,
            &game_log_topology(),
            Encoding::Binary,
            GameLogHandler,
            options,
        )
        .await
        .wrap_err("Failed to subscribe to game logs")?;

        let server = Self {
            publisher: Publisher::new(channel, EXCHANGE_PERIL_DIRECT),
            game_logs,
        };
        server.set_paused(true).await?;

        Ok(server)
    }

    /// Broadcast the pause state to every client.
    pub async fn set_paused(&self, is_paused: bool) -> Result<()> {
        self.publisher
            .send(PAUSE_KEY, &PlayingState { is_paused })
            .await
            .wrap_err("Failed to publish pause state")?;
        info!(is_paused, "Pause state published");
        Ok(())
    }

    /// Stop consuming and close the publishing channel.
    pub async fn shutdown(self) -> SubscriptionStats {
        let stats = self.game_logs.shutdown().await;
        if let Err(e) = self.publisher.channel().close().await {
            debug!(error = %e, "Publisher channel already closed");
        }
        stats
    }
}

/// Run the server until SIGINT/SIGTERM.
///
/// Connection or setup failures are fatal.
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    info!("Starting Peril server...");

    let config = AmqpConfig::from_env().wrap_err("Invalid AMQP configuration")?;
    let broker = AmqpBroker::connect(&config.url)
        .await
        .wrap_err_with(|| format!("Failed to connect to RabbitMQ at {}", config.url))?;
    info!("Successfully connected to RabbitMQ");

    let server = Server::start(&broker, &config).await?;

    crate::signal::shutdown_signal().await?;

    info!("Server shutting down...");
    let stats = server.shutdown().await;
    info!(logged = stats.acked, "Game log subscription stopped");

    broker
        .close()
        .await
        .wrap_err("Failed to close RabbitMQ connection")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{game_log_key, GAME_LOG_SLUG};
    use pubsub::memory::MemoryBroker;
    use pubsub::{publish_binary, publish_json};
    use std::time::Duration;
    use test_utils::assertions::assert_eventually;

    #[tokio::test]
    async fn test_start_publishes_pause_and_consumes_logs() {
        let broker = MemoryBroker::new();

        // A client queue bound before the server starts sees the broadcast.
        let channel = broker.open_channel().await.unwrap();
        declare_game_exchanges(&channel).await.unwrap();
        pubsub::declare_and_bind_on(&channel, &crate::routing::pause_topology("alice"))
            .await
            .unwrap();

        let server = Server::start(&broker, &AmqpConfig::default()).await.unwrap();
        assert_eq!(broker.queue_depth("pause.alice"), Some(1));
        assert_eq!(broker.consumer_count(GAME_LOG_SLUG), Some(1));

        let log = GameLog::new("alice", "alice spawned");
        publish_binary(&channel, crate::routing::EXCHANGE_PERIL_TOPIC, &game_log_key("alice"), &log)
            .await
            .unwrap();

        assert_eventually(
            || broker.queue_depth(GAME_LOG_SLUG) == Some(0) && broker.unacked_count(GAME_LOG_SLUG) == Some(0),
            Duration::from_secs(2),
            "game log consumed",
        )
        .await;

        let stats = server.shutdown().await;
        assert_eq!(stats.acked, 1);
        assert!(broker.queue_exists(GAME_LOG_SLUG));
    }

    #[tokio::test]
    async fn test_undecodable_log_is_skipped() {
        let broker = MemoryBroker::new();
        let server = Server::start(&broker, &AmqpConfig::default().with_prefetch(5))
            .await
            .unwrap();

        // A JSON payload on the binary log queue does not decode.
        let channel = broker.open_channel().await.unwrap();
        publish_json(&channel, crate::routing::EXCHANGE_PERIL_TOPIC, "game_logs.bob", &"not a log")
            .await
            .unwrap();

        assert_eventually(
            || broker.unacked_count(GAME_LOG_SLUG) == Some(1),
            Duration::from_secs(2),
            "malformed log delivered",
        )
        .await;

        let stats = server.shutdown().await;
        assert_eq!(stats.decode_failures, 1);
        assert_eq!(stats.acked, 0);
    }

    #[tokio::test]
    async fn test_set_paused_resumes() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();
        declare_game_exchanges(&channel).await.unwrap();
        pubsub::declare_and_bind_on(&channel, &crate::routing::pause_topology("bob"))
            .await
            .unwrap();

        let server = Server::start(&broker, &AmqpConfig::default()).await.unwrap();
        server.set_paused(false).await.unwrap();
        assert_eq!(broker.queue_depth("pause.bob"), Some(2));

        server.shutdown().await;
    }
}
