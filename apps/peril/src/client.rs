//! Game client: follows the server's pause broadcasts on a per-user queue.

use crate::routing::{declare_game_exchanges, pause_topology, PlayingState};
use async_trait::async_trait;
use clap::Parser;
use core_config::{AmqpConfig, Environment, FromEnv};
use eyre::{eyre, Result, WrapErr};
use pubsub::{
    AckDecision, AmqpBroker, Broker, BrokerChannel, Encoding, Handler, SubscribeOptions,
    Subscription, SubscriptionStats,
};
use tokio::sync::watch;
use tracing::{debug, info};

/// Peril game client
#[derive(Parser, Debug)]
#[command(name = "peril_client", version, about)]
pub struct Args {
    /// Player name; the pause queue is `pause.<username>`
    #[arg(short, long)]
    pub username: String,
}

/// Usernames end up in queue names and routing keys.
pub fn validate_username(username: &str) -> Result<&str> {
    let username = username.trim();
    if username.is_empty() {
        return Err(eyre!("Username must not be empty"));
    }
    if username.contains(['.', '*', '#']) || username.contains(char::is_whitespace) {
        return Err(eyre!(
            "Username '{}' must not contain whitespace, '.', '*' or '#'",
            username
        ));
    }
    Ok(username)
}

/// Publishes each pause broadcast into a watch channel and acks it.
pub struct PauseHandler {
    paused: watch::Sender<bool>,
}

impl PauseHandler {
    /// Handler plus the receiver it reports to, starting unpaused.
    pub fn channel() -> (Self, watch::Receiver<bool>) {
        let (paused, rx) = watch::channel(false);
        (Self { paused }, rx)
    }
}

#[async_trait]
impl Handler<PlayingState> for PauseHandler {
    async fn handle(&self, state: PlayingState) -> AckDecision {
        if state.is_paused {
            info!("Game paused");
        } else {
            info!("Game resumed");
        }
        self.paused.send_replace(state.is_paused);
        AckDecision::Ack
    }
}

/// A player's live session.
pub struct Client {
    username: String,
    pause: Subscription,
    paused: watch::Receiver<bool>,
}

impl Client {
    /// Declare and bind `pause.<username>` and start following it.
    pub async fn start<B: Broker>(broker: &B, username: &str, config: &AmqpConfig) -> Result<Self> {
        let username = validate_username(username)?.to_string();

        let channel = broker
            .open_channel()
            .await
            .wrap_err("Failed to open channel")?;
        let declared = declare_game_exchanges(&channel).await;
        if let Err(e) = channel.close().await {
            debug!(error = %e, "Declare channel already closed");
        }
        declared.wrap_err("Failed to declare game exchanges")?;

        let (handler, paused) = PauseHandler::channel();
        let mut options =
            SubscribeOptions::default().with_consumer_tag(format!("peril-client-{username}"));
        if let Some(prefetch) = config.prefetch {
            options = options.with_prefetch(prefetch);
        }

        let pause = pubsub::subscribe(broker, &pause_topology(&username), Encoding::Json, handler, options)
            .await
            .wrap_err_with(|| format!("Failed to subscribe to pause queue for {username}"))?;

        info!(username = %username, queue = %pause.queue(), "Client ready");

        Ok(Self {
            username,
            pause,
            paused,
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Latest pause state seen from the server.
    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Receiver notified on every pause broadcast.
    pub fn paused(&self) -> watch::Receiver<bool> {
        self.paused.clone()
    }

    pub async fn shutdown(self) -> SubscriptionStats {
        self.pause.shutdown().await
    }
}

/// Run the client until SIGINT/SIGTERM.
pub async fn run(args: Args) -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    info!("Starting Peril client...");

    let config = AmqpConfig::from_env().wrap_err("Invalid AMQP configuration")?;
    let broker = AmqpBroker::connect(&config.url)
        .await
        .wrap_err_with(|| format!("Failed to connect to RabbitMQ at {}", config.url))?;

    let client = Client::start(&broker, &args.username, &config).await?;

    crate::signal::shutdown_signal().await?;

    info!(username = %client.username(), "Client shutting down...");
    client.shutdown().await;

    broker
        .close()
        .await
        .wrap_err("Failed to close RabbitMQ connection")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Server;
    use pubsub::memory::MemoryBroker;
    use std::time::Duration;

    #[test]
    fn test_args_parse_username() {
        let args = Args::try_parse_from(["peril_client", "--username", "alice"]).unwrap();
        assert_eq!(args.username, "alice");

        let args = Args::try_parse_from(["peril_client", "-u", "bob"]).unwrap();
        assert_eq!(args.username, "bob");
    }

    #[test]
    fn test_validate_username() {
        assert_eq!(validate_username("  alice ").unwrap(), "alice");
        assert!(validate_username("").is_err());
        assert!(validate_username("   ").is_err());
        assert!(validate_username("a.b").is_err());
        assert!(validate_username("a b").is_err());
        assert!(validate_username("army*").is_err());
    }

    #[tokio::test]
    async fn test_client_sees_server_pause() {
        let broker = MemoryBroker::new();
        let client_connection = broker.connect();
        let client = Client::start(&client_connection, "alice", &AmqpConfig::default())
            .await
            .unwrap();
        assert!(!client.is_paused());
        // Only the subscription's channel stays open.
        assert_eq!(client_connection.channel_count(), 1);

        let mut paused = client.paused();
        let server = Server::start(&broker, &AmqpConfig::default()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), paused.wait_for(|p| *p))
            .await
            .expect("pause not received")
            .unwrap();
        assert!(client.is_paused());

        server.set_paused(false).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), paused.wait_for(|p| !*p))
            .await
            .expect("resume not received")
            .unwrap();

        let stats = client.shutdown().await;
        assert_eq!(stats.acked, 2);
        assert_eq!(client_connection.channel_count(), 0);
        assert!(!broker.queue_exists("pause.alice"));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_same_username_twice_is_rejected() {
        let broker = MemoryBroker::new();
        let first = Client::start(&broker.connect(), "carol", &AmqpConfig::default())
            .await
            .unwrap();

        let second = broker.connect();
        let err = Client::start(&second, "carol", &AmqpConfig::default())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("carol"));
        assert_eq!(second.channel_count(), 0);

        first.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_username_fails_before_connecting() {
        let broker = MemoryBroker::new();
        let err = Client::start(&broker, "", &AmqpConfig::default()).await.err().unwrap();
        assert!(err.to_string().contains("empty"));
        assert!(!broker.queue_exists("pause."));
    }
}
