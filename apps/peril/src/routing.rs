//! Exchange names, routing keys and payloads shared by server and client.

use chrono::{DateTime, Utc};
use pubsub::{declare_and_bind_on, declare_exchange, BrokerChannel, ExchangeKind, PubSubResult, QueueMode, Topology};
use serde::{Deserialize, Serialize};

pub const EXCHANGE_PERIL_DIRECT: &str = "peril_direct";
pub const EXCHANGE_PERIL_TOPIC: &str = "peril_topic";
pub const EXCHANGE_PERIL_DLX: &str = "peril_dlx";

/// Durable queue collecting everything dead-lettered through `peril_dlx`.
pub const DEAD_LETTER_QUEUE: &str = "peril_dlq";

pub const PAUSE_KEY: &str = "pause";
pub const ARMY_MOVES_PREFIX: &str = "army_moves";
pub const WAR_RECOGNITIONS_PREFIX: &str = "war";
pub const GAME_LOG_SLUG: &str = "game_logs";

/// Broadcast by the server to pause or resume every client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayingState {
    #[serde(rename = "IsPaused")]
    pub is_paused: bool,
}

/// One line of the shared game log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameLog {
    #[serde(rename = "CurrentTime")]
    pub current_time: DateTime<Utc>,
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "Username")]
    pub username: String,
}

impl GameLog {
    pub fn new(username: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            current_time: Utc::now(),
            message: message.into(),
            username: username.into(),
        }
    }

    /// Routing key this entry is published under.
    pub fn routing_key(&self) -> String {
        game_log_key(&self.username)
    }
}

/// `pause.<username>`
pub fn pause_queue_name(username: &str) -> String {
    format!("{PAUSE_KEY}.{username}")
}

/// `army_moves.<username>`
pub fn army_moves_key(username: &str) -> String {
    format!("{ARMY_MOVES_PREFIX}.{username}")
}

/// `war.<username>`
pub fn war_recognition_key(username: &str) -> String {
    format!("{WAR_RECOGNITIONS_PREFIX}.{username}")
}

/// `game_logs.<username>`
pub fn game_log_key(username: &str) -> String {
    format!("{GAME_LOG_SLUG}.{username}")
}

/// Binding pattern matching every key under `prefix`.
pub fn wildcard(prefix: &str) -> String {
    format!("{prefix}.*")
}

/// Per-user transient pause queue, dead-lettering into `peril_dlx`.
pub fn pause_topology(username: &str) -> Topology {
    Topology::new(
        EXCHANGE_PERIL_DIRECT,
        pause_queue_name(username),
        PAUSE_KEY,
        QueueMode::Transient,
    )
    .with_dead_letter_exchange(EXCHANGE_PERIL_DLX)
}

/// Shared durable game log queue, dead-lettering into `peril_dlx`.
pub fn game_log_topology() -> Topology {
    Topology::new(
        EXCHANGE_PERIL_TOPIC,
        GAME_LOG_SLUG,
        wildcard(GAME_LOG_SLUG),
        QueueMode::Durable,
    )
    .with_dead_letter_exchange(EXCHANGE_PERIL_DLX)
}

/// Declare the game exchanges and the dead-letter queue. Idempotent.
pub async fn declare_game_exchanges<C: BrokerChannel>(channel: &C) -> PubSubResult<()> {
    declare_exchange(channel, EXCHANGE_PERIL_DIRECT, ExchangeKind::Direct, true).await?;
    declare_exchange(channel, EXCHANGE_PERIL_TOPIC, ExchangeKind::Topic, true).await?;
    declare_exchange(channel, EXCHANGE_PERIL_DLX, ExchangeKind::Fanout, true).await?;

    let dead_letters = Topology::new(EXCHANGE_PERIL_DLX, DEAD_LETTER_QUEUE, "", QueueMode::Durable);
    declare_and_bind_on(channel, &dead_letters).await
}
