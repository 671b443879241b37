//! Exchange and queue topology.

use crate::broker::{Broker, BrokerChannel};
use crate::error::PubSubResult;
use std::fmt;
use tracing::{debug, info};

/// Queue argument carrying the dead-letter exchange name.
pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";

/// Lifetime of a declared queue.
///
/// The three AMQP queue flags are always derived from this value, never set
/// one by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueMode {
    /// Survives broker restarts, shared between consumers.
    Durable,
    /// Owned by one connection and deleted when it goes away.
    Transient,
}

impl QueueMode {
    pub fn durable(&self) -> bool {
        matches!(self, QueueMode::Durable)
    }

    pub fn exclusive(&self) -> bool {
        matches!(self, QueueMode::Transient)
    }

    pub fn auto_delete(&self) -> bool {
        matches!(self, QueueMode::Transient)
    }
}

impl fmt::Display for QueueMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueMode::Durable => write!(f, "durable"),
            QueueMode::Transient => write!(f, "transient"),
        }
    }
}

/// Exchange routing behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Exact routing key match
    Direct,
    /// Dot-segmented pattern match (`*` one word, `#` zero or more)
    Topic,
    /// Every bound queue, routing key ignored
    Fanout,
}

impl ExchangeKind {
    /// AMQP name of the exchange type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queue, the exchange it is bound to, and how it is bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub queue_name: String,
    pub routing_key: String,
    pub mode: QueueMode,
    pub dead_letter_exchange: Option<String>,
}

impl Topology {
    /// Create a topology without a dead-letter exchange.
    pub fn new(
        exchange: impl Into<String>,
        queue_name: impl Into<String>,
        routing_key: impl Into<String>,
        mode: QueueMode,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue_name: queue_name.into(),
            routing_key: routing_key.into(),
            mode,
            dead_letter_exchange: None,
        }
    }

    /// Route discarded and expired messages to the given exchange.
    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    /// Queue arguments as key/value pairs.
    pub fn queue_arguments(&self) -> Vec<(&'static str, String)> {
        self.dead_letter_exchange
            .iter()
            .map(|dlx| (DEAD_LETTER_EXCHANGE_ARG, dlx.clone()))
            .collect()
    }
}

/// Declare an exchange on an existing channel.
pub async fn declare_exchange<C: BrokerChannel>(
    channel: &C,
    name: &str,
    kind: ExchangeKind,
    durable: bool,
) -> PubSubResult<()> {
    channel.declare_exchange(name, kind, durable).await?;
    debug!(exchange = %name, kind = %kind, durable, "Exchange declared");
    Ok(())
}

/// Declare the topology's queue and bind it on an existing channel.
///
/// A bind failure after a successful declare fails the whole call. The queue
/// is left in place; transient queues are cleaned up by the broker when the
/// connection closes.
pub async fn declare_and_bind_on<C: BrokerChannel>(
    channel: &C,
    topology: &Topology,
) -> PubSubResult<()> {
    channel.declare_queue(topology).await?;
    channel.bind_queue(topology).await?;

    info!(
        exchange = %topology.exchange,
        queue = %topology.queue_name,
        routing_key = %topology.routing_key,
        mode = %topology.mode,
        dead_letter_exchange = ?topology.dead_letter_exchange,
        "Queue declared and bound"
    );

    Ok(())
}

/// Open a fresh channel, declare the topology's queue, and bind it.
///
/// Returns the channel so the caller can publish or consume on it. The
/// channel is closed again when declaring or binding fails.
pub async fn declare_and_bind<B: Broker>(broker: &B, topology: &Topology) -> PubSubResult<B::Channel> {
    let channel = broker.open_channel().await?;
    if let Err(e) = declare_and_bind_on(&channel, topology).await {
        if let Err(close_err) = channel.close().await {
            debug!(queue = %topology.queue_name, error = %close_err, "Channel close failed");
        }
        return Err(e);
    }
    Ok(channel)
}
