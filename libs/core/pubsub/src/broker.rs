//! Broker abstraction.
//!
//! The publish/subscribe functions never reach for a global connection. They
//! take a [`Broker`] (something that can open channels) or a
//! [`BrokerChannel`] (one channel) so the AMQP backend and the in-memory
//! backend are interchangeable.

use crate::error::PubSubResult;
use crate::topology::{ExchangeKind, Topology};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;

/// A connection that hands out independent channels.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Channel type produced by this broker.
    type Channel: BrokerChannel;

    /// Open a fresh channel.
    async fn open_channel(&self) -> PubSubResult<Self::Channel>;
}

/// A single channel on a broker connection.
///
/// A channel is not meant to be shared by concurrent publishers; each
/// publisher or subscription path should own its own.
#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Declare an exchange of the given kind.
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> PubSubResult<()>;

    /// Declare the queue described by the topology.
    ///
    /// Flags come from [`Topology::mode`]; the dead-letter exchange, when set,
    /// is passed as the `x-dead-letter-exchange` argument.
    async fn declare_queue(&self, topology: &Topology) -> PubSubResult<()>;

    /// Bind the topology's queue to its exchange under its routing key.
    async fn bind_queue(&self, topology: &Topology) -> PubSubResult<()>;

    /// Limit unacknowledged deliveries in flight on this channel.
    async fn set_prefetch(&self, count: u16) -> PubSubResult<()>;

    /// Send a payload. Returns once the broker accepted the frame; no
    /// publisher confirm is awaited.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content_type: &str,
        payload: &[u8],
    ) -> PubSubResult<()>;

    /// Start consuming a queue with manual acknowledgments.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> PubSubResult<DeliveryStream>;

    /// Close the channel.
    async fn close(&self) -> PubSubResult<()>;
}

/// Acknowledgment handle for a single delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Accept the delivery and remove it from the queue.
    async fn ack(&self) -> PubSubResult<()>;

    /// Reject the delivery. With `requeue` the broker offers it again,
    /// otherwise it is dead-lettered (or dropped when no DLX is configured).
    async fn nack(&self, requeue: bool) -> PubSubResult<()>;
}

/// Stream of deliveries produced by [`BrokerChannel::consume`].
///
/// An `Err` item means the channel or connection failed; the stream ends
/// after it.
pub type DeliveryStream = BoxStream<'static, PubSubResult<Envelope>>;

/// One delivery as handed to the dispatch loop.
pub struct Envelope {
    /// Raw message body
    pub payload: Vec<u8>,
    /// Content type set by the publisher, if any
    pub content_type: Option<String>,
    /// Routing key the message was published with
    pub routing_key: String,
    /// Broker-assigned delivery tag
    pub delivery_tag: u64,
    /// Whether the broker has delivered this message before
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Envelope {
    /// Create an envelope.
    pub fn new(
        payload: Vec<u8>,
        content_type: Option<String>,
        routing_key: impl Into<String>,
        delivery_tag: u64,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            payload,
            content_type,
            routing_key: routing_key.into(),
            delivery_tag,
            redelivered,
            acker,
        }
    }

    /// Acknowledge the delivery.
    pub async fn ack(self) -> PubSubResult<()> {
        self.acker.ack().await
    }

    /// Negatively acknowledge the delivery.
    pub async fn nack(self, requeue: bool) -> PubSubResult<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("payload_len", &self.payload.len())
            .field("content_type", &self.content_type)
            .field("routing_key", &self.routing_key)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}
