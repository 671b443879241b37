//! In-process broker for tests.
//!
//! Mirrors the AMQP 0-9-1 behaviour the publish/subscribe layer relies on:
//!
//! - direct, topic and fanout exchanges plus the nameless default exchange
//!   (`amq.direct`, `amq.topic` and `amq.fanout` exist up front)
//! - queue declaration with durable/exclusive/auto-delete flags, rejecting
//!   redeclaration with different properties
//! - manual acknowledgment: ack removes, nack with requeue redelivers with
//!   the redelivered flag set, nack without requeue dead-letters
//! - closing a channel cancels its consumers and returns their unacked
//!   messages; closing a connection deletes its exclusive queues
//!
//! Nothing is persisted and "durable" only affects redeclaration checks.

mod routing;
mod state;

pub use routing::{binding_matches, topic_matches};
pub use state::QueueFlags;

use crate::broker::{Broker, BrokerChannel, DeliveryStream};
use crate::error::PubSubResult;
use crate::topology::{ExchangeKind, Topology};
use async_trait::async_trait;
use futures::StreamExt;
use state::{lock, Shared, State};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;

const NO_PREFETCH: u32 = u32::MAX;

/// One connection to an in-memory broker.
///
/// [`MemoryBroker::new`] starts a fresh broker; [`MemoryBroker::connect`]
/// opens another connection to the same one.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Shared,
    connection_id: u64,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Start a new broker and connect to it.
    pub fn new() -> Self {
        let mut state = State::with_default_exchanges();
        let connection_id = state.next_id();
        Self {
            shared: Arc::new(Mutex::new(state)),
            connection_id,
        }
    }

    /// Open another connection to the same broker.
    pub fn connect(&self) -> Self {
        let connection_id = lock(&self.shared).next_id();
        Self {
            shared: self.shared.clone(),
            connection_id,
        }
    }

    /// Close this connection, its channels and its exclusive queues.
    pub async fn close(&self) {
        lock(&self.shared).close_connection(&self.shared, self.connection_id);
    }

    /// Make every following ack and nack fail.
    pub fn set_reject_acks(&self, reject: bool) {
        lock(&self.shared).reject_acks = reject;
    }

    /// Make every following publish fail.
    pub fn set_reject_publishes(&self, reject: bool) {
        lock(&self.shared).reject_publishes = reject;
    }

    /// Declared properties of a queue.
    pub fn queue_flags(&self, queue: &str) -> Option<QueueFlags> {
        lock(&self.shared).queue_flags(queue)
    }

    /// Whether a queue exists.
    pub fn queue_exists(&self, queue: &str) -> bool {
        self.queue_flags(queue).is_some()
    }

    /// Messages waiting for a consumer.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        lock(&self.shared).queue_depth(queue)
    }

    /// Messages delivered but not yet settled.
    pub fn unacked_count(&self, queue: &str) -> Option<usize> {
        lock(&self.shared).unacked_count(queue)
    }

    /// Active consumers on a queue.
    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        lock(&self.shared).consumer_count(queue)
    }

    /// Channels currently open on this connection.
    pub fn channel_count(&self) -> usize {
        lock(&self.shared).channel_count(self.connection_id)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Channel = MemoryChannel;

    async fn open_channel(&self) -> PubSubResult<MemoryChannel> {
        let channel_id = lock(&self.shared).open_channel(self.connection_id)?;
        Ok(MemoryChannel {
            shared: self.shared.clone(),
            channel_id,
            prefetch: AtomicU32::new(NO_PREFETCH),
        })
    }
}

/// Channel on a [`MemoryBroker`].
pub struct MemoryChannel {
    shared: Shared,
    channel_id: u64,
    prefetch: AtomicU32,
}

impl MemoryChannel {
    /// Whether the channel is still open.
    pub fn is_open(&self) -> bool {
        lock(&self.shared).channel_is_open(self.channel_id)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> PubSubResult<()> {
        lock(&self.shared).declare_exchange(self.channel_id, name, kind, durable)
    }

    async fn declare_queue(&self, topology: &Topology) -> PubSubResult<()> {
        lock(&self.shared).declare_queue(self.channel_id, topology)
    }

    async fn bind_queue(&self, topology: &Topology) -> PubSubResult<()> {
        lock(&self.shared).bind_queue(self.channel_id, topology)
    }

    async fn set_prefetch(&self, count: u16) -> PubSubResult<()> {
        self.prefetch.store(u32::from(count), Ordering::SeqCst);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content_type: &str,
        payload: &[u8],
    ) -> PubSubResult<()> {
        lock(&self.shared).publish(
            &self.shared,
            self.channel_id,
            exchange,
            routing_key,
            content_type,
            payload,
        )
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> PubSubResult<DeliveryStream> {
        let prefetch = match self.prefetch.load(Ordering::SeqCst) {
            NO_PREFETCH => None,
            count => u16::try_from(count).ok(),
        };
        let receiver = lock(&self.shared).consume(
            &self.shared,
            self.channel_id,
            queue,
            consumer_tag,
            prefetch,
        )?;
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn close(&self) -> PubSubResult<()> {
        lock(&self.shared).close_channel(&self.shared, self.channel_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{declare_and_bind, QueueMode};

    async fn setup(kind: ExchangeKind) -> (MemoryBroker, MemoryChannel) {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();
        channel.declare_exchange("ex", kind, true).await.unwrap();
        (broker, channel)
    }

    #[tokio::test]
    async fn test_declared_flags_follow_mode() {
        let (broker, _) = setup(ExchangeKind::Direct).await;

        declare_and_bind(&broker, &Topology::new("ex", "durable.q", "k", QueueMode::Durable))
            .await
            .unwrap();
        declare_and_bind(&broker, &Topology::new("ex", "transient.q", "k", QueueMode::Transient))
            .await
            .unwrap();

        let durable = broker.queue_flags("durable.q").unwrap();
        assert!(durable.durable && !durable.exclusive && !durable.auto_delete);

        let transient = broker.queue_flags("transient.q").unwrap();
        assert!(!transient.durable && transient.exclusive && transient.auto_delete);
    }

    #[tokio::test]
    async fn test_channel_count_is_per_connection() {
        let (broker, channel) = setup(ExchangeKind::Direct).await;
        let other = broker.connect();
        let _other_channel = other.open_channel().await.unwrap();
        assert_eq!(broker.channel_count(), 1);
        assert_eq!(other.channel_count(), 1);

        channel.close().await.unwrap();
        assert_eq!(broker.channel_count(), 0);
        assert_eq!(other.channel_count(), 1);
    }

    #[tokio::test]
    async fn test_redeclare_same_parameters_is_idempotent() {
        let (broker, _) = setup(ExchangeKind::Direct).await;
        let topology =
            Topology::new("ex", "shared", "k", QueueMode::Durable).with_dead_letter_exchange("dlx");

        declare_and_bind(&broker, &topology).await.unwrap();
        declare_and_bind(&broker.connect(), &topology).await.unwrap();
    }

    #[tokio::test]
    async fn test_redeclare_with_conflicting_durability_fails() {
        let (broker, _) = setup(ExchangeKind::Direct).await;
        declare_and_bind(&broker, &Topology::new("ex", "shared", "k", QueueMode::Durable))
            .await
            .unwrap();

        let other = broker.connect();
        let err = declare_and_bind(&other, &Topology::new("ex", "shared", "k", QueueMode::Transient))
            .await
            .err()
            .expect("conflicting declaration should fail");
        assert!(err.to_string().contains("PRECONDITION_FAILED"));
    }

    #[tokio::test]
    async fn test_redeclare_with_different_dead_letter_exchange_fails() {
        let (broker, _) = setup(ExchangeKind::Direct).await;
        declare_and_bind(&broker, &Topology::new("ex", "shared", "k", QueueMode::Durable))
            .await
            .unwrap();

        let conflicting =
            Topology::new("ex", "shared", "k", QueueMode::Durable).with_dead_letter_exchange("dlx");
        assert!(declare_and_bind(&broker, &conflicting).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_failure_keeps_declared_queue() {
        let broker = MemoryBroker::new();
        let topology = Topology::new("missing", "orphan", "k", QueueMode::Durable);

        assert!(declare_and_bind(&broker, &topology).await.is_err());
        assert!(broker.queue_exists("orphan"));
    }

    #[tokio::test]
    async fn test_exclusive_queue_deleted_with_connection() {
        let (broker, _) = setup(ExchangeKind::Direct).await;
        let client = broker.connect();
        declare_and_bind(&client, &Topology::new("ex", "pause.alice", "pause", QueueMode::Transient))
            .await
            .unwrap();

        let intruder = broker.connect();
        let err = declare_and_bind(
            &intruder,
            &Topology::new("ex", "pause.alice", "pause", QueueMode::Transient),
        )
        .await
        .err()
        .unwrap();
        assert!(err.to_string().contains("RESOURCE_LOCKED"));

        client.close().await;
        assert!(!broker.queue_exists("pause.alice"));
    }

    #[tokio::test]
    async fn test_default_exchange_routes_by_queue_name() {
        let (broker, channel) = setup(ExchangeKind::Direct).await;
        declare_and_bind(&broker, &Topology::new("ex", "direct.q", "k", QueueMode::Durable))
            .await
            .unwrap();

        channel
            .publish("", "direct.q", "application/json", b"1")
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("direct.q"), Some(1));
    }

    #[tokio::test]
    async fn test_publish_to_unknown_exchange_fails() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();
        let err = channel
            .publish("nope", "k", "application/json", b"{}")
            .await
            .unwrap_err();
        assert!(matches!(err, crate::PubSubError::Publish(_)));
    }

    #[tokio::test]
    async fn test_requeue_redelivers_with_flag() {
        let (broker, channel) = setup(ExchangeKind::Direct).await;
        let topology = Topology::new("ex", "q", "k", QueueMode::Durable);
        declare_and_bind(&broker, &topology).await.unwrap();

        let mut deliveries = channel.consume("q", "c1").await.unwrap();
        channel.publish("ex", "k", "application/json", b"7").await.unwrap();

        let first = deliveries.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        first.nack(true).await.unwrap();

        let second = deliveries.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        assert_eq!(second.payload, b"7");
        second.ack().await.unwrap();

        assert_eq!(broker.queue_depth("q"), Some(0));
        assert_eq!(broker.unacked_count("q"), Some(0));
    }

    #[tokio::test]
    async fn test_prefetch_limits_in_flight() {
        let (broker, channel) = setup(ExchangeKind::Direct).await;
        declare_and_bind(&broker, &Topology::new("ex", "q", "k", QueueMode::Durable))
            .await
            .unwrap();

        channel.set_prefetch(1).await.unwrap();
        let mut deliveries = channel.consume("q", "c1").await.unwrap();
        for n in 0..3u8 {
            channel.publish("ex", "k", "application/json", &[n]).await.unwrap();
        }

        assert_eq!(broker.unacked_count("q"), Some(1));
        assert_eq!(broker.queue_depth("q"), Some(2));

        let first = deliveries.next().await.unwrap().unwrap();
        first.ack().await.unwrap();
        assert_eq!(broker.unacked_count("q"), Some(1));
        assert_eq!(broker.queue_depth("q"), Some(1));
    }

    #[tokio::test]
    async fn test_ack_after_channel_close_fails() {
        let (broker, channel) = setup(ExchangeKind::Direct).await;
        declare_and_bind(&broker, &Topology::new("ex", "q", "k", QueueMode::Durable))
            .await
            .unwrap();

        let mut deliveries = channel.consume("q", "c1").await.unwrap();
        channel.publish("ex", "k", "application/json", b"1").await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();

        channel.close().await.unwrap();
        assert!(!channel.is_open());
        assert!(delivery.ack().await.is_err());
        assert_eq!(broker.queue_depth("q"), Some(1));
    }
}
