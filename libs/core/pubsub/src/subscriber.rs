//! Subscription engine: topology, delivery stream and dispatch loop.

use crate::broker::{Broker, BrokerChannel, DeliveryStream, Envelope};
use crate::codec::Encoding;
use crate::error::{PubSubError, PubSubResult};
use crate::metrics::SubscriptionMetrics;
use crate::topology::{declare_and_bind, Topology};
use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::marker::PhantomData;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Outcome a handler reports for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckDecision {
    /// Processed, remove from the queue.
    Ack,
    /// Not processed, offer it again.
    NackRequeue,
    /// Not processable, dead-letter it (or drop it without a DLX).
    NackDiscard,
}

/// Message handler for a subscription.
///
/// Plain closures `Fn(T) -> AckDecision` implement this trait. Wrap async
/// closures with [`handler_fn`].
///
/// # Example
///
/// ```rust,ignore
/// use pubsub::{AckDecision, Handler};
///
/// struct PauseHandler;
///
/// #[async_trait]
/// impl Handler<PlayingState> for PauseHandler {
///     async fn handle(&self, state: PlayingState) -> AckDecision {
///         if state.is_paused { println!("paused") }
///         AckDecision::Ack
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: Send + 'static>: Send + Sync {
    /// Handle one decoded message.
    async fn handle(&self, message: T) -> AckDecision;
}

#[async_trait]
impl<T, F> Handler<T> for F
where
    T: Send + 'static,
    F: Fn(T) -> AckDecision + Send + Sync,
{
    async fn handle(&self, message: T) -> AckDecision {
        (self)(message)
    }
}

/// Handler built from an async closure.
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F>(f: F) -> HandlerFn<F> {
    HandlerFn { f }
}

#[async_trait]
impl<T, F, Fut> Handler<T> for HandlerFn<F>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = AckDecision> + Send,
{
    async fn handle(&self, message: T) -> AckDecision {
        (self.f)(message).await
    }
}

/// What to do with a delivery whose payload does not decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeFailurePolicy {
    /// Log it and leave it unacknowledged. The broker redelivers it once the
    /// channel closes, so a permanently malformed message can loop.
    #[default]
    Skip,
    /// Skip the first failure; reject a redelivered message that still does
    /// not decode without requeue so it reaches the dead-letter exchange.
    DeadLetterRedelivered,
}

/// Per-subscription options.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Consumer tag sent to the broker
    pub consumer_tag: String,
    /// Maximum unacknowledged deliveries (None = broker default)
    pub prefetch: Option<u16>,
    /// Handling of undecodable payloads
    pub decode_failure_policy: DecodeFailurePolicy,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            consumer_tag: format!("pubsub-{}", uuid::Uuid::new_v4()),
            prefetch: None,
            decode_failure_policy: DecodeFailurePolicy::default(),
        }
    }
}

impl SubscribeOptions {
    /// Set the consumer tag.
    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    /// Set the prefetch count.
    pub fn with_prefetch(mut self, count: u16) -> Self {
        self.prefetch = Some(count);
        self
    }

    /// Set the decode failure policy.
    pub fn with_decode_failure_policy(mut self, policy: DecodeFailurePolicy) -> Self {
        self.decode_failure_policy = policy;
        self
    }
}

/// Counters collected by one dispatch loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub received: u64,
    pub acked: u64,
    pub requeued: u64,
    pub discarded: u64,
    pub decode_failures: u64,
    /// Undecodable redeliveries rejected under `DeadLetterRedelivered`
    pub dead_lettered_undecodable: u64,
    pub ack_failures: u64,
}

impl SubscriptionStats {
    fn record(&mut self, decision: AckDecision) {
        match decision {
            AckDecision::Ack => self.acked += 1,
            AckDecision::NackRequeue => self.requeued += 1,
            AckDecision::NackDiscard => self.discarded += 1,
        }
    }
}

/// Handle to a running subscription.
///
/// Dropping it leaves the loop running until the broker closes the stream.
/// Call [`Subscription::shutdown`] to stop it cooperatively.
#[derive(Debug)]
pub struct Subscription {
    queue: String,
    consumer_tag: String,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<SubscriptionStats>,
}

impl Subscription {
    /// Get the queue name.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Get the consumer tag.
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Whether the dispatch loop has stopped.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the loop after the in-flight delivery and wait for it.
    pub async fn shutdown(self) -> SubscriptionStats {
        let _ = self.shutdown_tx.send(true);
        Self::wait(self.handle, &self.queue).await
    }

    /// Wait for the loop to end on its own (stream closed or failed).
    pub async fn join(self) -> SubscriptionStats {
        Self::wait(self.handle, &self.queue).await
    }

    async fn wait(handle: JoinHandle<SubscriptionStats>, queue: &str) -> SubscriptionStats {
        match handle.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(queue = %queue, error = %e, "Subscription task panicked");
                SubscriptionStats::default()
            }
        }
    }
}

/// Declare the topology, start consuming and spawn the dispatch loop.
///
/// Returns once the delivery stream is acquired. Setup failures (declare,
/// bind, consume) are returned here; per-delivery failures are logged by the
/// loop and never end it.
pub async fn subscribe<B, T, H>(
    broker: &B,
    topology: &Topology,
    encoding: Encoding,
    handler: H,
    options: SubscribeOptions,
) -> PubSubResult<Subscription>
where
    B: Broker,
    T: DeserializeOwned + Send + 'static,
    H: Handler<T> + 'static,
{
    let channel = declare_and_bind(broker, topology).await?;

    let deliveries = match start_consuming(&channel, topology, &options).await {
        Ok(deliveries) => deliveries,
        Err(e) => {
            if let Err(close_err) = channel.close().await {
                debug!(queue = %topology.queue_name, error = %close_err, "Channel close failed");
            }
            return Err(e);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatcher = Dispatcher {
        handler,
        encoding,
        queue: topology.queue_name.clone(),
        policy: options.decode_failure_policy,
        metrics: SubscriptionMetrics::new(&topology.exchange, &topology.queue_name),
        _marker: PhantomData,
    };

    info!(
        exchange = %topology.exchange,
        queue = %topology.queue_name,
        routing_key = %topology.routing_key,
        consumer_tag = %options.consumer_tag,
        encoding = %encoding,
        "Subscription started"
    );

    let handle = tokio::spawn(dispatcher.run(channel, deliveries, shutdown_rx));

    Ok(Subscription {
        queue: topology.queue_name.clone(),
        consumer_tag: options.consumer_tag,
        shutdown_tx,
        handle,
    })
}

async fn start_consuming<C: BrokerChannel>(
    channel: &C,
    topology: &Topology,
    options: &SubscribeOptions,
) -> PubSubResult<DeliveryStream> {
    if let Some(count) = options.prefetch {
        channel.set_prefetch(count).await?;
    }

    channel
        .consume(&topology.queue_name, &options.consumer_tag)
        .await
}

/// Subscribe to JSON payloads with default options.
pub async fn subscribe_json<B, T, H>(
    broker: &B,
    topology: &Topology,
    handler: H,
) -> PubSubResult<Subscription>
where
    B: Broker,
    T: DeserializeOwned + Send + 'static,
    H: Handler<T> + 'static,
{
    subscribe(
        broker,
        topology,
        Encoding::Json,
        handler,
        SubscribeOptions::default(),
    )
    .await
}

/// Subscribe to binary payloads with default options.
pub async fn subscribe_binary<B, T, H>(
    broker: &B,
    topology: &Topology,
    handler: H,
) -> PubSubResult<Subscription>
where
    B: Broker,
    T: DeserializeOwned + Send + 'static,
    H: Handler<T> + 'static,
{
    subscribe(
        broker,
        topology,
        Encoding::Binary,
        handler,
        SubscribeOptions::default(),
    )
    .await
}

struct Dispatcher<T, H> {
    handler: H,
    encoding: Encoding,
    queue: String,
    policy: DecodeFailurePolicy,
    metrics: SubscriptionMetrics,
    _marker: PhantomData<fn() -> T>,
}

impl<T, H> Dispatcher<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    async fn run<C: BrokerChannel>(
        self,
        channel: C,
        mut deliveries: DeliveryStream,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> SubscriptionStats {
        let mut stats = SubscriptionStats::default();
        // Dropping the Subscription drops the sender; keep consuming then.
        let mut shutdown_open = true;

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed(), if shutdown_open => {
                    match changed {
                        Ok(()) if *shutdown_rx.borrow() => {
                            info!(queue = %self.queue, "Shutdown signal received, stopping subscription");
                            break;
                        }
                        Ok(()) => {}
                        Err(_) => shutdown_open = false,
                    }
                }

                next = deliveries.next() => match next {
                    Some(Ok(envelope)) => self.dispatch(envelope, &mut stats).await,
                    Some(Err(e)) => {
                        error!(queue = %self.queue, error = %e, "Delivery stream failed");
                        break;
                    }
                    None => {
                        info!(queue = %self.queue, "Delivery stream closed");
                        break;
                    }
                }
            }
        }

        drop(deliveries);
        if let Err(e) = channel.close().await {
            debug!(queue = %self.queue, error = %e, "Channel close failed");
        }

        info!(
            queue = %self.queue,
            received = stats.received,
            acked = stats.acked,
            requeued = stats.requeued,
            discarded = stats.discarded,
            decode_failures = stats.decode_failures,
            ack_failures = stats.ack_failures,
            "Subscription stopped"
        );

        stats
    }

    /// Decode, handle and acknowledge one delivery.
    async fn dispatch(&self, envelope: Envelope, stats: &mut SubscriptionStats) {
        stats.received += 1;
        self.metrics.delivery_received();

        let delivery_tag = envelope.delivery_tag;

        if let Some(content_type) = envelope.content_type.as_deref() {
            if Encoding::from_content_type(content_type) != Some(self.encoding) {
                debug!(
                    queue = %self.queue,
                    delivery_tag,
                    content_type = %content_type,
                    expected = %self.encoding.content_type(),
                    "Content type does not match subscription encoding"
                );
            }
        }

        let message: T = match self.encoding.decode(&envelope.payload) {
            Ok(message) => message,
            Err(e) => {
                stats.decode_failures += 1;
                self.metrics.decode_failed();
                self.reject_undecodable(envelope, PubSubError::Decode(e), stats).await;
                return;
            }
        };

        let start = Instant::now();
        let decision = self.handler.handle(message).await;
        self.metrics.handler_finished(start.elapsed());

        let result = match decision {
            AckDecision::Ack => envelope.ack().await,
            AckDecision::NackRequeue => envelope.nack(true).await,
            AckDecision::NackDiscard => envelope.nack(false).await,
        };

        match result {
            Ok(()) => {
                stats.record(decision);
                self.metrics.delivery_settled(decision);
                debug!(queue = %self.queue, delivery_tag, decision = ?decision, "Delivery settled");
            }
            Err(e) => {
                stats.ack_failures += 1;
                self.metrics.ack_failed();
                error!(
                    queue = %self.queue,
                    delivery_tag,
                    decision = ?decision,
                    error = %e,
                    "Failed to acknowledge delivery"
                );
            }
        }
    }

    async fn reject_undecodable(
        &self,
        envelope: Envelope,
        error: PubSubError,
        stats: &mut SubscriptionStats,
    ) {
        let delivery_tag = envelope.delivery_tag;
        let redelivered = envelope.redelivered;

        if self.policy == DecodeFailurePolicy::DeadLetterRedelivered && redelivered {
            warn!(
                queue = %self.queue,
                delivery_tag,
                error = %error,
                "Redelivered message still fails to decode, dead-lettering"
            );
            match envelope.nack(false).await {
                Ok(()) => stats.dead_lettered_undecodable += 1,
                Err(e) => {
                    stats.ack_failures += 1;
                    self.metrics.ack_failed();
                    error!(queue = %self.queue, delivery_tag, error = %e, "Failed to reject undecodable delivery");
                }
            }
            return;
        }

        warn!(
            queue = %self.queue,
            delivery_tag,
            redelivered,
            error = %error,
            "Failed to decode delivery, leaving it unacknowledged"
        );
    }
}
