//! Encoding and sending typed messages.

use crate::broker::BrokerChannel;
use crate::codec::Encoding;
use crate::error::{PubSubError, PubSubResult};
use crate::metrics::PublisherMetrics;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Encode `value` and send it to `exchange` under `routing_key`.
///
/// The content type of `encoding` is attached to the message. Encoding
/// failures return [`PubSubError::Encode`] and nothing is sent. Each call is
/// independent; no publisher confirm is awaited.
pub async fn publish<C, T>(
    channel: &C,
    exchange: &str,
    routing_key: &str,
    value: &T,
    encoding: Encoding,
) -> PubSubResult<()>
where
    C: BrokerChannel + ?Sized,
    T: Serialize + ?Sized,
{
    let payload = encoding.encode(value).map_err(PubSubError::Encode)?;

    channel
        .publish(exchange, routing_key, encoding.content_type(), &payload)
        .await?;

    debug!(
        exchange = %exchange,
        routing_key = %routing_key,
        encoding = %encoding,
        bytes = payload.len(),
        "Published message"
    );

    Ok(())
}

/// Publish `value` as JSON.
pub async fn publish_json<C, T>(
    channel: &C,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> PubSubResult<()>
where
    C: BrokerChannel + ?Sized,
    T: Serialize + ?Sized,
{
    publish(channel, exchange, routing_key, value, Encoding::Json).await
}

/// Publish `value` in the binary encoding.
pub async fn publish_binary<C, T>(
    channel: &C,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> PubSubResult<()>
where
    C: BrokerChannel + ?Sized,
    T: Serialize + ?Sized,
{
    publish(channel, exchange, routing_key, value, Encoding::Binary).await
}

/// Publisher bound to one channel and one exchange.
///
/// Cloning shares the channel. Publishes through clones are serialized by the
/// channel itself.
pub struct Publisher<C: BrokerChannel> {
    channel: Arc<C>,
    exchange: String,
    encoding: Encoding,
    timeout: Option<Duration>,
    metrics: PublisherMetrics,
}

impl<C: BrokerChannel> Publisher<C> {
    /// Create a JSON publisher for `exchange`.
    pub fn new(channel: C, exchange: impl Into<String>) -> Self {
        Self::from_arc(Arc::new(channel), exchange)
    }

    /// Create from a shared channel.
    pub fn from_arc(channel: Arc<C>, exchange: impl Into<String>) -> Self {
        let exchange = exchange.into();
        Self {
            metrics: PublisherMetrics::new(&exchange),
            channel,
            exchange,
            encoding: Encoding::Json,
            timeout: None,
        }
    }

    /// Set the payload encoding.
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Fail a publish that takes longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Get the exchange name.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Get the encoding.
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Get the underlying channel.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Publish `value` under `routing_key`.
    pub async fn send<T: Serialize + ?Sized>(&self, routing_key: &str, value: &T) -> PubSubResult<()> {
        let send = publish(
            self.channel.as_ref(),
            &self.exchange,
            routing_key,
            value,
            self.encoding,
        );

        let result = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, send).await {
                Ok(result) => result,
                Err(_) => Err(PubSubError::Timeout(format!(
                    "publish to '{}' with key '{}' exceeded {:?}",
                    self.exchange, routing_key, timeout
                ))),
            },
            None => send.await,
        };

        match &result {
            Ok(()) => self.metrics.published(routing_key),
            Err(_) => self.metrics.failed(routing_key),
        }

        result
    }
}

impl<C: BrokerChannel> Clone for Publisher<C> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            exchange: self.exchange.clone(),
            encoding: self.encoding,
            timeout: self.timeout,
            metrics: self.metrics.clone(),
        }
    }
}
