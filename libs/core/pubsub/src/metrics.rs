//! Prometheus-style metrics for publishers and subscriptions.
//!
//! Only the `metrics` facade is used here; installing an exporter is left to
//! the binary.

use crate::subscriber::AckDecision;
use metrics::{counter, histogram};
use std::time::Duration;

/// Metrics for one subscription.
#[derive(Clone)]
pub struct SubscriptionMetrics {
    exchange: String,
    queue: String,
}

impl SubscriptionMetrics {
    /// Create new metrics.
    pub fn new(exchange: &str, queue: &str) -> Self {
        Self {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
        }
    }

    /// Record a delivery received.
    pub fn delivery_received(&self) {
        counter!(
            "pubsub_deliveries_received_total",
            "exchange" => self.exchange.clone(),
            "queue" => self.queue.clone()
        )
        .increment(1);
    }

    /// Record how long the handler took.
    pub fn handler_finished(&self, duration: Duration) {
        histogram!(
            "pubsub_handler_duration_seconds",
            "exchange" => self.exchange.clone(),
            "queue" => self.queue.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a verdict the broker accepted.
    pub fn delivery_settled(&self, decision: AckDecision) {
        let name = match decision {
            AckDecision::Ack => "pubsub_deliveries_acked_total",
            AckDecision::NackRequeue => "pubsub_deliveries_requeued_total",
            AckDecision::NackDiscard => "pubsub_deliveries_discarded_total",
        };

        counter!(
            name,
            "exchange" => self.exchange.clone(),
            "queue" => self.queue.clone()
        )
        .increment(1);
    }

    /// Record a payload that failed to decode.
    pub fn decode_failed(&self) {
        counter!(
            "pubsub_decode_failures_total",
            "exchange" => self.exchange.clone(),
            "queue" => self.queue.clone()
        )
        .increment(1);
    }

    /// Record an ack or nack the broker rejected.
    pub fn ack_failed(&self) {
        counter!(
            "pubsub_ack_failures_total",
            "exchange" => self.exchange.clone(),
            "queue" => self.queue.clone()
        )
        .increment(1);
    }
}

/// Metrics for one publisher.
#[derive(Clone)]
pub struct PublisherMetrics {
    exchange: String,
}

impl PublisherMetrics {
    pub fn new(exchange: &str) -> Self {
        Self {
            exchange: exchange.to_string(),
        }
    }

    /// Record a message the broker accepted.
    pub fn published(&self, routing_key: &str) {
        counter!(
            "pubsub_messages_published_total",
            "exchange" => self.exchange.clone(),
            "routing_key" => routing_key.to_string()
        )
        .increment(1);
    }

    /// Record a publish that failed to encode, send, or finish in time.
    pub fn failed(&self, routing_key: &str) {
        counter!(
            "pubsub_publish_failures_total",
            "exchange" => self.exchange.clone(),
            "routing_key" => routing_key.to_string()
        )
        .increment(1);
    }
}
