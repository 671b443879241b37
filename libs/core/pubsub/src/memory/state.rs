//! Shared in-memory broker state.

use super::routing::binding_matches;
use crate::broker::{Acknowledger, Envelope};
use crate::error::{PubSubError, PubSubResult};
use crate::topology::{ExchangeKind, Topology, DEAD_LETTER_EXCHANGE_ARG};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

pub(crate) type Shared = Arc<Mutex<State>>;

pub(crate) fn lock(shared: &Shared) -> MutexGuard<'_, State> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Properties a queue was declared with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueFlags {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub dead_letter_exchange: Option<String>,
}

impl QueueFlags {
    fn from_topology(topology: &Topology) -> Self {
        Self {
            durable: topology.mode.durable(),
            exclusive: topology.mode.exclusive(),
            auto_delete: topology.mode.auto_delete(),
            dead_letter_exchange: topology.dead_letter_exchange.clone(),
        }
    }

    /// First property that differs, as a RabbitMQ-style description.
    fn mismatch(&self, other: &QueueFlags) -> Option<String> {
        if self.durable != other.durable {
            return Some(format!(
                "inequivalent arg 'durable': received '{}' but current is '{}'",
                other.durable, self.durable
            ));
        }
        if self.exclusive != other.exclusive {
            return Some(format!(
                "inequivalent arg 'exclusive': received '{}' but current is '{}'",
                other.exclusive, self.exclusive
            ));
        }
        if self.auto_delete != other.auto_delete {
            return Some(format!(
                "inequivalent arg 'auto_delete': received '{}' but current is '{}'",
                other.auto_delete, self.auto_delete
            ));
        }
        if self.dead_letter_exchange != other.dead_letter_exchange {
            return Some(format!(
                "inequivalent arg '{}': received {:?} but current is {:?}",
                DEAD_LETTER_EXCHANGE_ARG, other.dead_letter_exchange, self.dead_letter_exchange
            ));
        }
        None
    }
}

#[derive(Debug, Clone)]
struct Message {
    payload: Vec<u8>,
    content_type: Option<String>,
    routing_key: String,
    redelivered: bool,
}

struct Exchange {
    kind: ExchangeKind,
    durable: bool,
    bindings: Vec<(String, String)>,
}

struct Consumer {
    tag: String,
    channel_id: u64,
    prefetch: Option<u16>,
    in_flight: usize,
    sender: mpsc::UnboundedSender<PubSubResult<Envelope>>,
}

impl Consumer {
    fn has_capacity(&self) -> bool {
        self.prefetch
            .map_or(true, |limit| limit == 0 || self.in_flight < usize::from(limit))
    }
}

struct Unacked {
    message: Message,
    consumer_tag: String,
    channel_id: u64,
}

struct Queue {
    flags: QueueFlags,
    owner: Option<u64>,
    ready: VecDeque<Message>,
    unacked: HashMap<u64, Unacked>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
    had_consumer: bool,
}

/// Whole-server state shared by every connection and channel.
#[derive(Default)]
pub(crate) struct State {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    /// channel id -> connection id
    channels: HashMap<u64, u64>,
    closed_connections: HashSet<u64>,
    next_id: u64,
    next_delivery_tag: u64,
    pub(crate) reject_acks: bool,
    pub(crate) reject_publishes: bool,
}

impl State {
    pub(crate) fn with_default_exchanges() -> Self {
        let mut state = State::default();
        for (name, kind) in [
            ("amq.direct", ExchangeKind::Direct),
            ("amq.topic", ExchangeKind::Topic),
            ("amq.fanout", ExchangeKind::Fanout),
        ] {
            state.exchanges.insert(
                name.to_string(),
                Exchange {
                    kind,
                    durable: true,
                    bindings: Vec::new(),
                },
            );
        }
        state
    }

    pub(crate) fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn open_channel(&mut self, connection_id: u64) -> PubSubResult<u64> {
        if self.closed_connections.contains(&connection_id) {
            return Err(PubSubError::Connection("connection is closed".to_string()));
        }
        let channel_id = self.next_id();
        self.channels.insert(channel_id, connection_id);
        Ok(channel_id)
    }

    fn connection_of(&self, channel_id: u64) -> PubSubResult<u64> {
        self.channels
            .get(&channel_id)
            .copied()
            .ok_or_else(|| PubSubError::Channel(format!("channel {channel_id} is closed")))
    }

    pub(crate) fn declare_exchange(
        &mut self,
        channel_id: u64,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> PubSubResult<()> {
        self.connection_of(channel_id)?;

        match self.exchanges.get(name) {
            Some(existing) if existing.kind != kind || existing.durable != durable => {
                Err(PubSubError::topology(
                    name,
                    format!(
                        "PRECONDITION_FAILED - inequivalent exchange '{name}': current is {} durable={}",
                        existing.kind, existing.durable
                    ),
                ))
            }
            Some(_) => Ok(()),
            None => {
                self.exchanges.insert(
                    name.to_string(),
                    Exchange {
                        kind,
                        durable,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    pub(crate) fn declare_queue(&mut self, channel_id: u64, topology: &Topology) -> PubSubResult<()> {
        let connection_id = self.connection_of(channel_id)?;
        let flags = QueueFlags::from_topology(topology);
        let name = &topology.queue_name;

        if let Some(existing) = self.queues.get(name) {
            if let Some(owner) = existing.owner {
                if owner != connection_id {
                    return Err(PubSubError::topology(
                        name.as_str(),
                        format!("RESOURCE_LOCKED - queue '{name}' is exclusive to another connection"),
                    ));
                }
            }
            if let Some(reason) = existing.flags.mismatch(&flags) {
                return Err(PubSubError::topology(
                    name.as_str(),
                    format!("PRECONDITION_FAILED - {reason} for queue '{name}'"),
                ));
            }
            return Ok(());
        }

        let owner = flags.exclusive.then_some(connection_id);
        self.queues.insert(
            name.clone(),
            Queue {
                flags,
                owner,
                ready: VecDeque::new(),
                unacked: HashMap::new(),
                consumers: Vec::new(),
                next_consumer: 0,
                had_consumer: false,
            },
        );
        Ok(())
    }

    pub(crate) fn bind_queue(&mut self, channel_id: u64, topology: &Topology) -> PubSubResult<()> {
        self.connection_of(channel_id)?;
        let queue = &topology.queue_name;

        if !self.queues.contains_key(queue) {
            return Err(PubSubError::topology(
                queue.as_str(),
                format!("NOT_FOUND - no queue '{queue}'"),
            ));
        }
        let Some(exchange) = self.exchanges.get_mut(&topology.exchange) else {
            return Err(PubSubError::topology(
                queue.as_str(),
                format!("NOT_FOUND - no exchange '{}'", topology.exchange),
            ));
        };

        let binding = (queue.clone(), topology.routing_key.clone());
        if !exchange.bindings.contains(&binding) {
            exchange.bindings.push(binding);
        }
        Ok(())
    }

    pub(crate) fn publish(
        &mut self,
        shared: &Shared,
        channel_id: u64,
        exchange: &str,
        routing_key: &str,
        content_type: &str,
        payload: &[u8],
    ) -> PubSubResult<()> {
        self.connection_of(channel_id)?;
        if self.reject_publishes {
            return Err(PubSubError::publish("broker rejected the publish"));
        }

        let message = Message {
            payload: payload.to_vec(),
            content_type: Some(content_type.to_string()),
            routing_key: routing_key.to_string(),
            redelivered: false,
        };
        self.route(shared, exchange, message)
    }

    /// Deliver a message to every queue bound on `exchange` whose binding
    /// matches. The nameless default exchange routes straight to the queue
    /// named by the routing key. Unroutable messages are dropped.
    fn route(&mut self, shared: &Shared, exchange: &str, message: Message) -> PubSubResult<()> {
        let targets: Vec<String> = if exchange.is_empty() {
            self.queues
                .contains_key(&message.routing_key)
                .then(|| message.routing_key.clone())
                .into_iter()
                .collect()
        } else {
            let Some(found) = self.exchanges.get(exchange) else {
                return Err(PubSubError::publish(format!(
                    "NOT_FOUND - no exchange '{exchange}'"
                )));
            };
            let mut targets: Vec<String> = Vec::new();
            for (queue, key) in &found.bindings {
                if binding_matches(found.kind, key, &message.routing_key) && !targets.contains(queue) {
                    targets.push(queue.clone());
                }
            }
            targets
        };

        for queue in targets {
            if let Some(q) = self.queues.get_mut(&queue) {
                q.ready.push_back(message.clone());
            }
            self.dispatch(shared, &queue);
        }
        Ok(())
    }

    pub(crate) fn consume(
        &mut self,
        shared: &Shared,
        channel_id: u64,
        queue: &str,
        consumer_tag: &str,
        prefetch: Option<u16>,
    ) -> PubSubResult<mpsc::UnboundedReceiver<PubSubResult<Envelope>>> {
        let connection_id = self.connection_of(channel_id)?;
        let Some(q) = self.queues.get_mut(queue) else {
            return Err(PubSubError::subscribe(format!("NOT_FOUND - no queue '{queue}'")));
        };
        if q.owner.is_some_and(|owner| owner != connection_id) {
            return Err(PubSubError::subscribe(format!(
                "RESOURCE_LOCKED - queue '{queue}' is exclusive to another connection"
            )));
        }
        if q.consumers.iter().any(|c| c.tag == consumer_tag) {
            return Err(PubSubError::subscribe(format!(
                "NOT_ALLOWED - consumer tag '{consumer_tag}' already in use"
            )));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        q.consumers.push(Consumer {
            tag: consumer_tag.to_string(),
            channel_id,
            prefetch,
            in_flight: 0,
            sender,
        });
        q.had_consumer = true;

        self.dispatch(shared, queue);
        Ok(receiver)
    }

    /// Hand ready messages to consumers with spare capacity, round robin.
    fn dispatch(&mut self, shared: &Shared, queue_name: &str) {
        loop {
            let delivery_tag = self.next_delivery_tag + 1;
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let Some(index) = (0..count)
                .map(|offset| (queue.next_consumer + offset) % count)
                .find(|&i| queue.consumers[i].has_capacity())
            else {
                return;
            };
            queue.next_consumer = (index + 1) % count;

            let Some(message) = queue.ready.pop_front() else {
                return;
            };
            let consumer = &mut queue.consumers[index];
            let envelope = Envelope::new(
                message.payload.clone(),
                message.content_type.clone(),
                message.routing_key.clone(),
                delivery_tag,
                message.redelivered,
                Box::new(MemoryAcker {
                    shared: shared.clone(),
                    queue: queue_name.to_string(),
                    delivery_tag,
                }),
            );

            if consumer.sender.send(Ok(envelope)).is_err() {
                // Receiver dropped without closing the channel.
                queue.consumers.remove(index);
                queue.next_consumer = 0;
                queue.ready.push_front(message);
                continue;
            }

            consumer.in_flight += 1;
            let unacked = Unacked {
                message,
                consumer_tag: consumer.tag.clone(),
                channel_id: consumer.channel_id,
            };
            queue.unacked.insert(delivery_tag, unacked);
            self.next_delivery_tag = delivery_tag;
        }
    }

    fn settle(
        &mut self,
        shared: &Shared,
        queue_name: &str,
        delivery_tag: u64,
        outcome: Settle,
    ) -> PubSubResult<()> {
        if self.reject_acks {
            return Err(PubSubError::ack("broker rejected the acknowledgment"));
        }

        let Some(queue) = self.queues.get_mut(queue_name) else {
            return Err(PubSubError::ack(format!("queue '{queue_name}' no longer exists")));
        };
        let Some(unacked) = queue.unacked.remove(&delivery_tag) else {
            return Err(PubSubError::ack(format!(
                "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
            )));
        };
        if let Some(consumer) = queue.consumers.iter_mut().find(|c| c.tag == unacked.consumer_tag) {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }

        let mut message = unacked.message;
        match outcome {
            Settle::Ack => {}
            Settle::Requeue => {
                message.redelivered = true;
                queue.ready.push_front(message);
            }
            Settle::DeadLetter => {
                if let Some(dlx) = queue.flags.dead_letter_exchange.clone() {
                    message.redelivered = false;
                    // A missing dead-letter exchange drops the message.
                    let _ = self.route(shared, &dlx, message);
                }
            }
        }

        self.dispatch(shared, queue_name);
        Ok(())
    }

    pub(crate) fn close_channel(&mut self, shared: &Shared, channel_id: u64) {
        if self.channels.remove(&channel_id).is_none() {
            return;
        }

        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            let Some(queue) = self.queues.get_mut(&name) else {
                continue;
            };
            queue.consumers.retain(|c| c.channel_id != channel_id);
            queue.next_consumer = 0;

            let mut returned: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, u)| u.channel_id == channel_id)
                .map(|(tag, _)| *tag)
                .collect();
            returned.sort_unstable();
            for tag in returned.into_iter().rev() {
                if let Some(unacked) = queue.unacked.remove(&tag) {
                    let mut message = unacked.message;
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }

            if queue.flags.auto_delete && queue.had_consumer && queue.consumers.is_empty() {
                self.delete_queue(&name);
            } else {
                self.dispatch(shared, &name);
            }
        }
    }

    pub(crate) fn close_connection(&mut self, shared: &Shared, connection_id: u64) {
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, conn)| **conn == connection_id)
            .map(|(channel, _)| *channel)
            .collect();
        for channel in channels {
            self.close_channel(shared, channel);
        }

        let owned: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(connection_id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            self.delete_queue(&name);
        }

        self.closed_connections.insert(connection_id);
    }

    fn delete_queue(&mut self, name: &str) {
        self.queues.remove(name);
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|(queue, _)| queue != name);
        }
    }

    pub(crate) fn channel_is_open(&self, channel_id: u64) -> bool {
        self.channels.contains_key(&channel_id)
    }

    pub(crate) fn channel_count(&self, connection_id: u64) -> usize {
        self.channels
            .values()
            .filter(|owner| **owner == connection_id)
            .count()
    }

    pub(crate) fn queue_flags(&self, name: &str) -> Option<QueueFlags> {
        self.queues.get(name).map(|q| q.flags.clone())
    }

    pub(crate) fn queue_depth(&self, name: &str) -> Option<usize> {
        self.queues.get(name).map(|q| q.ready.len())
    }

    pub(crate) fn unacked_count(&self, name: &str) -> Option<usize> {
        self.queues.get(name).map(|q| q.unacked.len())
    }

    pub(crate) fn consumer_count(&self, name: &str) -> Option<usize> {
        self.queues.get(name).map(|q| q.consumers.len())
    }
}

#[derive(Debug, Clone, Copy)]
enum Settle {
    Ack,
    Requeue,
    DeadLetter,
}

struct MemoryAcker {
    shared: Shared,
    queue: String,
    delivery_tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> PubSubResult<()> {
        lock(&self.shared).settle(&self.shared, &self.queue, self.delivery_tag, Settle::Ack)
    }

    async fn nack(&self, requeue: bool) -> PubSubResult<()> {
        let outcome = if requeue {
            Settle::Requeue
        } else {
            Settle::DeadLetter
        };
        lock(&self.shared).settle(&self.shared, &self.queue, self.delivery_tag, outcome)
    }
}
