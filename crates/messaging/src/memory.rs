//! An in-process broker with RabbitMQ routing semantics.
//!
//! Used by the test suites and for running the service without a broker. It
//! implements durable exchanges (topic, direct, fanout), queue arguments
//! (dead-letter routing, message TTL, bounded length), mandatory returns,
//! publisher confirms, per-consumer prefetch and requeue. Fault injection
//! hooks let tests refuse connections, hold or nack confirms and sever every
//! open connection.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::transport::{
    BrokerChannel, BrokerConnection, ChannelEvent, ChannelEvents, ChannelMode, Connector,
    DeathInfo, Delivery, DeliveryStream, ExchangeKind, Flow, MessageProperties, OutboundMessage,
    Overflow, QueueArguments,
};
use crate::topology::topic_matches;
use crate::{MessagingError, Result};

/// Reply code the broker uses for an unroutable mandatory message.
const NO_ROUTE: u16 = 312;

/// A snapshot of a message sitting in a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub redelivered: bool,
    pub death: Option<DeathInfo>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message: QueuedMessage,
    enqueued_at: Instant,
}

#[derive(Debug, Clone)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

struct ConsumerSlot {
    channel_id: u64,
    tag: String,
    prefetch: u16,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct QueueState {
    arguments: QueueArguments,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    message: QueuedMessage,
}

struct ChannelSlot {
    connection_id: u64,
    open: bool,
    mode: ChannelMode,
    events: mpsc::UnboundedSender<ChannelEvent>,
    next_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
}

struct ConnectionSlot {
    open: bool,
    close_tx: watch::Sender<bool>,
}

#[derive(Default)]
struct Faults {
    refuse_connects: usize,
    connect_delay: Option<Duration>,
    hold_confirms: bool,
    held_confirms: Vec<(u64, ChannelEvent)>,
    nack_next: usize,
    saturated: bool,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    connections: HashMap<u64, ConnectionSlot>,
    channels: HashMap<u64, ChannelSlot>,
    next_id: u64,
    connect_attempts: usize,
    faults: Faults,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn open_channel(&self, channel_id: u64) -> Result<&ChannelSlot> {
        match self.channels.get(&channel_id) {
            Some(slot) if slot.open => Ok(slot),
            _ => Err(MessagingError::Channel(format!(
                "channel {channel_id} is closed"
            ))),
        }
    }

    /// Delivers a message to every queue bound to `exchange` for `routing_key`.
    /// Returns how many queues accepted it and whether any refused it.
    fn route(&mut self, exchange: &str, message: QueuedMessage) -> (usize, bool) {
        let Some(kind) = self.exchanges.get(exchange).copied() else {
            return (0, false);
        };
        let mut targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| match kind {
                ExchangeKind::Topic => topic_matches(&b.routing_key, &message.routing_key),
                ExchangeKind::Direct => b.routing_key == message.routing_key,
                ExchangeKind::Fanout => true,
            })
            .map(|b| b.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();

        let mut accepted = 0;
        let mut refused = false;
        for queue in targets {
            if self.enqueue(&queue, message.clone()) {
                accepted += 1;
            } else {
                refused = true;
            }
        }
        (accepted, refused)
    }

    /// Appends to a queue, applying its length limit. Returns false if the
    /// queue refused the message.
    fn enqueue(&mut self, queue_name: &str, message: QueuedMessage) -> bool {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return false;
        };
        let mut dropped = Vec::new();
        if let Some(max_length) = queue.arguments.max_length {
            let max_length = max_length as usize;
            if queue.ready.len() >= max_length {
                match queue.arguments.overflow.unwrap_or(Overflow::DropHead) {
                    Overflow::RejectPublish => return false,
                    Overflow::DropHead => {
                        while queue.ready.len() >= max_length.max(1) {
                            match queue.ready.pop_front() {
                                Some(head) => dropped.push(head.message),
                                None => break,
                            }
                        }
                        if max_length == 0 {
                            dropped.push(message);
                            for head in dropped {
                                self.dead_letter(queue_name, head, "maxlen");
                            }
                            return true;
                        }
                    }
                }
            }
        }
        queue.ready.push_back(StoredMessage {
            message,
            enqueued_at: Instant::now(),
        });
        for head in dropped {
            self.dead_letter(queue_name, head, "maxlen");
        }
        true
    }

    /// Moves a message out of `queue_name` through its dead-letter exchange,
    /// or discards it when the queue has none.
    fn dead_letter(&mut self, queue_name: &str, mut message: QueuedMessage, reason: &str) {
        let Some(arguments) = self.queues.get(queue_name).map(|q| q.arguments.clone()) else {
            return;
        };
        let Some(exchange) = arguments.dead_letter_exchange else {
            tracing::debug!(queue = queue_name, reason, "message discarded (no dead-letter exchange)");
            return;
        };

        let count = match &message.death {
            Some(death) if death.queue == queue_name && death.reason == reason => death.count + 1,
            _ => 1,
        };
        let original_keys = match &message.death {
            Some(death) if !death.routing_keys.is_empty() => death.routing_keys.clone(),
            _ => vec![message.routing_key.clone()],
        };
        message.death = Some(DeathInfo {
            queue: queue_name.to_string(),
            exchange: message.exchange.clone(),
            routing_keys: original_keys,
            reason: reason.to_string(),
            count,
        });
        if let Some(routing_key) = arguments.dead_letter_routing_key {
            message.routing_key = routing_key;
        }
        message.exchange = exchange.clone();
        message.redelivered = false;
        self.route(&exchange, message);
    }

    fn expire(&mut self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let Some(ttl) = queue.arguments.message_ttl else {
                continue;
            };
            while let Some(front) = queue.ready.front() {
                if now.duration_since(front.enqueued_at) < ttl {
                    break;
                }
                if let Some(stored) = queue.ready.pop_front() {
                    expired.push((name.clone(), stored.message));
                }
            }
        }
        for (queue, message) in expired {
            self.dead_letter(&queue, message, "expired");
        }
    }

    /// Hands ready messages to consumers with spare prefetch capacity.
    fn pump(&mut self) {
        self.expire();
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            loop {
                let BrokerState {
                    queues, channels, ..
                } = self;
                let Some(queue) = queues.get_mut(&name) else {
                    break;
                };
                if queue.ready.is_empty() || queue.consumers.is_empty() {
                    break;
                }

                let count = queue.consumers.len();
                let chosen = (0..count)
                    .map(|offset| (queue.next_consumer + offset) % count)
                    .find(|&index| {
                        let consumer = &queue.consumers[index];
                        let in_flight = channels
                            .get(&consumer.channel_id)
                            .map(|c| {
                                c.unacked
                                    .values()
                                    .filter(|u| u.consumer_tag == consumer.tag)
                                    .count()
                            })
                            .unwrap_or(0);
                        consumer.prefetch == 0 || in_flight < consumer.prefetch as usize
                    });
                let Some(index) = chosen else {
                    break;
                };
                queue.next_consumer = (index + 1) % count;

                let Some(stored) = queue.ready.pop_front() else {
                    break;
                };
                let consumer = &queue.consumers[index];
                let Some(channel) = channels.get_mut(&consumer.channel_id) else {
                    queue.ready.push_front(stored);
                    queue.consumers.remove(index);
                    continue;
                };
                channel.next_tag += 1;
                let delivery_tag = channel.next_tag;
                let message = stored.message;
                let delivery = Delivery {
                    delivery_tag,
                    redelivered: message.redelivered,
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                    body: message.body.clone(),
                    properties: message.properties.clone(),
                    death: message.death.clone(),
                };
                if consumer.tx.send(delivery).is_err() {
                    queue.ready.push_front(StoredMessage {
                        message,
                        enqueued_at: stored.enqueued_at,
                    });
                    queue.consumers.remove(index);
                    continue;
                }
                channel.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: name.clone(),
                        consumer_tag: consumer.tag.clone(),
                        message,
                    },
                );
            }
        }
    }

    fn emit(&mut self, channel_id: u64, event: ChannelEvent) {
        if let Some(channel) = self.channels.get(&channel_id) {
            let _ = channel.events.send(event);
        }
    }

    /// Closes a channel: consumers stop, unacknowledged deliveries go back to
    /// the head of their queues, pending confirms are lost.
    fn close_channel(&mut self, channel_id: u64, reason: &str) {
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return;
        };
        if !channel.open {
            return;
        }
        channel.open = false;
        let _ = channel.events.send(ChannelEvent::Closed {
            reason: reason.to_string(),
        });
        let unacked = std::mem::take(&mut channel.unacked);

        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel_id != channel_id);
        }
        for (_, entry) in unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&entry.queue) {
                let mut message = entry.message;
                message.redelivered = true;
                queue.ready.push_front(StoredMessage {
                    message,
                    enqueued_at: Instant::now(),
                });
            }
        }
        self.faults.held_confirms.retain(|(id, _)| *id != channel_id);
    }

    fn close_connection(&mut self, connection_id: u64, reason: &str) {
        let Some(connection) = self.connections.get_mut(&connection_id) else {
            return;
        };
        if !connection.open {
            return;
        }
        connection.open = false;
        let _ = connection.close_tx.send(true);
        let channel_ids: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for channel_id in channel_ids {
            self.close_channel(channel_id, reason);
        }
    }
}

/// In-memory broker implementing [`Connector`].
///
/// Cloning shares the broker; every connection opened from any clone sees the
/// same exchanges and queues.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuses the next `count` connection attempts.
    pub fn refuse_next_connects(&self, count: usize) {
        self.lock().faults.refuse_connects = count;
    }

    /// Delays every connection attempt.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.lock().faults.connect_delay = delay;
    }

    /// While holding, confirms are queued instead of being emitted.
    pub fn hold_confirms(&self, hold: bool) {
        self.lock().faults.hold_confirms = hold;
    }

    /// Emits every held confirm in publish order.
    pub fn release_confirms(&self) {
        let mut state = self.lock();
        let held = std::mem::take(&mut state.faults.held_confirms);
        for (channel_id, event) in held {
            state.emit(channel_id, event);
        }
    }

    /// Number of confirms currently held back.
    pub fn held_confirm_count(&self) -> usize {
        self.lock().faults.held_confirms.len()
    }

    /// Negatively acknowledges the next `count` confirm-mode publishes.
    pub fn nack_next(&self, count: usize) {
        self.lock().faults.nack_next = count;
    }

    /// Reports every publish as saturating the channel's write buffer.
    pub fn set_saturated(&self, saturated: bool) {
        self.lock().faults.saturated = saturated;
    }

    /// Drops every open connection as a network failure would.
    pub fn sever_connections(&self) {
        let mut state = self.lock();
        let open: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, c)| c.open)
            .map(|(id, _)| *id)
            .collect();
        for connection_id in open {
            state.close_connection(connection_id, "connection severed");
        }
        state.pump();
    }

    /// Closes every channel consuming from `queue`, as a channel-level error
    /// would, and returns how many were closed. Connections stay open.
    pub fn fail_consumer_channels(&self, queue: &str) -> usize {
        let mut state = self.lock();
        let mut channel_ids: Vec<u64> = state
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().map(|c| c.channel_id).collect())
            .unwrap_or_default();
        channel_ids.sort_unstable();
        channel_ids.dedup();
        for channel_id in &channel_ids {
            state.close_channel(*channel_id, "channel error");
        }
        state.pump();
        channel_ids.len()
    }

    /// Total connection attempts, refused ones included.
    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.values().filter(|c| c.open).count()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.lock().exchanges.get(name).copied()
    }

    pub fn queue_arguments(&self, name: &str) -> Option<QueueArguments> {
        self.lock().queues.get(name).map(|q| q.arguments.clone())
    }

    /// Number of consumers attached to `queue`.
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// Routing keys `queue` is bound with on `exchange`.
    pub fn bindings(&self, queue: &str, exchange: &str) -> Vec<String> {
        self.lock()
            .bindings
            .iter()
            .filter(|b| b.queue == queue && b.exchange == exchange)
            .map(|b| b.routing_key.clone())
            .collect()
    }

    /// Messages waiting in `queue` (not yet delivered).
    pub fn queue_depth(&self, queue: &str) -> usize {
        let mut state = self.lock();
        state.pump();
        state.queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    /// Deliveries from `queue` awaiting acknowledgement.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock()
            .channels
            .values()
            .flat_map(|c| c.unacked.values())
            .filter(|u| u.queue == queue)
            .count()
    }

    /// Copies of the messages waiting in `queue`, oldest first.
    pub fn peek(&self, queue: &str) -> Vec<QueuedMessage> {
        let mut state = self.lock();
        state.pump();
        state
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|s| s.message.clone()).collect())
            .unwrap_or_default()
    }

    /// Removes and returns the messages waiting in `queue`.
    pub fn drain(&self, queue: &str) -> Vec<QueuedMessage> {
        let mut state = self.lock();
        state.pump();
        state
            .queues
            .get_mut(queue)
            .map(|q| q.ready.drain(..).map(|s| s.message).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        let delay = {
            let mut state = self.lock();
            state.connect_attempts += 1;
            if state.faults.refuse_connects > 0 {
                state.faults.refuse_connects -= 1;
                return Err(MessagingError::ResourceUnavailable(
                    "connection refused".to_string(),
                ));
            }
            state.faults.connect_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        let id = state.next_id();
        let (close_tx, close_rx) = watch::channel(false);
        state
            .connections
            .insert(id, ConnectionSlot { open: true, close_tx });
        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
            close_rx,
        }))
    }
}

struct MemoryConnection {
    broker: InMemoryBroker,
    id: u64,
    close_rx: watch::Receiver<bool>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.broker
            .lock()
            .connections
            .get(&self.id)
            .is_some_and(|c| c.open)
    }

    fn close_signal(&self) -> watch::Receiver<bool> {
        self.close_rx.clone()
    }

    async fn open_channel(&self, mode: ChannelMode) -> Result<Arc<dyn BrokerChannel>> {
        let mut state = self.broker.lock();
        if !state.connections.get(&self.id).is_some_and(|c| c.open) {
            return Err(MessagingError::ConnectionReset(
                "connection is closed".to_string(),
            ));
        }
        let id = state.next_id();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        state.channels.insert(
            id,
            ChannelSlot {
                connection_id: self.id,
                open: true,
                mode,
                events: events_tx,
                next_tag: 0,
                unacked: BTreeMap::new(),
            },
        );
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
            events: Mutex::new(Some(events_rx)),
        }))
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.lock();
        state.close_connection(self.id, "closed by application");
        state.pump();
        Ok(())
    }
}

struct MemoryChannel {
    broker: InMemoryBroker,
    id: u64,
    events: Mutex<Option<ChannelEvents>>,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.broker
            .lock()
            .channels
            .get(&self.id)
            .is_some_and(|c| c.open)
    }

    fn take_events(&self) -> Option<ChannelEvents> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(MessagingError::Topology(format!(
                "inequivalent arg 'type' for exchange '{name}': received '{}' but current is '{}'",
                kind.as_str(),
                existing.as_str()
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, arguments: &QueueArguments) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        match state.queues.get(name) {
            Some(existing) if existing.arguments != *arguments => {
                Err(MessagingError::Topology(format!(
                    "inequivalent arguments for queue '{name}'"
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    QueueState {
                        arguments: arguments.clone(),
                        ..QueueState::default()
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        if !state.exchanges.contains_key(exchange) {
            return Err(MessagingError::Topology(format!(
                "no exchange '{exchange}'"
            )));
        }
        if !state.queues.contains_key(queue) {
            return Err(MessagingError::Topology(format!("no queue '{queue}'")));
        }
        let exists = state.bindings.iter().any(|b| {
            b.queue == queue && b.exchange == exchange && b.routing_key == routing_key
        });
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<Flow> {
        let mut state = self.broker.lock();
        let mode = state.open_channel(self.id)?.mode;
        if !state.exchanges.contains_key(&message.exchange) {
            return Err(MessagingError::Topology(format!(
                "no exchange '{}'",
                message.exchange
            )));
        }
        let message_id = message.properties.message_id.clone();
        if mode == ChannelMode::Confirm && message_id.is_none() {
            return Err(MessagingError::Channel(
                "confirm-mode publish requires a message id".to_string(),
            ));
        }

        let (accepted, refused) = state.route(
            &message.exchange,
            QueuedMessage {
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                body: message.body,
                properties: message.properties,
                redelivered: false,
                death: None,
            },
        );

        let mut events = Vec::new();
        if accepted == 0 && !refused && message.mandatory {
            events.push(ChannelEvent::Returned {
                message_id: message_id.clone(),
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                reply_code: NO_ROUTE,
                reply_text: "NO_ROUTE".to_string(),
            });
        }
        if let (ChannelMode::Confirm, Some(message_id)) = (mode, message_id) {
            let nack = if state.faults.nack_next > 0 {
                state.faults.nack_next -= 1;
                true
            } else {
                refused
            };
            events.push(if nack {
                ChannelEvent::Nacked { message_id }
            } else {
                ChannelEvent::Acked { message_id }
            });
        }

        for event in events {
            if state.faults.hold_confirms {
                state.faults.held_confirms.push((self.id, event));
            } else {
                state.emit(self.id, event);
            }
        }
        state.pump();

        Ok(if state.faults.saturated {
            Flow::Saturated
        } else {
            Flow::Ready
        })
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let Some(queue_state) = state.queues.get_mut(queue) else {
            return Err(MessagingError::Topology(format!("no queue '{queue}'")));
        };
        queue_state.consumers.push(ConsumerSlot {
            channel_id: self.id,
            tag: consumer_tag.to_string(),
            prefetch,
            tx,
        });
        state.pump();

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        });
        Ok(Box::pin(stream))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        let removed = state
            .channels
            .get_mut(&self.id)
            .and_then(|c| c.unacked.remove(&delivery_tag));
        if removed.is_none() {
            return Err(MessagingError::Channel(format!(
                "unknown delivery tag {delivery_tag}"
            )));
        }
        state.pump();
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        let Some(entry) = state
            .channels
            .get_mut(&self.id)
            .and_then(|c| c.unacked.remove(&delivery_tag))
        else {
            return Err(MessagingError::Channel(format!(
                "unknown delivery tag {delivery_tag}"
            )));
        };
        if requeue {
            if let Some(queue) = state.queues.get_mut(&entry.queue) {
                let mut message = entry.message;
                message.redelivered = true;
                queue.ready.push_front(StoredMessage {
                    message,
                    enqueued_at: Instant::now(),
                });
            }
        } else {
            state.dead_letter(&entry.queue, entry.message, "rejected");
        }
        state.pump();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.lock();
        state.close_channel(self.id, "closed by application");
        state.pump();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;
    use crate::MessageId;

    async fn channel(broker: &InMemoryBroker, mode: ChannelMode) -> Arc<dyn BrokerChannel> {
        let connection = broker.connect().await.unwrap();
        connection.open_channel(mode).await.unwrap()
    }

    fn message(exchange: &str, routing_key: &str, id: &str) -> OutboundMessage {
        OutboundMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            mandatory: true,
            body: id.as_bytes().to_vec(),
            properties: MessageProperties {
                message_id: Some(MessageId::from(id)),
                ..MessageProperties::default()
            },
        }
    }

    #[tokio::test]
    async fn routes_through_topic_bindings_and_returns_unroutable() {
        let broker = InMemoryBroker::new();
        let ch = channel(&broker, ChannelMode::Confirm).await;
        let mut events = ch.take_events().unwrap();
        assert!(ch.take_events().is_none());

        ch.declare_exchange("events", ExchangeKind::Topic).await.unwrap();
        ch.declare_queue("audit", &QueueArguments::durable()).await.unwrap();
        ch.bind_queue("audit", "events", "payment.*").await.unwrap();

        ch.publish(message("events", "payment.failed", "m1")).await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::Acked { message_id: MessageId::from("m1") })
        );
        assert_eq!(broker.queue_depth("audit"), 1);

        ch.publish(message("events", "order.created", "m2")).await.unwrap();
        assert!(matches!(
            events.recv().await,
            Some(ChannelEvent::Returned { reply_code: NO_ROUTE, .. })
        ));
        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::Acked { message_id: MessageId::from("m2") })
        );
    }

    #[tokio::test]
    async fn redeclaration_must_be_equivalent() {
        let broker = InMemoryBroker::new();
        let ch = channel(&broker, ChannelMode::Plain).await;
        ch.declare_exchange("x", ExchangeKind::Topic).await.unwrap();
        ch.declare_exchange("x", ExchangeKind::Topic).await.unwrap();
        assert!(ch.declare_exchange("x", ExchangeKind::Direct).await.is_err());

        let args = QueueArguments::durable().with_dead_letter("dlx", "dead");
        ch.declare_queue("q", &args).await.unwrap();
        ch.declare_queue("q", &args).await.unwrap();
        assert!(matches!(
            ch.declare_queue("q", &QueueArguments::durable()).await,
            Err(MessagingError::Topology(_))
        ));
    }

    #[tokio::test]
    async fn reject_without_requeue_dead_letters_with_history() {
        let broker = InMemoryBroker::new();
        let ch = channel(&broker, ChannelMode::Plain).await;
        ch.declare_exchange("events", ExchangeKind::Topic).await.unwrap();
        ch.declare_exchange("dlx", ExchangeKind::Direct).await.unwrap();
        ch.declare_queue("dlq", &QueueArguments::durable()).await.unwrap();
        ch.bind_queue("dlq", "dlx", "dead").await.unwrap();
        ch.declare_queue("work", &QueueArguments::durable().with_dead_letter("dlx", "dead"))
            .await
            .unwrap();
        ch.bind_queue("work", "events", "order.created").await.unwrap();

        let mut deliveries = ch.consume("work", "c1", 1).await.unwrap();
        ch.publish(message("events", "order.created", "m1")).await.unwrap();
        let delivery = deliveries.next().await.unwrap();
        assert!(!delivery.redelivered);
        ch.reject(delivery.delivery_tag, false).await.unwrap();

        let dead = broker.peek("dlq");
        assert_eq!(dead.len(), 1);
        let death = dead[0].death.clone().unwrap();
        assert_eq!(death.queue, "work");
        assert_eq!(death.reason, "rejected");
        assert_eq!(death.routing_keys, vec!["order.created".to_string()]);
        assert_eq!(dead[0].routing_key, "dead");
    }

    #[tokio::test]
    async fn requeue_marks_redelivered_and_prefetch_bounds_in_flight() {
        let broker = InMemoryBroker::new();
        let ch = channel(&broker, ChannelMode::Plain).await;
        ch.declare_exchange("events", ExchangeKind::Direct).await.unwrap();
        ch.declare_queue("work", &QueueArguments::durable()).await.unwrap();
        ch.bind_queue("work", "events", "k").await.unwrap();
        for id in ["a", "b", "c"] {
            ch.publish(message("events", "k", id)).await.unwrap();
        }

        let mut deliveries = ch.consume("work", "c1", 2).await.unwrap();
        let first = deliveries.next().await.unwrap();
        let _second = deliveries.next().await.unwrap();
        assert_eq!(broker.unacked_count("work"), 2);
        assert_eq!(broker.queue_depth("work"), 1);

        ch.reject(first.delivery_tag, true).await.unwrap();
        let again = deliveries.next().await.unwrap();
        assert!(again.redelivered);
        assert_eq!(again.body, first.body);
    }

    #[tokio::test]
    async fn bounded_queue_drops_head_into_dead_letter() {
        let broker = InMemoryBroker::new();
        let ch = channel(&broker, ChannelMode::Plain).await;
        ch.declare_exchange("events", ExchangeKind::Topic).await.unwrap();
        ch.declare_exchange("dlx", ExchangeKind::Direct).await.unwrap();
        ch.declare_queue("dlq", &QueueArguments::durable()).await.unwrap();
        ch.bind_queue("dlq", "dlx", "dead").await.unwrap();
        let args = QueueArguments::durable()
            .with_dead_letter("dlx", "dead")
            .with_max_length(2, Overflow::DropHead);
        ch.declare_queue("audit", &args).await.unwrap();
        ch.bind_queue("audit", "events", "payment.*").await.unwrap();

        for id in ["m1", "m2", "m3"] {
            ch.publish(message("events", "payment.succeeded", id)).await.unwrap();
        }
        let kept: Vec<Vec<u8>> = broker.peek("audit").into_iter().map(|m| m.body).collect();
        assert_eq!(kept, vec![b"m2".to_vec(), b"m3".to_vec()]);
        let dropped = broker.peek("dlq");
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].body, b"m1".to_vec());
        assert_eq!(dropped[0].death.as_ref().unwrap().reason, "maxlen");
    }

    #[tokio::test]
    async fn expired_messages_are_dead_lettered() {
        let broker = InMemoryBroker::new();
        let ch = channel(&broker, ChannelMode::Plain).await;
        ch.declare_exchange("events", ExchangeKind::Topic).await.unwrap();
        ch.declare_exchange("dlx", ExchangeKind::Direct).await.unwrap();
        ch.declare_queue("dlq", &QueueArguments::durable()).await.unwrap();
        ch.bind_queue("dlq", "dlx", "dead").await.unwrap();
        let args = QueueArguments::durable()
            .with_dead_letter("dlx", "dead")
            .with_message_ttl(Duration::from_millis(20));
        ch.declare_queue("audit", &args).await.unwrap();
        ch.bind_queue("audit", "events", "payment.*").await.unwrap();

        ch.publish(message("events", "payment.failed", "m1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(broker.queue_depth("audit"), 0);
        assert_eq!(broker.peek("dlq")[0].death.as_ref().unwrap().reason, "expired");
    }

    #[tokio::test]
    async fn severing_closes_channels_and_requeues_unacked() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect().await.unwrap();
        let mut signal = connection.close_signal();
        let ch = connection.open_channel(ChannelMode::Confirm).await.unwrap();
        let mut events = ch.take_events().unwrap();
        ch.declare_exchange("events", ExchangeKind::Direct).await.unwrap();
        ch.declare_queue("work", &QueueArguments::durable()).await.unwrap();
        ch.bind_queue("work", "events", "k").await.unwrap();

        let mut deliveries = ch.consume("work", "c1", 0).await.unwrap();
        ch.publish(message("events", "k", "m1")).await.unwrap();
        assert!(matches!(events.recv().await, Some(ChannelEvent::Acked { .. })));
        deliveries.next().await.unwrap();

        broker.sever_connections();
        assert!(!connection.is_open());
        assert!(!ch.is_open());
        signal.wait_for(|closed| *closed).await.unwrap();
        assert!(matches!(events.recv().await, Some(ChannelEvent::Closed { .. })));
        assert!(deliveries.next().await.is_none());

        let requeued = broker.peek("work");
        assert_eq!(requeued.len(), 1);
        assert!(requeued[0].redelivered);
        assert!(ch.publish(message("events", "k", "m2")).await.is_err());
    }

    #[tokio::test]
    async fn refused_connects_are_counted() {
        let broker = InMemoryBroker::new();
        broker.refuse_next_connects(1);
        assert!(matches!(
            broker.connect().await,
            Err(MessagingError::ResourceUnavailable(_))
        ));
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(broker.open_connections(), 1);
    }
}
