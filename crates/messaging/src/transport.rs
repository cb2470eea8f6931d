//! The broker seam.
//!
//! Everything above this module talks to the broker through these traits so
//! that the same publisher, consumer and topology code runs against RabbitMQ
//! and against [`crate::InMemoryBroker`].

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_core::Stream;
use tokio::sync::{mpsc, watch};

use crate::{MessageId, Result};

/// Exchange routing behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Topic,
    Direct,
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

/// What a bounded queue does once it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Overflow {
    /// Discard (or dead-letter) the oldest message.
    DropHead,
    /// Refuse the incoming message; confirm-mode publishers see a nack.
    RejectPublish,
}

impl Overflow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Overflow::DropHead => "drop-head",
            Overflow::RejectPublish => "reject-publish",
        }
    }
}

/// Queue declaration arguments.
///
/// Two declarations of the same queue must carry equal arguments; the broker
/// refuses an inequivalent redeclaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    pub durable: bool,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub message_ttl: Option<Duration>,
    pub max_length: Option<u32>,
    pub overflow: Option<Overflow>,
}

impl QueueArguments {
    /// Arguments for a plain durable queue.
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Self::default()
        }
    }

    /// Routes rejected, expired and overflowed messages to `exchange`.
    pub fn with_dead_letter(
        mut self,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self.dead_letter_routing_key = Some(routing_key.into());
        self
    }

    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    pub fn with_max_length(mut self, max_length: u32, overflow: Overflow) -> Self {
        self.max_length = Some(max_length);
        self.overflow = Some(overflow);
        self
    }
}

/// Which kind of channel to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelMode {
    Plain,
    /// Publisher confirms enabled.
    Confirm,
}

/// A header value attached to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Int(i64),
    Text(String),
}

impl HeaderValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(value) => Some(*value),
            HeaderValue::Text(text) => text.parse().ok(),
        }
    }
}

/// AMQP basic properties this crate reads or writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub message_id: Option<MessageId>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    /// Delivery mode 2.
    pub persistent: bool,
    /// Seconds since the Unix epoch.
    pub timestamp: Option<u64>,
    pub headers: BTreeMap<String, HeaderValue>,
}

impl MessageProperties {
    pub fn header_int(&self, name: &str) -> Option<i64> {
        self.headers.get(name).and_then(HeaderValue::as_int)
    }
}

/// A message handed to [`BrokerChannel::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// Whether the channel can take more writes right now.
///
/// A saturated channel still accepted the message; it is backpressure, not
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Ready,
    Saturated,
}

/// Dead-lettering history of a message (the first `x-death` entry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeathInfo {
    pub queue: String,
    pub exchange: String,
    pub routing_keys: Vec<String>,
    pub reason: String,
    pub count: i64,
}

/// A message delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub death: Option<DeathInfo>,
}

/// Asynchronous notifications from a channel.
///
/// Confirmations are keyed by message identifier rather than delivery tag so
/// that they can be correlated without sharing the channel's tag counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Acked {
        message_id: MessageId,
    },
    Nacked {
        message_id: MessageId,
    },
    /// A mandatory message matched no queue. Always precedes its confirm.
    Returned {
        message_id: Option<MessageId>,
        exchange: String,
        routing_key: String,
        reply_code: u16,
        reply_text: String,
    },
    /// The channel is gone; no further events follow.
    Closed {
        reason: String,
    },
}

/// A stream of deliveries from one consumer.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

/// Receiver side of a channel's event feed.
pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

/// Opens broker connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>>;
}

/// A live connection to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_open(&self) -> bool;

    /// Flips to `true` once when the connection closes or errors.
    fn close_signal(&self) -> watch::Receiver<bool>;

    async fn open_channel(&self, mode: ChannelMode) -> Result<Arc<dyn BrokerChannel>>;

    async fn close(&self) -> Result<()>;
}

/// A channel multiplexed over a [`BrokerConnection`].
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Hands out the channel's event feed. Returns `None` after the first call.
    fn take_events(&self) -> Option<ChannelEvents>;

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()>;

    async fn declare_queue(&self, name: &str, arguments: &QueueArguments) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn publish(&self, message: OutboundMessage) -> Result<Flow>;

    /// Starts a consumer with at most `prefetch` unacknowledged deliveries
    /// (0 means unbounded).
    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16)
    -> Result<DeliveryStream>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
