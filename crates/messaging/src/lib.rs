//! Reliable event pipeline on top of an AMQP 0-9-1 broker.
//!
//! The crate is organised leaves first:
//! - [`ConnectionManager`] caches one broker connection and one channel per
//!   [`ChannelRole`], sharing in-flight establishment between callers.
//!   Consumers take a dedicated channel on the same connection.
//! - [`TopologyManager`] idempotently declares exchanges, queues, bindings and
//!   dead-letter routing, yielding the [`DeclaredTopology`] every publisher
//!   and consumer is built from.
//! - [`ReliablePublisher`] publishes persistent, confirm-tracked messages and
//!   surfaces nacks, unroutable returns and connection resets as errors.
//! - [`IdempotentConsumer`] runs a handler over a queue with bounded
//!   in-flight deliveries and dead-letters everything it cannot apply.
//! - [`DeadLetterReprocessor`] replays dead-lettered events out of band.
//!
//! The broker itself is reached through the [`transport`] traits, implemented
//! for RabbitMQ by [`AmqpConnector`] and in memory by [`InMemoryBroker`].

pub mod amqp;
pub mod connection;
pub mod consumer;
pub mod dead_letter;
pub mod envelope;
pub mod error;
pub mod memory;
pub mod publisher;
pub mod settings;
pub mod topology;
pub mod transport;

pub use amqp::AmqpConnector;
pub use common::MessageId;
pub use connection::{ChannelRole, ConnectionManager};
pub use consumer::{
    DeliveryContext, DeliveryHandler, Disposition, EnvelopeHandler, Handled, HandlerError,
    IdempotentConsumer, MessageHandler, Subscription,
};
pub use dead_letter::{DeadLetterReprocessor, REPLAY_COUNT_HEADER};
pub use envelope::{CONTENT_TYPE_JSON, EventEnvelope, EventEnvelopeBuilder, EventPayload, EventType};
pub use error::{ErrorKind, MessagingError, Result};
pub use memory::{InMemoryBroker, QueuedMessage};
pub use publisher::{PublishOptions, ReliablePublisher};
pub use settings::{BrokerSettings, ConsumerSettings, PublisherSettings, TopologySettings};
pub use topology::{DeclaredTopology, QueueSpec, TopologyManager};
pub use transport::{
    BrokerChannel, BrokerConnection, ChannelEvent, ChannelMode, Connector, DeathInfo, Delivery,
    DeliveryStream, ExchangeKind, Flow, HeaderValue, MessageProperties, OutboundMessage, Overflow,
    QueueArguments,
};
