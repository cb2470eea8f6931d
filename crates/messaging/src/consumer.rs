use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use thiserror::Error;

use crate::connection::ConnectionManager;
use crate::envelope::EventEnvelope;
use crate::topology::DeclaredTopology;
use crate::transport::{BrokerChannel, ChannelMode, Delivery};
use crate::{MessagingError, Result};

/// How a delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Reject without requeue; the queue's dead-letter exchange takes it.
    DeadLetter,
    /// Reject with requeue; the broker redelivers it.
    Requeue,
}

/// Raw per-delivery logic. Most consumers implement [`MessageHandler`]
/// instead and get the envelope decoding and outcome policy for free.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle_delivery(&self, queue: &str, delivery: &Delivery) -> Disposition;
}

/// What a handler did with a well-formed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// The effect was applied.
    Applied,
    /// The message identifier was already recorded; nothing was applied.
    Duplicate,
    /// The event is not relevant to this handler.
    Skipped,
}

/// Why a handler could not apply an event. Either way the message is
/// dead-lettered; the variants only change how it is logged.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid event: {0}")]
    Invalid(String),
    #[error("handler failed: {0}")]
    Failed(String),
}

/// Delivery metadata passed alongside the decoded envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryContext {
    pub queue: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub delivery_tag: u64,
}

/// Applies the effect of one event.
///
/// Implementations must be idempotent on [`EventEnvelope::message_id`]: check
/// for an existing record of the identifier and atomically record it with the
/// effect, reporting [`Handled::Duplicate`] when it was already present.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        envelope: EventEnvelope,
        context: &DeliveryContext,
    ) -> std::result::Result<Handled, HandlerError>;
}

/// Decodes and validates deliveries before handing them to a [`MessageHandler`].
///
/// Malformed payloads, missing fields and handler failures are rejected
/// without requeue; everything else is acknowledged.
pub struct EnvelopeHandler<H> {
    handler: Arc<H>,
}

impl<H> EnvelopeHandler<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self { handler }
    }
}

fn record(queue: &str, outcome: &'static str) {
    metrics::counter!(
        "consumer_deliveries_total",
        "queue" => queue.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

#[async_trait]
impl<H: MessageHandler> DeliveryHandler for EnvelopeHandler<H> {
    async fn handle_delivery(&self, queue: &str, delivery: &Delivery) -> Disposition {
        let envelope = match EventEnvelope::decode(&delivery.body)
            .and_then(|envelope| envelope.validate().map(|()| envelope))
        {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(
                    queue,
                    delivery_tag = delivery.delivery_tag,
                    error = %err,
                    "malformed message, dead-lettering"
                );
                record(queue, "malformed");
                return Disposition::DeadLetter;
            }
        };

        let message_id = envelope.message_id.clone();
        let context = DeliveryContext {
            queue: queue.to_string(),
            routing_key: delivery.routing_key.clone(),
            redelivered: delivery.redelivered,
            delivery_tag: delivery.delivery_tag,
        };
        match self.handler.handle(envelope, &context).await {
            Ok(Handled::Applied) => {
                record(queue, "applied");
                Disposition::Ack
            }
            Ok(Handled::Duplicate) => {
                tracing::debug!(queue, %message_id, "duplicate delivery acknowledged");
                record(queue, "duplicate");
                Disposition::Ack
            }
            Ok(Handled::Skipped) => {
                record(queue, "skipped");
                Disposition::Ack
            }
            Err(err) => {
                tracing::warn!(queue, %message_id, error = %err, "consumer error, dead-lettering");
                record(queue, "failed");
                Disposition::DeadLetter
            }
        }
    }
}

/// Which queue to consume and how many deliveries may be in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub queue: String,
    pub prefetch: u16,
    pub consumer_tag: String,
}

impl Subscription {
    pub fn new(queue: impl Into<String>, prefetch: u16) -> Self {
        let queue = queue.into();
        Self {
            consumer_tag: format!("{queue}.consumer"),
            queue,
            prefetch,
        }
    }
}

/// Runs a handler over one queue with at most `prefetch` deliveries in flight.
///
/// Each delivery is settled exactly once: acknowledged, or rejected as the
/// handler decides.
pub struct IdempotentConsumer {
    connections: ConnectionManager,
    subscription: Subscription,
}

impl IdempotentConsumer {
    /// Fails unless the subscribed queue is part of `topology`.
    pub fn new(
        connections: ConnectionManager,
        topology: &DeclaredTopology,
        subscription: Subscription,
    ) -> Result<Self> {
        topology.require(&subscription.queue)?;
        Ok(Self {
            connections,
            subscription,
        })
    }

    pub fn queue(&self) -> &str {
        &self.subscription.queue
    }

    /// Consumes envelopes until `shutdown` resolves.
    pub async fn run<H: MessageHandler>(
        &self,
        handler: Arc<H>,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<()> {
        self.run_with(Arc::new(EnvelopeHandler::new(handler)), shutdown)
            .await
    }

    /// Consumes raw deliveries on a channel of its own until `shutdown`
    /// resolves.
    ///
    /// Returns `Ok` after a requested shutdown once in-flight deliveries are
    /// settled, and [`MessagingError::ConnectionReset`] if the broker ends the
    /// stream first.
    #[tracing::instrument(skip_all, fields(queue = %self.subscription.queue))]
    pub async fn run_with<D: DeliveryHandler>(
        &self,
        handler: Arc<D>,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<()> {
        let Subscription {
            queue,
            prefetch,
            consumer_tag,
        } = &self.subscription;
        let channel = self.connections.dedicated_channel(ChannelMode::Plain).await?;
        let deliveries = match channel.consume(queue, consumer_tag, *prefetch).await {
            Ok(deliveries) => deliveries,
            Err(err) => {
                let _ = channel.close().await;
                return Err(err);
            }
        };
        tracing::info!(queue = %queue, prefetch, "waiting on queue");

        let limit = (*prefetch > 0).then_some(usize::from(*prefetch));
        let mut deliveries = deliveries.take_until(Box::pin(shutdown));
        deliveries
            .by_ref()
            .for_each_concurrent(limit, |delivery| {
                settle(channel.as_ref(), handler.as_ref(), queue, delivery)
            })
            .await;

        if deliveries.is_stopped() {
            if let Err(err) = channel.close().await {
                tracing::debug!(queue = %queue, error = %err, "consumer channel close failed");
            }
            tracing::info!(queue = %queue, "consumer stopped");
            Ok(())
        } else {
            tracing::warn!(queue = %queue, "consumer stream ended by broker");
            Err(MessagingError::ConnectionReset(format!(
                "consumer on '{queue}' lost its channel"
            )))
        }
    }
}

async fn settle<D: DeliveryHandler>(
    channel: &dyn BrokerChannel,
    handler: &D,
    queue: &str,
    delivery: Delivery,
) {
    let tag = delivery.delivery_tag;
    let result = match handler.handle_delivery(queue, &delivery).await {
        Disposition::Ack => channel.ack(tag).await,
        Disposition::DeadLetter => channel.reject(tag, false).await,
        Disposition::Requeue => channel.reject(tag, true).await,
    };
    if let Err(err) = result {
        tracing::warn!(queue, delivery_tag = tag, error = %err, "failed to settle delivery");
    }
}
