use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::oneshot;

use crate::connection::{ChannelRole, ConnectionManager};
use crate::envelope::{CONTENT_TYPE_JSON, EventEnvelope, EventPayload};
use crate::settings::PublisherSettings;
use crate::topology::DeclaredTopology;
use crate::transport::{
    BrokerChannel, ChannelEvent, ChannelEvents, Flow, HeaderValue, MessageProperties,
    OutboundMessage,
};
use crate::{MessageId, MessagingError, Result};

/// Per-publish options. Unset fields fall back to generated identity and the
/// publisher's configured defaults.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub message_id: Option<MessageId>,
    pub correlation_id: Option<MessageId>,
    pub mandatory: Option<bool>,
    pub headers: BTreeMap<String, HeaderValue>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_message_id(mut self, id: MessageId) -> Self {
        self.message_id = Some(id);
        self
    }

    pub fn with_correlation_id(mut self, id: MessageId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = Some(mandatory);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: HeaderValue) -> Self {
        self.headers.insert(name.into(), value);
        self
    }
}

struct PendingConfirm {
    generation: u64,
    resolve: oneshot::Sender<Result<()>>,
}

struct Session {
    channel: Arc<dyn BrokerChannel>,
    generation: u64,
}

#[derive(Default)]
struct Inflight {
    pending: Mutex<HashMap<MessageId, PendingConfirm>>,
    generations: AtomicU64,
}

impl Inflight {
    fn lock(&self) -> MutexGuard<'_, HashMap<MessageId, PendingConfirm>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, message_id: &MessageId, generation: u64) -> Result<oneshot::Receiver<Result<()>>> {
        let mut pending = self.lock();
        if pending.contains_key(message_id) {
            return Err(MessagingError::DuplicateInFlight(message_id.clone()));
        }
        let (resolve, confirmation) = oneshot::channel();
        pending.insert(
            message_id.clone(),
            PendingConfirm {
                generation,
                resolve,
            },
        );
        Ok(confirmation)
    }

    fn forget(&self, message_id: &MessageId) {
        self.lock().remove(message_id);
    }

    /// Resolves one pending publish. Entries are removed before resolving, so
    /// each is resolved at most once.
    fn resolve(&self, message_id: &MessageId, outcome: Result<()>) {
        let entry = self.lock().remove(message_id);
        match entry {
            Some(entry) => {
                let _ = entry.resolve.send(outcome);
            }
            None => tracing::debug!(%message_id, "confirm for untracked message"),
        }
    }

    /// Fails every publish still pending on the channel of `generation`.
    fn fail_generation(&self, generation: u64, reason: &str) {
        let failed: Vec<(MessageId, PendingConfirm)> = {
            let mut pending = self.lock();
            let ids: Vec<MessageId> = pending
                .iter()
                .filter(|(_, entry)| entry.generation == generation)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|entry| (id, entry)))
                .collect()
        };
        if !failed.is_empty() {
            tracing::warn!(count = failed.len(), reason, "failing unconfirmed publishes");
        }
        for (_, entry) in failed {
            let _ = entry
                .resolve
                .send(Err(MessagingError::ConnectionReset(reason.to_string())));
        }
    }
}

/// Routes channel events of one publisher channel to pending publishes.
async fn dispatch_confirms(inflight: Arc<Inflight>, generation: u64, mut events: ChannelEvents) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Acked { message_id } => inflight.resolve(&message_id, Ok(())),
            ChannelEvent::Nacked { message_id } => {
                tracing::warn!(%message_id, "publish nacked by broker");
                inflight.resolve(
                    &message_id,
                    Err(MessagingError::Rejected {
                        message_id: message_id.clone(),
                    }),
                );
            }
            ChannelEvent::Returned {
                message_id,
                exchange,
                routing_key,
                reply_code,
                reply_text,
            } => {
                tracing::error!(
                    %exchange,
                    %routing_key,
                    message_id = message_id.as_ref().map(MessageId::as_str),
                    reply_code,
                    %reply_text,
                    "UNROUTABLE (returned to publisher)"
                );
                if let Some(message_id) = message_id {
                    inflight.resolve(
                        &message_id,
                        Err(MessagingError::Unroutable {
                            message_id: message_id.clone(),
                            exchange,
                            routing_key,
                            reply_code,
                            reply_text,
                        }),
                    );
                }
            }
            ChannelEvent::Closed { reason } => {
                inflight.fail_generation(generation, &reason);
                return;
            }
        }
    }
    inflight.fail_generation(generation, "rabbitmq_connection_reset");
}

/// Publishes envelopes on a confirm-mode channel and awaits each outcome.
///
/// A publish resolves only when the broker confirms it, rejects it, returns
/// it as unroutable, or the channel is lost. Cloning shares the pending map.
#[derive(Clone)]
pub struct ReliablePublisher {
    connections: ConnectionManager,
    exchange: String,
    settings: PublisherSettings,
    inflight: Arc<Inflight>,
    session: Arc<tokio::sync::Mutex<Option<Session>>>,
}

impl ReliablePublisher {
    pub fn new(
        connections: ConnectionManager,
        topology: &DeclaredTopology,
        settings: PublisherSettings,
    ) -> Self {
        Self {
            connections,
            exchange: topology.events_exchange.clone(),
            settings,
            inflight: Arc::default(),
            session: Arc::default(),
        }
    }

    /// Number of publishes awaiting a broker outcome.
    pub fn pending_count(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Wraps `payload` in a new envelope and publishes it.
    ///
    /// Returns the envelope that was sent so callers can republish it with
    /// the same identity.
    pub async fn publish(
        &self,
        routing_key: &str,
        payload: EventPayload,
        options: PublishOptions,
    ) -> Result<EventEnvelope> {
        let mut builder = EventEnvelope::builder(payload);
        if let Some(id) = options.message_id.clone() {
            builder = builder.message_id(id);
        }
        if let Some(id) = options.correlation_id.clone() {
            builder = builder.correlation_id(id);
        }
        let envelope = builder.build();
        self.publish_envelope(routing_key, &envelope, options).await?;
        Ok(envelope)
    }

    /// Publishes an already built envelope unchanged.
    #[tracing::instrument(skip(self, envelope, options), fields(message_id = %envelope.message_id))]
    pub async fn publish_envelope(
        &self,
        routing_key: &str,
        envelope: &EventEnvelope,
        options: PublishOptions,
    ) -> Result<()> {
        let started = Instant::now();
        let outcome = self.send(routing_key, envelope, options).await;
        let label = match &outcome {
            Ok(()) => "acked",
            Err(err) => err.kind().as_str(),
        };
        metrics::counter!("publisher_confirms_total", "outcome" => label).increment(1);
        metrics::histogram!("publisher_confirm_seconds").record(started.elapsed().as_secs_f64());
        outcome
    }

    async fn send(
        &self,
        routing_key: &str,
        envelope: &EventEnvelope,
        options: PublishOptions,
    ) -> Result<()> {
        let message_id = envelope.message_id.clone();
        let message = OutboundMessage {
            exchange: self.exchange.clone(),
            routing_key: routing_key.to_string(),
            mandatory: options.mandatory.unwrap_or(self.settings.mandatory),
            body: envelope.encode()?,
            properties: MessageProperties {
                message_id: Some(message_id.clone()),
                correlation_id: Some(envelope.correlation_id().to_string()),
                content_type: Some(CONTENT_TYPE_JSON.to_string()),
                persistent: true,
                timestamp: u64::try_from(envelope.created_at.timestamp()).ok(),
                headers: options.headers,
            },
        };

        let (channel, generation) = self.session().await?;
        let confirmation = self.inflight.track(&message_id, generation)?;

        match channel.publish(message).await {
            Ok(Flow::Ready) => {}
            Ok(Flow::Saturated) => {
                metrics::counter!("publisher_backpressure_total").increment(1);
                tracing::warn!(%routing_key, "publish buffer full, awaiting confirm");
            }
            Err(err) => {
                self.inflight.forget(&message_id);
                return Err(err);
            }
        }

        match confirmation.await {
            Ok(outcome) => outcome,
            Err(_) => Err(MessagingError::ConnectionReset(
                "confirm tracking dropped".to_string(),
            )),
        }
    }

    /// Returns the current publisher channel, attaching a confirm dispatcher
    /// the first time a channel is seen.
    async fn session(&self) -> Result<(Arc<dyn BrokerChannel>, u64)> {
        let channel = self.connections.channel(ChannelRole::Publisher).await?;
        let mut session = self.session.lock().await;
        if let Some(current) = &*session
            && Arc::ptr_eq(&current.channel, &channel)
        {
            return Ok((channel, current.generation));
        }

        let events = channel.take_events().ok_or_else(|| {
            MessagingError::Channel("publisher channel events already claimed".to_string())
        })?;
        let generation = self.inflight.generations.fetch_add(1, Ordering::Relaxed) + 1;
        tokio::spawn(dispatch_confirms(self.inflight.clone(), generation, events));
        tracing::debug!(generation, "publisher channel attached");

        *session = Some(Session {
            channel: channel.clone(),
            generation,
        });
        Ok((channel, generation))
    }
}
