use std::time::Duration;

use async_trait::async_trait;

use crate::consumer::{DeliveryHandler, Disposition};
use crate::envelope::EventEnvelope;
use crate::publisher::{PublishOptions, ReliablePublisher};
use crate::transport::{Delivery, HeaderValue};
use crate::{ErrorKind, MessageId};

/// Header counting how many times a message was replayed from the DLQ.
pub const REPLAY_COUNT_HEADER: &str = "x-replay-count";

/// Death reason of a message a consumer rejected without requeue.
const REJECTED: &str = "rejected";

/// Replays dead-lettered events to the routing key they were first published
/// under, keeping their identity.
///
/// Consumers deduplicate on the message identifier, so a replay of an event
/// that was in fact applied is harmless. Only messages a consumer rejected are
/// replayed. Messages the broker dropped for TTL or length limits, and those
/// that cannot be parsed, have no routing history, cannot be routed, or have
/// been replayed `max_replays` times, are parked: acknowledged off the DLQ and
/// logged.
///
/// A replay that fails for any other reason is requeued after `retry_delay`.
pub struct DeadLetterReprocessor {
    publisher: ReliablePublisher,
    max_replays: u32,
    retry_delay: Duration,
}

impl DeadLetterReprocessor {
    pub fn new(publisher: ReliablePublisher, max_replays: u32) -> Self {
        Self {
            publisher,
            max_replays,
            retry_delay: Duration::from_secs(1),
        }
    }

    /// Sets how long a failed replay holds the message before requeueing it.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    fn park(&self, delivery: &Delivery, message_id: Option<&MessageId>, reason: &str) -> Disposition {
        tracing::error!(
            message_id = message_id.map(MessageId::as_str),
            routing_key = %delivery.routing_key,
            death_reason = delivery.death.as_ref().map(|d| d.reason.as_str()),
            reason,
            "parking dead-lettered message"
        );
        metrics::counter!("dead_letter_parked_total").increment(1);
        Disposition::Ack
    }
}

/// The routing key the message carried before it was dead-lettered.
fn original_routing_key(delivery: &Delivery) -> Option<String> {
    delivery
        .death
        .as_ref()
        .and_then(|death| death.routing_keys.first().cloned())
}

#[async_trait]
impl DeliveryHandler for DeadLetterReprocessor {
    async fn handle_delivery(&self, _queue: &str, delivery: &Delivery) -> Disposition {
        let envelope = match EventEnvelope::decode(&delivery.body) {
            Ok(envelope) => envelope,
            Err(err) => {
                let message_id = delivery.properties.message_id.as_ref();
                return self.park(delivery, message_id, &err.to_string());
            }
        };

        let replays = delivery
            .properties
            .header_int(REPLAY_COUNT_HEADER)
            .unwrap_or(0)
            .max(0);
        if replays >= i64::from(self.max_replays) {
            return self.park(delivery, Some(&envelope.message_id), "replay limit reached");
        }
        if delivery.death.as_ref().is_some_and(|death| death.reason != REJECTED) {
            return self.park(delivery, Some(&envelope.message_id), "dropped by queue policy");
        }
        let Some(routing_key) = original_routing_key(delivery) else {
            return self.park(delivery, Some(&envelope.message_id), "no routing history");
        };

        let options = PublishOptions::new()
            .mandatory(true)
            .header(REPLAY_COUNT_HEADER, HeaderValue::Int(replays + 1));
        match self
            .publisher
            .publish_envelope(&routing_key, &envelope, options)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    message_id = %envelope.message_id,
                    %routing_key,
                    replay = replays + 1,
                    "replayed dead-lettered message"
                );
                metrics::counter!("dead_letter_replayed_total").increment(1);
                Disposition::Ack
            }
            Err(err) if matches!(err.kind(), ErrorKind::Unroutable | ErrorKind::Rejected) => {
                self.park(delivery, Some(&envelope.message_id), &err.to_string())
            }
            Err(err) => {
                tracing::warn!(
                    message_id = %envelope.message_id,
                    error = %err,
                    delay = ?self.retry_delay,
                    "replay failed, leaving message on the DLQ"
                );
                metrics::counter!("dead_letter_replay_failures_total").increment(1);
                tokio::time::sleep(self.retry_delay).await;
                Disposition::Requeue
            }
        }
    }
}
