//! Logs payment outcome events from the optional audit queue.

use async_trait::async_trait;
use messaging::{DeliveryContext, EventEnvelope, EventType, Handled, HandlerError, MessageHandler};

/// Consumer of `payment.*`: records each event in the log and acknowledges.
#[derive(Debug, Default)]
pub struct PaymentEventAudit;

impl PaymentEventAudit {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MessageHandler for PaymentEventAudit {
    async fn handle(
        &self,
        envelope: EventEnvelope,
        context: &DeliveryContext,
    ) -> Result<Handled, HandlerError> {
        if !matches!(
            envelope.event_type(),
            EventType::PaymentSucceeded | EventType::PaymentFailed
        ) {
            return Ok(Handled::Skipped);
        }
        let payload = &envelope.payload;
        tracing::info!(
            queue = %context.queue,
            event_type = %payload.event_type,
            message_id = %envelope.message_id,
            correlation_id = %envelope.correlation_id(),
            order_id = %payload.order_id,
            user_id = %payload.user_id,
            product_id = %payload.product_id,
            quantity = payload.quantity,
            status = payload.status.as_deref(),
            reason = payload.reason.as_deref(),
            "payment event"
        );
        Ok(Handled::Applied)
    }
}
