//! Creates pending payments from `order.created` events.

use async_trait::async_trait;
use messaging::{DeliveryContext, EventEnvelope, EventType, Handled, HandlerError, MessageHandler};

use crate::error::StoreError;
use crate::models::NewPayment;
use crate::store::SagaStore;

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        HandlerError::Failed(err.to_string())
    }
}

/// Consumer of `order.created`: inserts one PENDING payment per event.
///
/// The event's message identifier is stored with the payment under a unique
/// constraint, so a redelivered event finds the row and applies nothing.
pub struct PaymentIntake<S> {
    store: S,
    unit_price: i64,
}

impl<S: SagaStore> PaymentIntake<S> {
    pub fn new(store: S, unit_price: i64) -> Self {
        Self { store, unit_price }
    }
}

#[async_trait]
impl<S: SagaStore> MessageHandler for PaymentIntake<S> {
    #[tracing::instrument(
        skip(self, envelope, context),
        fields(message_id = %envelope.message_id, order_id = %envelope.payload.order_id)
    )]
    async fn handle(
        &self,
        envelope: EventEnvelope,
        context: &DeliveryContext,
    ) -> Result<Handled, HandlerError> {
        if envelope.event_type() != EventType::OrderCreated {
            return Ok(Handled::Skipped);
        }
        let payload = &envelope.payload;
        let amount = i64::from(payload.quantity)
            .checked_mul(self.unit_price)
            .ok_or_else(|| {
                HandlerError::Invalid(format!("amount overflows for quantity {}", payload.quantity))
            })?;

        let mut tx = self.store.begin().await?;
        let inserted = tx
            .insert_payment(NewPayment {
                order_id: payload.order_id,
                user_id: payload.user_id,
                amount,
                message_id: envelope.message_id.clone(),
            })
            .await?;
        tx.commit().await?;

        match inserted {
            Some(payment) => {
                tracing::info!(
                    payment_id = %payment.id,
                    amount,
                    redelivered = context.redelivered,
                    "payment created"
                );
                Ok(Handled::Applied)
            }
            None => Ok(Handled::Duplicate),
        }
    }
}
