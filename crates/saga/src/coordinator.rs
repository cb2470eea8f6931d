//! Saga coordinator for order placement and payment decisions.

use chrono::{DateTime, Utc};
use common::{MessageId, OrderId};
use messaging::{
    DeclaredTopology, EventEnvelope, EventPayload, EventType, PublishOptions, ReliablePublisher,
};

use crate::commands::{ApprovePayment, PlaceOrder, RejectPayment};
use crate::error::{Result, SagaError};
use crate::models::{NewOrder, NewPayment, NewReservation, Payment};
use crate::outcome::{OrderPlaced, PaymentSettled, SagaOutcome};
use crate::settings::SagaSettings;
use crate::status::{OrderStatus, PaymentStatus, ReservationStatus};
use crate::store::{SagaStore, SagaTransaction};

/// Reason carried by `payment.failed` for an operator rejection.
pub const REASON_MANUAL_REJECTION: &str = "MANUAL_REJECTION";
/// Reason carried by `payment.failed` when the reservation window elapsed.
pub const REASON_RESERVATION_EXPIRED: &str = "RESERVATION_EXPIRED";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Approve,
    Reject,
    /// Rejection by the expiry sweep; also settles orders that never got a
    /// payment row.
    Expire,
}

impl Decision {
    fn payment_status(self) -> PaymentStatus {
        match self {
            Decision::Approve => PaymentStatus::Succeeded,
            Decision::Reject | Decision::Expire => PaymentStatus::Failed,
        }
    }

    fn order_status(self) -> OrderStatus {
        match self {
            Decision::Approve => OrderStatus::Confirmed,
            Decision::Reject | Decision::Expire => OrderStatus::Cancelled,
        }
    }

    fn reservation_status(self) -> ReservationStatus {
        match self {
            Decision::Approve => ReservationStatus::Committed,
            Decision::Reject | Decision::Expire => ReservationStatus::Expired,
        }
    }

    fn event_type(self) -> EventType {
        match self {
            Decision::Approve => EventType::PaymentSucceeded,
            Decision::Reject | Decision::Expire => EventType::PaymentFailed,
        }
    }

    fn reason(self) -> Option<&'static str> {
        match self {
            Decision::Approve => None,
            Decision::Reject => Some(REASON_MANUAL_REJECTION),
            Decision::Expire => Some(REASON_RESERVATION_EXPIRED),
        }
    }
}

fn record<T>(command: &'static str, result: &Result<SagaOutcome<T>>) {
    let outcome = match result {
        Ok(outcome) => outcome.label(),
        Err(err) => err.code(),
    };
    metrics::counter!("saga_commands_total", "command" => command, "outcome" => outcome)
        .increment(1);
}

async fn rollback(tx: Box<dyn SagaTransaction>) {
    if let Err(err) = tx.rollback().await {
        tracing::warn!(error = %err, "transaction rollback failed");
    }
}

/// Runs the saga's relational transitions and publishes their events.
///
/// Every command runs its checks and writes in one transaction and publishes
/// strictly after commit. A publish failure never undoes the commit; it is
/// returned as [`SagaOutcome::CommittedUnpublished`].
pub struct SagaCoordinator<S: SagaStore> {
    store: S,
    publisher: ReliablePublisher,
    settings: SagaSettings,
    payment_events_routed: bool,
}

impl<S: SagaStore> SagaCoordinator<S> {
    /// Creates a new saga coordinator.
    ///
    /// `payment.*` events are published as mandatory only when the topology
    /// binds a queue to them; `order.created` always is.
    pub fn new(
        store: S,
        publisher: ReliablePublisher,
        topology: &DeclaredTopology,
        settings: SagaSettings,
    ) -> Self {
        Self {
            store,
            publisher,
            settings,
            payment_events_routed: topology.routes(EventType::PaymentSucceeded.routing_key())
                && topology.routes(EventType::PaymentFailed.routing_key()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn settings(&self) -> &SagaSettings {
        &self.settings
    }

    /// Reserves capacity for a new order and publishes `order.created`.
    ///
    /// Fails with [`SagaError::InsufficientCapacity`] or
    /// [`SagaError::NotFound`] without writing anything.
    #[tracing::instrument(
        skip(self, cmd),
        fields(user_id = %cmd.user_id, product_id = %cmd.product_id, quantity = cmd.quantity)
    )]
    pub async fn place_order(&self, cmd: PlaceOrder) -> Result<SagaOutcome<OrderPlaced>> {
        let result = self.try_place_order(cmd).await;
        record("place_order", &result);
        result
    }

    /// Approves the pending payment of an order, confirming the order and
    /// committing its reservation, then publishes `payment.succeeded`.
    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id))]
    pub async fn approve_payment(
        &self,
        cmd: ApprovePayment,
    ) -> Result<SagaOutcome<PaymentSettled>> {
        let result = self.settle(cmd.order_id, Decision::Approve).await;
        record("approve_payment", &result);
        result
    }

    /// Rejects the pending payment of an order, cancelling the order and
    /// releasing its reservation, then publishes `payment.failed`.
    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id))]
    pub async fn reject_payment(&self, cmd: RejectPayment) -> Result<SagaOutcome<PaymentSettled>> {
        let result = self.settle(cmd.order_id, Decision::Reject).await;
        record("reject_payment", &result);
        result
    }

    /// Rejects orders whose reservation is still held past its expiry.
    ///
    /// An order whose `order.created` never produced a payment gets a FAILED
    /// payment in the same transaction, so the capacity is released and a
    /// late event finds the order already settled. Orders whose payment was
    /// decided meanwhile are skipped. Store failures stop the sweep.
    #[tracing::instrument(skip(self))]
    pub async fn expire_overdue(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<SagaOutcome<PaymentSettled>>> {
        let overdue = self
            .store
            .overdue_reservations(now, self.settings.sweep_batch)
            .await?;

        let mut expired = Vec::with_capacity(overdue.len());
        for reservation in overdue {
            let result = self.settle(reservation.order_id, Decision::Expire).await;
            record("expire_reservation", &result);
            match result {
                Ok(outcome) => expired.push(outcome),
                Err(err) if err.is_rejection() => {
                    tracing::debug!(
                        order_id = %reservation.order_id,
                        reason = %err,
                        "overdue reservation skipped"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "expired overdue reservations");
        }
        Ok(expired)
    }

    /// Publishes an event left unpublished by an earlier command, keeping its
    /// message identifier.
    #[tracing::instrument(skip(self, event), fields(message_id = %event.message_id))]
    pub async fn retry_publish(&self, event: &EventEnvelope) -> Result<()> {
        self.publish(event).await?;
        Ok(())
    }

    async fn try_place_order(&self, cmd: PlaceOrder) -> Result<SagaOutcome<OrderPlaced>> {
        cmd.validate()?;

        let mut tx = self.store.begin().await?;
        let placed = match self.reserve(tx.as_mut(), &cmd).await {
            Ok(placed) => placed,
            Err(err) => {
                rollback(tx).await;
                return Err(err);
            }
        };
        tx.commit().await?;

        let order = &placed.order;
        tracing::info!(
            order_id = %order.id,
            reservation_id = %placed.reservation.id,
            expires_at = %placed.reservation.expires_at,
            "order placed"
        );
        let payload = EventPayload::new(
            EventType::OrderCreated,
            order.id,
            order.user_id,
            order.product_id,
            order.quantity,
        )
        .with_status(order.status.as_str());
        Ok(self.emit(placed, payload, None).await)
    }

    async fn reserve(&self, tx: &mut dyn SagaTransaction, cmd: &PlaceOrder) -> Result<OrderPlaced> {
        let capacity = tx
            .lock_product_capacity(cmd.product_id)
            .await?
            .ok_or(SagaError::NotFound {
                entity: "product",
                id: cmd.product_id.as_i64(),
            })?;
        let held = tx.held_quantity(cmd.product_id).await?;
        let available = (capacity - held).max(0);
        let requested = i64::from(cmd.quantity);
        if requested > available {
            return Err(SagaError::InsufficientCapacity {
                product_id: cmd.product_id,
                requested,
                available,
            });
        }

        let order = tx
            .insert_order(NewOrder {
                user_id: cmd.user_id,
                product_id: cmd.product_id,
                quantity: cmd.quantity,
            })
            .await?;
        let reservation = tx
            .insert_reservation(NewReservation {
                order_id: order.id,
                product_id: order.product_id,
                quantity: order.quantity,
                expires_at: self.settings.reservation_expiry(Utc::now()),
            })
            .await?;
        Ok(OrderPlaced { order, reservation })
    }

    async fn settle(
        &self,
        order_id: OrderId,
        decision: Decision,
    ) -> Result<SagaOutcome<PaymentSettled>> {
        if !order_id.is_valid() {
            return Err(SagaError::InvalidCommand(format!(
                "invalid order id {order_id}"
            )));
        }

        let mut tx = self.store.begin().await?;
        let settled = match self.decide(tx.as_mut(), order_id, decision).await {
            Ok(settled) => settled,
            Err(err) => {
                rollback(tx).await;
                return Err(err);
            }
        };
        tx.commit().await?;

        tracing::info!(
            %order_id,
            payment_status = %settled.payment.status,
            order_status = %settled.order.status,
            reservations = settled.reservations_transitioned,
            "payment settled"
        );

        let order = &settled.order;
        let mut payload = EventPayload::new(
            decision.event_type(),
            order.id,
            order.user_id,
            order.product_id,
            order.quantity,
        )
        .with_status(settled.payment.status.as_str());
        if let Some(reason) = decision.reason() {
            payload = payload.with_reason(reason);
        }
        let correlation = settled.payment.message_id.clone();
        Ok(self.emit(settled, payload, Some(correlation)).await)
    }

    async fn decide(
        &self,
        tx: &mut dyn SagaTransaction,
        order_id: OrderId,
        decision: Decision,
    ) -> Result<PaymentSettled> {
        let mut payment = match tx.lock_payment_for_order(order_id).await? {
            Some(payment) => payment,
            None if decision == Decision::Expire => self.unpaid_payment(tx, order_id).await?,
            None => {
                return Err(SagaError::NotFound {
                    entity: "payment",
                    id: order_id.as_i64(),
                });
            }
        };
        if payment.status != PaymentStatus::Pending {
            return Err(SagaError::AlreadyProcessed {
                order_id,
                status: payment.status.to_string(),
            });
        }

        tx.set_payment_status(payment.id, decision.payment_status())
            .await?;
        payment.status = decision.payment_status();

        let order = tx
            .set_order_status(order_id, decision.order_status())
            .await?
            .ok_or(SagaError::NotFound {
                entity: "order",
                id: order_id.as_i64(),
            })?;

        let reservations_transitioned = tx
            .transition_reservation(
                order_id,
                ReservationStatus::Reserved,
                decision.reservation_status(),
            )
            .await?;

        Ok(PaymentSettled {
            order,
            payment,
            reservations_transitioned,
        })
    }

    /// Creates the PENDING payment an expiring order never received.
    ///
    /// If the payment consumer inserted one concurrently, that row is used.
    async fn unpaid_payment(
        &self,
        tx: &mut dyn SagaTransaction,
        order_id: OrderId,
    ) -> Result<Payment> {
        let order = tx
            .set_order_status(order_id, OrderStatus::Cancelled)
            .await?
            .ok_or(SagaError::NotFound {
                entity: "order",
                id: order_id.as_i64(),
            })?;
        let inserted = tx
            .insert_payment(NewPayment {
                order_id,
                user_id: order.user_id,
                amount: i64::from(order.quantity).saturating_mul(self.settings.unit_price),
                message_id: MessageId::new(),
            })
            .await?;
        if let Some(payment) = inserted {
            tracing::warn!(%order_id, "order expired before its payment was created");
            return Ok(payment);
        }
        tx.lock_payment_for_order(order_id)
            .await?
            .ok_or(SagaError::NotFound {
                entity: "payment",
                id: order_id.as_i64(),
            })
    }

    async fn emit<T>(
        &self,
        value: T,
        payload: EventPayload,
        correlation_id: Option<MessageId>,
    ) -> SagaOutcome<T> {
        let mut builder = EventEnvelope::builder(payload);
        if let Some(id) = correlation_id {
            builder = builder.correlation_id(id);
        }
        let event = builder.build();

        let published = self.publish(&event).await;
        if let Err(err) = &published {
            tracing::error!(
                message_id = %event.message_id,
                routing_key = event.routing_key(),
                error = %err,
                "transaction committed but event not published"
            );
        }
        SagaOutcome::from_publish(value, event, published)
    }

    async fn publish(&self, event: &EventEnvelope) -> messaging::Result<()> {
        let mandatory = match event.event_type() {
            EventType::OrderCreated => true,
            EventType::PaymentSucceeded | EventType::PaymentFailed => self.payment_events_routed,
        };
        self.publisher
            .publish_envelope(
                event.routing_key(),
                event,
                PublishOptions::new().mandatory(mandatory),
            )
            .await
    }
}
