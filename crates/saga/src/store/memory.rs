use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, PaymentId, ProductId, ReservationId};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{SagaStore, SagaTransaction, StoreResult};
use crate::error::StoreError;
use crate::models::{InventoryReservation, NewOrder, NewPayment, NewReservation, Order, Payment};
use crate::status::{OrderStatus, PaymentStatus, ReservationStatus};

#[derive(Debug, Clone, Default)]
struct Tables {
    products: BTreeMap<ProductId, i64>,
    orders: BTreeMap<OrderId, Order>,
    reservations: BTreeMap<ReservationId, InventoryReservation>,
    payments: BTreeMap<PaymentId, Payment>,
    next_order: i64,
    next_reservation: i64,
    next_payment: i64,
}

impl Tables {
    fn payment_for_order(&self, order_id: OrderId) -> Option<&Payment> {
        self.payments.values().find(|p| p.order_id == order_id)
    }
}

/// In-memory saga store for testing.
///
/// A transaction holds the whole store exclusively and works on a staged
/// copy that replaces the tables on commit. This gives the same isolation the
/// row locks give in PostgreSQL, only coarser.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    tables: Arc<Mutex<Tables>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemorySagaStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or replaces a product with the given capacity.
    pub async fn add_product(&self, product_id: ProductId, capacity: i64) {
        self.tables
            .lock()
            .await
            .products
            .insert(product_id, capacity);
    }

    /// Makes every new transaction fail as if the database were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn orders(&self) -> Vec<Order> {
        self.tables.lock().await.orders.values().cloned().collect()
    }

    pub async fn reservations(&self) -> Vec<InventoryReservation> {
        self.tables
            .lock()
            .await
            .reservations
            .values()
            .cloned()
            .collect()
    }

    pub async fn payments(&self) -> Vec<Payment> {
        self.tables.lock().await.payments.values().cloned().collect()
    }

    /// Moves a reservation's expiry, e.g. into the past.
    pub async fn set_reservation_expiry(&self, order_id: OrderId, expires_at: DateTime<Utc>) {
        let mut tables = self.tables.lock().await;
        for reservation in tables.reservations.values_mut() {
            if reservation.order_id == order_id {
                reservation.expires_at = expires_at;
            }
        }
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn begin(&self) -> StoreResult<Box<dyn SagaTransaction>> {
        self.check_available()?;
        let guard = self.tables.clone().lock_owned().await;
        let staged = (*guard).clone();
        Ok(Box::new(InMemoryTransaction { guard, staged }))
    }

    async fn get_order(&self, order_id: OrderId) -> StoreResult<Option<Order>> {
        self.check_available()?;
        Ok(self.tables.lock().await.orders.get(&order_id).cloned())
    }

    async fn get_reservation_for_order(
        &self,
        order_id: OrderId,
    ) -> StoreResult<Option<InventoryReservation>> {
        self.check_available()?;
        Ok(self
            .tables
            .lock()
            .await
            .reservations
            .values()
            .find(|r| r.order_id == order_id)
            .cloned())
    }

    async fn get_payment_for_order(&self, order_id: OrderId) -> StoreResult<Option<Payment>> {
        self.check_available()?;
        Ok(self.tables.lock().await.payment_for_order(order_id).cloned())
    }

    async fn list_payments(&self, limit: i64) -> StoreResult<Vec<Payment>> {
        self.check_available()?;
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .tables
            .lock()
            .await
            .payments
            .values()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn overdue_reservations(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<InventoryReservation>> {
        self.check_available()?;
        let limit = usize::try_from(limit).unwrap_or(0);
        let mut overdue: Vec<InventoryReservation> = self
            .tables
            .lock()
            .await
            .reservations
            .values()
            .filter(|r| r.is_overdue(now))
            .cloned()
            .collect();
        overdue.sort_by_key(|r| (r.expires_at, r.id));
        overdue.truncate(limit);
        Ok(overdue)
    }
}

struct InMemoryTransaction {
    guard: OwnedMutexGuard<Tables>,
    staged: Tables,
}

#[async_trait]
impl SagaTransaction for InMemoryTransaction {
    async fn lock_product_capacity(&mut self, product_id: ProductId) -> StoreResult<Option<i64>> {
        Ok(self.staged.products.get(&product_id).copied())
    }

    async fn held_quantity(&mut self, product_id: ProductId) -> StoreResult<i64> {
        Ok(self
            .staged
            .reservations
            .values()
            .filter(|r| r.product_id == product_id && r.status.holds_capacity())
            .map(|r| i64::from(r.quantity))
            .sum())
    }

    async fn insert_order(&mut self, order: NewOrder) -> StoreResult<Order> {
        self.staged.next_order += 1;
        let row = Order {
            id: OrderId::new(self.staged.next_order),
            user_id: order.user_id,
            product_id: order.product_id,
            quantity: order.quantity,
            status: OrderStatus::Pending,
            created_at: Utc::now(),
        };
        self.staged.orders.insert(row.id, row.clone());
        Ok(row)
    }

    async fn insert_reservation(
        &mut self,
        reservation: NewReservation,
    ) -> StoreResult<InventoryReservation> {
        self.staged.next_reservation += 1;
        let row = InventoryReservation {
            id: ReservationId::new(self.staged.next_reservation),
            product_id: reservation.product_id,
            order_id: reservation.order_id,
            quantity: reservation.quantity,
            status: ReservationStatus::Reserved,
            expires_at: reservation.expires_at,
        };
        self.staged.reservations.insert(row.id, row.clone());
        Ok(row)
    }

    async fn insert_payment(&mut self, payment: NewPayment) -> StoreResult<Option<Payment>> {
        let conflict = self
            .staged
            .payments
            .values()
            .any(|p| p.message_id == payment.message_id || p.order_id == payment.order_id);
        if conflict {
            return Ok(None);
        }
        self.staged.next_payment += 1;
        let row = Payment {
            id: PaymentId::new(self.staged.next_payment),
            order_id: payment.order_id,
            user_id: payment.user_id,
            amount: payment.amount,
            status: PaymentStatus::Pending,
            message_id: payment.message_id,
            created_at: Utc::now(),
        };
        self.staged.payments.insert(row.id, row.clone());
        Ok(Some(row))
    }

    async fn lock_payment_for_order(&mut self, order_id: OrderId) -> StoreResult<Option<Payment>> {
        Ok(self.staged.payment_for_order(order_id).cloned())
    }

    async fn set_payment_status(
        &mut self,
        payment_id: PaymentId,
        status: PaymentStatus,
    ) -> StoreResult<()> {
        if let Some(payment) = self.staged.payments.get_mut(&payment_id) {
            payment.status = status;
        }
        Ok(())
    }

    async fn set_order_status(
        &mut self,
        order_id: OrderId,
        status: OrderStatus,
    ) -> StoreResult<Option<Order>> {
        Ok(self.staged.orders.get_mut(&order_id).map(|order| {
            order.status = status;
            order.clone()
        }))
    }

    async fn transition_reservation(
        &mut self,
        order_id: OrderId,
        from: ReservationStatus,
        to: ReservationStatus,
    ) -> StoreResult<u64> {
        let mut changed = 0;
        for reservation in self.staged.reservations.values_mut() {
            if reservation.order_id == order_id && reservation.status == from {
                reservation.status = to;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let InMemoryTransaction { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}
