//! Relational store behind the saga.
//!
//! All multi-statement saga steps run inside one [`SagaTransaction`], which
//! borrows a single connection for its lifetime. Locking reads take row
//! locks that are held until commit or rollback, so concurrent transactions
//! touching the same product or payment are serialized.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, PaymentId, ProductId};

use crate::error::StoreError;
use crate::models::{InventoryReservation, NewOrder, NewPayment, NewReservation, Order, Payment};
use crate::status::{OrderStatus, PaymentStatus, ReservationStatus};

pub use memory::InMemorySagaStore;
pub use postgres::PostgresSagaStore;

/// Convenience type alias for store results.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Entry point to the store: opens transactions and serves reads.
#[async_trait]
pub trait SagaStore: Send + Sync + 'static {
    /// Opens a transaction.
    ///
    /// Dropping the transaction without committing rolls it back.
    async fn begin(&self) -> StoreResult<Box<dyn SagaTransaction>>;

    async fn get_order(&self, order_id: OrderId) -> StoreResult<Option<Order>>;

    async fn get_reservation_for_order(
        &self,
        order_id: OrderId,
    ) -> StoreResult<Option<InventoryReservation>>;

    async fn get_payment_for_order(&self, order_id: OrderId) -> StoreResult<Option<Payment>>;

    /// Returns the most recent payments, newest first.
    async fn list_payments(&self, limit: i64) -> StoreResult<Vec<Payment>>;

    /// Returns reservations still RESERVED whose expiry is at or before `now`,
    /// oldest expiry first.
    async fn overdue_reservations(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<InventoryReservation>>;
}

/// Statements that run inside one open transaction.
#[async_trait]
pub trait SagaTransaction: Send {
    /// Locks the product row and returns its capacity, or `None` if the
    /// product does not exist.
    async fn lock_product_capacity(&mut self, product_id: ProductId) -> StoreResult<Option<i64>>;

    /// Sums the quantity of RESERVED and COMMITTED reservations for a product.
    async fn held_quantity(&mut self, product_id: ProductId) -> StoreResult<i64>;

    async fn insert_order(&mut self, order: NewOrder) -> StoreResult<Order>;

    async fn insert_reservation(
        &mut self,
        reservation: NewReservation,
    ) -> StoreResult<InventoryReservation>;

    /// Inserts a PENDING payment unless one already exists with the same
    /// message identifier or order. Returns `None` on such a conflict.
    async fn insert_payment(&mut self, payment: NewPayment) -> StoreResult<Option<Payment>>;

    /// Locks and returns the payment row for an order.
    async fn lock_payment_for_order(&mut self, order_id: OrderId) -> StoreResult<Option<Payment>>;

    async fn set_payment_status(
        &mut self,
        payment_id: PaymentId,
        status: PaymentStatus,
    ) -> StoreResult<()>;

    /// Updates the order status and returns the updated row, or `None` if the
    /// order does not exist.
    async fn set_order_status(
        &mut self,
        order_id: OrderId,
        status: OrderStatus,
    ) -> StoreResult<Option<Order>>;

    /// Moves the order's reservations that are currently in `from` to `to`
    /// and returns how many rows changed.
    async fn transition_reservation(
        &mut self,
        order_id: OrderId,
        from: ReservationStatus,
        to: ReservationStatus,
    ) -> StoreResult<u64>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}
