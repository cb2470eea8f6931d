use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{MessageId, OrderId, PaymentId, ProductId, ReservationId, UserId};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};

use super::{SagaStore, SagaTransaction, StoreResult};
use crate::models::{InventoryReservation, NewOrder, NewPayment, NewReservation, Order, Payment};
use crate::status::{OrderStatus, PaymentStatus, ReservationStatus};

const ORDER_COLUMNS: &str = "id, user_id, product_id, quantity, status, created_at";
const RESERVATION_COLUMNS: &str = "id, product_id, order_id, quantity, status, expires_at";
const PAYMENT_COLUMNS: &str = "id, order_id, user_id, amount, status, message_id, created_at";

/// PostgreSQL-backed saga store.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Creates a new PostgreSQL saga store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Creates a product or updates its capacity.
    pub async fn upsert_product(&self, product_id: ProductId, capacity: i64) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO products (id, capacity) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET capacity = EXCLUDED.capacity
            "#,
        )
        .bind(product_id.as_i64())
        .bind(capacity)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_order(row: PgRow) -> StoreResult<Order> {
    Ok(Order {
        id: OrderId::new(row.try_get("id")?),
        user_id: UserId::new(row.try_get("user_id")?),
        product_id: ProductId::new(row.try_get("product_id")?),
        quantity: row.try_get("quantity")?,
        status: row.try_get::<String, _>("status")?.parse::<OrderStatus>()?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_reservation(row: PgRow) -> StoreResult<InventoryReservation> {
    Ok(InventoryReservation {
        id: ReservationId::new(row.try_get("id")?),
        product_id: ProductId::new(row.try_get("product_id")?),
        order_id: OrderId::new(row.try_get("order_id")?),
        quantity: row.try_get("quantity")?,
        status: row
            .try_get::<String, _>("status")?
            .parse::<ReservationStatus>()?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn row_to_payment(row: PgRow) -> StoreResult<Payment> {
    Ok(Payment {
        id: PaymentId::new(row.try_get("id")?),
        order_id: OrderId::new(row.try_get("order_id")?),
        user_id: UserId::new(row.try_get("user_id")?),
        amount: row.try_get("amount")?,
        status: row.try_get::<String, _>("status")?.parse::<PaymentStatus>()?,
        message_id: MessageId::from_string(row.try_get::<String, _>("message_id")?),
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    async fn begin(&self) -> StoreResult<Box<dyn SagaTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTransaction { tx }))
    }

    async fn get_order(&self, order_id: OrderId) -> StoreResult<Option<Order>> {
        sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(order_id.as_i64())
            .fetch_optional(&self.pool)
            .await?
            .map(row_to_order)
            .transpose()
    }

    async fn get_reservation_for_order(
        &self,
        order_id: OrderId,
    ) -> StoreResult<Option<InventoryReservation>> {
        sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM inventory_reservations WHERE order_id = $1"
        ))
        .bind(order_id.as_i64())
        .fetch_optional(&self.pool)
        .await?
        .map(row_to_reservation)
        .transpose()
    }

    async fn get_payment_for_order(&self, order_id: OrderId) -> StoreResult<Option<Payment>> {
        sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE order_id = $1"
        ))
        .bind(order_id.as_i64())
        .fetch_optional(&self.pool)
        .await?
        .map(row_to_payment)
        .transpose()
    }

    async fn list_payments(&self, limit: i64) -> StoreResult<Vec<Payment>> {
        let rows = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments ORDER BY id DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_payment).collect()
    }

    async fn overdue_reservations(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<InventoryReservation>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RESERVATION_COLUMNS}
            FROM inventory_reservations
            WHERE status = 'RESERVED' AND expires_at <= $1
            ORDER BY expires_at ASC, id ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_reservation).collect()
    }
}

struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl SagaTransaction for PostgresTransaction {
    async fn lock_product_capacity(&mut self, product_id: ProductId) -> StoreResult<Option<i64>> {
        let capacity = sqlx::query_scalar::<_, i64>(
            "SELECT capacity FROM products WHERE id = $1 FOR UPDATE",
        )
        .bind(product_id.as_i64())
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(capacity)
    }

    async fn held_quantity(&mut self, product_id: ProductId) -> StoreResult<i64> {
        let held = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COALESCE(SUM(quantity), 0)::BIGINT
            FROM inventory_reservations
            WHERE product_id = $1 AND status IN ('RESERVED', 'COMMITTED')
            "#,
        )
        .bind(product_id.as_i64())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(held)
    }

    async fn insert_order(&mut self, order: NewOrder) -> StoreResult<Order> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO orders (user_id, product_id, quantity, status)
            VALUES ($1, $2, $3, $4)
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(order.user_id.as_i64())
        .bind(order.product_id.as_i64())
        .bind(order.quantity)
        .bind(OrderStatus::Pending.as_str())
        .fetch_one(&mut *self.tx)
        .await?;
        row_to_order(row)
    }

    async fn insert_reservation(
        &mut self,
        reservation: NewReservation,
    ) -> StoreResult<InventoryReservation> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO inventory_reservations (product_id, order_id, quantity, status, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {RESERVATION_COLUMNS}
            "#
        ))
        .bind(reservation.product_id.as_i64())
        .bind(reservation.order_id.as_i64())
        .bind(reservation.quantity)
        .bind(ReservationStatus::Reserved.as_str())
        .bind(reservation.expires_at)
        .fetch_one(&mut *self.tx)
        .await?;
        row_to_reservation(row)
    }

    async fn insert_payment(&mut self, payment: NewPayment) -> StoreResult<Option<Payment>> {
        // No conflict target: a duplicate message id and a second payment
        // for the same order are both no-ops.
        sqlx::query(&format!(
            r#"
            INSERT INTO payments (order_id, user_id, amount, status, message_id)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT DO NOTHING
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(payment.order_id.as_i64())
        .bind(payment.user_id.as_i64())
        .bind(payment.amount)
        .bind(PaymentStatus::Pending.as_str())
        .bind(payment.message_id.as_str())
        .fetch_optional(&mut *self.tx)
        .await?
        .map(row_to_payment)
        .transpose()
    }

    async fn lock_payment_for_order(&mut self, order_id: OrderId) -> StoreResult<Option<Payment>> {
        sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE order_id = $1 FOR UPDATE"
        ))
        .bind(order_id.as_i64())
        .fetch_optional(&mut *self.tx)
        .await?
        .map(row_to_payment)
        .transpose()
    }

    async fn set_payment_status(
        &mut self,
        payment_id: PaymentId,
        status: PaymentStatus,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE payments SET status = $2 WHERE id = $1")
            .bind(payment_id.as_i64())
            .bind(status.as_str())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn set_order_status(
        &mut self,
        order_id: OrderId,
        status: OrderStatus,
    ) -> StoreResult<Option<Order>> {
        sqlx::query(&format!(
            "UPDATE orders SET status = $2 WHERE id = $1 RETURNING {ORDER_COLUMNS}"
        ))
        .bind(order_id.as_i64())
        .bind(status.as_str())
        .fetch_optional(&mut *self.tx)
        .await?
        .map(row_to_order)
        .transpose()
    }

    async fn transition_reservation(
        &mut self,
        order_id: OrderId,
        from: ReservationStatus,
        to: ReservationStatus,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE inventory_reservations SET status = $3 WHERE order_id = $1 AND status = $2",
        )
        .bind(order_id.as_i64())
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
