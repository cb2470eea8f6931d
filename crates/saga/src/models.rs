//! Rows owned by the saga.

use chrono::{DateTime, Utc};
use common::{MessageId, OrderId, PaymentId, ProductId, ReservationId, UserId};
use serde::{Deserialize, Serialize};

use crate::status::{OrderStatus, PaymentStatus, ReservationStatus};

/// An order placed by a user for some quantity of a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub product_id: ProductId,
    pub quantity: i32,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

/// Product capacity held for one order until its payment is decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryReservation {
    pub id: ReservationId,
    pub product_id: ProductId,
    pub order_id: OrderId,
    pub quantity: i32,
    pub status: ReservationStatus,
    pub expires_at: DateTime<Utc>,
}

impl InventoryReservation {
    /// Returns true if the reservation is still held past its expiry.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Reserved && self.expires_at <= now
    }
}

/// A payment awaiting or holding a decision.
///
/// `message_id` is the identifier of the `order.created` event that created
/// the row and is unique across payments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: PaymentId,
    pub order_id: OrderId,
    pub user_id: UserId,
    pub amount: i64,
    pub status: PaymentStatus,
    pub message_id: MessageId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrder {
    pub user_id: UserId,
    pub product_id: ProductId,
    pub quantity: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub quantity: i32,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPayment {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub amount: i64,
    pub message_id: MessageId,
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn reservation(status: ReservationStatus, expires_at: DateTime<Utc>) -> InventoryReservation {
        InventoryReservation {
            id: ReservationId::new(1),
            product_id: ProductId::new(42),
            order_id: OrderId::new(1),
            quantity: 2,
            status,
            expires_at,
        }
    }

    #[test]
    fn test_overdue_only_while_reserved() {
        let now = Utc::now();
        let past = now - Duration::seconds(1);
        assert!(reservation(ReservationStatus::Reserved, past).is_overdue(now));
        assert!(!reservation(ReservationStatus::Reserved, now + Duration::minutes(5)).is_overdue(now));
        assert!(!reservation(ReservationStatus::Committed, past).is_overdue(now));
        assert!(!reservation(ReservationStatus::Expired, past).is_overdue(now));
    }

    #[test]
    fn test_payment_serializes_camel_case() {
        let payment = Payment {
            id: PaymentId::new(3),
            order_id: OrderId::new(1),
            user_id: UserId::new(9),
            amount: 200,
            status: PaymentStatus::Pending,
            message_id: MessageId::from_string("m-1"),
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&payment).unwrap();
        assert_eq!(json["orderId"], 1);
        assert_eq!(json["messageId"], "m-1");
        assert_eq!(json["status"], "PENDING");
    }
}
