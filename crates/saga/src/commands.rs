//! Commands accepted by the coordinator.

use common::{OrderId, ProductId, UserId};
use serde::Deserialize;

use crate::error::{Result, SagaError};

/// Places an order for `quantity` units of a product.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrder {
    pub user_id: UserId,
    pub product_id: ProductId,
    pub quantity: i32,
}

impl PlaceOrder {
    pub fn new(user_id: UserId, product_id: ProductId, quantity: i32) -> Self {
        Self {
            user_id,
            product_id,
            quantity,
        }
    }

    /// Rejects non-positive identifiers and quantities.
    pub fn validate(&self) -> Result<()> {
        if !self.user_id.is_valid() {
            return Err(SagaError::InvalidCommand(format!(
                "invalid user id {}",
                self.user_id
            )));
        }
        if !self.product_id.is_valid() {
            return Err(SagaError::InvalidCommand(format!(
                "invalid product id {}",
                self.product_id
            )));
        }
        if self.quantity <= 0 {
            return Err(SagaError::InvalidCommand(format!(
                "quantity must be positive, got {}",
                self.quantity
            )));
        }
        Ok(())
    }
}

/// Marks the payment for an order as succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovePayment {
    pub order_id: OrderId,
}

impl ApprovePayment {
    pub fn new(order_id: OrderId) -> Self {
        Self { order_id }
    }
}

/// Marks the payment for an order as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejectPayment {
    pub order_id: OrderId,
}

impl RejectPayment {
    pub fn new(order_id: OrderId) -> Self {
        Self { order_id }
    }
}
