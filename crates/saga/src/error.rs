//! Saga error types.

use common::{OrderId, ProductId};
use messaging::{ErrorKind, MessagingError};
use thiserror::Error;

/// Failures of the relational store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A row held a value this crate does not understand.
    #[error("Undecodable row: {0}")]
    Decode(String),
}

impl StoreError {
    /// Returns true if the database could not be reached at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StoreError::Database(
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Tls(_)
            )
        )
    }
}

/// Errors returned by saga commands.
///
/// The first four variants are expected business outcomes; the transaction
/// was rolled back and nothing was written. The rest are infrastructure
/// failures left to the caller to retry.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The command failed input validation.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Not enough unreserved capacity for the requested quantity.
    #[error(
        "Insufficient capacity for product {product_id}: requested {requested}, available {available}"
    )]
    InsufficientCapacity {
        product_id: ProductId,
        requested: i64,
        available: i64,
    },

    /// A referenced row does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: i64 },

    /// The payment for the order has already been approved or rejected.
    #[error("Payment for order {order_id} already processed (status {status})")]
    AlreadyProcessed { order_id: OrderId, status: String },

    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Broker error.
    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),
}

impl SagaError {
    /// Stable identifier of the outcome, used on the wire and in metrics.
    pub fn code(&self) -> &'static str {
        match self {
            SagaError::InvalidCommand(_) => "invalid_command",
            SagaError::InsufficientCapacity { .. } => "insufficient_capacity",
            SagaError::NotFound { .. } => "not_found",
            SagaError::AlreadyProcessed { .. } => "already_processed",
            SagaError::Store(err) if err.is_unavailable() => "resource_unavailable",
            SagaError::Store(_) => "store_error",
            SagaError::Messaging(err) => err.kind().as_str(),
        }
    }

    /// Returns true for typed business rejections.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            SagaError::InvalidCommand(_)
                | SagaError::InsufficientCapacity { .. }
                | SagaError::NotFound { .. }
                | SagaError::AlreadyProcessed { .. }
        )
    }

    /// Returns true if the store or the broker could not be reached.
    pub fn is_unavailable(&self) -> bool {
        match self {
            SagaError::Store(err) => err.is_unavailable(),
            SagaError::Messaging(err) => matches!(
                err.kind(),
                ErrorKind::ResourceUnavailable | ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        let err = SagaError::InsufficientCapacity {
            product_id: ProductId::new(42),
            requested: 3,
            available: 0,
        };
        assert_eq!(err.code(), "insufficient_capacity");
        assert!(err.is_rejection());

        let err = SagaError::AlreadyProcessed {
            order_id: OrderId::new(1),
            status: "SUCCEEDED".to_string(),
        };
        assert_eq!(err.code(), "already_processed");
        assert_eq!(
            SagaError::NotFound {
                entity: "payment",
                id: 7
            }
            .to_string(),
            "payment not found: 7"
        );
    }

    #[test]
    fn test_infrastructure_classification() {
        let err = SagaError::from(MessagingError::ConnectionReset("gone".to_string()));
        assert_eq!(err.code(), "connection_reset");
        assert!(err.is_unavailable());
        assert!(!err.is_rejection());

        let err = SagaError::from(StoreError::Database(sqlx::Error::PoolTimedOut));
        assert_eq!(err.code(), "resource_unavailable");
        assert!(err.is_unavailable());

        let err = SagaError::from(StoreError::Decode("status 'X'".to_string()));
        assert_eq!(err.code(), "store_error");
        assert!(!err.is_unavailable());
    }
}
