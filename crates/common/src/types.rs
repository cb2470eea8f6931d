use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declares a row identifier backed by a database `BIGSERIAL`/`INTEGER` key.
///
/// Row identifiers are assigned by the relational store, so unlike
/// [`MessageId`] they have no generator of their own.
macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wraps a raw key value.
            pub fn new(value: i64) -> Self {
                Self(value)
            }

            /// Returns the raw key value.
            pub fn as_i64(&self) -> i64 {
                self.0
            }

            /// Returns true if the key could have been assigned by the store.
            pub fn is_valid(&self) -> bool {
                self.0 > 0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

row_id!(
    /// Identifier of an order row.
    OrderId
);
row_id!(
    /// Identifier of the user placing an order.
    UserId
);
row_id!(
    /// Identifier of a product whose capacity is reserved by orders.
    ProductId
);
row_id!(
    /// Identifier of a payment row.
    PaymentId
);
row_id!(
    /// Identifier of an inventory reservation row.
    ReservationId
);

/// Unique identifier of a published message.
///
/// Generated by the publisher unless the caller supplies one. Consumers use
/// it as the idempotency key, so it is kept as an opaque string: messages
/// published by other producers may carry identifiers that are not UUIDs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Creates a new random message ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wraps an identifier assigned elsewhere.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the identifier carries no value.
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<Uuid> for MessageId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid.to_string())
    }
}
