//! Identifier types shared by the messaging, saga, and API crates.

mod types;

pub use types::{MessageId, OrderId, PaymentId, ProductId, ReservationId, UserId};
