//! Order and payment saga over a relational store and the event pipeline.
//!
//! The order side places orders: it checks product capacity under a row
//! lock, inserts the order with its reservation and publishes
//! `order.created` after commit. The payment side turns each
//! `order.created` into one pending payment and settles it on approval or
//! rejection, moving the order and its reservation in the same transaction
//! and publishing `payment.succeeded` or `payment.failed` after commit.
//!
//! Reservations still held past their expiry are rejected by
//! [`SagaCoordinator::expire_overdue`].

pub mod audit;
pub mod commands;
pub mod coordinator;
pub mod error;
pub mod intake;
pub mod models;
pub mod outcome;
pub mod settings;
pub mod status;
pub mod store;

pub use audit::PaymentEventAudit;
pub use commands::{ApprovePayment, PlaceOrder, RejectPayment};
pub use coordinator::{REASON_MANUAL_REJECTION, REASON_RESERVATION_EXPIRED, SagaCoordinator};
pub use error::{Result, SagaError, StoreError};
pub use intake::PaymentIntake;
pub use models::{InventoryReservation, NewOrder, NewPayment, NewReservation, Order, Payment};
pub use outcome::{OrderPlaced, PaymentSettled, SagaOutcome};
pub use settings::SagaSettings;
pub use status::{OrderStatus, PaymentStatus, ReservationStatus};
pub use store::{
    InMemorySagaStore, PostgresSagaStore, SagaStore, SagaTransaction, StoreResult,
};
