//! Results of commands that commit and then publish.

use messaging::{EventEnvelope, MessagingError};

use crate::models::{InventoryReservation, Order, Payment};

/// The result of a command whose transaction committed.
///
/// A publish failure after commit does not undo the committed rows. It is
/// reported as [`SagaOutcome::CommittedUnpublished`] together with the event
/// that was not delivered, so it can be republished with the same identity.
#[derive(Debug)]
pub enum SagaOutcome<T> {
    /// Committed and the event was confirmed by the broker.
    Completed { value: T, event: EventEnvelope },
    /// Committed but the event was not confirmed.
    CommittedUnpublished {
        value: T,
        event: EventEnvelope,
        error: MessagingError,
    },
}

impl<T> SagaOutcome<T> {
    pub(crate) fn from_publish(
        value: T,
        event: EventEnvelope,
        published: Result<(), MessagingError>,
    ) -> Self {
        match published {
            Ok(()) => SagaOutcome::Completed { value, event },
            Err(error) => SagaOutcome::CommittedUnpublished {
                value,
                event,
                error,
            },
        }
    }

    pub fn value(&self) -> &T {
        match self {
            SagaOutcome::Completed { value, .. } | SagaOutcome::CommittedUnpublished { value, .. } => {
                value
            }
        }
    }

    pub fn event(&self) -> &EventEnvelope {
        match self {
            SagaOutcome::Completed { event, .. } | SagaOutcome::CommittedUnpublished { event, .. } => {
                event
            }
        }
    }

    /// The publish failure, if the event was not confirmed.
    pub fn publish_error(&self) -> Option<&MessagingError> {
        match self {
            SagaOutcome::Completed { .. } => None,
            SagaOutcome::CommittedUnpublished { error, .. } => Some(error),
        }
    }

    pub fn is_published(&self) -> bool {
        matches!(self, SagaOutcome::Completed { .. })
    }

    pub fn into_value(self) -> T {
        match self {
            SagaOutcome::Completed { value, .. } | SagaOutcome::CommittedUnpublished { value, .. } => {
                value
            }
        }
    }

    pub(crate) fn label(&self) -> &'static str {
        match self {
            SagaOutcome::Completed { .. } => "completed",
            SagaOutcome::CommittedUnpublished { .. } => "committed_unpublished",
        }
    }
}

/// Rows written by a successful order placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderPlaced {
    pub order: Order,
    pub reservation: InventoryReservation,
}

/// Rows after a payment decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentSettled {
    pub order: Order,
    pub payment: Payment,
    /// Reservations moved out of RESERVED by this decision.
    pub reservations_transitioned: u64,
}
