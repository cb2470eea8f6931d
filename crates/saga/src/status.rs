//! Row status state machines.
//!
//! ```text
//! Order:        PENDING ──┬──► CONFIRMED
//!                         └──► CANCELLED
//! Reservation:  RESERVED ─┬──► COMMITTED
//!                         └──► EXPIRED
//! Payment:      PENDING ──┬──► SUCCEEDED
//!                         └──► FAILED
//! ```
//!
//! Every transition leaves the initial state; terminal states never change.

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

macro_rules! status {
    (
        $(#[$meta:meta])*
        $name:ident { initial: $initial:ident = $initial_str:literal, $($variant:ident = $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            #[default]
            $initial,
            $($variant),+
        }

        impl $name {
            /// Returns the status as stored in the database.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $name::$initial => $initial_str,
                    $($name::$variant => $text),+
                }
            }

            /// Returns true if no further transition is allowed.
            pub fn is_terminal(&self) -> bool {
                !matches!(self, $name::$initial)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = StoreError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $initial_str => Ok($name::$initial),
                    $($text => Ok($name::$variant),)+
                    other => Err(StoreError::Decode(format!(
                        "unknown {} '{other}'",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

status!(
    /// Lifecycle of an order.
    OrderStatus { initial: Pending = "PENDING", Confirmed = "CONFIRMED", Cancelled = "CANCELLED" }
);

status!(
    /// Lifecycle of an inventory reservation. RESERVED and COMMITTED count
    /// against product capacity.
    ReservationStatus { initial: Reserved = "RESERVED", Committed = "COMMITTED", Expired = "EXPIRED" }
);

status!(
    /// Lifecycle of a payment.
    PaymentStatus { initial: Pending = "PENDING", Succeeded = "SUCCEEDED", Failed = "FAILED" }
);

impl ReservationStatus {
    /// Returns true if the reservation holds product capacity.
    pub fn holds_capacity(&self) -> bool {
        matches!(self, ReservationStatus::Reserved | ReservationStatus::Committed)
    }
}
