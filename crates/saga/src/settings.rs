//! Saga configuration loaded from environment variables.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

/// Saga tunables.
///
/// Reads from environment variables:
/// - `RESERVATION_WINDOW_SECS`: how long a reservation is held, default 900
/// - `PAYMENT_UNIT_PRICE`: payment amount per unit ordered, default 100
/// - `RESERVATION_SWEEP_SECS`: interval of the expiry sweep, default 60
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaSettings {
    pub reservation_window: Duration,
    pub unit_price: i64,
    pub sweep_interval: Duration,
    /// Maximum reservations expired per sweep.
    pub sweep_batch: i64,
}

impl SagaSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            reservation_window: Duration::from_secs(parsed(
                &lookup,
                "RESERVATION_WINDOW_SECS",
                defaults.reservation_window.as_secs(),
            )),
            unit_price: parsed(&lookup, "PAYMENT_UNIT_PRICE", defaults.unit_price),
            sweep_interval: Duration::from_secs(
                parsed(
                    &lookup,
                    "RESERVATION_SWEEP_SECS",
                    defaults.sweep_interval.as_secs(),
                )
                .max(1),
            ),
            sweep_batch: defaults.sweep_batch,
        }
    }

    /// When a reservation made at `from` expires.
    pub fn reservation_expiry(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        TimeDelta::from_std(self.reservation_window)
            .ok()
            .and_then(|window| from.checked_add_signed(window))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for SagaSettings {
    fn default() -> Self {
        Self {
            reservation_window: Duration::from_secs(15 * 60),
            unit_price: 100,
            sweep_interval: Duration::from_secs(60),
            sweep_batch: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_default_values() {
        let settings = SagaSettings::from_lookup(|_| None);
        assert_eq!(settings, SagaSettings::default());
        assert_eq!(settings.reservation_window, Duration::from_secs(900));
        assert_eq!(settings.unit_price, 100);
    }

    #[test]
    fn test_overrides_and_invalid_values() {
        let vars: HashMap<&str, &str> = [
            ("RESERVATION_WINDOW_SECS", "30"),
            ("PAYMENT_UNIT_PRICE", "abc"),
            ("RESERVATION_SWEEP_SECS", "0"),
        ]
        .into_iter()
        .collect();
        let settings = SagaSettings::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(settings.reservation_window, Duration::from_secs(30));
        assert_eq!(settings.unit_price, 100);
        assert_eq!(settings.sweep_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_reservation_expiry() {
        let now = Utc::now();
        let settings = SagaSettings::default();
        assert_eq!(settings.reservation_expiry(now), now + TimeDelta::minutes(15));

        let unbounded = SagaSettings {
            reservation_window: Duration::MAX,
            ..SagaSettings::default()
        };
        assert_eq!(unbounded.reservation_expiry(now), DateTime::<Utc>::MAX_UTC);
    }
}
