//! Application configuration loaded from environment variables.

use messaging::{BrokerSettings, ConsumerSettings, PublisherSettings, TopologySettings};
use saga::SagaSettings;

/// Returns the first variable in `keys` that is set, or `default`.
fn first(lookup: &impl Fn(&str) -> Option<String>, keys: &[&str], default: &str) -> String {
    keys.iter()
        .find_map(|key| lookup(key))
        .unwrap_or_else(|| default.to_string())
}

/// Process configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` - bind address (default: `"0.0.0.0"`)
/// - `PORT` - listen port (default: `8080`)
/// - `RUST_LOG` - tracing filter directive (default: `"info"`)
/// - `SERVICE_NAME` - reported by `/health` and used as the broker connection name
/// - `DATABASE_URL`, or `PGHOST`/`PGPORT`/`PGDATABASE`/`PGUSER`/`PGPASSWORD`
///   with `DB_*` fallbacks
/// - `DB_MAX_CONNECTIONS` - pool size (default: `10`)
///
/// Broker, topology, publisher, consumer and saga settings read their own
/// variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub service_name: String,
    pub database_url: String,
    pub db_max_connections: u32,
    pub broker: BrokerSettings,
    pub topology: TopologySettings,
    pub publisher: PublisherSettings,
    pub consumer: ConsumerSettings,
    pub saga: SagaSettings,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            service_name: lookup("SERVICE_NAME").unwrap_or(defaults.service_name),
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| database_url(&lookup)),
            db_max_connections: lookup("DB_MAX_CONNECTIONS")
                .and_then(|n| n.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.db_max_connections),
            broker: BrokerSettings::from_lookup(&lookup),
            topology: TopologySettings::from_lookup(&lookup),
            publisher: PublisherSettings::from_lookup(&lookup),
            consumer: ConsumerSettings::from_lookup(&lookup),
            saga: SagaSettings::from_lookup(&lookup),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn database_url(lookup: &impl Fn(&str) -> Option<String>) -> String {
    let host = first(lookup, &["PGHOST", "DB_HOST"], "localhost");
    let port = first(lookup, &["PGPORT", "DB_PORT"], "5432");
    let database = first(lookup, &["PGDATABASE", "DB_NAME"], "postgresdb");
    let user = first(lookup, &["PGUSER", "DB_USER"], "postgresdb");
    let password = first(
        lookup,
        &["PGPASSWORD", "DB_PASSWORD", "POSTGRES_PASSWORD"],
        "postgresqlpassword",
    );
    format!("postgres://{user}:{password}@{host}:{port}/{database}")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            log_level: "info".to_string(),
            service_name: "order-saga".to_string(),
            database_url: database_url(&|_| None),
            db_max_connections: 10,
            broker: BrokerSettings::default(),
            topology: TopologySettings::default(),
            publisher: PublisherSettings::default(),
            consumer: ConsumerSettings::default(),
            saga: SagaSettings::default(),
        }
    }
}
