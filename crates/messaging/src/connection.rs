//! Lazily established, shared broker connection and channels.
//!
//! Consumers open their own uncached channel on the shared connection so a
//! channel-level error only takes down the consumer that caused it.
//!
//! Concurrent callers that find no live resource share one in-flight
//! establishment attempt. When the connection closes, the whole cache is
//! invalidated and the next caller establishes a fresh connection. A failed
//! attempt is reported to every waiter and is not retried here.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};

use crate::transport::{BrokerChannel, BrokerConnection, ChannelMode, Connector};
use crate::{MessagingError, Result};

/// What a cached channel is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    /// Plain channel for topology declarations. Consumers take a
    /// [`ConnectionManager::dedicated_channel`] of the same mode instead.
    Consumer,
    /// Confirm-mode channel used by the publisher.
    Publisher,
}

impl ChannelRole {
    fn mode(&self) -> ChannelMode {
        match self {
            ChannelRole::Consumer => ChannelMode::Plain,
            ChannelRole::Publisher => ChannelMode::Confirm,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelRole::Consumer => "consumer",
            ChannelRole::Publisher => "publisher",
        }
    }
}

type Attempt<T> = Shared<BoxFuture<'static, Result<T>>>;

enum Slot<T> {
    Empty,
    Pending(Attempt<T>),
    Ready(T),
}

struct CacheState {
    /// Bumped on every invalidation; attempts started under an older
    /// generation never write into the cache.
    generation: u64,
    connection: Slot<Arc<dyn BrokerConnection>>,
    consumer: Slot<Arc<dyn BrokerChannel>>,
    publisher: Slot<Arc<dyn BrokerChannel>>,
}

impl CacheState {
    fn channel_slot(&mut self, role: ChannelRole) -> &mut Slot<Arc<dyn BrokerChannel>> {
        match role {
            ChannelRole::Consumer => &mut self.consumer,
            ChannelRole::Publisher => &mut self.publisher,
        }
    }

    fn invalidate(&mut self) {
        self.generation += 1;
        self.connection = Slot::Empty;
        self.consumer = Slot::Empty;
        self.publisher = Slot::Empty;
    }
}

fn lock(state: &Mutex<CacheState>) -> MutexGuard<'_, CacheState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the process-wide broker connection and its channels.
///
/// Cheap to clone; clones share the cache.
#[derive(Clone)]
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    state: Arc<Mutex<CacheState>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            state: Arc::new(Mutex::new(CacheState {
                generation: 0,
                connection: Slot::Empty,
                consumer: Slot::Empty,
                publisher: Slot::Empty,
            })),
        }
    }

    /// Returns the live connection, establishing one if needed.
    pub async fn connection(&self) -> Result<Arc<dyn BrokerConnection>> {
        let attempt = {
            let mut state = lock(&self.state);
            match &state.connection {
                Slot::Ready(connection) if connection.is_open() => {
                    return Ok(connection.clone());
                }
                Slot::Pending(attempt) => attempt.clone(),
                _ => {
                    state.invalidate();
                    let attempt = establish(
                        self.connector.clone(),
                        Arc::downgrade(&self.state),
                        state.generation,
                    )
                    .boxed()
                    .shared();
                    state.connection = Slot::Pending(attempt.clone());
                    attempt
                }
            }
        };
        attempt.await
    }

    /// Returns the live channel for `role`, creating it (and the connection)
    /// if needed.
    pub async fn channel(&self, role: ChannelRole) -> Result<Arc<dyn BrokerChannel>> {
        let connection = self.connection().await?;
        let attempt = {
            let mut state = lock(&self.state);
            let generation = state.generation;
            match state.channel_slot(role) {
                Slot::Ready(channel) if channel.is_open() => return Ok(channel.clone()),
                Slot::Pending(attempt) => attempt.clone(),
                slot => {
                    let attempt = open_channel(
                        Arc::downgrade(&self.state),
                        connection,
                        role,
                        generation,
                    )
                    .boxed()
                    .shared();
                    *slot = Slot::Pending(attempt.clone());
                    attempt
                }
            }
        };
        attempt.await
    }

    /// Opens a channel owned by the caller on the shared connection.
    ///
    /// The channel is not cached; the caller closes it when done.
    pub async fn dedicated_channel(&self, mode: ChannelMode) -> Result<Arc<dyn BrokerChannel>> {
        let connection = self.connection().await?;
        let result = connection.open_channel(mode).await;
        match &result {
            Ok(_) => tracing::debug!(?mode, "dedicated broker channel created"),
            Err(err) => tracing::warn!(?mode, error = %err, "dedicated channel creation failed"),
        }
        result
    }

    /// Opens the connection and the publisher channel ahead of first use.
    pub async fn init(&self) -> Result<()> {
        self.channel(ChannelRole::Publisher).await.map(|_| ())
    }

    /// True if a connection is cached and open.
    pub fn is_connected(&self) -> bool {
        matches!(&lock(&self.state).connection, Slot::Ready(c) if c.is_open())
    }

    /// Closes channels, then the connection, and empties the cache.
    pub async fn close(&self) {
        let (channels, connection) = {
            let mut state = lock(&self.state);
            let mut channels = Vec::new();
            for role in [ChannelRole::Consumer, ChannelRole::Publisher] {
                if let Slot::Ready(channel) = state.channel_slot(role) {
                    channels.push((role, channel.clone()));
                }
            }
            let connection = match &state.connection {
                Slot::Ready(connection) => Some(connection.clone()),
                _ => None,
            };
            state.invalidate();
            (channels, connection)
        };

        for (role, channel) in channels {
            if let Err(err) = channel.close().await {
                tracing::debug!(role = role.as_str(), error = %err, "channel close failed");
            }
        }
        if let Some(connection) = connection {
            if let Err(err) = connection.close().await {
                tracing::debug!(error = %err, "connection close failed");
            }
            tracing::info!("broker connection closed");
        }
    }
}

async fn establish(
    connector: Arc<dyn Connector>,
    state: Weak<Mutex<CacheState>>,
    generation: u64,
) -> Result<Arc<dyn BrokerConnection>> {
    let result = connector.connect().await;

    match &result {
        Ok(_) => {
            metrics::counter!("broker_connections_opened_total").increment(1);
            tracing::info!(generation, "broker connection established");
        }
        Err(err) => {
            metrics::counter!("broker_connection_failures_total").increment(1);
            tracing::error!(error = %err, "broker connection failed");
        }
    }

    let Some(state) = state.upgrade() else {
        return result;
    };
    let mut guard = lock(&state);
    if guard.generation != generation {
        return result;
    }
    match &result {
        Ok(connection) => {
            guard.connection = Slot::Ready(connection.clone());
            watch_for_close(Arc::downgrade(&state), generation, connection.as_ref());
        }
        Err(_) => guard.connection = Slot::Empty,
    }
    result
}

/// Invalidates the cache once the connection of `generation` reports closed.
fn watch_for_close(
    state: Weak<Mutex<CacheState>>,
    generation: u64,
    connection: &dyn BrokerConnection,
) {
    let mut signal = connection.close_signal();
    tokio::spawn(async move {
        let _ = signal.wait_for(|closed| *closed).await;
        let Some(state) = state.upgrade() else {
            return;
        };
        let mut guard = lock(&state);
        if guard.generation == generation {
            tracing::warn!(generation, "broker connection closed, resetting channels");
            guard.invalidate();
        }
    });
}

async fn open_channel(
    state: Weak<Mutex<CacheState>>,
    connection: Arc<dyn BrokerConnection>,
    role: ChannelRole,
    generation: u64,
) -> Result<Arc<dyn BrokerChannel>> {
    let result = connection.open_channel(role.mode()).await;

    match &result {
        Ok(_) => tracing::debug!(role = role.as_str(), "broker channel created"),
        Err(err) => {
            tracing::warn!(role = role.as_str(), error = %err, "broker channel creation failed")
        }
    }

    if let Some(state) = state.upgrade() {
        let mut guard = lock(&state);
        if guard.generation == generation {
            *guard.channel_slot(role) = match &result {
                Ok(channel) => Slot::Ready(channel.clone()),
                Err(_) => Slot::Empty,
            };
        }
    }
    result
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connected", &self.is_connected())
            .finish()
    }
}
