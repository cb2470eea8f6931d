use crate::connection::{ChannelRole, ConnectionManager};
use crate::settings::TopologySettings;
use crate::transport::{ExchangeKind, Overflow, QueueArguments};
use crate::{MessagingError, Result};

/// Returns true if `routing_key` matches a topic binding `pattern`.
///
/// `*` matches exactly one dot-separated word, `#` matches zero or more.
pub(crate) fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

/// A queue and the routing keys binding it to the events exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub bindings: Vec<String>,
    pub arguments: QueueArguments,
}

/// Proof that the topology has been declared.
///
/// Publishers and consumers are constructed from this value, so nothing can
/// touch the exchanges before [`TopologyManager::ensure_topology`] has run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredTopology {
    pub events_exchange: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
    pub dead_letter_routing_key: String,
    pub queues: Vec<QueueSpec>,
}

impl DeclaredTopology {
    /// True if `queue` was declared, the dead-letter queue included.
    pub fn declares(&self, queue: &str) -> bool {
        queue == self.dead_letter_queue || self.queues.iter().any(|q| q.name == queue)
    }

    /// True if some declared queue is bound to a key matching `routing_key`.
    pub fn routes(&self, routing_key: &str) -> bool {
        self.queues.iter().any(|q| {
            q.bindings
                .iter()
                .any(|pattern| topic_matches(pattern, routing_key))
        })
    }

    /// Fails with a topology error unless `queue` was declared.
    pub fn require(&self, queue: &str) -> Result<()> {
        if self.declares(queue) {
            Ok(())
        } else {
            Err(MessagingError::Topology(format!(
                "queue '{queue}' is not part of the declared topology"
            )))
        }
    }
}

/// Declares exchanges, queues, bindings and dead-letter routing.
///
/// Every declaration is idempotent: running it against an already configured
/// broker changes nothing, while an inequivalent redeclaration fails.
pub struct TopologyManager {
    connections: ConnectionManager,
    settings: TopologySettings,
}

impl TopologyManager {
    pub fn new(connections: ConnectionManager, settings: TopologySettings) -> Self {
        Self {
            connections,
            settings,
        }
    }

    /// Queues bound to the events exchange, in declaration order.
    pub fn queue_specs(&self) -> Vec<QueueSpec> {
        let settings = &self.settings;
        let dead_lettered = || {
            QueueArguments::durable().with_dead_letter(
                settings.dead_letter_exchange.clone(),
                settings.dead_letter_routing_key.clone(),
            )
        };

        let mut specs = vec![QueueSpec {
            name: settings.order_created_queue.clone(),
            bindings: vec!["order.created".to_string()],
            arguments: dead_lettered(),
        }];
        if settings.payment_events_enabled {
            specs.push(QueueSpec {
                name: settings.payment_events_queue.clone(),
                bindings: vec!["payment.*".to_string()],
                arguments: dead_lettered()
                    .with_message_ttl(settings.payment_events_ttl)
                    .with_max_length(settings.payment_events_max_length, Overflow::DropHead),
            });
        }
        specs
    }

    #[tracing::instrument(skip(self))]
    pub async fn ensure_topology(&self) -> Result<DeclaredTopology> {
        let settings = &self.settings;
        let channel = self.connections.channel(ChannelRole::Consumer).await?;

        channel
            .declare_exchange(&settings.events_exchange, ExchangeKind::Topic)
            .await?;
        channel
            .declare_exchange(&settings.dead_letter_exchange, ExchangeKind::Direct)
            .await?;

        channel
            .declare_queue(&settings.dead_letter_queue, &QueueArguments::durable())
            .await?;
        channel
            .bind_queue(
                &settings.dead_letter_queue,
                &settings.dead_letter_exchange,
                &settings.dead_letter_routing_key,
            )
            .await?;

        let queues = self.queue_specs();
        for spec in &queues {
            channel.declare_queue(&spec.name, &spec.arguments).await?;
            for routing_key in &spec.bindings {
                channel
                    .bind_queue(&spec.name, &settings.events_exchange, routing_key)
                    .await?;
            }
        }

        tracing::info!(
            exchange = %settings.events_exchange,
            dead_letter_queue = %settings.dead_letter_queue,
            queues = queues.len(),
            "topology ready"
        );

        Ok(DeclaredTopology {
            events_exchange: settings.events_exchange.clone(),
            dead_letter_exchange: settings.dead_letter_exchange.clone(),
            dead_letter_queue: settings.dead_letter_queue.clone(),
            dead_letter_routing_key: settings.dead_letter_routing_key.clone(),
            queues,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::InMemoryBroker;

    fn manager(broker: &InMemoryBroker, settings: TopologySettings) -> TopologyManager {
        TopologyManager::new(ConnectionManager::new(Arc::new(broker.clone())), settings)
    }

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("order.created", "order.created"));
        assert!(topic_matches("payment.*", "payment.failed"));
        assert!(!topic_matches("payment.*", "payment.failed.late"));
        assert!(!topic_matches("payment.*", "payment"));
        assert!(topic_matches("payment.#", "payment"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.created", "order.created"));
        assert!(!topic_matches("order.created", "order.cancelled"));
    }

    #[tokio::test]
    async fn declares_core_topology() {
        let broker = InMemoryBroker::new();
        let topology = manager(&broker, TopologySettings::default())
            .ensure_topology()
            .await
            .unwrap();

        assert_eq!(broker.exchange_kind("events.topic"), Some(ExchangeKind::Topic));
        assert_eq!(broker.exchange_kind("dlx.direct"), Some(ExchangeKind::Direct));
        assert_eq!(broker.bindings("events.dlq.q", "dlx.direct"), vec!["events.dlq"]);
        assert_eq!(
            broker.bindings("payment.order-created.q", "events.topic"),
            vec!["order.created"]
        );
        let args = broker.queue_arguments("payment.order-created.q").unwrap();
        assert_eq!(args.dead_letter_exchange.as_deref(), Some("dlx.direct"));
        assert_eq!(args.dead_letter_routing_key.as_deref(), Some("events.dlq"));

        assert!(broker.queue_arguments("payment.events.q").is_none());
        assert!(topology.declares("events.dlq.q"));
        assert!(topology.routes("order.created"));
        assert!(!topology.routes("payment.succeeded"));
    }

    #[tokio::test]
    async fn audit_queue_is_bounded_and_expiring() {
        let broker = InMemoryBroker::new();
        let settings = TopologySettings {
            payment_events_enabled: true,
            ..TopologySettings::default()
        };
        let topology = manager(&broker, settings).ensure_topology().await.unwrap();

        let args = broker.queue_arguments("payment.events.q").unwrap();
        assert_eq!(args.message_ttl, Some(Duration::from_secs(86_400)));
        assert_eq!(args.max_length, Some(100_000));
        assert_eq!(args.overflow, Some(Overflow::DropHead));
        assert_eq!(broker.bindings("payment.events.q", "events.topic"), vec!["payment.*"]);
        assert!(topology.routes("payment.failed"));
    }

    #[tokio::test]
    async fn ensure_topology_is_idempotent() {
        let broker = InMemoryBroker::new();
        let topology = manager(&broker, TopologySettings::default());
        let first = topology.ensure_topology().await.unwrap();
        let second = topology.ensure_topology().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(broker.bindings("events.dlq.q", "dlx.direct").len(), 1);
    }

    #[tokio::test]
    async fn conflicting_declaration_fails() {
        let broker = InMemoryBroker::new();
        manager(&broker, TopologySettings::default())
            .ensure_topology()
            .await
            .unwrap();

        let conflicting = TopologySettings {
            dead_letter_routing_key: "elsewhere".to_string(),
            ..TopologySettings::default()
        };
        let err = manager(&broker, conflicting).ensure_topology().await.unwrap_err();
        assert!(matches!(err, MessagingError::Topology(_)));
    }
}
