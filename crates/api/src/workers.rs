//! Background consumers and the reservation expiry sweep.
//!
//! Every worker watches the same shutdown channel and stops taking new work
//! once it flips to `true`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use messaging::{
    ConnectionManager, DeadLetterReprocessor, DeclaredTopology, DeliveryHandler, EnvelopeHandler,
    IdempotentConsumer, ReliablePublisher, Subscription,
};
use saga::{PaymentEventAudit, PaymentIntake, SagaStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::routes::AppState;

async fn stopped(mut shutdown: watch::Receiver<bool>) {
    // A dropped sender also counts as shutdown.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Runs `consumer` until shutdown, restarting it after `restart_delay`
/// whenever it stops on its own.
#[tracing::instrument(skip_all, fields(queue = %consumer.queue()))]
pub async fn supervise<D: DeliveryHandler>(
    consumer: IdempotentConsumer,
    handler: Arc<D>,
    restart_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        match consumer
            .run_with(handler.clone(), stopped(shutdown.clone()))
            .await
        {
            Ok(()) => break,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    delay = ?restart_delay,
                    "consumer stopped unexpectedly, restarting"
                );
                metrics::counter!(
                    "consumer_restarts_total",
                    "queue" => consumer.queue().to_string()
                )
                .increment(1);
                tokio::select! {
                    () = tokio::time::sleep(restart_delay) => {}
                    _ = shutdown.wait_for(|stop| *stop) => break,
                }
            }
        }
    }
}

/// Rejects overdue reservations every `every` until shutdown.
#[tracing::instrument(skip_all)]
pub async fn sweep_expired<S: SagaStore>(
    state: Arc<AppState<S>>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.wait_for(|stop| *stop) => break,
        }
        if let Err(err) = state.coordinator.expire_overdue(Utc::now()).await {
            tracing::warn!(error = %err, "reservation expiry sweep failed");
        }
    }
}

fn spawn_consumer<D: DeliveryHandler>(
    connections: &ConnectionManager,
    topology: &DeclaredTopology,
    subscription: Subscription,
    handler: D,
    restart_delay: Duration,
    shutdown: &watch::Receiver<bool>,
) -> messaging::Result<JoinHandle<()>> {
    let consumer = IdempotentConsumer::new(connections.clone(), topology, subscription)?;
    Ok(tokio::spawn(supervise(
        consumer,
        Arc::new(handler),
        restart_delay,
        shutdown.clone(),
    )))
}

/// Starts the payment intake consumer, the optional audit and dead-letter
/// consumers, and the expiry sweep.
///
/// Fails if a required queue is missing from `topology`.
pub fn spawn_workers<S: SagaStore + Clone>(
    state: &Arc<AppState<S>>,
    config: &Config,
    topology: &DeclaredTopology,
    publisher: ReliablePublisher,
    shutdown: &watch::Receiver<bool>,
) -> messaging::Result<Vec<JoinHandle<()>>> {
    let consumer = &config.consumer;
    let queues = &config.topology;
    let connections = &state.connections;
    let settings = state.coordinator.settings();
    let mut workers = Vec::new();

    let intake = PaymentIntake::new(state.store().clone(), settings.unit_price);
    workers.push(spawn_consumer(
        connections,
        topology,
        Subscription::new(&queues.order_created_queue, consumer.prefetch),
        EnvelopeHandler::new(Arc::new(intake)),
        consumer.restart_delay,
        shutdown,
    )?);

    if consumer.payment_events_consumer_enabled {
        if topology.declares(&queues.payment_events_queue) {
            workers.push(spawn_consumer(
                connections,
                topology,
                Subscription::new(&queues.payment_events_queue, consumer.audit_prefetch),
                EnvelopeHandler::new(Arc::new(PaymentEventAudit::new())),
                consumer.restart_delay,
                shutdown,
            )?);
        } else {
            tracing::warn!(
                queue = %queues.payment_events_queue,
                "payment events consumer enabled but its queue is not declared"
            );
        }
    }

    if consumer.dead_letter_reprocessor_enabled {
        workers.push(spawn_consumer(
            connections,
            topology,
            Subscription::new(&topology.dead_letter_queue, consumer.prefetch),
            DeadLetterReprocessor::new(publisher, consumer.max_replays)
                .with_retry_delay(consumer.restart_delay),
            consumer.restart_delay,
            shutdown,
        )?);
    }

    workers.push(tokio::spawn(sweep_expired(
        state.clone(),
        settings.sweep_interval,
        shutdown.clone(),
    )));

    tracing::info!(count = workers.len(), "workers started");
    Ok(workers)
}
