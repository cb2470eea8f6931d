//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container and need Docker. Run with:
//!
//! ```bash
//! cargo test -p saga --test postgres_integration -- --ignored --test-threads=1
//! ```

use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use common::{MessageId, OrderId, ProductId, UserId};
use messaging::{
    ConnectionManager, DeliveryContext, EventType, Handled, InMemoryBroker, MessageHandler,
    PublisherSettings, ReliablePublisher, TopologyManager, TopologySettings,
};
use saga::{
    ApprovePayment, NewOrder, NewPayment, NewReservation, OrderStatus, PaymentIntake,
    PaymentStatus, PlaceOrder, PostgresSagaStore, RejectPayment, ReservationStatus,
    SagaCoordinator, SagaError, SagaSettings, SagaStore, SagaTransaction,
};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string = format!("postgres://postgres:postgres@{host}:{port}/postgres");

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_saga_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store(capacity: i64) -> PostgresSagaStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query(
        "TRUNCATE TABLE payments, inventory_reservations, orders, products RESTART IDENTITY",
    )
    .execute(&pool)
    .await
    .unwrap();

    let store = PostgresSagaStore::new(pool);
    store
        .upsert_product(ProductId::new(42), capacity)
        .await
        .unwrap();
    store
}

async fn coordinator(store: PostgresSagaStore) -> SagaCoordinator<PostgresSagaStore> {
    let broker = InMemoryBroker::new();
    let connections = ConnectionManager::new(Arc::new(broker));
    let topology = TopologyManager::new(connections.clone(), TopologySettings::default())
        .ensure_topology()
        .await
        .unwrap();
    let publisher =
        ReliablePublisher::new(connections, &topology, PublisherSettings::default());
    SagaCoordinator::new(store, publisher, &topology, SagaSettings::default())
}

fn context() -> DeliveryContext {
    DeliveryContext {
        queue: "payment.order-created.q".to_string(),
        routing_key: EventType::OrderCreated.routing_key().to_string(),
        redelivered: false,
        delivery_tag: 1,
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn transaction_rows_round_trip() {
    let store = get_test_store(10).await;

    let mut tx = store.begin().await.unwrap();
    assert_eq!(
        tx.lock_product_capacity(ProductId::new(42)).await.unwrap(),
        Some(10)
    );
    assert_eq!(tx.lock_product_capacity(ProductId::new(7)).await.unwrap(), None);
    let order = tx
        .insert_order(NewOrder {
            user_id: UserId::new(1),
            product_id: ProductId::new(42),
            quantity: 3,
        })
        .await
        .unwrap();
    let reservation = tx
        .insert_reservation(NewReservation {
            order_id: order.id,
            product_id: order.product_id,
            quantity: 3,
            expires_at: Utc::now() + TimeDelta::minutes(15),
        })
        .await
        .unwrap();
    assert_eq!(tx.held_quantity(ProductId::new(42)).await.unwrap(), 3);
    tx.commit().await.unwrap();

    assert_eq!(store.get_order(order.id).await.unwrap(), Some(order.clone()));
    assert_eq!(
        store.get_reservation_for_order(order.id).await.unwrap(),
        Some(reservation)
    );

    let payment = NewPayment {
        order_id: order.id,
        user_id: order.user_id,
        amount: 300,
        message_id: MessageId::from("m-1"),
    };
    let mut tx = store.begin().await.unwrap();
    assert!(tx.insert_payment(payment.clone()).await.unwrap().is_some());
    assert!(tx.insert_payment(payment).await.unwrap().is_none());
    tx.commit().await.unwrap();

    let payments = store.list_payments(50).await.unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, PaymentStatus::Pending);
    assert_eq!(payments[0].message_id.as_str(), "m-1");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn rollback_discards_rows() {
    let store = get_test_store(10).await;
    let mut tx = store.begin().await.unwrap();
    let order = tx
        .insert_order(NewOrder {
            user_id: UserId::new(1),
            product_id: ProductId::new(42),
            quantity: 1,
        })
        .await
        .unwrap();
    tx.rollback().await.unwrap();

    assert_eq!(store.get_order(order.id).await.unwrap(), None);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn concurrent_orders_respect_capacity() {
    let store = get_test_store(10).await;
    let coordinator = Arc::new(coordinator(store.clone()).await);

    let mut tasks = Vec::new();
    for i in 0..12 {
        let coordinator = coordinator.clone();
        tasks.push(tokio::spawn(async move {
            coordinator
                .place_order(PlaceOrder::new(UserId::new(i + 1), ProductId::new(42), 2))
                .await
        }));
    }

    let mut placed = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => placed += 1,
            Err(SagaError::InsufficientCapacity { .. }) => {}
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
    assert_eq!(placed, 5);

    let mut tx = store.begin().await.unwrap();
    assert_eq!(tx.held_quantity(ProductId::new(42)).await.unwrap(), 10);
    tx.rollback().await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn payment_lifecycle_is_guarded() {
    let store = get_test_store(10).await;
    let coordinator = coordinator(store.clone()).await;
    let intake = PaymentIntake::new(store.clone(), 100);

    let outcome = coordinator
        .place_order(PlaceOrder::new(UserId::new(1), ProductId::new(42), 2))
        .await
        .unwrap();
    let order_id: OrderId = outcome.value().order.id;

    let event = outcome.event().clone();
    assert_eq!(
        intake.handle(event.clone(), &context()).await.unwrap(),
        Handled::Applied
    );
    assert_eq!(
        intake.handle(event, &context()).await.unwrap(),
        Handled::Duplicate
    );
    let payment = store.get_payment_for_order(order_id).await.unwrap().unwrap();
    assert_eq!(payment.amount, 200);

    let settled = coordinator
        .approve_payment(ApprovePayment::new(order_id))
        .await
        .unwrap();
    assert_eq!(settled.value().order.status, OrderStatus::Confirmed);
    assert_eq!(settled.value().reservations_transitioned, 1);

    let err = coordinator
        .reject_payment(RejectPayment::new(order_id))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "already_processed");

    let reservation = store
        .get_reservation_for_order(order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reservation.status, ReservationStatus::Committed);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn overdue_reservations_are_listed_oldest_first() {
    let store = get_test_store(10).await;
    let coordinator = coordinator(store.clone()).await;
    for _ in 0..2 {
        coordinator
            .place_order(PlaceOrder::new(UserId::new(1), ProductId::new(42), 1))
            .await
            .unwrap();
    }
    sqlx::query("UPDATE inventory_reservations SET expires_at = NOW() - (id || ' minutes')::INTERVAL")
        .execute(store.pool())
        .await
        .unwrap();

    let overdue = store.overdue_reservations(Utc::now(), 10).await.unwrap();
    assert_eq!(overdue.len(), 2);
    assert!(overdue[0].expires_at <= overdue[1].expires_at);
    assert_eq!(overdue[0].order_id, OrderId::new(2));
}
