//! Integration tests for the API server.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use api::AppState;
use api::config::Config;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{OrderId, ProductId};
use messaging::{
    ConnectionManager, DeclaredTopology, EventEnvelope, InMemoryBroker, ReliablePublisher,
    TopologyManager, TopologySettings,
};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{
    InMemorySagaStore, OrderStatus, Payment, PaymentIntake, PaymentStatus, ReservationStatus,
    SagaCoordinator, SagaStore,
};
use serde_json::{Value, json};
use tokio::sync::watch;
use tower::ServiceExt;

const ORDER_QUEUE: &str = "payment.order-created.q";
const PRODUCT: i64 = 42;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

struct TestApp {
    app: Router,
    state: Arc<AppState<InMemorySagaStore>>,
    broker: InMemoryBroker,
    store: InMemorySagaStore,
    topology: DeclaredTopology,
    publisher: ReliablePublisher,
    config: Config,
}

impl TestApp {
    async fn new(capacity: i64) -> Self {
        Self::with_config(capacity, Config::default()).await
    }

    async fn with_config(capacity: i64, config: Config) -> Self {
        let broker = InMemoryBroker::new();
        let connections = ConnectionManager::new(Arc::new(broker.clone()));
        let topology = TopologyManager::new(connections.clone(), config.topology.clone())
            .ensure_topology()
            .await
            .unwrap();
        connections.init().await.unwrap();
        let publisher =
            ReliablePublisher::new(connections.clone(), &topology, config.publisher.clone());

        let store = InMemorySagaStore::new();
        store.add_product(ProductId::new(PRODUCT), capacity).await;
        let coordinator = SagaCoordinator::new(
            store.clone(),
            publisher.clone(),
            &topology,
            config.saga.clone(),
        );
        let state = Arc::new(AppState::new(coordinator, connections, "order-saga"));
        let app = api::create_app(state.clone(), get_metrics_handle());

        Self {
            app,
            state,
            broker,
            store,
            topology,
            publisher,
            config,
        }
    }

    async fn send(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_string(&body).unwrap())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    async fn place(&self, quantity: i32) -> (StatusCode, Value) {
        self.send(
            "POST",
            "/orders",
            Some(json!({ "userId": 7, "productId": PRODUCT, "quantity": quantity })),
        )
        .await
    }

    /// Runs the payment intake over every queued `order.created` event.
    async fn create_payments(&self) {
        let intake = PaymentIntake::new(self.store.clone(), self.config.saga.unit_price);
        for message in self.broker.drain(ORDER_QUEUE) {
            let envelope = EventEnvelope::decode(&message.body).unwrap();
            messaging::MessageHandler::handle(&intake, envelope, &context())
                .await
                .unwrap();
        }
    }

    async fn payment(&self, order_id: i64) -> Option<Payment> {
        self.store
            .get_payment_for_order(OrderId::new(order_id))
            .await
            .unwrap()
    }
}

fn context() -> messaging::DeliveryContext {
    messaging::DeliveryContext {
        queue: ORDER_QUEUE.to_string(),
        routing_key: "order.created".to_string(),
        redelivered: false,
        delivery_tag: 1,
    }
}

async fn eventually<F, Fut, T>(what: &str, mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    for _ in 0..200 {
        if let Some(value) = probe().await {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_health_check() {
    let t = TestApp::new(10).await;

    let (status, json) = t.send("GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["service"], "order-saga");
    assert_eq!(json["broker"], "connected");
}

#[tokio::test]
async fn test_health_reports_lost_broker() {
    let t = TestApp::new(10).await;
    t.broker.sever_connections();

    let (status, json) = t.send("GET", "/health", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["broker"], "disconnected");
}

#[tokio::test]
async fn test_place_order_is_accepted() {
    let t = TestApp::new(10).await;

    let (status, json) = t.place(2).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json, json!({ "status": "accepted", "orderId": 1 }));
    assert_eq!(t.broker.queue_depth(ORDER_QUEUE), 1);

    let (status, json) = t.send("GET", "/orders/1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["order"]["status"], "PENDING");
    assert_eq!(json["order"]["quantity"], 2);
    assert_eq!(json["reservation"]["status"], "RESERVED");
}

#[tokio::test]
async fn test_place_order_requires_all_fields() {
    let t = TestApp::new(10).await;

    let (status, json) = t
        .send("POST", "/orders", Some(json!({ "userId": 7, "quantity": 1 })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "invalid_request");

    let (status, json) = t
        .send(
            "POST",
            "/orders",
            Some(json!({ "userId": 7, "productId": PRODUCT, "quantity": "two" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "invalid_request");
    assert!(t.store.orders().await.is_empty());
}

#[tokio::test]
async fn test_place_order_rejections() {
    let t = TestApp::new(3).await;

    let (status, json) = t.place(0).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "invalid_command");

    let (status, json) = t.place(4).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"], "insufficient_capacity");

    let (status, json) = t
        .send(
            "POST",
            "/orders",
            Some(json!({ "userId": 7, "productId": 999, "quantity": 1 })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "product_not_found");

    assert!(t.store.orders().await.is_empty());
    assert_eq!(t.broker.queue_depth(ORDER_QUEUE), 0);
}

#[tokio::test]
async fn test_approve_payment_once() {
    let t = TestApp::new(10).await;
    t.place(2).await;
    t.create_payments().await;

    let (status, json) = t.send("POST", "/payments/1/approve", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!({ "status": "ok", "orderId": 1 }));

    let (status, json) = t.send("POST", "/payments/1/approve", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"], "payment_already_processed");

    let (status, _) = t.send("POST", "/payments/1/reject", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    assert_eq!(t.payment(1).await.unwrap().status, PaymentStatus::Succeeded);
    let (_, json) = t.send("GET", "/orders/1", None).await;
    assert_eq!(json["order"]["status"], "CONFIRMED");
    assert_eq!(json["reservation"]["status"], "COMMITTED");
}

#[tokio::test]
async fn test_reject_payment_releases_capacity() {
    let t = TestApp::new(2).await;
    t.place(2).await;
    t.create_payments().await;

    let (status, json) = t.send("POST", "/payments/1/reject", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!({ "status": "rejected", "orderId": 1 }));

    let orders = t.store.orders().await;
    assert_eq!(orders[0].status, OrderStatus::Cancelled);
    let reservations = t.store.reservations().await;
    assert_eq!(reservations[0].status, ReservationStatus::Expired);

    let (status, _) = t.place(2).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_payment_routes_validate_order_id() {
    let t = TestApp::new(10).await;

    let (status, json) = t.send("POST", "/payments/abc/approve", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "invalid_order_id");

    let (status, json) = t.send("POST", "/payments/0/reject", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "invalid_command");

    let (status, json) = t.send("POST", "/payments/5/approve", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "payment_not_found");

    let (status, json) = t.send("GET", "/orders/5", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "order_not_found");
}

#[tokio::test]
async fn test_list_payments_newest_first() {
    let t = TestApp::new(10).await;
    for quantity in 1..=3 {
        t.place(quantity).await;
    }
    t.create_payments().await;

    let (status, json) = t.send("GET", "/payments", None).await;
    assert_eq!(status, StatusCode::OK);
    let payments = json.as_array().unwrap();
    assert_eq!(payments.len(), 3);
    assert_eq!(payments[0]["orderId"], 3);
    assert_eq!(payments[0]["amount"], 300);
    assert_eq!(payments[0]["status"], "PENDING");
    assert_eq!(payments[2]["orderId"], 1);
}

#[tokio::test]
async fn test_unpublished_event_reports_partial_completion() {
    let t = TestApp::new(10).await;
    t.broker.nack_next(1);

    let (status, json) = t.place(1).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["status"], "partially_completed");
    assert_eq!(json["orderId"], 1);
    assert!(!json["messageId"].as_str().unwrap().is_empty());
    assert!(json["error"].is_string());

    let (status, json) = t.send("GET", "/orders/1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["reservation"]["status"], "RESERVED");
}

#[tokio::test]
async fn test_unavailable_store_maps_to_503() {
    let t = TestApp::new(10).await;
    t.store.set_unavailable(true);

    let (status, json) = t.place(1).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["error"], "service_unavailable");

    let (status, _) = t.send("GET", "/payments", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let t = TestApp::new(10).await;
    t.place(1).await;

    let response = t
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("saga_commands_total"));
}

#[tokio::test]
async fn test_workers_create_payments_and_stop_on_shutdown() {
    let t = TestApp::new(10).await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = api::workers::spawn_workers(
        &t.state,
        &t.config,
        &t.topology,
        t.publisher.clone(),
        &shutdown_rx,
    )
    .unwrap();
    assert_eq!(workers.len(), 2);

    t.place(2).await;
    let payment = eventually("payment", || t.payment(1)).await;
    assert_eq!(payment.amount, 200);

    let (status, _) = t.send("POST", "/payments/1/approve", None).await;
    assert_eq!(status, StatusCode::OK);

    shutdown_tx.send(true).unwrap();
    for worker in workers {
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn test_consumer_restarts_after_lost_connection() {
    let mut config = Config::default();
    config.consumer.restart_delay = Duration::from_millis(20);
    let t = TestApp::with_config(10, config).await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = api::workers::spawn_workers(
        &t.state,
        &t.config,
        &t.topology,
        t.publisher.clone(),
        &shutdown_rx,
    )
    .unwrap();

    t.place(1).await;
    eventually("first payment", || t.payment(1)).await;

    t.broker.sever_connections();
    let (status, _) = t.place(1).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    eventually("second payment", || t.payment(2)).await;

    shutdown_tx.send(true).unwrap();
    for worker in workers {
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn test_optional_consumers_follow_settings() {
    let mut config = Config::default();
    config.topology = TopologySettings {
        payment_events_enabled: true,
        ..TopologySettings::default()
    };
    config.consumer.payment_events_consumer_enabled = true;
    config.consumer.dead_letter_reprocessor_enabled = true;
    let t = TestApp::with_config(10, config).await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let workers = api::workers::spawn_workers(
        &t.state,
        &t.config,
        &t.topology,
        t.publisher.clone(),
        &shutdown_rx,
    )
    .unwrap();
    assert_eq!(workers.len(), 4);

    shutdown_tx.send(true).unwrap();
    for worker in workers {
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();
    }
}
