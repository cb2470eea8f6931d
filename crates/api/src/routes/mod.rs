//! HTTP route handlers and the state they share.

pub mod health;
pub mod metrics;
pub mod orders;
pub mod payments;

use axum::Json;
use axum::http::StatusCode;
use common::{MessageId, OrderId};
use messaging::ConnectionManager;
use saga::{SagaCoordinator, SagaOutcome, SagaStore};
use serde::Serialize;

use crate::error::ApiError;

/// Shared application state accessible from all handlers.
pub struct AppState<S: SagaStore> {
    pub coordinator: SagaCoordinator<S>,
    pub connections: ConnectionManager,
    pub service_name: String,
}

impl<S: SagaStore> AppState<S> {
    pub fn new(
        coordinator: SagaCoordinator<S>,
        connections: ConnectionManager,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            coordinator,
            connections,
            service_name: service_name.into(),
        }
    }

    pub fn store(&self) -> &S {
        self.coordinator.store()
    }
}

/// Body returned by every saga command.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub status: &'static str,
    pub order_id: OrderId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Maps a command outcome to its response.
///
/// A committed command whose event was not published answers 202
/// `partially_completed` with the event's message id, so the caller knows the
/// state change stuck and which event is missing downstream.
pub(crate) fn command_response<T>(
    outcome: &SagaOutcome<T>,
    order_id: OrderId,
    status: StatusCode,
    label: &'static str,
) -> (StatusCode, Json<CommandResponse>) {
    match outcome.publish_error() {
        None => (
            status,
            Json(CommandResponse {
                status: label,
                order_id,
                message_id: None,
                error: None,
            }),
        ),
        Some(err) => (
            StatusCode::ACCEPTED,
            Json(CommandResponse {
                status: "partially_completed",
                order_id,
                message_id: Some(outcome.event().message_id.clone()),
                error: Some(err.to_string()),
            }),
        ),
    }
}

/// Parses the `{id}` path segment of order-scoped routes.
pub(crate) fn parse_order_id(raw: &str) -> Result<OrderId, ApiError> {
    raw.trim()
        .parse::<i64>()
        .map(OrderId::new)
        .map_err(|_| ApiError::BadRequest("invalid_order_id", format!("invalid order id: {raw}")))
}
