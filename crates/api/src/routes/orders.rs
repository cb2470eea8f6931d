//! Order placement and lookup endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::{ProductId, UserId};
use saga::{InventoryReservation, Order, PlaceOrder, SagaStore};
use serde::{Deserialize, Serialize};

use super::{AppState, CommandResponse, command_response, parse_order_id};
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderRequest {
    pub user_id: Option<i64>,
    pub product_id: Option<i64>,
    pub quantity: Option<i32>,
}

impl PlaceOrderRequest {
    fn into_command(self) -> Result<PlaceOrder, ApiError> {
        match (self.user_id, self.product_id, self.quantity) {
            (Some(user_id), Some(product_id), Some(quantity)) => Ok(PlaceOrder::new(
                UserId::new(user_id),
                ProductId::new(product_id),
                quantity,
            )),
            _ => Err(ApiError::BadRequest(
                "invalid_request",
                "userId, productId, quantity are required".to_string(),
            )),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OrderView {
    pub order: Order,
    pub reservation: Option<InventoryReservation>,
}

/// POST /orders - reserve capacity for a new order.
#[tracing::instrument(skip(state, payload))]
pub async fn place<S: SagaStore>(
    State(state): State<Arc<AppState<S>>>,
    payload: Result<Json<PlaceOrderRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CommandResponse>), ApiError> {
    let Json(req) =
        payload.map_err(|e| ApiError::BadRequest("invalid_request", e.body_text()))?;
    let cmd = req.into_command()?;

    let outcome = state.coordinator.place_order(cmd).await?;
    let order_id = outcome.value().order.id;
    Ok(command_response(
        &outcome,
        order_id,
        StatusCode::ACCEPTED,
        "accepted",
    ))
}

/// GET /orders/{id} - an order with its inventory reservation.
#[tracing::instrument(skip(state))]
pub async fn get<S: SagaStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<OrderView>, ApiError> {
    let order_id = parse_order_id(&id)?;
    let order = state
        .store()
        .get_order(order_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("order_not_found", format!("order {id} not found")))?;
    let reservation = state.store().get_reservation_for_order(order_id).await?;

    Ok(Json(OrderView { order, reservation }))
}
