//! Payment listing and decision endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use saga::{ApprovePayment, Payment, RejectPayment, SagaStore};

use super::{AppState, CommandResponse, command_response, parse_order_id};
use crate::error::ApiError;

/// Number of payments returned by the listing.
pub const PAYMENT_LIST_LIMIT: i64 = 50;

/// GET /payments - the latest payments, newest first.
#[tracing::instrument(skip(state))]
pub async fn list<S: SagaStore>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<Vec<Payment>>, ApiError> {
    let payments = state.store().list_payments(PAYMENT_LIST_LIMIT).await?;
    Ok(Json(payments))
}

/// POST /payments/{order_id}/approve - confirm the order and commit its
/// reservation.
#[tracing::instrument(skip(state))]
pub async fn approve<S: SagaStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(order_id): Path<String>,
) -> Result<(StatusCode, Json<CommandResponse>), ApiError> {
    let order_id = parse_order_id(&order_id)?;
    let outcome = state
        .coordinator
        .approve_payment(ApprovePayment::new(order_id))
        .await?;
    Ok(command_response(&outcome, order_id, StatusCode::OK, "ok"))
}

/// POST /payments/{order_id}/reject - cancel the order and release its
/// reservation.
#[tracing::instrument(skip(state))]
pub async fn reject<S: SagaStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(order_id): Path<String>,
) -> Result<(StatusCode, Json<CommandResponse>), ApiError> {
    let order_id = parse_order_id(&order_id)?;
    let outcome = state
        .coordinator
        .reject_payment(RejectPayment::new(order_id))
        .await?;
    Ok(command_response(
        &outcome,
        order_id,
        StatusCode::OK,
        "rejected",
    ))
}
