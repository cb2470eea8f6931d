//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use saga::{SagaError, StoreError};

/// API-level error type that maps to HTTP responses.
///
/// The body is `{"error": code, "message": text}` where `code` is a stable
/// machine-readable string.
#[derive(Debug)]
pub enum ApiError {
    /// Malformed request, with its error code.
    BadRequest(&'static str, String),
    /// Resource not found, with its error code.
    NotFound(&'static str, String),
    /// Saga command or store failure.
    Saga(SagaError),
}

impl ApiError {
    /// The HTTP status and wire code for this error.
    pub fn status_and_code(&self) -> (StatusCode, String) {
        match self {
            ApiError::BadRequest(code, _) => (StatusCode::BAD_REQUEST, code.to_string()),
            ApiError::NotFound(code, _) => (StatusCode::NOT_FOUND, code.to_string()),
            ApiError::Saga(err) => saga_status_and_code(err),
        }
    }
}

fn saga_status_and_code(err: &SagaError) -> (StatusCode, String) {
    match err {
        SagaError::InvalidCommand(_) => (StatusCode::BAD_REQUEST, err.code().to_string()),
        SagaError::NotFound { entity, .. } => (StatusCode::NOT_FOUND, format!("{entity}_not_found")),
        SagaError::InsufficientCapacity { .. } => (StatusCode::CONFLICT, err.code().to_string()),
        SagaError::AlreadyProcessed { .. } => {
            (StatusCode::CONFLICT, "payment_already_processed".to_string())
        }
        _ if err.is_unavailable() => (
            StatusCode::SERVICE_UNAVAILABLE,
            "service_unavailable".to_string(),
        ),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error".to_string()),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = match &self {
            ApiError::BadRequest(_, msg) | ApiError::NotFound(_, msg) => msg.clone(),
            ApiError::Saga(err) => err.to_string(),
        };

        if status.is_server_error() {
            tracing::error!(error = %message, %code, "request failed");
        }

        let body = serde_json::json!({ "error": code, "message": message });
        (status, axum::Json(body)).into_response()
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Saga(SagaError::Store(err))
    }
}

#[cfg(test)]
mod tests {
    use common::{OrderId, ProductId};
    use messaging::MessagingError;

    use super::*;

    fn status_of(err: SagaError) -> (StatusCode, String) {
        ApiError::from(err).status_and_code()
    }

    #[test]
    fn test_business_rejections_map_to_client_errors() {
        assert_eq!(
            status_of(SagaError::InvalidCommand("quantity must be positive".into())),
            (StatusCode::BAD_REQUEST, "invalid_command".to_string())
        );
        assert_eq!(
            status_of(SagaError::NotFound {
                entity: "payment",
                id: 7
            }),
            (StatusCode::NOT_FOUND, "payment_not_found".to_string())
        );
        assert_eq!(
            status_of(SagaError::InsufficientCapacity {
                product_id: ProductId::new(1),
                requested: 3,
                available: 1
            })
            .0,
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(SagaError::AlreadyProcessed {
                order_id: OrderId::new(1),
                status: "SUCCEEDED".into()
            }),
            (StatusCode::CONFLICT, "payment_already_processed".to_string())
        );
    }

    #[test]
    fn test_infrastructure_failures_map_to_server_errors() {
        assert_eq!(
            status_of(SagaError::Store(StoreError::Database(
                sqlx::Error::PoolTimedOut
            )))
            .0,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(SagaError::Messaging(MessagingError::ResourceUnavailable(
                "broker down".into()
            )))
            .0,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(SagaError::Store(StoreError::Decode("bad status".into()))).0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
