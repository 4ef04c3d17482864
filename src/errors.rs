use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Seconds a client should wait before retrying a `Busy` checkout.
const BUSY_RETRY_AFTER_SECS: &str = "1";

/// JSON error body returned by every endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Unprocessable Entity")
    pub error: String,
    /// Stable machine-readable error code
    pub code: String,
    /// Human-readable error description
    pub message: String,
    /// Structured context, e.g. the product that ran out of stock
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// RFC 3339 timestamp when the error was produced
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[serde(skip)] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Insufficient stock for {product_name} ({product_id}): requested {requested}, available {available}")]
    InsufficientStock {
        product_id: Uuid,
        product_name: String,
        requested: i32,
        available: i32,
    },

    #[error("Cart is empty")]
    EmptyCart,

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<DbErr> for ServiceError {
    fn from(err: DbErr) -> Self {
        if crate::db::is_lock_contention(&err) {
            ServiceError::Busy(format!("lock contention: {}", err))
        } else {
            ServiceError::DatabaseError(err)
        }
    }
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    pub fn insufficient_stock(
        product_id: Uuid,
        product_name: impl Into<String>,
        requested: i32,
        available: i32,
    ) -> Self {
        ServiceError::InsufficientStock {
            product_id,
            product_name: product_name.into(),
            requested,
            available,
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy(_))
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) | Self::ValidationError(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InsufficientStock { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::EmptyCart => StatusCode::PRECONDITION_FAILED,
            Self::InvalidTransition(_) => StatusCode::CONFLICT,
            Self::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::DatabaseError(_) | Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::ValidationError(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::InsufficientStock { .. } => "insufficient_stock",
            Self::EmptyCart => "empty_cart",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::Busy(_) => "busy",
            Self::DatabaseError(_) | Self::InternalError(_) => "internal_error",
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) | Self::InternalError(_) => "Internal server error".to_string(),
            Self::Busy(_) => "Service busy, retry shortly".to_string(),
            _ => self.to_string(),
        }
    }

    /// Structured detail payload, when the error carries one.
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::InsufficientStock {
                product_id,
                product_name,
                requested,
                available,
            } => Some(json!({
                "product_id": product_id,
                "product_name": product_name,
                "requested": requested,
                "available": available,
            })),
            _ => None,
        }
    }
}

fn error_body(status: StatusCode, code: &str, message: String, details: Option<Value>) -> ErrorResponse {
    ErrorResponse {
        error: status.canonical_reason().unwrap_or("Error").to_string(),
        code: code.to_string(),
        message,
        details,
        request_id: current_request_id(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            Self::DatabaseError(err) => tracing::error!(error = %err, "database error"),
            Self::InternalError(err) => tracing::error!(error = %err, "internal error"),
            Self::Busy(reason) => tracing::warn!(%reason, "request rejected as busy"),
            _ => {}
        }

        let body = error_body(status, self.code(), self.response_message(), self.details());
        let mut response = (status, Json(body)).into_response();
        if self.is_retryable() {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from_static(BUSY_RETRY_AFTER_SECS),
            );
        }
        response
    }
}

/// API Error type for HTTP responses
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Service error: {0}")]
    ServiceError(#[from] ServiceError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::ServiceError(service_error) => return service_error.into_response(),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
        };

        (status, Json(error_body(status, code, message, None))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn service_error_response_includes_request_id() {
        let response =
            crate::tracing::scope_request_id(crate::tracing::RequestId::new("req-123"), async {
                ServiceError::NotFound("missing".into()).into_response()
            })
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload.request_id.as_deref(), Some("req-123"));
        assert_eq!(payload.code, "not_found");
    }

    #[tokio::test]
    async fn insufficient_stock_names_the_product() {
        let product_id = Uuid::new_v4();
        let response =
            ServiceError::insufficient_stock(product_id, "Oat Milk", 3, 1).into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: ErrorResponse = serde_json::from_slice(&body).unwrap();
        let details = payload.details.expect("stock details");
        assert_eq!(details["product_id"], json!(product_id));
        assert_eq!(details["product_name"], "Oat Milk");
        assert_eq!(details["requested"], 3);
        assert_eq!(details["available"], 1);
    }

    #[tokio::test]
    async fn busy_sets_retry_after() {
        let response = ServiceError::Busy("lock wait".into()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            BUSY_RETRY_AFTER_SECS
        );
    }

    #[test]
    fn each_error_kind_has_a_distinct_status() {
        let statuses = [
            ServiceError::InvalidInput("x".into()).status_code(),
            ServiceError::NotFound("x".into()).status_code(),
            ServiceError::insufficient_stock(Uuid::nil(), "x", 1, 0).status_code(),
            ServiceError::EmptyCart.status_code(),
            ServiceError::InvalidTransition("x".into()).status_code(),
            ServiceError::Busy("x".into()).status_code(),
            ServiceError::InternalError("x".into()).status_code(),
        ];
        let unique: std::collections::HashSet<_> = statuses.iter().collect();
        assert_eq!(unique.len(), statuses.len());
    }

    #[test]
    fn internal_details_are_hidden() {
        assert_eq!(
            ServiceError::InternalError("pool exploded".into()).response_message(),
            "Internal server error"
        );
        assert_eq!(
            ServiceError::DatabaseError(DbErr::Custom("secret".into())).response_message(),
            "Internal server error"
        );
        assert_eq!(
            ServiceError::InvalidInput("Quantity must be positive".into()).response_message(),
            "Invalid input: Quantity must be positive"
        );
    }

    #[test]
    fn lock_timeouts_become_busy() {
        let err: ServiceError =
            DbErr::Custom("canceling statement due to lock timeout".into()).into();
        assert!(err.is_retryable());

        let err: ServiceError = DbErr::Custom("syntax error".into()).into();
        assert!(matches!(err, ServiceError::DatabaseError(_)));
    }
}
