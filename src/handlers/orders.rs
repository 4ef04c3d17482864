use crate::handlers::common::{
    created_response, success_response, validate_input, CurrentUser, PaginationParams,
};
use crate::{errors::ApiError, services::CheckoutInput, AppState, PaginatedResponse};
use axum::{
    extract::{Json, Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use uuid::Uuid;

/// Creates the router for order endpoints
pub fn orders_routes() -> Router<AppState> {
    Router::new()
        .route("/orders", get(list_orders).post(checkout))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/cancel", post(cancel_order))
        .route("/orders/:id/invoice", get(get_invoice))
}

async fn list_orders(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Query(params): Query<PaginationParams>,
) -> Result<impl IntoResponse, ApiError> {
    let (page, per_page) =
        params.resolve(state.config.default_page_size, state.config.max_page_size);
    let (orders, total) = state
        .services
        .orders
        .list_orders(user_id, page, per_page)
        .await?;

    Ok(success_response(PaginatedResponse::new(
        orders, total, page, per_page,
    )))
}

/// Check out the caller's cart
async fn checkout(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(payload): Json<CheckoutInput>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;
    let order = state.services.checkout.checkout(user_id, payload).await?;
    Ok(created_response(order))
}

async fn get_order(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(order_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let order = state.services.orders.get_order(order_id, user_id).await?;
    Ok(success_response(order))
}

async fn cancel_order(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(order_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let order = state.services.orders.cancel(order_id, user_id).await?;
    Ok(success_response(order))
}

async fn get_invoice(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(order_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let invoice = state.services.orders.invoice(order_id, user_id).await?;
    Ok(success_response(invoice))
}
