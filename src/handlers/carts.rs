use crate::handlers::common::{success_response, validate_input, CurrentUser};
use crate::{errors::ApiError, AppState};
use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Creates the router for cart endpoints
pub fn carts_routes() -> Router<AppState> {
    Router::new()
        .route("/cart", get(get_cart).delete(clear_cart))
        .route("/cart/items", post(add_item))
        .route("/cart/items/:line_id", put(update_item).delete(remove_item))
}

async fn get_cart(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state.services.cart.get_cart(user_id).await?;
    Ok(success_response(cart))
}

/// Add a product by id or by scanned barcode
async fn add_item(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(payload): Json<AddItemRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;

    let cart = match (payload.product_id, payload.barcode.as_deref()) {
        (Some(product_id), None) => {
            state
                .services
                .cart
                .add_item(user_id, product_id, payload.quantity)
                .await?
        }
        (None, Some(barcode)) => {
            state
                .services
                .cart
                .add_item_by_barcode(user_id, barcode, payload.quantity)
                .await?
        }
        _ => {
            return Err(ApiError::BadRequest(
                "Provide exactly one of product_id or barcode".to_string(),
            ))
        }
    };

    Ok(success_response(cart))
}

/// Replace a line's quantity
async fn update_item(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(line_id): Path<Uuid>,
    Json(payload): Json<UpdateQuantityRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state
        .services
        .cart
        .update_item_quantity(user_id, line_id, payload.quantity)
        .await?;
    Ok(success_response(cart))
}

async fn remove_item(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(line_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state.services.cart.remove_item(user_id, line_id).await?;
    Ok(success_response(cart))
}

async fn clear_cart(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state.services.cart.clear_cart(user_id).await?;
    Ok(success_response(cart))
}

#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct AddItemRequest {
    pub product_id: Option<Uuid>,
    #[validate(length(min = 1, max = 64))]
    pub barcode: Option<String>,
    #[serde(default = "default_quantity")]
    pub quantity: i32,
}

fn default_quantity() -> i32 {
    1
}

#[derive(Debug, Deserialize, Serialize)]
pub struct UpdateQuantityRequest {
    pub quantity: i32,
}
