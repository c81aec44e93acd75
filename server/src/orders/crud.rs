use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use khanasathi_proto::{Notification, NotificationKind, Role};
use serde::Deserialize;

use crate::auth::middleware::Claims;
use crate::error::ApiError;
use crate::state::AppState;

use super::store::{insert_order, list_orders_for, load_order, NewOrder, OrderRecord};

/// Maximum delivery address length (chars).
const MAX_ADDRESS_LENGTH: usize = 500;

// --- Request types ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub restaurant_id: String,
    /// Amount in paisa
    pub total_amount: i64,
    pub delivery_address: String,
}

// --- Handlers ---

/// POST /api/orders
/// Customers place orders; the restaurant is notified in its user room.
pub async fn create_order(
    State(state): State<AppState>,
    claims: Claims,
    Json(body): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<OrderRecord>), ApiError> {
    claims.require_role(Role::Customer)?;

    let restaurant_id = body.restaurant_id.trim().to_string();
    let delivery_address = body.delivery_address.trim().to_string();
    if restaurant_id.is_empty() {
        return Err(ApiError::validation("restaurantId is required"));
    }
    if delivery_address.is_empty() || delivery_address.chars().count() > MAX_ADDRESS_LENGTH {
        return Err(ApiError::validation(format!(
            "deliveryAddress must be 1-{MAX_ADDRESS_LENGTH} characters"
        )));
    }
    if body.total_amount <= 0 {
        return Err(ApiError::validation("totalAmount must be positive"));
    }

    let db = state.db.clone();
    let new_order = NewOrder {
        customer_id: claims.sub.clone(),
        restaurant_id,
        total_amount: body.total_amount,
        delivery_address,
    };
    let order = tokio::task::spawn_blocking(move || {
        let conn = db.lock()?;
        Ok::<_, ApiError>(insert_order(&conn, &new_order)?)
    })
    .await??;

    state.relay.notify_user(
        &order.restaurant_id,
        Notification::new(
            NotificationKind::NewOrder,
            "New order",
            format!("{} placed an order", claims.name),
        )
        .for_order(&order.id),
    );
    tracing::info!(order_id = %order.id, restaurant_id = %order.restaurant_id, "Order created");

    Ok((StatusCode::CREATED, Json(order)))
}

/// GET /api/orders
/// The caller's orders for their role; admins see every order.
pub async fn list_orders(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<Vec<OrderRecord>>, ApiError> {
    let db = state.db.clone();
    let orders = tokio::task::spawn_blocking(move || {
        let conn = db.lock()?;
        Ok::<_, ApiError>(list_orders_for(&conn, &claims.sub, claims.role)?)
    })
    .await??;
    Ok(Json(orders))
}

/// GET /api/orders/{order_id}
pub async fn get_order(
    State(state): State<AppState>,
    claims: Claims,
    Path(order_id): Path<String>,
) -> Result<Json<OrderRecord>, ApiError> {
    let order = load_order(&state.db, &order_id).await?;
    if !order.can_view(&claims) {
        return Err(ApiError::forbidden("Not a participant of this order"));
    }
    Ok(Json(order))
}
