//! Order lifecycle endpoints. Each successful mutation is pushed to the
//! order room, and the affected user gets a notification.

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use khanasathi_proto::{Notification, NotificationKind, OrderStatus, Role, RoomId, ServerEvent};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::auth::middleware::Claims;
use crate::error::ApiError;
use crate::state::AppState;

use super::store::{assign_delivery_staff, fetch_order, load_order, update_status, OrderRecord};

// --- Request / Response types ---

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: OrderStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignRiderRequest {
    pub delivery_staff_id: String,
    #[serde(default)]
    pub delivery_staff_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LocationRequest {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationResponse {
    pub delivered_to: usize,
}

fn can_update_status(order: &OrderRecord, claims: &Claims) -> bool {
    claims.is_admin()
        || (claims.role == Role::Restaurant && order.restaurant_id == claims.sub)
        || (claims.role == Role::DeliveryStaff
            && order.delivery_staff_id.as_deref() == Some(claims.sub.as_str()))
}

/// Fetch, check and write under one lock. Returns the order before and
/// after the write; a write that touches no row means the order went terminal.
async fn mutate_order<C, W>(
    state: &AppState,
    order_id: &str,
    check: C,
    write: W,
) -> Result<(OrderRecord, OrderRecord), ApiError>
where
    C: FnOnce(&OrderRecord) -> Result<(), ApiError> + Send + 'static,
    W: FnOnce(&Connection, &str) -> rusqlite::Result<usize> + Send + 'static,
{
    let db = state.db.clone();
    let oid = order_id.to_string();
    tokio::task::spawn_blocking(move || {
        let conn = db.lock()?;
        let before = fetch_order(&conn, &oid)?.ok_or_else(|| ApiError::not_found("Order not found"))?;
        check(&before)?;
        if before.status.is_terminal() || write(&conn, &oid)? == 0 {
            return Err(ApiError::validation(format!("Order is already {}", before.status)));
        }
        let after = fetch_order(&conn, &oid)?.ok_or_else(|| ApiError::not_found("Order not found"))?;
        Ok((before, after))
    })
    .await?
}

// --- Handlers ---

/// PUT /api/orders/{order_id}/status
pub async fn set_status(
    State(state): State<AppState>,
    claims: Claims,
    Path(order_id): Path<String>,
    Json(body): Json<UpdateStatusRequest>,
) -> Result<Json<OrderRecord>, ApiError> {
    let status = body.status;
    let (previous, order) = mutate_order(
        &state,
        &order_id,
        move |current| {
            if can_update_status(current, &claims) {
                Ok(())
            } else {
                Err(ApiError::forbidden("Not allowed to update this order"))
            }
        },
        move |conn, oid| update_status(conn, oid, status, Utc::now()),
    )
    .await?;

    state.relay.emit_to_room(
        &RoomId::order(&order.id),
        &ServerEvent::OrderStatusUpdate {
            order_id: order.id.clone(),
            status: order.status,
            updated_at: order.updated_at,
        },
    );
    state.relay.notify_user(
        &order.customer_id,
        Notification::new(
            NotificationKind::OrderStatus,
            order.status.label(),
            format!("Your order is now {}", order.status.label().to_lowercase()),
        )
        .for_order(&order.id),
    );
    tracing::info!(
        order_id = %order.id,
        from = %previous.status,
        to = %order.status,
        "Order status updated"
    );

    Ok(Json(order))
}

/// PUT /api/orders/{order_id}/assign
/// A replaced rider loses its live connections in the order room.
pub async fn assign_rider(
    State(state): State<AppState>,
    claims: Claims,
    Path(order_id): Path<String>,
    Json(body): Json<AssignRiderRequest>,
) -> Result<Json<OrderRecord>, ApiError> {
    let rider_id = body.delivery_staff_id.trim().to_string();
    if rider_id.is_empty() {
        return Err(ApiError::validation("deliveryStaffId is required"));
    }

    let rid = rider_id.clone();
    let (previous, order) = mutate_order(
        &state,
        &order_id,
        move |current| {
            let is_owner = claims.role == Role::Restaurant && current.restaurant_id == claims.sub;
            if is_owner || claims.is_admin() {
                Ok(())
            } else {
                Err(ApiError::forbidden("Only the restaurant or an admin can assign riders"))
            }
        },
        move |conn, oid| assign_delivery_staff(conn, oid, &rid, Utc::now()),
    )
    .await?;

    let room = RoomId::order(&order.id);
    if let Some(old_rider) = previous.delivery_staff_id.filter(|old| *old != rider_id) {
        let removed = state.relay.leave_user(&old_rider, &room);
        tracing::info!(
            order_id = %order.id,
            delivery_staff_id = %old_rider,
            connections = removed,
            "Previous rider removed from order room"
        );
    }

    state.relay.emit_to_room(
        &room,
        &ServerEvent::RiderAssigned {
            order_id: order.id.clone(),
            delivery_staff_id: rider_id.clone(),
            delivery_staff_name: body.delivery_staff_name,
            assigned_at: order.updated_at,
        },
    );
    state.relay.notify_user(
        &rider_id,
        Notification::new(
            NotificationKind::RiderAssigned,
            "New delivery",
            format!("You have been assigned to deliver to {}", order.delivery_address),
        )
        .for_order(&order.id),
    );
    tracing::info!(order_id = %order.id, delivery_staff_id = %rider_id, "Rider assigned");

    Ok(Json(order))
}

/// POST /api/orders/{order_id}/location
/// Live position from the assigned rider. Not persisted.
pub async fn report_location(
    State(state): State<AppState>,
    claims: Claims,
    Path(order_id): Path<String>,
    Json(body): Json<LocationRequest>,
) -> Result<Json<LocationResponse>, ApiError> {
    if !(-90.0..=90.0).contains(&body.lat) || !(-180.0..=180.0).contains(&body.lng) {
        return Err(ApiError::validation("Coordinates out of range"));
    }

    let order = load_order(&state.db, &order_id).await?;
    if order.delivery_staff_id.as_deref() != Some(claims.sub.as_str()) {
        return Err(ApiError::forbidden("Only the assigned rider can report location"));
    }

    let delivered_to = state.relay.emit_to_room(
        &RoomId::order(&order.id),
        &ServerEvent::RiderLocation {
            order_id: order.id.clone(),
            delivery_staff_id: claims.sub,
            lat: body.lat,
            lng: body.lng,
            recorded_at: Utc::now(),
        },
    );
    Ok(Json(LocationResponse { delivered_to }))
}
