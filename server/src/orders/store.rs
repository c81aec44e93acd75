//! Order rows and the participant rules derived from them.

use chrono::{DateTime, Utc};
use khanasathi_proto::{ChatThread, OrderStatus, Role};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use uuid::Uuid;

use crate::auth::middleware::Claims;
use crate::db::{parse_column, DbPool};
use crate::error::ApiError;

const ORDER_COLUMNS: &str = "id, customer_id, restaurant_id, delivery_staff_id, status,
     total_amount, delivery_address, created_at, updated_at";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecord {
    pub id: String,
    pub customer_id: String,
    pub restaurant_id: String,
    pub delivery_staff_id: Option<String>,
    pub status: OrderStatus,
    pub total_amount: i64,
    pub delivery_address: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub customer_id: String,
    pub restaurant_id: String,
    pub total_amount: i64,
    pub delivery_address: String,
}

impl OrderRecord {
    fn user_for_role(&self, role: Role) -> Option<&str> {
        match role {
            Role::Customer => Some(&self.customer_id),
            Role::Restaurant => Some(&self.restaurant_id),
            Role::DeliveryStaff => self.delivery_staff_id.as_deref(),
            Role::Admin => None,
        }
    }

    /// The role a user plays in this order, if any.
    pub fn participant_role(&self, user_id: &str) -> Option<Role> {
        [Role::Customer, Role::Restaurant, Role::DeliveryStaff]
            .into_iter()
            .find(|role| self.user_for_role(*role) == Some(user_id))
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.participant_role(user_id).is_some()
    }

    /// User ids talking on a thread. An unassigned rider is left out.
    pub fn thread_members(&self, thread: ChatThread) -> Vec<&str> {
        thread
            .member_roles()
            .into_iter()
            .filter_map(|role| self.user_for_role(role))
            .collect()
    }

    pub fn is_thread_member(&self, user_id: &str, thread: ChatThread) -> bool {
        self.thread_members(thread).contains(&user_id)
    }

    /// Participants and admins may see the order.
    pub fn can_view(&self, claims: &Claims) -> bool {
        claims.is_admin() || self.is_participant(&claims.sub)
    }

    /// Thread members, the assigned rider and admins may read a thread.
    pub fn can_read_thread(&self, claims: &Claims, thread: ChatThread) -> bool {
        self.can_read_thread_as(&claims.sub, claims.role, thread)
    }

    pub fn can_read_thread_as(&self, user_id: &str, role: Role, thread: ChatThread) -> bool {
        role == Role::Admin
            || self.is_thread_member(user_id, thread)
            || self.delivery_staff_id.as_deref() == Some(user_id)
    }
}

fn map_order(row: &Row<'_>) -> rusqlite::Result<OrderRecord> {
    Ok(OrderRecord {
        id: row.get(0)?,
        customer_id: row.get(1)?,
        restaurant_id: row.get(2)?,
        delivery_staff_id: row.get(3)?,
        status: parse_column(row, 4)?,
        total_amount: row.get(5)?,
        delivery_address: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

pub fn insert_order(conn: &Connection, order: &NewOrder) -> rusqlite::Result<OrderRecord> {
    let id = Uuid::now_v7().to_string();
    let now = Utc::now();
    conn.execute(
        "INSERT INTO orders (id, customer_id, restaurant_id, delivery_staff_id, status,
                             total_amount, delivery_address, created_at, updated_at)
         VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6, ?7, ?7)",
        params![
            id,
            order.customer_id,
            order.restaurant_id,
            OrderStatus::Pending.as_str(),
            order.total_amount,
            order.delivery_address,
            now,
        ],
    )?;

    Ok(OrderRecord {
        id,
        customer_id: order.customer_id.clone(),
        restaurant_id: order.restaurant_id.clone(),
        delivery_staff_id: None,
        status: OrderStatus::Pending,
        total_amount: order.total_amount,
        delivery_address: order.delivery_address.clone(),
        created_at: now,
        updated_at: now,
    })
}

pub fn fetch_order(conn: &Connection, order_id: &str) -> rusqlite::Result<Option<OrderRecord>> {
    conn.query_row(
        &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1"),
        params![order_id],
        map_order,
    )
    .optional()
}

/// Orders visible to a user: everything for admins, otherwise the orders
/// they take part in. Newest first.
pub fn list_orders_for(
    conn: &Connection,
    user_id: &str,
    role: Role,
) -> rusqlite::Result<Vec<OrderRecord>> {
    let column = match role {
        Role::Admin => None,
        Role::Customer => Some("customer_id"),
        Role::Restaurant => Some("restaurant_id"),
        Role::DeliveryStaff => Some("delivery_staff_id"),
    };

    match column {
        Some(column) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ORDER_COLUMNS} FROM orders WHERE {column} = ?1
                 ORDER BY created_at DESC, id DESC"
            ))?;
            let rows = stmt.query_map(params![user_id], map_order)?;
            rows.collect()
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ORDER_COLUMNS} FROM orders ORDER BY created_at DESC, id DESC"
            ))?;
            let rows = stmt.query_map([], map_order)?;
            rows.collect()
        }
    }
}

/// Terminal orders are left untouched; returns the number of rows changed.
pub fn update_status(
    conn: &Connection,
    order_id: &str,
    status: OrderStatus,
    now: DateTime<Utc>,
) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE orders SET status = ?1, updated_at = ?2
         WHERE id = ?3 AND status NOT IN ('delivered', 'cancelled')",
        params![status.as_str(), now, order_id],
    )
}

/// Same terminal guard as `update_status`.
pub fn assign_delivery_staff(
    conn: &Connection,
    order_id: &str,
    delivery_staff_id: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE orders SET delivery_staff_id = ?1, updated_at = ?2
         WHERE id = ?3 AND status NOT IN ('delivered', 'cancelled')",
        params![delivery_staff_id, now, order_id],
    )
}

/// Load an order off the async runtime, mapping absence to 404.
pub async fn load_order(db: &DbPool, order_id: &str) -> Result<OrderRecord, ApiError> {
    let db = db.clone();
    let oid = order_id.to_string();
    tokio::task::spawn_blocking(move || {
        let conn = db.lock()?;
        fetch_order(&conn, &oid)?.ok_or_else(|| ApiError::not_found("Order not found"))
    })
    .await?
}
