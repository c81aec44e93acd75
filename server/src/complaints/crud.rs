use std::fmt;
use std::str::FromStr;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use khanasathi_proto::{Notification, NotificationKind, Role};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::middleware::Claims;
use crate::db::parse_column;
use crate::error::ApiError;
use crate::orders::store::fetch_order;
use crate::state::AppState;

const MAX_SUBJECT_LENGTH: usize = 200;
const MAX_DESCRIPTION_LENGTH: usize = 5000;

const COMPLAINT_COLUMNS: &str = "id, customer_id, order_id, subject, description, status,
     admin_response, created_at, updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplaintStatus {
    Open,
    InProgress,
    Resolved,
    Closed,
}

impl ComplaintStatus {
    pub const ALL: [ComplaintStatus; 4] = [
        Self::Open,
        Self::InProgress,
        Self::Resolved,
        Self::Closed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Resolved => "resolved",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ComplaintStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComplaintStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown complaint status '{s}'"))
    }
}

// --- Request / Response types ---

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Complaint {
    pub id: String,
    pub customer_id: String,
    pub order_id: Option<String>,
    pub subject: String,
    pub description: String,
    pub status: ComplaintStatus,
    pub admin_response: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateComplaintRequest {
    pub subject: String,
    pub description: String,
    #[serde(default)]
    pub order_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ComplaintFilter {
    pub status: Option<ComplaintStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateComplaintStatusRequest {
    pub status: ComplaintStatus,
    #[serde(default)]
    pub admin_response: Option<String>,
}

#[derive(Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplaintStats {
    pub open: u64,
    pub in_progress: u64,
    pub resolved: u64,
    pub closed: u64,
    pub total: u64,
}

// --- Queries ---

fn map_complaint(row: &Row<'_>) -> rusqlite::Result<Complaint> {
    Ok(Complaint {
        id: row.get(0)?,
        customer_id: row.get(1)?,
        order_id: row.get(2)?,
        subject: row.get(3)?,
        description: row.get(4)?,
        status: parse_column(row, 5)?,
        admin_response: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn fetch_complaint(conn: &Connection, id: &str) -> rusqlite::Result<Option<Complaint>> {
    conn.query_row(
        &format!("SELECT {COMPLAINT_COLUMNS} FROM complaints WHERE id = ?1"),
        params![id],
        map_complaint,
    )
    .optional()
}

fn count_by_status(conn: &Connection) -> rusqlite::Result<ComplaintStats> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM complaints GROUP BY status")?;
    let rows = stmt.query_map([], |row| {
        Ok((parse_column::<ComplaintStatus>(row, 0)?, row.get::<_, i64>(1)?))
    })?;

    let mut stats = ComplaintStats::default();
    for row in rows {
        let (status, count) = row?;
        let count = count.max(0) as u64;
        match status {
            ComplaintStatus::Open => stats.open = count,
            ComplaintStatus::InProgress => stats.in_progress = count,
            ComplaintStatus::Resolved => stats.resolved = count,
            ComplaintStatus::Closed => stats.closed = count,
        }
        stats.total += count;
    }
    Ok(stats)
}

// --- Handlers ---

/// POST /api/complaints
/// Customers file complaints, optionally about one of their orders.
pub async fn create_complaint(
    State(state): State<AppState>,
    claims: Claims,
    Json(body): Json<CreateComplaintRequest>,
) -> Result<(StatusCode, Json<Complaint>), ApiError> {
    claims.require_role(Role::Customer)?;

    let subject = body.subject.trim().to_string();
    let description = body.description.trim().to_string();
    if subject.is_empty() || subject.chars().count() > MAX_SUBJECT_LENGTH {
        return Err(ApiError::validation(format!(
            "Subject must be 1-{MAX_SUBJECT_LENGTH} characters"
        )));
    }
    if description.is_empty() || description.chars().count() > MAX_DESCRIPTION_LENGTH {
        return Err(ApiError::validation(format!(
            "Description must be 1-{MAX_DESCRIPTION_LENGTH} characters"
        )));
    }

    let db = state.db.clone();
    let customer_id = claims.sub.clone();
    let order_id = body.order_id.filter(|id| !id.trim().is_empty());

    let complaint = tokio::task::spawn_blocking(move || {
        let conn = db.lock()?;

        if let Some(oid) = &order_id {
            let order = fetch_order(&conn, oid)?
                .ok_or_else(|| ApiError::not_found("Order not found"))?;
            if order.customer_id != customer_id {
                return Err(ApiError::forbidden("Not your order"));
            }
        }

        let id = Uuid::now_v7().to_string();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO complaints (id, customer_id, order_id, subject, description, status,
                                     created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                id,
                customer_id,
                order_id,
                subject,
                description,
                ComplaintStatus::Open.as_str(),
                now,
            ],
        )?;

        fetch_complaint(&conn, &id)?
            .ok_or_else(|| ApiError::Internal("Complaint vanished after insert".to_string()))
    })
    .await??;

    tracing::info!(complaint_id = %complaint.id, customer_id = %complaint.customer_id, "Complaint filed");
    Ok((StatusCode::CREATED, Json(complaint)))
}

/// GET /api/complaints?status={status}
/// Admin only. Newest first.
pub async fn list_complaints(
    State(state): State<AppState>,
    claims: Claims,
    Query(filter): Query<ComplaintFilter>,
) -> Result<Json<Vec<Complaint>>, ApiError> {
    claims.require_admin()?;

    let db = state.db.clone();
    let complaints = tokio::task::spawn_blocking(move || {
        let conn = db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COMPLAINT_COLUMNS} FROM complaints
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at DESC, id DESC"
        ))?;
        let rows = stmt.query_map(params![filter.status.map(|s| s.as_str())], map_complaint)?;
        Ok::<_, ApiError>(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    })
    .await??;

    Ok(Json(complaints))
}

/// GET /api/complaints/my
pub async fn my_complaints(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<Vec<Complaint>>, ApiError> {
    let db = state.db.clone();
    let complaints = tokio::task::spawn_blocking(move || {
        let conn = db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COMPLAINT_COLUMNS} FROM complaints WHERE customer_id = ?1
             ORDER BY created_at DESC, id DESC"
        ))?;
        let rows = stmt.query_map(params![claims.sub], map_complaint)?;
        Ok::<_, ApiError>(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    })
    .await??;

    Ok(Json(complaints))
}

/// GET /api/complaints/stats
pub async fn complaint_stats(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<ComplaintStats>, ApiError> {
    claims.require_admin()?;

    let db = state.db.clone();
    let stats = tokio::task::spawn_blocking(move || {
        let conn = db.lock()?;
        Ok::<_, ApiError>(count_by_status(&conn)?)
    })
    .await??;

    Ok(Json(stats))
}

/// GET /api/complaints/{complaint_id}
pub async fn get_complaint(
    State(state): State<AppState>,
    claims: Claims,
    Path(complaint_id): Path<String>,
) -> Result<Json<Complaint>, ApiError> {
    let db = state.db.clone();
    let complaint = tokio::task::spawn_blocking(move || {
        let conn = db.lock()?;
        fetch_complaint(&conn, &complaint_id)?
            .ok_or_else(|| ApiError::not_found("Complaint not found"))
    })
    .await??;

    if !(claims.is_admin() || complaint.customer_id == claims.sub) {
        return Err(ApiError::forbidden("Not your complaint"));
    }
    Ok(Json(complaint))
}

/// PUT /api/complaints/{complaint_id}/status
/// Admin triage. The complainant is notified in their user room.
pub async fn update_complaint_status(
    State(state): State<AppState>,
    claims: Claims,
    Path(complaint_id): Path<String>,
    Json(body): Json<UpdateComplaintStatusRequest>,
) -> Result<Json<Complaint>, ApiError> {
    claims.require_admin()?;

    let db = state.db.clone();
    let response = body
        .admin_response
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty());
    let status = body.status;

    let complaint = tokio::task::spawn_blocking(move || {
        let conn = db.lock()?;
        let updated = conn.execute(
            "UPDATE complaints
             SET status = ?1, admin_response = COALESCE(?2, admin_response), updated_at = ?3
             WHERE id = ?4",
            params![status.as_str(), response, Utc::now(), complaint_id],
        )?;
        if updated == 0 {
            return Err(ApiError::not_found("Complaint not found"));
        }
        fetch_complaint(&conn, &complaint_id)?
            .ok_or_else(|| ApiError::not_found("Complaint not found"))
    })
    .await??;

    let mut notification = Notification::new(
        NotificationKind::ComplaintUpdate,
        "Complaint updated",
        format!("Your complaint \"{}\" is now {}", complaint.subject, complaint.status),
    );
    if let Some(order_id) = &complaint.order_id {
        notification = notification.for_order(order_id);
    }
    state.relay.notify_user(&complaint.customer_id, notification);
    tracing::info!(complaint_id = %complaint.id, status = %complaint.status, "Complaint status updated");

    Ok(Json(complaint))
}
