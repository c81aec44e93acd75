//! Static content pages (about, terms, FAQ). Public reads, admin writes.

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::auth::middleware::Claims;
use crate::error::ApiError;
use crate::state::AppState;

const MAX_SLUG_LENGTH: usize = 64;
const MAX_TITLE_LENGTH: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentPage {
    pub slug: String,
    pub title: String,
    pub body: String,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct UpsertPageRequest {
    pub title: String,
    pub body: String,
}

/// Slugs are 1-64 chars of lowercase ASCII letters, digits and dashes.
fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug.len() <= MAX_SLUG_LENGTH
        && slug
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

fn fetch_page(conn: &Connection, slug: &str) -> rusqlite::Result<Option<ContentPage>> {
    conn.query_row(
        "SELECT slug, title, body, updated_by, updated_at FROM content_pages WHERE slug = ?1",
        params![slug],
        |row| {
            Ok(ContentPage {
                slug: row.get(0)?,
                title: row.get(1)?,
                body: row.get(2)?,
                updated_by: row.get(3)?,
                updated_at: row.get(4)?,
            })
        },
    )
    .optional()
}

/// GET /api/content/{slug}
/// No auth required.
pub async fn get_page(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<ContentPage>, ApiError> {
    if !is_valid_slug(&slug) {
        return Err(ApiError::not_found("Page not found"));
    }

    let db = state.db.clone();
    let page = tokio::task::spawn_blocking(move || {
        let conn = db.lock()?;
        fetch_page(&conn, &slug)?.ok_or_else(|| ApiError::not_found("Page not found"))
    })
    .await??;

    Ok(Json(page))
}

/// POST /api/content/{slug}
/// Admin only. Creates the page or replaces its title and body.
pub async fn upsert_page(
    State(state): State<AppState>,
    claims: Claims,
    Path(slug): Path<String>,
    Json(body): Json<UpsertPageRequest>,
) -> Result<Json<ContentPage>, ApiError> {
    claims.require_admin()?;

    if !is_valid_slug(&slug) {
        return Err(ApiError::validation(
            "Slug must be 1-64 lowercase letters, digits or dashes",
        ));
    }
    let title = body.title.trim().to_string();
    if title.is_empty() || title.chars().count() > MAX_TITLE_LENGTH {
        return Err(ApiError::validation(format!(
            "Title must be 1-{MAX_TITLE_LENGTH} characters"
        )));
    }

    let db = state.db.clone();
    let editor = claims.sub.clone();
    let page = tokio::task::spawn_blocking(move || {
        let conn = db.lock()?;
        conn.execute(
            "INSERT INTO content_pages (slug, title, body, updated_by, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(slug) DO UPDATE SET
                title = excluded.title,
                body = excluded.body,
                updated_by = excluded.updated_by,
                updated_at = excluded.updated_at",
            params![slug, title, body.body, editor, Utc::now()],
        )?;
        fetch_page(&conn, &slug)?
            .ok_or_else(|| ApiError::Internal("Page vanished after upsert".to_string()))
    })
    .await??;

    tracing::info!(slug = %page.slug, updated_by = %page.updated_by, "Content page saved");
    Ok(Json(page))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_validation() {
        assert!(is_valid_slug("terms-of-service"));
        assert!(is_valid_slug("faq2"));
        assert!(!is_valid_slug(""));
        assert!(!is_valid_slug("About"));
        assert!(!is_valid_slug("../etc"));
        assert!(!is_valid_slug(&"a".repeat(MAX_SLUG_LENGTH + 1)));
    }
}
