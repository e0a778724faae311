// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `pages` table.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::model::PageRecord;

/// Insert a page. Fails on the partial unique index when another page with
/// the same tag is still open.
pub async fn insert(pool: &SqlitePool, p: &PageRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO pages (
            id, tag, summary, severity, status, details, query_id, db_name, node_id,
            created_at, resolved_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
    )
    .bind(&p.id)
    .bind(&p.tag)
    .bind(&p.summary)
    .bind(&p.severity)
    .bind(&p.status)
    .bind(&p.details)
    .bind(&p.query_id)
    .bind(&p.db_name)
    .bind(&p.node_id)
    .bind(p.created_at)
    .bind(p.resolved_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<PageRecord>, sqlx::Error> {
    sqlx::query_as::<_, PageRecord>("SELECT * FROM pages WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// The non-resolved page for a tag.
pub async fn open_by_tag(pool: &SqlitePool, tag: &str) -> Result<Option<PageRecord>, sqlx::Error> {
    sqlx::query_as::<_, PageRecord>(
        "SELECT * FROM pages WHERE tag = ?1 AND status <> 'resolved' LIMIT 1",
    )
    .bind(tag)
    .fetch_optional(pool)
    .await
}

/// Non-resolved pages, newest first.
pub async fn list_open(pool: &SqlitePool) -> Result<Vec<PageRecord>, sqlx::Error> {
    sqlx::query_as::<_, PageRecord>(
        "SELECT * FROM pages WHERE status <> 'resolved' ORDER BY created_at DESC, id",
    )
    .fetch_all(pool)
    .await
}

/// Every page, newest first.
pub async fn list_all(pool: &SqlitePool) -> Result<Vec<PageRecord>, sqlx::Error> {
    sqlx::query_as::<_, PageRecord>("SELECT * FROM pages ORDER BY created_at DESC, id")
        .fetch_all(pool)
        .await
}

/// Non-resolved pages raised for one health-check query.
pub async fn list_open_for_query(
    pool: &SqlitePool,
    query_id: &str,
) -> Result<Vec<PageRecord>, sqlx::Error> {
    sqlx::query_as::<_, PageRecord>(
        "SELECT * FROM pages WHERE query_id = ?1 AND status <> 'resolved'",
    )
    .bind(query_id)
    .fetch_all(pool)
    .await
}

/// Refresh the summary and details of an open page.
pub async fn refresh(
    pool: &SqlitePool,
    id: &str,
    summary: &str,
    details: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE pages SET summary = ?2, details = ?3 WHERE id = ?1")
        .bind(id)
        .bind(summary)
        .bind(details)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_status(
    pool: &SqlitePool,
    id: &str,
    status: &str,
    resolved_at: Option<DateTime<Utc>>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE pages SET status = ?2, resolved_at = ?3 WHERE id = ?1")
        .bind(id)
        .bind(status)
        .bind(resolved_at)
        .execute(pool)
        .await?;
    Ok(())
}
