// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `doctor_queries` table: templates and per-doctor copies.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::model::QueryRecord;

pub async fn insert(pool: &SqlitePool, q: &QueryRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO doctor_queries (
            id, parent_id, doctor_id, kind, name, db_name, schedule, sql, check_fn,
            severity, response_type, server_type, last_checked, created_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        "#,
    )
    .bind(&q.id)
    .bind(&q.parent_id)
    .bind(&q.doctor_id)
    .bind(&q.kind)
    .bind(&q.name)
    .bind(&q.db_name)
    .bind(&q.schedule)
    .bind(&q.sql)
    .bind(&q.check_fn)
    .bind(&q.severity)
    .bind(&q.response_type)
    .bind(&q.server_type)
    .bind(q.last_checked)
    .bind(q.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Insert a template unless one with the same name exists. Returns whether
/// a row was added.
pub async fn insert_template_if_missing(
    pool: &SqlitePool,
    q: &QueryRecord,
) -> Result<bool, sqlx::Error> {
    let existing: Option<(String,)> = sqlx::query_as(
        "SELECT id FROM doctor_queries WHERE doctor_id IS NULL AND name = ?1",
    )
    .bind(&q.name)
    .fetch_optional(pool)
    .await?;

    if existing.is_some() {
        return Ok(false);
    }
    insert(pool, q).await?;
    Ok(true)
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<QueryRecord>, sqlx::Error> {
    sqlx::query_as::<_, QueryRecord>("SELECT * FROM doctor_queries WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// All templates.
pub async fn list_templates(pool: &SqlitePool) -> Result<Vec<QueryRecord>, sqlx::Error> {
    sqlx::query_as::<_, QueryRecord>(
        "SELECT * FROM doctor_queries WHERE doctor_id IS NULL ORDER BY created_at, id",
    )
    .fetch_all(pool)
    .await
}

/// Queries owned by one doctor.
pub async fn list_for_doctor(
    pool: &SqlitePool,
    doctor_id: &str,
) -> Result<Vec<QueryRecord>, sqlx::Error> {
    sqlx::query_as::<_, QueryRecord>(
        "SELECT * FROM doctor_queries WHERE doctor_id = ?1 ORDER BY created_at, id",
    )
    .bind(doctor_id)
    .fetch_all(pool)
    .await
}

pub async fn set_last_checked(
    pool: &SqlitePool,
    id: &str,
    at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE doctor_queries SET last_checked = ?2 WHERE id = ?1")
        .bind(id)
        .bind(at)
        .execute(pool)
        .await?;
    Ok(())
}
