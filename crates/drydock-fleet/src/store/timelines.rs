// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `timelines` table.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::model::TimelineRecord;

pub async fn insert(pool: &SqlitePool, t: &TimelineRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO timelines (
            id, parent_id, bucket, service_account_email, service_account_key,
            latest_backup_started_at, earliest_backup_completed_at,
            latest_backup_completed_at, created_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )
    .bind(&t.id)
    .bind(&t.parent_id)
    .bind(&t.bucket)
    .bind(&t.service_account_email)
    .bind(&t.service_account_key)
    .bind(t.latest_backup_started_at)
    .bind(t.earliest_backup_completed_at)
    .bind(t.latest_backup_completed_at)
    .bind(t.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<TimelineRecord>, sqlx::Error> {
    sqlx::query_as::<_, TimelineRecord>("SELECT * FROM timelines WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Record the scoped identity used to reach the timeline's prefix.
pub async fn set_identity(
    pool: &SqlitePool,
    id: &str,
    email: &str,
    key: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE timelines SET service_account_email = ?2, service_account_key = ?3 WHERE id = ?1",
    )
    .bind(id)
    .bind(email)
    .bind(key)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_backup_started(
    pool: &SqlitePool,
    id: &str,
    at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE timelines SET latest_backup_started_at = ?2 WHERE id = ?1")
        .bind(id)
        .bind(at)
        .execute(pool)
        .await?;
    Ok(())
}

/// Refresh the cached bounds of completed backups.
pub async fn set_backup_bounds(
    pool: &SqlitePool,
    id: &str,
    earliest: Option<DateTime<Utc>>,
    latest: Option<DateTime<Utc>>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE timelines
        SET earliest_backup_completed_at = ?2, latest_backup_completed_at = ?3
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(earliest)
    .bind(latest)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete(pool: &SqlitePool, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM timelines WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}
