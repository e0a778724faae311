// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `doctors` table.

use sqlx::SqlitePool;

use crate::model::DoctorRecord;

pub async fn insert(pool: &SqlitePool, d: &DoctorRecord) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO doctors (id, resource_id, created_at) VALUES (?1, ?2, ?3)")
        .bind(&d.id)
        .bind(&d.resource_id)
        .bind(d.created_at)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<DoctorRecord>, sqlx::Error> {
    sqlx::query_as::<_, DoctorRecord>("SELECT * FROM doctors WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn for_resource(
    pool: &SqlitePool,
    resource_id: &str,
) -> Result<Option<DoctorRecord>, sqlx::Error> {
    sqlx::query_as::<_, DoctorRecord>("SELECT * FROM doctors WHERE resource_id = ?1")
        .bind(resource_id)
        .fetch_optional(pool)
        .await
}

/// Delete a doctor together with its query copies.
pub async fn delete(pool: &SqlitePool, id: &str) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM doctor_queries WHERE doctor_id = ?1")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    let result = sqlx::query("DELETE FROM doctors WHERE id = ?1")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(result.rows_affected() > 0)
}
