// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `resources` table.

use sqlx::SqlitePool;

use crate::model::ResourceRecord;

/// Insert a new cluster row.
pub async fn insert(pool: &SqlitePool, r: &ResourceRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO resources (
            id, name, location, org_id, ha_type,
            superuser_password, repl_password, db_name, db_user, db_user_password,
            engine_version, extras_version, minor_version, machine_type, storage_gib,
            parent_id, restore_target, recovery_target_lsn, logical_replication,
            version_upgrade, display_state, service_account_email, created_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)
        "#,
    )
    .bind(&r.id)
    .bind(&r.name)
    .bind(&r.location)
    .bind(&r.org_id)
    .bind(&r.ha_type)
    .bind(&r.superuser_password)
    .bind(&r.repl_password)
    .bind(&r.db_name)
    .bind(&r.db_user)
    .bind(&r.db_user_password)
    .bind(&r.engine_version)
    .bind(&r.extras_version)
    .bind(&r.minor_version)
    .bind(&r.machine_type)
    .bind(r.storage_gib)
    .bind(&r.parent_id)
    .bind(r.restore_target)
    .bind(&r.recovery_target_lsn)
    .bind(r.logical_replication)
    .bind(r.version_upgrade)
    .bind(&r.display_state)
    .bind(&r.service_account_email)
    .bind(r.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Get a cluster by id.
pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<ResourceRecord>, sqlx::Error> {
    sqlx::query_as::<_, ResourceRecord>("SELECT * FROM resources WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Get a cluster by organization and name.
pub async fn find_by_name(
    pool: &SqlitePool,
    org_id: &str,
    name: &str,
) -> Result<Option<ResourceRecord>, sqlx::Error> {
    sqlx::query_as::<_, ResourceRecord>(
        "SELECT * FROM resources WHERE org_id = ?1 AND name = ?2",
    )
    .bind(org_id)
    .bind(name)
    .fetch_optional(pool)
    .await
}

/// All clusters, oldest first.
pub async fn list(pool: &SqlitePool) -> Result<Vec<ResourceRecord>, sqlx::Error> {
    sqlx::query_as::<_, ResourceRecord>("SELECT * FROM resources ORDER BY created_at, id")
        .fetch_all(pool)
        .await
}

/// Forks restored from `parent_id` that are still attached to it.
pub async fn list_forks(
    pool: &SqlitePool,
    parent_id: &str,
) -> Result<Vec<ResourceRecord>, sqlx::Error> {
    sqlx::query_as::<_, ResourceRecord>(
        "SELECT * FROM resources WHERE parent_id = ?1 ORDER BY created_at, id",
    )
    .bind(parent_id)
    .fetch_all(pool)
    .await
}

/// Set or clear the display override.
pub async fn set_display_state(
    pool: &SqlitePool,
    id: &str,
    state: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE resources SET display_state = ?2 WHERE id = ?1")
        .bind(id)
        .bind(state)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_service_account(
    pool: &SqlitePool,
    id: &str,
    email: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE resources SET service_account_email = ?2 WHERE id = ?1")
        .bind(id)
        .bind(email)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_superuser_password(
    pool: &SqlitePool,
    id: &str,
    password: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE resources SET superuser_password = ?2 WHERE id = ?1")
        .bind(id)
        .bind(password)
        .execute(pool)
        .await?;
    Ok(())
}

/// Set target versions.
pub async fn set_versions(
    pool: &SqlitePool,
    id: &str,
    engine_version: &str,
    extras_version: &str,
    minor_version: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE resources
        SET engine_version = ?2, extras_version = ?3, minor_version = ?4
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(engine_version)
    .bind(extras_version)
    .bind(minor_version)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_storage(pool: &SqlitePool, id: &str, storage_gib: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE resources SET storage_gib = ?2 WHERE id = ?1")
        .bind(id)
        .bind(storage_gib)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_machine_type(
    pool: &SqlitePool,
    id: &str,
    machine_type: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE resources SET machine_type = ?2 WHERE id = ?1")
        .bind(id)
        .bind(machine_type)
        .execute(pool)
        .await?;
    Ok(())
}

/// Delete a cluster row.
pub async fn delete(pool: &SqlitePool, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM resources WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}
