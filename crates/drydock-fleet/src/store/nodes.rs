// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `nodes` table.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::model::{NodeRecord, TimelineAccess};

/// Insert a new node row.
pub async fn insert(pool: &SqlitePool, n: &NodeRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO nodes (
            id, resource_id, vm_name, address_name, address_ip,
            engine_version, extras_version, minor_version, machine_type, storage_gib,
            timeline_id, timeline_access, representative_at, synchronization_status,
            domain, display_state, created_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
        "#,
    )
    .bind(&n.id)
    .bind(&n.resource_id)
    .bind(&n.vm_name)
    .bind(&n.address_name)
    .bind(&n.address_ip)
    .bind(&n.engine_version)
    .bind(&n.extras_version)
    .bind(&n.minor_version)
    .bind(&n.machine_type)
    .bind(n.storage_gib)
    .bind(&n.timeline_id)
    .bind(&n.timeline_access)
    .bind(n.representative_at)
    .bind(&n.synchronization_status)
    .bind(&n.domain)
    .bind(&n.display_state)
    .bind(n.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<NodeRecord>, sqlx::Error> {
    sqlx::query_as::<_, NodeRecord>("SELECT * FROM nodes WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Nodes of a cluster, oldest first.
pub async fn list_for_resource(
    pool: &SqlitePool,
    resource_id: &str,
) -> Result<Vec<NodeRecord>, sqlx::Error> {
    sqlx::query_as::<_, NodeRecord>(
        "SELECT * FROM nodes WHERE resource_id = ?1 ORDER BY created_at, id",
    )
    .bind(resource_id)
    .fetch_all(pool)
    .await
}

/// The node currently acting as primary of a cluster.
pub async fn representative(
    pool: &SqlitePool,
    resource_id: &str,
) -> Result<Option<NodeRecord>, sqlx::Error> {
    sqlx::query_as::<_, NodeRecord>(
        r#"
        SELECT * FROM nodes
        WHERE resource_id = ?1 AND representative_at IS NOT NULL
        ORDER BY representative_at DESC
        LIMIT 1
        "#,
    )
    .bind(resource_id)
    .fetch_optional(pool)
    .await
}

/// The node archiving into a timeline.
pub async fn timeline_leader(
    pool: &SqlitePool,
    timeline_id: &str,
) -> Result<Option<NodeRecord>, sqlx::Error> {
    sqlx::query_as::<_, NodeRecord>(
        "SELECT * FROM nodes WHERE timeline_id = ?1 AND timeline_access = 'push' LIMIT 1",
    )
    .bind(timeline_id)
    .fetch_optional(pool)
    .await
}

/// Whether any node still reads or writes a timeline.
pub async fn timeline_in_use(pool: &SqlitePool, timeline_id: &str) -> Result<bool, sqlx::Error> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM nodes WHERE timeline_id = ?1")
        .bind(timeline_id)
        .fetch_one(pool)
        .await?;
    Ok(row.0 > 0)
}

pub async fn set_address_ip(pool: &SqlitePool, id: &str, ip: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE nodes SET address_ip = ?2 WHERE id = ?1")
        .bind(id)
        .bind(ip)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_display_state(
    pool: &SqlitePool,
    id: &str,
    state: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE nodes SET display_state = ?2 WHERE id = ?1")
        .bind(id)
        .bind(state)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_sync_status(pool: &SqlitePool, id: &str, status: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE nodes SET synchronization_status = ?2 WHERE id = ?1")
        .bind(id)
        .bind(status)
        .execute(pool)
        .await?;
    Ok(())
}

/// Point a node at another timeline.
pub async fn set_timeline(
    pool: &SqlitePool,
    id: &str,
    timeline_id: &str,
    access: TimelineAccess,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE nodes SET timeline_id = ?2, timeline_access = ?3 WHERE id = ?1")
        .bind(id)
        .bind(timeline_id)
        .bind(access.as_ref())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_engine_version(
    pool: &SqlitePool,
    id: &str,
    version: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE nodes SET engine_version = ?2 WHERE id = ?1")
        .bind(id)
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_extras_version(
    pool: &SqlitePool,
    id: &str,
    version: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE nodes SET extras_version = ?2 WHERE id = ?1")
        .bind(id)
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_minor_version(
    pool: &SqlitePool,
    id: &str,
    version: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE nodes SET minor_version = ?2 WHERE id = ?1")
        .bind(id)
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_storage(pool: &SqlitePool, id: &str, storage_gib: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE nodes SET storage_gib = ?2 WHERE id = ?1")
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
    sqlx::query("UPDATE nodes SET machine_type = ?2 WHERE id = ?1")
        .bind(id)
        .bind(machine_type)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_domain(
    pool: &SqlitePool,
    id: &str,
    domain: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE nodes SET domain = ?2 WHERE id = ?1")
        .bind(id)
        .bind(domain)
        .execute(pool)
        .await?;
    Ok(())
}

/// Exchange static addresses between two nodes.
pub async fn swap_addresses(
    pool: &SqlitePool,
    a: &NodeRecord,
    b: &NodeRecord,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for (id, other) in [(&a.id, b), (&b.id, a)] {
        sqlx::query("UPDATE nodes SET address_name = ?2, address_ip = ?3 WHERE id = ?1")
            .bind(id)
            .bind(&other.address_name)
            .bind(&other.address_ip)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await
}

/// Make `promoted` the primary in place of `demoted`: roles, timeline access
/// and domains move together.
pub async fn promote(
    pool: &SqlitePool,
    promoted: &NodeRecord,
    demoted: &NodeRecord,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE nodes
        SET representative_at = ?2, timeline_access = 'push', timeline_id = ?3,
            domain = ?4, synchronization_status = 'ready'
        WHERE id = ?1
        "#,
    )
    .bind(&promoted.id)
    .bind(now)
    .bind(&demoted.timeline_id)
    .bind(&demoted.domain)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE nodes
        SET representative_at = NULL, timeline_access = 'fetch', domain = ?2,
            synchronization_status = 'catching_up'
        WHERE id = ?1
        "#,
    )
    .bind(&demoted.id)
    .bind(&promoted.domain)
    .execute(&mut *tx)
    .await?;

    tx.commit().await
}

/// Finish a leader swap between a fork and its parent: the nodes exchange
/// domains and the fork stops being attached to the parent.
pub async fn complete_parent_swap(
    pool: &SqlitePool,
    fork_id: &str,
    fork_primary: &NodeRecord,
    parent_primary: &NodeRecord,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    for (id, domain) in [
        (&fork_primary.id, &parent_primary.domain),
        (&parent_primary.id, &fork_primary.domain),
    ] {
        sqlx::query("UPDATE nodes SET domain = ?2 WHERE id = ?1")
            .bind(id)
            .bind(domain)
            .execute(&mut *tx)
            .await?;
    }

    sqlx::query(
        "UPDATE resources SET parent_id = NULL, logical_replication = 0 WHERE id = ?1",
    )
    .bind(fork_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await
}

pub async fn delete(pool: &SqlitePool, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM nodes WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}
