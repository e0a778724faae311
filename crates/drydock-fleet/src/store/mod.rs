// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database operations for fleet entities.
//!
//! Fleet tables live in the same SQLite database as the engine's process
//! table. Each submodule holds the queries for one table; multi-row updates
//! that must not be observed half-done run in a transaction.

use sqlx::SqlitePool;

pub mod doctors;
pub mod nodes;
pub mod pages;
pub mod queries;
pub mod resources;
pub mod timelines;

const SCHEMA: &str = include_str!("../../migrations/schema.sql");

/// Create fleet tables and indexes if they do not exist.
pub async fn apply_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}

/// Check database connectivity.
pub async fn health_check(pool: &SqlitePool) -> Result<bool, sqlx::Error> {
    let row: (i64,) = sqlx::query_as("SELECT 1").fetch_one(pool).await?;
    Ok(row.0 == 1)
}
