// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for drydock-core.
//!
//! Embedders sharing the pool with their own tables should create those
//! tables with plain `CREATE TABLE IF NOT EXISTS` statements; the engine owns
//! `_sqlx_migrations`.
//!
//! # Example
//!
//! ```ignore
//! let pool = sqlx::SqlitePool::connect("sqlite:drydock.db?mode=rwc").await?;
//! drydock_core::migrations::run(&pool).await?;
//! ```

use sqlx::migrate::MigrateError;

/// SQLite migrator with all engine migrations embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run SQLite migrations.
///
/// Applies all pending migrations to the database. Safe to call multiple times;
/// already-applied migrations are skipped.
pub async fn run(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
