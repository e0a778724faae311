// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Sqlite, SqlitePool};

use crate::error::{EngineError, Result};
use crate::process::NewProcess;

use super::{InvocationCommit, Persistence, ProcessRecord, SignalFlagRecord};

const PROCESS_COLUMNS: &str = r#"
    id, program, step, stack, due_at, retval, exit_value, exited, parent_id,
    lease_owner, lease_until, deadline_target, deadline_at, deadline_fired,
    last_error, error_count, created_at, updated_at
"#;

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    ///
    /// Migrations are not run; see [`crate::migrations::run`].
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file when missing, then
    /// runs all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::Database(sqlx::Error::Configuration(
                    format!("failed to create directory {:?}: {}", parent, e).into(),
                ))
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        crate::migrations::run(&pool).await?;

        Ok(Self { pool })
    }

    /// A migrated in-memory database on a single long-lived connection.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        crate::migrations::run(&pool).await?;

        Ok(Self { pool })
    }

    /// The underlying pool, shared with domain stores.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn insert_process<'e, E>(executor: E, process: &NewProcess, now: DateTime<Utc>) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let stack = serde_json::to_string(&process.stack())?;

    sqlx::query(
        r#"
        INSERT INTO processes (id, program, step, stack, due_at, parent_id, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&process.id)
    .bind(&process.program)
    .bind(&process.step)
    .bind(stack)
    .bind(process.due_at)
    .bind(&process.parent_id)
    .bind(now)
    .bind(now)
    .execute(executor)
    .await?;

    Ok(())
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn create_process(&self, process: &NewProcess, now: DateTime<Utc>) -> Result<()> {
        insert_process(&self.pool, process, now).await
    }

    async fn get_process(&self, process_id: &str) -> Result<Option<ProcessRecord>> {
        let record = sqlx::query_as::<_, ProcessRecord>(&format!(
            "SELECT {PROCESS_COLUMNS} FROM processes WHERE id = ?"
        ))
        .bind(process_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_due_processes(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT id FROM processes
            WHERE exited = 0
              AND due_at <= ?
              AND (lease_until IS NULL OR lease_until <= ?)
            ORDER BY due_at ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn acquire_lease(
        &self,
        process_id: &str,
        owner: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE processes
            SET lease_owner = ?, lease_until = ?
            WHERE id = ?
              AND exited = 0
              AND due_at <= ?
              AND (lease_until IS NULL OR lease_until <= ?)
            "#,
        )
        .bind(owner)
        .bind(until)
        .bind(process_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn commit_invocation(&self, commit: &InvocationCommit) -> Result<()> {
        let stack = serde_json::to_string(&commit.stack)?;
        let retval = commit
            .retval
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let exit_value = commit
            .exit_value
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let (deadline_target, deadline_at, deadline_fired) = match &commit.deadline {
            Some(d) => (d.target.clone(), Some(d.at), d.fired),
            None => (None, None, false),
        };

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE processes
            SET program = ?, step = ?, stack = ?, due_at = ?, retval = ?, exit_value = ?,
                exited = ?, deadline_target = ?, deadline_at = ?, deadline_fired = ?,
                last_error = NULL, lease_owner = NULL, lease_until = NULL, updated_at = ?
            WHERE id = ? AND lease_owner = ?
            "#,
        )
        .bind(&commit.program)
        .bind(&commit.step)
        .bind(stack)
        .bind(commit.due_at)
        .bind(retval)
        .bind(exit_value)
        .bind(commit.exits())
        .bind(deadline_target)
        .bind(deadline_at)
        .bind(deadline_fired)
        .bind(commit.now)
        .bind(&commit.process_id)
        .bind(&commit.lease_owner)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(EngineError::InvalidTransition {
                process_id: commit.process_id.clone(),
                reason: "lease lost before commit".to_string(),
            });
        }

        for child in &commit.spawned {
            insert_process(&mut *tx, child, commit.now).await?;
        }

        for child_id in &commit.harvested {
            sqlx::query("DELETE FROM processes WHERE id = ? AND parent_id = ? AND exited = 1")
                .bind(child_id)
                .bind(&commit.process_id)
                .execute(&mut *tx)
                .await?;
        }

        if commit.exits() {
            sqlx::query("DELETE FROM signal_flags WHERE process_id = ?")
                .bind(&commit.process_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn record_step_error(
        &self,
        process_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE processes
            SET last_error = ?, error_count = error_count + 1, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(error)
        .bind(now)
        .bind(process_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_children(&self, parent_id: &str) -> Result<Vec<ProcessRecord>> {
        let records = sqlx::query_as::<_, ProcessRecord>(&format!(
            "SELECT {PROCESS_COLUMNS} FROM processes WHERE parent_id = ? ORDER BY created_at, id"
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn delete_process(&self, process_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM signal_flags WHERE process_id = ?")
            .bind(process_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM processes WHERE id = ?")
            .bind(process_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn incr_signal(&self, process_id: &str, name: &str, now: DateTime<Utc>) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO signal_flags (process_id, name, count, updated_at)
            VALUES (?, ?, 1, ?)
            ON CONFLICT (process_id, name)
            DO UPDATE SET count = count + 1, updated_at = excluded.updated_at
            RETURNING count
            "#,
        )
        .bind(process_id)
        .bind(name)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn decr_signal(&self, process_id: &str, name: &str, now: DateTime<Utc>) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let remaining = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE signal_flags
            SET count = count - 1, updated_at = ?
            WHERE process_id = ? AND name = ?
            RETURNING count
            "#,
        )
        .bind(now)
        .bind(process_id)
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?
        .unwrap_or(0);

        if remaining <= 0 {
            sqlx::query("DELETE FROM signal_flags WHERE process_id = ? AND name = ?")
                .bind(process_id)
                .bind(name)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(remaining.max(0))
    }

    async fn clear_signal(&self, process_id: &str, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM signal_flags WHERE process_id = ? AND name = ?")
            .bind(process_id)
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn signal_count(&self, process_id: &str, name: &str) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT count FROM signal_flags WHERE process_id = ? AND name = ?",
        )
        .bind(process_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(count.unwrap_or(0))
    }

    async fn list_signals(&self, process_id: &str) -> Result<Vec<SignalFlagRecord>> {
        let flags = sqlx::query_as::<_, SignalFlagRecord>(
            r#"
            SELECT process_id, name, count, updated_at
            FROM signal_flags
            WHERE process_id = ? AND count > 0
            ORDER BY name
            "#,
        )
        .bind(process_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(flags)
    }

    async fn health_check_db(&self) -> Result<bool> {
        let one = sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(one == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{Deadline, Frame};
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_due_selection_respects_due_time_and_lease() {
        let db = SqlitePersistence::in_memory().await.unwrap();
        let now = t0();

        db.create_process(&NewProcess::new("a", "node", now), now)
            .await
            .unwrap();
        let mut later = NewProcess::new("b", "node", now);
        later.due_at = now + Duration::seconds(30);
        db.create_process(&later, now).await.unwrap();

        assert_eq!(db.list_due_processes(now, 10).await.unwrap(), vec!["a"]);

        assert!(db
            .acquire_lease("a", "w1", now, now + Duration::seconds(60))
            .await
            .unwrap());
        assert!(!db
            .acquire_lease("a", "w2", now, now + Duration::seconds(60))
            .await
            .unwrap());
        assert!(db.list_due_processes(now, 10).await.unwrap().is_empty());

        // Expired leases can be taken over.
        let later_now = now + Duration::seconds(61);
        let due = db.list_due_processes(later_now, 10).await.unwrap();
        assert_eq!(due, vec!["a", "b"]);
        assert!(db
            .acquire_lease("a", "w2", later_now, later_now + Duration::seconds(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_signal_flags_count() {
        let db = SqlitePersistence::in_memory().await.unwrap();
        let now = t0();
        db.create_process(&NewProcess::new("p", "doctor", now), now)
            .await
            .unwrap();

        assert_eq!(db.incr_signal("p", "sync", now).await.unwrap(), 1);
        assert_eq!(db.incr_signal("p", "sync", now).await.unwrap(), 2);
        assert_eq!(db.decr_signal("p", "sync", now).await.unwrap(), 1);
        assert_eq!(db.signal_count("p", "sync").await.unwrap(), 1);
        assert_eq!(db.decr_signal("p", "sync", now).await.unwrap(), 0);
        assert!(db.list_signals("p").await.unwrap().is_empty());

        // Decrementing an unset flag stays at zero.
        assert_eq!(db.decr_signal("p", "sync", now).await.unwrap(), 0);

        db.incr_signal("p", "destroy", now).await.unwrap();
        db.incr_signal("p", "destroy", now).await.unwrap();
        db.clear_signal("p", "destroy").await.unwrap();
        assert_eq!(db.signal_count("p", "destroy").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_commit_spawns_and_harvests_atomically() {
        let db = SqlitePersistence::in_memory().await.unwrap();
        let now = t0();
        db.create_process(&NewProcess::new("parent", "resource", now), now)
            .await
            .unwrap();

        let mut old_child = NewProcess::new("old", "chore", now);
        old_child.parent_id = Some("parent".to_string());
        db.create_process(&old_child, now).await.unwrap();
        sqlx::query("UPDATE processes SET exited = 1, stack = '[]' WHERE id = 'old'")
            .execute(db.pool())
            .await
            .unwrap();

        assert!(db
            .acquire_lease("parent", "w1", now, now + Duration::seconds(60))
            .await
            .unwrap());

        let mut new_child = NewProcess::new("new", "chore", now);
        new_child.parent_id = Some("parent".to_string());

        let commit = InvocationCommit {
            process_id: "parent".to_string(),
            lease_owner: "w1".to_string(),
            program: "resource".to_string(),
            step: "wait".to_string(),
            stack: vec![Frame::root("resource", Default::default())],
            due_at: now + Duration::seconds(5),
            retval: None,
            exit_value: None,
            deadline: Some(Deadline {
                target: Some("wait".to_string()),
                at: now + Duration::minutes(10),
                fired: false,
            }),
            spawned: vec![new_child],
            harvested: vec!["old".to_string()],
            now,
        };
        db.commit_invocation(&commit).await.unwrap();

        let children = db.list_children("parent").await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, "new");

        let parent = db.get_process("parent").await.unwrap().unwrap();
        assert_eq!(parent.step, "wait");
        assert!(parent.lease_owner.is_none());
        assert_eq!(parent.deadline().unwrap().target.as_deref(), Some("wait"));
    }

    #[tokio::test]
    async fn test_commit_rejected_without_lease() {
        let db = SqlitePersistence::in_memory().await.unwrap();
        let now = t0();
        db.create_process(&NewProcess::new("p", "node", now), now)
            .await
            .unwrap();

        let commit = InvocationCommit {
            process_id: "p".to_string(),
            lease_owner: "nobody".to_string(),
            program: "node".to_string(),
            step: "wait".to_string(),
            stack: Vec::new(),
            due_at: now,
            retval: None,
            exit_value: Some(json!({"msg": "done"})),
            deadline: None,
            spawned: Vec::new(),
            harvested: Vec::new(),
            now,
        };

        let err = db.commit_invocation(&commit).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_TRANSITION");
        let record = db.get_process("p").await.unwrap().unwrap();
        assert!(!record.exited);
    }
}
