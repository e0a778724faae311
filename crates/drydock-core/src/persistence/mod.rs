// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence layer for processes and signal flags.
//!
//! Every engine primitive is durable: an invocation is committed in a single
//! transaction together with the children it spawned and the children it
//! harvested, and the lease is released in the same statement batch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::process::{Deadline, Frame, NewProcess};

pub mod sqlite;

pub use sqlite::SqlitePersistence;

/// Process record as stored in the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProcessRecord {
    /// Unique process identifier.
    pub id: String,
    /// Program of the active frame.
    pub program: String,
    /// Step to run next.
    pub step: String,
    /// JSON array of frames, innermost last.
    pub stack: String,
    /// Earliest time the process may run again.
    pub due_at: DateTime<Utc>,
    /// Value handed back by the last `return`, visible to one invocation.
    pub retval: Option<String>,
    /// Final value once the process exited.
    pub exit_value: Option<String>,
    /// Terminal marker. Never reset once set.
    pub exited: bool,
    /// Process that spawned this one.
    pub parent_id: Option<String>,
    /// Worker currently holding the lease.
    pub lease_owner: Option<String>,
    /// Lease expiry.
    pub lease_until: Option<DateTime<Utc>>,
    /// Deadline target step; `None` with `deadline_at` set means "must exit".
    pub deadline_target: Option<String>,
    /// Deadline expiry.
    pub deadline_at: Option<DateTime<Utc>>,
    /// Whether the deadline miss was already reported.
    pub deadline_fired: bool,
    /// Error text of the last failed invocation.
    pub last_error: Option<String>,
    /// Number of failed invocations.
    pub error_count: i64,
    /// When the process was created.
    pub created_at: DateTime<Utc>,
    /// When the process was last committed.
    pub updated_at: DateTime<Utc>,
}

impl ProcessRecord {
    /// Decode the frame stack.
    pub fn frames(&self) -> Result<Vec<Frame>> {
        Ok(serde_json::from_str(&self.stack)?)
    }

    /// Decode the pending return value.
    pub fn retval_json(&self) -> Result<Option<Value>> {
        decode_optional(self.retval.as_deref())
    }

    /// Decode the exit value.
    pub fn exit_value_json(&self) -> Result<Option<Value>> {
        decode_optional(self.exit_value.as_deref())
    }

    /// The registered deadline, if any.
    pub fn deadline(&self) -> Option<Deadline> {
        self.deadline_at.map(|at| Deadline {
            target: self.deadline_target.clone(),
            at,
            fired: self.deadline_fired,
        })
    }
}

fn decode_optional(raw: Option<&str>) -> Result<Option<Value>> {
    raw.map(serde_json::from_str)
        .transpose()
        .map_err(EngineError::from)
}

/// Signal flag row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SignalFlagRecord {
    /// Owning process.
    pub process_id: String,
    /// Flag name.
    pub name: String,
    /// Pending requests. Set means `count > 0`.
    pub count: i64,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

/// The outcome of one invocation, applied atomically.
#[derive(Debug, Clone)]
pub struct InvocationCommit {
    /// Process being committed.
    pub process_id: String,
    /// Lease owner; the commit is rejected if the lease moved on.
    pub lease_owner: String,
    /// New active program.
    pub program: String,
    /// New current step.
    pub step: String,
    /// New frame stack. Empty means exited.
    pub stack: Vec<Frame>,
    /// Next due time.
    pub due_at: DateTime<Utc>,
    /// Value for the next invocation.
    pub retval: Option<Value>,
    /// Final value when exiting.
    pub exit_value: Option<Value>,
    /// Deadline after this invocation.
    pub deadline: Option<Deadline>,
    /// Children created during the invocation.
    pub spawned: Vec<NewProcess>,
    /// Exited children detached during the invocation.
    pub harvested: Vec<String>,
    /// Commit time.
    pub now: DateTime<Utc>,
}

impl InvocationCommit {
    /// Whether this commit makes the process terminal.
    pub fn exits(&self) -> bool {
        self.stack.is_empty()
    }
}

/// Storage backend for the engine.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Insert a new process with a single root frame.
    async fn create_process(&self, process: &NewProcess, now: DateTime<Utc>) -> Result<()>;

    /// Load a process.
    async fn get_process(&self, process_id: &str) -> Result<Option<ProcessRecord>>;

    /// Ids of runnable processes: not exited, due, lease free or expired.
    async fn list_due_processes(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<String>>;

    /// Take the lease on a due process. Returns false when another worker
    /// holds it, the process is not due yet, or the process exited.
    async fn acquire_lease(
        &self,
        process_id: &str,
        owner: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool>;

    /// Apply an invocation outcome and release the lease.
    async fn commit_invocation(&self, commit: &InvocationCommit) -> Result<()>;

    /// Record a failed invocation. State and lease are left untouched.
    async fn record_step_error(
        &self,
        process_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Children of a process, exited or not.
    async fn list_children(&self, parent_id: &str) -> Result<Vec<ProcessRecord>>;

    /// Remove a process and its flags.
    async fn delete_process(&self, process_id: &str) -> Result<()>;

    /// Add one request to a flag. Returns the new count.
    async fn incr_signal(&self, process_id: &str, name: &str, now: DateTime<Utc>) -> Result<i64>;

    /// Remove one request from a flag. Returns the remaining count.
    async fn decr_signal(&self, process_id: &str, name: &str, now: DateTime<Utc>) -> Result<i64>;

    /// Drop all requests on a flag.
    async fn clear_signal(&self, process_id: &str, name: &str) -> Result<()>;

    /// Pending requests on a flag.
    async fn signal_count(&self, process_id: &str, name: &str) -> Result<i64>;

    /// All set flags of a process.
    async fn list_signals(&self, process_id: &str) -> Result<Vec<SignalFlagRecord>>;

    /// Check database connectivity.
    async fn health_check_db(&self) -> Result<bool>;
}
