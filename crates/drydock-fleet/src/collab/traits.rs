// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Collaborator trait definitions.
//!
//! Every side effect outside the database goes through one of these traits.
//! Implementations must be idempotent where noted, because a step that fails
//! after a call is retried from the top.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;

/// Errors from collaborator calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CollabError {
    /// Host or service could not be reached.
    #[error("{target} is unreachable: {reason}")]
    Unreachable {
        /// Host or service.
        target: String,
        /// Transport error text.
        reason: String,
    },

    /// The referenced object does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The call conflicts with the object's current state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The remote side reported an error.
    #[error("Remote error: {0}")]
    Remote(String),
}

impl CollabError {
    /// Whether the error means the object is already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether the error is a connectivity failure.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }
}

/// Result type for collaborator calls.
pub type CollabResult<T> = std::result::Result<T, CollabError>;

/// State of a named task on a host's agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, AsRefStr, Display)]
#[serde(rename_all = "PascalCase")]
pub enum TaskStatus {
    /// No task with this name exists (never started or already cleaned).
    NotStarted,
    /// Running.
    InProgress,
    /// Finished with exit code zero.
    Succeeded,
    /// Finished with a non-zero exit code.
    Failed,
}

/// Captured output of a finished task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLogs {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

/// Agent on each database host that runs named, long-running commands.
///
/// A name identifies at most one task per host; `run` on a name that exists
/// is a no-op.
#[async_trait]
pub trait RemoteAgent: Send + Sync {
    /// Start `command` under `task`, feeding it `stdin`.
    async fn run(
        &self,
        host: &str,
        task: &str,
        command: &str,
        stdin: Option<&str>,
    ) -> CollabResult<()>;

    /// Current state of `task`.
    async fn check(&self, host: &str, task: &str) -> CollabResult<TaskStatus>;

    /// Output of a finished `task`.
    async fn logs(&self, host: &str, task: &str) -> CollabResult<TaskLogs>;

    /// Forget `task` so the name can be reused.
    async fn clean(&self, host: &str, task: &str) -> CollabResult<()>;

    /// Run a short command synchronously and return its stdout.
    async fn exec(&self, host: &str, command: &str, stdin: Option<&str>) -> CollabResult<String>;
}

/// SQL access to a database host.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// Run `sql` in `db` as `user` and return the unaligned, tuples-only output.
    async fn run_query(&self, host: &str, db: &str, user: &str, sql: &str) -> CollabResult<String>;
}

/// Lifecycle state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, AsRefStr, Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum VmStatus {
    Provisioning,
    Running,
    Stopping,
    Stopped,
}

/// VM creation parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub location: String,
    pub machine_type: String,
    pub storage_gib: i64,
    /// Image family derived from the minor version.
    pub image: String,
}

/// Observed VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInfo {
    pub name: String,
    pub status: VmStatus,
    pub machine_type: String,
    pub storage_gib: i64,
}

/// A reserved static address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressInfo {
    pub name: String,
    pub ip: String,
    /// VM the address is attached to.
    pub attached_to: Option<String>,
}

/// Cloud compute provider.
#[async_trait]
pub trait CloudCompute: Send + Sync {
    async fn create_vm(&self, spec: &VmSpec) -> CollabResult<()>;
    async fn get_vm(&self, name: &str) -> CollabResult<Option<VmInfo>>;
    async fn start_vm(&self, name: &str) -> CollabResult<()>;
    async fn stop_vm(&self, name: &str) -> CollabResult<()>;
    async fn delete_vm(&self, name: &str) -> CollabResult<()>;

    /// Reserve a static address.
    async fn create_address(&self, name: &str, location: &str) -> CollabResult<AddressInfo>;
    async fn get_address(&self, name: &str) -> CollabResult<Option<AddressInfo>>;
    async fn release_address(&self, name: &str) -> CollabResult<()>;
    /// Attach an address to a VM. Fails if either side is already attached.
    async fn attach_address(&self, vm: &str, address: &str) -> CollabResult<()>;
    async fn detach_address(&self, vm: &str, address: &str) -> CollabResult<()>;

    /// Grow the data disk.
    async fn resize_disk(&self, vm: &str, storage_gib: i64) -> CollabResult<()>;
    /// Change machine type. The VM must be stopped.
    async fn set_machine_type(&self, vm: &str, machine_type: &str) -> CollabResult<()>;
}

/// Service identities with scoped bucket access.
#[async_trait]
pub trait IdentityClient: Send + Sync {
    /// Create an identity and return its email.
    async fn create_identity(&self, name: &str) -> CollabResult<String>;
    /// Issue a key for an identity, base64 encoded.
    async fn create_key(&self, email: &str) -> CollabResult<String>;
    /// Allow an identity to read and write objects under `prefix` in `bucket`.
    async fn grant_bucket_access(
        &self,
        email: &str,
        bucket: &str,
        prefix: &str,
    ) -> CollabResult<()>;
    async fn delete_identity(&self, email: &str) -> CollabResult<()>;
}

/// An A record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub domain: String,
    pub ip: String,
}

/// DNS provider.
#[async_trait]
pub trait DnsClient: Send + Sync {
    async fn get_record(&self, domain: &str) -> CollabResult<Option<DnsRecord>>;
    async fn insert_record(&self, domain: &str, ip: &str) -> CollabResult<()>;
    async fn update_record(&self, domain: &str, ip: &str) -> CollabResult<()>;
    async fn delete_record(&self, domain: &str) -> CollabResult<()>;

    /// Point `domain` at `ip`, creating the record if needed.
    async fn upsert_record(&self, domain: &str, ip: &str) -> CollabResult<()> {
        match self.get_record(domain).await? {
            Some(record) if record.ip == ip => Ok(()),
            Some(_) => self.update_record(domain, ip).await,
            None => self.insert_record(domain, ip).await,
        }
    }
}

/// An object in blob storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobObject {
    pub key: String,
    pub updated_at: DateTime<Utc>,
}

/// Object storage holding backups.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Objects under `prefix` whose remaining key matches `glob` (`*` wildcards).
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        glob: &str,
    ) -> CollabResult<Vec<BlobObject>>;
    /// Fetch and parse a JSON object.
    async fn get_json(&self, bucket: &str, key: &str) -> CollabResult<Value>;
}

/// External paging service.
#[async_trait]
pub trait IncidentNotifier: Send + Sync {
    async fn trigger(
        &self,
        tag: &str,
        summary: &str,
        severity: &str,
        details: &Value,
    ) -> CollabResult<()>;
    async fn resolve(&self, tag: &str) -> CollabResult<()>;
}
