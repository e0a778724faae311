// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory collaborators for tests and local runs.
//!
//! One [`InMemoryCloud`] implements every collaborator trait. VMs come up
//! after one observation, agent tasks finish as soon as they are started, and
//! queries answer with healthy defaults. Tests script failures on top:
//! unreachable hosts, failing or held tasks, canned query and exec output.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::sync::Mutex;

use super::traits::*;

/// A task start observed by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRun {
    pub host: String,
    pub task: String,
    pub command: String,
    pub stdin: Option<String>,
}

/// A query observed by the database client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedQuery {
    pub host: String,
    pub db: String,
    pub sql: String,
}

/// A call observed by the notifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Triggered { tag: String, summary: String, severity: String },
    Resolved { tag: String },
}

#[derive(Debug, Clone)]
struct MemTask {
    status: TaskStatus,
    logs: TaskLogs,
}

#[derive(Debug, Clone)]
struct QueryRule {
    host: Option<String>,
    pattern: String,
    response: String,
}

#[derive(Default)]
struct State {
    vms: HashMap<String, VmInfo>,
    addresses: HashMap<String, AddressInfo>,
    next_ip: u32,

    tasks: HashMap<(String, String), MemTask>,
    task_runs: Vec<TaskRun>,
    failing_tasks: Vec<String>,
    held_tasks: Vec<String>,
    task_outputs: Vec<(String, String)>,

    exec_log: Vec<(String, String)>,
    exec_rules: Vec<(String, String)>,
    queries: Vec<ExecutedQuery>,
    query_rules: Vec<QueryRule>,
    unreachable: HashSet<String>,
    db_down: HashSet<String>,

    dns: HashMap<String, String>,
    blobs: BTreeMap<(String, String), (DateTime<Utc>, Value)>,
    identities: HashMap<String, Vec<(String, String)>>,

    notifications: Vec<Notification>,
    notifier_down: bool,
}

impl State {
    fn reachable(&self, host: &str) -> CollabResult<()> {
        if self.unreachable.contains(host) {
            return Err(CollabError::Unreachable {
                target: host.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

/// Scriptable in-memory implementation of every collaborator.
#[derive(Clone, Default)]
pub struct InMemoryCloud {
    state: Arc<Mutex<State>>,
}

fn default_query_response(sql: &str) -> &'static str {
    if sql.trim() == "SELECT 1" {
        "1"
    } else if sql.contains("pg_current_wal_lsn") || sql.contains("pg_last_wal_replay_lsn") {
        "0/3000000"
    } else if sql.contains("sync_state") {
        "quorum"
    } else if sql.contains("pg_is_in_recovery") {
        "f"
    } else if sql.contains("pg_get_wal_replay_pause_state") {
        "not paused"
    } else if sql.contains("FROM pg_database") {
        "postgres"
    } else {
        ""
    }
}

fn default_exec_response(command: &str) -> &'static str {
    if command.contains("df ") {
        "42%"
    } else if command.contains("--version") {
        "drydock-agent 1.0.0"
    } else {
        ""
    }
}

fn glob_matches(glob: &str, text: &str) -> bool {
    let pattern = format!("^{}$", regex::escape(glob).replace(r"\*", ".*"));
    regex::Regex::new(&pattern).is_ok_and(|re| re.is_match(text))
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    // -- scripting --

    /// Make agent and database calls to `host` fail as unreachable.
    pub async fn set_unreachable(&self, host: &str, unreachable: bool) {
        let mut state = self.state.lock().await;
        if unreachable {
            state.unreachable.insert(host.to_string());
        } else {
            state.unreachable.remove(host);
        }
    }

    /// Make database calls to `host` fail while its agent still answers.
    pub async fn set_db_down(&self, host: &str, down: bool) {
        let mut state = self.state.lock().await;
        if down {
            state.db_down.insert(host.to_string());
        } else {
            state.db_down.remove(host);
        }
    }

    /// Answer queries containing `pattern` with `response`, on `host` or on
    /// every host. Later rules win.
    pub async fn respond_to_query(&self, host: Option<&str>, pattern: &str, response: &str) {
        self.state.lock().await.query_rules.push(QueryRule {
            host: host.map(str::to_string),
            pattern: pattern.to_string(),
            response: response.to_string(),
        });
    }

    /// Answer exec commands containing `pattern` with `stdout`. Later rules win.
    pub async fn respond_to_exec(&self, pattern: &str, stdout: &str) {
        self.state
            .lock()
            .await
            .exec_rules
            .push((pattern.to_string(), stdout.to_string()));
    }

    /// Tasks whose name starts with `prefix` finish as failed.
    pub async fn fail_tasks(&self, prefix: &str) {
        self.state.lock().await.failing_tasks.push(prefix.to_string());
    }

    /// Let new tasks matching `prefix` succeed again.
    pub async fn stop_failing_tasks(&self, prefix: &str) {
        self.state.lock().await.failing_tasks.retain(|p| p != prefix);
    }

    /// Tasks whose name starts with `prefix` stay in progress until released.
    pub async fn hold_tasks(&self, prefix: &str) {
        self.state.lock().await.held_tasks.push(prefix.to_string());
    }

    /// Let held tasks matching `prefix` succeed, and stop holding new ones.
    pub async fn release_tasks(&self, prefix: &str) {
        let mut state = self.state.lock().await;
        state.held_tasks.retain(|p| p != prefix);
        for ((_, task), t) in state.tasks.iter_mut() {
            if task.starts_with(prefix) && t.status == TaskStatus::InProgress {
                t.status = TaskStatus::Succeeded;
            }
        }
    }

    /// Stdout of successful tasks whose name starts with `prefix`.
    pub async fn set_task_output(&self, prefix: &str, stdout: &str) {
        self.state
            .lock()
            .await
            .task_outputs
            .push((prefix.to_string(), stdout.to_string()));
    }

    /// Store a JSON object in a bucket.
    pub async fn put_blob(&self, bucket: &str, key: &str, updated_at: DateTime<Utc>, value: Value) {
        self.state
            .lock()
            .await
            .blobs
            .insert((bucket.to_string(), key.to_string()), (updated_at, value));
    }

    /// Make the notifier reject calls.
    pub async fn set_notifier_down(&self, down: bool) {
        self.state.lock().await.notifier_down = down;
    }

    // -- inspection --

    pub async fn vm(&self, name: &str) -> Option<VmInfo> {
        self.state.lock().await.vms.get(name).cloned()
    }

    pub async fn vm_count(&self) -> usize {
        self.state.lock().await.vms.len()
    }

    pub async fn address(&self, name: &str) -> Option<AddressInfo> {
        self.state.lock().await.addresses.get(name).cloned()
    }

    /// IP a domain points at.
    pub async fn dns_ip(&self, domain: &str) -> Option<String> {
        self.state.lock().await.dns.get(domain).cloned()
    }

    pub async fn task_runs(&self) -> Vec<TaskRun> {
        self.state.lock().await.task_runs.clone()
    }

    pub async fn executed_queries(&self) -> Vec<ExecutedQuery> {
        self.state.lock().await.queries.clone()
    }

    /// `(host, command)` pairs run through `exec`.
    pub async fn exec_log(&self) -> Vec<(String, String)> {
        self.state.lock().await.exec_log.clone()
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.state.lock().await.notifications.clone()
    }

    /// `(bucket, prefix)` grants of an identity, `None` if it does not exist.
    pub async fn identity_grants(&self, email: &str) -> Option<Vec<(String, String)>> {
        self.state.lock().await.identities.get(email).cloned()
    }
}

#[async_trait]
impl RemoteAgent for InMemoryCloud {
    async fn run(
        &self,
        host: &str,
        task: &str,
        command: &str,
        stdin: Option<&str>,
    ) -> CollabResult<()> {
        let mut state = self.state.lock().await;
        state.reachable(host)?;

        let key = (host.to_string(), task.to_string());
        if state.tasks.contains_key(&key) {
            return Ok(());
        }

        state.task_runs.push(TaskRun {
            host: host.to_string(),
            task: task.to_string(),
            command: command.to_string(),
            stdin: stdin.map(str::to_string),
        });

        let task_state = if state.failing_tasks.iter().any(|p| task.starts_with(p.as_str())) {
            MemTask {
                status: TaskStatus::Failed,
                logs: TaskLogs {
                    stdout: String::new(),
                    stderr: format!("{task} failed"),
                },
            }
        } else {
            let stdout = state
                .task_outputs
                .iter()
                .rev()
                .find(|(p, _)| task.starts_with(p.as_str()))
                .map(|(_, out)| out.clone())
                .unwrap_or_default();
            let held = state.held_tasks.iter().any(|p| task.starts_with(p.as_str()));
            MemTask {
                status: if held {
                    TaskStatus::InProgress
                } else {
                    TaskStatus::Succeeded
                },
                logs: TaskLogs {
                    stdout,
                    stderr: String::new(),
                },
            }
        };
        state.tasks.insert(key, task_state);
        Ok(())
    }

    async fn check(&self, host: &str, task: &str) -> CollabResult<TaskStatus> {
        let state = self.state.lock().await;
        state.reachable(host)?;
        Ok(state
            .tasks
            .get(&(host.to_string(), task.to_string()))
            .map(|t| t.status)
            .unwrap_or(TaskStatus::NotStarted))
    }

    async fn logs(&self, host: &str, task: &str) -> CollabResult<TaskLogs> {
        let state = self.state.lock().await;
        state.reachable(host)?;
        state
            .tasks
            .get(&(host.to_string(), task.to_string()))
            .map(|t| t.logs.clone())
            .ok_or_else(|| CollabError::NotFound(format!("task {task} on {host}")))
    }

    async fn clean(&self, host: &str, task: &str) -> CollabResult<()> {
        let mut state = self.state.lock().await;
        state.reachable(host)?;
        state.tasks.remove(&(host.to_string(), task.to_string()));
        Ok(())
    }

    async fn exec(&self, host: &str, command: &str, _stdin: Option<&str>) -> CollabResult<String> {
        let mut state = self.state.lock().await;
        state.reachable(host)?;
        state.exec_log.push((host.to_string(), command.to_string()));
        Ok(state
            .exec_rules
            .iter()
            .rev()
            .find(|(p, _)| command.contains(p.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_else(|| default_exec_response(command).to_string()))
    }
}

#[async_trait]
impl DatabaseClient for InMemoryCloud {
    async fn run_query(
        &self,
        host: &str,
        db: &str,
        _user: &str,
        sql: &str,
    ) -> CollabResult<String> {
        let mut state = self.state.lock().await;
        state.reachable(host)?;
        if state.db_down.contains(host) {
            return Err(CollabError::Unreachable {
                target: host.to_string(),
                reason: "the database system is starting up".to_string(),
            });
        }
        state.queries.push(ExecutedQuery {
            host: host.to_string(),
            db: db.to_string(),
            sql: sql.to_string(),
        });

        let scripted = state.query_rules.iter().rev().find(|rule| {
            rule.host.as_deref().is_none_or(|h| h == host) && sql.contains(rule.pattern.as_str())
        });
        Ok(match scripted {
            Some(rule) => rule.response.clone(),
            None => default_query_response(sql).to_string(),
        })
    }
}

#[async_trait]
impl CloudCompute for InMemoryCloud {
    async fn create_vm(&self, spec: &VmSpec) -> CollabResult<()> {
        let mut state = self.state.lock().await;
        state.vms.entry(spec.name.clone()).or_insert_with(|| VmInfo {
            name: spec.name.clone(),
            status: VmStatus::Provisioning,
            machine_type: spec.machine_type.clone(),
            storage_gib: spec.storage_gib,
        });
        Ok(())
    }

    async fn get_vm(&self, name: &str) -> CollabResult<Option<VmInfo>> {
        let mut state = self.state.lock().await;
        let Some(vm) = state.vms.get_mut(name) else {
            return Ok(None);
        };
        let observed = vm.clone();
        // Provisioning finishes once somebody has looked.
        if vm.status == VmStatus::Provisioning {
            vm.status = VmStatus::Running;
        }
        Ok(Some(observed))
    }

    async fn start_vm(&self, name: &str) -> CollabResult<()> {
        let mut state = self.state.lock().await;
        let vm = state
            .vms
            .get_mut(name)
            .ok_or_else(|| CollabError::NotFound(format!("vm {name}")))?;
        vm.status = VmStatus::Running;
        Ok(())
    }

    async fn stop_vm(&self, name: &str) -> CollabResult<()> {
        let mut state = self.state.lock().await;
        let vm = state
            .vms
            .get_mut(name)
            .ok_or_else(|| CollabError::NotFound(format!("vm {name}")))?;
        vm.status = VmStatus::Stopped;
        Ok(())
    }

    async fn delete_vm(&self, name: &str) -> CollabResult<()> {
        let mut state = self.state.lock().await;
        if state.vms.remove(name).is_none() {
            return Err(CollabError::NotFound(format!("vm {name}")));
        }
        for address in state.addresses.values_mut() {
            if address.attached_to.as_deref() == Some(name) {
                address.attached_to = None;
            }
        }
        Ok(())
    }

    async fn create_address(&self, name: &str, _location: &str) -> CollabResult<AddressInfo> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.addresses.get(name) {
            return Ok(existing.clone());
        }
        state.next_ip += 1;
        let n = state.next_ip;
        let address = AddressInfo {
            name: name.to_string(),
            ip: format!("10.0.{}.{}", n / 250, n % 250 + 2),
            attached_to: None,
        };
        state.addresses.insert(name.to_string(), address.clone());
        Ok(address)
    }

    async fn get_address(&self, name: &str) -> CollabResult<Option<AddressInfo>> {
        Ok(self.state.lock().await.addresses.get(name).cloned())
    }

    async fn release_address(&self, name: &str) -> CollabResult<()> {
        match self.state.lock().await.addresses.remove(name) {
            Some(_) => Ok(()),
            None => Err(CollabError::NotFound(format!("address {name}"))),
        }
    }

    async fn attach_address(&self, vm: &str, address: &str) -> CollabResult<()> {
        let mut state = self.state.lock().await;
        if !state.vms.contains_key(vm) {
            return Err(CollabError::NotFound(format!("vm {vm}")));
        }
        if let Some(other) = state
            .addresses
            .values()
            .find(|a| a.name != address && a.attached_to.as_deref() == Some(vm))
        {
            return Err(CollabError::Conflict(format!(
                "vm {vm} already has address {}",
                other.name
            )));
        }
        let entry = state
            .addresses
            .get_mut(address)
            .ok_or_else(|| CollabError::NotFound(format!("address {address}")))?;
        match entry.attached_to.as_deref() {
            Some(current) if current != vm => Err(CollabError::Conflict(format!(
                "address {address} is attached to {current}"
            ))),
            _ => {
                entry.attached_to = Some(vm.to_string());
                Ok(())
            }
        }
    }

    async fn detach_address(&self, vm: &str, address: &str) -> CollabResult<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .addresses
            .get_mut(address)
            .ok_or_else(|| CollabError::NotFound(format!("address {address}")))?;
        if entry.attached_to.as_deref() == Some(vm) {
            entry.attached_to = None;
        }
        Ok(())
    }

    async fn resize_disk(&self, vm: &str, storage_gib: i64) -> CollabResult<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .vms
            .get_mut(vm)
            .ok_or_else(|| CollabError::NotFound(format!("vm {vm}")))?;
        if storage_gib < entry.storage_gib {
            return Err(CollabError::Conflict(format!(
                "disk of {vm} cannot shrink from {} to {storage_gib} GiB",
                entry.storage_gib
            )));
        }
        entry.storage_gib = storage_gib;
        Ok(())
    }

    async fn set_machine_type(&self, vm: &str, machine_type: &str) -> CollabResult<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .vms
            .get_mut(vm)
            .ok_or_else(|| CollabError::NotFound(format!("vm {vm}")))?;
        if entry.status != VmStatus::Stopped {
            return Err(CollabError::Conflict(format!("vm {vm} is not stopped")));
        }
        entry.machine_type = machine_type.to_string();
        Ok(())
    }
}

#[async_trait]
impl IdentityClient for InMemoryCloud {
    async fn create_identity(&self, name: &str) -> CollabResult<String> {
        let email = format!("{name}@drydock.iam");
        self.state
            .lock()
            .await
            .identities
            .entry(email.clone())
            .or_default();
        Ok(email)
    }

    async fn create_key(&self, email: &str) -> CollabResult<String> {
        if !self.state.lock().await.identities.contains_key(email) {
            return Err(CollabError::NotFound(format!("identity {email}")));
        }
        let key = json!({
            "client_email": email,
            "private_key_id": uuid::Uuid::new_v4().to_string(),
        });
        Ok(BASE64.encode(key.to_string()))
    }

    async fn grant_bucket_access(
        &self,
        email: &str,
        bucket: &str,
        prefix: &str,
    ) -> CollabResult<()> {
        let mut state = self.state.lock().await;
        let grants = state
            .identities
            .get_mut(email)
            .ok_or_else(|| CollabError::NotFound(format!("identity {email}")))?;
        let grant = (bucket.to_string(), prefix.to_string());
        if !grants.contains(&grant) {
            grants.push(grant);
        }
        Ok(())
    }

    async fn delete_identity(&self, email: &str) -> CollabResult<()> {
        match self.state.lock().await.identities.remove(email) {
            Some(_) => Ok(()),
            None => Err(CollabError::NotFound(format!("identity {email}"))),
        }
    }
}

#[async_trait]
impl DnsClient for InMemoryCloud {
    async fn get_record(&self, domain: &str) -> CollabResult<Option<DnsRecord>> {
        Ok(self.state.lock().await.dns.get(domain).map(|ip| DnsRecord {
            domain: domain.to_string(),
            ip: ip.clone(),
        }))
    }

    async fn insert_record(&self, domain: &str, ip: &str) -> CollabResult<()> {
        let mut state = self.state.lock().await;
        if state.dns.contains_key(domain) {
            return Err(CollabError::Conflict(format!("record {domain} exists")));
        }
        state.dns.insert(domain.to_string(), ip.to_string());
        Ok(())
    }

    async fn update_record(&self, domain: &str, ip: &str) -> CollabResult<()> {
        let mut state = self.state.lock().await;
        match state.dns.get_mut(domain) {
            Some(current) => {
                *current = ip.to_string();
                Ok(())
            }
            None => Err(CollabError::NotFound(format!("record {domain}"))),
        }
    }

    async fn delete_record(&self, domain: &str) -> CollabResult<()> {
        match self.state.lock().await.dns.remove(domain) {
            Some(_) => Ok(()),
            None => Err(CollabError::NotFound(format!("record {domain}"))),
        }
    }
}

#[async_trait]
impl BlobStorage for InMemoryCloud {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        glob: &str,
    ) -> CollabResult<Vec<BlobObject>> {
        let state = self.state.lock().await;
        Ok(state
            .blobs
            .iter()
            .filter(|((b, key), _)| {
                b == bucket
                    && key
                        .strip_prefix(prefix)
                        .is_some_and(|rest| glob_matches(glob, rest))
            })
            .map(|((_, key), (updated_at, _))| BlobObject {
                key: key.clone(),
                updated_at: *updated_at,
            })
            .collect())
    }

    async fn get_json(&self, bucket: &str, key: &str) -> CollabResult<Value> {
        self.state
            .lock()
            .await
            .blobs
            .get(&(bucket.to_string(), key.to_string()))
            .map(|(_, value)| value.clone())
            .ok_or_else(|| CollabError::NotFound(format!("{bucket}/{key}")))
    }
}

#[async_trait]
impl IncidentNotifier for InMemoryCloud {
    async fn trigger(
        &self,
        tag: &str,
        summary: &str,
        severity: &str,
        _details: &Value,
    ) -> CollabResult<()> {
        let mut state = self.state.lock().await;
        if state.notifier_down {
            return Err(CollabError::Unreachable {
                target: "notifier".to_string(),
                reason: "service unavailable".to_string(),
            });
        }
        state.notifications.push(Notification::Triggered {
            tag: tag.to_string(),
            summary: summary.to_string(),
            severity: severity.to_string(),
        });
        Ok(())
    }

    async fn resolve(&self, tag: &str) -> CollabResult<()> {
        let mut state = self.state.lock().await;
        if state.notifier_down {
            return Err(CollabError::Unreachable {
                target: "notifier".to_string(),
                reason: "service unavailable".to_string(),
            });
        }
        state.notifications.push(Notification::Resolved {
            tag: tag.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tasks_follow_scripted_outcomes() {
        let cloud = InMemoryCloud::new();
        cloud.fail_tasks("update_").await;
        cloud.set_task_output("doctor_query_", "[]").await;

        cloud.run("h1", "configure_db", "configure", None).await.unwrap();
        cloud.run("h1", "update_agent", "update", None).await.unwrap();
        cloud.run("h1", "doctor_query_1", "query", Some("{}")).await.unwrap();

        assert_eq!(cloud.check("h1", "configure_db").await.unwrap(), TaskStatus::Succeeded);
        assert_eq!(cloud.check("h1", "update_agent").await.unwrap(), TaskStatus::Failed);
        assert_eq!(cloud.logs("h1", "doctor_query_1").await.unwrap().stdout, "[]");

        cloud.clean("h1", "configure_db").await.unwrap();
        assert_eq!(cloud.check("h1", "configure_db").await.unwrap(), TaskStatus::NotStarted);

        cloud.stop_failing_tasks("update_").await;
        cloud.clean("h1", "update_agent").await.unwrap();
        cloud.run("h1", "update_agent", "update", None).await.unwrap();
        assert_eq!(cloud.check("h1", "update_agent").await.unwrap(), TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_held_tasks_until_released() {
        let cloud = InMemoryCloud::new();
        cloud.hold_tasks("take_backup").await;
        cloud.run("h1", "take_backup", "backup", None).await.unwrap();
        assert_eq!(cloud.check("h1", "take_backup").await.unwrap(), TaskStatus::InProgress);

        cloud.release_tasks("take_backup").await;
        assert_eq!(cloud.check("h1", "take_backup").await.unwrap(), TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        let cloud = InMemoryCloud::new();
        cloud.set_unreachable("h1", true).await;

        let err = cloud.run_query("h1", "postgres", "postgres", "SELECT 1").await.unwrap_err();
        assert!(err.is_unreachable());
        assert_eq!(cloud.run_query("h2", "postgres", "postgres", "SELECT 1").await.unwrap(), "1");
    }

    #[tokio::test]
    async fn test_db_down_keeps_agent_reachable() {
        let cloud = InMemoryCloud::new();
        cloud.set_db_down("h1", true).await;

        let err = cloud.run_query("h1", "postgres", "postgres", "SELECT 1").await.unwrap_err();
        assert!(err.is_unreachable());
        assert_eq!(cloud.exec("h1", "df -h", None).await.unwrap(), "42%");

        cloud.set_db_down("h1", false).await;
        assert_eq!(cloud.run_query("h1", "postgres", "postgres", "SELECT 1").await.unwrap(), "1");
    }

    #[tokio::test]
    async fn test_query_rules_prefer_latest() {
        let cloud = InMemoryCloud::new();
        cloud.respond_to_query(None, "pg_is_in_recovery", "t").await;
        cloud.respond_to_query(Some("h2"), "pg_is_in_recovery", "f").await;

        let sql = "SELECT pg_is_in_recovery()";
        assert_eq!(cloud.run_query("h1", "postgres", "postgres", sql).await.unwrap(), "t");
        assert_eq!(cloud.run_query("h2", "postgres", "postgres", sql).await.unwrap(), "f");
    }

    #[tokio::test]
    async fn test_address_attach_conflicts() {
        let cloud = InMemoryCloud::new();
        for name in ["vm-a", "vm-b"] {
            cloud
                .create_vm(&VmSpec {
                    name: name.to_string(),
                    location: "us-central1".to_string(),
                    machine_type: "n1-standard-2".to_string(),
                    storage_gib: 64,
                    image: "drydock-1".to_string(),
                })
                .await
                .unwrap();
        }
        cloud.create_address("ip-a", "us-central1").await.unwrap();
        cloud.attach_address("vm-a", "ip-a").await.unwrap();

        let err = cloud.attach_address("vm-b", "ip-a").await.unwrap_err();
        assert!(matches!(err, CollabError::Conflict(_)));

        cloud.detach_address("vm-a", "ip-a").await.unwrap();
        cloud.attach_address("vm-b", "ip-a").await.unwrap();
        assert_eq!(cloud.address("ip-a").await.unwrap().attached_to.as_deref(), Some("vm-b"));
    }

    #[tokio::test]
    async fn test_blob_listing_with_glob() {
        let cloud = InMemoryCloud::new();
        let at = Utc::now();
        for key in [
            "tl/basebackups_005/base_1_backup_stop_sentinel.json",
            "tl/basebackups_005/base_1/tar_partitions/part_1.tar",
            "other/basebackups_005/base_2_backup_stop_sentinel.json",
        ] {
            cloud.put_blob("b", key, at, json!({})).await;
        }

        let objects = cloud
            .list_objects("b", "tl/basebackups_005/", "*_backup_stop_sentinel.json")
            .await
            .unwrap();
        assert_eq!(objects.len(), 1);
        assert!(objects[0].key.ends_with("base_1_backup_stop_sentinel.json"));
    }

    #[tokio::test]
    async fn test_dns_upsert() {
        let cloud = InMemoryCloud::new();
        cloud.upsert_record("db.example.com", "10.0.0.2").await.unwrap();
        cloud.upsert_record("db.example.com", "10.0.0.3").await.unwrap();
        assert_eq!(cloud.dns_ip("db.example.com").await.as_deref(), Some("10.0.0.3"));
    }
}
