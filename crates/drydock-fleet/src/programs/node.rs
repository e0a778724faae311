// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node lifecycle machine.
//!
//! One process per database server. Provisioning runs straight through from
//! `start` to `wait`; afterwards the node parks in `wait` and reacts to signal
//! flags raised by the cluster, the doctor or management operations.
//!
//! ```text
//! start ─call vm─▶ bootstrap_agent ─▶ wait_bootstrap_agent ─▶ configure_stack
//!   ─▶ wait_db_available ─┬─▶ init_sql ───────────────────────────┐
//!                         ├─▶ wait_catch_up ─▶ wait_synchronization┤
//!                         └─▶ wait_recovery_completion ────────────┤
//!                                                                  ▼
//!                                        wait_timeline_available ─▶ wait
//! ```
//!
//! Maintenance steps run one remote task, decrement their flag once it has
//! succeeded and return to `wait`.

use std::sync::Arc;

use anyhow::{Context, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use drydock_core::process::Deadline;
use drydock_core::{Program, StepContext, Transition, frame_of};
use serde_json::{Map, Value, json};
use strum::{AsRefStr, EnumString};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    AGENT_BOOTSTRAP, AUTO_RESTART, NODE, READ_ONLY_OFF, READ_ONLY_ON, VM, WAIT, ignore_missing,
    parse_step, signals, timeline,
};
use crate::agent::{TaskPoll, TaskSpec, poll_task};
use crate::assembly;
use crate::collab::{TaskLogs, VmStatus};
use crate::fleet::Fleet;
use crate::incidents::{self, NewIncident};
use crate::model::{
    DisplayState, NodeRecord, ResourceRecord, Severity, SyncStatus, TimelineAccess,
};
use crate::policy::{self, CatchUp};
use crate::store;

/// Extension that carries the engine version.
pub const ENGINE_EXTENSION: &str = "lantern";
/// Extension that carries the extras version.
pub const EXTRAS_EXTENSION: &str = "lantern_extras";

pub const CONFIGURE_DB_TASK: &str = "configure_db";
const CONFIGURE_DB_COMMAND: &str = "sudo drydock/bin/configure";
const CRASH_RECOVERY_LOG: &str = "sudo tail -n 5 /var/log/postgresql/postgresql.log";
const CRASH_RECOVERY_MARKER: &str = "redo in progress";
const RESTART_COMMAND: &str = "sudo systemctl restart postgresql";
const RESIZE_FS_COMMAND: &str = "sudo resize2fs /dev/sdb";

const PROVISION_DEADLINE_SECS: u64 = 30 * 60;
const MAINTENANCE_DEADLINE_SECS: u64 = 60 * 60;
const UNAVAILABLE_CHECKS_BEFORE_PAGE: u64 = 3;
const MAX_AUTO_RESTARTS: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum NodeStep {
    Start,
    BootstrapAgent,
    WaitBootstrapAgent,
    ConfigureStack,
    WaitDbAvailable,
    InitSql,
    WaitCatchUp,
    WaitSynchronization,
    WaitRecoveryCompletion,
    WaitTimelineAvailable,
    Wait,
    TakeOver,
    WaitSwapIp,
    Promote,
    Unavailable,
    UpdateAgent,
    UpdateEngineExtension,
    UpdateExtrasExtension,
    UpdateImage,
    AddDomain,
    SetupTls,
    RotatePassword,
    ResizeStorage,
    ResizeVm,
    WaitVmStopped,
    WaitServerStarted,
    Restart,
    Stop,
    StartServer,
    Destroy,
}

/// Flags handled from `wait` after `take_over`, `checkup` and `reconfigure`,
/// in priority order.
const MAINTENANCE: &[(&str, NodeStep)] = &[
    (signals::UPDATE_AGENT, NodeStep::UpdateAgent),
    (signals::UPDATE_ENGINE_EXTENSION, NodeStep::UpdateEngineExtension),
    (signals::UPDATE_EXTRAS_EXTENSION, NodeStep::UpdateExtrasExtension),
    (signals::UPDATE_IMAGE, NodeStep::UpdateImage),
    (signals::ADD_DOMAIN, NodeStep::AddDomain),
    (signals::SETUP_TLS, NodeStep::SetupTls),
    (signals::ROTATE_PASSWORD, NodeStep::RotatePassword),
    (signals::RESIZE_STORAGE, NodeStep::ResizeStorage),
    (signals::RESIZE_VM, NodeStep::ResizeVm),
    (signals::RESTART, NodeStep::Restart),
    (signals::STOP, NodeStep::Stop),
    (signals::START, NodeStep::StartServer),
];

pub fn unavailable_tag(node_id: &str) -> String {
    incidents::tag(&["node-unavailable", node_id])
}

pub fn deadline_tag(node_id: &str) -> String {
    incidents::tag(&["deadline", node_id])
}

fn task_failed_tag(node_id: &str, flag: &str) -> String {
    incidents::tag(&["task-failed", node_id, flag])
}

/// `name` as a quoted SQL identifier.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `value` as a quoted SQL string literal.
pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// What a failed remote task does to the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnFailure {
    /// Submit it again later.
    Retry,
    /// Open an incident, mark the node failed and drop the request.
    Page,
}

enum TaskResult {
    Pending,
    Done(TaskLogs),
    /// Retryable failure, try again after a pause.
    Retry,
    /// Terminal failure, already handled.
    Abandoned,
}

pub struct NodeProgram {
    fleet: Arc<Fleet>,
}

impl NodeProgram {
    pub fn new(fleet: Arc<Fleet>) -> Self {
        Self { fleet }
    }

    async fn set_display(&self, node_id: &str, state: DisplayState) -> anyhow::Result<()> {
        store::nodes::set_display_state(&self.fleet.pool, node_id, state.as_ref()).await?;
        Ok(())
    }

    async fn query(&self, node: &NodeRecord, sql: &str) -> anyhow::Result<String> {
        Ok(self
            .fleet
            .collab
            .db
            .run_query(node.host(), "postgres", "postgres", sql)
            .await?)
    }

    /// The server answers queries, or is replaying WAL after a crash and will
    /// shortly.
    async fn is_available(&self, node: &NodeRecord) -> bool {
        if self.query(node, "SELECT 1").await.is_ok() {
            return true;
        }
        match self
            .fleet
            .collab
            .agent
            .exec(node.host(), CRASH_RECOVERY_LOG, None)
            .await
        {
            Ok(log) => log.contains(CRASH_RECOVERY_MARKER),
            Err(_) => false,
        }
    }

    /// Restored primary still replaying the parent's lineage.
    fn is_restoring(resource: &ResourceRecord, node: &NodeRecord) -> bool {
        resource.is_fork() && node.is_representative() && node.access() == TimelineAccess::Fetch
    }

    // -- provisioning --

    async fn start(
        &self,
        cx: &mut StepContext<'_>,
        node: &NodeRecord,
    ) -> anyhow::Result<Transition> {
        let address_ip = cx
            .retval()
            .and_then(|v| v.get("address_ip"))
            .and_then(Value::as_str)
            .map(str::to_string);

        if let Some(ip) = address_ip {
            store::nodes::set_address_ip(&self.fleet.pool, &node.id, &ip).await?;
            info!(node_id = %node.id, ip = %ip, "VM ready");
            return Ok(Transition::advance(NodeStep::BootstrapAgent));
        }

        cx.set_deadline(Some(WAIT), PROVISION_DEADLINE_SECS);
        Ok(Transition::call(VM, Map::new()))
    }

    async fn wait_bootstrap_agent(&self, cx: &mut StepContext<'_>) -> anyhow::Result<Transition> {
        let harvested = cx.harvest_children().await?;
        if let Some(child) = harvested.iter().find(|c| c.program == AGENT_BOOTSTRAP) {
            debug!(node_id = %cx.id(), exit = ?child.exit_value, "Agent bootstrap finished");
            return Ok(Transition::advance(NodeStep::ConfigureStack));
        }
        cx.yield_to_children().await?;
        Ok(Transition::sleep(5))
    }

    async fn configure_stack(
        &self,
        cx: &mut StepContext<'_>,
        node: &NodeRecord,
    ) -> anyhow::Result<Transition> {
        let resource = self.fleet.resource(&node.resource_id).await?;
        let timeline = self.fleet.timeline(&node.timeline_id).await?;
        let Some(key) = timeline.service_account_key.clone() else {
            return Ok(Transition::sleep(5));
        };

        let role = if Self::is_restoring(&resource, node) {
            "restore"
        } else if node.is_representative() {
            "primary"
        } else {
            "standby"
        };

        let mut config = json!({
            "role": role,
            "engine_version": node.engine_version,
            "extras_version": node.extras_version,
            "minor_version": node.minor_version,
            "superuser_password": resource.superuser_password,
            "repl_password": resource.repl_password,
            "ha_type": resource.ha_type,
            "application_name": node.application_name(),
            "storage_gib": node.storage_gib,
            "domain": node.domain,
            "timeline": {
                "id": timeline.id,
                "bucket": timeline.bucket,
                "prefix": timeline.prefix(),
                "access": node.timeline_access,
                "service_account_key": key,
            },
        });

        match role {
            "standby" => {
                let Some(primary_ip) = store::nodes::representative(&self.fleet.pool, &resource.id)
                    .await?
                    .and_then(|p| p.address_ip)
                else {
                    return Ok(Transition::sleep(5));
                };
                config["primary_host"] = json!(primary_ip);
            }
            "restore" => {
                let target = resource.restore_target.unwrap_or(cx.now());
                let label = timeline::backup_label_before(&self.fleet, &timeline, target)
                    .await?
                    .with_context(|| {
                        format!("no backup of timeline {} before {target}", timeline.id)
                    })?;
                config["restore"] = json!({
                    "backup_label": label,
                    "target_time": target.to_rfc3339(),
                    "target_lsn": resource.recovery_target_lsn,
                });
            }
            _ => {}
        }

        let stdin = config.to_string();
        let spec = TaskSpec::new(CONFIGURE_DB_TASK, CONFIGURE_DB_COMMAND).with_stdin(&stdin);
        match poll_task(self.fleet.collab.agent.as_ref(), node.host(), spec).await? {
            TaskPoll::Pending => Ok(Transition::sleep(5)),
            TaskPoll::Succeeded(_) => {
                info!(node_id = %node.id, role, "Database configured");
                Ok(Transition::advance(NodeStep::WaitDbAvailable))
            }
            TaskPoll::Failed(logs) => {
                warn!(node_id = %node.id, stderr = %logs.stderr, "configure_db failed, retrying");
                Ok(Transition::sleep(30))
            }
        }
    }

    async fn wait_db_available(&self, node: &NodeRecord) -> anyhow::Result<Transition> {
        if !self.is_available(node).await {
            return Ok(Transition::sleep(5));
        }
        let resource = self.fleet.resource(&node.resource_id).await?;
        if Self::is_restoring(&resource, node) {
            Ok(Transition::advance(NodeStep::WaitRecoveryCompletion))
        } else if node.is_representative() {
            Ok(Transition::advance(NodeStep::InitSql))
        } else {
            Ok(Transition::advance(NodeStep::WaitCatchUp))
        }
    }

    async fn init_sql(&self, node: &NodeRecord) -> anyhow::Result<Transition> {
        let resource = self.fleet.resource(&node.resource_id).await?;

        let role_exists = self
            .query(
                node,
                &format!(
                    "SELECT 1 FROM pg_roles WHERE rolname = {}",
                    quote_literal(&resource.db_user)
                ),
            )
            .await?;
        if role_exists.trim() != "1" {
            self.query(
                node,
                &format!(
                    "CREATE ROLE {} LOGIN PASSWORD {}",
                    quote_ident(&resource.db_user),
                    quote_literal(&resource.db_user_password)
                ),
            )
            .await?;
        }

        if resource.db_name != "postgres" {
            let existing = self
                .query(
                    node,
                    &format!(
                        "SELECT datname FROM pg_database WHERE datname = {}",
                        quote_literal(&resource.db_name)
                    ),
                )
                .await?;
            if existing.trim() != resource.db_name {
                self.query(
                    node,
                    &format!(
                        "CREATE DATABASE {} OWNER {}",
                        quote_ident(&resource.db_name),
                        quote_ident(&resource.db_user)
                    ),
                )
                .await?;
            }
        }

        Ok(Transition::advance(NodeStep::WaitTimelineAvailable))
    }

    async fn wait_catch_up(&self, node: &NodeRecord) -> anyhow::Result<Transition> {
        let resource = self.fleet.resource(&node.resource_id).await?;
        let primary = store::nodes::representative(&self.fleet.pool, &resource.id).await?;
        let Some(primary) = primary else {
            return Ok(Transition::sleep(5));
        };

        let primary_lsn = self.query(&primary, "SELECT pg_current_wal_lsn()").await?;
        let replay_lsn = self.query(node, "SELECT pg_last_wal_replay_lsn()").await?;
        let (Some(primary_lsn), Some(replay_lsn)) =
            (policy::parse_lsn(&primary_lsn), policy::parse_lsn(&replay_lsn))
        else {
            return Ok(Transition::sleep(5));
        };

        let lag = policy::wal_lag(primary_lsn, replay_lsn);
        match policy::catch_up_decision(lag, resource.ha()) {
            CatchUp::Lagging => {
                debug!(node_id = %node.id, lag, "Standby still catching up");
                Ok(Transition::sleep(30))
            }
            CatchUp::Ready => {
                let ready = SyncStatus::Ready.as_ref();
                store::nodes::set_sync_status(&self.fleet.pool, &node.id, ready).await?;
                Ok(Transition::advance(NodeStep::WaitTimelineAvailable))
            }
            CatchUp::AwaitSync => Ok(Transition::advance(NodeStep::WaitSynchronization)),
        }
    }

    async fn wait_synchronization(&self, node: &NodeRecord) -> anyhow::Result<Transition> {
        let Some(primary) = store::nodes::representative(&self.fleet.pool, &node.resource_id).await?
        else {
            return Ok(Transition::sleep(5));
        };
        let state = self
            .query(
                &primary,
                &format!(
                    "SELECT sync_state FROM pg_stat_replication WHERE application_name = {}",
                    quote_literal(&node.application_name())
                ),
            )
            .await?;

        if policy::sync_state_ready(&state) {
            store::nodes::set_sync_status(&self.fleet.pool, &node.id, SyncStatus::Ready.as_ref())
                .await?;
            return Ok(Transition::advance(NodeStep::WaitTimelineAvailable));
        }
        Ok(Transition::sleep(30))
    }

    async fn wait_recovery_completion(
        &self,
        cx: &mut StepContext<'_>,
        node: &NodeRecord,
    ) -> anyhow::Result<Transition> {
        let in_recovery = self.query(node, "SELECT pg_is_in_recovery()").await?;
        if in_recovery.trim() == "t" {
            // Replay pauses at the recovery target.
            let pause = self.query(node, "SELECT pg_get_wal_replay_pause_state()").await?;
            if pause.trim() == "paused" {
                self.query(node, "SELECT pg_wal_replay_resume()").await?;
            }
            return Ok(Transition::sleep(5));
        }

        if node.access() != TimelineAccess::Push {
            let Some(timeline_id) = cx.local::<String>("new_timeline_id") else {
                cx.set_local("new_timeline_id", Uuid::new_v4().to_string())?;
                return Ok(Transition::advance(NodeStep::WaitRecoveryCompletion));
            };
            assembly::create_timeline_with_id(
                cx.engine(),
                &self.fleet,
                &timeline_id,
                Some(&node.timeline_id),
                cx.now(),
            )
            .await?;
            let pool = &self.fleet.pool;
            store::nodes::set_timeline(pool, &node.id, &timeline_id, TimelineAccess::Push).await?;
            info!(
                node_id = %node.id,
                timeline_id = %timeline_id,
                "Recovery finished on a new timeline"
            );
        }
        cx.remove_local("new_timeline_id");

        let resource = self.fleet.resource(&node.resource_id).await?;
        if !resource.version_upgrade {
            self.reconcile_versions(cx, node, &resource).await?;
        }
        Ok(Transition::advance(NodeStep::WaitTimelineAvailable))
    }

    /// Record the extension versions the restored data actually carries and
    /// queue updates where they differ.
    async fn reconcile_versions(
        &self,
        cx: &mut StepContext<'_>,
        node: &NodeRecord,
        resource: &ResourceRecord,
    ) -> anyhow::Result<()> {
        let checks = [
            (ENGINE_EXTENSION, &node.engine_version, signals::UPDATE_ENGINE_EXTENSION),
            (EXTRAS_EXTENSION, &node.extras_version, signals::UPDATE_EXTRAS_EXTENSION),
        ];
        for (extension, current, flag) in checks {
            let installed = self
                .fleet
                .collab
                .db
                .run_query(
                    node.host(),
                    &resource.db_name,
                    "postgres",
                    &format!(
                        "SELECT extversion FROM pg_extension WHERE extname = {}",
                        quote_literal(extension)
                    ),
                )
                .await?;
            let installed = installed.trim();
            if installed.is_empty() || installed == current {
                continue;
            }

            if extension == ENGINE_EXTENSION {
                store::nodes::set_engine_version(&self.fleet.pool, &node.id, installed).await?;
            } else {
                store::nodes::set_extras_version(&self.fleet.pool, &node.id, installed).await?;
            }
            cx.incr_signal(flag).await?;
            info!(
                node_id = %node.id,
                extension,
                installed,
                "Extension version differs after restore"
            );
        }
        Ok(())
    }

    async fn wait_timeline_available(&self, node: &NodeRecord) -> anyhow::Result<Transition> {
        let timeline = self.fleet.timeline(&node.timeline_id).await?;
        if timeline.service_account_key.is_none() {
            return Ok(Transition::sleep(5));
        }
        self.set_display(&node.id, DisplayState::Running).await?;
        info!(node_id = %node.id, "Node is running");
        Ok(Transition::advance(NodeStep::Wait))
    }

    // -- steady state --

    async fn wait(
        &self,
        cx: &mut StepContext<'_>,
        node: &NodeRecord,
    ) -> anyhow::Result<Transition> {
        if cx.is_signaled(signals::TAKE_OVER).await? {
            if node.is_representative() {
                cx.decr_signal(signals::TAKE_OVER).await?;
            } else {
                cx.set_deadline(Some(WAIT), MAINTENANCE_DEADLINE_SECS);
                return Ok(Transition::advance(NodeStep::TakeOver));
            }
        }

        if cx.is_signaled(signals::CHECKUP).await? {
            cx.decr_signal(signals::CHECKUP).await?;
            if node.display() != DisplayState::Stopped && !self.is_available(node).await {
                return Ok(Transition::advance(NodeStep::Unavailable));
            }
        }

        if cx.is_signaled(signals::RECONFIGURE).await? {
            cx.decr_signal(signals::RECONFIGURE).await?;
            return Ok(Transition::advance(NodeStep::ConfigureStack));
        }

        for (flag, step) in MAINTENANCE {
            if cx.is_signaled(flag).await? {
                if *step != NodeStep::StartServer {
                    self.set_display(&node.id, DisplayState::Updating).await?;
                }
                cx.set_deadline(Some(WAIT), MAINTENANCE_DEADLINE_SECS);
                return Ok(Transition::advance(step));
            }
        }

        Ok(Transition::sleep(30))
    }

    async fn unavailable(
        &self,
        cx: &mut StepContext<'_>,
        node: &NodeRecord,
    ) -> anyhow::Result<Transition> {
        for child in cx.harvest_children().await? {
            debug!(
                node_id = %node.id,
                program = %child.program,
                exit = ?child.exit_value,
                "Child finished"
            );
        }

        if self.is_available(node).await {
            incidents::resolve(&self.fleet, &unavailable_tag(&node.id), cx.now()).await?;
            for key in ["unavailable_checks", "unavailable_since", "auto_restarts"] {
                cx.remove_local(key);
            }
            self.set_display(&node.id, DisplayState::Running).await?;
            info!(node_id = %node.id, "Node is available again");
            return Ok(Transition::advance(NodeStep::Wait));
        }

        let checks = cx.local::<u64>("unavailable_checks").unwrap_or(0) + 1;
        let since: DateTime<Utc> = cx.local("unavailable_since").unwrap_or(cx.now());
        cx.set_local("unavailable_checks", checks)?;
        cx.set_local("unavailable_since", since)?;
        self.set_display(&node.id, DisplayState::Unavailable).await?;

        let escalation = chrono::Duration::from_std(self.fleet.config.unavailable_escalation)
            .unwrap_or(chrono::Duration::minutes(5));
        if checks >= UNAVAILABLE_CHECKS_BEFORE_PAGE && cx.now() - since >= escalation {
            let incident = NewIncident::new(
                unavailable_tag(&node.id),
                format!("Node {} is unavailable", node.vm_name),
                Severity::Critical,
            )
            .node(&node.id)
            .details(json!({
                "resource_id": node.resource_id,
                "since": since.to_rfc3339(),
                "checks": checks,
            }));
            incidents::open(&self.fleet, incident, cx.now()).await?;

            let restarts = cx.local::<u64>("auto_restarts").unwrap_or(0);
            if restarts < MAX_AUTO_RESTARTS && cx.is_leaf().await? {
                cx.spawn_child(AUTO_RESTART, frame_of(json!({ "host": node.host() })));
                cx.set_local("auto_restarts", restarts + 1)?;
                warn!(node_id = %node.id, attempt = restarts + 1, "Restarting unavailable node");
            }
        }

        Ok(Transition::sleep(15))
    }

    // -- take over --

    async fn take_over(
        &self,
        cx: &mut StepContext<'_>,
        node: &NodeRecord,
    ) -> anyhow::Result<Transition> {
        let primary = store::nodes::representative(&self.fleet.pool, &node.resource_id).await?;
        let Some(primary) = primary.filter(|p| p.id != node.id) else {
            cx.decr_signal(signals::TAKE_OVER).await?;
            return Ok(Transition::advance(NodeStep::Wait));
        };

        // The old primary may be gone; fencing it is best effort.
        if let Err(e) = self.query(&primary, READ_ONLY_ON).await {
            warn!(
                node_id = %node.id,
                primary = %primary.vm_name,
                error = %e,
                "Could not fence old primary"
            );
        }

        self.set_display(&node.id, DisplayState::Updating).await?;
        cx.set_local("old_primary", &primary.id)?;
        cx.set_local("standby_address", &node.address_name)?;
        cx.set_local("primary_address", &primary.address_name)?;
        info!(node_id = %node.id, old_primary = %primary.id, "Taking over as primary");
        Ok(Transition::advance(NodeStep::WaitSwapIp))
    }

    async fn wait_swap_ip(
        &self,
        cx: &mut StepContext<'_>,
        node: &NodeRecord,
    ) -> anyhow::Result<Transition> {
        let old_id: String = cx.local("old_primary").context("take over without old primary")?;
        let standby_address: String = cx
            .local("standby_address")
            .context("missing standby_address")?;
        let primary_address: String = cx
            .local("primary_address")
            .context("missing primary_address")?;
        let old = self.fleet.node(&old_id).await?;

        super::move_addresses(
            &self.fleet,
            [(node, &primary_address), (&old, &standby_address)],
        )
        .await?;

        let moved = self.fleet.node(&node.id).await?;
        if !self.is_available(&moved).await {
            return Ok(Transition::sleep(5));
        }
        Ok(Transition::advance(NodeStep::Promote))
    }

    async fn promote(
        &self,
        cx: &mut StepContext<'_>,
        node: &NodeRecord,
    ) -> anyhow::Result<Transition> {
        let old_id: String = cx.local("old_primary").context("take over without old primary")?;

        if !node.is_representative() {
            if self.query(node, "SELECT pg_is_in_recovery()").await?.trim() == "t" {
                self.query(node, "SELECT pg_promote()").await?;
            }
            let old = self.fleet.node(&old_id).await?;
            store::nodes::promote(&self.fleet.pool, node, &old, cx.now()).await?;
        }

        let promoted = self.fleet.node(&node.id).await?;
        if let (Some(domain), Some(ip)) = (&promoted.domain, &promoted.address_ip) {
            self.fleet.collab.dns.upsert_record(domain, ip).await?;
        }
        let demoted = self.fleet.node(&old_id).await?;
        if let Err(e) = self.query(&demoted, READ_ONLY_OFF).await {
            warn!(node_id = %demoted.id, error = %e, "Could not lift read-only mode");
        }

        for other in store::nodes::list_for_resource(&self.fleet.pool, &node.resource_id).await? {
            if other.id != node.id {
                cx.signal(&other.id, signals::RECONFIGURE).await?;
            }
        }

        for key in ["old_primary", "standby_address", "primary_address"] {
            cx.remove_local(key);
        }
        cx.decr_signal(signals::TAKE_OVER).await?;
        self.set_display(&node.id, DisplayState::Running).await?;
        info!(node_id = %node.id, "Promoted to primary");
        Ok(Transition::advance(NodeStep::Wait))
    }

    // -- maintenance --

    async fn remote_task(
        &self,
        cx: &mut StepContext<'_>,
        node: &NodeRecord,
        flag: &str,
        spec: TaskSpec<'_>,
        on_failure: OnFailure,
    ) -> anyhow::Result<TaskResult> {
        match poll_task(self.fleet.collab.agent.as_ref(), node.host(), spec).await? {
            TaskPoll::Pending => Ok(TaskResult::Pending),
            TaskPoll::Succeeded(logs) => Ok(TaskResult::Done(logs)),
            TaskPoll::Failed(logs) if on_failure == OnFailure::Retry => {
                warn!(
                    node_id = %node.id,
                    task = spec.name,
                    stderr = %logs.stderr,
                    "Task failed, retrying"
                );
                Ok(TaskResult::Retry)
            }
            TaskPoll::Failed(logs) => {
                let incident = NewIncident::new(
                    task_failed_tag(&node.id, flag),
                    format!("{} failed on {}", spec.name, node.vm_name),
                    Severity::Error,
                )
                .node(&node.id)
                .details(json!({ "stdout": logs.stdout, "stderr": logs.stderr }));
                incidents::open(&self.fleet, incident, cx.now()).await?;
                self.set_display(&node.id, DisplayState::Failed).await?;
                cx.decr_signal(flag).await?;
                Ok(TaskResult::Abandoned)
            }
        }
    }

    async fn finish_maintenance(
        &self,
        cx: &mut StepContext<'_>,
        node: &NodeRecord,
        flag: &str,
    ) -> anyhow::Result<Transition> {
        cx.decr_signal(flag).await?;
        incidents::resolve(&self.fleet, &task_failed_tag(&node.id, flag), cx.now()).await?;
        self.set_display(&node.id, DisplayState::Running).await?;
        Ok(Transition::advance(NodeStep::Wait))
    }

    /// Run the task for `flag`; on success apply `done` and finish.
    async fn maintenance_task(
        &self,
        cx: &mut StepContext<'_>,
        node: &NodeRecord,
        flag: &str,
        spec: TaskSpec<'_>,
        on_failure: OnFailure,
    ) -> anyhow::Result<Option<Transition>> {
        match self.remote_task(cx, node, flag, spec, on_failure).await? {
            TaskResult::Pending => Ok(Some(Transition::sleep(5))),
            TaskResult::Retry => Ok(Some(Transition::sleep(30))),
            TaskResult::Abandoned => Ok(Some(Transition::advance(NodeStep::Wait))),
            TaskResult::Done(logs) => {
                debug!(
                    node_id = %node.id,
                    task = spec.name,
                    stdout = %logs.stdout,
                    "Task finished"
                );
                Ok(None)
            }
        }
    }

    async fn update_extension(
        &self,
        cx: &mut StepContext<'_>,
        node: &NodeRecord,
        extension: &str,
        flag: &str,
    ) -> anyhow::Result<Transition> {
        let resource = self.fleet.resource(&node.resource_id).await?;
        let version = if extension == ENGINE_EXTENSION {
            &resource.engine_version
        } else {
            &resource.extras_version
        };
        let stdin = json!({
            "extension": extension,
            "version": version,
            "db_name": resource.db_name,
        })
        .to_string();
        let task = format!("update_{extension}");
        let spec = TaskSpec::new(&task, "sudo drydock/bin/update-extension").with_stdin(&stdin);

        if let Some(t) = self.maintenance_task(cx, node, flag, spec, OnFailure::Page).await? {
            return Ok(t);
        }
        if extension == ENGINE_EXTENSION {
            store::nodes::set_engine_version(&self.fleet.pool, &node.id, version).await?;
        } else {
            store::nodes::set_extras_version(&self.fleet.pool, &node.id, version).await?;
        }
        info!(node_id = %node.id, extension, version = %version, "Extension updated");
        self.finish_maintenance(cx, node, flag).await
    }

    async fn update_image(
        &self,
        cx: &mut StepContext<'_>,
        node: &NodeRecord,
    ) -> anyhow::Result<Transition> {
        let resource = self.fleet.resource(&node.resource_id).await?;
        let stdin = json!({ "minor_version": resource.minor_version }).to_string();
        let spec =
            TaskSpec::new("update_image", "sudo drydock/bin/update-image").with_stdin(&stdin);
        if let Some(t) = self
            .maintenance_task(cx, node, signals::UPDATE_IMAGE, spec, OnFailure::Page)
            .await?
        {
            return Ok(t);
        }
        store::nodes::set_minor_version(&self.fleet.pool, &node.id, &resource.minor_version).await?;
        self.finish_maintenance(cx, node, signals::UPDATE_IMAGE).await
    }

    async fn add_domain(
        &self,
        cx: &mut StepContext<'_>,
        node: &NodeRecord,
    ) -> anyhow::Result<Transition> {
        if let (Some(domain), Some(ip)) = (&node.domain, &node.address_ip) {
            self.fleet.collab.dns.upsert_record(domain, ip).await?;
            info!(node_id = %node.id, domain = %domain, "Domain record set");
        }
        cx.decr_signal(signals::ADD_DOMAIN).await?;
        Ok(Transition::advance(NodeStep::SetupTls))
    }

    async fn setup_tls(
        &self,
        cx: &mut StepContext<'_>,
        node: &NodeRecord,
    ) -> anyhow::Result<Transition> {
        let Some(domain) = &node.domain else {
            return self.finish_maintenance(cx, node, signals::SETUP_TLS).await;
        };
        let stdin = json!({ "domain": domain }).to_string();
        let spec = TaskSpec::new("setup_tls", "sudo drydock/bin/setup-tls").with_stdin(&stdin);
        if let Some(t) = self
            .maintenance_task(cx, node, signals::SETUP_TLS, spec, OnFailure::Retry)
            .await?
        {
            return Ok(t);
        }
        self.finish_maintenance(cx, node, signals::SETUP_TLS).await
    }

    async fn rotate_password(
        &self,
        cx: &mut StepContext<'_>,
        node: &NodeRecord,
    ) -> anyhow::Result<Transition> {
        // Standbys receive the new password through replication.
        if node.is_representative() {
            let resource = self.fleet.resource(&node.resource_id).await?;
            self.query(
                node,
                &format!(
                    "ALTER USER postgres WITH PASSWORD {}",
                    quote_literal(&resource.superuser_password)
                ),
            )
            .await?;
            info!(node_id = %node.id, "Superuser password rotated");
        }
        self.finish_maintenance(cx, node, signals::ROTATE_PASSWORD).await
    }

    async fn resize_storage(
        &self,
        cx: &mut StepContext<'_>,
        node: &NodeRecord,
    ) -> anyhow::Result<Transition> {
        self.fleet
            .collab
            .cloud
            .resize_disk(&node.vm_name, node.storage_gib)
            .await?;
        self.fleet
            .collab
            .agent
            .exec(node.host(), RESIZE_FS_COMMAND, None)
            .await?;
        info!(node_id = %node.id, storage_gib = node.storage_gib, "Storage resized");
        self.finish_maintenance(cx, node, signals::RESIZE_STORAGE).await
    }

    async fn wait_vm_stopped(
        &self,
        cx: &mut StepContext<'_>,
        node: &NodeRecord,
    ) -> anyhow::Result<Transition> {
        let cloud = &self.fleet.collab.cloud;
        let vm = cloud
            .get_vm(&node.vm_name)
            .await?
            .with_context(|| format!("VM {} not found", node.vm_name))?;
        if vm.status != VmStatus::Stopped {
            return Ok(Transition::sleep(5));
        }
        if vm.machine_type != node.machine_type {
            cloud.set_machine_type(&node.vm_name, &node.machine_type).await?;
        }
        cloud.start_vm(&node.vm_name).await?;
        cx.decr_signal(signals::RESIZE_VM).await?;
        Ok(Transition::advance(NodeStep::WaitServerStarted))
    }

    async fn wait_server_started(&self, node: &NodeRecord) -> anyhow::Result<Transition> {
        if !self.is_available(node).await {
            return Ok(Transition::sleep(5));
        }
        self.set_display(&node.id, DisplayState::Running).await?;
        Ok(Transition::advance(NodeStep::Wait))
    }

    async fn destroy(
        &self,
        cx: &mut StepContext<'_>,
        node: &NodeRecord,
    ) -> anyhow::Result<Transition> {
        self.set_display(&node.id, DisplayState::Deleting).await?;
        let collab = &self.fleet.collab;

        if let Some(domain) = &node.domain {
            let current = collab.dns.get_record(domain).await?;
            // After a leader swap the record may point at another node.
            if current.is_some_and(|r| Some(&r.ip) == node.address_ip.as_ref()) {
                ignore_missing(collab.dns.delete_record(domain).await)?;
            }
        }
        ignore_missing(collab.cloud.delete_vm(&node.vm_name).await)?;
        ignore_missing(collab.cloud.release_address(&node.address_name).await)?;

        for tag in [unavailable_tag(&node.id), deadline_tag(&node.id)] {
            incidents::resolve(&self.fleet, &tag, cx.now()).await?;
        }
        store::nodes::delete(&self.fleet.pool, &node.id).await?;
        info!(node_id = %node.id, vm = %node.vm_name, "Node deleted");
        Ok(Transition::finish_with_msg("node deleted"))
    }
}

#[async_trait]
impl Program for NodeProgram {
    fn name(&self) -> &'static str {
        NODE
    }

    async fn run_step(&self, step: &str, cx: &mut StepContext<'_>) -> anyhow::Result<Transition> {
        let step = parse_step::<NodeStep>(NODE, step)?;

        let Some(node) = store::nodes::get(&self.fleet.pool, cx.id()).await? else {
            if step == NodeStep::Destroy {
                return Ok(Transition::finish_with_msg("node already deleted"));
            }
            bail!("node {} not found", cx.id());
        };

        match step {
            NodeStep::Start => self.start(cx, &node).await,
            NodeStep::BootstrapAgent => {
                cx.spawn_child(AGENT_BOOTSTRAP, frame_of(json!({ "host": node.host() })));
                Ok(Transition::advance(NodeStep::WaitBootstrapAgent))
            }
            NodeStep::WaitBootstrapAgent => self.wait_bootstrap_agent(cx).await,
            NodeStep::ConfigureStack => self.configure_stack(cx, &node).await,
            NodeStep::WaitDbAvailable => self.wait_db_available(&node).await,
            NodeStep::InitSql => self.init_sql(&node).await,
            NodeStep::WaitCatchUp => self.wait_catch_up(&node).await,
            NodeStep::WaitSynchronization => self.wait_synchronization(&node).await,
            NodeStep::WaitRecoveryCompletion => self.wait_recovery_completion(cx, &node).await,
            NodeStep::WaitTimelineAvailable => self.wait_timeline_available(&node).await,
            NodeStep::Wait => self.wait(cx, &node).await,
            NodeStep::TakeOver => self.take_over(cx, &node).await,
            NodeStep::WaitSwapIp => self.wait_swap_ip(cx, &node).await,
            NodeStep::Promote => self.promote(cx, &node).await,
            NodeStep::Unavailable => self.unavailable(cx, &node).await,
            NodeStep::UpdateAgent => {
                let spec = TaskSpec::new("update_agent", "sudo drydock/bin/update-agent");
                match self
                    .maintenance_task(cx, &node, signals::UPDATE_AGENT, spec, OnFailure::Page)
                    .await?
                {
                    Some(t) => Ok(t),
                    None => self.finish_maintenance(cx, &node, signals::UPDATE_AGENT).await,
                }
            }
            NodeStep::UpdateEngineExtension => {
                self.update_extension(cx, &node, ENGINE_EXTENSION, signals::UPDATE_ENGINE_EXTENSION)
                    .await
            }
            NodeStep::UpdateExtrasExtension => {
                self.update_extension(cx, &node, EXTRAS_EXTENSION, signals::UPDATE_EXTRAS_EXTENSION)
                    .await
            }
            NodeStep::UpdateImage => self.update_image(cx, &node).await,
            NodeStep::AddDomain => self.add_domain(cx, &node).await,
            NodeStep::SetupTls => self.setup_tls(cx, &node).await,
            NodeStep::RotatePassword => self.rotate_password(cx, &node).await,
            NodeStep::ResizeStorage => self.resize_storage(cx, &node).await,
            NodeStep::ResizeVm => {
                self.fleet.collab.cloud.stop_vm(&node.vm_name).await?;
                Ok(Transition::advance(NodeStep::WaitVmStopped))
            }
            NodeStep::WaitVmStopped => self.wait_vm_stopped(cx, &node).await,
            NodeStep::WaitServerStarted => self.wait_server_started(&node).await,
            NodeStep::Restart => {
                self.fleet
                    .collab
                    .agent
                    .exec(node.host(), RESTART_COMMAND, None)
                    .await?;
                cx.decr_signal(signals::RESTART).await?;
                Ok(Transition::advance(NodeStep::WaitServerStarted))
            }
            NodeStep::Stop => {
                self.fleet.collab.cloud.stop_vm(&node.vm_name).await?;
                self.set_display(&node.id, DisplayState::Stopped).await?;
                cx.decr_signal(signals::STOP).await?;
                info!(node_id = %node.id, "Node stopped");
                Ok(Transition::advance(NodeStep::Wait))
            }
            NodeStep::StartServer => {
                self.fleet.collab.cloud.start_vm(&node.vm_name).await?;
                cx.decr_signal(signals::START).await?;
                Ok(Transition::advance(NodeStep::WaitServerStarted))
            }
            NodeStep::Destroy => self.destroy(cx, &node).await,
        }
    }

    async fn deadline_passed(
        &self,
        cx: &mut StepContext<'_>,
        deadline: &Deadline,
    ) -> anyhow::Result<()> {
        let Some(node) = store::nodes::get(&self.fleet.pool, cx.id()).await? else {
            return Ok(());
        };
        let target = deadline.target.as_deref().unwrap_or("exit");
        warn!(node_id = %node.id, step = %cx.step(), target, "Node missed its deadline");

        let incident = NewIncident::new(
            deadline_tag(&node.id),
            format!("Node {} did not reach {target} in time", node.vm_name),
            Severity::Error,
        )
        .node(&node.id)
        .details(json!({ "step": cx.step(), "target": target }));
        incidents::open(&self.fleet, incident, cx.now()).await?;
        self.set_display(&node.id, DisplayState::Failed).await
    }

    async fn deadline_met(
        &self,
        cx: &mut StepContext<'_>,
        _deadline: &Deadline,
    ) -> anyhow::Result<()> {
        incidents::resolve(&self.fleet, &deadline_tag(cx.id()), cx.now()).await?;
        Ok(())
    }
}
