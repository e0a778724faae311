// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Health-check machine.
//!
//! Each cluster has one doctor. The doctor owns copies of the system query
//! templates (plus any user queries) and runs them against the cluster's
//! nodes on their cron schedules. A failing check opens one incident per
//! (query, database, node); a passing one resolves it.
//!
//! SQL checks run on the node as agent tasks so a slow query never blocks the
//! doctor. `check_fn` checks are short commands run inline.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use croner::Cron;
use drydock_core::{Program, StepContext, Transition};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use strum::{AsRefStr, EnumString};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{DOCTOR, is_steady, parse_step, signals};
use crate::agent::reap_task;
use crate::collab::{CollabError, TaskStatus};
use crate::fleet::Fleet;
use crate::incidents::{self, NewIncident};
use crate::model::{
    DisplayState, NodeRecord, QueryKind, QueryRecord, ResponseType, ServerType, Severity,
};
use crate::policy;
use crate::store;

/// `check_fn` of the disk usage check.
pub const CHECK_DISK_USAGE: &str = "check_disk_usage";
/// `db_name` that targets every database on the node.
pub const ALL_DATABASES: &str = "*";

const DISK_USAGE_COMMAND: &str = "df --output=pcent /dat | tail -n 1";
const RUN_QUERY_COMMAND: &str = "sudo drydock/bin/run-query";
const WAIT_SECS: u64 = 60;

/// A system template before it is stored.
struct SystemQuery {
    name: &'static str,
    db_name: &'static str,
    schedule: &'static str,
    sql: Option<&'static str>,
    check_fn: Option<&'static str>,
    severity: Severity,
    response_type: ResponseType,
    server_type: ServerType,
}

const SYSTEM_QUERIES: &[SystemQuery] = &[
    SystemQuery {
        name: "connection_saturation",
        db_name: "postgres",
        schedule: "*/5 * * * *",
        sql: Some(
            "SELECT count(*) > 0.9 * current_setting('max_connections')::int FROM pg_stat_activity",
        ),
        check_fn: None,
        severity: Severity::Warning,
        response_type: ResponseType::Bool,
        server_type: ServerType::Any,
    },
    SystemQuery {
        name: "replication_lag",
        db_name: "postgres",
        schedule: "*/5 * * * *",
        sql: Some("SELECT now() - pg_last_xact_replay_timestamp() > interval '5 minutes'"),
        check_fn: None,
        severity: Severity::Error,
        response_type: ResponseType::Bool,
        server_type: ServerType::Standby,
    },
    SystemQuery {
        name: "invalid_indexes",
        db_name: ALL_DATABASES,
        schedule: "0 * * * *",
        sql: Some("SELECT indexrelid::regclass FROM pg_index WHERE NOT indisvalid"),
        check_fn: None,
        severity: Severity::Warning,
        response_type: ResponseType::Rows,
        server_type: ServerType::Primary,
    },
    SystemQuery {
        name: "transaction_wraparound",
        db_name: "postgres",
        schedule: "0 * * * *",
        sql: Some("SELECT max(age(datfrozenxid)) > 1500000000 FROM pg_database"),
        check_fn: None,
        severity: Severity::Critical,
        response_type: ResponseType::Bool,
        server_type: ServerType::Primary,
    },
    SystemQuery {
        name: "disk_usage",
        db_name: "postgres",
        schedule: "*/5 * * * *",
        sql: None,
        check_fn: Some(CHECK_DISK_USAGE),
        severity: Severity::Error,
        response_type: ResponseType::Bool,
        server_type: ServerType::Any,
    },
];

/// Store the system templates that are not there yet. Existing templates are
/// left untouched. Returns how many were added.
pub async fn seed_system_queries(
    pool: &SqlitePool,
    now: DateTime<Utc>,
) -> Result<usize, sqlx::Error> {
    let mut added = 0;
    for q in SYSTEM_QUERIES {
        let template = QueryRecord {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            doctor_id: None,
            kind: QueryKind::System.as_ref().to_string(),
            name: Some(q.name.to_string()),
            db_name: Some(q.db_name.to_string()),
            schedule: Some(q.schedule.to_string()),
            sql: q.sql.map(str::to_string),
            check_fn: q.check_fn.map(str::to_string),
            severity: Some(q.severity.as_ref().to_string()),
            response_type: Some(q.response_type.as_ref().to_string()),
            server_type: Some(q.server_type.as_ref().to_string()),
            last_checked: None,
            created_at: now,
        };
        if store::queries::insert_template_if_missing(pool, &template).await? {
            added += 1;
        }
    }
    Ok(added)
}

/// A doctor's query with unset fields taken from its template.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedQuery {
    pub id: String,
    pub name: String,
    pub db_name: String,
    pub schedule: String,
    pub sql: Option<String>,
    pub check_fn: Option<String>,
    pub severity: Severity,
    pub response_type: ResponseType,
    pub server_type: ServerType,
    pub last_checked: Option<DateTime<Utc>>,
}

impl ResolvedQuery {
    /// `None` when neither row provides a schedule or something to run.
    pub fn resolve(copy: &QueryRecord, template: Option<&QueryRecord>) -> Option<Self> {
        let sql = fallback(&copy.sql, template, |t| &t.sql);
        let check_fn = fallback(&copy.check_fn, template, |t| &t.check_fn);
        if sql.is_none() && check_fn.is_none() {
            return None;
        }

        Some(Self {
            id: copy.id.clone(),
            name: fallback(&copy.name, template, |t| &t.name).unwrap_or_else(|| copy.id.clone()),
            db_name: fallback(&copy.db_name, template, |t| &t.db_name)
                .unwrap_or_else(|| "postgres".to_string()),
            schedule: fallback(&copy.schedule, template, |t| &t.schedule)?,
            sql,
            check_fn,
            severity: fallback(&copy.severity, template, |t| &t.severity)
                .and_then(|s| s.parse().ok())
                .unwrap_or(Severity::Error),
            response_type: fallback(&copy.response_type, template, |t| &t.response_type)
                .and_then(|s| s.parse().ok())
                .unwrap_or(ResponseType::Bool),
            server_type: fallback(&copy.server_type, template, |t| &t.server_type)
                .and_then(|s| s.parse().ok())
                .unwrap_or(ServerType::Any),
            last_checked: copy.last_checked,
        })
    }

    fn task_name(&self) -> String {
        format!("doctor_query_{}", &self.id[..8.min(self.id.len())])
    }
}

fn fallback(
    own: &Option<String>,
    template: Option<&QueryRecord>,
    pick: fn(&QueryRecord) -> &Option<String>,
) -> Option<String> {
    own.clone().or_else(|| template.and_then(|t| pick(t).clone()))
}

/// Whether a check is due: never run, or a scheduled time has passed since
/// the last run. The last run's own tick does not count again.
pub fn should_run(
    schedule: &str,
    last_checked: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<bool, croner::errors::CronError> {
    let Some(last) = last_checked else {
        return Ok(true);
    };
    let cron = Cron::new(schedule).parse()?;
    let next = cron.find_next_occurrence(&last, false)?;
    Ok(now >= next)
}

/// Whether a check result means trouble.
pub fn is_failure(response_type: ResponseType, output: &str, err: Option<&str>) -> bool {
    if err.is_some_and(|e| !e.trim().is_empty()) {
        return true;
    }
    let output = output.trim();
    match response_type {
        ResponseType::Bool => matches!(output.to_ascii_lowercase().as_str(), "t" | "true"),
        ResponseType::Rows => !output.is_empty(),
    }
}

/// One database's result, as printed by the query runner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckOutput {
    pub db: String,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub err: Option<String>,
}

fn incident_tag(query_id: &str, db: &str, node_id: &str) -> String {
    incidents::tag(&["doctor", query_id, db, node_id])
}

/// What one round did with a check on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Ran,
    /// The previous run has not finished.
    InFlight,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum DoctorStep {
    Start,
    SyncSystemQueries,
    WaitResource,
    Wait,
    Destroy,
}

pub struct DoctorProgram {
    fleet: Arc<Fleet>,
}

impl DoctorProgram {
    pub fn new(fleet: Arc<Fleet>) -> Self {
        Self { fleet }
    }

    /// Give the doctor a copy of every system template it lacks.
    async fn sync_system_queries(
        &self,
        doctor_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<usize> {
        let pool = &self.fleet.pool;
        let owned = store::queries::list_for_doctor(pool, doctor_id).await?;
        let mut added = 0;

        for template in store::queries::list_templates(pool).await? {
            if template.kind != QueryKind::System.as_ref()
                || owned
                    .iter()
                    .any(|q| q.parent_id.as_deref() == Some(template.id.as_str()))
            {
                continue;
            }
            let copy = QueryRecord {
                id: Uuid::new_v4().to_string(),
                parent_id: Some(template.id.clone()),
                doctor_id: Some(doctor_id.to_string()),
                kind: template.kind.clone(),
                name: None,
                db_name: None,
                schedule: None,
                sql: None,
                check_fn: None,
                severity: None,
                response_type: None,
                server_type: None,
                last_checked: None,
                created_at: now,
            };
            store::queries::insert(pool, &copy).await?;
            added += 1;
        }
        Ok(added)
    }

    async fn wait(
        &self,
        cx: &mut StepContext<'_>,
        resource_id: &str,
    ) -> anyhow::Result<Transition> {
        if cx.is_signaled(signals::SYNC_SYSTEM_QUERIES).await? {
            return Ok(Transition::advance(DoctorStep::SyncSystemQueries));
        }

        let pool = &self.fleet.pool;
        let templates: HashMap<String, QueryRecord> = store::queries::list_templates(pool)
            .await?
            .into_iter()
            .map(|t| (t.id.clone(), t))
            .collect();
        let nodes: Vec<NodeRecord> = store::nodes::list_for_resource(pool, resource_id)
            .await?
            .into_iter()
            .filter(|n| {
                !matches!(
                    n.display(),
                    DisplayState::Creating | DisplayState::Stopped | DisplayState::Deleting
                )
            })
            .collect();

        for copy in store::queries::list_for_doctor(pool, cx.id()).await? {
            let template = copy.parent_id.as_ref().and_then(|id| templates.get(id));
            let Some(query) = ResolvedQuery::resolve(&copy, template) else {
                warn!(query_id = %copy.id, "Health check has nothing to run");
                continue;
            };
            let due = match should_run(&query.schedule, query.last_checked, cx.now()) {
                Ok(due) => due,
                Err(e) => {
                    warn!(
                        query_id = %query.id,
                        schedule = %query.schedule,
                        error = %e,
                        "Bad schedule"
                    );
                    continue;
                }
            };

            let mut in_flight = false;
            for node in nodes
                .iter()
                .filter(|n| query.server_type.matches(n.is_representative()))
            {
                match self.check_node(cx, &query, node, due).await {
                    Ok(attempt) => in_flight |= attempt == Attempt::InFlight,
                    Err(e) => self.on_check_error(cx, &query, node, e).await?,
                }
            }
            // Still due next round if a previous run has not finished.
            if due && !in_flight {
                store::queries::set_last_checked(pool, &query.id, cx.now()).await?;
            }
        }

        Ok(Transition::sleep(WAIT_SECS))
    }

    async fn on_check_error(
        &self,
        cx: &mut StepContext<'_>,
        query: &ResolvedQuery,
        node: &NodeRecord,
        error: anyhow::Error,
    ) -> anyhow::Result<()> {
        warn!(query = %query.name, node_id = %node.id, error = %error, "Health check did not run");
        let unreachable = error
            .downcast_ref::<CollabError>()
            .is_some_and(CollabError::is_unreachable);
        if unreachable {
            cx.signal(&node.id, signals::CHECKUP).await?;
        }
        Ok(())
    }

    async fn check_node(
        &self,
        cx: &mut StepContext<'_>,
        query: &ResolvedQuery,
        node: &NodeRecord,
        due: bool,
    ) -> anyhow::Result<Attempt> {
        if query.check_fn.as_deref() == Some(CHECK_DISK_USAGE) {
            if !due {
                return Ok(Attempt::Idle);
            }
            self.check_disk_usage(cx, query, node).await?;
            return Ok(Attempt::Ran);
        }
        let Some(sql) = &query.sql else {
            return Ok(Attempt::Idle);
        };

        let agent = self.fleet.collab.agent.as_ref();
        let task = query.task_name();
        let (status, logs) = reap_task(agent, node.host(), &task).await?;
        match (status, logs) {
            (TaskStatus::InProgress, _) => return Ok(Attempt::InFlight),
            (TaskStatus::Succeeded, Some(logs)) => {
                let outputs: Vec<CheckOutput> = if logs.stdout.trim().is_empty() {
                    Vec::new()
                } else {
                    serde_json::from_str(&logs.stdout)?
                };
                for output in outputs {
                    self.record(cx, query, node, &output).await?;
                }
            }
            (TaskStatus::Failed, Some(logs)) => {
                // The runner died before reporting per database, so every
                // target database carries the failure.
                for db in self.databases(query, node).await? {
                    let output = CheckOutput {
                        db,
                        result: String::new(),
                        err: Some(logs.stderr.clone()),
                    };
                    self.record(cx, query, node, &output).await?;
                }
            }
            _ => {}
        }

        if !due {
            return Ok(Attempt::Idle);
        }
        let dbs = self.databases(query, node).await?;
        let stdin = json!({ "sql": sql, "dbs": dbs, "user": "postgres" }).to_string();
        agent
            .run(node.host(), &task, RUN_QUERY_COMMAND, Some(&stdin))
            .await?;
        debug!(query = %query.name, node_id = %node.id, "Health check started");
        Ok(Attempt::Ran)
    }

    async fn databases(
        &self,
        query: &ResolvedQuery,
        node: &NodeRecord,
    ) -> anyhow::Result<Vec<String>> {
        if query.db_name != ALL_DATABASES {
            return Ok(vec![query.db_name.clone()]);
        }
        let listing = self
            .fleet
            .collab
            .db
            .run_query(
                node.host(),
                "postgres",
                "postgres",
                "SELECT datname FROM pg_database WHERE NOT datistemplate",
            )
            .await?;
        Ok(listing
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn check_disk_usage(
        &self,
        cx: &mut StepContext<'_>,
        query: &ResolvedQuery,
        node: &NodeRecord,
    ) -> anyhow::Result<()> {
        let raw = self
            .fleet
            .collab
            .agent
            .exec(node.host(), DISK_USAGE_COMMAND, None)
            .await?;
        let usage = policy::parse_disk_usage(&raw);
        let full = usage.is_some_and(|u| u >= policy::DISK_USAGE_LIMIT_PERCENT);

        let output = CheckOutput {
            db: query.db_name.clone(),
            result: if full { "t" } else { "f" }.to_string(),
            err: usage.is_none().then(|| format!("unreadable disk usage: {raw:?}")),
        };
        self.record(cx, query, node, &output).await?;

        if full {
            self.autoresize(cx, node).await?;
        }
        Ok(())
    }

    /// Grow the node's storage unless it is busy or already resizing.
    async fn autoresize(&self, cx: &mut StepContext<'_>, node: &NodeRecord) -> anyhow::Result<()> {
        let engine = cx.engine();
        if !is_steady(engine, &node.id).await?
            || engine
                .persistence()
                .signal_count(&node.id, signals::RESIZE_STORAGE)
                .await?
                > 0
        {
            return Ok(());
        }
        let max = self.fleet.config.max_storage_gib;
        let Some(target) = policy::storage_autoresize(node.storage_gib, max) else {
            return Ok(());
        };

        store::nodes::set_storage(&self.fleet.pool, &node.id, target).await?;
        let resource = self.fleet.resource(&node.resource_id).await?;
        if resource.storage_gib < target {
            store::resources::set_storage(&self.fleet.pool, &resource.id, target).await?;
        }
        cx.signal(&node.id, signals::RESIZE_STORAGE).await?;
        info!(
            node_id = %node.id,
            from = node.storage_gib,
            to = target,
            "Disk nearly full, growing storage"
        );
        Ok(())
    }

    /// Open or resolve the incident of one (query, db, node) result.
    async fn record(
        &self,
        cx: &mut StepContext<'_>,
        query: &ResolvedQuery,
        node: &NodeRecord,
        output: &CheckOutput,
    ) -> anyhow::Result<()> {
        let tag = incident_tag(&query.id, &output.db, &node.id);
        if !is_failure(query.response_type, &output.result, output.err.as_deref()) {
            incidents::resolve(&self.fleet, &tag, cx.now()).await?;
            return Ok(());
        }

        let incident = NewIncident::new(
            tag,
            format!("{} failed on {} ({})", query.name, node.vm_name, output.db),
            query.severity,
        )
        .query(&query.id, &output.db)
        .node(&node.id)
        .details(json!({
            "resource_id": node.resource_id,
            "result": output.result,
            "err": output.err,
        }));
        incidents::open(&self.fleet, incident, cx.now()).await?;
        Ok(())
    }

    async fn destroy(&self, cx: &mut StepContext<'_>) -> anyhow::Result<Transition> {
        let pool = &self.fleet.pool;
        for query in store::queries::list_for_doctor(pool, cx.id()).await? {
            for page in store::pages::list_open_for_query(pool, &query.id).await? {
                incidents::resolve_by_id(&self.fleet, &page.id, cx.now()).await?;
            }
        }
        store::doctors::delete(pool, cx.id()).await?;
        info!(doctor_id = %cx.id(), "Doctor deleted");
        Ok(Transition::finish_with_msg("doctor deleted"))
    }
}

#[async_trait]
impl Program for DoctorProgram {
    fn name(&self) -> &'static str {
        DOCTOR
    }

    async fn run_step(&self, step: &str, cx: &mut StepContext<'_>) -> anyhow::Result<Transition> {
        let step = parse_step::<DoctorStep>(DOCTOR, step)?;
        let Some(doctor) = store::doctors::get(&self.fleet.pool, cx.id()).await? else {
            if step == DoctorStep::Destroy {
                return Ok(Transition::finish_with_msg("doctor already deleted"));
            }
            anyhow::bail!("doctor {} not found", cx.id());
        };

        match step {
            DoctorStep::Start => Ok(Transition::advance(DoctorStep::SyncSystemQueries)),
            DoctorStep::SyncSystemQueries => {
                let added = self.sync_system_queries(&doctor.id, cx.now()).await?;
                if added > 0 {
                    info!(doctor_id = %doctor.id, added, "System health checks synced");
                }
                cx.decr_signal(signals::SYNC_SYSTEM_QUERIES).await?;
                Ok(Transition::advance(DoctorStep::WaitResource))
            }
            DoctorStep::WaitResource => {
                if is_steady(cx.engine(), &doctor.resource_id).await? {
                    Ok(Transition::advance(DoctorStep::Wait))
                } else {
                    Ok(Transition::sleep(15))
                }
            }
            DoctorStep::Wait => self.wait(cx, &doctor.resource_id).await,
            DoctorStep::Destroy => self.destroy(cx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, h, m, 0).unwrap()
    }

    fn row(id: &str) -> QueryRecord {
        QueryRecord {
            id: id.to_string(),
            parent_id: None,
            doctor_id: None,
            kind: "system".to_string(),
            name: None,
            db_name: None,
            schedule: None,
            sql: None,
            check_fn: None,
            severity: None,
            response_type: None,
            server_type: None,
            last_checked: None,
            created_at: at(0, 0),
        }
    }

    #[test]
    fn test_should_run() {
        let every_5 = "*/5 * * * *";
        assert!(should_run(every_5, None, at(12, 0)).unwrap());
        // Checked a minute ago, next tick not reached yet.
        assert!(!should_run(every_5, Some(at(12, 3)), at(12, 4)).unwrap());
        assert!(should_run(every_5, Some(at(12, 3)), at(12, 5)).unwrap());
        // A run on a tick does not make the same tick due again.
        assert!(!should_run(every_5, Some(at(12, 0)), at(12, 0)).unwrap());
        assert!(should_run(every_5, Some(at(12, 0)), at(12, 5)).unwrap());
        assert!(should_run("not a cron", Some(at(12, 0)), at(12, 5)).is_err());
    }

    #[test]
    fn test_is_failure() {
        assert!(is_failure(ResponseType::Bool, "t", None));
        assert!(is_failure(ResponseType::Bool, "true\n", None));
        assert!(!is_failure(ResponseType::Bool, "f", None));
        assert!(!is_failure(ResponseType::Rows, "  ", None));
        assert!(is_failure(ResponseType::Rows, "idx_orders_broken", None));
        assert!(is_failure(ResponseType::Bool, "f", Some("connection refused")));
        assert!(!is_failure(ResponseType::Bool, "f", Some("")));
    }

    #[test]
    fn test_copy_falls_back_to_template() {
        let mut template = row("tpl");
        template.name = Some("invalid_indexes".to_string());
        template.schedule = Some("0 * * * *".to_string());
        template.sql = Some("SELECT 1".to_string());
        template.response_type = Some("rows".to_string());
        template.server_type = Some("primary".to_string());

        let mut copy = row("copy-1234-abcd");
        copy.parent_id = Some("tpl".to_string());
        copy.schedule = Some("*/10 * * * *".to_string());

        let resolved = ResolvedQuery::resolve(&copy, Some(&template)).unwrap();
        assert_eq!(resolved.id, "copy-1234-abcd");
        assert_eq!(resolved.name, "invalid_indexes");
        assert_eq!(resolved.schedule, "*/10 * * * *");
        assert_eq!(resolved.sql.as_deref(), Some("SELECT 1"));
        assert_eq!(resolved.response_type, ResponseType::Rows);
        assert_eq!(resolved.server_type, ServerType::Primary);
        assert_eq!(resolved.severity, Severity::Error);
        assert_eq!(resolved.db_name, "postgres");
        assert_eq!(resolved.task_name(), "doctor_query_copy-123");
    }

    #[test]
    fn test_resolve_needs_something_to_run() {
        let mut copy = row("c");
        copy.schedule = Some("* * * * *".to_string());
        assert!(ResolvedQuery::resolve(&copy, None).is_none());
    }

    #[test]
    fn test_system_templates_are_well_formed() {
        for q in SYSTEM_QUERIES {
            assert!(q.sql.is_some() ^ q.check_fn.is_some(), "{}", q.name);
            assert!(Cron::new(q.schedule).parse().is_ok(), "{}", q.name);
        }
    }
}
