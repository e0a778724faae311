// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backup lineage machine.
//!
//! A timeline owns a prefix of the backup bucket. Exactly one node pushes WAL
//! and base backups into it (the leader); any number of nodes fetch from it.
//! The machine keeps the leader's backups fresh, prunes old ones, and caches
//! the completed-backup bounds that decide which restore targets are valid.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use drydock_core::{Program, StepContext, Transition};
use serde_json::json;
use strum::{AsRefStr, EnumString};
use tracing::{info, warn};

use super::{TIMELINE, ignore_missing, is_steady, parse_step, signals};
use crate::agent::reap_task;
use crate::collab::{BlobObject, CollabResult, TaskStatus};
use crate::fleet::Fleet;
use crate::incidents::{self, NewIncident};
use crate::model::{NodeRecord, Severity, TimelineRecord};
use crate::store;

/// Directory of base backups under a timeline prefix.
pub const BACKUP_DIR: &str = "basebackups_005";
/// Object written when a base backup completes.
pub const SENTINEL_SUFFIX: &str = "_backup_stop_sentinel.json";

pub const TAKE_BACKUP_TASK: &str = "take_backup";
pub const PRUNE_BACKUPS_TASK: &str = "prune_backups";
const TAKE_BACKUP_COMMAND: &str = "sudo drydock/bin/take-backup";
const PRUNE_BACKUPS_COMMAND: &str = "sudo drydock/bin/prune-backups";

/// Restores may not target the first minutes after the earliest backup.
const RESTORE_OFFSET_MINUTES: i64 = 5;
const WAIT_SECS: u64 = 20 * 60;

fn backup_interval() -> Duration {
    Duration::hours(24)
}

fn prune_interval() -> Duration {
    Duration::hours(24)
}

fn missing_backup_after() -> Duration {
    Duration::days(2)
}

/// Key of the completion sentinel of `label`.
pub fn sentinel_key(prefix: &str, label: &str) -> String {
    format!("{prefix}/{BACKUP_DIR}/{label}{SENTINEL_SUFFIX}")
}

/// Backup label of a sentinel key, `None` for other objects.
pub fn backup_label(key: &str) -> Option<&str> {
    let file = key.rsplit('/').next()?;
    let label = file.strip_suffix(SENTINEL_SUFFIX)?;
    (!label.is_empty()).then_some(label)
}

/// Range of valid restore targets: from shortly after the earliest completed
/// backup (immediately in e2e mode) up to `now`. `None` without backups.
pub fn restore_window(
    timeline: &TimelineRecord,
    e2e: bool,
    now: DateTime<Utc>,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let offset = if e2e {
        Duration::zero()
    } else {
        Duration::minutes(RESTORE_OFFSET_MINUTES)
    };
    let earliest = timeline.earliest_backup_completed_at? + offset;
    Some((earliest, now))
}

/// Inclusive on both ends.
pub fn window_contains(window: (DateTime<Utc>, DateTime<Utc>), target: DateTime<Utc>) -> bool {
    window.0 <= target && target <= window.1
}

/// Whether the leader should start a base backup now. A failed attempt is
/// retried at once; a started one holds for a day.
pub fn need_backup(timeline: &TimelineRecord, last_failed: bool, now: DateTime<Utc>) -> bool {
    if last_failed {
        return true;
    }
    match timeline.latest_backup_started_at {
        None => true,
        Some(started) => now - started >= backup_interval(),
    }
}

/// Completed base backups of a timeline, oldest first.
pub async fn list_backups(
    fleet: &Fleet,
    timeline: &TimelineRecord,
) -> CollabResult<Vec<BlobObject>> {
    let prefix = format!("{}/{BACKUP_DIR}/", timeline.prefix());
    let mut backups = fleet
        .collab
        .blobs
        .list_objects(&timeline.bucket, &prefix, &format!("*{SENTINEL_SUFFIX}"))
        .await?;
    backups.sort_by_key(|b| b.updated_at);
    Ok(backups)
}

/// Label of the newest backup completed at or before `target`.
pub async fn backup_label_before(
    fleet: &Fleet,
    timeline: &TimelineRecord,
    target: DateTime<Utc>,
) -> CollabResult<Option<String>> {
    Ok(list_backups(fleet, timeline)
        .await?
        .iter()
        .rev()
        .filter(|b| b.updated_at <= target)
        .find_map(|b| backup_label(&b.key).map(str::to_string)))
}

fn missing_backup_tag(timeline_id: &str) -> String {
    incidents::tag(&["missing-backup", timeline_id])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum TimelineStep {
    Start,
    WaitLeader,
    Wait,
    Destroy,
}

pub struct TimelineProgram {
    fleet: Arc<Fleet>,
}

impl TimelineProgram {
    pub fn new(fleet: Arc<Fleet>) -> Self {
        Self { fleet }
    }

    async fn start(&self, timeline: &TimelineRecord) -> anyhow::Result<Transition> {
        let identity = &self.fleet.collab.identity;
        let short = &timeline.id[..8.min(timeline.id.len())];

        let email = identity.create_identity(&format!("tl-{short}")).await?;
        identity
            .grant_bucket_access(&email, &timeline.bucket, timeline.prefix())
            .await?;
        let key = identity.create_key(&email).await?;
        store::timelines::set_identity(&self.fleet.pool, &timeline.id, &email, &key).await?;

        info!(timeline_id = %timeline.id, email = %email, "Timeline identity ready");
        Ok(Transition::advance(TimelineStep::WaitLeader))
    }

    /// Start a backup on the leader when one is due or requested.
    async fn backup(
        &self,
        cx: &mut StepContext<'_>,
        timeline: &TimelineRecord,
        leader: &NodeRecord,
    ) -> anyhow::Result<()> {
        let agent = self.fleet.collab.agent.as_ref();
        let (status, logs) = reap_task(agent, leader.host(), TAKE_BACKUP_TASK).await?;
        let failed = match status {
            TaskStatus::InProgress => return Ok(()),
            TaskStatus::Failed => {
                let stderr = logs.map(|l| l.stderr).unwrap_or_default();
                warn!(timeline_id = %timeline.id, stderr = %stderr, "Backup failed, retrying");
                true
            }
            TaskStatus::Succeeded => {
                info!(timeline_id = %timeline.id, "Backup finished");
                false
            }
            TaskStatus::NotStarted => false,
        };

        let requested = cx.is_signaled(signals::TAKE_BACKUP).await?;
        if requested || need_backup(timeline, failed, cx.now()) {
            agent
                .run(leader.host(), TAKE_BACKUP_TASK, TAKE_BACKUP_COMMAND, None)
                .await?;
            store::timelines::set_backup_started(&self.fleet.pool, &timeline.id, cx.now()).await?;
            if requested {
                cx.decr_signal(signals::TAKE_BACKUP).await?;
            }
            info!(timeline_id = %timeline.id, leader = %leader.vm_name, "Backup started");
        }
        Ok(())
    }

    async fn prune(&self, cx: &mut StepContext<'_>, leader: &NodeRecord) -> anyhow::Result<()> {
        let agent = self.fleet.collab.agent.as_ref();
        let (status, _) = reap_task(agent, leader.host(), PRUNE_BACKUPS_TASK).await?;
        if status == TaskStatus::InProgress {
            return Ok(());
        }

        let last: Option<DateTime<Utc>> = cx.local("last_prune_at");
        if last.is_some_and(|at| cx.now() - at < prune_interval()) {
            return Ok(());
        }
        agent
            .run(leader.host(), PRUNE_BACKUPS_TASK, PRUNE_BACKUPS_COMMAND, None)
            .await?;
        cx.set_local("last_prune_at", cx.now())?;
        Ok(())
    }

    async fn refresh_cache(&self, timeline: &TimelineRecord) -> anyhow::Result<TimelineRecord> {
        let backups = list_backups(&self.fleet, timeline).await?;
        let earliest = backups.first().map(|b| b.updated_at);
        let latest = backups.last().map(|b| b.updated_at);

        if earliest != timeline.earliest_backup_completed_at
            || latest != timeline.latest_backup_completed_at
        {
            store::timelines::set_backup_bounds(&self.fleet.pool, &timeline.id, earliest, latest)
                .await?;
        }
        Ok(self.fleet.timeline(&timeline.id).await?)
    }

    /// The creation time counts as a first backup so a young timeline is
    /// not reported.
    async fn check_missing_backup(
        &self,
        timeline: &TimelineRecord,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let last = timeline
            .latest_backup_completed_at
            .unwrap_or(timeline.created_at);
        let tag = missing_backup_tag(&timeline.id);

        if now - last > missing_backup_after() {
            let incident = NewIncident::new(
                tag,
                format!("Timeline {} has no recent backup", timeline.id),
                Severity::Error,
            )
            .details(json!({
                "timeline_id": timeline.id,
                "last_backup_at": last.to_rfc3339(),
            }));
            incidents::open(&self.fleet, incident, now).await?;
        } else {
            incidents::resolve(&self.fleet, &tag, now).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Program for TimelineProgram {
    fn name(&self) -> &'static str {
        TIMELINE
    }

    async fn run_step(&self, step: &str, cx: &mut StepContext<'_>) -> anyhow::Result<Transition> {
        let step = parse_step::<TimelineStep>(TIMELINE, step)?;

        let Some(timeline) = store::timelines::get(&self.fleet.pool, cx.id()).await? else {
            if step == TimelineStep::Destroy {
                return Ok(Transition::finish_with_msg("timeline already deleted"));
            }
            anyhow::bail!("timeline {} not found", cx.id());
        };

        match step {
            TimelineStep::Start => self.start(&timeline).await,
            TimelineStep::WaitLeader => {
                let leader = store::nodes::timeline_leader(&self.fleet.pool, &timeline.id).await?;
                if let Some(leader) = leader
                    && is_steady(cx.engine(), &leader.id).await?
                {
                    return Ok(Transition::advance(TimelineStep::Wait));
                }
                Ok(Transition::sleep(5))
            }
            TimelineStep::Wait => {
                let leader = store::nodes::timeline_leader(&self.fleet.pool, &timeline.id).await?;

                if let Some(leader) = &leader
                    && is_steady(cx.engine(), &leader.id).await?
                {
                    self.backup(cx, &timeline, leader).await?;
                    self.prune(cx, leader).await?;
                }

                let timeline = self.refresh_cache(&timeline).await?;

                // Lineages nobody writes to anymore stop taking backups.
                if leader.is_some() {
                    self.check_missing_backup(&timeline, cx.now()).await?;
                } else {
                    incidents::resolve(&self.fleet, &missing_backup_tag(&timeline.id), cx.now())
                        .await?;
                }

                Ok(Transition::sleep(WAIT_SECS))
            }
            TimelineStep::Destroy => {
                if let Some(email) = &timeline.service_account_email {
                    ignore_missing(self.fleet.collab.identity.delete_identity(email).await)?;
                }
                incidents::resolve(&self.fleet, &missing_backup_tag(&timeline.id), cx.now()).await?;
                store::timelines::delete(&self.fleet.pool, &timeline.id).await?;
                info!(timeline_id = %timeline.id, "Timeline deleted");
                Ok(Transition::finish_with_msg("timeline deleted"))
            }
        }
    }
}
