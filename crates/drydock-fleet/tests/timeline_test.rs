// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backup scheduling and missing-backup incidents.

mod common;

use chrono::Duration;
use serde_json::json;

use common::Harness;
use drydock_fleet::incidents;
use drydock_fleet::model::{HaType, PageRecord, PageStatus, ResourceRecord, TimelineRecord};
use drydock_fleet::programs::node::CONFIGURE_DB_TASK;
use drydock_fleet::programs::timeline::{TAKE_BACKUP_TASK, sentinel_key};

async fn backup_runs(h: &Harness) -> usize {
    h.cloud
        .task_runs()
        .await
        .iter()
        .filter(|r| r.task == TAKE_BACKUP_TASK)
        .count()
}

async fn running_cluster(h: &Harness) -> (ResourceRecord, TimelineRecord) {
    let resource = h.create_cluster("orders", HaType::None).await;
    h.wait_running(&resource.id, 1).await;
    let primary = h.primary(&resource.id).await;
    let timeline = h.fleet.timeline(&primary.timeline_id).await.unwrap();
    (resource, timeline)
}

async fn missing_backup_page(h: &Harness, timeline_id: &str) -> Option<PageRecord> {
    let tag = incidents::tag(&["missing-backup", timeline_id]);
    h.service
        .incident_history()
        .await
        .unwrap()
        .into_iter()
        .find(|p| p.tag == tag)
}

/// Jump the clock an hour at a time, polling once per jump.
async fn run_hours(h: &Harness, hours: i64) {
    for _ in 0..hours {
        h.clock.advance(Duration::hours(1));
        h.tick().await;
    }
}

#[tokio::test]
async fn test_timeline_waits_for_a_settled_leader() {
    let h = &Harness::new().await;
    h.cloud.hold_tasks(CONFIGURE_DB_TASK).await;
    let resource = h.create_cluster("orders", HaType::None).await;
    let primary = h.primary(&resource.id).await;
    let timeline_id = &primary.timeline_id;

    // The leader row exists, but its node is still being configured.
    h.run_for(10 * 60).await;
    assert_eq!(h.step(timeline_id).await.as_deref(), Some("wait_leader"));
    assert_eq!(backup_runs(h).await, 0);

    h.cloud.release_tasks(CONFIGURE_DB_TASK).await;
    h.wait_running(&resource.id, 1).await;
    h.run_until("timeline settled", 100, || async move {
        h.step(timeline_id).await.as_deref() == Some("wait")
    })
    .await;
    h.run_until("first backup", 100, || async move { backup_runs(h).await == 1 })
        .await;
}

#[tokio::test]
async fn test_failed_backup_is_retried_on_next_round() {
    let h = &Harness::new().await;
    h.cloud.fail_tasks(TAKE_BACKUP_TASK).await;
    let _ = running_cluster(h).await;

    h.run_until("first backup", 500, || async move { backup_runs(h).await >= 1 })
        .await;
    assert_eq!(backup_runs(h).await, 1);

    // The timeline wakes every 20 minutes; a failure does not wait a day.
    h.run_until("backup retried", 400, || async move { backup_runs(h).await == 2 })
        .await;

    h.cloud.stop_failing_tasks(TAKE_BACKUP_TASK).await;
    h.run_until("backup retried again", 400, || async move {
        backup_runs(h).await == 3
    })
    .await;

    // A successful start holds until the next day.
    h.run_for(2 * 60 * 60).await;
    assert_eq!(backup_runs(h).await, 3);
}

#[tokio::test]
async fn test_missing_backup_opens_and_resolves_incident() {
    let h = &Harness::new().await;
    let (_, timeline) = running_cluster(h).await;

    // Creation counts as a first backup.
    run_hours(h, 24).await;
    assert!(missing_backup_page(h, &timeline.id).await.is_none());

    run_hours(h, 26).await;
    let page = missing_backup_page(h, &timeline.id)
        .await
        .expect("missing-backup incident");
    assert!(page.is_open());
    assert_eq!(page.severity, "error");
    assert_eq!(page.details_json()["timeline_id"], json!(timeline.id));

    let completed_at = h.now();
    let key = sentinel_key(timeline.prefix(), "base_000000010000000000000004");
    h.cloud
        .put_blob(&timeline.bucket, &key, completed_at, json!({}))
        .await;
    run_hours(h, 1).await;

    let page = missing_backup_page(h, &timeline.id).await.unwrap();
    assert_eq!(page.page_status(), PageStatus::Resolved);
    assert!(page.resolved_at.is_some());

    let refreshed = h.fleet.timeline(&timeline.id).await.unwrap();
    assert_eq!(refreshed.latest_backup_completed_at, Some(completed_at));
}
