// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node availability, provisioning deadlines and standby catch-up.

mod common;

use chrono::Duration;

use common::Harness;
use drydock_fleet::model::{DisplayState, HaType, NodeRecord, PageRecord, PageStatus, SyncStatus};
use drydock_fleet::programs::auto_restart::RESTART_SERVER;
use drydock_fleet::programs::node::{CONFIGURE_DB_TASK, deadline_tag, unavailable_tag};
use drydock_fleet::programs::signals;

/// Newest incident raised under `tag`, resolved or not.
async fn incident(h: &Harness, tag: &str) -> Option<PageRecord> {
    h.service
        .incident_history()
        .await
        .unwrap()
        .into_iter()
        .find(|p| p.tag == tag)
}

async fn restarts(h: &Harness, host: &str) -> usize {
    h.cloud
        .exec_log()
        .await
        .iter()
        .filter(|(on, command)| on == host && command == RESTART_SERVER)
        .count()
}

async fn standbys(h: &Harness, resource_id: &str) -> Vec<NodeRecord> {
    h.nodes(resource_id)
        .await
        .into_iter()
        .filter(|n| !n.is_representative())
        .collect()
}

/// Run until every standby of the cluster sits in `step`.
async fn standbys_reach(h: &Harness, resource_id: &str, step: &'static str) {
    h.run_until(step, 2_000, || async move {
        let nodes = standbys(h, resource_id).await;
        for node in &nodes {
            if h.step(&node.id).await.as_deref() != Some(step) {
                return false;
            }
        }
        !nodes.is_empty()
    })
    .await;
}

#[tokio::test]
async fn test_unreachable_node_escalates_and_recovers() {
    let h = &Harness::new().await;
    let resource = h.create_cluster("orders", HaType::None).await;
    h.wait_running(&resource.id, 1).await;
    let primary = h.primary(&resource.id).await;
    let node_id = &primary.id;
    let tag = unavailable_tag(node_id);

    h.cloud.set_unreachable(&primary.vm_name, true).await;
    h.run_until("node unavailable", 200, || async move {
        h.node(node_id).await.unwrap().display() == DisplayState::Unavailable
    })
    .await;
    let since = h.now();
    assert!(incident(h, &tag).await.is_none());

    let tag_ref = &tag;
    h.run_until("incident opened", 200, || async move {
        incident(h, tag_ref).await.is_some()
    })
    .await;
    assert!(h.now() - since >= Duration::minutes(5));

    let page = incident(h, &tag).await.unwrap();
    assert!(page.is_open());
    assert_eq!(page.severity, "critical");
    assert_eq!(page.node_id.as_deref(), Some(node_id.as_str()));

    assert_eq!(h.step(node_id).await.as_deref(), Some("unavailable"));

    h.cloud.set_unreachable(&primary.vm_name, false).await;
    h.run_until("node recovered", 200, || async move {
        h.node(node_id).await.unwrap().display() == DisplayState::Running
            && h.step(node_id).await.as_deref() == Some("wait")
    })
    .await;

    let page = incident(h, &tag).await.unwrap();
    assert_eq!(page.page_status(), PageStatus::Resolved);
}

#[tokio::test]
async fn test_auto_restarts_are_bounded() {
    let h = &Harness::new().await;
    let resource = h.create_cluster("orders", HaType::None).await;
    h.wait_running(&resource.id, 1).await;
    let primary = h.primary(&resource.id).await;
    let node_id = &primary.id;
    let host = &primary.vm_name;

    // The VM answers but the database does not come back on restart.
    h.cloud.set_db_down(host, true).await;
    h.engine.signal(node_id, signals::CHECKUP).await.unwrap();
    h.run_until("first restart", 200, || async move { restarts(h, host).await == 1 })
        .await;
    assert!(incident(h, &unavailable_tag(node_id)).await.unwrap().is_open());

    h.run_for(20 * 60).await;
    assert_eq!(restarts(h, host).await, 3);
    assert_eq!(h.step(node_id).await.as_deref(), Some("unavailable"));

    h.cloud.set_db_down(host, false).await;
    h.run_until("node recovered", 200, || async move {
        h.step(node_id).await.as_deref() == Some("wait")
    })
    .await;
    let page = incident(h, &unavailable_tag(node_id)).await.unwrap();
    assert_eq!(page.page_status(), PageStatus::Resolved);
    assert_eq!(h.node(node_id).await.unwrap().display(), DisplayState::Running);
}

#[tokio::test]
async fn test_crash_recovery_counts_as_available() {
    let h = &Harness::new().await;
    let resource = h.create_cluster("orders", HaType::None).await;
    h.wait_running(&resource.id, 1).await;
    let primary = h.primary(&resource.id).await;
    let node_id = &primary.id;

    h.cloud.set_db_down(&primary.vm_name, true).await;
    h.cloud
        .respond_to_exec("tail -n 5", "LOG:  redo in progress, elapsed time: 3.20 s")
        .await;
    h.engine.signal(node_id, signals::CHECKUP).await.unwrap();
    h.run_for(3 * 60).await;

    let node = h.node(node_id).await.unwrap();
    assert_eq!(node.display(), DisplayState::Running);
    assert_eq!(h.step(node_id).await.as_deref(), Some("wait"));

    // Once the log no longer shows replay, the node is unavailable.
    h.cloud
        .respond_to_exec("tail -n 5", "LOG:  database system is shut down")
        .await;
    h.engine.signal(node_id, signals::CHECKUP).await.unwrap();
    h.run_until("node unavailable", 200, || async move {
        h.node(node_id).await.unwrap().display() == DisplayState::Unavailable
    })
    .await;

    h.cloud.set_db_down(&primary.vm_name, false).await;
    h.run_until("node recovered", 200, || async move {
        h.node(node_id).await.unwrap().display() == DisplayState::Running
    })
    .await;
    assert!(incident(h, &unavailable_tag(node_id)).await.is_none());
}

#[tokio::test]
async fn test_slow_provisioning_misses_deadline() {
    let h = &Harness::new().await;
    h.cloud.hold_tasks(CONFIGURE_DB_TASK).await;
    let resource = h.create_cluster("orders", HaType::None).await;
    let primary = h.primary(&resource.id).await;
    let node_id = &primary.id;
    let tag = deadline_tag(node_id);

    let tag_ref = &tag;
    h.run_until("deadline missed", 1_000, || async move {
        incident(h, tag_ref).await.is_some()
    })
    .await;
    assert!(h.now() - primary.created_at >= Duration::minutes(30));
    assert_eq!(h.step(node_id).await.as_deref(), Some("configure_stack"));

    let node = h.node(node_id).await.unwrap();
    assert_eq!(node.display(), DisplayState::Failed);
    let page = incident(h, &tag).await.unwrap();
    assert!(page.is_open());
    assert_eq!(page.severity, "error");

    h.cloud.release_tasks(CONFIGURE_DB_TASK).await;
    h.wait_running(&resource.id, 1).await;

    let page = incident(h, &tag).await.unwrap();
    assert_eq!(page.page_status(), PageStatus::Resolved);
    assert_eq!(h.step(node_id).await.as_deref(), Some("wait"));
}

#[tokio::test]
async fn test_async_standby_waits_for_catch_up() {
    let h = &Harness::new().await;
    let resource = h.create_cluster("orders", HaType::Async).await;
    let primary = h.primary(&resource.id).await;
    // 85 MiB of WAL ahead of a standby that has replayed nothing.
    h.cloud
        .respond_to_query(Some(&primary.vm_name), "pg_current_wal_lsn", "0/5500000")
        .await;

    let resource_id = &resource.id;
    h.run_until("standby added", 500, || async move {
        standbys(h, resource_id).await.len() == 1
    })
    .await;
    let standby = standbys(h, resource_id).await.remove(0);
    h.cloud
        .respond_to_query(Some(&standby.vm_name), "pg_last_wal_replay_lsn", "0/0")
        .await;

    standbys_reach(h, resource_id, "wait_catch_up").await;
    h.run_for(5 * 60).await;
    assert_eq!(h.step(&standby.id).await.as_deref(), Some("wait_catch_up"));
    let node = h.node(&standby.id).await.unwrap();
    assert_eq!(node.sync_status(), SyncStatus::CatchingUp);

    // 10 MiB behind is close enough.
    h.cloud
        .respond_to_query(Some(&standby.vm_name), "pg_last_wal_replay_lsn", "0/4B00000")
        .await;
    h.wait_running(resource_id, 2).await;

    let node = h.node(&standby.id).await.unwrap();
    assert_eq!(node.sync_status(), SyncStatus::Ready);
    assert_eq!(h.step(&standby.id).await.as_deref(), Some("wait"));
}

#[tokio::test]
async fn test_sync_standbys_wait_for_synchronous_replication() {
    let h = &Harness::new().await;
    h.cloud.respond_to_query(None, "sync_state", "async").await;
    let resource = h.create_cluster("orders", HaType::Sync).await;
    let primary = h.primary(&resource.id).await;
    h.cloud
        .respond_to_query(Some(&primary.vm_name), "pg_current_wal_lsn", "0/5500000")
        .await;

    let resource_id = &resource.id;
    h.run_until("standbys added", 500, || async move {
        standbys(h, resource_id).await.len() == 2
    })
    .await;
    for standby in standbys(h, resource_id).await {
        h.cloud
            .respond_to_query(Some(&standby.vm_name), "pg_last_wal_replay_lsn", "0/0")
            .await;
    }

    standbys_reach(h, resource_id, "wait_catch_up").await;
    h.run_for(5 * 60).await;
    for standby in standbys(h, resource_id).await {
        assert_eq!(h.step(&standby.id).await.as_deref(), Some("wait_catch_up"));
    }

    for standby in standbys(h, resource_id).await {
        h.cloud
            .respond_to_query(Some(&standby.vm_name), "pg_last_wal_replay_lsn", "0/4B00000")
            .await;
    }
    standbys_reach(h, resource_id, "wait_synchronization").await;

    // Caught up is not enough while the primary reports them as async.
    h.run_for(5 * 60).await;
    for standby in standbys(h, resource_id).await {
        assert_eq!(h.step(&standby.id).await.as_deref(), Some("wait_synchronization"));
        assert_eq!(standby.sync_status(), SyncStatus::CatchingUp);
    }

    h.cloud.respond_to_query(None, "sync_state", "quorum").await;
    h.wait_running(resource_id, 3).await;
    for standby in standbys(h, resource_id).await {
        assert_eq!(standby.sync_status(), SyncStatus::Ready);
    }
}
