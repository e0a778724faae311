// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Point-in-time forks.

mod common;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use common::Harness;
use drydock_fleet::FleetError;
use drydock_fleet::assembly::ForkRequest;
use drydock_fleet::model::{DisplayState, HaType, ResourceRecord, TimelineAccess};
use drydock_fleet::programs::timeline;
use drydock_fleet::store;

/// A running parent with one completed backup, taken an hour ago.
async fn parent_with_backup(h: &Harness) -> (ResourceRecord, DateTime<Utc>) {
    let parent = h.create_cluster("orders", HaType::None).await;
    h.wait_running(&parent.id, 1).await;

    let primary = h.primary(&parent.id).await;
    let tl = store::timelines::get(&h.fleet.pool, &primary.timeline_id)
        .await
        .unwrap()
        .unwrap();
    let completed_at = h.now() - Duration::hours(1);
    h.cloud
        .put_blob(
            &tl.bucket,
            &timeline::sentinel_key(tl.prefix(), "base_000000010000000000000002"),
            completed_at,
            json!({}),
        )
        .await;
    store::timelines::set_backup_bounds(
        &h.fleet.pool,
        &tl.id,
        Some(completed_at),
        Some(completed_at),
    )
    .await
    .unwrap();

    (parent, completed_at)
}

fn restore_target_error(err: FleetError) -> String {
    match err {
        FleetError::Validation(errors) => errors
            .get("restore_target")
            .map(str::to_string)
            .unwrap_or_else(|| panic!("no restore_target error in {errors:?}")),
        other => panic!("expected validation error, got {other}"),
    }
}

#[tokio::test]
async fn test_fork_needs_a_completed_backup() {
    let h = &Harness::new().await;
    let parent = h.create_cluster("orders", HaType::None).await;
    h.wait_running(&parent.id, 1).await;

    let err = h
        .service
        .create_fork(ForkRequest::new(&parent.id, "orders-fork", h.now()))
        .await
        .unwrap_err();
    assert!(restore_target_error(err).contains("no completed backup"));
}

#[tokio::test]
async fn test_fork_restore_target_window() {
    let h = &Harness::new().await;
    let (parent, completed_at) = parent_with_backup(h).await;

    let too_early = completed_at + Duration::minutes(1);
    let err = h
        .service
        .create_fork(ForkRequest::new(&parent.id, "orders-fork", too_early))
        .await
        .unwrap_err();
    restore_target_error(err);

    let in_future = h.now() + Duration::minutes(1);
    let err = h
        .service
        .create_fork(ForkRequest::new(&parent.id, "orders-fork", in_future))
        .await
        .unwrap_err();
    restore_target_error(err);

    // Both ends of the window are valid.
    let earliest = completed_at + Duration::minutes(5);
    let fork = h
        .service
        .create_fork(ForkRequest::new(&parent.id, "orders-fork", earliest))
        .await
        .unwrap();
    assert_eq!(fork.parent_id.as_deref(), Some(parent.id.as_str()));
    assert_eq!(fork.restore_target, Some(earliest));

    h.service
        .create_fork(ForkRequest::new(&parent.id, "orders-fork-2", h.now()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_fork_rejects_taken_name_and_smaller_disk() {
    let h = &Harness::new().await;
    let (parent, _) = parent_with_backup(h).await;

    let mut req = ForkRequest::new(&parent.id, "orders", h.now());
    req.storage_gib = Some(32);
    let err = h.service.create_fork(req).await.unwrap_err();
    let FleetError::Validation(errors) = err else {
        panic!("expected validation error, got {err}");
    };
    assert!(errors.get("name").is_some());
    assert!(errors.get("storage_gib").is_some());

    let err = h
        .service
        .create_fork(ForkRequest::new("missing", "orders-fork", h.now()))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "NOT_FOUND");
}

#[tokio::test]
async fn test_fork_recovers_onto_a_new_timeline() {
    let h = &Harness::new().await;
    let (parent, completed_at) = parent_with_backup(h).await;
    let parent_timeline = h.primary(&parent.id).await.timeline_id;

    let target = completed_at + Duration::minutes(30);
    let fork = h
        .service
        .create_fork(ForkRequest::new(&parent.id, "orders-fork", target))
        .await
        .unwrap();

    // Until recovery finishes the fork only reads the parent's lineage.
    let primary = h.primary(&fork.id).await;
    assert_eq!(primary.timeline_id, parent_timeline);
    assert_eq!(primary.access(), TimelineAccess::Fetch);

    h.wait_running(&fork.id, 1).await;

    let primary = h.primary(&fork.id).await;
    assert_eq!(primary.display(), DisplayState::Running);
    assert_eq!(primary.access(), TimelineAccess::Push);
    assert_ne!(primary.timeline_id, parent_timeline);

    let new_timeline = store::timelines::get(&h.fleet.pool, &primary.timeline_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(new_timeline.parent_id.as_deref(), Some(parent_timeline.as_str()));
    assert!(new_timeline.service_account_key.is_some());

    let restore = h
        .cloud
        .task_runs()
        .await
        .into_iter()
        .find(|r| r.task == "configure_db" && r.host == primary.vm_name)
        .and_then(|r| r.stdin)
        .unwrap();
    assert!(restore.contains("\"restore\""), "{restore}");
    assert!(restore.contains("base_000000010000000000000002"), "{restore}");

    // The parent keeps writing to its own lineage.
    let parent_primary = h.primary(&parent.id).await;
    assert_eq!(parent_primary.timeline_id, parent_timeline);
    assert_eq!(parent_primary.access(), TimelineAccess::Push);
}

#[tokio::test]
async fn test_fork_takes_over_parent_addresses_and_domain() {
    let h = &Harness::new().await;
    let (parent, completed_at) = parent_with_backup(h).await;
    h.service
        .add_domain(&parent.id, "orders.example.com")
        .await
        .unwrap();
    h.run_for(120).await;
    let parent_primary = h.primary(&parent.id).await;
    assert_eq!(
        h.cloud.dns_ip("orders.example.com").await,
        parent_primary.address_ip
    );

    // The subscription has applied everything the parent wrote.
    h.cloud
        .respond_to_query(None, "latest_end_lsn", "0/3000000")
        .await;
    let mut req = ForkRequest::new(&parent.id, "orders-next", completed_at + Duration::minutes(10));
    req.logical_replication = true;
    let fork = h.service.create_fork(req).await.unwrap();
    h.wait_running(&fork.id, 1).await;
    let fork_primary = h.primary(&fork.id).await;
    let slot = fork.logical_slot_name();

    h.service.swap_leaders_with_parent(&fork.id).await.unwrap();
    let fork_id = fork.id.as_str();
    h.run_until("addresses moving", 50, || async move {
        h.step(fork_id).await.as_deref() == Some("wait_swap_ip")
    })
    .await;

    // Both primaries are fenced and the subscription is off before the move.
    let queries = h.cloud.executed_queries().await;
    for host in [&parent_primary.vm_name, &fork_primary.vm_name] {
        assert!(
            queries
                .iter()
                .any(|q| &q.host == host && q.sql.contains("default_transaction_read_only TO on")),
            "{host} not read-only"
        );
    }
    assert!(
        queries
            .iter()
            .any(|q| q.sql.contains("DISABLE") && q.sql.contains(&slot))
    );

    // Domains stay put until the fork answers on its new address.
    h.cloud.set_unreachable(&fork_primary.vm_name, true).await;
    h.run_for(60).await;
    assert_eq!(h.step(fork_id).await.as_deref(), Some("wait_swap_ip"));
    let waiting = h.node(&parent_primary.id).await.unwrap();
    assert_eq!(waiting.domain.as_deref(), Some("orders.example.com"));

    h.cloud.set_unreachable(&fork_primary.vm_name, false).await;
    h.run_until("leaders swapped", 500, || async move {
        let resource = store::resources::get(&h.fleet.pool, fork_id)
            .await
            .unwrap()
            .unwrap();
        resource.parent_id.is_none() && h.step(fork_id).await.as_deref() == Some("wait")
    })
    .await;

    let promoted = h.node(&fork_primary.id).await.unwrap();
    assert_eq!(promoted.address_name, parent_primary.address_name);
    assert_eq!(promoted.address_ip, parent_primary.address_ip);
    assert_eq!(promoted.domain.as_deref(), Some("orders.example.com"));
    assert_eq!(
        h.cloud.dns_ip("orders.example.com").await,
        promoted.address_ip
    );

    let retired = h.node(&parent_primary.id).await.unwrap();
    assert_eq!(retired.address_name, fork_primary.address_name);
    assert_eq!(retired.domain, None);

    let queries = h.cloud.executed_queries().await;
    assert!(
        queries
            .iter()
            .any(|q| q.sql.starts_with("DROP SUBSCRIPTION") && q.sql.contains(&slot))
    );

    // Once severed it is no longer a fork.
    let err = h
        .service
        .swap_leaders_with_parent(&fork.id)
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::InvalidState(_)));
}
