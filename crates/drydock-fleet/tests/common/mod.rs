// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for drydock-fleet machine tests.
//!
//! One in-memory database shared by the engine and the fleet store, a manual
//! clock, and an in-memory cloud standing in for every collaborator.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use drydock_core::persistence::{Persistence, ProcessRecord, SqlitePersistence};
use drydock_core::{Clock, Engine, ManualClock, ProgramRegistry};
use drydock_fleet::assembly::ClusterRequest;
use drydock_fleet::collab::{Collaborators, InMemoryCloud};
use drydock_fleet::config::FleetConfig;
use drydock_fleet::model::{DisplayState, HaType, NodeRecord, ResourceRecord};
use drydock_fleet::programs::{self, doctor};
use drydock_fleet::{Fleet, FleetService, store};

/// Seconds the clock moves between polls.
pub const STEP_SECS: i64 = 5;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 4, 1, 9, 0, 0).unwrap()
}

pub struct Harness {
    pub engine: Arc<Engine>,
    pub clock: Arc<ManualClock>,
    pub cloud: Arc<InMemoryCloud>,
    pub fleet: Arc<Fleet>,
    pub service: FleetService,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(FleetConfig::default()).await
    }

    pub async fn with_config(config: FleetConfig) -> Self {
        let persistence = Arc::new(
            SqlitePersistence::in_memory()
                .await
                .expect("in-memory database"),
        );
        let pool = persistence.pool().clone();
        store::apply_schema(&pool).await.expect("fleet schema");
        doctor::seed_system_queries(&pool, t0())
            .await
            .expect("seed health checks");

        let clock = Arc::new(ManualClock::new(t0()));
        let cloud = Arc::new(InMemoryCloud::new());
        let fleet = Arc::new(Fleet::new(
            pool,
            Collaborators::in_memory(cloud.clone()),
            config,
        ));

        let mut registry = ProgramRegistry::new();
        programs::register(&mut registry, fleet.clone());
        let engine = Arc::new(
            Engine::new(persistence, registry, clock.clone()).with_worker_id("test-worker"),
        );
        let service = FleetService::new(engine.clone(), fleet.clone());

        Self {
            engine,
            clock,
            cloud,
            fleet,
            service,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn tick(&self) -> usize {
        self.engine.run_due(100).await.expect("run due")
    }

    /// Poll, then move the clock, until `done` holds. Panics after `max_rounds`.
    pub async fn run_until<F, Fut>(&self, what: &str, max_rounds: usize, mut done: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..max_rounds {
            self.tick().await;
            if done().await {
                return;
            }
            self.clock.advance(Duration::seconds(STEP_SECS));
        }
        panic!("{what}: not reached within {max_rounds} rounds");
    }

    /// Poll for `secs` of simulated time.
    pub async fn run_for(&self, secs: i64) {
        for _ in 0..(secs / STEP_SECS).max(1) {
            self.tick().await;
            self.clock.advance(Duration::seconds(STEP_SECS));
        }
    }

    pub async fn create_cluster(&self, name: &str, ha: HaType) -> ResourceRecord {
        self.service
            .create_cluster(ClusterRequest::new("org-1", name, "us-central1").ha(ha))
            .await
            .expect("create cluster")
    }

    /// Run until the cluster has `count` nodes, all running, and its
    /// processes are parked.
    pub async fn wait_running(&self, resource_id: &str, count: usize) {
        self.run_until("cluster running", 2_000, || async move {
            let nodes = self.nodes(resource_id).await;
            nodes.len() == count
                && nodes.iter().all(|n| n.display() == DisplayState::Running)
                && self.step(resource_id).await.as_deref() == Some("wait")
        })
        .await;
    }

    pub async fn nodes(&self, resource_id: &str) -> Vec<NodeRecord> {
        store::nodes::list_for_resource(&self.fleet.pool, resource_id)
            .await
            .expect("list nodes")
    }

    pub async fn primary(&self, resource_id: &str) -> NodeRecord {
        store::nodes::representative(&self.fleet.pool, resource_id)
            .await
            .expect("query primary")
            .expect("cluster has a primary")
    }

    pub async fn node(&self, id: &str) -> Option<NodeRecord> {
        store::nodes::get(&self.fleet.pool, id)
            .await
            .expect("get node")
    }

    pub async fn process(&self, id: &str) -> Option<ProcessRecord> {
        self.engine
            .persistence()
            .get_process(id)
            .await
            .expect("get process")
    }

    /// Current step of a live process.
    pub async fn step(&self, id: &str) -> Option<String> {
        self.process(id)
            .await
            .filter(|p| !p.exited)
            .map(|p| p.step)
    }
}
