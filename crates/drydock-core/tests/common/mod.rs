// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for drydock-core engine tests.
//!
//! Provides a harness with an in-memory database and a manual clock.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{Map, Value};

use drydock_core::persistence::{Persistence, ProcessRecord, SqlitePersistence};
use drydock_core::{Clock, Engine, ManualClock, NewProcess, Program, ProgramRegistry};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 4, 1, 9, 0, 0).unwrap()
}

pub struct Harness {
    pub engine: Arc<Engine>,
    pub clock: Arc<ManualClock>,
    pub persistence: Arc<SqlitePersistence>,
}

impl Harness {
    pub async fn new(programs: Vec<Arc<dyn Program>>) -> Self {
        let persistence = Arc::new(
            SqlitePersistence::in_memory()
                .await
                .expect("in-memory database"),
        );
        let clock = Arc::new(ManualClock::new(t0()));

        let mut registry = ProgramRegistry::new();
        for program in programs {
            registry.register(program);
        }

        let engine = Arc::new(
            Engine::new(persistence.clone(), registry, clock.clone()).with_worker_id("test-worker"),
        );

        Self {
            engine,
            clock,
            persistence,
        }
    }

    pub async fn create(&self, program: &str, frame: Map<String, Value>) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.engine
            .create_process(NewProcess::new(id, program, self.clock.now()).with_frame(frame))
            .await
            .expect("create process")
    }

    pub async fn tick(&self) -> usize {
        self.engine.run_due(100).await.expect("run due")
    }

    /// Advance the clock and run due processes until `id` exits.
    pub async fn run_until_exit(
        &self,
        id: &str,
        step: Duration,
        max_rounds: usize,
    ) -> ProcessRecord {
        for _ in 0..max_rounds {
            self.tick().await;
            let record = self.record(id).await;
            if record.exited {
                return record;
            }
            self.clock.advance(step);
        }
        panic!("process {id} did not exit within {max_rounds} rounds");
    }

    pub async fn record(&self, id: &str) -> ProcessRecord {
        self.persistence
            .get_process(id)
            .await
            .expect("get process")
            .expect("process exists")
    }
}
