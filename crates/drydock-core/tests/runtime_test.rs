// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker test: the runtime drives processes without manual ticks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use drydock_core::persistence::{Persistence, SqlitePersistence};
use drydock_core::runtime::EngineRuntime;
use drydock_core::worker::WorkerConfig;
use drydock_core::{NewProcess, Program, ProgramRegistry, StepContext, Transition};

struct TwoStep;

#[async_trait]
impl Program for TwoStep {
    fn name(&self) -> &'static str {
        "two_step"
    }

    async fn run_step(&self, step: &str, _cx: &mut StepContext<'_>) -> anyhow::Result<Transition> {
        match step {
            "start" => Ok(Transition::advance("finish")),
            "finish" => Ok(Transition::finish(json!({ "done": true }))),
            other => anyhow::bail!("unknown step {other}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_runtime_runs_process_to_exit() {
    let dir = tempfile::tempdir().unwrap();
    let persistence = Arc::new(
        SqlitePersistence::from_path(dir.path().join("engine.db"))
            .await
            .unwrap(),
    );

    let mut registry = ProgramRegistry::new();
    registry.register(Arc::new(TwoStep));

    let config = EngineRuntime::builder()
        .persistence(persistence.clone())
        .registry(registry)
        .worker(WorkerConfig {
            poll_interval: Duration::from_millis(10),
            batch_size: 8,
            max_concurrent: 2,
        })
        .build()
        .unwrap();

    let engine = config.engine().clone();
    engine
        .create_process(NewProcess::new("p-1", "two_step", engine.now()))
        .await
        .unwrap();

    let runtime = config.start().await.unwrap();
    assert!(runtime.is_running());

    let exited = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let record = persistence.get_process("p-1").await.unwrap().unwrap();
            if record.exited {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("process should exit");

    assert_eq!(
        exited.exit_value_json().unwrap(),
        Some(json!({ "done": true }))
    );

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_runtime_refuses_to_start_without_database() {
    let persistence = Arc::new(SqlitePersistence::in_memory().await.unwrap());
    assert!(persistence.health_check_db().await.unwrap());
    persistence.pool().close().await;

    let config = EngineRuntime::builder()
        .persistence(persistence)
        .registry(ProgramRegistry::new())
        .build()
        .unwrap();

    assert!(config.start().await.is_err());
}
