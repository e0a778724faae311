// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Polling worker.
//!
//! Periodically selects due processes and runs one invocation of each,
//! bounded by a concurrency limit. Several workers (in one or many OS
//! processes) may poll the same database; leases keep them apart.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::engine::{Engine, RunOutcome};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to poll for due processes
    pub poll_interval: Duration,
    /// Maximum processes fetched per poll
    pub batch_size: i64,
    /// Maximum invocations running at once
    pub max_concurrent: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 32,
            max_concurrent: 16,
        }
    }
}

impl From<&crate::config::Config> for WorkerConfig {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            poll_interval: config.poll_interval,
            batch_size: config.batch_size,
            max_concurrent: config.max_concurrent_processes,
        }
    }
}

/// Worker that runs as a background task.
pub struct Worker {
    engine: Arc<Engine>,
    config: WorkerConfig,
    permits: Arc<Semaphore>,
}

impl Worker {
    /// Create a worker.
    pub fn new(engine: Arc<Engine>, config: WorkerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            engine,
            config,
            permits,
        }
    }

    /// Run the polling loop until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker_id = %self.engine.worker_id(),
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Worker shutting down");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Failed to poll due processes");
                    }
                }
            }
        }
    }

    /// One poll: run every due process once and wait for all of them.
    pub async fn tick(&self) -> crate::error::Result<usize> {
        let due = self
            .engine
            .persistence()
            .list_due_processes(self.engine.now(), self.config.batch_size)
            .await?;

        if due.is_empty() {
            return Ok(0);
        }
        debug!(count = due.len(), "Running due processes");

        let mut tasks = JoinSet::new();
        for process_id in due {
            let engine = self.engine.clone();
            let permits = self.permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok()?;
                match engine.run_process(&process_id).await {
                    Ok(RunOutcome::Skipped) => None,
                    Ok(outcome) => Some(outcome),
                    Err(e) => {
                        error!(process_id = %process_id, error = %e, "Invocation failed");
                        None
                    }
                }
            });
        }

        let mut ran = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(_)) => ran += 1,
                Ok(None) => {}
                Err(e) => error!(error = %e, "Invocation task panicked"),
            }
        }
        Ok(ran)
    }
}
