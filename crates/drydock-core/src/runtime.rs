// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for drydock-core.
//!
//! [`EngineRuntime`] wires an [`Engine`] to a background [`Worker`] so an
//! existing tokio application can drive processes.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use drydock_core::persistence::SqlitePersistence;
//! use drydock_core::program::ProgramRegistry;
//! use drydock_core::runtime::EngineRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::from_path(".data/drydock.db").await?);
//!     let mut registry = ProgramRegistry::new();
//!     // registry.register(...);
//!
//!     let runtime = EngineRuntime::builder()
//!         .persistence(persistence)
//!         .registry(registry)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::clock::{Clock, SystemClock};
use crate::engine::{DEFAULT_LEASE, Engine};
use crate::persistence::Persistence;
use crate::program::ProgramRegistry;
use crate::worker::{Worker, WorkerConfig};

/// Builder for creating an [`EngineRuntime`].
pub struct EngineRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    registry: ProgramRegistry,
    clock: Arc<dyn Clock>,
    worker: WorkerConfig,
    lease_duration: Duration,
    worker_id: Option<String>,
}

impl std::fmt::Debug for EngineRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("registry", &self.registry)
            .field("worker", &self.worker)
            .field("lease_duration", &self.lease_duration)
            .finish()
    }
}

impl Default for EngineRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            registry: ProgramRegistry::new(),
            clock: Arc::new(SystemClock),
            worker: WorkerConfig::default(),
            lease_duration: DEFAULT_LEASE,
            worker_id: None,
        }
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the programs the engine can run.
    pub fn registry(mut self, registry: ProgramRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Set the clock. Default: wall clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set worker polling options.
    pub fn worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    /// Set the process lease duration.
    ///
    /// Default: 120 seconds
    pub fn lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    /// Set a stable worker id (useful when several daemons share a database).
    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;

        let mut engine = Engine::new(persistence, self.registry, self.clock)
            .with_lease_duration(self.lease_duration);
        if let Some(worker_id) = self.worker_id {
            engine = engine.with_worker_id(worker_id);
        }

        Ok(EngineRuntimeConfig {
            engine: Arc::new(engine),
            worker: self.worker,
        })
    }
}

/// Configuration for an [`EngineRuntime`].
#[derive(Debug)]
pub struct EngineRuntimeConfig {
    engine: Arc<Engine>,
    worker: WorkerConfig,
}

impl EngineRuntimeConfig {
    /// The engine that will be driven, for creating processes before start.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Start the runtime, spawning the worker task.
    ///
    /// Fails without spawning anything when the database does not answer.
    pub async fn start(self) -> Result<EngineRuntime> {
        if !self.engine.persistence().health_check_db().await? {
            anyhow::bail!("database health check failed");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = Worker::new(self.engine.clone(), self.worker);
        let worker_handle = tokio::spawn(worker.run(shutdown_rx));

        info!(worker_id = %self.engine.worker_id(), "EngineRuntime started");

        Ok(EngineRuntime {
            worker_handle,
            shutdown_tx,
            engine: self.engine,
        })
    }
}

/// A running engine that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct EngineRuntime {
    worker_handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    engine: Arc<Engine>,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// The engine driven by this runtime.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Gracefully shut down the runtime.
    ///
    /// In-flight invocations of the current poll finish before the worker exits.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");

        let _ = self.shutdown_tx.send(true);

        match self.worker_handle.await {
            Ok(()) => {
                info!("EngineRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("EngineRuntime worker task panicked: {}", e);
                Err(anyhow::anyhow!("worker task panicked: {}", e))
            }
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.worker_handle.is_finished()
    }
}
