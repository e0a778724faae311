// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The invocation runner.
//!
//! [`Engine::run_process`] performs exactly one invocation of one process:
//!
//! 1. take the lease (skipped if the process is not due, leased or exited)
//! 2. report a missed deadline to the program, once
//! 3. run the program's pre-step hook, then the step body unless the hook
//!    already produced a transition
//! 4. apply the transition and commit it with spawned/harvested children
//!
//! A failing step body is recorded on the process and leaves everything else,
//! including the lease, untouched. The process runs again once the lease
//! expires.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{Instrument, debug, error, info_span};
use uuid::Uuid;

use crate::clock::Clock;
use crate::context::StepContext;
use crate::error::{EngineError, Result};
use crate::persistence::{Persistence, ProcessRecord};
use crate::process::{NewProcess, Transition};
use crate::program::{Program, ProgramRegistry};

/// Default lease held on a process while it runs.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(120);

/// Result of [`Engine::run_process`].
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Not due, leased elsewhere, exited or gone.
    Skipped,
    /// The invocation committed.
    Committed {
        /// Program after the transition.
        program: String,
        /// Step after the transition.
        step: String,
        /// Whether the process exited.
        exited: bool,
    },
    /// The step failed and the process is halted until its lease expires.
    Halted(String),
}

/// Boxed future returned by [`Engine::run_process`]; boxing lets a step run
/// its children through the same entry point.
pub type RunFuture<'a> = Pin<Box<dyn Future<Output = Result<RunOutcome>> + Send + 'a>>;

/// Runs process invocations against a persistence backend.
pub struct Engine {
    persistence: Arc<dyn Persistence>,
    registry: ProgramRegistry,
    clock: Arc<dyn Clock>,
    worker_id: String,
    lease_duration: Duration,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("worker_id", &self.worker_id)
            .field("registry", &self.registry)
            .field("lease_duration", &self.lease_duration)
            .finish()
    }
}

impl Engine {
    /// Create an engine with a random worker id and the default lease.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        registry: ProgramRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            persistence,
            registry,
            clock,
            worker_id: format!("worker-{}", Uuid::new_v4()),
            lease_duration: DEFAULT_LEASE,
        }
    }

    /// Override the lease duration.
    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    /// Override the worker id written to leases.
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Persistence backend.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// Registered programs.
    pub fn registry(&self) -> &ProgramRegistry {
        &self.registry
    }

    /// Current time according to the engine clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Lease owner id of this engine.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Create a process. The program must be registered.
    pub async fn create_process(&self, process: NewProcess) -> Result<String> {
        if !self.registry.contains(&process.program) {
            return Err(EngineError::UnknownProgram {
                program: process.program,
            });
        }
        self.persistence
            .create_process(&process, self.clock.now())
            .await?;
        debug!(process_id = %process.id, program = %process.program, "Process created");
        Ok(process.id)
    }

    /// Load a process or fail with `ProcessNotFound`.
    pub async fn process(&self, process_id: &str) -> Result<ProcessRecord> {
        self.persistence
            .get_process(process_id)
            .await?
            .ok_or_else(|| EngineError::ProcessNotFound {
                process_id: process_id.to_string(),
            })
    }

    /// Raise a flag on a process.
    pub async fn signal(&self, process_id: &str, name: &str) -> Result<i64> {
        self.process(process_id).await?;
        self.persistence
            .incr_signal(process_id, name, self.clock.now())
            .await
    }

    /// Run every due process once. Returns how many invocations happened.
    pub async fn run_due(&self, limit: i64) -> Result<usize> {
        let ids = self
            .persistence
            .list_due_processes(self.clock.now(), limit)
            .await?;

        let mut ran = 0;
        for id in ids {
            match self.run_process(&id).await {
                Ok(RunOutcome::Skipped) => {}
                Ok(_) => ran += 1,
                Err(e) => error!(process_id = %id, error = %e, "Invocation failed"),
            }
        }
        Ok(ran)
    }

    /// Perform one invocation of a process.
    pub fn run_process<'a>(&'a self, process_id: &'a str) -> RunFuture<'a> {
        Box::pin(self.invoke(process_id))
    }

    async fn invoke(&self, process_id: &str) -> Result<RunOutcome> {
        let now = self.clock.now();
        let lease_until = now + to_chrono(self.lease_duration);

        if !self
            .persistence
            .acquire_lease(process_id, &self.worker_id, now, lease_until)
            .await?
        {
            return Ok(RunOutcome::Skipped);
        }

        let Some(record) = self.persistence.get_process(process_id).await? else {
            return Ok(RunOutcome::Skipped);
        };

        let span = info_span!(
            "invocation",
            process_id = %record.id,
            program = %record.program,
            step = %record.step,
        );

        let prepared = self.prepare(&record, now);
        let result = match prepared {
            Ok((program, owner, mut cx)) => async move {
                let transition = drive(program.as_ref(), owner.as_ref(), &mut cx).await?;
                Ok::<_, anyhow::Error>(cx.into_commit(transition, &self.worker_id)?)
            }
            .instrument(span.clone())
            .await,
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(commit) => {
                self.persistence.commit_invocation(&commit).await?;
                debug!(
                    parent: &span,
                    next_program = %commit.program,
                    next_step = %commit.step,
                    due_at = %commit.due_at,
                    exited = commit.exits(),
                    "Invocation committed"
                );
                Ok(RunOutcome::Committed {
                    exited: commit.exits(),
                    program: commit.program,
                    step: commit.step,
                })
            }
            Err(e) => {
                let message = format!("{e:#}");
                error!(parent: &span, error = %message, "Step failed; process halted");
                self.persistence
                    .record_step_error(process_id, &message, now)
                    .await?;
                Ok(RunOutcome::Halted(message))
            }
        }
    }

    fn prepare<'a>(
        &'a self,
        record: &ProcessRecord,
        now: DateTime<Utc>,
    ) -> Result<(Arc<dyn Program>, Arc<dyn Program>, StepContext<'a>)> {
        let lookup = |name: &str| {
            self.registry
                .get(name)
                .ok_or_else(|| EngineError::UnknownProgram {
                    program: name.to_string(),
                })
        };
        let cx = StepContext::load(self, record, now)?;
        let program = lookup(&record.program)?;
        let owner = lookup(cx.root_program())?;
        Ok((program, owner, cx))
    }
}

/// Deadline check, pre-step hook, step body.
///
/// Deadlines belong to the process, so their hooks go to `owner`, the program
/// of the root frame, even while a called program is active.
async fn drive(
    program: &dyn Program,
    owner: &dyn Program,
    cx: &mut StepContext<'_>,
) -> anyhow::Result<Transition> {
    if let Some(deadline) = cx.deadline().cloned()
        && deadline.is_missed(cx.now())
    {
        owner.deadline_passed(cx, &deadline).await?;
        cx.mark_deadline_fired();
    }

    let transition = match program.before_step(cx).await? {
        Some(transition) => transition,
        None => {
            let step = cx.step().to_string();
            program.run_step(&step, cx).await?
        }
    };

    if let Transition::Advance(next) = &transition
        && let Some(deadline) = cx.deadline().cloned()
        && deadline.fired
        && deadline.is_met_by(next)
    {
        owner.deadline_met(cx, &deadline).await?;
    }

    Ok(transition)
}

/// Longest delay the engine schedules; keeps `now + delay` from overflowing.
const MAX_DELAY_DAYS: i64 = 365 * 100;

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration)
        .unwrap_or(chrono::Duration::days(MAX_DELAY_DAYS))
        .min(chrono::Duration::days(MAX_DELAY_DAYS))
}
