// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Programs: named state machines whose steps the engine dispatches.
//!
//! A program maps the step name stored on a process to a body. Bodies are
//! expected to parse the name into their own step enum and `match` on it, so
//! an unknown step is an ordinary error instead of a silent no-op.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::context::StepContext;
use crate::process::{DESTROY_SIGNAL, DESTROY_STEP, Deadline, Transition};

/// A state machine definition.
#[async_trait]
pub trait Program: Send + Sync + 'static {
    /// Name stored on processes running this program.
    fn name(&self) -> &'static str;

    /// Runs before every step body. Returning a transition skips the body.
    ///
    /// The default is the destroy interrupt.
    async fn before_step(&self, cx: &mut StepContext<'_>) -> anyhow::Result<Option<Transition>> {
        destroy_interrupt(cx).await
    }

    /// Run one step.
    async fn run_step(&self, step: &str, cx: &mut StepContext<'_>) -> anyhow::Result<Transition>;

    /// Called once when a deadline expires before its target was reached.
    async fn deadline_passed(
        &self,
        cx: &mut StepContext<'_>,
        deadline: &Deadline,
    ) -> anyhow::Result<()> {
        warn!(
            process_id = %cx.id(),
            program = self.name(),
            target = ?deadline.target,
            "Deadline passed"
        );
        Ok(())
    }

    /// Called when a process reaches the target of a deadline it had missed.
    async fn deadline_met(
        &self,
        cx: &mut StepContext<'_>,
        deadline: &Deadline,
    ) -> anyhow::Result<()> {
        info!(
            process_id = %cx.id(),
            program = self.name(),
            target = ?deadline.target,
            "Late deadline target reached"
        );
        Ok(())
    }
}

/// Redirect to `destroy` when the destroy flag is set.
pub async fn destroy_interrupt(cx: &mut StepContext<'_>) -> anyhow::Result<Option<Transition>> {
    if cx.step() != DESTROY_STEP && cx.is_signaled(DESTROY_SIGNAL).await? {
        return Ok(Some(Transition::advance(DESTROY_STEP)));
    }
    Ok(None)
}

/// Programs by name.
#[derive(Default, Clone)]
pub struct ProgramRegistry {
    programs: HashMap<&'static str, Arc<dyn Program>>,
}

impl std::fmt::Debug for ProgramRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.programs.keys().collect();
        names.sort();
        f.debug_struct("ProgramRegistry")
            .field("programs", &names)
            .finish()
    }
}

impl ProgramRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a program under its own name, replacing any previous one.
    pub fn register(&mut self, program: Arc<dyn Program>) -> &mut Self {
        self.programs.insert(program.name(), program);
        self
    }

    /// Look a program up.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Program>> {
        self.programs.get(name).cloned()
    }

    /// Whether a program is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.programs.contains_key(name)
    }
}
