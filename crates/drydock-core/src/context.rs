// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The handle a step body works through during one invocation.
//!
//! Reads (frame locals, flags, children) go straight to the process snapshot
//! or the database. Structural changes (new children, harvested children,
//! deadlines, frame locals) are buffered here and committed by the engine
//! together with the step's [`Transition`], so a crash mid-step leaves the
//! process exactly as it was before the invocation started.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::engine::{Engine, RunOutcome, to_chrono};
use crate::error::{EngineError, Result};
use crate::persistence::{InvocationCommit, ProcessRecord};
use crate::process::{Continuation, DEFAULT_ENTRY, Deadline, Frame, NewProcess, Transition};

/// A child that reached its terminal state and was detached from its parent.
#[derive(Debug, Clone, PartialEq)]
pub struct HarvestedChild {
    /// Child process id.
    pub id: String,
    /// Program the child was spawned with.
    pub program: String,
    /// Value the child exited with.
    pub exit_value: Option<Value>,
}

/// Per-invocation view of a process.
pub struct StepContext<'a> {
    engine: &'a Engine,
    id: String,
    program: String,
    step: String,
    stack: Vec<Frame>,
    now: DateTime<Utc>,
    retval: Option<Value>,
    deadline: Option<Deadline>,
    spawned: Vec<NewProcess>,
    harvested: Vec<String>,
}

impl std::fmt::Debug for StepContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("id", &self.id)
            .field("program", &self.program)
            .field("step", &self.step)
            .field("depth", &self.stack.len())
            .finish()
    }
}

impl<'a> StepContext<'a> {
    pub(crate) fn load(
        engine: &'a Engine,
        record: &ProcessRecord,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let stack = record.frames()?;
        if stack.is_empty() {
            return Err(EngineError::InvalidTransition {
                process_id: record.id.clone(),
                reason: "process has an empty stack".to_string(),
            });
        }

        Ok(Self {
            engine,
            id: record.id.clone(),
            program: record.program.clone(),
            step: record.step.clone(),
            stack,
            now,
            retval: record.retval_json()?,
            deadline: record.deadline(),
            spawned: Vec::new(),
            harvested: Vec::new(),
        })
    }

    /// Process id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Program of the active frame.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Program of the root frame, the one that owns the process.
    pub fn root_program(&self) -> &str {
        self.stack
            .first()
            .map(|f| f.program.as_str())
            .unwrap_or(&self.program)
    }

    /// Step being run.
    pub fn step(&self) -> &str {
        &self.step
    }

    /// Invocation start time.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// The engine running this invocation.
    pub fn engine(&self) -> &'a Engine {
        self.engine
    }

    /// Nesting depth of the call stack.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    // -- frame locals --

    /// Locals of the active frame.
    pub fn frame(&self) -> &Map<String, Value> {
        // `load` rejects empty stacks and nothing pops during an invocation.
        static EMPTY: std::sync::OnceLock<Map<String, Value>> = std::sync::OnceLock::new();
        self.stack
            .last()
            .map(|f| &f.locals)
            .unwrap_or_else(|| EMPTY.get_or_init(Map::new))
    }

    /// A typed local of the active frame.
    pub fn local<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.frame()
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Set a local of the active frame. Persisted with the transition.
    pub fn set_local(&mut self, key: &str, value: impl Serialize) -> Result<()> {
        let value = serde_json::to_value(value)?;
        if let Some(frame) = self.stack.last_mut() {
            frame.locals.insert(key.to_string(), value);
        }
        Ok(())
    }

    /// Remove a local of the active frame.
    pub fn remove_local(&mut self, key: &str) {
        if let Some(frame) = self.stack.last_mut() {
            frame.locals.remove(key);
        }
    }

    /// Value handed back by the frame that just returned into this step.
    /// Visible to this invocation only.
    pub fn retval(&self) -> Option<&Value> {
        self.retval.as_ref()
    }

    // -- signal flags --

    /// Pending requests on one of this process's flags.
    pub async fn signal_count(&self, name: &str) -> Result<i64> {
        self.engine.persistence().signal_count(&self.id, name).await
    }

    /// Whether a flag is set.
    pub async fn is_signaled(&self, name: &str) -> Result<bool> {
        Ok(self.signal_count(name).await? > 0)
    }

    /// Handle one request on a flag.
    pub async fn decr_signal(&self, name: &str) -> Result<i64> {
        self.engine
            .persistence()
            .decr_signal(&self.id, name, self.now)
            .await
    }

    /// Drop every request on a flag.
    pub async fn clear_signal(&self, name: &str) -> Result<()> {
        self.engine.persistence().clear_signal(&self.id, name).await
    }

    /// Raise a flag on this process.
    pub async fn incr_signal(&self, name: &str) -> Result<i64> {
        self.engine
            .persistence()
            .incr_signal(&self.id, name, self.now)
            .await
    }

    /// Raise a flag on another process.
    pub async fn signal(&self, process_id: &str, name: &str) -> Result<i64> {
        self.engine
            .persistence()
            .incr_signal(process_id, name, self.now)
            .await
    }

    // -- children --

    /// `spawn_child(program, frame)` entering at `start`.
    pub fn spawn_child(&mut self, program: &str, frame: Map<String, Value>) -> String {
        self.spawn_child_at(program, frame, DEFAULT_ENTRY)
    }

    /// `spawn_child(program, frame, entry)`. The child is created when this
    /// invocation commits.
    pub fn spawn_child_at(
        &mut self,
        program: &str,
        frame: Map<String, Value>,
        entry: &str,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let mut child = NewProcess::new(id.clone(), program, self.now)
            .with_frame(frame)
            .with_entry(entry);
        child.parent_id = Some(self.id.clone());
        debug!(process_id = %self.id, child_id = %id, program, "Spawning child");
        self.spawned.push(child);
        id
    }

    /// Collect exited children. They are detached when this invocation commits.
    pub async fn harvest_children(&mut self) -> Result<Vec<HarvestedChild>> {
        let already: HashSet<String> = self.harvested.iter().cloned().collect();
        let mut reaped = Vec::new();

        for child in self.engine.persistence().list_children(&self.id).await? {
            if !child.exited || already.contains(&child.id) {
                continue;
            }
            reaped.push(HarvestedChild {
                exit_value: child.exit_value_json()?,
                id: child.id.clone(),
                program: child.frames_root_program(),
            });
            self.harvested.push(child.id);
        }

        Ok(reaped)
    }

    /// True when no spawned child is still running.
    pub async fn is_leaf(&self) -> Result<bool> {
        if !self.spawned.is_empty() {
            return Ok(false);
        }
        let children = self.engine.persistence().list_children(&self.id).await?;
        Ok(children.iter().all(|c| c.exited))
    }

    /// Run one invocation of each due, running child. Returns how many ran.
    pub async fn yield_to_children(&mut self) -> Result<usize> {
        let engine = self.engine;
        let mut ran = 0;

        for child in engine.persistence().list_children(&self.id).await? {
            if child.exited || child.due_at > engine.now() {
                continue;
            }
            match engine.run_process(&child.id).await? {
                RunOutcome::Skipped => {}
                _ => ran += 1,
            }
        }

        Ok(ran)
    }

    // -- deadlines --

    /// `set_deadline(step_or_none, seconds)`, replacing any previous one.
    pub fn set_deadline(&mut self, target: Option<&str>, seconds: u64) {
        self.deadline = Some(Deadline {
            target: target.map(str::to_string),
            at: self.now + chrono::Duration::seconds(seconds as i64),
            fired: false,
        });
    }

    /// Drop the registered deadline.
    pub fn clear_deadline(&mut self) {
        self.deadline = None;
    }

    /// The registered deadline.
    pub fn deadline(&self) -> Option<&Deadline> {
        self.deadline.as_ref()
    }

    pub(crate) fn mark_deadline_fired(&mut self) {
        if let Some(deadline) = self.deadline.as_mut() {
            deadline.fired = true;
        }
    }

    /// Apply `transition` to the snapshot and produce the commit.
    pub(crate) fn into_commit(
        mut self,
        transition: Transition,
        lease_owner: &str,
    ) -> Result<InvocationCommit> {
        let mut due_at = self.now;
        let mut retval = None;
        let mut exit_value = None;

        match transition {
            Transition::Advance(step) => {
                if self.deadline.as_ref().is_some_and(|d| d.is_met_by(&step)) {
                    self.deadline = None;
                }
                self.step = step;
            }
            Transition::Sleep(delay) => {
                due_at = self.now + to_chrono(delay);
            }
            Transition::Call {
                program,
                frame,
                entry,
                resume,
            } => {
                let resume_step = resume.unwrap_or_else(|| self.step.clone());
                self.stack.push(Frame {
                    program: program.clone(),
                    locals: frame,
                    resume: Some(Continuation {
                        program: self.program.clone(),
                        step: resume_step,
                    }),
                });
                self.program = program;
                self.step = entry;
            }
            Transition::Return(value) => {
                let popped = self.stack.pop();
                match popped.and_then(|f| f.resume) {
                    Some(continuation) if !self.stack.is_empty() => {
                        self.program = continuation.program;
                        self.step = continuation.step;
                        retval = Some(value);
                    }
                    Some(_) => {
                        return Err(EngineError::InvalidTransition {
                            process_id: self.id.clone(),
                            reason: "continuation without a frame to resume".to_string(),
                        });
                    }
                    None if self.stack.is_empty() => {
                        exit_value = Some(value);
                        self.deadline = None;
                    }
                    None => {
                        return Err(EngineError::InvalidTransition {
                            process_id: self.id.clone(),
                            reason: "returned from a frame with no continuation".to_string(),
                        });
                    }
                }
            }
        }

        Ok(InvocationCommit {
            process_id: self.id,
            lease_owner: lease_owner.to_string(),
            program: self.program,
            step: self.step,
            stack: self.stack,
            due_at,
            retval,
            exit_value,
            deadline: self.deadline,
            spawned: self.spawned,
            harvested: self.harvested,
            now: self.now,
        })
    }
}

impl ProcessRecord {
    /// Program of the root frame, falling back to the active program.
    fn frames_root_program(&self) -> String {
        self.frames()
            .ok()
            .and_then(|frames| frames.first().map(|f| f.program.clone()))
            .unwrap_or_else(|| self.program.clone())
    }
}
