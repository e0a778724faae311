// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process state that is not a database row: frames, transitions, deadlines.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Step every program starts at unless told otherwise.
pub const DEFAULT_ENTRY: &str = "start";

/// Step the destroy interrupt redirects to.
pub const DESTROY_STEP: &str = "destroy";

/// Signal flag observed by the destroy interrupt.
pub const DESTROY_SIGNAL: &str = "destroy";

/// Where to resume once a called frame returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Continuation {
    /// Program of the frame below.
    pub program: String,
    /// Step to run in that program.
    pub step: String,
}

/// One level of the in-process call stack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Program this frame belongs to.
    pub program: String,
    /// Named local values.
    #[serde(default)]
    pub locals: Map<String, Value>,
    /// Set on every frame pushed by `call`; the root frame has none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<Continuation>,
}

impl Frame {
    /// Root frame for a freshly created process.
    pub fn root(program: impl Into<String>, locals: Map<String, Value>) -> Self {
        Self {
            program: program.into(),
            locals,
            resume: None,
        }
    }
}

/// What a step body asks the engine to do once it finishes.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Move to another step and run it as soon as possible.
    Advance(String),
    /// Stay on the current step and run it again after the delay.
    Sleep(Duration),
    /// Push a frame and continue in `program` at `entry`.
    Call {
        /// Program to run in the new frame.
        program: String,
        /// Locals for the new frame.
        frame: Map<String, Value>,
        /// First step of the callee.
        entry: String,
        /// Caller step to resume at. Defaults to the calling step.
        resume: Option<String>,
    },
    /// Pop the active frame, handing `value` to the frame below or
    /// finishing the process when nothing is below.
    Return(Value),
}

impl Transition {
    /// `advance(step)`
    pub fn advance(step: impl AsRef<str>) -> Self {
        Self::Advance(step.as_ref().to_string())
    }

    /// `sleep_and_retry(seconds)`
    pub fn sleep(seconds: u64) -> Self {
        Self::Sleep(Duration::from_secs(seconds))
    }

    /// `call(program, frame)` entering at `start` and resuming at the calling step.
    pub fn call(program: impl Into<String>, frame: Map<String, Value>) -> Self {
        Self::Call {
            program: program.into(),
            frame,
            entry: DEFAULT_ENTRY.to_string(),
            resume: None,
        }
    }

    /// `call` with an explicit caller step to resume at.
    pub fn call_then(
        program: impl Into<String>,
        frame: Map<String, Value>,
        resume: impl AsRef<str>,
    ) -> Self {
        Self::Call {
            program: program.into(),
            frame,
            entry: DEFAULT_ENTRY.to_string(),
            resume: Some(resume.as_ref().to_string()),
        }
    }

    /// `return(value)`
    pub fn finish(value: Value) -> Self {
        Self::Return(value)
    }

    /// Return a `{"msg": ...}` object, the usual terminal value of a machine.
    pub fn finish_with_msg(msg: &str) -> Self {
        Self::Return(serde_json::json!({ "msg": msg }))
    }
}

/// Watchdog on a process. `target: None` means the process must exit.
#[derive(Debug, Clone, PartialEq)]
pub struct Deadline {
    /// Step that must be reached before `at`.
    pub target: Option<String>,
    /// Expiry.
    pub at: DateTime<Utc>,
    /// Whether the miss has already been reported.
    pub fired: bool,
}

impl Deadline {
    /// Whether the deadline has passed at `now` and has not been reported.
    pub fn is_missed(&self, now: DateTime<Utc>) -> bool {
        !self.fired && now >= self.at
    }

    /// Whether advancing to `step` satisfies this deadline.
    pub fn is_met_by(&self, step: &str) -> bool {
        self.target.as_deref() == Some(step)
    }
}

/// Everything needed to insert a process.
#[derive(Debug, Clone)]
pub struct NewProcess {
    /// Process id. Domain entities reuse their own id.
    pub id: String,
    /// Program name as registered.
    pub program: String,
    /// Entry step.
    pub step: String,
    /// Locals of the root frame.
    pub frame: Map<String, Value>,
    /// Parent for spawned children.
    pub parent_id: Option<String>,
    /// First run time.
    pub due_at: DateTime<Utc>,
}

impl NewProcess {
    /// A root process entering at `start`, due immediately.
    pub fn new(id: impl Into<String>, program: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            program: program.into(),
            step: DEFAULT_ENTRY.to_string(),
            frame: Map::new(),
            parent_id: None,
            due_at: now,
        }
    }

    /// Set root frame locals.
    pub fn with_frame(mut self, frame: Map<String, Value>) -> Self {
        self.frame = frame;
        self
    }

    /// Set the entry step.
    pub fn with_entry(mut self, step: impl AsRef<str>) -> Self {
        self.step = step.as_ref().to_string();
        self
    }

    /// The initial stack.
    pub fn stack(&self) -> Vec<Frame> {
        vec![Frame::root(self.program.clone(), self.frame.clone())]
    }
}

/// Build a frame map from `json!({...})`. Non-objects yield an empty frame.
pub fn frame_of(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
