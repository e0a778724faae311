// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! drydock Core - Durable Execution Engine
//!
//! This crate runs long-lived, crash-resumable operations expressed as small
//! step functions. Every piece of process state lives in SQLite, so a worker
//! can die at any point and another worker picks the process up where the
//! last committed transition left it.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │               Programs (state machine definitions)            │
//! │         node · resource · timeline · doctor · helpers         │
//! └───────────────────────────────────────────────────────────────┘
//!                                │ run_step / before_step
//!                                ▼
//! ┌─────────────────────┐   ┌───────────────┐   ┌────────────────┐
//! │ Worker (poll loop)  │──▶│    Engine     │──▶│  StepContext   │
//! │ lease + semaphore   │   │ one invocation│   │ frames, flags, │
//! └─────────────────────┘   └───────────────┘   │ children, ...  │
//!                                │              └────────────────┘
//!                                ▼
//!                      ┌───────────────────┐
//!                      │ SQLite persistence│
//!                      │ processes, flags  │
//!                      └───────────────────┘
//! ```
//!
//! # Transition primitives
//!
//! | Primitive | Effect |
//! |-----------|--------|
//! | `advance(step)` | Change step, due immediately |
//! | `sleep_and_retry(s)` | Keep step, due in `s` seconds |
//! | `call(program, frame)` | Push a frame; resume the caller step on return |
//! | `return(value)` | Pop a frame; exit when no frame remains |
//! | `spawn_child` | Create a child process at commit |
//! | `harvest_children` | Detach exited children and read their values |
//! | `is_leaf` | No running child remains |
//! | `yield_to_children` | Run one invocation of each due child now |
//! | `set_deadline` | Watchdog reported through program hooks |
//!
//! # Process Lifecycle
//!
//! ```text
//!   create ──▶ due ──lease──▶ running ──commit──▶ due (later) ──▶ ...
//!                               │
//!                               ├── step error ──▶ halted until lease expiry
//!                               │
//!                               └── return with empty stack ──▶ exited
//! ```
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `DRYDOCK_DATABASE_URL` | Yes | - | SQLite connection string |
//! | `DRYDOCK_POLL_INTERVAL_MS` | No | `1000` | Worker poll interval |
//! | `DRYDOCK_BATCH_SIZE` | No | `32` | Due processes per poll |
//! | `DRYDOCK_LEASE_SECS` | No | `120` | Process lease duration |
//! | `DRYDOCK_MAX_CONCURRENT_PROCESSES` | No | `16` | Concurrent invocations |

#![deny(missing_docs)]

/// Time sources.
pub mod clock;

/// Engine configuration loaded from environment variables.
pub mod config;

/// Per-invocation step context.
pub mod context;

/// Invocation runner.
pub mod engine;

/// Error types for engine operations.
pub mod error;

/// Embedded SQLite migrations.
pub mod migrations;

/// Persistence layer for processes and signal flags.
pub mod persistence;

/// Frames, transitions, deadlines.
pub mod process;

/// Program trait and registry.
pub mod program;

/// Embeddable runtime with a background worker.
pub mod runtime;

/// Polling worker.
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{HarvestedChild, StepContext};
pub use engine::{Engine, RunOutcome};
pub use error::{EngineError, Result};
pub use process::{Frame, NewProcess, Transition, frame_of};
pub use program::{Program, ProgramRegistry};
