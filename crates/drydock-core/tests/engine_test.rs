// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine tests: transitions, frames, children, flags, deadlines, halts.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Duration;
use serde_json::{Map, json};
use strum::{AsRefStr, EnumString};

use common::*;
use drydock_core::persistence::Persistence;
use drydock_core::process::Deadline;
use drydock_core::{Program, RunOutcome, StepContext, Transition, frame_of};

// -- counter: advance + sleep_and_retry --

#[derive(Debug, Clone, Copy, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
enum CounterStep {
    Start,
    Count,
    Done,
}

struct Counter;

#[async_trait]
impl Program for Counter {
    fn name(&self) -> &'static str {
        "counter"
    }

    async fn run_step(&self, step: &str, cx: &mut StepContext<'_>) -> anyhow::Result<Transition> {
        match step.parse::<CounterStep>()? {
            CounterStep::Start => {
                cx.set_local("n", 0)?;
                Ok(Transition::advance(CounterStep::Count))
            }
            CounterStep::Count => {
                let n: u64 = cx.local("n").unwrap_or(0) + 1;
                cx.set_local("n", n)?;
                let limit: u64 = cx.local("limit").unwrap_or(3);
                if n >= limit {
                    Ok(Transition::advance(CounterStep::Done))
                } else {
                    Ok(Transition::sleep(5))
                }
            }
            CounterStep::Done => {
                let n: u64 = cx.local("n").unwrap_or(0);
                Ok(Transition::finish(json!({ "n": n })))
            }
        }
    }
}

// -- caller/adder: call + return --

struct Caller;

#[async_trait]
impl Program for Caller {
    fn name(&self) -> &'static str {
        "caller"
    }

    async fn run_step(&self, step: &str, cx: &mut StepContext<'_>) -> anyhow::Result<Transition> {
        match step {
            "start" => Ok(Transition::call_then(
                "adder",
                frame_of(json!({ "a": 2, "b": 3 })),
                "collect",
            )),
            "collect" => {
                let sum = cx
                    .retval()
                    .and_then(|v| v.get("sum"))
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| anyhow::anyhow!("adder returned nothing"))?;
                cx.set_local("sum", sum)?;
                Ok(Transition::advance("report"))
            }
            "report" => {
                // The return value was visible to `collect` only.
                anyhow::ensure!(cx.retval().is_none(), "retval leaked into a second invocation");
                let sum: i64 = cx.local("sum").unwrap_or_default();
                Ok(Transition::finish(json!({ "sum": sum, "depth": cx.depth() })))
            }
            other => anyhow::bail!("unknown step {other}"),
        }
    }
}

struct Adder;

#[async_trait]
impl Program for Adder {
    fn name(&self) -> &'static str {
        "adder"
    }

    async fn before_step(&self, _cx: &mut StepContext<'_>) -> anyhow::Result<Option<Transition>> {
        Ok(None)
    }

    async fn run_step(&self, step: &str, cx: &mut StepContext<'_>) -> anyhow::Result<Transition> {
        anyhow::ensure!(step == "start", "unknown step {step}");
        let a: i64 = cx.local("a").unwrap_or_default();
        let b: i64 = cx.local("b").unwrap_or_default();
        Ok(Transition::finish(json!({ "sum": a + b })))
    }
}

// -- parent: spawn/harvest/is_leaf/yield --

struct Parent;

#[async_trait]
impl Program for Parent {
    fn name(&self) -> &'static str {
        "parent"
    }

    async fn run_step(&self, step: &str, cx: &mut StepContext<'_>) -> anyhow::Result<Transition> {
        match step {
            "start" => {
                cx.spawn_child("counter", frame_of(json!({ "limit": 1 })));
                cx.spawn_child("counter", frame_of(json!({ "limit": 2 })));
                anyhow::ensure!(!cx.is_leaf().await?, "fresh children must count");
                Ok(Transition::advance("wait_children"))
            }
            "wait_children" => {
                let harvested = cx.harvest_children().await?;
                let mut total: u64 = cx.local("total").unwrap_or(0);
                for child in &harvested {
                    total += child
                        .exit_value
                        .as_ref()
                        .and_then(|v| v.get("n"))
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0);
                }
                cx.set_local("total", total)?;

                if cx.is_leaf().await? {
                    return Ok(Transition::finish(json!({ "total": total })));
                }
                cx.yield_to_children().await?;
                Ok(Transition::sleep(0))
            }
            other => anyhow::bail!("unknown step {other}"),
        }
    }
}

// -- guarded: destroy interrupt --

struct Guarded;

#[async_trait]
impl Program for Guarded {
    fn name(&self) -> &'static str {
        "guarded"
    }

    async fn run_step(&self, step: &str, _cx: &mut StepContext<'_>) -> anyhow::Result<Transition> {
        match step {
            "start" => Ok(Transition::sleep(60)),
            "destroy" => Ok(Transition::finish_with_msg("destroyed")),
            other => anyhow::bail!("unknown step {other}"),
        }
    }
}

// -- late: deadlines --

struct Late;

#[async_trait]
impl Program for Late {
    fn name(&self) -> &'static str {
        "late"
    }

    async fn run_step(&self, step: &str, cx: &mut StepContext<'_>) -> anyhow::Result<Transition> {
        match step {
            "start" => {
                cx.set_deadline(Some("wait"), 30);
                Ok(Transition::advance("slow"))
            }
            "slow" => {
                let tries: u64 = cx.local("tries").unwrap_or(0) + 1;
                cx.set_local("tries", tries)?;
                if tries < 4 {
                    Ok(Transition::sleep(20))
                } else {
                    Ok(Transition::advance("wait"))
                }
            }
            "wait" => Ok(Transition::sleep(3600)),
            other => anyhow::bail!("unknown step {other}"),
        }
    }

    async fn deadline_passed(
        &self,
        cx: &mut StepContext<'_>,
        _deadline: &Deadline,
    ) -> anyhow::Result<()> {
        let misses: u64 = cx.local("misses").unwrap_or(0) + 1;
        cx.set_local("misses", misses)?;
        Ok(())
    }

    async fn deadline_met(
        &self,
        cx: &mut StepContext<'_>,
        _deadline: &Deadline,
    ) -> anyhow::Result<()> {
        cx.set_local("recovered", true)?;
        Ok(())
    }
}

// -- flaky: step errors --

struct Flaky {
    calls: AtomicUsize,
}

#[async_trait]
impl Program for Flaky {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn run_step(&self, _step: &str, _cx: &mut StepContext<'_>) -> anyhow::Result<Transition> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            anyhow::bail!("remote agent unreachable");
        }
        Ok(Transition::finish_with_msg("ok"))
    }
}

#[tokio::test]
async fn test_advance_and_sleep_until_exit() {
    let h = Harness::new(vec![Arc::new(Counter)]).await;
    let id = h.create("counter", Map::new()).await;

    h.tick().await;
    let record = h.record(&id).await;
    assert_eq!(record.step, "count");
    assert_eq!(record.due_at, t0());

    // `count` sleeps 5 seconds between increments.
    h.tick().await;
    let record = h.record(&id).await;
    assert_eq!(record.step, "count");
    assert_eq!(record.due_at, t0() + Duration::seconds(5));
    assert_eq!(h.tick().await, 0, "sleeping process must not run");

    let record = h.run_until_exit(&id, Duration::seconds(5), 10).await;
    assert_eq!(record.exit_value_json().unwrap(), Some(json!({ "n": 3 })));
    assert!(record.frames().unwrap().is_empty());

    // Exited processes are retained but never scheduled again.
    h.clock.advance(Duration::hours(1));
    assert_eq!(h.tick().await, 0);
    assert!(h.persistence.get_process(&id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_call_return_resumes_caller_with_retval_once() {
    let h = Harness::new(vec![Arc::new(Caller), Arc::new(Adder)]).await;
    let id = h.create("caller", Map::new()).await;

    h.tick().await;
    let record = h.record(&id).await;
    assert_eq!(record.program, "adder");
    assert_eq!(record.step, "start");
    assert_eq!(record.frames().unwrap().len(), 2);

    h.tick().await;
    let record = h.record(&id).await;
    assert_eq!(record.program, "caller");
    assert_eq!(record.step, "collect");
    assert_eq!(record.retval_json().unwrap(), Some(json!({ "sum": 5 })));

    let record = h.run_until_exit(&id, Duration::seconds(1), 5).await;
    assert_eq!(
        record.exit_value_json().unwrap(),
        Some(json!({ "sum": 5, "depth": 1 }))
    );
}

#[tokio::test]
async fn test_children_are_spawned_yielded_and_harvested() {
    let h = Harness::new(vec![Arc::new(Parent), Arc::new(Counter)]).await;
    let id = h.create("parent", Map::new()).await;

    h.tick().await;
    let children = h.persistence.list_children(&id).await.unwrap();
    assert_eq!(children.len(), 2);
    assert!(children.iter().all(|c| c.parent_id.as_deref() == Some(id.as_str())));

    let record = h.run_until_exit(&id, Duration::seconds(5), 20).await;
    assert_eq!(record.exit_value_json().unwrap(), Some(json!({ "total": 3 })));

    // Harvested children are detached.
    assert!(h.persistence.list_children(&id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_destroy_flag_preempts_current_step() {
    let h = Harness::new(vec![Arc::new(Guarded)]).await;
    let id = h.create("guarded", Map::new()).await;

    h.tick().await;
    assert_eq!(h.record(&id).await.step, "start");

    h.engine.signal(&id, "destroy").await.unwrap();
    h.clock.advance(Duration::seconds(60));
    h.tick().await;
    assert_eq!(h.record(&id).await.step, "destroy");

    h.tick().await;
    let record = h.record(&id).await;
    assert!(record.exited);
    assert_eq!(
        record.exit_value_json().unwrap(),
        Some(json!({ "msg": "destroyed" }))
    );
    // Flags go away with the process.
    assert!(h.persistence.list_signals(&id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_deadline_miss_reported_once_and_cleared_on_target() {
    let h = Harness::new(vec![Arc::new(Late)]).await;
    let id = h.create("late", Map::new()).await;

    h.tick().await;
    let deadline = h.record(&id).await.deadline().unwrap();
    assert_eq!(deadline.target.as_deref(), Some("wait"));
    assert_eq!(deadline.at, t0() + Duration::seconds(30));

    for _ in 0..6 {
        h.tick().await;
        h.clock.advance(Duration::seconds(20));
    }

    let record = h.record(&id).await;
    assert_eq!(record.step, "wait");
    assert!(record.deadline().is_none());

    let frames = record.frames().unwrap();
    let locals = &frames[0].locals;
    assert_eq!(locals.get("misses"), Some(&json!(1)));
    assert_eq!(locals.get("recovered"), Some(&json!(true)));
}

#[tokio::test]
async fn test_step_error_halts_in_place_until_lease_expires() {
    let h = Harness::new(vec![Arc::new(Flaky {
        calls: AtomicUsize::new(0),
    })])
    .await;
    let id = h.create("flaky", Map::new()).await;

    let outcome = h.engine.run_process(&id).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Halted(ref msg) if msg.contains("unreachable")));

    let record = h.record(&id).await;
    assert_eq!(record.step, "start");
    assert_eq!(record.error_count, 1);
    assert!(record.lease_owner.is_some());

    // No automatic retry while the lease is held.
    assert_eq!(h.tick().await, 0);

    h.clock.advance(Duration::seconds(121));
    let record = h.run_until_exit(&id, Duration::seconds(1), 3).await;
    assert!(record.last_error.is_none());
    assert_eq!(
        record.exit_value_json().unwrap(),
        Some(json!({ "msg": "ok" }))
    );
}

#[tokio::test]
async fn test_unknown_program_is_rejected_at_creation() {
    let h = Harness::new(vec![Arc::new(Counter)]).await;
    let err = h
        .engine
        .create_process(drydock_core::NewProcess::new("x", "missing", t0()))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "UNKNOWN_PROGRAM");
}
