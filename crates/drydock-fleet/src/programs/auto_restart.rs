// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One restart attempt of an unavailable node's database server.
//!
//! Spawned by the node's `unavailable` step with `{"host"}`. Exits with
//! `{"recovered": bool}` after the server answers or after a bounded number of
//! checks.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use drydock_core::{Program, StepContext, Transition};
use serde_json::json;
use strum::{AsRefStr, EnumString};
use tracing::{info, warn};

use super::{AUTO_RESTART, parse_step};
use crate::fleet::Fleet;

pub const RESTART_SERVER: &str = "sudo systemctl restart postgresql";
const MAX_CHECKS: u64 = 6;
const CHECK_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum AutoRestartStep {
    Start,
    WaitRecovered,
}

pub struct AutoRestartProgram {
    fleet: Arc<Fleet>,
}

impl AutoRestartProgram {
    pub fn new(fleet: Arc<Fleet>) -> Self {
        Self { fleet }
    }
}

#[async_trait]
impl Program for AutoRestartProgram {
    fn name(&self) -> &'static str {
        AUTO_RESTART
    }

    async fn before_step(&self, _cx: &mut StepContext<'_>) -> anyhow::Result<Option<Transition>> {
        Ok(None)
    }

    async fn run_step(&self, step: &str, cx: &mut StepContext<'_>) -> anyhow::Result<Transition> {
        let host: String = cx.local("host").context("auto_restart needs a host")?;

        match parse_step::<AutoRestartStep>(AUTO_RESTART, step)? {
            AutoRestartStep::Start => {
                if let Err(e) = self.fleet.collab.agent.exec(&host, RESTART_SERVER, None).await {
                    warn!(host = %host, error = %e, "Restart command failed");
                    return Ok(Transition::finish(json!({ "recovered": false })));
                }
                Ok(Transition::advance(AutoRestartStep::WaitRecovered))
            }
            AutoRestartStep::WaitRecovered => {
                let answered = self
                    .fleet
                    .collab
                    .db
                    .run_query(&host, "postgres", "postgres", "SELECT 1")
                    .await
                    .is_ok();
                if answered {
                    info!(host = %host, "Server recovered after restart");
                    return Ok(Transition::finish(json!({ "recovered": true })));
                }

                let checks: u64 = cx.local::<u64>("checks").unwrap_or(0) + 1;
                if checks >= MAX_CHECKS {
                    return Ok(Transition::finish(json!({ "recovered": false })));
                }
                cx.set_local("checks", checks)?;
                Ok(Transition::sleep(CHECK_INTERVAL_SECS))
            }
        }
    }
}
