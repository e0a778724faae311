// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Installs the remote agent on a freshly booted VM. Spawned as a child of the
//! node process with `{"host"}`; exits with `{"version"}`.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use drydock_core::{Program, StepContext, Transition};
use serde_json::json;
use strum::{AsRefStr, EnumString};
use tracing::info;

use super::{AGENT_BOOTSTRAP, parse_step};
use crate::fleet::Fleet;

pub const INSTALL_AGENT: &str = "curl -fsSL https://get.drydock.dev/agent | sudo bash";
pub const AGENT_VERSION: &str = "drydock-agent --version";

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum AgentBootstrapStep {
    Start,
    Verify,
}

pub struct AgentBootstrapProgram {
    fleet: Arc<Fleet>,
}

impl AgentBootstrapProgram {
    pub fn new(fleet: Arc<Fleet>) -> Self {
        Self { fleet }
    }
}

#[async_trait]
impl Program for AgentBootstrapProgram {
    fn name(&self) -> &'static str {
        AGENT_BOOTSTRAP
    }

    async fn before_step(&self, _cx: &mut StepContext<'_>) -> anyhow::Result<Option<Transition>> {
        Ok(None)
    }

    async fn run_step(&self, step: &str, cx: &mut StepContext<'_>) -> anyhow::Result<Transition> {
        let host: String = cx.local("host").context("agent_bootstrap needs a host")?;
        let agent = &self.fleet.collab.agent;

        match parse_step::<AgentBootstrapStep>(AGENT_BOOTSTRAP, step)? {
            AgentBootstrapStep::Start => {
                agent.exec(&host, INSTALL_AGENT, None).await?;
                Ok(Transition::advance(AgentBootstrapStep::Verify))
            }
            AgentBootstrapStep::Verify => {
                let version = agent.exec(&host, AGENT_VERSION, None).await?;
                let version = version.trim();
                if version.is_empty() {
                    return Ok(Transition::advance(AgentBootstrapStep::Start));
                }
                info!(host = %host, version, "Agent installed");
                Ok(Transition::finish(json!({ "version": version })))
            }
        }
    }
}
