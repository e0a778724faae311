// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Four-verb task protocol on top of [`RemoteAgent`].
//!
//! Steps never block on a remote command. They call [`poll_task`] once per
//! invocation: the first call starts the task, later calls observe it, and the
//! call that observes completion collects the logs and frees the name.

use tracing::debug;

use crate::collab::{CollabResult, RemoteAgent, TaskLogs, TaskStatus};

/// What a step learns from one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPoll {
    /// Started now or still running.
    Pending,
    /// Finished successfully. The task has been cleaned.
    Succeeded(TaskLogs),
    /// Finished with an error. The task has been cleaned, so the next poll
    /// re-submits it.
    Failed(TaskLogs),
}

/// A command the agent runs under a stable name.
#[derive(Debug, Clone, Copy)]
pub struct TaskSpec<'a> {
    pub name: &'a str,
    pub command: &'a str,
    pub stdin: Option<&'a str>,
}

impl<'a> TaskSpec<'a> {
    pub fn new(name: &'a str, command: &'a str) -> Self {
        Self {
            name,
            command,
            stdin: None,
        }
    }

    pub fn with_stdin(mut self, stdin: &'a str) -> Self {
        self.stdin = Some(stdin);
        self
    }
}

/// Advance `task` on `host` by one observation.
pub async fn poll_task(
    agent: &dyn RemoteAgent,
    host: &str,
    task: TaskSpec<'_>,
) -> CollabResult<TaskPoll> {
    match agent.check(host, task.name).await? {
        TaskStatus::NotStarted => {
            debug!(host, task = task.name, "Starting task");
            agent.run(host, task.name, task.command, task.stdin).await?;
            Ok(TaskPoll::Pending)
        }
        TaskStatus::InProgress => Ok(TaskPoll::Pending),
        TaskStatus::Succeeded => {
            let logs = agent.logs(host, task.name).await?;
            agent.clean(host, task.name).await?;
            Ok(TaskPoll::Succeeded(logs))
        }
        TaskStatus::Failed => {
            let logs = agent.logs(host, task.name).await?;
            agent.clean(host, task.name).await?;
            Ok(TaskPoll::Failed(logs))
        }
    }
}

/// Observe a task without starting it. A finished task is cleaned and its
/// final status returned.
pub async fn reap_task(
    agent: &dyn RemoteAgent,
    host: &str,
    name: &str,
) -> CollabResult<(TaskStatus, Option<TaskLogs>)> {
    let status = agent.check(host, name).await?;
    match status {
        TaskStatus::Succeeded | TaskStatus::Failed => {
            let logs = agent.logs(host, name).await?;
            agent.clean(host, name).await?;
            Ok((status, Some(logs)))
        }
        TaskStatus::NotStarted | TaskStatus::InProgress => Ok((status, None)),
    }
}
