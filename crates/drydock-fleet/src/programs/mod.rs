// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fleet programs and the names they are registered and signalled under.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::anyhow;
use drydock_core::persistence::ProcessRecord;
use drydock_core::{Engine, ProgramRegistry};

use crate::collab::CollabResult;
use crate::fleet::Fleet;
use crate::model::NodeRecord;
use crate::store;

pub mod agent_bootstrap;
pub mod auto_restart;
pub mod doctor;
pub mod node;
pub mod resource;
pub mod timeline;
pub mod vm;

/// Program names.
pub const NODE: &str = "node";
pub const RESOURCE: &str = "resource";
pub const TIMELINE: &str = "timeline";
pub const DOCTOR: &str = "doctor";
pub const VM: &str = "vm";
pub const AGENT_BOOTSTRAP: &str = "agent_bootstrap";
pub const AUTO_RESTART: &str = "auto_restart";

/// Steady-state step shared by the long-lived machines.
pub const WAIT: &str = "wait";

/// Signal flag names.
pub mod signals {
    pub use drydock_core::process::DESTROY_SIGNAL as DESTROY;

    // node
    pub const TAKE_OVER: &str = "take_over";
    pub const CHECKUP: &str = "checkup";
    pub const RECONFIGURE: &str = "reconfigure";
    pub const UPDATE_AGENT: &str = "update_agent";
    pub const UPDATE_ENGINE_EXTENSION: &str = "update_engine_extension";
    pub const UPDATE_EXTRAS_EXTENSION: &str = "update_extras_extension";
    pub const UPDATE_IMAGE: &str = "update_image";
    pub const ADD_DOMAIN: &str = "add_domain";
    pub const SETUP_TLS: &str = "setup_tls";
    pub const ROTATE_PASSWORD: &str = "rotate_password";
    pub const RESIZE_STORAGE: &str = "resize_storage";
    pub const RESIZE_VM: &str = "resize_vm";
    pub const RESTART: &str = "restart";
    pub const STOP: &str = "stop";
    pub const START: &str = "start";

    // resource
    pub const SWAP_LEADERS_WITH_PARENT: &str = "swap_leaders_with_parent";

    // timeline
    pub const TAKE_BACKUP: &str = "take_backup";

    // doctor
    pub const SYNC_SYSTEM_QUERIES: &str = "sync_system_queries";
}

/// Register every fleet program.
pub fn register(registry: &mut ProgramRegistry, fleet: Arc<Fleet>) {
    registry
        .register(Arc::new(node::NodeProgram::new(fleet.clone())))
        .register(Arc::new(resource::ResourceProgram::new(fleet.clone())))
        .register(Arc::new(timeline::TimelineProgram::new(fleet.clone())))
        .register(Arc::new(doctor::DoctorProgram::new(fleet.clone())))
        .register(Arc::new(vm::VmProgram::new(fleet.clone())))
        .register(Arc::new(agent_bootstrap::AgentBootstrapProgram::new(fleet.clone())))
        .register(Arc::new(auto_restart::AutoRestartProgram::new(fleet)));
}

/// Parse a stored step name into a program's step enum.
pub(crate) fn parse_step<S: FromStr>(program: &str, step: &str) -> anyhow::Result<S> {
    step.parse::<S>()
        .map_err(|_| anyhow!("program '{program}' has no step '{step}'"))
}

/// A process that has not exited.
pub(crate) async fn live_process(
    engine: &Engine,
    id: &str,
) -> anyhow::Result<Option<ProcessRecord>> {
    Ok(engine
        .persistence()
        .get_process(id)
        .await?
        .filter(|p| !p.exited))
}

/// Whether a process is running its root program and parked in `wait`.
pub(crate) async fn is_steady(engine: &Engine, id: &str) -> anyhow::Result<bool> {
    let Some(process) = live_process(engine, id).await? else {
        return Ok(false);
    };
    Ok(process.step == WAIT && process.frames()?.len() == 1)
}

/// Treat "already gone" as success.
pub(crate) fn ignore_missing(result: CollabResult<()>) -> CollabResult<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Move static addresses so each node in `moves` ends up holding its target
/// address, then record the exchange. Converges when re-run after a partial
/// move.
pub(crate) async fn move_addresses(
    fleet: &Fleet,
    moves: [(&NodeRecord, &str); 2],
) -> anyhow::Result<()> {
    let cloud = &fleet.collab.cloud;

    for (node, target) in moves {
        if let Some(info) = cloud.get_address(target).await?
            && let Some(vm) = info.attached_to
            && vm != node.vm_name
        {
            cloud.detach_address(&vm, target).await?;
        }
    }

    for (node, target) in moves {
        let attached = cloud
            .get_address(target)
            .await?
            .and_then(|info| info.attached_to);
        if attached.as_deref() != Some(node.vm_name.as_str()) {
            cloud.attach_address(&node.vm_name, target).await?;
        }
    }

    let [(a, a_target), (b, _)] = moves;
    if a.address_name != a_target {
        store::nodes::swap_addresses(&fleet.pool, a, b).await?;
    }
    Ok(())
}

/// SQL that stops accepting writes on a primary.
pub(crate) const READ_ONLY_ON: &str =
    "ALTER SYSTEM SET default_transaction_read_only TO on; SELECT pg_reload_conf();";

/// SQL that lifts [`READ_ONLY_ON`].
pub(crate) const READ_ONLY_OFF: &str =
    "ALTER SYSTEM RESET default_transaction_read_only; SELECT pg_reload_conf();";
