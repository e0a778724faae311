// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provision a node's VM and static address. Called by the node program;
//! returns `{"address_ip"}` to the caller.

use std::sync::Arc;

use async_trait::async_trait;
use drydock_core::{Program, StepContext, Transition};
use serde_json::json;
use strum::{AsRefStr, EnumString};
use tracing::info;

use super::{VM, parse_step};
use crate::collab::{VmSpec, VmStatus};
use crate::fleet::Fleet;

/// Image every node boots from.
pub const NODE_IMAGE: &str = "drydock-node-ubuntu-2204";

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum VmStep {
    Start,
    WaitVm,
    AttachAddress,
}

pub struct VmProgram {
    fleet: Arc<Fleet>,
}

impl VmProgram {
    pub fn new(fleet: Arc<Fleet>) -> Self {
        Self { fleet }
    }
}

#[async_trait]
impl Program for VmProgram {
    fn name(&self) -> &'static str {
        VM
    }

    // Runs inside the node's stack; the node handles destroy once it resumes.
    async fn before_step(&self, _cx: &mut StepContext<'_>) -> anyhow::Result<Option<Transition>> {
        Ok(None)
    }

    async fn run_step(&self, step: &str, cx: &mut StepContext<'_>) -> anyhow::Result<Transition> {
        let node = self.fleet.node(cx.id()).await?;
        let resource = self.fleet.resource(&node.resource_id).await?;
        let cloud = &self.fleet.collab.cloud;

        match parse_step::<VmStep>(VM, step)? {
            VmStep::Start => {
                if cloud.get_address(&node.address_name).await?.is_none() {
                    cloud
                        .create_address(&node.address_name, &resource.location)
                        .await?;
                }
                if cloud.get_vm(&node.vm_name).await?.is_none() {
                    cloud
                        .create_vm(&VmSpec {
                            name: node.vm_name.clone(),
                            location: resource.location.clone(),
                            machine_type: node.machine_type.clone(),
                            storage_gib: node.storage_gib,
                            image: NODE_IMAGE.to_string(),
                        })
                        .await?;
                    info!(node_id = %node.id, vm = %node.vm_name, "VM requested");
                }
                Ok(Transition::advance(VmStep::WaitVm))
            }
            VmStep::WaitVm => match cloud.get_vm(&node.vm_name).await? {
                Some(vm) if vm.status == VmStatus::Running => {
                    Ok(Transition::advance(VmStep::AttachAddress))
                }
                Some(_) => Ok(Transition::sleep(5)),
                None => Ok(Transition::advance(VmStep::Start)),
            },
            VmStep::AttachAddress => {
                let Some(address) = cloud.get_address(&node.address_name).await? else {
                    return Ok(Transition::advance(VmStep::Start));
                };
                if address.attached_to.as_deref() != Some(node.vm_name.as_str()) {
                    cloud
                        .attach_address(&node.vm_name, &node.address_name)
                        .await?;
                }
                Ok(Transition::finish(json!({ "address_ip": address.ip })))
            }
        }
    }
}
