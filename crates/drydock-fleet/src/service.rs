// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Management operations.
//!
//! Every operation either creates processes (through [`crate::assembly`]) or
//! updates target attributes and raises a flag on the process that acts on
//! them. None of them talks to a database host or the cloud directly.

use std::sync::Arc;

use drydock_core::Engine;
use tracing::info;

use crate::assembly::{self, ClusterRequest, ForkRequest};
use crate::config::{MACHINE_TYPES, MIN_STORAGE_GIB};
use crate::error::{FleetError, FleetResult, ValidationErrors};
use crate::fleet::Fleet;
use crate::incidents;
use crate::model::{DisplayState, NodeRecord, PageRecord, ResourceRecord};
use crate::programs::{resource, signals};
use crate::store;

/// Entry point for callers that manage clusters.
#[derive(Clone)]
pub struct FleetService {
    engine: Arc<Engine>,
    fleet: Arc<Fleet>,
}

impl FleetService {
    pub fn new(engine: Arc<Engine>, fleet: Arc<Fleet>) -> Self {
        Self { engine, fleet }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn fleet(&self) -> &Arc<Fleet> {
        &self.fleet
    }

    pub async fn create_cluster(&self, req: ClusterRequest) -> FleetResult<ResourceRecord> {
        assembly::create_cluster(&self.engine, &self.fleet, req, self.engine.now()).await
    }

    pub async fn create_fork(&self, req: ForkRequest) -> FleetResult<ResourceRecord> {
        assembly::create_fork(&self.engine, &self.fleet, req, self.engine.now()).await
    }

    /// Tear down a cluster with its nodes, doctor and unused timelines.
    pub async fn delete_cluster(&self, resource_id: &str) -> FleetResult<()> {
        self.fleet.resource(resource_id).await?;
        self.engine.signal(resource_id, signals::DESTROY).await?;
        info!(resource_id, "Cluster deletion requested");
        Ok(())
    }

    /// Grow every node's disk to `storage_gib`. Disks never shrink.
    pub async fn resize_storage(&self, resource_id: &str, storage_gib: i64) -> FleetResult<()> {
        let resource = self.fleet.resource(resource_id).await?;

        let mut errors = ValidationErrors::new();
        if !(MIN_STORAGE_GIB..=self.fleet.config.max_storage_gib).contains(&storage_gib) {
            errors.add(
                "storage_gib",
                format!(
                    "must be between {MIN_STORAGE_GIB} and {} GiB",
                    self.fleet.config.max_storage_gib
                ),
            );
        } else if storage_gib < resource.storage_gib {
            errors.add(
                "storage_gib",
                format!("cannot shrink below {} GiB", resource.storage_gib),
            );
        }
        errors.into_result()?;

        store::resources::set_storage(&self.fleet.pool, resource_id, storage_gib).await?;
        for node in self.active_nodes(resource_id).await? {
            if node.storage_gib < storage_gib {
                store::nodes::set_storage(&self.fleet.pool, &node.id, storage_gib).await?;
                self.engine.signal(&node.id, signals::RESIZE_STORAGE).await?;
            }
        }
        info!(resource_id, storage_gib, "Storage resize requested");
        Ok(())
    }

    /// Move every node to `machine_type`, one stop/start per node.
    pub async fn resize_vm(&self, resource_id: &str, machine_type: &str) -> FleetResult<()> {
        self.fleet.resource(resource_id).await?;
        if !MACHINE_TYPES.contains(&machine_type) {
            let mut errors = ValidationErrors::new();
            errors.add(
                "machine_type",
                format!("unsupported machine type '{machine_type}'"),
            );
            errors.into_result()?;
        }

        store::resources::set_machine_type(&self.fleet.pool, resource_id, machine_type).await?;
        for node in self.active_nodes(resource_id).await? {
            if node.machine_type != machine_type {
                store::nodes::set_machine_type(&self.fleet.pool, &node.id, machine_type).await?;
                self.engine.signal(&node.id, signals::RESIZE_VM).await?;
            }
        }
        info!(resource_id, machine_type, "Machine type change requested");
        Ok(())
    }

    /// Generate a new superuser password and apply it on the primary.
    /// Returns the new password.
    pub async fn rotate_password(&self, resource_id: &str) -> FleetResult<String> {
        let primary = self.primary(resource_id).await?;
        let password = assembly::generate_password();
        store::resources::set_superuser_password(&self.fleet.pool, resource_id, &password).await?;
        self.engine
            .signal(&primary.id, signals::ROTATE_PASSWORD)
            .await?;
        info!(resource_id, "Password rotation requested");
        Ok(password)
    }

    /// Point `domain` at the primary and issue a certificate for it.
    pub async fn add_domain(&self, resource_id: &str, domain: &str) -> FleetResult<()> {
        let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
        if domain.is_empty() || !domain.contains('.') || domain.contains(char::is_whitespace) {
            let mut errors = ValidationErrors::new();
            errors.add("domain", format!("'{domain}' is not a valid domain name"));
            errors.into_result()?;
        }

        let primary = self.primary(resource_id).await?;
        store::nodes::set_domain(&self.fleet.pool, &primary.id, Some(&domain)).await?;
        self.engine.signal(&primary.id, signals::ADD_DOMAIN).await?;
        info!(resource_id, domain = %domain, "Domain requested");
        Ok(())
    }

    pub async fn start_cluster(&self, resource_id: &str) -> FleetResult<()> {
        self.signal_nodes(resource_id, signals::START).await
    }

    pub async fn stop_cluster(&self, resource_id: &str) -> FleetResult<()> {
        self.signal_nodes(resource_id, signals::STOP).await
    }

    pub async fn restart_cluster(&self, resource_id: &str) -> FleetResult<()> {
        self.signal_nodes(resource_id, signals::RESTART).await
    }

    /// Set new extension target versions and update nodes that lag behind.
    /// `None` keeps the current target.
    pub async fn upgrade_extensions(
        &self,
        resource_id: &str,
        engine_version: Option<&str>,
        extras_version: Option<&str>,
    ) -> FleetResult<()> {
        let resource = self.fleet.resource(resource_id).await?;
        let engine_version = engine_version.unwrap_or(&resource.engine_version);
        let extras_version = extras_version.unwrap_or(&resource.extras_version);
        check_version("engine_version", engine_version)?;
        check_version("extras_version", extras_version)?;

        store::resources::set_versions(
            &self.fleet.pool,
            resource_id,
            engine_version,
            extras_version,
            &resource.minor_version,
        )
        .await?;

        for node in self.active_nodes(resource_id).await? {
            if node.engine_version != engine_version {
                self.engine
                    .signal(&node.id, signals::UPDATE_ENGINE_EXTENSION)
                    .await?;
            }
            if node.extras_version != extras_version {
                self.engine
                    .signal(&node.id, signals::UPDATE_EXTRAS_EXTENSION)
                    .await?;
            }
        }
        info!(resource_id, engine_version, extras_version, "Extension upgrade requested");
        Ok(())
    }

    /// Move every node to a new image minor version.
    pub async fn upgrade_image(&self, resource_id: &str, minor_version: &str) -> FleetResult<()> {
        let resource = self.fleet.resource(resource_id).await?;
        check_version("minor_version", minor_version)?;

        store::resources::set_versions(
            &self.fleet.pool,
            resource_id,
            &resource.engine_version,
            &resource.extras_version,
            minor_version,
        )
        .await?;
        for node in self.active_nodes(resource_id).await? {
            if node.minor_version != minor_version {
                self.engine.signal(&node.id, signals::UPDATE_IMAGE).await?;
            }
        }
        info!(resource_id, minor_version, "Image upgrade requested");
        Ok(())
    }

    pub async fn update_agent(&self, resource_id: &str) -> FleetResult<()> {
        self.signal_nodes(resource_id, signals::UPDATE_AGENT).await
    }

    /// Take a base backup on the primary's timeline now.
    pub async fn trigger_backup(&self, resource_id: &str) -> FleetResult<()> {
        let primary = self.primary(resource_id).await?;
        self.engine
            .signal(&primary.timeline_id, signals::TAKE_BACKUP)
            .await?;
        info!(resource_id, timeline_id = %primary.timeline_id, "Backup requested");
        Ok(())
    }

    /// Promote the standby `node_id` in place of the current primary.
    pub async fn take_over(&self, node_id: &str) -> FleetResult<()> {
        let node = self.fleet.node(node_id).await?;
        if node.is_representative() {
            return Err(FleetError::InvalidState(format!(
                "node {node_id} is already the primary"
            )));
        }
        if node.display() == DisplayState::Deleting {
            return Err(FleetError::InvalidState(format!(
                "node {node_id} is being deleted"
            )));
        }
        self.engine.signal(node_id, signals::TAKE_OVER).await?;
        info!(node_id, resource_id = %node.resource_id, "Take-over requested");
        Ok(())
    }

    /// Let a fork take over its parent's addresses and DNS names.
    pub async fn swap_leaders_with_parent(&self, resource_id: &str) -> FleetResult<()> {
        let resource = self.fleet.resource(resource_id).await?;
        if !resource.is_fork() {
            return Err(FleetError::InvalidState(format!(
                "resource {resource_id} is not a fork"
            )));
        }
        self.engine
            .signal(resource_id, signals::SWAP_LEADERS_WITH_PARENT)
            .await?;
        info!(resource_id, "Leader swap with parent requested");
        Ok(())
    }

    /// Copy newly added system health checks to the cluster's doctor.
    pub async fn sync_doctor_queries(&self, resource_id: &str) -> FleetResult<()> {
        let doctor = store::doctors::for_resource(&self.fleet.pool, resource_id)
            .await?
            .ok_or_else(|| FleetError::not_found("doctor", resource_id))?;
        self.engine
            .signal(&doctor.id, signals::SYNC_SYSTEM_QUERIES)
            .await?;
        Ok(())
    }

    pub async fn display_state(&self, resource_id: &str) -> FleetResult<DisplayState> {
        let resource = self.fleet.resource(resource_id).await?;
        resource::display_state(&self.fleet, &resource).await
    }

    pub async fn list_incidents(&self) -> FleetResult<Vec<PageRecord>> {
        incidents::list_open(&self.fleet).await
    }

    pub async fn incident_history(&self) -> FleetResult<Vec<PageRecord>> {
        incidents::history(&self.fleet).await
    }

    pub async fn acknowledge_incident(&self, page_id: &str) -> FleetResult<PageRecord> {
        incidents::acknowledge(&self.fleet, page_id).await
    }

    pub async fn trigger_incident(&self, page_id: &str) -> FleetResult<PageRecord> {
        incidents::retrigger(&self.fleet, page_id).await
    }

    pub async fn resolve_incident(&self, page_id: &str) -> FleetResult<PageRecord> {
        incidents::resolve_by_id(&self.fleet, page_id, self.engine.now()).await
    }

    async fn primary(&self, resource_id: &str) -> FleetResult<NodeRecord> {
        self.fleet.resource(resource_id).await?;
        store::nodes::representative(&self.fleet.pool, resource_id)
            .await?
            .ok_or_else(|| {
                FleetError::InvalidState(format!("resource {resource_id} has no primary"))
            })
    }

    async fn active_nodes(&self, resource_id: &str) -> FleetResult<Vec<NodeRecord>> {
        Ok(store::nodes::list_for_resource(&self.fleet.pool, resource_id)
            .await?
            .into_iter()
            .filter(|n| n.display() != DisplayState::Deleting)
            .collect())
    }

    async fn signal_nodes(&self, resource_id: &str, flag: &str) -> FleetResult<()> {
        self.fleet.resource(resource_id).await?;
        for node in self.active_nodes(resource_id).await? {
            self.engine.signal(&node.id, flag).await?;
        }
        info!(resource_id, flag, "Nodes signalled");
        Ok(())
    }
}

fn check_version(field: &str, value: &str) -> FleetResult<()> {
    let mut errors = ValidationErrors::new();
    if value.trim().is_empty() {
        errors.add(field, "must not be empty");
    }
    errors.into_result()
}
