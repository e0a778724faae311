// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster topology machine.
//!
//! Owns a cluster's identity and membership: keeps the node count at
//! `1 + required standbys`, swaps a fork's primary with its parent's on
//! request, and tears the cluster down.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, bail};
use async_trait::async_trait;
use drydock_core::{Program, StepContext, Transition};
use strum::{AsRefStr, EnumString};
use tracing::{debug, info, warn};

use super::node::{quote_ident, quote_literal};
use super::{
    READ_ONLY_OFF, READ_ONLY_ON, RESOURCE, ignore_missing, is_steady, live_process, parse_step,
    signals,
};
use crate::assembly;
use crate::error::FleetResult;
use crate::fleet::Fleet;
use crate::model::{DisplayState, NodeRecord, ResourceRecord};
use crate::policy;
use crate::store;

/// Display state of a cluster: the override when set, else the worst state
/// among its nodes.
pub async fn display_state(fleet: &Fleet, resource: &ResourceRecord) -> FleetResult<DisplayState> {
    if let Some(state) = resource.display_override() {
        return Ok(state);
    }
    let nodes = store::nodes::list_for_resource(&fleet.pool, &resource.id).await?;
    Ok(DisplayState::worst(nodes.iter().map(NodeRecord::display)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ResourceStep {
    Start,
    CreateLogicalSubscription,
    Wait,
    SwapLeadersWithParent,
    WaitSwapIp,
    UpdateHosts,
    Destroy,
    WaitNodesDestroyed,
}

pub struct ResourceProgram {
    fleet: Arc<Fleet>,
}

impl ResourceProgram {
    pub fn new(fleet: Arc<Fleet>) -> Self {
        Self { fleet }
    }

    async fn query(&self, node: &NodeRecord, db: &str, sql: &str) -> anyhow::Result<String> {
        Ok(self
            .fleet
            .collab
            .db
            .run_query(node.host(), db, "postgres", sql)
            .await?)
    }

    async fn primary(&self, resource_id: &str) -> anyhow::Result<NodeRecord> {
        store::nodes::representative(&self.fleet.pool, resource_id)
            .await?
            .with_context(|| format!("resource {resource_id} has no primary"))
    }

    async fn start(
        &self,
        cx: &mut StepContext<'_>,
        resource: &ResourceRecord,
    ) -> anyhow::Result<Transition> {
        if resource.service_account_email.is_none() {
            let short = &resource.id[..8.min(resource.id.len())];
            let email = self
                .fleet
                .collab
                .identity
                .create_identity(&format!("db-{short}"))
                .await?;
            store::resources::set_service_account(&self.fleet.pool, &resource.id, Some(&email))
                .await?;
        }

        let steady = match store::nodes::representative(&self.fleet.pool, &resource.id).await? {
            Some(primary) => is_steady(cx.engine(), &primary.id).await?,
            None => false,
        };
        if !steady {
            return Ok(Transition::sleep(5));
        }

        info!(resource_id = %resource.id, "Cluster is up");
        if resource.is_fork() && resource.logical_replication {
            Ok(Transition::advance(ResourceStep::CreateLogicalSubscription))
        } else {
            Ok(Transition::advance(ResourceStep::Wait))
        }
    }

    async fn create_logical_subscription(
        &self,
        resource: &ResourceRecord,
    ) -> anyhow::Result<Transition> {
        let parent_id = resource
            .parent_id
            .as_deref()
            .context("logical replication without a parent")?;
        let parent = self.fleet.resource(parent_id).await?;
        let parent_primary = self.primary(&parent.id).await?;
        let primary = self.primary(&resource.id).await?;
        let slot = resource.logical_slot_name();
        let db = &resource.db_name;

        let published = self
            .query(
                &parent_primary,
                db,
                &format!("SELECT 1 FROM pg_publication WHERE pubname = {}", quote_literal(&slot)),
            )
            .await?;
        if published.trim() != "1" {
            self.query(
                &parent_primary,
                db,
                &format!("CREATE PUBLICATION {} FOR ALL TABLES", quote_ident(&slot)),
            )
            .await?;
        }

        let subscribed = self
            .query(
                &primary,
                db,
                &format!("SELECT 1 FROM pg_subscription WHERE subname = {}", quote_literal(&slot)),
            )
            .await?;
        if subscribed.trim() != "1" {
            let parent_ip = parent_primary
                .address_ip
                .as_deref()
                .context("parent primary has no address")?;
            let conninfo = format!(
                "host={parent_ip} dbname={db} user=postgres password={}",
                parent.superuser_password
            );
            self.query(
                &primary,
                db,
                &format!(
                    "CREATE SUBSCRIPTION {} CONNECTION {} PUBLICATION {} WITH (copy_data = false)",
                    quote_ident(&slot),
                    quote_literal(&conninfo),
                    quote_ident(&slot)
                ),
            )
            .await?;
        }

        info!(resource_id = %resource.id, slot = %slot, "Logical subscription to parent ready");
        Ok(Transition::advance(ResourceStep::Wait))
    }

    async fn wait(
        &self,
        cx: &mut StepContext<'_>,
        resource: &ResourceRecord,
    ) -> anyhow::Result<Transition> {
        if cx.is_signaled(signals::SWAP_LEADERS_WITH_PARENT).await? {
            if resource.is_fork() {
                return Ok(Transition::advance(ResourceStep::SwapLeadersWithParent));
            }
            cx.decr_signal(signals::SWAP_LEADERS_WITH_PARENT).await?;
        }

        self.top_up(cx, resource).await?;
        Ok(Transition::sleep(30))
    }

    /// Add standbys until the cluster has its target node count. Nodes being
    /// deleted do not count.
    async fn top_up(
        &self,
        cx: &mut StepContext<'_>,
        resource: &ResourceRecord,
    ) -> anyhow::Result<()> {
        let primary = store::nodes::representative(&self.fleet.pool, &resource.id).await?;
        let Some(primary) = primary else {
            return Ok(());
        };
        if !is_steady(cx.engine(), &primary.id).await? {
            return Ok(());
        }

        let nodes = store::nodes::list_for_resource(&self.fleet.pool, &resource.id).await?;
        let live = nodes
            .iter()
            .filter(|n| n.display() != DisplayState::Deleting)
            .count();
        let target = resource.ha().target_node_count();

        for _ in live..target {
            assembly::add_standby(cx.engine(), &self.fleet, resource, &primary, cx.now()).await?;
        }
        Ok(())
    }

    async fn swap_leaders_with_parent(
        &self,
        cx: &mut StepContext<'_>,
        resource: &ResourceRecord,
    ) -> anyhow::Result<Transition> {
        let Some(parent_id) = resource.parent_id.as_deref() else {
            cx.decr_signal(signals::SWAP_LEADERS_WITH_PARENT).await?;
            return Ok(Transition::advance(ResourceStep::Wait));
        };
        let parent_primary = self.primary(parent_id).await?;
        let primary = self.primary(&resource.id).await?;

        // Stop writes on both sides, then let the subscription drain.
        self.query(&parent_primary, "postgres", READ_ONLY_ON).await?;
        self.query(&primary, "postgres", READ_ONLY_ON).await?;
        if resource.logical_replication {
            let slot = resource.logical_slot_name();
            let source = self
                .query(&parent_primary, "postgres", "SELECT pg_current_wal_lsn()")
                .await?;
            let received = self
                .query(
                    &primary,
                    &resource.db_name,
                    &format!(
                        "SELECT latest_end_lsn FROM pg_stat_subscription WHERE subname = {}",
                        quote_literal(&slot)
                    ),
                )
                .await?;
            match (policy::parse_lsn(&source), policy::parse_lsn(&received)) {
                (Some(source), Some(received)) if policy::wal_lag(source, received) == 0 => {}
                _ => return Ok(Transition::sleep(5)),
            }
            let disable = format!("ALTER SUBSCRIPTION {} DISABLE", quote_ident(&slot));
            self.query(&primary, &resource.db_name, &disable).await?;
        }

        cx.set_local("parent_primary", &parent_primary.id)?;
        cx.set_local("fork_primary", &primary.id)?;
        cx.set_local("parent_address", &parent_primary.address_name)?;
        cx.set_local("fork_address", &primary.address_name)?;
        info!(resource_id = %resource.id, parent_id, "Swapping leaders with parent");
        Ok(Transition::advance(ResourceStep::WaitSwapIp))
    }

    /// Node whose id is stored in the frame under `key`.
    async fn local_node(&self, cx: &StepContext<'_>, key: &str) -> anyhow::Result<NodeRecord> {
        let id: String = cx.local(key).with_context(|| format!("missing {key}"))?;
        Ok(self.fleet.node(&id).await?)
    }

    async fn wait_swap_ip(&self, cx: &mut StepContext<'_>) -> anyhow::Result<Transition> {
        let fork_primary = self.local_node(cx, "fork_primary").await?;
        let parent_primary = self.local_node(cx, "parent_primary").await?;
        let parent_address: String = cx.local("parent_address").context("missing parent_address")?;
        let fork_address: String = cx.local("fork_address").context("missing fork_address")?;

        super::move_addresses(
            &self.fleet,
            [(&fork_primary, &parent_address), (&parent_primary, &fork_address)],
        )
        .await?;

        // Domains follow only once the fork answers on the parent's address.
        let moved = self.fleet.node(&fork_primary.id).await?;
        if let Err(e) = self.query(&moved, "postgres", "SELECT 1").await {
            debug!(resource_id = %cx.id(), error = %e, "Fork primary not reachable yet");
            return Ok(Transition::sleep(5));
        }
        Ok(Transition::advance(ResourceStep::UpdateHosts))
    }

    async fn update_hosts(
        &self,
        cx: &mut StepContext<'_>,
        resource: &ResourceRecord,
    ) -> anyhow::Result<Transition> {
        let fork_primary = self.local_node(cx, "fork_primary").await?;
        let parent_primary = self.local_node(cx, "parent_primary").await?;

        if resource.is_fork() {
            if resource.logical_replication {
                let drop = format!(
                    "DROP SUBSCRIPTION IF EXISTS {}",
                    quote_ident(&resource.logical_slot_name())
                );
                if let Err(e) = self.query(&fork_primary, &resource.db_name, &drop).await {
                    warn!(resource_id = %resource.id, error = %e, "Could not drop subscription");
                }
            }
            let pool = &self.fleet.pool;
            store::nodes::complete_parent_swap(pool, &resource.id, &fork_primary, &parent_primary)
                .await?;
        }

        for id in [&fork_primary.id, &parent_primary.id] {
            let node = self.fleet.node(id).await?;
            if let (Some(domain), Some(ip)) = (&node.domain, &node.address_ip) {
                self.fleet.collab.dns.upsert_record(domain, ip).await?;
            }
        }
        // The retired parent primary stays read-only.
        if let Err(e) = self.query(&fork_primary, "postgres", READ_ONLY_OFF).await {
            warn!(resource_id = %resource.id, error = %e, "Could not lift read-only mode");
        }

        for key in ["parent_primary", "fork_primary", "parent_address", "fork_address"] {
            cx.remove_local(key);
        }
        cx.decr_signal(signals::SWAP_LEADERS_WITH_PARENT).await?;
        info!(resource_id = %resource.id, "Leaders swapped");
        Ok(Transition::advance(ResourceStep::Wait))
    }

    async fn destroy(
        &self,
        cx: &mut StepContext<'_>,
        resource: &ResourceRecord,
    ) -> anyhow::Result<Transition> {
        cx.clear_signal(signals::DESTROY).await?;
        let deleting = Some(DisplayState::Deleting.as_ref());
        store::resources::set_display_state(&self.fleet.pool, &resource.id, deleting).await?;

        let nodes = store::nodes::list_for_resource(&self.fleet.pool, &resource.id).await?;
        let timelines: BTreeSet<String> = nodes.iter().map(|n| n.timeline_id.clone()).collect();
        let mut targets: Vec<String> = nodes.into_iter().map(|n| n.id).collect();
        if let Some(doctor) = store::doctors::for_resource(&self.fleet.pool, &resource.id).await? {
            targets.push(doctor.id);
        }

        for id in &targets {
            if live_process(cx.engine(), id).await?.is_some() {
                cx.signal(id, signals::DESTROY).await?;
            }
        }
        cx.set_local("timelines", &timelines)?;
        info!(resource_id = %resource.id, processes = targets.len(), "Deleting cluster");
        Ok(Transition::advance(ResourceStep::WaitNodesDestroyed))
    }

    async fn wait_nodes_destroyed(
        &self,
        cx: &mut StepContext<'_>,
        resource: &ResourceRecord,
    ) -> anyhow::Result<Transition> {
        let nodes = store::nodes::list_for_resource(&self.fleet.pool, &resource.id).await?;
        let doctor = store::doctors::for_resource(&self.fleet.pool, &resource.id).await?;
        if !nodes.is_empty() || doctor.is_some() {
            return Ok(Transition::sleep(5));
        }

        let timelines: Vec<String> = cx.local("timelines").unwrap_or_default();
        for timeline_id in &timelines {
            // Shared lineages, such as a parent's, stay.
            if store::nodes::timeline_in_use(&self.fleet.pool, timeline_id).await? {
                continue;
            }
            if live_process(cx.engine(), timeline_id).await?.is_some() {
                cx.signal(timeline_id, signals::DESTROY).await?;
            }
        }

        if let Some(email) = &resource.service_account_email {
            ignore_missing(self.fleet.collab.identity.delete_identity(email).await)?;
        }
        store::resources::delete(&self.fleet.pool, &resource.id).await?;
        info!(resource_id = %resource.id, "Cluster deleted");
        Ok(Transition::finish_with_msg("resource deleted"))
    }
}

#[async_trait]
impl Program for ResourceProgram {
    fn name(&self) -> &'static str {
        RESOURCE
    }

    async fn run_step(&self, step: &str, cx: &mut StepContext<'_>) -> anyhow::Result<Transition> {
        let step = parse_step::<ResourceStep>(RESOURCE, step)?;

        let Some(resource) = store::resources::get(&self.fleet.pool, cx.id()).await? else {
            if matches!(step, ResourceStep::Destroy | ResourceStep::WaitNodesDestroyed) {
                return Ok(Transition::finish_with_msg("resource already deleted"));
            }
            bail!("resource {} not found", cx.id());
        };

        match step {
            ResourceStep::Start => self.start(cx, &resource).await,
            ResourceStep::CreateLogicalSubscription => {
                self.create_logical_subscription(&resource).await
            }
            ResourceStep::Wait => self.wait(cx, &resource).await,
            ResourceStep::SwapLeadersWithParent => {
                self.swap_leaders_with_parent(cx, &resource).await
            }
            ResourceStep::WaitSwapIp => self.wait_swap_ip(cx).await,
            ResourceStep::UpdateHosts => self.update_hosts(cx, &resource).await,
            ResourceStep::Destroy => self.destroy(cx, &resource).await,
            ResourceStep::WaitNodesDestroyed => self.wait_nodes_destroyed(cx, &resource).await,
        }
    }
}
