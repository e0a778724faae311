// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared dependencies of every fleet program.

use sqlx::SqlitePool;

use crate::collab::Collaborators;
use crate::config::FleetConfig;
use crate::error::{FleetError, FleetResult};
use crate::model::{NodeRecord, ResourceRecord, TimelineRecord};
use crate::store;

/// Database pool, collaborators and configuration, shared by programs and
/// management operations.
#[derive(Clone)]
pub struct Fleet {
    pub pool: SqlitePool,
    pub collab: Collaborators,
    pub config: FleetConfig,
}

impl Fleet {
    pub fn new(pool: SqlitePool, collab: Collaborators, config: FleetConfig) -> Self {
        Self {
            pool,
            collab,
            config,
        }
    }

    /// Load a cluster or fail with `NotFound`.
    pub async fn resource(&self, id: &str) -> FleetResult<ResourceRecord> {
        store::resources::get(&self.pool, id)
            .await?
            .ok_or_else(|| FleetError::not_found("resource", id))
    }

    /// Load a node or fail with `NotFound`.
    pub async fn node(&self, id: &str) -> FleetResult<NodeRecord> {
        store::nodes::get(&self.pool, id)
            .await?
            .ok_or_else(|| FleetError::not_found("node", id))
    }

    /// Load a timeline or fail with `NotFound`.
    pub async fn timeline(&self, id: &str) -> FleetResult<TimelineRecord> {
        store::timelines::get(&self.pool, id)
            .await?
            .ok_or_else(|| FleetError::not_found("timeline", id))
    }
}
