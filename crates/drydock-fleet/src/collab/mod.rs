// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Collaborators: agents, databases, cloud, identity, DNS, blobs, paging.

use std::sync::Arc;

pub mod memory;
mod traits;

pub use memory::InMemoryCloud;
pub use traits::*;

/// The full set of collaborators the machines call.
#[derive(Clone)]
pub struct Collaborators {
    pub agent: Arc<dyn RemoteAgent>,
    pub db: Arc<dyn DatabaseClient>,
    pub cloud: Arc<dyn CloudCompute>,
    pub identity: Arc<dyn IdentityClient>,
    pub dns: Arc<dyn DnsClient>,
    pub blobs: Arc<dyn BlobStorage>,
    pub notifier: Arc<dyn IncidentNotifier>,
}

impl Collaborators {
    /// Route every collaborator to one in-memory cloud.
    pub fn in_memory(cloud: Arc<InMemoryCloud>) -> Self {
        Self {
            agent: cloud.clone(),
            db: cloud.clone(),
            cloud: cloud.clone(),
            identity: cloud.clone(),
            dns: cloud.clone(),
            blobs: cloud.clone(),
            notifier: cloud,
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
