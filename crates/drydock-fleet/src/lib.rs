// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! drydock Fleet - lifecycle machines for replicated database clusters
//!
//! Each cluster is a tree of long-lived processes on the drydock engine:
//!
//! ```text
//!   resource ──┬── node (primary) ──▶ vm · agent_bootstrap · auto_restart
//!              ├── node (standby) ...
//!              ├── doctor
//!              └── timeline (shared by nodes that archive or restore from it)
//! ```
//!
//! Processes are not parents of each other. They coordinate through the
//! domain rows in [`store`] and through signal flags. Management operations in
//! [`service`] only validate, update rows and raise flags.
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `DRYDOCK_LOCATIONS` | `us-central1` | Comma-separated allowed locations |
//! | `DRYDOCK_BACKUP_BUCKET` | `drydock-wal` | Bucket for base backups and WAL |
//! | `DRYDOCK_MAX_STORAGE_GIB` | `4096` | Storage ceiling, also for autoresize |
//! | `DRYDOCK_E2E` | `false` | Zero restore offset for test environments |
//! | `DRYDOCK_DEFAULT_ENGINE_VERSION` | `0.3.0` | Engine extension of new clusters |
//! | `DRYDOCK_DEFAULT_EXTRAS_VERSION` | `0.2.0` | Extras extension of new clusters |
//! | `DRYDOCK_DEFAULT_MINOR_VERSION` | `1` | Image minor version of new clusters |
//! | `DRYDOCK_UNAVAILABLE_ESCALATION_SECS` | `300` | Grace before an outage pages |

pub mod agent;
pub mod assembly;
pub mod collab;
pub mod config;
pub mod error;
pub mod fleet;
pub mod incidents;
pub mod model;
pub mod policy;
pub mod programs;
pub mod service;
pub mod store;

pub use error::{FleetError, FleetResult, ValidationErrors};
pub use fleet::Fleet;
pub use service::FleetService;
