// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Creating clusters, forks, standbys and timelines.
//!
//! Requests are validated in full before anything is written. Entity rows are
//! inserted first and their driving processes second, so a process never
//! starts without its row.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use drydock_core::{Engine, NewProcess};
use rand::Rng;
use rand::distributions::Alphanumeric;
use regex::Regex;
use tracing::info;
use uuid::Uuid;

use crate::config::{FleetConfig, MACHINE_TYPES, MIN_STORAGE_GIB};
use crate::error::{FleetError, FleetResult, ValidationErrors};
use crate::fleet::Fleet;
use crate::model::{
    DisplayState, DoctorRecord, HaType, NodeRecord, ResourceRecord, SyncStatus, TimelineAccess,
    TimelineRecord,
};
use crate::programs::{self, timeline};
use crate::store;

static NAME_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9-]{0,61}[a-z0-9]$").ok());

const PASSWORD_LEN: usize = 32;

/// Versions a cluster runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionTriple {
    pub engine: String,
    pub extras: String,
    pub minor: String,
}

/// A request for a new cluster.
#[derive(Debug, Clone)]
pub struct ClusterRequest {
    pub org_id: String,
    pub name: String,
    pub location: String,
    pub ha_type: HaType,
    pub machine_type: String,
    pub storage_gib: i64,
    /// Defaults from configuration when unset.
    pub versions: Option<VersionTriple>,
    pub db_name: Option<String>,
    pub db_user: Option<String>,
    pub domain: Option<String>,
}

impl ClusterRequest {
    /// A single-node cluster with a small machine.
    pub fn new(org_id: &str, name: &str, location: &str) -> Self {
        Self {
            org_id: org_id.to_string(),
            name: name.to_string(),
            location: location.to_string(),
            ha_type: HaType::None,
            machine_type: "n1-standard-2".to_string(),
            storage_gib: 64,
            versions: None,
            db_name: None,
            db_user: None,
            domain: None,
        }
    }

    pub fn ha(mut self, ha_type: HaType) -> Self {
        self.ha_type = ha_type;
        self
    }

    pub fn domain(mut self, domain: &str) -> Self {
        self.domain = Some(domain.to_string());
        self
    }
}

/// A request to restore a cluster into a new one.
#[derive(Debug, Clone)]
pub struct ForkRequest {
    pub parent_id: String,
    pub name: String,
    pub restore_target: DateTime<Utc>,
    pub recovery_target_lsn: Option<String>,
    pub ha_type: HaType,
    /// Parent's when unset.
    pub machine_type: Option<String>,
    /// Parent's when unset. Never smaller than the parent's.
    pub storage_gib: Option<i64>,
    pub logical_replication: bool,
    /// Install these versions instead of inheriting the parent's.
    pub version_upgrade: Option<VersionTriple>,
    pub domain: Option<String>,
}

impl ForkRequest {
    pub fn new(parent_id: &str, name: &str, restore_target: DateTime<Utc>) -> Self {
        Self {
            parent_id: parent_id.to_string(),
            name: name.to_string(),
            restore_target,
            recovery_target_lsn: None,
            ha_type: HaType::None,
            machine_type: None,
            storage_gib: None,
            logical_replication: false,
            version_upgrade: None,
            domain: None,
        }
    }
}

/// A random alphanumeric credential.
pub fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LEN)
        .map(char::from)
        .collect()
}

fn validate_name(name: &str, errors: &mut ValidationErrors) {
    if !NAME_RE.as_ref().is_some_and(|re| re.is_match(name)) {
        errors.add(
            "name",
            "must start with a letter, end with a letter or digit, \
             and contain 2-63 lowercase letters, digits or hyphens",
        );
    }
}

fn validate_machine(machine_type: &str, errors: &mut ValidationErrors) {
    if !MACHINE_TYPES.contains(&machine_type) {
        errors.add("machine_type", format!("unsupported machine type '{machine_type}'"));
    }
}

fn validate_storage(storage_gib: i64, config: &FleetConfig, errors: &mut ValidationErrors) {
    if !(MIN_STORAGE_GIB..=config.max_storage_gib).contains(&storage_gib) {
        errors.add(
            "storage_gib",
            format!(
                "must be between {MIN_STORAGE_GIB} and {} GiB",
                config.max_storage_gib
            ),
        );
    }
}

fn validate_versions(versions: &VersionTriple, errors: &mut ValidationErrors) {
    for (field, value) in [
        ("engine_version", &versions.engine),
        ("extras_version", &versions.extras),
        ("minor_version", &versions.minor),
    ] {
        if value.trim().is_empty() {
            errors.add(field, "must not be empty");
        }
    }
}

/// Check a cluster request without touching the database.
pub fn validate_cluster(req: &ClusterRequest, config: &FleetConfig) -> ValidationErrors {
    let mut errors = ValidationErrors::new();
    validate_name(&req.name, &mut errors);
    if !config.locations.iter().any(|l| l == &req.location) {
        errors.add("location", format!("unknown location '{}'", req.location));
    }
    validate_machine(&req.machine_type, &mut errors);
    validate_storage(req.storage_gib, config, &mut errors);
    if let Some(versions) = &req.versions {
        validate_versions(versions, &mut errors);
    }
    if req.org_id.trim().is_empty() {
        errors.add("org_id", "must not be empty");
    }
    errors
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn new_node(
    resource: &ResourceRecord,
    timeline_id: &str,
    access: TimelineAccess,
    representative_at: Option<DateTime<Utc>>,
    domain: Option<String>,
    now: DateTime<Utc>,
) -> NodeRecord {
    let id = Uuid::new_v4().to_string();
    let vm_name = format!("{}-{}", resource.name, short_id(&id));
    NodeRecord {
        address_name: format!("{vm_name}-ip"),
        vm_name,
        id,
        resource_id: resource.id.clone(),
        address_ip: None,
        engine_version: resource.engine_version.clone(),
        extras_version: resource.extras_version.clone(),
        minor_version: resource.minor_version.clone(),
        machine_type: resource.machine_type.clone(),
        storage_gib: resource.storage_gib,
        timeline_id: timeline_id.to_string(),
        timeline_access: access.as_ref().to_string(),
        representative_at,
        synchronization_status: SyncStatus::CatchingUp.as_ref().to_string(),
        domain,
        display_state: DisplayState::Creating.as_ref().to_string(),
        created_at: now,
    }
}

async fn start_node(
    engine: &Engine,
    fleet: &Fleet,
    node: &NodeRecord,
    now: DateTime<Utc>,
) -> FleetResult<()> {
    store::nodes::insert(&fleet.pool, node).await?;
    engine
        .create_process(NewProcess::new(node.id.clone(), programs::NODE, now))
        .await?;
    if node.domain.is_some() {
        engine.signal(&node.id, programs::signals::ADD_DOMAIN).await?;
    }
    Ok(())
}

/// Create a timeline row and its process.
pub async fn create_timeline(
    engine: &Engine,
    fleet: &Fleet,
    parent_id: Option<&str>,
    now: DateTime<Utc>,
) -> FleetResult<TimelineRecord> {
    create_timeline_with_id(engine, fleet, &Uuid::new_v4().to_string(), parent_id, now).await
}

/// Create the timeline `id` unless it exists. Safe to repeat after a crash
/// between the row insert and the process creation.
pub async fn create_timeline_with_id(
    engine: &Engine,
    fleet: &Fleet,
    id: &str,
    parent_id: Option<&str>,
    now: DateTime<Utc>,
) -> FleetResult<TimelineRecord> {
    let timeline = match store::timelines::get(&fleet.pool, id).await? {
        Some(existing) => existing,
        None => {
            let timeline = TimelineRecord {
                id: id.to_string(),
                parent_id: parent_id.map(str::to_string),
                bucket: fleet.config.backup_bucket.clone(),
                service_account_email: None,
                service_account_key: None,
                latest_backup_started_at: None,
                earliest_backup_completed_at: None,
                latest_backup_completed_at: None,
                created_at: now,
            };
            store::timelines::insert(&fleet.pool, &timeline).await?;
            timeline
        }
    };
    if engine.persistence().get_process(id).await?.is_none() {
        engine
            .create_process(NewProcess::new(timeline.id.clone(), programs::TIMELINE, now))
            .await?;
    }
    Ok(timeline)
}

async fn create_doctor(
    engine: &Engine,
    fleet: &Fleet,
    resource_id: &str,
    now: DateTime<Utc>,
) -> FleetResult<DoctorRecord> {
    let doctor = DoctorRecord {
        id: Uuid::new_v4().to_string(),
        resource_id: resource_id.to_string(),
        created_at: now,
    };
    store::doctors::insert(&fleet.pool, &doctor).await?;
    engine
        .create_process(NewProcess::new(doctor.id.clone(), programs::DOCTOR, now))
        .await?;
    Ok(doctor)
}

async fn ensure_name_free(
    fleet: &Fleet,
    org_id: &str,
    name: &str,
    errors: &mut ValidationErrors,
) -> FleetResult<()> {
    if store::resources::find_by_name(&fleet.pool, org_id, name)
        .await?
        .is_some()
    {
        errors.add("name", format!("'{name}' is already in use"));
    }
    Ok(())
}

/// Create a cluster: timeline, primary node, doctor and the cluster itself.
pub async fn create_cluster(
    engine: &Engine,
    fleet: &Fleet,
    req: ClusterRequest,
    now: DateTime<Utc>,
) -> FleetResult<ResourceRecord> {
    let mut errors = validate_cluster(&req, &fleet.config);
    ensure_name_free(fleet, &req.org_id, &req.name, &mut errors).await?;
    errors.into_result()?;

    let versions = req.versions.unwrap_or_else(|| VersionTriple {
        engine: fleet.config.default_engine_version.clone(),
        extras: fleet.config.default_extras_version.clone(),
        minor: fleet.config.default_minor_version.clone(),
    });

    let resource = ResourceRecord {
        id: Uuid::new_v4().to_string(),
        name: req.name,
        location: req.location,
        org_id: req.org_id,
        ha_type: req.ha_type.as_ref().to_string(),
        superuser_password: generate_password(),
        repl_password: generate_password(),
        db_name: req.db_name.unwrap_or_else(|| "postgres".to_string()),
        db_user: req.db_user.unwrap_or_else(|| "postgres".to_string()),
        db_user_password: generate_password(),
        engine_version: versions.engine,
        extras_version: versions.extras,
        minor_version: versions.minor,
        machine_type: req.machine_type,
        storage_gib: req.storage_gib,
        parent_id: None,
        restore_target: None,
        recovery_target_lsn: None,
        logical_replication: false,
        version_upgrade: false,
        display_state: None,
        service_account_email: None,
        created_at: now,
    };
    store::resources::insert(&fleet.pool, &resource).await?;

    let timeline = create_timeline(engine, fleet, None, now).await?;
    let primary = new_node(
        &resource,
        &timeline.id,
        TimelineAccess::Push,
        Some(now),
        req.domain,
        now,
    );
    start_node(engine, fleet, &primary, now).await?;
    create_doctor(engine, fleet, &resource.id, now).await?;
    engine
        .create_process(NewProcess::new(resource.id.clone(), programs::RESOURCE, now))
        .await?;

    info!(
        resource_id = %resource.id,
        name = %resource.name,
        ha_type = %resource.ha_type,
        "Cluster created"
    );
    Ok(resource)
}

/// Restore `parent_id` at a point in time into a new cluster. The new primary
/// fetches from the parent's timeline until it finishes recovery.
pub async fn create_fork(
    engine: &Engine,
    fleet: &Fleet,
    req: ForkRequest,
    now: DateTime<Utc>,
) -> FleetResult<ResourceRecord> {
    let parent = fleet.resource(&req.parent_id).await?;
    let mut errors = ValidationErrors::new();

    validate_name(&req.name, &mut errors);
    ensure_name_free(fleet, &parent.org_id, &req.name, &mut errors).await?;

    let machine_type = req.machine_type.unwrap_or_else(|| parent.machine_type.clone());
    validate_machine(&machine_type, &mut errors);

    let storage_gib = req.storage_gib.unwrap_or(parent.storage_gib);
    validate_storage(storage_gib, &fleet.config, &mut errors);
    if storage_gib < parent.storage_gib {
        errors.add(
            "storage_gib",
            format!("must be at least the parent's {} GiB", parent.storage_gib),
        );
    }
    if let Some(versions) = &req.version_upgrade {
        validate_versions(versions, &mut errors);
    }

    let parent_primary = store::nodes::representative(&fleet.pool, &parent.id).await?;
    match &parent_primary {
        None => errors.add("parent_id", "parent has no primary to restore from"),
        Some(primary) => {
            let parent_timeline = fleet.timeline(&primary.timeline_id).await?;
            match timeline::restore_window(&parent_timeline, fleet.config.e2e, now) {
                None => errors.add("restore_target", "parent has no completed backup yet"),
                Some((earliest, latest)) => {
                    if !timeline::window_contains((earliest, latest), req.restore_target) {
                        errors.add(
                            "restore_target",
                            format!(
                                "must be between {} and {}",
                                earliest.to_rfc3339(),
                                latest.to_rfc3339()
                            ),
                        );
                    }
                }
            }
        }
    }
    errors.into_result()?;

    let parent_primary = parent_primary.ok_or_else(|| {
        FleetError::InvalidState(format!("resource {} has no primary", parent.id))
    })?;
    let (versions, version_upgrade) = match req.version_upgrade {
        Some(v) => (v, true),
        None => (
            VersionTriple {
                engine: parent.engine_version.clone(),
                extras: parent.extras_version.clone(),
                minor: parent.minor_version.clone(),
            },
            false,
        ),
    };

    let resource = ResourceRecord {
        id: Uuid::new_v4().to_string(),
        name: req.name,
        location: parent.location.clone(),
        org_id: parent.org_id.clone(),
        ha_type: req.ha_type.as_ref().to_string(),
        superuser_password: parent.superuser_password.clone(),
        repl_password: parent.repl_password.clone(),
        db_name: parent.db_name.clone(),
        db_user: parent.db_user.clone(),
        db_user_password: parent.db_user_password.clone(),
        engine_version: versions.engine,
        extras_version: versions.extras,
        minor_version: versions.minor,
        machine_type,
        storage_gib,
        parent_id: Some(parent.id.clone()),
        restore_target: Some(req.restore_target),
        recovery_target_lsn: req.recovery_target_lsn,
        logical_replication: req.logical_replication,
        version_upgrade,
        display_state: None,
        service_account_email: None,
        created_at: now,
    };
    store::resources::insert(&fleet.pool, &resource).await?;

    let primary = new_node(
        &resource,
        &parent_primary.timeline_id,
        TimelineAccess::Fetch,
        Some(now),
        req.domain,
        now,
    );
    start_node(engine, fleet, &primary, now).await?;
    create_doctor(engine, fleet, &resource.id, now).await?;
    engine
        .create_process(NewProcess::new(resource.id.clone(), programs::RESOURCE, now))
        .await?;

    info!(
        resource_id = %resource.id,
        parent_id = %parent.id,
        restore_target = %req.restore_target,
        "Fork created"
    );
    Ok(resource)
}

/// Add a standby replicating from `primary`.
pub async fn add_standby(
    engine: &Engine,
    fleet: &Fleet,
    resource: &ResourceRecord,
    primary: &NodeRecord,
    now: DateTime<Utc>,
) -> FleetResult<NodeRecord> {
    let standby = new_node(
        resource,
        &primary.timeline_id,
        TimelineAccess::Fetch,
        None,
        None,
        now,
    );
    start_node(engine, fleet, &standby, now).await?;
    info!(resource_id = %resource.id, node_id = %standby.id, "Standby added");
    Ok(standby)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ClusterRequest {
        ClusterRequest::new("org-1", "orders-db", "us-central1")
    }

    #[test]
    fn test_valid_request_passes() {
        assert!(validate_cluster(&request(), &FleetConfig::default()).is_empty());
    }

    #[test]
    fn test_name_rules() {
        let config = FleetConfig::default();
        for bad in ["a", "1db", "Orders", "orders-", "orders_db", "a".repeat(64).as_str()] {
            let mut req = request();
            req.name = bad.to_string();
            let errors = validate_cluster(&req, &config);
            assert!(errors.get("name").is_some(), "{bad} should be rejected");
        }
        for good in ["ab", "db-1", "a".repeat(63).as_str()] {
            let mut req = request();
            req.name = good.to_string();
            assert!(validate_cluster(&req, &config).is_empty(), "{good} should pass");
        }
    }

    #[test]
    fn test_collects_every_field_error() {
        let mut req = request();
        req.location = "mars-north1".to_string();
        req.machine_type = "n1-giant-512".to_string();
        req.storage_gib = 5;

        let errors = validate_cluster(&req, &FleetConfig::default());
        assert!(errors.get("location").is_some());
        assert!(errors.get("machine_type").is_some());
        assert!(errors.get("storage_gib").is_some());
        assert!(errors.get("name").is_none());
    }

    #[test]
    fn test_storage_upper_bound_is_inclusive() {
        let config = FleetConfig::default();
        let mut req = request();
        req.storage_gib = config.max_storage_gib;
        assert!(validate_cluster(&req, &config).is_empty());

        req.storage_gib = config.max_storage_gib + 1;
        assert!(validate_cluster(&req, &config).get("storage_gib").is_some());
    }

    #[test]
    fn test_generated_passwords() {
        let a = generate_password();
        let b = generate_password();
        assert_eq!(a.len(), PASSWORD_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }
}
