// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain entities and their enumerated fields.
//!
//! Records mirror table rows and keep enumerated columns as strings, the way
//! they are stored. Typed views are available through accessor methods, which
//! fall back to a safe default when a row carries a value this build does not
//! know.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// High-availability mode of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, AsRefStr, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HaType {
    /// Primary only.
    None,
    /// One asynchronous standby.
    Async,
    /// Two standbys, synchronous commit.
    Sync,
}

impl HaType {
    /// Standbys the cluster keeps next to its primary.
    pub fn required_standby_count(self) -> usize {
        match self {
            Self::None => 0,
            Self::Async => 1,
            Self::Sync => 2,
        }
    }

    /// Total nodes the cluster keeps, primary included.
    pub fn target_node_count(self) -> usize {
        1 + self.required_standby_count()
    }
}

/// How a node uses its timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, Display)]
#[strum(serialize_all = "snake_case")]
pub enum TimelineAccess {
    /// Archives WAL into the timeline. Exactly one node per timeline.
    Push,
    /// Restores from the timeline.
    Fetch,
}

/// Replication progress of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SyncStatus {
    /// Still replaying towards the primary.
    CatchingUp,
    /// Serving.
    Ready,
}

/// User-visible state of a node or cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, AsRefStr, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DisplayState {
    /// Being provisioned.
    Creating,
    /// Serving.
    Running,
    /// An update or resize is in progress.
    Updating,
    /// Health checks are failing.
    Unavailable,
    /// Needs an operator.
    Failed,
    /// Stopped on request.
    Stopped,
    /// Being torn down.
    Deleting,
}

impl DisplayState {
    /// Severity used to pick the worst state of a cluster.
    pub fn rank(self) -> u8 {
        match self {
            Self::Failed => 6,
            Self::Deleting => 5,
            Self::Updating => 4,
            Self::Unavailable => 3,
            Self::Creating => 2,
            Self::Stopped => 1,
            Self::Running => 0,
        }
    }

    /// Worst of a set of states; `Creating` for an empty set.
    pub fn worst(states: impl IntoIterator<Item = DisplayState>) -> DisplayState {
        states
            .into_iter()
            .max_by_key(|s| s.rank())
            .unwrap_or(Self::Creating)
    }
}

/// Lifecycle of an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, AsRefStr, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PageStatus {
    /// Recorded, not yet delivered to the notifier.
    New,
    /// Delivered.
    Triggered,
    /// A human has seen it.
    Acknowledged,
    /// Closed.
    Resolved,
}

/// Incident and health-check severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, AsRefStr, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Severity {
    /// Page someone now.
    Critical,
    /// Needs attention.
    Error,
    /// Worth a look.
    Warning,
    /// Informational.
    Info,
}

/// Nodes a health check targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, Display)]
pub enum ServerType {
    /// The representative node.
    #[strum(serialize = "primary")]
    Primary,
    /// Every other node.
    #[strum(serialize = "standby")]
    Standby,
    /// All nodes.
    #[strum(serialize = "*")]
    Any,
}

impl ServerType {
    /// Whether a node with the given role is targeted.
    pub fn matches(self, is_primary: bool) -> bool {
        match self {
            Self::Primary => is_primary,
            Self::Standby => !is_primary,
            Self::Any => true,
        }
    }
}

/// How a health-check result is judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ResponseType {
    /// Fails on `t`/`true`.
    Bool,
    /// Fails on any returned row.
    Rows,
}

/// Origin of a health-check query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, Display)]
#[strum(serialize_all = "snake_case")]
pub enum QueryKind {
    /// Shipped with the control plane.
    System,
    /// Added by a user.
    User,
}

fn parse_or<T: FromStr>(raw: &str, fallback: T) -> T {
    raw.parse().unwrap_or(fallback)
}

/// A database cluster.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ResourceRecord {
    /// Also the id of the resource process.
    pub id: String,
    pub name: String,
    pub location: String,
    pub org_id: String,
    pub ha_type: String,
    pub superuser_password: String,
    pub repl_password: String,
    pub db_name: String,
    pub db_user: String,
    pub db_user_password: String,
    /// Target versions. Nodes converge to these.
    pub engine_version: String,
    pub extras_version: String,
    pub minor_version: String,
    pub machine_type: String,
    pub storage_gib: i64,
    /// Set for forks until leaders are swapped with the parent.
    pub parent_id: Option<String>,
    pub restore_target: Option<DateTime<Utc>>,
    pub recovery_target_lsn: Option<String>,
    pub logical_replication: bool,
    pub version_upgrade: bool,
    /// Overrides the computed display state when set.
    pub display_state: Option<String>,
    pub service_account_email: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ResourceRecord {
    /// Parsed HA type.
    pub fn ha(&self) -> HaType {
        parse_or(&self.ha_type, HaType::None)
    }

    /// Parsed display override.
    pub fn display_override(&self) -> Option<DisplayState> {
        self.display_state.as_deref().and_then(|s| s.parse().ok())
    }

    /// Whether this cluster was restored from another one.
    pub fn is_fork(&self) -> bool {
        self.parent_id.is_some()
    }

    /// Name of the logical replication publication/subscription pair.
    pub fn logical_slot_name(&self) -> String {
        format!("drydock_{}", self.id.replace('-', "_"))
    }
}

/// One database server of a cluster.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct NodeRecord {
    pub id: String,
    pub resource_id: String,
    /// VM name, also the host name agents and clients connect to.
    pub vm_name: String,
    pub address_name: String,
    pub address_ip: Option<String>,
    pub engine_version: String,
    pub extras_version: String,
    pub minor_version: String,
    pub machine_type: String,
    pub storage_gib: i64,
    pub timeline_id: String,
    pub timeline_access: String,
    /// Non-null exactly on the node acting as primary.
    pub representative_at: Option<DateTime<Utc>>,
    pub synchronization_status: String,
    pub domain: Option<String>,
    pub display_state: String,
    pub created_at: DateTime<Utc>,
}

impl NodeRecord {
    /// Host used for agent calls and queries.
    pub fn host(&self) -> &str {
        &self.vm_name
    }

    /// Whether this node is the cluster's primary.
    pub fn is_representative(&self) -> bool {
        self.representative_at.is_some()
    }

    /// Parsed timeline access.
    pub fn access(&self) -> TimelineAccess {
        parse_or(&self.timeline_access, TimelineAccess::Fetch)
    }

    /// Parsed synchronization status.
    pub fn sync_status(&self) -> SyncStatus {
        parse_or(&self.synchronization_status, SyncStatus::CatchingUp)
    }

    /// Parsed display state.
    pub fn display(&self) -> DisplayState {
        parse_or(&self.display_state, DisplayState::Creating)
    }

    /// Name the node uses as a replication client.
    pub fn application_name(&self) -> String {
        self.vm_name.replace('-', "_")
    }
}

/// A backup lineage in the backup bucket.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct TimelineRecord {
    pub id: String,
    /// Lineage this one branched from.
    pub parent_id: Option<String>,
    pub bucket: String,
    pub service_account_email: Option<String>,
    /// Base64 encoded key of the scoped identity.
    pub service_account_key: Option<String>,
    pub latest_backup_started_at: Option<DateTime<Utc>>,
    pub earliest_backup_completed_at: Option<DateTime<Utc>>,
    pub latest_backup_completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TimelineRecord {
    /// Key prefix of this lineage inside the bucket.
    pub fn prefix(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct DoctorRecord {
    pub id: String,
    pub resource_id: String,
    pub created_at: DateTime<Utc>,
}

/// A health-check query: a template (no doctor) or a per-doctor copy whose
/// unset fields fall back to its template.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct QueryRecord {
    pub id: String,
    pub parent_id: Option<String>,
    pub doctor_id: Option<String>,
    pub kind: String,
    pub name: Option<String>,
    pub db_name: Option<String>,
    pub schedule: Option<String>,
    pub sql: Option<String>,
    pub check_fn: Option<String>,
    pub severity: Option<String>,
    pub response_type: Option<String>,
    pub server_type: Option<String>,
    pub last_checked: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl QueryRecord {
    /// Whether this row is a template.
    pub fn is_template(&self) -> bool {
        self.doctor_id.is_none()
    }
}

/// A durable incident.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct PageRecord {
    pub id: String,
    /// Deduplication key. At most one non-resolved incident per tag.
    pub tag: String,
    pub summary: String,
    pub severity: String,
    pub status: String,
    /// JSON object.
    pub details: String,
    pub query_id: Option<String>,
    pub db_name: Option<String>,
    pub node_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl PageRecord {
    /// Parsed status.
    pub fn page_status(&self) -> PageStatus {
        parse_or(&self.status, PageStatus::New)
    }

    /// Parsed details.
    pub fn details_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.details).unwrap_or(serde_json::Value::Null)
    }

    /// Whether the incident is still open.
    pub fn is_open(&self) -> bool {
        self.page_status() != PageStatus::Resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_standby_counts() {
        assert_eq!(HaType::None.required_standby_count(), 0);
        assert_eq!(HaType::Async.required_standby_count(), 1);
        assert_eq!(HaType::Sync.required_standby_count(), 2);
        assert_eq!(HaType::Sync.target_node_count(), 3);
    }

    #[test]
    fn test_enum_strings() {
        assert_eq!("sync".parse::<HaType>().unwrap(), HaType::Sync);
        assert_eq!(TimelineAccess::Push.as_ref(), "push");
        assert_eq!(SyncStatus::CatchingUp.as_ref(), "catching_up");
        assert_eq!("*".parse::<ServerType>().unwrap(), ServerType::Any);
        assert_eq!(ServerType::Primary.to_string(), "primary");
        assert!("mirror".parse::<ServerType>().is_err());
    }

    #[test]
    fn test_worst_display_state() {
        use DisplayState::*;

        assert_eq!(DisplayState::worst([Running, Running]), Running);
        assert_eq!(DisplayState::worst([Running, Unavailable, Creating]), Unavailable);
        assert_eq!(DisplayState::worst([Updating, Unavailable]), Updating);
        assert_eq!(DisplayState::worst([Stopped, Failed, Updating]), Failed);
        assert_eq!(DisplayState::worst([Stopped, Running]), Stopped);
        assert_eq!(DisplayState::worst([]), Creating);
    }

    #[test]
    fn test_server_type_matches() {
        assert!(ServerType::Primary.matches(true));
        assert!(!ServerType::Primary.matches(false));
        assert!(ServerType::Standby.matches(false));
        assert!(ServerType::Any.matches(true) && ServerType::Any.matches(false));
    }
}
