pub mod orphan;
pub mod requests;
pub mod telemetry;
pub mod test_objects;

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
};

pub use orphan::{derive_orphan_status, OrphanReason, OrphanStatus, ORPHAN_THRESHOLD_MS};
pub use requests::{
    DestroyReason,
    DestroyRequest,
    ProvisionRequest,
    ProvisionRequestBuilder,
    RequestId,
    RequestStatus,
};
use serde::{Deserialize, Serialize};
pub use telemetry::{TelemetryPayload, TelemetryUpdate, TelemetryValidationError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct VmId(String);

impl VmId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for VmId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for VmId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LifecycleState {
    Started,
    Stopped,
    Suspended,
    Destroyed,
}

/// One entry of the VM provider's inventory listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Machine {
    pub id: VmId,
    pub name: String,
    pub lifecycle_state: LifecycleState,
    pub region: String,
    pub image: String,
    /// Absent when the provider reports no usable creation time.
    #[serde(default)]
    pub created_at: Option<u64>,
}

/// Field group owned by reconciliation. Always rebuilt from the provider
/// snapshot, never from another source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InfraState {
    pub id: VmId,
    pub name: String,
    pub lifecycle_state: LifecycleState,
    pub region: String,
    pub image: String,
    pub created_at: u64,
}

impl InfraState {
    /// `first_seen_ms` stands in for the creation time when the provider
    /// did not report one.
    pub fn from_machine(machine: Machine, first_seen_ms: u64) -> Self {
        Self {
            id: machine.id,
            name: machine.name,
            lifecycle_state: machine.lifecycle_state,
            region: machine.region,
            image: machine.image,
            created_at: machine.created_at.unwrap_or(first_seen_ms),
        }
    }
}

/// Field group owned by the scheduler and the dashboard.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlState {
    pub destroy_requested: bool,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActivityState {
    Active,
    Idle,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ProcessState {
    Running,
    NotFound,
}

/// Field group owned by telemetry ingestion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionState {
    pub activity_state: ActivityState,
    pub process_state: ProcessState,
    pub last_activity: u64,
    pub idle_since: Option<u64>,
    pub screen_dump: String,
    /// Observer-side time of the report.
    pub reported_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceComment {
    pub id: u64,
    pub author: String,
    pub body: String,
    pub created_at: u64,
}

/// Command line found in an issue body or comment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParsedCommand {
    pub line: String,
    pub flags: BTreeMap<String, String>,
    pub text: String,
}

impl ParsedCommand {
    pub fn flag(&self, name: &str) -> Option<&str> {
        self.flags.get(name).map(String::as_str)
    }
}

/// Field group owned by provisioning: the external event that caused the VM
/// to exist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerContext {
    pub repository: String,
    pub item_number: u64,
    pub title: String,
    pub body: String,
    pub author: String,
    pub url: String,
    pub comments: Vec<SourceComment>,
    pub instance_key: String,
    pub command: ParsedCommand,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FleetRecord {
    pub infra: InfraState,
    pub control: ControlState,
    pub session: Option<SessionState>,
    pub trigger: Option<TriggerContext>,
}

impl FleetRecord {
    pub fn new(infra: InfraState) -> Self {
        Self {
            infra,
            control: ControlState::default(),
            session: None,
            trigger: None,
        }
    }

    pub fn id(&self) -> &VmId {
        &self.infra.id
    }

    pub fn is_started(&self) -> bool {
        self.infra.lifecycle_state == LifecycleState::Started
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.infra.created_at)
    }

    pub fn work_branch(&self) -> String {
        match &self.trigger {
            Some(trigger) => format!("thopter/issue-{}", trigger.item_number),
            None => format!("thopter/{}", self.infra.id),
        }
    }

    pub fn terminal_url(&self, base_url: Option<&str>) -> Option<String> {
        base_url.map(|base| format!("{}/{}", base.trim_end_matches('/'), self.infra.id))
    }
}

/// A VM kept around as the source image for new fleet VMs. Lives in its own
/// map and never mixes with [`FleetRecord`]s.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GoldenTemplateRecord {
    pub id: VmId,
    pub template_name: String,
    pub lifecycle_state: LifecycleState,
    pub session: Option<SessionState>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_objects::tests::{mock_machine, mock_record, mock_trigger_context};

    #[test]
    fn test_work_branch() {
        let mut record = mock_record("thopter-m1", 0);
        assert_eq!(record.work_branch(), "thopter/thopter-m1");
        record.trigger = Some(mock_trigger_context(42));
        assert_eq!(record.work_branch(), "thopter/issue-42");
    }

    #[test]
    fn test_terminal_url() {
        let record = mock_record("m1", 0);
        assert_eq!(record.terminal_url(None), None);
        assert_eq!(
            record.terminal_url(Some("https://term.example.com/")),
            Some("https://term.example.com/m1".to_string())
        );
    }

    #[test]
    fn test_missing_creation_time_uses_first_seen() {
        let mut machine = mock_machine("m1", "thopter-m1", 10);
        assert_eq!(InfraState::from_machine(machine.clone(), 99).created_at, 10);
        machine.created_at = None;
        assert_eq!(InfraState::from_machine(machine, 99).created_at, 99);
    }

    #[test]
    fn test_lifecycle_state_wire_format() {
        assert_eq!(
            serde_json::to_string(&LifecycleState::Suspended).unwrap(),
            "\"suspended\""
        );
        assert_eq!(
            "started".parse::<LifecycleState>().unwrap(),
            LifecycleState::Started
        );
        assert_eq!(
            serde_json::from_str::<ProcessState>("\"notFound\"").unwrap(),
            ProcessState::NotFound
        );
    }
}
