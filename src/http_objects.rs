use std::collections::BTreeMap;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use data_model::{
    requests::RequestLifecycle,
    DestroyRequest,
    FleetRecord,
    GoldenTemplateRecord,
    OrphanStatus,
    ProvisionRequest,
    SessionState,
    TelemetryValidationError,
    TriggerContext,
};
use processor::{request_log::RequestLogSnapshot, SchedulerError};
use serde::{Deserialize, Serialize};
use state_store::TelemetryRoute;
use thopter_utils::{ModeTransitionError, OperatingMode};
use tracing::error;
use utoipa::ToSchema;

#[derive(Debug, ToSchema, Serialize, Deserialize)]
pub struct FleetAPIError {
    #[serde(skip)]
    status_code: StatusCode,
    message: String,
}

impl FleetAPIError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn internal_error(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string().as_str())
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn conflict(message: &str) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }
}

impl IntoResponse for FleetAPIError {
    fn into_response(self) -> Response {
        error!("API Error: {} - {}", self.status_code, self.message);
        (self.status_code, self.message).into_response()
    }
}

impl From<serde_json::Error> for FleetAPIError {
    fn from(e: serde_json::Error) -> Self {
        Self::bad_request(&e.to_string())
    }
}

impl From<TelemetryValidationError> for FleetAPIError {
    fn from(e: TelemetryValidationError) -> Self {
        Self::bad_request(&e.to_string())
    }
}

impl From<ModeTransitionError> for FleetAPIError {
    fn from(e: ModeTransitionError) -> Self {
        Self::conflict(&e.to_string())
    }
}

impl From<SchedulerError> for FleetAPIError {
    fn from(e: SchedulerError) -> Self {
        let message = e.to_string();
        match e {
            SchedulerError::UnknownVm(_) => Self::not_found(&message),
            SchedulerError::InvalidRequest(_) => Self::bad_request(&message),
            SchedulerError::CapacityExceeded { .. } => Self::conflict(&message),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Session {
    pub activity_state: String,
    pub process_state: String,
    pub last_activity: u64,
    pub idle_since: Option<u64>,
    pub screen_dump: String,
    pub reported_at: u64,
}

impl From<SessionState> for Session {
    fn from(session: SessionState) -> Self {
        Self {
            activity_state: session.activity_state.to_string(),
            process_state: session.process_state.to_string(),
            last_activity: session.last_activity,
            idle_since: session.idle_since,
            screen_dump: session.screen_dump,
            reported_at: session.reported_at,
        }
    }
}

/// The issue or comment that caused a VM to be provisioned.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Trigger {
    pub repository: String,
    pub item_number: u64,
    pub title: String,
    pub author: String,
    pub url: String,
    pub instance_key: String,
    pub command_line: String,
    pub flags: BTreeMap<String, String>,
    pub text: String,
}

impl From<TriggerContext> for Trigger {
    fn from(trigger: TriggerContext) -> Self {
        Self {
            repository: trigger.repository,
            item_number: trigger.item_number,
            title: trigger.title,
            author: trigger.author,
            url: trigger.url,
            instance_key: trigger.instance_key,
            command_line: trigger.command.line,
            flags: trigger.command.flags,
            text: trigger.command.text,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Orphan {
    /// `healthy`, `startup_grace` or `orphaned`
    pub status: String,
    pub reason: Option<String>,
    pub last_seen: Option<u64>,
    pub seconds_since_last_update: Option<u64>,
}

impl From<OrphanStatus> for Orphan {
    fn from(status: OrphanStatus) -> Self {
        match status {
            OrphanStatus::Healthy => Self::plain("healthy"),
            OrphanStatus::StartupGrace => Self::plain("startup_grace"),
            OrphanStatus::Orphaned {
                reason,
                last_seen,
                seconds_since_last_update,
            } => Self {
                status: "orphaned".to_string(),
                reason: Some(reason.to_string()),
                last_seen,
                seconds_since_last_update,
            },
        }
    }
}

impl Orphan {
    fn plain(status: &str) -> Self {
        Self {
            status: status.to_string(),
            reason: None,
            last_seen: None,
            seconds_since_last_update: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FleetVm {
    pub id: String,
    pub name: String,
    pub lifecycle_state: String,
    pub region: String,
    pub image: String,
    pub created_at: u64,
    pub destroy_requested: bool,
    pub session: Option<Session>,
    pub trigger: Option<Trigger>,
    pub orphan: Orphan,
    pub work_branch: String,
    pub terminal_url: Option<String>,
}

impl FleetVm {
    pub fn from_record(
        record: FleetRecord,
        orphan: OrphanStatus,
        terminal_base_url: Option<&str>,
    ) -> Self {
        let work_branch = record.work_branch();
        let terminal_url = record.terminal_url(terminal_base_url);
        Self {
            id: record.infra.id.get().to_string(),
            name: record.infra.name,
            lifecycle_state: record.infra.lifecycle_state.to_string(),
            region: record.infra.region,
            image: record.infra.image,
            created_at: record.infra.created_at,
            destroy_requested: record.control.destroy_requested,
            session: record.session.map(Session::from),
            trigger: record.trigger.map(Trigger::from),
            orphan: orphan.into(),
            work_branch,
            terminal_url,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct FleetList {
    pub vms: Vec<FleetVm>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct GoldenTemplate {
    pub id: String,
    pub template_name: String,
    pub lifecycle_state: String,
    pub session: Option<Session>,
}

impl From<GoldenTemplateRecord> for GoldenTemplate {
    fn from(record: GoldenTemplateRecord) -> Self {
        Self {
            id: record.id.get().to_string(),
            template_name: record.template_name,
            lifecycle_state: record.lifecycle_state.to_string(),
            session: record.session.map(Session::from),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct GoldenTemplateList {
    pub templates: Vec<GoldenTemplate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RequestInfo {
    pub id: String,
    pub status: String,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub error: Option<String>,
}

impl From<RequestLifecycle> for RequestInfo {
    fn from(lifecycle: RequestLifecycle) -> Self {
        Self {
            id: lifecycle.id.get().to_string(),
            status: lifecycle.status.to_string(),
            created_at: lifecycle.created_at,
            started_at: lifecycle.started_at,
            completed_at: lifecycle.completed_at,
            error: lifecycle.error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProvisionRequestView {
    #[serde(flatten)]
    pub request: RequestInfo,
    pub repository: String,
    pub template: Option<String>,
    pub prompt: Option<String>,
    pub vm_id: Option<String>,
    pub trigger: Option<Trigger>,
}

impl From<ProvisionRequest> for ProvisionRequestView {
    fn from(request: ProvisionRequest) -> Self {
        Self {
            request: request.lifecycle.into(),
            repository: request.repository,
            template: request.template,
            prompt: request.prompt,
            vm_id: request.vm_id.map(|id| id.get().to_string()),
            trigger: request.trigger.map(Trigger::from),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DestroyRequestView {
    #[serde(flatten)]
    pub request: RequestInfo,
    pub vm_id: String,
    pub reason: String,
    pub detail: Option<String>,
}

impl From<DestroyRequest> for DestroyRequestView {
    fn from(request: DestroyRequest) -> Self {
        Self {
            request: request.lifecycle.into(),
            vm_id: request.vm_id.get().to_string(),
            reason: request.reason.to_string(),
            detail: request.detail,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ProvisionRequestList {
    pub pending: Vec<ProvisionRequestView>,
    pub processing: Vec<ProvisionRequestView>,
    pub completed: Vec<ProvisionRequestView>,
    pub failed: Vec<ProvisionRequestView>,
}

impl From<RequestLogSnapshot<ProvisionRequest>> for ProvisionRequestList {
    fn from(log: RequestLogSnapshot<ProvisionRequest>) -> Self {
        Self {
            pending: log.pending.into_iter().map(Into::into).collect(),
            processing: log.processing.into_iter().map(Into::into).collect(),
            completed: log.completed.into_iter().map(Into::into).collect(),
            failed: log.failed.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DestroyRequestList {
    pub pending: Vec<DestroyRequestView>,
    pub processing: Vec<DestroyRequestView>,
    pub completed: Vec<DestroyRequestView>,
    pub failed: Vec<DestroyRequestView>,
}

impl From<RequestLogSnapshot<DestroyRequest>> for DestroyRequestList {
    fn from(log: RequestLogSnapshot<DestroyRequest>) -> Self {
        Self {
            pending: log.pending.into_iter().map(Into::into).collect(),
            processing: log.processing.into_iter().map(Into::into).collect(),
            completed: log.completed.into_iter().map(Into::into).collect(),
            failed: log.failed.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateProvisionRequest {
    pub repository: String,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct DestroyVm {
    /// `requested` when absent.
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TelemetryAck {
    pub routed: String,
}

impl From<TelemetryRoute> for TelemetryAck {
    fn from(route: TelemetryRoute) -> Self {
        let routed = match route {
            TelemetryRoute::Fleet => "fleet",
            TelemetryRoute::GoldenTemplate => "golden_template",
            TelemetryRoute::Dropped => "dropped",
        };
        Self {
            routed: routed.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct Mode {
    pub mode: String,
}

impl From<OperatingMode> for Mode {
    fn from(mode: OperatingMode) -> Self {
        Self {
            mode: mode.to_string(),
        }
    }
}
