use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json,
    Router,
};
use data_model::{DestroyReason, RequestId, TelemetryPayload, TelemetryUpdate, VmId};
use processor::RequestScheduler;
use state_store::FleetState;
use thopter_utils::{ModeController, OperatingMode};
use tracing::info;
use utoipa::OpenApi;

use crate::{
    config::ServerConfig,
    http_objects::{
        CreateProvisionRequest,
        DestroyRequestList,
        DestroyRequestView,
        DestroyVm,
        FleetAPIError,
        FleetList,
        FleetVm,
        GoldenTemplate,
        GoldenTemplateList,
        Mode,
        Orphan,
        ProvisionRequestList,
        ProvisionRequestView,
        RequestInfo,
        Session,
        TelemetryAck,
        Trigger,
    },
};

#[derive(OpenApi)]
#[openapi(
        paths(
            health,
            ingest_telemetry,
            list_fleet,
            get_vm,
            destroy_vm,
            list_templates,
            list_provision_requests,
            get_provision_request,
            create_provision_request,
            list_destroy_requests,
            get_destroy_request,
            get_mode,
            set_mode,
        ),
        components(
            schemas(
                FleetAPIError,
                FleetVm,
                FleetList,
                Session,
                Trigger,
                Orphan,
                GoldenTemplate,
                GoldenTemplateList,
                RequestInfo,
                ProvisionRequestView,
                ProvisionRequestList,
                DestroyRequestView,
                DestroyRequestList,
                CreateProvisionRequest,
                DestroyVm,
                TelemetryAck,
                Mode,
            )
        ),
        tags(
            (name = "thopter", description = "Thopter fleet API")
        )
    )]
pub struct ApiDoc;

#[derive(Clone)]
pub struct RouteState {
    pub fleet_state: Arc<FleetState>,
    pub scheduler: Arc<RequestScheduler>,
    pub mode: ModeController,
    pub config: Arc<ServerConfig>,
}

pub fn create_routes(route_state: RouteState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/internal/telemetry", post(ingest_telemetry))
        .route("/fleet", get(list_fleet))
        .route("/fleet/{id}", get(get_vm))
        .route("/fleet/{id}/destroy", post(destroy_vm))
        .route("/templates", get(list_templates))
        .route(
            "/requests/provision",
            get(list_provision_requests).post(create_provision_request),
        )
        .route("/requests/provision/{id}", get(get_provision_request))
        .route("/requests/destroy", get(list_destroy_requests))
        .route("/requests/destroy/{id}", get(get_destroy_request))
        .route("/mode", get(get_mode).put(set_mode))
        .route("/docs/openapi.json", get(openapi))
        .with_state(route_state)
}

async fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "operations",
    responses(
        (status = 200, description = "Server is up"),
    ),
)]
async fn health() -> &'static str {
    "ok"
}

/// Session report from the observer inside a VM
#[utoipa::path(
    post,
    path = "/internal/telemetry",
    tag = "operations",
    request_body(content = Object, content_type = "application/json"),
    responses(
        (status = 202, description = "Report accepted", body = TelemetryAck),
        (status = BAD_REQUEST, description = "Malformed report")
    ),
)]
async fn ingest_telemetry(
    State(state): State<RouteState>,
    body: Bytes,
) -> Result<(StatusCode, Json<TelemetryAck>), FleetAPIError> {
    let payload: TelemetryPayload = serde_json::from_slice(&body)?;
    let update = TelemetryUpdate::try_from(payload)?;
    let route = state.fleet_state.update_from_telemetry(update).await;
    Ok((StatusCode::ACCEPTED, Json(route.into())))
}

fn fleet_vm(state: &RouteState, record: data_model::FleetRecord) -> FleetVm {
    let orphan = state.fleet_state.orphan_status(&record);
    FleetVm::from_record(record, orphan, state.config.fleet.terminal_base_url.as_deref())
}

#[utoipa::path(
    get,
    path = "/fleet",
    tag = "operations",
    responses(
        (status = 200, description = "All fleet VMs", body = FleetList),
    ),
)]
async fn list_fleet(State(state): State<RouteState>) -> Json<FleetList> {
    let vms = state
        .fleet_state
        .get_all()
        .await
        .into_iter()
        .map(|record| fleet_vm(&state, record))
        .collect();
    Json(FleetList { vms })
}

#[utoipa::path(
    get,
    path = "/fleet/{id}",
    params(("id" = String, Path, description = "VM id")),
    tag = "operations",
    responses(
        (status = 200, description = "One fleet VM", body = FleetVm),
        (status = NOT_FOUND, description = "Unknown VM")
    ),
)]
async fn get_vm(
    State(state): State<RouteState>,
    Path(id): Path<String>,
) -> Result<Json<FleetVm>, FleetAPIError> {
    let record = state
        .fleet_state
        .get_by_id(&VmId::from(id.as_str()))
        .await
        .ok_or_else(|| FleetAPIError::not_found(&format!("vm {} not found", id)))?;
    Ok(Json(fleet_vm(&state, record)))
}

/// Request destruction of a fleet VM
#[utoipa::path(
    post,
    path = "/fleet/{id}/destroy",
    params(("id" = String, Path, description = "VM id")),
    request_body = DestroyVm,
    tag = "operations",
    responses(
        (status = 202, description = "Destroy request queued", body = DestroyRequestView),
        (status = BAD_REQUEST, description = "Invalid reason"),
        (status = NOT_FOUND, description = "Unknown VM")
    ),
)]
async fn destroy_vm(
    State(state): State<RouteState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<DestroyRequestView>), FleetAPIError> {
    let body: DestroyVm = if body.is_empty() {
        DestroyVm::default()
    } else {
        serde_json::from_slice(&body)?
    };
    let reason = match body.reason.as_deref() {
        None => DestroyReason::Requested,
        Some(reason) => reason
            .parse::<DestroyReason>()
            .map_err(|_| FleetAPIError::bad_request(&format!("unknown reason: {}", reason)))?,
    };
    let request = state
        .scheduler
        .create_destroy_request(VmId::from(id), reason, body.detail)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(request.into())))
}

#[utoipa::path(
    get,
    path = "/templates",
    tag = "operations",
    responses(
        (status = 200, description = "Golden template VMs", body = GoldenTemplateList),
    ),
)]
async fn list_templates(State(state): State<RouteState>) -> Json<GoldenTemplateList> {
    let templates = state
        .fleet_state
        .golden_templates()
        .await
        .into_iter()
        .map(GoldenTemplate::from)
        .collect();
    Json(GoldenTemplateList { templates })
}

#[utoipa::path(
    get,
    path = "/requests/provision",
    tag = "operations",
    responses(
        (status = 200, description = "Provision requests by status", body = ProvisionRequestList),
    ),
)]
async fn list_provision_requests(State(state): State<RouteState>) -> Json<ProvisionRequestList> {
    Json(state.scheduler.list_provision_requests().await.into())
}

#[utoipa::path(
    get,
    path = "/requests/provision/{id}",
    params(("id" = String, Path, description = "Request id")),
    tag = "operations",
    responses(
        (status = 200, description = "One provision request", body = ProvisionRequestView),
        (status = NOT_FOUND, description = "Unknown or expired request")
    ),
)]
async fn get_provision_request(
    State(state): State<RouteState>,
    Path(id): Path<String>,
) -> Result<Json<ProvisionRequestView>, FleetAPIError> {
    state
        .scheduler
        .get_provision_request(&RequestId::from(id.as_str()))
        .await
        .map(|request| Json(request.into()))
        .ok_or_else(|| FleetAPIError::not_found(&format!("request {} not found", id)))
}

/// Queue a provision request by hand
#[utoipa::path(
    post,
    path = "/requests/provision",
    request_body = CreateProvisionRequest,
    tag = "operations",
    responses(
        (status = 202, description = "Provision request queued", body = ProvisionRequestView),
        (status = BAD_REQUEST, description = "Invalid request")
    ),
)]
async fn create_provision_request(
    State(state): State<RouteState>,
    body: Bytes,
) -> Result<(StatusCode, Json<ProvisionRequestView>), FleetAPIError> {
    let body: CreateProvisionRequest = serde_json::from_slice(&body)?;
    let request = state
        .scheduler
        .create_provision_request(body.repository, body.template, body.prompt, None)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(request.into())))
}

#[utoipa::path(
    get,
    path = "/requests/destroy",
    tag = "operations",
    responses(
        (status = 200, description = "Destroy requests by status", body = DestroyRequestList),
    ),
)]
async fn list_destroy_requests(State(state): State<RouteState>) -> Json<DestroyRequestList> {
    Json(state.scheduler.list_destroy_requests().await.into())
}

#[utoipa::path(
    get,
    path = "/requests/destroy/{id}",
    params(("id" = String, Path, description = "Request id")),
    tag = "operations",
    responses(
        (status = 200, description = "One destroy request", body = DestroyRequestView),
        (status = NOT_FOUND, description = "Unknown or expired request")
    ),
)]
async fn get_destroy_request(
    State(state): State<RouteState>,
    Path(id): Path<String>,
) -> Result<Json<DestroyRequestView>, FleetAPIError> {
    state
        .scheduler
        .get_destroy_request(&RequestId::from(id.as_str()))
        .await
        .map(|request| Json(request.into()))
        .ok_or_else(|| FleetAPIError::not_found(&format!("request {} not found", id)))
}

#[utoipa::path(
    get,
    path = "/mode",
    tag = "operations",
    responses(
        (status = 200, description = "Current operating mode", body = Mode),
    ),
)]
async fn get_mode(State(state): State<RouteState>) -> Json<Mode> {
    Json(state.mode.current().into())
}

/// Pause or resume the fleet loops
#[utoipa::path(
    put,
    path = "/mode",
    request_body = Mode,
    tag = "operations",
    responses(
        (status = 200, description = "Mode changed", body = Mode),
        (status = BAD_REQUEST, description = "Only running and paused can be set"),
        (status = CONFLICT, description = "Transition not allowed from the current mode")
    ),
)]
async fn set_mode(
    State(state): State<RouteState>,
    body: Bytes,
) -> Result<Json<Mode>, FleetAPIError> {
    let body: Mode = serde_json::from_slice(&body)?;
    let next = match body.mode.parse::<OperatingMode>() {
        Ok(next @ (OperatingMode::Running | OperatingMode::Paused)) => next,
        _ => {
            return Err(FleetAPIError::bad_request(&format!(
                "mode must be running or paused, got {}",
                body.mode
            )))
        }
    };
    state.mode.transition(next)?;
    info!(mode = %next, "operating mode set through the api");
    Ok(Json(state.mode.current().into()))
}
