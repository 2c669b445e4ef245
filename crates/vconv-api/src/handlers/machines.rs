//! Client-facing machine registration and fleet views.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use vconv_models::{Machine, MachineDetails, MachineId, MachineSummary};
use vconv_queue::MachineStats;

use crate::auth::ClientAuth;
use crate::error::ApiResult;
use crate::extract::ApiJson;
use crate::security::{sanitize_name, validate_id};
use crate::state::AppState;

use super::queues::MessageResponse;

#[derive(Serialize)]
pub struct MachinesResponse {
    pub machines: Vec<MachineSummary>,
}

/// The full record, token included. Only returned at registration.
#[derive(Serialize)]
pub struct MachineResponse {
    pub machine: Machine,
}

fn machine_id(raw: String) -> ApiResult<MachineId> {
    validate_id("machine", &raw)?;
    Ok(MachineId::from(raw))
}

pub async fn list_machines(
    State(state): State<AppState>,
    _auth: ClientAuth,
) -> ApiResult<Json<MachinesResponse>> {
    let machines = state.core.fleet.list_machines().await?;
    Ok(Json(MachinesResponse { machines }))
}

#[derive(Debug, Deserialize)]
pub struct CreateMachineRequest {
    pub name: String,
    pub ip: String,
}

/// Register a machine and hand out its token.
pub async fn create_machine(
    State(state): State<AppState>,
    _auth: ClientAuth,
    ApiJson(request): ApiJson<CreateMachineRequest>,
) -> ApiResult<(StatusCode, Json<MachineResponse>)> {
    let name = sanitize_name("name", &request.name)?;
    let ip = sanitize_name("ip", &request.ip)?;
    let machine = state.core.fleet.register_machine(&name, &ip).await?;
    Ok((StatusCode::CREATED, Json(MachineResponse { machine })))
}

pub async fn delete_machine(
    State(state): State<AppState>,
    _auth: ClientAuth,
    Path(id): Path<String>,
) -> ApiResult<Json<MessageResponse>> {
    let id = machine_id(id)?;
    state.core.fleet.remove_machine(&id).await?;
    Ok(Json(MessageResponse {
        message: format!("Machine {} deleted", id),
    }))
}

pub async fn machine_details(
    State(state): State<AppState>,
    _auth: ClientAuth,
    Path(id): Path<String>,
) -> ApiResult<Json<MachineDetails>> {
    let details = state.core.fleet.machine_details(&machine_id(id)?).await?;
    Ok(Json(details))
}

pub async fn machine_stats(
    State(state): State<AppState>,
    _auth: ClientAuth,
    Path(id): Path<String>,
) -> ApiResult<Json<MachineStats>> {
    let stats = state.core.fleet.machine_stats(&machine_id(id)?).await?;
    Ok(Json(stats))
}
