//! Route handlers. Every handler takes an [`AuthUser`] first, so requests
//! without a valid access token never reach the body.

use std::time::Duration;

use axum::{
    Json,
    extract::{
        Path, Query, State as AxumState,
        rejection::{JsonRejection, QueryRejection},
    },
};

use super::auth::AuthUser;
use super::types::*;
use crate::lib::fleet::types::{
    HaproxyConfig, NewWorkersGroup, Server, WorkerNode, WorkerSelector, WorkersGroup,
    WorkersGroupUpdate,
};
use crate::lib::tasks::store::TaskFilter;
use crate::lib::tasks::types::{
    Command, CreateConfigParams, HaproxyCommand, RemoveConfigParams, Task, TaskId,
    UpdateConfigParams,
};
use crate::lib::worker::types::{Lease, WorkerCapabilities};

/// Ids the control plane hands out are UUIDs; anything else is rejected
/// before a lookup.
fn parse_id(id: &str) -> Result<&str, ApiError> {
    uuid::Uuid::parse_str(id)
        .map(|_| id)
        .map_err(|_| ApiError::invalid_id(id))
}

fn parse_task_id(id: &str) -> Result<TaskId, ApiError> {
    parse_id(id).map(TaskId::from)
}

fn required(value: Option<String>, name: &str) -> Result<String, ApiError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::missing_param(name))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn require_worker(worker_id: &str) -> Result<&str, ApiError> {
    let worker_id = worker_id.trim();
    if worker_id.is_empty() {
        return Err(ApiError::missing_param("worker_id"));
    }
    Ok(worker_id)
}

fn lease_duration(state: &AppState, lease_secs: Option<u64>) -> Duration {
    lease_secs
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(state.config.lease_duration)
}

pub async fn not_found() -> ApiError {
    ApiError::not_found("Not Found")
}

pub async fn list_tasks(
    _user: AuthUser,
    AxumState(state): AxumState<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Vec<Task>> {
    let Query(query) = query?;
    let filter = match query.status {
        Some(status) => TaskFilter::with_status(status),
        None => TaskFilter::all(),
    };
    Ok(ApiResponse::ok(state.dispatcher.list(&filter, query.limit)))
}

pub async fn get_task(
    _user: AuthUser,
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Task> {
    let task_id = parse_task_id(&id)?;
    Ok(ApiResponse::ok(state.dispatcher.get(&task_id)?))
}

pub async fn list_servers(
    _user: AuthUser,
    AxumState(state): AxumState<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Vec<Server>> {
    let Query(query) = query?;
    let limit = state.config.clamp_limit(query.limit);
    Ok(ApiResponse::ok(state.fleet.list_servers(limit)))
}

pub async fn get_server(
    _user: AuthUser,
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Server> {
    Ok(ApiResponse::ok(state.fleet.get_server(id.trim())?))
}

pub async fn list_workers(
    _user: AuthUser,
    AxumState(state): AxumState<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Vec<WorkerNode>> {
    let Query(query) = query?;
    let limit = state.config.clamp_limit(query.limit);
    Ok(ApiResponse::ok(state.fleet.list_workers(limit)))
}

pub async fn get_worker(
    _user: AuthUser,
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
) -> ApiResult<WorkerNode> {
    Ok(ApiResponse::ok(state.fleet.get_worker(id.trim())?))
}

pub async fn list_groups(
    _user: AuthUser,
    AxumState(state): AxumState<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Vec<WorkersGroup>> {
    let Query(query) = query?;
    let limit = state.config.clamp_limit(query.limit);
    Ok(ApiResponse::ok(state.fleet.list_groups(limit)))
}

pub async fn create_group(
    AuthUser(user): AuthUser,
    AxumState(state): AxumState<AppState>,
    payload: Result<Json<CreateGroupRequest>, JsonRejection>,
) -> ApiResult<GroupCreated> {
    let Json(req) = payload?;
    let name = required(req.name, "name")?;
    let server_id = required(req.server_id, "server_id")?;
    let workers = req.workers.ok_or_else(|| ApiError::missing_param("workers"))?;

    let group = state.fleet.create_group(NewWorkersGroup {
        name,
        server_id,
        workers,
    })?;
    tracing::info!("Group {} created by {}", group.id, user.email);

    Ok(ApiResponse::ok(GroupCreated {
        id: group.id,
        sys_id: group.sys_id,
    }))
}

pub async fn get_group(
    _user: AuthUser,
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
) -> ApiResult<WorkersGroup> {
    let id = parse_id(&id)?;
    Ok(ApiResponse::ok(state.fleet.get_group(id)?))
}

pub async fn update_group(
    _user: AuthUser,
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<WorkersGroupUpdate>, JsonRejection>,
) -> ApiResult<WorkersGroup> {
    let id = parse_id(&id)?;
    let Json(update) = payload?;
    Ok(ApiResponse::ok(state.fleet.update_group(id, update)?))
}

pub async fn delete_group(
    AuthUser(user): AuthUser,
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
) -> ApiResult<()> {
    let id = parse_id(&id)?;
    state.fleet.delete_group(id)?;
    tracing::info!("Group {} deleted by {}", id, user.email);
    Ok(ApiResponse::empty())
}

pub async fn remove_group_worker(
    _user: AuthUser,
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<WorkerSelector>, JsonRejection>,
) -> ApiResult<WorkersGroup> {
    let id = parse_id(&id)?;
    let Json(selector) = payload?;
    Ok(ApiResponse::ok(state.fleet.remove_group_worker(id, &selector)?))
}

pub async fn list_haproxy_configs(
    _user: AuthUser,
    AxumState(state): AxumState<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Vec<HaproxyConfig>> {
    let Query(query) = query?;
    let limit = state.config.clamp_limit(query.limit);
    Ok(ApiResponse::ok(state.fleet.list_haproxy_configs(limit)))
}

pub async fn get_haproxy_config(
    _user: AuthUser,
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
) -> ApiResult<HaproxyConfig> {
    let id = parse_id(&id)?;
    Ok(ApiResponse::ok(state.fleet.get_haproxy_config(id)?))
}

/// Enqueues `haproxy/create-config`; the config record appears once a
/// worker has run the task.
pub async fn create_haproxy_config(
    AuthUser(user): AuthUser,
    AxumState(state): AxumState<AppState>,
    payload: Result<Json<CreateHaproxyConfigRequest>, JsonRejection>,
) -> ApiResult<TaskCreated> {
    let Json(req) = payload?;
    let target = required(req.target, "target")?;
    let params = CreateConfigParams {
        name: required(req.name, "name")?,
        content: required(req.content, "content")?,
        kind: req.kind.ok_or_else(|| ApiError::missing_param("kind"))?,
        order: req.order_num,
    };

    let task_id = state.dispatcher.enqueue_command(
        &target,
        Command::Haproxy(HaproxyCommand::CreateConfig),
        serde_json::to_value(params)?,
        &user.email,
    )?;
    Ok(ApiResponse::ok(TaskCreated { task_id }))
}

pub async fn update_haproxy_config(
    AuthUser(user): AuthUser,
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<UpdateHaproxyConfigRequest>, JsonRejection>,
) -> ApiResult<TaskCreated> {
    let id = parse_id(&id)?;
    let Json(req) = payload?;
    let config = state.fleet.get_haproxy_config(id)?;

    let params = UpdateConfigParams {
        id: config.id,
        name: non_empty(req.name),
        content: non_empty(req.content),
        order_number: req.order_num,
    };

    let task_id = state.dispatcher.enqueue_command(
        &config.target_id,
        Command::Haproxy(HaproxyCommand::UpdateConfig),
        serde_json::to_value(params)?,
        &user.email,
    )?;
    Ok(ApiResponse::ok(TaskCreated { task_id }))
}

pub async fn delete_haproxy_config(
    AuthUser(user): AuthUser,
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
) -> ApiResult<TaskCreated> {
    let id = parse_id(&id)?;
    let config = state.fleet.get_haproxy_config(id)?;

    let task_id = state.dispatcher.enqueue_command(
        &config.target_id,
        Command::Haproxy(HaproxyCommand::RemoveConfig),
        serde_json::to_value(RemoveConfigParams { id: config.id })?,
        &user.email,
    )?;
    Ok(ApiResponse::ok(TaskCreated { task_id }))
}

pub async fn claimable(
    _user: AuthUser,
    AxumState(state): AxumState<AppState>,
    payload: Result<Json<ClaimableRequest>, JsonRejection>,
) -> ApiResult<Vec<Task>> {
    let Json(req) = payload?;
    let worker_id = require_worker(&req.worker_id)?;
    let limit = state.config.clamp_limit(req.limit);

    let capabilities = WorkerCapabilities::new(worker_id, &req.modules);
    let tasks: Vec<Task> = state.dispatcher.claimable(&capabilities).take(limit).collect();
    Ok(ApiResponse::ok(tasks))
}

pub async fn claim_task(
    _user: AuthUser,
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<LeaseRequest>, JsonRejection>,
) -> ApiResult<Lease> {
    let task_id = parse_task_id(&id)?;
    let Json(req) = payload?;
    let worker_id = require_worker(&req.worker_id)?;

    let lease = state
        .leases
        .claim(&task_id, worker_id, lease_duration(&state, req.lease_secs))?;
    Ok(ApiResponse::ok(lease))
}

pub async fn start_task(
    _user: AuthUser,
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<LeaseRequest>, JsonRejection>,
) -> ApiResult<Lease> {
    let task_id = parse_task_id(&id)?;
    let Json(req) = payload?;
    let worker_id = require_worker(&req.worker_id)?;
    Ok(ApiResponse::ok(state.leases.start(&task_id, worker_id)?))
}

pub async fn heartbeat_task(
    _user: AuthUser,
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<LeaseRequest>, JsonRejection>,
) -> ApiResult<Lease> {
    let task_id = parse_task_id(&id)?;
    let Json(req) = payload?;
    let worker_id = require_worker(&req.worker_id)?;

    let lease = state
        .leases
        .heartbeat(&task_id, worker_id, lease_duration(&state, req.lease_secs))?;
    Ok(ApiResponse::ok(lease))
}

pub async fn complete_task(
    _user: AuthUser,
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<CompleteRequest>, JsonRejection>,
) -> ApiResult<Task> {
    let task_id = parse_task_id(&id)?;
    let Json(req) = payload?;
    let worker_id = require_worker(&req.worker_id)?;
    Ok(ApiResponse::ok(state.leases.complete(&task_id, worker_id, req.report)?))
}

pub async fn fail_task(
    _user: AuthUser,
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<FailRequest>, JsonRejection>,
) -> ApiResult<Task> {
    let task_id = parse_task_id(&id)?;
    let Json(req) = payload?;
    let worker_id = require_worker(&req.worker_id)?;

    let task = state
        .leases
        .fail(&task_id, worker_id, non_empty(req.error), non_empty(req.internal_error))?;
    Ok(ApiResponse::ok(task))
}
