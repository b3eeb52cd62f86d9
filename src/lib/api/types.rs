use std::sync::Arc;

use axum::{
    Json,
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::lib::config::ControlPlaneConfig;
use crate::lib::fleet::accounts::AccountStore;
use crate::lib::fleet::registry::FleetRegistry;
use crate::lib::fleet::types::FleetError;
use crate::lib::manager::types::Dispatcher;
use crate::lib::tasks::types::{Module, State, TaskError, TaskId};
use crate::lib::worker::types::LeaseProtocol;

pub const ACCESS_TOKEN_HEADER: &str = "X-SJS-AccessToken";

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub leases: LeaseProtocol,
    pub fleet: Arc<dyn FleetRegistry>,
    pub accounts: Arc<dyn AccountStore>,
    pub config: Arc<ControlPlaneConfig>,
}

/// Success envelope: `{"ok": true, "data": ...}`. `data` is omitted for
/// operations with nothing to return.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
        }
    }
}

impl ApiResponse<()> {
    pub fn empty() -> Self {
        Self { ok: true, data: None }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

/// Failure envelope: `{"ok": false, "error": "<code>", "msg": "<text>"}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub msg: String,
}

pub type ApiResult<T> = Result<ApiResponse<T>, ApiError>;

impl ApiError {
    fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            msg: msg.into(),
        }
    }

    pub fn missing_token() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "missing_token", "Missing auth token header")
    }

    pub fn invalid_token() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "invalid_token", "Invalid access token")
    }

    pub fn missing_param(name: &str) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "missing_param",
            format!("Missing \"{}\" parameter", name),
        )
    }

    pub fn invalid_param(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_param", msg)
    }

    pub fn invalid_id(id: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_id", format!("Invalid id \"{}\"", id))
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", msg)
    }

    pub fn server_error(cause: impl std::fmt::Display) -> Self {
        tracing::error!("Request failed: {}", cause);
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "server_error", "Server error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "ok": false,
            "error": self.code,
            "msg": self.msg,
        }));
        (self.status, body).into_response()
    }
}

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        let msg = err.to_string();
        match err {
            TaskError::InvalidTarget(_) => Self::new(StatusCode::BAD_REQUEST, "invalid_target", msg),
            TaskError::InvalidParams(_) => Self::invalid_param(msg),
            TaskError::NotFound(_) => Self::not_found(msg),
            TaskError::Conflict { .. } => Self::new(StatusCode::CONFLICT, "conflict", msg),
            TaskError::NotOwner(_) => Self::new(StatusCode::FORBIDDEN, "not_owner", msg),
            TaskError::Expired(_) => Self::new(StatusCode::GONE, "expired", msg),
        }
    }
}

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        match err {
            FleetError::NotFound { .. } => Self::not_found(err.to_string()),
            FleetError::MissingParam(name) => Self::missing_param(name),
            FleetError::InvalidParam(msg) => Self::invalid_param(msg),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::invalid_param(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::invalid_param(rejection.body_text())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::server_error(err)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub status: Option<State>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateGroupRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub server_id: Option<String>,
    #[serde(default)]
    pub workers: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateHaproxyConfigRequest {
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub kind: Option<i64>,
    #[serde(default)]
    pub order_num: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateHaproxyConfigRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub order_num: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClaimableRequest {
    #[serde(default)]
    pub worker_id: String,
    #[serde(default)]
    pub modules: Vec<Module>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Body for `claim`, `start` and `heartbeat`. `lease_secs` overrides the
/// configured lease duration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeaseRequest {
    #[serde(default)]
    pub worker_id: String,
    #[serde(default)]
    pub lease_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompleteRequest {
    #[serde(default)]
    pub worker_id: String,
    #[serde(default)]
    pub report: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FailRequest {
    #[serde(default)]
    pub worker_id: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub internal_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskCreated {
    pub task_id: TaskId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupCreated {
    pub id: String,
    pub sys_id: u64,
}
