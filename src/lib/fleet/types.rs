use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lib::tasks::types::Module;

/// API account. The access key is only ever compared, never returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub email: String,
    #[serde(skip_serializing, default)]
    pub access_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub server_name: String,
    pub ip: String,
    pub port: u16,
    pub status: String,
    #[serde(default)]
    pub dt: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerNode {
    pub id: String,
    pub sys_id: String,
    #[serde(default)]
    pub server_id: Option<String>,
    pub server_name: String,
    pub ip: String,
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub modules: Vec<Module>,
    #[serde(default)]
    pub dt: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkersGroup {
    pub id: String,
    pub sys_id: u64,
    pub name: String,
    pub server_id: String,
    pub workers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaproxyConfig {
    pub id: String,
    pub target_id: String,
    pub name: String,
    pub content: String,
    pub kind: i64,
    #[serde(default)]
    pub order_num: Option<i64>,
    pub status: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewWorkersGroup {
    pub name: String,
    pub server_id: String,
    pub workers: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkersGroupUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub server_id: Option<String>,
    #[serde(default)]
    pub workers: Option<Vec<String>>,
}

/// Picks one member of a group's `workers` list. `name` (worker id or
/// server name) wins over `index` when both are given.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerSelector {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub index: Option<usize>,
}

/// Initial registry contents, loaded from a JSON file at startup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FleetSnapshot {
    #[serde(default)]
    pub servers: Vec<Server>,
    #[serde(default)]
    pub workers: Vec<WorkerNode>,
    #[serde(default)]
    pub groups: Vec<NewWorkersGroup>,
    #[serde(default)]
    pub haproxy_configs: Vec<HaproxyConfig>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FleetError {
    #[error("{kind} \"{id}\" not found")]
    NotFound { kind: &'static str, id: String },

    #[error("missing \"{0}\" parameter")]
    MissingParam(&'static str),

    #[error("invalid parameter: {0}")]
    InvalidParam(String),
}

pub type FleetResult<T> = Result<T, FleetError>;
