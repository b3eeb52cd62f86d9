use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Written to `internal_error` when the monitor gives up on a task.
pub const LEASE_EXPIRED_TOO_MANY_TIMES: &str = "lease_expired_too_many_times";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Pending,
    Claimed,
    Running,
    Done,
    Failed,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Done | State::Failed)
    }

    /// Claimed and running tasks hold their target's single in-flight slot.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, State::Claimed | State::Running)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Pending => "PENDING",
            State::Claimed => "CLAIMED",
            State::Running => "RUNNING",
            State::Done => "DONE",
            State::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// A worker subsystem. Each module owns a fixed set of commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Module {
    Haproxy,
}

impl Module {
    pub fn as_str(&self) -> &'static str {
        match self {
            Module::Haproxy => "haproxy",
        }
    }

    pub fn parse(name: &str) -> TaskResult<Self> {
        match name {
            "haproxy" => Ok(Module::Haproxy),
            other => Err(TaskError::InvalidParams(format!("unknown module \"{}\"", other))),
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HaproxyCommand {
    CreateConfig,
    UpdateConfig,
    RemoveConfig,
}

impl HaproxyCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            HaproxyCommand::CreateConfig => "create-config",
            HaproxyCommand::UpdateConfig => "update-config",
            HaproxyCommand::RemoveConfig => "remove-config",
        }
    }
}

/// Closed set of `module × cmd` pairs a task may carry.
///
/// Serializes as `{"module": "haproxy", "cmd": "create-config"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "module", content = "cmd", rename_all = "lowercase")]
pub enum Command {
    Haproxy(HaproxyCommand),
}

impl Command {
    pub fn parse(module: &str, cmd: &str) -> TaskResult<Self> {
        match Module::parse(module)? {
            Module::Haproxy => match cmd {
                "create-config" => Ok(Command::Haproxy(HaproxyCommand::CreateConfig)),
                "update-config" => Ok(Command::Haproxy(HaproxyCommand::UpdateConfig)),
                "remove-config" => Ok(Command::Haproxy(HaproxyCommand::RemoveConfig)),
                other => Err(TaskError::InvalidParams(format!(
                    "unknown command \"{}\" for module \"{}\"",
                    other, module
                ))),
            },
        }
    }

    pub fn module(&self) -> Module {
        match self {
            Command::Haproxy(_) => Module::Haproxy,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Haproxy(cmd) => cmd.as_str(),
        }
    }

    /// Checks that `params` has the shape this command's workers expect.
    pub fn validate_params(&self, params: &Value) -> TaskResult<()> {
        let invalid = |e: serde_json::Error| {
            TaskError::InvalidParams(format!("{} {}: {}", self.module(), self.name(), e))
        };

        match self {
            Command::Haproxy(HaproxyCommand::CreateConfig) => {
                let p: CreateConfigParams = serde_json::from_value(params.clone()).map_err(invalid)?;
                if p.name.trim().is_empty() || p.content.trim().is_empty() {
                    return Err(TaskError::InvalidParams(
                        "create-config requires non-empty name and content".to_string(),
                    ));
                }
            }
            Command::Haproxy(HaproxyCommand::UpdateConfig) => {
                serde_json::from_value::<UpdateConfigParams>(params.clone()).map_err(invalid)?;
            }
            Command::Haproxy(HaproxyCommand::RemoveConfig) => {
                serde_json::from_value::<RemoveConfigParams>(params.clone()).map_err(invalid)?;
            }
        }

        Ok(())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.module(), self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateConfigParams {
    pub name: String,
    pub content: String,
    pub kind: i64,
    #[serde(default)]
    pub order: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateConfigParams {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub order_number: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveConfigParams {
    pub id: String,
}

/// The unit of mutual exclusion: one in-flight task per target and module.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Slot {
    pub target_id: String,
    pub module: Module,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub target_id: String,
    pub command: Command,
    pub params: Value,
    pub status: State,
    pub username: String,
    pub created_at: u64,
    pub claimed_at: Option<u64>,
    pub completed_at: Option<u64>,
    /// Insertion order, assigned by the store.
    pub seq: u64,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<u64>,
    pub requeue_count: u32,
    /// Workers whose lease on this task lapsed.
    #[serde(default)]
    pub expired_owners: Vec<String>,
    pub report: Option<Value>,
    pub error: Option<String>,
    pub internal_error: Option<String>,
}

impl Task {
    pub fn new(
        target_id: &str,
        command: Command,
        params: Value,
        username: &str,
        created_at: u64,
    ) -> Self {
        Task {
            id: TaskId::new(),
            target_id: target_id.to_string(),
            command,
            params,
            status: State::Pending,
            username: username.to_string(),
            created_at,
            claimed_at: None,
            completed_at: None,
            seq: 0,
            lease_owner: None,
            lease_expires_at: None,
            requeue_count: 0,
            expired_owners: Vec::new(),
            report: None,
            error: None,
            internal_error: None,
        }
    }

    pub fn module(&self) -> Module {
        self.command.module()
    }

    pub fn slot(&self) -> Slot {
        Slot {
            target_id: self.target_id.clone(),
            module: self.module(),
        }
    }

    pub fn lease_expired(&self, now: u64) -> bool {
        self.status.is_in_flight() && self.lease_expires_at.is_some_and(|deadline| deadline < now)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("unknown target: {0}")]
    InvalidTarget(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("conflict on task {id}: {reason}")]
    Conflict { id: TaskId, reason: String },

    #[error("task {0} is leased by another worker")]
    NotOwner(TaskId),

    #[error("lease on task {0} has expired")]
    Expired(TaskId),
}

impl TaskError {
    pub fn conflict(id: &TaskId, reason: impl Into<String>) -> Self {
        TaskError::Conflict {
            id: id.clone(),
            reason: reason.into(),
        }
    }

    /// Contention errors: the caller should re-read and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TaskError::Conflict { .. } | TaskError::Expired(_) | TaskError::NotFound(_)
        )
    }
}

pub type TaskResult<T> = Result<T, TaskError>;
