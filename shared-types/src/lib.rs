//! Shared types between the hypervisor core and its callers
//!
//! These types describe the persisted Task/Topic records, the status
//! vocabularies reported by the sandbox gateway, and the request-scoped
//! context threaded through one dispatch flow.
//!
//! Serializable with serde for JSON over HTTP/WebSocket

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of characters stored in `Task::err_msg`.
pub const MAX_ERR_MSG_CHARS: usize = 500;

/// Appended to an error message that was cut short.
pub const ERR_MSG_ELLIPSIS: &str = "...";

// ============================================================================
// Isolation
// ============================================================================

/// Tenant context for one request. Passed explicitly as the first argument
/// of every core operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataIsolation {
    pub organization_code: String,
    pub user_id: String,
}

impl DataIsolation {
    pub fn new(organization_code: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            organization_code: organization_code.into(),
            user_id: user_id.into(),
        }
    }
}

// ============================================================================
// Status vocabularies
// ============================================================================

/// Lifecycle status of a Task (and, mirrored, of its Topic).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Waiting,
    Running,
    Suspended,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Running => "running",
            TaskStatus::Suspended => "suspended",
            TaskStatus::Error => "error",
        }
    }

    /// Suspended and Error are only left by starting a new task.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Suspended | TaskStatus::Error)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match self {
            TaskStatus::Waiting => true,
            TaskStatus::Running => next != TaskStatus::Waiting,
            TaskStatus::Suspended | TaskStatus::Error => *self == next,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownTaskStatus(pub String);

impl fmt::Display for UnknownTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown task status '{}'", self.0)
    }
}

impl std::error::Error for UnknownTaskStatus {}

impl FromStr for TaskStatus {
    type Err = UnknownTaskStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(TaskStatus::Waiting),
            "running" => Ok(TaskStatus::Running),
            "suspended" => Ok(TaskStatus::Suspended),
            "error" => Ok(TaskStatus::Error),
            other => Err(UnknownTaskStatus(other.to_string())),
        }
    }
}

/// Container status as reported by the sandbox gateway.
/// Anything the gateway sends that we do not recognise maps to `Unknown`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(from = "String", into = "String")]
pub enum SandboxStatus {
    Pending,
    Running,
    Exited,
    NotFound,
    Unknown,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxStatus::Pending => "Pending",
            SandboxStatus::Running => "Running",
            SandboxStatus::Exited => "Exited",
            SandboxStatus::NotFound => "NotFound",
            SandboxStatus::Unknown => "Unknown",
        }
    }

    pub fn is_running(&self) -> bool {
        *self == SandboxStatus::Running
    }
}

impl From<String> for SandboxStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Pending" => SandboxStatus::Pending,
            "Running" => SandboxStatus::Running,
            "Exited" => SandboxStatus::Exited,
            "NotFound" => SandboxStatus::NotFound,
            _ => SandboxStatus::Unknown,
        }
    }
}

impl From<SandboxStatus> for String {
    fn from(value: SandboxStatus) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workspace initialisation status reported by the agent inside a sandbox.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "i32", into = "i32")]
pub enum WorkspaceStatus {
    Uninitialized,
    Initializing,
    Ready,
    Error,
    Unrecognized(i32),
}

impl WorkspaceStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => WorkspaceStatus::Uninitialized,
            1 => WorkspaceStatus::Initializing,
            2 => WorkspaceStatus::Ready,
            -1 => WorkspaceStatus::Error,
            other => WorkspaceStatus::Unrecognized(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            WorkspaceStatus::Uninitialized => 0,
            WorkspaceStatus::Initializing => 1,
            WorkspaceStatus::Ready => 2,
            WorkspaceStatus::Error => -1,
            WorkspaceStatus::Unrecognized(code) => *code,
        }
    }

    pub fn is_ready(&self) -> bool {
        *self == WorkspaceStatus::Ready
    }

    pub fn is_error(&self) -> bool {
        *self == WorkspaceStatus::Error
    }

    pub fn description(&self) -> String {
        match self {
            WorkspaceStatus::Uninitialized => "uninitialized".to_string(),
            WorkspaceStatus::Initializing => "initializing".to_string(),
            WorkspaceStatus::Ready => "ready".to_string(),
            WorkspaceStatus::Error => "error".to_string(),
            WorkspaceStatus::Unrecognized(code) => format!("unrecognized ({code})"),
        }
    }
}

impl From<i32> for WorkspaceStatus {
    fn from(code: i32) -> Self {
        WorkspaceStatus::from_code(code)
    }
}

impl From<WorkspaceStatus> for i32 {
    fn from(status: WorkspaceStatus) -> Self {
        status.code()
    }
}

/// Instruction kind sent along with a chat message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChatInstruction {
    #[default]
    Normal,
    FollowUp,
    Interrupt,
}

// ============================================================================
// Persisted entities
// ============================================================================

/// One attempt to execute agent work for a topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub topic_id: String,
    pub project_id: String,
    pub workspace_id: String,
    pub user_id: String,
    /// Empty until a sandbox is assigned.
    pub sandbox_id: String,
    /// Task id assigned by the agent; empty until acknowledged.
    pub remote_task_id: String,
    pub prompt: String,
    /// Opaque JSON references, passed through to the agent untouched.
    pub attachments: Option<String>,
    pub mentions: Option<String>,
    pub task_mode: String,
    pub work_dir: String,
    pub status: TaskStatus,
    pub err_msg: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything needed to persist a new Task; id, status and timestamps are
/// assigned on insert.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NewTask {
    pub topic_id: String,
    pub project_id: String,
    pub workspace_id: String,
    pub user_id: String,
    pub sandbox_id: String,
    pub prompt: String,
    pub attachments: Option<String>,
    pub mentions: Option<String>,
    pub task_mode: String,
    pub work_dir: String,
}

/// A conversation thread holding the sticky sandbox binding and a pointer
/// to its current task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Topic {
    pub id: String,
    pub user_id: String,
    pub workspace_id: String,
    pub project_id: String,
    pub sandbox_id: String,
    pub current_task_id: Option<String>,
    pub current_task_status: Option<TaskStatus>,
    pub task_mode: String,
    pub topic_mode: String,
    pub work_dir: String,
    pub updated_at: DateTime<Utc>,
    pub updated_uid: String,
}

// ============================================================================
// Request-scoped context
// ============================================================================

/// The unit passed between orchestrator operations within one request.
/// Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    pub task: Task,
    pub isolation: DataIsolation,
    pub chat_conversation_id: String,
    pub chat_topic_id: String,
    pub agent_user_id: String,
    pub sandbox_id: String,
    pub instruction: ChatInstruction,
    pub agent_mode: String,
    /// Optional tool-configuration override forwarded to the agent.
    pub mcp_config: Option<serde_json::Value>,
}

impl TaskContext {
    pub fn task_id(&self) -> &str {
        &self.task.id
    }

    pub fn project_id(&self) -> &str {
        &self.task.project_id
    }

    pub fn set_sandbox_id(&mut self, sandbox_id: impl Into<String>) {
        let sandbox_id = sandbox_id.into();
        self.task.sandbox_id = sandbox_id.clone();
        self.sandbox_id = sandbox_id;
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Cap an error message at [`MAX_ERR_MSG_CHARS`] characters, replacing the
/// tail with [`ERR_MSG_ELLIPSIS`] when it is longer.
pub fn truncate_err_msg(msg: &str) -> String {
    if msg.chars().count() <= MAX_ERR_MSG_CHARS {
        return msg.to_string();
    }
    let keep = MAX_ERR_MSG_CHARS - ERR_MSG_ELLIPSIS.chars().count();
    let mut out: String = msg.chars().take(keep).collect();
    out.push_str(ERR_MSG_ELLIPSIS);
    out
}

/// Generic API response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
