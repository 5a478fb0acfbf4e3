//! Sandbox Gateway contract.
//!
//! The gateway provisions sandboxes, reports their container status and
//! proxies requests to the agent running inside them.

mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared_types::{ChatInstruction, SandboxStatus, WorkspaceStatus};

use crate::error::{HypervisorError, Result};

pub use http::HttpSandboxGateway;

/// Gateway/agent envelope code meaning success.
pub const SUCCESS_CODE: i32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSandboxResult {
    pub success: bool,
    pub sandbox_id: String,
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxStatusEntry {
    pub sandbox_id: String,
    pub status: SandboxStatus,
}

/// Raw response from an agent endpoint reached through the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl AgentResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            code: SUCCESS_CODE,
            message: "ok".to_string(),
            data,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == SUCCESS_CODE
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// Turn a non-success envelope into a `SandboxOperation` error.
    pub fn into_result(self, operation: &str) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(HypervisorError::sandbox(operation, self.message, self.code))
        }
    }
}

/// Handshake sent once per dispatch before the workspace is polled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInitPayload {
    pub user_id: String,
    pub organization_code: String,
    pub project_id: String,
    pub topic_id: String,
    pub task_id: String,
    pub task_mode: String,
    pub agent_mode: String,
    pub work_dir: String,
    pub chat_conversation_id: String,
    pub chat_topic_id: String,
    pub agent_user_id: String,
    pub mcp_config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessagePayload {
    pub message_id: String,
    pub user_id: String,
    pub task_id: String,
    pub prompt: String,
    pub attachments: Option<String>,
    pub mentions: Option<String>,
    pub instruction: ChatInstruction,
    pub agent_mode: String,
    pub chat_conversation_id: String,
    pub chat_topic_id: String,
    pub mcp_config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptPayload {
    pub message_id: String,
    pub user_id: String,
    pub task_id: String,
    pub reason: String,
}

#[async_trait]
pub trait SandboxGateway: Send + Sync {
    /// An empty `sandbox_id` asks the gateway to create a new sandbox.
    async fn create_sandbox(&self, project_id: &str, sandbox_id: &str)
        -> Result<CreateSandboxResult>;
    async fn get_sandbox_status(&self, sandbox_id: &str) -> Result<SandboxStatus>;
    async fn get_batch_sandbox_status(&self, sandbox_ids: &[String])
        -> Result<Vec<SandboxStatusEntry>>;
    async fn get_workspace_status(&self, sandbox_id: &str) -> Result<WorkspaceStatus>;
    async fn initialize_agent(
        &self,
        sandbox_id: &str,
        payload: &AgentInitPayload,
    ) -> Result<AgentResponse>;
    async fn send_chat_message(
        &self,
        sandbox_id: &str,
        payload: &ChatMessagePayload,
    ) -> Result<AgentResponse>;
    async fn send_interrupt_message(
        &self,
        sandbox_id: &str,
        payload: &InterruptPayload,
    ) -> Result<AgentResponse>;
    /// WebSocket address of the agent inside the sandbox.
    fn websocket_url(&self, sandbox_id: &str) -> String;
}
