//! Fixtures and scripted fakes shared by unit and integration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use shared_types::{
    ChatInstruction, DataIsolation, SandboxStatus, Task, TaskContext, TaskStatus, Topic,
    WorkspaceStatus,
};

use crate::db;
use crate::error::{HypervisorError, Result};
use crate::gateway::{
    AgentInitPayload, AgentResponse, ChatMessagePayload, CreateSandboxResult, InterruptPayload,
    SandboxGateway, SandboxStatusEntry, SUCCESS_CODE,
};
use crate::interrupt::{InterruptChannel, InterruptConnector};
use crate::notifier::{ClientNotice, ClientNotifier};
use crate::orchestrator::DispatchGuard;
use crate::repository::SqliteRepository;

/// Sandbox id handed out by [`FakeGateway`] when asked to create a new one.
pub const FAKE_SANDBOX_ID: &str = "sbx-created";
/// Task id the fake agent reports when it accepts a chat message.
pub const FAKE_REMOTE_TASK_ID: &str = "agent-task-1";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn sample_isolation() -> DataIsolation {
    DataIsolation::new("org-1", "user-1")
}

pub fn sample_task(id: &str, topic_id: &str, status: TaskStatus) -> Task {
    let now = Utc::now();
    Task {
        id: id.to_string(),
        topic_id: topic_id.to_string(),
        project_id: "project-1".to_string(),
        workspace_id: "workspace-1".to_string(),
        user_id: "user-1".to_string(),
        sandbox_id: String::new(),
        remote_task_id: String::new(),
        prompt: "summarise the quarterly report".to_string(),
        attachments: None,
        mentions: None,
        task_mode: "chat".to_string(),
        work_dir: "/workspace".to_string(),
        status,
        err_msg: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn sample_topic(id: &str, user_id: &str, sandbox_id: &str) -> Topic {
    Topic {
        id: id.to_string(),
        user_id: user_id.to_string(),
        workspace_id: "workspace-1".to_string(),
        project_id: "project-1".to_string(),
        sandbox_id: sandbox_id.to_string(),
        current_task_id: None,
        current_task_status: None,
        task_mode: "chat".to_string(),
        topic_mode: "general".to_string(),
        work_dir: "/workspace".to_string(),
        updated_at: Utc::now(),
        updated_uid: user_id.to_string(),
    }
}

pub fn sample_context(status: TaskStatus, sandbox_id: &str) -> TaskContext {
    let mut task = sample_task("task-1", "topic-1", status);
    task.sandbox_id = sandbox_id.to_string();
    TaskContext {
        task,
        isolation: sample_isolation(),
        chat_conversation_id: "conversation-1".to_string(),
        chat_topic_id: "chat-topic-1".to_string(),
        agent_user_id: "agent-user-1".to_string(),
        sandbox_id: sandbox_id.to_string(),
        instruction: ChatInstruction::FollowUp,
        agent_mode: "general".to_string(),
        mcp_config: None,
    }
}

/// Dispatch guard with a fixed answer.
pub struct FixedGuard(pub bool);

#[async_trait]
impl DispatchGuard for FixedGuard {
    async fn should_dispatch(&self, _task_id: &str) -> Result<bool> {
        Ok(self.0)
    }
}

/// Repository over a fresh in-memory database.
pub async fn test_repository() -> Arc<SqliteRepository> {
    let pool = db::connect_in_memory()
        .await
        .expect("in-memory database should open and migrate");
    Arc::new(SqliteRepository::new(pool))
}

// ============================================================================
// Sandbox gateway
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    /// project id, requested sandbox id
    Create(String, String),
    SandboxStatus(String),
    BatchStatus(Vec<String>),
    WorkspaceStatus(String),
    Init(String),
    Chat(String),
    /// sandbox id, task id
    Interrupt(String, String),
}

impl GatewayCall {
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayCall::Create(..) => "create",
            GatewayCall::SandboxStatus(_) => "sandbox_status",
            GatewayCall::BatchStatus(_) => "batch_status",
            GatewayCall::WorkspaceStatus(_) => "workspace_status",
            GatewayCall::Init(_) => "init",
            GatewayCall::Chat(_) => "chat",
            GatewayCall::Interrupt(..) => "interrupt",
        }
    }
}

#[derive(Default)]
struct FakeGatewayState {
    calls: Vec<GatewayCall>,
    workspace: VecDeque<WorkspaceStatus>,
    workspace_error: Option<String>,
    create_failure: Option<(i32, String)>,
    chat_failure: Option<(i32, String)>,
    batch_error: Option<String>,
    batch_unqueried: Vec<SandboxStatusEntry>,
    sandboxes: HashMap<String, SandboxStatus>,
    ws_base: Option<String>,
}

/// Scripted in-memory gateway that records every call.
///
/// Workspace statuses are served from the script in order; the last entry
/// repeats once the script runs out. An empty script reports `Ready`.
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<FakeGatewayState>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_workspace(&self, statuses: impl IntoIterator<Item = WorkspaceStatus>) {
        lock(&self.state).workspace = statuses.into_iter().collect();
    }

    pub fn fail_workspace_status(&self, message: &str) {
        lock(&self.state).workspace_error = Some(message.to_string());
    }

    pub fn fail_create(&self, code: i32, message: &str) {
        lock(&self.state).create_failure = Some((code, message.to_string()));
    }

    pub fn fail_chat(&self, code: i32, message: &str) {
        lock(&self.state).chat_failure = Some((code, message.to_string()));
    }

    pub fn fail_batch_status(&self, message: &str) {
        lock(&self.state).batch_error = Some(message.to_string());
    }

    /// Append an entry for `sandbox_id` to every batch reply, whether or not
    /// it was asked for.
    pub fn report_unqueried(&self, sandbox_id: &str, status: SandboxStatus) {
        lock(&self.state).batch_unqueried.push(SandboxStatusEntry {
            sandbox_id: sandbox_id.to_string(),
            status,
        });
    }

    pub fn set_sandbox_status(&self, sandbox_id: &str, status: SandboxStatus) {
        lock(&self.state)
            .sandboxes
            .insert(sandbox_id.to_string(), status);
    }

    /// Point `websocket_url` at a real server, e.g. `ws://127.0.0.1:PORT`.
    pub fn set_websocket_base(&self, base: &str) {
        lock(&self.state).ws_base = Some(base.trim_end_matches('/').to_string());
    }

    pub fn created_sandbox_id(&self) -> String {
        FAKE_SANDBOX_ID.to_string()
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        lock(&self.state).calls.clone()
    }

    pub fn count(&self, predicate: impl Fn(&GatewayCall) -> bool) -> usize {
        lock(&self.state).calls.iter().filter(|c| predicate(c)).count()
    }

    fn record(&self, call: GatewayCall) -> MutexGuard<'_, FakeGatewayState> {
        let mut state = lock(&self.state);
        state.calls.push(call);
        state
    }

    fn sandbox_status_of(state: &FakeGatewayState, sandbox_id: &str) -> SandboxStatus {
        state
            .sandboxes
            .get(sandbox_id)
            .copied()
            .unwrap_or(SandboxStatus::NotFound)
    }
}

#[async_trait]
impl SandboxGateway for FakeGateway {
    async fn create_sandbox(
        &self,
        project_id: &str,
        sandbox_id: &str,
    ) -> Result<CreateSandboxResult> {
        let mut state = self.record(GatewayCall::Create(
            project_id.to_string(),
            sandbox_id.to_string(),
        ));
        if let Some((code, message)) = state.create_failure.clone() {
            return Ok(CreateSandboxResult {
                success: false,
                sandbox_id: String::new(),
                code,
                message,
            });
        }
        let sandbox_id = if sandbox_id.is_empty() {
            FAKE_SANDBOX_ID.to_string()
        } else {
            sandbox_id.to_string()
        };
        state
            .sandboxes
            .insert(sandbox_id.clone(), SandboxStatus::Running);
        Ok(CreateSandboxResult {
            success: true,
            sandbox_id,
            code: SUCCESS_CODE,
            message: "ok".to_string(),
        })
    }

    async fn get_sandbox_status(&self, sandbox_id: &str) -> Result<SandboxStatus> {
        let state = self.record(GatewayCall::SandboxStatus(sandbox_id.to_string()));
        Ok(Self::sandbox_status_of(&state, sandbox_id))
    }

    async fn get_batch_sandbox_status(
        &self,
        sandbox_ids: &[String],
    ) -> Result<Vec<SandboxStatusEntry>> {
        let state = self.record(GatewayCall::BatchStatus(sandbox_ids.to_vec()));
        if let Some(message) = &state.batch_error {
            return Err(HypervisorError::Transport(message.clone()));
        }
        Ok(sandbox_ids
            .iter()
            .map(|id| SandboxStatusEntry {
                sandbox_id: id.clone(),
                status: Self::sandbox_status_of(&state, id),
            })
            .chain(state.batch_unqueried.iter().cloned())
            .collect())
    }

    async fn get_workspace_status(&self, sandbox_id: &str) -> Result<WorkspaceStatus> {
        let mut state = self.record(GatewayCall::WorkspaceStatus(sandbox_id.to_string()));
        if let Some(message) = &state.workspace_error {
            return Err(HypervisorError::Transport(message.clone()));
        }
        let status = if state.workspace.len() > 1 {
            state.workspace.pop_front()
        } else {
            state.workspace.front().copied()
        };
        Ok(status.unwrap_or(WorkspaceStatus::Ready))
    }

    async fn initialize_agent(
        &self,
        sandbox_id: &str,
        _payload: &AgentInitPayload,
    ) -> Result<AgentResponse> {
        self.record(GatewayCall::Init(sandbox_id.to_string()));
        Ok(AgentResponse::ok(serde_json::Value::Null))
    }

    async fn send_chat_message(
        &self,
        sandbox_id: &str,
        _payload: &ChatMessagePayload,
    ) -> Result<AgentResponse> {
        let state = self.record(GatewayCall::Chat(sandbox_id.to_string()));
        if let Some((code, message)) = state.chat_failure.clone() {
            return Ok(AgentResponse {
                code,
                message,
                data: serde_json::Value::Null,
            });
        }
        Ok(AgentResponse::ok(
            serde_json::json!({ "task_id": FAKE_REMOTE_TASK_ID }),
        ))
    }

    async fn send_interrupt_message(
        &self,
        sandbox_id: &str,
        payload: &InterruptPayload,
    ) -> Result<AgentResponse> {
        self.record(GatewayCall::Interrupt(
            sandbox_id.to_string(),
            payload.task_id.clone(),
        ));
        Ok(AgentResponse::ok(serde_json::Value::Null))
    }

    fn websocket_url(&self, sandbox_id: &str) -> String {
        let state = lock(&self.state);
        match &state.ws_base {
            Some(base) => format!("{base}/{sandbox_id}"),
            None => format!("ws://fake-gateway/api/v1/sandboxes/{sandbox_id}/proxy/ws"),
        }
    }
}

// ============================================================================
// Interrupt transport
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connect(String),
    Send(String),
    Receive,
    Close,
}

/// Connector whose channels record every call into a shared log.
///
/// `reply: None` models an agent that never acknowledges.
#[derive(Clone, Default)]
pub struct FakeConnector {
    events: Arc<Mutex<Vec<TransportEvent>>>,
    reply: Option<String>,
    refuse: bool,
}

impl FakeConnector {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: Some(reply.to_string()),
            ..Self::default()
        }
    }

    pub fn silent() -> Self {
        Self::default()
    }

    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<TransportEvent> {
        lock(&self.events).clone()
    }
}

#[async_trait]
impl InterruptConnector for FakeConnector {
    async fn connect(&self, url: &str, _timeout: Duration) -> Result<Box<dyn InterruptChannel>> {
        lock(&self.events).push(TransportEvent::Connect(url.to_string()));
        if self.refuse {
            return Err(HypervisorError::Transport("connection refused".to_string()));
        }
        Ok(Box::new(FakeChannel {
            events: self.events.clone(),
            reply: self.reply.clone(),
        }))
    }
}

struct FakeChannel {
    events: Arc<Mutex<Vec<TransportEvent>>>,
    reply: Option<String>,
}

#[async_trait]
impl InterruptChannel for FakeChannel {
    async fn send(&mut self, payload: String) -> Result<()> {
        lock(&self.events).push(TransportEvent::Send(payload));
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<String>> {
        lock(&self.events).push(TransportEvent::Receive);
        match self.reply.take() {
            Some(reply) => Ok(Some(reply)),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        lock(&self.events).push(TransportEvent::Close);
        Ok(())
    }
}

// ============================================================================
// Client notifications
// ============================================================================

#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<(DataIsolation, ClientNotice)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<ClientNotice> {
        lock(&self.notices).iter().map(|(_, n)| n.clone()).collect()
    }
}

#[async_trait]
impl ClientNotifier for RecordingNotifier {
    async fn notify(&self, isolation: &DataIsolation, notice: ClientNotice) {
        lock(&self.notices).push((isolation.clone(), notice));
    }
}
