//! Sandbox orchestration: create or reuse a sandbox, wait for its workspace,
//! and forward chat/interrupt commands to the agent inside it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shared_types::{DataIsolation, TaskContext};
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, error, info};

use crate::config::ReadinessPolicy;
use crate::error::{
    HypervisorError, Result, CODE_READINESS_CHECK_ERROR, CODE_READINESS_INIT_FAILED,
    CODE_READINESS_TIMEOUT,
};
use crate::gateway::{
    AgentInitPayload, AgentResponse, ChatMessagePayload, InterruptPayload, SandboxGateway,
};

const OP_WAIT_READY: &str = "Wait for workspace ready";

/// Which variant of the composite create operation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// create → initialize → wait ready → send the chat message
    CreateAndDispatch,
    /// create → initialize → wait ready; the caller dispatches later
    CreateOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub sandbox_id: String,
    /// Task id the agent reported when it accepted the message, if any.
    pub remote_task_id: Option<String>,
    /// The task was stopped while the workspace was coming up; nothing was
    /// sent to the agent.
    pub cancelled: bool,
}

/// Consulted once the workspace is ready, right before the prompt is sent.
#[async_trait]
pub trait DispatchGuard: Send + Sync {
    /// False once the task has been stopped and must not reach the agent.
    async fn should_dispatch(&self, task_id: &str) -> Result<bool>;
}

pub struct SandboxOrchestrator {
    gateway: Arc<dyn SandboxGateway>,
    readiness: ReadinessPolicy,
}

impl SandboxOrchestrator {
    pub fn new(gateway: Arc<dyn SandboxGateway>, readiness: ReadinessPolicy) -> Self {
        Self { gateway, readiness }
    }

    /// Create a sandbox for `project_id`, or reuse `sandbox_id` when it is
    /// non-empty. Returns the sandbox id the gateway settled on.
    pub async fn create_sandbox(&self, project_id: &str, sandbox_id: &str) -> Result<String> {
        info!(project_id, sandbox_id, "creating sandbox");

        let result = self.gateway.create_sandbox(project_id, sandbox_id).await?;
        if !result.success {
            error!(
                project_id,
                sandbox_id,
                code = result.code,
                error = %result.message,
                "failed to create sandbox"
            );
            return Err(HypervisorError::sandbox(
                "Create sandbox",
                result.message,
                result.code,
            ));
        }
        if result.sandbox_id.is_empty() {
            return Err(HypervisorError::sandbox(
                "Create sandbox",
                "gateway returned an empty sandbox id",
                result.code,
            ));
        }

        info!(
            project_id,
            input_sandbox_id = sandbox_id,
            sandbox_id = %result.sandbox_id,
            "sandbox created"
        );
        Ok(result.sandbox_id)
    }

    /// Handshake with the agent so it knows which user/topic/task it serves.
    pub async fn initialize_agent(&self, isolation: &DataIsolation, ctx: &TaskContext) -> Result<()> {
        let payload = AgentInitPayload {
            user_id: isolation.user_id.clone(),
            organization_code: isolation.organization_code.clone(),
            project_id: ctx.task.project_id.clone(),
            topic_id: ctx.task.topic_id.clone(),
            task_id: ctx.task.id.clone(),
            task_mode: ctx.task.task_mode.clone(),
            agent_mode: ctx.agent_mode.clone(),
            work_dir: ctx.task.work_dir.clone(),
            chat_conversation_id: ctx.chat_conversation_id.clone(),
            chat_topic_id: ctx.chat_topic_id.clone(),
            agent_user_id: ctx.agent_user_id.clone(),
            mcp_config: ctx.mcp_config.clone(),
        };
        self.gateway
            .initialize_agent(&ctx.sandbox_id, &payload)
            .await?
            .into_result("Initialize agent")?;
        info!(sandbox_id = %ctx.sandbox_id, task_id = %ctx.task.id, "agent initialized");
        Ok(())
    }

    /// Poll with the configured policy.
    pub async fn wait_for_workspace_ready(&self, sandbox_id: &str) -> Result<()> {
        self.wait_for_workspace_ready_with(sandbox_id, self.readiness.timeout, self.readiness.interval)
            .await
    }

    /// Poll the workspace status every `interval` until it is ready.
    ///
    /// Errors:
    /// - 3001 when the workspace reports an error status
    /// - 3002 on the first failed status check (not retried)
    /// - 3003 once `timeout` has elapsed, including while a check is in flight
    pub async fn wait_for_workspace_ready_with(
        &self,
        sandbox_id: &str,
        timeout: Duration,
        interval: Duration,
    ) -> Result<()> {
        info!(
            sandbox_id,
            timeout_secs = timeout.as_secs(),
            interval_secs = interval.as_secs(),
            "waiting for workspace to be ready"
        );

        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            let status = match timeout_at(deadline, self.gateway.get_workspace_status(sandbox_id)).await {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => {
                    error!(
                        sandbox_id,
                        error = %e,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "error while checking workspace status"
                    );
                    return Err(HypervisorError::sandbox(
                        OP_WAIT_READY,
                        format!("Error checking workspace status: {e}"),
                        CODE_READINESS_CHECK_ERROR,
                    ));
                }
                Err(_) => return Err(readiness_timeout(sandbox_id, timeout)),
            };

            debug!(
                sandbox_id,
                status = %status.description(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "workspace status check"
            );

            if status.is_ready() {
                info!(
                    sandbox_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "workspace is ready"
                );
                return Ok(());
            }

            if status.is_error() {
                error!(
                    sandbox_id,
                    status = %status.description(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "workspace initialization failed"
                );
                return Err(HypervisorError::sandbox(
                    OP_WAIT_READY,
                    format!(
                        "Workspace initialization failed with status: {}",
                        status.description()
                    ),
                    CODE_READINESS_INIT_FAILED,
                ));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(readiness_timeout(sandbox_id, timeout));
            }
            sleep(interval.min(deadline - now)).await;
        }
    }

    /// Forward the task's prompt to the agent.
    pub async fn send_chat_message(
        &self,
        isolation: &DataIsolation,
        ctx: &TaskContext,
    ) -> Result<AgentResponse> {
        let payload = ChatMessagePayload {
            message_id: ulid::Ulid::new().to_string(),
            user_id: isolation.user_id.clone(),
            task_id: ctx.task.id.clone(),
            prompt: ctx.task.prompt.clone(),
            attachments: ctx.task.attachments.clone(),
            mentions: ctx.task.mentions.clone(),
            instruction: ctx.instruction,
            agent_mode: ctx.agent_mode.clone(),
            chat_conversation_id: ctx.chat_conversation_id.clone(),
            chat_topic_id: ctx.chat_topic_id.clone(),
            mcp_config: ctx.mcp_config.clone(),
        };
        let response = self
            .gateway
            .send_chat_message(&ctx.sandbox_id, &payload)
            .await?
            .into_result("Send chat message")?;
        info!(sandbox_id = %ctx.sandbox_id, task_id = %ctx.task.id, "chat message dispatched");
        Ok(response)
    }

    pub async fn send_interrupt_message(
        &self,
        isolation: &DataIsolation,
        sandbox_id: &str,
        task_id: &str,
        reason: &str,
    ) -> Result<AgentResponse> {
        let payload = InterruptPayload {
            message_id: ulid::Ulid::new().to_string(),
            user_id: isolation.user_id.clone(),
            task_id: task_id.to_string(),
            reason: reason.to_string(),
        };
        let response = self
            .gateway
            .send_interrupt_message(sandbox_id, &payload)
            .await?
            .into_result("Send interrupt message")?;
        info!(sandbox_id, task_id, "interrupt message dispatched");
        Ok(response)
    }

    /// createSandbox → initializeAgent → waitForWorkspaceReady → (sendChatMessage),
    /// strictly in order. Any failure aborts; the sandbox is left for the
    /// reconciler rather than torn down here. The chat message is skipped
    /// when `guard` reports the task was stopped during the wait.
    pub async fn create_and_dispatch(
        &self,
        isolation: &DataIsolation,
        ctx: &mut TaskContext,
        mode: DispatchMode,
        guard: &dyn DispatchGuard,
    ) -> Result<DispatchOutcome> {
        let sandbox_id = self
            .create_sandbox(&ctx.task.project_id, &ctx.sandbox_id)
            .await?;
        ctx.set_sandbox_id(sandbox_id.clone());

        self.initialize_agent(isolation, ctx).await?;
        self.wait_for_workspace_ready(&sandbox_id).await?;

        if mode == DispatchMode::CreateOnly {
            return Ok(DispatchOutcome {
                sandbox_id,
                remote_task_id: None,
                cancelled: false,
            });
        }
        if !guard.should_dispatch(&ctx.task.id).await? {
            info!(sandbox_id = %sandbox_id, task_id = %ctx.task.id, "task stopped before dispatch");
            return Ok(DispatchOutcome {
                sandbox_id,
                remote_task_id: None,
                cancelled: true,
            });
        }

        let remote_task_id = self
            .send_chat_message(isolation, ctx)
            .await?
            .data_str("task_id")
            .map(str::to_string);
        Ok(DispatchOutcome {
            sandbox_id,
            remote_task_id,
            cancelled: false,
        })
    }
}

fn readiness_timeout(sandbox_id: &str, timeout: Duration) -> HypervisorError {
    error!(sandbox_id, timeout_secs = timeout.as_secs(), "workspace ready timeout");
    HypervisorError::sandbox(
        OP_WAIT_READY,
        format!("Workspace ready timeout after {} seconds", timeout.as_secs()),
        CODE_READINESS_TIMEOUT,
    )
}
