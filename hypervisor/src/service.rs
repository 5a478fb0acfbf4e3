//! Request-level flows: a user message starting a task, a sandbox warm-up,
//! and a user interrupt. Each call is one independent flow; nothing here is
//! shared between flows except the repository.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shared_types::{
    ChatInstruction, DataIsolation, NewTask, SandboxStatus, Task, TaskContext, TaskStatus, Topic,
};
use tracing::{debug, error, info, warn};

use crate::error::{HypervisorError, Result};
use crate::interrupt::{InterruptDispatcher, InterruptOutcome};
use crate::lifecycle::TaskLifecycleManager;
use crate::notifier::{ClientNotice, ClientNotifier};
use crate::orchestrator::{DispatchMode, SandboxOrchestrator};
use crate::reconciler::StatusReconciler;

/// Shown to the user when starting a task fails; the cause stays in the
/// task's stored error message.
pub const TASK_INIT_FAILED_MESSAGE: &str = "Initialize task failed, please try again later";
/// Logged reason for a user-initiated stop.
pub const USER_INTERRUPT_REASON: &str = "User manually terminated task";
const DEFAULT_CLIENT_INTERRUPT_REASON: &str = "Agent stopped";

/// An inbound chat message for a topic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserMessage {
    pub prompt: String,
    pub attachments: Option<String>,
    pub mentions: Option<String>,
    /// Empty falls back to the topic's task mode.
    pub task_mode: String,
    /// Agent mode used when the topic has none of its own.
    pub topic_mode: String,
    pub chat_conversation_id: String,
    pub chat_topic_id: String,
    pub agent_user_id: String,
    pub mcp_config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterruptRequest {
    /// Reason shown to the client when the sandbox is already gone.
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReceipt {
    pub task_id: String,
    pub sandbox_id: String,
    pub remote_task_id: Option<String>,
    /// The task was stopped before it started running.
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptReport {
    pub task_id: String,
    pub sandbox_id: String,
    /// True when the agent acknowledged; false when the client was notified
    /// directly because the sandbox was not running.
    pub delivered: bool,
}

pub struct TopicTaskService {
    lifecycle: Arc<TaskLifecycleManager>,
    orchestrator: Arc<SandboxOrchestrator>,
    reconciler: Arc<StatusReconciler>,
    interrupts: Arc<InterruptDispatcher>,
    notifier: Arc<dyn ClientNotifier>,
    max_running_topics_per_user: Option<usize>,
}

impl TopicTaskService {
    pub fn new(
        lifecycle: Arc<TaskLifecycleManager>,
        orchestrator: Arc<SandboxOrchestrator>,
        reconciler: Arc<StatusReconciler>,
        interrupts: Arc<InterruptDispatcher>,
        notifier: Arc<dyn ClientNotifier>,
    ) -> Self {
        Self {
            lifecycle,
            orchestrator,
            reconciler,
            interrupts,
            notifier,
            max_running_topics_per_user: None,
        }
    }

    pub fn with_running_limit(mut self, limit: Option<usize>) -> Self {
        self.max_running_topics_per_user = limit;
        self
    }

    pub fn lifecycle(&self) -> &Arc<TaskLifecycleManager> {
        &self.lifecycle
    }

    pub fn reconciler(&self) -> &Arc<StatusReconciler> {
        &self.reconciler
    }

    /// Start a task for the message and hand it to a ready sandbox.
    pub async fn handle_chat_message(
        &self,
        isolation: &DataIsolation,
        topic_id: &str,
        message: UserMessage,
    ) -> Result<DispatchReceipt> {
        self.start_task(isolation, topic_id, message, DispatchMode::CreateAndDispatch)
            .await
    }

    /// Like [`handle_chat_message`](Self::handle_chat_message) but stops once
    /// the workspace is ready; the prompt is not sent.
    pub async fn init_sandbox(
        &self,
        isolation: &DataIsolation,
        topic_id: &str,
        message: UserMessage,
    ) -> Result<DispatchReceipt> {
        self.start_task(isolation, topic_id, message, DispatchMode::CreateOnly)
            .await
    }

    async fn start_task(
        &self,
        isolation: &DataIsolation,
        topic_id: &str,
        message: UserMessage,
        mode: DispatchMode,
    ) -> Result<DispatchReceipt> {
        let mut topic = self.owned_topic(isolation, topic_id).await?;

        let running = self.reconciler.reconcile_user_topics(isolation).await?;
        if let Some(limit) = self.max_running_topics_per_user {
            if running >= limit {
                warn!(user_id = %isolation.user_id, running, limit, "running topic limit reached");
                return Err(HypervisorError::ConcurrencyLimit {
                    user_id: isolation.user_id.clone(),
                    running,
                    limit,
                });
            }
        }
        let round = self.lifecycle.count_tasks_by_topic(&topic.id).await?;
        debug!(topic_id = %topic.id, round, running, "admitting new task");

        let task_mode = if message.task_mode.is_empty() {
            topic.task_mode.clone()
        } else {
            message.task_mode.clone()
        };
        let new_task = NewTask {
            topic_id: topic.id.clone(),
            project_id: topic.project_id.clone(),
            workspace_id: topic.workspace_id.clone(),
            user_id: isolation.user_id.clone(),
            sandbox_id: topic.sandbox_id.clone(),
            prompt: message.prompt.clone(),
            attachments: message.attachments.clone(),
            mentions: message.mentions.clone(),
            task_mode,
            work_dir: topic.work_dir.clone(),
        };
        let task = self
            .lifecycle
            .init_topic_task(isolation, &mut topic, new_task)
            .await?;
        let task_id = task.id.clone();

        match self.dispatch(isolation, &topic, task, message, mode).await {
            Ok(receipt) => Ok(receipt),
            Err(cause) => {
                if let Some(receipt) = self.stopped_meanwhile(&task_id, &cause).await {
                    return Ok(receipt);
                }
                self.fail_task(isolation, &topic.id, &task_id, &cause).await;
                Err(HypervisorError::TaskInitFailed)
            }
        }
    }

    /// A dispatch that fails because the task was suspended while it ran
    /// (user interrupt or sandbox sync) is a cancel, not a failure.
    async fn stopped_meanwhile(
        &self,
        task_id: &str,
        cause: &HypervisorError,
    ) -> Option<DispatchReceipt> {
        let task = match self.lifecycle.get_task_by_id(task_id).await {
            Ok(Some(task)) if task.status == TaskStatus::Suspended => task,
            Ok(_) => return None,
            Err(e) => {
                warn!(task_id, error = %e, "could not re-read task after failed dispatch");
                return None;
            }
        };
        info!(task_id, error = %cause, "task was stopped during dispatch");
        Some(DispatchReceipt {
            task_id: task.id,
            sandbox_id: task.sandbox_id,
            remote_task_id: None,
            cancelled: true,
        })
    }

    async fn dispatch(
        &self,
        isolation: &DataIsolation,
        topic: &Topic,
        task: Task,
        message: UserMessage,
        mode: DispatchMode,
    ) -> Result<DispatchReceipt> {
        let agent_mode = if topic.topic_mode.is_empty() {
            message.topic_mode
        } else {
            topic.topic_mode.clone()
        };
        let mut ctx = TaskContext {
            task,
            isolation: isolation.clone(),
            chat_conversation_id: message.chat_conversation_id,
            chat_topic_id: message.chat_topic_id,
            agent_user_id: message.agent_user_id,
            sandbox_id: topic.sandbox_id.clone(),
            instruction: ChatInstruction::FollowUp,
            agent_mode,
            mcp_config: message.mcp_config,
        };

        let outcome = self
            .orchestrator
            .create_and_dispatch(isolation, &mut ctx, mode, self.lifecycle.as_ref())
            .await?;
        if outcome.cancelled {
            return Ok(DispatchReceipt {
                task_id: ctx.task.id,
                sandbox_id: outcome.sandbox_id,
                remote_task_id: None,
                cancelled: true,
            });
        }
        if let Some(remote_task_id) = &outcome.remote_task_id {
            self.lifecycle
                .bind_remote_task_id(ctx.task_id(), remote_task_id)
                .await?;
        }
        self.lifecycle
            .update_task_status(
                isolation,
                &topic.id,
                TaskStatus::Running,
                ctx.task_id(),
                &outcome.sandbox_id,
                None,
            )
            .await?;

        Ok(DispatchReceipt {
            task_id: ctx.task.id,
            sandbox_id: outcome.sandbox_id,
            remote_task_id: outcome.remote_task_id,
            cancelled: false,
        })
    }

    async fn fail_task(
        &self,
        isolation: &DataIsolation,
        topic_id: &str,
        task_id: &str,
        cause: &HypervisorError,
    ) {
        error!(
            user_id = %isolation.user_id,
            topic_id,
            task_id,
            code = cause.sandbox_code(),
            error = %cause,
            "failed to start task"
        );
        let cause = cause.to_string();
        if let Err(e) = self
            .lifecycle
            .update_task_status(isolation, topic_id, TaskStatus::Error, task_id, "", Some(&cause))
            .await
        {
            error!(topic_id, task_id, error = %e, "failed to record task error");
        }
        self.notifier
            .notify(
                isolation,
                ClientNotice::TaskFailed {
                    topic_id: topic_id.to_string(),
                    task_id: task_id.to_string(),
                    message: TASK_INIT_FAILED_MESSAGE.to_string(),
                },
            )
            .await;
    }

    /// Suspend the topic's current task and tell the agent to stop, or tell
    /// the client directly when the sandbox is already gone.
    pub async fn handle_interrupt(
        &self,
        isolation: &DataIsolation,
        topic_id: &str,
        request: InterruptRequest,
    ) -> Result<InterruptReport> {
        let topic = self.owned_topic(isolation, topic_id).await?;
        let task_id = topic
            .current_task_id
            .clone()
            .ok_or_else(|| HypervisorError::not_found("task", format!("current task of topic {topic_id}")))?;
        let task = self
            .lifecycle
            .get_task_by_id(&task_id)
            .await?
            .ok_or_else(|| HypervisorError::not_found("task", &task_id))?;

        if task.status.can_transition_to(TaskStatus::Suspended) {
            info!(task_id = %task.id, reason = USER_INTERRUPT_REASON, "suspending task");
            self.lifecycle
                .update_task_status(
                    isolation,
                    &topic.id,
                    TaskStatus::Suspended,
                    &task.id,
                    "",
                    None,
                )
                .await?;
        } else {
            debug!(task_id = %task.id, status = %task.status, "task already finished, not suspending");
        }

        let sandbox_id = if topic.sandbox_id.is_empty() {
            task.sandbox_id.clone()
        } else {
            topic.sandbox_id.clone()
        };
        let outcome = if sandbox_id.is_empty() {
            InterruptOutcome::SandboxNotRunning {
                status: SandboxStatus::NotFound,
            }
        } else {
            self.interrupts
                .deliver(isolation, &sandbox_id, &task.id)
                .await?
        };

        let delivered = match outcome {
            InterruptOutcome::Acknowledged { .. } => true,
            InterruptOutcome::SandboxNotRunning { .. } => {
                let reason = request
                    .reason
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_CLIENT_INTERRUPT_REASON.to_string());
                self.notifier
                    .notify(
                        isolation,
                        ClientNotice::TaskInterrupted {
                            topic_id: topic.id.clone(),
                            task_id: task.id.clone(),
                            reason,
                        },
                    )
                    .await;
                false
            }
        };

        info!(
            user_id = %isolation.user_id,
            topic_id = %topic.id,
            task_id = %task.id,
            sandbox_id = %sandbox_id,
            delivered,
            "interrupt handled"
        );
        Ok(InterruptReport {
            task_id: task.id,
            sandbox_id,
            delivered,
        })
    }

    /// Topics belonging to another user are reported as missing.
    async fn owned_topic(&self, isolation: &DataIsolation, topic_id: &str) -> Result<Topic> {
        let topic = self.lifecycle.get_topic(topic_id).await?;
        if topic.user_id != isolation.user_id {
            return Err(HypervisorError::not_found("topic", topic_id));
        }
        Ok(topic)
    }
}
