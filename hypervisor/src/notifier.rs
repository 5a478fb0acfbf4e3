use async_trait::async_trait;
use shared_types::DataIsolation;
use tracing::info;

/// Message pushed to the user's client outside the request/response cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientNotice {
    TaskFailed {
        topic_id: String,
        task_id: String,
        message: String,
    },
    TaskInterrupted {
        topic_id: String,
        task_id: String,
        reason: String,
    },
}

/// Delivery to the chat client. Formatting and transport belong to the caller.
#[async_trait]
pub trait ClientNotifier: Send + Sync {
    async fn notify(&self, isolation: &DataIsolation, notice: ClientNotice);
}

/// Emits notices as tracing events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl ClientNotifier for LogNotifier {
    async fn notify(&self, isolation: &DataIsolation, notice: ClientNotice) {
        match notice {
            ClientNotice::TaskFailed {
                topic_id,
                task_id,
                message,
            } => info!(
                user_id = %isolation.user_id,
                topic_id = %topic_id,
                task_id = %task_id,
                detail = %message,
                "client notice: task failed"
            ),
            ClientNotice::TaskInterrupted {
                topic_id,
                task_id,
                reason,
            } => info!(
                user_id = %isolation.user_id,
                topic_id = %topic_id,
                task_id = %task_id,
                reason = %reason,
                "client notice: task interrupted"
            ),
        }
    }
}
